//! Packet signing (HMAC-SHA256 for SMB 2.x, AES-128-CMAC for SMB 3.x)

use crate::error::{Error, Result};
use crate::protocol::header::offsets::{SIGNATURE, SIGNATURE_LEN};
use crate::protocol::smb2_constants::{Smb2Dialect, Smb2HeaderFlags};
use crate::protocol::{OutboundMessage, Smb2Header};
use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

/// Integrity algorithm selected by the negotiated dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    HmacSha256,
    AesCmac,
}

impl SigningAlgorithm {
    pub fn for_dialect(dialect: Smb2Dialect) -> Self {
        if dialect.is_smb3() {
            SigningAlgorithm::AesCmac
        } else {
            SigningAlgorithm::HmacSha256
        }
    }
}

/// A per-session signing key together with the algorithm it is used with
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    algorithm: SigningAlgorithm,
    key: Vec<u8>,
}

impl SigningKey {
    pub fn new(algorithm: SigningAlgorithm, key: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm,
            key: key.into(),
        }
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Computes and checks the 16-byte header signature.
///
/// The signature always covers the exact serialized bytes with the signature
/// field zeroed, so signing is folded into serialization rather than run over
/// an abstract message.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketSignatory;

impl PacketSignatory {
    pub fn new() -> Self {
        Self
    }

    /// Serialize `message`, signing it when a key is present.
    ///
    /// Without a key the bytes are returned unsigned; guest and anonymous
    /// sessions have nothing to sign with.
    pub fn sign(&self, message: &mut OutboundMessage, key: Option<&SigningKey>) -> Result<Vec<u8>> {
        let Some(key) = key else {
            return message.to_bytes();
        };

        message.header.flags |= Smb2HeaderFlags::SIGNED;
        message.header.signature = [0; 16];
        let mut bytes = message.to_bytes()?;

        let signature = self.compute(&bytes, key)?;
        bytes[SIGNATURE..SIGNATURE + SIGNATURE_LEN].copy_from_slice(&signature);
        message.header.signature = signature;
        Ok(bytes)
    }

    /// Check the signature of one (already de-compounded) inbound message.
    ///
    /// A mismatch is reported as `Ok(false)`; only an unusable key is an error.
    pub fn verify(&self, packet: &[u8], key: &SigningKey) -> Result<bool> {
        if packet.len() < Smb2Header::SIZE {
            return Err(Error::BufferTooSmall {
                need: Smb2Header::SIZE,
                have: packet.len(),
            });
        }

        let mut received = [0u8; 16];
        received.copy_from_slice(&packet[SIGNATURE..SIGNATURE + SIGNATURE_LEN]);

        let mut zeroed = packet.to_vec();
        zeroed[SIGNATURE..SIGNATURE + SIGNATURE_LEN].fill(0);

        match key.algorithm {
            SigningAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&key.key)
                    .map_err(|e| Error::SigningError(format!("HMAC key error: {}", e)))?;
                mac.update(&zeroed);
                Ok(mac.verify_truncated_left(&received).is_ok())
            }
            SigningAlgorithm::AesCmac => {
                let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&key.key)
                    .map_err(|e| Error::SigningError(format!("CMAC key error: {}", e)))?;
                mac.update(&zeroed);
                Ok(mac.verify_truncated_left(&received).is_ok())
            }
        }
    }

    /// Signature over `bytes`, which must already have a zeroed signature field
    fn compute(&self, bytes: &[u8], key: &SigningKey) -> Result<[u8; 16]> {
        let full = match key.algorithm {
            SigningAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&key.key)
                    .map_err(|e| Error::SigningError(format!("HMAC key error: {}", e)))?;
                mac.update(bytes);
                mac.finalize().into_bytes().to_vec()
            }
            SigningAlgorithm::AesCmac => {
                let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&key.key)
                    .map_err(|e| Error::SigningError(format!("CMAC key error: {}", e)))?;
                mac.update(bytes);
                mac.finalize().into_bytes().to_vec()
            }
        };

        let mut signature = [0u8; 16];
        signature.copy_from_slice(&full[..SIGNATURE_LEN]);
        Ok(signature)
    }
}
