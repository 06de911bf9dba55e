//! Authenticated encryption of whole (possibly compounded) SMB3 messages

use crate::connection::negotiated::NegotiatedProtocol;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::EncryptionCipher;
use crate::protocol::Smb2TransformHeader;
use aead::consts::{U11, U16};
use aead::{AeadInPlace, KeyInit, Nonce, Tag};
use aes::{Aes128, Aes256};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use ccm::Ccm;
use rand::RngCore;
use std::sync::RwLock;
use tracing::debug;

type Aes128Ccm = Ccm<Aes128, U16, U11>;
type Aes256Ccm = Ccm<Aes256, U16, U11>;

fn seal<C: KeyInit + AeadInPlace>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; 16]> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| Error::CryptoError(format!("Invalid encryption key length {}", key.len())))?;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<C>::from_slice(nonce), aad, buf)
        .map_err(|_| Error::CryptoError("Encryption failed".to_string()))?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn open<C: KeyInit + AeadInPlace>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; 16],
) -> Result<()> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| Error::CryptoError(format!("Invalid decryption key length {}", key.len())))?;
    cipher
        .decrypt_in_place_detached(Nonce::<C>::from_slice(nonce), aad, buf, Tag::<C>::from_slice(tag))
        .map_err(|_| Error::DecryptionFailed("authentication tag mismatch".to_string()))
}

/// Wraps plaintext SMB2 messages in transform records and unwraps them again.
///
/// The cipher is fixed once per connection by [`PacketEncryptor::init`].
#[derive(Debug)]
pub struct PacketEncryptor {
    cipher: RwLock<EncryptionCipher>,
}

impl Default for PacketEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketEncryptor {
    pub fn new() -> Self {
        Self {
            cipher: RwLock::new(EncryptionCipher::Aes128Ccm),
        }
    }

    /// Select the cipher negotiated for this connection.
    ///
    /// Dialects before 3.1.1 have no cipher negotiation and always use AES-128-CCM.
    pub fn init(&self, negotiated: &NegotiatedProtocol) -> Result<()> {
        let cipher = negotiated.cipher.unwrap_or(EncryptionCipher::Aes128Ccm);
        let mut guard = self
            .cipher
            .write()
            .map_err(|_| Error::InvalidState("encryptor lock poisoned".to_string()))?;
        *guard = cipher;
        debug!("Encryption cipher for {:?}: {:?}", negotiated.dialect, cipher);
        Ok(())
    }

    pub fn cipher(&self) -> Result<EncryptionCipher> {
        self.cipher
            .read()
            .map(|c| *c)
            .map_err(|_| Error::InvalidState("encryptor lock poisoned".to_string()))
    }

    /// Encrypt with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8], session_id: u64, key: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce[..cipher.nonce_len()]);
        self.encrypt_with_nonce(plaintext, session_id, key, nonce)
    }

    /// Encrypt with a caller-chosen nonce; bytes past the cipher's nonce length are zeroed.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        session_id: u64,
        key: &[u8],
        mut nonce: [u8; 16],
    ) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce_len = cipher.nonce_len();
        nonce[nonce_len..].fill(0);

        let mut header = Smb2TransformHeader::new(session_id, nonce, plaintext.len() as u32);
        let aad = header.aad()?;

        let mut body = plaintext.to_vec();
        let nonce = &header.nonce[..nonce_len];
        header.signature = match cipher {
            EncryptionCipher::Aes128Ccm => seal::<Aes128Ccm>(key, nonce, &aad, &mut body)?,
            EncryptionCipher::Aes128Gcm => seal::<Aes128Gcm>(key, nonce, &aad, &mut body)?,
            EncryptionCipher::Aes256Ccm => seal::<Aes256Ccm>(key, nonce, &aad, &mut body)?,
            EncryptionCipher::Aes256Gcm => seal::<Aes256Gcm>(key, nonce, &aad, &mut body)?,
        };

        let mut record = header.serialize()?;
        record.extend_from_slice(&body);
        Ok(record)
    }

    /// Decrypt a transform record.
    ///
    /// A tag mismatch is [`Error::DecryptionFailed`], which the connection
    /// treats as fatal.
    pub fn decrypt(&self, record: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let header = Smb2TransformHeader::parse(record)?;
        let ciphertext = &record[Smb2TransformHeader::SIZE..];
        if header.original_message_size as usize != ciphertext.len() {
            return Err(Error::DecryptionFailed(format!(
                "transform declares {} bytes but carries {}",
                header.original_message_size,
                ciphertext.len()
            )));
        }

        let cipher = self.cipher()?;
        let aad = header.aad()?;
        let nonce = &header.nonce[..cipher.nonce_len()];
        let mut plaintext = ciphertext.to_vec();
        match cipher {
            EncryptionCipher::Aes128Ccm => {
                open::<Aes128Ccm>(key, nonce, &aad, &mut plaintext, &header.signature)?
            }
            EncryptionCipher::Aes128Gcm => {
                open::<Aes128Gcm>(key, nonce, &aad, &mut plaintext, &header.signature)?
            }
            EncryptionCipher::Aes256Ccm => {
                open::<Aes256Ccm>(key, nonce, &aad, &mut plaintext, &header.signature)?
            }
            EncryptionCipher::Aes256Gcm => {
                open::<Aes256Gcm>(key, nonce, &aad, &mut plaintext, &header.signature)?
            }
        }
        Ok(plaintext)
    }
}
