//! The negotiated-protocol record and the thin negotiator that produces it

use super::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::protocol::negotiate::{NegotiateContext, Smb2NegotiateRequest, Smb2NegotiateResponse};
use crate::protocol::smb2_constants::{
    EncryptionCipher, SecurityMode, Smb2Capabilities, Smb2Dialect,
};
use sha2::{Digest, Sha512};
use uuid::Uuid;

/// Size of the SMB 3.1.1 preauth integrity hash (SHA-512)
pub const PREAUTH_HASH_SIZE: usize = 64;

/// What the server agreed to; consumed by the signatory, encryptor and window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    pub dialect: Smb2Dialect,
    pub server_guid: Uuid,
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    /// Cipher from the 3.1.1 encryption context; `None` before 3.1.1
    pub cipher: Option<EncryptionCipher>,
    /// Preauth integrity hash after the negotiate exchange (3.1.1 only)
    pub preauth_hash: Option<Vec<u8>>,
}

impl NegotiatedProtocol {
    pub fn new(dialect: Smb2Dialect) -> Self {
        Self {
            dialect,
            server_guid: Uuid::nil(),
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Smb2Capabilities::empty(),
            max_transact_size: 65536,
            max_read_size: 65536,
            max_write_size: 65536,
            cipher: None,
            preauth_hash: None,
        }
    }

    pub fn from_response(response: &Smb2NegotiateResponse) -> Result<Self> {
        let mut negotiated = Self::new(response.dialect_revision);
        negotiated.server_guid = response.server_guid;
        negotiated.security_mode = response.security_mode;
        negotiated.capabilities = response.capabilities;
        negotiated.max_transact_size = response.max_transact_size;
        negotiated.max_read_size = response.max_read_size;
        negotiated.max_write_size = response.max_write_size;

        for context in &response.negotiate_contexts {
            if let NegotiateContext::EncryptionCapabilities { ciphers } = context {
                match ciphers.as_slice() {
                    // zero means the server supports none of the offered ciphers
                    [0] => {}
                    [cipher] => negotiated.cipher = Some(EncryptionCipher::try_from(*cipher)?),
                    _ => {
                        return Err(Error::Protocol(format!(
                            "Server selected {} ciphers, expected one",
                            ciphers.len()
                        )))
                    }
                }
            }
        }

        Ok(negotiated)
    }

    /// Multi-credit requests need SMB 2.1+ and the large MTU capability
    pub fn supports_multi_credit(&self) -> bool {
        self.dialect.has_credit_charge() && self.capabilities.contains(Smb2Capabilities::LARGE_MTU)
    }

    pub fn supports_encryption(&self) -> bool {
        if self.dialect.negotiates_cipher() {
            self.cipher.is_some()
        } else {
            self.dialect.is_smb3() && self.capabilities.contains(Smb2Capabilities::ENCRYPTION)
        }
    }

    pub fn signing_required(&self) -> bool {
        self.security_mode.contains(SecurityMode::SIGNING_REQUIRED)
    }
}

/// Build the NEGOTIATE request for `config`, adding 3.1.1 contexts when offered
pub fn build_negotiate_request(config: &ConnectionConfig) -> Smb2NegotiateRequest {
    let mut security_mode = config.security_mode;
    if config.signing_required {
        security_mode |= SecurityMode::SIGNING_REQUIRED;
    }

    let mut request = Smb2NegotiateRequest::new(config.dialects.clone());
    request.security_mode = security_mode;
    request.capabilities = config.capabilities;
    request.client_guid = config.client_guid;

    if config.dialects.contains(&Smb2Dialect::Smb311) {
        request = request.with_smb3_contexts(vec![
            NegotiateContext::sha512_preauth(),
            NegotiateContext::EncryptionCapabilities {
                ciphers: config.ciphers.iter().map(|c| c.to_u16()).collect(),
            },
        ]);
    }
    request
}

/// Fold one full message (header included) into the preauth integrity hash
pub fn update_preauth_hash(previous: &[u8], message: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(previous);
    hasher.update(message);
    hasher.finalize().to_vec()
}
