//! Per-connection table of authenticated sessions and their keys

use crate::crypto::kdf::{self, smb30, smb311};
use crate::crypto::{SigningAlgorithm, SigningKey};
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{EncryptionCipher, Smb2Dialect};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Keys and policy for one session id.
///
/// Guest and anonymous sessions carry no keys; nothing is signed for them.
#[derive(Clone, Default)]
pub struct SessionContext {
    pub session_id: u64,
    pub signing_key: Option<SigningKey>,
    /// Client-to-server AEAD key
    pub encryption_key: Option<Vec<u8>>,
    /// Server-to-client AEAD key
    pub decryption_key: Option<Vec<u8>>,
    pub signing_required: bool,
    pub encrypt_data: bool,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &format_args!("{:#x}", self.session_id))
            .field("signing_key", &self.signing_key)
            .field("encryption_key", &self.encryption_key.is_some())
            .field("decryption_key", &self.decryption_key.is_some())
            .field("signing_required", &self.signing_required)
            .field("encrypt_data", &self.encrypt_data)
            .finish()
    }
}

impl SessionContext {
    /// A session without keys
    pub fn guest(session_id: u64) -> Self {
        Self {
            session_id,
            ..Default::default()
        }
    }

    /// Derive the session's keys from the authentication session key.
    ///
    /// 2.x signs with the session key itself. 3.0 and 3.0.2 use fixed KDF
    /// contexts; 3.1.1 uses the preauth integrity hash and sizes the cipher
    /// keys for the negotiated cipher.
    pub fn derive(
        session_id: u64,
        dialect: Smb2Dialect,
        session_key: &[u8],
        preauth_hash: Option<&[u8]>,
        cipher: EncryptionCipher,
    ) -> Result<Self> {
        if session_key.is_empty() {
            return Err(Error::InvalidParameter("empty session key".to_string()));
        }
        let algorithm = SigningAlgorithm::for_dialect(dialect);

        let mut context = Self::guest(session_id);
        match dialect {
            Smb2Dialect::Smb202 | Smb2Dialect::Smb210 => {
                context.signing_key = Some(SigningKey::new(algorithm, session_key));
            }
            Smb2Dialect::Smb300 | Smb2Dialect::Smb302 => {
                let signing = kdf::derive_key(
                    session_key,
                    smb30::SIGNING_LABEL,
                    smb30::SIGNING_CONTEXT,
                    16,
                )?;
                context.signing_key = Some(SigningKey::new(algorithm, signing));
                context.encryption_key = Some(kdf::derive_key(
                    session_key,
                    smb30::CIPHER_LABEL,
                    smb30::ENCRYPTION_CONTEXT,
                    16,
                )?);
                context.decryption_key = Some(kdf::derive_key(
                    session_key,
                    smb30::CIPHER_LABEL,
                    smb30::DECRYPTION_CONTEXT,
                    16,
                )?);
            }
            Smb2Dialect::Smb311 => {
                let preauth_hash = preauth_hash.ok_or_else(|| {
                    Error::InvalidParameter("SMB 3.1.1 key derivation needs the preauth hash".into())
                })?;
                let signing = kdf::derive_key(session_key, smb311::SIGNING_LABEL, preauth_hash, 16)?;
                context.signing_key = Some(SigningKey::new(algorithm, signing));
                context.encryption_key = Some(kdf::derive_key(
                    session_key,
                    smb311::ENCRYPTION_LABEL,
                    preauth_hash,
                    cipher.key_len(),
                )?);
                context.decryption_key = Some(kdf::derive_key(
                    session_key,
                    smb311::DECRYPTION_LABEL,
                    preauth_hash,
                    cipher.key_len(),
                )?);
            }
        }
        Ok(context)
    }

    pub fn with_signing_required(mut self, required: bool) -> Self {
        self.signing_required = required;
        self
    }

    pub fn with_encrypt_data(mut self, encrypt: bool) -> Self {
        self.encrypt_data = encrypt;
        self
    }

    /// Whether outbound messages on this session go out encrypted
    pub fn should_encrypt(&self) -> bool {
        self.encrypt_data && self.encryption_key.is_some()
    }
}

/// Sessions known to a connection, keyed by session id
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<u64, Arc<SessionContext>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionContext) {
        debug!("Registering session {:#x}", session.session_id);
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session.session_id, Arc::new(session));
    }

    pub fn remove(&self, session_id: u64) -> Option<Arc<SessionContext>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&session_id)
    }

    /// Look up a session; id 0 is never a session
    pub fn get(&self, session_id: u64) -> Option<Arc<SessionContext>> {
        if session_id == 0 {
            return None;
        }
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&session_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
