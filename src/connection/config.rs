//! Connection configuration

use crate::protocol::smb2_constants::{EncryptionCipher, SecurityMode, Smb2Capabilities, Smb2Dialect};
use std::time::Duration;
use uuid::Uuid;

/// Credit target the client asks the server to keep it topped up to
pub const PREFERRED_MINIMUM_CREDITS: u16 = 512;

/// SMB connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Client GUID
    pub client_guid: Uuid,
    /// Dialects offered during negotiation
    pub dialects: Vec<Smb2Dialect>,
    /// Security mode
    pub security_mode: SecurityMode,
    /// Capabilities
    pub capabilities: Smb2Capabilities,
    /// Ciphers offered in the SMB 3.1.1 encryption context, in preference order
    pub ciphers: Vec<EncryptionCipher>,
    /// How long a sender may wait for credits before giving up
    pub credit_timeout: Duration,
    /// How long `send_and_receive` waits for the final reply
    pub response_timeout: Duration,
    /// When false the sequence window never blocks on credits
    pub enforce_credits: bool,
    /// Require signatures on every reply of every signed session
    pub signing_required: bool,
    /// Encrypt outbound traffic on sessions that have encryption keys
    pub encrypt_data: bool,
    /// Credit target stamped into outgoing credit requests
    pub preferred_credits: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_guid: Uuid::new_v4(),
            dialects: vec![
                Smb2Dialect::Smb202,
                Smb2Dialect::Smb210,
                Smb2Dialect::Smb300,
                Smb2Dialect::Smb302,
                Smb2Dialect::Smb311,
            ],
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Smb2Capabilities::DFS
                | Smb2Capabilities::LARGE_MTU
                | Smb2Capabilities::ENCRYPTION,
            ciphers: vec![EncryptionCipher::Aes128Gcm, EncryptionCipher::Aes128Ccm],
            credit_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
            enforce_credits: true,
            signing_required: false,
            encrypt_data: false,
            preferred_credits: PREFERRED_MINIMUM_CREDITS,
        }
    }
}
