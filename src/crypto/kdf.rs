//! SMB3 key derivation (SP800-108 counter mode, HMAC-SHA256)

use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Labels and contexts used to derive SMB 3.0/3.0.2 keys
pub mod smb30 {
    pub const SIGNING_LABEL: &[u8] = b"SMB2AESCMAC\0";
    pub const SIGNING_CONTEXT: &[u8] = b"SmbSign\0";
    pub const CIPHER_LABEL: &[u8] = b"SMB2AESCCM\0";
    pub const ENCRYPTION_CONTEXT: &[u8] = b"ServerIn \0";
    pub const DECRYPTION_CONTEXT: &[u8] = b"ServerOut\0";
}

/// Labels used to derive SMB 3.1.1 keys; the context is the preauth integrity hash
pub mod smb311 {
    pub const SIGNING_LABEL: &[u8] = b"SMBSigningKey\0";
    pub const ENCRYPTION_LABEL: &[u8] = b"SMBC2SCipherKey\0";
    pub const DECRYPTION_LABEL: &[u8] = b"SMBS2CCipherKey\0";
}

/// Derive `len` bytes (16 or 32) from `key`.
///
/// Input to the PRF is `i || label || 0x00 || context || L`, with `i = 1`
/// and `L` the output length in bits, both big-endian.
pub fn derive_key(key: &[u8], label: &[u8], context: &[u8], len: usize) -> Result<Vec<u8>> {
    if len == 0 || len > 32 {
        return Err(Error::InvalidParameter(format!(
            "KDF output length {} not in 1..=32",
            len
        )));
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))?;
    mac.update(&1u32.to_be_bytes());
    mac.update(label);
    mac.update(&[0]);
    mac.update(context);
    mac.update(&((len as u32) * 8).to_be_bytes());

    let mut out = mac.finalize().into_bytes().to_vec();
    out.truncate(len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic_and_sized() {
        let session_key = [0x11u8; 16];
        let a = derive_key(&session_key, smb30::SIGNING_LABEL, smb30::SIGNING_CONTEXT, 16).unwrap();
        let b = derive_key(&session_key, smb30::SIGNING_LABEL, smb30::SIGNING_CONTEXT, 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let wide = derive_key(&session_key, smb311::ENCRYPTION_LABEL, &[0u8; 64], 32).unwrap();
        assert_eq!(wide.len(), 32);
    }

    #[test]
    fn test_direction_keys_differ() {
        let session_key = [0x22u8; 16];
        let c2s = derive_key(
            &session_key,
            smb30::CIPHER_LABEL,
            smb30::ENCRYPTION_CONTEXT,
            16,
        )
        .unwrap();
        let s2c = derive_key(
            &session_key,
            smb30::CIPHER_LABEL,
            smb30::DECRYPTION_CONTEXT,
            16,
        )
        .unwrap();
        assert_ne!(c2s, s2c);
    }

    #[test]
    fn test_output_length_encoded_in_input() {
        let session_key = [0x33u8; 16];
        let short = derive_key(&session_key, smb311::SIGNING_LABEL, b"ctx", 16).unwrap();
        let long = derive_key(&session_key, smb311::SIGNING_LABEL, b"ctx", 32).unwrap();
        assert_ne!(&long[..16], short.as_slice());
    }

    #[test]
    fn test_rejects_oversized_output() {
        assert!(derive_key(&[0u8; 16], b"x", b"y", 33).is_err());
    }
}
