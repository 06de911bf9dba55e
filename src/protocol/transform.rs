//! SMB2 transform header wrapping encrypted records

use super::smb2_constants::{SMB2_TRANSFORM_HEADER_SIZE, SMB2_TRANSFORM_MAGIC, TRANSFORM_FLAG_ENCRYPTED};
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// SMB2 Transform header for encrypted messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2TransformHeader {
    /// AEAD tag over the encrypted message and the AAD
    pub signature: [u8; 16],
    pub nonce: [u8; 16],
    pub original_message_size: u32,
    pub reserved: u16,
    /// `Flags` in 3.1.1, `EncryptionAlgorithm` in 3.0; both carry 0x0001
    pub flags: u16,
    pub session_id: u64,
}

impl Smb2TransformHeader {
    pub const SIZE: usize = SMB2_TRANSFORM_HEADER_SIZE;

    /// Offset where the authenticated-but-unencrypted fields begin
    const AAD_OFFSET: usize = 20;

    pub fn new(session_id: u64, nonce: [u8; 16], original_message_size: u32) -> Self {
        Self {
            signature: [0; 16],
            nonce,
            original_message_size,
            reserved: 0,
            flags: TRANSFORM_FLAG_ENCRYPTED,
            session_id,
        }
    }

    /// Whether a raw inbound buffer starts with the transform magic
    pub fn is_transform(buf: &[u8]) -> bool {
        buf.len() >= 4 && buf[0..4] == SMB2_TRANSFORM_MAGIC
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }

        if buf[0..4] != SMB2_TRANSFORM_MAGIC {
            return Err(Error::ParseError("Invalid transform header".to_string()));
        }

        let mut signature = [0u8; 16];
        signature.copy_from_slice(&buf[4..20]);

        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&buf[20..36]);

        let mut cursor = io::Cursor::new(&buf[36..]);
        let original_message_size = cursor.read_u32::<LittleEndian>()?;
        let reserved = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let session_id = cursor.read_u64::<LittleEndian>()?;

        Ok(Self {
            signature,
            nonce,
            original_message_size,
            reserved,
            flags,
            session_id,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&SMB2_TRANSFORM_MAGIC);
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.nonce);
        buf.write_u32::<LittleEndian>(self.original_message_size)?;
        buf.write_u16::<LittleEndian>(self.reserved)?;
        buf.write_u16::<LittleEndian>(self.flags)?;
        buf.write_u64::<LittleEndian>(self.session_id)?;
        Ok(buf)
    }

    /// Additional authenticated data: nonce through session id, in wire layout.
    pub fn aad(&self) -> Result<Vec<u8>> {
        let mut bytes = self.serialize()?;
        Ok(bytes.split_off(Self::AAD_OFFSET))
    }
}
