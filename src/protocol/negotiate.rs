//! SMB2 Negotiate messages

use super::header::Smb2Header;
use super::message::SmbMessage;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{
    hash_algorithm, negotiate_context_type, structure_size, SecurityMode, Smb2Capabilities,
    Smb2Dialect,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryFrom;
use std::io::{self, Read, Write};
use uuid::Uuid;

fn pad_to_8(buf: &mut Vec<u8>, base: usize) {
    while (base + buf.len()) % 8 != 0 {
        buf.push(0);
    }
}

/// SMB2 Negotiate Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateRequest {
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub client_guid: Uuid,
    pub dialects: Vec<Smb2Dialect>,
    pub negotiate_contexts: Vec<NegotiateContext>,
}

impl Smb2NegotiateRequest {
    pub fn new(dialects: Vec<Smb2Dialect>) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Smb2Capabilities::DFS,
            client_guid: Uuid::new_v4(),
            dialects,
            negotiate_contexts: Vec::new(),
        }
    }

    pub fn with_smb3_contexts(mut self, contexts: Vec<NegotiateContext>) -> Self {
        self.negotiate_contexts = contexts;
        self
    }

    fn offers_smb311(&self) -> bool {
        self.dialects.contains(&Smb2Dialect::Smb311)
    }
}

impl SmbMessage for Smb2NegotiateRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(Error::ParseError("Negotiate request too short".into()));
        }

        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::NEGOTIATE_REQUEST {
            return Err(Error::ParseError(format!(
                "Invalid negotiate request structure size: {}",
                size
            )));
        }

        let dialect_count = cursor.read_u16::<LittleEndian>()?;
        let security_mode = SecurityMode::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let capabilities = Smb2Capabilities::from_bits_truncate(cursor.read_u32::<LittleEndian>()?);

        let mut guid_bytes = [0u8; 16];
        cursor.read_exact(&mut guid_bytes)?;
        let client_guid = Uuid::from_bytes(guid_bytes);

        let context_offset = cursor.read_u32::<LittleEndian>()? as usize;
        let context_count = cursor.read_u16::<LittleEndian>()? as usize;
        let _reserved2 = cursor.read_u16::<LittleEndian>()?;

        let mut dialects = Vec::with_capacity(dialect_count as usize);
        for _ in 0..dialect_count {
            dialects.push(Smb2Dialect::try_from(cursor.read_u16::<LittleEndian>()?)?);
        }

        let negotiate_contexts = if dialects.contains(&Smb2Dialect::Smb311) && context_count > 0 {
            NegotiateContext::parse_list(buf, context_offset, context_count)?
        } else {
            Vec::new()
        };

        Ok(Self {
            security_mode,
            capabilities,
            client_guid,
            dialects,
            negotiate_contexts,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size());
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_REQUEST)?;
        buf.write_u16::<LittleEndian>(self.dialects.len() as u16)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_all(self.client_guid.as_bytes())?;

        let with_contexts = self.offers_smb311() && !self.negotiate_contexts.is_empty();
        // NegotiateContextOffset is patched once the dialect list is written
        let offset_pos = buf.len();
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(if with_contexts {
            self.negotiate_contexts.len() as u16
        } else {
            0
        })?;
        buf.write_u16::<LittleEndian>(0)?;

        for dialect in &self.dialects {
            buf.write_u16::<LittleEndian>(dialect.to_u16())?;
        }

        if with_contexts {
            pad_to_8(&mut buf, Smb2Header::SIZE);
            let offset = (Smb2Header::SIZE + buf.len()) as u32;
            buf[offset_pos..offset_pos + 4].copy_from_slice(&offset.to_le_bytes());
            NegotiateContext::write_list(&self.negotiate_contexts, &mut buf)?;
        }

        Ok(buf)
    }

    fn size(&self) -> usize {
        36 + self.dialects.len() * 2
            + self
                .negotiate_contexts
                .iter()
                .map(|c| c.size() + 8)
                .sum::<usize>()
    }
}

/// SMB2 Negotiate Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateResponse {
    pub security_mode: SecurityMode,
    pub dialect_revision: Smb2Dialect,
    pub server_guid: Uuid,
    pub capabilities: Smb2Capabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: u64,
    pub server_start_time: u64,
    pub security_blob: Vec<u8>,
    pub negotiate_contexts: Vec<NegotiateContext>,
}

impl Smb2NegotiateResponse {
    pub fn new(dialect: Smb2Dialect) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            dialect_revision: dialect,
            server_guid: Uuid::new_v4(),
            capabilities: Smb2Capabilities::DFS,
            max_transact_size: 1048576,
            max_read_size: 1048576,
            max_write_size: 1048576,
            system_time: 0,
            server_start_time: 0,
            security_blob: Vec::new(),
            negotiate_contexts: Vec::new(),
        }
    }
}

impl SmbMessage for Smb2NegotiateResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 {
            return Err(Error::ParseError("Negotiate response too short".into()));
        }

        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::NEGOTIATE_RESPONSE {
            return Err(Error::ParseError(format!(
                "Invalid negotiate response structure size: {}",
                size
            )));
        }

        let security_mode = SecurityMode::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        let dialect_revision = Smb2Dialect::try_from(cursor.read_u16::<LittleEndian>()?)?;
        let context_count = cursor.read_u16::<LittleEndian>()? as usize;

        let mut guid_bytes = [0u8; 16];
        cursor.read_exact(&mut guid_bytes)?;
        let server_guid = Uuid::from_bytes(guid_bytes);

        let capabilities = Smb2Capabilities::from_bits_truncate(cursor.read_u32::<LittleEndian>()?);
        let max_transact_size = cursor.read_u32::<LittleEndian>()?;
        let max_read_size = cursor.read_u32::<LittleEndian>()?;
        let max_write_size = cursor.read_u32::<LittleEndian>()?;
        let system_time = cursor.read_u64::<LittleEndian>()?;
        let server_start_time = cursor.read_u64::<LittleEndian>()?;
        let security_buffer_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let security_buffer_length = cursor.read_u16::<LittleEndian>()? as usize;
        let context_offset = cursor.read_u32::<LittleEndian>()? as usize;

        let security_blob = if security_buffer_length > 0 {
            let start = security_buffer_offset
                .checked_sub(Smb2Header::SIZE)
                .ok_or_else(|| Error::ParseError("Invalid security buffer offset".into()))?;
            let end = start + security_buffer_length;
            if end > buf.len() {
                return Err(Error::ParseError(
                    "Security buffer extends beyond message".into(),
                ));
            }
            buf[start..end].to_vec()
        } else {
            Vec::new()
        };

        let negotiate_contexts = if dialect_revision == Smb2Dialect::Smb311 && context_count > 0 {
            NegotiateContext::parse_list(buf, context_offset, context_count)?
        } else {
            Vec::new()
        };

        Ok(Self {
            security_mode,
            dialect_revision,
            server_guid,
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_blob,
            negotiate_contexts,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size());
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_RESPONSE)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(self.dialect_revision.to_u16())?;
        buf.write_u16::<LittleEndian>(self.negotiate_contexts.len() as u16)?;
        buf.write_all(self.server_guid.as_bytes())?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_u32::<LittleEndian>(self.max_transact_size)?;
        buf.write_u32::<LittleEndian>(self.max_read_size)?;
        buf.write_u32::<LittleEndian>(self.max_write_size)?;
        buf.write_u64::<LittleEndian>(self.system_time)?;
        buf.write_u64::<LittleEndian>(self.server_start_time)?;

        let security_buffer_offset = if self.security_blob.is_empty() {
            0
        } else {
            (Smb2Header::SIZE + 64) as u16
        };
        buf.write_u16::<LittleEndian>(security_buffer_offset)?;
        buf.write_u16::<LittleEndian>(self.security_blob.len() as u16)?;
        let offset_pos = buf.len();
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&self.security_blob)?;

        if !self.negotiate_contexts.is_empty() {
            pad_to_8(&mut buf, Smb2Header::SIZE);
            let offset = (Smb2Header::SIZE + buf.len()) as u32;
            buf[offset_pos..offset_pos + 4].copy_from_slice(&offset.to_le_bytes());
            NegotiateContext::write_list(&self.negotiate_contexts, &mut buf)?;
        }

        Ok(buf)
    }

    fn size(&self) -> usize {
        64 + self.security_blob.len()
            + self
                .negotiate_contexts
                .iter()
                .map(|c| c.size() + 8)
                .sum::<usize>()
    }
}

/// SMB 3.1.1 Negotiate Context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateContext {
    PreauthIntegrityCapabilities {
        hash_algorithms: Vec<u16>,
        salt: Vec<u8>,
    },
    EncryptionCapabilities {
        ciphers: Vec<u16>,
    },
    /// Any context type this crate does not interpret
    Other { context_type: u16, data: Vec<u8> },
}

impl NegotiateContext {
    /// Preauth integrity context offering SHA-512 with a random 32-byte salt
    pub fn sha512_preauth() -> Self {
        Self::PreauthIntegrityCapabilities {
            hash_algorithms: vec![hash_algorithm::SHA_512],
            salt: (0..32).map(|_| rand::random::<u8>()).collect(),
        }
    }

    fn context_type(&self) -> u16 {
        match self {
            Self::PreauthIntegrityCapabilities { .. } => {
                negotiate_context_type::PREAUTH_INTEGRITY_CAPABILITIES
            }
            Self::EncryptionCapabilities { .. } => negotiate_context_type::ENCRYPTION_CAPABILITIES,
            Self::Other { context_type, .. } => *context_type,
        }
    }

    /// Size of the context data, excluding the 8-byte context header
    fn size(&self) -> usize {
        match self {
            Self::PreauthIntegrityCapabilities {
                hash_algorithms,
                salt,
            } => 4 + hash_algorithms.len() * 2 + salt.len(),
            Self::EncryptionCapabilities { ciphers } => 2 + ciphers.len() * 2,
            Self::Other { data, .. } => data.len(),
        }
    }

    fn write_data(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::PreauthIntegrityCapabilities {
                hash_algorithms,
                salt,
            } => {
                buf.write_u16::<LittleEndian>(hash_algorithms.len() as u16)?;
                buf.write_u16::<LittleEndian>(salt.len() as u16)?;
                for algorithm in hash_algorithms {
                    buf.write_u16::<LittleEndian>(*algorithm)?;
                }
                buf.write_all(salt)?;
            }
            Self::EncryptionCapabilities { ciphers } => {
                buf.write_u16::<LittleEndian>(ciphers.len() as u16)?;
                for cipher in ciphers {
                    buf.write_u16::<LittleEndian>(*cipher)?;
                }
            }
            Self::Other { data, .. } => buf.write_all(data)?,
        }
        Ok(())
    }

    fn write_list(contexts: &[NegotiateContext], buf: &mut Vec<u8>) -> Result<()> {
        for (i, context) in contexts.iter().enumerate() {
            if i > 0 {
                pad_to_8(buf, Smb2Header::SIZE);
            }
            buf.write_u16::<LittleEndian>(context.context_type())?;
            buf.write_u16::<LittleEndian>(context.size() as u16)?;
            buf.write_u32::<LittleEndian>(0)?;
            context.write_data(buf)?;
        }
        Ok(())
    }

    /// Parse `count` contexts starting at `offset` (relative to the SMB2 header)
    fn parse_list(body: &[u8], offset: usize, count: usize) -> Result<Vec<Self>> {
        let mut pos = offset
            .checked_sub(Smb2Header::SIZE)
            .ok_or_else(|| Error::ParseError("Invalid negotiate context offset".into()))?;
        let mut contexts = Vec::with_capacity(count);

        for _ in 0..count {
            pos = (pos + Smb2Header::SIZE + 7) / 8 * 8 - Smb2Header::SIZE;
            if pos + 8 > body.len() {
                return Err(Error::BufferTooSmall {
                    need: pos + 8,
                    have: body.len(),
                });
            }
            let mut cursor = io::Cursor::new(&body[pos..]);
            let context_type = cursor.read_u16::<LittleEndian>()?;
            let data_len = cursor.read_u16::<LittleEndian>()? as usize;
            let data_start = pos + 8;
            let data_end = data_start + data_len;
            if data_end > body.len() {
                return Err(Error::BufferTooSmall {
                    need: data_end,
                    have: body.len(),
                });
            }
            contexts.push(Self::parse_data(context_type, &body[data_start..data_end])?);
            pos = data_end;
        }

        Ok(contexts)
    }

    fn parse_data(context_type: u16, data: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(data);
        match context_type {
            negotiate_context_type::PREAUTH_INTEGRITY_CAPABILITIES => {
                let count = cursor.read_u16::<LittleEndian>()?;
                let salt_len = cursor.read_u16::<LittleEndian>()? as usize;
                let mut hash_algorithms = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    hash_algorithms.push(cursor.read_u16::<LittleEndian>()?);
                }
                let mut salt = vec![0u8; salt_len];
                cursor.read_exact(&mut salt)?;
                Ok(Self::PreauthIntegrityCapabilities {
                    hash_algorithms,
                    salt,
                })
            }
            negotiate_context_type::ENCRYPTION_CAPABILITIES => {
                let count = cursor.read_u16::<LittleEndian>()?;
                let mut ciphers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    ciphers.push(cursor.read_u16::<LittleEndian>()?);
                }
                Ok(Self::EncryptionCapabilities { ciphers })
            }
            _ => Ok(Self::Other {
                context_type,
                data: data.to_vec(),
            }),
        }
    }
}
