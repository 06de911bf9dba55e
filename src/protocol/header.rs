//! SMB2 packet header (sync and async forms)

use super::smb2_constants::*;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};

/// Byte offsets of header fields that are patched or peeked in place
pub mod offsets {
    pub const CREDIT_CHARGE: usize = 6;
    pub const STATUS: usize = 8;
    pub const COMMAND: usize = 12;
    pub const CREDITS: usize = 14;
    pub const FLAGS: usize = 16;
    pub const NEXT_COMMAND: usize = 20;
    pub const MESSAGE_ID: usize = 24;
    pub const ASYNC_ID: usize = 32;
    pub const SESSION_ID: usize = 40;
    pub const SIGNATURE: usize = 48;
    pub const SIGNATURE_LEN: usize = 16;
}

/// SMB2 Header (64 bytes)
///
/// Bytes 32..40 hold either `process_id`/`tree_id` or the 8-byte `async_id`,
/// depending on [`Smb2HeaderFlags::ASYNC_COMMAND`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub structure_size: u16,
    pub credit_charge: u16,
    pub status: u32,
    pub command: Smb2Command,
    /// CreditRequest on requests, CreditResponse on replies
    pub credits: u16,
    pub flags: Smb2HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,
    pub process_id: u32,
    pub tree_id: u32,
    pub async_id: u64,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Smb2Header {
    pub const SIZE: usize = SMB2_HEADER_SIZE;

    pub fn new(command: Smb2Command) -> Self {
        Self {
            structure_size: 64,
            credit_charge: 0,
            status: 0,
            command,
            credits: 1,
            flags: Smb2HeaderFlags::empty(),
            next_command: 0,
            message_id: 0,
            process_id: 0xFEFF,
            tree_id: 0,
            async_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }

        let mut cursor = io::Cursor::new(buf);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if magic != SMB2_MAGIC {
            return Err(Error::InvalidHeader(format!(
                "Invalid protocol ID: {:02x?}",
                magic
            )));
        }

        let structure_size = cursor.read_u16::<LittleEndian>()?;
        if structure_size != 64 {
            return Err(Error::InvalidHeader(format!(
                "Invalid header structure size: {}",
                structure_size
            )));
        }
        let credit_charge = cursor.read_u16::<LittleEndian>()?;
        let status = cursor.read_u32::<LittleEndian>()?;
        let command = Smb2Command::try_from(cursor.read_u16::<LittleEndian>()?)?;
        let credits = cursor.read_u16::<LittleEndian>()?;
        let flags = Smb2HeaderFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let next_command = cursor.read_u32::<LittleEndian>()?;
        let message_id = cursor.read_u64::<LittleEndian>()?;

        let (process_id, tree_id, async_id) = if flags.contains(Smb2HeaderFlags::ASYNC_COMMAND) {
            (0, 0, cursor.read_u64::<LittleEndian>()?)
        } else {
            let process_id = cursor.read_u32::<LittleEndian>()?;
            let tree_id = cursor.read_u32::<LittleEndian>()?;
            (process_id, tree_id, 0)
        };

        let session_id = cursor.read_u64::<LittleEndian>()?;
        let mut signature = [0u8; 16];
        cursor.read_exact(&mut signature)?;

        Ok(Self {
            structure_size,
            credit_charge,
            status,
            command,
            credits,
            flags,
            next_command,
            message_id,
            process_id,
            tree_id,
            async_id,
            session_id,
            signature,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&SMB2_MAGIC);
        buf.write_u16::<LittleEndian>(self.structure_size)?;
        buf.write_u16::<LittleEndian>(self.credit_charge)?;
        buf.write_u32::<LittleEndian>(self.status)?;
        buf.write_u16::<LittleEndian>(self.command.to_u16())?;
        buf.write_u16::<LittleEndian>(self.credits)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_u32::<LittleEndian>(self.next_command)?;
        buf.write_u64::<LittleEndian>(self.message_id)?;
        if self.is_async() {
            buf.write_u64::<LittleEndian>(self.async_id)?;
        } else {
            buf.write_u32::<LittleEndian>(self.process_id)?;
            buf.write_u32::<LittleEndian>(self.tree_id)?;
        }
        buf.write_u64::<LittleEndian>(self.session_id)?;
        buf.extend_from_slice(&self.signature);
        Ok(())
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::SERVER_TO_REDIR)
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::ASYNC_COMMAND)
    }

    pub fn is_signed(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::SIGNED)
    }

    /// An interim reply: the final one arrives later under the same message id
    pub fn is_interim(&self) -> bool {
        self.is_async() && self.status == status::PENDING
    }
}

/// Read the little-endian next-command offset without parsing the full header
pub fn peek_next_command(buf: &[u8]) -> Result<u32> {
    if buf.len() < Smb2Header::SIZE {
        return Err(Error::BufferTooSmall {
            need: Smb2Header::SIZE,
            have: buf.len(),
        });
    }
    let mut cursor = io::Cursor::new(&buf[offsets::NEXT_COMMAND..]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smb2_header_new() {
        let header = Smb2Header::new(Smb2Command::Create);
        assert_eq!(header.command, Smb2Command::Create);
        assert_eq!(header.structure_size, 64);
        assert!(!header.is_async());
    }

    #[test]
    fn test_field_offsets() {
        let mut header = Smb2Header::new(Smb2Command::Read);
        header.credit_charge = 0x0102;
        header.credits = 0x0304;
        header.next_command = 0x0506_0708;
        header.message_id = 0x1122_3344_5566_7788;
        header.session_id = 0xAABB_CCDD_EEFF_0011;
        header.signature = [0x5A; 16];

        let bytes = header.serialize().unwrap();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &SMB2_MAGIC);
        assert_eq!(&bytes[offsets::CREDIT_CHARGE..8], &[0x02, 0x01]);
        assert_eq!(&bytes[offsets::COMMAND..14], &[0x08, 0x00]);
        assert_eq!(&bytes[offsets::CREDITS..16], &[0x04, 0x03]);
        assert_eq!(peek_next_command(&bytes).unwrap(), 0x0506_0708);
        assert_eq!(
            &bytes[offsets::MESSAGE_ID..32],
            &0x1122_3344_5566_7788u64.to_le_bytes()
        );
        assert_eq!(
            &bytes[offsets::SESSION_ID..48],
            &0xAABB_CCDD_EEFF_0011u64.to_le_bytes()
        );
        assert_eq!(&bytes[offsets::SIGNATURE..64], &[0x5A; 16]);
    }

    #[test]
    fn test_async_header_carries_async_id() {
        let mut header = Smb2Header::new(Smb2Command::ChangeNotify);
        header.flags = Smb2HeaderFlags::ASYNC_COMMAND | Smb2HeaderFlags::SERVER_TO_REDIR;
        header.status = status::PENDING;
        header.tree_id = 77;
        header.async_id = 0xDEAD_BEEF;

        let bytes = header.serialize().unwrap();
        assert_eq!(&bytes[offsets::ASYNC_ID..40], &0xDEAD_BEEFu64.to_le_bytes());

        let parsed = Smb2Header::parse(&bytes).unwrap();
        assert!(parsed.is_interim());
        assert_eq!(parsed.async_id, 0xDEAD_BEEF);
        assert_eq!(parsed.tree_id, 0);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = Smb2Header::new(Smb2Command::Echo).serialize().unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(
            Smb2Header::parse(&bytes),
            Err(Error::InvalidHeader(_))
        ));
        assert!(matches!(
            Smb2Header::parse(&bytes[..10]),
            Err(Error::BufferTooSmall { need: 64, have: 10 })
        ));
    }
}
