//! SMB2/3 protocol constants

use bitflags::bitflags;

/// SMB2 magic as bytes
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// SMB2 magic as u32
pub const SMB2_MAGIC_U32: u32 = 0x424D53FE;

/// SMB2 transform (encrypted record) magic
pub const SMB2_TRANSFORM_MAGIC: [u8; 4] = [0xFD, b'S', b'M', b'B'];

/// SMB1 magic, only ever seen on legacy negotiate replies
pub const SMB1_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// SMB2 header size
pub const SMB2_HEADER_SIZE: usize = 64;

/// SMB2 transform header size
pub const SMB2_TRANSFORM_HEADER_SIZE: usize = 52;

/// Payload bytes covered by a single credit
pub const SINGLE_CREDIT_PAYLOAD_SIZE: u32 = 65536;

/// Message id the server uses for oplock/lease break notifications
pub const UNSOLICITED_MESSAGE_ID: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Structure sizes for the SMB2 bodies this crate builds or inspects
pub mod structure_size {
    pub const NEGOTIATE_REQUEST: u16 = 36;
    pub const NEGOTIATE_RESPONSE: u16 = 65;
    pub const CANCEL_REQUEST: u16 = 4;
    pub const ERROR_RESPONSE: u16 = 9;
    pub const ECHO_REQUEST: u16 = 4;
    pub const ECHO_RESPONSE: u16 = 4;
}

/// Raw NTSTATUS values the handler chain branches on
pub mod status {
    pub const SUCCESS: u32 = 0x00000000;
    pub const PENDING: u32 = 0x00000103;
    pub const CANCELLED: u32 = 0xC0000120;
    pub const MORE_PROCESSING_REQUIRED: u32 = 0xC0000016;
}

/// SMB2 Commands (opcodes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Smb2Command {
    Negotiate = 0x00,
    SessionSetup = 0x01,
    Logoff = 0x02,
    TreeConnect = 0x03,
    TreeDisconnect = 0x04,
    Create = 0x05,
    Close = 0x06,
    Flush = 0x07,
    Read = 0x08,
    Write = 0x09,
    Lock = 0x0A,
    Ioctl = 0x0B,
    Cancel = 0x0C,
    Echo = 0x0D,
    QueryDirectory = 0x0E,
    ChangeNotify = 0x0F,
    QueryInfo = 0x10,
    SetInfo = 0x11,
    OplockBreak = 0x12,
    ServerToClientNotification = 0x13,
}

impl TryFrom<u16> for Smb2Command {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Negotiate),
            0x01 => Ok(Self::SessionSetup),
            0x02 => Ok(Self::Logoff),
            0x03 => Ok(Self::TreeConnect),
            0x04 => Ok(Self::TreeDisconnect),
            0x05 => Ok(Self::Create),
            0x06 => Ok(Self::Close),
            0x07 => Ok(Self::Flush),
            0x08 => Ok(Self::Read),
            0x09 => Ok(Self::Write),
            0x0A => Ok(Self::Lock),
            0x0B => Ok(Self::Ioctl),
            0x0C => Ok(Self::Cancel),
            0x0D => Ok(Self::Echo),
            0x0E => Ok(Self::QueryDirectory),
            0x0F => Ok(Self::ChangeNotify),
            0x10 => Ok(Self::QueryInfo),
            0x11 => Ok(Self::SetInfo),
            0x12 => Ok(Self::OplockBreak),
            0x13 => Ok(Self::ServerToClientNotification),
            _ => Err(crate::Error::ParseError(format!(
                "Invalid SMB2 command: 0x{:04x}",
                value
            ))),
        }
    }
}

impl Smb2Command {
    pub fn from_u16(value: u16) -> crate::Result<Self> {
        value.try_into()
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

bitflags! {
    /// SMB2 header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Smb2HeaderFlags: u32 {
        const SERVER_TO_REDIR = 0x00000001;
        const ASYNC_COMMAND = 0x00000002;
        const RELATED_OPERATIONS = 0x00000004;
        const SIGNED = 0x00000008;
        const PRIORITY_MASK = 0x00000070;
        const DFS_OPERATIONS = 0x10000000;
        const REPLAY_OPERATION = 0x20000000;
    }
}

bitflags! {
    /// SMB2 negotiate security mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityMode: u16 {
        const SIGNING_ENABLED = 0x0001;
        const SIGNING_REQUIRED = 0x0002;
    }
}

bitflags! {
    /// SMB2 capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Smb2Capabilities: u32 {
        const DFS = 0x00000001;
        const LEASING = 0x00000002;
        const LARGE_MTU = 0x00000004;
        const MULTI_CHANNEL = 0x00000008;
        const PERSISTENT_HANDLES = 0x00000010;
        const DIRECTORY_LEASING = 0x00000020;
        const ENCRYPTION = 0x00000040;
    }
}

/// SMB2 dialect versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Smb2Dialect {
    Smb202 = 0x0202,
    Smb210 = 0x0210,
    Smb300 = 0x0300,
    Smb302 = 0x0302,
    Smb311 = 0x0311,
}

impl TryFrom<u16> for Smb2Dialect {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0202 => Ok(Self::Smb202),
            0x0210 => Ok(Self::Smb210),
            0x0300 => Ok(Self::Smb300),
            0x0302 => Ok(Self::Smb302),
            0x0311 => Ok(Self::Smb311),
            _ => Err(crate::Error::ParseError(format!(
                "Unknown SMB2 dialect: 0x{:04x}",
                value
            ))),
        }
    }
}

impl Smb2Dialect {
    pub fn from_u16(value: u16) -> crate::Result<Self> {
        value.try_into()
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// SMB 2.0.2 has no CreditCharge field; it is reserved and must be zero.
    pub fn has_credit_charge(self) -> bool {
        self >= Smb2Dialect::Smb210
    }

    pub fn is_smb3(self) -> bool {
        self >= Smb2Dialect::Smb300
    }

    /// Whether the cipher is chosen through a negotiate context rather than implied
    pub fn negotiates_cipher(self) -> bool {
        self == Smb2Dialect::Smb311
    }
}

/// SMB 3.x encryption cipher identities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EncryptionCipher {
    Aes128Ccm = 0x0001,
    Aes128Gcm = 0x0002,
    Aes256Ccm = 0x0003,
    Aes256Gcm = 0x0004,
}

impl TryFrom<u16> for EncryptionCipher {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::Aes128Ccm),
            0x0002 => Ok(Self::Aes128Gcm),
            0x0003 => Ok(Self::Aes256Ccm),
            0x0004 => Ok(Self::Aes256Gcm),
            _ => Err(crate::Error::ParseError(format!(
                "Unknown encryption cipher: 0x{:04x}",
                value
            ))),
        }
    }
}

impl EncryptionCipher {
    /// Bytes of the 16-byte transform nonce field the cipher actually uses
    pub fn nonce_len(self) -> usize {
        match self {
            Self::Aes128Ccm | Self::Aes256Ccm => 11,
            Self::Aes128Gcm | Self::Aes256Gcm => 12,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Ccm | Self::Aes128Gcm => 16,
            Self::Aes256Ccm | Self::Aes256Gcm => 32,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// SMB 3.1.1 negotiate context types
pub mod negotiate_context_type {
    pub const PREAUTH_INTEGRITY_CAPABILITIES: u16 = 0x0001;
    pub const ENCRYPTION_CAPABILITIES: u16 = 0x0002;
}

/// SMB 3.1.1 preauth integrity hash algorithms
pub mod hash_algorithm {
    pub const SHA_512: u16 = 0x0001;
}

/// Transform header flag marking an encrypted payload
pub const TRANSFORM_FLAG_ENCRYPTED: u16 = 0x0001;
