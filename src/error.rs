//! Error types for the SMB connection transport

use std::convert::TryFrom;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for SMB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SMB connection operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol parsing error: {0}")]
    ParseError(String),

    /// Invalid SMB header
    #[error("Invalid SMB header: {0}")]
    InvalidHeader(String),

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// No credits became available within the configured wait
    #[error("Credits exhausted: requested {requested}, available {available}")]
    CreditsExhausted { requested: u16, available: usize },

    /// A response arrived for a message id nobody is waiting on
    #[error("No outstanding request for message id {0}")]
    NoSuchRequest(u64),

    /// A compounded buffer carried an out-of-range next-command offset
    #[error("Invalid compound chain: {0}")]
    InvalidCompound(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Signature check failed on an inbound message
    #[error("Signature verification failed for message id {message_id}")]
    SignatureMismatch { message_id: u64 },

    /// Authenticated decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Encryption error
    #[error("Encryption/Decryption error: {0}")]
    CryptoError(String),

    /// Signing error
    #[error("Message signing error: {0}")]
    SigningError(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout occurred
    #[error("Operation timed out")]
    Timeout,

    /// The request was cancelled locally before a reply could be delivered
    #[error("Request cancelled")]
    Cancelled,

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocol(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Whether this error means the byte stream can no longer be trusted.
    ///
    /// Protocol violations, integrity failures and transport failures all tear
    /// down the connection. Decode failures, timeouts and credit exhaustion only
    /// affect a single caller.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::NoSuchRequest(_)
                | Error::InvalidCompound(_)
                | Error::Protocol(_)
                | Error::SignatureMismatch { .. }
                | Error::DecryptionFailed(_)
                | Error::ConnectionError(_)
                | Error::ConnectionClosed
        )
    }
}

/// SMB protocol status codes (subset of NTSTATUS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtStatus {
    /// The operation completed successfully
    Success = 0x00000000,
    /// The operation is still in progress; a final reply follows
    Pending = 0x00000103,
    /// A directory change notification overflowed
    NotifyEnumDir = 0x0000010C,
    /// No more files
    NoMoreFiles = 0x80000006,
    /// The specified handle is invalid
    InvalidHandle = 0xC0000008,
    /// The parameter is incorrect
    InvalidParameter = 0xC000000D,
    /// More processing required
    MoreProcessingRequired = 0xC0000016,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// The object name is not found
    ObjectNameNotFound = 0xC0000034,
    /// The user name or password is incorrect
    LogonFailure = 0xC000006D,
    /// Insufficient resources
    InsufficientResources = 0xC000009A,
    /// The request timed out
    IoTimeout = 0xC00000B5,
    /// The request is not supported
    NotSupported = 0xC00000BB,
    /// The specified network name is no longer available
    NetworkNameDeleted = 0xC00000C9,
    /// The I/O request was cancelled
    Cancelled = 0xC0000120,
    /// The session has been deleted on the server
    UserSessionDeleted = 0xC0000203,
    /// The session has expired and must be re-authenticated
    NetworkSessionExpired = 0xC000035C,
    /// Any status this crate does not name
    Unknown = 0xFFFFFFFF,
}

impl TryFrom<u32> for NtStatus {
    type Error = ();

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00000000 => Ok(NtStatus::Success),
            0x00000103 => Ok(NtStatus::Pending),
            0x0000010C => Ok(NtStatus::NotifyEnumDir),
            0x80000006 => Ok(NtStatus::NoMoreFiles),
            0xC0000008 => Ok(NtStatus::InvalidHandle),
            0xC000000D => Ok(NtStatus::InvalidParameter),
            0xC0000016 => Ok(NtStatus::MoreProcessingRequired),
            0xC0000022 => Ok(NtStatus::AccessDenied),
            0xC0000034 => Ok(NtStatus::ObjectNameNotFound),
            0xC000006D => Ok(NtStatus::LogonFailure),
            0xC000009A => Ok(NtStatus::InsufficientResources),
            0xC00000B5 => Ok(NtStatus::IoTimeout),
            0xC00000BB => Ok(NtStatus::NotSupported),
            0xC00000C9 => Ok(NtStatus::NetworkNameDeleted),
            0xC0000120 => Ok(NtStatus::Cancelled),
            0xC0000203 => Ok(NtStatus::UserSessionDeleted),
            0xC000035C => Ok(NtStatus::NetworkSessionExpired),
            _ => Err(()),
        }
    }
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }

    /// Check if this is an error status
    pub fn is_error(self) -> bool {
        (self as u32) & 0xC0000000 == 0xC0000000
    }

    /// Check if this is a warning status
    pub fn is_warning(self) -> bool {
        (self as u32) & 0x80000000 == 0x80000000 && !self.is_error()
    }

    /// Create from a raw u32 value
    pub fn from_u32(value: u32) -> Self {
        value.try_into().unwrap_or(NtStatus::Unknown)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NtStatus::Success => "Success",
            NtStatus::Pending => "Pending",
            NtStatus::NotifyEnumDir => "Notify enum dir",
            NtStatus::NoMoreFiles => "No more files",
            NtStatus::InvalidHandle => "Invalid handle",
            NtStatus::InvalidParameter => "Invalid parameter",
            NtStatus::MoreProcessingRequired => "More processing required",
            NtStatus::AccessDenied => "Access denied",
            NtStatus::ObjectNameNotFound => "Object name not found",
            NtStatus::LogonFailure => "Logon failure",
            NtStatus::InsufficientResources => "Insufficient resources",
            NtStatus::IoTimeout => "I/O timeout",
            NtStatus::NotSupported => "Not supported",
            NtStatus::NetworkNameDeleted => "Network name deleted",
            NtStatus::Cancelled => "Cancelled",
            NtStatus::UserSessionDeleted => "User session deleted",
            NtStatus::NetworkSessionExpired => "Network session expired",
            NtStatus::Unknown => "Unknown status",
        };
        write!(f, "{} (0x{:08X})", msg, *self as u32)
    }
}
