//! SMB2 wire definitions consumed by the connection transport

pub mod header;
pub mod message;
pub mod negotiate;
pub mod smb2_constants;
pub mod transform;

pub use header::Smb2Header;
pub use message::{
    DefaultDecoder, OutboundMessage, ResponseDecoder, Smb2CancelRequest, Smb2Echo,
    Smb2ErrorResponse, Smb2Response, SmbMessage,
};
pub use transform::Smb2TransformHeader;
