//! Client-side SMB2/3 connection transport
//!
//! Message id and credit management, request/response correlation, packet
//! signing and encryption, and compound/async reply handling for one
//! connection to an SMB server. Session setup, tree connects and file
//! operations are built on top of [`connection::Connection::send`].

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod connection;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, NegotiatedProtocol, RequestHandle, SessionContext};
pub use error::{Error, NtStatus, Result};
