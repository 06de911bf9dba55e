//! Transport layer for the SMB connection
//!
//! The connection only sees whole SMB2 messages (or transform records); the
//! transport owns the framing on the byte stream.

use crate::error::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

pub mod tcp;

pub use tcp::{DirectTcpReader, DirectTcpWriter};

/// Outbound half of a transport
#[async_trait]
pub trait TransportWriter: Send + Sync {
    /// Frame and write one message
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Close the outbound half
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport; owned by the connection's single reader task
#[async_trait]
pub trait TransportReader: Send {
    /// Read the next complete message.
    ///
    /// Returns [`crate::Error::ConnectionClosed`] when the peer closes the
    /// stream between messages.
    async fn receive(&mut self) -> Result<BytesMut>;
}
