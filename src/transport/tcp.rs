//! Direct TCP transport (port 445): each message is prefixed with a 4-byte
//! big-endian length whose top byte must be zero

use super::{TransportReader, TransportWriter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Size of the direct TCP length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest message accepted in either direction
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Prefix `payload` with its direct TCP length
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::InvalidParameter(format!(
            "Message of {} bytes exceeds the {} byte frame limit",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Length announced by a frame header
pub fn decode_frame_length(header: [u8; FRAME_HEADER_SIZE]) -> Result<usize> {
    if header[0] != 0 {
        return Err(Error::Protocol(format!(
            "Invalid direct TCP frame type 0x{:02x}",
            header[0]
        )));
    }
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame of {} bytes exceeds the {} byte limit",
            length, MAX_FRAME_SIZE
        )));
    }
    Ok(length)
}

/// Framed writer over any byte sink
pub struct DirectTcpWriter<W> {
    stream: Option<W>,
}

impl<W> DirectTcpWriter<W>
where
    W: AsyncWrite + Unpin + Send + Sync,
{
    pub fn new(stream: W) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl<W> TransportWriter for DirectTcpWriter<W>
where
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let frame = encode_frame(&data)?;
        trace!("Writing frame of {} bytes", data.len());
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Framed reader over any byte source
pub struct DirectTcpReader<R> {
    stream: R,
    read_buffer: BytesMut,
}

impl<R> DirectTcpReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(65536),
        }
    }

    /// Read more data from the stream into the buffer
    async fn read_more(&mut self) -> Result<usize> {
        let n = self.stream.read_buf(&mut self.read_buffer).await?;
        if n == 0 {
            if self.read_buffer.is_empty() {
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream closed with {} bytes of a partial frame", self.read_buffer.len()),
            )));
        }
        Ok(n)
    }
}

#[async_trait]
impl<R> TransportReader for DirectTcpReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn receive(&mut self) -> Result<BytesMut> {
        while self.read_buffer.len() < FRAME_HEADER_SIZE {
            self.read_more().await?;
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
        let length = decode_frame_length(header)?;

        while self.read_buffer.len() < FRAME_HEADER_SIZE + length {
            self.read_more().await?;
        }

        self.read_buffer.advance(FRAME_HEADER_SIZE);
        let message = self.read_buffer.split_to(length);
        trace!("Read frame of {} bytes", length);
        Ok(message)
    }
}

/// Open a direct TCP connection and split it into its two halves
pub async fn connect(
    addr: SocketAddr,
) -> Result<(DirectTcpReader<OwnedReadHalf>, DirectTcpWriter<OwnedWriteHalf>)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!(
        "Connected to {} from {}",
        stream.peer_addr()?,
        stream.local_addr()?
    );
    let (read_half, write_half) = stream.into_split();
    Ok((DirectTcpReader::new(read_half), DirectTcpWriter::new(write_half)))
}

#[cfg(test)]
mod tests;
