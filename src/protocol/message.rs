//! Outbound and inbound SMB2 message envelopes

use super::header::Smb2Header;
use super::smb2_constants::{structure_size, Smb2Command, Smb2HeaderFlags, SINGLE_CREDIT_PAYLOAD_SIZE};
use crate::error::{Error, NtStatus, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io;

/// Trait for SMB message bodies that can be parsed from and serialized to bytes
pub trait SmbMessage: Sized {
    /// Parse message from bytes
    fn parse(buf: &[u8]) -> Result<Self>;

    /// Serialize message to bytes
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Get the size of the message when serialized
    fn size(&self) -> usize;
}

/// Number of credits a payload of `payload_size` bytes costs
pub fn credits_needed(payload_size: u32) -> u16 {
    let units = 1 + (payload_size.max(1) - 1) / SINGLE_CREDIT_PAYLOAD_SIZE;
    units.min(u16::MAX as u32) as u16
}

/// A request on its way to the wire.
///
/// The connection stamps `message_id`, `credit_charge` and `credits` into the
/// header; callers set the command, session, tree and body.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub header: Smb2Header,
    pub body: Bytes,
    /// Bytes of read/write/ioctl payload the request asks for; drives credit charge
    pub payload_size: u32,
}

impl OutboundMessage {
    pub fn new(command: Smb2Command, body: impl Into<Bytes>) -> Self {
        Self {
            header: Smb2Header::new(command),
            body: body.into(),
            payload_size: 0,
        }
    }

    pub fn from_message<M: SmbMessage>(command: Smb2Command, message: &M) -> Result<Self> {
        Ok(Self::new(command, message.serialize()?))
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.header.session_id = session_id;
        self
    }

    pub fn with_tree(mut self, tree_id: u32) -> Self {
        self.header.tree_id = tree_id;
        self
    }

    pub fn with_payload_size(mut self, payload_size: u32) -> Self {
        self.payload_size = payload_size;
        self
    }

    pub fn command(&self) -> Smb2Command {
        self.header.command
    }

    pub fn message_id(&self) -> u64 {
        self.header.message_id
    }

    pub fn credits_needed(&self) -> u16 {
        credits_needed(self.payload_size)
    }

    /// Payload budget actually covered by the credit charge stamped on this message
    pub fn granted_payload_size(&self) -> u32 {
        let charge = self.header.credit_charge.max(1) as u32;
        self.payload_size
            .min(charge.saturating_mul(SINGLE_CREDIT_PAYLOAD_SIZE))
    }

    /// Header followed by body, exactly as it goes on the wire when unsigned
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Smb2Header::SIZE + self.body.len());
        self.header.write_to(&mut buf)?;
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }
}

/// SMB2 CANCEL request body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2CancelRequest;

impl Smb2CancelRequest {
    /// Build the cancel message for an in-flight request.
    ///
    /// The cancel reuses the original message id and, once known, the async id;
    /// it consumes no credit and expects no reply.
    pub fn for_request(message_id: u64, async_id: Option<u64>, session_id: u64) -> OutboundMessage {
        let mut message = OutboundMessage::new(Smb2Command::Cancel, Smb2CancelRequest.encode());
        message.header.message_id = message_id;
        message.header.session_id = session_id;
        message.header.credits = 0;
        if let Some(async_id) = async_id {
            message.header.flags |= Smb2HeaderFlags::ASYNC_COMMAND;
            message.header.async_id = async_id;
        }
        message
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&structure_size::CANCEL_REQUEST.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf
    }
}

impl SmbMessage for Smb2CancelRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::CANCEL_REQUEST {
            return Err(Error::ParseError(format!(
                "Invalid cancel structure size: {}",
                size
            )));
        }
        Ok(Self)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.encode())
    }

    fn size(&self) -> usize {
        4
    }
}

/// SMB2 ECHO body; request and response share the layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2Echo;

impl SmbMessage for Smb2Echo {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::ECHO_RESPONSE {
            return Err(Error::ParseError(format!(
                "Invalid echo structure size: {}",
                size
            )));
        }
        Ok(Self)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u16::<LittleEndian>(structure_size::ECHO_REQUEST)?;
        buf.write_u16::<LittleEndian>(0)?;
        Ok(buf)
    }

    fn size(&self) -> usize {
        4
    }
}

/// SMB2 ERROR response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2ErrorResponse {
    pub error_context_count: u8,
    pub error_data: Vec<u8>,
}

impl SmbMessage for Smb2ErrorResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::ParseError("Error response too short".into()));
        }
        let mut cursor = io::Cursor::new(buf);
        let size = cursor.read_u16::<LittleEndian>()?;
        if size != structure_size::ERROR_RESPONSE {
            return Err(Error::ParseError(format!(
                "Invalid error response structure size: {}",
                size
            )));
        }
        let error_context_count = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        let byte_count = cursor.read_u32::<LittleEndian>()? as usize;
        let data_end = 8 + byte_count;
        if buf.len() < data_end {
            return Err(Error::BufferTooSmall {
                need: data_end,
                have: buf.len(),
            });
        }
        Ok(Self {
            error_context_count,
            error_data: buf[8..data_end].to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size());
        buf.write_u16::<LittleEndian>(structure_size::ERROR_RESPONSE)?;
        buf.push(self.error_context_count);
        buf.push(0);
        buf.write_u32::<LittleEndian>(self.error_data.len() as u32)?;
        if self.error_data.is_empty() {
            buf.push(0);
        } else {
            buf.extend_from_slice(&self.error_data);
        }
        Ok(buf)
    }

    fn size(&self) -> usize {
        8 + self.error_data.len().max(1)
    }
}

/// A correlated, authenticated reply handed to the waiting caller
#[derive(Debug, Clone)]
pub struct Smb2Response {
    pub header: Smb2Header,
    pub body: Bytes,
}

impl Smb2Response {
    pub fn status(&self) -> NtStatus {
        NtStatus::from_u32(self.header.status)
    }

    pub fn message_id(&self) -> u64 {
        self.header.message_id
    }

    /// Whether the body is an SMB2 ERROR structure rather than the command's reply
    pub fn is_error_response(&self) -> bool {
        self.status().is_error()
            && self.body.len() >= 2
            && u16::from_le_bytes([self.body[0], self.body[1]]) == structure_size::ERROR_RESPONSE
    }

    /// Parse the body as the command-specific response type
    pub fn parse_body<T: SmbMessage>(&self) -> Result<T> {
        T::parse(&self.body)
    }

    /// The message as it was received, header included
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Smb2Header::SIZE + self.body.len());
        self.header.write_to(&mut buf)?;
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }
}

/// Turns a correlated raw reply into the value delivered to its waiter.
///
/// Decode failures are delivered to the single waiter and never tear down the
/// connection.
pub trait ResponseDecoder: Send + Sync {
    fn decode(&self, header: Smb2Header, body: Bytes) -> Result<Smb2Response>;
}

/// Structural checks shared by every command: a body must at least carry its
/// structure size, and ERROR bodies must be well formed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoder;

impl ResponseDecoder for DefaultDecoder {
    fn decode(&self, header: Smb2Header, body: Bytes) -> Result<Smb2Response> {
        if body.len() < 2 {
            return Err(Error::InvalidMessage(format!(
                "{:?} response for message id {} has no body",
                header.command, header.message_id
            )));
        }
        let response = Smb2Response { header, body };
        if response.is_error_response() {
            Smb2ErrorResponse::parse(&response.body)?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::smb2_constants::status;

    #[test]
    fn test_credits_needed_rounds_up_per_64k() {
        assert_eq!(credits_needed(0), 1);
        assert_eq!(credits_needed(1), 1);
        assert_eq!(credits_needed(65536), 1);
        assert_eq!(credits_needed(65537), 2);
        assert_eq!(credits_needed(8 * 1024 * 1024), 128);
    }

    #[test]
    fn test_cancel_targets_async_id() {
        let cancel = Smb2CancelRequest::for_request(7, Some(0x99), 5);
        assert_eq!(cancel.command(), Smb2Command::Cancel);
        assert_eq!(cancel.message_id(), 7);
        assert!(cancel.header.is_async());
        assert_eq!(cancel.header.async_id, 0x99);
        assert_eq!(cancel.header.session_id, 5);

        let bytes = cancel.to_bytes().unwrap();
        assert_eq!(bytes.len(), 68);
        assert_eq!(&bytes[64..], &[4, 0, 0, 0]);
    }

    #[test]
    fn test_cancel_without_async_id_is_sync() {
        let cancel = Smb2CancelRequest::for_request(3, None, 0);
        assert!(!cancel.header.is_async());
        assert_eq!(cancel.header.credits, 0);
    }

    #[test]
    fn test_granted_payload_size_is_clamped_by_charge() {
        let mut message = OutboundMessage::new(Smb2Command::Read, vec![0u8; 49])
            .with_payload_size(4 * SINGLE_CREDIT_PAYLOAD_SIZE);
        message.header.credit_charge = 2;
        assert_eq!(message.granted_payload_size(), 2 * SINGLE_CREDIT_PAYLOAD_SIZE);
    }

    #[test]
    fn test_default_decoder_checks_error_body() {
        let mut header = Smb2Header::new(Smb2Command::Create);
        header.status = status::CANCELLED;
        let good = Smb2ErrorResponse {
            error_context_count: 0,
            error_data: Vec::new(),
        }
        .serialize()
        .unwrap();
        let response = DefaultDecoder
            .decode(header.clone(), Bytes::from(good))
            .unwrap();
        assert!(response.is_error_response());
        assert_eq!(response.status(), NtStatus::Cancelled);

        let truncated = Bytes::from_static(&[9, 0, 0]);
        assert!(DefaultDecoder.decode(header.clone(), truncated).is_err());
        assert!(DefaultDecoder.decode(header, Bytes::new()).is_err());
    }
}
