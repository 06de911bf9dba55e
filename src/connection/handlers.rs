//! Inbound packet handler chain
//!
//! Every frame read from the transport runs through an ordered list of small
//! stages. Each stage either passes the packet on, splits off the rest of a
//! compound, consumes it, or hands it to the dead-letter sink. A compound is
//! processed one message at a time: the first message goes through the whole
//! chain before the remainder re-enters at the de-compounding stage.

use super::outstanding::OutstandingRequests;
use super::sequence_window::SequenceWindow;
use super::session::SessionTable;
use crate::crypto::{PacketEncryptor, PacketSignatory};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::header::peek_next_command;
use crate::protocol::smb2_constants::{SMB1_MAGIC, SMB2_MAGIC, UNSOLICITED_MESSAGE_ID};
use crate::protocol::{ResponseDecoder, Smb2Header, Smb2Response, Smb2TransformHeader};
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

/// One inbound message (or, before de-compounding, a whole frame)
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub bytes: Bytes,
    /// Set once the packet came out of a transform record
    pub decrypted: bool,
    /// Set on the remainder split off a compound
    compounded: bool,
    header: Option<Smb2Header>,
}

impl InboundPacket {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            decrypted: false,
            compounded: false,
            header: None,
        }
    }

    fn with_bytes(&self, bytes: Bytes) -> Self {
        Self {
            bytes,
            decrypted: self.decrypted,
            compounded: self.compounded,
            header: None,
        }
    }

    /// The parsed header; available from the de-compounding stage on
    pub fn header(&self) -> Result<&Smb2Header> {
        self.header
            .as_ref()
            .ok_or_else(|| Error::InvalidState("packet header not parsed yet".to_string()))
    }
}

/// What a stage decided about a packet
#[derive(Debug)]
pub enum Disposition {
    /// Hand the packet to the next stage
    Forward(InboundPacket),
    /// Process `first` through the rest of the chain, then `rest` from this stage again
    Split {
        first: InboundPacket,
        rest: InboundPacket,
    },
    /// Nothing more to do
    Consumed,
    /// Nobody is waiting for this packet
    DeadLetter(InboundPacket),
}

/// Connection state the stages read and update
pub struct HandlerContext<'a> {
    pub outstanding: &'a OutstandingRequests,
    pub window: &'a SequenceWindow,
    pub sessions: &'a SessionTable,
    pub signatory: &'a PacketSignatory,
    pub encryptor: &'a PacketEncryptor,
    pub decoder: &'a dyn ResponseDecoder,
    /// Connection-wide policy: verify every reply on signed sessions
    pub signing_required: bool,
    pub unsolicited: Option<UnboundedSender<Smb2Response>>,
}

/// One stage of the chain
pub trait PacketHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, packet: InboundPacket, ctx: &HandlerContext<'_>) -> Result<Disposition>;
}

/// Unwraps transform records and rejects anything that is not SMB2
pub struct DecryptHandler;

impl PacketHandler for DecryptHandler {
    fn name(&self) -> &'static str {
        "decrypt"
    }

    fn handle(&self, mut packet: InboundPacket, ctx: &HandlerContext<'_>) -> Result<Disposition> {
        if Smb2TransformHeader::is_transform(&packet.bytes) {
            let transform = Smb2TransformHeader::parse(&packet.bytes)?;
            let key = ctx
                .sessions
                .get(transform.session_id)
                .and_then(|s| s.decryption_key.clone())
                .ok_or_else(|| {
                    Error::DecryptionFailed(format!(
                        "no decryption key for session {:#x}",
                        transform.session_id
                    ))
                })?;
            let plaintext = ctx.encryptor.decrypt(&packet.bytes, &key)?;
            trace!(
                "Decrypted {} bytes for session {:#x}",
                plaintext.len(),
                transform.session_id
            );
            packet.bytes = Bytes::from(plaintext);
            packet.decrypted = true;
            return Ok(Disposition::Forward(packet));
        }

        if packet.bytes.starts_with(&SMB1_MAGIC) {
            return Ok(Disposition::DeadLetter(packet));
        }
        if !packet.bytes.starts_with(&SMB2_MAGIC) {
            return Err(Error::Protocol(format!(
                "Unknown protocol id {:02x?}",
                &packet.bytes[..packet.bytes.len().min(4)]
            )));
        }
        Ok(Disposition::Forward(packet))
    }
}

/// Splits compounded messages on their next-command offsets
pub struct DecompoundHandler;

impl PacketHandler for DecompoundHandler {
    fn name(&self) -> &'static str {
        "decompound"
    }

    fn handle(&self, packet: InboundPacket, _ctx: &HandlerContext<'_>) -> Result<Disposition> {
        let compounded = packet.compounded;
        let in_compound = |e: Error| {
            if compounded && !e.is_connection_fatal() {
                Error::InvalidCompound(format!("unreadable compound element: {}", e))
            } else {
                e
            }
        };

        let next = peek_next_command(&packet.bytes).map_err(in_compound)? as usize;
        let len = packet.bytes.len();

        if next == 0 {
            let mut packet = packet;
            packet.header = Some(Smb2Header::parse(&packet.bytes).map_err(in_compound)?);
            return Ok(Disposition::Forward(packet));
        }

        // the remainder must hold at least a full header
        if next < Smb2Header::SIZE || next + Smb2Header::SIZE > len || next % 8 != 0 {
            return Err(Error::InvalidCompound(format!(
                "next command offset {} in a {} byte buffer",
                next, len
            )));
        }

        let mut first = packet.with_bytes(packet.bytes.slice(..next));
        first.header = Some(Smb2Header::parse(&first.bytes).map_err(in_compound)?);
        let mut rest = packet.with_bytes(packet.bytes.slice(next..));
        rest.compounded = true;
        Ok(Disposition::Split { first, rest })
    }
}

/// Lets through only replies somebody is waiting for
pub struct OutstandingCheckHandler;

impl PacketHandler for OutstandingCheckHandler {
    fn name(&self) -> &'static str {
        "outstanding-check"
    }

    fn handle(&self, packet: InboundPacket, ctx: &HandlerContext<'_>) -> Result<Disposition> {
        let message_id = packet.header()?.message_id;
        if message_id == UNSOLICITED_MESSAGE_ID || !ctx.outstanding.is_outstanding(message_id) {
            return Ok(Disposition::DeadLetter(packet));
        }
        Ok(Disposition::Forward(packet))
    }
}

/// Checks signatures of replies on signed sessions
pub struct VerifySignatureHandler;

impl PacketHandler for VerifySignatureHandler {
    fn name(&self) -> &'static str {
        "verify-signature"
    }

    fn handle(&self, packet: InboundPacket, ctx: &HandlerContext<'_>) -> Result<Disposition> {
        let header = packet.header()?;
        // decryption already authenticated it; interim replies are never signed
        if packet.decrypted || header.is_interim() {
            return Ok(Disposition::Forward(packet));
        }

        let Some(session) = ctx.sessions.get(header.session_id) else {
            return Ok(Disposition::Forward(packet));
        };
        let Some(key) = session.signing_key.as_ref() else {
            return Ok(Disposition::Forward(packet));
        };

        if header.is_signed() || session.signing_required || ctx.signing_required {
            if !ctx.signatory.verify(&packet.bytes, key)? {
                return Err(Error::SignatureMismatch {
                    message_id: header.message_id,
                });
            }
            trace!("Verified signature of message id {}", header.message_id);
        }
        Ok(Disposition::Forward(packet))
    }
}

/// Returns the reply's credit grant to the sequence window
pub struct GrantCreditsHandler;

impl PacketHandler for GrantCreditsHandler {
    fn name(&self) -> &'static str {
        "grant-credits"
    }

    fn handle(&self, packet: InboundPacket, ctx: &HandlerContext<'_>) -> Result<Disposition> {
        ctx.window.credits_granted(packet.header()?.credits);
        Ok(Disposition::Forward(packet))
    }
}

/// Records the async id of interim replies and stops them
pub struct AsyncPendingHandler;

impl PacketHandler for AsyncPendingHandler {
    fn name(&self) -> &'static str {
        "async-pending"
    }

    fn handle(&self, packet: InboundPacket, ctx: &HandlerContext<'_>) -> Result<Disposition> {
        let header = packet.header()?;
        if !header.is_interim() {
            return Ok(Disposition::Forward(packet));
        }
        if let Some(request) = ctx.outstanding.get_by_message_id(header.message_id) {
            request.set_async_id(header.async_id);
            debug!(
                "Message id {} pending with async id {:#x}",
                header.message_id, header.async_id
            );
        }
        Ok(Disposition::Consumed)
    }
}

/// Completes the waiting request with the decoded reply
pub struct DispatchHandler;

impl PacketHandler for DispatchHandler {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn handle(&self, packet: InboundPacket, ctx: &HandlerContext<'_>) -> Result<Disposition> {
        let header = packet.header()?.clone();
        let request = ctx.outstanding.received_response_for(header.message_id)?;

        let result = if request.is_cancelled() && NtStatus::from_u32(header.status) == NtStatus::Cancelled {
            Err(Error::Cancelled)
        } else {
            let body = packet.bytes.slice(Smb2Header::SIZE..);
            ctx.decoder.decode(header, body)
        };

        if !request.deliver(result) {
            debug!(
                "Reply for message id {} arrived after it completed",
                request.message_id()
            );
        }
        Ok(Disposition::Consumed)
    }
}

/// Terminal sink for uncorrelated messages; never fails
#[derive(Debug, Default)]
pub struct DeadLetterHandler;

impl DeadLetterHandler {
    pub fn handle(&self, packet: InboundPacket, ctx: &HandlerContext<'_>) {
        if packet.bytes.starts_with(&SMB1_MAGIC) {
            warn!("Dropping SMB1 message of {} bytes", packet.bytes.len());
            return;
        }

        let header = match packet.header() {
            Ok(header) => header.clone(),
            Err(_) => match Smb2Header::parse(&packet.bytes) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Dropping unparseable message: {}", e);
                    return;
                }
            },
        };

        let message_id = header.message_id;
        let command = header.command;
        if let Some(listener) = &ctx.unsolicited {
            let response = Smb2Response {
                header,
                body: packet.bytes.slice(Smb2Header::SIZE..),
            };
            if listener.send(response).is_ok() {
                trace!("Forwarded unsolicited {:?} (message id {:#x})", command, message_id);
                return;
            }
        }
        debug!(
            "Dropping unsolicited {:?} with message id {:#x}",
            command, message_id
        );
    }
}

/// The ordered stages plus the dead-letter sink
pub struct HandlerChain {
    stages: Vec<Box<dyn PacketHandler>>,
    dead_letter: DeadLetterHandler,
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self {
            stages: vec![
                Box::new(DecryptHandler),
                Box::new(DecompoundHandler),
                Box::new(OutstandingCheckHandler),
                Box::new(VerifySignatureHandler),
                Box::new(GrantCreditsHandler),
                Box::new(AsyncPendingHandler),
                Box::new(DispatchHandler),
            ],
            dead_letter: DeadLetterHandler,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one frame through the chain.
    ///
    /// Errors returned here come from integrity or protocol checks; decode
    /// errors are delivered to the waiting request instead.
    pub fn process(&self, frame: Bytes, ctx: &HandlerContext<'_>) -> Result<()> {
        let mut pending = VecDeque::from([(0usize, InboundPacket::new(frame))]);

        while let Some((start, mut packet)) = pending.pop_front() {
            let mut index = start;
            loop {
                let Some(stage) = self.stages.get(index) else {
                    self.dead_letter.handle(packet, ctx);
                    break;
                };
                match stage.handle(packet, ctx)? {
                    Disposition::Forward(next) => {
                        packet = next;
                        index += 1;
                    }
                    Disposition::Split { first, rest } => {
                        pending.push_front((index, rest));
                        packet = first;
                        index += 1;
                    }
                    Disposition::Consumed => break,
                    Disposition::DeadLetter(dropped) => {
                        self.dead_letter.handle(dropped, ctx);
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
