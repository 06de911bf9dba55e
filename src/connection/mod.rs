//! SMB2/3 client connection
//!
//! A [`Connection`] owns one transport. Any number of tasks may call
//! [`Connection::send`] concurrently; a single reader task feeds every inbound
//! frame through the [`handlers::HandlerChain`], which correlates replies with
//! the [`outstanding::OutstandingRequests`] and returns credits to the
//! [`sequence_window::SequenceWindow`].
//!
//! Lock order: the send guard is taken before the outstanding table; the
//! table and the window never hold their locks while calling each other.

pub mod config;
pub mod handle;
pub mod handlers;
pub mod negotiated;
pub mod outstanding;
pub mod sequence_window;
pub mod session;

pub use config::ConnectionConfig;
pub use handle::RequestHandle;
pub use negotiated::NegotiatedProtocol;
pub use session::SessionContext;

use crate::crypto::{PacketEncryptor, PacketSignatory};
use crate::error::{Error, Result};
use crate::protocol::negotiate::Smb2NegotiateResponse;
use crate::protocol::smb2_constants::Smb2Command;
use crate::protocol::{DefaultDecoder, OutboundMessage, ResponseDecoder, Smb2CancelRequest, Smb2Response};
use crate::transport::{self, TransportReader, TransportWriter};
use async_trait::async_trait;
use bytes::Bytes;
use handle::Canceller;
use handlers::{HandlerChain, HandlerContext};
use negotiated::{build_negotiate_request, update_preauth_hash, PREAUTH_HASH_SIZE};
use outstanding::{OutstandingRequests, Request};
use sequence_window::SequenceWindow;
use session::SessionTable;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Credits to charge for a request needing `needed`, given what is available.
///
/// Without multi-credit support every request costs one credit. Otherwise the
/// request gets what it needs while that leaves a credit spare, or all but one
/// of the available credits.
pub fn grant_credits(needed: u16, available: usize, multi_credit: bool) -> u16 {
    if !multi_credit {
        return 1;
    }
    let needed = needed.max(1);
    if (needed as usize) < available {
        needed
    } else if available > 1 {
        (available - 1).min(u16::MAX as usize) as u16
    } else {
        1
    }
}

/// Credits to ask the server for so the window heads back to `preferred`
pub fn credit_request(preferred: u16, available: usize, granted: u16) -> u16 {
    let available = available.min(u16::MAX as usize) as u16;
    preferred
        .saturating_sub(available)
        .saturating_sub(granted)
        .max(granted)
}

struct ConnectionInner {
    config: ConnectionConfig,
    window: SequenceWindow,
    outstanding: OutstandingRequests,
    sessions: SessionTable,
    signatory: PacketSignatory,
    encryptor: PacketEncryptor,
    decoder: Arc<dyn ResponseDecoder>,
    chain: HandlerChain,
    negotiated: RwLock<Option<NegotiatedProtocol>>,
    /// Held while reserving ids and registering the request
    send_guard: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Box<dyn TransportWriter>>,
    unsolicited: Mutex<Option<UnboundedSender<Smb2Response>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A registered request whose bytes have not reached the transport yet.
///
/// Dropping it before [`UnsentRequest::sent`] takes the request out of the
/// table and gives its credits back. If a fatal error already drained the
/// table there is nothing left to undo.
struct UnsentRequest<'a> {
    inner: &'a ConnectionInner,
    message_id: u64,
    credits: u16,
    armed: bool,
}

impl<'a> UnsentRequest<'a> {
    fn new(inner: &'a ConnectionInner, message_id: u64, credits: u16) -> Self {
        Self {
            inner,
            message_id,
            credits,
            armed: true,
        }
    }

    fn sent(mut self) {
        self.armed = false;
    }
}

impl Drop for UnsentRequest<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self
            .inner
            .outstanding
            .received_response_for(self.message_id)
            .is_ok()
        {
            self.inner.window.release(self.credits);
            debug!(
                "Message id {} never sent, returned {} credits",
                self.message_id, self.credits
            );
        }
    }
}

impl ConnectionInner {
    fn negotiated(&self) -> Option<NegotiatedProtocol> {
        self.negotiated
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve, stamp, register, then sign or encrypt and write.
    ///
    /// Returns the handle and the exact bytes put on the wire.
    async fn send(
        self: &Arc<Self>,
        mut message: OutboundMessage,
    ) -> Result<(RequestHandle, Bytes)> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if message.command() == Smb2Command::Cancel {
            return self.send_unregistered(message).await;
        }

        let negotiated = self.negotiated();
        let multi_credit = negotiated
            .as_ref()
            .map(|n| n.supports_multi_credit())
            .unwrap_or(false);
        let has_credit_charge = negotiated
            .as_ref()
            .map(|n| n.dialect.has_credit_charge())
            .unwrap_or(false);

        let (request, receiver, granted) = {
            let _guard = self.send_guard.lock().await;

            let available = self.window.available_credits();
            let granted = grant_credits(message.credits_needed(), available, multi_credit);
            let ids = self.window.reserve(granted).await?;

            message.header.message_id = ids.start;
            message.header.credit_charge = if has_credit_charge { granted } else { 0 };
            message.header.credits =
                credit_request(self.config.preferred_credits, available, granted);
            if granted < message.credits_needed() {
                debug!(
                    "Message id {} charged {} credits for {} needed, payload cut to {}",
                    ids.start,
                    granted,
                    message.credits_needed(),
                    message.granted_payload_size()
                );
            }

            let (request, receiver) =
                Request::new(ids.start, message.header.session_id, message.command());
            if let Err(e) = self.outstanding.register_outstanding(request.clone()) {
                self.window.release(granted);
                return Err(e);
            }
            (request, receiver, granted)
        };

        let message_id = request.message_id();
        // unregisters and refunds if prepare or write fails, or this future is dropped
        let unsent = UnsentRequest::new(self, message_id, granted);
        let bytes = self.prepare(&mut message)?;

        trace!(
            "Sending {:?} message id {} ({} bytes)",
            message.command(),
            message_id,
            bytes.len()
        );
        self.write(bytes.clone()).await?;
        unsent.sent();

        let canceller: Weak<dyn Canceller> = Arc::downgrade(self) as Weak<dyn Canceller>;
        Ok((
            RequestHandle::new(request, receiver, Some(canceller)),
            bytes,
        ))
    }

    /// Write a CANCEL as is: it reuses the id of the request it cancels,
    /// takes no credit and gets no reply of its own
    async fn send_unregistered(
        &self,
        mut message: OutboundMessage,
    ) -> Result<(RequestHandle, Bytes)> {
        let bytes = self.prepare(&mut message)?;
        self.write(bytes.clone()).await?;

        let (request, receiver) = Request::new(
            message.message_id(),
            message.header.session_id,
            message.command(),
        );
        request.deliver(Err(Error::InvalidState(
            "CANCEL requests get no reply".to_string(),
        )));
        Ok((RequestHandle::new(request, receiver, None), bytes))
    }

    /// Serialize for the wire: encrypted for encrypting sessions, else signed
    /// when the session has a signing key
    fn prepare(&self, message: &mut OutboundMessage) -> Result<Bytes> {
        let Some(session) = self.sessions.get(message.header.session_id) else {
            return Ok(Bytes::from(message.to_bytes()?));
        };

        let encrypt = session.should_encrypt()
            || (self.config.encrypt_data && session.encryption_key.is_some());
        if encrypt {
            let key = session.encryption_key.as_deref().ok_or_else(|| {
                Error::InvalidState(format!(
                    "session {:#x} has no encryption key",
                    session.session_id
                ))
            })?;
            let plaintext = message.to_bytes()?;
            return Ok(Bytes::from(self.encryptor.encrypt(
                &plaintext,
                session.session_id,
                key,
            )?));
        }

        Ok(Bytes::from(
            self.signatory.sign(message, session.signing_key.as_ref())?,
        ))
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(bytes).await
        };
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                self.handle_error(&Error::ConnectionError(e.to_string())).await;
            }
        }
        result
    }

    fn handle(&self, frame: Bytes) -> Result<()> {
        let unsolicited = self
            .unsolicited
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let ctx = HandlerContext {
            outstanding: &self.outstanding,
            window: &self.window,
            sessions: &self.sessions,
            signatory: &self.signatory,
            encryptor: &self.encryptor,
            decoder: self.decoder.as_ref(),
            signing_required: self.config.signing_required,
            unsolicited,
        };
        self.chain.process(frame, &ctx)
    }

    /// Fail everything pending and shut the transport
    async fn handle_error(&self, cause: &Error) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            match cause {
                Error::ConnectionClosed => debug!("Connection closed"),
                other => error!("Connection failed: {}", other),
            }
        }
        self.outstanding.handle_error(cause);
        self.window.close();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("Error closing transport: {}", e);
        }
    }
}

#[async_trait]
impl Canceller for ConnectionInner {
    async fn send_cancel(&self, request: &Request) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let message = Smb2CancelRequest::for_request(
            request.message_id(),
            request.async_id(),
            request.session_id(),
        );
        debug!(
            "Cancelling message id {} (async id {:?})",
            request.message_id(),
            request.async_id()
        );
        self.send_unregistered(message).await.map(|_| ())
    }
}

async fn read_loop<R: TransportReader>(inner: Arc<ConnectionInner>, mut reader: R) {
    loop {
        match reader.receive().await {
            Ok(frame) => {
                if let Err(e) = inner.handle(frame.freeze()) {
                    if e.is_connection_fatal() {
                        inner.handle_error(&e).await;
                        break;
                    }
                    warn!("Dropped inbound message: {}", e);
                }
            }
            Err(e) => {
                if !inner.is_closed() {
                    inner.handle_error(&e).await;
                }
                break;
            }
        }
    }
    trace!("Reader task finished");
}

/// An SMB2/3 client connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("negotiated", &self.inner.negotiated())
            .field("available_credits", &self.inner.window.available_credits())
            .field("outstanding", &self.inner.outstanding.len())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Connection {
    /// A connection writing to `writer`; inbound frames are fed through [`Connection::handle`]
    pub fn new(config: ConnectionConfig, writer: Box<dyn TransportWriter>) -> Self {
        Self::with_decoder(config, writer, Arc::new(DefaultDecoder))
    }

    pub fn with_decoder(
        config: ConnectionConfig,
        writer: Box<dyn TransportWriter>,
        decoder: Arc<dyn ResponseDecoder>,
    ) -> Self {
        let window = SequenceWindow::new(config.credit_timeout);
        if !config.enforce_credits {
            window.disable_credits();
        }

        Self {
            inner: Arc::new(ConnectionInner {
                config,
                window,
                outstanding: OutstandingRequests::new(),
                sessions: SessionTable::new(),
                signatory: PacketSignatory::new(),
                encryptor: PacketEncryptor::new(),
                decoder,
                chain: HandlerChain::new(),
                negotiated: RwLock::new(None),
                send_guard: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(writer),
                unsolicited: Mutex::new(None),
                reader_task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A connection over an already-open transport, with its reader task running
    pub fn start<R, W>(config: ConnectionConfig, reader: R, writer: W) -> Self
    where
        R: TransportReader + 'static,
        W: TransportWriter + 'static,
    {
        let connection = Self::new(config, Box::new(writer));
        let task = tokio::spawn(read_loop(connection.inner.clone(), reader));
        *connection
            .inner
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        connection
    }

    /// Open a direct TCP connection to `addr`
    pub async fn connect(addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        let (reader, writer) = transport::tcp::connect(addr).await?;
        info!("Connected to {}", addr);
        Ok(Self::start(config, reader, writer))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn negotiated(&self) -> Option<NegotiatedProtocol> {
        self.inner.negotiated()
    }

    pub fn available_credits(&self) -> usize {
        self.inner.window.available_credits()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.inner.outstanding.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Send `message` and return a handle on its eventual reply.
    ///
    /// The message id, credit charge and credit request are filled in here.
    pub async fn send(&self, message: OutboundMessage) -> Result<RequestHandle> {
        let (handle, _) = self.inner.send(message).await?;
        Ok(handle)
    }

    /// Send `message` and wait up to the configured response timeout
    pub async fn send_and_receive(&self, message: OutboundMessage) -> Result<Smb2Response> {
        let handle = self.send(message).await?;
        handle.wait_timeout(self.inner.config.response_timeout).await
    }

    /// Negotiate the dialect and apply the result to this connection
    pub async fn negotiate(&self) -> Result<NegotiatedProtocol> {
        let request = build_negotiate_request(&self.inner.config);
        let message = OutboundMessage::from_message(Smb2Command::Negotiate, &request)?;
        let (handle, request_bytes) = self.inner.send(message).await?;
        let response = handle
            .wait_timeout(self.inner.config.response_timeout)
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Protocol(format!("Negotiate failed: {}", status)));
        }
        let body: Smb2NegotiateResponse = response.parse_body()?;
        if !self.inner.config.dialects.contains(&body.dialect_revision) {
            return Err(Error::UnsupportedProtocol(format!(
                "server chose {:?}, which was not offered",
                body.dialect_revision
            )));
        }

        let mut negotiated = NegotiatedProtocol::from_response(&body)?;
        if negotiated.dialect.negotiates_cipher() {
            let hash = update_preauth_hash(&[0u8; PREAUTH_HASH_SIZE], &request_bytes);
            negotiated.preauth_hash = Some(update_preauth_hash(&hash, &response.to_bytes()?));
        }

        self.apply_negotiated(negotiated.clone())?;
        info!(
            "Negotiated {:?} (cipher {:?}, multi-credit {})",
            negotiated.dialect,
            negotiated.cipher,
            negotiated.supports_multi_credit()
        );
        Ok(negotiated)
    }

    /// Install a negotiation result obtained elsewhere
    pub fn apply_negotiated(&self, negotiated: NegotiatedProtocol) -> Result<()> {
        self.inner.encryptor.init(&negotiated)?;
        *self
            .inner
            .negotiated
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(negotiated);
        Ok(())
    }

    pub fn register_session(&self, session: SessionContext) {
        self.inner.sessions.insert(session);
    }

    pub fn remove_session(&self, session_id: u64) -> Option<Arc<SessionContext>> {
        self.inner.sessions.remove(session_id)
    }

    /// Receive oplock/lease breaks and other uncorrelated messages
    pub fn set_unsolicited_listener(&self, listener: UnboundedSender<Smb2Response>) {
        *self
            .inner
            .unsolicited
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    /// Push one inbound frame through the handler chain.
    ///
    /// Integrity and protocol failures are returned after the connection has
    /// been failed; other errors only drop the frame.
    pub async fn handle(&self, frame: Bytes) -> Result<()> {
        match self.inner.handle(frame) {
            Err(e) if e.is_connection_fatal() => {
                self.inner.handle_error(&e).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Fail all pending requests with `cause` and close the transport
    pub async fn handle_error(&self, cause: Error) {
        self.inner.handle_error(&cause).await;
    }

    /// Close the connection; pending requests fail with [`Error::ConnectionClosed`]
    pub async fn close(&self) {
        self.inner.handle_error(&Error::ConnectionClosed).await;
        let task = self
            .inner
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests;
