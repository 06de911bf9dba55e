//! Single-assignment result slots and the cancellable handles callers wait on

use super::outstanding::Request;
use crate::error::{Error, Result};
use crate::protocol::Smb2Response;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Holds the sending half of a request's reply until the first delivery.
///
/// Delivery takes the sender out, so a second delivery finds nothing and is
/// rejected; normal replies, timeouts and connection failures all race
/// through the same slot.
#[derive(Debug)]
pub struct ResultSlot {
    sender: Mutex<Option<oneshot::Sender<Result<Smb2Response>>>>,
}

impl ResultSlot {
    pub fn new() -> (Self, oneshot::Receiver<Result<Smb2Response>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver `result`; returns false if something was delivered before
    pub fn deliver(&self, result: Result<Smb2Response>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // the waiter may have gone away; the delivery still counts
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// Sends the protocol-level CANCEL for an in-flight request
#[async_trait]
pub trait Canceller: Send + Sync {
    async fn send_cancel(&self, request: &Request) -> Result<()>;
}

/// What `send` returns: a future-like handle on one outstanding request
#[derive(Debug)]
pub struct RequestHandle {
    request: Arc<Request>,
    receiver: oneshot::Receiver<Result<Smb2Response>>,
    canceller: Option<Weak<dyn Canceller>>,
}

impl RequestHandle {
    pub fn new(
        request: Arc<Request>,
        receiver: oneshot::Receiver<Result<Smb2Response>>,
        canceller: Option<Weak<dyn Canceller>>,
    ) -> Self {
        Self {
            request,
            receiver,
            canceller,
        }
    }

    pub fn message_id(&self) -> u64 {
        self.request.message_id()
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn is_done(&self) -> bool {
        self.request.is_completed()
    }

    /// Wait for the reply, however long it takes
    pub async fn wait(self) -> Result<Smb2Response> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Wait at most `timeout`.
    ///
    /// On expiry a timeout error is delivered through the request's own slot;
    /// if a reply won that race, the reply is returned instead.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Smb2Response> {
        if let Ok(received) = tokio::time::timeout(timeout, &mut self.receiver).await {
            return received.unwrap_or(Err(Error::ConnectionClosed));
        }

        if self.request.deliver(Err(Error::Timeout)) {
            debug!(
                "Message id {} timed out after {:?}",
                self.request.message_id(),
                timeout
            );
        }
        self.wait().await
    }

    /// Ask the server to cancel this request.
    ///
    /// Returns false if the request already completed or was already
    /// cancelled. The request stays outstanding until the server answers.
    pub async fn cancel(&self) -> Result<bool> {
        if self.request.is_completed() || !self.request.mark_cancelled() {
            return Ok(false);
        }
        let Some(canceller) = self.canceller.as_ref().and_then(Weak::upgrade) else {
            return Ok(false);
        };
        canceller.send_cancel(&self.request).await?;
        Ok(true)
    }
}
