//! Table of requests that have been sent and are still waiting for a reply

use super::handle::ResultSlot;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::Smb2Command;
use crate::protocol::Smb2Response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, RwLockWriteGuard, RwLockReadGuard};
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// One in-flight request
#[derive(Debug)]
pub struct Request {
    message_id: u64,
    cancel_id: Uuid,
    session_id: u64,
    command: Smb2Command,
    timestamp: SystemTime,
    async_id: OnceLock<u64>,
    cancelled: AtomicBool,
    slot: ResultSlot,
}

impl Request {
    pub fn new(
        message_id: u64,
        session_id: u64,
        command: Smb2Command,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Smb2Response>>) {
        let (slot, receiver) = ResultSlot::new();
        let request = Arc::new(Self {
            message_id,
            cancel_id: Uuid::new_v4(),
            session_id,
            command,
            timestamp: SystemTime::now(),
            async_id: OnceLock::new(),
            cancelled: AtomicBool::new(false),
            slot,
        });
        (request, receiver)
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn cancel_id(&self) -> Uuid {
        self.cancel_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn command(&self) -> Smb2Command {
        self.command
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn async_id(&self) -> Option<u64> {
        self.async_id.get().copied()
    }

    /// Record the async id from an interim reply; later ids are ignored
    pub fn set_async_id(&self, async_id: u64) {
        if self.async_id.set(async_id).is_err() && self.async_id() != Some(async_id) {
            warn!(
                "Message id {} already has async id {:?}, ignoring {}",
                self.message_id,
                self.async_id(),
                async_id
            );
        }
    }

    /// Flag the request as cancelled; false if it already was
    pub fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.slot.is_delivered()
    }

    /// Complete the request; false if it was already completed
    pub fn deliver(&self, result: Result<Smb2Response>) -> bool {
        self.slot.deliver(result)
    }
}

#[derive(Debug, Default)]
struct Tables {
    by_message_id: HashMap<u64, Arc<Request>>,
    by_cancel_id: HashMap<Uuid, Arc<Request>>,
}

/// Outstanding requests, indexed by message id and by cancel id.
///
/// Both indexes change together under one lock.
#[derive(Debug, Default)]
pub struct OutstandingRequests {
    tables: RwLock<Tables>,
}

impl OutstandingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a request; must happen before its bytes are written
    pub fn register_outstanding(&self, request: Arc<Request>) -> Result<()> {
        let mut tables = self.write();
        if tables.by_message_id.contains_key(&request.message_id()) {
            return Err(Error::InvalidState(format!(
                "Message id {} is already outstanding",
                request.message_id()
            )));
        }
        tables
            .by_cancel_id
            .insert(request.cancel_id(), request.clone());
        tables.by_message_id.insert(request.message_id(), request);
        Ok(())
    }

    pub fn is_outstanding(&self, message_id: u64) -> bool {
        self.read().by_message_id.contains_key(&message_id)
    }

    /// Remove and return the request a final reply belongs to
    pub fn received_response_for(&self, message_id: u64) -> Result<Arc<Request>> {
        let mut tables = self.write();
        let request = tables
            .by_message_id
            .remove(&message_id)
            .ok_or(Error::NoSuchRequest(message_id))?;
        tables.by_cancel_id.remove(&request.cancel_id());
        Ok(request)
    }

    pub fn get_by_message_id(&self, message_id: u64) -> Option<Arc<Request>> {
        self.read().by_message_id.get(&message_id).cloned()
    }

    pub fn get_by_cancel_id(&self, cancel_id: &Uuid) -> Option<Arc<Request>> {
        self.read().by_cancel_id.get(cancel_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().by_message_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every outstanding request with `cause` and empty the table.
    ///
    /// Returns how many requests were drained.
    pub fn handle_error(&self, cause: &Error) -> usize {
        let drained: Vec<Arc<Request>> = {
            let mut tables = self.write();
            tables.by_cancel_id.clear();
            tables.by_message_id.drain().map(|(_, r)| r).collect()
        };

        for request in &drained {
            let error = match cause {
                Error::ConnectionClosed => Error::ConnectionClosed,
                other => Error::ConnectionError(other.to_string()),
            };
            request.deliver(Err(error));
        }
        if !drained.is_empty() {
            debug!("Failed {} outstanding requests: {}", drained.len(), cause);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let table = OutstandingRequests::new();
        let (request, _rx) = Request::new(7, 0x10, Smb2Command::Read);
        let cancel_id = request.cancel_id();
        table.register_outstanding(request).unwrap();

        assert!(table.is_outstanding(7));
        assert_eq!(table.get_by_message_id(7).unwrap().session_id(), 0x10);
        assert_eq!(table.get_by_cancel_id(&cancel_id).unwrap().message_id(), 7);
        assert!(table.get_by_message_id(8).is_none());
    }

    #[test]
    fn test_duplicate_message_id_rejected() {
        let table = OutstandingRequests::new();
        let (first, _rx1) = Request::new(1, 0, Smb2Command::Echo);
        let (second, _rx2) = Request::new(1, 0, Smb2Command::Echo);
        table.register_outstanding(first).unwrap();
        assert!(matches!(
            table.register_outstanding(second),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_received_response_removes_both_indexes() {
        let table = OutstandingRequests::new();
        let (request, _rx) = Request::new(2, 0, Smb2Command::Echo);
        let cancel_id = request.cancel_id();
        table.register_outstanding(request).unwrap();

        assert_eq!(table.received_response_for(2).unwrap().message_id(), 2);
        assert!(table.get_by_cancel_id(&cancel_id).is_none());
        assert!(matches!(
            table.received_response_for(2),
            Err(Error::NoSuchRequest(2))
        ));
    }

    #[test]
    fn test_async_id_set_once() {
        let (request, _rx) = Request::new(3, 0, Smb2Command::ChangeNotify);
        assert_eq!(request.async_id(), None);
        request.set_async_id(0xAA);
        request.set_async_id(0xBB);
        assert_eq!(request.async_id(), Some(0xAA));
    }

    #[test]
    fn test_handle_error_drains_and_delivers() {
        let table = OutstandingRequests::new();
        let mut receivers = Vec::new();
        for id in 0..3 {
            let (request, rx) = Request::new(id, 0, Smb2Command::Echo);
            table.register_outstanding(request).unwrap();
            receivers.push(rx);
        }

        let cause = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(table.handle_error(&cause), 3);
        assert!(table.is_empty());

        for mut rx in receivers {
            match rx.try_recv().unwrap() {
                Err(Error::ConnectionError(msg)) => assert!(msg.contains("reset")),
                other => panic!("unexpected delivery: {:?}", other),
            }
        }
    }

    #[test]
    fn test_drain_does_not_overwrite_completed_request() {
        let table = OutstandingRequests::new();
        let (request, mut rx) = Request::new(9, 0, Smb2Command::Echo);
        table.register_outstanding(request.clone()).unwrap();
        assert!(request.deliver(Err(Error::Timeout)));

        table.handle_error(&Error::ConnectionClosed);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Timeout)));
    }
}
