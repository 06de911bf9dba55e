//! Message id allocation under the server-granted credit budget

use crate::error::{Error, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Hands out strictly increasing message ids, one per credit.
///
/// Available credits are semaphore permits: reserving forgets permits and
/// replies carrying a credit grant add them back. Every connection starts
/// with the single credit that lets it send NEGOTIATE.
#[derive(Debug)]
pub struct SequenceWindow {
    next_message_id: AtomicU64,
    credits: Semaphore,
    enforce: AtomicBool,
    timeout: Duration,
}

impl SequenceWindow {
    pub const INITIAL_CREDITS: usize = 1;

    pub fn new(timeout: Duration) -> Self {
        Self {
            next_message_id: AtomicU64::new(0),
            credits: Semaphore::new(Self::INITIAL_CREDITS),
            enforce: AtomicBool::new(true),
            timeout,
        }
    }

    /// Reserve `count` contiguous message ids, waiting for enough credits.
    ///
    /// Gives up with [`Error::CreditsExhausted`] after the configured wait.
    pub async fn reserve(&self, count: u16) -> Result<Range<u64>> {
        let count = count.max(1);

        if self.enforce.load(Ordering::Acquire) {
            match tokio::time::timeout(self.timeout, self.credits.acquire_many(count as u32)).await {
                Ok(Ok(permit)) => permit.forget(),
                Ok(Err(_)) => return Err(Error::ConnectionClosed),
                Err(_) => {
                    let available = self.available_credits();
                    debug!(
                        "No credits within {:?}: wanted {}, have {}",
                        self.timeout, count, available
                    );
                    return Err(Error::CreditsExhausted {
                        requested: count,
                        available,
                    });
                }
            }
        }

        let first = self.next_message_id.fetch_add(count as u64, Ordering::AcqRel);
        trace!("Reserved message ids {}..{}", first, first + count as u64);
        Ok(first..first + count as u64)
    }

    /// Return credits granted by a reply to the window
    pub fn credits_granted(&self, credits: u16) {
        if credits > 0 {
            self.credits.add_permits(credits as usize);
            trace!(
                "Granted {} credits, {} available",
                credits,
                self.available_credits()
            );
        }
    }

    /// Hand back credits taken by [`SequenceWindow::reserve`] for ids that were never sent
    pub fn release(&self, credits: u16) {
        if self.is_enforcing() {
            self.credits_granted(credits);
        }
    }

    pub fn available_credits(&self) -> usize {
        self.credits.available_permits()
    }

    /// Stop blocking on credits; ids are still handed out in order
    pub fn disable_credits(&self) {
        debug!("Credit enforcement disabled");
        self.enforce.store(false, Ordering::Release);
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforce.load(Ordering::Acquire)
    }

    /// Wake every waiting reserver with [`Error::ConnectionClosed`]
    pub fn close(&self) {
        self.credits.close();
    }
}
