//! Rendezvous between user threads and the single recycling thread.
//!
//! User threads consume one shared "current" value and, when it is spent,
//! hand it over for recycling; the recycling thread replaces it with a fresh
//! one. Several user threads may race to retire the same value — the
//! identity compare inside [`BackgroundRecycler::request_recycle`] lets
//! exactly one of them win, so the recycler sees each value once.
//!
//! Freshly produced values queue up in a channel; `get_current` caches the
//! head of that queue as the current value. Keeping one value ahead in the
//! queue makes retirement instantaneous for the waiting side.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cancel::CancelToken;

/// The recycler stopped producing replacements.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("recycler is shut down")]
pub struct RecyclerClosed;

pub struct BackgroundRecycler<T> {
    current:  Mutex<Option<Arc<T>>>,
    fresh_tx: Sender<Arc<T>>,
    fresh_rx: Receiver<Arc<T>>,
    spent_tx: Sender<Arc<T>>,
    spent_rx: Receiver<Arc<T>>,
}

impl<T> BackgroundRecycler<T> {
    pub fn new() -> Self {
        let (fresh_tx, fresh_rx) = unbounded();
        let (spent_tx, spent_rx) = unbounded();
        Self {
            current: Mutex::new(None),
            fresh_tx,
            fresh_rx,
            spent_tx,
            spent_rx,
        }
    }

    /// The current value; blocks until the recycler publishes one if none is
    /// cached. Concurrent callers observe the same value.
    pub fn get_current(&self) -> Result<Arc<T>, RecyclerClosed> {
        // Holding the lock across the blocking pop serializes waiters, so a
        // single fresh value satisfies all of them.
        let mut current = self.current.lock();
        if let Some(value) = current.as_ref() {
            return Ok(value.clone());
        }
        match self.fresh_rx.recv() {
            Ok(value) => {
                *current = Some(value.clone());
                Ok(value)
            }
            Err(_) => Err(RecyclerClosed),
        }
    }

    /// The current value if one is cached, without blocking — not even on
    /// the mutex, which a `get_current` waiter holds across its channel pop.
    pub fn try_get_current(&self) -> Option<Arc<T>> {
        self.current.try_lock().and_then(|guard| guard.clone())
    }

    /// Retire `value` if it is still current. The winning caller enqueues it
    /// for the recycling thread; losers find the slot already cleared (or
    /// re-occupied by a successor) and do nothing.
    pub fn request_recycle(&self, value: &Arc<T>) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, value)) {
            *current = None;
            drop(current);
            let _ = self.spent_tx.send(value.clone());
        }
    }

    /// Recycler side: wait up to `timeout` for a retired value. Returns
    /// `None` on timeout or cancellation.
    pub fn try_next_to_be_recycled(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Option<Arc<T>> {
        select! {
            recv(self.spent_rx) -> msg => msg.ok(),
            recv(cancel.receiver()) -> _ => None,
            default(timeout) => None,
        }
    }

    /// Recycler side: publish a fresh replacement.
    pub fn complete_recycle(&self, value: Arc<T>) {
        let _ = self.fresh_tx.send(value);
    }
}

impl<T> Default for BackgroundRecycler<T> {
    fn default() -> Self {
        Self::new()
    }
}
