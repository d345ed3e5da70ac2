//! Cancellation token for the background machinery.
//!
//! Cancellation is signalled by disconnecting a channel: every clone of the
//! token shares the receiver, so a blocked `select!` arm wakes on the
//! disconnect and `is_cancelled` polls it without blocking. Only background
//! work observes the token; reads and writes run to completion regardless.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

#[derive(Clone)]
pub struct CancelToken {
    sender:   Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = bounded::<()>(0);
        Self {
            sender:   Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Signal cancellation to every clone. Idempotent.
    pub fn cancel(&self) {
        self.sender.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The channel that disconnects on cancellation, for `select!` arms.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_every_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        assert!(!clone.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
