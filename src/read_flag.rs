//! Read flags — one-shot latches that make a block readable.
//!
//! Every block carries a flag holding the work that must happen before its
//! payload may be handed to a reader: copying the deferred payload in (write
//! path) or re-hashing the payload against the stored hash (recovery path).
//! The first caller of [`ReadFlag::wait_until_readable`] runs the action;
//! concurrent callers block until it finishes; later callers get the cached
//! outcome. If the action fails, that failure is delivered to every current
//! and future waiter — the block is permanently unreadable.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::hash::Hash;

/// Terminal failure of a flag action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("file {file_id} offset {offset}: stored hash {expected}, payload hashes to {actual}")]
    InvalidHash {
        file_id:  u32,
        offset:   u64,
        expected: Hash,
        actual:   Hash,
    },
}

pub type FlagResult = Result<(), FlagError>;

type Action = Box<dyn FnOnce() -> FlagResult + Send>;

enum LatchState {
    NotRun(Action),
    Running,
    Done(FlagResult),
}

struct Latch {
    /// Set once the action has completed successfully; lets settled flags
    /// skip the mutex entirely.
    ready: std::sync::atomic::AtomicBool,
    state: Mutex<LatchState>,
    cond:  Condvar,
}

/// Per-block readiness latch. Clones share the same latch.
#[derive(Clone)]
pub struct ReadFlag {
    latch: Arc<Latch>,
}

impl ReadFlag {
    /// A flag whose action has not run yet.
    pub fn pending(action: impl FnOnce() -> FlagResult + Send + 'static) -> Self {
        Self {
            latch: Arc::new(Latch {
                ready: std::sync::atomic::AtomicBool::new(false),
                state: Mutex::new(LatchState::NotRun(Box::new(action))),
                cond:  Condvar::new(),
            }),
        }
    }

    /// Run the action if nobody has, wait for it if somebody is, and return
    /// its (cached) outcome.
    pub fn wait_until_readable(&self) -> FlagResult {
        use std::sync::atomic::Ordering;

        if self.latch.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.latch.state.lock();
        loop {
            match &*state {
                LatchState::Done(result) => return result.clone(),
                LatchState::Running => self.latch.cond.wait(&mut state),
                LatchState::NotRun(_) => {
                    let taken = std::mem::replace(&mut *state, LatchState::Running);
                    drop(state);
                    let result = match taken {
                        LatchState::NotRun(action) => action(),
                        _ => unreachable!("state checked under the lock"),
                    };
                    let mut state = self.latch.state.lock();
                    *state = LatchState::Done(result.clone());
                    if result.is_ok() {
                        self.latch.ready.store(true, Ordering::Release);
                    }
                    self.latch.cond.notify_all();
                    return result;
                }
            }
        }
    }
}
