//! Pin counter with a seal bit, packed into one atomic word.
//!
//! A pinner guards the teardown of a shared resource: readers `try_pin`
//! before touching it and `unpin` after, and the owner `seal`s it when the
//! resource is scheduled for destruction. Once sealed, no new pin succeeds;
//! whoever drops the count to zero (the sealer itself, or the last reader
//! out) learns it via the return value and runs the teardown.
//!
//! The seal lives at bit 10, which doubles as a deliberately small cap on
//! simultaneous pins — a leak hits the cap long before it hides.

use std::sync::atomic::{AtomicU32, Ordering};

/// Seal bit; also the exclusive upper bound on the pin count.
pub const SEAL: u32 = 1 << 10;

#[derive(Debug, Default)]
pub struct Pinner(AtomicU32);

impl Pinner {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Take a pin. Fails once sealed, and fails at `SEAL - 1` simultaneous
    /// pins.
    pub fn try_pin(&self) -> bool {
        let mut state = self.0.load(Ordering::Relaxed);
        loop {
            if state >= SEAL - 1 {
                return false;
            }
            match self.0.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    /// Seal against new pins. Returns true iff the pin count was zero at the
    /// moment of sealing — the caller then owns the teardown. A second seal
    /// is a no-op returning false.
    pub fn seal(&self) -> bool {
        let mut state = self.0.load(Ordering::Relaxed);
        loop {
            if state >= SEAL {
                return false;
            }
            match self.0.compare_exchange_weak(
                state,
                state + SEAL,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return state == 0,
                Err(current) => state = current,
            }
        }
    }

    /// Release a pin. Returns true iff the pinner is sealed and this was the
    /// last pin out — the caller then owns the teardown.
    pub fn unpin(&self) -> bool {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & (SEAL - 1) != 0, "unpin without a matching pin");
        previous - 1 == SEAL
    }
}
