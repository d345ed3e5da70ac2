//! High-level [`Scratch`] API — the primary embedding surface.
//!
//! ```no_run
//! use scratchbin::{Hash, Scratch, SourceConfig};
//!
//! let scratch = Scratch::open(SourceConfig::single("cache", 4, 1 << 24))?;
//!
//! let payload = b"Hello, world!".to_vec();
//! let hash = Hash::of(&payload);
//! scratch.write(1337, hash, payload.len(), move |buf| buf.copy_from_slice(&payload))?;
//!
//! let bytes = scratch.read(1337, hash, |b| b.to_vec())?;
//! assert_eq!(bytes, b"Hello, world!");
//! # Ok::<(), scratchbin::ScratchError>(())
//! ```
//!
//! A `Scratch` is a cache, not a store: a block that was written may be gone
//! by the time it is read back — its file recycled, or its payload failing
//! verification after a restart. Every such case surfaces as
//! [`ScratchError::MissingBlock`]; the caller regenerates the data and
//! writes it again.

use std::io;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use crate::block::MAX_BLOCK_LENGTH;
use crate::block_file::InvalidAddress;
use crate::cancel::CancelToken;
use crate::hash::{Hash, REALM_MASK};
use crate::index::{BlockIndex, CapacityExceeded};
use crate::source::{ConfigError, FileSource, SourceConfig, SourceError};
use crate::wheel::{FileWheel, WheelError};

// ── Errors ───────────────────────────────────────────────────────────────────

/// Returned by a payload-parsing reader to reject the bytes it was handed.
/// Treated exactly like a missing block: the stale index entry is removed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("payload checksum mismatch")]
pub struct ChecksumError;

#[derive(Debug, Error)]
pub enum ScratchError {
    /// No live block for this key: never written, recycled away, or failed
    /// verification. The entry has already been removed from the index.
    #[error("no block for realm {realm}, hash {hash}")]
    MissingBlock { realm: u32, hash: Hash },
    /// The reader rejected the payload via [`ChecksumError`] on every
    /// attempt. The entry has already been removed from the index.
    #[error("payload rejected for realm {realm}, hash {hash}")]
    ChecksumFailed { realm: u32, hash: Hash },
    #[error(transparent)]
    Capacity(#[from] CapacityExceeded),
    #[error("block of {length} bytes exceeds the capacity of a single file")]
    WriteTooLarge { length: usize },
    /// A block address was dispatched to the wrong file — a programming bug,
    /// not a data condition.
    #[error(transparent)]
    InvalidAddress(#[from] InvalidAddress),
    #[error("scratch is shut down")]
    Shutdown,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<WheelError> for ScratchError {
    fn from(e: WheelError) -> Self {
        match e {
            WheelError::WriteTooLarge { length } => ScratchError::WriteTooLarge { length },
            WheelError::Closed => ScratchError::Shutdown,
        }
    }
}

impl From<SourceError> for ScratchError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Config(c) => ScratchError::Config(c),
            SourceError::Io(io) => ScratchError::Io(io),
        }
    }
}

// ── Scratch ──────────────────────────────────────────────────────────────────

pub struct Scratch {
    index:  Arc<BlockIndex>,
    wheel:  FileWheel,
    cancel: CancelToken,
}

impl Scratch {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Open (or re-open) the cache at the configured location, rediscovering
    /// any blocks left in its files.
    pub fn open(config: SourceConfig) -> Result<Self, ScratchError> {
        Self::open_with_cancel(config, CancelToken::new())
    }

    /// Like [`Scratch::open`], with an external token that stops the
    /// background thread when cancelled.
    pub fn open_with_cancel(
        config: SourceConfig,
        cancel: CancelToken,
    ) -> Result<Self, ScratchError> {
        let source = FileSource::open(config)?;
        let index = Arc::new(BlockIndex::new());

        let deletion_index = index.clone();
        let wheel = FileWheel::open(
            source,
            Box::new(move |realm, hash, addr| deletion_index.remove(realm, hash, addr)),
            cancel.clone(),
        )?;

        let mut primed = 0u64;
        let mut dropped = 0u64;
        wheel.enumerate_recovered_blocks(|realm, hash, addr| {
            match index.add(realm, hash, addr) {
                Ok(_) => primed += 1,
                Err(_) => dropped += 1,
            }
        });
        if dropped > 0 {
            warn!("dropped {dropped} recovered blocks: index full");
        }
        debug!("primed index with {primed} recovered blocks");

        Ok(Self { index, wheel, cancel })
    }

    // ── Write ────────────────────────────────────────────────────────────────

    /// Reserve a block for (realm, hash) and register it in the index.
    ///
    /// `writer` fills the payload, but not here: it runs on whichever thread
    /// first needs the bytes — the first reader, or the background flush.
    /// The payload it produces must hash to `hash`, or the block will fail
    /// verification after a restart.
    pub fn write(
        &self,
        realm: u32,
        hash: Hash,
        length: usize,
        writer: impl FnOnce(&mut [u8]) + Send + 'static,
    ) -> Result<(), ScratchError> {
        let realm = realm & REALM_MASK;
        if length > MAX_BLOCK_LENGTH {
            return Err(ScratchError::WriteTooLarge { length });
        }
        let addr = self.wheel.schedule_write(realm, hash, length, writer)?;
        self.index.add(realm, hash, addr)?;
        Ok(())
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    /// Hand the block's payload to `reader` and return its result.
    pub fn read<R>(
        &self,
        realm: u32,
        hash: Hash,
        reader: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ScratchError> {
        let mut reader = Some(reader);
        self.try_read(realm, hash, move |bytes| match reader.take() {
            Some(f) => Ok(f(bytes)),
            None => Err(ChecksumError),
        })
    }

    /// Like [`Scratch::read`], for readers that parse the payload and may
    /// reject it: a [`ChecksumError`] drops the index entry and the lookup
    /// is retried once through the index before giving up.
    pub fn try_read<R>(
        &self,
        realm: u32,
        hash: Hash,
        mut reader: impl FnMut(&[u8]) -> Result<R, ChecksumError>,
    ) -> Result<R, ScratchError> {
        let realm = realm & REALM_MASK;
        let mut rejected = false;

        for _ in 0..2 {
            let addr = self.index.get(realm, hash);
            if addr.is_none() {
                break;
            }
            let mut verdict = None;
            let present = self.wheel.try_with_block_at_address(addr, realm, hash, &mut |bytes| {
                verdict = Some(reader(bytes));
            })?;
            match (present, verdict) {
                (Some(()), Some(Ok(value))) => return Ok(value),
                (Some(()), _) => {
                    rejected = true;
                    warn!("payload rejected for realm {realm}, hash {hash}; dropping entry");
                    self.index.remove(realm, hash, addr);
                }
                (None, _) => {
                    // Recycled or failed verification: drop the stale entry
                    // and re-read the index in case the key was re-written.
                    self.index.remove(realm, hash, addr);
                }
            }
        }

        Err(if rejected {
            ScratchError::ChecksumFailed { realm, hash }
        } else {
            ScratchError::MissingBlock { realm, hash }
        })
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────────

    /// Whether the index currently records a block for this key. The next
    /// read may still miss — the block can be recycled in between.
    pub fn contains(&self, realm: u32, hash: Hash) -> bool {
        !self.index.get(realm & REALM_MASK, hash).is_none()
    }

    /// Forget the current block for this key, if any. The bytes stay on
    /// disk until their file is recycled.
    pub fn remove(&self, realm: u32, hash: Hash) {
        let realm = realm & REALM_MASK;
        let addr = self.index.get(realm, hash);
        if !addr.is_none() {
            self.index.remove(realm, hash, addr);
        }
    }

    /// Number of live blocks in the index.
    pub fn count(&self) -> i32 {
        self.index.count()
    }

    /// Materialize every scheduled payload and push it to durable storage.
    pub fn flush(&self) {
        self.wheel.flush_current();
    }

    /// Stop the background thread and flush what the current writer holds.
    /// Dropping the scratch does the same.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.wheel.dispose();
        self.wheel.flush_current();
    }
}
