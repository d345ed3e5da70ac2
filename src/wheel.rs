//! File wheel — the round-robin ring of append-only files.
//!
//! The wheel owns one block file per slot of the file source plus exactly
//! one active writer. Writes land in the current writer's file; when it
//! fills, the writer is retired through the [`BackgroundRecycler`] and the
//! control thread replaces the oldest ring slot with a fresh file whose
//! writer becomes (or queues up to become) current. Two fresh files are
//! created at startup so the first retirement is satisfied without waiting
//! for a flush.
//!
//! Replacing an occupied slot invalidates every block in it through the
//! deletion callback, then waits — via the slot's pinner — for in-flight
//! reads to drain before the file is torn down and recreated.
//!
//! One dedicated control thread drives the wheel: it keeps the current
//! writer's flush cursor close behind its write cursor, and services
//! retirements. Closing a retired writer can block on disk for tens of
//! seconds, so that part runs on a short-lived detached thread.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::addr::BlockAddress;
use crate::block_file::{BlockFile, InvalidAddress};
use crate::cancel::CancelToken;
use crate::file_writer::FileWriter;
use crate::hash::Hash;
use crate::recycler::BackgroundRecycler;
use crate::source::FileSource;

/// Fresh files created at startup; their writers seed the recycler queue.
const WRITER_SLOTS: usize = 2;

/// Attempts before a write is declared larger than one file.
const WRITE_ATTEMPTS: usize = 3;

/// Invoked for every block of a file about to be destroyed, strictly before
/// its memory goes away.
pub type DeletionCallback = Box<dyn Fn(u32, Hash, BlockAddress) + Send + Sync>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WheelError {
    /// Three consecutive fresh files refused the block: it cannot fit in any.
    #[error("block of {length} bytes exceeds the capacity of a single file")]
    WriteTooLarge { length: usize },
    /// The recycler stopped producing writers (shutdown).
    #[error("file wheel is shut down")]
    Closed,
}

pub struct FileWheel {
    shared:  Arc<WheelShared>,
    control: Mutex<Option<JoinHandle<()>>>,
}

struct WheelShared {
    source:      FileSource,
    slots:       Vec<RwLock<Option<Arc<BlockFile>>>>,
    writer:      BackgroundRecycler<FileWriter>,
    /// Ring slot the next retirement will recycle.
    next_alloc:  AtomicUsize,
    on_deletion: DeletionCallback,
    cancel:      CancelToken,
}

impl FileWheel {
    /// Scan the source, install the surviving files, create the two writer
    /// files, and start the control thread.
    pub fn open(
        source: FileSource,
        on_deletion: DeletionCallback,
        cancel: CancelToken,
    ) -> io::Result<Self> {
        let count = source.file_count();
        let slots: Vec<RwLock<Option<Arc<BlockFile>>>> =
            (0..count).map(|_| RwLock::new(None)).collect();

        let shared = Arc::new(WheelShared {
            source,
            slots,
            writer: BackgroundRecycler::new(),
            next_alloc: AtomicUsize::new(WRITER_SLOTS),
            on_deletion,
            cancel,
        });

        for (id, mem) in shared.source.scan_existing_files()? {
            if id < WRITER_SLOTS {
                // The first two slots always start fresh; whatever a previous
                // process left in them is discarded below.
                continue;
            }
            let recovered = BlockFile::recover(mem, (id + 1) as u32);
            debug!("slot {id}: recovered {} blocks", recovered.block_count());
            *shared.slots[id].write() = Some(Arc::new(recovered));
        }

        for pos in 0..WRITER_SLOTS {
            WheelShared::replace_file(&shared, pos)?;
        }

        let control = thread::Builder::new()
            .name("scratch-wheel".into())
            .spawn({
                let shared = shared.clone();
                move || shared.run()
            })?;

        Ok(Self { shared, control: Mutex::new(Some(control)) })
    }

    /// Reserve space for a block in the current writer, retiring full
    /// writers as needed.
    pub fn schedule_write<W>(
        &self,
        realm: u32,
        hash: Hash,
        length: usize,
        write: W,
    ) -> Result<BlockAddress, WheelError>
    where
        W: FnOnce(&mut [u8]) + Send + 'static,
    {
        let mut write = write;
        for _ in 0..WRITE_ATTEMPTS {
            let current = self.shared.writer.get_current().map_err(|_| WheelError::Closed)?;
            match current.try_schedule_write(realm, hash, length, write) {
                Ok(addr) => return Ok(addr),
                Err(returned) => {
                    write = returned;
                    self.shared.writer.request_recycle(&current);
                }
            }
        }
        Err(WheelError::WriteTooLarge { length })
    }

    /// Dispatch a read to the block file the address points into. `Ok(None)`
    /// when the address is absent, its file slot is empty, or the file-level
    /// checks reject the block.
    pub fn try_with_block_at_address<R>(
        &self,
        addr: BlockAddress,
        realm: u32,
        hash: Hash,
        reader: &mut dyn FnMut(&[u8]) -> R,
    ) -> Result<Option<R>, InvalidAddress> {
        if addr.is_none() {
            return Ok(None);
        }
        let slot = addr.file() as usize - 1;
        if slot >= self.shared.slots.len() {
            return Ok(None);
        }
        let block_file = self.shared.slots[slot].read().clone();
        match block_file {
            Some(bf) => bf.try_with_block_at_address(addr, realm, hash, reader),
            None => Ok(None),
        }
    }

    /// Visit every block recovered from disk, file by file in ring order.
    /// Stops early on cancellation.
    pub fn enumerate_recovered_blocks(&self, mut f: impl FnMut(u32, Hash, BlockAddress)) {
        let start = self.shared.next_alloc.load(Ordering::Relaxed);
        for slot in start..self.shared.slots.len() {
            if self.shared.cancel.is_cancelled() {
                return;
            }
            let block_file = self.shared.slots[slot].read().clone();
            if let Some(bf) = block_file {
                for (realm, hash, addr) in bf.enumerate_blocks() {
                    f(realm, hash, addr);
                }
            }
        }
    }

    /// Full (non-fast) flush of the current writer, if any.
    pub fn flush_current(&self) {
        if let Some(writer) = self.shared.writer.try_get_current() {
            writer.flush(false);
        }
    }

    /// Stop and join the control thread. Detached close threads, if any,
    /// finish on their own.
    pub fn dispose(&self) {
        self.shared.cancel.cancel();
        if let Some(handle) = self.control.lock().take() {
            if handle.join().is_err() {
                warn!("wheel control thread panicked");
            }
        }
    }
}

impl Drop for FileWheel {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl WheelShared {
    /// Control loop: keep the current writer flushed, service retirements.
    fn run(self: Arc<Self>) {
        debug!("wheel control thread running");
        while !self.cancel.is_cancelled() {
            let flushed = self
                .writer
                .try_get_current()
                .map_or(false, |writer| writer.flush(true));

            let wait = if flushed { Duration::ZERO } else { Duration::from_secs(1) };
            let Some(spent) = self.writer.try_next_to_be_recycled(wait, &self.cancel) else {
                continue;
            };

            // Closing can block on disk for a long time; never on this thread.
            {
                let for_thread = spent.clone();
                let spawned = thread::Builder::new()
                    .name("scratch-flush".into())
                    .spawn(move || for_thread.flush_and_close());
                if let Err(e) = spawned {
                    warn!("close thread failed to spawn, closing inline: {e}");
                    spent.flush_and_close();
                }
            }

            let pos = self.next_alloc.load(Ordering::Relaxed);
            self.next_alloc
                .store((pos + 1) % self.slots.len(), Ordering::Relaxed);

            let occupant = self.slots[pos].read().clone();
            match occupant {
                None => {
                    if let Err(e) = Self::replace_file(&self, pos) {
                        warn!("failed to replace file {pos}: {e}");
                    }
                }
                Some(block_file) => {
                    // Defer until every outstanding pin drops.
                    let this = self.clone();
                    block_file.request_removal(move || {
                        if let Err(e) = Self::replace_file(&this, pos) {
                            warn!("failed to replace file {pos}: {e}");
                        }
                    });
                }
            }
        }
        debug!("wheel control thread exiting");
    }

    /// Invalidate and destroy whatever occupies ring slot `pos`, recreate
    /// the file, and publish its fresh writer.
    fn replace_file(this: &Arc<Self>, pos: usize) -> io::Result<()> {
        if let Some(old) = this.slots[pos].write().take() {
            for (realm, hash, addr) in old.enumerate_blocks() {
                (this.on_deletion)(realm, hash, addr);
            }
            // The mapping itself goes away with the last Arc, after any
            // reader that got in before the seal returns.
        }

        let mem = this.source.delete_and_create(pos)?;
        let (reader, writer) = FileWriter::create_pair(mem, (pos + 1) as u32);
        *this.slots[pos].write() = Some(Arc::new(reader));
        this.writer.complete_recycle(Arc::new(writer));
        debug!("slot {pos}: fresh file published");
        Ok(())
    }
}
