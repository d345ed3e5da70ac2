//! File writer — appends blocks into one file.
//!
//! Scheduling a write reserves space and publishes the header immediately;
//! the payload itself is produced later, by whoever first needs it: the
//! first reader of the block, or the background flush. The deferred copy
//! lives in the block's read flag, so the "first one wins, everyone else
//! waits" discipline comes for free.
//!
//! The writer and its paired [`BlockFile`] share the same memory and flag
//! list; a block scheduled here is readable through the pair the moment the
//! index learns its address.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::addr::{align_up, BlockAddress};
use crate::append_list::AppendList;
use crate::block::{BlockHeader, HEADER_SIZE};
use crate::block_file::BlockFile;
use crate::hash::{Hash, REALM_MASK};
use crate::mem::FileMemory;
use crate::read_flag::ReadFlag;

/// Most bytes a fast flush will push per call, to keep the background
/// thread's latency bounded.
const FAST_FLUSH_WINDOW: usize = 2 * 1024 * 1024;

struct Cursors {
    /// End of the reserved region; the next block starts here.
    offset:       usize,
    /// Everything below this has been handed to the OS for durable storage.
    flush_offset: usize,
}

pub struct FileWriter {
    mem:     Arc<FileMemory>,
    flags:   Arc<AppendList<ReadFlag>>,
    file_id: u32,
    cursors: Mutex<Cursors>,
}

impl FileWriter {
    /// Build the writer and its reading half over the same fresh memory.
    pub fn create_pair(mem: FileMemory, file_id: u32) -> (BlockFile, FileWriter) {
        let mem = Arc::new(mem);
        let flags = Arc::new(AppendList::new());
        let reader = BlockFile::shared(mem.clone(), flags.clone(), file_id);
        let writer = FileWriter {
            mem,
            flags,
            file_id,
            cursors: Mutex::new(Cursors { offset: 0, flush_offset: 0 }),
        };
        (reader, writer)
    }

    #[inline]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Reserve space for a block of `length` payload bytes and publish its
    /// header. The payload is filled in later by `write` — on first read or
    /// during a flush, whichever comes first.
    ///
    /// Returns the callback unconsumed when the block does not fit; the file
    /// is then marked full and will never accept another block.
    pub fn try_schedule_write<W>(
        &self,
        realm: u32,
        hash: Hash,
        length: usize,
        write: W,
    ) -> Result<BlockAddress, W>
    where
        W: FnOnce(&mut [u8]) + Send + 'static,
    {
        let start;
        let rank;
        {
            let mut cursors = self.cursors.lock();
            let end = align_up(cursors.offset + HEADER_SIZE + length);
            if end > self.mem.len() {
                // Full: park the cursor at the end so later attempts fail
                // without recomputing.
                cursors.offset = self.mem.len();
                return Err(write);
            }
            start = cursors.offset;
            cursors.offset = end;
            rank = self.flags.len() as i32;

            let payload_offset = start + HEADER_SIZE;
            let mem = self.mem.clone();
            self.flags.append(ReadFlag::pending(move || {
                // Reserved and untouched until this flag runs exactly once.
                write(unsafe { mem.slice_mut(payload_offset, length) });
                Ok(())
            }));
        }

        let header = BlockHeader {
            hash,
            realm: realm & REALM_MASK,
            rank,
            content_length: length as i32,
        };
        header.write_at(&self.mem, start);
        Ok(BlockAddress::new(self.file_id, start as u64))
    }

    /// Materialize every pending payload and push unflushed bytes to durable
    /// storage. With `fast`, at most [`FAST_FLUSH_WINDOW`] bytes are pushed.
    ///
    /// Returns whether any work was done. I/O failures are logged and
    /// swallowed; affected blocks re-raise when read.
    pub fn flush(&self, fast: bool) -> bool {
        let (from, to, count) = {
            let cursors = self.cursors.lock();
            (cursors.flush_offset, cursors.offset, self.flags.len())
        };
        if from >= to {
            return false;
        }

        for rank in 0..count {
            if let Some(flag) = self.flags.get(rank) {
                if let Err(e) = flag.wait_until_readable() {
                    debug!("file {}: block {rank} failed while flushing: {e}", self.file_id);
                }
            }
        }

        let mut todo = to - from;
        if fast {
            todo = todo.min(FAST_FLUSH_WINDOW);
        }
        if let Err(e) = self.mem.flush_range(from, todo) {
            warn!("file {}: flush of [{from}, {}) failed: {e}", self.file_id, from + todo);
        }
        self.cursors.lock().flush_offset = from + todo;
        true
    }

    /// Refuse further writes, then materialize and persist everything.
    pub fn flush_and_close(&self) {
        self.cursors.lock().offset = self.mem.len();
        self.flush(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::BLOCK_ALIGN;
    use tempfile::tempfile;

    fn pair(len: u64, file_id: u32) -> (BlockFile, FileWriter) {
        let file = tempfile().unwrap();
        file.set_len(len).unwrap();
        FileWriter::create_pair(FileMemory::map(&file).unwrap(), file_id)
    }

    fn read_back(reader: &BlockFile, addr: BlockAddress, realm: u32, hash: Hash) -> Option<Vec<u8>> {
        reader
            .try_with_block_at_address(addr, realm, hash, &mut |b: &[u8]| b.to_vec())
            .unwrap()
    }

    #[test]
    fn scheduled_block_reads_back_through_the_pair() {
        let (reader, writer) = pair(64 * 1024, 1);
        let payload = b"Hello, world!".to_vec();
        let hash = Hash::of(&payload);

        let addr = writer
            .try_schedule_write(1337, hash, payload.len(), {
                let payload = payload.clone();
                move |buf: &mut [u8]| buf.copy_from_slice(&payload)
            })
            .unwrap_or_else(|_| panic!("block must fit"));
        assert_eq!(addr, BlockAddress::new(1, 0));

        assert_eq!(read_back(&reader, addr, 1337, hash).as_deref(), Some(&payload[..]));

        let blocks: Vec<_> = reader.enumerate_blocks().collect();
        assert_eq!(blocks, vec![(1337, hash, addr)]);
    }

    #[test]
    fn consecutive_blocks_land_on_aligned_offsets() {
        let (reader, writer) = pair(64 * 1024, 1);
        let first = b"first".to_vec();
        let second = vec![7u8; 5000];
        let (h1, h2) = (Hash::of(&first), Hash::of(&second));

        let a1 = writer
            .try_schedule_write(1, h1, first.len(), {
                let first = first.clone();
                move |buf: &mut [u8]| buf.copy_from_slice(&first)
            })
            .unwrap_or_else(|_| panic!("fits"));
        let a2 = writer
            .try_schedule_write(1, h2, second.len(), {
                let second = second.clone();
                move |buf: &mut [u8]| buf.copy_from_slice(&second)
            })
            .unwrap_or_else(|_| panic!("fits"));

        assert_eq!(a1.offset(), 0);
        assert_eq!(a2.offset(), BLOCK_ALIGN as u64);

        // Both verify independently, in either order.
        assert_eq!(read_back(&reader, a2, 1, h2).as_deref(), Some(&second[..]));
        assert_eq!(read_back(&reader, a1, 1, h1).as_deref(), Some(&first[..]));
    }

    #[test]
    fn oversized_block_returns_the_callback_and_marks_full() {
        let (_, writer) = pair(2 * BLOCK_ALIGN as u64, 1);
        let too_big = vec![0u8; 3 * BLOCK_ALIGN];
        let hash = Hash::of(&too_big);

        let err = writer.try_schedule_write(1, hash, too_big.len(), move |buf: &mut [u8]| {
            buf.copy_from_slice(&too_big)
        });
        assert!(err.is_err());

        // The file is now full even for blocks that would have fit.
        let small = writer.try_schedule_write(1, Hash::of(b"x"), 1, |buf: &mut [u8]| buf[0] = b'x');
        assert!(small.is_err());
    }

    #[test]
    fn flush_materializes_deferred_payloads() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let (reader, writer) = pair(64 * 1024, 1);
        let ran = Arc::new(AtomicBool::new(false));
        let hash = Hash::of(b"deferred");

        let ran2 = ran.clone();
        let addr = writer
            .try_schedule_write(1, hash, 8, move |buf: &mut [u8]| {
                ran2.store(true, Ordering::SeqCst);
                buf.copy_from_slice(b"deferred");
            })
            .unwrap_or_else(|_| panic!("fits"));

        // Scheduling alone must not run the callback.
        assert!(!ran.load(Ordering::SeqCst));
        assert!(writer.flush(true));
        assert!(ran.load(Ordering::SeqCst));

        // Nothing left to flush.
        assert!(!writer.flush(true));

        assert_eq!(read_back(&reader, addr, 1, hash).as_deref(), Some(&b"deferred"[..]));
    }

    #[test]
    fn close_refuses_new_writes() {
        let (_, writer) = pair(64 * 1024, 1);
        let addr = writer.try_schedule_write(1, Hash::of(b"a"), 1, |buf: &mut [u8]| buf[0] = b'a');
        assert!(addr.is_ok());

        writer.flush_and_close();
        let after = writer.try_schedule_write(1, Hash::of(b"b"), 1, |buf: &mut [u8]| buf[0] = b'b');
        assert!(after.is_err());
    }
}
