//! Block file — pinned, verified read access to one data file.
//!
//! A block file wraps one mapped file and the list of read flags for its
//! blocks. It comes into existence two ways:
//!
//! - **Recovery**: scanning an existing file forward from offset 0. Each
//!   well-formed header appends a flag whose action re-hashes the payload
//!   against the stored hash; the walk stops at the first malformed header
//!   and everything past it is treated as undefined space. An untouched
//!   (all-zero) file yields exactly one empty block: the zero header has
//!   rank 0, length 0 and the zero hash, which is the valid empty-state
//!   marker — its verification then fails on first read, so the block never
//!   surfaces.
//! - **Paired with a writer**: [`crate::file_writer::FileWriter::create_pair`]
//!   hands both halves the same memory and flag list; blocks appear here as
//!   the writer appends them.
//!
//! Reads pin the file for their duration. Once removal is requested and the
//! pin count reaches zero, the stored callback tears the file down.

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

use crate::addr::{align_up, BlockAddress};
use crate::append_list::AppendList;
use crate::block::{BlockHeader, HEADER_SIZE};
use crate::hash::{Hash, REALM_MASK};
use crate::mem::FileMemory;
use crate::pin::Pinner;
use crate::read_flag::{FlagError, ReadFlag};

/// The address named a different file than this one — a caller bug, never a
/// data race.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("address names file {addressed}, but this block file is {file_id}")]
pub struct InvalidAddress {
    pub addressed: u32,
    pub file_id:   u32,
}

type RemovalCallback = Box<dyn FnOnce() + Send>;

pub struct BlockFile {
    mem:     Arc<FileMemory>,
    flags:   Arc<AppendList<ReadFlag>>,
    file_id: u32,
    pinner:  Pinner,
    removal: Mutex<Option<RemovalCallback>>,
}

impl BlockFile {
    pub(crate) fn shared(
        mem: Arc<FileMemory>,
        flags: Arc<AppendList<ReadFlag>>,
        file_id: u32,
    ) -> Self {
        Self {
            mem,
            flags,
            file_id,
            pinner: Pinner::new(),
            removal: Mutex::new(None),
        }
    }

    /// Rediscover the blocks left in an existing file.
    pub fn recover(mem: FileMemory, file_id: u32) -> Self {
        let mem = Arc::new(mem);
        let flags = Arc::new(AppendList::new());

        let mut offset = 0usize;
        while offset + HEADER_SIZE <= mem.len() {
            let header = BlockHeader::read_at(&mem, offset);
            if header.rank != flags.len() as i32
                || header.content_length < 0
                || offset + HEADER_SIZE + header.content_length as usize > mem.len()
            {
                break;
            }

            let expected = header.hash;
            let payload_offset = offset + HEADER_SIZE;
            let payload_len = header.content_length as usize;
            let header_offset = offset as u64;
            let verify_mem = mem.clone();
            flags.append(ReadFlag::pending(move || {
                // The file has no writer: the payload range is stable.
                let payload = unsafe { verify_mem.slice(payload_offset, payload_len) };
                let actual = Hash::of(payload);
                if actual == expected {
                    Ok(())
                } else {
                    Err(FlagError::InvalidHash {
                        file_id,
                        offset: header_offset,
                        expected,
                        actual,
                    })
                }
            }));

            offset = align_up(offset + HEADER_SIZE + header.content_length as usize);
        }

        Self::shared(mem, flags, file_id)
    }

    #[inline]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Number of blocks currently known to this file.
    pub fn block_count(&self) -> usize {
        self.flags.len()
    }

    /// Walk every block currently known, in file order, yielding
    /// (realm, hash, address). Headers are only decoded, never verified; the
    /// walk ends early at anything malformed.
    pub fn enumerate_blocks(&self) -> impl Iterator<Item = (u32, Hash, BlockAddress)> + '_ {
        let known = self.flags.len();
        let mut offset = 0usize;
        let mut rank = 0usize;
        std::iter::from_fn(move || {
            if rank >= known || offset + HEADER_SIZE > self.mem.len() {
                return None;
            }
            let header = BlockHeader::read_at(&self.mem, offset);
            if header.rank != rank as i32
                || header.content_length < 0
                || offset + HEADER_SIZE + header.content_length as usize > self.mem.len()
            {
                return None;
            }
            let item = (
                header.realm,
                header.hash,
                BlockAddress::new(self.file_id, offset as u64),
            );
            rank += 1;
            offset = align_up(offset + HEADER_SIZE + header.content_length as usize);
            Some(item)
        })
    }

    /// Pin the file and hand `reader` a view of the block at `addr`, if it
    /// carries the expected realm and hash and its payload is readable.
    ///
    /// `Ok(None)` covers every tolerated failure: the file could not be
    /// pinned (sealed for removal), the header does not match the requested
    /// identity (stale index entry), or the block failed verification.
    pub fn try_with_block_at_address<R>(
        &self,
        addr: BlockAddress,
        realm: u32,
        hash: Hash,
        reader: &mut dyn FnMut(&[u8]) -> R,
    ) -> Result<Option<R>, InvalidAddress> {
        if addr.file() != self.file_id {
            return Err(InvalidAddress { addressed: addr.file(), file_id: self.file_id });
        }
        if !self.pinner.try_pin() {
            return Ok(None);
        }
        let out = self.with_pinned(addr, realm, hash, reader);
        if self.pinner.unpin() {
            self.invoke_removal();
        }
        Ok(out)
    }

    fn with_pinned<R>(
        &self,
        addr: BlockAddress,
        realm: u32,
        hash: Hash,
        reader: &mut dyn FnMut(&[u8]) -> R,
    ) -> Option<R> {
        let offset = addr.offset() as usize;
        if offset + HEADER_SIZE > self.mem.len() {
            return None;
        }
        let header = BlockHeader::read_at(&self.mem, offset);
        if header.realm != realm & REALM_MASK || header.hash != hash {
            return None;
        }
        if header.content_length < 0
            || offset + HEADER_SIZE + header.content_length as usize > self.mem.len()
        {
            return None;
        }
        let flag = self.flags.get(usize::try_from(header.rank).ok()?)?;
        if let Err(e) = flag.wait_until_readable() {
            warn!("block at file {} offset {offset} is unreadable: {e}", self.file_id);
            return None;
        }
        // Flag completed: the payload range is stable from here on.
        let payload =
            unsafe { self.mem.slice(offset + HEADER_SIZE, header.content_length as usize) };
        Some(reader(payload))
    }

    /// Arrange for `callback` to run once no pins remain, and stop new pins.
    /// Runs it synchronously when the pin count is already zero.
    ///
    /// The callback must be stored before the seal: a concurrent last unpin
    /// may fire the teardown the instant the seal lands.
    pub fn request_removal(&self, callback: impl FnOnce() + Send + 'static) {
        *self.removal.lock() = Some(Box::new(callback));
        if self.pinner.seal() {
            self.invoke_removal();
        }
    }

    fn invoke_removal(&self) {
        if let Some(callback) = self.removal.lock().take() {
            callback();
        }
    }
}
