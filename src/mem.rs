//! File memory — a fixed-length memory-mapped byte region backing one file.
//!
//! One region is shared between exactly one appending writer and any number
//! of readers. They never contend for the same bytes at the same time under
//! the block protocol:
//!
//! - a payload range is written exactly once, by whichever thread runs the
//!   block's read flag first, and only read after the flag completes;
//! - a header range is written once by the scheduling thread before the
//!   address escapes, and only decoded defensively afterwards (a stale index
//!   entry can race a recycled file's new writer — the decoded fields then
//!   fail validation and the block reads as absent).
//!
//! Access therefore goes through raw pointers rather than `&[u8]`/`&mut [u8]`
//! over the whole map: disjoint ranges may be written and read concurrently,
//! and the two racy-copy entry points ([`FileMemory::read_at`] and
//! [`FileMemory::write_at`]) never materialize references at all.

use std::fs::File;
use std::io;
use std::ptr;

use memmap2::MmapMut;

pub struct FileMemory {
    map: MmapMut,
    ptr: *mut u8,
}

// The raw pointer aliases the mapping owned by `map`; range discipline is
// the callers' contract documented above.
unsafe impl Send for FileMemory {}
unsafe impl Sync for FileMemory {}

impl FileMemory {
    /// Map the whole of `file` read-write. The file's length is fixed for
    /// the lifetime of the mapping.
    pub fn map(file: &File) -> io::Result<Self> {
        let mut map = unsafe { MmapMut::map_mut(file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self { map, ptr })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`. The range may
    /// race a writer; the caller must treat the copied bytes as untrusted.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len());
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy `bytes` into the region at `offset`. The range must be reserved
    /// for the calling writer.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len());
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    /// Borrow a range for reading.
    ///
    /// # Safety
    /// No thread may write the range while the returned slice is alive. Under
    /// the block protocol this holds for any payload range whose read flag
    /// has completed.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len());
        std::slice::from_raw_parts(self.ptr.add(offset), len)
    }

    /// Borrow a range for writing.
    ///
    /// # Safety
    /// The range must be exclusively reserved for the caller: no other thread
    /// may read or write it while the returned slice is alive. Under the
    /// block protocol this holds for a payload range between its reservation
    /// and its read flag completing.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len());
        std::slice::from_raw_parts_mut(self.ptr.add(offset), len)
    }

    /// Flush `[offset, offset + len)` to durable storage.
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.map.flush_range(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn fixture(len: u64) -> FileMemory {
        let file = tempfile().unwrap();
        file.set_len(len).unwrap();
        FileMemory::map(&file).unwrap()
    }

    #[test]
    fn fresh_mapping_is_zeroed() {
        let mem = fixture(8192);
        assert_eq!(mem.len(), 8192);
        let mut buf = [0xAAu8; 64];
        mem.read_at(4096, &mut buf);
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn writes_are_visible_to_reads() {
        let mem = fixture(4096);
        mem.write_at(100, b"scratch");
        let mut buf = [0u8; 7];
        mem.read_at(100, &mut buf);
        assert_eq!(&buf, b"scratch");
        assert_eq!(unsafe { mem.slice(100, 7) }, b"scratch");
    }

    #[test]
    fn slice_mut_fills_a_reserved_range() {
        let mem = fixture(4096);
        unsafe { mem.slice_mut(0, 4).copy_from_slice(b"abcd") };
        let mut buf = [0u8; 4];
        mem.read_at(0, &mut buf);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn flush_range_succeeds_on_a_real_file() {
        let mem = fixture(8192);
        mem.write_at(0, b"durable");
        mem.flush_range(0, 4096).unwrap();
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_write_panics() {
        let mem = fixture(4096);
        mem.write_at(4090, b"overflow!");
    }
}
