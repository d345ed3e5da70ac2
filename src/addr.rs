//! Packed 32-bit block addresses.
//!
//! An address names a block by (file id, byte offset) in a single u32:
//!
//! ```text
//! packed = file + (offset / 4096) × 1024
//! ```
//!
//! File ids run from 1 to 1023 inclusive, so `packed % 1024` recovers the
//! file and `packed / 1024` the offset in 4096-byte units. Zero is reserved
//! as the absent address — no valid block ever packs to zero because file
//! ids start at 1. The packing caps file sizes at
//! `⌈2^32 / 1024⌉ × 4096 = 16 GiB`.

/// Every block starts on a multiple of this many bytes.
pub const BLOCK_ALIGN: usize = 4096;

/// Highest permitted file id (file ids are 1-based; 0 would alias the
/// absent address).
pub const MAX_FILE_COUNT: u32 = 1023;

/// Modulus used by the packing; one more than the highest file id.
const FILE_MODULUS: u32 = MAX_FILE_COUNT + 1;

/// Largest file length the address packing can span: 16 GiB.
pub const MAX_FILE_SIZE: u64 = ((1u64 << 32) / FILE_MODULUS as u64) * BLOCK_ALIGN as u64;

/// Round `n` up to the next multiple of [`BLOCK_ALIGN`].
#[inline]
pub const fn align_up(n: usize) -> usize {
    (n + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// Packed (file id, offset) pair; `NONE` (all zeros) means absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddress(u32);

impl BlockAddress {
    pub const NONE: BlockAddress = BlockAddress(0);

    /// Pack a 1-based file id and a block-aligned byte offset.
    #[inline]
    pub fn new(file: u32, offset: u64) -> Self {
        debug_assert!(file >= 1 && file <= MAX_FILE_COUNT);
        debug_assert!(offset % BLOCK_ALIGN as u64 == 0);
        debug_assert!(offset < MAX_FILE_SIZE);
        let units = (offset / BLOCK_ALIGN as u64) as u32;
        Self(file + units * FILE_MODULUS)
    }

    #[inline]
    pub const fn from_packed(packed: u32) -> Self {
        Self(packed)
    }

    #[inline]
    pub const fn packed(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The 1-based file id, or 0 for `NONE`.
    #[inline]
    pub const fn file(self) -> u32 {
        self.0 % FILE_MODULUS
    }

    /// Byte offset within the file.
    #[inline]
    pub const fn offset(self) -> u64 {
        (self.0 / FILE_MODULUS) as u64 * BLOCK_ALIGN as u64
    }
}
