//! Block format — fixed 32-byte header, aligned payload, no trailing index.
//!
//! # On-disk layout (32 bytes header, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   hash_left       high half of the 128-bit content hash
//!    8      8   hash_right      low half; its low 24 bits are the bucket
//!   16      4   realm           tenant id, only the low 24 bits significant
//!   20      4   rank            i32, 0-based ordinal of the block in its file
//!   24      4   content_length  i32, payload bytes, never negative
//!   28      4   reserved        written as zero, ignored on read
//! ```
//!
//! The hash leads the header so the payload starts 16-byte aligned relative
//! to the block start. The payload follows the header immediately and is
//! padded with undefined bytes up to the next 4096-byte boundary; the next
//! block, if any, begins there.
//!
//! # Validation
//! The header carries no checksum of its own. A header is accepted when its
//! `rank` equals the number of blocks already seen in the file, its
//! `content_length` is non-negative, and header plus payload fit inside the
//! file. Everything past the first header that fails these checks is
//! undefined space. Payload integrity is verified separately against the
//! stored hash on first read after recovery.

use byteorder::{ByteOrder, LittleEndian};

use crate::addr::align_up;
use crate::hash::{Hash, REALM_MASK};
use crate::mem::FileMemory;

/// Fixed byte size of the block header.
pub const HEADER_SIZE: usize = 32;

/// Largest payload a single block may carry.
pub const MAX_BLOCK_LENGTH: usize = i32::MAX as usize - HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash:           Hash,
    pub realm:          u32,
    pub rank:           i32,
    pub content_length: i32,
}

impl BlockHeader {
    /// Serialize into a 32-byte buffer. The realm is masked to 24 bits and
    /// the reserved word is zeroed.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.hash.left);
        LittleEndian::write_u64(&mut buf[8..16], self.hash.right);
        LittleEndian::write_u32(&mut buf[16..20], self.realm & REALM_MASK);
        LittleEndian::write_i32(&mut buf[20..24], self.rank);
        LittleEndian::write_i32(&mut buf[24..28], self.content_length);
        buf
    }

    /// Deserialize from a 32-byte buffer. No validation happens here; the
    /// caller decides whether the decoded fields make sense in context.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            hash: Hash::new(
                LittleEndian::read_u64(&buf[0..8]),
                LittleEndian::read_u64(&buf[8..16]),
            ),
            realm:          LittleEndian::read_u32(&buf[16..20]),
            rank:           LittleEndian::read_i32(&buf[20..24]),
            content_length: LittleEndian::read_i32(&buf[24..28]),
        }
    }

    /// Copy the header at `offset` out of a file memory. The copy tolerates
    /// concurrent writers; a torn read decodes to fields that fail the
    /// caller's validation.
    pub fn read_at(mem: &FileMemory, offset: usize) -> Self {
        let mut buf = [0u8; HEADER_SIZE];
        mem.read_at(offset, &mut buf);
        Self::from_bytes(&buf)
    }

    /// Write the header at `offset`. The range must be reserved for this
    /// writer.
    pub fn write_at(&self, mem: &FileMemory, offset: usize) {
        mem.write_at(offset, &self.to_bytes());
    }

    /// Total on-disk footprint of this block: header, payload, padding.
    #[inline]
    pub fn padded_len(&self) -> usize {
        align_up(HEADER_SIZE + self.content_length as usize)
    }
}
