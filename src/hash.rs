//! 128-bit content hash — the identity of every block.
//!
//! The hash is treated as two 64-bit halves throughout: the index stores the
//! halves in separate words, the on-disk header serializes them back to back,
//! and the low 24 bits of the right half double as the index bucket number.
//! Equality is bitwise; no ordering is ever needed.

use std::fmt;

/// Only the low 24 bits of a realm are significant anywhere in the system.
pub const REALM_MASK: u32 = 0x00FF_FFFF;

/// Mask selecting the bucket number out of `Hash::right`.
pub const BUCKET_MASK: u64 = 0x00FF_FFFF;

/// A 128-bit non-cryptographic content hash, split into two 64-bit halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash {
    pub left:  u64,
    pub right: u64,
}

impl Hash {
    pub const ZERO: Hash = Hash { left: 0, right: 0 };

    #[inline]
    pub const fn new(left: u64, right: u64) -> Self {
        Self { left, right }
    }

    /// Hash a byte slice with XXH3-128. The high half of the digest becomes
    /// `left`, the low half `right`.
    pub fn of(data: &[u8]) -> Self {
        let digest = xxhash_rust::xxh3::xxh3_128(data);
        Self {
            left:  (digest >> 64) as u64,
            right: digest as u64,
        }
    }

    /// The index bucket anchored by this hash: the low 24 bits of the right
    /// half.
    #[inline]
    pub const fn bucket(self) -> u32 {
        (self.right & BUCKET_MASK) as u32
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.left, self.right)
    }
}
