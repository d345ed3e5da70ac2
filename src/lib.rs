//! # scratchbin — disk-backed content-addressed scratch cache
//!
//! Spills large opaque byte blocks from RAM to disk, reclaims space by
//! recycling the oldest file, and rediscovers blocks left on disk across
//! restarts. Blocks are keyed by (realm, hash), write-once, read-many.
//!
//! Standing guarantees:
//! - All on-disk numeric fields are little-endian; blocks start on 4096-byte
//!   boundaries and carry a fixed 32-byte header
//! - A block's payload is written at most once, by whichever thread first
//!   needs it; readers never observe partial payloads
//! - Recovered blocks are re-hashed against their stored hash before the
//!   first read; a mismatch makes the block permanently absent
//! - Index reads are lock-free; every tolerated race resolves to "not
//!   present", never to wrong bytes
//! - Eviction is whole-file only: the oldest file's blocks are invalidated
//!   in the index strictly before its memory goes away
//! - Nothing is durable before a flush; there is no journal

pub mod addr;
pub mod hash;
pub mod block;
pub mod mem;
pub mod source;
pub mod pin;
pub mod append_list;
pub mod read_flag;
pub mod block_file;
pub mod file_writer;
pub mod cancel;
pub mod recycler;
pub mod wheel;
pub mod index;
pub mod scratch;

// Flat re-exports for the most common types.
pub use addr::{BlockAddress, BLOCK_ALIGN, MAX_FILE_COUNT, MAX_FILE_SIZE};
pub use block::{BlockHeader, HEADER_SIZE, MAX_BLOCK_LENGTH};
pub use block_file::{BlockFile, InvalidAddress};
pub use cancel::CancelToken;
pub use hash::{Hash, REALM_MASK};
pub use index::{BlockIndex, CapacityExceeded, EntryKey, INDEX_CAPACITY};
pub use scratch::{ChecksumError, Scratch, ScratchError};
pub use source::{ConfigError, SourceConfig};
