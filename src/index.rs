//! Block index — (realm, hash) → block address, lock-free reads.
//!
//! A fixed table of 2^24 slots, allocated once and never resized. Every slot
//! is simultaneously a potential entry and the anchor of one bucket: the
//! bucket of a hash is the low 24 bits of its right half, and that bucket's
//! chain head lives in the slot with the same number. Entries of a chain may
//! sit in any slot.
//!
//! # Slot layout
//!
//! ```text
//! hash_left         u64   high half of the key
//! hash_right_realm  u64   low half, its low 24 bits replaced by the realm
//! first_in_bucket   i32   head of the chain anchored at this slot, -1 if none
//! next_in_bucket    i32   successor in this entry's chain, or in the free list
//! address           u32   packed block address; 0 marks the slot dead
//! ```
//!
//! The low 24 bits of `hash_right` are redundant with the slot's bucket
//! number, which is how the realm fits without widening the key. A parallel
//! `prev_in_bucket` array backs the doubly linked lists; it lives inside the
//! writer mutex because readers never walk backwards.
//!
//! # Concurrency
//!
//! `add` and `remove` serialize on one mutex — the write rate is assumed far
//! below the read rate. `get` walks chains with plain atomic loads and
//! tolerates two races, both resolved by the caller treating the answer as
//! "not present": it may catch a slot whose key is set but whose address is
//! still zero (writer mid-insert), and it may return an address that a
//! concurrent remove/re-add cycle has re-purposed (the file-side realm/hash
//! check rejects it). Freed slots go to the free list's *tail* so a reader
//! that observed the old key sees `address == 0` long before the slot can be
//! re-issued with a new key.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::addr::BlockAddress;
use crate::hash::{Hash, REALM_MASK};

/// Slot count; also the number of buckets.
pub const INDEX_CAPACITY: usize = 1 << 24;

const NO_SLOT: i32 = -1;

/// How many slots after the bucket anchor an insert probes before falling
/// back to the free list, to keep chains within a cache line or two.
const NEARBY_PROBES: usize = 3;

#[derive(Debug, Error)]
#[error("block index is full ({INDEX_CAPACITY} live entries)")]
pub struct CapacityExceeded;

// ── Key compression ──────────────────────────────────────────────────────────

/// A (hash, realm) pair in 16 bytes: the low 24 bits of the hash's right
/// half are implied by the bucket, so the realm takes their place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryKey {
    pub left:             u64,
    pub right_with_realm: u64,
}

impl EntryKey {
    #[inline]
    pub fn new(hash: Hash, realm: u32) -> Self {
        Self {
            left:             hash.left,
            right_with_realm: (hash.right & !(REALM_MASK as u64))
                | (realm & REALM_MASK) as u64,
        }
    }

    #[inline]
    pub fn realm(self) -> u32 {
        (self.right_with_realm & REALM_MASK as u64) as u32
    }

    /// Reconstruct the full hash given the bucket the key was found in.
    /// Diagnostics only; lookups compare compressed keys directly.
    #[inline]
    pub fn hash(self, bucket: u32) -> Hash {
        Hash::new(
            self.left,
            (self.right_with_realm & !(REALM_MASK as u64)) | bucket as u64,
        )
    }
}

// ── Slots ────────────────────────────────────────────────────────────────────

#[repr(C)]
struct Slot {
    hash_left:        AtomicU64,
    hash_right_realm: AtomicU64,
    first_in_bucket:  AtomicI32,
    next_in_bucket:   AtomicI32,
    address:          AtomicU32,
    // Padded to 32 bytes by the ABI; the 64-bit words stay aligned so key
    // loads cannot tear.
}

impl Slot {
    fn free(next: i32) -> Self {
        Self {
            hash_left:        AtomicU64::new(0),
            hash_right_realm: AtomicU64::new(0),
            first_in_bucket:  AtomicI32::new(NO_SLOT),
            next_in_bucket:   AtomicI32::new(next),
            address:          AtomicU32::new(0),
        }
    }

    #[inline]
    fn key_matches(&self, key: EntryKey) -> bool {
        self.hash_left.load(Ordering::Relaxed) == key.left
            && self.hash_right_realm.load(Ordering::Relaxed) == key.right_with_realm
    }
}

/// Writer-side linkage: back-pointers and the free-list ends. Guarded by the
/// index mutex so the hot read path never touches it.
struct Links {
    prev_in_bucket: Box<[i32]>,
    free_head:      i32,
    free_tail:      i32,
}

pub struct BlockIndex {
    slots: Box<[Slot]>,
    links: Mutex<Links>,
    count: AtomicI32,
}

impl BlockIndex {
    /// Allocate the table with every slot chained on the free list in slot
    /// order. Costs ~0.5 GiB resident.
    pub fn new() -> Self {
        let slots: Box<[Slot]> = (0..INDEX_CAPACITY)
            .map(|i| {
                let next = if i + 1 < INDEX_CAPACITY { (i + 1) as i32 } else { NO_SLOT };
                Slot::free(next)
            })
            .collect();
        let prev_in_bucket: Box<[i32]> =
            (0..INDEX_CAPACITY).map(|i| i as i32 - 1).collect();
        Self {
            slots,
            links: Mutex::new(Links {
                prev_in_bucket,
                free_head: 0,
                free_tail: (INDEX_CAPACITY - 1) as i32,
            }),
            count: AtomicI32::new(0),
        }
    }

    /// Live entry count.
    #[inline]
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }

    // ── Reads (lock-free) ────────────────────────────────────────────────────

    /// Look up the address recorded for (realm, hash); `NONE` when absent.
    pub fn get(&self, realm: u32, hash: Hash) -> BlockAddress {
        let key = EntryKey::new(hash, realm);
        let bucket = hash.bucket() as usize;

        let mut slot = self.slots[bucket].first_in_bucket.load(Ordering::Acquire);
        // Racing writers can briefly route a stale walk into the free list;
        // bound the walk so even a transient cycle cannot wedge a reader.
        let mut hops = 0usize;
        while slot != NO_SLOT && hops <= INDEX_CAPACITY {
            let s = &self.slots[slot as usize];
            if s.key_matches(key) {
                return BlockAddress::from_packed(s.address.load(Ordering::Acquire));
            }
            slot = s.next_in_bucket.load(Ordering::Acquire);
            hops += 1;
        }
        BlockAddress::NONE
    }

    // ── Writes (mutex-guarded) ───────────────────────────────────────────────

    /// Record `addr` for (realm, hash). Overwrites the address when the key
    /// already exists; returns whether the entry is new.
    pub fn add(
        &self,
        realm: u32,
        hash: Hash,
        addr: BlockAddress,
    ) -> Result<bool, CapacityExceeded> {
        debug_assert!(!addr.is_none());
        let key = EntryKey::new(hash, realm);
        let bucket = hash.bucket() as usize;

        let mut links = self.links.lock();

        let mut last = NO_SLOT;
        let mut slot = self.slots[bucket].first_in_bucket.load(Ordering::Relaxed);
        while slot != NO_SLOT {
            let s = &self.slots[slot as usize];
            if s.key_matches(key) {
                s.address.store(addr.packed(), Ordering::Release);
                return Ok(false);
            }
            last = slot;
            slot = s.next_in_bucket.load(Ordering::Relaxed);
        }

        let chosen = self.take_free_slot(&mut links, bucket, last == NO_SLOT)?;
        let s = &self.slots[chosen as usize];
        s.hash_left.store(key.left, Ordering::Relaxed);
        s.hash_right_realm.store(key.right_with_realm, Ordering::Relaxed);
        s.next_in_bucket.store(NO_SLOT, Ordering::Relaxed);
        links.prev_in_bucket[chosen as usize] = last;
        s.address.store(addr.packed(), Ordering::Release);

        // Publish at the chain tail; readers acquire through this store.
        if last == NO_SLOT {
            self.slots[bucket].first_in_bucket.store(chosen, Ordering::Release);
        } else {
            self.slots[last as usize].next_in_bucket.store(chosen, Ordering::Release);
        }

        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Remove the entry for (realm, hash), but only while it still records
    /// `addr` — a removal racing a re-add of the same key must not destroy
    /// the newer entry.
    pub fn remove(&self, realm: u32, hash: Hash, addr: BlockAddress) {
        let key = EntryKey::new(hash, realm);
        let bucket = hash.bucket() as usize;

        let mut links = self.links.lock();

        let mut slot = self.slots[bucket].first_in_bucket.load(Ordering::Relaxed);
        while slot != NO_SLOT {
            let s = &self.slots[slot as usize];
            if s.key_matches(key) {
                if s.address.load(Ordering::Relaxed) != addr.packed() {
                    return; // stale removal
                }
                // Clear the address before the key: a racing reader that
                // matched the old key must resolve to "not present".
                s.address.store(0, Ordering::Release);
                s.hash_left.store(0, Ordering::Relaxed);
                s.hash_right_realm.store(0, Ordering::Relaxed);

                let prev = links.prev_in_bucket[slot as usize];
                let next = s.next_in_bucket.load(Ordering::Relaxed);
                if prev == NO_SLOT {
                    self.slots[bucket].first_in_bucket.store(next, Ordering::Release);
                } else {
                    self.slots[prev as usize].next_in_bucket.store(next, Ordering::Release);
                }
                if next != NO_SLOT {
                    links.prev_in_bucket[next as usize] = prev;
                }

                self.push_free_tail(&mut links, slot);
                self.count.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            slot = s.next_in_bucket.load(Ordering::Relaxed);
        }
    }

    // ── Free-list plumbing ───────────────────────────────────────────────────

    /// Pick a slot for a new entry: a free slot near the bucket anchor if one
    /// exists, the oldest free slot otherwise.
    fn take_free_slot(
        &self,
        links: &mut Links,
        bucket: usize,
        chain_empty: bool,
    ) -> Result<i32, CapacityExceeded> {
        // Under the mutex, address == 0 exactly identifies free slots.
        let start = if chain_empty { bucket } else { bucket + 1 };
        for candidate in start..=bucket + NEARBY_PROBES {
            if candidate >= INDEX_CAPACITY {
                break;
            }
            if self.slots[candidate].address.load(Ordering::Relaxed) == 0 {
                self.unlink_free(links, candidate as i32);
                return Ok(candidate as i32);
            }
        }
        let oldest = links.free_head;
        if oldest == NO_SLOT {
            return Err(CapacityExceeded);
        }
        self.unlink_free(links, oldest);
        Ok(oldest)
    }

    fn unlink_free(&self, links: &mut Links, slot: i32) {
        let prev = links.prev_in_bucket[slot as usize];
        let next = self.slots[slot as usize].next_in_bucket.load(Ordering::Relaxed);
        if prev == NO_SLOT {
            links.free_head = next;
        } else {
            self.slots[prev as usize].next_in_bucket.store(next, Ordering::Relaxed);
        }
        if next == NO_SLOT {
            links.free_tail = prev;
        } else {
            links.prev_in_bucket[next as usize] = prev;
        }
    }

    fn push_free_tail(&self, links: &mut Links, slot: i32) {
        self.slots[slot as usize].next_in_bucket.store(NO_SLOT, Ordering::Relaxed);
        links.prev_in_bucket[slot as usize] = links.free_tail;
        if links.free_tail == NO_SLOT {
            links.free_head = slot;
        } else {
            self.slots[links.free_tail as usize]
                .next_in_bucket
                .store(slot, Ordering::Relaxed);
        }
        links.free_tail = slot;
    }
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}
