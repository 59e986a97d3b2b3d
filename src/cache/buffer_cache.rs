//! Sharded LRU buffer cache
//!
//! [`BufCache`] owns a fixed pool of buffer slots and an array of hash
//! buckets, each a recency-ordered list of the buffers it currently
//! indexes. A block lives in the bucket selected by
//! `blockno % bucket_count`; a buffer whose bucket is exhausted is stolen
//! from a neighboring bucket under the fallback lock (see the lock
//! hierarchy in the [module docs](super)).
//!
//! Recency policy: a buffer becomes most-recently-used only when its last
//! reference is released, not on lookup. Eviction scans each bucket from
//! the least-recently-used end and takes the first unreferenced buffer.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;

use log::{debug, error, trace};

use crate::device::{BlockDevice, BlockError};

use super::buffer::{Buf, BufSlot};

/// Number of hash buckets the pool is sharded into by default.
pub const BUCKET_COUNT: usize = 13;

/// Identity and reference state of one pooled buffer, kept in whichever
/// bucket currently indexes it. Guarded by that bucket's shard lock.
struct BufTag {
    /// Index of the slot this tag describes; stable for the cache lifetime.
    slot: usize,
    device: u32,
    blockno: u32,
    /// Outstanding get/pin references. A tag with `refcnt > 0` is never
    /// rebound or relocated.
    refcnt: usize,
}

/// One shard: the recency list of the buffers this bucket indexes.
/// Front is most-recently-used, back is least-recently-used.
struct Bucket {
    entries: VecDeque<BufTag>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            entries: VecDeque::new(),
        }
    }
}

/// Counters kept while the cache runs; snapshot with [`BufCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found the block already cached.
    pub hits: u64,
    /// Lookups that had to bind a buffer to the block.
    pub misses: u64,
    /// Misses served by rebinding a free buffer of the home bucket.
    pub recycles: u64,
    /// Misses served by stealing a free buffer from another bucket.
    pub relocations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    recycles: AtomicU64,
    relocations: AtomicU64,
}

/// A fixed-pool block cache shared by any number of threads.
///
/// Created once and handed around by reference; the pool never grows or
/// shrinks. All methods take `&self`.
pub struct BufCache<D: BlockDevice> {
    device: D,
    slots: Box<[BufSlot]>,
    buckets: Box<[spin::Mutex<Bucket>]>,
    /// Taken before any shard lock when a miss must search beyond its home
    /// bucket. Totally orders cross-bucket searches so shard locks cannot
    /// be acquired in conflicting order.
    fallback_lock: spin::Mutex<()>,
    counters: Counters,
}

impl<D: BlockDevice> BufCache<D> {
    /// Create a cache of `pool_size` buffers sharded [`BUCKET_COUNT`] ways.
    ///
    /// No device I/O happens here; every buffer starts unbound and invalid.
    pub fn new(device: D, pool_size: usize) -> Self {
        Self::with_geometry(device, pool_size, BUCKET_COUNT)
    }

    /// Create a cache with an explicit bucket count. Small geometries are
    /// mainly useful for tests that need to force collisions or fallback.
    pub fn with_geometry(device: D, pool_size: usize, bucket_count: usize) -> Self {
        assert!(pool_size > 0, "bcache: pool_size must be nonzero");
        assert!(bucket_count > 0, "bcache: bucket_count must be nonzero");

        let slots: Box<[BufSlot]> = (0..pool_size).map(|_| BufSlot::new()).collect();
        let buckets: Box<[spin::Mutex<Bucket>]> = (0..bucket_count)
            .map(|_| spin::Mutex::new(Bucket::new()))
            .collect();

        // Fresh slots carry a zeroed (device, blockno) tag, so they all
        // start out indexed by bucket 0 and migrate from there on demand.
        {
            let mut home = buckets[0].lock();
            for slot in 0..pool_size {
                home.entries.push_front(BufTag {
                    slot,
                    device: 0,
                    blockno: 0,
                    refcnt: 0,
                });
            }
        }

        BufCache {
            device,
            slots,
            buckets,
            fallback_lock: spin::Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// The device this cache fronts.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Number of buffers in the pool.
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Number of hash buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            recycles: self.counters.recycles.load(Ordering::Relaxed),
            relocations: self.counters.relocations.load(Ordering::Relaxed),
        }
    }

    fn bucket_index(&self, blockno: u32) -> usize {
        blockno as usize % self.buckets.len()
    }

    pub(crate) fn slot(&self, slot: usize) -> &BufSlot {
        &self.slots[slot]
    }

    /// Front-to-back search for an existing binding; takes a reference on
    /// the match. Caller holds the bucket's shard lock.
    fn lookup(bucket: &mut Bucket, device: u32, blockno: u32) -> Option<usize> {
        let tag = bucket
            .entries
            .iter_mut()
            .find(|t| t.device == device && t.blockno == blockno)?;
        tag.refcnt += 1;
        Some(tag.slot)
    }

    /// Rebind the first unreferenced buffer found from the
    /// least-recently-used end of `bucket`, leaving its list position
    /// unchanged. Caller holds the bucket's shard lock.
    fn claim_lru(&self, bucket: &mut Bucket, device: u32, blockno: u32) -> Option<usize> {
        let tag = bucket.entries.iter_mut().rev().find(|t| t.refcnt == 0)?;
        tag.device = device;
        tag.blockno = blockno;
        tag.refcnt = 1;
        let slot = tag.slot;
        self.slots[slot].invalidate();
        Some(slot)
    }

    /// Acquire the content lock of `slot` and wrap it for the caller.
    /// Must be called with no shard or fallback lock held.
    fn lock_buf(&self, device: u32, blockno: u32, slot: usize) -> Buf<'_, D> {
        let data = self.slots[slot].lock_data();
        Buf::new(self, slot, device, blockno, data)
    }

    /// Return a buffer bound to (`device`, `blockno`) with its content lock
    /// held and a reference taken.
    ///
    /// The payload is only meaningful if [`Buf::is_valid`] is true; use
    /// [`BufCache::read`] to have it filled from the device. Blocks while
    /// another caller holds the same buffer's content lock.
    ///
    /// # Panics
    ///
    /// Panics if every buffer in the pool is referenced: the pool is
    /// exhausted and no search order could succeed. That indicates the
    /// embedding system holds more buffers than the pool was sized for.
    pub fn get(&self, device: u32, blockno: u32) -> Buf<'_, D> {
        let home = self.bucket_index(blockno);

        let mut bucket = self.buckets[home].lock();
        if let Some(slot) = Self::lookup(&mut bucket, device, blockno) {
            drop(bucket);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!("hit ({}, {}) in slot {}", device, blockno, slot);
            return self.lock_buf(device, blockno, slot);
        }

        if let Some(slot) = self.claim_lru(&mut bucket, device, blockno) {
            drop(bucket);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.recycles.fetch_add(1, Ordering::Relaxed);
            debug!("miss ({}, {}): recycled slot {}", device, blockno, slot);
            return self.lock_buf(device, blockno, slot);
        }

        // Home bucket exhausted. Release its shard lock before taking the
        // fallback lock so concurrent searches cannot deadlock, then take
        // the locks back in hierarchy order.
        drop(bucket);
        let search_guard = self.fallback_lock.lock();
        let mut home_bucket = self.buckets[home].lock();

        // The bucket may have changed while unlocked: another caller can
        // have bound this very block, or released a buffer here.
        if let Some(slot) = Self::lookup(&mut home_bucket, device, blockno) {
            drop(home_bucket);
            drop(search_guard);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!("hit ({}, {}) in slot {} after re-scan", device, blockno, slot);
            return self.lock_buf(device, blockno, slot);
        }
        if let Some(slot) = self.claim_lru(&mut home_bucket, device, blockno) {
            drop(home_bucket);
            drop(search_guard);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.recycles.fetch_add(1, Ordering::Relaxed);
            debug!("miss ({}, {}): recycled slot {} after re-scan", device, blockno, slot);
            return self.lock_buf(device, blockno, slot);
        }

        // Steal the least-recently-used free buffer of the nearest
        // successor bucket that has one.
        let bucket_count = self.buckets.len();
        for step in 1..bucket_count {
            let donor_index = (home + step) % bucket_count;
            let mut donor = self.buckets[donor_index].lock();
            let position = donor.entries.iter().rposition(|t| t.refcnt == 0);
            let Some(position) = position else {
                continue;
            };

            let mut tag = donor
                .entries
                .remove(position)
                .expect("bcache: donor entry vanished");
            self.slots[tag.slot].invalidate();
            drop(donor);

            tag.device = device;
            tag.blockno = blockno;
            tag.refcnt = 1;
            let slot = tag.slot;
            home_bucket.entries.push_front(tag);
            drop(home_bucket);
            drop(search_guard);

            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.relocations.fetch_add(1, Ordering::Relaxed);
            debug!(
                "miss ({}, {}): relocated slot {} from bucket {} to {}",
                device, blockno, slot, donor_index, home
            );
            return self.lock_buf(device, blockno, slot);
        }

        error!(
            "all {} buffers referenced; cannot bind ({}, {})",
            self.slots.len(),
            device,
            blockno
        );
        panic!("bcache: out of free buffers");
    }

    /// Return a buffer bound to (`device`, `blockno`) whose payload holds
    /// the on-device content, reading it synchronously on a miss.
    ///
    /// On a device error the buffer stays invalid and the error propagates;
    /// the guard taken internally is released normally, so the cache state
    /// is unchanged apart from the (still invalid) binding.
    pub fn read(&self, device: u32, blockno: u32) -> Result<Buf<'_, D>, BlockError> {
        let mut buf = self.get(device, blockno);
        if !buf.is_valid() {
            self.device.read_block(device, blockno, &mut buf)?;
            buf.mark_valid();
        }
        Ok(buf)
    }

    /// Drop one logical reference taken by [`Buf::pin`].
    ///
    /// # Panics
    ///
    /// Panics if the block is not cached or has no outstanding references;
    /// both mean pin/unpin calls were not balanced.
    pub fn unpin(&self, device: u32, blockno: u32) {
        let mut bucket = self.buckets[self.bucket_index(blockno)].lock();
        let tag = bucket
            .entries
            .iter_mut()
            .find(|t| t.device == device && t.blockno == blockno);
        match tag {
            Some(tag) => {
                assert!(
                    tag.refcnt > 0,
                    "bcache: unpin ({}, {}): not pinned",
                    device,
                    blockno
                );
                // Logical retention only: no recency update on unpin.
                tag.refcnt -= 1;
            }
            None => panic!("bcache: unpin ({}, {}): not cached", device, blockno),
        }
    }

    /// Take an extra reference on a held buffer. Called through
    /// [`Buf::pin`], which guarantees the tag exists and is referenced.
    pub(crate) fn pin_slot(&self, slot: usize, blockno: u32) {
        let mut bucket = self.buckets[self.bucket_index(blockno)].lock();
        let tag = bucket
            .entries
            .iter_mut()
            .find(|t| t.slot == slot)
            .expect("bcache: pinned buffer missing from its bucket");
        tag.refcnt += 1;
    }

    /// Release protocol, run by `Buf::drop` after the content lock is gone:
    /// drop the reference and, if it was the last, make the buffer the
    /// most-recently-used entry of its bucket.
    pub(crate) fn release(&self, slot: usize, blockno: u32) {
        let mut bucket = self.buckets[self.bucket_index(blockno)].lock();
        let position = bucket
            .entries
            .iter()
            .position(|t| t.slot == slot)
            .expect("bcache: released buffer missing from its bucket");

        let tag = &mut bucket.entries[position];
        assert!(tag.refcnt > 0, "bcache: release of unreferenced buffer");
        tag.refcnt -= 1;
        if tag.refcnt == 0 {
            // Last reference gone: this buffer is now the least preferred
            // eviction candidate of its bucket.
            if let Some(tag) = bucket.entries.remove(position) {
                bucket.entries.push_front(tag);
            }
        }
    }
}

impl<D: BlockDevice> fmt::Debug for BufCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufCache")
            .field("pool_size", &self.slots.len())
            .field("bucket_count", &self.buckets.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
