//! Buffer slots and the caller-facing buffer guard
//!
//! A [`BufSlot`] is one element of the fixed pool: the block payload behind
//! its blocking content lock, plus the valid flag. Callers never see slots
//! directly; [`BufCache::get`](super::buffer_cache::BufCache::get) hands out
//! a [`Buf`] guard that owns the content lock for its lifetime and performs
//! the release protocol when dropped.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::device::{Block, BlockDevice, BlockError, BLOCK_SIZE};

use super::buffer_cache::BufCache;

/// One slot of the fixed buffer pool.
pub(crate) struct BufSlot {
    /// Whether the payload holds a correct copy of the on-device block.
    ///
    /// Cleared while rebinding under the shard lock (refcnt is 0 then, so
    /// no content holder exists), set by the content-lock holder after a
    /// device read completes.
    valid: AtomicBool,
    /// Block payload. The content lock is the blocking class: it is held
    /// for the whole lifetime of a `Buf` guard, including across device
    /// I/O.
    data: Mutex<Block>,
}

impl BufSlot {
    pub(crate) fn new() -> Self {
        BufSlot {
            valid: AtomicBool::new(false),
            data: Mutex::new([0u8; BLOCK_SIZE]),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    /// Forget the cached content. Caller must hold the owning shard lock
    /// and the slot's refcnt must be 0.
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn lock_data(&self) -> MutexGuard<'_, Block> {
        self.data.lock()
    }
}

/// An exclusively held cache buffer, bound to one (device, block number).
///
/// While a `Buf` is alive its holder owns the buffer's content lock and one
/// logical reference, so the payload cannot be observed, mutated, or
/// recycled by anyone else. Dropping the guard releases the buffer: the
/// content lock is released first, then the reference is returned and the
/// buffer becomes the most-recently-used entry of its bucket once no
/// references remain.
///
/// The payload is reached through `Deref`/`DerefMut`. Writing the payload
/// changes only the in-memory copy; call [`Buf::write`] to persist it.
pub struct Buf<'a, D: BlockDevice> {
    cache: &'a BufCache<D>,
    slot: usize,
    device: u32,
    blockno: u32,
    /// Always `Some` until `drop`, which takes it to release the content
    /// lock before touching the shard lock.
    data: Option<MutexGuard<'a, Block>>,
}

impl<'a, D: BlockDevice> Buf<'a, D> {
    pub(crate) fn new(
        cache: &'a BufCache<D>,
        slot: usize,
        device: u32,
        blockno: u32,
        data: MutexGuard<'a, Block>,
    ) -> Self {
        Buf {
            cache,
            slot,
            device,
            blockno,
            data: Some(data),
        }
    }

    /// Device id this buffer is bound to.
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Block number this buffer is bound to.
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Whether the payload currently mirrors the on-device content.
    ///
    /// `false` after a miss until a device read fills the buffer. A caller
    /// that overwrites the whole payload may ignore the flag.
    pub fn is_valid(&self) -> bool {
        self.cache.slot(self.slot).is_valid()
    }

    pub(crate) fn mark_valid(&self) {
        self.cache.slot(self.slot).set_valid();
    }

    #[cfg(test)]
    pub(crate) fn slot_index(&self) -> usize {
        self.slot
    }

    /// Synchronously write the payload back to the device.
    ///
    /// Leaves the valid flag, the reference count, and the recency position
    /// untouched. Errors come straight from the device and are not retried.
    pub fn write(&mut self) -> Result<(), BlockError> {
        let data = self.data.as_ref().unwrap();
        self.cache
            .device()
            .write_block(self.device, self.blockno, data)
    }

    /// Take an extra logical reference so the buffer stays bound to its
    /// block after this guard is dropped.
    ///
    /// A pinned buffer is never recycled, but its payload is only
    /// accessible through a fresh `get`. Every `pin` must be matched by a
    /// later [`BufCache::unpin`].
    pub fn pin(&self) {
        self.cache.pin_slot(self.slot, self.blockno);
    }
}

impl<D: BlockDevice> Deref for Buf<'_, D> {
    type Target = Block;

    fn deref(&self) -> &Block {
        self.data.as_ref().unwrap()
    }
}

impl<D: BlockDevice> DerefMut for Buf<'_, D> {
    fn deref_mut(&mut self) -> &mut Block {
        self.data.as_mut().unwrap()
    }
}

impl<D: BlockDevice> Drop for Buf<'_, D> {
    fn drop(&mut self) {
        // Content lock first, shard lock second; never both at once.
        drop(self.data.take());
        self.cache.release(self.slot, self.blockno);
    }
}
