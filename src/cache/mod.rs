//! Block buffer cache subsystem
//!
//! A fixed pool of buffers caches device blocks so that all callers share a
//! single coherent in-memory copy per (device, block number):
//! - Sharded index: 13 hash buckets keyed by `blockno % bucket_count`
//! - Per-buffer content lock held by exactly one caller at a time
//! - LRU eviction, updated when a buffer is released (not on lookup)
//! - Cross-bucket fallback when a bucket has no free buffer
//!
//! # Lock hierarchy
//!
//! Three lock classes exist, and must be acquired in the following order
//! (from outermost to innermost):
//!
//! 1. **Fallback lock** - one global busy-wait lock, taken only when a miss
//!    must search buckets other than its home bucket
//! 2. **Shard locks** - one busy-wait lock per bucket, guarding that
//!    bucket's recency list and the (device, blockno, refcnt) tags of its
//!    buffers
//! 3. **Content locks** - one blocking lock per buffer, guarding the
//!    payload and the valid flag; may be held across device I/O
//!
//! ## Rule 1: No I/O and no content waits under a shard lock
//! Shard critical sections only search and relink lists. The shard lock is
//! always released before a content lock is acquired, so a caller stuck
//! behind content contention never blocks the shard.
//!
//! ## Rule 2: Fallback before shard
//! A caller that needs more than one shard lock first takes the fallback
//! lock, then re-acquires its home shard lock, then visits donor shards one
//! at a time. The fallback lock totally orders these searches, so no two
//! callers can hold shard locks in conflicting order.
//!
//! ## Rule 3: At most one donor shard at a time
//! During a fallback search only the home shard lock plus a single donor
//! shard lock are ever held together; each donor is released before the
//! next is tried.

pub mod buffer;
pub mod buffer_cache;

pub use buffer::Buf;
pub use buffer_cache::{BufCache, CacheStats, BUCKET_COUNT};
