//! bcache: a sharded, fixed-pool LRU block buffer cache
//!
//! This library sits between a filesystem layer and a block storage device.
//! It guarantees that:
//! - Repeated reads of one device block share a single coherent in-memory
//!   copy
//! - Writers can persist their modifications back to the device
//! - Any number of threads can request, hold, and release buffers without
//!   corrupting cache metadata or deadlocking
//! - When the cache is full, the buffer least recently released is
//!   recycled first
//!
//! # Usage
//!
//! ```
//! use bcache::{BufCache, RamDisk};
//!
//! let cache = BufCache::new(RamDisk::new(), 30);
//!
//! // Read block 7 of device 0; the guard holds the buffer exclusively.
//! let mut buf = cache.read(0, 7).unwrap();
//! buf[0] = 0x42;
//! buf.write().unwrap(); // persist explicitly; writes are synchronous
//! drop(buf); // release: the buffer becomes most-recently-used
//! ```
//!
//! # Module structure
//!
//! - [`device`] - the block-device interface the cache drives
//! - [`cache`] - buffer pool, sharded index, and locking protocol

pub mod cache;
pub mod device;

pub use cache::{Buf, BufCache, CacheStats, BUCKET_COUNT};
pub use device::{Block, BlockDevice, BlockError, RamDisk, BLOCK_SIZE};
