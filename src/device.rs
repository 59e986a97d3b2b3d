//! Block device interface
//!
//! The cache reaches storage through the [`BlockDevice`] trait: a
//! synchronous transfer of exactly one fixed-size block, addressed by
//! (device id, block number). A transfer blocks the calling thread until
//! the payload is completely filled or flushed; the cache never observes a
//! partial block.
//!
//! [`RamDisk`] is an in-memory implementation used by the tests and for
//! bring-up of embedding systems.

use core::fmt;
use std::collections::BTreeMap;

/// Size of one device block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// One block's payload.
pub type Block = [u8; BLOCK_SIZE];

/// Block I/O error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The device failed to transfer the block
    Io,
    /// The block number is out of range for the device
    InvalidBlock,
    /// The device id does not name an attached device
    NoDevice,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::Io => write!(f, "device I/O failure"),
            BlockError::InvalidBlock => write!(f, "block number out of range"),
            BlockError::NoDevice => write!(f, "no such device"),
        }
    }
}

impl std::error::Error for BlockError {}

/// Block device trait for cache integration
///
/// Implementations are shared between all cache callers, so both transfer
/// directions take `&self`. Errors are propagated to the caller untouched;
/// the cache never retries a transfer on its own.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` with the content of block `blockno` on `device`.
    fn read_block(&self, device: u32, blockno: u32, buf: &mut Block) -> Result<(), BlockError>;

    /// Flush `buf` to block `blockno` on `device`.
    fn write_block(&self, device: u32, blockno: u32, buf: &Block) -> Result<(), BlockError>;
}

/// In-memory block store covering any number of device ids.
///
/// Blocks that were never written read back as zeroes, which gives
/// deterministic behavior without preformatting. An optional per-device
/// capacity bounds the valid block range.
pub struct RamDisk {
    storage: spin::Mutex<BTreeMap<(u32, u32), Box<Block>>>,
    capacity: Option<u32>,
}

impl RamDisk {
    /// Create an unbounded in-memory store.
    pub fn new() -> Self {
        RamDisk {
            storage: spin::Mutex::new(BTreeMap::new()),
            capacity: None,
        }
    }

    /// Create a store where every device holds `blocks` blocks; transfers
    /// beyond that fail with [`BlockError::InvalidBlock`].
    pub fn with_capacity(blocks: u32) -> Self {
        RamDisk {
            storage: spin::Mutex::new(BTreeMap::new()),
            capacity: Some(blocks),
        }
    }

    fn check_range(&self, blockno: u32) -> Result<(), BlockError> {
        match self.capacity {
            Some(capacity) if blockno >= capacity => Err(BlockError::InvalidBlock),
            _ => Ok(()),
        }
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, device: u32, blockno: u32, buf: &mut Block) -> Result<(), BlockError> {
        self.check_range(blockno)?;
        let storage = self.storage.lock();
        match storage.get(&(device, blockno)) {
            Some(block) => buf.copy_from_slice(&block[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, device: u32, blockno: u32, buf: &Block) -> Result<(), BlockError> {
        self.check_range(blockno)?;
        let mut storage = self.storage.lock();
        storage.insert((device, blockno), Box::new(*buf));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let disk = RamDisk::new();
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        block[BLOCK_SIZE - 1] = 0xCD;
        disk.write_block(0, 3, &block).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        disk.read_block(0, 3, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[BLOCK_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_absent_blocks_read_zero() {
        let disk = RamDisk::new();
        let mut out = [0xFFu8; BLOCK_SIZE];
        disk.read_block(0, 42, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_devices_are_isolated() {
        let disk = RamDisk::new();
        let block = [0x11u8; BLOCK_SIZE];
        disk.write_block(0, 9, &block).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        disk.read_block(1, 9, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_capacity_bound() {
        let disk = RamDisk::with_capacity(10);
        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(disk.read_block(0, 10, &mut block), Err(BlockError::InvalidBlock));
        assert_eq!(disk.write_block(0, 10, &block), Err(BlockError::InvalidBlock));
        assert_eq!(disk.read_block(0, 9, &mut block), Ok(()));
    }
}
