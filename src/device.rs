//! Block-device contract.
//!
//! The real cache and allocator primitives (`get_block`, `get_writable_block`,
//! `sync`, transactional dirtying) are an external collaborator per
//! spec.md §2 — only their usage contract is specified here. `BlockDevice`
//! is the bottom of that contract: raw, unbuffered, fixed-size-block I/O.
//! [`crate::cache::BlockCache`] is the typed handle wrapper the rest of the
//! engine actually talks to.

use crate::error::{Error, Result};

/// A fixed-block-size random access device.
pub trait BlockDevice: Send + Sync {
    /// Size of one addressable block, in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks on the device.
    fn block_count(&self) -> u64;

    /// Reads exactly `buf.len()` bytes starting at `block_number * block_size()`.
    fn read_at(&self, block_number: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes exactly `buf.len()` bytes starting at `block_number * block_size()`.
    fn write_at(&self, block_number: u64, buf: &[u8]) -> Result<()>;

    /// Forces previously written blocks to stable storage.
    fn flush(&self) -> Result<()>;

    /// Best-effort discard hint for the blocks in `[block_number, block_number + count)`.
    /// Devices that don't support discard simply ignore the call — this default does.
    fn trim(&self, _block_number: u64, _count: u64) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

/// An in-memory [`BlockDevice`], the double every unit and integration test
/// mounts against (SPEC_FULL.md, ambient test tooling).
pub struct MemBlockDevice {
    block_size: u32,
    data: std::sync::RwLock<Vec<u8>>,
    read_only: bool,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        MemBlockDevice {
            block_size,
            data: std::sync::RwLock::new(vec![0u8; (block_size as u64 * block_count) as usize]),
            read_only: false,
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.data.read().unwrap().len() as u64 / u64::from(self.block_size)
    }

    fn read_at(&self, block_number: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read().unwrap();
        let offset = (block_number * u64::from(self.block_size)) as usize;
        let end = offset.checked_add(buf.len()).ok_or(Error::BadValue)?;
        if end > data.len() {
            return Err(Error::IoError);
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, block_number: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyDevice);
        }
        let mut data = self.data.write().unwrap();
        let offset = (block_number * u64::from(self.block_size)) as usize;
        let end = offset.checked_add(buf.len()).ok_or(Error::BadValue)?;
        if end > data.len() {
            return Err(Error::IoError);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
