//! C1 — block-cache client.
//!
//! The underlying cache (page table, writeback policy, LRU eviction) is an
//! external collaborator per spec.md §2; `BlockCache` here is the reference
//! cache this crate ships so the engine has something real to mount and
//! drive in tests, wrapped by the three scoped handles §4.1 specifies:
//! [`CachedBlock`] (read-only pin), [`WritableBlock`] (transactional pin),
//! and [`BlockCache::make_writable`] (upgrade).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

type Page = Arc<RwLock<Vec<u8>>>;
type Listener = Box<dyn FnMut() + Send>;

/// The reference block cache: pins pages by block number, tracks which ones
/// are dirty, and fires per-block listeners once a dirty page has been
/// written through to its real location (the event the journal's flush
/// protocol step 5 waits on to retire a log entry).
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    pages: Mutex<HashMap<u64, Page>>,
    dirty: Mutex<std::collections::HashSet<u64>>,
    listeners: Mutex<HashMap<u64, Vec<Listener>>>,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        BlockCache {
            device,
            pages: Mutex::new(HashMap::new()),
            dirty: Mutex::new(std::collections::HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.device.block_size()
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn load_from_device(&self, block_number: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size() as usize];
        self.device.read_at(block_number, &mut buf)?;
        Ok(buf)
    }

    fn page_for(&self, block_number: u64, empty: bool) -> Result<Page> {
        let mut pages = self.pages.lock().unwrap();
        if let Some(page) = pages.get(&block_number) {
            if empty {
                // Re-pinning an in-use block number as "empty" replaces its
                // contents in place, matching fresh-allocation semantics.
                *page.write().unwrap() = vec![0u8; self.block_size() as usize];
            }
            return Ok(page.clone());
        }
        let data = if empty {
            vec![0u8; self.block_size() as usize]
        } else {
            self.load_from_device(block_number)?
        };
        let page = Arc::new(RwLock::new(data));
        pages.insert(block_number, page.clone());
        Ok(page)
    }

    /// Pins `block_number` for read-only inspection.
    pub fn get_block(&self, block_number: u64) -> Result<CachedBlock<'_>> {
        let page = self.page_for(block_number, false)?;
        Ok(CachedBlock { cache: self, block_number, page })
    }

    /// Pins a freshly allocated, zero-filled block without reading the device.
    pub fn get_empty_block(&self, block_number: u64) -> Result<CachedBlock<'_>> {
        let page = self.page_for(block_number, true)?;
        self.dirty.lock().unwrap().insert(block_number);
        Ok(CachedBlock { cache: self, block_number, page })
    }

    /// Pins `block_number` for transactional mutation; dirties it on release.
    pub fn get_writable_block(&self, block_number: u64) -> Result<WritableBlock<'_>> {
        if self.device.is_read_only() {
            return Err(Error::ReadOnlyDevice);
        }
        let page = self.page_for(block_number, false)?;
        Ok(WritableBlock { cache: self, block_number, page })
    }

    pub fn get_empty_writable_block(&self, block_number: u64) -> Result<WritableBlock<'_>> {
        if self.device.is_read_only() {
            return Err(Error::ReadOnlyDevice);
        }
        let page = self.page_for(block_number, true)?;
        self.dirty.lock().unwrap().insert(block_number);
        Ok(WritableBlock { cache: self, block_number, page })
    }

    fn mark_dirty(&self, block_number: u64) {
        self.dirty.lock().unwrap().insert(block_number);
    }

    /// Registers a callback fired the next time `block_number` is written
    /// through to its real location by [`BlockCache::sync`]. The journal
    /// uses this to know when it may retire a log entry.
    pub fn add_listener(&self, block_number: u64, listener: Listener) {
        self.listeners.lock().unwrap().entry(block_number).or_default().push(listener);
    }

    /// Writes every dirty page back to its real location and fires the
    /// listeners registered against each one, then flushes the device.
    pub fn sync(&self) -> Result<()> {
        let dirty_blocks: Vec<u64> = self.dirty.lock().unwrap().drain().collect();
        for block_number in &dirty_blocks {
            let page = {
                let pages = self.pages.lock().unwrap();
                pages.get(block_number).cloned()
            };
            if let Some(page) = page {
                let data = page.read().unwrap();
                self.device.write_at(*block_number, &data)?;
            }
            let fired: Vec<Listener> =
                self.listeners.lock().unwrap().remove(block_number).unwrap_or_default();
            for mut f in fired {
                f();
            }
        }
        self.device.flush()
    }

    /// Evicts a clean page. Dirty pages are never evicted out from under a
    /// pending transaction; they are dropped only once `sync` writes them
    /// through.
    pub fn put_block(&self, block_number: u64) {
        if !self.dirty.lock().unwrap().contains(&block_number) {
            self.pages.lock().unwrap().remove(&block_number);
        }
    }
}

/// A read-only pinned block. Releases its pin when dropped.
pub struct CachedBlock<'a> {
    cache: &'a BlockCache,
    block_number: u64,
    page: Page,
}

impl<'a> CachedBlock<'a> {
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn block(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.page.read().unwrap()
    }

    /// Upgrades this pin to a writable one within a transaction.
    pub fn make_writable(self) -> Result<WritableBlock<'a>> {
        if self.cache.device.is_read_only() {
            return Err(Error::ReadOnlyDevice);
        }
        Ok(WritableBlock { cache: self.cache, block_number: self.block_number, page: self.page.clone() })
    }
}

impl Drop for CachedBlock<'_> {
    fn drop(&mut self) {
        self.cache.put_block(self.block_number);
    }
}

/// A pinned block dirtied within a transaction. Releasing it (drop) marks
/// it dirty so [`BlockCache::sync`] will write it through.
pub struct WritableBlock<'a> {
    cache: &'a BlockCache,
    block_number: u64,
    page: Page,
}

impl<'a> WritableBlock<'a> {
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn block(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.page.read().unwrap()
    }

    pub fn writable_block(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.page.write().unwrap()
    }
}

impl Drop for WritableBlock<'_> {
    fn drop(&mut self) {
        self.cache.mark_dirty(self.block_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn read_write_round_trip() {
        let device = Arc::new(MemBlockDevice::new(512, 16));
        let cache = BlockCache::new(device);
        {
            let w = cache.get_writable_block(3).unwrap();
            w.writable_block()[0..5].copy_from_slice(b"hello");
        }
        cache.sync().unwrap();
        let r = cache.get_block(3).unwrap();
        assert_eq!(&r.block()[0..5], b"hello");
    }

    #[test]
    fn listener_fires_on_sync() {
        let device = Arc::new(MemBlockDevice::new(512, 16));
        let cache = BlockCache::new(device);
        let fired = Arc::new(Mutex::new(false));
        let fired2 = fired.clone();
        {
            let w = cache.get_writable_block(1).unwrap();
            w.writable_block()[0] = 1;
        }
        cache.add_listener(1, Box::new(move || *fired2.lock().unwrap() = true));
        cache.sync().unwrap();
        assert!(*fired.lock().unwrap());
    }
}
