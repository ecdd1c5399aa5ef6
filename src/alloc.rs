//! C2 — block allocator (§3 "Allocation group", §4.2).
//!
//! Each allocation group owns a run of bitmap blocks immediately followed
//! by its data blocks; bit `i` of the bitmap means block `i` of the group
//! is in use. In-memory, a group keeps only cheap hints (first known-free
//! bit, a free-block count) — the bitmap itself always lives in the block
//! cache, the same split the teacher uses between `BlockBitmap` (on-disk
//! view, `examples/sleiderr-fzkernel/src/fs/ext4/bitmap.rs`) and
//! `BlockGroupDescriptor` (in-memory hints,
//! `examples/sleiderr-fzkernel/src/fs/ext4/block_grp.rs`).

use vob::Vob;

use crate::block_run::BlockRun;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::journal::Transaction;
use crate::sync::RecursiveLock;

/// Where a group's bitmap and data blocks live, absolute block numbers.
#[derive(Clone, Copy, Debug)]
struct GroupLayout {
    bitmap_start: u64,
    bitmap_block_count: u32,
    data_start: u64,
    blocks_per_group: u32,
}

impl GroupLayout {
    fn for_group(group: u32, data_region_start: u64, blocks_per_group: u32, bitmap_block_count: u32) -> Self {
        let stride = u64::from(bitmap_block_count) + u64::from(blocks_per_group);
        let base = data_region_start + u64::from(group) * stride;
        GroupLayout {
            bitmap_start: base,
            bitmap_block_count,
            data_start: base + u64::from(bitmap_block_count),
            blocks_per_group,
        }
    }
}

/// Layout shared by every group plus the cheap per-group hints the
/// allocator consults before touching a bitmap block.
struct AllocatorState {
    data_region_start: u64,
    blocks_per_group: u32,
    bitmap_block_count: u32,
    group_count: u32,
    block_size: u32,
    /// Index into a group's bitmap where the next free-search should begin.
    first_free_hint: Vec<u32>,
    free_in_group: Vec<u32>,
}

/// The block allocator. One instance per mounted volume, guarded by a
/// recursive lock acquired *after* any inode lock (spec.md §5, lock 4).
pub struct Allocator {
    state: RecursiveLock<AllocatorState>,
}

fn bitmap_blocks_needed(blocks_per_group: u32, block_size: u32) -> u32 {
    let bits_per_block = block_size * 8;
    blocks_per_group.div_ceil(bits_per_block).max(1)
}

impl Allocator {
    /// `data_region_start` is the first absolute block belonging to group 0
    /// (i.e. right after the superblock and the journal extent).
    pub fn new(data_region_start: u64, blocks_per_group: u32, group_count: u32, block_size: u32) -> Self {
        let bitmap_block_count = bitmap_blocks_needed(blocks_per_group, block_size);
        Allocator {
            state: RecursiveLock::new(AllocatorState {
                data_region_start,
                blocks_per_group,
                bitmap_block_count,
                group_count,
                block_size,
                first_free_hint: vec![0; group_count as usize],
                free_in_group: vec![blocks_per_group; group_count as usize],
            }),
        }
    }

    fn layout(state: &AllocatorState, group: u32) -> GroupLayout {
        GroupLayout::for_group(group, state.data_region_start, state.blocks_per_group, state.bitmap_block_count)
    }

    /// Rebuilds the in-memory free-count hints by scanning every group's
    /// bitmap, run once at mount (§6 "Mount").
    pub fn rebuild_hints(&self, cache: &BlockCache) -> Result<()> {
        let guard = self.state.lock();
        let (group_count, layouts): (u32, Vec<GroupLayout>) = {
            let s = guard.borrow();
            (s.group_count, (0..s.group_count).map(|g| Self::layout(&s, g)).collect())
        };
        let mut counts = Vec::with_capacity(group_count as usize);
        let mut hints = Vec::with_capacity(group_count as usize);
        for (g, layout) in layouts.into_iter().enumerate() {
            let bitmap = load_bitmap(cache, &layout)?;
            let free = bitmap.iter_unset_bits(0..layout.blocks_per_group as usize).count() as u32;
            let first_free = bitmap.iter_unset_bits(0..layout.blocks_per_group as usize).next().unwrap_or(0) as u32;
            counts.push(free);
            hints.push(first_free);
            let _ = g;
        }
        let mut s = guard.borrow_mut();
        s.free_in_group = counts;
        s.first_free_hint = hints;
        Ok(())
    }

    /// Zero-initializes every group's bitmap blocks (all data blocks start
    /// free; the bitmap blocks themselves sit outside the bit-addressable
    /// range, addressed directly by [`GroupLayout`]) (§4.2 "Format").
    pub fn format(&self, tx: &Transaction<'_>) -> Result<()> {
        let guard = self.state.lock();
        let s = guard.borrow();
        for g in 0..s.group_count {
            let layout = Self::layout(&s, g);
            for b in layout.bitmap_start..layout.data_start {
                let w = tx.get_empty_writable_block(b)?;
                drop(w);
            }
        }
        Ok(())
    }

    /// Finds and marks used a single free block anywhere in the volume,
    /// biased toward `hint_group` (typically the parent directory's group,
    /// §4.2 "Allocate for inode" locality policy).
    pub fn allocate_for_inode(&self, tx: &Transaction<'_>, hint_group: u32) -> Result<BlockRun> {
        self.allocate(tx, hint_group, 1, 1)
    }

    /// Two-pass sweep: first look for a contiguous run of exactly
    /// `requested` blocks, then settle for the largest run of at least
    /// `minimum` found while scanning (§4.2 "Allocate").
    pub fn allocate(&self, tx: &Transaction<'_>, hint_group: u32, requested: u16, minimum: u16) -> Result<BlockRun> {
        if requested == 0 || minimum == 0 || minimum > requested {
            return Err(Error::BadValue);
        }
        let guard = self.state.lock();
        let group_count = guard.borrow().group_count;
        let hint_group = hint_group % group_count.max(1);

        let mut best: Option<(u32, u32, u32)> = None; // (group, start, len)
        for offset in 0..group_count {
            let group = (hint_group + offset) % group_count;
            let layout = {
                let s = guard.borrow();
                Self::layout(&s, group)
            };
            let mut bitmap = load_bitmap(tx.cache_ref(), &layout)?;

            if let Some(start) = find_free_run(&bitmap, layout.blocks_per_group, requested as u32) {
                mark_used(tx, &layout, &mut bitmap, start, requested as u32)?;
                self.adjust_free_count(&guard, group, requested as u32);
                return Ok(BlockRun::new(group, start as u16, requested));
            }
            if let Some((start, len)) = find_largest_run(&bitmap, layout.blocks_per_group, minimum as u32) {
                if best.map(|(_, _, l)| len > l).unwrap_or(true) {
                    best = Some((group, start, len));
                }
            }
        }

        let Some((group, start, len)) = best else {
            return Err(Error::DeviceFull);
        };
        let layout = {
            let s = guard.borrow();
            Self::layout(&s, group)
        };
        let mut bitmap = load_bitmap(tx.cache_ref(), &layout)?;
        mark_used(tx, &layout, &mut bitmap, start, len)?;
        self.adjust_free_count(&guard, group, len);
        Ok(BlockRun::new(group, start as u16, len as u16))
    }

    fn adjust_free_count(&self, guard: &crate::sync::RecursiveLockGuard<'_, AllocatorState>, group: u32, used: u32) {
        let mut s = guard.borrow_mut();
        s.free_in_group[group as usize] = s.free_in_group[group as usize].saturating_sub(used);
    }

    /// Clears the bits covered by `run`, §4.2 "Free".
    pub fn free(&self, tx: &Transaction<'_>, run: BlockRun) -> Result<()> {
        if run.is_unset() {
            return Ok(());
        }
        let guard = self.state.lock();
        let layout = {
            let s = guard.borrow();
            if run.group >= s.group_count || u32::from(run.end()) > s.blocks_per_group {
                return Err(Error::BadValue);
            }
            Self::layout(&s, run.group)
        };
        let mut bitmap = load_bitmap(tx.cache_ref(), &layout)?;
        for i in run.start..run.end() {
            bitmap.set(i as usize, false);
        }
        store_bitmap(tx, &layout, &bitmap)?;
        let mut s = guard.borrow_mut();
        let g = run.group as usize;
        s.free_in_group[g] = (s.free_in_group[g] + u32::from(run.length)).min(s.blocks_per_group);
        Ok(())
    }

    /// Total free blocks across every group, for `statvfs`-style reporting.
    pub fn free_block_count(&self) -> u64 {
        let guard = self.state.lock();
        let sum = guard.borrow().free_in_group.iter().map(|&n| u64::from(n)).sum();
        sum
    }

    /// Converts a group-relative [`BlockRun`] (the on-disk `(group, start,
    /// length)` form) into the absolute block number its first block lives
    /// at — `start` is a bit index into the group's data region, not an
    /// absolute block number, so every data-stream reader/writer must go
    /// through this before indexing the cache (§3 "Block-run").
    pub fn absolute_block(&self, run: BlockRun) -> u64 {
        let guard = self.state.lock();
        let s = guard.borrow();
        Self::layout(&s, run.group).data_start + u64::from(run.start)
    }

    /// Number of allocation groups the volume is divided into, for the
    /// checker's per-group bitmap walk (§4.8 Pass 1).
    pub fn group_count(&self) -> u32 {
        self.state.lock().borrow().group_count
    }

    /// Blocks per allocation group (the bit-addressable data region, not
    /// counting the group's own bitmap blocks).
    pub fn blocks_per_group(&self) -> u32 {
        self.state.lock().borrow().blocks_per_group
    }

    /// Reads one group's on-disk bitmap, for the checker to diff against
    /// the shadow bitmap it builds by walking reachable inodes (§4.8).
    pub fn read_group_bitmap(&self, cache: &BlockCache, group: u32) -> Result<Vob> {
        let guard = self.state.lock();
        let s = guard.borrow();
        load_bitmap(cache, &Self::layout(&s, group))
    }

    /// Writes a (shadow, repaired) bitmap back for one group, in whatever
    /// transaction the caller already holds — the checker calls this in
    /// ≤512-block batches to keep a single repair transaction bounded
    /// (§4.8 "Writeback").
    pub fn write_group_bitmap(&self, tx: &Transaction<'_>, group: u32, bitmap: &Vob) -> Result<()> {
        let guard = self.state.lock();
        let s = guard.borrow();
        store_bitmap(tx, &Self::layout(&s, group), bitmap)
    }

    /// SPEC_FULL.md-supplemented maintenance op: reports, without
    /// allocating, the longest free run discoverable per group at least
    /// `min_run_len` blocks long (used by a `fstrim`-style online
    /// discard pass the original filesystem's block allocator header
    /// gestures at but the kernel module never implements).
    pub fn trim_candidates(&self, cache: &BlockCache, min_run_len: u32) -> Result<Vec<BlockRun>> {
        let guard = self.state.lock();
        let s = guard.borrow();
        let mut candidates = Vec::new();
        for group in 0..s.group_count {
            let layout = Self::layout(&s, group);
            let bitmap = load_bitmap(cache, &layout)?;
            let mut run_start: Option<u32> = None;
            for i in 0..=layout.blocks_per_group {
                let free = i < layout.blocks_per_group && !bitmap.get(i as usize).unwrap_or(true);
                match (free, run_start) {
                    (true, None) => run_start = Some(i),
                    (false, Some(start)) => {
                        let len = i - start;
                        if len >= min_run_len {
                            candidates.push(BlockRun::new(group, start as u16, len.min(u16::MAX as u32) as u16));
                        }
                        run_start = None;
                    }
                    _ => {}
                }
            }
        }
        Ok(candidates)
    }
}

fn load_bitmap(cache: &BlockCache, layout: &GroupLayout) -> Result<Vob> {
    let mut bytes = Vec::with_capacity(layout.bitmap_block_count as usize * cache.block_size() as usize);
    for b in layout.bitmap_start..layout.data_start {
        let block = cache.get_block(b)?;
        bytes.extend_from_slice(&block.block());
    }
    Ok(Vob::from_bytes(&bytes))
}

fn store_bitmap(tx: &Transaction<'_>, layout: &GroupLayout, bitmap: &Vob) -> Result<()> {
    let block_size = tx.cache_ref().block_size() as usize;
    let bytes = bitmap.get_storage();
    let mut byte_buf = Vec::with_capacity(layout.bitmap_block_count as usize * block_size);
    for word in bytes {
        byte_buf.extend_from_slice(&word.to_le_bytes());
    }
    byte_buf.resize(layout.bitmap_block_count as usize * block_size, 0);
    for (i, b) in (layout.bitmap_start..layout.data_start).enumerate() {
        let w = tx.get_writable_block(b)?;
        let start = i * block_size;
        w.writable_block().copy_from_slice(&byte_buf[start..start + block_size]);
    }
    Ok(())
}

fn mark_used(tx: &Transaction<'_>, layout: &GroupLayout, bitmap: &mut Vob, start: u32, len: u32) -> Result<()> {
    for i in start..start + len {
        bitmap.set(i as usize, true);
    }
    store_bitmap(tx, layout, bitmap)
}

fn find_free_run(bitmap: &Vob, blocks_per_group: u32, len: u32) -> Option<u32> {
    let mut run_start: Option<u32> = None;
    for i in 0..blocks_per_group {
        let free = !bitmap.get(i as usize).unwrap_or(true);
        match (free, run_start) {
            (true, None) => run_start = Some(i),
            (true, Some(start)) if i - start + 1 == len => return Some(start),
            (false, _) => run_start = None,
            _ => {}
        }
    }
    None
}

fn find_largest_run(bitmap: &Vob, blocks_per_group: u32, minimum: u32) -> Option<(u32, u32)> {
    let mut best: Option<(u32, u32)> = None;
    let mut run_start: Option<u32> = None;
    for i in 0..=blocks_per_group {
        let free = i < blocks_per_group && !bitmap.get(i as usize).unwrap_or(true);
        match (free, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                let len = i - start;
                if len >= minimum && best.map(|(_, l)| len > l).unwrap_or(true) {
                    best = Some((start, len));
                }
                run_start = None;
            }
            _ => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::device::MemBlockDevice;
    use crate::journal::Journal;
    use std::sync::Arc;

    fn setup() -> (BlockCache, Journal, Allocator) {
        let device = Arc::new(MemBlockDevice::new(512, 4096));
        let cache = BlockCache::new(device);
        let journal = Journal::new(1, 64, 0, 0);
        let allocator = Allocator::new(65, 256, 4, 512);
        (cache, journal, allocator)
    }

    #[test]
    fn allocate_then_free_round_trips_free_count() {
        let (cache, journal, allocator) = setup();
        let tx = journal.start(&cache).unwrap();
        allocator.format(&tx).unwrap();
        tx.done().unwrap();

        let total_before = allocator.free_block_count();
        let tx = journal.start(&cache).unwrap();
        let run = allocator.allocate(&tx, 0, 10, 10).unwrap();
        tx.done().unwrap();
        assert_eq!(run.length, 10);
        assert_eq!(allocator.free_block_count(), total_before - 10);

        let tx = journal.start(&cache).unwrap();
        allocator.free(&tx, run).unwrap();
        tx.done().unwrap();
        assert_eq!(allocator.free_block_count(), total_before);
    }

    #[test]
    fn second_pass_accepts_partial_run() {
        let (cache, journal, allocator) = setup();
        let tx = journal.start(&cache).unwrap();
        allocator.format(&tx).unwrap();
        let a = allocator.allocate(&tx, 0, 250, 250).unwrap();
        tx.done().unwrap();
        assert_eq!(a.group, 0);

        let tx = journal.start(&cache).unwrap();
        let b = allocator.allocate(&tx, 0, 20, 1).unwrap();
        tx.done().unwrap();
        assert!(b.length >= 1 && b.length <= 20);
    }
}
