//! C4 — inode and three-tier extent-mapped data stream.

use bytemuck::{Pod, Zeroable};

use crate::block_run::BlockRun;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::journal::Transaction;
use crate::layout::*;

pub type InodeId = u64;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InodeFlags: u32 {
        const IN_USE = 0x0000_0001;
        const DELETED = 0x0000_0002;
        const LONG_SYMLINK = 0x0000_0040;
        const LOGGED = 0x0000_0080;
    }
}

/// On-disk inode: identity, metadata, data-stream tiers, then the
/// small-data trailer occupying the rest of the block (§3 "Inode").
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct InodeHeader {
    pub magic: u32,
    pub mode: u32,
    pub self_run: BlockRun,
    pub parent_run: BlockRun,
    pub attributes_run: BlockRun,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    _pad0: u32,
    pub create_time: u64,
    pub modified_time: u64,
    pub status_change_time: u64,
    pub size: u64,
    pub max_direct_range: u64,
    pub max_indirect_range: u64,
    pub max_double_indirect_range: u64,
    pub direct: [BlockRun; NUM_DIRECT_BLOCKS],
    pub indirect: BlockRun,
    pub double_indirect: BlockRun,
    pub inode_number: u64,
}

pub const INODE_HEADER_SIZE: usize = core::mem::size_of::<InodeHeader>();

impl InodeHeader {
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC1
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & InodeFlags::IN_USE.bits() != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & InodeFlags::DELETED.bits() != 0
    }

    pub fn is_logged(&self) -> bool {
        self.flags & InodeFlags::LOGGED.bits() != 0
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// An in-memory handle over one inode block: loads the header, mediates
/// data-stream reads/writes, and keeps the small-data trailer bytes for
/// [`crate::small_data`] to operate on.
pub struct Inode {
    block_number: u64,
    block_size: u32,
    header: InodeHeader,
    trailer: Vec<u8>,
}

impl Inode {
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn header(&self) -> &InodeHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut InodeHeader {
        &mut self.header
    }

    pub fn trailer(&self) -> &[u8] {
        &self.trailer
    }

    pub fn trailer_mut(&mut self) -> &mut [u8] {
        &mut self.trailer
    }

    pub fn id(&self) -> InodeId {
        self.header.inode_number
    }

    /// Reads the inode block at `block_number` and splits it into header +
    /// small-data trailer.
    pub fn load(cache: &BlockCache, block_number: u64) -> Result<Self> {
        let block = cache.get_block(block_number)?;
        let data = block.block();
        if data.len() < INODE_HEADER_SIZE {
            return Err(Error::BadData);
        }
        let header: InodeHeader = *bytemuck::from_bytes(&data[..INODE_HEADER_SIZE]);
        if !header.is_valid() {
            return Err(Error::BadData);
        }
        let trailer = data[INODE_HEADER_SIZE..].to_vec();
        Ok(Inode { block_number, block_size: data.len() as u32, header, trailer })
    }

    /// Initializes a freshly allocated block as a new inode.
    pub fn create(
        tx: &Transaction<'_>,
        block_number: u64,
        self_run: BlockRun,
        parent_run: BlockRun,
        mode: u32,
        uid: u32,
        gid: u32,
        now: u64,
    ) -> Result<Self> {
        let block_size = tx.cache_ref().block_size();
        let mut header = InodeHeader::zeroed();
        header.magic = INODE_MAGIC1;
        header.mode = mode;
        header.self_run = self_run;
        header.parent_run = parent_run;
        header.uid = uid;
        header.gid = gid;
        header.flags = InodeFlags::IN_USE.bits();
        header.create_time = now;
        header.modified_time = now;
        header.status_change_time = now;
        header.inode_number = block_number;
        let inode = Inode {
            block_number,
            block_size,
            header,
            trailer: vec![0u8; block_size as usize - INODE_HEADER_SIZE],
        };
        inode.write(tx)?;
        Ok(inode)
    }

    /// Writes the header + trailer back to the inode's block within `tx`.
    pub fn write(&self, tx: &Transaction<'_>) -> Result<()> {
        let w = tx.get_writable_block(self.block_number)?;
        let mut buf = w.writable_block();
        buf[..INODE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&self.header));
        buf[INODE_HEADER_SIZE..].copy_from_slice(&self.trailer);
        Ok(())
    }

    fn indirect_extents_per_block(&self) -> u64 {
        self.block_size as u64 / core::mem::size_of::<BlockRun>() as u64
    }

    /// Locates the extent covering byte offset `pos`, returning the extent
    /// and the byte offset at which that extent begins (§4.4 `find_block_run`).
    pub fn find_block_run(&self, cache: &BlockCache, allocator: &crate::alloc::Allocator, pos: u64) -> Result<(BlockRun, u64)> {
        if pos < self.header.max_direct_range {
            let mut offset = 0u64;
            for run in &self.header.direct {
                if run.is_unset() {
                    break;
                }
                let end = offset + run.len() * self.block_size as u64;
                if pos < end {
                    return Ok((*run, offset));
                }
                offset = end;
            }
            return Err(Error::BadData);
        }

        if pos < self.header.max_indirect_range {
            let per_block = self.indirect_extents_per_block();
            let mut offset = self.header.max_direct_range;
            let mut block_index = 0u64;
            loop {
                let block = cache.get_block(self.indirect_abs_block(allocator, block_index)?)?;
                let data = block.block();
                for slot in 0..per_block {
                    let start = slot as usize * core::mem::size_of::<BlockRun>();
                    let run: BlockRun = *bytemuck::from_bytes(&data[start..start + core::mem::size_of::<BlockRun>()]);
                    if run.is_unset() {
                        return Err(Error::BadData);
                    }
                    let end = offset + run.len() * self.block_size as u64;
                    if pos < end {
                        return Ok((run, offset));
                    }
                    offset = end;
                }
                block_index += 1;
            }
        }

        // Double-indirect tier: a single index block, whose slot `index`
        // points to an indirect-array extending `stride` blocks, each
        // itself an array of fixed-length extents — closed-form index
        // arithmetic because every tier-3 extent shares the same stride
        // (§4.4).
        let stride = self.double_indirect_stride();
        let rel = pos - self.header.max_indirect_range;
        let per_block = self.indirect_extents_per_block();
        let indirect_size = stride * per_block * self.block_size as u64;
        let index = rel / indirect_size;
        let sub_index = (rel % indirect_size) / (stride * self.block_size as u64);

        let per_index_block = self.block_size as u64 / core::mem::size_of::<BlockRun>() as u64;
        let di_block = cache.get_block(self.double_indirect_abs_block(allocator, index / per_index_block)?)?;
        let slot = (index % per_index_block) as usize * core::mem::size_of::<BlockRun>();
        let indirect_array_run: BlockRun = {
            let data = di_block.block();
            *bytemuck::from_bytes(&data[slot..slot + core::mem::size_of::<BlockRun>()])
        };
        if indirect_array_run.is_unset() {
            return Err(Error::BadData);
        }

        let block_in_array = sub_index / per_block;
        let slot_in_block = sub_index % per_block;
        let ind_block = cache.get_block(allocator.absolute_block(indirect_array_run) + block_in_array)?;
        let s = slot_in_block as usize * core::mem::size_of::<BlockRun>();
        let run: BlockRun = {
            let data = ind_block.block();
            *bytemuck::from_bytes(&data[s..s + core::mem::size_of::<BlockRun>()])
        };
        if run.is_unset() {
            return Err(Error::BadData);
        }
        let offset =
            self.header.max_indirect_range + index * indirect_size + sub_index * stride * self.block_size as u64;
        Ok((run, offset))
    }

    fn indirect_abs_block(&self, allocator: &crate::alloc::Allocator, index: u64) -> Result<u64> {
        if index >= self.header.indirect.len() {
            return Err(Error::BadData);
        }
        Ok(allocator.absolute_block(self.header.indirect) + index)
    }

    fn double_indirect_abs_block(&self, allocator: &crate::alloc::Allocator, index: u64) -> Result<u64> {
        if index >= self.header.double_indirect.len() {
            return Err(Error::BadData);
        }
        Ok(allocator.absolute_block(self.header.double_indirect) + index)
    }

    /// Fixed stride (in blocks) every double-indirect-tier extent must
    /// share so that `index`/`sub_index` arithmetic stays closed-form.
    fn double_indirect_stride(&self) -> u64 {
        (16 * 1024 / self.block_size as u64).max(1)
    }

    /// Grows the data stream to at least `size` bytes by allocating and
    /// appending extents tier by tier (§4.4 `grow_stream`).
    pub fn grow_stream(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, size: u64) -> Result<()> {
        while self.stream_capacity() < size {
            let remaining_blocks = ((size - self.stream_capacity()) as u32).div_ceil(self.block_size);
            if self.header.max_direct_range == 0 || self.direct_has_room() {
                self.grow_direct(tx, allocator, remaining_blocks)?;
            } else if self.header.indirect.is_unset() {
                self.allocate_indirect_array(tx, allocator)?;
            } else if self.indirect_has_room() {
                self.grow_indirect(tx, allocator, remaining_blocks)?;
            } else {
                self.grow_double_indirect(tx, allocator, remaining_blocks)?;
            }
        }
        Ok(())
    }

    fn stream_capacity(&self) -> u64 {
        if self.header.max_double_indirect_range > 0 {
            self.header.max_double_indirect_range
        } else if self.header.max_indirect_range > 0 {
            self.header.max_indirect_range
        } else {
            self.header.max_direct_range
        }
    }

    fn direct_has_room(&self) -> bool {
        self.header.direct.iter().any(|r| r.is_unset())
    }

    fn grow_direct(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, blocks: u32) -> Result<()> {
        let hint_group = self.header.self_run.group;
        let requested = blocks.min(u16::MAX as u32) as u16;
        let run = allocator.allocate(tx, hint_group, requested, 1)?;

        if let Some(last) = self.last_direct_mut() {
            if last.is_contiguous_with(&run) {
                last.length += run.length;
                self.header.max_direct_range += run.len() * self.block_size as u64;
                return Ok(());
            }
        }
        let slot = self.header.direct.iter().position(|r| r.is_unset()).ok_or(Error::BufferOverflow)?;
        self.header.direct[slot] = run;
        self.header.max_direct_range += run.len() * self.block_size as u64;
        Ok(())
    }

    fn last_direct_mut(&mut self) -> Option<&mut BlockRun> {
        self.header.direct.iter_mut().rev().find(|r| !r.is_unset())
    }

    fn allocate_indirect_array(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator) -> Result<()> {
        let run = allocator.allocate(tx, self.header.self_run.group, 4, 1)?;
        let abs = allocator.absolute_block(run);
        for i in 0..run.len() {
            let w = tx.get_empty_writable_block(abs + i)?;
            drop(w);
        }
        self.header.indirect = run;
        Ok(())
    }

    fn indirect_has_room(&self) -> bool {
        let capacity = self.header.indirect.len() * self.indirect_extents_per_block();
        let used = (self.header.max_indirect_range.saturating_sub(self.header.max_direct_range))
            / self.block_size as u64
            / 1; // each slot covers at least one block; conservative bound
        used < capacity
    }

    fn grow_indirect(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, blocks: u32) -> Result<()> {
        let hint_group = self.header.self_run.group;
        let requested = blocks.min(u16::MAX as u32) as u16;
        let run = allocator.allocate(tx, hint_group, requested, 1)?;
        let per_block = self.indirect_extents_per_block();
        let used_slots = (self.header.max_indirect_range - self.header.max_direct_range) / self.block_size as u64;
        let block_index = used_slots / per_block;
        let slot = used_slots % per_block;
        let w = tx.get_writable_block(allocator.absolute_block(self.header.indirect) + block_index)?;
        let mut buf = w.writable_block();
        let start = slot as usize * core::mem::size_of::<BlockRun>();
        buf[start..start + core::mem::size_of::<BlockRun>()].copy_from_slice(bytemuck::bytes_of(&run));
        drop(buf);
        self.header.max_indirect_range += run.len() * self.block_size as u64;
        Ok(())
    }

    /// Appends one more fixed-`stride`-length extent to the double-indirect
    /// tier. The index block holds one `BlockRun` per indirect-array; each
    /// indirect-array holds up to `indirect_extents_per_block` extents, all
    /// `stride` blocks long, keeping `find_block_run`'s arithmetic closed
    /// form. `blocks` is advisory — this tier always grows by exactly one
    /// stride-sized extent per call, a simplification noted in DESIGN.md.
    fn grow_double_indirect(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, _blocks: u32) -> Result<()> {
        if self.header.double_indirect.is_unset() {
            let run = allocator.allocate(tx, self.header.self_run.group, 1, 1)?;
            let w = tx.get_empty_writable_block(allocator.absolute_block(run))?;
            drop(w);
            self.header.double_indirect = run;
            self.header.max_double_indirect_range = self.header.max_indirect_range;
        }
        let stride = self.double_indirect_stride();
        let per_block = self.indirect_extents_per_block();
        let hint_group = self.header.self_run.group;
        let used = (self.header.max_double_indirect_range - self.header.max_indirect_range)
            / (self.block_size as u64 * stride);
        let index = used / per_block;
        let slot_in_array = used % per_block;

        let per_index_block = self.block_size as u64 / core::mem::size_of::<BlockRun>() as u64;
        if index / per_index_block != 0 {
            return Err(Error::BufferOverflow);
        }
        let slot = (index % per_index_block) as usize * core::mem::size_of::<BlockRun>();
        let di_abs = allocator.absolute_block(self.header.double_indirect);
        let indirect_array_run: BlockRun = {
            let di = tx.get_block(di_abs)?;
            let data = di.block();
            *bytemuck::from_bytes(&data[slot..slot + core::mem::size_of::<BlockRun>()])
        };
        let indirect_array_run = if indirect_array_run.is_unset() {
            let array = allocator.allocate(tx, hint_group, 4, 1)?;
            let array_abs = allocator.absolute_block(array);
            for i in 0..array.len() {
                let w = tx.get_empty_writable_block(array_abs + i)?;
                drop(w);
            }
            let w = tx.get_writable_block(di_abs)?;
            w.writable_block()[slot..slot + core::mem::size_of::<BlockRun>()].copy_from_slice(bytemuck::bytes_of(&array));
            array
        } else {
            indirect_array_run
        };

        let run = allocator.allocate(tx, hint_group, stride.min(u16::MAX as u64) as u16, stride.min(u16::MAX as u64) as u16)?;
        let block_in_array = slot_in_array / per_block;
        let slot_in_block = slot_in_array % per_block;
        let w = tx.get_writable_block(allocator.absolute_block(indirect_array_run) + block_in_array)?;
        let mut buf = w.writable_block();
        let s = slot_in_block as usize * core::mem::size_of::<BlockRun>();
        buf[s..s + core::mem::size_of::<BlockRun>()].copy_from_slice(bytemuck::bytes_of(&run));
        drop(buf);
        self.header.max_double_indirect_range += stride * self.block_size as u64;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `pos`, clamped to the
    /// stream's size.
    pub fn read_at(&self, cache: &BlockCache, allocator: &crate::alloc::Allocator, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.header.size {
            return Ok(0);
        }
        let len = buf.len().min((self.header.size - pos) as usize);
        let mut done = 0usize;
        while done < len {
            let (run, run_offset) = self.find_block_run(cache, allocator, pos + done as u64)?;
            let within_run = (pos + done as u64) - run_offset;
            let block_index = within_run / self.block_size as u64;
            let block_offset = (within_run % self.block_size as u64) as usize;
            let block = cache.get_block(allocator.absolute_block(run) + block_index)?;
            let data = block.block();
            let take = (self.block_size as usize - block_offset).min(len - done);
            buf[done..done + take].copy_from_slice(&data[block_offset..block_offset + take]);
            done += take;
        }
        Ok(done)
    }

    /// Writes `buf` at `pos`, growing the stream first if necessary
    /// (§4.4 `write_at`).
    pub fn write_at(
        &mut self,
        tx: &Transaction<'_>,
        allocator: &crate::alloc::Allocator,
        pos: u64,
        buf: &[u8],
    ) -> Result<usize> {
        let end = pos + buf.len() as u64;
        if end > self.header.size {
            self.set_file_size(tx, allocator, end)?;
        }
        let mut done = 0usize;
        while done < buf.len() {
            let (run, run_offset) = self.find_block_run(tx.cache_ref(), allocator, pos + done as u64)?;
            let within_run = (pos + done as u64) - run_offset;
            let block_index = within_run / self.block_size as u64;
            let block_offset = (within_run % self.block_size as u64) as usize;
            let w = tx.get_writable_block(allocator.absolute_block(run) + block_index)?;
            let mut data = w.writable_block();
            let take = (self.block_size as usize - block_offset).min(buf.len() - done);
            data[block_offset..block_offset + take].copy_from_slice(&buf[done..done + take]);
            done += take;
        }
        Ok(done)
    }

    /// Grows or shrinks the stream to `new_size`, writing the header back
    /// in the same transaction regardless of outcome (§4.4 `set_file_size`).
    pub fn set_file_size(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, new_size: u64) -> Result<()> {
        let old_size = self.header.size;
        if new_size > old_size {
            if let Err(e) = self.grow_stream(tx, allocator, new_size) {
                self.write(tx)?;
                return Err(e);
            }
            self.zero_fill(tx, allocator, old_size, new_size)?;
        } else if new_size < old_size {
            self.shrink_stream(tx, allocator, new_size)?;
        }
        self.header.size = new_size;
        self.write(tx)
    }

    fn zero_fill(&self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, from: u64, to: u64) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        let zeros = vec![0u8; self.block_size as usize];
        let mut pos = from;
        while pos < to {
            let (run, run_offset) = self.find_block_run(tx.cache_ref(), allocator, pos)?;
            let within_run = pos - run_offset;
            let block_index = within_run / self.block_size as u64;
            let block_offset = (within_run % self.block_size as u64) as usize;
            let take = ((self.block_size as usize - block_offset) as u64).min(to - pos) as usize;
            let w = tx.get_writable_block(allocator.absolute_block(run) + block_index)?;
            w.writable_block()[block_offset..block_offset + take].copy_from_slice(&zeros[..take]);
            pos += take as u64;
        }
        Ok(())
    }

    /// Frees extents from the highest active tier down to `new_size`
    /// (§4.4 `shrink_stream`). Tier metadata is reset to the new highest
    /// used boundary; an entirely emptied tier frees its descriptor extent.
    fn shrink_stream(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, new_size: u64) -> Result<()> {
        if new_size < self.header.max_indirect_range && !self.header.double_indirect.is_unset() {
            allocator.free(tx, self.header.double_indirect)?;
            self.header.double_indirect = BlockRun::UNSET;
            self.header.max_double_indirect_range = 0;
        }
        if new_size < self.header.max_direct_range && !self.header.indirect.is_unset() {
            allocator.free(tx, self.header.indirect)?;
            self.header.indirect = BlockRun::UNSET;
            self.header.max_indirect_range = 0;
        }

        let mut offset = 0u64;
        for run in self.header.direct.iter_mut() {
            if run.is_unset() {
                continue;
            }
            let run_len = run.len() * self.block_size as u64;
            let run_end = offset + run_len;
            if offset >= new_size {
                allocator.free(tx, *run)?;
                *run = BlockRun::UNSET;
            } else if run_end > new_size {
                let keep_blocks = ((new_size - offset) as u32).div_ceil(self.block_size);
                let freed = BlockRun::new(run.group, run.start + keep_blocks as u16, run.length - keep_blocks as u16);
                if !freed.is_unset() {
                    allocator.free(tx, freed)?;
                }
                run.length = keep_blocks as u16;
                offset = new_size;
                continue;
            }
            offset = run_end.min(offset + run_len);
        }
        if new_size <= self.header.max_direct_range || self.header.max_direct_range == 0 {
            self.header.max_direct_range = new_size.min(self.header.max_direct_range.max(new_size));
        }
        self.header.max_direct_range = self.recompute_direct_range();
        Ok(())
    }

    fn recompute_direct_range(&self) -> u64 {
        self.header
            .direct
            .iter()
            .filter(|r| !r.is_unset())
            .map(|r| r.len() * self.block_size as u64)
            .sum()
    }

    /// Frees the whole stream and every extent it owns (§4.4 deletion step 1).
    pub fn free_stream(&mut self, tx: &Transaction<'_>, allocator: &crate::alloc::Allocator) -> Result<()> {
        self.set_file_size(tx, allocator, 0)
    }

    /// Enumerates every block run this inode owns: its own block, every
    /// data-stream extent across all three tiers, and the descriptor
    /// blocks (indirect array, double-indirect index block and its
    /// indirect arrays) that back them — the checker's Pass 1 walks this
    /// per reachable inode to build the shadow bitmap (§4.8).
    pub fn owned_runs(&self, cache: &BlockCache, allocator: &crate::alloc::Allocator) -> Result<Vec<BlockRun>> {
        let mut runs = vec![BlockRun::new(self.header.self_run.group, self.header.self_run.start, 1)];

        for run in self.header.direct.iter().filter(|r| !r.is_unset()) {
            runs.push(*run);
        }

        if !self.header.indirect.is_unset() {
            runs.push(self.header.indirect);
            let per_block = self.indirect_extents_per_block();
            let used = self.header.max_indirect_range.saturating_sub(self.header.max_direct_range) / self.block_size as u64;
            let blocks_used = used.div_ceil(per_block.max(1)).max(1).min(self.header.indirect.len());
            for block_index in 0..blocks_used {
                let block = cache.get_block(self.indirect_abs_block(allocator, block_index)?)?;
                let data = block.block();
                for slot in 0..per_block {
                    let start = slot as usize * core::mem::size_of::<BlockRun>();
                    if start + core::mem::size_of::<BlockRun>() > data.len() {
                        break;
                    }
                    let run: BlockRun = *bytemuck::from_bytes(&data[start..start + core::mem::size_of::<BlockRun>()]);
                    if !run.is_unset() {
                        runs.push(run);
                    }
                }
            }
        }

        if !self.header.double_indirect.is_unset() {
            runs.push(self.header.double_indirect);
            let stride = self.double_indirect_stride();
            let per_block = self.indirect_extents_per_block();
            let per_index_block = self.block_size as u64 / core::mem::size_of::<BlockRun>() as u64;
            let used = self.header.max_double_indirect_range.saturating_sub(self.header.max_indirect_range)
                / (self.block_size as u64 * stride);
            let indices_used = used.div_ceil(per_block.max(1)).max(1).min(per_index_block);
            let di_block = cache.get_block(allocator.absolute_block(self.header.double_indirect))?;
            let di_data = di_block.block();
            for index in 0..indices_used {
                let slot = index as usize * core::mem::size_of::<BlockRun>();
                if slot + core::mem::size_of::<BlockRun>() > di_data.len() {
                    break;
                }
                let indirect_array_run: BlockRun = *bytemuck::from_bytes(&di_data[slot..slot + core::mem::size_of::<BlockRun>()]);
                if indirect_array_run.is_unset() {
                    continue;
                }
                runs.push(indirect_array_run);
                for block_in_array in 0..indirect_array_run.len() {
                    let block = cache.get_block(allocator.absolute_block(indirect_array_run) + block_in_array)?;
                    let data = block.block();
                    for slot_in_block in 0..per_block {
                        let s = slot_in_block as usize * core::mem::size_of::<BlockRun>();
                        if s + core::mem::size_of::<BlockRun>() > data.len() {
                            break;
                        }
                        let run: BlockRun = *bytemuck::from_bytes(&data[s..s + core::mem::size_of::<BlockRun>()]);
                        if !run.is_unset() {
                            runs.push(run);
                        }
                    }
                }
            }
        }

        Ok(runs)
    }

    /// Flushes every block the extent tree covers through the cache
    /// (§4.4 "Sync").
    pub fn sync(&self, cache: &BlockCache, allocator: &crate::alloc::Allocator) -> Result<()> {
        for run in self.header.direct.iter().filter(|r| !r.is_unset()) {
            let abs = allocator.absolute_block(*run);
            for i in 0..run.len() {
                cache.put_block(abs + i);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::device::MemBlockDevice;
    use crate::journal::Journal;
    use std::sync::Arc;

    fn setup() -> (BlockCache, Journal, Allocator) {
        let device = Arc::new(MemBlockDevice::new(1024, 8192));
        let cache = BlockCache::new(device);
        let journal = Journal::new(1, 64, 0, 0);
        let allocator = Allocator::new(65, 512, 4, 1024);
        (cache, journal, allocator)
    }

    #[test]
    fn create_read_write_round_trip() {
        let (cache, journal, allocator) = setup();
        let tx = journal.start(&cache).unwrap();
        allocator.format(&tx).unwrap();
        let slot = allocator.allocate_for_inode(&tx, 0).unwrap();
        let mut inode = Inode::create(
            &tx,
            allocator.absolute_block(slot),
            slot,
            BlockRun::UNSET,
            S_IFREG | 0o644,
            0,
            0,
            0,
        )
        .unwrap();
        inode.write_at(&tx, &allocator, 0, b"hello world").unwrap();
        tx.done().unwrap();

        let mut buf = [0u8; 11];
        inode.read_at(&cache, &allocator, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
        assert_eq!(inode.header().size, 11);
    }

    #[test]
    fn shrink_frees_direct_extents() {
        let (cache, journal, allocator) = setup();
        let tx = journal.start(&cache).unwrap();
        allocator.format(&tx).unwrap();
        let slot = allocator.allocate_for_inode(&tx, 0).unwrap();
        let mut inode =
            Inode::create(&tx, allocator.absolute_block(slot), slot, BlockRun::UNSET, S_IFREG | 0o644, 0, 0, 0).unwrap();
        inode.set_file_size(&tx, &allocator, 4096).unwrap();
        tx.done().unwrap();

        let tx = journal.start(&cache).unwrap();
        inode.set_file_size(&tx, &allocator, 0).unwrap();
        tx.done().unwrap();
        assert_eq!(inode.header().size, 0);
        assert!(inode.header().direct.iter().all(|r| r.is_unset()));
    }
}
