//! Per-CPU block allocator.
//!
//! Each CPU owns a free list holding its share of the allocatable region as
//! an interval tree keyed by `range_low`. Checksum and parity reserves are
//! carved off the front of each share before the allocatable bounds are set.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::*;

use crate::bytefs_lib::checksum::{crc32c, ProtRegion, INIT_CSUM, STRIPES_PER_BLOCK, STRIPE_SIZE};
use crate::bytefs_lib::layout::{FsLayout, ANY_CPU, BLOCK_SHIFT, BLOCK_SIZE};
use crate::bytefs_lib::pm::PmDevice;
use crate::bytefs_lib::types::{FsError, FsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDirection {
    FromHead,
    FromTail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocInit {
    NoInit,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocType {
    Log,
    Data,
}

/// One free range. `csum` protects the two bounds when DRAM-structure
/// checksumming is mounted in.
#[derive(Debug, Clone, Copy)]
pub struct RangeNode {
    pub range_low: u64,
    pub range_high: u64, /* inclusive */
    pub csum: u32,
}

impl RangeNode {
    fn new(range_low: u64, range_high: u64) -> Self {
        let mut node = Self {
            range_low,
            range_high,
            csum: 0,
        };
        node.update_csum();
        node
    }

    pub fn update_csum(&mut self) {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.range_low.to_le_bytes());
        bytes[8..].copy_from_slice(&self.range_high.to_le_bytes());
        self.csum = crc32c(INIT_CSUM, &bytes);
    }

    pub fn csum_ok(&self) -> bool {
        let mut check = *self;
        check.update_csum();
        check.csum == self.csum
    }

    fn len(&self) -> u64 {
        self.range_high - self.range_low + 1
    }
}

/// DRAM free-space bookkeeping for one CPU.
pub struct FreeList {
    pub index: usize,
    tree: BTreeMap<u64, RangeNode>,
    pub first_node: Option<u64>, /* lowest free range_low */
    pub last_node: Option<u64>,  /* highest free range_low */

    /* Where the data checksum blocks are */
    pub csum_start: u64,
    pub replica_csum_start: u64,
    pub num_csum_blocks: u64,

    /* Where the data parity blocks are */
    pub parity_start: u64,
    pub num_parity_blocks: u64,

    /* Allocatable range, inclusive. Excludes csum and parity blocks. */
    pub block_start: u64,
    pub block_end: u64,

    pub num_free_blocks: u64,
    pub num_blocknode: u64,

    /* Statistics */
    pub alloc_log_count: u64,
    pub alloc_data_count: u64,
    pub free_log_count: u64,
    pub free_data_count: u64,
    pub alloc_log_pages: u64,
    pub alloc_data_pages: u64,
    pub freed_log_pages: u64,
    pub freed_data_pages: u64,
}

impl FreeList {
    fn refresh_extremes(&mut self) {
        self.first_node = self.tree.keys().next().copied();
        self.last_node = self.tree.keys().next_back().copied();
        self.num_blocknode = self.tree.len() as u64;
    }

    fn insert_node(&mut self, node: RangeNode) {
        self.tree.insert(node.range_low, node);
        self.refresh_extremes();
    }

    pub fn prot_region(&self) -> ProtRegion {
        ProtRegion {
            csum_start: self.csum_start,
            replica_csum_start: self.replica_csum_start,
            parity_start: self.parity_start,
            block_start: self.block_start,
        }
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.tree
            .values()
            .map(|n| (n.range_low, n.range_high))
            .collect()
    }
}

pub struct BlockAlloc {
    lists: Vec<Mutex<FreeList>>,
    cpus: usize,
    region_start: u64,
    blocks_per_list: u64,
    num_blocks: u64,
    dram_struct_csum: bool,
    next_cpu: AtomicUsize,
}

impl BlockAlloc {
    /// Carve the allocatable region into per-CPU shares. With `data_csum` /
    /// `data_parity` enabled, each share donates its leading blocks to the
    /// checksum (primary + replica) and parity areas.
    pub fn new(layout: &FsLayout, data_csum: bool, data_parity: bool) -> FsResult<Self> {
        let cpus = layout.cpus as usize;
        let region_start = layout.head_reserved_blocks();
        if layout.num_blocks <= region_start {
            return Err(FsError::Invalid);
        }
        let region_blocks = layout.num_blocks - region_start;
        let blocks_per_list = region_blocks / cpus as u64;
        if blocks_per_list < 8 {
            return Err(FsError::Invalid);
        }
        let mut lists = Vec::with_capacity(cpus);
        for index in 0..cpus {
            let share_start = region_start + index as u64 * blocks_per_list;
            // the last list absorbs the remainder
            let share_end = if index == cpus - 1 {
                layout.num_blocks - 1
            } else {
                share_start + blocks_per_list - 1
            };
            let share_blocks = share_end - share_start + 1;
            let mut cursor = share_start;
            let (csum_start, replica_csum_start, num_csum_blocks) = if data_csum {
                // 4 B per 512 B stripe: one csum block covers 128 data blocks
                let covered_per_block = BLOCK_SIZE as u64 / (STRIPES_PER_BLOCK as u64 * 4);
                let num = (share_blocks + covered_per_block - 1) / covered_per_block;
                let primary = cursor;
                let replica = cursor + num;
                cursor += 2 * num;
                (primary, replica, num)
            } else {
                (0, 0, 0)
            };
            let (parity_start, num_parity_blocks) = if data_parity {
                // one parity stripe per data block
                let covered_per_block = (BLOCK_SIZE / STRIPE_SIZE) as u64;
                let num = (share_blocks + covered_per_block - 1) / covered_per_block;
                let start = cursor;
                cursor += num;
                (start, num)
            } else {
                (0, 0)
            };
            if cursor >= share_end {
                return Err(FsError::Invalid);
            }
            let mut list = FreeList {
                index,
                tree: BTreeMap::new(),
                first_node: None,
                last_node: None,
                csum_start,
                replica_csum_start,
                num_csum_blocks,
                parity_start,
                num_parity_blocks,
                block_start: cursor,
                block_end: share_end,
                num_free_blocks: 0,
                num_blocknode: 0,
                alloc_log_count: 0,
                alloc_data_count: 0,
                free_log_count: 0,
                free_data_count: 0,
                alloc_log_pages: 0,
                alloc_data_pages: 0,
                freed_log_pages: 0,
                freed_data_pages: 0,
            };
            list.num_free_blocks = list.block_end - list.block_start + 1;
            list.insert_node(RangeNode::new(list.block_start, list.block_end));
            debug!(
                "free list {}: blocks [{}, {}], csum at {} x{}, parity at {} x{}",
                index,
                list.block_start,
                list.block_end,
                csum_start,
                num_csum_blocks,
                parity_start,
                num_parity_blocks
            );
            lists.push(Mutex::new(list));
        }
        Ok(Self {
            lists,
            cpus,
            region_start,
            blocks_per_list,
            num_blocks: layout.num_blocks,
            dram_struct_csum: false,
            next_cpu: AtomicUsize::new(0),
        })
    }

    pub fn enable_dram_struct_csum(&mut self) {
        self.dram_struct_csum = true;
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    pub fn list(&self, cpu: usize) -> MutexGuard<'_, FreeList> {
        self.lists[cpu].lock().unwrap()
    }

    /// The free list whose share contains `blocknr`.
    pub fn list_of_block(&self, blocknr: u64) -> usize {
        debug_assert!(blocknr >= self.region_start && blocknr < self.num_blocks);
        let index = ((blocknr - self.region_start) / self.blocks_per_list) as usize;
        index.min(self.cpus - 1)
    }

    fn pick_cpu(&self, cpu: i32) -> usize {
        if cpu == ANY_CPU {
            self.next_cpu.fetch_add(1, Ordering::Relaxed) % self.cpus
        } else {
            cpu as usize % self.cpus
        }
    }

    /// Take up to `count` blocks from one contiguous range of one list.
    /// Returns `(blocknr, allocated)` with `allocated <= count`.
    fn alloc_range(
        &self,
        list: &mut FreeList,
        count: u64,
        direction: AllocDirection,
    ) -> FsResult<(u64, u64)> {
        let key = match direction {
            AllocDirection::FromHead => list.first_node,
            AllocDirection::FromTail => list.last_node,
        };
        let key = key.ok_or(FsError::NoSpace)?;
        let node = *list.tree.get(&key).ok_or(FsError::Corrupt)?;
        if self.dram_struct_csum && !node.csum_ok() {
            error!(
                "free list {}: range node [{}, {}] checksum mismatch",
                list.index, node.range_low, node.range_high
            );
            return Err(FsError::Corrupt);
        }
        let take = count.min(node.len());
        let blocknr = match direction {
            AllocDirection::FromHead => node.range_low,
            AllocDirection::FromTail => node.range_high - take + 1,
        };
        list.tree.remove(&key);
        if take < node.len() {
            let shrunk = match direction {
                AllocDirection::FromHead => RangeNode::new(node.range_low + take, node.range_high),
                AllocDirection::FromTail => RangeNode::new(node.range_low, node.range_high - take),
            };
            list.tree.insert(shrunk.range_low, shrunk);
        }
        list.refresh_extremes();
        list.num_free_blocks -= take;
        Ok((blocknr, take))
    }

    fn new_blocks(
        &self,
        pm: &PmDevice,
        count: u64,
        cpu: i32,
        init: AllocInit,
        direction: AllocDirection,
        atype: AllocType,
    ) -> FsResult<(u64, u64)> {
        if count == 0 {
            return Err(FsError::Invalid);
        }
        let start = self.pick_cpu(cpu);
        for attempt in 0..self.cpus {
            let index = (start + attempt) % self.cpus;
            let mut list = self.lists[index].lock().unwrap();
            match self.alloc_range(&mut list, count, direction) {
                Ok((blocknr, allocated)) => {
                    match atype {
                        AllocType::Log => {
                            list.alloc_log_count += 1;
                            list.alloc_log_pages += allocated;
                        }
                        AllocType::Data => {
                            list.alloc_data_count += 1;
                            list.alloc_data_pages += allocated;
                        }
                    }
                    drop(list);
                    if init == AllocInit::Zero {
                        let offset = blocknr << BLOCK_SHIFT;
                        let len = (allocated as usize) << BLOCK_SHIFT;
                        let _window = pm.unlock();
                        pm.memset(offset, 0, len)?;
                        pm.flush(offset, len, true)?;
                    }
                    trace!(
                        "alloc {:?} {} blocks at {} from list {}",
                        atype,
                        allocated,
                        blocknr,
                        index
                    );
                    return Ok((blocknr, allocated));
                }
                Err(FsError::NoSpace) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!("allocation of {} blocks failed on every free list", count);
        Err(FsError::NoSpace)
    }

    pub fn new_data_blocks(
        &self,
        pm: &PmDevice,
        count: u64,
        cpu: i32,
        init: AllocInit,
        direction: AllocDirection,
    ) -> FsResult<(u64, u64)> {
        self.new_blocks(pm, count, cpu, init, direction, AllocType::Data)
    }

    pub fn new_log_blocks(
        &self,
        pm: &PmDevice,
        count: u64,
        cpu: i32,
        init: AllocInit,
        direction: AllocDirection,
    ) -> FsResult<(u64, u64)> {
        self.new_blocks(pm, count, cpu, init, direction, AllocType::Log)
    }

    fn free_blocks(&self, blocknr: u64, count: u64, atype: AllocType) -> FsResult<()> {
        if count == 0 || blocknr < self.region_start || blocknr + count > self.num_blocks {
            return Err(FsError::Invalid);
        }
        let index = self.list_of_block(blocknr);
        let mut list = self.lists[index].lock().unwrap();
        if blocknr < list.block_start || blocknr + count - 1 > list.block_end {
            error!(
                "free [{}, {}) crosses list {} bounds [{}, {}]",
                blocknr,
                blocknr + count,
                index,
                list.block_start,
                list.block_end
            );
            return Err(FsError::Invalid);
        }
        let low = blocknr;
        let high = blocknr + count - 1;

        let prev = list
            .tree
            .range(..low)
            .next_back()
            .map(|(_, n)| *n);
        let next = list.tree.range(low..).next().map(|(_, n)| *n);
        if let Some(p) = prev {
            if self.dram_struct_csum && !p.csum_ok() {
                return Err(FsError::Corrupt);
            }
            if p.range_high >= low {
                error!("double free: [{}, {}] overlaps [{}, {}]", low, high, p.range_low, p.range_high);
                return Err(FsError::Corrupt);
            }
        }
        if let Some(n) = next {
            if n.range_low <= high {
                error!("double free: [{}, {}] overlaps [{}, {}]", low, high, n.range_low, n.range_high);
                return Err(FsError::Corrupt);
            }
        }

        let merge_left = prev.map_or(false, |p| p.range_high + 1 == low);
        let merge_right = next.map_or(false, |n| high + 1 == n.range_low);
        let (new_low, new_high) = match (merge_left, merge_right) {
            (true, true) => {
                let p = prev.unwrap();
                let n = next.unwrap();
                list.tree.remove(&p.range_low);
                list.tree.remove(&n.range_low);
                (p.range_low, n.range_high)
            }
            (true, false) => {
                let p = prev.unwrap();
                list.tree.remove(&p.range_low);
                (p.range_low, high)
            }
            (false, true) => {
                let n = next.unwrap();
                list.tree.remove(&n.range_low);
                (low, n.range_high)
            }
            (false, false) => (low, high),
        };
        list.insert_node(RangeNode::new(new_low, new_high));
        list.num_free_blocks += count;
        match atype {
            AllocType::Log => {
                list.free_log_count += 1;
                list.freed_log_pages += count;
            }
            AllocType::Data => {
                list.free_data_count += 1;
                list.freed_data_pages += count;
            }
        }
        trace!("freed {} blocks at {} into list {}", count, blocknr, index);
        Ok(())
    }

    pub fn free_data_blocks(&self, blocknr: u64, count: u64) -> FsResult<()> {
        self.free_blocks(blocknr, count, AllocType::Data)
    }

    pub fn free_log_blocks(&self, blocknr: u64, count: u64) -> FsResult<()> {
        self.free_blocks(blocknr, count, AllocType::Log)
    }

    pub fn count_free_blocks(&self) -> u64 {
        self.lists
            .iter()
            .map(|l| l.lock().unwrap().num_free_blocks)
            .sum()
    }

    /// Snapshot every free range for the clean-unmount checkpoint.
    pub fn checkpoint(&self) -> Vec<(u64, u64)> {
        let mut ranges = vec![];
        for list in &self.lists {
            ranges.extend(list.lock().unwrap().ranges());
        }
        ranges.sort_unstable();
        ranges
    }

    /// Rebuild the trees from a checkpoint (clean mount) or from scratch
    /// minus `in_use` ranges (recovery rescan).
    pub fn restore(&self, ranges: &[(u64, u64)]) -> FsResult<()> {
        for list in &self.lists {
            let mut list = list.lock().unwrap();
            list.tree.clear();
            list.num_free_blocks = 0;
            list.refresh_extremes();
        }
        for &(low, high) in ranges {
            if high < low {
                return Err(FsError::Corrupt);
            }
            let index = self.list_of_block(low);
            let mut list = self.lists[index].lock().unwrap();
            if low < list.block_start || high > list.block_end {
                return Err(FsError::Corrupt);
            }
            list.num_free_blocks += high - low + 1;
            list.insert_node(RangeNode::new(low, high));
        }
        Ok(())
    }

    /// Remove `[blocknr, blocknr+count)` from the free space, used when
    /// recovery discovers live references.
    pub fn remove_free_range(&self, blocknr: u64, count: u64) -> FsResult<()> {
        let index = self.list_of_block(blocknr);
        let mut list = self.lists[index].lock().unwrap();
        let low = blocknr;
        let high = blocknr + count - 1;
        let node = list
            .tree
            .range(..=low)
            .next_back()
            .map(|(_, n)| *n)
            .ok_or(FsError::Corrupt)?;
        if node.range_high < high || node.range_low > low {
            return Err(FsError::Corrupt);
        }
        list.tree.remove(&node.range_low);
        if node.range_low < low {
            let left = RangeNode::new(node.range_low, low - 1);
            list.tree.insert(left.range_low, left);
        }
        if node.range_high > high {
            let right = RangeNode::new(high + 1, node.range_high);
            list.tree.insert(right.range_low, right);
        }
        list.refresh_extremes();
        list.num_free_blocks -= count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;
    use std::sync::Arc;

    fn setup(cpus: u32, blocks: u64) -> (PmDevice, BlockAlloc) {
        let layout = FsLayout::new(cpus, blocks);
        let driver = Arc::new(RamSsdDriver::new(blocks << BLOCK_SHIFT));
        let pm = PmDevice::new(driver, false).unwrap();
        let alloc = BlockAlloc::new(&layout, false, false).unwrap();
        (pm, alloc)
    }

    #[test]
    fn alloc_and_free_round_trip() -> Result<()> {
        let (pm, alloc) = setup(2, 1024);
        let total = alloc.count_free_blocks();
        let (b1, n1) = alloc.new_data_blocks(&pm, 16, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        assert_eq!(n1, 16);
        assert_eq!(alloc.count_free_blocks(), total - 16);
        alloc.free_data_blocks(b1, n1)?;
        assert_eq!(alloc.count_free_blocks(), total);
        // merging restored a single node per list
        for cpu in 0..2 {
            assert_eq!(alloc.list(cpu).num_blocknode, 1);
        }
        Ok(())
    }

    #[test]
    fn head_and_tail_directions() -> Result<()> {
        let (pm, alloc) = setup(1, 512);
        let (head, _) = alloc.new_data_blocks(&pm, 4, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        let (tail, _) = alloc.new_log_blocks(&pm, 4, 0, AllocInit::NoInit, AllocDirection::FromTail)?;
        let list = alloc.list(0);
        assert_eq!(head, list.block_start);
        assert_eq!(tail + 3, list.block_end);
        Ok(())
    }

    #[test]
    fn partial_allocation_returns_actual_count() -> Result<()> {
        let (pm, alloc) = setup(1, 512);
        let list_blocks = {
            let list = alloc.list(0);
            list.block_end - list.block_start + 1
        };
        // fragment the list: take everything, free back two small islands
        let (base, n) =
            alloc.new_data_blocks(&pm, list_blocks, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        assert_eq!(n, list_blocks);
        alloc.free_data_blocks(base + 10, 3)?;
        alloc.free_data_blocks(base + 100, 5)?;
        let (b, got) = alloc.new_data_blocks(&pm, 64, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        assert_eq!((b, got), (base + 10, 3));
        let (b, got) = alloc.new_data_blocks(&pm, 64, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        assert_eq!((b, got), (base + 100, 5));
        assert!(matches!(
            alloc.new_data_blocks(&pm, 1, 0, AllocInit::NoInit, AllocDirection::FromHead),
            Err(FsError::NoSpace)
        ));
        Ok(())
    }

    #[test]
    fn double_free_detected() -> Result<()> {
        let (pm, alloc) = setup(1, 512);
        let (b, n) = alloc.new_data_blocks(&pm, 8, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        alloc.free_data_blocks(b, n)?;
        assert_eq!(alloc.free_data_blocks(b, n), Err(FsError::Corrupt));
        Ok(())
    }

    #[test]
    fn zero_init_lands_on_pm() -> Result<()> {
        let (pm, alloc) = setup(1, 512);
        let (b, _) = alloc.new_data_blocks(&pm, 1, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        pm.write_bytes(b << BLOCK_SHIFT, &[0xffu8; 64])?;
        alloc.free_data_blocks(b, 1)?;
        let (b2, _) = alloc.new_data_blocks(&pm, 1, 0, AllocInit::Zero, AllocDirection::FromHead)?;
        assert_eq!(b2, b);
        let mut buf = [1u8; 64];
        pm.read_bytes(b2 << BLOCK_SHIFT, &mut buf)?;
        assert_eq!(buf, [0u8; 64]);
        Ok(())
    }

    #[test]
    fn cross_cpu_fallback() -> Result<()> {
        let (pm, alloc) = setup(2, 1024);
        let list0_blocks = {
            let list = alloc.list(0);
            list.block_end - list.block_start + 1
        };
        let (_, n) =
            alloc.new_data_blocks(&pm, list0_blocks, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        assert_eq!(n, list0_blocks);
        // cpu 0 is empty, allocation must spill to cpu 1
        let (b, n) = alloc.new_data_blocks(&pm, 4, 0, AllocInit::NoInit, AllocDirection::FromHead)?;
        assert_eq!(n, 4);
        assert_eq!(alloc.list_of_block(b), 1);
        Ok(())
    }

    #[test]
    fn csum_parity_regions_reserved() -> Result<()> {
        let layout = FsLayout::new(2, 4096);
        let alloc = BlockAlloc::new(&layout, true, true).unwrap();
        for cpu in 0..2 {
            let list = alloc.list(cpu);
            assert!(list.num_csum_blocks > 0);
            assert!(list.num_parity_blocks > 0);
            // allocatable range starts after the reserves
            assert!(list.block_start >= list.parity_start + list.num_parity_blocks);
            assert_eq!(list.replica_csum_start, list.csum_start + list.num_csum_blocks);
        }
        Ok(())
    }

    #[test]
    fn checkpoint_restore_round_trip() -> Result<()> {
        let (pm, alloc) = setup(2, 1024);
        let (b, n) = alloc.new_data_blocks(&pm, 12, 1, AllocInit::NoInit, AllocDirection::FromHead)?;
        let ckpt = alloc.checkpoint();
        let free_before = alloc.count_free_blocks();
        alloc.restore(&ckpt)?;
        assert_eq!(alloc.count_free_blocks(), free_before);
        alloc.free_data_blocks(b, n)?;
        Ok(())
    }
}
