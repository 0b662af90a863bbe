//! Inode store: reserved slots, dynamically chained per-CPU inode tables,
//! per-CPU inode-number allocation, and the integrity check that falls back
//! to the replica copy.
use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::Mutex;

use log::*;

use crate::bytefs_lib::balloc::{AllocDirection, AllocInit, BlockAlloc};
use crate::bytefs_lib::layout::{
    FsLayout, Inode, BLOCK_SHIFT, CACHELINE_SIZE, INODE_SIZE, NORMAL_INODE_START, RESERVED_INODES,
};
use crate::bytefs_lib::pm::PmDevice;
use crate::bytefs_lib::types::{FsError, FsResult};

/// Inode-table superpages: large devices chain 2 MiB pages, small (test)
/// devices 64 KiB, so the table never dwarfs the image.
pub const LARGE_TABLE_BLOCKS: u64 = 512;
pub const SMALL_TABLE_BLOCKS: u64 = 16;
pub const LARGE_TABLE_DEVICE_THRESHOLD: u64 = 512 << 20;

/// Per-open-inode DRAM state.
#[derive(Debug, Default)]
pub struct InodeInfoHeader {
    pub ino: u64,
    pub pi_addr: u64,
    pub alter_pi_addr: u64,
    /* DRAM mirrors of the PM log pointers */
    pub log_head: u64,
    pub log_tail: u64,
    pub alter_log_head: u64,
    pub alter_log_tail: u64,
    pub log_pages: u64,
    pub i_size: u64,
    pub i_mode: u16,
    pub i_links_count: u16,
    pub i_flags: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub atime: u32,
    /// pgoff -> PM address of the latest FILE_WRITE entry covering it
    pub radix: BTreeMap<u64, u64>,
    /// BKDRHash(name) -> PM addresses of live dentries with that hash
    pub dentries: BTreeMap<u64, Vec<u64>>,
    pub last_setattr: u64,
    pub last_link_change: u64,
    /// Live MMAP_WRITE ranges; data protection is inoperative under them.
    pub mmap_ranges: Vec<(u64, u64)>,
    pub trans_id: u64,
    pub valid_entries: u64,
    /// Set when an invariant broke; further writes are refused.
    pub corrupt: bool,
}

impl InodeInfoHeader {
    pub fn new(ino: u64) -> Self {
        Self {
            ino,
            ..Default::default()
        }
    }

    pub fn next_trans_id(&mut self) -> u64 {
        self.trans_id += 1;
        self.trans_id
    }

    pub fn apply_from(&mut self, inode: &Inode) {
        self.log_head = inode.log_head;
        self.log_tail = inode.log_tail;
        self.alter_log_head = inode.alter_log_head;
        self.alter_log_tail = inode.alter_log_tail;
        self.i_size = inode.i_size;
        self.i_mode = inode.i_mode;
        self.i_links_count = inode.i_links_count;
        self.i_flags = inode.i_flags;
        self.mtime = inode.i_mtime;
        self.ctime = inode.i_ctime;
        self.atime = inode.i_atime;
    }
}

/// Used inode-number intervals for one CPU, in index space (`ino / cpus`).
struct InodeMap {
    used: BTreeMap<u64, u64>, /* low -> high, inclusive */
}

impl InodeMap {
    fn mark_used(&mut self, index: u64) -> FsResult<()> {
        let prev = self.used.range(..=index).next_back().map(|(l, h)| (*l, *h));
        if let Some((_, h)) = prev {
            if h >= index {
                return Err(FsError::Corrupt);
            }
        }
        let next = self.used.range(index..).next().map(|(l, h)| (*l, *h));
        let merge_left = prev.map_or(false, |(_, h)| h + 1 == index);
        let merge_right = next.map_or(false, |(l, _)| index + 1 == l);
        match (merge_left, merge_right) {
            (true, true) => {
                let (pl, _) = prev.unwrap();
                let (nl, nh) = next.unwrap();
                self.used.remove(&nl);
                *self.used.get_mut(&pl).unwrap() = nh;
            }
            (true, false) => {
                let (pl, _) = prev.unwrap();
                *self.used.get_mut(&pl).unwrap() = index;
            }
            (false, true) => {
                let (nl, nh) = next.unwrap();
                self.used.remove(&nl);
                self.used.insert(index, nh);
            }
            (false, false) => {
                self.used.insert(index, index);
            }
        }
        Ok(())
    }

    fn first_free(&self, floor: u64) -> u64 {
        let mut candidate = floor;
        for (&low, &high) in self.used.range(..) {
            if high < candidate {
                continue;
            }
            if low > candidate {
                break;
            }
            candidate = high + 1;
        }
        candidate
    }

    fn release(&mut self, index: u64) -> FsResult<()> {
        let (low, high) = self
            .used
            .range(..=index)
            .next_back()
            .map(|(l, h)| (*l, *h))
            .ok_or(FsError::Invalid)?;
        if index > high {
            return Err(FsError::Invalid);
        }
        self.used.remove(&low);
        if low < index {
            self.used.insert(low, index - 1);
        }
        if high > index {
            self.used.insert(index + 1, high);
        }
        Ok(())
    }
}

pub struct InodeStore {
    layout: FsLayout,
    metadata_csum: bool,
    table_blocks: u64,
    maps: Vec<Mutex<InodeMap>>,
}

impl InodeStore {
    pub fn new(layout: FsLayout, metadata_csum: bool) -> Self {
        let cpus = layout.cpus as u64;
        let table_blocks = if layout.num_blocks << BLOCK_SHIFT >= LARGE_TABLE_DEVICE_THRESHOLD {
            LARGE_TABLE_BLOCKS
        } else {
            SMALL_TABLE_BLOCKS
        };
        let mut maps = Vec::new();
        for cpu in 0..cpus {
            let mut map = InodeMap {
                used: BTreeMap::new(),
            };
            // reserve the striped indexes that map to inos below
            // NORMAL_INODE_START
            let mut index = 0;
            while index * cpus + cpu < NORMAL_INODE_START {
                map.mark_used(index).expect("fresh map");
                index += 1;
            }
            maps.push(Mutex::new(map));
        }
        Self {
            layout,
            metadata_csum,
            table_blocks,
            maps,
        }
    }

    pub fn cpus(&self) -> u64 {
        self.layout.cpus as u64
    }

    pub fn inodes_per_table_page(&self) -> u64 {
        ((self.table_blocks << BLOCK_SHIFT) - 8) / INODE_SIZE as u64
    }

    pub fn table_blocks(&self) -> u64 {
        self.table_blocks
    }

    /// Superpage PM addresses of `cpu`'s table chain, in order.
    pub fn table_chain(&self, pm: &PmDevice, cpu: u64, replica: bool) -> FsResult<Vec<u64>> {
        let mut pages = vec![];
        let mut page = self.read_u64(pm, self.table_root_addr(cpu, replica))?;
        while page != 0 {
            pages.push(page);
            page = self.read_u64(pm, page + (self.table_blocks << BLOCK_SHIFT) - 8)?;
        }
        Ok(pages)
    }

    /// PM address of the root pointer for `cpu`'s table chain.
    fn table_root_addr(&self, cpu: u64, replica: bool) -> u64 {
        let block = if replica {
            self.layout.inode_table1_block()
        } else {
            self.layout.inode_table0_block()
        };
        (block << BLOCK_SHIFT) + cpu * CACHELINE_SIZE as u64
    }

    fn read_u64(&self, pm: &PmDevice, addr: u64) -> FsResult<u64> {
        let mut bytes = [0u8; 8];
        pm.read_bytes(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_u64(&self, pm: &PmDevice, addr: u64, value: u64) -> FsResult<()> {
        pm.scoped_write(addr, &value.to_le_bytes(), true)
    }

    /// PM address of the inode copy for `ino`, extending the table chain on
    /// demand when `alloc` is given.
    fn inode_addr_inner(
        &self,
        pm: &PmDevice,
        ino: u64,
        replica: bool,
        alloc: Option<&BlockAlloc>,
    ) -> FsResult<u64> {
        if ino == 0 {
            return Err(FsError::Invalid);
        }
        if ino < RESERVED_INODES {
            return Ok(self.layout.reserved_inode_addr(ino, replica));
        }
        let cpus = self.cpus();
        let cpu = ino % cpus;
        let index = ino / cpus;
        let per_page = self.inodes_per_table_page();
        let mut hops = index / per_page;
        let slot = index % per_page;

        let mut ptr_addr = self.table_root_addr(cpu, replica);
        let mut page = self.read_u64(pm, ptr_addr)?;
        loop {
            if page == 0 {
                let alloc = alloc.ok_or(FsError::Access)?;
                let (blocknr, got) = alloc.new_log_blocks(
                    pm,
                    self.table_blocks,
                    cpu as i32,
                    AllocInit::Zero,
                    AllocDirection::FromHead,
                )?;
                if got < self.table_blocks {
                    alloc.free_log_blocks(blocknr, got)?;
                    return Err(FsError::NoSpace);
                }
                page = blocknr << BLOCK_SHIFT;
                self.write_u64(pm, ptr_addr, page)?;
                debug!(
                    "inode table cpu {} ({}): appended superpage at block {}",
                    cpu,
                    if replica { "replica" } else { "primary" },
                    blocknr
                );
            }
            if hops == 0 {
                return Ok(page + slot * INODE_SIZE as u64);
            }
            hops -= 1;
            // the last 8 bytes of a superpage chain to the next one
            ptr_addr = page + (self.table_blocks << BLOCK_SHIFT) - 8;
            page = self.read_u64(pm, ptr_addr)?;
        }
    }

    pub fn inode_addr(&self, pm: &PmDevice, ino: u64, replica: bool) -> FsResult<u64> {
        self.inode_addr_inner(pm, ino, replica, None)
    }

    pub fn inode_addr_alloc(
        &self,
        pm: &PmDevice,
        alloc: &BlockAlloc,
        ino: u64,
        replica: bool,
    ) -> FsResult<u64> {
        self.inode_addr_inner(pm, ino, replica, Some(alloc))
    }

    /// Persist both copies of `inode` with a fresh checksum.
    pub fn write_inode(&self, pm: &PmDevice, alloc: &BlockAlloc, inode: &mut Inode) -> FsResult<()> {
        inode.update_csum();
        let primary = self.inode_addr_alloc(pm, alloc, inode.ino, false)?;
        pm.scoped_write(primary, zerocopy::AsBytes::as_bytes(inode), false)?;
        let replica = self.inode_addr_alloc(pm, alloc, inode.ino, true)?;
        pm.scoped_write(replica, zerocopy::AsBytes::as_bytes(inode), true)?;
        Ok(())
    }

    fn read_inode_at(&self, pm: &PmDevice, addr: u64) -> FsResult<Inode> {
        pm.read_typed::<Inode>(addr)
    }

    /// Read `ino`, validating the checksum and repairing a rotten copy from
    /// its sibling. Fails with `Io` when both copies are bad.
    pub fn check_inode_integrity(&self, pm: &PmDevice, ino: u64) -> FsResult<Inode> {
        let primary_addr = self.inode_addr(pm, ino, false)?;
        let primary = self.read_inode_at(pm, primary_addr);
        if !self.metadata_csum {
            return primary;
        }
        let replica_addr = self.inode_addr(pm, ino, true)?;
        let primary_good = matches!(&primary, Ok(pi) if pi.csum_ok());
        if primary_good {
            // opportunistically verify the replica and repair it
            let replica = self.read_inode_at(pm, replica_addr);
            let replica_good = matches!(&replica, Ok(pi) if pi.csum_ok());
            if !replica_good {
                let pi = primary.as_ref().unwrap();
                warn!("inode {} replica copy bad, repairing from primary", ino);
                pm.scoped_write(replica_addr, zerocopy::AsBytes::as_bytes(pi), true)?;
            }
            return primary;
        }
        let replica = self.read_inode_at(pm, replica_addr)?;
        if !replica.csum_ok() {
            error!("inode {}: both copies fail their checksum", ino);
            return Err(FsError::Io);
        }
        warn!("inode {} primary copy bad, repairing from replica", ino);
        pm.scoped_write(primary_addr, zerocopy::AsBytes::as_bytes(&replica), true)?;
        Ok(replica)
    }

    /// Allocate an unused inode number striped onto `cpu`.
    pub fn alloc_ino(&self, cpu: u64) -> FsResult<u64> {
        let cpus = self.cpus();
        let cpu = cpu % cpus;
        let mut map = self.maps[cpu as usize].lock().unwrap();
        let index = map.first_free(0);
        map.mark_used(index)?;
        let ino = index * cpus + cpu;
        debug_assert!(ino >= NORMAL_INODE_START);
        trace!("alloc ino {} (cpu {}, index {})", ino, cpu, index);
        Ok(ino)
    }

    pub fn free_ino(&self, ino: u64) -> FsResult<()> {
        let cpus = self.cpus();
        let cpu = (ino % cpus) as usize;
        let index = ino / cpus;
        self.maps[cpu].lock().unwrap().release(index)
    }

    /// Recovery hook: record `ino` as live.
    pub fn mark_ino_used(&self, ino: u64) -> FsResult<()> {
        let cpus = self.cpus();
        let cpu = (ino % cpus) as usize;
        let index = ino / cpus;
        self.maps[cpu].lock().unwrap().mark_used(index)
    }

    /// Checkpoint tuples; the CPU is packed into the top byte of both
    /// bounds so striped index ranges survive the flat array format.
    pub fn checkpoint(&self) -> Vec<(u64, u64)> {
        let mut out = vec![];
        for (cpu, map) in self.maps.iter().enumerate() {
            let tag = (cpu as u64) << 56;
            let map = map.lock().unwrap();
            for (&low, &high) in map.used.iter() {
                out.push((low | tag, high | tag));
            }
        }
        out
    }

    pub fn restore(&self, ranges: &[(u64, u64)]) -> FsResult<()> {
        for map in &self.maps {
            map.lock().unwrap().used.clear();
        }
        let mask = (1u64 << 56) - 1;
        for &(low, high) in ranges {
            let cpu = (low >> 56) as usize;
            if cpu != (high >> 56) as usize || cpu >= self.maps.len() {
                return Err(FsError::Corrupt);
            }
            let mut map = self.maps[cpu].lock().unwrap();
            let (low, high) = (low & mask, high & mask);
            if high < low {
                return Err(FsError::Corrupt);
            }
            map.used.insert(low, high);
        }
        Ok(())
    }

    pub fn map_len(&self, cpu: usize) -> usize {
        self.maps[cpu].lock().unwrap().used.len()
    }
}

const _: () = assert!(size_of::<Inode>() == INODE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;
    use std::sync::Arc;

    fn setup(cpus: u32, blocks: u64) -> (PmDevice, BlockAlloc, InodeStore) {
        let layout = FsLayout::new(cpus, blocks);
        let driver = Arc::new(RamSsdDriver::new(blocks << BLOCK_SHIFT));
        let pm = PmDevice::new(driver, false).unwrap();
        let alloc = BlockAlloc::new(&layout, false, false).unwrap();
        let store = InodeStore::new(layout, true);
        (pm, alloc, store)
    }

    #[test]
    fn ino_allocation_is_striped() -> Result<()> {
        let (_pm, _alloc, store) = setup(4, 1024);
        let a = store.alloc_ino(0)?;
        let b = store.alloc_ino(1)?;
        let c = store.alloc_ino(0)?;
        assert_eq!(a % 4, 0);
        assert_eq!(b % 4, 1);
        assert_eq!(c, a + 4);
        assert!(a >= NORMAL_INODE_START && b >= NORMAL_INODE_START);
        store.free_ino(a)?;
        // freed number is reused first
        assert_eq!(store.alloc_ino(0)?, a);
        Ok(())
    }

    #[test]
    fn reserved_inos_never_allocated() -> Result<()> {
        let (_pm, _alloc, store) = setup(2, 1024);
        for _ in 0..64 {
            let ino = store.alloc_ino(0)?;
            assert!(ino >= NORMAL_INODE_START);
            let ino = store.alloc_ino(1)?;
            assert!(ino >= NORMAL_INODE_START);
        }
        Ok(())
    }

    #[test]
    fn inode_write_and_integrity() -> Result<()> {
        let (pm, alloc, store) = setup(2, 1024);
        let ino = store.alloc_ino(0)?;
        let mut inode = Inode::default();
        inode.ino = ino;
        inode.valid = 1;
        inode.i_size = 4096;
        store.write_inode(&pm, &alloc, &mut inode)?;
        let back = store.check_inode_integrity(&pm, ino)?;
        assert_eq!(back.i_size, 4096);
        Ok(())
    }

    #[test]
    fn replica_repairs_primary() -> Result<()> {
        let (pm, alloc, store) = setup(2, 1024);
        let ino = store.alloc_ino(1)?;
        let mut inode = Inode::default();
        inode.ino = ino;
        inode.valid = 1;
        inode.i_links_count = 3;
        store.write_inode(&pm, &alloc, &mut inode)?;

        // flip one byte of the primary copy
        let addr = store.inode_addr(&pm, ino, false)?;
        let mut byte = [0u8; 1];
        pm.read_bytes(addr + 40, &mut byte)?;
        pm.write_bytes(addr + 40, &[byte[0] ^ 0xff])?;

        let back = store.check_inode_integrity(&pm, ino)?;
        assert_eq!(back.i_links_count, 3);
        // primary was repaired in place
        let healed: Inode = pm.read_typed(addr)?;
        assert!(healed.csum_ok());

        // now break both copies differently
        let alter = store.inode_addr(&pm, ino, true)?;
        pm.write_bytes(addr + 40, &[0xaa])?;
        pm.write_bytes(alter + 44, &[0xbb])?;
        assert_eq!(store.check_inode_integrity(&pm, ino), Err(FsError::Io));
        Ok(())
    }

    #[test]
    fn table_extends_for_high_inos() -> Result<()> {
        let (pm, alloc, store) = setup(1, 2048);
        let per_page = store.inodes_per_table_page();
        // an ino two superpages in forces two chained extensions
        let ino = per_page * 2 + 5;
        let addr = store.inode_addr_alloc(&pm, &alloc, ino, false)?;
        let mut inode = Inode::default();
        inode.ino = ino;
        inode.valid = 1;
        inode.update_csum();
        pm.scoped_write(addr, zerocopy::AsBytes::as_bytes(&inode), true)?;
        let back = store.check_inode_integrity(&pm, ino)?;
        assert_eq!(back.ino, ino);
        // the address is stable once allocated
        assert_eq!(store.inode_addr(&pm, ino, false)?, addr);
        Ok(())
    }

    #[test]
    fn checkpoint_restore_round_trip() -> Result<()> {
        let (_pm, _alloc, store) = setup(2, 1024);
        let a = store.alloc_ino(0)?;
        let b = store.alloc_ino(1)?;
        let ckpt = store.checkpoint();
        let store2 = {
            let layout = FsLayout::new(2, 1024);
            InodeStore::new(layout, false)
        };
        store2.restore(&ckpt)?;
        // both inos stay used after restore
        let c = store2.alloc_ino(0)?;
        let d = store2.alloc_ino(1)?;
        assert_ne!(c, a);
        assert_ne!(d, b);
        Ok(())
    }
}
