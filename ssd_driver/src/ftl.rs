//! Emulated flash translation layer.
//!
//! One background thread owns all NAND state and drains a bounded
//! multi-producer ring. Callers block on a per-command completion channel,
//! which models the device round trip of the real interface.
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_queue::ArrayQueue;
use log::*;

use crate::heap::MinHeap;
use crate::mt::{CoalescingMt, IndirectionMt, INVALID_LPN};
use crate::{gc, issue, SsdConst, SsdDriver, SsdStats, LOG_REGION_SIZE, PG_SIZE};

pub const UNMAPPED_PPA: u64 = u64::MAX;

/// Ring capacity; pushes spin when the ring is momentarily full.
const MAX_REQ: usize = 1024;
/// Log-region pool: 4096 slots of 64 B, coalesced before they hit NAND.
const LOG_REGION_SLOTS: usize = 4096;
/// Mapping tables are kept sparse so Robin-Hood probes stay short.
const MT_SIZE: usize = LOG_REGION_SLOTS * 2;
/// GC starts when a channel's free-block count drops below this.
pub(crate) const GC_FREE_BLOCKS_LOW: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct SsdGeometry {
    pub channels: usize,
    pub luns_per_ch: usize,
    pub blks_per_lun: usize,
    pub pgs_per_blk: usize,
}

impl SsdGeometry {
    /// Geometry able to hold `capacity` logical bytes plus GC headroom.
    pub fn for_capacity(capacity: u64) -> Self {
        let channels = 8;
        let luns_per_ch = 1;
        let pgs_per_blk = 64;
        let logical_pages = (capacity as usize + PG_SIZE - 1) / PG_SIZE;
        let logical_blocks = (logical_pages + pgs_per_blk - 1) / pgs_per_blk;
        // an eighth of spare space, and at least enough per-channel slack
        // that the write pointer and GC never deadlock
        let physical_blocks = logical_blocks + logical_blocks / 8 + channels * 4;
        let blks_per_lun = (physical_blocks + channels * luns_per_ch - 1) / (channels * luns_per_ch);
        Self {
            channels,
            luns_per_ch,
            blks_per_lun,
            pgs_per_blk,
        }
    }

    pub fn total_blocks(&self) -> usize {
        self.channels * self.luns_per_ch * self.blks_per_lun
    }

    pub fn total_pages(&self) -> usize {
        self.total_blocks() * self.pgs_per_blk
    }

    /// Global block id of (channel, lun, blk).
    pub fn block_id(&self, ch: usize, lun: usize, blk: usize) -> u64 {
        (((ch * self.luns_per_ch) + lun) * self.blks_per_lun + blk) as u64
    }

    pub fn block_channel(&self, block_id: u64) -> usize {
        block_id as usize / (self.luns_per_ch * self.blks_per_lun)
    }

    pub fn first_ppn(&self, block_id: u64) -> u64 {
        block_id * self.pgs_per_blk as u64
    }

    pub fn block_of_ppn(&self, ppn: u64) -> u64 {
        ppn / self.pgs_per_blk as u64
    }
}

#[derive(Default, Clone, Copy)]
pub(crate) struct BlockMeta {
    pub vpc: i64,
    pub ipc: i64,
    pub erase_cnt: u64,
}

/// All NAND-side state. Owned by the FTL thread, never shared.
pub(crate) struct FtlState {
    pub geo: SsdGeometry,
    pub logical_pages: usize,
    pub nand: Vec<u8>,
    /// lpn -> ppn
    pub maptbl: Vec<u64>,
    /// ppn -> lpn, for GC
    pub rmap: Vec<u64>,
    pub blocks: Vec<BlockMeta>,
    /// per-channel free block stacks
    pub free_blocks: Vec<Vec<u64>>,
    /// per-channel open block and next page to program in it
    pub open_block: Vec<u64>,
    pub next_pg: Vec<usize>,
    /// striping pointer across channels
    pub wp_ch: usize,
    /// coalescing log
    pub log_buf: Vec<u8>,
    pub free_slots: Vec<u64>,
    pub imt: IndirectionMt,
    pub cmt: CoalescingMt,
    pub consts: SsdConst,
    pub stats: SsdStats,
}

impl FtlState {
    fn new(consts: SsdConst) -> Self {
        let geo = SsdGeometry::for_capacity(consts.layout_size);
        let logical_pages = (consts.layout_size as usize + PG_SIZE - 1) / PG_SIZE;
        let mut free_blocks: Vec<Vec<u64>> = vec![Vec::new(); geo.channels];
        for ch in 0..geo.channels {
            for lun in 0..geo.luns_per_ch {
                for blk in 0..geo.blks_per_lun {
                    free_blocks[ch].push(geo.block_id(ch, lun, blk));
                }
            }
            // pop order is irrelevant, keep low ids first
            free_blocks[ch].reverse();
        }
        let mut state = Self {
            geo,
            logical_pages,
            nand: vec![0u8; geo.total_pages() * PG_SIZE],
            maptbl: vec![UNMAPPED_PPA; logical_pages],
            rmap: vec![INVALID_LPN; geo.total_pages()],
            blocks: vec![BlockMeta::default(); geo.total_blocks()],
            free_blocks,
            open_block: vec![0; geo.channels],
            next_pg: vec![0; geo.channels],
            wp_ch: 0,
            log_buf: vec![0u8; LOG_REGION_SLOTS * LOG_REGION_SIZE],
            free_slots: (0..LOG_REGION_SLOTS as u64).rev().collect(),
            imt: IndirectionMt::new(MT_SIZE),
            cmt: CoalescingMt::new(MT_SIZE),
            consts,
            stats: SsdStats::default(),
        };
        for ch in 0..state.geo.channels {
            let blk = state.free_blocks[ch].pop().expect("empty channel");
            state.open_block[ch] = blk;
            state.next_pg[ch] = 0;
        }
        state
    }

    /// Next programmable ppn, advancing (channel, block, page). Runs GC when
    /// the target channel is short on free blocks.
    pub(crate) fn advance_write_pointer(&mut self) -> Result<u64> {
        let ch = self.wp_ch;
        self.wp_ch = (self.wp_ch + 1) % self.geo.channels;
        if self.next_pg[ch] == self.geo.pgs_per_blk {
            let mut rounds = 0;
            while self.free_blocks[ch].len() <= GC_FREE_BLOCKS_LOW {
                gc::run_channel_gc(self, ch)?;
                rounds += 1;
                if rounds > self.geo.blks_per_lun {
                    return Err(anyhow!("GC makes no progress on channel {}", ch));
                }
            }
            let blk = self.free_blocks[ch]
                .pop()
                .ok_or_else(|| anyhow!("channel {} has no free NAND block", ch))?;
            self.open_block[ch] = blk;
            self.next_pg[ch] = 0;
        }
        let ppn = self.geo.first_ppn(self.open_block[ch]) + self.next_pg[ch] as u64;
        self.next_pg[ch] += 1;
        Ok(ppn)
    }

    /// Program `data` for `lpn`, invalidating any previous mapping.
    pub(crate) fn program_page(&mut self, lpn: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), PG_SIZE);
        let old = self.maptbl[lpn as usize];
        if old != UNMAPPED_PPA {
            let blk = self.geo.block_of_ppn(old) as usize;
            self.blocks[blk].vpc -= 1;
            self.blocks[blk].ipc += 1;
            self.rmap[old as usize] = INVALID_LPN;
        }
        let ppn = self.advance_write_pointer()?;
        let base = ppn as usize * PG_SIZE;
        self.nand[base..base + PG_SIZE].copy_from_slice(data);
        self.maptbl[lpn as usize] = ppn;
        self.rmap[ppn as usize] = lpn;
        self.blocks[self.geo.block_of_ppn(ppn) as usize].vpc += 1;
        self.stats.page_write_cnt += 1;
        if self.consts.write_lat > 0 {
            thread::sleep(Duration::from_nanos(self.consts.write_lat as u64));
        }
        Ok(())
    }

    /// NAND content of `lpn` without pending-region overlay.
    pub(crate) fn read_nand_page(&mut self, lpn: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), PG_SIZE);
        let ppn = self.maptbl[lpn as usize];
        if ppn == UNMAPPED_PPA {
            buf.fill(0);
        } else {
            let base = ppn as usize * PG_SIZE;
            buf.copy_from_slice(&self.nand[base..base + PG_SIZE]);
        }
        self.stats.page_read_cnt += 1;
        if self.consts.read_lat > 0 {
            thread::sleep(Duration::from_nanos(self.consts.read_lat as u64));
        }
    }

    fn check_range(&self, lpa: u64, len: usize) -> Result<()> {
        if lpa + len as u64 > self.consts.layout_size {
            return Err(anyhow!(
                "access [{:#x}, {:#x}) beyond device size {:#x}",
                lpa,
                lpa + len as u64,
                self.consts.layout_size
            ));
        }
        Ok(())
    }
}

enum FtlCmd {
    ByteRead {
        lpa: u64,
        len: usize,
        done: mpsc::Sender<Result<Vec<u8>>>,
    },
    ByteWrite {
        lpa: u64,
        data: Vec<u8>,
        done: mpsc::Sender<Result<()>>,
    },
    Sync {
        done: mpsc::Sender<Result<()>>,
    },
    Reset {
        done: mpsc::Sender<Result<()>>,
    },
    Exit,
}

/// The public driver handle. Cloneable across filesystem threads via `Arc`.
pub struct EmuSsdDriver {
    consts: SsdConst,
    ring: Arc<ArrayQueue<FtlCmd>>,
    stats: Arc<Mutex<SsdStats>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EmuSsdDriver {
    pub fn new(size: u64) -> Self {
        Self::with_consts(SsdConst {
            layout_size: size,
            ..Default::default()
        })
    }

    pub fn with_consts(consts: SsdConst) -> Self {
        let ring: Arc<ArrayQueue<FtlCmd>> = Arc::new(ArrayQueue::new(MAX_REQ));
        let stats = Arc::new(Mutex::new(SsdStats::default()));
        let thread_ring = ring.clone();
        let thread_stats = stats.clone();
        let thread_consts = consts.clone();
        let handle = thread::Builder::new()
            .name("bytefs-ftl".into())
            .spawn(move || ftl_thread(thread_consts, thread_ring, thread_stats))
            .expect("spawn ftl thread");
        info!(
            "emulated SSD up: {} bytes, geometry {:?}",
            consts.layout_size,
            SsdGeometry::for_capacity(consts.layout_size)
        );
        Self {
            consts,
            ring,
            stats,
            thread: Mutex::new(Some(handle)),
        }
    }

    fn submit(&self, mut cmd: FtlCmd) {
        loop {
            match self.ring.push(cmd) {
                Ok(()) => return,
                Err(back) => {
                    cmd = back;
                    thread::yield_now();
                }
            }
        }
    }
}

impl SsdDriver for EmuSsdDriver {
    fn open(&self, tag: &str) -> Result<()> {
        debug!("EmuSsd open: {}", tag);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.sync()?;
        if let Some(handle) = self.thread.lock().unwrap().take() {
            self.submit(FtlCmd::Exit);
            handle.join().map_err(|_| anyhow!("ftl thread panicked"))?;
        }
        Ok(())
    }

    fn byte_read(&self, lpa: u64, buf: &mut [u8]) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(FtlCmd::ByteRead {
            lpa,
            len: buf.len(),
            done: tx,
        });
        let data = rx.recv().map_err(|_| anyhow!("ftl thread gone"))??;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn byte_write(&self, lpa: u64, buf: &[u8]) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(FtlCmd::ByteWrite {
            lpa,
            data: buf.to_vec(),
            done: tx,
        });
        rx.recv().map_err(|_| anyhow!("ftl thread gone"))?
    }

    fn sync(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(FtlCmd::Sync { done: tx });
        rx.recv().map_err(|_| anyhow!("ftl thread gone"))?
    }

    fn reset(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(FtlCmd::Reset { done: tx });
        rx.recv().map_err(|_| anyhow!("ftl thread gone"))?
    }

    fn consts(&self) -> SsdConst {
        self.consts.clone()
    }

    fn stats(&self) -> SsdStats {
        *self.stats.lock().unwrap()
    }
}

impl Drop for EmuSsdDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            self.submit(FtlCmd::Exit);
            let _ = handle.join();
        }
    }
}

fn ftl_thread(consts: SsdConst, ring: Arc<ArrayQueue<FtlCmd>>, stats: Arc<Mutex<SsdStats>>) {
    let mut state = FtlState::new(consts.clone());
    loop {
        let cmd = match ring.pop() {
            Some(cmd) => cmd,
            None => {
                thread::sleep(Duration::from_micros(20));
                continue;
            }
        };
        match cmd {
            FtlCmd::ByteRead { lpa, len, done } => {
                let result = state.check_range(lpa, len).and_then(|_| {
                    let mut buf = vec![0u8; len];
                    issue::handle_byte_read(&mut state, lpa, &mut buf)?;
                    Ok(buf)
                });
                let _ = done.send(result);
            }
            FtlCmd::ByteWrite { lpa, data, done } => {
                let result = state
                    .check_range(lpa, data.len())
                    .and_then(|_| issue::handle_byte_write(&mut state, lpa, &data));
                let _ = done.send(result);
            }
            FtlCmd::Sync { done } => {
                let _ = done.send(issue::flush_all(&mut state));
            }
            FtlCmd::Reset { done } => {
                state = FtlState::new(consts.clone());
                let _ = done.send(Ok(()));
            }
            FtlCmd::Exit => break,
        }
        *stats.lock().unwrap() = state.stats;
    }
    debug!("ftl thread exits");
}

/// Builds a per-channel victim heap keyed by valid-page count. Shared by the
/// GC module and its tests.
pub(crate) fn victim_heap(state: &FtlState, ch: usize) -> MinHeap {
    let mut heap = MinHeap::new(state.geo.blks_per_lun);
    for lun in 0..state.geo.luns_per_ch {
        for blk in 0..state.geo.blks_per_lun {
            let id = state.geo.block_id(ch, lun, blk);
            if state.open_block[ch] == id || state.free_blocks[ch].contains(&id) {
                continue;
            }
            let meta = &state.blocks[id as usize];
            if meta.vpc + meta.ipc == state.geo.pgs_per_blk as i64 {
                heap.insert(meta.vpc, id);
            }
        }
    }
    heap
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn simple_test() -> Result<()> {
        let driver = EmuSsdDriver::new(1 << 20);
        crate::driver_tester(&driver)?;
        driver.close()
    }

    #[test]
    fn geometry_covers_capacity() {
        let geo = SsdGeometry::for_capacity(1 << 26);
        let logical_pages = (1usize << 26) / PG_SIZE;
        assert!(geo.total_pages() > logical_pages);
        // headroom for GC
        assert!(geo.total_pages() - logical_pages >= geo.channels * geo.pgs_per_blk);
    }

    #[test]
    fn byte_then_page_visibility() -> Result<()> {
        let driver = EmuSsdDriver::new(1 << 20);
        // small writes stay pending in the coalescing log until sync
        driver.byte_write(64, &[1u8; 64])?;
        driver.byte_write(8192, &[2u8; 64])?;
        driver.sync()?;
        let mut buf = [0u8; 64];
        driver.byte_read(64, &mut buf)?;
        assert_eq!(buf, [1u8; 64]);
        driver.byte_read(8192, &mut buf)?;
        assert_eq!(buf, [2u8; 64]);
        driver.close()
    }

    #[test]
    fn round_trip_arbitrary_span() -> Result<()> {
        let driver = EmuSsdDriver::new(1 << 20);
        let data: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        driver.byte_write(4096 - 100, &data)?;
        let mut back = vec![0u8; data.len()];
        driver.byte_read(4096 - 100, &mut back)?;
        assert_eq!(data, back);
        driver.close()
    }
}
