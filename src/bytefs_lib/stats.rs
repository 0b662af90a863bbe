//! Timing accounting and the numeric-opcode control surface.
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::*;
use num_enum::TryFromPrimitive;

use crate::bytefs_lib::balloc::BlockAlloc;
use crate::bytefs_lib::inode::InodeInfoHeader;
use crate::bytefs_lib::layout::{FileWriteEntry, LogEntryType, PageTail};
use crate::bytefs_lib::log::{block_off, for_each_entry, page_tail_addr, LogCtx};
use crate::bytefs_lib::types::FsResult;
use crate::bytefs_lib::utils::deserialize_row;

/// Control opcodes, dispatched by `ByteFs::ioctl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum IoctlCmd {
    PrintTiming = 0xBF01,
    ClearStats = 0xBF02,
    PrintLog = 0xBF03,
    PrintLogPages = 0xBF04,
    PrintFreeLists = 0xBF05,
}

lazy_static! {
    /// Process-wide op timing, keyed by operation name.
    static ref TIMING: Mutex<BTreeMap<&'static str, (u64, Duration)>> = Mutex::new(BTreeMap::new());
}

pub fn account(op: &'static str, elapsed: Duration) {
    let mut timing = TIMING.lock().unwrap();
    let slot = timing.entry(op).or_insert((0, Duration::ZERO));
    slot.0 += 1;
    slot.1 += elapsed;
}

/// Times one operation and books it under `op`.
pub struct OpTimer {
    op: &'static str,
    start: Instant,
}

impl OpTimer {
    pub fn new(op: &'static str) -> Self {
        Self {
            op,
            start: Instant::now(),
        }
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        account(self.op, self.start.elapsed());
    }
}

pub fn print_timing() {
    let timing = TIMING.lock().unwrap();
    info!("=========== timing stats ===========");
    for (op, (count, total)) in timing.iter() {
        let avg = if *count > 0 {
            total.as_nanos() / *count as u128
        } else {
            0
        };
        info!("{:>20}: {:>8} calls, avg {:>8} ns", op, count, avg);
    }
}

pub fn clear_stats() {
    TIMING.lock().unwrap().clear();
    info!("timing stats cleared");
}

/// Dump every live entry of an inode's log.
pub fn print_log(ctx: &LogCtx, sih: &InodeInfoHeader) -> FsResult<()> {
    info!("=== inode {} log [{:#x}, {:#x}] ===", sih.ino, sih.log_head, sih.log_tail);
    for_each_entry(ctx, sih.log_head, sih.log_tail, |addr, kind, bytes| {
        match kind {
            LogEntryType::FileWrite => {
                let e: FileWriteEntry = unsafe { deserialize_row(bytes) };
                let (pgoff, num, block, size) = (e.pgoff, e.num_pages, e.block, e.size);
                info!(
                    "  {:#x} FILE_WRITE pgoff {} x{} -> block {} (size {}, invalid {})",
                    addr, pgoff, num, block, size, e.invalid_pages
                );
            }
            other => info!("  {:#x} {:?} ({} bytes)", addr, other, bytes.len()),
        }
        Ok(true)
    })
}

/// Dump the page chain with its tail records.
pub fn print_log_pages(ctx: &LogCtx, sih: &InodeInfoHeader) -> FsResult<()> {
    info!("=== inode {} log pages ===", sih.ino);
    let mut page = block_off(sih.log_head);
    let mut count = 0;
    while page != 0 {
        let tail: PageTail = ctx.pm.read_typed(page_tail_addr(page))?;
        info!(
            "  page {:#x}: {}/{} invalid, epoch {}, alter {:#x}, next {:#x}",
            page, tail.invalid_entries, tail.num_entries, tail.epoch_id, tail.alter_page, tail.next_page
        );
        page = tail.next_page;
        count += 1;
    }
    info!("  {} pages total", count);
    Ok(())
}

/// Dump every free list's ranges and counters.
pub fn print_free_lists(alloc: &BlockAlloc) {
    info!("=========== free lists ===========");
    for cpu in 0..alloc.cpus() {
        let list = alloc.list(cpu);
        info!(
            "list {}: [{}, {}], {} free in {} nodes, alloc {}/{} pages data/log, freed {}/{}",
            list.index,
            list.block_start,
            list.block_end,
            list.num_free_blocks,
            list.num_blocknode,
            list.alloc_data_pages,
            list.alloc_log_pages,
            list.freed_data_pages,
            list.freed_log_pages,
        );
        for (low, high) in list.ranges() {
            debug!("  range [{}, {}]", low, high);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_accumulates() {
        clear_stats();
        account("unit_test_op", Duration::from_nanos(100));
        account("unit_test_op", Duration::from_nanos(300));
        let timing = TIMING.lock().unwrap();
        let (count, total) = timing.get("unit_test_op").unwrap();
        assert_eq!(*count, 2);
        assert_eq!(*total, Duration::from_nanos(400));
    }

    #[test]
    fn opcodes_decode() {
        assert_eq!(IoctlCmd::try_from(0xBF01u32).unwrap(), IoctlCmd::PrintTiming);
        assert_eq!(IoctlCmd::try_from(0xBF05u32).unwrap(), IoctlCmd::PrintFreeLists);
        assert!(IoctlCmd::try_from(0xBF99u32).is_err());
    }
}
