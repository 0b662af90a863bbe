//! Byte-issue path: splits arbitrary spans at 64 B log-region boundaries and
//! coalesces pending regions until a whole page is worth programming.
use anyhow::{anyhow, Result};
use log::*;

use crate::ftl::{FtlState, UNMAPPED_PPA};
use crate::{LOG_REGION_MASK, LOG_REGION_SIZE, PG_MASK, PG_SIZE, REGIONS_PER_PAGE};

/// Read with pending-region overlay. The span may cross page boundaries.
pub(crate) fn handle_byte_read(state: &mut FtlState, lpa: u64, buf: &mut [u8]) -> Result<()> {
    state.stats.byte_read_cnt += 1;
    let end = lpa + buf.len() as u64;
    let mut region = lpa & !LOG_REGION_MASK;
    while region < end {
        let lo = region.max(lpa);
        let hi = (region + LOG_REGION_SIZE as u64).min(end);
        let mut tmp = [0u8; LOG_REGION_SIZE];
        read_region(state, region, &mut tmp);
        let dst = (lo - lpa) as usize;
        let src = (lo - region) as usize;
        buf[dst..dst + (hi - lo) as usize].copy_from_slice(&tmp[src..src + (hi - lo) as usize]);
        region += LOG_REGION_SIZE as u64;
    }
    Ok(())
}

/// Write, splitting into an unaligned prefix, whole 64 B regions, and an
/// unaligned suffix. Unaligned edges fetch the containing region, overlay the
/// new bytes and write the region back.
pub(crate) fn handle_byte_write(state: &mut FtlState, lpa: u64, data: &[u8]) -> Result<()> {
    state.stats.byte_write_cnt += 1;
    let end = lpa + data.len() as u64;
    let mut region = lpa & !LOG_REGION_MASK;
    while region < end {
        let lo = region.max(lpa);
        let hi = (region + LOG_REGION_SIZE as u64).min(end);
        let chunk = &data[(lo - lpa) as usize..(hi - lpa) as usize];
        if (hi - lo) as usize == LOG_REGION_SIZE {
            write_region(state, region, chunk)?;
        } else {
            let mut tmp = [0u8; LOG_REGION_SIZE];
            read_region(state, region, &mut tmp);
            let off = (lo - region) as usize;
            tmp[off..off + chunk.len()].copy_from_slice(chunk);
            write_region(state, region, &tmp)?;
        }
        region += LOG_REGION_SIZE as u64;
    }
    Ok(())
}

/// Merge every page with pending regions down to NAND.
pub(crate) fn flush_all(state: &mut FtlState) -> Result<()> {
    let lpns = state.cmt.pending_lpns();
    trace!("coalescing flush of {} pages", lpns.len());
    for lpn_base in lpns {
        flush_page(state, lpn_base)?;
    }
    Ok(())
}

fn read_region(state: &mut FtlState, region_lpa: u64, out: &mut [u8; LOG_REGION_SIZE]) {
    if let Some(slot) = state.imt.get(region_lpa) {
        let base = slot as usize * LOG_REGION_SIZE;
        out.copy_from_slice(&state.log_buf[base..base + LOG_REGION_SIZE]);
        return;
    }
    let lpn = (region_lpa & !PG_MASK) / PG_SIZE as u64;
    let ppn = state.maptbl[lpn as usize];
    if ppn == UNMAPPED_PPA {
        out.fill(0);
    } else {
        let base = ppn as usize * PG_SIZE + (region_lpa & PG_MASK) as usize;
        out.copy_from_slice(&state.nand[base..base + LOG_REGION_SIZE]);
    }
}

fn write_region(state: &mut FtlState, region_lpa: u64, data: &[u8]) -> Result<()> {
    debug_assert_eq!(data.len(), LOG_REGION_SIZE);
    if let Some(slot) = state.imt.get(region_lpa) {
        let base = slot as usize * LOG_REGION_SIZE;
        state.log_buf[base..base + LOG_REGION_SIZE].copy_from_slice(data);
        return Ok(());
    }
    if state.free_slots.is_empty() {
        // pool exhausted: push everything down and start over
        flush_all(state)?;
    }
    let slot = state
        .free_slots
        .pop()
        .ok_or_else(|| anyhow!("log-region pool empty after flush"))?;
    let base = slot as usize * LOG_REGION_SIZE;
    state.log_buf[base..base + LOG_REGION_SIZE].copy_from_slice(data);
    state.imt.insert(region_lpa, slot);
    let bitmap = state.cmt.insert(region_lpa);
    if bitmap == u64::MAX {
        // the whole page is pending, merge it into one program
        flush_page(state, region_lpa & !PG_MASK)?;
    }
    Ok(())
}

/// Merge the pending regions of one page with its NAND content and program
/// the result as a single page write.
fn flush_page(state: &mut FtlState, lpn_base: u64) -> Result<()> {
    debug_assert_eq!(lpn_base & PG_MASK, 0);
    let lpn = lpn_base / PG_SIZE as u64;
    let mut page = vec![0u8; PG_SIZE];
    state.read_nand_page(lpn, &mut page);
    for i in 0..REGIONS_PER_PAGE {
        let region_lpa = lpn_base + (i * LOG_REGION_SIZE) as u64;
        if let Some(slot) = state.imt.get(region_lpa) {
            let src = slot as usize * LOG_REGION_SIZE;
            let dst = i * LOG_REGION_SIZE;
            page[dst..dst + LOG_REGION_SIZE]
                .copy_from_slice(&state.log_buf[src..src + LOG_REGION_SIZE]);
            state.imt.remove(region_lpa);
            state.free_slots.push(slot);
        }
    }
    state.cmt.remove(lpn_base);
    state.program_page(lpn, &page)?;
    state.stats.coalesced_flush_cnt += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftl::EmuSsdDriver;
    use crate::SsdDriver;
    use anyhow::Result;

    #[test]
    fn full_page_of_regions_self_flushes() -> Result<()> {
        let driver = EmuSsdDriver::new(1 << 20);
        // fill all 64 regions of page 2: the coalescing map must merge them
        // into a single program without an explicit sync
        for i in 0..64u64 {
            driver.byte_write(2 * 4096 + i * 64, &[i as u8; 64])?;
        }
        let stats = driver.stats();
        assert!(stats.coalesced_flush_cnt >= 1, "stats: {:?}", stats);
        let mut buf = [0u8; 64];
        for i in 0..64u64 {
            driver.byte_read(2 * 4096 + i * 64, &mut buf)?;
            assert_eq!(buf, [i as u8; 64]);
        }
        driver.close()
    }

    #[test]
    fn overlay_wins_over_nand() -> Result<()> {
        let driver = EmuSsdDriver::new(1 << 20);
        driver.byte_write(0, &vec![9u8; 4096])?;
        driver.sync()?;
        // small overwrite stays pending, read must still see it
        driver.byte_write(128, &[1u8; 32])?;
        let mut buf = [0u8; 256];
        driver.byte_read(0, &mut buf)?;
        assert!(buf[..128].iter().all(|b| *b == 9));
        assert!(buf[128..160].iter().all(|b| *b == 1));
        assert!(buf[160..].iter().all(|b| *b == 9));
        driver.close()
    }
}
