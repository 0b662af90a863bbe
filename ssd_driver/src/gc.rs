//! NAND garbage collection. Victims are full blocks with the fewest valid
//! pages; their live pages migrate into the channel's open block, the victim
//! is erased and returned to the free pool.
use anyhow::{anyhow, Result};
use log::*;

use crate::ftl::{victim_heap, FtlState};
use crate::mt::INVALID_LPN;
use crate::PG_SIZE;

/// Allocate the next page of `ch`'s open block without recursing into GC.
fn advance_in_channel(state: &mut FtlState, ch: usize) -> Result<u64> {
    if state.next_pg[ch] == state.geo.pgs_per_blk {
        let blk = state.free_blocks[ch]
            .pop()
            .ok_or_else(|| anyhow!("channel {} exhausted during GC", ch))?;
        state.open_block[ch] = blk;
        state.next_pg[ch] = 0;
    }
    let ppn = state.geo.first_ppn(state.open_block[ch]) + state.next_pg[ch] as u64;
    state.next_pg[ch] += 1;
    Ok(ppn)
}

/// Reclaim one block on `ch`. Fails if nothing on the channel has an invalid
/// page to give back.
pub(crate) fn run_channel_gc(state: &mut FtlState, ch: usize) -> Result<()> {
    let mut heap = victim_heap(state, ch);
    let (vpc, victim) = heap
        .pop_min()
        .ok_or_else(|| anyhow!("channel {} has no GC candidate", ch))?;
    if vpc == state.geo.pgs_per_blk as i64 {
        return Err(anyhow!("channel {} only holds fully-valid blocks", ch));
    }
    trace!("gc channel {}: victim block {} vpc {}", ch, victim, vpc);

    let mut moved = 0u64;
    let first = state.geo.first_ppn(victim);
    for pg in 0..state.geo.pgs_per_blk {
        let ppn = first + pg as u64;
        let lpn = state.rmap[ppn as usize];
        if lpn == INVALID_LPN {
            continue;
        }
        let dst = advance_in_channel(state, ch)?;
        let src_base = ppn as usize * PG_SIZE;
        let dst_base = dst as usize * PG_SIZE;
        state
            .nand
            .copy_within(src_base..src_base + PG_SIZE, dst_base);
        state.maptbl[lpn as usize] = dst;
        state.rmap[dst as usize] = lpn;
        state.rmap[ppn as usize] = INVALID_LPN;
        state.blocks[state.geo.block_of_ppn(dst) as usize].vpc += 1;
        moved += 1;
    }

    let meta = &mut state.blocks[victim as usize];
    meta.vpc = 0;
    meta.ipc = 0;
    meta.erase_cnt += 1;
    state.free_blocks[ch].push(victim);
    state.stats.gc_cnt += 1;
    state.stats.gc_moved_pages += moved;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::ftl::EmuSsdDriver;
    use crate::{SsdConst, SsdDriver, PG_SIZE};
    use anyhow::Result;

    #[test]
    fn overwrite_churn_triggers_gc() -> Result<()> {
        // tiny device so repeated overwrites wrap the write pointer
        let driver = EmuSsdDriver::with_consts(SsdConst {
            layout_size: 64 * PG_SIZE as u64,
            ..Default::default()
        });
        let page = vec![0x5au8; PG_SIZE];
        for round in 0..64u64 {
            for lpn in 0..32u64 {
                let mut page = page.clone();
                page[0] = round as u8;
                driver.byte_write(lpn * PG_SIZE as u64, &page)?;
            }
        }
        let stats = driver.stats();
        assert!(stats.gc_cnt > 0, "no GC after heavy churn: {:?}", stats);
        // data must survive the moves
        let mut buf = vec![0u8; PG_SIZE];
        for lpn in 0..32u64 {
            driver.byte_read(lpn * PG_SIZE as u64, &mut buf)?;
            assert_eq!(buf[0], 63);
            assert!(buf[1..].iter().all(|b| *b == 0x5a));
        }
        driver.close()
    }
}
