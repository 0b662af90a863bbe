//! Mount-time recovery: superblock validation with replica fallback, clean
//! checkpoint restore, and the full rescan that rebuilds every DRAM
//! structure from the logs after a crash.
use std::collections::HashMap;
use std::mem::size_of;

use log::*;
use zerocopy::AsBytes;

use crate::bytefs_lib::balloc::{AllocDirection, AllocInit, BlockAlloc};
use crate::bytefs_lib::dir::{insert_dir_tree, insert_write_entry};
use crate::bytefs_lib::inode::{InodeInfoHeader, InodeStore};
use crate::bytefs_lib::layout::{
    Dentry, FileWriteEntry, Inode, LinkChangeEntry, LogEntryType, MmapEntry, PageTail,
    RangeCheckpoint, SetattrEntry, SuperBlock, BLOCK_SHIFT, BLOCK_SIZE, REPLICA_SB_START,
    RESERVED_INODES, SUPER_BLOCK_START,
};
use crate::bytefs_lib::log::{
    block_off, for_each_entry, page_tail_addr, read_entry_checked, LogCtx,
};
use crate::bytefs_lib::pm::PmDevice;
use crate::bytefs_lib::types::{FsError, FsResult};
use crate::bytefs_lib::utils::{bkdr_hash, deserialize_row};

/// Read the superblock, falling back to (and repairing from) the replica.
pub fn recover_superblock(pm: &PmDevice) -> FsResult<SuperBlock> {
    let primary_addr = SUPER_BLOCK_START << BLOCK_SHIFT;
    let replica_addr = REPLICA_SB_START << BLOCK_SHIFT;
    let primary: FsResult<SuperBlock> = pm.read_typed(primary_addr);
    if let Ok(sb) = &primary {
        if sb.magic_matched() && sb.csum_ok() {
            return Ok(*sb);
        }
    }
    warn!("primary superblock bad, trying replica");
    let replica: SuperBlock = pm.read_typed(replica_addr)?;
    if !replica.magic_matched() || !replica.csum_ok() {
        error!("both superblock copies are bad");
        return Err(FsError::Io);
    }
    pm.scoped_write(primary_addr, replica.as_bytes(), true)?;
    Ok(replica)
}

/// Persist both superblock copies with a fresh checksum.
pub fn write_superblock(pm: &PmDevice, sb: &mut SuperBlock) -> FsResult<()> {
    sb.update_csum();
    pm.scoped_write(SUPER_BLOCK_START << BLOCK_SHIFT, sb.as_bytes(), false)?;
    pm.scoped_write(REPLICA_SB_START << BLOCK_SHIFT, sb.as_bytes(), true)?;
    Ok(())
}

/// Write a checkpoint tuple array into freshly allocated blocks.
/// Returns `(block, tuple_count)` for the superblock.
pub fn save_checkpoint(
    pm: &PmDevice,
    alloc: &BlockAlloc,
    ranges: &[(u64, u64)],
) -> FsResult<(u64, u64)> {
    if ranges.is_empty() {
        return Ok((0, 0));
    }
    let bytes_needed = ranges.len() * size_of::<RangeCheckpoint>();
    let blocks_needed = ((bytes_needed + BLOCK_SIZE - 1) / BLOCK_SIZE) as u64;
    let (blocknr, got) = alloc.new_data_blocks(
        pm,
        blocks_needed,
        0,
        AllocInit::Zero,
        AllocDirection::FromTail,
    )?;
    if got < blocks_needed {
        alloc.free_data_blocks(blocknr, got)?;
        return Err(FsError::NoSpace);
    }
    let mut addr = blocknr << BLOCK_SHIFT;
    let _window = pm.unlock();
    for &(range_low, range_high) in ranges {
        let tuple = RangeCheckpoint {
            range_low,
            range_high,
        };
        pm.write_bytes(addr, tuple.as_bytes())?;
        addr += size_of::<RangeCheckpoint>() as u64;
    }
    pm.flush(blocknr << BLOCK_SHIFT, bytes_needed, true)?;
    Ok((blocknr, ranges.len() as u64))
}

/// Checkpoint the free lists themselves. The tuple blocks are allocated
/// first (with slack for the split that allocation may cause) so the saved
/// ranges already exclude them; the mount path frees them back after
/// restoring. Returns `(block, tuple_count, block_count)`.
pub fn save_free_list_checkpoint(
    pm: &PmDevice,
    alloc: &BlockAlloc,
) -> FsResult<(u64, u64, u64)> {
    let estimate = alloc.checkpoint().len() + 16;
    let blocks_needed =
        ((estimate * size_of::<RangeCheckpoint>() + BLOCK_SIZE - 1) / BLOCK_SIZE) as u64;
    let (blocknr, got) = alloc.new_data_blocks(
        pm,
        blocks_needed,
        0,
        AllocInit::Zero,
        AllocDirection::FromTail,
    )?;
    if got < blocks_needed {
        alloc.free_data_blocks(blocknr, got)?;
        return Err(FsError::NoSpace);
    }
    let ranges = alloc.checkpoint();
    if ranges.len() > estimate {
        alloc.free_data_blocks(blocknr, got)?;
        return Err(FsError::Corrupt);
    }
    let mut addr = blocknr << BLOCK_SHIFT;
    let _window = pm.unlock();
    for &(range_low, range_high) in &ranges {
        let tuple = RangeCheckpoint {
            range_low,
            range_high,
        };
        pm.write_bytes(addr, tuple.as_bytes())?;
        addr += size_of::<RangeCheckpoint>() as u64;
    }
    pm.flush(
        blocknr << BLOCK_SHIFT,
        ranges.len() * size_of::<RangeCheckpoint>(),
        true,
    )?;
    Ok((blocknr, ranges.len() as u64, got))
}

pub fn load_checkpoint(pm: &PmDevice, blocknr: u64, count: u64) -> FsResult<Vec<(u64, u64)>> {
    let mut ranges = Vec::with_capacity(count as usize);
    let mut addr = blocknr << BLOCK_SHIFT;
    for _ in 0..count {
        let tuple: RangeCheckpoint = pm.read_typed(addr)?;
        ranges.push((tuple.range_low, tuple.range_high));
        addr += size_of::<RangeCheckpoint>() as u64;
    }
    Ok(ranges)
}

/// Rebuild one inode's DRAM header by replaying its log in order. An
/// unknown entry type aborts recovery with `Corrupt`.
pub fn rebuild_inode_info(ctx: &LogCtx, ino: u64, pi: &Inode) -> FsResult<InodeInfoHeader> {
    let mut sih = InodeInfoHeader::new(ino);
    sih.apply_from(pi);
    sih.i_size = pi.i_size;
    let mut trans_id = 0u64;
    for_each_entry(ctx, pi.log_head, pi.log_tail, |addr, kind, bytes| {
        match kind {
            LogEntryType::FileWrite => {
                let e: FileWriteEntry = unsafe { deserialize_row(bytes) };
                trans_id = trans_id.max(e.trans_id);
                if e.invalid_pages < e.num_pages {
                    insert_write_entry(&mut sih, addr, e.pgoff, e.num_pages as u64);
                    sih.i_size = e.size;
                    sih.mtime = e.mtime;
                    sih.valid_entries += 1;
                }
            }
            LogEntryType::DirLog => {
                let d = Dentry::from_log_bytes(bytes);
                trans_id = trans_id.max(d.trans_id);
                if d.invalid == 1 {
                    return Ok(true);
                }
                let name = d.name[..d.name_len as usize].to_vec();
                if d.ino == 0 {
                    // tombstone: drop exactly this name, collisions survive
                    let hash = bkdr_hash(&name);
                    let cands = sih.dentries.get(&hash).cloned().unwrap_or_default();
                    let mut keep = vec![];
                    for cand in cands {
                        let (_, cand_bytes) = read_entry_checked(ctx, cand)?;
                        let cand_d = Dentry::from_log_bytes(&cand_bytes);
                        if cand_d.name[..cand_d.name_len as usize] != name[..] {
                            keep.push(cand);
                        } else {
                            sih.valid_entries = sih.valid_entries.saturating_sub(1);
                        }
                    }
                    if keep.is_empty() {
                        sih.dentries.remove(&hash);
                    } else {
                        sih.dentries.insert(hash, keep);
                    }
                } else {
                    insert_dir_tree(&mut sih, &name, addr);
                    sih.valid_entries += 1;
                }
            }
            LogEntryType::SetAttr => {
                let e: SetattrEntry = unsafe { deserialize_row(bytes) };
                trans_id = trans_id.max(e.trans_id);
                if e.invalid == 1 {
                    return Ok(true);
                }
                sih.i_mode = e.mode;
                sih.atime = e.atime;
                sih.mtime = e.mtime;
                sih.ctime = e.ctime;
                sih.i_size = e.size;
                sih.last_setattr = addr;
                sih.valid_entries += 1;
            }
            LogEntryType::LinkChange => {
                let e: LinkChangeEntry = unsafe { deserialize_row(bytes) };
                trans_id = trans_id.max(e.trans_id);
                if e.invalid == 1 {
                    return Ok(true);
                }
                sih.i_links_count = e.links;
                sih.ctime = e.ctime;
                sih.i_flags = e.flags;
                sih.last_link_change = addr;
                sih.valid_entries += 1;
            }
            LogEntryType::MmapWrite => {
                let e: MmapEntry = unsafe { deserialize_row(bytes) };
                // an invalidated mmap entry is a no-op
                if e.invalid == 1 {
                    return Ok(true);
                }
                sih.mmap_ranges.push((e.pgoff, e.num_pages));
                sih.valid_entries += 1;
            }
            LogEntryType::NextPage => {}
        }
        Ok(true)
    })?;
    sih.trans_id = trans_id;
    // drop mappings past the final size: a truncate freed those blocks and
    // partially invalidated their entries, so they must not be claimed
    let cut = (sih.i_size + BLOCK_SIZE as u64 - 1) >> BLOCK_SHIFT;
    let stale: Vec<u64> = sih.radix.range(cut..).map(|(k, _)| *k).collect();
    for key in stale {
        sih.radix.remove(&key);
    }
    // count the pages of both chains
    let mut pages = 0u64;
    let mut page = block_off(pi.log_head);
    while page != 0 {
        pages += 1;
        let tail: PageTail = ctx.pm.read_typed(page_tail_addr(page))?;
        if ctx.metadata_csum && tail.alter_page != 0 {
            pages += 1;
        }
        page = tail.next_page;
    }
    sih.log_pages = pages;
    Ok(sih)
}

/// Take one inode's blocks out of the reconstructed free space: its log
/// chains and every data block its radix map references.
fn claim_inode_blocks(
    ctx: &LogCtx,
    alloc: &BlockAlloc,
    pi: &Inode,
    sih: &InodeInfoHeader,
) -> FsResult<()> {
    let mut page = block_off(pi.log_head);
    while page != 0 {
        alloc.remove_free_range(page >> BLOCK_SHIFT, 1)?;
        let tail: PageTail = ctx.pm.read_typed(page_tail_addr(page))?;
        if ctx.metadata_csum && tail.alter_page != 0 {
            alloc.remove_free_range(tail.alter_page >> BLOCK_SHIFT, 1)?;
        }
        page = tail.next_page;
    }
    for (pgoff, entry_addr) in sih.radix.iter() {
        let (_, bytes) = read_entry_checked(ctx, *entry_addr)?;
        let e: FileWriteEntry = unsafe { deserialize_row(&bytes) };
        alloc.remove_free_range(e.block + (pgoff - e.pgoff), 1)?;
    }
    Ok(())
}

/// Full rescan after an unclean unmount: every valid inode is replayed, the
/// inode maps are repopulated, and live block references leave the free
/// lists.
pub fn full_rescan(
    ctx: &LogCtx,
    alloc: &BlockAlloc,
    store: &InodeStore,
) -> FsResult<HashMap<u64, InodeInfoHeader>> {
    let mut headers = HashMap::new();
    let mut process = |ino: u64, pi: &Inode| -> FsResult<()> {
        if pi.valid != 1 || pi.deleted == 1 {
            return Ok(());
        }
        let mut sih = rebuild_inode_info(ctx, ino, pi)?;
        sih.pi_addr = store.inode_addr(ctx.pm, ino, false)?;
        sih.alter_pi_addr = store.inode_addr(ctx.pm, ino, true)?;
        claim_inode_blocks(ctx, alloc, pi, &sih)?;
        if ino >= RESERVED_INODES {
            store.mark_ino_used(ino)?;
        }
        headers.insert(ino, sih);
        Ok(())
    };

    for ino in 1..RESERVED_INODES {
        let pi = match store.check_inode_integrity(ctx.pm, ino) {
            Ok(pi) => pi,
            Err(FsError::Io) => {
                error!("reserved inode {} unreadable during rescan", ino);
                return Err(FsError::Io);
            }
            Err(e) => return Err(e),
        };
        process(ino, &pi)?;
    }

    let per_page = store.inodes_per_table_page();
    for cpu in 0..store.cpus() {
        let chain = store.table_chain(ctx.pm, cpu, false)?;
        let replica_chain = store.table_chain(ctx.pm, cpu, true)?;
        for (page_index, page_addr) in chain.iter().enumerate() {
            // the superpage itself is in use
            alloc.remove_free_range(*page_addr >> BLOCK_SHIFT, store.table_blocks())?;
            if let Some(replica_page) = replica_chain.get(page_index) {
                alloc.remove_free_range(*replica_page >> BLOCK_SHIFT, store.table_blocks())?;
            }
            for slot in 0..per_page {
                let ino = (page_index as u64 * per_page + slot) * store.cpus() + cpu;
                if ino < RESERVED_INODES {
                    continue;
                }
                let pi = match store.check_inode_integrity(ctx.pm, ino) {
                    Ok(pi) => pi,
                    // an unreadable dynamic slot is skipped, not fatal
                    Err(_) => continue,
                };
                if pi.ino != ino {
                    continue;
                }
                process(ino, &pi)?;
            }
        }
    }
    info!("rescan rebuilt {} inodes", headers.len());
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytefs_lib::journal::LiteJournal;
    use crate::bytefs_lib::layout::FsLayout;
    use crate::bytefs_lib::log::{append_dentry, append_file_write_entry, update_inode_tail};
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;
    use std::sync::Arc;
    use zerocopy::FromBytes;

    struct Harness {
        pm: PmDevice,
        alloc: BlockAlloc,
        journal: LiteJournal,
    }

    fn setup() -> Harness {
        let layout = FsLayout::new(1, 2048);
        let driver = Arc::new(RamSsdDriver::new(2048 << BLOCK_SHIFT));
        let pm = PmDevice::new(driver, false).unwrap();
        let alloc = BlockAlloc::new(&layout, false, false).unwrap();
        let journal = LiteJournal::new(layout);
        journal.hard_init(&pm).unwrap();
        Harness { pm, alloc, journal }
    }

    fn ctx<'a>(h: &'a Harness) -> LogCtx<'a> {
        LogCtx {
            pm: &h.pm,
            alloc: &h.alloc,
            journal: &h.journal,
            metadata_csum: false,
            epoch_id: 1,
        }
    }

    #[test]
    fn superblock_replica_fallback() -> Result<()> {
        let h = setup();
        let mut sb = SuperBlock::new_zeroed();
        sb.s_magic = crate::bytefs_lib::layout::BYTEFS_SUPER_MAGIC;
        sb.s_blocksize = BLOCK_SIZE as u32;
        sb.s_num_blocks = 2048;
        sb.s_cpus = 1;
        write_superblock(&h.pm, &mut sb)?;
        // trash the primary
        h.pm.scoped_write(8, &[0xffu8; 16], true)?;
        let back = recover_superblock(&h.pm)?;
        assert_eq!(back.s_num_blocks, 2048);
        // primary healed
        let healed: SuperBlock = h.pm.read_typed(0)?;
        assert!(healed.csum_ok());
        Ok(())
    }

    #[test]
    fn checkpoint_save_load_round_trip() -> Result<()> {
        let h = setup();
        let ranges: Vec<(u64, u64)> = (0..600).map(|i| (i * 10, i * 10 + 5)).collect();
        let (block, count) = save_checkpoint(&h.pm, &h.alloc, &ranges)?;
        assert!(block != 0);
        assert_eq!(count, 600);
        let back = load_checkpoint(&h.pm, block, count)?;
        assert_eq!(back, ranges);
        Ok(())
    }

    #[test]
    fn replay_rebuilds_radix_and_dentries() -> Result<()> {
        let h = setup();
        let c = ctx(&h);
        let pi_addr = 2000u64 << BLOCK_SHIFT;
        let mut inode = Inode::default();
        inode.valid = 1;
        inode.ino = 77;
        inode.i_links_count = 2;
        inode.update_csum();
        h.pm.scoped_write(pi_addr, inode.as_bytes(), true)?;

        let mut sih = InodeInfoHeader::new(77);
        for i in 0..5u64 {
            let entry = FileWriteEntry {
                num_pages: 2,
                block: 300 + i * 2,
                pgoff: i * 2,
                size: (i + 1) * 2 * 4096,
                mtime: 10 + i as u32,
                ..Default::default()
            };
            append_file_write_entry(&c, &mut sih, pi_addr, entry)?;
        }
        let d1 = append_dentry(&c, &mut sih, pi_addr, b"kept", 90, 1, 3)?;
        append_dentry(&c, &mut sih, pi_addr, b"removed", 91, 1, 3)?;
        // tombstone for "removed"
        append_dentry(&c, &mut sih, pi_addr, b"removed", 0, 0, 4)?;
        update_inode_tail(&c, &sih, pi_addr, 0, 0)?;

        let pi: Inode = h.pm.read_typed(pi_addr)?;
        let rebuilt = rebuild_inode_info(&c, 77, &pi)?;
        assert_eq!(rebuilt.radix.len(), 10);
        assert_eq!(rebuilt.i_size, 10 * 4096);
        assert_eq!(rebuilt.trans_id, sih.trans_id);
        assert_eq!(rebuilt.dentries.len(), 1);
        let addrs = rebuilt.dentries.get(&bkdr_hash(b"kept")).unwrap();
        assert_eq!(addrs, &vec![d1]);
        Ok(())
    }
}
