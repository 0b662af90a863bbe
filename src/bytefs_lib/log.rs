//! Per-inode append-only log engine.
//!
//! Every inode owns a chain of 4 KiB log pages (two chains when metadata is
//! mirrored, kept in lockstep so an entry sits at the same offset in both).
//! Entries are type-tagged, checksummed, and never rewritten in place except
//! through the journal-protected in-place update path. Space comes back via
//! fast GC (drop fully-invalid pages) and thorough GC (rewrite the chain).
use std::mem::size_of;

use log::*;
use zerocopy::AsBytes;

use crate::bytefs_lib::balloc::{AllocDirection, AllocInit, BlockAlloc};
use crate::bytefs_lib::checksum::csum_entry_bytes;
use crate::bytefs_lib::inode::InodeInfoHeader;
use crate::bytefs_lib::journal::LiteJournal;
use crate::bytefs_lib::layout::{
    dir_log_rec_len, entry_csum_offset, fixed_entry_size, Dentry, FileWriteEntry, Inode,
    LinkChangeEntry, LogEntryType, MmapEntry, PageTail, SetattrEntry, ANY_CPU, BLOCK_SHIFT,
    BLOCK_SIZE, EXTEND_THRESHOLD, LOG_BLOCK_TAIL, NAME_LEN, THOROUGH_GC_THRESHOLD,
};
use crate::bytefs_lib::pm::PmDevice;
use crate::bytefs_lib::types::{FsError, FsResult};
use crate::get_offset;

pub fn block_off(p: u64) -> u64 {
    p & !(BLOCK_SIZE as u64 - 1)
}

pub fn entry_loc(p: u64) -> u64 {
    p & (BLOCK_SIZE as u64 - 1)
}

pub fn page_tail_addr(p: u64) -> u64 {
    block_off(p) + LOG_BLOCK_TAIL as u64
}

/// Everything the log engine needs from the mount.
pub struct LogCtx<'a> {
    pub pm: &'a PmDevice,
    pub alloc: &'a BlockAlloc,
    pub journal: &'a LiteJournal,
    pub metadata_csum: bool,
    pub epoch_id: u64,
}

impl<'a> LogCtx<'a> {
    fn read_tail(&self, page: u64) -> FsResult<PageTail> {
        self.pm.read_typed(page_tail_addr(page))
    }

    fn write_tail(&self, page: u64, tail: &PageTail) -> FsResult<()> {
        self.pm
            .scoped_write(page_tail_addr(page), tail.as_bytes(), true)
    }

    fn read_u64(&self, addr: u64) -> FsResult<u64> {
        let mut bytes = [0u8; 8];
        self.pm.read_bytes(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Serialized forms of every appendable entry.
pub enum LogEntryData {
    FileWrite(FileWriteEntry),
    Dir(Dentry),
    SetAttr(SetattrEntry),
    LinkChange(LinkChangeEntry),
    Mmap(MmapEntry),
}

impl LogEntryData {
    fn kind(&self) -> LogEntryType {
        match self {
            LogEntryData::FileWrite(_) => LogEntryType::FileWrite,
            LogEntryData::Dir(_) => LogEntryType::DirLog,
            LogEntryData::SetAttr(_) => LogEntryType::SetAttr,
            LogEntryData::LinkChange(_) => LogEntryType::LinkChange,
            LogEntryData::Mmap(_) => LogEntryType::MmapWrite,
        }
    }

    /// Bytes as they go on the log, checksum patched in.
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = match self {
            LogEntryData::FileWrite(e) => e.as_bytes().to_vec(),
            LogEntryData::Dir(e) => e.as_bytes()[..e.rec_len()].to_vec(),
            LogEntryData::SetAttr(e) => e.as_bytes().to_vec(),
            LogEntryData::LinkChange(e) => e.as_bytes().to_vec(),
            LogEntryData::Mmap(e) => e.as_bytes().to_vec(),
        };
        let csum_off = entry_csum_offset(self.kind());
        let csum = csum_entry_bytes(&bytes, csum_off);
        bytes[csum_off..csum_off + 4].copy_from_slice(&csum.to_le_bytes());
        bytes
    }
}

/// Size of the entry starting at `addr`, from its type byte (`DIR_LOG` reads
/// its `de_len`).
pub fn entry_size_at(pm: &PmDevice, addr: u64) -> FsResult<(LogEntryType, usize)> {
    let mut type_byte = [0u8; 1];
    pm.read_bytes(addr, &mut type_byte)?;
    let kind = LogEntryType::try_from(type_byte[0]).map_err(|_| {
        error!("unknown log entry type {} at {:#x}", type_byte[0], addr);
        FsError::Corrupt
    })?;
    if let Some(size) = fixed_entry_size(kind) {
        return Ok((kind, size));
    }
    let de_len_off = get_offset!(Dentry, de_len) as u64;
    let mut de_len = [0u8; 2];
    pm.read_bytes(addr + de_len_off, &mut de_len)?;
    let de_len = u16::from_le_bytes(de_len) as usize;
    if de_len < size_of::<Dentry>() - NAME_LEN - 4 || de_len > dir_log_rec_len(NAME_LEN) {
        error!("dentry at {:#x} has absurd de_len {}", addr, de_len);
        return Err(FsError::Corrupt);
    }
    Ok((kind, de_len))
}

/// Replica address of the entry at `addr`, through its page's `alter_page`.
pub fn alter_entry_addr(ctx: &LogCtx, addr: u64) -> FsResult<u64> {
    let tail = ctx.read_tail(addr)?;
    if tail.alter_page == 0 {
        return Err(FsError::Corrupt);
    }
    Ok(tail.alter_page + entry_loc(addr))
}

/// Read and verify the entry at `addr`. A bad or unreadable side is repaired
/// from the good one; both sides bad is an I/O error.
pub fn read_entry_checked(ctx: &LogCtx, addr: u64) -> FsResult<(LogEntryType, Vec<u8>)> {
    let primary = try_read_entry(ctx.pm, addr, ctx.metadata_csum);
    if !ctx.metadata_csum {
        return primary;
    }
    match primary {
        Ok(good) => Ok(good),
        Err(FsError::Io) | Err(FsError::Corrupt) => {
            let alter = alter_entry_addr(ctx, addr)?;
            let (kind, bytes) = try_read_entry(ctx.pm, alter, true).map_err(|e| {
                error!("log entry {:#x}: both copies unreadable", addr);
                if e == FsError::Corrupt {
                    FsError::Io
                } else {
                    e
                }
            })?;
            warn!("log entry {:#x}: repaired from replica {:#x}", addr, alter);
            ctx.pm.scoped_write(addr, &bytes, true)?;
            Ok((kind, bytes))
        }
        Err(e) => Err(e),
    }
}

fn try_read_entry(
    pm: &PmDevice,
    addr: u64,
    verify: bool,
) -> FsResult<(LogEntryType, Vec<u8>)> {
    let (kind, size) = entry_size_at(pm, addr)?;
    let mut bytes = vec![0u8; size];
    pm.read_bytes(addr, &mut bytes)?;
    if verify {
        let csum_off = entry_csum_offset(kind);
        let stored = u32::from_le_bytes(bytes[csum_off..csum_off + 4].try_into().unwrap());
        if stored != csum_entry_bytes(&bytes, csum_off) {
            return Err(FsError::Corrupt);
        }
    }
    Ok((kind, bytes))
}

/// Allocate `num` log pages, zeroed, chained through their tail records.
/// Returns `(first_page, last_page, allocated)`; partial extents chain.
fn allocate_log_pages(
    ctx: &LogCtx,
    num: u64,
    cpu: i32,
) -> FsResult<(u64, u64, u64)> {
    let mut first = 0u64;
    let mut prev_last = 0u64;
    let mut allocated = 0u64;
    let mut remaining = num;
    while remaining > 0 {
        let (blocknr, got) = match ctx.alloc.new_log_blocks(
            ctx.pm,
            remaining,
            cpu,
            AllocInit::Zero,
            AllocDirection::FromHead,
        ) {
            Ok(r) => r,
            Err(FsError::NoSpace) if allocated > 0 => break,
            Err(e) => return Err(e),
        };
        let extent = blocknr << BLOCK_SHIFT;
        // chain the pages of this extent
        for i in 0..got {
            let page = extent + (i << BLOCK_SHIFT);
            let next = if i + 1 < got {
                page + BLOCK_SIZE as u64
            } else {
                0
            };
            let tail = PageTail {
                invalid_entries: 0,
                num_entries: 0,
                epoch_id: ctx.epoch_id,
                alter_page: 0,
                next_page: next,
            };
            ctx.write_tail(page, &tail)?;
        }
        if first == 0 {
            first = extent;
        } else {
            let mut tail = ctx.read_tail(prev_last)?;
            tail.next_page = extent;
            ctx.write_tail(prev_last, &tail)?;
        }
        prev_last = extent + ((got - 1) << BLOCK_SHIFT);
        allocated += got;
        remaining -= got;
    }
    if allocated == 0 {
        return Err(FsError::NoSpace);
    }
    Ok((first, prev_last, allocated))
}

/// Pair each page of the primary chain with its replica, recording the cross
/// pointers in both tails.
fn link_alter_pages(ctx: &LogCtx, primary: u64, alter: u64) -> FsResult<()> {
    let mut p = primary;
    let mut a = alter;
    while p != 0 {
        if a == 0 {
            return Err(FsError::Corrupt);
        }
        let mut pt = ctx.read_tail(p)?;
        let mut at = ctx.read_tail(a)?;
        pt.alter_page = a;
        at.alter_page = p;
        let (p_next, a_next) = (pt.next_page, at.next_page);
        ctx.write_tail(p, &pt)?;
        ctx.write_tail(a, &at)?;
        p = p_next;
        a = a_next;
    }
    Ok(())
}

/// First-time log setup for an inode: one page per chain.
pub fn initialize_inode_log(ctx: &LogCtx, sih: &mut InodeInfoHeader) -> FsResult<u64> {
    let (head, _, _) = allocate_log_pages(ctx, 1, ANY_CPU)?;
    sih.log_head = head;
    sih.log_tail = head;
    sih.log_pages = 1;
    if ctx.metadata_csum {
        let (alter_head, _, _) = allocate_log_pages(ctx, 1, ANY_CPU)?;
        link_alter_pages(ctx, head, alter_head)?;
        sih.alter_log_head = alter_head;
        sih.alter_log_tail = alter_head;
        sih.log_pages += 1;
    }
    debug!("inode {}: log initialized at {:#x}", sih.ino, head);
    Ok(head)
}

/// Grow the log: allocate up to `EXTEND_THRESHOLD` pages (doubling below it),
/// reclaim dead pages with fast GC, and hang the new chain off the tail.
fn extend_inode_log(ctx: &LogCtx, sih: &mut InodeInfoHeader, pi_addr: u64, curr_p: u64) -> FsResult<u64> {
    let num_pages = if sih.log_pages >= EXTEND_THRESHOLD {
        EXTEND_THRESHOLD
    } else {
        sih.log_pages.max(1)
    };
    let (new_block, _, allocated) = allocate_log_pages(ctx, num_pages, ANY_CPU)?;
    let alter_new_block = if ctx.metadata_csum {
        let (a, _, got) = allocate_log_pages(ctx, allocated, ANY_CPU)?;
        if got < allocated {
            // mirrored chains must stay the same length
            ctx.free_log_chain(a)?;
            free_chain_blocks(ctx, new_block)?;
            return Err(FsError::NoSpace);
        }
        link_alter_pages(ctx, new_block, a)?;
        a
    } else {
        0
    };
    sih.log_pages += allocated * if ctx.metadata_csum { 2 } else { 1 };

    inode_log_fast_gc(ctx, sih, pi_addr, curr_p)?;

    // thread the new chain onto the retained tail page
    let last_page = block_off(sih.log_tail);
    let mut tail = ctx.read_tail(last_page)?;
    tail.next_page = new_block;
    ctx.write_tail(last_page, &tail)?;
    if ctx.metadata_csum {
        let alter_last_page = block_off(sih.alter_log_tail);
        let mut tail = ctx.read_tail(alter_last_page)?;
        tail.next_page = alter_new_block;
        ctx.write_tail(alter_last_page, &tail)?;
    }
    trace!(
        "inode {}: log extended by {} pages at {:#x}",
        sih.ino,
        allocated,
        new_block
    );
    Ok(new_block)
}

impl<'a> LogCtx<'a> {
    /// Free a whole chain starting at `head` (primary or alter side).
    fn free_log_chain(&self, head: u64) -> FsResult<()> {
        free_chain_blocks(self, head)
    }
}

fn free_chain_blocks(ctx: &LogCtx, mut page: u64) -> FsResult<()> {
    while page != 0 {
        let tail = ctx.read_tail(page)?;
        ctx.alloc.free_log_blocks(page >> BLOCK_SHIFT, 1)?;
        page = tail.next_page;
    }
    Ok(())
}

/// Where the next entry of `size` bytes goes, paging and extending as
/// needed. Returns the primary append address.
pub fn get_append_head(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    size: usize,
) -> FsResult<u64> {
    if sih.log_head == 0 {
        return initialize_inode_log(ctx, sih);
    }
    let curr_p = sih.log_tail;
    if entry_loc(curr_p) + size as u64 <= LOG_BLOCK_TAIL as u64 {
        return Ok(curr_p);
    }
    // seal the page: a NEXT_PAGE type byte tells traversal to skip ahead
    if entry_loc(curr_p) < LOG_BLOCK_TAIL as u64 {
        ctx.pm
            .scoped_write(curr_p, &[LogEntryType::NextPage as u8], true)?;
        if ctx.metadata_csum {
            ctx.pm
                .scoped_write(sih.alter_log_tail, &[LogEntryType::NextPage as u8], true)?;
        }
    }
    let tail = ctx.read_tail(curr_p)?;
    let next = if tail.next_page != 0 {
        tail.next_page
    } else {
        extend_inode_log(ctx, sih, pi_addr, curr_p)?
    };
    sih.log_tail = next;
    if ctx.metadata_csum {
        let next_tail = ctx.read_tail(next)?;
        sih.alter_log_tail = next_tail.alter_page;
    }
    Ok(next)
}

fn bump_num_entries(ctx: &LogCtx, page: u64) -> FsResult<()> {
    let mut tail = ctx.read_tail(page)?;
    tail.num_entries += 1;
    ctx.write_tail(page, &tail)?;
    if ctx.metadata_csum && tail.alter_page != 0 {
        let mut alter = ctx.read_tail(tail.alter_page)?;
        alter.num_entries += 1;
        ctx.write_tail(tail.alter_page, &alter)?;
    }
    Ok(())
}

/// Append one entry to both chains; advances the DRAM tails but does NOT
/// publish them to the PM inode. Callers finish with [`update_inode_tail`]
/// so the publication rides a journal transaction.
pub fn append_log_entry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    data: &LogEntryData,
) -> FsResult<u64> {
    if sih.corrupt {
        return Err(FsError::Corrupt);
    }
    let bytes = data.to_bytes();
    let curr_p = get_append_head(ctx, sih, pi_addr, bytes.len())?;
    ctx.pm.scoped_write(curr_p, &bytes, true)?;
    if ctx.metadata_csum {
        let alter_p = alter_entry_addr(ctx, curr_p)?;
        ctx.pm.scoped_write(alter_p, &bytes, true)?;
        sih.alter_log_tail = alter_p + bytes.len() as u64;
    }
    bump_num_entries(ctx, curr_p)?;
    sih.log_tail = curr_p + bytes.len() as u64;
    sih.valid_entries += 1;
    trace!(
        "inode {}: appended {:?} at {:#x} ({} bytes)",
        sih.ino,
        data.kind(),
        curr_p,
        bytes.len()
    );
    Ok(curr_p)
}

/// Publish the DRAM tails into the PM inode (both copies) under a journal
/// transaction so the tails and checksum move atomically.
pub fn update_inode_tail(
    ctx: &LogCtx,
    sih: &InodeInfoHeader,
    pi_addr: u64,
    alter_pi_addr: u64,
    cpu: u32,
) -> FsResult<()> {
    let tail_off = get_offset!(Inode, log_tail) as u64;
    let alter_tail_off = get_offset!(Inode, alter_log_tail) as u64;
    let head_off = get_offset!(Inode, log_head) as u64;
    let alter_head_off = get_offset!(Inode, alter_log_head) as u64;
    let size_off = get_offset!(Inode, i_size) as u64;
    let csum_word = pi_addr + 120;

    let mut txn = ctx.journal.begin(ctx.pm, cpu)?;
    txn.stage_word(ctx.pm, pi_addr + head_off)?;
    txn.stage_word(ctx.pm, pi_addr + tail_off)?;
    if ctx.metadata_csum {
        txn.stage_word(ctx.pm, pi_addr + alter_head_off)?;
        txn.stage_word(ctx.pm, pi_addr + alter_tail_off)?;
    }
    txn.stage_word(ctx.pm, pi_addr + size_off)?;
    txn.stage_word(ctx.pm, csum_word)?;

    let mut inode: Inode = ctx.pm.read_typed(pi_addr)?;
    inode.log_head = sih.log_head;
    inode.log_tail = sih.log_tail;
    inode.alter_log_head = sih.alter_log_head;
    inode.alter_log_tail = sih.alter_log_tail;
    inode.i_size = sih.i_size;
    inode.update_csum();
    ctx.pm.scoped_write(pi_addr, inode.as_bytes(), true)?;
    txn.commit(ctx.pm)?;

    // the replica copy follows even without metadata mirroring: journal
    // undo records depend on it holding the pre-transaction image
    if alter_pi_addr != 0 {
        ctx.pm.scoped_write(alter_pi_addr, inode.as_bytes(), true)?;
    }
    Ok(())
}

fn stamp(sih: &mut InodeInfoHeader, epoch_id: u64) -> (u64, u64) {
    (epoch_id, sih.next_trans_id())
}

pub fn append_file_write_entry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    mut entry: FileWriteEntry,
) -> FsResult<u64> {
    if entry.num_pages == 0 {
        return Err(FsError::Invalid);
    }
    let (epoch, trans) = stamp(sih, ctx.epoch_id);
    entry.entry_type = LogEntryType::FileWrite as u8;
    entry.epoch_id = epoch;
    entry.trans_id = trans;
    append_log_entry(ctx, sih, pi_addr, &LogEntryData::FileWrite(entry))
}

pub fn append_dentry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    name: &[u8],
    ino: u64,
    links_count: u16,
    mtime: u32,
) -> FsResult<u64> {
    if name.is_empty() || name.len() > NAME_LEN {
        return Err(FsError::Invalid);
    }
    let (epoch, trans) = stamp(sih, ctx.epoch_id);
    let mut entry = Dentry {
        entry_type: LogEntryType::DirLog as u8,
        name_len: name.len() as u8,
        reassigned: 0,
        invalid: 0,
        de_len: dir_log_rec_len(name.len()) as u16,
        links_count,
        mtime,
        csum: 0,
        ino,
        padding: 0,
        epoch_id: epoch,
        trans_id: trans,
        name: [0u8; NAME_LEN + 4],
    };
    entry.name[..name.len()].copy_from_slice(name);
    append_log_entry(ctx, sih, pi_addr, &LogEntryData::Dir(entry))
}

pub fn append_setattr_entry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    mut entry: SetattrEntry,
) -> FsResult<u64> {
    let (epoch, trans) = stamp(sih, ctx.epoch_id);
    entry.entry_type = LogEntryType::SetAttr as u8;
    entry.epoch_id = epoch;
    entry.trans_id = trans;
    let addr = append_log_entry(ctx, sih, pi_addr, &LogEntryData::SetAttr(entry))?;
    // supersede the previous setattr entry
    if sih.last_setattr != 0 {
        invalidate_logentry(ctx, sih, sih.last_setattr)?;
    }
    sih.last_setattr = addr;
    Ok(addr)
}

pub fn append_link_change_entry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    mut entry: LinkChangeEntry,
) -> FsResult<u64> {
    let (epoch, trans) = stamp(sih, ctx.epoch_id);
    entry.entry_type = LogEntryType::LinkChange as u8;
    entry.epoch_id = epoch;
    entry.trans_id = trans;
    let addr = append_log_entry(ctx, sih, pi_addr, &LogEntryData::LinkChange(entry))?;
    if sih.last_link_change != 0 {
        invalidate_logentry(ctx, sih, sih.last_link_change)?;
    }
    sih.last_link_change = addr;
    Ok(addr)
}

pub fn append_mmap_entry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    mut entry: MmapEntry,
) -> FsResult<u64> {
    let (epoch, _trans) = stamp(sih, ctx.epoch_id);
    entry.entry_type = LogEntryType::MmapWrite as u8;
    entry.epoch_id = epoch;
    append_log_entry(ctx, sih, pi_addr, &LogEntryData::Mmap(entry))
}

fn bump_invalid_entries(ctx: &LogCtx, page: u64) -> FsResult<()> {
    let mut tail = ctx.read_tail(page)?;
    tail.invalid_entries += 1;
    if tail.invalid_entries > tail.num_entries {
        error!(
            "page {:#x}: invalid_entries {} exceeds num_entries {}",
            block_off(page),
            tail.invalid_entries,
            tail.num_entries
        );
        return Err(FsError::Corrupt);
    }
    ctx.write_tail(page, &tail)?;
    if ctx.metadata_csum && tail.alter_page != 0 {
        let mut alter = ctx.read_tail(tail.alter_page)?;
        alter.invalid_entries += 1;
        ctx.write_tail(tail.alter_page, &alter)?;
    }
    Ok(())
}

pub fn rewrite_entry_both(ctx: &LogCtx, addr: u64, bytes: &[u8]) -> FsResult<()> {
    let csum_off = entry_csum_offset(LogEntryType::try_from(bytes[0]).map_err(|_| FsError::Corrupt)?);
    let mut bytes = bytes.to_vec();
    let csum = csum_entry_bytes(&bytes, csum_off);
    bytes[csum_off..csum_off + 4].copy_from_slice(&csum.to_le_bytes());
    ctx.pm.scoped_write(addr, &bytes, true)?;
    if ctx.metadata_csum {
        let alter = alter_entry_addr(ctx, addr)?;
        ctx.pm.scoped_write(alter, &bytes, true)?;
    }
    Ok(())
}

/// Partially or fully invalidate the FILE_WRITE entry at `addr`; other entry
/// kinds flip their invalid flag. Fully-dead entries count against their
/// page for GC.
pub fn invalidate_write_entry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    addr: u64,
    num_free_pages: u32,
) -> FsResult<()> {
    let (kind, mut bytes) = read_entry_checked(ctx, addr)?;
    if kind != LogEntryType::FileWrite {
        return Err(FsError::Invalid);
    }
    let mut entry: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(&bytes) };
    if entry.num_pages == 0 || entry.invalid_pages + num_free_pages > entry.num_pages {
        sih.corrupt = true;
        error!(
            "inode {}: write entry at {:#x} over-invalidated ({} + {} of {})",
            sih.ino, addr, entry.invalid_pages, num_free_pages, entry.num_pages
        );
        return Err(FsError::Corrupt);
    }
    entry.invalid_pages += num_free_pages;
    let fully_dead = entry.invalid_pages == entry.num_pages;
    bytes[..size_of::<FileWriteEntry>()].copy_from_slice(entry.as_bytes());
    rewrite_entry_both(ctx, addr, &bytes)?;
    if fully_dead {
        bump_invalid_entries(ctx, addr)?;
        sih.valid_entries = sih.valid_entries.saturating_sub(1);
    }
    Ok(())
}

/// Flip the invalid flag of a non-FILE_WRITE entry.
pub fn invalidate_logentry(ctx: &LogCtx, sih: &mut InodeInfoHeader, addr: u64) -> FsResult<()> {
    let (kind, mut bytes) = read_entry_checked(ctx, addr)?;
    let invalid_off = match kind {
        LogEntryType::DirLog => get_offset!(Dentry, invalid),
        LogEntryType::SetAttr => get_offset!(SetattrEntry, invalid),
        LogEntryType::LinkChange => get_offset!(LinkChangeEntry, invalid),
        LogEntryType::MmapWrite => get_offset!(MmapEntry, invalid),
        LogEntryType::FileWrite | LogEntryType::NextPage => return Err(FsError::Invalid),
    };
    if bytes[invalid_off] == 1 {
        return Ok(());
    }
    bytes[invalid_off] = 1;
    rewrite_entry_both(ctx, addr, &bytes)?;
    bump_invalid_entries(ctx, addr)?;
    sih.valid_entries = sih.valid_entries.saturating_sub(1);
    Ok(())
}

/// Mark an entry's payload as superseded without invalidating it.
pub fn reassign_logentry(ctx: &LogCtx, addr: u64) -> FsResult<()> {
    let (kind, mut bytes) = read_entry_checked(ctx, addr)?;
    let off = match kind {
        LogEntryType::FileWrite => get_offset!(FileWriteEntry, reassigned),
        LogEntryType::DirLog => get_offset!(Dentry, reassigned),
        _ => return Err(FsError::Invalid),
    };
    bytes[off] = 1;
    rewrite_entry_both(ctx, addr, &bytes)
}

/// Replace an existing entry under journal protection: every touched 8-byte
/// word (and its replica twin) is staged before the overwrite.
pub fn inplace_update_log_entry(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    addr: u64,
    data: &LogEntryData,
    cpu: u32,
) -> FsResult<()> {
    if sih.corrupt {
        return Err(FsError::Corrupt);
    }
    let (kind, old) = read_entry_checked(ctx, addr)?;
    if kind != data.kind() {
        return Err(FsError::Invalid);
    }
    let bytes = data.to_bytes();
    if bytes.len() != old.len() {
        return Err(FsError::Invalid);
    }
    let words = (bytes.len() + 7) / 8;
    let alter = if ctx.metadata_csum {
        Some(alter_entry_addr(ctx, addr)?)
    } else {
        None
    };
    let mut txn = ctx.journal.begin(ctx.pm, cpu)?;
    for w in 0..words {
        txn.stage_word(ctx.pm, addr + (w * 8) as u64)?;
        if let Some(alter) = alter {
            txn.stage_word(ctx.pm, alter + (w * 8) as u64)?;
        }
    }
    ctx.pm.scoped_write(addr, &bytes, true)?;
    if let Some(alter) = alter {
        ctx.pm.scoped_write(alter, &bytes, true)?;
    }
    txn.commit(ctx.pm)?;
    Ok(())
}

/// Walk the log from `head` to `tail`, handing each live entry address to
/// `f`; return false from `f` to stop early.
pub fn for_each_entry<F>(ctx: &LogCtx, head: u64, tail: u64, mut f: F) -> FsResult<()>
where
    F: FnMut(u64, LogEntryType, &[u8]) -> FsResult<bool>,
{
    let mut curr = head;
    while curr != tail && curr != 0 {
        if entry_loc(curr) >= LOG_BLOCK_TAIL as u64 {
            curr = ctx.read_tail(curr)?.next_page;
            continue;
        }
        let mut type_byte = [0u8; 1];
        ctx.pm.read_bytes(curr, &mut type_byte)?;
        if type_byte[0] == 0 || type_byte[0] == LogEntryType::NextPage as u8 {
            // page sealed (or tail page with untouched space)
            if block_off(curr) == block_off(tail) {
                break;
            }
            curr = ctx.read_tail(curr)?.next_page;
            continue;
        }
        let (kind, bytes) = read_entry_checked(ctx, curr)?;
        if !f(curr, kind, &bytes)? {
            return Ok(());
        }
        curr += bytes.len() as u64;
    }
    Ok(())
}

fn page_is_dead(tail: &PageTail) -> bool {
    tail.num_entries > 0 && tail.invalid_entries == tail.num_entries
}

/// Fast GC: unlink pages whose entries are all invalid (primary and replica
/// in lockstep). Entries are never moved or reordered. The page holding
/// `curr_p` is always retained.
pub fn inode_log_fast_gc(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    curr_p: u64,
) -> FsResult<u64> {
    let mut freed = 0u64;
    let keep = block_off(curr_p);
    let mut page = block_off(sih.log_head);
    let mut prev: Option<u64> = None;
    let mut new_head = sih.log_head;
    while page != 0 {
        let tail = ctx.read_tail(page)?;
        let next = tail.next_page;
        if page != keep && page_is_dead(&tail) {
            // unlink: predecessor jumps over this page
            match prev {
                Some(p) => {
                    let mut pt = ctx.read_tail(p)?;
                    pt.next_page = next;
                    ctx.write_tail(p, &pt)?;
                    if ctx.metadata_csum && pt.alter_page != 0 {
                        let mut apt = ctx.read_tail(pt.alter_page)?;
                        apt.next_page = ctx.read_tail(tail.alter_page)?.next_page;
                        ctx.write_tail(pt.alter_page, &apt)?;
                    }
                }
                None => {
                    new_head = next;
                }
            }
            ctx.alloc.free_log_blocks(page >> BLOCK_SHIFT, 1)?;
            freed += 1;
            if ctx.metadata_csum && tail.alter_page != 0 {
                ctx.alloc.free_log_blocks(tail.alter_page >> BLOCK_SHIFT, 1)?;
                freed += 1;
            }
        } else {
            prev = Some(page);
        }
        page = next;
    }
    if new_head != sih.log_head {
        sih.log_head = new_head;
        if ctx.metadata_csum {
            sih.alter_log_head = ctx.read_tail(new_head)?.alter_page;
        }
        persist_log_pointers(ctx, sih, pi_addr)?;
    }
    sih.log_pages = sih.log_pages.saturating_sub(freed);
    if freed > 0 {
        debug!("inode {}: fast GC freed {} pages", sih.ino, freed);
    }
    Ok(freed)
}

/// Journal-protected publication of all four log pointers + checksum.
fn persist_log_pointers(ctx: &LogCtx, sih: &InodeInfoHeader, pi_addr: u64) -> FsResult<()> {
    let mut txn = ctx.journal.begin(ctx.pm, 0)?;
    txn.stage_word(ctx.pm, pi_addr + get_offset!(Inode, log_head) as u64)?;
    txn.stage_word(ctx.pm, pi_addr + get_offset!(Inode, log_tail) as u64)?;
    txn.stage_word(ctx.pm, pi_addr + get_offset!(Inode, alter_log_head) as u64)?;
    txn.stage_word(ctx.pm, pi_addr + get_offset!(Inode, alter_log_tail) as u64)?;
    txn.stage_word(ctx.pm, pi_addr + 120)?;
    let mut inode: Inode = ctx.pm.read_typed(pi_addr)?;
    inode.log_head = sih.log_head;
    inode.log_tail = sih.log_tail;
    inode.alter_log_head = sih.alter_log_head;
    inode.alter_log_tail = sih.alter_log_tail;
    inode.update_csum();
    ctx.pm.scoped_write(pi_addr, inode.as_bytes(), true)?;
    txn.commit(ctx.pm)?;
    if sih.alter_pi_addr != 0 {
        ctx.pm.scoped_write(sih.alter_pi_addr, inode.as_bytes(), true)?;
    }
    Ok(())
}

/// Fragmentation check driving thorough GC.
pub fn needs_thorough_gc(ctx: &LogCtx, sih: &InodeInfoHeader) -> FsResult<bool> {
    let mut invalid = 0u64;
    let mut total = 0u64;
    let mut page = block_off(sih.log_head);
    while page != 0 {
        let tail = ctx.read_tail(page)?;
        invalid += tail.invalid_entries as u64;
        total += tail.num_entries as u64;
        page = tail.next_page;
    }
    Ok(total > 0 && invalid * 100 / total >= THOROUGH_GC_THRESHOLD)
}

/// Thorough GC: copy the live entries into a fresh chain in order, fix every
/// DRAM pointer that referenced a moved entry, switch the inode's head/tail
/// through a journal transaction, then free the old chain.
pub fn thorough_gc(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    alter_pi_addr: u64,
    cpu: u32,
) -> FsResult<()> {
    if sih.log_head == 0 {
        return Ok(());
    }
    let old_head = sih.log_head;
    let old_alter_head = sih.alter_log_head;
    let old_tail = sih.log_tail;

    // build the replacement chain through a scratch header
    let mut scratch = InodeInfoHeader::new(sih.ino);
    scratch.trans_id = sih.trans_id;
    initialize_inode_log(ctx, &mut scratch)?;

    let mut moved: Vec<(u64, u64)> = vec![];
    for_each_entry(ctx, old_head, old_tail, |addr, kind, bytes| {
        let live = match kind {
            LogEntryType::FileWrite => {
                let e: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(bytes) };
                e.invalid_pages < e.num_pages
            }
            LogEntryType::DirLog => bytes[get_offset!(Dentry, invalid)] == 0,
            LogEntryType::SetAttr => bytes[get_offset!(SetattrEntry, invalid)] == 0,
            LogEntryType::LinkChange => bytes[get_offset!(LinkChangeEntry, invalid)] == 0,
            LogEntryType::MmapWrite => bytes[get_offset!(MmapEntry, invalid)] == 0,
            LogEntryType::NextPage => false,
        };
        if !live {
            return Ok(true);
        }
        let new_addr = {
            let curr = get_append_head(ctx, &mut scratch, pi_addr, bytes.len())?;
            ctx.pm.scoped_write(curr, bytes, true)?;
            if ctx.metadata_csum {
                let alter = alter_entry_addr(ctx, curr)?;
                ctx.pm.scoped_write(alter, bytes, true)?;
                scratch.alter_log_tail = alter + bytes.len() as u64;
            }
            bump_num_entries(ctx, curr)?;
            scratch.log_tail = curr + bytes.len() as u64;
            curr
        };
        moved.push((addr, new_addr));
        Ok(true)
    })?;

    // re-point every DRAM reference at the copied entries
    for (old, new) in &moved {
        for slot in sih.radix.values_mut() {
            if slot == old {
                *slot = *new;
            }
        }
        for slots in sih.dentries.values_mut() {
            for slot in slots.iter_mut() {
                if slot == old {
                    *slot = *new;
                }
            }
        }
        if sih.last_setattr == *old {
            sih.last_setattr = *new;
        }
        if sih.last_link_change == *old {
            sih.last_link_change = *new;
        }
    }

    sih.log_head = scratch.log_head;
    sih.log_tail = scratch.log_tail;
    sih.alter_log_head = scratch.alter_log_head;
    sih.alter_log_tail = scratch.alter_log_tail;
    sih.log_pages = scratch.log_pages;
    sih.valid_entries = moved.len() as u64;

    // atomic switch, then the old chains die
    update_inode_tail(ctx, sih, pi_addr, alter_pi_addr, cpu)?;
    free_chain_blocks(ctx, old_head)?;
    if ctx.metadata_csum && old_alter_head != 0 {
        free_chain_blocks(ctx, old_alter_head)?;
    }
    info!(
        "inode {}: thorough GC rewrote {} live entries",
        sih.ino,
        moved.len()
    );
    Ok(())
}

/// Release the whole log of a dying inode, both chains.
pub fn free_inode_log(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
) -> FsResult<()> {
    if sih.log_head == 0 {
        return Ok(());
    }
    let head = sih.log_head;
    let alter_head = sih.alter_log_head;
    sih.log_head = 0;
    sih.log_tail = 0;
    sih.alter_log_head = 0;
    sih.alter_log_tail = 0;
    sih.log_pages = 0;
    persist_log_pointers(ctx, sih, pi_addr)?;
    free_chain_blocks(ctx, head)?;
    if ctx.metadata_csum && alter_head != 0 {
        free_chain_blocks(ctx, alter_head)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytefs_lib::layout::FsLayout;
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;
    use std::sync::Arc;

    struct Harness {
        pm: PmDevice,
        alloc: BlockAlloc,
        journal: LiteJournal,
    }

    fn setup(metadata_csum: bool) -> Harness {
        let layout = FsLayout::new(2, 2048);
        let driver = Arc::new(RamSsdDriver::new(2048 << BLOCK_SHIFT));
        let pm = PmDevice::new(driver, false).unwrap();
        let alloc = BlockAlloc::new(&layout, false, false).unwrap();
        let journal = LiteJournal::new(layout);
        journal.hard_init(&pm).unwrap();
        let _ = metadata_csum;
        Harness { pm, alloc, journal }
    }

    fn ctx<'a>(h: &'a Harness, metadata_csum: bool) -> LogCtx<'a> {
        LogCtx {
            pm: &h.pm,
            alloc: &h.alloc,
            journal: &h.journal,
            metadata_csum,
            epoch_id: 1,
        }
    }

    fn pi_pair(h: &Harness) -> (u64, u64) {
        // scratch inode slots in high blocks, out of the allocator's way
        let pi = 2000u64 << BLOCK_SHIFT;
        let alter = (2000u64 << BLOCK_SHIFT) + 512;
        let mut inode = Inode::default();
        inode.valid = 1;
        inode.update_csum();
        h.pm.scoped_write(pi, inode.as_bytes(), true).unwrap();
        h.pm.scoped_write(alter, inode.as_bytes(), true).unwrap();
        (pi, alter)
    }

    fn write_entry(pgoff: u64, num_pages: u32, block: u64, size: u64) -> FileWriteEntry {
        FileWriteEntry {
            num_pages,
            block,
            pgoff,
            size,
            mtime: 1,
            ..Default::default()
        }
    }

    #[test]
    fn append_then_walk() -> Result<()> {
        let h = setup(true);
        let c = ctx(&h, true);
        let (pi, alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(40);
        for i in 0..10u64 {
            append_file_write_entry(&c, &mut sih, pi, write_entry(i, 1, 100 + i, (i + 1) * 4096))?;
        }
        update_inode_tail(&c, &sih, pi, alter, 0)?;
        let mut seen = vec![];
        for_each_entry(&c, sih.log_head, sih.log_tail, |_addr, kind, bytes| {
            assert_eq!(kind, LogEntryType::FileWrite);
            let e: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(bytes) };
            seen.push(e.pgoff);
            Ok(true)
        })?;
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        // append order carries monotone transaction ids
        assert_eq!(sih.trans_id, 10);
        Ok(())
    }

    #[test]
    fn entries_mirrored_to_replica() -> Result<()> {
        let h = setup(true);
        let c = ctx(&h, true);
        let (pi, _alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(41);
        let addr = append_file_write_entry(&c, &mut sih, pi, write_entry(0, 1, 50, 4096))?;
        let alter = alter_entry_addr(&c, addr)?;
        let mut p = vec![0u8; size_of::<FileWriteEntry>()];
        let mut a = vec![0u8; size_of::<FileWriteEntry>()];
        h.pm.read_bytes(addr, &mut p)?;
        h.pm.read_bytes(alter, &mut a)?;
        assert_eq!(p, a);
        assert_ne!(block_off(addr), block_off(alter));
        Ok(())
    }

    #[test]
    fn corrupt_primary_repaired_from_replica() -> Result<()> {
        let h = setup(true);
        let c = ctx(&h, true);
        let (pi, _alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(42);
        let addr = append_file_write_entry(&c, &mut sih, pi, write_entry(3, 2, 60, 8192))?;
        // flip a payload byte in the primary
        let mut b = [0u8; 1];
        h.pm.read_bytes(addr + 8, &mut b)?;
        h.pm.scoped_write(addr + 8, &[b[0] ^ 0x40], true)?;
        let (kind, bytes) = read_entry_checked(&c, addr)?;
        assert_eq!(kind, LogEntryType::FileWrite);
        let e: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(&bytes) };
        assert_eq!(e.pgoff, 3);
        // primary healed in place
        let mut healed = vec![0u8; bytes.len()];
        h.pm.read_bytes(addr, &mut healed)?;
        assert_eq!(healed, bytes);
        Ok(())
    }

    #[test]
    fn double_corruption_is_io() -> Result<()> {
        let h = setup(true);
        let c = ctx(&h, true);
        let (pi, _alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(43);
        let addr = append_file_write_entry(&c, &mut sih, pi, write_entry(0, 1, 61, 4096))?;
        let alter = alter_entry_addr(&c, addr)?;
        h.pm.scoped_write(addr + 8, &[0xaa], true)?;
        h.pm.scoped_write(alter + 9, &[0xbb], true)?;
        assert_eq!(read_entry_checked(&c, addr), Err(FsError::Io));
        Ok(())
    }

    #[test]
    fn log_extends_across_pages() -> Result<()> {
        let h = setup(false);
        let c = ctx(&h, false);
        let (pi, alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(44);
        // 4064 / 64 = 63 entries and a bit: push well past several pages
        for i in 0..300u64 {
            append_file_write_entry(&c, &mut sih, pi, write_entry(i, 1, 500 + i, (i + 1) * 4096))?;
        }
        update_inode_tail(&c, &sih, pi, alter, 0)?;
        assert!(sih.log_pages >= 4);
        let mut count = 0;
        for_each_entry(&c, sih.log_head, sih.log_tail, |_, _, _| {
            count += 1;
            Ok(true)
        })?;
        assert_eq!(count, 300);
        Ok(())
    }

    #[test]
    fn fast_gc_drops_dead_pages() -> Result<()> {
        let h = setup(false);
        let c = ctx(&h, false);
        let (pi, alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(45);
        let mut addrs = vec![];
        for i in 0..200u64 {
            addrs.push(append_file_write_entry(
                &c,
                &mut sih,
                pi,
                write_entry(i, 1, 700 + i, (i + 1) * 4096),
            )?);
        }
        update_inode_tail(&c, &sih, pi, alter, 0)?;
        // kill the first 126 entries (two whole pages at 63 per page)
        for addr in &addrs[..126] {
            invalidate_write_entry(&c, &mut sih, *addr, 1)?;
        }
        let pages_before = sih.log_pages;
        let log_tail = sih.log_tail;
        let freed = inode_log_fast_gc(&c, &mut sih, pi, log_tail)?;
        assert!(freed >= 2, "freed {}", freed);
        assert_eq!(sih.log_pages, pages_before - freed);
        // survivors still walk in order
        let mut seen = vec![];
        for_each_entry(&c, sih.log_head, sih.log_tail, |_, _, bytes| {
            let e: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(bytes) };
            if e.invalid_pages < e.num_pages {
                seen.push(e.pgoff);
            }
            Ok(true)
        })?;
        assert_eq!(seen, (126..200).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn thorough_gc_rewrites_chain() -> Result<()> {
        let h = setup(true);
        let c = ctx(&h, true);
        let (pi, alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(46);
        let mut addrs = vec![];
        for i in 0..100u64 {
            let addr = append_file_write_entry(&c, &mut sih, pi, write_entry(i, 1, 800 + i, (i + 1) * 4096))?;
            sih.radix.insert(i, addr);
            addrs.push(addr);
        }
        update_inode_tail(&c, &sih, pi, alter, 0)?;
        // invalidate 80%
        for addr in addrs.iter().take(80) {
            invalidate_write_entry(&c, &mut sih, *addr, 1)?;
        }
        for pgoff in 0..80u64 {
            sih.radix.remove(&pgoff);
        }
        assert!(needs_thorough_gc(&c, &sih)?);
        let free_before = h.alloc.count_free_blocks();
        thorough_gc(&c, &mut sih, pi, alter, 0)?;
        assert!(h.alloc.count_free_blocks() > free_before);
        // all remaining pages carry no invalid entries
        let mut page = block_off(sih.log_head);
        while page != 0 {
            let tail: PageTail = h.pm.read_typed(page_tail_addr(page))?;
            assert_eq!(tail.invalid_entries, 0);
            page = tail.next_page;
        }
        // radix pointers were rewritten to live entries
        for (pgoff, addr) in sih.radix.iter() {
            let (_, bytes) = read_entry_checked(&c, *addr)?;
            let e: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(&bytes) };
            assert_eq!(e.pgoff, *pgoff);
        }
        assert_eq!(sih.radix.len(), 20);
        Ok(())
    }

    #[test]
    fn inplace_update_preserves_log_space() -> Result<()> {
        let h = setup(true);
        let c = ctx(&h, true);
        let (pi, _alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(47);
        let addr = append_file_write_entry(&c, &mut sih, pi, write_entry(0, 4, 900, 4 * 4096))?;
        let tail_before = sih.log_tail;
        let (_, bytes) = read_entry_checked(&c, addr)?;
        let mut e: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(&bytes) };
        e.size = 2 * 4096;
        e.mtime = 99;
        inplace_update_log_entry(&c, &mut sih, addr, &LogEntryData::FileWrite(e), 0)?;
        assert_eq!(sih.log_tail, tail_before);
        let (_, bytes) = read_entry_checked(&c, addr)?;
        let back: FileWriteEntry = unsafe { crate::bytefs_lib::utils::deserialize_row(&bytes) };
        assert_eq!(back.size, 2 * 4096);
        assert_eq!(back.mtime, 99);
        Ok(())
    }

    #[test]
    fn free_inode_log_returns_blocks() -> Result<()> {
        let h = setup(true);
        let c = ctx(&h, true);
        let (pi, alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(48);
        for i in 0..150u64 {
            append_file_write_entry(&c, &mut sih, pi, write_entry(i, 1, 950, 4096))?;
        }
        update_inode_tail(&c, &sih, pi, alter, 0)?;
        let free_before = h.alloc.count_free_blocks();
        free_inode_log(&c, &mut sih, pi)?;
        assert!(h.alloc.count_free_blocks() > free_before);
        assert_eq!(sih.log_head, 0);
        let inode: Inode = h.pm.read_typed(pi)?;
        assert_eq!(inode.log_head, 0);
        assert_eq!(inode.log_tail, 0);
        Ok(())
    }

    #[test]
    fn dentry_appends_round_to_8() -> Result<()> {
        let h = setup(false);
        let c = ctx(&h, false);
        let (pi, _alter) = pi_pair(&h);
        let mut sih = InodeInfoHeader::new(49);
        let a = append_dentry(&c, &mut sih, pi, b"a", 100, 1, 5)?;
        let b = append_dentry(&c, &mut sih, pi, b"file_with_longer_name", 101, 1, 5)?;
        assert_eq!(b - a, dir_log_rec_len(1) as u64);
        let (kind, bytes) = read_entry_checked(&c, b)?;
        assert_eq!(kind, LogEntryType::DirLog);
        let d = Dentry::from_log_bytes(&bytes);
        assert_eq!(d.get_name(), "file_with_longer_name");
        assert_eq!(d.ino, 101);
        Ok(())
    }
}
