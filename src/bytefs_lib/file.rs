//! Regular-file data paths.
//!
//! Writes are copy-on-write: fresh blocks are allocated, filled through the
//! page cache, made durable, and only then published by a FILE_WRITE entry
//! and a journaled tail advance. A failure before publication unwinds
//! through `cleanup_incomplete_write`, leaving no trace.
use std::collections::HashMap;

use log::*;

use crate::bytefs_lib::balloc::{AllocDirection, AllocInit};
use crate::bytefs_lib::checksum::{
    restore_data, update_block_csum, update_block_parity, verify_block_csum,
};
use crate::bytefs_lib::dir::{find_next_entry, find_write_entry, insert_write_entry, remove_write_entries};
use crate::bytefs_lib::inode::InodeInfoHeader;
use crate::bytefs_lib::layout::{FileWriteEntry, Inode, BLOCK_SHIFT, BLOCK_SIZE};
use crate::bytefs_lib::log::{
    append_file_write_entry, invalidate_write_entry, read_entry_checked, update_inode_tail, LogCtx,
};
use crate::bytefs_lib::ByteFs;
use crate::bytefs_lib::stats::OpTimer;
use crate::bytefs_lib::types::{FsError, FsResult};
use crate::bytefs_lib::utils::{deserialize_row, now_secs};

/// One freshly-allocated extent of a write in flight.
struct WriteExtent {
    blocknr: u64,
    count: u64,
    pgoff: u64,
}

fn block_of(entry: &FileWriteEntry, pgoff: u64) -> u64 {
    entry.block + (pgoff - entry.pgoff)
}

fn mmap_covers(sih: &InodeInfoHeader, pgoff: u64) -> bool {
    sih.mmap_ranges
        .iter()
        .any(|(start, num)| pgoff >= *start && pgoff < start + num)
}

/// Read one block through the cache, verifying data checksums when mounted
/// in (mmap-covered blocks are exempt) and reconstructing from parity.
fn read_block_verified(fs: &ByteFs, sih: &InodeInfoHeader, blocknr: u64, pgoff: u64) -> FsResult<Vec<u8>> {
    let mut data = vec![0u8; BLOCK_SIZE];
    fs.cache.read(sih.ino, blocknr << BLOCK_SHIFT, &mut data)?;
    if !fs.opts.data_csum || mmap_covers(sih, pgoff) {
        return Ok(data);
    }
    let region = fs.alloc.list(fs.alloc.list_of_block(blocknr)).prot_region();
    if let Some(bad_stripe) = verify_block_csum(&fs.pm, &region, blocknr, &data)? {
        if !fs.opts.data_parity {
            error!("block {} stripe {} corrupt, no parity to restore", blocknr, bad_stripe);
            return Err(FsError::Io);
        }
        restore_data(&fs.pm, &region, blocknr, &mut data, bad_stripe)?;
        fs.cache.write(sih.ino, blocknr << BLOCK_SHIFT, &data)?;
        fs.cache
            .flush_range(sih.ino, blocknr << BLOCK_SHIFT, BLOCK_SIZE as u64)?;
    }
    Ok(data)
}

/// Fill `out` from the file content at `offset`, zeros for holes. Does not
/// clamp to the file size; callers do.
fn read_into(fs: &ByteFs, ctx: &LogCtx, sih: &InodeInfoHeader, offset: u64, out: &mut [u8]) -> FsResult<()> {
    let mut done = 0usize;
    while done < out.len() {
        let at = offset + done as u64;
        let pgoff = at >> BLOCK_SHIFT;
        let in_page = (at & (BLOCK_SIZE as u64 - 1)) as usize;
        let chunk = (BLOCK_SIZE - in_page).min(out.len() - done);
        match find_write_entry(sih, pgoff) {
            Some(entry_addr) => {
                let (_, bytes) = read_entry_checked(ctx, entry_addr)?;
                let entry: FileWriteEntry = unsafe { deserialize_row(&bytes) };
                let block = block_of(&entry, pgoff);
                let data = read_block_verified(fs, sih, block, pgoff)?;
                out[done..done + chunk].copy_from_slice(&data[in_page..in_page + chunk]);
            }
            None => {
                // hole: zero up to the next mapping (or the buffer end)
                let hole_end = find_next_entry(sih, pgoff)
                    .map_or(u64::MAX, |(off, _)| off << BLOCK_SHIFT);
                let zero_len = (hole_end.saturating_sub(at))
                    .min((out.len() - done) as u64)
                    .max(1) as usize;
                out[done..done + zero_len].fill(0);
                done += zero_len;
                continue;
            }
        }
        done += chunk;
    }
    Ok(())
}

/// read(): bytes past EOF read as zero up to the requested length's clamp.
pub fn do_read(fs: &ByteFs, sih: &InodeInfoHeader, offset: u64, len: usize) -> FsResult<Vec<u8>> {
    let _timer = OpTimer::new("read");
    let ctx = fs.log_ctx();
    if offset >= sih.i_size {
        return Ok(vec![]);
    }
    let len = len.min((sih.i_size - offset) as usize);
    let mut out = vec![0u8; len];
    read_into(fs, &ctx, sih, offset, &mut out)?;
    Ok(out)
}

fn protect_written_blocks(fs: &ByteFs, blocknr: u64, count: u64, buf: &[u8]) -> FsResult<()> {
    if !fs.opts.data_csum {
        return Ok(());
    }
    let region = fs.alloc.list(fs.alloc.list_of_block(blocknr)).prot_region();
    for i in 0..count {
        let block = blocknr + i;
        let data = &buf[(i as usize) << BLOCK_SHIFT..((i + 1) as usize) << BLOCK_SHIFT];
        update_block_csum(&fs.pm, &region, block, data)?;
        if fs.opts.data_parity {
            update_block_parity(&fs.pm, &region, block, data)?;
        }
    }
    Ok(())
}

/// Free the data blocks of already-allocated extents and walk the DRAM tails
/// back to the persisted inode, dropping any unpublished log entries.
fn cleanup_incomplete_write(
    fs: &ByteFs,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    extents: &[WriteExtent],
) -> FsResult<()> {
    warn!(
        "inode {}: unwinding incomplete write of {} extents",
        sih.ino,
        extents.len()
    );
    for extent in extents {
        fs.alloc.free_data_blocks(extent.blocknr, extent.count)?;
    }
    let inode: Inode = fs.pm.read_typed(pi_addr)?;
    sih.log_tail = inode.log_tail;
    sih.alter_log_tail = inode.alter_log_tail;
    Ok(())
}

/// write(): copy-on-write the covered pages, then publish.
pub fn do_write(
    fs: &ByteFs,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    alter_pi_addr: u64,
    offset: u64,
    data: &[u8],
) -> FsResult<usize> {
    let _timer = OpTimer::new("write");
    if sih.corrupt {
        return Err(FsError::Corrupt);
    }
    if data.is_empty() {
        return Ok(0);
    }
    let ctx = fs.log_ctx();
    let end = offset + data.len() as u64;
    let start_pg = offset >> BLOCK_SHIFT;
    let end_pg = (end - 1) >> BLOCK_SHIFT;
    let num_pages = end_pg - start_pg + 1;

    // page-aligned staging buffer; partial edges fetch the old content
    let mut buf = vec![0u8; (num_pages as usize) << BLOCK_SHIFT];
    let lead = (offset - (start_pg << BLOCK_SHIFT)) as usize;
    if lead != 0 {
        read_into(fs, &ctx, sih, start_pg << BLOCK_SHIFT, &mut buf[..BLOCK_SIZE])?;
    }
    let tail_unaligned = end & (BLOCK_SIZE as u64 - 1) != 0;
    if tail_unaligned && (end_pg != start_pg || lead == 0) {
        let base = (end_pg - start_pg) as usize;
        read_into(
            fs,
            &ctx,
            sih,
            end_pg << BLOCK_SHIFT,
            &mut buf[base << BLOCK_SHIFT..(base + 1) << BLOCK_SHIFT],
        )?;
    }
    buf[lead..lead + data.len()].copy_from_slice(data);

    // allocate and fill fresh blocks, durably, before anything is published
    let mut extents: Vec<WriteExtent> = vec![];
    let mut pg = start_pg;
    let mut remaining = num_pages;
    let mut buf_off = 0usize;
    while remaining > 0 {
        let (blocknr, got) = match fs.alloc.new_data_blocks(
            &fs.pm,
            remaining,
            fs.data_cpu(sih.ino),
            AllocInit::NoInit,
            AllocDirection::FromHead,
        ) {
            Ok(r) => r,
            Err(e) => {
                cleanup_incomplete_write(fs, sih, pi_addr, &extents)?;
                return Err(e);
            }
        };
        let span = &buf[buf_off..buf_off + ((got as usize) << BLOCK_SHIFT)];
        let result = fs
            .cache
            .write(sih.ino, blocknr << BLOCK_SHIFT, span)
            .and_then(|_| {
                fs.cache
                    .flush_range(sih.ino, blocknr << BLOCK_SHIFT, got << BLOCK_SHIFT)
            })
            .and_then(|_| protect_written_blocks(fs, blocknr, got, span));
        if let Err(e) = result {
            fs.alloc.free_data_blocks(blocknr, got)?;
            cleanup_incomplete_write(fs, sih, pi_addr, &extents)?;
            return Err(e);
        }
        extents.push(WriteExtent {
            blocknr,
            count: got,
            pgoff: pg,
        });
        pg += got;
        remaining -= got;
        buf_off += (got as usize) << BLOCK_SHIFT;
    }

    // append one FILE_WRITE per extent
    let new_size = sih.i_size.max(end);
    let mtime = now_secs();
    let mut appended: Vec<(u64, &WriteExtent)> = vec![];
    for extent in &extents {
        let entry = FileWriteEntry {
            num_pages: extent.count as u32,
            block: extent.blocknr,
            pgoff: extent.pgoff,
            mtime,
            size: new_size,
            ..Default::default()
        };
        match append_file_write_entry(&ctx, sih, pi_addr, entry) {
            Ok(addr) => appended.push((addr, extent)),
            Err(e) => {
                cleanup_incomplete_write(fs, sih, pi_addr, &extents)?;
                return Err(e);
            }
        }
    }

    // swap the radix mappings and retire what they displaced
    for (addr, extent) in &appended {
        let mut displaced: HashMap<u64, u32> = HashMap::new();
        for pgoff in extent.pgoff..extent.pgoff + extent.count {
            if let Some(old_addr) = find_write_entry(sih, pgoff) {
                let (_, bytes) = read_entry_checked(&ctx, old_addr)?;
                let old: FileWriteEntry = unsafe { deserialize_row(&bytes) };
                fs.alloc.free_data_blocks(block_of(&old, pgoff), 1)?;
                *displaced.entry(old_addr).or_insert(0) += 1;
            }
        }
        insert_write_entry(sih, *addr, extent.pgoff, extent.count);
        for (old_addr, count) in displaced {
            invalidate_write_entry(&ctx, sih, old_addr, count)?;
        }
    }

    sih.i_size = new_size;
    sih.mtime = mtime;
    sih.ctime = mtime;
    update_inode_tail(&ctx, sih, pi_addr, alter_pi_addr, fs.data_cpu(sih.ino) as u32)?;
    Ok(data.len())
}

/// fsync(): push cached file data and any coalesced regions down to NAND.
pub fn do_fsync(fs: &ByteFs, sih: &InodeInfoHeader) -> FsResult<()> {
    let _timer = OpTimer::new("fsync");
    fs.cache.flush_file(sih.ino)?;
    fs.driver.sync().map_err(|_| FsError::Io)
}

/// Shrink or grow to `new_size`; shrinking frees whole pages past the end
/// and invalidates their mappings.
pub fn do_truncate(
    fs: &ByteFs,
    sih: &mut InodeInfoHeader,
    pi_addr: u64,
    new_size: u64,
) -> FsResult<()> {
    let _timer = OpTimer::new("truncate");
    if new_size >= sih.i_size {
        sih.i_size = new_size;
        return Ok(());
    }
    let ctx = fs.log_ctx();
    let cut_pg = (new_size + BLOCK_SIZE as u64 - 1) >> BLOCK_SHIFT;
    let last_pg = if sih.i_size == 0 {
        0
    } else {
        (sih.i_size - 1) >> BLOCK_SHIFT
    };
    if last_pg >= cut_pg {
        // free the blocks page by page before the mappings vanish
        for pgoff in cut_pg..=last_pg {
            if let Some(entry_addr) = find_write_entry(sih, pgoff) {
                let (_, bytes) = read_entry_checked(&ctx, entry_addr)?;
                let entry: FileWriteEntry = unsafe { deserialize_row(&bytes) };
                fs.alloc.free_data_blocks(block_of(&entry, pgoff), 1)?;
            }
        }
        let displaced = remove_write_entries(sih, cut_pg, last_pg - cut_pg + 1);
        for (old_addr, count) in displaced {
            invalidate_write_entry(&ctx, sih, old_addr, count)?;
        }
    }
    sih.i_size = new_size;
    Ok(())
}

/// Evict path: give every referenced data block back to the allocator.
pub fn free_file_blocks(fs: &ByteFs, sih: &mut InodeInfoHeader) -> FsResult<()> {
    let ctx = fs.log_ctx();
    let pgoffs: Vec<u64> = sih.radix.keys().copied().collect();
    for pgoff in pgoffs {
        if let Some(entry_addr) = find_write_entry(sih, pgoff) {
            let (_, bytes) = read_entry_checked(&ctx, entry_addr)?;
            let entry: FileWriteEntry = unsafe { deserialize_row(&bytes) };
            fs.alloc.free_data_blocks(block_of(&entry, pgoff), 1)?;
        }
    }
    sih.radix.clear();
    fs.cache.drop_file(sih.ino)?;
    Ok(())
}
