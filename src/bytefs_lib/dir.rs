//! Per-inode DRAM trees: the radix map from file page offsets to their
//! latest FILE_WRITE entry, and the dentry tree keyed by BKDRHash(name).
//! Hash collisions are tolerated; name equality is always verified against
//! the PM dentry.
use std::collections::HashMap;

use log::*;

use crate::bytefs_lib::inode::InodeInfoHeader;
use crate::bytefs_lib::layout::{Dentry, LogEntryType};
use crate::bytefs_lib::log::{read_entry_checked, LogCtx};
use crate::bytefs_lib::types::{FsError, FsResult};
use crate::bytefs_lib::utils::bkdr_hash;

/// Install `entry_addr` as the mapping for `[pgoff, pgoff + num_pages)`.
/// Returns the displaced entries with how many of their pages were covered,
/// so the caller can invalidate them.
pub fn insert_write_entry(
    sih: &mut InodeInfoHeader,
    entry_addr: u64,
    pgoff: u64,
    num_pages: u64,
) -> Vec<(u64, u32)> {
    let mut displaced: HashMap<u64, u32> = HashMap::new();
    for off in pgoff..pgoff + num_pages {
        if let Some(old) = sih.radix.insert(off, entry_addr) {
            if old != entry_addr {
                *displaced.entry(old).or_insert(0) += 1;
            }
        }
    }
    displaced.into_iter().collect()
}

/// The entry covering `pgoff`, if any.
pub fn find_write_entry(sih: &InodeInfoHeader, pgoff: u64) -> Option<u64> {
    sih.radix.get(&pgoff).copied()
}

/// The first mapping at or after `pgoff`; used to skip holes.
pub fn find_next_entry(sih: &InodeInfoHeader, pgoff: u64) -> Option<(u64, u64)> {
    sih.radix.range(pgoff..).next().map(|(off, addr)| (*off, *addr))
}

/// Drop the mappings for `[pgoff, pgoff + num_pages)` (truncate path).
/// Returns displaced entries like [`insert_write_entry`].
pub fn remove_write_entries(
    sih: &mut InodeInfoHeader,
    pgoff: u64,
    num_pages: u64,
) -> Vec<(u64, u32)> {
    let mut displaced: HashMap<u64, u32> = HashMap::new();
    for off in pgoff..pgoff + num_pages {
        if let Some(old) = sih.radix.remove(&off) {
            *displaced.entry(old).or_insert(0) += 1;
        }
    }
    displaced.into_iter().collect()
}

/// Record a live dentry in the directory tree.
pub fn insert_dir_tree(sih: &mut InodeInfoHeader, name: &[u8], dentry_addr: u64) {
    let hash = bkdr_hash(name);
    sih.dentries.entry(hash).or_default().push(dentry_addr);
    trace!(
        "dir {}: insert '{}' -> {:#x}",
        sih.ino,
        String::from_utf8_lossy(name),
        dentry_addr
    );
}

fn dentry_matches(ctx: &LogCtx, addr: u64, name: &[u8]) -> FsResult<Option<Dentry>> {
    let (kind, bytes) = read_entry_checked(ctx, addr)?;
    if kind != LogEntryType::DirLog {
        error!("dir tree points at non-dentry {:#x}", addr);
        return Err(FsError::Corrupt);
    }
    let dentry = Dentry::from_log_bytes(&bytes);
    if dentry.name_len as usize == name.len() && &dentry.name[..name.len()] == name {
        Ok(Some(dentry))
    } else {
        Ok(None)
    }
}

/// Look a name up, verifying equality against PM (hash collisions walk the
/// sibling list).
pub fn find_dentry(
    ctx: &LogCtx,
    sih: &InodeInfoHeader,
    name: &[u8],
) -> FsResult<Option<(u64, Dentry)>> {
    let hash = bkdr_hash(name);
    if let Some(addrs) = sih.dentries.get(&hash) {
        for addr in addrs {
            if let Some(dentry) = dentry_matches(ctx, *addr, name)? {
                return Ok(Some((*addr, dentry)));
            }
        }
    }
    Ok(None)
}

/// Unlink a name from the tree, returning the PM address of its dentry.
pub fn remove_dir_tree(
    ctx: &LogCtx,
    sih: &mut InodeInfoHeader,
    name: &[u8],
) -> FsResult<(u64, Dentry)> {
    let hash = bkdr_hash(name);
    let addrs = sih.dentries.get_mut(&hash).ok_or(FsError::Access)?;
    for (i, addr) in addrs.iter().enumerate() {
        if let Some(dentry) = dentry_matches(ctx, *addr, name)? {
            let addr = *addr;
            addrs.remove(i);
            if addrs.is_empty() {
                sih.dentries.remove(&hash);
            }
            return Ok((addr, dentry));
        }
    }
    Err(FsError::Access)
}

/// Every live dentry, sorted by name for a stable readdir order.
pub fn list_dentries(ctx: &LogCtx, sih: &InodeInfoHeader) -> FsResult<Vec<Dentry>> {
    let mut out = vec![];
    for addrs in sih.dentries.values() {
        for addr in addrs {
            let (kind, bytes) = read_entry_checked(ctx, *addr)?;
            if kind != LogEntryType::DirLog {
                return Err(FsError::Corrupt);
            }
            out.push(Dentry::from_log_bytes(&bytes));
        }
    }
    out.sort_by(|a, b| a.get_name().cmp(&b.get_name()));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytefs_lib::balloc::BlockAlloc;
    use crate::bytefs_lib::journal::LiteJournal;
    use crate::bytefs_lib::layout::{BLOCK_SHIFT, FsLayout};
    use crate::bytefs_lib::log::append_dentry;
    use crate::bytefs_lib::pm::PmDevice;
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;
    use std::sync::Arc;

    struct Harness {
        pm: PmDevice,
        alloc: BlockAlloc,
        journal: LiteJournal,
    }

    fn setup() -> Harness {
        let layout = FsLayout::new(1, 1024);
        let driver = Arc::new(RamSsdDriver::new(1024 << BLOCK_SHIFT));
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
    fn radix_overwrite_reports_displaced() {
        let mut sih = InodeInfoHeader::new(50);
        assert!(insert_write_entry(&mut sih, 0x1000, 0, 4).is_empty());
        // overwrite the middle two pages
        let displaced = insert_write_entry(&mut sih, 0x2000, 1, 2);
        assert_eq!(displaced, vec![(0x1000, 2)]);
        assert_eq!(find_write_entry(&sih, 0), Some(0x1000));
        assert_eq!(find_write_entry(&sih, 1), Some(0x2000));
        assert_eq!(find_write_entry(&sih, 2), Some(0x2000));
        assert_eq!(find_write_entry(&sih, 3), Some(0x1000));
        assert_eq!(find_write_entry(&sih, 4), None);
    }

    #[test]
    fn next_entry_skips_holes() {
        let mut sih = InodeInfoHeader::new(51);
        insert_write_entry(&mut sih, 0xa000, 10, 2);
        assert_eq!(find_next_entry(&sih, 0), Some((10, 0xa000)));
        assert_eq!(find_next_entry(&sih, 11), Some((11, 0xa000)));
        assert_eq!(find_next_entry(&sih, 12), None);
    }

    #[test]
    fn dir_tree_round_trip() -> Result<()> {
        let h = setup();
        let c = ctx(&h);
        let pi = 1000u64 << BLOCK_SHIFT;
        let mut dir = InodeInfoHeader::new(52);
        let a = append_dentry(&c, &mut dir, pi, b"alpha", 40, 2, 7)?;
        let b = append_dentry(&c, &mut dir, pi, b"beta", 41, 1, 7)?;
        insert_dir_tree(&mut dir, b"alpha", a);
        insert_dir_tree(&mut dir, b"beta", b);

        let (addr, dentry) = find_dentry(&c, &dir, b"alpha")?.unwrap();
        assert_eq!(addr, a);
        assert_eq!(dentry.ino, 40);
        assert!(find_dentry(&c, &dir, b"gamma")?.is_none());

        let names: Vec<String> = list_dentries(&c, &dir)?
            .iter()
            .map(|d| d.get_name())
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let (removed, dentry) = remove_dir_tree(&c, &mut dir, b"beta")?;
        assert_eq!(removed, b);
        assert_eq!(dentry.ino, 41);
        assert!(find_dentry(&c, &dir, b"beta")?.is_none());
        assert_eq!(
            remove_dir_tree(&c, &mut dir, b"beta").unwrap_err(),
            FsError::Access
        );
        Ok(())
    }

    #[test]
    fn colliding_names_resolved_by_comparison() -> Result<()> {
        let h = setup();
        let c = ctx(&h);
        let pi = 1000u64 << BLOCK_SHIFT;
        let mut dir = InodeInfoHeader::new(53);
        // force both names into one bucket by lying about the hash
        let a = append_dentry(&c, &mut dir, pi, b"first", 60, 1, 1)?;
        let b = append_dentry(&c, &mut dir, pi, b"second", 61, 1, 1)?;
        let hash = bkdr_hash(b"first");
        dir.dentries.entry(hash).or_default().push(a);
        dir.dentries.entry(hash).or_default().push(b);

        // lookup of "first" must not return "second"'s dentry
        let hit = {
            let addrs = dir.dentries.get(&hash).unwrap();
            let mut found = None;
            for addr in addrs {
                if let Some(d) = super::dentry_matches(&c, *addr, b"first")? {
                    found = Some((addr, d));
                    break;
                }
            }
            found
        };
        let (addr, dentry) = hit.unwrap();
        assert_eq!(*addr, a);
        assert_eq!(dentry.ino, 60);
        Ok(())
    }
}
