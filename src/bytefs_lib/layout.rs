//! PM-resident structures and the device layout.
//!
//! Everything here is `#[repr(C)]`, little-endian, and laid out without
//! implicit padding; the tests pin every size. The checksum field is always
//! last in fixed-size structs.
#![allow(dead_code)]

use std::mem::size_of;

use num_enum::TryFromPrimitive;
use zerocopy::{AsBytes, FromBytes};

use crate::bytefs_lib::checksum::{crc32c, INIT_CSUM};
use crate::bytefs_lib::types::{le16, le32, le64};

pub const BLOCK_SHIFT: u32 = 12;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;
pub const CACHELINE_SIZE: usize = 64;

pub const BYTEFS_SUPER_MAGIC: u32 = 0x00B17EF5;

/* Fixed head-of-device blocks */
pub const SUPER_BLOCK_START: u64 = 0; /* Primary superblock */
pub const REPLICA_SB_START: u64 = 1; /* Replica superblock */
pub const RESERVED_INODE_START: u64 = 2; /* Primary reserved inodes */
pub const REPLICA_INODE_START: u64 = 3; /* Replica reserved inodes */
pub const JOURNAL_PTR_START: u64 = 4; /* Per-CPU head/tail pairs */
pub const JOURNAL_DATA_START: u64 = 5; /* Per-CPU journal pages */

/*
 * Special inode numbers
 */
pub const ROOT_INO: u64 = 1; /* Root inode */
pub const BLOCKNODE_INO: u64 = 2; /* Free-list checkpoint inode */
pub const INODELIST_INO: u64 = 3; /* Inode-map checkpoint inode */
pub const RESERVED_INODES: u64 = 32; /* Slots in the reserved blocks */
/* First dynamically allocated inode number */
pub const NORMAL_INODE_START: u64 = 32;

pub const INODE_SIZE: usize = 128;

/* A log page is payload up to the 32 B tail record */
pub const LOG_BLOCK_TAIL: usize = 4064;
pub const PAGE_TAIL_SIZE: usize = BLOCK_SIZE - LOG_BLOCK_TAIL;
/* Doubling cap for log extension */
pub const EXTEND_THRESHOLD: u64 = 256;
/* invalid/total ratio (percent) beyond which thorough GC kicks in */
pub const THOROUGH_GC_THRESHOLD: u64 = 50;

/* Dentry name handling */
pub const NAME_LEN: usize = 220;
pub const DENTRY_HEADER_LEN: usize = 48;
pub const DIR_PAD: usize = 8; /* Align to 8 bytes boundary */
pub const DIR_ROUND: usize = DIR_PAD - 1;

pub const fn dir_log_rec_len(name_len: usize) -> usize {
    ((name_len + 1) + DENTRY_HEADER_LEN + DIR_ROUND) & !DIR_ROUND
}

pub const MAX_DENTRY_LEN: usize = dir_log_rec_len(NAME_LEN);

/* Lite journal */
pub const MAX_JOURNAL_LENGTH: usize = 128;
pub const JOURNAL_ENTRY_SIZE: usize = 32;

pub const ANY_CPU: i32 = -1;

/// Block offsets derived from the CPU count; everything after the journal
/// region moves with it.
#[derive(Debug, Clone, Copy)]
pub struct FsLayout {
    pub cpus: u32,
    pub num_blocks: u64,
}

impl FsLayout {
    pub fn new(cpus: u32, num_blocks: u64) -> Self {
        Self { cpus, num_blocks }
    }

    pub fn journal_data_block(&self, cpu: u32) -> u64 {
        JOURNAL_DATA_START + cpu as u64
    }

    pub fn inode_table0_block(&self) -> u64 {
        JOURNAL_DATA_START + self.cpus as u64
    }

    pub fn inode_table1_block(&self) -> u64 {
        self.inode_table0_block() + 1
    }

    /// First block the allocator may hand out.
    pub fn head_reserved_blocks(&self) -> u64 {
        self.inode_table1_block() + 1
    }

    /// PM byte address of a reserved inode copy.
    pub fn reserved_inode_addr(&self, ino: u64, replica: bool) -> u64 {
        debug_assert!(ino < RESERVED_INODES);
        let base = if replica {
            REPLICA_INODE_START
        } else {
            RESERVED_INODE_START
        };
        (base << BLOCK_SHIFT) + ino * INODE_SIZE as u64
    }

    /// PM byte address of cpu's journal pointer pair (cacheline-striped).
    pub fn journal_ptr_addr(&self, cpu: u32) -> u64 {
        (JOURNAL_PTR_START << BLOCK_SHIFT) + cpu as u64 * CACHELINE_SIZE as u64
    }
}

/*
 * Structure of the super block
 */
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct SuperBlock {
    pub s_magic: le32,              /* Magic signature */
    pub s_blocksize: le32,          /* In bytes */
    pub s_size: le64,               /* Device size in bytes */
    pub s_num_blocks: le64,         /* Device size in blocks */
    pub s_cpus: le32,               /* Per-CPU structure count */
    pub s_head_reserved_blocks: le32, /* Blocks before the allocatable region */
    pub s_journal_start: le64,      /* Journal pointer block */
    pub s_inode_table0_start: le64, /* Primary inode-table roots */
    pub s_inode_table1_start: le64, /* Replica inode-table roots */
    pub s_mount_epoch: le64,        /* Incremented every mount */
    pub s_mount_time: le32,         /* Seconds since epoch */
    pub s_state: le32,              /* Clean / dirty */
    pub s_blocknode_ckpt: le64,     /* Free-list checkpoint block, 0 if none */
    pub s_blocknode_count: le64,    /* Checkpoint tuple count */
    pub s_inodelist_ckpt: le64,     /* Inode-map checkpoint block, 0 if none */
    pub s_inodelist_count: le64,
    pub s_feature_flags: le32,      /* Data-protection layout at mkfs time */
    pub s_blocknode_ckpt_blocks: le32,
    pub s_inodelist_ckpt_blocks: le32,
    pub s_reserved: [le32; 2],
    pub s_csum: le32, /* crc32c(superblock - csum) */
}

/* s_feature_flags bits */
pub const FEATURE_DATA_CSUM: u32 = 1 << 0;
pub const FEATURE_DATA_PARITY: u32 = 1 << 1;

pub const SB_STATE_CLEAN: u32 = 1; /* Unmounted cleanly */
pub const SB_STATE_DIRTY: u32 = 2; /* Mounted, or crashed while mounted */

impl SuperBlock {
    pub fn update_csum(&mut self) {
        self.s_csum = crc32c(INIT_CSUM, &self.as_bytes()[..size_of::<Self>() - 4]);
    }

    pub fn csum_ok(&self) -> bool {
        self.s_csum == crc32c(INIT_CSUM, &self.as_bytes()[..size_of::<Self>() - 4])
    }

    pub fn magic_matched(&self) -> bool {
        self.s_magic == BYTEFS_SUPER_MAGIC
    }
}

/*
 * Structure of a PM inode. 128 bytes, checksum last.
 */
#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes)]
#[repr(C)]
pub struct Inode {
    pub valid: u8,             /* Is this inode valid? */
    pub deleted: u8,           /* Is this inode deleted? */
    pub i_blk_type: u8,        /* Data block size this inode uses */
    pub i_rsvd: u8,
    pub i_flags: le32,         /* Inode flags */
    pub i_size: le64,          /* Size of data in bytes */
    pub i_ctime: le32,         /* Inode modification time */
    pub i_mtime: le32,         /* Data modification time */
    pub i_atime: le32,         /* Access time */
    pub i_mode: le16,          /* File mode */
    pub i_links_count: le16,   /* Links count */
    pub i_xattr: le64,         /* Extended attribute block */
    pub i_uid: le32,           /* Owner Uid */
    pub i_gid: le32,           /* Group Id */
    pub i_generation: le32,    /* File version (for NFS) */
    pub i_create_time: le32,   /* Create time */
    pub ino: le64,             /* Inode number */
    pub log_head: le64,        /* Log head pointer */
    pub log_tail: le64,        /* Log tail pointer */
    pub alter_log_head: le64,  /* Replica log head pointer */
    pub alter_log_tail: le64,  /* Replica log tail pointer */
    pub create_epoch_id: le64, /* Epoch when created */
    pub delete_epoch_id: le64, /* Epoch when deleted */
    pub rdev: le32,            /* Major/minor of a device inode */
    pub i_reserved: [le32; 2],
    pub csum: le32, /* crc32c(inode - csum) */
}

impl Default for Inode {
    fn default() -> Self {
        Inode::new_zeroed()
    }
}

impl Inode {
    pub fn update_csum(&mut self) {
        self.csum = crc32c(INIT_CSUM, &self.as_bytes()[..size_of::<Self>() - 4]);
    }

    pub fn csum_ok(&self) -> bool {
        self.csum == crc32c(INIT_CSUM, &self.as_bytes()[..size_of::<Self>() - 4])
    }
}

/*
 * Log page state and pointers to the next page and the replica page.
 * Lives in the last 32 bytes of each 4 KiB log page.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct PageTail {
    pub invalid_entries: le32,
    pub num_entries: le32,
    pub epoch_id: le64,
    pub alter_page: le64, /* Corresponding page in the other log */
    pub next_page: le64,
}

/// Entry kinds, tagged by the leading byte of every log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum LogEntryType {
    FileWrite = 1,
    DirLog = 2,
    SetAttr = 3,
    LinkChange = 4,
    MmapWrite = 5,
    NextPage = 6,
}

/*
 * Write log entry. Records a write to a contiguous range of data blocks.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct FileWriteEntry {
    pub entry_type: u8,
    pub reassigned: u8, /* Data is not latest */
    pub updating: u8,   /* Data is being written */
    pub padding: u8,
    pub num_pages: le32,
    pub block: le64,         /* First data block of this write */
    pub pgoff: le64,         /* File page offset of this write */
    pub invalid_pages: le32, /* For GC */
    pub mtime: le32,         /* For both ctime and mtime */
    pub size: le64,          /* File size after this write */
    pub epoch_id: le64,
    pub trans_id: le64,
    pub csumpadding: le32,
    pub csum: le32,
}

/*
 * Log entry for adding a file/directory to a directory. Variable length;
 * `de_len` covers the header, the NUL-terminated name and 8 B rounding.
 */
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct Dentry {
    pub entry_type: u8,
    pub name_len: u8,   /* Length of the dentry name */
    pub reassigned: u8, /* Currently deleted */
    pub invalid: u8,    /* Invalid now? */
    pub de_len: le16,   /* Length of this dentry on the log */
    pub links_count: le16,
    pub mtime: le32, /* For both mtime and ctime */
    pub csum: le32,  /* Entry checksum */
    pub ino: le64,   /* Inode number pointed to by this entry */
    pub padding: le64,
    pub epoch_id: le64,
    pub trans_id: le64,
    pub name: [u8; NAME_LEN + 4], /* NUL-terminated file name */
}

impl Dentry {
    pub fn get_name(&self) -> String {
        String::from_utf8_lossy(&self.name[..self.name_len as usize]).to_string()
    }

    pub fn rec_len(&self) -> usize {
        self.de_len as usize
    }

    /// Rebuild from its on-log form, which is truncated to `de_len` bytes.
    pub fn from_log_bytes(bytes: &[u8]) -> Self {
        let mut full = [0u8; size_of::<Dentry>()];
        let n = bytes.len().min(full.len());
        full[..n].copy_from_slice(&bytes[..n]);
        zerocopy::FromBytes::read_from(&full[..]).unwrap()
    }
}

/*
 * Log entry for updating file attributes.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct SetattrEntry {
    pub entry_type: u8,
    pub attr: u8, /* Bitmap of the attributes to update */
    pub mode: le16,
    pub uid: le32,
    pub gid: le32,
    pub atime: le32,
    pub mtime: le32,
    pub ctime: le32,
    pub size: le64, /* File size after truncation */
    pub epoch_id: le64,
    pub trans_id: le64,
    pub invalid: u8,
    pub paddings: [u8; 3],
    pub csum: le32,
}

/* Attribute mask bits for SetattrEntry.attr */
pub const ATTR_MODE: u8 = 1 << 0;
pub const ATTR_UID: u8 = 1 << 1;
pub const ATTR_GID: u8 = 1 << 2;
pub const ATTR_SIZE: u8 = 1 << 3;
pub const ATTR_ATIME: u8 = 1 << 4;
pub const ATTR_MTIME: u8 = 1 << 5;
pub const ATTR_CTIME: u8 = 1 << 6;

/*
 * Link change log entry.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct LinkChangeEntry {
    pub entry_type: u8,
    pub invalid: u8,
    pub links: le16,
    pub ctime: le32,
    pub flags: le32,
    pub generation: le32, /* For NFS handles */
    pub epoch_id: le64,
    pub trans_id: le64,
    pub csumpadding: le32,
    pub csum: le32,
}

/*
 * MMap entry. Records that a region of the file is mapped, so parity and
 * checksums are inoperative there. An entry with invalid=1 is a no-op.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct MmapEntry {
    pub entry_type: u8,
    pub invalid: u8,
    pub paddings: [u8; 6],
    pub epoch_id: le64,
    pub pgoff: le64,
    pub num_pages: le64,
    pub csumpadding: le32,
    pub csum: le32,
}

/* Journal record kinds */
pub const JOURNAL_INODE: u64 = 1;
pub const JOURNAL_ENTRY: u64 = 2;

/*
 * Lightweight journal entry.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct LiteJournalEntry {
    pub j_type: le64, /* JOURNAL_INODE or JOURNAL_ENTRY */
    pub data1: le64,
    pub data2: le64,
    pub padding: le32,
    pub csum: le32,
}

impl LiteJournalEntry {
    pub fn update_csum(&mut self) {
        self.csum = crc32c(INIT_CSUM, &self.as_bytes()[..size_of::<Self>() - 4]);
    }

    pub fn csum_ok(&self) -> bool {
        self.csum == crc32c(INIT_CSUM, &self.as_bytes()[..size_of::<Self>() - 4])
    }
}

/*
 * Head and tail pointers into the circular per-CPU journal.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct JournalPtrPair {
    pub journal_head: le64,
    pub journal_tail: le64,
}

/*
 * One tuple of the free-list / inode-list checkpoint arrays.
 */
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct RangeCheckpoint {
    pub range_low: le64,
    pub range_high: le64,
}

/// Fixed wire size of an entry type; `DirLog` reads `de_len` instead.
pub fn fixed_entry_size(kind: LogEntryType) -> Option<usize> {
    match kind {
        LogEntryType::FileWrite => Some(size_of::<FileWriteEntry>()),
        LogEntryType::SetAttr => Some(size_of::<SetattrEntry>()),
        LogEntryType::LinkChange => Some(size_of::<LinkChangeEntry>()),
        LogEntryType::MmapWrite => Some(size_of::<MmapEntry>()),
        LogEntryType::NextPage => Some(1),
        LogEntryType::DirLog => None,
    }
}

/// Offset of the csum field within each entry's serialized form.
pub fn entry_csum_offset(kind: LogEntryType) -> usize {
    match kind {
        LogEntryType::FileWrite => size_of::<FileWriteEntry>() - 4,
        LogEntryType::SetAttr => size_of::<SetattrEntry>() - 4,
        LogEntryType::LinkChange => size_of::<LinkChangeEntry>() - 4,
        LogEntryType::MmapWrite => size_of::<MmapEntry>() - 4,
        LogEntryType::DirLog => crate::get_offset!(Dentry, csum),
        LogEntryType::NextPage => 0,
    }
}

const _: () = assert!(size_of::<SuperBlock>() == 128);
const _: () = assert!(size_of::<Inode>() == INODE_SIZE);
const _: () = assert!(size_of::<PageTail>() == PAGE_TAIL_SIZE);
const _: () = assert!(size_of::<FileWriteEntry>() == 64);
const _: () = assert!(size_of::<SetattrEntry>() == 56);
const _: () = assert!(size_of::<LinkChangeEntry>() == 40);
const _: () = assert!(size_of::<MmapEntry>() == 40);
const _: () = assert!(size_of::<Dentry>() == DENTRY_HEADER_LEN + NAME_LEN + 4);
const _: () = assert!(size_of::<LiteJournalEntry>() == JOURNAL_ENTRY_SIZE);
const _: () = assert!(size_of::<RangeCheckpoint>() == 16);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::get_offset;

    #[test]
    fn sizes_and_offsets() {
        assert_eq!(size_of::<SuperBlock>(), 128);
        assert_eq!(size_of::<Inode>(), 128);
        assert_eq!(size_of::<PageTail>(), 32);
        assert_eq!(size_of::<FileWriteEntry>(), 64);
        assert_eq!(size_of::<SetattrEntry>(), 56);
        assert_eq!(size_of::<LinkChangeEntry>(), 40);
        assert_eq!(size_of::<MmapEntry>(), 40);
        assert_eq!(size_of::<LiteJournalEntry>(), 32);
        // checksum fields sit last
        assert_eq!(get_offset!(SuperBlock, s_csum), 124);
        assert_eq!(get_offset!(Inode, csum), 124);
        // the page tail starts where the payload area ends
        assert_eq!(LOG_BLOCK_TAIL + size_of::<PageTail>(), BLOCK_SIZE);
    }

    #[test]
    fn dentry_rec_len_rounds_to_8() {
        assert_eq!(dir_log_rec_len(1), 56);
        assert_eq!(dir_log_rec_len(7), 56);
        assert_eq!(dir_log_rec_len(8), 64);
        assert_eq!(dir_log_rec_len(NAME_LEN), MAX_DENTRY_LEN);
        assert_eq!(MAX_DENTRY_LEN, 272);
    }

    #[test]
    fn inode_csum_detects_flip() {
        let mut inode = Inode::default();
        inode.valid = 1;
        inode.ino = 42;
        inode.update_csum();
        assert!(inode.csum_ok());
        inode.i_size = 4096;
        assert!(!inode.csum_ok());
        inode.update_csum();
        assert!(inode.csum_ok());
    }

    #[test]
    fn entry_type_tags() {
        assert_eq!(LogEntryType::try_from(1u8).unwrap(), LogEntryType::FileWrite);
        assert_eq!(LogEntryType::try_from(2u8).unwrap(), LogEntryType::DirLog);
        assert_eq!(LogEntryType::try_from(6u8).unwrap(), LogEntryType::NextPage);
        assert!(LogEntryType::try_from(0u8).is_err());
        assert!(LogEntryType::try_from(9u8).is_err());
    }

    #[test]
    fn layout_blocks_follow_cpu_count() {
        let layout = FsLayout::new(4, 16384);
        assert_eq!(layout.journal_data_block(0), 5);
        assert_eq!(layout.journal_data_block(3), 8);
        assert_eq!(layout.inode_table0_block(), 9);
        assert_eq!(layout.inode_table1_block(), 10);
        assert_eq!(layout.head_reserved_blocks(), 11);
    }
}
