/// Filesystem logics
use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use ::log::{debug, error, info, warn};
use ssd_driver::SsdDriver;
use zerocopy::AsBytes;

pub mod balloc;
pub mod checksum;
pub mod dir;
pub mod file;
pub mod inode;
pub mod journal;
pub mod layout;
pub mod log;
pub mod pagecache;
pub mod pm;
pub mod rebuild;
pub mod stats;
pub mod types;
pub mod utils;

use balloc::BlockAlloc;
use inode::{InodeInfoHeader, InodeStore};
use journal::LiteJournal;
use layout::{
    FsLayout, Inode, LinkChangeEntry, MmapEntry, SetattrEntry, SuperBlock, BLOCK_SHIFT,
    BLOCK_SIZE, BYTEFS_SUPER_MAGIC, FEATURE_DATA_CSUM, FEATURE_DATA_PARITY, RESERVED_INODES,
    ROOT_INO, SB_STATE_CLEAN, SB_STATE_DIRTY,
};
use pagecache::PageCache;
use pm::PmDevice;
use rebuild::{
    full_rescan, load_checkpoint, recover_superblock, save_checkpoint, save_free_list_checkpoint,
    write_superblock,
};
use stats::{IoctlCmd, OpTimer};
use types::{FsError, FsResult, MountOpts};
use utils::now_secs;

use crate::bytefs_lib::dir::{find_dentry, insert_dir_tree, remove_dir_tree};
use crate::bytefs_lib::layout::RangeCheckpoint;
use crate::bytefs_lib::log::{
    append_dentry, append_link_change_entry, append_mmap_entry, append_setattr_entry,
    initialize_inode_log, invalidate_logentry, needs_thorough_gc, read_entry_checked,
    reassign_logentry, rewrite_entry_both, thorough_gc, LogCtx,
};

/// Page-cache watermarks for a default mount.
const CACHE_HIGH_WATERMARK: usize = 4096;
const CACHE_LOW_WATERMARK: usize = 2048;

pub struct ByteFs {
    pub driver: Arc<dyn SsdDriver>,
    pub pm: PmDevice,
    pub layout: FsLayout,
    pub opts: MountOpts,
    pub alloc: BlockAlloc,
    pub journal: LiteJournal,
    pub store: InodeStore,
    pub cache: Arc<PageCache>,
    pub epoch_id: u64,
    inodes: RwLock<HashMap<u64, Arc<Mutex<InodeInfoHeader>>>>,
    next_cpu: AtomicUsize,
}

impl ByteFs {
    /// mkfs: lay the head region out, seed the root directory, leave a clean
    /// image with checkpoints behind.
    pub fn format(driver: Arc<dyn SsdDriver>, cpus: u32, opts: &MountOpts) -> FsResult<()> {
        let size = driver.consts().layout_size;
        let num_blocks = size >> BLOCK_SHIFT;
        let layout = FsLayout::new(cpus, num_blocks);
        let pm = PmDevice::new(driver.clone(), false)?;
        info!(
            "formatting: {} blocks, {} cpus, head reserve {}",
            num_blocks,
            cpus,
            layout.head_reserved_blocks()
        );

        {
            let _window = pm.unlock();
            let head_bytes = (layout.head_reserved_blocks() as usize) << BLOCK_SHIFT;
            pm.memset(0, 0, head_bytes)?;
            pm.flush(0, head_bytes, true)?;
        }

        // every reserved slot gets a checksummed invalid inode so integrity
        // checks distinguish "empty" from "rotten"
        for ino in 1..RESERVED_INODES {
            let mut pi = Inode::default();
            pi.ino = ino;
            pi.update_csum();
            pm.scoped_write(layout.reserved_inode_addr(ino, false), pi.as_bytes(), false)?;
            pm.scoped_write(layout.reserved_inode_addr(ino, true), pi.as_bytes(), true)?;
        }

        let journal = LiteJournal::new(layout);
        journal.hard_init(&pm)?;
        let alloc = BlockAlloc::new(&layout, opts.data_csum, opts.data_parity)?;
        let store = InodeStore::new(layout, opts.metadata_csum);

        // root directory with its own "." and ".." entries
        let ctx = LogCtx {
            pm: &pm,
            alloc: &alloc,
            journal: &journal,
            metadata_csum: opts.metadata_csum,
            epoch_id: 1,
        };
        let mut root_sih = InodeInfoHeader::new(ROOT_INO);
        initialize_inode_log(&ctx, &mut root_sih)?;
        let pi_addr = layout.reserved_inode_addr(ROOT_INO, false);
        let dot = append_dentry(&ctx, &mut root_sih, pi_addr, b".", ROOT_INO, 2, now_secs())?;
        let dotdot = append_dentry(&ctx, &mut root_sih, pi_addr, b"..", ROOT_INO, 2, now_secs())?;
        insert_dir_tree(&mut root_sih, b".", dot);
        insert_dir_tree(&mut root_sih, b"..", dotdot);

        let mut root = Inode::default();
        root.valid = 1;
        root.ino = ROOT_INO;
        root.i_mode = 0o040755;
        root.i_links_count = 2;
        root.i_flags = 0;
        root.i_generation = rand::random::<u32>();
        root.i_ctime = now_secs();
        root.i_mtime = root.i_ctime;
        root.i_atime = root.i_ctime;
        root.i_create_time = root.i_ctime;
        root.create_epoch_id = 1;
        root.log_head = root_sih.log_head;
        root.log_tail = root_sih.log_tail;
        root.alter_log_head = root_sih.alter_log_head;
        root.alter_log_tail = root_sih.alter_log_tail;
        store.write_inode(&pm, &alloc, &mut root)?;

        // clean-unmount checkpoints so the first mount takes the fast path
        let inode_ranges = store.checkpoint();
        let (ickpt, icount) = save_checkpoint(&pm, &alloc, &inode_ranges)?;
        let (bckpt, bcount, bblocks) = save_free_list_checkpoint(&pm, &alloc)?;

        let mut feature_flags = 0u32;
        if opts.data_csum {
            feature_flags |= FEATURE_DATA_CSUM;
        }
        if opts.data_parity {
            feature_flags |= FEATURE_DATA_PARITY;
        }
        let mut sb = SuperBlock {
            s_magic: BYTEFS_SUPER_MAGIC,
            s_blocksize: BLOCK_SIZE as u32,
            s_size: size,
            s_num_blocks: num_blocks,
            s_cpus: cpus,
            s_head_reserved_blocks: layout.head_reserved_blocks() as u32,
            s_journal_start: layout::JOURNAL_PTR_START,
            s_inode_table0_start: layout.inode_table0_block(),
            s_inode_table1_start: layout.inode_table1_block(),
            s_mount_epoch: 1,
            s_mount_time: now_secs(),
            s_state: SB_STATE_CLEAN,
            s_blocknode_ckpt: bckpt,
            s_blocknode_count: bcount,
            s_inodelist_ckpt: ickpt,
            s_inodelist_count: icount,
            s_feature_flags: feature_flags,
            s_blocknode_ckpt_blocks: bblocks as u32,
            s_inodelist_ckpt_blocks: ((icount as usize * size_of::<RangeCheckpoint>()
                + BLOCK_SIZE
                - 1)
                / BLOCK_SIZE) as u32,
            s_reserved: [0; 2],
            s_csum: 0,
        };
        write_superblock(&pm, &mut sb)?;
        driver.sync().map_err(|_| FsError::Io)?;
        info!("format done");
        Ok(())
    }

    pub fn mount(driver: Arc<dyn SsdDriver>, opts: MountOpts) -> FsResult<Self> {
        Self::mount_with_cache(driver, opts, CACHE_HIGH_WATERMARK, CACHE_LOW_WATERMARK)
    }

    pub fn mount_with_cache(
        driver: Arc<dyn SsdDriver>,
        mut opts: MountOpts,
        cache_high: usize,
        cache_low: usize,
    ) -> FsResult<Self> {
        let _timer = OpTimer::new("mount");
        let pm = PmDevice::new(driver.clone(), opts.wprotect)?;
        let mut sb = recover_superblock(&pm)?;
        if sb.s_blocksize as usize != BLOCK_SIZE || sb.s_num_blocks != pm.size() >> BLOCK_SHIFT {
            error!("superblock geometry does not match the device");
            return Err(FsError::Corrupt);
        }
        let layout = FsLayout::new(sb.s_cpus, sb.s_num_blocks);

        // the data-protection layout is fixed at mkfs time
        let data_csum = sb.s_feature_flags & FEATURE_DATA_CSUM != 0;
        let data_parity = sb.s_feature_flags & FEATURE_DATA_PARITY != 0;
        if opts.data_csum != data_csum || opts.data_parity != data_parity {
            warn!(
                "mount options adjusted to the on-media layout (data_csum={}, data_parity={})",
                data_csum, data_parity
            );
            opts.data_csum = data_csum;
            opts.data_parity = data_parity;
        }

        let epoch_id = sb.s_mount_epoch + 1;
        if let Some(snapshot_epoch) = opts.mount_snapshot_epoch {
            if snapshot_epoch > epoch_id {
                return Err(FsError::Invalid);
            }
            info!("mount pinned at snapshot epoch {}", snapshot_epoch);
        }

        let journal = LiteJournal::new(layout);
        let replayed = journal.recover(&pm)?;
        if replayed > 0 {
            info!("journal recovery replayed {} pending transactions", replayed);
        }

        let mut alloc = BlockAlloc::new(&layout, data_csum, data_parity)?;
        if opts.dram_struct_csum {
            alloc.enable_dram_struct_csum();
        }
        let store = InodeStore::new(layout, opts.metadata_csum);
        let mut inodes = HashMap::new();

        let clean = sb.s_state == SB_STATE_CLEAN && sb.s_blocknode_ckpt != 0;
        if clean {
            debug!("clean mount: restoring checkpoints");
            let free_ranges = load_checkpoint(&pm, sb.s_blocknode_ckpt, sb.s_blocknode_count)?;
            alloc.restore(&free_ranges)?;
            let ino_ranges = load_checkpoint(&pm, sb.s_inodelist_ckpt, sb.s_inodelist_count)?;
            store.restore(&ino_ranges)?;
            // the checkpoint blocks themselves go back to the free space
            alloc.free_data_blocks(sb.s_blocknode_ckpt, sb.s_blocknode_ckpt_blocks as u64)?;
            if sb.s_inodelist_ckpt != 0 {
                alloc.free_data_blocks(sb.s_inodelist_ckpt, sb.s_inodelist_ckpt_blocks as u64)?;
            }
        } else {
            warn!("unclean image: rebuilding DRAM state from the logs");
            let ctx = LogCtx {
                pm: &pm,
                alloc: &alloc,
                journal: &journal,
                metadata_csum: opts.metadata_csum,
                epoch_id,
            };
            let headers = full_rescan(&ctx, &alloc, &store)?;
            for (ino, sih) in headers {
                inodes.insert(ino, Arc::new(Mutex::new(sih)));
            }
        }

        sb.s_state = SB_STATE_DIRTY;
        sb.s_mount_epoch = epoch_id;
        sb.s_mount_time = now_secs();
        sb.s_blocknode_ckpt = 0;
        sb.s_blocknode_count = 0;
        sb.s_inodelist_ckpt = 0;
        sb.s_inodelist_count = 0;
        write_superblock(&pm, &mut sb)?;

        let cache = PageCache::new(driver.clone(), cache_high, cache_low);
        let fs = Self {
            driver,
            pm,
            layout,
            opts,
            alloc,
            journal,
            store,
            cache,
            epoch_id,
            inodes: RwLock::new(inodes),
            next_cpu: AtomicUsize::new(0),
        };
        // the root must be reachable before any operation
        fs.get_sih(ROOT_INO)?;
        info!(
            "mounted epoch {} ({} free blocks)",
            epoch_id,
            fs.alloc.count_free_blocks()
        );
        Ok(fs)
    }

    /// Clean unmount: flush everything, checkpoint DRAM state, mark clean.
    pub fn umount(self) -> FsResult<()> {
        let _timer = OpTimer::new("umount");
        let inos: Vec<u64> = self.inodes.read().unwrap().keys().copied().collect();
        for ino in inos {
            self.cache.flush_file(ino)?;
        }
        self.cache.shutdown();

        let inode_ranges = self.store.checkpoint();
        let (ickpt, icount) = save_checkpoint(&self.pm, &self.alloc, &inode_ranges)?;
        let (bckpt, bcount, bblocks) = save_free_list_checkpoint(&self.pm, &self.alloc)?;

        let mut sb = recover_superblock(&self.pm)?;
        sb.s_state = SB_STATE_CLEAN;
        sb.s_blocknode_ckpt = bckpt;
        sb.s_blocknode_count = bcount;
        sb.s_blocknode_ckpt_blocks = bblocks as u32;
        sb.s_inodelist_ckpt = ickpt;
        sb.s_inodelist_count = icount;
        sb.s_inodelist_ckpt_blocks =
            ((icount as usize * size_of::<RangeCheckpoint>() + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32;
        write_superblock(&self.pm, &mut sb)?;
        self.driver.sync().map_err(|_| FsError::Io)?;
        info!("unmounted cleanly");
        Ok(())
    }

    /// Test hook: tear down without any of the unmount niceties. Whatever
    /// was not flushed is gone, exactly like power loss.
    pub fn crash(self) -> Arc<dyn SsdDriver> {
        self.cache.shutdown();
        self.driver.clone()
    }

    pub fn log_ctx(&self) -> LogCtx<'_> {
        LogCtx {
            pm: &self.pm,
            alloc: &self.alloc,
            journal: &self.journal,
            metadata_csum: self.opts.metadata_csum,
            epoch_id: self.epoch_id,
        }
    }

    pub fn data_cpu(&self, ino: u64) -> i32 {
        (ino % self.layout.cpus as u64) as i32
    }

    fn pick_cpu(&self) -> u64 {
        (self.next_cpu.fetch_add(1, Ordering::Relaxed) % self.layout.cpus as usize) as u64
    }

    /// The DRAM header for `ino`, rebuilt from its log on first touch.
    pub fn get_sih(&self, ino: u64) -> FsResult<Arc<Mutex<InodeInfoHeader>>> {
        if let Some(sih) = self.inodes.read().unwrap().get(&ino) {
            return Ok(sih.clone());
        }
        let pi = self.store.check_inode_integrity(&self.pm, ino)?;
        if pi.valid != 1 || pi.deleted == 1 {
            return Err(FsError::Access);
        }
        let ctx = self.log_ctx();
        let mut sih = rebuild::rebuild_inode_info(&ctx, ino, &pi)?;
        sih.pi_addr = self.store.inode_addr(&self.pm, ino, false)?;
        sih.alter_pi_addr = self.store.inode_addr(&self.pm, ino, true)?;
        let mut inodes = self.inodes.write().unwrap();
        Ok(inodes
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(sih)))
            .clone())
    }

    fn inode_addrs(&self, ino: u64) -> FsResult<(u64, u64)> {
        Ok((
            self.store.inode_addr(&self.pm, ino, false)?,
            self.store.inode_addr(&self.pm, ino, true)?,
        ))
    }

    /// Rewrite the primary inode with the header's log pointers, then apply
    /// `mutate`. The caller journals around this and mirrors the result.
    fn write_inode_published(
        &self,
        sih: &InodeInfoHeader,
        pi_addr: u64,
        mutate: impl FnOnce(&mut Inode),
    ) -> FsResult<Inode> {
        let mut pi: Inode = self.pm.read_typed(pi_addr)?;
        pi.log_head = sih.log_head;
        pi.log_tail = sih.log_tail;
        pi.alter_log_head = sih.alter_log_head;
        pi.alter_log_tail = sih.alter_log_tail;
        pi.i_size = sih.i_size;
        mutate(&mut pi);
        pi.update_csum();
        self.pm.scoped_write(pi_addr, pi.as_bytes(), true)?;
        Ok(pi)
    }

    /// create() / mkdir(): allocate the inode, build its log, and publish
    /// the new inode together with the parent's dentry in one transaction.
    fn new_inode(&self, parent: u64, name: &[u8], mode: u16, is_dir: bool) -> FsResult<u64> {
        let _timer = OpTimer::new("create");
        let parent_arc = self.get_sih(parent)?;
        let mut parent_sih = parent_arc.lock().unwrap();
        if parent_sih.corrupt {
            return Err(FsError::Corrupt);
        }
        let ctx = self.log_ctx();
        if find_dentry(&ctx, &parent_sih, name)?.is_some() {
            return Err(FsError::Invalid);
        }
        let ino = self.store.alloc_ino(self.pick_cpu())?;
        let pi_addr = self.store.inode_addr_alloc(&self.pm, &self.alloc, ino, false)?;
        let alter_pi_addr = self.store.inode_addr_alloc(&self.pm, &self.alloc, ino, true)?;
        let (parent_pi, parent_alter) = self.inode_addrs(parent)?;

        let mut sih = InodeInfoHeader::new(ino);
        sih.pi_addr = pi_addr;
        sih.alter_pi_addr = alter_pi_addr;
        sih.i_mode = mode;
        sih.i_links_count = if is_dir { 2 } else { 1 };
        initialize_inode_log(&ctx, &mut sih)?;
        if is_dir {
            let dot = append_dentry(&ctx, &mut sih, pi_addr, b".", ino, 2, now_secs())?;
            let dotdot = append_dentry(&ctx, &mut sih, pi_addr, b"..", parent, 2, now_secs())?;
            insert_dir_tree(&mut sih, b".", dot);
            insert_dir_tree(&mut sih, b"..", dotdot);
        }
        let dentry_addr = append_dentry(
            &ctx,
            &mut parent_sih,
            parent_pi,
            name,
            ino,
            sih.i_links_count,
            now_secs(),
        )?;

        let mut txn = self.journal.begin(&self.pm, ino as u32 % self.layout.cpus)?;
        txn.stage_inode(&self.pm, pi_addr, alter_pi_addr)?;
        txn.stage_inode(&self.pm, parent_pi, parent_alter)?;

        let now = now_secs();
        let child_pi = self.write_inode_published(&sih, pi_addr, |pi| {
            pi.valid = 1;
            pi.deleted = 0;
            pi.ino = ino;
            pi.i_mode = mode;
            pi.i_links_count = sih.i_links_count;
            pi.i_generation = rand::random::<u32>();
            pi.i_ctime = now;
            pi.i_mtime = now;
            pi.i_atime = now;
            pi.i_create_time = now;
            pi.create_epoch_id = self.epoch_id;
        })?;
        let parent_pi_img = self.write_inode_published(&parent_sih, parent_pi, |pi| {
            pi.i_mtime = now;
            pi.i_ctime = now;
        })?;
        txn.commit(&self.pm)?;

        self.pm.scoped_write(alter_pi_addr, child_pi.as_bytes(), false)?;
        self.pm.scoped_write(parent_alter, parent_pi_img.as_bytes(), true)?;

        insert_dir_tree(&mut parent_sih, name, dentry_addr);
        parent_sih.mtime = now;
        parent_sih.ctime = now;
        drop(parent_sih);
        self.inodes
            .write()
            .unwrap()
            .insert(ino, Arc::new(Mutex::new(sih)));
        debug!(
            "created {} '{}' ino {} under {}",
            if is_dir { "dir" } else { "file" },
            String::from_utf8_lossy(name),
            ino,
            parent
        );
        Ok(ino)
    }

    pub fn create(&self, parent: u64, name: &[u8], mode: u16) -> FsResult<u64> {
        self.new_inode(parent, name, 0o100000 | (mode & 0o7777), false)
    }

    pub fn mkdir(&self, parent: u64, name: &[u8], mode: u16) -> FsResult<u64> {
        self.new_inode(parent, name, 0o040000 | (mode & 0o7777), true)
    }

    pub fn lookup(&self, parent: u64, name: &[u8]) -> FsResult<Option<(u64, Inode)>> {
        let _timer = OpTimer::new("lookup");
        let parent_arc = self.get_sih(parent)?;
        let parent_sih = parent_arc.lock().unwrap();
        let ctx = self.log_ctx();
        match find_dentry(&ctx, &parent_sih, name)? {
            Some((_, dentry)) => {
                let pi = self.store.check_inode_integrity(&self.pm, dentry.ino)?;
                Ok(Some((dentry.ino, pi)))
            }
            None => Ok(None),
        }
    }

    pub fn readdir(&self, parent: u64) -> FsResult<Vec<(String, u64)>> {
        let _timer = OpTimer::new("readdir");
        let parent_arc = self.get_sih(parent)?;
        let parent_sih = parent_arc.lock().unwrap();
        let ctx = self.log_ctx();
        Ok(dir::list_dentries(&ctx, &parent_sih)?
            .iter()
            .map(|d| (d.get_name(), d.ino))
            .collect())
    }

    fn lock_pair<'a>(
        a_ino: u64,
        a: &'a Arc<Mutex<InodeInfoHeader>>,
        b_ino: u64,
        b: &'a Arc<Mutex<InodeInfoHeader>>,
    ) -> (
        MutexGuard<'a, InodeInfoHeader>,
        MutexGuard<'a, InodeInfoHeader>,
    ) {
        // fixed ino order prevents lock cycles
        if a_ino < b_ino {
            let ga = a.lock().unwrap();
            let gb = b.lock().unwrap();
            (ga, gb)
        } else {
            let gb = b.lock().unwrap();
            let ga = a.lock().unwrap();
            (ga, gb)
        }
    }

    pub fn unlink(&self, parent: u64, name: &[u8]) -> FsResult<()> {
        let _timer = OpTimer::new("unlink");
        let parent_arc = self.get_sih(parent)?;
        let ctx = self.log_ctx();
        let child_ino = {
            let parent_sih = parent_arc.lock().unwrap();
            match find_dentry(&ctx, &parent_sih, name)? {
                Some((_, dentry)) => dentry.ino,
                None => return Err(FsError::Access),
            }
        };
        let child_arc = self.get_sih(child_ino)?;
        let (mut parent_sih, mut child_sih) =
            Self::lock_pair(parent, &parent_arc, child_ino, &child_arc);

        let (old_addr, _old_dentry) = match find_dentry(&ctx, &parent_sih, name)? {
            Some(found) => found,
            None => return Err(FsError::Access),
        };
        let child_is_dir = child_sih.i_mode & 0o170000 == 0o040000;
        if child_is_dir {
            // only "." and ".." may remain
            let live: usize = child_sih.dentries.values().map(|v| v.len()).sum();
            if live > 2 {
                return Err(FsError::Invalid);
            }
        }
        let (parent_pi, parent_alter) = self.inode_addrs(parent)?;
        let (child_pi, child_alter) = self.inode_addrs(child_ino)?;
        let now = now_secs();
        let new_links = child_sih.i_links_count.saturating_sub(1);

        // removal is an appended tombstone; visibility rides the tails
        let tomb = append_dentry(&ctx, &mut parent_sih, parent_pi, name, 0, 0, now)?;
        let child_flags = child_sih.i_flags;
        append_link_change_entry(
            &ctx,
            &mut child_sih,
            child_pi,
            LinkChangeEntry {
                links: new_links,
                ctime: now,
                flags: child_flags,
                generation: 0,
                ..Default::default()
            },
        )?;

        let mut txn = self.journal.begin(&self.pm, child_ino as u32 % self.layout.cpus)?;
        txn.stage_inode(&self.pm, parent_pi, parent_alter)?;
        txn.stage_inode(&self.pm, child_pi, child_alter)?;
        let parent_img = self.write_inode_published(&parent_sih, parent_pi, |pi| {
            pi.i_mtime = now;
            pi.i_ctime = now;
        })?;
        let child_img = self.write_inode_published(&child_sih, child_pi, |pi| {
            pi.i_links_count = new_links;
            pi.i_ctime = now;
        })?;
        txn.commit(&self.pm)?;
        self.pm.scoped_write(parent_alter, parent_img.as_bytes(), false)?;
        self.pm.scoped_write(child_alter, child_img.as_bytes(), true)?;

        remove_dir_tree(&ctx, &mut parent_sih, name)?;
        invalidate_logentry(&ctx, &mut parent_sih, old_addr)?;
        invalidate_logentry(&ctx, &mut parent_sih, tomb)?;
        child_sih.i_links_count = new_links;
        child_sih.ctime = now;
        drop(parent_sih);

        if new_links == 0 {
            self.evict_inode_locked(child_ino, &mut child_sih, child_pi, child_alter)?;
            drop(child_sih);
            self.inodes.write().unwrap().remove(&child_ino);
        }
        Ok(())
    }

    pub fn link(&self, parent: u64, name: &[u8], target: u64) -> FsResult<()> {
        let _timer = OpTimer::new("link");
        let parent_arc = self.get_sih(parent)?;
        let target_arc = self.get_sih(target)?;
        let ctx = self.log_ctx();
        let (mut parent_sih, mut target_sih) =
            Self::lock_pair(parent, &parent_arc, target, &target_arc);
        if find_dentry(&ctx, &parent_sih, name)?.is_some() {
            return Err(FsError::Invalid);
        }
        let (parent_pi, parent_alter) = self.inode_addrs(parent)?;
        let (target_pi, target_alter) = self.inode_addrs(target)?;
        let now = now_secs();
        let new_links = target_sih.i_links_count + 1;

        let dentry_addr = append_dentry(&ctx, &mut parent_sih, parent_pi, name, target, new_links, now)?;
        let target_flags = target_sih.i_flags;
        append_link_change_entry(
            &ctx,
            &mut target_sih,
            target_pi,
            LinkChangeEntry {
                links: new_links,
                ctime: now,
                flags: target_flags,
                generation: 0,
                ..Default::default()
            },
        )?;

        let mut txn = self.journal.begin(&self.pm, target as u32 % self.layout.cpus)?;
        txn.stage_inode(&self.pm, parent_pi, parent_alter)?;
        txn.stage_inode(&self.pm, target_pi, target_alter)?;
        let parent_img = self.write_inode_published(&parent_sih, parent_pi, |pi| {
            pi.i_mtime = now;
        })?;
        let target_img = self.write_inode_published(&target_sih, target_pi, |pi| {
            pi.i_links_count = new_links;
            pi.i_ctime = now;
        })?;
        txn.commit(&self.pm)?;
        self.pm.scoped_write(parent_alter, parent_img.as_bytes(), false)?;
        self.pm.scoped_write(target_alter, target_img.as_bytes(), true)?;

        insert_dir_tree(&mut parent_sih, name, dentry_addr);
        target_sih.i_links_count = new_links;
        Ok(())
    }

    /// rename(): every touched tail plus the moved directory's ".." commits
    /// through one per-CPU journal transaction.
    pub fn rename(
        &self,
        old_parent: u64,
        old_name: &[u8],
        new_parent: u64,
        new_name: &[u8],
    ) -> FsResult<()> {
        let _timer = OpTimer::new("rename");
        let ctx = self.log_ctx();
        let old_arc = self.get_sih(old_parent)?;

        let child_ino = {
            let old_sih = old_arc.lock().unwrap();
            match find_dentry(&ctx, &old_sih, old_name)? {
                Some((_, d)) => d.ino,
                None => return Err(FsError::Access),
            }
        };
        let new_arc = self.get_sih(new_parent)?;
        let child_arc = self.get_sih(child_ino)?;

        // collect and lock every distinct inode in ino order
        let mut arcs: BTreeMap<u64, Arc<Mutex<InodeInfoHeader>>> = BTreeMap::new();
        arcs.insert(old_parent, old_arc.clone());
        arcs.insert(new_parent, new_arc.clone());
        arcs.insert(child_ino, child_arc.clone());
        let target_ino = {
            let new_sih = new_arc.lock().unwrap();
            find_dentry(&ctx, &new_sih, new_name)?.map(|(_, d)| d.ino)
        };
        if let Some(t) = target_ino {
            if t == child_ino {
                return Ok(());
            }
            arcs.insert(t, self.get_sih(t)?);
        }
        let mut guards: BTreeMap<u64, MutexGuard<'_, InodeInfoHeader>> = BTreeMap::new();
        for (ino, arc) in arcs.iter() {
            guards.insert(*ino, arc.lock().unwrap());
        }

        let now = now_secs();
        let (old_pi, old_alter) = self.inode_addrs(old_parent)?;
        let (new_pi, new_alter) = self.inode_addrs(new_parent)?;
        let (child_pi, child_alter) = self.inode_addrs(child_ino)?;

        let (old_dentry_addr, old_dentry) = {
            let old_sih = guards.get(&old_parent).unwrap();
            find_dentry(&ctx, old_sih, old_name)?.ok_or(FsError::Access)?
        };
        let child_is_dir = {
            let child_sih = guards.get(&child_ino).unwrap();
            child_sih.i_mode & 0o170000 == 0o040000
        };

        // invalidate the overwritten target through its own log
        let mut target_cleanup = None;
        if let Some(t) = target_ino {
            let (t_pi, t_alter) = self.inode_addrs(t)?;
            let t_sih = guards.get_mut(&t).unwrap();
            let t_links = t_sih.i_links_count.saturating_sub(1);
            let t_flags = t_sih.i_flags;
            append_link_change_entry(
                &ctx,
                t_sih,
                t_pi,
                LinkChangeEntry {
                    links: t_links,
                    ctime: now,
                    flags: t_flags,
                    generation: 0,
                    ..Default::default()
                },
            )?;
            target_cleanup = Some((t, t_pi, t_alter, t_links));
        }

        // new dir gains the name, old dir logs the tombstone
        let (new_dentry_addr, removed_target_dentry) = {
            let new_sih = guards.get_mut(&new_parent).unwrap();
            let removed = if target_ino.is_some() {
                Some(remove_dir_tree(&ctx, new_sih, new_name)?)
            } else {
                None
            };
            let addr = append_dentry(
                &ctx,
                new_sih,
                new_pi,
                new_name,
                child_ino,
                old_dentry.links_count,
                now,
            )?;
            (addr, removed)
        };
        let tomb = {
            let old_sih = guards.get_mut(&old_parent).unwrap();
            append_dentry(&ctx, old_sih, old_pi, old_name, 0, 0, now)?
        };
        {
            let child_sih = guards.get_mut(&child_ino).unwrap();
            let child_links = child_sih.i_links_count;
            let child_flags = child_sih.i_flags;
            append_link_change_entry(
                &ctx,
                child_sih,
                child_pi,
                LinkChangeEntry {
                    links: child_links,
                    ctime: now,
                    flags: child_flags,
                    generation: 0,
                    ..Default::default()
                },
            )?;
        }

        // the ".." of a directory moving between parents
        let dotdot = if child_is_dir && old_parent != new_parent {
            let child_sih = guards.get(&child_ino).unwrap();
            find_dentry(&ctx, child_sih, b"..")?.map(|(addr, _)| addr)
        } else {
            None
        };

        let mut txn = self.journal.begin(&self.pm, child_ino as u32 % self.layout.cpus)?;
        txn.stage_inode(&self.pm, old_pi, old_alter)?;
        if new_parent != old_parent {
            txn.stage_inode(&self.pm, new_pi, new_alter)?;
        }
        txn.stage_inode(&self.pm, child_pi, child_alter)?;
        if let Some((_, t_pi, t_alter, _)) = target_cleanup {
            txn.stage_inode(&self.pm, t_pi, t_alter)?;
        }
        if let Some(addr) = dotdot {
            // ino lives at +16, its checksum inside the word at +8
            txn.stage_word(&self.pm, addr + 8)?;
            txn.stage_word(&self.pm, addr + 16)?;
            if self.opts.metadata_csum {
                let alter = crate::bytefs_lib::log::alter_entry_addr(&ctx, addr)?;
                txn.stage_word(&self.pm, alter + 8)?;
                txn.stage_word(&self.pm, alter + 16)?;
            }
        }

        let old_img = self.write_inode_published(guards.get(&old_parent).unwrap(), old_pi, |pi| {
            pi.i_mtime = now;
            pi.i_ctime = now;
        })?;
        let new_img = if new_parent != old_parent {
            Some(
                self.write_inode_published(guards.get(&new_parent).unwrap(), new_pi, |pi| {
                    pi.i_mtime = now;
                    pi.i_ctime = now;
                })?,
            )
        } else {
            None
        };
        let child_img =
            self.write_inode_published(guards.get(&child_ino).unwrap(), child_pi, |pi| {
                pi.i_ctime = now;
            })?;
        let target_img = match target_cleanup {
            Some((t, t_pi, _, t_links)) => {
                let img = self.write_inode_published(guards.get(&t).unwrap(), t_pi, |pi| {
                    pi.i_links_count = t_links;
                    pi.i_ctime = now;
                })?;
                Some(img)
            }
            None => None,
        };
        if let Some(addr) = dotdot {
            let (_, mut bytes) = read_entry_checked(&ctx, addr)?;
            bytes[16..24].copy_from_slice(&new_parent.to_le_bytes());
            rewrite_entry_both(&ctx, addr, &bytes)?;
        }
        txn.commit(&self.pm)?;

        self.pm.scoped_write(old_alter, old_img.as_bytes(), false)?;
        if let Some(img) = new_img {
            self.pm.scoped_write(new_alter, img.as_bytes(), false)?;
        }
        self.pm.scoped_write(child_alter, child_img.as_bytes(), false)?;
        if let Some((_, _, t_alter, _)) = target_cleanup {
            if let Some(img) = target_img {
                self.pm.scoped_write(t_alter, img.as_bytes(), false)?;
            }
        }
        self.pm.flush(old_alter, size_of::<Inode>(), true)?;

        // DRAM trees and GC accounting follow the committed state
        {
            let new_sih = guards.get_mut(&new_parent).unwrap();
            insert_dir_tree(new_sih, new_name, new_dentry_addr);
            if let Some((removed_addr, _)) = removed_target_dentry {
                invalidate_logentry(&ctx, new_sih, removed_addr)?;
            }
        }
        {
            let old_sih = guards.get_mut(&old_parent).unwrap();
            remove_dir_tree(&ctx, old_sih, old_name)?;
            // the displaced dentry is superseded first, then retired
            reassign_logentry(&ctx, old_dentry_addr)?;
            invalidate_logentry(&ctx, old_sih, old_dentry_addr)?;
            invalidate_logentry(&ctx, old_sih, tomb)?;
        }
        if let Some((t, t_pi, t_alter, t_links)) = target_cleanup {
            let t_sih = guards.get_mut(&t).unwrap();
            t_sih.i_links_count = t_links;
            if t_links == 0 {
                self.evict_inode_locked(t, t_sih, t_pi, t_alter)?;
                drop(guards);
                self.inodes.write().unwrap().remove(&t);
            }
        }
        debug!(
            "renamed '{}' ({} -> {}) as '{}'",
            String::from_utf8_lossy(old_name),
            old_parent,
            new_parent,
            String::from_utf8_lossy(new_name)
        );
        Ok(())
    }

    /// Reclaim a zero-link inode: data blocks, log chains, the number.
    fn evict_inode_locked(
        &self,
        ino: u64,
        sih: &mut InodeInfoHeader,
        pi_addr: u64,
        alter_pi_addr: u64,
    ) -> FsResult<()> {
        let _timer = OpTimer::new("evict");
        let ctx = self.log_ctx();
        file::free_file_blocks(self, sih)?;
        crate::bytefs_lib::log::free_inode_log(&ctx, sih, pi_addr)?;

        let mut txn = self.journal.begin(&self.pm, ino as u32 % self.layout.cpus)?;
        txn.stage_inode(&self.pm, pi_addr, alter_pi_addr)?;
        let img = self.write_inode_published(sih, pi_addr, |pi| {
            pi.valid = 0;
            pi.deleted = 1;
            pi.i_links_count = 0;
            pi.delete_epoch_id = self.epoch_id;
        })?;
        txn.commit(&self.pm)?;
        self.pm.scoped_write(alter_pi_addr, img.as_bytes(), true)?;

        self.store.free_ino(ino)?;
        info!("evicted inode {}", ino);
        Ok(())
    }

    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let sih_arc = self.get_sih(ino)?;
        let mut sih = sih_arc.lock().unwrap();
        let (pi_addr, alter_pi_addr) = self.inode_addrs(ino)?;
        let written = file::do_write(self, &mut sih, pi_addr, alter_pi_addr, offset, data)?;
        // heavy fragmentation triggers the log rewrite
        let ctx = self.log_ctx();
        if sih.log_pages > 4 && needs_thorough_gc(&ctx, &sih)? {
            thorough_gc(
                &ctx,
                &mut sih,
                pi_addr,
                alter_pi_addr,
                ino as u32 % self.layout.cpus,
            )?;
        }
        Ok(written)
    }

    pub fn read(&self, ino: u64, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let sih_arc = self.get_sih(ino)?;
        let sih = sih_arc.lock().unwrap();
        file::do_read(self, &sih, offset, len)
    }

    pub fn fsync(&self, ino: u64) -> FsResult<()> {
        let sih_arc = self.get_sih(ino)?;
        let sih = sih_arc.lock().unwrap();
        file::do_fsync(self, &sih)
    }

    pub fn file_size(&self, ino: u64) -> FsResult<u64> {
        let sih_arc = self.get_sih(ino)?;
        let sih = sih_arc.lock().unwrap();
        Ok(sih.i_size)
    }

    /// setattr(): log the change, mirror it into the inode, publish.
    pub fn setattr(
        &self,
        ino: u64,
        mode: Option<u16>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<u32>,
        mtime: Option<u32>,
    ) -> FsResult<()> {
        let _timer = OpTimer::new("setattr");
        let sih_arc = self.get_sih(ino)?;
        let mut sih = sih_arc.lock().unwrap();
        let (pi_addr, alter_pi_addr) = self.inode_addrs(ino)?;
        let ctx = self.log_ctx();
        let now = now_secs();

        if let Some(new_size) = size {
            file::do_truncate(self, &mut sih, pi_addr, new_size)?;
        }
        let mut attr = 0u8;
        let mut entry = SetattrEntry {
            mode: sih.i_mode,
            uid: 0,
            gid: 0,
            atime: sih.atime,
            mtime: sih.mtime,
            ctime: now,
            size: sih.i_size,
            ..Default::default()
        };
        if let Some(m) = mode {
            entry.mode = m;
            attr |= layout::ATTR_MODE;
        }
        if let Some(u) = uid {
            entry.uid = u;
            attr |= layout::ATTR_UID;
        }
        if let Some(g) = gid {
            entry.gid = g;
            attr |= layout::ATTR_GID;
        }
        if size.is_some() {
            attr |= layout::ATTR_SIZE;
        }
        if let Some(t) = atime {
            entry.atime = t;
            attr |= layout::ATTR_ATIME;
        }
        if let Some(t) = mtime {
            entry.mtime = t;
            attr |= layout::ATTR_MTIME;
        }
        entry.attr = attr;
        append_setattr_entry(&ctx, &mut sih, pi_addr, entry)?;

        let mut txn = self.journal.begin(&self.pm, ino as u32 % self.layout.cpus)?;
        txn.stage_inode(&self.pm, pi_addr, alter_pi_addr)?;
        let img = self.write_inode_published(&sih, pi_addr, |pi| {
            if let Some(m) = mode {
                pi.i_mode = m;
            }
            if let Some(u) = uid {
                pi.i_uid = u;
            }
            if let Some(g) = gid {
                pi.i_gid = g;
            }
            if let Some(t) = atime {
                pi.i_atime = t;
            }
            if let Some(t) = mtime {
                pi.i_mtime = t;
            }
            pi.i_ctime = now;
        })?;
        txn.commit(&self.pm)?;
        self.pm.scoped_write(alter_pi_addr, img.as_bytes(), true)?;

        if let Some(m) = mode {
            sih.i_mode = m;
        }
        if let Some(t) = atime {
            sih.atime = t;
        }
        if let Some(t) = mtime {
            sih.mtime = t;
        }
        sih.ctime = now;
        Ok(())
    }

    /// Record that `[pgoff, pgoff+num_pages)` is mapped; data protection is
    /// suspended there until the entry is invalidated.
    pub fn record_mmap_write(&self, ino: u64, pgoff: u64, num_pages: u64) -> FsResult<()> {
        let sih_arc = self.get_sih(ino)?;
        let mut sih = sih_arc.lock().unwrap();
        let (pi_addr, alter_pi_addr) = self.inode_addrs(ino)?;
        let ctx = self.log_ctx();
        append_mmap_entry(
            &ctx,
            &mut sih,
            pi_addr,
            MmapEntry {
                pgoff,
                num_pages,
                ..Default::default()
            },
        )?;
        crate::bytefs_lib::log::update_inode_tail(
            &ctx,
            &sih,
            pi_addr,
            alter_pi_addr,
            ino as u32 % self.layout.cpus,
        )?;
        sih.mmap_ranges.push((pgoff, num_pages));
        Ok(())
    }

    /// The control surface: numeric opcodes, `ino` where one is relevant.
    pub fn ioctl(&self, cmd: u32, ino: u64) -> FsResult<()> {
        let cmd = IoctlCmd::try_from(cmd).map_err(|_| FsError::Invalid)?;
        match cmd {
            IoctlCmd::PrintTiming => {
                stats::print_timing();
                Ok(())
            }
            IoctlCmd::ClearStats => {
                stats::clear_stats();
                Ok(())
            }
            IoctlCmd::PrintLog => {
                let sih_arc = self.get_sih(ino)?;
                let sih = sih_arc.lock().unwrap();
                stats::print_log(&self.log_ctx(), &sih)
            }
            IoctlCmd::PrintLogPages => {
                let sih_arc = self.get_sih(ino)?;
                let sih = sih_arc.lock().unwrap();
                stats::print_log_pages(&self.log_ctx(), &sih)
            }
            IoctlCmd::PrintFreeLists => {
                stats::print_free_lists(&self.alloc);
                Ok(())
            }
        }
    }

    /// One-line mount summary for the CLI.
    pub fn summary(&self) -> String {
        let mounted = chrono::NaiveDateTime::from_timestamp_opt(now_secs() as i64, 0)
            .map(|t| t.to_string())
            .unwrap_or_default();
        format!(
            "bytefs: {} blocks, {} cpus, epoch {}, {} free blocks, {} cached pages ({})",
            self.layout.num_blocks,
            self.layout.cpus,
            self.epoch_id,
            self.alloc.count_free_blocks(),
            self.cache.resident_pages(),
            mounted,
        )
    }
}
