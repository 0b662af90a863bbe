//! File-data page cache above the byte/block bridge.
//!
//! Per inode, a map keyed by 4 KiB-aligned LPA of cached entries; each entry
//! owns one page and, lazily from the first dirty transition, a clean shadow
//! duplicate used to diff at flush time. Two global lists (active/inactive)
//! feed a watermark-driven eviction thread.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use log::*;
use ssd_driver::{SsdDriver, LOG_REGION_SIZE, PG_SIZE};

use crate::bytefs_lib::types::{FsError, FsResult};

/// Hits on the inactive list before an entry moves to the active list.
pub const LRU_TRANSFER_TIMES: u32 = 1;
/// Dirty-chunk fraction beyond which flush issues the whole page.
const WHOLE_PAGE_DIRTY_PCT: usize = 25;
const CHUNKS_PER_PAGE: usize = PG_SIZE / LOG_REGION_SIZE;

struct Rbh {
    lpa: u64,
    page: Vec<u8>,
    /// Clean duplicate, allocated at the first dirty transition.
    shadow: Option<Vec<u8>>,
    dirty: bool,
    hits: u32,
    active: bool,
}

struct FileCache {
    tree: RwLock<BTreeMap<u64, Arc<RwLock<Rbh>>>>,
}

struct LruLists {
    active: VecDeque<(u64, u64)>,
    inactive: VecDeque<(u64, u64)>,
    resident: usize,
}

enum EvictOutcome {
    Evicted,
    /// Entry vanished under us (drop_file owns the accounting).
    Gone,
    Contended,
}

pub struct PageCache {
    driver: Arc<dyn SsdDriver>,
    files: RwLock<HashMap<u64, Arc<FileCache>>>,
    lists: Mutex<LruLists>,
    lists_cv: Condvar,
    high_watermark: usize,
    low_watermark: usize,
    /// Set while capacity is critical; new insertions wait on it.
    rw_block: AtomicBool,
    stop: AtomicBool,
    evictor: Mutex<Option<JoinHandle<()>>>,
    resident_peak: AtomicUsize,
}

impl PageCache {
    pub fn new(driver: Arc<dyn SsdDriver>, high_watermark: usize, low_watermark: usize) -> Arc<Self> {
        assert!(low_watermark < high_watermark);
        let cache = Arc::new(Self {
            driver,
            files: RwLock::new(HashMap::new()),
            lists: Mutex::new(LruLists {
                active: VecDeque::new(),
                inactive: VecDeque::new(),
                resident: 0,
            }),
            lists_cv: Condvar::new(),
            high_watermark,
            low_watermark,
            rw_block: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            evictor: Mutex::new(None),
            resident_peak: AtomicUsize::new(0),
        });
        let thread_cache = cache.clone();
        let handle = std::thread::Builder::new()
            .name("bytefs-evict".into())
            .spawn(move || thread_cache.eviction_loop())
            .expect("spawn eviction thread");
        *cache.evictor.lock().unwrap() = Some(handle);
        cache
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.lists_cv.notify_all();
        if let Some(handle) = self.evictor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn file(&self, ino: u64) -> Arc<FileCache> {
        if let Some(file) = self.files.read().unwrap().get(&ino) {
            return file.clone();
        }
        let mut files = self.files.write().unwrap();
        files
            .entry(ino)
            .or_insert_with(|| {
                Arc::new(FileCache {
                    tree: RwLock::new(BTreeMap::new()),
                })
            })
            .clone()
    }

    /// Fetch (faulting in over the bridge) the entry for the page at `base`.
    fn get_rbh(&self, ino: u64, base: u64) -> FsResult<Arc<RwLock<Rbh>>> {
        debug_assert_eq!(base % PG_SIZE as u64, 0);
        let file = self.file(ino);
        if let Some(rbh) = file.tree.read().unwrap().get(&base) {
            self.note_hit(ino, base, rbh);
            return Ok(rbh.clone());
        }
        // capacity critical: wait for the evictor before growing
        {
            let mut lists = self.lists.lock().unwrap();
            while lists.resident >= self.high_watermark * 2 && !self.stop.load(Ordering::Acquire) {
                self.rw_block.store(true, Ordering::Release);
                self.lists_cv.notify_all();
                lists = self.lists_cv.wait(lists).unwrap();
            }
        }
        let mut page = vec![0u8; PG_SIZE];
        self.driver.byte_read(base, &mut page).map_err(|e| {
            error!("page cache fault-in at {:#x} failed: {}", base, e);
            FsError::Io
        })?;
        let mut tree = file.tree.write().unwrap();
        if let Some(rbh) = tree.get(&base) {
            // lost the race, someone else faulted it in
            return Ok(rbh.clone());
        }
        let rbh = Arc::new(RwLock::new(Rbh {
            lpa: base,
            page,
            shadow: None,
            dirty: false,
            hits: 0,
            active: false,
        }));
        tree.insert(base, rbh.clone());
        drop(tree);
        let mut lists = self.lists.lock().unwrap();
        lists.inactive.push_back((ino, base));
        lists.resident += 1;
        let peak = self.resident_peak.load(Ordering::Relaxed).max(lists.resident);
        self.resident_peak.store(peak, Ordering::Relaxed);
        if lists.resident > self.high_watermark {
            self.lists_cv.notify_all();
        }
        Ok(rbh)
    }

    fn note_hit(&self, ino: u64, base: u64, rbh: &Arc<RwLock<Rbh>>) {
        let mut entry = rbh.write().unwrap();
        entry.hits += 1;
        if !entry.active && entry.hits > LRU_TRANSFER_TIMES {
            entry.active = true;
            let mut lists = self.lists.lock().unwrap();
            if let Some(pos) = lists.inactive.iter().position(|k| *k == (ino, base)) {
                lists.inactive.remove(pos);
                lists.active.push_back((ino, base));
            }
        }
    }

    /// Read `buf.len()` bytes at `lpa` through the cache.
    pub fn read(&self, ino: u64, lpa: u64, buf: &mut [u8]) -> FsResult<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = lpa + done as u64;
            let base = at & !(PG_SIZE as u64 - 1);
            let off = (at - base) as usize;
            let chunk = (PG_SIZE - off).min(buf.len() - done);
            let rbh = self.get_rbh(ino, base)?;
            let entry = rbh.read().unwrap();
            buf[done..done + chunk].copy_from_slice(&entry.page[off..off + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Write through the cache; pages go dirty and flush later.
    pub fn write(&self, ino: u64, lpa: u64, data: &[u8]) -> FsResult<()> {
        let mut done = 0usize;
        while done < data.len() {
            let at = lpa + done as u64;
            let base = at & !(PG_SIZE as u64 - 1);
            let off = (at - base) as usize;
            let chunk = (PG_SIZE - off).min(data.len() - done);
            let rbh = self.get_rbh(ino, base)?;
            let mut entry = rbh.write().unwrap();
            if !entry.dirty && entry.shadow.is_none() {
                // first dirty transition clones the clean page
                entry.shadow = Some(entry.page.clone());
            }
            entry.page[off..off + chunk].copy_from_slice(&data[done..done + chunk]);
            entry.dirty = true;
            done += chunk;
        }
        Ok(())
    }

    fn sync_rbh(&self, entry: &mut Rbh) -> FsResult<()> {
        if !entry.dirty {
            return Ok(());
        }
        let dirty_chunks: Vec<usize> = match &entry.shadow {
            Some(shadow) => (0..CHUNKS_PER_PAGE)
                .filter(|i| {
                    let lo = i * LOG_REGION_SIZE;
                    let hi = lo + LOG_REGION_SIZE;
                    entry.page[lo..hi] != shadow[lo..hi]
                })
                .collect(),
            None => (0..CHUNKS_PER_PAGE).collect(),
        };
        let issue_whole = dirty_chunks.len() * 100 >= WHOLE_PAGE_DIRTY_PCT * CHUNKS_PER_PAGE;
        if issue_whole {
            self.driver
                .byte_write(entry.lpa, &entry.page)
                .map_err(|_| FsError::Io)?;
        } else {
            for i in dirty_chunks {
                let lo = i * LOG_REGION_SIZE;
                self.driver
                    .byte_write(entry.lpa + lo as u64, &entry.page[lo..lo + LOG_REGION_SIZE])
                    .map_err(|_| FsError::Io)?;
            }
        }
        entry.dirty = false;
        entry.shadow = None;
        Ok(())
    }

    /// Flush every dirty page of `ino` in `[lpa, lpa + len)` down to the SSD.
    pub fn flush_range(&self, ino: u64, lpa: u64, len: u64) -> FsResult<()> {
        let file = self.file(ino);
        let lo = lpa & !(PG_SIZE as u64 - 1);
        let hi = lpa + len;
        let targets: Vec<Arc<RwLock<Rbh>>> = file
            .tree
            .read()
            .unwrap()
            .range(lo..hi)
            .map(|(_, rbh)| rbh.clone())
            .collect();
        for rbh in targets {
            let mut entry = rbh.write().unwrap();
            self.sync_rbh(&mut entry)?;
        }
        self.driver.sync().map_err(|_| FsError::Io)?;
        Ok(())
    }

    pub fn flush_file(&self, ino: u64) -> FsResult<()> {
        self.flush_range(ino, 0, u64::MAX)
    }

    /// Flush and forget a file's pages (close/evict-inode path).
    pub fn drop_file(&self, ino: u64) -> FsResult<()> {
        let file = {
            let mut files = self.files.write().unwrap();
            files.remove(&ino)
        };
        let Some(file) = file else { return Ok(()) };
        let mut tree = file.tree.write().unwrap();
        let count = tree.len();
        for (_, rbh) in tree.iter() {
            let mut entry = rbh.write().unwrap();
            self.sync_rbh(&mut entry)?;
        }
        tree.clear();
        drop(tree);
        let mut lists = self.lists.lock().unwrap();
        lists.active.retain(|(i, _)| *i != ino);
        lists.inactive.retain(|(i, _)| *i != ino);
        lists.resident -= count;
        self.lists_cv.notify_all();
        Ok(())
    }

    pub fn resident_pages(&self) -> usize {
        self.lists.lock().unwrap().resident
    }

    pub fn resident_peak(&self) -> usize {
        self.resident_peak.load(Ordering::Relaxed)
    }

    fn evict_one(&self, ino: u64, base: u64) -> EvictOutcome {
        let file = match self.files.read().unwrap().get(&ino) {
            Some(file) => file.clone(),
            // drop_file already accounted for this entry
            None => return EvictOutcome::Gone,
        };
        // skip contended files rather than stall the sweep
        let mut tree = match file.tree.try_write() {
            Ok(tree) => tree,
            Err(_) => return EvictOutcome::Contended,
        };
        let Some(rbh) = tree.remove(&base) else {
            return EvictOutcome::Gone;
        };
        let mut entry = rbh.write().unwrap();
        if let Err(e) = self.sync_rbh(&mut entry) {
            // leave the page resident rather than lose data
            error!("evict of {:#x} failed to sync: {}", base, e);
            drop(entry);
            tree.insert(base, rbh.clone());
            return EvictOutcome::Contended;
        }
        EvictOutcome::Evicted
    }

    fn eviction_loop(&self) {
        loop {
            let victims: Vec<(u64, u64)> = {
                let mut lists = self.lists.lock().unwrap();
                while lists.resident <= self.high_watermark && !self.stop.load(Ordering::Acquire) {
                    lists = self.lists_cv.wait(lists).unwrap();
                }
                if self.stop.load(Ordering::Acquire) {
                    return;
                }
                let want = lists.resident - self.low_watermark;
                let mut victims = vec![];
                for _ in 0..want {
                    if let Some(key) = lists.inactive.pop_front() {
                        victims.push(key);
                    } else if let Some(key) = lists.active.pop_front() {
                        // inactive drained: the active list ages out
                        victims.push(key);
                    } else {
                        break;
                    }
                }
                victims
            };
            let mut evicted = 0usize;
            let mut failed = vec![];
            for (ino, base) in victims {
                match self.evict_one(ino, base) {
                    EvictOutcome::Evicted => evicted += 1,
                    EvictOutcome::Gone => {}
                    EvictOutcome::Contended => failed.push((ino, base)),
                }
            }
            let mut lists = self.lists.lock().unwrap();
            lists.resident -= evicted;
            for key in failed {
                lists.inactive.push_back(key);
            }
            if lists.resident < self.high_watermark * 2 {
                self.rw_block.store(false, Ordering::Release);
            }
            trace!("evictor: {} pages resident after sweep", lists.resident);
            self.lists_cv.notify_all();
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;

    fn setup(high: usize, low: usize) -> (Arc<RamSsdDriver>, Arc<PageCache>) {
        let driver = Arc::new(RamSsdDriver::new(1 << 22));
        let cache = PageCache::new(driver.clone(), high, low);
        (driver, cache)
    }

    #[test]
    fn read_faults_in_from_ssd() -> Result<()> {
        let (driver, cache) = setup(64, 32);
        driver.byte_write(8192, &[0x3cu8; 128])?;
        let mut buf = [0u8; 128];
        cache.read(7, 8192, &mut buf)?;
        assert_eq!(buf, [0x3cu8; 128]);
        cache.shutdown();
        Ok(())
    }

    #[test]
    fn write_is_visible_before_flush_and_durable_after() -> Result<()> {
        let (driver, cache) = setup(64, 32);
        cache.write(7, 4096, &[9u8; 256])?;
        let mut buf = [0u8; 256];
        cache.read(7, 4096, &mut buf)?;
        assert_eq!(buf, [9u8; 256]);
        // SSD still sees zeros
        let mut ssd = [0u8; 256];
        driver.byte_read(4096, &mut ssd)?;
        assert_eq!(ssd, [0u8; 256]);
        cache.flush_range(7, 4096, 256)?;
        driver.byte_read(4096, &mut ssd)?;
        assert_eq!(ssd, [9u8; 256]);
        cache.shutdown();
        Ok(())
    }

    #[test]
    fn small_dirty_fraction_issues_chunks() -> Result<()> {
        let (driver, cache) = setup(64, 32);
        // warm the page so the shadow diff has a baseline
        cache.read(7, 0, &mut [0u8; 64])?;
        cache.write(7, 0, &[1u8; 64])?;
        let before = driver.stats().byte_write_cnt;
        cache.flush_range(7, 0, 64)?;
        let after = driver.stats().byte_write_cnt;
        // one 64 B chunk, not a whole page
        assert_eq!(after - before, 1);

        // now dirty half the page: flush must collapse into one page write
        cache.write(7, 0, &vec![2u8; PG_SIZE / 2])?;
        let before = driver.stats().byte_write_cnt;
        cache.flush_range(7, 0, PG_SIZE as u64)?;
        let after = driver.stats().byte_write_cnt;
        assert_eq!(after - before, 1);
        let mut ssd = vec![0u8; PG_SIZE / 2];
        driver.byte_read(0, &mut ssd)?;
        assert!(ssd.iter().all(|b| *b == 2));
        cache.shutdown();
        Ok(())
    }

    #[test]
    fn eviction_thread_honors_watermarks() -> Result<()> {
        let (driver, cache) = setup(16, 8);
        for i in 0..64u64 {
            cache.write(9, i * PG_SIZE as u64, &[i as u8; 64])?;
        }
        // wait for the evictor to drain below the high watermark
        for _ in 0..200 {
            if cache.resident_pages() <= 16 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(cache.resident_pages() <= 16, "resident {}", cache.resident_pages());
        assert!(cache.resident_peak() >= 16);
        // evicted dirty pages were synced, nothing lost
        let mut buf = [0u8; 64];
        for i in 0..64u64 {
            cache.read(9, i * PG_SIZE as u64, &mut buf)?;
            assert_eq!(buf, [i as u8; 64], "page {}", i);
        }
        drop(driver);
        cache.shutdown();
        Ok(())
    }

    #[test]
    fn drop_file_flushes_and_forgets() -> Result<()> {
        let (driver, cache) = setup(64, 32);
        cache.write(11, 0, &[5u8; 4096])?;
        cache.write(11, 4096, &[6u8; 4096])?;
        assert_eq!(cache.resident_pages(), 2);
        cache.drop_file(11)?;
        assert_eq!(cache.resident_pages(), 0);
        let mut ssd = [0u8; 64];
        driver.byte_read(0, &mut ssd)?;
        assert_eq!(ssd, [5u8; 64]);
        driver.byte_read(4096, &mut ssd)?;
        assert_eq!(ssd, [6u8; 64]);
        cache.shutdown();
        Ok(())
    }
}
