//! PM substrate.
//!
//! The persistent range is a DRAM image backed by the emulated SSD. Loads
//! are served from DRAM; stores hit DRAM and only become durable when their
//! cachelines are flushed, which issues them to the SSD in 64 B units. A
//! crash is the loss of everything not yet flushed.
use std::collections::HashSet;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::*;
use ssd_driver::SsdDriver;
use zerocopy::{AsBytes, FromBytes};

use crate::bytefs_lib::layout::CACHELINE_SIZE;
use crate::bytefs_lib::types::{FsError, FsResult};
use crate::bytefs_lib::utils::{align_down, align_up};

const SEED_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct PmStats {
    pub flush_cnt: u64,
    pub fence_cnt: u64,
    pub flushed_bytes: u64,
}

pub struct PmDevice {
    base: *mut u8,
    len: usize,
    driver: Arc<dyn SsdDriver>,
    wprotect: bool,
    unlock_depth: AtomicUsize,
    /// 64 B lines emulating media poison; reads covering one fail with Io.
    poison: Mutex<HashSet<u64>>,
    flush_cnt: AtomicU64,
    fence_cnt: AtomicU64,
    flushed_bytes: AtomicU64,
}

unsafe impl Send for PmDevice {}
unsafe impl Sync for PmDevice {}

/// Open write window. Dropping it re-locks the range.
pub struct PmUnlockGuard<'a> {
    pm: &'a PmDevice,
}

impl Drop for PmUnlockGuard<'_> {
    fn drop(&mut self) {
        self.pm.unlock_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PmDevice {
    /// Map the device: allocate the DRAM image and seed it from the SSD.
    pub fn new(driver: Arc<dyn SsdDriver>, wprotect: bool) -> FsResult<Self> {
        let len = driver.consts().layout_size as usize;
        let image = vec![0u8; len].into_boxed_slice();
        let base = Box::into_raw(image) as *mut u8;
        let pm = Self {
            base,
            len,
            driver,
            wprotect,
            unlock_depth: AtomicUsize::new(0),
            poison: Mutex::new(HashSet::new()),
            flush_cnt: AtomicU64::new(0),
            fence_cnt: AtomicU64::new(0),
            flushed_bytes: AtomicU64::new(0),
        };
        pm.seed()?;
        Ok(pm)
    }

    fn seed(&self) -> FsResult<()> {
        let mut offset = 0usize;
        while offset < self.len {
            let chunk = SEED_CHUNK.min(self.len - offset);
            let slice = unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), chunk) };
            self.driver
                .byte_read(offset as u64, slice)
                .map_err(|e| {
                    error!("PM seed read at {:#x} failed: {}", offset, e);
                    FsError::Io
                })?;
            offset += chunk;
        }
        debug!("PM image seeded: {} bytes", self.len);
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.len as u64
    }

    pub fn range_check(&self, offset: u64, len: usize) -> FsResult<()> {
        if offset.checked_add(len as u64).map_or(true, |end| end > self.len as u64) {
            error!(
                "PM range check failed: [{:#x}, {:#x}) of {:#x}",
                offset,
                offset + len as u64,
                self.len
            );
            return Err(FsError::Invalid);
        }
        Ok(())
    }

    /// Open a write window. All PM stores must happen inside one when
    /// write protection is mounted in.
    pub fn unlock(&self) -> PmUnlockGuard<'_> {
        self.unlock_depth.fetch_add(1, Ordering::AcqRel);
        PmUnlockGuard { pm: self }
    }

    fn poisoned(&self, offset: u64, len: usize) -> bool {
        let poison = self.poison.lock().unwrap();
        if poison.is_empty() {
            return false;
        }
        let lo = align_down(offset, CACHELINE_SIZE as u64);
        let hi = align_up(offset + len as u64, CACHELINE_SIZE as u64);
        (lo..hi)
            .step_by(CACHELINE_SIZE)
            .any(|line| poison.contains(&line))
    }

    /// Fallible load, the `memcpy_mcsafe` analogue.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        self.range_check(offset, buf.len())?;
        if self.poisoned(offset, buf.len()) {
            return Err(FsError::Io);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset as usize), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        self.range_check(offset, buf.len())?;
        if self.wprotect && self.unlock_depth.load(Ordering::Acquire) == 0 {
            error!("PM store at {:#x} outside an unlock window", offset);
            return Err(FsError::Access);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.base.add(offset as usize), buf.len());
        }
        // overwriting a line repairs its emulated poison
        let mut poison = self.poison.lock().unwrap();
        if !poison.is_empty() {
            let lo = align_down(offset, CACHELINE_SIZE as u64);
            let hi = align_up(offset + buf.len() as u64, CACHELINE_SIZE as u64);
            for line in (lo..hi).step_by(CACHELINE_SIZE) {
                poison.remove(&line);
            }
        }
        Ok(())
    }

    pub fn memset(&self, offset: u64, value: u8, len: usize) -> FsResult<()> {
        self.range_check(offset, len)?;
        if self.wprotect && self.unlock_depth.load(Ordering::Acquire) == 0 {
            error!("PM memset at {:#x} outside an unlock window", offset);
            return Err(FsError::Access);
        }
        unsafe {
            std::ptr::write_bytes(self.base.add(offset as usize), value, len);
        }
        Ok(())
    }

    /// Flush the cachelines covering `[offset, offset+len)` to the SSD. With
    /// `fence` the call orders against everything issued before it; the
    /// emulated issue path is synchronous, so the fence is an accounting
    /// point.
    pub fn flush(&self, offset: u64, len: usize, fence: bool) -> FsResult<()> {
        if len == 0 {
            if fence {
                self.fence_cnt.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }
        self.range_check(offset, len)?;
        let lo = align_down(offset, CACHELINE_SIZE as u64);
        let hi = align_up(offset + len as u64, CACHELINE_SIZE as u64).min(self.len as u64);
        let span = (hi - lo) as usize;
        let slice = unsafe { std::slice::from_raw_parts(self.base.add(lo as usize), span) };
        self.driver.byte_write(lo, slice).map_err(|e| {
            error!("PM flush [{:#x}, {:#x}) failed: {}", lo, hi, e);
            FsError::Io
        })?;
        self.flush_cnt.fetch_add(1, Ordering::Relaxed);
        self.flushed_bytes.fetch_add(span as u64, Ordering::Relaxed);
        if fence {
            self.fence_cnt.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Unlock, store, flush and fence in one scope; the window closes on
    /// every path.
    pub fn scoped_write(&self, offset: u64, bytes: &[u8], fence: bool) -> FsResult<()> {
        let _window = self.unlock();
        self.write_bytes(offset, bytes)?;
        self.flush(offset, bytes.len(), fence)
    }

    pub fn read_typed<T: FromBytes>(&self, offset: u64) -> FsResult<T> {
        let mut value = T::new_zeroed();
        let size = size_of::<T>();
        let buf =
            unsafe { std::slice::from_raw_parts_mut(&mut value as *mut T as *mut u8, size) };
        self.read_bytes(offset, buf)?;
        Ok(value)
    }

    pub fn write_typed<T: AsBytes>(&self, offset: u64, value: &T) -> FsResult<()> {
        self.write_bytes(offset, value.as_bytes())
    }

    pub fn stats(&self) -> PmStats {
        PmStats {
            flush_cnt: self.flush_cnt.load(Ordering::Relaxed),
            fence_cnt: self.fence_cnt.load(Ordering::Relaxed),
            flushed_bytes: self.flushed_bytes.load(Ordering::Relaxed),
        }
    }

    /// Test hook: mark the 64 B line holding `offset` as rotten.
    pub fn inject_poison(&self, offset: u64) {
        let line = align_down(offset, CACHELINE_SIZE as u64);
        self.poison.lock().unwrap().insert(line);
    }

    pub fn poison_count(&self) -> usize {
        self.poison.lock().unwrap().len()
    }
}

impl Drop for PmDevice {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                self.base, self.len,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ssd_driver::ram::RamSsdDriver;

    fn pm_over_ram(size: u64, wprotect: bool) -> (Arc<RamSsdDriver>, PmDevice) {
        let driver = Arc::new(RamSsdDriver::new(size));
        let pm = PmDevice::new(driver.clone(), wprotect).unwrap();
        (driver, pm)
    }

    #[test]
    fn store_becomes_durable_only_after_flush() -> Result<()> {
        let (driver, pm) = pm_over_ram(1 << 16, false);
        pm.write_bytes(4096, &[7u8; 128])?;
        // not flushed: the SSD still sees zeros
        let mut ssd_view = [0u8; 128];
        driver.byte_read(4096, &mut ssd_view)?;
        assert_eq!(ssd_view, [0u8; 128]);
        pm.flush(4096, 128, true)?;
        driver.byte_read(4096, &mut ssd_view)?;
        assert_eq!(ssd_view, [7u8; 128]);
        Ok(())
    }

    #[test]
    fn reseed_drops_unflushed_stores() -> Result<()> {
        let (driver, pm) = pm_over_ram(1 << 16, false);
        pm.write_bytes(0, &[1u8; 64])?;
        pm.flush(0, 64, true)?;
        pm.write_bytes(64, &[2u8; 64])?;
        drop(pm);
        // crash: rebuild the image from the SSD
        let pm = PmDevice::new(driver, false).unwrap();
        let mut buf = [0u8; 64];
        pm.read_bytes(0, &mut buf)?;
        assert_eq!(buf, [1u8; 64]);
        pm.read_bytes(64, &mut buf)?;
        assert_eq!(buf, [0u8; 64]);
        Ok(())
    }

    #[test]
    fn wprotect_requires_window() -> Result<()> {
        let (_driver, pm) = pm_over_ram(1 << 16, true);
        assert_eq!(pm.write_bytes(0, &[1u8; 8]), Err(FsError::Access));
        {
            let _w = pm.unlock();
            pm.write_bytes(0, &[1u8; 8])?;
        }
        assert_eq!(pm.write_bytes(0, &[1u8; 8]), Err(FsError::Access));
        Ok(())
    }

    #[test]
    fn poison_fails_reads_until_overwritten() -> Result<()> {
        let (_driver, pm) = pm_over_ram(1 << 16, false);
        pm.inject_poison(128);
        let mut buf = [0u8; 32];
        assert_eq!(pm.read_bytes(130, &mut buf), Err(FsError::Io));
        // a read elsewhere is unaffected
        pm.read_bytes(512, &mut buf)?;
        // repair by rewriting the line
        pm.write_bytes(128, &[0u8; 64])?;
        pm.read_bytes(130, &mut buf)?;
        Ok(())
    }

    #[test]
    fn typed_round_trip() -> Result<()> {
        use crate::bytefs_lib::layout::PageTail;
        let (_driver, pm) = pm_over_ram(1 << 16, false);
        let tail = PageTail {
            invalid_entries: 1,
            num_entries: 5,
            epoch_id: 9,
            alter_page: 0x2000,
            next_page: 0x3000,
        };
        pm.write_typed(4064, &tail)?;
        let back: PageTail = pm.read_typed(4064)?;
        assert_eq!(back.num_entries, 5);
        assert_eq!(back.next_page, 0x3000);
        Ok(())
    }
}
