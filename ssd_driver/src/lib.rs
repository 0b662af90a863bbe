/// Emulated byte-addressable SSD behind an abstract driver interface.
///
/// The filesystem above talks to storage exclusively through [`SsdDriver`].
/// Two implementations exist: [`ram::RamSsdDriver`], a flat memory image for
/// fast tests, and [`ftl::EmuSsdDriver`], the full two-level emulation with
/// an FTL thread, log-region coalescing and NAND garbage collection.
use anyhow::Result;

pub mod ftl;
pub mod gc;
pub mod heap;
pub mod issue;
pub mod mt;
pub mod ram;

/// NAND page size and the finest byte-issue unit.
pub const PG_SIZE: usize = 4096;
pub const PG_MASK: u64 = (PG_SIZE as u64) - 1;
/// A log region: the 64 B unit in which byte writes reach the device.
pub const LOG_REGION_SIZE: usize = 64;
pub const LOG_REGION_MASK: u64 = (LOG_REGION_SIZE as u64) - 1;
pub const REGIONS_PER_PAGE: usize = PG_SIZE / LOG_REGION_SIZE;

#[derive(Default, Debug, Clone, Copy)]
pub struct SsdStats {
    pub byte_read_cnt: u64,
    pub byte_write_cnt: u64,
    pub page_read_cnt: u64,
    pub page_write_cnt: u64,
    pub coalesced_flush_cnt: u64,
    pub gc_cnt: u64,
    pub gc_moved_pages: u64,
}

#[derive(Debug, Clone)]
pub struct SsdConst {
    pub read_lat: u32,
    pub write_lat: u32,
    pub erase_lat: u32,
    pub layout_size: u64,
    pub iounit_size: u32,
}

impl Default for SsdConst {
    fn default() -> Self {
        Self {
            read_lat: 0,
            write_lat: 0,
            erase_lat: 0,
            layout_size: 64 * 0x400 * 0x400,
            iounit_size: PG_SIZE as u32,
        }
    }
}

/// SsdDriver abstract interface.
///
/// All methods take `&self`; implementations carry their own locking so that
/// many filesystem threads may issue concurrently.
pub trait SsdDriver: Send + Sync {
    fn open(&self, tag: &str) -> Result<()>;
    fn close(&self) -> Result<()>;
    /// Read `buf.len()` bytes starting at logical byte address `lpa`.
    fn byte_read(&self, lpa: u64, buf: &mut [u8]) -> Result<()>;
    /// Write `buf` starting at logical byte address `lpa`. Unaligned edges
    /// are read-modify-written in 64 B log regions.
    fn byte_write(&self, lpa: u64, buf: &[u8]) -> Result<()>;
    /// Drain every pending coalesced log region down to NAND pages.
    fn sync(&self) -> Result<()>;
    /// Drop all content and mappings.
    fn reset(&self) -> Result<()>;
    fn consts(&self) -> SsdConst;
    fn stats(&self) -> SsdStats;
}

/// Exercises the parts of the contract every driver must satisfy.
#[cfg(test)]
pub(crate) fn driver_tester(driver: &dyn SsdDriver) -> Result<()> {
    driver.open("test")?;
    let consts = driver.consts();
    assert!(consts.layout_size >= (PG_SIZE as u64) * 16);

    // whole-page round trip
    let page = vec![0xa5u8; PG_SIZE];
    driver.byte_write(0, &page)?;
    let mut back = vec![0u8; PG_SIZE];
    driver.byte_read(0, &mut back)?;
    assert_eq!(page, back);

    // unaligned write over an aligned base
    driver.byte_write(100, &[7u8; 100])?;
    driver.byte_read(0, &mut back)?;
    assert!(back[..100].iter().all(|b| *b == 0xa5));
    assert!(back[100..200].iter().all(|b| *b == 7));
    assert!(back[200..].iter().all(|b| *b == 0xa5));

    // content survives a sync
    driver.sync()?;
    let mut after = vec![0u8; PG_SIZE];
    driver.byte_read(0, &mut after)?;
    assert_eq!(back, after);

    driver.close()?;
    Ok(())
}
