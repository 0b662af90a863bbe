use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::{SsdConst, SsdDriver, SsdStats};

/// Flat RAM-backed driver. No FTL, no coalescing: every byte write lands
/// immediately. Used by unit tests that only care about filesystem logic.
pub struct RamSsdDriver {
    consts: SsdConst,
    inner: Mutex<RamInner>,
}

struct RamInner {
    mem: Vec<u8>,
    stats: SsdStats,
}

impl RamSsdDriver {
    pub fn new(size: u64) -> Self {
        Self {
            consts: SsdConst {
                layout_size: size,
                ..Default::default()
            },
            inner: Mutex::new(RamInner {
                mem: vec![0u8; size as usize],
                stats: SsdStats::default(),
            }),
        }
    }

    fn check_range(&self, lpa: u64, len: usize) -> Result<()> {
        if lpa + len as u64 > self.consts.layout_size {
            return Err(anyhow!(
                "access [{:#x}, {:#x}) beyond device size {:#x}",
                lpa,
                lpa + len as u64,
                self.consts.layout_size
            ));
        }
        Ok(())
    }
}

impl SsdDriver for RamSsdDriver {
    fn open(&self, _tag: &str) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn byte_read(&self, lpa: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(lpa, buf.len())?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.byte_read_cnt += 1;
        let start = lpa as usize;
        buf.copy_from_slice(&inner.mem[start..start + buf.len()]);
        Ok(())
    }

    fn byte_write(&self, lpa: u64, buf: &[u8]) -> Result<()> {
        self.check_range(lpa, buf.len())?;
        let mut inner = self.inner.lock().unwrap();
        inner.stats.byte_write_cnt += 1;
        let start = lpa as usize;
        inner.mem[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.mem.fill(0);
        inner.stats = SsdStats::default();
        Ok(())
    }

    fn consts(&self) -> SsdConst {
        self.consts.clone()
    }

    fn stats(&self) -> SsdStats {
        self.inner.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn simple_test() -> Result<()> {
        let driver = RamSsdDriver::new(1 << 20);
        crate::driver_tester(&driver)
    }

    #[test]
    fn out_of_range_rejected() {
        let driver = RamSsdDriver::new(4096);
        let mut buf = [0u8; 8];
        assert!(driver.byte_read(4092, &mut buf).is_err());
    }
}
