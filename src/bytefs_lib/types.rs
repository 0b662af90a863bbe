//! Shared result/error types and mount options.
use std::fmt;

/// Little-endian wire aliases. All supported targets are little-endian, so
/// these are plain integers; layout tests pin the byte order.
#[allow(non_camel_case_types)]
pub type le16 = u16;
#[allow(non_camel_case_types)]
pub type le32 = u32;
#[allow(non_camel_case_types)]
pub type le64 = u64;

/// Error kinds surfaced at operation boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Every free list is exhausted.
    NoSpace,
    /// Media or checksum failure that replica repair could not mask.
    Io,
    /// Bad argument; no state was changed.
    Invalid,
    /// User-buffer copy failure.
    Fault,
    /// Inode exists but is unavailable (deleted or invalid).
    Access,
    /// A runtime invariant is broken; the inode refuses further writes.
    Corrupt,
    /// Internal retry signal for tail advancement, never surfaces.
    Retry,
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NoSpace => -libc::ENOSPC,
            FsError::Io => -libc::EIO,
            FsError::Invalid => -libc::EINVAL,
            FsError::Fault => -libc::EFAULT,
            FsError::Access => -libc::EACCES,
            FsError::Corrupt => -libc::EIO,
            FsError::Retry => -libc::EAGAIN,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsError::NoSpace => "no space left on device",
            FsError::Io => "I/O or checksum error",
            FsError::Invalid => "invalid argument",
            FsError::Fault => "bad user buffer",
            FsError::Access => "inode unavailable",
            FsError::Corrupt => "filesystem invariant broken",
            FsError::Retry => "transient, retry",
        };
        write!(f, "{} (errno {})", name, self.errno())
    }
}

impl std::error::Error for FsError {}

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Mount options, parsed from a comma-separated `-o` style string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MountOpts {
    pub data_cow: bool,
    pub data_csum: bool,
    pub data_parity: bool,
    pub metadata_csum: bool,
    pub wprotect: bool,
    pub dram_struct_csum: bool,
    pub mount_snapshot_epoch: Option<u64>,
}

impl MountOpts {
    pub fn parse(opts: &str) -> FsResult<Self> {
        let mut parsed = MountOpts::default();
        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match opt {
                "data_cow" => parsed.data_cow = true,
                "data_csum" => parsed.data_csum = true,
                "data_parity" => parsed.data_parity = true,
                "metadata_csum" => parsed.metadata_csum = true,
                "wprotect" => parsed.wprotect = true,
                "dram_struct_csum" => parsed.dram_struct_csum = true,
                _ => {
                    if let Some(epoch) = opt.strip_prefix("mount_snapshot_epoch=") {
                        parsed.mount_snapshot_epoch =
                            Some(epoch.parse().map_err(|_| FsError::Invalid)?);
                    } else {
                        return Err(FsError::Invalid);
                    }
                }
            }
        }
        // parity verification reads back through the csum region
        if parsed.data_parity && !parsed.data_csum {
            return Err(FsError::Invalid);
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NoSpace.errno(), -libc::ENOSPC);
        assert_eq!(FsError::Io.errno(), -libc::EIO);
        assert_eq!(FsError::Invalid.errno(), -libc::EINVAL);
        assert_eq!(FsError::Fault.errno(), -libc::EFAULT);
        assert_eq!(FsError::Access.errno(), -libc::EACCES);
    }

    #[test]
    fn parse_mount_opts() {
        let opts =
            MountOpts::parse("data_csum,data_parity,metadata_csum,mount_snapshot_epoch=7").unwrap();
        assert!(opts.data_csum && opts.data_parity && opts.metadata_csum);
        assert_eq!(opts.mount_snapshot_epoch, Some(7));
        assert!(!opts.wprotect);

        assert_eq!(MountOpts::parse("bogus"), Err(FsError::Invalid));
        // parity without csum cannot verify reconstructions
        assert_eq!(MountOpts::parse("data_parity"), Err(FsError::Invalid));
    }
}
