#![allow(dead_code)]

use core::mem::size_of;
use core::slice::from_raw_parts;

use log::LevelFilter;

/// Reinterpret a repr(C) struct as its raw bytes.
///
/// # Safety
///
/// `T` must be free of padding bytes; every PM-resident struct in
/// `layout.rs` is declared that way and size-asserted.
pub unsafe fn serialize_row<T: Sized>(src: &T) -> &[u8] {
    from_raw_parts((src as *const T) as *const u8, size_of::<T>())
}

/// Read a struct back out of a byte slice.
///
/// # Safety
///
/// `src` must hold at least `size_of::<T>()` bytes of a valid `T` image.
pub unsafe fn deserialize_row<T>(src: &[u8]) -> T {
    assert!(src.len() >= size_of::<T>());
    std::ptr::read_unaligned(src.as_ptr() as *const _)
}

/// BKDR string hash; directory trees key dentries by it.
pub fn bkdr_hash(name: &[u8]) -> u64 {
    let seed: u64 = 131;
    let mut hash: u64 = 0;
    for c in name {
        hash = hash.wrapping_mul(seed).wrapping_add(*c as u64);
    }
    hash
}

pub fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

pub fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

/// Seconds since the epoch, the on-media time format.
pub fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// One-time logger setup; honors `RUST_LOG` when set.
pub fn init_logs() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

#[macro_export]
macro_rules! get_offset {
    ($type:ty, $field:tt) => {{
        let dummy = ::core::mem::MaybeUninit::<$type>::uninit();
        let dummy_ptr = dummy.as_ptr();
        let member_ptr = unsafe { ::core::ptr::addr_of!((*dummy_ptr).$field) };
        member_ptr as usize - dummy_ptr as usize
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[derive(Debug, PartialEq)]
    #[repr(C)]
    struct TestStruct {
        pub a: u32,
        pub b: u32,
    }

    #[test]
    fn test_serialize_round_trip() -> Result<()> {
        let s = TestStruct { a: 1, b: 0x0a0b0c0d };
        let bytes = unsafe { serialize_row(&s) };
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        let back: TestStruct = unsafe { deserialize_row(bytes) };
        assert_eq!(back, s);
        Ok(())
    }

    #[test]
    fn test_get_offset() -> Result<()> {
        assert_eq!(get_offset!(TestStruct, a), 0);
        assert_eq!(get_offset!(TestStruct, b), 4);
        Ok(())
    }

    #[test]
    fn test_bkdr_stable() {
        let h1 = bkdr_hash(b"file_a");
        let h2 = bkdr_hash(b"file_a");
        let h3 = bkdr_hash(b"file_b");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_align() {
        assert_eq!(align_down(100, 64), 64);
        assert_eq!(align_up(100, 64), 128);
        assert_eq!(align_up(128, 64), 128);
    }
}
