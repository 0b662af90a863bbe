extern crate core;

mod bytefs_lib;

pub use bytefs_lib::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_surface_reachable() {
        // the error type and its errno mapping are part of the contract
        assert_eq!(types::FsError::NoSpace.errno(), -libc::ENOSPC);
        assert_eq!(layout::BLOCK_SIZE, 4096);
    }
}
