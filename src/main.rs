use std::env::set_var;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{arg, ArgAction, command};
use log::*;
use ssd_driver::ftl::EmuSsdDriver;
use ssd_driver::ram::RamSsdDriver;
use ssd_driver::SsdDriver;

use bytefs::layout::ROOT_INO;
use bytefs::stats::IoctlCmd;
use bytefs::types::MountOpts;
use bytefs::utils::init_logs;
use bytefs::ByteFs;

fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(anyhow!("empty size"));
    }
    let (digits, unit) = text.split_at(text.len() - 1);
    let (number, multiplier) = match unit {
        "K" | "k" => (digits, 1u64 << 10),
        "M" | "m" => (digits, 1u64 << 20),
        "G" | "g" => (digits, 1u64 << 30),
        _ => (text, 1),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| anyhow!("bad size: {}", text))?;
    Ok(number * multiplier)
}

/// A little workload touching every major path: tree ops, data ops, rename,
/// and the control surface.
fn exercise(fs: &ByteFs) -> Result<()> {
    info!("running exercise workload");
    let dir = fs.mkdir(ROOT_INO, b"bench", 0o755)?;
    let file = fs.create(dir, b"data.bin", 0o644)?;
    let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();
    for (i, chunk) in payload.chunks(4096).enumerate() {
        fs.write(file, (i * 4096) as u64, chunk)?;
    }
    fs.fsync(file)?;
    let back = fs.read(file, 0, payload.len())?;
    if back != payload {
        return Err(anyhow!("read back mismatch"));
    }
    // unaligned overwrite across a page boundary
    fs.write(file, 4000, &[0xee; 200])?;
    let edge = fs.read(file, 4000, 200)?;
    if edge != vec![0xee; 200] {
        return Err(anyhow!("overwrite mismatch"));
    }
    fs.rename(dir, b"data.bin", ROOT_INO, b"moved.bin")?;
    let found = fs
        .lookup(ROOT_INO, b"moved.bin")?
        .ok_or_else(|| anyhow!("rename lost the file"))?;
    info!("exercise ok: ino {} holds {} bytes", found.0, found.1.i_size);
    for (name, ino) in fs.readdir(ROOT_INO)? {
        debug!("  /{} -> {}", name, ino);
    }
    fs.ioctl(IoctlCmd::PrintFreeLists as u32, 0)?;
    fs.ioctl(IoctlCmd::PrintTiming as u32, 0)?;
    Ok(())
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(-s --size <SIZE> "Emulated device size, e.g. 64M or 1G")
                .required(false)
                .default_value("64M"),
        )
        .arg(
            arg!(-c --cpus <N> "Per-CPU structure count (0 = host parallelism)")
                .required(false)
                .default_value("0"),
        )
        .arg(
            arg!(-o --options <OPTS> "Mount options, comma separated")
                .required(false)
                .default_value("metadata_csum"),
        )
        .arg(arg!(--format "Format the device before mounting").action(ArgAction::SetTrue))
        .arg(arg!(--ram "Flat RAM backend instead of the FTL emulation").action(ArgAction::SetTrue))
        .arg(arg!(--exercise "Run a smoke workload after mounting").action(ArgAction::SetTrue))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    let size = parse_size(matches.get_one::<String>("size").unwrap())?;
    let mut cpus: u32 = matches.get_one::<String>("cpus").unwrap().parse()?;
    if cpus == 0 {
        cpus = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
    }
    let opts = MountOpts::parse(matches.get_one::<String>("options").unwrap())
        .map_err(|e| anyhow!("bad mount options: {}", e))?;

    let driver: Arc<dyn SsdDriver> = if matches.get_flag("ram") {
        info!("backend: flat RAM, {} bytes", size);
        Arc::new(RamSsdDriver::new(size))
    } else {
        info!("backend: emulated SSD, {} bytes", size);
        Arc::new(EmuSsdDriver::new(size))
    };
    driver.open("bytefs")?;

    // an in-memory device is always fresh, so mount implies mkfs
    if !matches.get_flag("format") {
        warn!("no --format given; formatting the fresh in-memory device anyway");
    }
    ByteFs::format(driver.clone(), cpus, &opts).map_err(|e| anyhow!("format failed: {}", e))?;

    let fs = ByteFs::mount(driver.clone(), opts).map_err(|e| anyhow!("mount failed: {}", e))?;
    info!("{}", fs.summary());

    if matches.get_flag("exercise") {
        exercise(&fs)?;
        info!("{}", fs.summary());
    }

    fs.umount().map_err(|e| anyhow!("umount failed: {}", e))?;
    driver.close()?;
    info!("All Done.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() -> Result<()> {
        assert_eq!(parse_size("4096")?, 4096);
        assert_eq!(parse_size("64M")?, 64 << 20);
        assert_eq!(parse_size("1G")?, 1 << 30);
        assert_eq!(parse_size("8k")?, 8 << 10);
        assert!(parse_size("lots").is_err());
        Ok(())
    }

    #[test]
    fn exercise_over_ram_backend() -> Result<()> {
        let opts = MountOpts::parse("metadata_csum").unwrap();
        let driver: Arc<dyn SsdDriver> = Arc::new(RamSsdDriver::new(64 << 20));
        ByteFs::format(driver.clone(), 2, &opts).unwrap();
        let fs = ByteFs::mount(driver, opts).unwrap();
        exercise(&fs)?;
        fs.umount().unwrap();
        Ok(())
    }
}
