use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use libtest_mimic::Trial;
use makedistro_blockdev::{BlockProbe, HostProbe};
use makedistro_utils::HostRunner;
use xshell::cmd;

const SIZE_MIB: u64 = 64;

fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let td = tempfile::tempdir_in("/var/tmp")?;
    let path = Utf8Path::from_path(td.path())
        .context("Non-UTF-8 temporary directory")?
        .to_owned();
    Ok((td, path))
}

/// A missing image file is created sparse and attached to a loop device.
fn loop_backed_file() -> Result<()> {
    let sh = &xshell::Shell::new()?;
    let (_td, dir) = tempdir()?;
    let image = dir.join("disk.img");
    let mut target = makedistro_blockdev::resolve(&image, SIZE_MIB, &HostRunner, &HostProbe)?;
    assert!(target.loop_backed);
    assert!(target.is_attached());
    assert!(HostProbe.is_block_device(&target.device));
    assert_eq!(target.image_path, image);

    let meta = std::fs::metadata(&image)?;
    assert_eq!(meta.len(), SIZE_MIB * 1024 * 1024);
    assert!(meta.blocks() * 512 < meta.len());

    let name = target.device.file_name().context("Loop device name")?;
    let backing_file = Utf8PathBuf::from(format!("/sys/block/{name}/loop/backing_file"));
    assert_eq!(std::fs::read_to_string(&backing_file)?.trim(), image.as_str());
    assert!(!cmd!(sh, "losetup -j {image}").read()?.is_empty());

    target.release(&HostRunner)?;
    assert!(!target.is_attached());
    // The kernel agrees it is gone
    assert_eq!(cmd!(sh, "losetup -j {image}").read()?, "");
    assert!(!backing_file.exists());
    // Releasing twice is fine
    target.release(&HostRunner)?;
    Ok(())
}

/// An existing block device is used as is, and never detached by us.
fn existing_block_device() -> Result<()> {
    let sh = &xshell::Shell::new()?;
    let (_td, dir) = tempdir()?;
    let backing = dir.join("backing.img");
    std::fs::File::create(&backing)?.set_len(SIZE_MIB * 1024 * 1024)?;
    let dev = cmd!(sh, "losetup --find --show {backing}").read()?;
    let dev = Utf8PathBuf::from(dev.trim());

    let r = (|| -> Result<()> {
        let mut target = makedistro_blockdev::resolve(&dev, SIZE_MIB, &HostRunner, &HostProbe)?;
        assert!(!target.loop_backed);
        assert!(!target.is_attached());
        assert_eq!(target.device, dev);
        target.release(&HostRunner)?;
        // Still attached
        cmd!(sh, "losetup {dev}").quiet().ignore_stdout().run()?;
        Ok(())
    })();
    cmd!(sh, "losetup -d {dev}").run()?;
    r
}

/// Tests that require real root (e.g. CAP_SYS_ADMIN) to create loopback
/// devices, but are *not* destructive.
#[context("Hostpriv tests")]
pub(crate) fn run_hostpriv(testargs: libtest_mimic::Arguments) -> Result<()> {
    if !rustix::process::getuid().is_root() {
        anyhow::bail!("These tests must be run as root");
    }
    let tests = [
        Trial::test("loop-backed image file", || Ok(loop_backed_file()?)),
        Trial::test("existing block device", || Ok(existing_block_device()?)),
    ];

    libtest_mimic::run(&testargs, tests.into()).exit()
}
