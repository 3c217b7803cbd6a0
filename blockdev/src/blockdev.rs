//! Resolving the build target to a block device, and partitioning it.
//!
//! A target is either an existing block device, used as is, or a regular
//! file which is sized and attached to a loop device for the duration of
//! the build.

use std::fmt::Debug;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;

use camino::{Utf8Path, Utf8PathBuf};
use makedistro_utils::{CommandError, CommandRunner};

mod partition;
pub use partition::*;

/// Size of a freshly created image file when nothing else is configured.
pub const DEFAULT_IMAGE_SIZE_MIB: u64 = 4096;

const MIB: u64 = 1024 * 1024;

/// Paths with this prefix must already be block devices.
const DEVICE_PREFIX: &str = "/dev/";

/// Errors from preparing the target device.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("Invalid device {0}: not a block device")]
    InvalidDevice(Utf8PathBuf),
    #[error("{0} is not a block device")]
    NotABlockDevice(Utf8PathBuf),
    #[error("Failed to find the partitions of {device}")]
    PartitionResolutionFailed { device: Utf8PathBuf },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Detaching {device}: {output}")]
    DetachFailed { device: Utf8PathBuf, output: String },
    #[error("Preparing {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Answers whether a path is a block special file.
///
/// Everything in this crate asks through this trait rather than the
/// filesystem, so that device handling can be exercised without devices.
pub trait BlockProbe: Debug + Send + Sync {
    /// Returns `true` if `path` exists and is a block special file.
    fn is_block_device(&self, path: &Utf8Path) -> bool;
}

/// Probes the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl BlockProbe for HostProbe {
    fn is_block_device(&self, path: &Utf8Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }
}

/// A fixed set of paths which are considered block devices.
#[cfg(any(test, feature = "fixture"))]
#[derive(Debug, Default, Clone)]
pub struct StaticProbe {
    devices: std::collections::BTreeSet<Utf8PathBuf>,
}

#[cfg(any(test, feature = "fixture"))]
impl StaticProbe {
    /// Treat exactly `devices` as block devices.
    pub fn new<I, P>(devices: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(any(test, feature = "fixture"))]
impl BlockProbe for StaticProbe {
    fn is_block_device(&self, path: &Utf8Path) -> bool {
        self.devices.contains(path)
    }
}

/// The destination of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    /// The path given by the user.
    pub image_path: Utf8PathBuf,
    /// The block device the image is written through.
    pub device: Utf8PathBuf,
    /// Whether `device` is a loop device created for `image_path`.
    pub loop_backed: bool,
    attached: bool,
}

impl BuildTarget {
    /// Use an existing block device directly.
    pub fn new_direct(device: impl Into<Utf8PathBuf>) -> Self {
        let device = device.into();
        Self {
            image_path: device.clone(),
            device,
            loop_backed: false,
            attached: false,
        }
    }

    /// Whether a loop device is currently attached on our behalf.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Detach the loop device, if there is one. Calling this again, or on
    /// a target which was never loop-backed, does nothing.
    pub fn release(&mut self, runner: &dyn CommandRunner) -> Result<(), Error> {
        if !self.attached {
            return Ok(());
        }
        // Cleanup calls this; a failure is reported by the caller, not by
        // forwarding losetup's output.
        let o = runner.run(&["losetup", "-d", self.device.as_str()], true)?;
        if !o.success {
            return Err(Error::DetachFailed {
                device: self.device.clone(),
                output: o.output.trim().to_owned(),
            });
        }
        tracing::debug!("Detached {}", self.device);
        self.attached = false;
        Ok(())
    }
}

/// Create `path` or truncate it to `size_mib`, leaving it sparse.
fn create_sparse_file(path: &Utf8Path, size_mib: u64) -> std::io::Result<()> {
    let size = size_mib.checked_mul(MIB).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("image size of {size_mib} MiB is too large"),
        )
    })?;
    let f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    rustix::fs::ftruncate(&f, size)?;
    Ok(())
}

fn attach_loop(
    image: &Utf8Path,
    runner: &dyn CommandRunner,
) -> Result<Utf8PathBuf, CommandError> {
    let out = runner.run_capturing_stdout(&[
        "losetup",
        "--find",
        "--show",
        "--partscan",
        image.as_str(),
    ])?;
    Ok(out.trim().into())
}

/// Find or create the block device for `image`.
///
/// An existing block device is used directly. A missing path or regular
/// file is truncated to `size_mib` and attached to a free loop device.
/// Anything under `/dev/` which is not a block device is refused.
pub fn resolve(
    image: &Utf8Path,
    size_mib: u64,
    runner: &dyn CommandRunner,
    probe: &dyn BlockProbe,
) -> Result<BuildTarget, Error> {
    if probe.is_block_device(image) {
        tracing::debug!("Using block device {image}");
        return Ok(BuildTarget::new_direct(image));
    }
    if image.as_str().starts_with(DEVICE_PREFIX) {
        return Err(Error::InvalidDevice(image.to_owned()));
    }
    match std::fs::metadata(image) {
        Ok(m) if m.is_file() => {}
        Ok(_) => return Err(Error::NotABlockDevice(image.to_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(Error::Io {
                path: image.to_owned(),
                err,
            })
        }
    }
    create_sparse_file(image, size_mib).map_err(|err| Error::Io {
        path: image.to_owned(),
        err,
    })?;
    let device = attach_loop(image, runner)?;
    let mut target = BuildTarget {
        image_path: image.to_owned(),
        device,
        loop_backed: true,
        attached: true,
    };
    if !probe.is_block_device(&target.device) {
        let device = target.device.clone();
        if let Err(e) = target.release(runner) {
            tracing::warn!("Failed to detach {device}: {e}");
        }
        return Err(Error::NotABlockDevice(device));
    }
    tracing::debug!("Attached {image} to {}", target.device);
    Ok(target)
}

/// Remove filesystem and partition table signatures, then zero the first
/// few megabytes so no stale metadata survives.
pub fn wipe(target: &BuildTarget, runner: &dyn CommandRunner) -> Result<(), Error> {
    let dev = target.device.as_str();
    runner.run(&["wipefs", "-a", dev], false)?;
    let of = format!("of={dev}");
    runner.run(&["dd", "if=/dev/zero", &of, "bs=1M", "count=4"], false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use makedistro_utils::RecordingRunner;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, p)
    }

    #[test]
    fn test_resolve_new_file() {
        let (_td, dir) = tempdir();
        let image = dir.join("disk.img");
        let runner = RecordingRunner::new();
        runner.reply(&["losetup", "--find"], "/dev/loop7\n");
        let probe = StaticProbe::new(["/dev/loop7"]);

        let mut target = resolve(&image, 16, &runner, &probe).unwrap();
        assert_eq!(target.device, "/dev/loop7");
        assert_eq!(target.image_path, image);
        assert!(target.loop_backed);
        assert!(target.is_attached());
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 16 * MIB);

        target.release(&runner).unwrap();
        target.release(&runner).unwrap();
        assert!(!target.is_attached());
        assert_eq!(
            runner.command_lines(),
            [
                format!("losetup --find --show --partscan {image}"),
                "losetup -d /dev/loop7".to_string(),
            ]
        );
    }

    #[test]
    fn test_resolve_existing_file_truncates() {
        let (_td, dir) = tempdir();
        let image = dir.join("disk.img");
        std::fs::write(&image, b"stale contents").unwrap();
        let runner = RecordingRunner::new();
        runner.reply(&["losetup", "--find"], "/dev/loop0\n");
        let probe = StaticProbe::new(["/dev/loop0"]);
        let target = resolve(&image, 8, &runner, &probe).unwrap();
        assert!(target.loop_backed);
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 8 * MIB);
    }

    #[test]
    fn test_resolve_oversized() {
        let (_td, dir) = tempdir();
        let image = dir.join("disk.img");
        std::fs::write(&image, b"keep").unwrap();
        let runner = RecordingRunner::new();
        let e = resolve(&image, u64::MAX / 1024, &runner, &StaticProbe::default()).unwrap_err();
        match e {
            Error::Io { path, err } => {
                assert_eq!(path, image);
                assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
            }
            e => panic!("unexpected error {e}"),
        }
        // Nothing was truncated or attached
        assert_eq!(std::fs::read(&image).unwrap(), b"keep");
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn test_release_failure() {
        let (_td, dir) = tempdir();
        let image = dir.join("disk.img");
        let runner = RecordingRunner::new();
        runner.reply(&["losetup", "--find"], "/dev/loop7\n");
        runner.fail(&["losetup", "-d"], 1, "losetup: /dev/loop7: detach failed: busy\n");
        let probe = StaticProbe::new(["/dev/loop7"]);
        let mut target = resolve(&image, 16, &runner, &probe).unwrap();
        let e = target.release(&runner).unwrap_err();
        assert!(matches!(e, Error::DetachFailed { ref device, .. } if device == "/dev/loop7"));
        assert!(e.to_string().ends_with("detach failed: busy"));
        assert!(target.is_attached());
    }

    #[test]
    fn test_resolve_block_device() {
        let runner = RecordingRunner::new();
        let probe = StaticProbe::new(["/dev/vdb"]);
        let mut target = resolve(Utf8Path::new("/dev/vdb"), 16, &runner, &probe).unwrap();
        assert_eq!(target, BuildTarget::new_direct("/dev/vdb"));
        assert!(!target.loop_backed);
        target.release(&runner).unwrap();
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn test_resolve_invalid_device() {
        let runner = RecordingRunner::new();
        let probe = StaticProbe::default();
        let e = resolve(Utf8Path::new("/dev/nonexistent"), 16, &runner, &probe).unwrap_err();
        assert!(matches!(e, Error::InvalidDevice(p) if p == "/dev/nonexistent"));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn test_resolve_directory() {
        let (_td, dir) = tempdir();
        let runner = RecordingRunner::new();
        let e = resolve(&dir, 16, &runner, &StaticProbe::default()).unwrap_err();
        assert!(matches!(e, Error::NotABlockDevice(_)));
    }

    #[test]
    fn test_resolve_loop_not_block() {
        let (_td, dir) = tempdir();
        let image = dir.join("disk.img");
        let runner = RecordingRunner::new();
        runner.reply(&["losetup", "--find"], "/dev/loop9\n");
        let e = resolve(&image, 16, &runner, &StaticProbe::default()).unwrap_err();
        assert!(matches!(e, Error::NotABlockDevice(p) if p == "/dev/loop9"));
        // The loop device we attached must not leak
        assert_eq!(
            runner.command_lines().last().unwrap(),
            "losetup -d /dev/loop9"
        );
    }

    #[test]
    fn test_wipe() {
        let runner = RecordingRunner::new();
        wipe(&BuildTarget::new_direct("/dev/vdb"), &runner).unwrap();
        assert_eq!(
            runner.command_lines(),
            [
                "wipefs -a /dev/vdb",
                "dd if=/dev/zero of=/dev/vdb bs=1M count=4"
            ]
        );
    }
}
