//! Helpers for interacting with mountpoints
//!
//! The image's root partition is mounted on a fresh temporary directory,
//! with the ESP and, for chroot work, the host's kernel filesystems nested
//! below it. Every mount is recorded as it is established so that
//! [`teardown`] can unwind exactly what exists, in reverse.

use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use makedistro_blockdev::PartitionMap;
use makedistro_utils::CommandRunner;

const TEMPDIR_PREFIX: &str = "make-distro-";

/// What is mounted at a location below the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountRole {
    Root,
    Boot,
    Proc,
    Dev,
    Sys,
    Run,
}

impl MountRole {
    /// The mount point relative to the root.
    fn relative_path(self) -> &'static str {
        match self {
            MountRole::Root => "",
            MountRole::Boot => "boot",
            MountRole::Proc => "proc",
            MountRole::Dev => "dev",
            MountRole::Sys => "sys",
            MountRole::Run => "run",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    role: MountRole,
    source: String,
    target: Utf8PathBuf,
}

/// The mounts established for one build, in the order they were made.
#[derive(Debug, Default)]
pub(crate) struct MountMap {
    root: Option<Utf8PathBuf>,
    mounts: Vec<MountEntry>,
}

impl MountMap {
    /// The temporary root directory, once created.
    pub(crate) fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    /// The mount point of `role`, if it is currently mounted.
    #[cfg(test)]
    pub(crate) fn path(&self, role: MountRole) -> Option<&Utf8Path> {
        self.mounts
            .iter()
            .find(|m| m.role == role)
            .map(|m| m.target.as_path())
    }

    /// Roles currently mounted, in establishment order.
    #[cfg(test)]
    pub(crate) fn roles(&self) -> Vec<MountRole> {
        self.mounts.iter().map(|m| m.role).collect()
    }

    fn target(&self, role: MountRole) -> Result<Utf8PathBuf> {
        let root = self
            .root
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Root directory not created"))?;
        match role.relative_path() {
            "" => Ok(root.to_owned()),
            rel => Ok(root.join(rel)),
        }
    }

    fn mount(
        &mut self,
        runner: &dyn CommandRunner,
        role: MountRole,
        args: &[&str],
        source: &str,
    ) -> Result<()> {
        let target = self.target(role)?;
        std::fs::create_dir_all(&target).with_context(|| format!("Creating {target}"))?;
        tracing::debug!("Mounting {source} on {target}");
        let mut argv = vec!["mount"];
        argv.extend_from_slice(args);
        argv.extend([source, target.as_str()]);
        runner.run(&argv, false)?;
        self.mounts.push(MountEntry {
            role,
            source: source.to_owned(),
            target,
        });
        Ok(())
    }
}

/// Create the temporary root directory, then mount the root partition on
/// it and the ESP on its `boot` directory.
#[context("Mounting partitions")]
pub(crate) fn mount_root(
    map: &mut MountMap,
    partitions: &PartitionMap,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let td = tempfile::Builder::new()
        .prefix(TEMPDIR_PREFIX)
        .tempdir()
        .context("Creating root directory")?;
    // Removed by teardown() once nothing is mounted on it
    let root = Utf8PathBuf::try_from(td.into_path())?;
    map.root = Some(root);
    map.mount(runner, MountRole::Root, &[], partitions.root.as_str())?;
    map.mount(runner, MountRole::Boot, &[], partitions.boot.as_str())?;
    Ok(())
}

/// Bind the host's `/proc`, `/dev` and `/sys` into the root, make sure the
/// ESP is still mounted, and give the root a fresh `/run`.
#[context("Mounting kernel filesystems")]
pub(crate) fn mount_kernel_filesystems(map: &mut MountMap, runner: &dyn CommandRunner) -> Result<()> {
    for (role, source) in [
        (MountRole::Proc, "/proc"),
        (MountRole::Dev, "/dev"),
        (MountRole::Sys, "/sys"),
    ] {
        map.mount(runner, role, &["--bind"], source)?;
    }
    let boot = map.target(MountRole::Boot)?;
    if !runner.run(&["findmnt", boot.as_str()], true)?.success {
        let source = map
            .mounts
            .iter()
            .find(|m| m.role == MountRole::Boot)
            .map(|m| m.source.clone())
            .ok_or_else(|| anyhow::anyhow!("{boot} was never mounted"))?;
        tracing::debug!("Remounting {source} on {boot}");
        map.mount(runner, MountRole::Boot, &[], &source)?;
    }
    map.mount(runner, MountRole::Run, &["-t", "tmpfs"], "none")?;
    Ok(())
}

// Not exported by rustix
const STATX_ATTR_MOUNT_ROOT: u64 = 0x2000;

/// Ask the kernel whether `path` is a mount root; `None` if it can't tell us.
fn is_mountpoint_statx(path: &Utf8Path) -> rustix::io::Result<Option<bool>> {
    // https://github.com/systemd/systemd/blob/8fbf0a214e2fe474655b17a4b663122943b55db0/src/basic/mountpoint-util.c#L176
    use rustix::fs::{AtFlags, StatxFlags};

    match rustix::fs::statx(
        rustix::fs::CWD,
        path.as_std_path(),
        AtFlags::NO_AUTOMOUNT | AtFlags::SYMLINK_NOFOLLOW,
        StatxFlags::empty(),
    ) {
        Ok(r) => {
            let present = (r.stx_attributes_mask & STATX_ATTR_MOUNT_ROOT) > 0;
            Ok(present.then_some(r.stx_attributes & STATX_ATTR_MOUNT_ROOT > 0))
        }
        Err(e) if e == rustix::io::Errno::NOSYS => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether `path` is on a different device than its parent.
fn is_mountpoint_by_device(path: &Utf8Path) -> bool {
    let Some(parent) = path.parent() else {
        return true;
    };
    match (std::fs::metadata(path), std::fs::metadata(parent)) {
        (Ok(p), Ok(parent)) => p.dev() != parent.dev(),
        _ => false,
    }
}

/// Whether `path` is the root of a mounted filesystem. A path which no
/// longer exists is not.
fn is_mountpoint(path: &Utf8Path) -> bool {
    match is_mountpoint_statx(path) {
        Ok(Some(r)) => r,
        Ok(None) => is_mountpoint_by_device(path),
        Err(e) => {
            tracing::debug!("statx {path}: {e}");
            false
        }
    }
}

/// Unmount everything in `map` in reverse order, sweep anything left with
/// a recursive unmount, and remove the root directory.
///
/// Failures are logged and otherwise ignored, and the root directory is
/// kept if something is still mounted on it. Calling this again, or on a
/// map where nothing was mounted, is fine.
pub(crate) fn teardown(map: &mut MountMap, runner: &dyn CommandRunner) {
    while let Some(m) = map.mounts.pop() {
        match runner.run(&["umount", m.target.as_str()], true) {
            Ok(o) if o.success => tracing::debug!("Unmounted {}", m.target),
            Ok(o) => tracing::warn!("Failed to unmount {}: {}", m.target, o.output.trim()),
            Err(e) => tracing::warn!("Failed to unmount {}: {e}", m.target),
        }
    }
    let Some(root) = map.root.take() else {
        return;
    };
    for args in [&["-R"][..], &["-R", "-l"][..]] {
        if !is_mountpoint(&root) {
            break;
        }
        let mut argv = vec!["umount"];
        argv.extend_from_slice(args);
        argv.push(root.as_str());
        if let Err(e) = runner.run(&argv, true) {
            tracing::warn!("Failed to unmount {root}: {e}");
        }
    }
    if is_mountpoint(&root) {
        tracing::warn!("{root} is still mounted; not removing it");
        return;
    }
    match std::fs::remove_dir_all(&root) {
        Ok(()) => tracing::debug!("Removed {root}"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {root}: {e}"),
    }
}
