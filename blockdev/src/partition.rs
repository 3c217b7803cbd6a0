use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use indoc::formatdoc;
use makedistro_utils::CommandRunner;

use crate::{BlockProbe, BuildTarget, Error};

/// GPT type of the EFI system partition.
pub const ESP_TYPE_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// Size of the EFI system partition.
pub const ESP_SIZE_MIB: u64 = 511;
/// Filesystem and partition label of the EFI system partition.
pub const ESP_LABEL: &str = "ESP";
/// Filesystem and partition label of the root partition.
pub const ROOT_LABEL: &str = "System";

const ROOT_X86_64: &str = "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709";
const ROOT_X86: &str = "44479540-F297-41B2-9AF7-D131D5F0458A";
const ROOT_GENERIC: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

// Partition nodes can lag behind sfdisk returning, even after udev settles.
const PROBE_ATTEMPTS: u32 = 10;
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// The GPT type of the root partition for `arch`, following the
/// discoverable partitions specification.
pub fn root_type_guid(arch: &str) -> &'static str {
    match arch {
        "x86_64" => ROOT_X86_64,
        "x86" | "i386" | "i486" | "i586" | "i686" => ROOT_X86,
        _ => ROOT_GENERIC,
    }
}

/// The `sfdisk` script for the two partition layout.
pub fn gpt_script(root_guid: &str) -> String {
    formatdoc! {r#"
        label: gpt
        size={ESP_SIZE_MIB}MiB, type={ESP_TYPE_GUID}, bootable, name="{ESP_LABEL}"
        type={root_guid}, name="{ROOT_LABEL}"
    "#}
}

/// What a partition is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// The EFI system partition, mounted at `/boot`.
    Boot,
    /// The root filesystem.
    Root,
}

impl PartitionRole {
    /// Partition number in the table.
    pub fn index(self) -> u32 {
        match self {
            PartitionRole::Boot => 1,
            PartitionRole::Root => 2,
        }
    }
}

/// Device nodes of the partitions of a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    /// The EFI system partition.
    pub boot: Utf8PathBuf,
    /// The root partition.
    pub root: Utf8PathBuf,
}

impl PartitionMap {
    /// The device node for `role`.
    pub fn get(&self, role: PartitionRole) -> &Utf8Path {
        match role {
            PartitionRole::Boot => &self.boot,
            PartitionRole::Root => &self.root,
        }
    }
}

/// Find the node of partition `index` of `device`, which is either
/// `<device>N` or `<device>pN` depending on the device naming.
pub fn find_partition_node(
    device: &Utf8Path,
    index: u32,
    probe: &dyn BlockProbe,
) -> Option<Utf8PathBuf> {
    [format!("{device}{index}"), format!("{device}p{index}")]
        .into_iter()
        .map(Utf8PathBuf::from)
        .find(|p| probe.is_block_device(p))
}

/// Resolve both partitions of `device` as they exist right now.
pub fn resolve_partitions(
    device: &Utf8Path,
    probe: &dyn BlockProbe,
) -> Result<PartitionMap, Error> {
    let find = |role: PartitionRole| {
        find_partition_node(device, role.index(), probe).ok_or_else(|| {
            Error::PartitionResolutionFailed {
                device: device.to_owned(),
            }
        })
    };
    Ok(PartitionMap {
        boot: find(PartitionRole::Boot)?,
        root: find(PartitionRole::Root)?,
    })
}

fn wait_for_partitions(
    device: &Utf8Path,
    runner: &dyn CommandRunner,
    probe: &dyn BlockProbe,
) -> Result<PartitionMap, Error> {
    if let Err(e) = runner.run(&["udevadm", "settle"], true) {
        tracing::debug!("udevadm settle: {e}");
    }
    let mut attempt = 1;
    loop {
        match resolve_partitions(device, probe) {
            Ok(map) => return Ok(map),
            Err(e) if attempt >= PROBE_ATTEMPTS => return Err(e),
            Err(_) => {
                tracing::trace!("Partitions of {device} not present yet (attempt {attempt})");
                attempt += 1;
                std::thread::sleep(PROBE_INTERVAL);
            }
        }
    }
}

/// Write a fresh GPT with an EFI system partition and a root partition
/// typed for `arch`, and find the resulting partition nodes.
pub fn partition(
    target: &BuildTarget,
    arch: &str,
    runner: &dyn CommandRunner,
    probe: &dyn BlockProbe,
) -> Result<PartitionMap, Error> {
    let device = target.device.as_path();
    let script = gpt_script(root_type_guid(arch));
    tracing::debug!("Partitioning {device}:\n{script}");
    runner.run_with_stdin(&["sfdisk", device.as_str()], &script)?;
    wait_for_partitions(device, runner, probe)
}

/// Wipe each partition and create its filesystem.
pub fn format_partitions(map: &PartitionMap, runner: &dyn CommandRunner) -> Result<(), Error> {
    let boot = map.boot.as_str();
    let root = map.root.as_str();
    runner.run(&["wipefs", "-a", boot], false)?;
    runner.run(&["mkfs.vfat", "-n", ESP_LABEL, "-F32", boot], false)?;
    runner.run(&["wipefs", "-a", root], false)?;
    runner.run(&["mkfs.ext4", "-L", ROOT_LABEL, root], false)?;
    Ok(())
}
