//! Checks run before anything touches the target.

use anyhow::Result;
use fn_error_context::context;

/// Host programs used by the builder itself.
pub(crate) const HOST_TOOLS: &[&str] = &[
    "losetup",
    "wipefs",
    "dd",
    "sfdisk",
    "udevadm",
    "mkfs.vfat",
    "mkfs.ext4",
    "mount",
    "umount",
    "findmnt",
    "sync",
];

pub(crate) fn require_root() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        anyhow::bail!("This command requires root privileges");
    }
    if !rustix::thread::capability_is_in_bounding_set(rustix::thread::Capability::SystemAdmin)? {
        anyhow::bail!("This command requires full root privileges (CAP_SYS_ADMIN)");
    }
    Ok(())
}

/// The entries of `tools` which `present` says are missing, deduplicated.
fn missing_tools<'a>(
    tools: impl IntoIterator<Item = &'a str>,
    present: impl Fn(&str) -> bool,
) -> Vec<&'a str> {
    let mut missing: Vec<&str> = Vec::new();
    for tool in tools {
        if !missing.contains(&tool) && !present(tool) {
            missing.push(tool);
        }
    }
    missing
}

/// Verify that [`HOST_TOOLS`] and `extra` are all on `PATH`.
#[context("Checking host tools")]
pub(crate) fn check_host_tools(extra: &[&str]) -> Result<()> {
    let tools = HOST_TOOLS.iter().chain(extra).copied();
    let missing = missing_tools(tools, |t| which::which(t).is_ok());
    if !missing.is_empty() {
        anyhow::bail!("Missing required programs: {}", missing.join(" "));
    }
    Ok(())
}
