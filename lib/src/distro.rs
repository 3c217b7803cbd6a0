//! # Distribution plugins
//!
//! Each supported distribution implements [`Distro`], a fixed sequence of
//! steps run against the mounted root filesystem of the image.

use std::fmt::{Debug, Display};
use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use makedistro_utils::CommandRunner;

mod arch;
mod fedora;

/// Kernel command line shared by all images: serial and VGA consoles,
/// writable root, quiet boot.
pub(crate) const KERNEL_CMDLINE: &str = "console=ttyS0,115200 console=tty0 rw quiet";

/// Path of the resolver configuration maintained by systemd-resolved.
const RESOLVED_RESOLV_CONF: &str = "/run/systemd/resolve/resolv.conf";

/// The supported distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DistroKind {
    /// Arch Linux, installed with pacman.
    Arch,
    /// Fedora, installed with dnf.
    Fedora,
}

impl DistroKind {
    /// Every supported distribution, in listing order.
    pub fn all() -> &'static [DistroKind] {
        <Self as clap::ValueEnum>::value_variants()
    }

    /// The name used on the command line.
    pub fn name(self) -> &'static str {
        match self {
            DistroKind::Arch => "arch",
            DistroKind::Fedora => "fedora",
        }
    }

    /// The human readable name.
    pub fn long_name(self) -> &'static str {
        match self {
            DistroKind::Arch => "Archlinux",
            DistroKind::Fedora => "Fedora",
        }
    }

    pub(crate) fn instantiate(
        self,
        settings: DistroSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Box<dyn Distro> {
        match self {
            DistroKind::Arch => Box::new(arch::Arch::new(settings, runner)),
            DistroKind::Fedora => Box::new(fedora::Fedora::new(settings, runner)),
        }
    }
}

/// Build parameters a plugin may honor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DistroSettings {
    pub(crate) locale: String,
    pub(crate) release: Option<String>,
}

/// One step of the installation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroStep {
    /// Refresh the host's package metadata.
    UpdateDatabase,
    /// Install the base package set into the root.
    Bootstrap,
    /// Install what needs the kernel filesystems, and static configuration.
    BootstrapPhase2,
    /// Generate locales.
    SetupLocale,
    /// Install the bootloader and its entries.
    InstallBootloader,
    /// Install the kernel.
    InstallKernel,
    /// Default target, consoles and remote access.
    CustomizeImage,
    /// DHCP networking and name resolution.
    SetupNetwork,
}

impl DistroStep {
    /// The steps in invocation order.
    pub const ALL: [DistroStep; 8] = [
        DistroStep::UpdateDatabase,
        DistroStep::Bootstrap,
        DistroStep::BootstrapPhase2,
        DistroStep::SetupLocale,
        DistroStep::InstallBootloader,
        DistroStep::InstallKernel,
        DistroStep::CustomizeImage,
        DistroStep::SetupNetwork,
    ];

    /// A short machine-friendly name.
    pub fn as_str(self) -> &'static str {
        match self {
            DistroStep::UpdateDatabase => "update-database",
            DistroStep::Bootstrap => "bootstrap",
            DistroStep::BootstrapPhase2 => "bootstrap-phase2",
            DistroStep::SetupLocale => "setup-locale",
            DistroStep::InstallBootloader => "install-bootloader",
            DistroStep::InstallKernel => "install-kernel",
            DistroStep::CustomizeImage => "customize-image",
            DistroStep::SetupNetwork => "setup-network",
        }
    }

    /// The banner shown to the operator when the step starts.
    pub(crate) fn banner(self, long_name: &str) -> String {
        match self {
            DistroStep::UpdateDatabase => "Updating distro database".into(),
            DistroStep::Bootstrap => format!("Bootstrap distro '{long_name}'"),
            DistroStep::BootstrapPhase2 => format!("Bootstrap distro (phase 2) '{long_name}'"),
            DistroStep::SetupLocale => "Setting up locale".into(),
            DistroStep::InstallBootloader => "Installing bootloader".into(),
            DistroStep::InstallKernel => "Installing kernel".into(),
            DistroStep::CustomizeImage => "Customizing image".into(),
            DistroStep::SetupNetwork => "Setting up network".into(),
        }
    }
}

impl Display for DistroStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The installation sequence for one distribution.
///
/// [`Distro::set_rootfs`] is always called before any step, and the steps
/// are always called in the order of [`DistroStep::ALL`]. The kernel
/// filesystems are mounted in the root from [`Distro::bootstrap_phase2`]
/// onwards.
pub(crate) trait Distro: Debug + Send {
    /// See [`DistroKind::long_name`].
    fn long_name(&self) -> &'static str;
    /// Assign the mounted root filesystem to operate on.
    fn set_rootfs(&mut self, rootfs: &Utf8Path);
    /// Host programs the steps need, beyond the ones the builder itself uses.
    fn required_tools(&self) -> &'static [&'static str];

    fn update_database(&mut self) -> Result<()>;
    fn bootstrap(&mut self) -> Result<()>;
    fn bootstrap_phase2(&mut self) -> Result<()>;
    fn setup_locale(&mut self) -> Result<()>;
    fn install_bootloader(&mut self) -> Result<()>;
    fn install_kernel(&mut self) -> Result<()>;
    fn customize_image(&mut self) -> Result<()>;
    fn setup_network(&mut self) -> Result<()>;

    /// Dispatch a single step.
    fn run_step(&mut self, step: DistroStep) -> Result<()> {
        match step {
            DistroStep::UpdateDatabase => self.update_database(),
            DistroStep::Bootstrap => self.bootstrap(),
            DistroStep::BootstrapPhase2 => self.bootstrap_phase2(),
            DistroStep::SetupLocale => self.setup_locale(),
            DistroStep::InstallBootloader => self.install_bootloader(),
            DistroStep::InstallKernel => self.install_kernel(),
            DistroStep::CustomizeImage => self.customize_image(),
            DistroStep::SetupNetwork => self.setup_network(),
        }
    }
}

/// The mounted root filesystem of the image being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rootfs {
    path: Utf8PathBuf,
}

impl Rootfs {
    pub(crate) fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub(crate) fn join(&self, rel: &str) -> Utf8PathBuf {
        self.path.join(rel)
    }

    /// Write `contents` to `rel`, creating parent directories.
    #[context("Writing {rel}")]
    pub(crate) fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(())
    }

    /// Replace whatever is at `rel` (which may not exist) with a symbolic
    /// link to `target`.
    #[context("Replacing {rel} with a link to {target}")]
    pub(crate) fn replace_with_symlink(&self, rel: &str, target: &str) -> Result<()> {
        let path = self.join(rel);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(target, &path)?;
        Ok(())
    }
}

/// The rootfs, or an error if the plugin is used before it is assigned.
pub(crate) fn require_rootfs(rootfs: &Option<Rootfs>) -> Result<&Rootfs> {
    rootfs
        .as_ref()
        .ok_or_else(|| anyhow!("Root filesystem not assigned"))
}

/// A line of `/etc/fstab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FstabEntry {
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) fstype: String,
    pub(crate) options: Option<String>,
    pub(crate) passno: u32,
}

impl FstabEntry {
    /// Mount the filesystem labeled `label`.
    pub(crate) fn new_label(label: &str, target: &str, fstype: &str, passno: u32) -> Self {
        Self {
            source: format!("LABEL={label}"),
            target: target.to_owned(),
            fstype: fstype.to_owned(),
            options: None,
            passno,
        }
    }

    pub(crate) fn with_options(mut self, options: &str) -> Self {
        self.options = Some(options.to_owned());
        self
    }

    pub(crate) fn to_fstab(&self) -> String {
        let options = self.options.as_deref().unwrap_or("defaults");
        format!(
            "{} {} {} {} 0 {}",
            self.source, self.target, self.fstype, options, self.passno
        )
    }
}

/// The fstab for the two partition layout.
pub(crate) fn default_fstab() -> String {
    use makedistro_blockdev::{ESP_LABEL, ROOT_LABEL};
    let entries = [
        FstabEntry::new_label(ROOT_LABEL, "/", "ext4", 1).with_options("rw,relatime"),
        FstabEntry::new_label(ESP_LABEL, "/boot", "vfat", 2),
    ];
    let mut r = String::new();
    for e in entries {
        r.push_str(&e.to_fstab());
        r.push('\n');
    }
    r
}

/// The kernel command line, with the root filesystem named by label.
pub(crate) fn kernel_cmdline() -> String {
    format!("root=LABEL={} {KERNEL_CMDLINE}", makedistro_blockdev::ROOT_LABEL)
}

/// Run `systemctl --root` against the image.
pub(crate) fn systemctl(runner: &dyn CommandRunner, rootfs: &Rootfs, args: &[&str]) -> Result<()> {
    let mut argv = vec!["systemctl", "--root", rootfs.path().as_str()];
    argv.extend_from_slice(args);
    runner.run(&argv, false)?;
    Ok(())
}

/// Enable `units` in the image.
pub(crate) fn enable_units(
    runner: &dyn CommandRunner,
    rootfs: &Rootfs,
    units: &[&str],
) -> Result<()> {
    for unit in units {
        systemctl(runner, rootfs, &["enable", unit])?;
    }
    Ok(())
}

/// Boot to a non-graphical multi-user target with a serial getty, and
/// enable `ssh_unit`.
pub(crate) fn customize_common(
    runner: &dyn CommandRunner,
    rootfs: &Rootfs,
    ssh_unit: &str,
) -> Result<()> {
    systemctl(runner, rootfs, &["set-default", "multi-user.target"])?;
    enable_units(runner, rootfs, &["serial-getty@ttyS0.service", ssh_unit])
}

/// DHCP on every ethernet interface through systemd-networkd, and name
/// resolution through systemd-resolved.
#[context("Configuring networkd")]
pub(crate) fn setup_networkd(runner: &dyn CommandRunner, rootfs: &Rootfs) -> Result<()> {
    enable_units(
        runner,
        rootfs,
        &["systemd-networkd.service", "systemd-resolved.service"],
    )?;
    rootfs.replace_with_symlink("etc/resolv.conf", RESOLVED_RESOLV_CONF)?;
    rootfs.write_file(
        "usr/lib/systemd/network/ether.network",
        indoc::indoc! {"
            [Match]
            Name=en*

            [Network]
            DHCP=yes
        "},
    )
}

/// Write the locale configuration shared by systemd-based images.
pub(crate) fn write_locale_conf(rootfs: &Rootfs, locale: &str) -> Result<()> {
    rootfs
        .write_file("etc/locale.conf", &format!("LANG={locale}\n"))
        .context("Setting default locale")
}
