//! Fedora, installed into the image with `dnf --installroot`.
//!
//! The kernel is installed last so that `kernel-install` finds the
//! systemd-boot layout and writes Boot Loader Specification entries.

use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use makedistro_utils::CommandRunner;

use super::{Distro, DistroSettings, Rootfs};

const DEFAULT_RELEASE: &str = "41";

/// Passed as `--exclude` when installing `@core`.
const EXCLUDED_PACKAGES: &[&str] = &[
    "kernel*",
    "mdadm",
    "lvm2",
    "cryptsetup*",
    "device-mapper*",
    "xfsprogs",
    "btrfs-progs",
    "man-db",
    "man-pages*",
    "NetworkManager*",
    "dhcp-client",
];

const PHASE2_PACKAGES: &[&str] = &[
    "dracut",
    "systemd-boot-unsigned",
    "openssh-server",
    "bash-completion",
    "glibc-langpack-en",
    "systemd-networkd",
];

const KERNEL_PACKAGE: &str = "kernel-core";

#[derive(Debug)]
pub(crate) struct Fedora {
    settings: DistroSettings,
    runner: Arc<dyn CommandRunner>,
    rootfs: Option<Rootfs>,
}

impl Fedora {
    pub(crate) fn new(settings: DistroSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings,
            runner,
            rootfs: None,
        }
    }

    fn rootfs(&self) -> Result<&Rootfs> {
        super::require_rootfs(&self.rootfs)
    }

    fn release(&self) -> &str {
        self.settings.release.as_deref().unwrap_or(DEFAULT_RELEASE)
    }

    /// Run dnf against the image with `args` appended.
    fn dnf(&self, args: &[&str]) -> Result<()> {
        let root = self.rootfs()?.path().as_str();
        let mut argv = vec![
            "dnf",
            "-y",
            "--installroot",
            root,
            "--releasever",
            self.release(),
            "--setopt=install_weak_deps=False",
        ];
        argv.extend_from_slice(args);
        self.runner.run(&argv, false)?;
        Ok(())
    }
}

impl Distro for Fedora {
    fn long_name(&self) -> &'static str {
        super::DistroKind::Fedora.long_name()
    }

    fn set_rootfs(&mut self, rootfs: &Utf8Path) {
        self.rootfs = Some(Rootfs::new(rootfs));
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["dnf", "chroot", "systemctl"]
    }

    fn update_database(&mut self) -> Result<()> {
        self.dnf(&["makecache"])
    }

    #[context("Bootstrapping Fedora")]
    fn bootstrap(&mut self) -> Result<()> {
        let mut args = vec!["install"];
        for pkg in EXCLUDED_PACKAGES {
            args.extend(["--exclude", *pkg]);
        }
        args.push("@core");
        self.dnf(&args)
    }

    fn bootstrap_phase2(&mut self) -> Result<()> {
        let mut args = vec!["install"];
        args.extend_from_slice(PHASE2_PACKAGES);
        self.dnf(&args)?;
        self.rootfs()?
            .write_file("etc/fstab", &super::default_fstab())
    }

    fn setup_locale(&mut self) -> Result<()> {
        super::write_locale_conf(self.rootfs()?, &self.settings.locale)
    }

    #[context("Installing systemd-boot")]
    fn install_bootloader(&mut self) -> Result<()> {
        let rootfs = self.rootfs()?;
        self.runner.run(
            &[
                "chroot",
                rootfs.path().as_str(),
                "bootctl",
                "install",
                "--no-variables",
            ],
            false,
        )?;
        rootfs.write_file("etc/kernel/cmdline", &format!("{}\n", super::kernel_cmdline()))?;
        rootfs.write_file("etc/kernel/install.conf", "layout=bls\n")?;
        rootfs.write_file("boot/loader/loader.conf", "timeout 1\n")
    }

    fn install_kernel(&mut self) -> Result<()> {
        self.dnf(&["install", KERNEL_PACKAGE])
    }

    fn customize_image(&mut self) -> Result<()> {
        super::customize_common(&*self.runner, self.rootfs()?, "sshd.service")
    }

    fn setup_network(&mut self) -> Result<()> {
        super::setup_networkd(&*self.runner, self.rootfs()?)
    }
}
