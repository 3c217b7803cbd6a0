//! Arch Linux, bootstrapped with `pacstrap`.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use indoc::formatdoc;
use makedistro_utils::{CommandError, CommandRunner};
use regex::RegexSet;

use super::{Distro, DistroSettings, Rootfs};

/// Members of the `base` group which are never installed: the kernel
/// comes later, and the image has no use for RAID, LVM, encryption, other
/// filesystems, documentation or the legacy network managers.
const EXCLUDED_PACKAGES: &[&str] = &[
    "^linux$",
    "^mdadm",
    "^lvm2",
    "^cryptsetup",
    "^device-mapper",
    "^xfsprogs",
    "^reiserfsprogs",
    "^jfsutils",
    "^man-pages",
    "^man-db",
    "^pcmciautils",
    "^inetutils",
    "^dhcpcd",
    "^netctl",
    "^s-nail",
];

const BASE_GROUP: &str = "base";
/// What pacman prints for a group that does not exist.
const TARGET_NOT_FOUND: &str = "target not found";
const PHASE2_PACKAGES: &[&str] = &["mkinitcpio", "bash-completion", "openssh"];
const KERNEL_PACKAGE: &str = "linux";

/// Package names from `pacman -Sg` output, which is one `<group> <package>`
/// pair per line.
fn parse_group_listing(group: &str, listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(g), Some(pkg), None) if g == group => Some(pkg.to_owned()),
                _ => None,
            }
        })
        .collect()
}

/// Drop every package matching [`EXCLUDED_PACKAGES`], keeping the order of
/// the rest.
pub(crate) fn filter_packages(pkgs: Vec<String>) -> Result<Vec<String>> {
    let excluded = RegexSet::new(EXCLUDED_PACKAGES)?;
    Ok(pkgs.into_iter().filter(|p| !excluded.is_match(p)).collect())
}

fn charset_of(locale: &str) -> &str {
    locale.split_once('.').map(|(_, c)| c).unwrap_or("UTF-8")
}

#[derive(Debug)]
pub(crate) struct Arch {
    settings: DistroSettings,
    runner: Arc<dyn CommandRunner>,
    rootfs: Option<Rootfs>,
}

impl Arch {
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

    fn pacman_install(&self, pkgs: &[&str]) -> Result<()> {
        let root = self.rootfs()?.path().as_str();
        let mut argv = vec!["pacman", "--root", root, "--noconfirm", "-S"];
        argv.extend_from_slice(pkgs);
        self.runner.run(&argv, false)?;
        Ok(())
    }

    /// The members of the base group to install.
    fn base_packages(&self) -> Result<Vec<String>> {
        let listing = match self.runner.run_capturing_stdout(&["pacman", "-Sg", BASE_GROUP]) {
            Ok(listing) => listing,
            Err(CommandError::Failed { output, .. }) if output.contains(TARGET_NOT_FOUND) => {
                String::new()
            }
            Err(e) => return Err(e).context("Listing the base group"),
        };
        let pkgs = filter_packages(parse_group_listing(BASE_GROUP, &listing))?;
        if pkgs.is_empty() {
            // Current Arch ships base as a meta package rather than a group
            tracing::debug!("No {BASE_GROUP} group; installing the {BASE_GROUP} package");
            return Ok(vec![BASE_GROUP.to_owned()]);
        }
        Ok(pkgs)
    }

    fn loader_entry(&self, title: &str, initrd: &str) -> String {
        formatdoc! {"
            title    {title}
            options  {cmdline}
            linux    /vmlinuz-{KERNEL_PACKAGE}
            initrd   /{initrd}
        ", cmdline = super::kernel_cmdline()}
    }
}

impl Distro for Arch {
    fn long_name(&self) -> &'static str {
        super::DistroKind::Arch.long_name()
    }

    fn set_rootfs(&mut self, rootfs: &Utf8Path) {
        self.rootfs = Some(Rootfs::new(rootfs));
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["pacman", "pacstrap", "chroot", "systemctl"]
    }

    fn update_database(&mut self) -> Result<()> {
        self.runner.run(&["pacman", "-Sy"], false)?;
        Ok(())
    }

    #[context("Bootstrapping Arch Linux")]
    fn bootstrap(&mut self) -> Result<()> {
        let root = self.rootfs()?.path();
        let pkgs = self.base_packages()?;
        tracing::debug!("Base packages: {pkgs:?}");
        let mut argv = vec!["pacstrap", "-c", root.as_str()];
        argv.extend(pkgs.iter().map(String::as_str));
        self.runner.run(&argv, false)?;
        Ok(())
    }

    fn bootstrap_phase2(&mut self) -> Result<()> {
        self.pacman_install(PHASE2_PACKAGES)?;
        self.rootfs()?
            .write_file("etc/fstab", &super::default_fstab())
    }

    #[context("Generating locales")]
    fn setup_locale(&mut self) -> Result<()> {
        let rootfs = self.rootfs()?;
        let locale = self.settings.locale.as_str();
        let charset = charset_of(locale);
        rootfs.write_file("etc/locale.gen", &format!("{locale} {charset}\n"))?;
        self.runner
            .run(&["chroot", rootfs.path().as_str(), "locale-gen"], false)?;
        super::write_locale_conf(rootfs, locale)
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
        let default = self.loader_entry("Arch Linux", &format!("initramfs-{KERNEL_PACKAGE}.img"));
        let fallback = self.loader_entry(
            "Arch Linux Fallback Initrd",
            &format!("initramfs-{KERNEL_PACKAGE}-fallback.img"),
        );
        rootfs.write_file("boot/loader/entries/arch.conf", &default)?;
        rootfs.write_file("boot/loader/entries/arch-fallback.conf", &fallback)?;
        rootfs
            .write_file("boot/loader/loader.conf", "timeout 1\ndefault arch-fallback\n")
            .context("Writing loader configuration")
    }

    fn install_kernel(&mut self) -> Result<()> {
        self.pacman_install(&[KERNEL_PACKAGE])
    }

    fn customize_image(&mut self) -> Result<()> {
        super::customize_common(&*self.runner, self.rootfs()?, "sshd.service")
    }

    fn setup_network(&mut self) -> Result<()> {
        super::setup_networkd(&*self.runner, self.rootfs()?)
    }
}
