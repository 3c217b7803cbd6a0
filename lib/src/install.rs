//! # Building an image
//!
//! A build is a strictly ordered pipeline of [`Stage`]s. What it has
//! acquired so far (the device, its partitions, the mounts) is kept in a
//! [`BuildState`] shared with the interrupt handler, and is released again
//! on every exit path.

mod config;
pub(crate) mod preflight;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context};
use camino::Utf8Path;
use makedistro_blockdev::{BlockProbe, BuildTarget, PartitionMap};
use makedistro_utils::{CommandError, CommandRunner};

pub(crate) use config::{load_config, BuildConfig};

use crate::distro::{Distro, DistroStep};
use crate::mount::{self, MountMap};
use crate::notify;

/// Progress of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Idle,
    DeviceReady,
    Partitioned,
    RootMounted,
    DatabaseUpdated,
    Bootstrapped,
    KernelFsMounted,
    Phase2Done,
    Configured,
    Finalized,
    Aborting,
    CleanedUp,
}

/// Why a build failed.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum BuildError {
    #[error(transparent)]
    Device(#[from] makedistro_blockdev::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Step {step} failed")]
    InstallStepFailed {
        step: DistroStep,
        #[source]
        cause: anyhow::Error,
    },
    #[error("Interrupted")]
    Interrupted,
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// An error and all of its causes on one line.
fn describe_error(e: &dyn std::error::Error) -> String {
    let mut r = e.to_string();
    let mut cause = e.source();
    while let Some(c) = cause {
        r.push_str(": ");
        r.push_str(&c.to_string());
        cause = c.source();
    }
    r
}

/// The unprivileged user a finished image file is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Owner {
    uid: u32,
    gid: Option<u32>,
}

/// The user who invoked us through sudo, from `SUDO_UID` and `SUDO_GID`.
pub(crate) fn invoking_user(lookup: impl Fn(&str) -> Option<String>) -> Option<Owner> {
    let parse = |name: &str| {
        let v = lookup(name)?;
        match v.parse::<u32>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!("Ignoring invalid {name}={v:?}");
                None
            }
        }
    };
    let uid = parse("SUDO_UID")?;
    Some(Owner {
        uid,
        gid: parse("SUDO_GID"),
    })
}

/// Everything a build has acquired, shared with the interrupt handler.
#[derive(Debug)]
pub(crate) struct BuildState {
    stage: Stage,
    interrupted: bool,
    target: Option<BuildTarget>,
    partitions: Option<PartitionMap>,
    mounts: MountMap,
}

impl BuildState {
    fn new() -> Self {
        Self {
            stage: Stage::Idle,
            interrupted: false,
            target: None,
            partitions: None,
            mounts: MountMap::default(),
        }
    }

    fn advance(&mut self, to: Stage) {
        tracing::debug!("Stage {:?} -> {to:?}", self.stage);
        self.stage = to;
    }
}

/// Drives one build. Clones share the same state, so one can be handed to
/// an interrupt handler while another runs the pipeline.
#[derive(Debug, Clone)]
pub(crate) struct Builder {
    state: Arc<Mutex<BuildState>>,
    config: BuildConfig,
    owner: Option<Owner>,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn BlockProbe>,
}

impl Builder {
    pub(crate) fn new(
        config: BuildConfig,
        owner: Option<Owner>,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn BlockProbe>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(BuildState::new())),
            config,
            owner,
            runner,
            probe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn stage(&self) -> Stage {
        self.lock().stage
    }

    /// Run `f` with the state locked, unless the build was interrupted.
    fn locked<T>(
        &self,
        f: impl FnOnce(&mut BuildState) -> Result<T, BuildError>,
    ) -> Result<T, BuildError> {
        let mut st = self.lock();
        if st.interrupted {
            return Err(BuildError::Interrupted);
        }
        f(&mut st)
    }

    fn advance(&self, to: Stage) -> Result<(), BuildError> {
        self.locked(|st| {
            st.advance(to);
            Ok(())
        })
    }

    /// Run a single plugin step. The state stays unlocked meanwhile, as
    /// steps can take a long time.
    fn step(&self, distro: &mut dyn Distro, step: DistroStep) -> Result<(), BuildError> {
        self.locked(|_| Ok(()))?;
        notify::info(&step.banner(distro.long_name()));
        tracing::debug!("Running step {step}");
        distro
            .run_step(step)
            .map_err(|cause| BuildError::InstallStepFailed { step, cause })
    }

    fn run_pipeline(&self, distro: &mut dyn Distro, image: &Utf8Path) -> Result<(), BuildError> {
        let runner = &*self.runner;
        let probe = &*self.probe;

        notify::info(&format!("Setting up device for {image}"));
        let target = self.locked(|st| {
            let target =
                makedistro_blockdev::resolve(image, self.config.image_size_mib, runner, probe)?;
            Ok(st.target.insert(target).clone())
        })?;
        notify::info(&format!("Erasing {}", target.device));
        makedistro_blockdev::wipe(&target, runner)?;
        self.advance(Stage::DeviceReady)?;

        notify::info("Creating partitions");
        // Unlocked: waiting for udev can take a while
        let partitions = makedistro_blockdev::partition(&target, &self.config.arch, runner, probe)?;
        self.locked(|st| {
            st.partitions = Some(partitions.clone());
            Ok(())
        })?;
        makedistro_blockdev::format_partitions(&partitions, runner)?;
        self.advance(Stage::Partitioned)?;

        notify::info("Mounting partitions");
        let rootfs = self.locked(|st| {
            let partitions = st
                .partitions
                .as_ref()
                .ok_or_else(|| anyhow!("Partitions not created"))?;
            mount::mount_root(&mut st.mounts, partitions, runner)?;
            st.advance(Stage::RootMounted);
            let root = st
                .mounts
                .root()
                .ok_or_else(|| anyhow!("Root directory missing after mount"))?;
            Ok(root.to_owned())
        })?;
        distro.set_rootfs(&rootfs);

        self.step(distro, DistroStep::UpdateDatabase)?;
        self.advance(Stage::DatabaseUpdated)?;
        self.step(distro, DistroStep::Bootstrap)?;
        self.advance(Stage::Bootstrapped)?;

        notify::info("Mounting kernel filesystems");
        self.locked(|st| {
            mount::mount_kernel_filesystems(&mut st.mounts, runner)?;
            st.advance(Stage::KernelFsMounted);
            Ok(())
        })?;

        self.step(distro, DistroStep::BootstrapPhase2)?;
        self.advance(Stage::Phase2Done)?;
        for step in [
            DistroStep::SetupLocale,
            DistroStep::InstallBootloader,
            DistroStep::InstallKernel,
            DistroStep::CustomizeImage,
            DistroStep::SetupNetwork,
        ] {
            self.step(distro, step)?;
        }
        self.advance(Stage::Configured)?;

        self.finalize(&target)?;
        self.advance(Stage::Finalized)
    }

    /// Flush everything to disk and hand an image file to the user who
    /// asked for it.
    fn finalize(&self, target: &BuildTarget) -> Result<(), BuildError> {
        notify::info("Finishing installation");
        self.runner.run(&["sync"], false)?;
        if !target.loop_backed {
            return Ok(());
        }
        if let Some(owner) = self.owner {
            let image = &target.image_path;
            tracing::debug!("Changing owner of {image} to {owner:?}");
            std::os::unix::fs::chown(image, Some(owner.uid), owner.gid)
                .with_context(|| format!("Changing owner of {image}"))?;
        }
        Ok(())
    }

    /// Build the image at `image` with `distro`, releasing everything
    /// acquired on the way whether or not it succeeds.
    pub(crate) fn run(&self, mut distro: Box<dyn Distro>, image: &Utf8Path) -> Result<(), BuildError> {
        let r = self.run_pipeline(distro.as_mut(), image);
        let interrupted = self.lock().interrupted;
        match r {
            Ok(()) => {
                self.cleanup();
                notify::notice(&format!("Image generated successfully: {image}"));
                Ok(())
            }
            // The interrupt handler has reported and cleaned up already
            Err(_) if interrupted => {
                self.cleanup();
                Err(BuildError::Interrupted)
            }
            Err(e) => {
                notify::error(&describe_error(&e));
                self.cleanup();
                notify::error("FAILED TO GENERATE IMAGE");
                Err(e)
            }
        }
    }

    /// Stop the build: the pipeline does not proceed past its current
    /// step, and everything acquired is released now.
    ///
    /// Returns `false` and does nothing if the build already got past
    /// finalization; the pipeline then reports its own outcome.
    pub(crate) fn interrupt(&self) -> bool {
        {
            let mut st = self.lock();
            if matches!(st.stage, Stage::Finalized | Stage::CleanedUp) {
                tracing::debug!("Ignoring interrupt at stage {:?}", st.stage);
                return false;
            }
            st.interrupted = true;
        }
        notify::warn("Interrupted, cleaning up");
        self.cleanup();
        notify::error("FAILED TO GENERATE IMAGE");
        true
    }

    /// Unmount, remove the root directory and detach the loop device, in
    /// that order. Each action is best-effort. Safe to call at any point and
    /// more than once.
    pub(crate) fn cleanup(&self) {
        let mut st = self.lock();
        if st.stage == Stage::CleanedUp {
            return;
        }
        if st.stage != Stage::Finalized {
            st.advance(Stage::Aborting);
        }
        mount::teardown(&mut st.mounts, &*self.runner);
        if let Some(target) = st.target.as_mut() {
            if let Err(e) = target.release(&*self.runner) {
                tracing::warn!("Failed to release {}: {e}", target.device);
            }
        }
        st.advance(Stage::CleanedUp);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use std::sync::OnceLock;

    use anyhow::Result;
    use camino::Utf8PathBuf;
    use makedistro_blockdev::StaticProbe;
    use makedistro_utils::{CommandOutput, RecordingRunner};

    use super::*;

    type Hook = Box<dyn FnMut() + Send>;

    /// Records calls, and fails or runs a hook at chosen steps.
    #[derive(Default)]
    struct FakeDistro {
        calls: Arc<Mutex<Vec<String>>>,
        rootfs: Arc<Mutex<Option<Utf8PathBuf>>>,
        fail_at: Option<DistroStep>,
        hooks: HashMap<&'static str, Hook>,
    }

    impl std::fmt::Debug for FakeDistro {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FakeDistro")
                .field("fail_at", &self.fail_at)
                .finish_non_exhaustive()
        }
    }

    impl FakeDistro {
        fn call(&mut self, step: DistroStep) -> Result<()> {
            self.calls.lock().unwrap().push(step.to_string());
            if let Some(hook) = self.hooks.get_mut(step.as_str()) {
                hook();
            }
            if self.fail_at == Some(step) {
                anyhow::bail!("{step} exploded");
            }
            Ok(())
        }
    }

    impl Distro for FakeDistro {
        fn long_name(&self) -> &'static str {
            "Fake"
        }
        fn set_rootfs(&mut self, rootfs: &Utf8Path) {
            *self.rootfs.lock().unwrap() = Some(rootfs.to_owned());
        }
        fn required_tools(&self) -> &'static [&'static str] {
            &[]
        }
        fn update_database(&mut self) -> Result<()> {
            self.call(DistroStep::UpdateDatabase)
        }
        fn bootstrap(&mut self) -> Result<()> {
            self.call(DistroStep::Bootstrap)
        }
        fn bootstrap_phase2(&mut self) -> Result<()> {
            self.call(DistroStep::BootstrapPhase2)
        }
        fn setup_locale(&mut self) -> Result<()> {
            self.call(DistroStep::SetupLocale)
        }
        fn install_bootloader(&mut self) -> Result<()> {
            self.call(DistroStep::InstallBootloader)
        }
        fn install_kernel(&mut self) -> Result<()> {
            self.call(DistroStep::InstallKernel)
        }
        fn customize_image(&mut self) -> Result<()> {
            self.call(DistroStep::CustomizeImage)
        }
        fn setup_network(&mut self) -> Result<()> {
            self.call(DistroStep::SetupNetwork)
        }
    }

    static_assertions::assert_impl_all!(Builder: Send, Sync, Clone);

    struct Fixture {
        _td: tempfile::TempDir,
        image: Utf8PathBuf,
        runner: Arc<RecordingRunner>,
        builder: Builder,
    }

    fn fixture() -> Fixture {
        let td = tempfile::tempdir().unwrap();
        let image = Utf8Path::from_path(td.path()).unwrap().join("disk.img");
        let runner = Arc::new(RecordingRunner::new());
        runner.reply(&["losetup", "--find"], "/dev/loop7\n");
        let probe = StaticProbe::new(["/dev/loop7", "/dev/loop7p1", "/dev/loop7p2"]);
        let config = BuildConfig {
            arch: "x86_64".into(),
            image_size_mib: 16,
            locale: "en_US.UTF-8".into(),
            release: None,
        };
        let builder = Builder::new(config, None, runner.clone(), Arc::new(probe));
        Fixture {
            _td: td,
            image,
            runner,
            builder,
        }
    }

    fn unmounts(runner: &RecordingRunner, root: &Utf8Path) -> Vec<String> {
        runner
            .command_lines()
            .into_iter()
            .filter_map(|l| {
                l.strip_prefix("umount ")
                    .map(|t| t.strip_prefix(root.as_str()).unwrap_or(t).to_owned())
            })
            .collect()
    }

    #[test]
    fn test_build_success() {
        let f = fixture();
        let distro = FakeDistro::default();
        let calls = distro.calls.clone();
        let rootfs = distro.rootfs.clone();
        f.builder.run(Box::new(distro), &f.image).unwrap();

        let calls = calls.lock().unwrap().clone();
        let expected: Vec<_> = DistroStep::ALL.iter().map(|s| s.to_string()).collect();
        assert_eq!(calls, expected);
        assert_eq!(f.builder.stage(), Stage::CleanedUp);

        let root = rootfs.lock().unwrap().clone().unwrap();
        assert!(!root.exists());
        let lines = f.runner.command_lines();
        assert_eq!(
            lines[..3],
            [
                format!("losetup --find --show --partscan {}", f.image),
                "wipefs -a /dev/loop7".to_string(),
                "dd if=/dev/zero of=/dev/loop7 bs=1M count=4".to_string(),
            ]
        );
        let sync = lines.iter().position(|l| l == "sync").unwrap();
        let first_umount = lines.iter().position(|l| l.starts_with("umount")).unwrap();
        assert!(sync < first_umount);
        assert_eq!(lines.last().unwrap(), "losetup -d /dev/loop7");
        let sfdisk = &f.runner.invocations()[3];
        assert_eq!(sfdisk.command_line(), "sfdisk /dev/loop7");
        assert!(sfdisk
            .stdin
            .as_deref()
            .unwrap()
            .contains("4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709"));
    }

    #[test]
    fn test_bootstrap_failure() {
        let f = fixture();
        let distro = FakeDistro {
            fail_at: Some(DistroStep::Bootstrap),
            ..Default::default()
        };
        let calls = distro.calls.clone();
        let rootfs = distro.rootfs.clone();
        let e = f.builder.run(Box::new(distro), &f.image).unwrap_err();
        assert!(matches!(
            e,
            BuildError::InstallStepFailed {
                step: DistroStep::Bootstrap,
                ..
            }
        ));
        assert_eq!(
            describe_error(&e),
            "Step bootstrap failed: bootstrap exploded"
        );
        assert_eq!(*calls.lock().unwrap(), ["update-database", "bootstrap"]);
        assert_eq!(f.builder.stage(), Stage::CleanedUp);

        let root = rootfs.lock().unwrap().clone().unwrap();
        assert_eq!(unmounts(&f.runner, &root), ["/boot", ""]);
        assert!(!root.exists());
        assert_eq!(
            f.runner.command_lines().last().unwrap(),
            "losetup -d /dev/loop7"
        );

        // Cleaning up again does nothing
        let n = f.runner.invocations().len();
        f.builder.cleanup();
        assert_eq!(f.runner.invocations().len(), n);
    }

    #[test]
    fn test_interrupt_with_kernel_filesystems() {
        let f = fixture();
        let mut distro = FakeDistro::default();
        let calls = distro.calls.clone();
        let rootfs = distro.rootfs.clone();
        let seen_stage = Arc::new(Mutex::new(None));
        let hook: Hook = {
            let builder = f.builder.clone();
            let seen_stage = seen_stage.clone();
            Box::new(move || {
                *seen_stage.lock().unwrap() = Some(builder.stage());
                assert!(builder.interrupt());
            })
        };
        distro.hooks.insert("bootstrap-phase2", hook);

        let e = f.builder.run(Box::new(distro), &f.image).unwrap_err();
        assert!(matches!(e, BuildError::Interrupted));
        assert_eq!(*seen_stage.lock().unwrap(), Some(Stage::KernelFsMounted));
        assert_eq!(
            *calls.lock().unwrap(),
            ["update-database", "bootstrap", "bootstrap-phase2"]
        );
        assert_eq!(f.builder.stage(), Stage::CleanedUp);

        let root = rootfs.lock().unwrap().clone().unwrap();
        assert_eq!(
            unmounts(&f.runner, &root),
            ["/run", "/sys", "/dev", "/proc", "/boot", ""]
        );
        assert!(!root.exists());
        let lines = f.runner.command_lines();
        assert_eq!(lines.last().unwrap(), "losetup -d /dev/loop7");
        assert!(!lines.iter().any(|l| l == "sync"));
    }

    #[test]
    fn test_interrupt_after_success() {
        let f = fixture();
        f.builder.run(Box::new(FakeDistro::default()), &f.image).unwrap();
        let n = f.runner.invocations().len();
        assert!(!f.builder.interrupt());
        assert_eq!(f.runner.invocations().len(), n);
        assert_eq!(f.builder.stage(), Stage::CleanedUp);
        assert!(!f.builder.lock().interrupted);
    }

    /// Interrupts the build from the thread running it, once `udevadm`
    /// has run.
    #[derive(Debug)]
    struct InterruptingRunner {
        inner: RecordingRunner,
        builder: OnceLock<Builder>,
    }

    impl CommandRunner for InterruptingRunner {
        fn run(&self, argv: &[&str], ignore_errors: bool) -> Result<CommandOutput, CommandError> {
            let r = self.inner.run(argv, ignore_errors);
            if argv[0] == "udevadm" {
                // Deadlocks if the build state is held across the command
                assert!(self.builder.get().unwrap().interrupt());
            }
            r
        }
        fn run_capturing_stdout(&self, argv: &[&str]) -> Result<String, CommandError> {
            self.inner.run_capturing_stdout(argv)
        }
        fn run_with_stdin(&self, argv: &[&str], input: &str) -> Result<String, CommandError> {
            self.inner.run_with_stdin(argv, input)
        }
    }

    #[test]
    fn test_interrupt_while_partitioning() {
        let td = tempfile::tempdir().unwrap();
        let image = Utf8Path::from_path(td.path()).unwrap().join("disk.img");
        let runner = Arc::new(InterruptingRunner {
            inner: RecordingRunner::new(),
            builder: OnceLock::new(),
        });
        runner.inner.reply(&["losetup", "--find"], "/dev/loop7\n");
        let probe = StaticProbe::new(["/dev/loop7", "/dev/loop7p1", "/dev/loop7p2"]);
        let config = BuildConfig {
            arch: "x86_64".into(),
            image_size_mib: 16,
            locale: "en_US.UTF-8".into(),
            release: None,
        };
        let builder = Builder::new(config, None, runner.clone(), Arc::new(probe));
        runner.builder.set(builder.clone()).unwrap();

        let distro = FakeDistro::default();
        let calls = distro.calls.clone();
        let e = builder.run(Box::new(distro), &image).unwrap_err();
        assert!(matches!(e, BuildError::Interrupted));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(builder.stage(), Stage::CleanedUp);
        let lines = runner.inner.command_lines();
        assert_eq!(
            lines[lines.len() - 2..],
            ["udevadm settle", "losetup -d /dev/loop7"]
        );
        assert!(!lines.iter().any(|l| l.starts_with("mkfs")));
    }

    #[test]
    fn test_device_failure() {
        let f = fixture();
        f.runner.fail(&["losetup", "--find"], 1, "losetup: cannot find an unused loop device");
        let distro = FakeDistro::default();
        let calls = distro.calls.clone();
        let e = f.builder.run(Box::new(distro), &f.image).unwrap_err();
        assert!(matches!(e, BuildError::Device(_)));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(f.builder.stage(), Stage::CleanedUp);
        assert_eq!(f.runner.invocations().len(), 1);
    }

    #[test]
    fn test_invoking_user() {
        let env = |vars: &'static [(&'static str, &'static str)]| {
            move |k: &str| {
                vars.iter()
                    .find(|(name, _)| *name == k)
                    .map(|(_, v)| (*v).to_owned())
            }
        };
        assert_eq!(invoking_user(env(&[])), None);
        assert_eq!(
            invoking_user(env(&[("SUDO_UID", "1000"), ("SUDO_GID", "1001")])),
            Some(Owner {
                uid: 1000,
                gid: Some(1001)
            })
        );
        assert_eq!(
            invoking_user(env(&[("SUDO_UID", "1000")])),
            Some(Owner {
                uid: 1000,
                gid: None
            })
        );
        assert_eq!(invoking_user(env(&[("SUDO_UID", "root")])), None);
        assert_eq!(invoking_user(env(&[("SUDO_GID", "1000")])), None);
    }
}
