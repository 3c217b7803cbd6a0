//! # Disk image builder CLI
//!
//! Command line tool to build a bootable disk image of a Linux
//! distribution, in a file or directly on a block device.

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{CommandFactory, Parser};
use tokio::signal::unix::{signal, SignalKind};
use makedistro_blockdev::HostProbe;
use makedistro_utils::{CommandRunner, HostRunner};

use crate::distro::DistroKind;
use crate::install::{self, preflight, BuildConfig, Builder};
use crate::BuildError;

/// Create a bootable image of a Linux distribution.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "makedistro")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) struct Opt {
    /// List the available distributions and exit.
    #[clap(long, short = 'l')]
    pub(crate) list_distros: bool,

    /// The distribution to install.
    #[clap(long, short = 'd', value_enum)]
    pub(crate) distro: Option<DistroKind>,

    /// Target architecture, overriding the configured one.
    ///
    /// This selects the type of the root partition. Defaults to the host
    /// architecture.
    #[clap(long)]
    pub(crate) arch: Option<String>,

    /// Additional configuration file, applied after the system ones.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// File or block device in which the image is generated.
    ///
    /// A missing file is created; an existing one is truncated.
    pub(crate) image: Option<Utf8PathBuf>,
}

fn list_distros() {
    for d in DistroKind::all() {
        println!("{}:\t{}", d.name(), d.long_name());
    }
}

/// Run the build on a blocking thread until it finishes or we are
/// interrupted.
async fn build(opt: Opt, kind: DistroKind, image: Utf8PathBuf) -> Result<()> {
    let config = install::load_config(opt.config.as_deref())?;
    let config = BuildConfig::new(config, opt.arch)?;
    tracing::debug!("Using {config:?}");
    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);
    let distro = kind.instantiate(config.distro_settings(), runner.clone());
    preflight::require_root()?;
    preflight::check_host_tools(distro.required_tools())?;

    let owner = install::invoking_user(|k| std::env::var(k).ok());
    let builder = Builder::new(config, owner, runner, Arc::new(HostProbe));
    // Before anything is acquired
    let mut sigint = signal(SignalKind::interrupt()).context("Installing interrupt handler")?;
    let mut worker = {
        let builder = builder.clone();
        tokio::task::spawn_blocking(move || builder.run(distro, &image))
    };
    let finished = tokio::select! {
        r = &mut worker => Some(r),
        _ = sigint.recv() => None,
    };
    let r = match finished {
        Some(r) => r,
        None => {
            let interrupted = tokio::task::spawn_blocking(move || builder.interrupt())
                .await
                .context("Cleanup task")?;
            if interrupted {
                return Err(BuildError::Interrupted.into());
            }
            // Too late to stop; let the build report how it ended
            worker.await
        }
    };
    r.context("Build task")??;
    Ok(())
}

/// Whether `e` was already reported to the user while it happened.
pub fn error_is_reported(e: &anyhow::Error) -> bool {
    e.downcast_ref::<BuildError>().is_some()
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(mut opt: Opt) -> Result<()> {
    if opt.list_distros {
        list_distros();
        return Ok(());
    }
    let Some(image) = opt.image.take() else {
        eprintln!("{}", Opt::command().render_help());
        anyhow::bail!("Missing image argument");
    };
    let Some(kind) = opt.distro else {
        eprintln!("{}", Opt::command().render_help());
        anyhow::bail!("Missing distro argument");
    };
    build(opt, kind, image).await
}
