//! Integration tests for makedistro, run against a built binary and the host.
use camino::Utf8PathBuf;
use clap::Parser;

mod cli;
mod hostpriv;

#[derive(Debug, Parser)]
#[clap(name = "makedistro-integration-tests", version, rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Run the command line tests, which need no privileges
    Cli {
        /// Path to the makedistro binary
        bin: Utf8PathBuf,
        #[clap(flatten)]
        testargs: libtest_mimic::Arguments,
    },
    /// Run the tests which attach loop devices; these require root
    HostPrivileged {
        #[clap(flatten)]
        testargs: libtest_mimic::Arguments,
    },
}

fn main() {
    let opt = Opt::parse();
    let r = match opt {
        Opt::Cli { bin, testargs } => cli::run_cli(&bin, testargs),
        Opt::HostPrivileged { testargs } => hostpriv::run_hostpriv(testargs),
    };
    if let Err(e) = r {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
}
