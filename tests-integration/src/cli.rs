use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use libtest_mimic::Trial;
use xshell::cmd;

#[context("CLI tests")]
pub(crate) fn run_cli(bin: &Utf8Path, testargs: libtest_mimic::Arguments) -> Result<()> {
    // Just leak the path so we get a static reference as required by the test framework
    let bin: &'static str = String::from(bin.as_str()).leak();

    let tests = [
        Trial::test("list distros", move || {
            let sh = &xshell::Shell::new()?;
            let out = cmd!(sh, "{bin} --list-distros").read()?;
            assert_eq!(out, "arch:\tArchlinux\nfedora:\tFedora");
            Ok(())
        }),
        Trial::test("missing image", move || {
            let sh = &xshell::Shell::new()?;
            let out = cmd!(sh, "{bin} --distro arch").ignore_status().output()?;
            assert_eq!(out.status.code(), Some(1));
            let stderr = String::from_utf8_lossy(&out.stderr);
            assert!(stderr.contains("Missing image argument"), "{stderr}");
            assert!(stderr.contains("Usage:"), "{stderr}");
            assert!(out.stdout.is_empty());
            Ok(())
        }),
        Trial::test("unknown distro", move || {
            let sh = &xshell::Shell::new()?;
            let out = cmd!(sh, "{bin} --distro gentoo disk.img")
                .ignore_status()
                .output()?;
            assert!(!out.status.success());
            Ok(())
        }),
    ];

    libtest_mimic::run(&testargs, tests.into()).exit()
}
