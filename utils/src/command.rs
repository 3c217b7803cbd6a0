//! Running external programs.
//!
//! Everything here takes an argument vector; nothing is ever passed
//! through a shell.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::process::{Command, ExitStatus, Stdio};

use crate::ArgvDisplay;

/// The outcome of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited successfully.
    pub success: bool,
    /// Standard output and standard error, interleaved as written.
    pub output: String,
}

/// An error from running an external command.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum CommandError {
    /// The command ran and exited unsuccessfully.
    #[error("Command `{}` failed: {}", display_argv(.argv), describe_exit(.exit_code))]
    Failed {
        argv: Vec<String>,
        exit_code: Option<i32>,
        output: String,
    },
    /// The command could not be started, or its output could not be read.
    #[error("Executing `{}`", display_argv(.argv))]
    Exec {
        argv: Vec<String>,
        #[source]
        source: std::io::Error,
    },
}

fn display_argv(argv: &[String]) -> ArgvDisplay<'_, String> {
    ArgvDisplay::new(argv)
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// The ability to run external programs, as used by the image builder.
///
/// This is a trait so that callers can be exercised without touching
/// the host.
pub trait CommandRunner: std::fmt::Debug + Send + Sync {
    /// Run a command and capture its combined output.
    ///
    /// A non-zero exit is an error, and the captured output is forwarded
    /// to stderr first. With `ignore_errors` set, a non-zero exit is instead
    /// reported through [`CommandOutput::success`] and nothing is forwarded;
    /// this is meant for best-effort steps such as unmounting something
    /// that may not be mounted. Failing to start the program is always an
    /// error.
    fn run(&self, argv: &[&str], ignore_errors: bool) -> Result<CommandOutput, CommandError>;

    /// Run a command and return only its standard output, decoded as UTF-8.
    fn run_capturing_stdout(&self, argv: &[&str]) -> Result<String, CommandError>;

    /// Run a command with `input` written to its standard input, returning
    /// the combined output.
    fn run_with_stdin(&self, argv: &[&str], input: &str) -> Result<String, CommandError>;
}

/// Runs commands as child processes of this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

fn owned(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| (*s).to_owned()).collect()
}

fn exec_error(argv: &[&str], source: std::io::Error) -> CommandError {
    CommandError::Exec {
        argv: owned(argv),
        source,
    }
}

fn new_command(argv: &[&str]) -> Result<Command, CommandError> {
    let Some((exe, args)) = argv.split_first() else {
        return Err(exec_error(
            argv,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argument vector"),
        ));
    };
    let mut cmd = Command::new(exe);
    cmd.args(args);
    // Default to noninteractive
    cmd.stdin(Stdio::null());
    tracing::debug!("exec: {}", ArgvDisplay::new(argv));
    Ok(cmd)
}

/// A pipe whose ends are not inherited by children spawned concurrently
/// from other threads.
fn output_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    Ok(rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)?)
}

/// Spawn `cmd` with stdout and stderr sharing a single pipe so the output
/// keeps its original interleaving, optionally feeding `input` on stdin.
fn combined_output(mut cmd: Command, input: Option<&str>) -> std::io::Result<(ExitStatus, String)> {
    let (reader, writer) = output_pipe()?;
    cmd.stdout(Stdio::from(writer.try_clone()?));
    cmd.stderr(Stdio::from(writer));
    if input.is_some() {
        cmd.stdin(Stdio::piped());
    }
    let mut child = cmd.spawn()?;
    // The command holds our copies of the write end; they must be closed
    // or the read below never sees EOF.
    drop(cmd);
    let stdin = child.stdin.take();
    let mut buf = Vec::new();
    std::thread::scope(|s| -> std::io::Result<()> {
        if let (Some(mut stdin), Some(input)) = (stdin, input) {
            s.spawn(move || {
                // A child exiting without reading all input is reported
                // through its exit status.
                let _ = stdin.write_all(input.as_bytes());
            });
        }
        File::from(reader).read_to_end(&mut buf)?;
        Ok(())
    })?;
    let status = child.wait()?;
    Ok((status, String::from_utf8_lossy(&buf).into_owned()))
}

fn finish(
    argv: &[&str],
    status: ExitStatus,
    output: String,
    ignore_errors: bool,
) -> Result<CommandOutput, CommandError> {
    if status.success() {
        tracing::trace!("{}: {output}", ArgvDisplay::new(argv));
        return Ok(CommandOutput {
            success: true,
            output,
        });
    }
    if ignore_errors {
        tracing::debug!("ignoring failure of {}: {status}", ArgvDisplay::new(argv));
        return Ok(CommandOutput {
            success: false,
            output,
        });
    }
    eprint!("{output}");
    Err(CommandError::Failed {
        argv: owned(argv),
        exit_code: status.code(),
        output,
    })
}

impl CommandRunner for HostRunner {
    fn run(&self, argv: &[&str], ignore_errors: bool) -> Result<CommandOutput, CommandError> {
        let cmd = new_command(argv)?;
        let (status, output) = combined_output(cmd, None).map_err(|e| exec_error(argv, e))?;
        finish(argv, status, output, ignore_errors)
    }

    fn run_capturing_stdout(&self, argv: &[&str]) -> Result<String, CommandError> {
        let mut cmd = new_command(argv)?;
        let o = cmd.output().map_err(|e| exec_error(argv, e))?;
        let stderr = String::from_utf8_lossy(&o.stderr);
        if !o.status.success() {
            let stdout = String::from_utf8_lossy(&o.stdout);
            let output = format!("{stdout}{stderr}");
            eprint!("{output}");
            return Err(CommandError::Failed {
                argv: owned(argv),
                exit_code: o.status.code(),
                output,
            });
        }
        if !stderr.is_empty() {
            tracing::trace!("{}: {stderr}", ArgvDisplay::new(argv));
        }
        String::from_utf8(o.stdout).map_err(|e| {
            exec_error(
                argv,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    fn run_with_stdin(&self, argv: &[&str], input: &str) -> Result<String, CommandError> {
        let cmd = new_command(argv)?;
        let (status, output) =
            combined_output(cmd, Some(input)).map_err(|e| exec_error(argv, e))?;
        finish(argv, status, output, false).map(|o| o.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(CommandRunner);

    #[test]
    fn test_output_pipe_cloexec() {
        let (reader, writer) = output_pipe().unwrap();
        for fd in [&reader, &writer] {
            let flags = rustix::io::fcntl_getfd(fd).unwrap();
            assert!(flags.contains(rustix::io::FdFlags::CLOEXEC));
        }
    }

    #[test]
    fn test_run_combined() {
        let o = HostRunner
            .run(&["sh", "-c", "echo out; echo err 1>&2; echo again"], false)
            .unwrap();
        assert!(o.success);
        similar_asserts::assert_eq!(o.output, "out\nerr\nagain\n");
    }

    #[test]
    fn test_run_failure() {
        let e = HostRunner
            .run(&["sh", "-c", "echo oops; exit 3"], false)
            .unwrap_err();
        match &e {
            CommandError::Failed {
                argv,
                exit_code,
                output,
            } => {
                assert_eq!(argv, &["sh", "-c", "echo oops; exit 3"]);
                assert_eq!(*exit_code, Some(3));
                assert_eq!(output, "oops\n");
            }
            o => panic!("unexpected error {o:?}"),
        }
        assert_eq!(
            e.to_string(),
            "Command `sh -c 'echo oops; exit 3'` failed: exit code 3"
        );
    }

    #[test]
    fn test_run_ignore_errors() {
        let o = HostRunner.run(&["false"], true).unwrap();
        assert!(!o.success);
        // Failing to start at all is never absorbed
        let e = HostRunner
            .run(&["/nonexistent/makedistro-test-binary"], true)
            .unwrap_err();
        assert!(matches!(e, CommandError::Exec { .. }));
    }

    #[test]
    fn test_empty_argv() {
        let e = HostRunner.run(&[], false).unwrap_err();
        assert!(matches!(e, CommandError::Exec { .. }));
    }

    #[test]
    fn test_capturing_stdout() {
        let s = HostRunner
            .run_capturing_stdout(&["sh", "-c", "echo hello; echo noise 1>&2"])
            .unwrap();
        assert_eq!(s, "hello\n");
        let e = HostRunner
            .run_capturing_stdout(&["sh", "-c", "exit 1"])
            .unwrap_err();
        assert!(matches!(
            e,
            CommandError::Failed {
                exit_code: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn test_with_stdin() {
        let input = "label: gpt\nsize=511MiB, name=ESP\n";
        let s = HostRunner.run_with_stdin(&["cat"], input).unwrap();
        assert_eq!(s, input);
        let e = HostRunner
            .run_with_stdin(&["sh", "-c", "cat; exit 2"], "x")
            .unwrap_err();
        assert!(matches!(
            e,
            CommandError::Failed {
                exit_code: Some(2),
                ..
            }
        ));
    }
}
