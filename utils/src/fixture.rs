//! Test doubles for code written against [`CommandRunner`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{CommandError, CommandOutput, CommandRunner};

/// A single command captured by [`RecordingRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The full argument vector.
    pub argv: Vec<String>,
    /// What was written to standard input, if anything.
    pub stdin: Option<String>,
}

impl Invocation {
    /// The argument vector joined with spaces, for easy comparison.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Success(String),
    Failure { exit_code: i32, output: String },
}

#[derive(Debug, Default)]
struct Inner {
    invocations: Vec<Invocation>,
    rules: Vec<(Vec<String>, Reply)>,
}

/// A [`CommandRunner`] that executes nothing. Every invocation is recorded;
/// commands succeed with empty output unless a reply was registered for a
/// matching argument prefix. Later registrations take precedence.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    inner: Mutex<Inner>,
}

impl RecordingRunner {
    /// Create a runner where every command succeeds silently.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_rule(&self, prefix: &[&str], reply: Reply) {
        let prefix = prefix.iter().map(|s| (*s).to_owned()).collect();
        self.lock().rules.push((prefix, reply));
    }

    /// Commands starting with `prefix` succeed and print `output`.
    pub fn reply(&self, prefix: &[&str], output: &str) {
        self.add_rule(prefix, Reply::Success(output.to_owned()))
    }

    /// Commands starting with `prefix` exit with `exit_code` after printing `output`.
    pub fn fail(&self, prefix: &[&str], exit_code: i32, output: &str) {
        self.add_rule(
            prefix,
            Reply::Failure {
                exit_code,
                output: output.to_owned(),
            },
        )
    }

    /// Everything run so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    /// Everything run so far as space-joined command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.lock()
            .invocations
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    fn dispatch(&self, argv: &[&str], stdin: Option<&str>) -> Result<Reply, CommandError> {
        let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
        if argv.is_empty() {
            return Err(CommandError::Exec {
                argv,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty argument vector",
                ),
            });
        }
        let mut inner = self.lock();
        let reply = inner
            .rules
            .iter()
            .rev()
            .find(|(prefix, _)| argv.starts_with(prefix))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Reply::Success(String::new()));
        inner.invocations.push(Invocation {
            argv,
            stdin: stdin.map(ToOwned::to_owned),
        });
        Ok(reply)
    }
}

fn failed(argv: &[&str], exit_code: i32, output: String) -> CommandError {
    CommandError::Failed {
        argv: argv.iter().map(|s| (*s).to_owned()).collect(),
        exit_code: Some(exit_code),
        output,
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[&str], ignore_errors: bool) -> Result<CommandOutput, CommandError> {
        match self.dispatch(argv, None)? {
            Reply::Success(output) => Ok(CommandOutput {
                success: true,
                output,
            }),
            Reply::Failure { output, .. } if ignore_errors => Ok(CommandOutput {
                success: false,
                output,
            }),
            Reply::Failure { exit_code, output } => Err(failed(argv, exit_code, output)),
        }
    }

    fn run_capturing_stdout(&self, argv: &[&str]) -> Result<String, CommandError> {
        match self.dispatch(argv, None)? {
            Reply::Success(output) => Ok(output),
            Reply::Failure { exit_code, output } => Err(failed(argv, exit_code, output)),
        }
    }

    fn run_with_stdin(&self, argv: &[&str], input: &str) -> Result<String, CommandError> {
        match self.dispatch(argv, Some(input))? {
            Reply::Success(output) => Ok(output),
            Reply::Failure { exit_code, output } => Err(failed(argv, exit_code, output)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording() {
        let r = RecordingRunner::new();
        r.reply(&["losetup", "--find"], "/dev/loop3\n");
        r.fail(&["umount"], 32, "not mounted");
        assert_eq!(
            r.run_capturing_stdout(&["losetup", "--find", "--show", "/x"])
                .unwrap(),
            "/dev/loop3\n"
        );
        assert!(!r.run(&["umount", "/mnt"], true).unwrap().success);
        assert!(r.run(&["umount", "/mnt"], false).is_err());
        assert!(r.run(&["mount", "/dev/a", "/mnt"], false).unwrap().success);
        r.run_with_stdin(&["sfdisk", "/dev/loop3"], "label: gpt\n")
            .unwrap();
        assert_eq!(
            r.command_lines(),
            [
                "losetup --find --show /x",
                "umount /mnt",
                "umount /mnt",
                "mount /dev/a /mnt",
                "sfdisk /dev/loop3"
            ]
        );
        assert_eq!(
            r.invocations().last().unwrap().stdin.as_deref(),
            Some("label: gpt\n")
        );
    }

    #[test]
    fn test_later_rules_win() {
        let r = RecordingRunner::new();
        r.fail(&["findmnt"], 1, "");
        r.reply(&["findmnt"], "TARGET\n");
        assert!(r.run(&["findmnt", "/boot"], false).unwrap().success);
    }
}
