use std::fmt::Display;

/// Helper to format an argument vector the way a POSIX shell would
/// read it back.
#[derive(Debug)]
pub struct ArgvDisplay<'a, S> {
    argv: &'a [S],
}

fn is_plain(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            matches!(c, '/' | '.' | '-' | '_' | '=' | ',' | ':' | '@' | '+') || c.is_alphanumeric()
        })
}

impl<S: AsRef<str>> Display for ArgvDisplay<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let arg = arg.as_ref();
            if is_plain(arg) {
                f.write_str(arg)?;
                continue;
            }
            match shlex::try_quote(arg) {
                Ok(quoted) => f.write_str(&quoted)?,
                // Only happens with embedded NUL, which can't reach execve anyway
                Err(_) => write!(f, "{arg:?}")?,
            }
        }
        Ok(())
    }
}

impl<'a, S: AsRef<str>> ArgvDisplay<'a, S> {
    /// Given an argument vector, quote each element so that the result
    /// could be pasted into a shell. Arguments without spaces or shell
    /// meta-characters are emitted unchanged.
    pub fn new(argv: &'a [S]) -> Self {
        ArgvDisplay { argv }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquoted() {
        let argv = ["mount", "--bind", "/proc", "/tmp/make-distro-x1/proc"];
        assert_eq!(
            "mount --bind /proc /tmp/make-distro-x1/proc",
            ArgvDisplay::new(&argv).to_string()
        );
        let argv = ["dd", "if=/dev/zero", "of=/dev/loop0", "bs=1M", "count=4"];
        assert_eq!(
            "dd if=/dev/zero of=/dev/loop0 bs=1M count=4",
            ArgvDisplay::new(&argv).to_string()
        );
    }

    #[test]
    fn test_quoted() {
        let cases: &[(&[&str], &str)] = &[
            (&["echo", ""], "echo ''"),
            (
                &["ls", "/some/path with spaces/"],
                "ls '/some/path with spaces/'",
            ),
            (&["touch", "/foo/!/bar&"], "touch '/foo/!/bar&'"),
            (
                &["cat", r#"/path/"withquotes'"#],
                r#"cat "/path/\"withquotes'""#,
            ),
        ];
        for (argv, quoted) in cases {
            assert_eq!(*quoted, ArgvDisplay::new(argv).to_string());
        }
    }

    #[test]
    fn test_owned_strings() {
        let argv: Vec<String> = ["pacstrap", "-c", "/mnt root"]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect();
        assert_eq!(
            "pacstrap -c '/mnt root'",
            ArgvDisplay::new(&argv).to_string()
        );
    }
}
