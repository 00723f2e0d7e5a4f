//! Immutable descriptions of one external command call and its result.

use std::fmt;

/// Placeholder shown instead of secret arguments.
const MASK: &str = "******";

/// Maximum number of bytes of a captured stream rendered by
/// [`ProcessOutcome::stderr_excerpt`].
pub const MAX_EXCERPT_BYTES: usize = 4 * 1024;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// One external-tool call: command, ordered arguments and optional stdin.
///
/// Arguments added with [`secret_arg`](Self::secret_arg) are passed to the
/// child verbatim but masked in the [`Display`](fmt::Display) output, which
/// is what ends up in logs and error messages.
#[derive(Clone)]
pub struct ProcessInvocation {
    command: String,
    arguments: Vec<String>,
    secret_indexes: Vec<usize>,
    stdin: Option<Vec<u8>>,
}

impl ProcessInvocation {
    /// Start describing a call to `command` with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: Vec::new(),
            secret_indexes: Vec::new(),
            stdin: None,
        }
    }

    /// Append a plain argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Append several plain arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument that must never be displayed.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_indexes.push(self.arguments.len());
        self.arguments.push(arg.into());
        self
    }

    /// Bytes to feed to the child's standard input.
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Whether `arg` is present among the arguments.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.arguments.iter().any(|a| a == arg)
    }

    /// The argument following the first occurrence of `flag`, if any.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.arguments
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.arguments.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for (i, arg) in self.arguments.iter().enumerate() {
            if self.secret_indexes.contains(&i) {
                write!(f, " {MASK}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInvocation")
            .field("command_line", &self.to_string())
            .field("stdin_len", &self.stdin.as_ref().map(Vec::len))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Exit code plus everything the child wrote to stdout and stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code, or `-1` when the child was terminated by a signal.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as lossy UTF-8, cut to [`MAX_EXCERPT_BYTES`] for diagnostics.
    pub fn stderr_excerpt(&self) -> String {
        truncate_output(&self.stderr)
    }
}

/// Convert raw output to a lossy UTF-8 string of at most
/// [`MAX_EXCERPT_BYTES`] bytes of input, marking truncation.
fn truncate_output(raw: &[u8]) -> String {
    if raw.len() <= MAX_EXCERPT_BYTES {
        String::from_utf8_lossy(raw).trim_end().to_string()
    } else {
        let mut s = String::from_utf8_lossy(&raw[..MAX_EXCERPT_BYTES]).into_owned();
        s.push_str("... [truncated]");
        s
    }
}
