//! Process runner error types.
//!
//! Every variant that refers to a command carries the *displayed* form of
//! the invocation, in which secret arguments are already masked.  Error
//! text is therefore safe to log.

/// Unified error type for subprocess execution.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The invocation had no arguments; the external tool always needs a
    /// subcommand.
    #[error("no arguments given for command `{command}`")]
    EmptyArguments { command: String },

    /// The child process could not be started (not found, permission
    /// denied, ...).
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// One of the three pipe tasks failed.  Only the first fault (in the
    /// order stdin, stdout, stderr) is reported.
    #[error("{stream} pipe failed for `{command}`: {reason}")]
    Pipe {
        command: String,
        stream: &'static str,
        reason: String,
    },

    /// Waiting for the exit status failed.
    #[error("failed to wait for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The child did not finish in time and was killed.
    #[error("`{command}` timed out after {seconds}s and was killed")]
    Timeout { command: String, seconds: u64 },
}

/// Convenience alias used throughout the process crate.
pub type Result<T> = std::result::Result<T, ProcessError>;
