//! Broker error types.
//!
//! All broker subsystems surface errors through [`BrokerError`].  Error text
//! carries command lines (with secret arguments masked), file paths and the
//! tool's stderr, never secret values.

use std::fmt;
use std::path::PathBuf;

use keybroker_process::ProcessError;

/// Which external-tool operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOperation {
    Encrypt,
    Decrypt,
    Version,
}

impl ToolOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Version => "version",
        }
    }
}

impl fmt::Display for ToolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the passphrase broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    // -- Configuration ------------------------------------------------------
    /// Missing, unreadable or invalid configuration.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The provider could not be initialised and refuses every operation.
    #[error("passphrase provider is not available: {reason}")]
    Unsupported { reason: String },

    // -- External tool ------------------------------------------------------
    /// The tool could not be run to completion (spawn, pipe, timeout).
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The tool ran but exited non-zero.
    #[error("tool {operation} failed: `{command}` exited with {exit_code}: {stderr}")]
    ToolFailed {
        operation: ToolOperation,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The tool's stdout was not the expected structured result.
    #[error("tool {operation} output could not be parsed: {reason}")]
    Parse {
        operation: ToolOperation,
        reason: String,
    },

    // -- Key files ----------------------------------------------------------
    /// No key file exists for the vault.
    #[error("no stored passphrase for vault `{vault_id}` (key file {} not found)", path.display())]
    NotFound { vault_id: String, path: PathBuf },

    /// Reading, writing or deleting a key file failed.
    #[error("key file {} {action} failed: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BrokerError {
    /// `true` when no passphrase is stored for the vault yet, as opposed to
    /// a stored passphrase that could not be recovered.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the broker crate.
pub type Result<T> = std::result::Result<T, BrokerError>;
