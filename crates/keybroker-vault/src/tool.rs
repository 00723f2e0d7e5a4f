//! Invocation building and output parsing for the external `tinyencrypt`
//! tool.
//!
//! The broker talks to the tool through three subcommands:
//!
//! ```text
//! <command> version
//! <command> simple-encrypt --key-filter <keyId> --value-stdin
//!           [--with-pbkdf-encryption (--password <p> | --outputs-password)]
//!           [--direct-output]
//! <command> simple-decrypt --value-stdin
//!           (--pin #INPUT# (--password <p> | --outputs-password) | --direct-output)
//! ```
//!
//! In structured mode stdout is zero or more informational log lines
//! followed by a JSON record `{"result": "...", "password": "..."}`.  In
//! direct-output mode stdout is the bare result.

use std::fmt;

use keybroker_process::ProcessInvocation;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result, ToolOperation};

/// Prefixes of informational lines the tool mixes into stdout.
pub const LOG_LINE_MARKERS: &[&str] = &["[INFO ]", "[WARN ]", "[DEBUG]"];

/// Tells the tool to prompt for the PIN interactively.
pub const PIN_FROM_INPUT: &str = "#INPUT#";

// ---------------------------------------------------------------------------
// Derived-password handling
// ---------------------------------------------------------------------------

/// What the tool is told about the derived (PBKDF) password.
pub enum DerivedPassword {
    /// No derived-password arguments at all.
    Omit,
    /// Pass a cached derived password with `--password`.
    Reuse(SecretString),
    /// Ask the tool to output a newly derived password.
    Request,
}

impl DerivedPassword {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request)
    }

    fn append_to(&self, invocation: ProcessInvocation) -> ProcessInvocation {
        match self {
            Self::Omit => invocation,
            Self::Reuse(password) => invocation
                .arg("--password")
                .secret_arg(password.expose_secret()),
            Self::Request => invocation.arg("--outputs-password"),
        }
    }
}

impl fmt::Debug for DerivedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Omit => f.write_str("Omit"),
            Self::Reuse(_) => f.write_str("Reuse(******)"),
            Self::Request => f.write_str("Request"),
        }
    }
}

// ---------------------------------------------------------------------------
// Invocations
// ---------------------------------------------------------------------------

/// `<command> version`: readiness probe.
pub fn version_invocation(config: &BrokerConfig) -> ProcessInvocation {
    ProcessInvocation::new(config.command()).arg("version")
}

/// Encrypt `plaintext` (fed on stdin) with the configured key.
///
/// `derived` is ignored in direct-output mode, which cannot return a
/// derived password.
pub fn encrypt_invocation(
    config: &BrokerConfig,
    plaintext: &str,
    derived: &DerivedPassword,
) -> ProcessInvocation {
    let invocation = ProcessInvocation::new(config.command())
        .args(["simple-encrypt", "--key-filter", config.key_id.as_str(), "--value-stdin"])
        .stdin(plaintext.as_bytes());

    if config.direct_output() {
        return invocation.arg("--direct-output");
    }
    match derived {
        DerivedPassword::Omit => invocation,
        _ => derived.append_to(invocation.arg("--with-pbkdf-encryption")),
    }
}

/// Decrypt `ciphertext` (fed on stdin).
pub fn decrypt_invocation(
    config: &BrokerConfig,
    ciphertext: &str,
    derived: &DerivedPassword,
) -> ProcessInvocation {
    let invocation = ProcessInvocation::new(config.command())
        .args(["simple-decrypt", "--value-stdin"])
        .stdin(ciphertext.as_bytes());

    if config.direct_output() {
        return invocation.arg("--direct-output");
    }
    derived.append_to(invocation.args(["--pin", PIN_FROM_INPUT]))
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Structured tool output.
#[derive(Clone, Deserialize)]
pub struct ToolResult {
    /// Ciphertext (encrypt) or plaintext (decrypt).
    pub result: String,
    /// Newly derived password, when one was requested.
    #[serde(default)]
    pub password: Option<String>,
}

impl ToolResult {
    /// The derived password, if present and non-empty.
    pub fn derived_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

impl fmt::Debug for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolResult")
            .field("result_len", &self.result.len())
            .field("has_password", &self.derived_password().is_some())
            .finish()
    }
}

/// Drop lines starting with one of [`LOG_LINE_MARKERS`].  The remaining
/// lines keep their line endings byte for byte.
pub fn strip_log_lines(stdout: &str) -> String {
    stdout
        .split_inclusive('\n')
        .filter(|line| !LOG_LINE_MARKERS.iter().any(|m| line.starts_with(m)))
        .collect()
}

fn decode_stdout(operation: ToolOperation, stdout: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(stdout).map_err(|e| BrokerError::Parse {
        operation,
        reason: format!("stdout is not UTF-8: {e}"),
    })?;
    let remaining = strip_log_lines(text);
    if remaining.trim().is_empty() {
        return Err(BrokerError::Parse {
            operation,
            reason: "no output besides log lines".into(),
        });
    }
    Ok(remaining)
}

/// Parse structured stdout into a [`ToolResult`].
pub fn parse_tool_result(operation: ToolOperation, stdout: &[u8]) -> Result<ToolResult> {
    let remaining = decode_stdout(operation, stdout)?;
    serde_json::from_str(&remaining).map_err(|e| BrokerError::Parse {
        operation,
        reason: format!("invalid result record: {e}"),
    })
}

/// Parse direct-output stdout: the bare result without its final line
/// terminator.  Only one `\n` or `\r\n` is removed.
pub fn parse_direct_output(operation: ToolOperation, stdout: &[u8]) -> Result<String> {
    let mut remaining = decode_stdout(operation, stdout)?;
    if remaining.ends_with('\n') {
        remaining.pop();
        if remaining.ends_with('\r') {
            remaining.pop();
        }
    }
    Ok(remaining)
}
