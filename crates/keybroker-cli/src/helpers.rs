//! Shared helper functions used across CLI subcommands.

use std::io::{self, Read};

use anyhow::{Context, Result, bail};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Logs go to stderr; stdout carries passphrases only.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Passphrase input
// ---------------------------------------------------------------------------

/// Read a passphrase from stdin, dropping one trailing newline.
pub fn read_passphrase() -> Result<SecretString> {
    let mut raw = String::new();
    io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read passphrase from stdin")?;
    parse_passphrase(raw)
}

fn parse_passphrase(mut raw: String) -> Result<SecretString> {
    if raw.ends_with('\n') {
        raw.pop();
        if raw.ends_with('\r') {
            raw.pop();
        }
    }
    if raw.is_empty() {
        bail!("empty passphrase");
    }
    Ok(SecretString::from(raw))
}
