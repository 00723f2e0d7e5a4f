//! CLI argument definitions for keybroker.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keybroker -- vault passphrases protected by an external encryption tool.
#[derive(Parser)]
#[command(
    name = "keybroker",
    version,
    about = "keybroker -- vault passphrases protected by tinyencrypt",
    long_about = "Stores per-vault passphrases as key files encrypted by the tinyencrypt \
                  command-line tool and recovers them on demand."
)]
pub struct Cli {
    /// Config file to use instead of the default search locations.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Default log level when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the configuration loads and the tool answers.
    Check,

    /// Print the stored passphrase of a vault to stdout.
    Load {
        /// Vault identifier.
        vault: String,
    },

    /// Store a passphrase read from stdin.
    Store {
        /// Vault identifier.
        vault: String,

        /// Human-readable vault name.
        #[arg(long, short)]
        name: Option<String>,
    },

    /// Replace a stored passphrase with one read from stdin.
    Change {
        /// Vault identifier.
        vault: String,

        /// Human-readable vault name.
        #[arg(long, short)]
        name: Option<String>,
    },

    /// Delete a stored passphrase.
    Delete {
        /// Vault identifier.
        vault: String,
    },

    /// Print the key file path for a vault.
    Path {
        /// Vault identifier.
        vault: String,
    },
}
