//! CLI entry point for keybroker.
//!
//! This binary provides the `keybroker` command for checking the tool setup
//! and storing, loading and deleting vault passphrases.

mod cli;
mod helpers;

use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use keybroker_vault::{BrokerConfig, PassphraseProvider};
use secrecy::ExposeSecret;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::helpers::{init_tracing, read_passphrase};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match &cli.config {
        Some(path) => BrokerConfig::load_from(path),
        None => BrokerConfig::load(),
    };
    let provider = PassphraseProvider::from_config(config).await;

    match cli.command {
        Commands::Check => cmd_check(&provider),
        Commands::Load { vault } => cmd_load(&provider, &vault).await,
        Commands::Store { vault, name } => cmd_store(&provider, &vault, name.as_deref(), false).await,
        Commands::Change { vault, name } => cmd_store(&provider, &vault, name.as_deref(), true).await,
        Commands::Delete { vault } => cmd_delete(&provider, &vault).await,
        Commands::Path { vault } => cmd_path(&provider, &vault),
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn cmd_check(provider: &PassphraseProvider) -> Result<()> {
    let broker = provider.broker().context("provider check failed")?;
    println!(
        "{} provider ready (command: {}, keys: {})",
        provider.display_name(),
        broker.config().command(),
        broker.config().key_base_path().display()
    );
    Ok(())
}

async fn cmd_load(provider: &PassphraseProvider, vault: &str) -> Result<()> {
    let passphrase = provider
        .load_passphrase(vault)
        .await
        .with_context(|| format!("failed to load passphrase for vault `{vault}`"))?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", passphrase.expose_secret()).context("failed to write passphrase")?;
    Ok(())
}

async fn cmd_store(
    provider: &PassphraseProvider,
    vault: &str,
    name: Option<&str>,
    change: bool,
) -> Result<()> {
    if !provider.is_supported() {
        provider.broker().context("cannot store passphrase")?;
    }
    let passphrase = read_passphrase()?;

    let stored = if change {
        provider.change_passphrase(vault, name, &passphrase).await
    } else {
        provider.store_passphrase(vault, name, &passphrase).await
    };
    stored.with_context(|| format!("failed to store passphrase for vault `{vault}`"))?;

    info!(vault, "passphrase stored");
    Ok(())
}

async fn cmd_delete(provider: &PassphraseProvider, vault: &str) -> Result<()> {
    provider
        .delete_passphrase(vault)
        .await
        .with_context(|| format!("failed to delete passphrase for vault `{vault}`"))?;
    info!(vault, "passphrase deleted");
    Ok(())
}

fn cmd_path(provider: &PassphraseProvider, vault: &str) -> Result<()> {
    let path = provider
        .key_file_path(vault)
        .context("cannot resolve key file path")?;
    println!("{}", path.display());
    Ok(())
}
