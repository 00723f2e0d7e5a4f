//! Per-vault passphrase storage backed by an external encryption tool.
//!
//! Passphrases never touch disk in the clear: each one is encrypted by the
//! `tinyencrypt` command-line tool (typically bound to a hardware key) and
//! the ciphertext is written to a key file named after the vault id.
//! Recently used secrets are held in memory with a sliding expiry so the
//! user is not prompted for a PIN on every unlock.
//!
//! # Modules
//!
//! - [`provider`] -- [`PassphraseProvider`], the host-facing facade.
//! - [`broker`] -- [`CryptoBroker`], encrypt/decrypt orchestration and the
//!   store/load/delete flows.
//! - [`tool`] -- tool invocations and output parsing.
//! - [`cache`] -- [`SecretCache`] and the [`BrokerCaches`] pair.
//! - [`keyfile`] -- [`KeyFileStore`] and vault-id escaping.
//! - [`config`] -- [`BrokerConfig`] and JSON config discovery.
//! - [`error`] -- [`BrokerError`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use keybroker_vault::PassphraseProvider;
//! use secrecy::{ExposeSecret, SecretString};
//!
//! # async fn example() -> keybroker_vault::Result<()> {
//! let provider = PassphraseProvider::load().await;
//! if provider.is_supported() {
//!     let pw = SecretString::from("correct horse".to_string());
//!     provider.store_passphrase("vault-1", Some("Work"), &pw).await?;
//!     let loaded = provider.load_passphrase("vault-1").await?;
//!     assert_eq!(loaded.expose_secret(), "correct horse");
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod keyfile;
pub mod provider;
pub mod tool;

pub use broker::{CryptoBroker, LoadMode};
pub use cache::{BrokerCaches, SecretCache};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result, ToolOperation};
pub use keyfile::{FsKeyFileStore, KeyFileStore};
pub use provider::PassphraseProvider;
