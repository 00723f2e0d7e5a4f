//! Host-facing passphrase provider.
//!
//! [`PassphraseProvider`] wraps a [`CryptoBroker`] behind the small surface a
//! password-manager host expects.  Construction never fails: when the
//! configuration cannot be loaded or the tool does not answer its readiness
//! probe, the provider is built in the unsupported state and every operation
//! returns [`BrokerError::Unsupported`].

use std::path::PathBuf;

use secrecy::SecretString;
use tracing::{error, info};

use crate::broker::{CryptoBroker, LoadMode};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

/// Name shown to the user when choosing a provider.
pub const DISPLAY_NAME: &str = "TinyEncrypt";

/// Vault name used for logging when the host does not supply one.
pub const DEFAULT_VAULT_NAME: &str = "Vault";

enum ProviderState {
    Ready(CryptoBroker),
    Unsupported { reason: String },
}

/// Passphrase storage for a password-manager host.
pub struct PassphraseProvider {
    state: ProviderState,
}

impl PassphraseProvider {
    /// Load the configuration from the default locations and probe the tool.
    pub async fn load() -> Self {
        Self::from_config(BrokerConfig::load()).await
    }

    /// Build from an already loaded (or failed) configuration.
    pub async fn from_config(config: Result<BrokerConfig>) -> Self {
        match config {
            Ok(config) => Self::from_broker(CryptoBroker::from_config(config)).await,
            Err(e) => Self::unsupported(format!("configuration could not be loaded: {e}")),
        }
    }

    /// Wrap an existing broker, probing the tool first.
    pub async fn from_broker(broker: CryptoBroker) -> Self {
        if broker.check_ready().await {
            info!(command = broker.config().command(), "passphrase provider ready");
            Self {
                state: ProviderState::Ready(broker),
            }
        } else {
            Self::unsupported(format!(
                "`{} version` did not succeed",
                broker.config().command()
            ))
        }
    }

    fn unsupported(reason: String) -> Self {
        error!(reason = %reason, "passphrase provider is unusable");
        Self {
            state: ProviderState::Unsupported { reason },
        }
    }

    pub fn display_name(&self) -> &'static str {
        DISPLAY_NAME
    }

    pub fn is_supported(&self) -> bool {
        matches!(self.state, ProviderState::Ready(_))
    }

    /// Key storage is never locked; unlocking happens in the tool itself.
    pub fn is_locked(&self) -> bool {
        false
    }

    /// The underlying broker, or [`BrokerError::Unsupported`].
    pub fn broker(&self) -> Result<&CryptoBroker> {
        match &self.state {
            ProviderState::Ready(broker) => Ok(broker),
            ProviderState::Unsupported { reason } => Err(BrokerError::Unsupported {
                reason: reason.clone(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn store_passphrase(
        &self,
        vault_id: &str,
        display_name: Option<&str>,
        passphrase: &SecretString,
    ) -> Result<()> {
        let name = display_name.unwrap_or(DEFAULT_VAULT_NAME);
        self.broker()?
            .store_vault_password(vault_id, name, passphrase)
            .await
    }

    /// Replace the stored passphrase.  Same as [`Self::store_passphrase`].
    pub async fn change_passphrase(
        &self,
        vault_id: &str,
        display_name: Option<&str>,
        passphrase: &SecretString,
    ) -> Result<()> {
        self.store_passphrase(vault_id, display_name, passphrase)
            .await
    }

    pub async fn load_passphrase(&self, vault_id: &str) -> Result<SecretString> {
        self.broker()?
            .load_vault_password(vault_id, LoadMode::Retrieve)
            .await
    }

    /// Whether a passphrase is stored for `vault_id`.  Never runs the tool.
    pub async fn is_passphrase_stored(&self, vault_id: &str) -> Result<bool> {
        match self
            .broker()?
            .load_vault_password(vault_id, LoadMode::VerifyStored)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_passphrase(&self, vault_id: &str) -> Result<()> {
        self.broker()?.delete_vault_password(vault_id).await
    }

    /// Where the key file for `vault_id` lives (or would live).
    pub fn key_file_path(&self, vault_id: &str) -> Result<PathBuf> {
        Ok(self.broker()?.key_files().resolve_path(vault_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[tokio::test]
    async fn config_failure_makes_provider_unsupported() {
        let provider = PassphraseProvider::from_config(Err(BrokerError::Config {
            reason: "no file".into(),
        }))
        .await;

        assert!(!provider.is_supported());
        assert!(!provider.is_locked());
        assert_eq!(provider.display_name(), "TinyEncrypt");

        let err = provider.load_passphrase("v").await.unwrap_err();
        assert!(matches!(err, BrokerError::Unsupported { .. }));
        assert!(err.to_string().contains("no file"));

        for result in [
            provider.store_passphrase("v", None, &secret("pw")).await,
            provider.change_passphrase("v", Some("n"), &secret("pw")).await,
            provider.delete_passphrase("v").await,
        ] {
            assert!(matches!(result, Err(BrokerError::Unsupported { .. })));
        }
        assert!(matches!(
            provider.is_passphrase_stored("v").await,
            Err(BrokerError::Unsupported { .. })
        ));
        assert!(provider.key_file_path("v").is_err());
    }

    #[tokio::test]
    async fn missing_tool_makes_provider_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::new("k")
            .with_command("keybroker-test-no-such-tool")
            .with_key_base_path(dir.path());
        let provider = PassphraseProvider::from_config(Ok(config)).await;
        assert!(!provider.is_supported());
    }
}
