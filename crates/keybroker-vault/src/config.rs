//! Broker configuration.
//!
//! [`BrokerConfig`] is read once from a JSON file and never mutated
//! afterwards.  Field names are camelCase so existing
//! `tinyencrypt_config.json` files keep working:
//!
//! ```json
//! {
//!   "keyId": "my-key",
//!   "tinyencryptCommand": "/usr/local/bin/tinyencrypt",
//!   "encryptKeyBasePath": "~/.config/cryptomator/tinyencrypt_keys/",
//!   "enablePbkdfEncryptionPassword": true,
//!   "enableVaultPasswordCache": true
//! }
//! ```
//!
//! Only `keyId` is required.  [`BrokerConfig::load`] searches
//! [`default_config_paths`] in order and uses the first file that exists.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::DEFAULT_CACHE_TTL;
use crate::error::{BrokerError, Result};

/// Command run when the config does not name one.
pub const DEFAULT_COMMAND: &str = "tinyencrypt";

/// System-wide config file, checked first.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/cryptomator/tinyencrypt_config.json";

/// Per-user config file, relative to the home directory.
const USER_CONFIG_PATH: &str = ".config/cryptomator/tinyencrypt_config.json";

/// Default key directory, relative to the home directory.
const DEFAULT_KEY_BASE_PATH: &str = ".config/cryptomator/tinyencrypt_keys";

/// The external tool may prompt for a PIN, so the default limit is generous.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Immutable broker settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Key selector passed to `simple-encrypt --key-filter`.  Required.
    #[serde(default)]
    pub key_id: String,

    /// Path or name of the external tool.  Default: `tinyencrypt`.
    #[serde(
        default,
        rename = "tinyencryptCommand",
        alias = "command",
        skip_serializing_if = "Option::is_none"
    )]
    pub command: Option<String>,

    /// Directory holding key files.  Default:
    /// `~/.config/cryptomator/tinyencrypt_keys/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key_base_path: Option<String>,

    /// Encrypt with PBKDF and cache the derived password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_pbkdf_encryption_password: Option<bool>,

    /// Cache decrypted vault passwords in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_vault_password_cache: Option<bool>,

    /// Ask the tool for bare output instead of a JSON record.  Disables
    /// derived-password handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_output: Option<bool>,

    /// Kill the tool after this many seconds.  `0` waits forever.
    /// Default: 300.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,

    /// Idle time-to-live of cached secrets.  Default: 3600.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_cache_ttl_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Config files searched by [`BrokerConfig::load`], in order.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(USER_CONFIG_PATH));
    }
    paths
}

impl BrokerConfig {
    /// Load from the first existing file among [`default_config_paths`].
    pub fn load() -> Result<Self> {
        Self::load_first_of(&default_config_paths())
    }

    /// Load from the first of `paths` that is an existing file.
    pub fn load_first_of(paths: &[PathBuf]) -> Result<Self> {
        for path in paths {
            let found = path.is_file();
            info!(path = %path.display(), found, "checking config file");
            if found {
                return Self::load_from(path);
            }
        }
        Err(BrokerError::Config {
            reason: format!(
                "no config file found (searched: {})",
                paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }

    /// Load and validate a specific config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| BrokerError::Config {
            reason: format!("read config file {} failed: {e}", path.display()),
        })?;
        Self::from_json(&json).map_err(|e| match e {
            BrokerError::Config { reason } => BrokerError::Config {
                reason: format!("{}: {reason}", path.display()),
            },
            other => other,
        })
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| BrokerError::Config {
            reason: format!("invalid config JSON: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<()> {
        if self.key_id.trim().is_empty() {
            return Err(BrokerError::Config {
                reason: "keyId cannot be empty".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

impl BrokerConfig {
    pub fn command(&self) -> &str {
        match self.command.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => DEFAULT_COMMAND,
        }
    }

    /// Key directory with a leading `~/` expanded.
    pub fn key_base_path(&self) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_default();
        match self.encrypt_key_base_path.as_deref() {
            Some(p) if !p.is_empty() => match p.strip_prefix("~/") {
                Some(rest) => home.join(rest),
                None => PathBuf::from(p),
            },
            _ => home.join(DEFAULT_KEY_BASE_PATH),
        }
    }

    pub fn pbkdf_password_cache_enabled(&self) -> bool {
        self.enable_pbkdf_encryption_password.unwrap_or(false)
    }

    pub fn vault_password_cache_enabled(&self) -> bool {
        self.enable_vault_password_cache.unwrap_or(false)
    }

    pub fn direct_output(&self) -> bool {
        self.direct_output.unwrap_or(false)
    }

    /// `None` means no limit.
    pub fn command_timeout(&self) -> Option<Duration> {
        match self.command_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_COMMAND_TIMEOUT),
        }
    }

    pub fn password_cache_ttl(&self) -> Duration {
        self.password_cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CACHE_TTL)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

impl BrokerConfig {
    /// A config with only the key id set.
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            ..Self::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_key_base_path(mut self, path: impl AsRef<Path>) -> Self {
        self.encrypt_key_base_path = Some(path.as_ref().display().to_string());
        self
    }

    pub fn with_pbkdf_password_cache(mut self, enabled: bool) -> Self {
        self.enable_pbkdf_encryption_password = Some(enabled);
        self
    }

    pub fn with_vault_password_cache(mut self, enabled: bool) -> Self {
        self.enable_vault_password_cache = Some(enabled);
        self
    }

    pub fn with_direct_output(mut self, enabled: bool) -> Self {
        self.direct_output = Some(enabled);
        self
    }

    pub fn with_command_timeout_secs(mut self, secs: u64) -> Self {
        self.command_timeout_secs = Some(secs);
        self
    }

    pub fn with_password_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.password_cache_ttl_secs = Some(secs);
        self
    }
}
