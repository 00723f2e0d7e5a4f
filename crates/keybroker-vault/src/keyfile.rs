//! On-disk key files, one per vault.
//!
//! A key file holds the external tool's ciphertext of a vault passphrase.
//! The [`KeyFileStore`] trait is the only way the broker touches disk;
//! [`FsKeyFileStore`] is the filesystem implementation rooted at the
//! configured key base directory.
//!
//! # File names
//!
//! Vault ids are opaque strings.  [`escape_vault_id`] turns them into safe
//! file names without relying on the filesystem's own escaping:
//!
//! - `[a-zA-Z0-9-.]` are kept as is,
//! - `_` becomes `__`,
//! - any other UTF-16 code unit below `0x100` becomes `_` followed by exactly
//!   two lowercase hex digits (space -> `_20`),
//! - any code unit from `0x100` up becomes `_u` followed by exactly four
//!   lowercase hex digits (`€` -> `_u20ac`).
//!
//! Every escape has a fixed width and the character after `_` (`_`, `u` or a
//! hex digit) says which form follows, so a name decodes back to exactly one
//! id.  Ids made only of characters up to U+00FF get the same names as the
//! older variable-width scheme; ids with wider characters do not, and key
//! files stored for them under the old scheme are not looked up.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::{BrokerError, Result};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Raw key-file storage.
///
/// Implementations must be `Send + Sync` so the broker can be shared across
/// async tasks.
pub trait KeyFileStore: Send + Sync {
    /// Deterministic, injective mapping from vault id to key-file path.
    fn resolve_path(&self, vault_id: &str) -> PathBuf;

    /// Whether a key file exists for `vault_id`.
    fn exists(&self, vault_id: &str) -> bool;

    /// Read the key file.
    ///
    /// Returns [`BrokerError::NotFound`] if no key file exists.
    fn read(&self, vault_id: &str) -> Result<String>;

    /// Create or overwrite the key file.
    fn write(&self, vault_id: &str, content: &str) -> Result<()>;

    /// Delete the key file.  No-op when absent.
    fn delete(&self, vault_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Encode `vault_id` as a filesystem-safe file name.  See the module docs.
pub fn escape_vault_id(vault_id: &str) -> String {
    let mut out = String::with_capacity(vault_id.len());
    for c in vault_id.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' => out.push(c),
            '_' => out.push_str("__"),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    if *unit < 0x100 {
                        out.push_str(&format!("_{unit:02x}"));
                    } else {
                        out.push_str(&format!("_u{unit:04x}"));
                    }
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Filesystem implementation
// ---------------------------------------------------------------------------

/// Key files stored as plain files under a base directory.
#[derive(Debug, Clone)]
pub struct FsKeyFileStore {
    base_dir: PathBuf,
}

impl FsKeyFileStore {
    /// Store key files under `base_dir`.  The directory is created on the
    /// first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn ensure_base_dir(&self) -> Result<()> {
        if self.base_dir.is_dir() {
            return Ok(());
        }
        info!(path = %self.base_dir.display(), "creating key directory");
        std::fs::create_dir_all(&self.base_dir).map_err(|source| BrokerError::Io {
            action: "directory creation",
            path: self.base_dir.clone(),
            source,
        })
    }
}

impl KeyFileStore for FsKeyFileStore {
    fn resolve_path(&self, vault_id: &str) -> PathBuf {
        self.base_dir.join(escape_vault_id(vault_id))
    }

    fn exists(&self, vault_id: &str) -> bool {
        self.resolve_path(vault_id).is_file()
    }

    fn read(&self, vault_id: &str) -> Result<String> {
        let path = self.resolve_path(vault_id);
        if !path.is_file() {
            return Err(BrokerError::NotFound {
                vault_id: vault_id.to_string(),
                path,
            });
        }
        let content = std::fs::read_to_string(&path).map_err(|source| BrokerError::Io {
            action: "read",
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "read key file");
        Ok(content)
    }

    fn write(&self, vault_id: &str, content: &str) -> Result<()> {
        self.ensure_base_dir()?;
        let path = self.resolve_path(vault_id);
        let io_err = |source| BrokerError::Io {
            action: "write",
            path: path.clone(),
            source,
        };

        std::fs::write(&path, content.as_bytes()).map_err(io_err)?;

        // Owner read/write only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }

        info!(path = %path.display(), "wrote key file");
        Ok(())
    }

    fn delete(&self, vault_id: &str) -> Result<()> {
        let path = self.resolve_path(vault_id);
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|source| BrokerError::Io {
                action: "delete",
                path: path.clone(),
                source,
            })?;
            info!(path = %path.display(), "deleted key file");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
