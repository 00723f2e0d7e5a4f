//! Encrypt/decrypt orchestration and the vault password flows.
//!
//! [`CryptoBroker`] decides whether a cached derived password can be reused,
//! builds the tool invocation, runs it, parses the result, and keeps the two
//! secret caches up to date:
//!
//! ```text
//! load_vault_password ──► vault cache hit? ──► return
//!         │ miss
//!         ▼
//!   KeyFileStore::read ──► decrypt ──► pbkdf cache (reuse | request+cache)
//!         │                   │
//!         │                   ▼
//!         │            CommandRunner::run (tinyencrypt simple-decrypt)
//!         ▼
//!   vault cache put ──► return
//! ```

use std::sync::Arc;

use keybroker_process::{CommandRunner, ProcessInvocation, ProcessOutcome, ProcessRunner};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::cache::BrokerCaches;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result, ToolOperation};
use crate::keyfile::{FsKeyFileStore, KeyFileStore};
use crate::tool::{self, DerivedPassword};

/// Returned by [`LoadMode::VerifyStored`] loads when a key file exists.
pub const STORED_PASSPHRASE_PLACEHOLDER: &str = "<stored>";

/// Why the caller is loading a vault password.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadMode {
    /// Recover the real passphrase, running the tool if needed.
    #[default]
    Retrieve,
    /// Only establish that a passphrase is stored.  Never runs the tool; a
    /// key file on disk yields [`STORED_PASSPHRASE_PLACEHOLDER`].
    VerifyStored,
}

/// Orchestrates the external tool, key files and secret caches.
pub struct CryptoBroker {
    config: Arc<BrokerConfig>,
    runner: Arc<dyn CommandRunner>,
    key_files: Arc<dyn KeyFileStore>,
    caches: BrokerCaches,
}

impl CryptoBroker {
    /// Assemble a broker from explicit collaborators.
    pub fn new(
        config: BrokerConfig,
        runner: Arc<dyn CommandRunner>,
        key_files: Arc<dyn KeyFileStore>,
        caches: BrokerCaches,
    ) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            key_files,
            caches,
        }
    }

    /// A broker using a real [`ProcessRunner`], key files under the
    /// configured directory and fresh caches.
    pub fn from_config(config: BrokerConfig) -> Self {
        let runner = ProcessRunner::new().with_optional_timeout(config.command_timeout());
        let key_files = FsKeyFileStore::new(config.key_base_path());
        let caches = BrokerCaches::new(config.password_cache_ttl());
        Self::new(config, Arc::new(runner), Arc::new(key_files), caches)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn caches(&self) -> &BrokerCaches {
        &self.caches
    }

    pub fn key_files(&self) -> &dyn KeyFileStore {
        self.key_files.as_ref()
    }

    // -----------------------------------------------------------------------
    // Tool operations
    // -----------------------------------------------------------------------

    /// `true` when `<command> version` exits 0.
    pub async fn check_ready(&self) -> bool {
        let invocation = tool::version_invocation(&self.config);
        match self.runner.run(&invocation).await {
            Ok(outcome) if outcome.success() => {
                debug!(
                    command = %invocation,
                    version = %outcome.stdout_lossy().trim(),
                    "tool is ready"
                );
                true
            }
            Ok(outcome) => {
                warn!(
                    command = %invocation,
                    exit_code = outcome.exit_code,
                    stderr = %outcome.stderr_excerpt(),
                    "tool readiness check failed"
                );
                false
            }
            Err(e) => {
                warn!(command = %invocation, error = %e, "tool readiness check failed");
                false
            }
        }
    }

    /// Decrypt `ciphertext` for `vault_id`.
    pub async fn decrypt(&self, vault_id: &str, ciphertext: &str) -> Result<SecretString> {
        let derived = if self.config.direct_output() {
            DerivedPassword::Omit
        } else if self.config.pbkdf_password_cache_enabled() {
            self.cached_derived_password(vault_id).await
        } else {
            DerivedPassword::Request
        };

        let invocation = tool::decrypt_invocation(&self.config, ciphertext, &derived);
        let outcome = self.run_tool(ToolOperation::Decrypt, &invocation).await?;

        if self.config.direct_output() {
            let plaintext = tool::parse_direct_output(ToolOperation::Decrypt, &outcome.stdout)?;
            return Ok(SecretString::from(plaintext));
        }

        let result = tool::parse_tool_result(ToolOperation::Decrypt, &outcome.stdout)?;
        if derived.is_request() && self.config.pbkdf_password_cache_enabled() {
            self.remember_derived_password(vault_id, result.derived_password())
                .await;
        }
        Ok(SecretString::from(result.result))
    }

    /// Encrypt `plaintext` with the configured key.  `display_name` is the
    /// human-readable vault name, used for logging only.
    pub async fn encrypt(
        &self,
        vault_id: &str,
        plaintext: &SecretString,
        display_name: &str,
    ) -> Result<String> {
        let derived = if self.config.direct_output() || !self.config.pbkdf_password_cache_enabled()
        {
            DerivedPassword::Omit
        } else {
            self.cached_derived_password(vault_id).await
        };

        debug!(vault_id, display_name, derived = ?derived, "encrypting");
        let invocation = tool::encrypt_invocation(&self.config, plaintext.expose_secret(), &derived);
        let outcome = self.run_tool(ToolOperation::Encrypt, &invocation).await?;

        if self.config.direct_output() {
            return tool::parse_direct_output(ToolOperation::Encrypt, &outcome.stdout);
        }

        let result = tool::parse_tool_result(ToolOperation::Encrypt, &outcome.stdout)?;
        if derived.is_request() {
            self.remember_derived_password(vault_id, result.derived_password())
                .await;
        }
        Ok(result.result)
    }

    // -----------------------------------------------------------------------
    // Vault password flows
    // -----------------------------------------------------------------------

    /// Encrypt `password` and write it to the vault's key file.
    ///
    /// With vault-password caching enabled the password is cached before the
    /// tool runs, so it is readable immediately even if encryption is slow or
    /// fails.
    pub async fn store_vault_password(
        &self,
        vault_id: &str,
        display_name: &str,
        password: &SecretString,
    ) -> Result<()> {
        if self.config.vault_password_cache_enabled() {
            info!(
                vault_id,
                cache = self.caches.vault_passwords.name(),
                "caching vault password"
            );
            self.caches
                .vault_passwords
                .put(vault_id, duplicate(password))
                .await;
        }
        let ciphertext = self.encrypt(vault_id, password, display_name).await?;
        self.key_files.write(vault_id, &ciphertext)?;
        info!(vault_id, display_name, "stored vault password");
        Ok(())
    }

    /// Recover the vault password.  See [`LoadMode`].
    ///
    /// Returns [`BrokerError::NotFound`] when nothing is stored for
    /// `vault_id`.
    pub async fn load_vault_password(&self, vault_id: &str, mode: LoadMode) -> Result<SecretString> {
        let caching = self.config.vault_password_cache_enabled();
        if caching {
            if let Some(cached) = self.caches.vault_passwords.get(vault_id).await {
                debug!(vault_id, "vault password served from cache");
                return Ok(cached);
            }
        }

        if mode == LoadMode::VerifyStored {
            let exists = self.key_files.exists(vault_id);
            info!(vault_id, exists, "checking whether a passphrase is stored");
            if exists {
                return Ok(SecretString::from(STORED_PASSPHRASE_PLACEHOLDER.to_string()));
            }
        }

        let ciphertext = self.key_files.read(vault_id)?;
        let password = self.decrypt(vault_id, &ciphertext).await?;
        if caching {
            info!(
                vault_id,
                cache = self.caches.vault_passwords.name(),
                "caching vault password"
            );
            self.caches
                .vault_passwords
                .put(vault_id, duplicate(&password))
                .await;
        }
        Ok(password)
    }

    /// Delete the key file and forget every cached secret for `vault_id`.
    ///
    /// Both caches are cleared even when caching is disabled or the file
    /// deletion fails.
    pub async fn delete_vault_password(&self, vault_id: &str) -> Result<()> {
        let deleted = self.key_files.delete(vault_id);
        self.caches.forget(vault_id).await;
        deleted
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn cached_derived_password(&self, vault_id: &str) -> DerivedPassword {
        match self.caches.pbkdf_passwords.get(vault_id).await {
            Some(cached) if !cached.expose_secret().is_empty() => DerivedPassword::Reuse(cached),
            _ => DerivedPassword::Request,
        }
    }

    async fn remember_derived_password(&self, vault_id: &str, password: Option<&str>) {
        if let Some(password) = password {
            info!(
                vault_id,
                cache = self.caches.pbkdf_passwords.name(),
                "caching derived password"
            );
            self.caches
                .pbkdf_passwords
                .put(vault_id, SecretString::from(password.to_string()))
                .await;
        }
    }

    async fn run_tool(
        &self,
        operation: ToolOperation,
        invocation: &ProcessInvocation,
    ) -> Result<ProcessOutcome> {
        let outcome = self.runner.run(invocation).await?;
        if !outcome.success() {
            return Err(BrokerError::ToolFailed {
                operation,
                command: invocation.to_string(),
                exit_code: outcome.exit_code,
                stderr: outcome.stderr_excerpt(),
            });
        }
        Ok(outcome)
    }
}

fn duplicate(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use keybroker_process::ProcessError;

    use super::*;

    /// Scripted stand-in for the external tool.  "Encrypts" by prefixing
    /// `enc:` and hands out `derived-<n>` whenever `--outputs-password` is
    /// given.
    #[derive(Default)]
    struct FakeTool {
        calls: Mutex<Vec<Vec<String>>>,
        derived_counter: AtomicUsize,
        fail_with_exit: Option<i32>,
        garbage_output: bool,
    }

    impl FakeTool {
        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeTool {
        async fn run(
            &self,
            invocation: &ProcessInvocation,
        ) -> std::result::Result<ProcessOutcome, ProcessError> {
            self.calls
                .lock()
                .unwrap()
                .push(invocation.arguments().to_vec());

            if let Some(code) = self.fail_with_exit {
                return Ok(ProcessOutcome {
                    exit_code: code,
                    stdout: Vec::new(),
                    stderr: b"card not present".to_vec(),
                });
            }
            if self.garbage_output {
                return Ok(ProcessOutcome {
                    exit_code: 0,
                    stdout: b"[INFO ] hi\nthis is not json".to_vec(),
                    stderr: Vec::new(),
                });
            }

            let input = String::from_utf8_lossy(invocation.stdin_bytes().unwrap_or_default())
                .into_owned();
            let result = match invocation.arguments()[0].as_str() {
                "version" => String::new(),
                "simple-encrypt" => format!("enc:{input}"),
                "simple-decrypt" => input.trim_start_matches("enc:").to_string(),
                other => panic!("unexpected subcommand {other}"),
            };
            let password = if invocation.has_arg("--outputs-password") {
                let n = self.derived_counter.fetch_add(1, Ordering::SeqCst) + 1;
                format!(",\"password\":\"derived-{n}\"")
            } else {
                String::new()
            };
            let stdout = if invocation.has_arg("--direct-output") {
                format!("{result}\n")
            } else {
                format!("[INFO ] working\n{{\"result\":\"{result}\"{password}}}\n")
            };
            Ok(ProcessOutcome {
                exit_code: 0,
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct MemoryKeyFiles {
        files: Mutex<HashMap<String, String>>,
    }

    impl KeyFileStore for MemoryKeyFiles {
        fn resolve_path(&self, vault_id: &str) -> PathBuf {
            PathBuf::from("/mem").join(crate::keyfile::escape_vault_id(vault_id))
        }

        fn exists(&self, vault_id: &str) -> bool {
            self.files.lock().unwrap().contains_key(vault_id)
        }

        fn read(&self, vault_id: &str) -> Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(vault_id)
                .cloned()
                .ok_or_else(|| BrokerError::NotFound {
                    vault_id: vault_id.to_string(),
                    path: self.resolve_path(vault_id),
                })
        }

        fn write(&self, vault_id: &str, content: &str) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(vault_id.to_string(), content.to_string());
            Ok(())
        }

        fn delete(&self, vault_id: &str) -> Result<()> {
            self.files.lock().unwrap().remove(vault_id);
            Ok(())
        }
    }

    struct Harness {
        broker: CryptoBroker,
        tool: Arc<FakeTool>,
        files: Arc<MemoryKeyFiles>,
    }

    fn harness_with(config: BrokerConfig, tool: FakeTool) -> Harness {
        let tool = Arc::new(tool);
        let files = Arc::new(MemoryKeyFiles::default());
        let broker = CryptoBroker::new(
            config,
            tool.clone(),
            files.clone(),
            BrokerCaches::default(),
        );
        Harness { broker, tool, files }
    }

    fn harness(config: BrokerConfig) -> Harness {
        harness_with(config, FakeTool::default())
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn reveal(s: &SecretString) -> &str {
        s.expose_secret()
    }

    // -- readiness ----------------------------------------------------------

    #[tokio::test]
    async fn check_ready_runs_version() {
        let h = harness(BrokerConfig::new("k"));
        assert!(h.broker.check_ready().await);
        assert_eq!(h.tool.calls(), vec![vec!["version".to_string()]]);
    }

    #[tokio::test]
    async fn check_ready_false_on_nonzero_exit() {
        let h = harness_with(
            BrokerConfig::new("k"),
            FakeTool {
                fail_with_exit: Some(2),
                ..FakeTool::default()
            },
        );
        assert!(!h.broker.check_ready().await);
    }

    // -- decrypt ------------------------------------------------------------

    #[tokio::test]
    async fn decrypt_without_caching_always_requests_password() {
        let h = harness(BrokerConfig::new("k"));
        for _ in 0..2 {
            let pt = h.broker.decrypt("v", "enc:secret").await.unwrap();
            assert_eq!(reveal(&pt), "secret");
        }
        let calls = h.tool.calls();
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert!(call.contains(&"--outputs-password".to_string()));
            assert!(!call.contains(&"--password".to_string()));
        }
        assert!(h.broker.caches().pbkdf_passwords.get("v").await.is_none());
    }

    #[tokio::test]
    async fn decrypt_with_caching_reuses_derived_password() {
        let h = harness(BrokerConfig::new("k").with_pbkdf_password_cache(true));
        h.broker.decrypt("v", "enc:secret").await.unwrap();
        h.broker.decrypt("v", "enc:secret").await.unwrap();

        let calls = h.tool.calls();
        assert!(calls[0].contains(&"--outputs-password".to_string()));
        assert_eq!(
            calls[1][calls[1].len() - 2..],
            ["--password".to_string(), "derived-1".to_string()]
        );
        assert!(!calls[1].contains(&"--outputs-password".to_string()));
    }

    #[tokio::test]
    async fn decrypt_nonzero_exit_is_tool_failure() {
        let h = harness_with(
            BrokerConfig::new("k").with_pbkdf_password_cache(true),
            FakeTool {
                fail_with_exit: Some(1),
                ..FakeTool::default()
            },
        );
        let err = h.broker.decrypt("v", "enc:x").await.unwrap_err();
        match err {
            BrokerError::ToolFailed {
                operation,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(operation, ToolOperation::Decrypt);
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "card not present");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.broker.caches().pbkdf_passwords.get("v").await.is_none());
    }

    #[tokio::test]
    async fn decrypt_garbage_output_is_parse_error_and_caches_nothing() {
        let h = harness_with(
            BrokerConfig::new("k").with_pbkdf_password_cache(true),
            FakeTool {
                garbage_output: true,
                ..FakeTool::default()
            },
        );
        let err = h.broker.decrypt("v", "enc:x").await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Parse {
                operation: ToolOperation::Decrypt,
                ..
            }
        ));
        assert!(h.broker.caches().pbkdf_passwords.get("v").await.is_none());
    }

    #[tokio::test]
    async fn decrypt_direct_output() {
        let h = harness(
            BrokerConfig::new("k")
                .with_direct_output(true)
                .with_pbkdf_password_cache(true),
        );
        let pt = h.broker.decrypt("v", "enc:plain").await.unwrap();
        assert_eq!(reveal(&pt), "plain");
        assert_eq!(
            h.tool.calls()[0],
            ["simple-decrypt", "--value-stdin", "--direct-output"]
        );
        assert!(h.broker.caches().pbkdf_passwords.get("v").await.is_none());
    }

    // -- encrypt ------------------------------------------------------------

    #[tokio::test]
    async fn encrypt_without_pbkdf_has_no_password_args() {
        let h = harness(BrokerConfig::new("key-9"));
        let ct = h.broker.encrypt("v", &secret("pw"), "Vault").await.unwrap();
        assert_eq!(ct, "enc:pw");
        assert_eq!(
            h.tool.calls()[0],
            ["simple-encrypt", "--key-filter", "key-9", "--value-stdin"]
        );
        assert!(h.broker.caches().pbkdf_passwords.get("v").await.is_none());
    }

    #[tokio::test]
    async fn encrypt_with_pbkdf_requests_then_reuses() {
        let h = harness(BrokerConfig::new("k").with_pbkdf_password_cache(true));
        h.broker.encrypt("v", &secret("pw"), "Vault").await.unwrap();
        h.broker.encrypt("v", &secret("pw"), "Vault").await.unwrap();

        let calls = h.tool.calls();
        assert!(calls[0].contains(&"--with-pbkdf-encryption".to_string()));
        assert!(calls[0].contains(&"--outputs-password".to_string()));
        assert!(calls[1].contains(&"--with-pbkdf-encryption".to_string()));
        assert!(calls[1].contains(&"derived-1".to_string()));
    }

    #[tokio::test]
    async fn encrypt_and_decrypt_share_the_derived_password() {
        let h = harness(BrokerConfig::new("k").with_pbkdf_password_cache(true));
        h.broker.encrypt("v", &secret("pw"), "Vault").await.unwrap();
        h.broker.decrypt("v", "enc:pw").await.unwrap();
        let calls = h.tool.calls();
        assert!(calls[1].contains(&"derived-1".to_string()));
    }

    #[tokio::test]
    async fn derived_passwords_are_per_vault() {
        let h = harness(BrokerConfig::new("k").with_pbkdf_password_cache(true));
        h.broker.decrypt("a", "enc:x").await.unwrap();
        h.broker.decrypt("b", "enc:x").await.unwrap();
        let calls = h.tool.calls();
        assert!(calls[1].contains(&"--outputs-password".to_string()));
    }

    // -- store / load / delete ----------------------------------------------

    #[tokio::test]
    async fn store_then_load_roundtrip() {
        let h = harness(BrokerConfig::new("k"));
        h.broker
            .store_vault_password("v", "My Vault", &secret("hunter2"))
            .await
            .unwrap();
        assert_eq!(h.files.read("v").unwrap(), "enc:hunter2");

        let pw = h.broker.load_vault_password("v", LoadMode::Retrieve).await.unwrap();
        assert_eq!(reveal(&pw), "hunter2");
        assert_eq!(h.tool.call_count(), 2);
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let h = harness(BrokerConfig::new("k"));
        let err = h
            .broker
            .load_vault_password("nope", LoadMode::Retrieve)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.tool.call_count(), 0);
    }

    #[tokio::test]
    async fn store_caches_before_encrypting() {
        let h = harness_with(
            BrokerConfig::new("k").with_vault_password_cache(true),
            FakeTool {
                fail_with_exit: Some(1),
                ..FakeTool::default()
            },
        );
        let err = h
            .broker
            .store_vault_password("v", "Vault", &secret("pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ToolFailed { .. }));
        assert!(!h.files.exists("v"));

        let pw = h.broker.load_vault_password("v", LoadMode::Retrieve).await.unwrap();
        assert_eq!(reveal(&pw), "pw");
    }

    #[tokio::test]
    async fn cached_load_skips_tool_and_disk() {
        let h = harness(BrokerConfig::new("k").with_vault_password_cache(true));
        h.files.write("v", "enc:from-disk").unwrap();

        let first = h.broker.load_vault_password("v", LoadMode::Retrieve).await.unwrap();
        assert_eq!(reveal(&first), "from-disk");
        assert_eq!(h.tool.call_count(), 1);

        // Even with the file gone the cached value is served.
        h.files.delete("v").unwrap();
        let second = h.broker.load_vault_password("v", LoadMode::Retrieve).await.unwrap();
        assert_eq!(reveal(&second), "from-disk");
        assert_eq!(h.tool.call_count(), 1);
    }

    #[tokio::test]
    async fn load_without_vault_cache_decrypts_every_time() {
        let h = harness(BrokerConfig::new("k"));
        h.files.write("v", "enc:pw").unwrap();
        h.broker.load_vault_password("v", LoadMode::Retrieve).await.unwrap();
        h.broker.load_vault_password("v", LoadMode::Retrieve).await.unwrap();
        assert_eq!(h.tool.call_count(), 2);
        assert!(h.broker.caches().vault_passwords.get("v").await.is_none());
    }

    #[tokio::test]
    async fn verify_mode_never_runs_tool() {
        let h = harness(BrokerConfig::new("k"));
        h.files.write("v", "enc:pw").unwrap();

        let pw = h
            .broker
            .load_vault_password("v", LoadMode::VerifyStored)
            .await
            .unwrap();
        assert_eq!(reveal(&pw), STORED_PASSPHRASE_PLACEHOLDER);
        assert_eq!(h.tool.call_count(), 0);

        let err = h
            .broker
            .load_vault_password("other", LoadMode::VerifyStored)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_clears_both_caches_even_when_caching_disabled() {
        let h = harness(BrokerConfig::new("k"));
        h.files.write("v", "enc:pw").unwrap();
        h.broker
            .caches()
            .pbkdf_passwords
            .put("v", secret("derived"))
            .await;
        h.broker.caches().vault_passwords.put("v", secret("pw")).await;

        h.broker.delete_vault_password("v").await.unwrap();

        assert!(!h.files.exists("v"));
        assert!(h.broker.caches().pbkdf_passwords.get("v").await.is_none());
        assert!(h.broker.caches().vault_passwords.get("v").await.is_none());
    }

    #[tokio::test]
    async fn delete_then_load_is_not_found_with_caching() {
        let h = harness(
            BrokerConfig::new("k")
                .with_vault_password_cache(true)
                .with_pbkdf_password_cache(true),
        );
        h.broker
            .store_vault_password("v", "Vault", &secret("pw"))
            .await
            .unwrap();
        h.broker.delete_vault_password("v").await.unwrap();

        let err = h
            .broker
            .load_vault_password("v", LoadMode::Retrieve)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
