//! Master-password vault lifecycle
//!
//! Gates access to the configuration database and the backend credentials
//! file. While locked both exist only as `<name>.enc`; unlock decrypts them
//! to plaintext and opens the database through the [`DatabaseGate`]
//! collaborator. The in-memory key lives only while unlocked and is
//! overwritten with zeros before release.
//!
//! ## Rate limiting
//!
//! Attempts 1–3 proceed immediately. Attempts 4–9 are delayed server-side
//! by `2^(n−3)` seconds. The 10th wrong attempt triggers a 5-minute lockout
//! and resets the counter. The vault mutex is released during the delay
//! sleep and state is re-checked after reacquiring it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use driftsync_core::events::EventSink;
use driftsync_core::ports::DatabaseGate;
use driftsync_core::CoreError;

use crate::aead;
use crate::kdf;

const MAX_ATTEMPTS_BEFORE_DELAY: u32 = 3;
const MAX_ATTEMPTS_BEFORE_LOCK: u32 = 10;
const LOCKOUT_SECS: i64 = 5 * 60;
/// Minimum accepted password length. Callers should surface a UI warning
/// below 12 characters.
pub const MIN_PASSWORD_LEN: usize = 4;

/// User preferences kept plaintext so the application behaves correctly
/// before the database is available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreUnlockSettings {
    #[serde(default)]
    pub minimize_to_tray_on_startup: bool,
    #[serde(default)]
    pub start_at_login: bool,
    #[serde(default)]
    pub show_notifications: bool,
}

/// Persisted auth metadata (stored in `auth.json`, always plaintext).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthFile {
    pub enabled: bool,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockout_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pre_unlock: PreUnlockSettings,
}

/// Current rate-limit state as reported to callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockoutStatus {
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub retry_after_secs: u32,
}

struct VaultState {
    auth: AuthFile,
    unlocked: bool,
    key: Option<Zeroizing<Vec<u8>>>,
}

/// Password-gated lifecycle for the sensitive configuration files.
pub struct Vault {
    auth_path: PathBuf,
    /// Files kept encrypted at rest (database, credentials).
    sensitive_files: Vec<PathBuf>,
    gate: Arc<dyn DatabaseGate>,
    events: Arc<dyn EventSink>,
    state: Mutex<VaultState>,
}

fn delay_for_attempts(failed: u32) -> Option<std::time::Duration> {
    if (MAX_ATTEMPTS_BEFORE_DELAY..MAX_ATTEMPTS_BEFORE_LOCK).contains(&failed) {
        Some(std::time::Duration::from_secs(
            2u64.pow(failed - MAX_ATTEMPTS_BEFORE_DELAY),
        ))
    } else {
        None
    }
}

fn remove_sidecars(base: &Path) {
    let _ = std::fs::remove_file(sibling(base, "-wal"));
    let _ = std::fs::remove_file(sibling(base, "-shm"));
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl Vault {
    /// Creates the vault and loads `auth.json` if present.
    ///
    /// `sensitive_files` are the plaintext paths of the files to keep
    /// encrypted at rest (the `.enc` sibling is derived).
    pub fn new(
        auth_path: PathBuf,
        sensitive_files: Vec<PathBuf>,
        gate: Arc<dyn DatabaseGate>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let auth = match std::fs::read(&auth_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "Invalid auth.json, treating as no auth");
                AuthFile::default()
            }),
            Err(_) => AuthFile::default(),
        };

        Vault {
            auth_path,
            sensitive_files,
            gate,
            events,
            state: Mutex::new(VaultState {
                auth,
                unlocked: false,
                key: None,
            }),
        }
    }

    /// Startup sequence: crash recovery, then either immediate
    /// initialisation (auth disabled) or waiting for unlock.
    pub async fn startup(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        self.recover_from_crash(state.auth.enabled);

        if !state.auth.enabled {
            self.gate.open().await?;
            state.unlocked = true;
            drop(state);
            self.events.emit("auth:unlocked", serde_json::Value::Null);
            info!("No auth configured, vault unlocked");
        } else {
            state.unlocked = false;
            drop(state);
            self.events.emit("auth:locked", serde_json::Value::Null);
            info!("Auth enabled, waiting for unlock");
        }
        Ok(())
    }

    /// Re-encrypts files and zeroes the key if unlocked. Called on shutdown.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.auth.enabled && state.unlocked {
            if let Err(e) = self.lock_internal(&mut state).await {
                warn!(error = %e, "Failed to lock vault on shutdown");
            }
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.auth.enabled
    }

    pub async fn is_unlocked(&self) -> bool {
        self.state.lock().await.unlocked
    }

    /// Settings readable before unlock.
    pub async fn pre_unlock_settings(&self) -> PreUnlockSettings {
        self.state.lock().await.auth.pre_unlock.clone()
    }

    /// Mirrors changed settings into auth.json while auth is enabled.
    pub async fn sync_settings(&self, settings: PreUnlockSettings) {
        let mut state = self.state.lock().await;
        if !state.auth.enabled {
            return;
        }
        state.auth.pre_unlock = settings;
        if let Err(e) = self.save_auth(&state.auth) {
            warn!(error = %e, "Failed to persist pre-unlock settings");
        }
    }

    /// Reports the current rate-limit state.
    pub async fn lockout_status(&self) -> LockoutStatus {
        let state = self.state.lock().await;
        let mut status = LockoutStatus {
            failed_attempts: state.auth.failed_attempts,
            locked_until: state.auth.lockout_until,
            is_locked: false,
            retry_after_secs: 0,
        };

        if let Some(until) = state.auth.lockout_until {
            let now = Utc::now();
            if now < until {
                status.is_locked = true;
                status.retry_after_secs =
                    (until - now).num_seconds().max(0) as u32 + 1;
            }
        }

        if !status.is_locked {
            if let Some(delay) = delay_for_attempts(state.auth.failed_attempts) {
                status.retry_after_secs = delay.as_secs() as u32;
            }
        }

        status
    }

    /// Sets up password authentication for the first time.
    ///
    /// Files are NOT encrypted in-session: the database is open and removing
    /// its file would lose data. Encryption happens on the next lock or
    /// shutdown.
    pub async fn setup(&self, password: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;

        if state.auth.enabled {
            return Err(CoreError::Auth(
                "password already configured, use change_password instead".into(),
            ));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(CoreError::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let salt = kdf::generate_salt(kdf::SALT_LEN);
        let key = kdf::derive_key(password, &salt)?;
        let hash = kdf::encode_password_hash(password, &salt)?;

        state.auth = AuthFile {
            enabled: true,
            password_hash: hash,
            failed_attempts: 0,
            lockout_until: None,
            pre_unlock: state.auth.pre_unlock.clone(),
        };
        self.save_auth(&state.auth)?;

        state.key = Some(key);
        state.unlocked = true;
        info!("Master password configured");
        Ok(())
    }

    /// Verifies the password, decrypts the sensitive files and opens the
    /// database.
    pub async fn unlock(&self, password: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;

        if !state.auth.enabled {
            return Err(CoreError::Auth("auth not enabled".into()));
        }
        if state.unlocked {
            return Ok(());
        }

        // Lockout check
        if let Some(until) = state.auth.lockout_until {
            let now = Utc::now();
            if now < until {
                let remaining = (until - now).num_seconds().max(0) + 1;
                return Err(CoreError::Auth(format!(
                    "locked, try again in {remaining} seconds"
                )));
            }
            state.auth.lockout_until = None;
        }

        // Server-side delay for attempts 4-9. Release the mutex during the
        // sleep so other vault operations are not blocked, then re-check.
        if let Some(delay) = delay_for_attempts(state.auth.failed_attempts) {
            drop(state);
            tokio::time::sleep(delay).await;
            state = self.state.lock().await;
            if state.unlocked {
                return Ok(());
            }
        }

        if !kdf::verify_password_hash(password, &state.auth.password_hash) {
            state.auth.failed_attempts += 1;

            if state.auth.failed_attempts >= MAX_ATTEMPTS_BEFORE_LOCK {
                state.auth.lockout_until =
                    Some(Utc::now() + chrono::Duration::seconds(LOCKOUT_SECS));
                state.auth.failed_attempts = 0;
                warn!("Too many failed attempts, vault locked for {LOCKOUT_SECS} seconds");
            }

            let _ = self.save_auth(&state.auth);
            return Err(CoreError::Auth("incorrect password".into()));
        }

        // Password correct: derive the key from the stored salt and decrypt
        let salt = kdf::extract_salt(&state.auth.password_hash)?;
        let key = kdf::derive_key(password, &salt)?;

        self.decrypt_sensitive_files(&key)?;

        state.auth.failed_attempts = 0;
        state.auth.lockout_until = None;
        self.save_auth(&state.auth)?;

        if let Err(e) = self.gate.open().await {
            // Leave the files in a secure state before surfacing the error
            if let Err(enc_err) = self.encrypt_sensitive_files(&key) {
                warn!(error = %enc_err, "Failed to re-encrypt after open failure");
            }
            return Err(e);
        }

        state.key = Some(key);
        state.unlocked = true;
        drop(state);
        self.events.emit("auth:unlocked", serde_json::Value::Null);
        info!("Vault unlocked");
        Ok(())
    }

    /// Re-encrypts the sensitive files and clears the key.
    pub async fn lock(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.unlocked {
            return Ok(());
        }
        self.lock_internal(&mut state).await?;
        drop(state);
        self.events.emit("auth:locked", serde_json::Value::Null);
        info!("Vault locked");
        Ok(())
    }

    /// Changes the master password.
    ///
    /// Steps: verify old → close database → encrypt with new key → update
    /// auth.json → decrypt with new key → reopen database. Any failure past
    /// the first encryption degrades to the locked state with the NEW
    /// password hash persisted, so recovery is always "unlock with the new
    /// password".
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;

        if !state.auth.enabled {
            return Err(CoreError::Auth("auth not enabled".into()));
        }
        if !state.unlocked {
            return Err(CoreError::Auth(
                "vault must be unlocked to change password".into(),
            ));
        }
        if !kdf::verify_password_hash(old_password, &state.auth.password_hash) {
            return Err(CoreError::Auth("incorrect current password".into()));
        }
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(CoreError::Validation(format!(
                "new password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let new_salt = kdf::generate_salt(kdf::SALT_LEN);
        let new_key = kdf::derive_key(new_password, &new_salt)?;
        let new_hash = kdf::encode_password_hash(new_password, &new_salt)?;

        self.gate.close().await?;

        if let Err(e) = self.encrypt_sensitive_files(&new_key) {
            // Try to restore the working state with whatever was encrypted
            if self.decrypt_sensitive_files(&new_key).is_err() {
                self.degrade_to_locked(&mut state);
                return Err(CoreError::Auth(format!(
                    "re-encryption failed and recovery failed, re-unlock required: {e}"
                )));
            }
            self.gate.open().await?;
            return Err(e);
        }

        state.auth.password_hash = new_hash;
        if let Err(e) = self.save_auth(&state.auth) {
            // Files are sealed under the new key but auth.json write failed.
            // Force the new hash so the user can recover with the new
            // password, then degrade to locked.
            let _ = self.save_auth(&state.auth);
            self.degrade_to_locked(&mut state);
            drop(state);
            self.events.emit("auth:locked", serde_json::Value::Null);
            return Err(CoreError::Auth(format!(
                "failed to save auth data, re-unlock with the new password: {e}"
            )));
        }

        if let Err(e) = self.decrypt_sensitive_files(&new_key) {
            self.degrade_to_locked(&mut state);
            drop(state);
            self.events.emit("auth:locked", serde_json::Value::Null);
            return Err(CoreError::Auth(format!(
                "decryption after password change failed, re-unlock required: {e}"
            )));
        }

        if let Err(e) = self.gate.open().await {
            self.degrade_to_locked(&mut state);
            drop(state);
            self.events.emit("auth:locked", serde_json::Value::Null);
            return Err(CoreError::Auth(format!(
                "database reopen failed after password change, re-unlock required: {e}"
            )));
        }

        state.key = Some(new_key);
        info!("Master password changed");
        Ok(())
    }

    /// Removes password protection and leaves the files plaintext.
    pub async fn remove(&self, password: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;

        if !state.auth.enabled {
            return Err(CoreError::Auth("auth not enabled".into()));
        }
        if !state.unlocked {
            return Err(CoreError::Auth(
                "vault must be unlocked to remove password".into(),
            ));
        }
        if !kdf::verify_password_hash(password, &state.auth.password_hash) {
            return Err(CoreError::Auth("incorrect password".into()));
        }

        // Files are already plaintext (we are unlocked); drop stale .enc
        for base in &self.sensitive_files {
            let _ = std::fs::remove_file(sibling(base, ".enc"));
        }
        let _ = std::fs::remove_file(&self.auth_path);

        state.key = None;
        state.auth = AuthFile {
            pre_unlock: state.auth.pre_unlock.clone(),
            ..AuthFile::default()
        };
        state.unlocked = true;
        info!("Master password removed, auth disabled");
        Ok(())
    }

    // -- internals -----------------------------------------------------

    async fn lock_internal(&self, state: &mut VaultState) -> Result<(), CoreError> {
        let Some(key) = state.key.take() else {
            return Ok(());
        };

        self.gate.close().await?;
        self.encrypt_sensitive_files(&key)?;

        // `key` is Zeroizing: dropped here, memory is wiped
        state.unlocked = false;
        Ok(())
    }

    fn degrade_to_locked(&self, state: &mut VaultState) {
        state.key = None;
        state.unlocked = false;
    }

    /// Encrypts each sensitive file to `.enc` and removes the plaintext
    /// (plus SQLite sidecars).
    fn encrypt_sensitive_files(&self, key: &[u8]) -> Result<(), CoreError> {
        for base in &self.sensitive_files {
            if !base.exists() {
                continue;
            }
            let enc = sibling(base, ".enc");
            aead::encrypt_file(base, &enc, key)?;
            std::fs::remove_file(base)?;
            remove_sidecars(base);
        }
        Ok(())
    }

    /// Decrypts each `.enc` file back to plaintext, removing the `.enc` on
    /// success.
    fn decrypt_sensitive_files(&self, key: &[u8]) -> Result<(), CoreError> {
        for base in &self.sensitive_files {
            let enc = sibling(base, ".enc");
            if !enc.exists() {
                continue;
            }
            aead::decrypt_file(&enc, base, key)?;
            std::fs::remove_file(&enc)?;
        }
        Ok(())
    }

    /// Cleans up inconsistent state from an interrupted encrypt/decrypt.
    ///
    /// When both plaintext and `.enc` exist: with auth enabled the `.enc` is
    /// authoritative and the partial plaintext is removed; with auth
    /// disabled the plaintext is authoritative and the stale `.enc` goes.
    fn recover_from_crash(&self, auth_enabled: bool) {
        for base in &self.sensitive_files {
            let enc = sibling(base, ".enc");
            if base.exists() && enc.exists() {
                if auth_enabled {
                    let _ = std::fs::remove_file(base);
                    remove_sidecars(base);
                    info!(
                        file = %base.display(),
                        "Crash recovery: removed plaintext, keeping .enc"
                    );
                } else {
                    let _ = std::fs::remove_file(&enc);
                    info!(
                        file = %base.display(),
                        "Crash recovery: removed stale .enc, keeping plaintext"
                    );
                }
            }
        }
    }

    fn save_auth(&self, auth: &AuthFile) -> Result<(), CoreError> {
        if let Some(parent) = self.auth_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(auth)
            .map_err(|e| CoreError::Internal(format!("failed to serialise auth.json: {e}")))?;
        std::fs::write(&self.auth_path, data)?;
        Ok(())
    }
}
