//! Ephemeral encryption-wrapping remotes
//!
//! When a profile asks for source- or destination-side encryption, the
//! engine creates a temporary crypt remote around the real endpoint in the
//! credentials store, rewrites the profile to point at it, and clears the
//! cleartext passwords from memory before the transfer begins. The remotes
//! share a well-known name prefix so an orphan sweep at startup can remove
//! leftovers from crashes.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use driftsync_core::domain::profile::Profile;
use driftsync_core::ports::{CredentialsStore, CryptRemoteParams};
use driftsync_core::CoreError;

/// Name prefix shared by all ephemeral crypt remotes.
pub const TEMP_CRYPT_PREFIX: &str = "_tmp_crypt_";

fn temp_remote_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{TEMP_CRYPT_PREFIX}{}", &id[..8])
}

/// Removal handle for the ephemeral remotes created by one wrapping call.
///
/// The engine runs it on every exit path of the transfer.
pub struct CryptCleanup {
    store: Arc<dyn CredentialsStore>,
    names: Vec<String>,
}

impl CryptCleanup {
    /// Deletes the ephemeral remotes. Failures are logged, not surfaced:
    /// the startup orphan sweep is the safety net.
    pub async fn run(self) {
        for name in &self.names {
            match self.store.delete_remote(name).await {
                Ok(()) => info!(remote = %name, "Deleted ephemeral crypt remote"),
                Err(e) => {
                    warn!(remote = %name, error = %e, "Failed to delete ephemeral crypt remote")
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Creates ephemeral crypt remotes for the profile's encrypted sides and
/// rewrites `source`/`destination` to point at them.
///
/// Cleartext passwords are removed from the in-memory profile before this
/// function returns, whether it succeeds or fails.
pub async fn apply_crypt_wrapping(
    store: Arc<dyn CredentialsStore>,
    profile: &mut Profile,
) -> Result<CryptCleanup, CoreError> {
    let mut names = Vec::new();

    if !profile.encrypt_source && !profile.encrypt_dest {
        profile.clear_passwords();
        return Ok(CryptCleanup { store, names });
    }

    let password = match profile.encrypt_password.as_deref() {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => {
            profile.clear_passwords();
            return Err(CoreError::Validation(
                "encryption password is required when encryption is enabled".into(),
            ));
        }
    };
    let password2 = profile.encrypt_password2.clone();
    let filename_encryption = profile
        .encrypt_filename
        .clone()
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| "standard".to_string());

    let sides = [
        (profile.encrypt_source, profile.source.clone()),
        (profile.encrypt_dest, profile.destination.clone()),
    ];

    let mut wrapped_names: [Option<String>; 2] = [None, None];
    for (idx, (enabled, wrapped)) in sides.into_iter().enumerate() {
        if !enabled {
            continue;
        }
        let name = temp_remote_name();
        let params = CryptRemoteParams {
            wrapped: wrapped.clone(),
            password: password.clone(),
            password2: password2.clone(),
            filename_encryption: filename_encryption.clone(),
            directory_name_encryption: profile.encrypt_directory,
        };

        if let Err(e) = store.create_crypt_remote(&name, params).await {
            profile.clear_passwords();
            // Remove anything created so far
            CryptCleanup {
                store: Arc::clone(&store),
                names,
            }
            .run()
            .await;
            return Err(e);
        }

        info!(remote = %name, wrapped = %wrapped, "Created ephemeral crypt remote");
        names.push(name.clone());
        wrapped_names[idx] = Some(name);
    }

    if let Some(name) = &wrapped_names[0] {
        profile.source = format!("{name}:");
    }
    if let Some(name) = &wrapped_names[1] {
        profile.destination = format!("{name}:");
    }

    // The passwords now live only in the credentials store
    profile.clear_passwords();

    Ok(CryptCleanup { store, names })
}

/// Removes every credentials section carrying the ephemeral prefix.
/// Called once at startup to clean up after crashes.
pub async fn cleanup_orphaned_remotes(store: &Arc<dyn CredentialsStore>) -> usize {
    let remotes = match store.list_remotes().await {
        Ok(remotes) => remotes,
        Err(e) => {
            warn!(error = %e, "Failed to list remotes for orphan sweep");
            return 0;
        }
    };

    let mut removed = 0;
    for name in remotes {
        if name.starts_with(TEMP_CRYPT_PREFIX) {
            match store.delete_remote(&name).await {
                Ok(()) => {
                    info!(remote = %name, "Cleaned up orphaned crypt remote");
                    removed += 1;
                }
                Err(e) => warn!(remote = %name, error = %e, "Failed to remove orphan"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryCredentials {
        remotes: Mutex<HashMap<String, CryptRemoteParams>>,
    }

    #[async_trait]
    impl CredentialsStore for MemoryCredentials {
        async fn create_crypt_remote(
            &self,
            name: &str,
            params: CryptRemoteParams,
        ) -> Result<(), CoreError> {
            self.remotes
                .lock()
                .unwrap()
                .insert(name.to_string(), params);
            Ok(())
        }

        async fn delete_remote(&self, name: &str) -> Result<(), CoreError> {
            self.remotes.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_remotes(&self) -> Result<Vec<String>, CoreError> {
            Ok(self.remotes.lock().unwrap().keys().cloned().collect())
        }
    }

    fn encrypted_profile() -> Profile {
        let mut profile = Profile::new("/data", "gdrive:/backup");
        profile.encrypt_dest = true;
        profile.encrypt_password = Some("secret".into());
        profile
    }

    #[tokio::test]
    async fn test_wraps_destination_and_clears_passwords() {
        let store = Arc::new(MemoryCredentials::default());
        let mut profile = encrypted_profile();

        let cleanup =
            apply_crypt_wrapping(Arc::clone(&store) as Arc<dyn CredentialsStore>, &mut profile)
                .await
                .unwrap();

        assert!(profile.destination.starts_with(TEMP_CRYPT_PREFIX));
        assert!(profile.destination.ends_with(':'));
        assert_eq!(profile.source, "/data");
        assert!(profile.encrypt_password.is_none());

        let remotes = store.remotes.lock().unwrap();
        assert_eq!(remotes.len(), 1);
        let params = remotes.values().next().unwrap();
        assert_eq!(params.wrapped, "gdrive:/backup");
        assert_eq!(params.filename_encryption, "standard");
        drop(remotes);

        cleanup.run().await;
        assert!(store.remotes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wraps_both_sides() {
        let store = Arc::new(MemoryCredentials::default());
        let mut profile = encrypted_profile();
        profile.encrypt_source = true;

        let cleanup =
            apply_crypt_wrapping(Arc::clone(&store) as Arc<dyn CredentialsStore>, &mut profile)
                .await
                .unwrap();

        assert!(profile.source.starts_with(TEMP_CRYPT_PREFIX));
        assert!(profile.destination.starts_with(TEMP_CRYPT_PREFIX));
        assert_ne!(profile.source, profile.destination);
        assert_eq!(store.remotes.lock().unwrap().len(), 2);
        cleanup.run().await;
    }

    #[tokio::test]
    async fn test_no_encryption_is_passthrough() {
        let store = Arc::new(MemoryCredentials::default());
        let mut profile = Profile::new("/a", "gdrive:/b");
        let cleanup =
            apply_crypt_wrapping(Arc::clone(&store) as Arc<dyn CredentialsStore>, &mut profile)
                .await
                .unwrap();
        assert!(cleanup.is_empty());
        assert_eq!(profile.source, "/a");
    }

    #[tokio::test]
    async fn test_missing_password_is_rejected() {
        let store = Arc::new(MemoryCredentials::default());
        let mut profile = encrypted_profile();
        profile.encrypt_password = None;
        let result =
            apply_crypt_wrapping(Arc::clone(&store) as Arc<dyn CredentialsStore>, &mut profile)
                .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_partial_failure_rolls_back() {
        // First create succeeds, second fails: the first must be removed
        struct SecondFails {
            inner: MemoryCredentials,
            calls: Mutex<u32>,
        }
        #[async_trait]
        impl CredentialsStore for SecondFails {
            async fn create_crypt_remote(
                &self,
                name: &str,
                params: CryptRemoteParams,
            ) -> Result<(), CoreError> {
                let is_second = {
                    let mut calls = self.calls.lock().unwrap();
                    *calls += 1;
                    *calls == 2
                };
                if is_second {
                    return Err(CoreError::fs_permanent("quota"));
                }
                self.inner.create_crypt_remote(name, params).await
            }
            async fn delete_remote(&self, name: &str) -> Result<(), CoreError> {
                self.inner.delete_remote(name).await
            }
            async fn list_remotes(&self) -> Result<Vec<String>, CoreError> {
                self.inner.list_remotes().await
            }
        }

        let store = Arc::new(SecondFails {
            inner: MemoryCredentials::default(),
            calls: Mutex::new(0),
        });
        let mut profile = encrypted_profile();
        profile.encrypt_source = true;
        let result =
            apply_crypt_wrapping(Arc::clone(&store) as Arc<dyn CredentialsStore>, &mut profile)
                .await;
        assert!(result.is_err());
        // The first remote was rolled back
        assert!(store.inner.remotes.lock().unwrap().is_empty());
        assert!(profile.encrypt_password.is_none());
    }

    #[tokio::test]
    async fn test_orphan_sweep_removes_only_prefixed() {
        let store = Arc::new(MemoryCredentials::default());
        store
            .create_crypt_remote(
                "_tmp_crypt_deadbeef",
                CryptRemoteParams {
                    wrapped: "gdrive:/x".into(),
                    password: "p".into(),
                    password2: None,
                    filename_encryption: "standard".into(),
                    directory_name_encryption: true,
                },
            )
            .await
            .unwrap();
        store
            .create_crypt_remote(
                "gdrive",
                CryptRemoteParams {
                    wrapped: String::new(),
                    password: String::new(),
                    password2: None,
                    filename_encryption: "standard".into(),
                    directory_name_encryption: false,
                },
            )
            .await
            .unwrap();

        let store_dyn: Arc<dyn CredentialsStore> = Arc::clone(&store) as _;
        let removed = cleanup_orphaned_remotes(&store_dyn).await;
        assert_eq!(removed, 1);
        let remaining = store.remotes.lock().unwrap();
        assert!(remaining.contains_key("gdrive"));
        assert!(!remaining.contains_key("_tmp_crypt_deadbeef"));
    }
}
