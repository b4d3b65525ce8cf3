//! File-backed credentials store
//!
//! Manages the backend credentials file as INI-style sections, the format
//! the filesystem abstraction reads its remote definitions from. Only the
//! operations the core needs are implemented: listing sections, creating
//! ephemeral crypt sections, and deleting sections.
//!
//! Passwords are stored reversibly encoded, matching the conventions of
//! the credentials format; the at-rest protection for this file is the
//! vault's AEAD, not the encoding.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use tokio::sync::Mutex;

use driftsync_core::ports::{CredentialsStore, CryptRemoteParams};
use driftsync_core::CoreError;

/// INI-style credentials file.
pub struct FileCredentialsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialsStore {
    pub fn new(path: PathBuf) -> Self {
        FileCredentialsStore {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<String, CoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, content: &str) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

fn section_names(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .map(str::to_string)
        })
        .collect()
}

/// Removes one `[name]` section and its body from the file content.
fn remove_section(content: &str, name: &str) -> String {
    let header = format!("[{name}]");
    let mut out = String::with_capacity(content.len());
    let mut skipping = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            skipping = trimmed == header;
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn encode_password(password: &str) -> String {
    STANDARD_NO_PAD.encode(password.as_bytes())
}

#[async_trait]
impl CredentialsStore for FileCredentialsStore {
    async fn create_crypt_remote(
        &self,
        name: &str,
        params: CryptRemoteParams,
    ) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let content = self.read().await?;

        if section_names(&content).iter().any(|s| s == name) {
            return Err(CoreError::Validation(format!(
                "remote {name} already exists"
            )));
        }

        let mut section = format!(
            "[{name}]\ntype = crypt\nremote = {}\npassword = {}\nfilename_encryption = {}\ndirectory_name_encryption = {}\n",
            params.wrapped,
            encode_password(&params.password),
            params.filename_encryption,
            params.directory_name_encryption,
        );
        if let Some(password2) = &params.password2 {
            section.push_str(&format!("password2 = {}\n", encode_password(password2)));
        }

        let mut updated = content;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&section);
        self.write(&updated).await
    }

    async fn delete_remote(&self, name: &str) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let content = self.read().await?;
        self.write(&remove_section(&content, name)).await
    }

    async fn list_remotes(&self) -> Result<Vec<String>, CoreError> {
        let _guard = self.lock.lock().await;
        let content = self.read().await?;
        Ok(section_names(&content))
    }
}
