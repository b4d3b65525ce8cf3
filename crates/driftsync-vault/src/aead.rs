//! Authenticated encryption of blobs and files
//!
//! AES-256-GCM with the layout `[12-byte nonce][ciphertext ∥ tag]`. The
//! nonce is freshly random per encryption; reuse under the same key is
//! forbidden. Decryption failures surface uniformly as
//! [`CoreError::Decryption`] so callers cannot distinguish a wrong password
//! from tampered data.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use driftsync_core::CoreError;

/// GCM nonce size in bytes.
pub const NONCE_LEN: usize = 12;

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CoreError> {
    if key.len() != 32 {
        return Err(CoreError::Internal(format!(
            "encryption key must be 32 bytes, got {}",
            key.len()
        )));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}

/// Encrypts raw data; output is `[nonce][ciphertext ∥ tag]`.
pub fn encrypt_data(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CoreError> {
    let cipher = cipher(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload::from(data))
        .map_err(|_| CoreError::Internal("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts `[nonce][ciphertext ∥ tag]` data.
pub fn decrypt_data(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CoreError> {
    let cipher = cipher(key)?;

    if data.len() < NONCE_LEN {
        return Err(CoreError::Decryption);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), Payload::from(ciphertext))
        .map_err(|_| CoreError::Decryption)
}

/// Encrypts a file to `dst` with restrictive permissions.
pub fn encrypt_file(src: &Path, dst: &Path, key: &[u8]) -> Result<(), CoreError> {
    let plaintext = std::fs::read(src)?;
    let sealed = encrypt_data(&plaintext, key)?;
    write_private(dst, &sealed)
}

/// Decrypts a file to `dst` with restrictive permissions.
pub fn decrypt_file(src: &Path, dst: &Path, key: &[u8]) -> Result<(), CoreError> {
    let sealed = std::fs::read(src)?;
    let plaintext = decrypt_data(&sealed, key)?;
    write_private(dst, &plaintext)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> Result<(), CoreError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> Result<(), CoreError> {
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Vec<u8> {
        vec![7u8; 32]
    }

    #[test]
    fn test_round_trip() {
        let data = b"the quick brown fox";
        let sealed = encrypt_data(data, &key()).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], data.as_slice());
        let opened = decrypt_data(&sealed, &key()).unwrap();
        assert_eq!(opened, data);
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let sealed_a = encrypt_data(b"x", &key()).unwrap();
        let sealed_b = encrypt_data(b"x", &key()).unwrap();
        assert_ne!(sealed_a[..NONCE_LEN], sealed_b[..NONCE_LEN]);
        assert_ne!(sealed_a, sealed_b);
    }

    #[test]
    fn test_single_bit_flip_fails() {
        let sealed = encrypt_data(b"sensitive", &key()).unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(decrypt_data(&tampered, &key()), Err(CoreError::Decryption)),
                "bit flip at byte {i} was not detected"
            );
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt_data(b"secret", &key()).unwrap();
        let wrong = vec![8u8; 32];
        assert!(matches!(
            decrypt_data(&sealed, &wrong),
            Err(CoreError::Decryption)
        ));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        assert!(matches!(
            decrypt_data(&[1, 2, 3], &key()),
            Err(CoreError::Decryption)
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("data.db");
        let sealed = dir.path().join("data.db.enc");
        let restored = dir.path().join("restored.db");

        std::fs::write(&plain, b"database contents").unwrap();
        encrypt_file(&plain, &sealed, &key()).unwrap();
        decrypt_file(&sealed, &restored, &key()).unwrap();

        assert_eq!(std::fs::read(&restored).unwrap(), b"database contents");
    }
}
