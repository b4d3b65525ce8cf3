//! Password key derivation
//!
//! Argon2id with fixed parameters; the encoded hash format is
//! `argon2id$v=19$m=<mem>,t=<iter>,p=<par>$<salt-b64>$<hash-b64>` with
//! unpadded standard base64. The same derivation produces both the stored
//! verification hash and the file-encryption key (from the same salt).

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use driftsync_core::CoreError;

/// Argon2id memory cost in KiB (64 MiB).
pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
/// Argon2id iteration count.
pub const ARGON2_ITERATIONS: u32 = 3;
/// Argon2id lane count.
pub const ARGON2_PARALLELISM: u32 = 4;
/// Derived key length in bytes.
pub const KEY_LEN: usize = 32;
/// Salt length for on-file credentials.
pub const SALT_LEN: usize = 32;
/// Salt length for export envelopes (fits the header's reserved bytes).
pub const EXPORT_SALT_LEN: usize = 16;

fn argon2() -> Argon2<'static> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(KEY_LEN),
    )
    .expect("static Argon2 parameters are valid");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Generates a fresh random salt of the given length.
pub fn generate_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derives a 32-byte encryption key from a password and salt.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, CoreError> {
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    argon2()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CoreError::Internal(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Produces the encoded password hash stored in auth.json.
pub fn encode_password_hash(password: &str, salt: &[u8]) -> Result<String, CoreError> {
    let hash = derive_key(password, salt)?;
    Ok(format!(
        "argon2id$v=19$m={},t={},p={}${}${}",
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(&*hash),
    ))
}

/// Extracts the salt from an encoded password hash.
pub fn extract_salt(encoded: &str) -> Result<Vec<u8>, CoreError> {
    let parts: Vec<&str> = encoded.split('$').collect();
    if parts.len() != 5 {
        return Err(CoreError::Internal("invalid password hash format".into()));
    }
    STANDARD_NO_PAD
        .decode(parts[3])
        .map_err(|_| CoreError::Internal("invalid password hash salt".into()))
}

/// Verifies a password against an encoded hash in constant time.
pub fn verify_password_hash(password: &str, encoded: &str) -> bool {
    let Ok(salt) = extract_salt(encoded) else {
        return false;
    };

    let parts: Vec<&str> = encoded.split('$').collect();
    if parts.len() != 5 {
        return false;
    }
    let Ok(stored) = STANDARD_NO_PAD.decode(parts[4]) else {
        return false;
    };

    let Ok(computed) = derive_key(password, &salt) else {
        return false;
    };

    stored.ct_eq(&computed).into()
}
