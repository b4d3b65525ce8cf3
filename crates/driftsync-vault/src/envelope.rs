//! Export encryption envelope
//!
//! The export file format itself lives outside the core; this module owns
//! only its encryption envelope:
//!
//! ```text
//! [magic 4][version 1][flags 1][reserved 16 bytes: salt][sections...]
//! section := [length u32 LE][sealed bytes]
//! ```
//!
//! Each section is independently sealed with AES-256-GCM under an
//! Argon2id-derived key. The salt uses the header's 16 reserved bytes,
//! which is why export key derivation uses the shorter salt length. A flag
//! bit marks encrypted exports; unencrypted exports carry zeroed salt bytes
//! and raw sections.

use zeroize::Zeroizing;

use driftsync_core::CoreError;

use crate::aead;
use crate::kdf;

/// Export envelope magic bytes.
pub const MAGIC: [u8; 4] = *b"DSEX";
/// Current envelope version.
pub const VERSION: u8 = 1;
/// Flag bit marking an encrypted export.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0001;

const HEADER_LEN: usize = 4 + 1 + 1 + kdf::EXPORT_SALT_LEN;

/// Derives a fresh export key; returns the key and the 16-byte salt that
/// goes into the header's reserved bytes.
pub fn derive_export_key(password: &str) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), CoreError> {
    let salt = kdf::generate_salt(kdf::EXPORT_SALT_LEN);
    let key = kdf::derive_key(password, &salt)?;
    Ok((key, salt))
}

/// Re-derives an export key from the salt read out of a header.
pub fn derive_export_key_with_salt(
    password: &str,
    salt: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CoreError> {
    kdf::derive_key(password, salt)
}

/// Seals export sections into an envelope. With a password every section is
/// encrypted independently; without one the sections are stored raw.
pub fn write_envelope(
    sections: &[Vec<u8>],
    password: Option<&str>,
) -> Result<Vec<u8>, CoreError> {
    let (flags, salt, key) = match password {
        Some(password) => {
            let (key, salt) = derive_export_key(password)?;
            (FLAG_ENCRYPTED, salt, Some(key))
        }
        None => (0u8, vec![0u8; kdf::EXPORT_SALT_LEN], None),
    };

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(flags);
    out.extend_from_slice(&salt);

    for section in sections {
        let body = match &key {
            Some(key) => aead::encrypt_data(section, key)?,
            None => section.clone(),
        };
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
    }

    Ok(out)
}

/// Opens an envelope, decrypting sections when the encrypted flag is set.
pub fn read_envelope(data: &[u8], password: Option<&str>) -> Result<Vec<Vec<u8>>, CoreError> {
    if data.len() < HEADER_LEN || data[..4] != MAGIC {
        return Err(CoreError::Validation("not a driftsync export".into()));
    }
    if data[4] != VERSION {
        return Err(CoreError::Validation(format!(
            "unsupported export version {}",
            data[4]
        )));
    }

    let flags = data[5];
    let encrypted = flags & FLAG_ENCRYPTED != 0;
    let salt = &data[6..HEADER_LEN];

    let key = if encrypted {
        let password = password.ok_or_else(|| {
            CoreError::Auth("export is encrypted, password required".into())
        })?;
        Some(derive_export_key_with_salt(password, salt)?)
    } else {
        None
    };

    let mut sections = Vec::new();
    let mut cursor = HEADER_LEN;
    while cursor < data.len() {
        if cursor + 4 > data.len() {
            return Err(CoreError::Validation("truncated export section".into()));
        }
        let len = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + len > data.len() {
            return Err(CoreError::Validation("truncated export section".into()));
        }
        let body = &data[cursor..cursor + len];
        cursor += len;

        let section = match &key {
            Some(key) => aead::decrypt_data(body, key)?,
            None => body.to_vec(),
        };
        sections.push(section);
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_round_trip() {
        let sections = vec![b"profiles".to_vec(), b"boards".to_vec()];
        let envelope = write_envelope(&sections, Some("export-pw")).unwrap();

        assert_eq!(&envelope[..4], &MAGIC);
        assert_eq!(envelope[5] & FLAG_ENCRYPTED, FLAG_ENCRYPTED);

        let opened = read_envelope(&envelope, Some("export-pw")).unwrap();
        assert_eq!(opened, sections);
    }

    #[test]
    fn test_plain_round_trip() {
        let sections = vec![b"settings".to_vec()];
        let envelope = write_envelope(&sections, None).unwrap();
        assert_eq!(envelope[5] & FLAG_ENCRYPTED, 0);
        // Reserved salt bytes are zeroed for plain exports
        assert!(envelope[6..6 + kdf::EXPORT_SALT_LEN].iter().all(|b| *b == 0));
        assert_eq!(read_envelope(&envelope, None).unwrap(), sections);
    }

    #[test]
    fn test_wrong_password_fails() {
        let envelope = write_envelope(&[b"data".to_vec()], Some("right")).unwrap();
        assert!(matches!(
            read_envelope(&envelope, Some("wrong")),
            Err(CoreError::Decryption)
        ));
    }

    #[test]
    fn test_missing_password_is_auth_error() {
        let envelope = write_envelope(&[b"data".to_vec()], Some("pw")).unwrap();
        assert!(matches!(
            read_envelope(&envelope, None),
            Err(CoreError::Auth(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        assert!(read_envelope(b"definitely not an export", None).is_err());
    }

    #[test]
    fn test_rejects_truncated_section() {
        let mut envelope = write_envelope(&[b"data".to_vec()], None).unwrap();
        envelope.truncate(envelope.len() - 2);
        assert!(matches!(
            read_envelope(&envelope, None),
            Err(CoreError::Validation(_))
        ));
    }
}
