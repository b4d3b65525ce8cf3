//! driftsync vault - master-password lifecycle and at-rest encryption
//!
//! While locked, the configuration database and the backend credentials file
//! exist only as `<name>.enc`, sealed with AES-256-GCM under an
//! Argon2id-derived key. `auth.json` (the password hash, rate-limit state
//! and a small pre-unlock settings blob) stays plaintext so the application
//! can behave correctly before unlock.
//!
//! ## Key Components
//!
//! - [`kdf`] - Argon2id derivation and the encoded password hash format
//! - [`aead`] - AES-256-GCM sealing of blobs and files
//! - [`Vault`] - lock/unlock lifecycle, rate limiting, crash recovery
//! - [`envelope`] - the export format's encryption envelope

pub mod aead;
pub mod envelope;
pub mod kdf;
pub mod vault;

pub use vault::{AuthFile, LockoutStatus, PreUnlockSettings, Vault};
