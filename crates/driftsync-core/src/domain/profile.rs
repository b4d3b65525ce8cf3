//! Transfer profiles
//!
//! A [`Profile`] is the full specification of one transfer: where to read,
//! where to write, what to include, and which safety/performance knobs to
//! apply. Profiles are stored in the configuration database and embedded
//! verbatim in board edges; the task engine derives its per-task transfer
//! options from them.

use serde::{Deserialize, Serialize};

use super::errors::CoreError;

// ---------------------------------------------------------------------------
// Conflict / deletion policy enums
// ---------------------------------------------------------------------------

/// Which side wins a bi-directional reconciliation conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolve {
    #[default]
    Newer,
    Older,
    Larger,
    Smaller,
    Path1,
    Path2,
}

/// What happens to the losing side of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictLoser {
    /// The loser is deleted.
    Delete,
    /// The loser is renamed with a numeric suffix.
    #[default]
    Num,
    /// The loser is renamed with the path-name suffix.
    Pathname,
}

/// When deletions at the destination are performed relative to transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeleteTiming {
    Before,
    #[default]
    During,
    After,
}

// ---------------------------------------------------------------------------
// Size / duration expressions
// ---------------------------------------------------------------------------

/// Parses a `<number><unit>` size expression into bytes.
///
/// Accepted units: `B`, `K`, `M`, `G`, `T` (optionally suffixed `iB`/`B`,
/// case-insensitive). A bare number is taken as bytes.
pub fn parse_size(expr: &str) -> Result<u64, CoreError> {
    let s = expr.trim();
    if s.is_empty() {
        return Err(CoreError::Validation("empty size expression".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(split);

    let value: f64 = num_part
        .parse()
        .map_err(|_| CoreError::Validation(format!("invalid size expression: {expr}")))?;
    if value < 0.0 {
        return Err(CoreError::Validation(format!("negative size: {expr}")));
    }

    let unit = unit_part.trim().trim_end_matches("iB").trim_end_matches('B');
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        other => {
            return Err(CoreError::Validation(format!(
                "unknown size unit '{other}' in: {expr}"
            )))
        }
    };

    Ok((value * multiplier as f64) as u64)
}

/// Parses a `<number><unit>` age expression into seconds.
///
/// Accepted units: `s`, `m`, `h`, `d`, `w`. A bare number is seconds.
pub fn parse_age(expr: &str) -> Result<u64, CoreError> {
    let s = expr.trim();
    if s.is_empty() {
        return Err(CoreError::Validation("empty age expression".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(split);

    let value: u64 = num_part
        .parse()
        .map_err(|_| CoreError::Validation(format!("invalid age expression: {expr}")))?;

    let multiplier: u64 = match unit_part.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 604_800,
        other => {
            return Err(CoreError::Validation(format!(
                "unknown age unit '{other}' in: {expr}"
            )))
        }
    };

    Ok(value * multiplier)
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Specification of a single transfer.
///
/// `source` and `destination` are location strings: either a local path or
/// `<remote>:<subpath>`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Profile {
    pub source: String,
    pub destination: String,

    /// Include rules (glob syntax, or regex when `use_regex` is set).
    #[serde(default)]
    pub included_paths: Vec<String>,
    /// Exclude rules, evaluated after includes.
    #[serde(default)]
    pub excluded_paths: Vec<String>,
    #[serde(default)]
    pub use_regex: bool,

    /// Lower size bound (`<number><unit>`), empty for none.
    #[serde(default)]
    pub min_size: Option<String>,
    /// Upper size bound (`<number><unit>`), empty for none.
    #[serde(default)]
    pub max_size: Option<String>,
    /// Minimum age (`<number><unit>`), empty for none.
    #[serde(default)]
    pub min_age: Option<String>,
    /// Maximum age (`<number><unit>`), empty for none.
    #[serde(default)]
    pub max_age: Option<String>,
    /// Directory recursion limit, 0 for unlimited.
    #[serde(default)]
    pub max_depth: u32,

    /// Bandwidth cap in MiB/s, 0 for unlimited.
    #[serde(default)]
    pub bandwidth: u32,
    /// Concurrent transfers; checkers scale to twice this when > 0.
    #[serde(default)]
    pub parallel: u32,

    /// High-level retry count for the whole transfer.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Low-level retry count handed to the filesystem abstraction.
    #[serde(default = "default_low_level_retries")]
    pub low_level_retries: u32,
    /// Sleep between high-level retries, in seconds.
    #[serde(default)]
    pub retries_sleep: u32,

    /// Connection timeout in seconds, 0 for the abstraction default.
    #[serde(default)]
    pub conn_timeout: u32,
    /// Per-I/O timeout in seconds, 0 for the abstraction default.
    #[serde(default)]
    pub io_timeout: u32,
    /// Transactions-per-second cap, 0 for unlimited.
    #[serde(default)]
    pub tps_limit: u32,
    /// In-memory buffer size (`<number><unit>`), empty for default.
    #[serde(default)]
    pub buffer_size: Option<String>,
    /// Streams per file for multi-threaded downloads, 0 for default.
    #[serde(default)]
    pub multi_thread_streams: u32,
    /// Transfer ordering key (e.g. `size,ascending`), empty for none.
    #[serde(default)]
    pub order_by: Option<String>,

    /// Conflict winner selection for bi-directional sync.
    #[serde(default)]
    pub conflict_resolve: ConflictResolve,
    /// Treatment of the conflict loser.
    #[serde(default)]
    pub conflict_loser: ConflictLoser,
    /// Suffix applied when the loser is renamed.
    #[serde(default)]
    pub conflict_suffix: Option<String>,
    /// Maximum reconciliation lock hold, in seconds.
    #[serde(default)]
    pub max_lock: u32,

    /// When destination-side deletions happen during one-way sync.
    #[serde(default)]
    pub delete_timing: DeleteTiming,
    /// Refuse to modify existing destination files.
    #[serde(default)]
    pub immutable: bool,

    /// Abort if more than this many deletes would occur, 0 for unlimited.
    #[serde(default)]
    pub max_delete: u32,
    /// Abort if deletes exceed this size (`<number><unit>`), empty for none.
    #[serde(default)]
    pub max_delete_size: Option<String>,
    /// Stop transferring after this much data (`<number><unit>`), empty for none.
    #[serde(default)]
    pub max_transfer: Option<String>,

    /// Suffix for backup renames of overwritten destination files.
    #[serde(default)]
    pub backup_suffix: Option<String>,
    /// Keep the file extension after the backup suffix.
    #[serde(default)]
    pub suffix_keep_extension: bool,

    /// Wrap the source in an ephemeral encryption remote.
    #[serde(default)]
    pub encrypt_source: bool,
    /// Wrap the destination in an ephemeral encryption remote.
    #[serde(default)]
    pub encrypt_dest: bool,
    /// Content encryption password. Cleared before the transfer begins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_password: Option<String>,
    /// Optional salt password. Cleared before the transfer begins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_password2: Option<String>,
    /// Filename encryption policy; `standard` when empty.
    #[serde(default)]
    pub encrypt_filename: Option<String>,
    /// Encrypt directory names too.
    #[serde(default)]
    pub encrypt_directory: bool,

    /// Perform all comparisons but no mutations.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_retries() -> u32 {
    3
}

fn default_low_level_retries() -> u32 {
    10
}

impl Profile {
    /// Creates a minimal profile between two locations with defaults.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Profile {
            source: source.into(),
            destination: destination.into(),
            retries: default_retries(),
            low_level_retries: default_low_level_retries(),
            ..Default::default()
        }
    }

    /// Validates the profile invariants.
    ///
    /// - at least one side is non-empty and the sides differ
    /// - every size/age cap parses as `<number><unit>`
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.source.is_empty() && self.destination.is_empty() {
            return Err(CoreError::Validation(
                "profile needs a source or a destination".into(),
            ));
        }
        if self.source == self.destination {
            return Err(CoreError::Validation(format!(
                "source and destination are identical: {}",
                self.source
            )));
        }

        for (name, expr) in [
            ("min_size", &self.min_size),
            ("max_size", &self.max_size),
            ("buffer_size", &self.buffer_size),
            ("max_delete_size", &self.max_delete_size),
            ("max_transfer", &self.max_transfer),
        ] {
            if let Some(expr) = expr {
                if !expr.is_empty() {
                    parse_size(expr).map_err(|e| {
                        CoreError::Validation(format!("profile {name}: {e}"))
                    })?;
                }
            }
        }

        for (name, expr) in [("min_age", &self.min_age), ("max_age", &self.max_age)] {
            if let Some(expr) = expr {
                if !expr.is_empty() {
                    parse_age(expr).map_err(|e| {
                        CoreError::Validation(format!("profile {name}: {e}"))
                    })?;
                }
            }
        }

        if (self.encrypt_source || self.encrypt_dest)
            && self.encrypt_password.as_deref().unwrap_or("").is_empty()
        {
            return Err(CoreError::Validation(
                "encryption password is required when encryption is enabled".into(),
            ));
        }

        Ok(())
    }

    /// Removes cleartext encryption passwords from the in-memory profile.
    pub fn clear_passwords(&mut self) {
        self.encrypt_password = None;
        self.encrypt_password2 = None;
    }
}
