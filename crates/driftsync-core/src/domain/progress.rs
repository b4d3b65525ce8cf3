//! Progress sample model
//!
//! A [`ProgressSample`] is the structured snapshot emitted roughly every
//! 500 ms per running task: aggregate counters, the composed per-file
//! transfer list, derived speed/ETA strings, and a bounded tail of captured
//! log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-file status inside a progress sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Checking,
    Transferring,
    Checked,
    Completed,
    Failed,
}

/// One file's entry in the composed transfer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub bytes: u64,
    /// Percentage 0–100.
    #[serde(default)]
    pub progress: f64,
    /// Bytes per second for in-flight transfers.
    #[serde(default)]
    pub speed: f64,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall status of the sample's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Running,
    Completed,
    Error,
    Failed,
    Cancelled,
}

/// Structured snapshot of one running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSample {
    pub status: SampleStatus,
    pub timestamp: DateTime<Utc>,

    pub total_files: u64,
    pub total_bytes: u64,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    /// Derived from the composed transfer list, not the raw counter.
    pub errors: u64,
    /// Derived from the composed transfer list, not the raw counter.
    pub checks: u64,
    pub total_checks: u64,
    pub deletes: u64,
    pub renames: u64,

    /// Percentage 0–100.
    pub progress: f64,
    pub speed: String,
    pub eta: String,
    pub elapsed: String,

    #[serde(default)]
    pub transfers: Vec<FileTransfer>,
    /// Bounded tail of log lines captured since the previous sample.
    #[serde(default)]
    pub log_messages: Vec<String>,

    /// True when the sync was skipped because both sides reported no changes.
    #[serde(default)]
    pub delta_skipped: bool,
    /// True when the sync ran scoped to watcher-reported paths.
    #[serde(default)]
    pub delta_scoped: bool,
}

impl ProgressSample {
    /// An empty running sample with zeroed counters.
    pub fn empty() -> Self {
        ProgressSample {
            status: SampleStatus::Running,
            timestamp: Utc::now(),
            total_files: 0,
            total_bytes: 0,
            files_transferred: 0,
            bytes_transferred: 0,
            errors: 0,
            checks: 0,
            total_checks: 0,
            deletes: 0,
            renames: 0,
            progress: 0.0,
            speed: String::new(),
            eta: "-".into(),
            elapsed: "0s".into(),
            transfers: Vec::new(),
            log_messages: Vec::new(),
            delta_skipped: false,
            delta_scoped: false,
        }
    }

    /// The synthetic sample emitted when the delta engine skips a sync.
    pub fn delta_skip() -> Self {
        ProgressSample {
            status: SampleStatus::Completed,
            progress: 100.0,
            speed: "0 B/s".into(),
            delta_skipped: true,
            ..ProgressSample::empty()
        }
    }
}

/// Formats bytes per second as a human-readable rate.
pub fn format_speed(bytes_per_second: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    if bytes_per_second < KB {
        format!("{bytes_per_second:.1} B/s")
    } else if bytes_per_second < MB {
        format!("{:.1} KB/s", bytes_per_second / KB)
    } else if bytes_per_second < GB {
        format!("{:.1} MB/s", bytes_per_second / MB)
    } else {
        format!("{:.1} GB/s", bytes_per_second / GB)
    }
}

/// Formats a duration as `Ns`, `NmMs` or `NhMm`.
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}
