//! Task-scoped accounting
//!
//! Each task collects its counters in its own [`TaskStats`] group so that
//! concurrent tasks never sum into the same numbers. The filesystem
//! abstraction mutates the group while a transfer runs; the progress
//! aggregator reads typed [`StatsSnapshot`] values out of it.
//!
//! The snapshot is a concrete struct rather than a heterogeneous map: the
//! single conversion from backend-native stats happens in the adapter that
//! owns the backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Completed transfers retained for the composed transfer list.
const COMPLETED_RING_CAPACITY: usize = 100;

/// An in-flight transfer as reported by the abstraction.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub name: String,
    pub size: u64,
    pub bytes: u64,
    /// Percentage 0–100.
    pub percentage: u8,
    /// Bytes per second.
    pub speed: f64,
}

/// A finished transfer (or check) kept in the completed ring.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub name: String,
    pub size: u64,
    pub bytes: u64,
    /// Set when the file was verified rather than copied.
    pub checked: bool,
    pub error: Option<String>,
}

/// Typed snapshot of a task's accounting group.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub total_transfers: u64,
    pub total_bytes: u64,
    pub transfers: u64,
    pub bytes: u64,
    pub errors: u64,
    pub checks: u64,
    pub total_checks: u64,
    pub deletes: u64,
    pub renames: u64,
    /// Bytes per second over the task lifetime.
    pub speed: f64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub transferring: Vec<TransferProgress>,
    pub checking: Vec<String>,
    pub completed: Vec<CompletedTransfer>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct InFlight {
    transferring: Vec<TransferProgress>,
    checking: Vec<String>,
    completed: VecDeque<CompletedTransfer>,
    last_error: Option<String>,
}

/// Per-task statistics group.
#[derive(Debug)]
pub struct TaskStats {
    started: Instant,
    total_transfers: AtomicU64,
    total_bytes: AtomicU64,
    transfers: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    checks: AtomicU64,
    total_checks: AtomicU64,
    deletes: AtomicU64,
    renames: AtomicU64,
    in_flight: Mutex<InFlight>,
}

impl Default for TaskStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStats {
    pub fn new() -> Self {
        TaskStats {
            started: Instant::now(),
            total_transfers: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            total_checks: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            renames: AtomicU64::new(0),
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    // -- totals --------------------------------------------------------

    /// Registers work discovered during listing.
    pub fn add_totals(&self, files: u64, bytes: u64) {
        self.total_transfers.fetch_add(files, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_total_checks(&self, checks: u64) {
        self.total_checks.fetch_add(checks, Ordering::Relaxed);
    }

    // -- transfers -----------------------------------------------------

    /// Marks a file as transferring.
    pub fn begin_transfer(&self, name: &str, size: u64) {
        let mut inner = self.in_flight.lock().unwrap();
        inner.transferring.push(TransferProgress {
            name: name.to_string(),
            size,
            bytes: 0,
            percentage: 0,
            speed: 0.0,
        });
    }

    /// Updates byte progress for an in-flight transfer.
    pub fn update_transfer(&self, name: &str, bytes: u64, speed: f64) {
        let mut inner = self.in_flight.lock().unwrap();
        if let Some(t) = inner.transferring.iter_mut().find(|t| t.name == name) {
            t.bytes = bytes;
            t.speed = speed;
            t.percentage = if t.size > 0 {
                ((bytes as f64 / t.size as f64) * 100.0).min(100.0) as u8
            } else {
                0
            };
        }
    }

    /// Completes a transfer, moving it to the completed ring.
    pub fn end_transfer(&self, name: &str, bytes: u64, error: Option<String>) {
        let mut inner = self.in_flight.lock().unwrap();
        let size = inner
            .transferring
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.size)
            .unwrap_or(bytes);
        inner.transferring.retain(|t| t.name != name);

        if error.is_some() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            inner.last_error.clone_from(&error);
        } else {
            self.transfers.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(bytes, Ordering::Relaxed);
        }

        push_completed(
            &mut inner.completed,
            CompletedTransfer {
                name: name.to_string(),
                size,
                bytes,
                checked: false,
                error,
            },
        );
    }

    // -- checks --------------------------------------------------------

    /// Marks a file as being checked.
    pub fn begin_check(&self, name: &str) {
        let mut inner = self.in_flight.lock().unwrap();
        if !inner.checking.iter().any(|c| c == name) {
            inner.checking.push(name.to_string());
        }
    }

    /// Removes a file from the checking set without counting a check.
    /// Used when a comparison decides the file needs transferring instead.
    pub fn abandon_check(&self, name: &str) {
        let mut inner = self.in_flight.lock().unwrap();
        inner.checking.retain(|c| c != name);
    }

    /// Finishes a check; matched files enter the completed ring as checked.
    pub fn end_check(&self, name: &str, size: u64) {
        let mut inner = self.in_flight.lock().unwrap();
        inner.checking.retain(|c| c != name);
        self.checks.fetch_add(1, Ordering::Relaxed);
        push_completed(
            &mut inner.completed,
            CompletedTransfer {
                name: name.to_string(),
                size,
                bytes: size,
                checked: true,
                error: None,
            },
        );
    }

    // -- other counters ------------------------------------------------

    pub fn add_error(&self, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.in_flight.lock().unwrap();
        inner.last_error = Some(message.into());
    }

    pub fn add_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rename(&self) {
        self.renames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    // -- snapshot ------------------------------------------------------

    /// Produces a typed snapshot of the whole group.
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.started.elapsed();
        let bytes = self.bytes.load(Ordering::Relaxed);
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);

        let speed = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let eta = if speed > 0.0 && total_bytes > bytes {
            Some(Duration::from_secs_f64(
                (total_bytes - bytes) as f64 / speed,
            ))
        } else {
            None
        };

        let inner = self.in_flight.lock().unwrap();
        StatsSnapshot {
            total_transfers: self.total_transfers.load(Ordering::Relaxed),
            total_bytes,
            transfers: self.transfers.load(Ordering::Relaxed),
            bytes,
            errors: self.errors.load(Ordering::Relaxed),
            checks: self.checks.load(Ordering::Relaxed),
            total_checks: self.total_checks.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            speed,
            eta,
            elapsed,
            transferring: inner.transferring.clone(),
            checking: inner.checking.clone(),
            completed: inner.completed.iter().cloned().collect(),
            last_error: inner.last_error.clone(),
        }
    }
}

fn push_completed(ring: &mut VecDeque<CompletedTransfer>, entry: CompletedTransfer) {
    if ring.len() == COMPLETED_RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_lifecycle() {
        let stats = TaskStats::new();
        stats.add_totals(2, 200);
        stats.begin_transfer("a.txt", 100);

        let snap = stats.snapshot();
        assert_eq!(snap.transferring.len(), 1);
        assert_eq!(snap.total_transfers, 2);
        assert_eq!(snap.total_bytes, 200);

        stats.end_transfer("a.txt", 100, None);
        let snap = stats.snapshot();
        assert!(snap.transferring.is_empty());
        assert_eq!(snap.transfers, 1);
        assert_eq!(snap.bytes, 100);
        assert_eq!(snap.completed.len(), 1);
        assert!(!snap.completed[0].checked);
    }

    #[test]
    fn test_failed_transfer_counts_error() {
        let stats = TaskStats::new();
        stats.begin_transfer("a.txt", 100);
        stats.end_transfer("a.txt", 10, Some("connection reset".into()));

        let snap = stats.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.transfers, 0);
        assert_eq!(snap.completed[0].error.as_deref(), Some("connection reset"));
        assert_eq!(snap.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_check_lifecycle() {
        let stats = TaskStats::new();
        stats.begin_check("b.txt");
        assert_eq!(stats.snapshot().checking, vec!["b.txt".to_string()]);

        stats.end_check("b.txt", 42);
        let snap = stats.snapshot();
        assert!(snap.checking.is_empty());
        assert_eq!(snap.checks, 1);
        assert!(snap.completed[0].checked);
    }

    #[test]
    fn test_completed_ring_is_bounded() {
        let stats = TaskStats::new();
        for i in 0..150 {
            stats.begin_transfer(&format!("f{i}"), 1);
            stats.end_transfer(&format!("f{i}"), 1, None);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.completed.len(), COMPLETED_RING_CAPACITY);
        // Oldest entries were dropped
        assert_eq!(snap.completed[0].name, "f50");
    }

    #[test]
    fn test_update_transfer_percentage() {
        let stats = TaskStats::new();
        stats.begin_transfer("big.bin", 1000);
        stats.update_transfer("big.bin", 500, 123.0);
        let snap = stats.snapshot();
        assert_eq!(snap.transferring[0].percentage, 50);
        assert_eq!(snap.transferring[0].bytes, 500);
    }
}
