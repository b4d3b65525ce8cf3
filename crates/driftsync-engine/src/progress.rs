//! Progress aggregation
//!
//! Merges task-scoped accounting snapshots with captured backend log lines
//! into a single stream of [`ProgressSample`] values, emitted on a bounded
//! channel at a fixed interval. The sender never blocks: when the channel
//! is full the sample is dropped.
//!
//! ## Teardown
//!
//! Teardown is an explicit state machine:
//!
//! ```text
//! Running → Draining → Joining → Final → Closed
//! ```
//!
//! 1. *Draining*: the closed flag stops new log lines from being considered
//! 2. the sampler is signalled to stop
//! 3. *Joining*: the sampler task is awaited
//! 4. *Final*: one last sample with any residual log lines is emitted
//! 5. *Closed*: the output channel itself is owned by the caller and is
//!    never closed from inside the engine

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use driftsync_core::domain::progress::{
    format_duration, format_speed, FileTransfer, ProgressSample, SampleStatus, TransferStatus,
};
use driftsync_core::ports::LogBuffer;
use driftsync_core::stats::{StatsSnapshot, TaskStats};

/// Default interval between progress samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum log lines attached to one sample.
pub const MAX_LOG_LINES_PER_SAMPLE: usize = 50;

/// Completed checks remembered across samples.
const MAX_COMPLETED_CHECKS: usize = 100;

// ---------------------------------------------------------------------------
// Log line processing
// ---------------------------------------------------------------------------

/// Strips `[group] ` headers and backend log level tags, returning the
/// message content.
///
/// `"[task-1] 2026/02/10 20:18:46 NOTICE: actual message"` → `"actual message"`.
pub fn extract_log_content(message: &str) -> String {
    let mut msg = message;

    // Strip all leading [...] groups (a line may have been re-captured)
    while msg.starts_with('[') {
        match msg.find("] ") {
            Some(idx) => msg = &msg[idx + 2..],
            None => break,
        }
    }

    // Strip the level tag and everything before it
    for tag in ["NOTICE:", "INFO  :", "DEBUG :", "ERROR :", "WARNING:"] {
        if let Some(idx) = msg.rfind(tag) {
            msg = &msg[idx + tag.len()..];
            break;
        }
    }

    msg.trim().to_string()
}

/// True for lines that should never reach the user: internal event-plumbing
/// traces and the backend's own periodic stats output (already captured as
/// typed counters).
pub fn should_skip_log_message(message: &str) -> bool {
    const INTERNAL_MARKERS: &[&str] = &[
        "Emitting event to frontend",
        "Event emitted successfully",
        "Event channel",
        "Generated task ID",
        "Sending command",
    ];
    if INTERNAL_MARKERS.iter().any(|m| message.contains(m)) {
        return true;
    }

    let content = extract_log_content(message);
    if content.is_empty() || content == "-" {
        return true;
    }

    content.starts_with("Transferred:")
        || content.starts_with("Checks:")
        || content.starts_with("Elapsed time:")
        || content.starts_with("Transferring:")
        || content.starts_with(" *")
        || content.starts_with("*")
}

fn clean_log_lines(raw: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = raw
        .into_iter()
        .filter(|line| !should_skip_log_message(line))
        .map(|line| extract_log_content(&line))
        .filter(|line| !line.is_empty())
        .collect();

    if cleaned.len() > MAX_LOG_LINES_PER_SAMPLE {
        cleaned.drain(..cleaned.len() - MAX_LOG_LINES_PER_SAMPLE);
    }
    cleaned
}

// ---------------------------------------------------------------------------
// Sample composition
// ---------------------------------------------------------------------------

/// State carried across samples for completed-check accumulation.
#[derive(Default)]
struct SampleAccum {
    prev_checking: HashSet<String>,
    completed_checks: Vec<FileTransfer>,
}

/// Composes one progress sample from an accounting snapshot.
fn compose_sample(
    snapshot: &StatsSnapshot,
    log_messages: Vec<String>,
    accum: &mut SampleAccum,
) -> ProgressSample {
    let mut sample = ProgressSample::empty();
    sample.total_files = snapshot.total_transfers;
    sample.total_bytes = snapshot.total_bytes;
    sample.files_transferred = snapshot.transfers;
    sample.bytes_transferred = snapshot.bytes;
    sample.errors = snapshot.errors;
    sample.checks = snapshot.checks;
    sample.total_checks = snapshot.total_checks;
    sample.deletes = snapshot.deletes;
    sample.renames = snapshot.renames;
    sample.speed = format_speed(snapshot.speed);
    sample.eta = snapshot.eta.map(format_duration).unwrap_or_else(|| "-".into());
    sample.elapsed = format_duration(snapshot.elapsed);

    // Compose the per-file transfer list: in-flight, checking, completed
    let mut transfers = Vec::new();
    let mut current_checking = HashSet::new();

    for t in &snapshot.transferring {
        transfers.push(FileTransfer {
            name: t.name.clone(),
            size: t.size,
            bytes: t.bytes,
            progress: t.percentage as f64,
            speed: t.speed,
            status: TransferStatus::Transferring,
            error: None,
        });
    }

    for name in &snapshot.checking {
        current_checking.insert(name.clone());
        transfers.push(FileTransfer {
            name: name.clone(),
            size: 0,
            bytes: 0,
            progress: 0.0,
            speed: 0.0,
            status: TransferStatus::Checking,
            error: None,
        });
    }

    for completed in &snapshot.completed {
        let status = if completed.error.is_some() {
            TransferStatus::Failed
        } else if completed.checked {
            TransferStatus::Checked
        } else {
            TransferStatus::Completed
        };
        transfers.push(FileTransfer {
            name: completed.name.clone(),
            size: completed.size,
            bytes: completed.bytes,
            progress: if completed.error.is_some() { 0.0 } else { 100.0 },
            speed: 0.0,
            status,
            error: completed.error.clone(),
        });
    }

    // Files that left the checking set since the previous sample finished
    // their check; keep them visible as checked.
    for name in accum.prev_checking.drain() {
        if !current_checking.contains(&name) {
            accum.completed_checks.push(FileTransfer {
                name,
                size: 0,
                bytes: 0,
                progress: 100.0,
                speed: 0.0,
                status: TransferStatus::Checked,
                error: None,
            });
        }
    }
    accum.prev_checking = current_checking;

    if accum.completed_checks.len() > MAX_COMPLETED_CHECKS {
        let excess = accum.completed_checks.len() - MAX_COMPLETED_CHECKS;
        accum.completed_checks.drain(..excess);
    }

    // Inject accumulated completed checks, skipping names already shown
    let existing: HashSet<&str> = transfers.iter().map(|t| t.name.as_str()).collect();
    let injected: Vec<FileTransfer> = accum
        .completed_checks
        .iter()
        .filter(|cc| !existing.contains(cc.name.as_str()))
        .cloned()
        .collect();
    transfers.extend(injected);

    // Re-derive the user-visible error and check counts from the composed
    // list so the displayed numbers always equal the items displayed.
    if !transfers.is_empty() {
        sample.errors = transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Failed)
            .count() as u64;
        sample.checks = transfers
            .iter()
            .filter(|t| {
                matches!(t.status, TransferStatus::Checked | TransferStatus::Checking)
            })
            .count() as u64;
    }
    sample.transfers = transfers;

    // Progress: bytes, falling back to files, then to checks
    sample.progress = if sample.total_bytes > 0 {
        (sample.bytes_transferred as f64 / sample.total_bytes as f64) * 100.0
    } else if sample.total_files > 0 {
        (sample.files_transferred as f64 / sample.total_files as f64) * 100.0
    } else if sample.total_checks > 0 {
        (sample.checks as f64 / sample.total_checks as f64) * 100.0
    } else {
        0.0
    };

    sample.status = if sample.errors > 0 {
        SampleStatus::Error
    } else if sample.progress >= 100.0 {
        SampleStatus::Completed
    } else {
        SampleStatus::Running
    };

    sample.log_messages = clean_log_lines(log_messages);
    sample
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Teardown phases of the progress reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReporterPhase {
    Running = 0,
    Draining = 1,
    Joining = 2,
    Final = 3,
    Closed = 4,
}

/// Periodically samples a task's accounting group and emits progress.
pub struct ProgressReporter {
    stats: Arc<TaskStats>,
    logs: Arc<LogBuffer>,
    tx: mpsc::Sender<ProgressSample>,
    closed: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    sampler: JoinHandle<SampleAccum>,
    phase: AtomicU8,
}

fn try_send(tx: &mpsc::Sender<ProgressSample>, sample: ProgressSample) {
    if tx.try_send(sample).is_err() {
        debug!("Progress channel full, dropping sample");
    }
}

impl ProgressReporter {
    /// Starts the sampling loop. Samples are composed from `stats` and the
    /// lines captured in `logs`, and emitted on `tx` without blocking.
    pub fn start(
        stats: Arc<TaskStats>,
        logs: Arc<LogBuffer>,
        tx: mpsc::Sender<ProgressSample>,
        interval: Duration,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let sampler = {
            let stats = Arc::clone(&stats);
            let logs = Arc::clone(&logs);
            let tx = tx.clone();
            let closed = Arc::clone(&closed);

            tokio::spawn(async move {
                let mut accum = SampleAccum::default();
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it so the first
                // sample reflects a full interval of work.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if closed.load(Ordering::Acquire) {
                                continue;
                            }
                            let messages = logs.drain();
                            let snapshot = stats.snapshot();
                            let sample = compose_sample(&snapshot, messages, &mut accum);
                            try_send(&tx, sample);
                        }
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                return accum;
                            }
                        }
                    }
                }
            })
        };

        ProgressReporter {
            stats,
            logs,
            tx,
            closed,
            stop_tx,
            sampler,
            phase: AtomicU8::new(ReporterPhase::Running as u8),
        }
    }

    /// Current teardown phase.
    pub fn phase(&self) -> ReporterPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => ReporterPhase::Running,
            1 => ReporterPhase::Draining,
            2 => ReporterPhase::Joining,
            3 => ReporterPhase::Final,
            _ => ReporterPhase::Closed,
        }
    }

    fn set_phase(&self, phase: ReporterPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Tears the reporter down in strict order and emits the final sample.
    ///
    /// The final sample carries the task's terminal status, any residual
    /// log lines, and the delta flags. The output channel stays open; it is
    /// owned by the caller.
    pub async fn finish(
        self,
        status: SampleStatus,
        delta_skipped: bool,
        delta_scoped: bool,
    ) -> ProgressSample {
        let ProgressReporter {
            stats,
            logs,
            tx,
            closed,
            stop_tx,
            sampler,
            phase,
        } = self;

        // 1. Stop in-flight captures from being considered
        phase.store(ReporterPhase::Draining as u8, Ordering::Release);
        closed.store(true, Ordering::Release);

        // 2. Signal the sampler to stop
        let _ = stop_tx.send(true);

        // 3. Join the sampler
        phase.store(ReporterPhase::Joining as u8, Ordering::Release);
        let mut accum = sampler.await.unwrap_or_default();

        // 4. One final sample with residual log lines
        phase.store(ReporterPhase::Final as u8, Ordering::Release);
        let residual = logs.drain();
        let snapshot = stats.snapshot();
        let mut sample = compose_sample(&snapshot, residual, &mut accum);
        sample.status = status;
        sample.delta_skipped = delta_skipped;
        sample.delta_scoped = delta_scoped;
        if matches!(status, SampleStatus::Completed) {
            sample.progress = 100.0;
        }
        try_send(&tx, sample.clone());

        // 5. Closed; the channel itself belongs to the caller
        phase.store(ReporterPhase::Closed as u8, Ordering::Release);
        sample
    }
}
