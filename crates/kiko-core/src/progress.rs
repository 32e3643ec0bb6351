//! Scan progress broadcast.
//!
//! The orchestrator is the only writer. Any number of observers subscribe to
//! a broadcast channel of [`ScanSnapshot`]s and may also poll the latest one.
//! Terminal snapshots are kept for a short grace period and then cleared.

use crate::config::ProgressConfig;
use crate::models::{ModelClass, ScanStats};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Where a scan run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Initializing,
    ParsingConfig,
    Counting,
    Scanning(ModelClass),
    Completed,
    Error,
}

impl ScanPhase {
    pub fn label(&self) -> String {
        match self {
            ScanPhase::Idle => "idle".into(),
            ScanPhase::Initializing => "initializing".into(),
            ScanPhase::ParsingConfig => "parsing_config".into(),
            ScanPhase::Counting => "counting".into(),
            ScanPhase::Scanning(class) => format!("scanning_{}", class.plural()),
            ScanPhase::Completed => "completed".into(),
            ScanPhase::Error => "error".into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanPhase::Completed | ScanPhase::Error)
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for ScanPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// One published progress state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSnapshot {
    pub phase: ScanPhase,
    pub message: String,
    pub current: usize,
    pub total: usize,
    /// Integer percentage derived from `current / total`.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ScanStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanSnapshot {
    fn idle() -> Self {
        Self {
            phase: ScanPhase::Idle,
            message: String::new(),
            current: 0,
            total: 0,
            progress: 0,
            stats: None,
            error: None,
        }
    }

    fn recompute_progress(&mut self) {
        self.progress = if self.phase == ScanPhase::Completed {
            100
        } else if self.total == 0 {
            0
        } else {
            ((self.current.min(self.total) * 100) / self.total) as u8
        };
    }
}

/// Single-writer, multi-reader progress channel.
pub struct ProgressReporter {
    sender: broadcast::Sender<ScanSnapshot>,
    latest: Arc<Mutex<Option<ScanSnapshot>>>,
    /// Bumped on every run start so stale clear tasks can tell they are stale.
    generation: Arc<AtomicU64>,
    completed_retention: Duration,
    error_retention: Duration,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("subscribers", &self.sender.receiver_count())
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_retention(
            ProgressConfig::COMPLETED_RETENTION,
            ProgressConfig::ERROR_RETENTION,
        )
    }

    pub fn with_retention(completed: Duration, error: Duration) -> Self {
        let (sender, _) = broadcast::channel(ProgressConfig::CHANNEL_CAPACITY);
        Self {
            sender,
            latest: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            completed_retention: completed,
            error_retention: error,
        }
    }

    /// Receive every snapshot published from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanSnapshot> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Latest snapshot, or `None` when idle.
    pub fn current(&self) -> Option<ScanSnapshot> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a run is in a non-terminal phase.
    pub fn is_running(&self) -> bool {
        self.current()
            .map(|s| !s.phase.is_terminal())
            .unwrap_or(false)
    }

    /// Begin a new run, replacing any retained terminal snapshot.
    pub fn start_run(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut snapshot = ScanSnapshot::idle();
        snapshot.phase = ScanPhase::Initializing;
        snapshot.message = "Initializing scan".into();
        self.replace(snapshot);
    }

    pub fn set_phase(&self, phase: ScanPhase, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            s.phase = phase;
            s.message = message;
        });
    }

    pub fn set_total(&self, total: usize) {
        self.update(|s| s.total = total);
    }

    /// Record one processed file.
    pub fn item_processed(&self, name: &str, action: &str) {
        self.update(|s| {
            s.current += 1;
            s.message = format!("{} {}", action, name);
        });
    }

    pub fn complete(&self, stats: ScanStats) {
        self.update(|s| {
            s.phase = ScanPhase::Completed;
            s.message = format!("Scan complete: {} models", stats.total);
            s.stats = Some(stats);
            s.error = None;
        });
        self.schedule_clear(self.completed_retention);
    }

    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|s| {
            s.phase = ScanPhase::Error;
            s.message = format!("Scan failed: {}", error);
            s.error = Some(error);
        });
        self.schedule_clear(self.error_retention);
    }

    fn update(&self, apply: impl FnOnce(&mut ScanSnapshot)) {
        let snapshot = {
            let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            let snapshot = latest.get_or_insert_with(ScanSnapshot::idle);
            apply(snapshot);
            snapshot.recompute_progress();
            snapshot.clone()
        };
        // No subscribers is fine.
        let _ = self.sender.send(snapshot);
    }

    fn replace(&self, mut snapshot: ScanSnapshot) {
        snapshot.recompute_progress();
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        let _ = self.sender.send(snapshot);
    }

    fn schedule_clear(&self, after: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let generation = self.generation.load(Ordering::SeqCst);
        let current_generation = Arc::clone(&self.generation);
        let latest = Arc::clone(&self.latest);
        let sender = self.sender.clone();

        handle.spawn(async move {
            tokio::time::sleep(after).await;
            if current_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let mut guard = latest.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.as_ref().map(|s| s.phase.is_terminal()).unwrap_or(false) {
                *guard = None;
                drop(guard);
                debug!("Cleared retained scan progress");
                let _ = sender.send(ScanSnapshot::idle());
            }
        });
    }
}
