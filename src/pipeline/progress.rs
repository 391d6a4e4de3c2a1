use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use crate::pipeline::job::JobState;
use crate::pipeline::scanner::ItemOutcome;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressSnapshot {
    pub state: JobState,
    pub total: usize,
    pub processed: usize,
    pub matched: usize,
    pub failed: usize,
    pub status: String,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            state: JobState::Idle,
            total: 0,
            processed: 0,
            matched: 0,
            failed: 0,
            status: "Waiting to start".to_string(),
            degraded: false,
            warnings: Vec::new(),
            error: None,
        }
    }
}

/// Live progress of one scan job.
///
/// Every mutation goes through a single lock and is published to subscribers
/// before the lock is released, so watchers see changes in the order they
/// happened and concurrent workers never lose an increment.
pub struct ProgressAggregator {
    inner: Mutex<ProgressSnapshot>,
    tx: watch::Sender<ProgressSnapshot>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::default());
        Self {
            inner: Mutex::new(ProgressSnapshot::default()),
            tx,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().clone()
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut ProgressSnapshot) -> bool,
    {
        let mut guard = self.inner.lock();
        if !f(&mut guard) {
            return false;
        }
        self.tx.send_replace(guard.clone());
        true
    }

    /// Moves to `state` unless the job already reached a terminal state.
    pub fn transition(&self, state: JobState, status: impl Into<String>) -> bool {
        let status = status.into();
        self.update(|s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = state;
            s.status = status;
            true
        })
    }

    /// Moves to `Completed` unless `cancel` is set. The flag is read under the
    /// same lock `request_cancel` sets it under, so exactly one of the two wins.
    pub fn complete_unless(&self, cancel: &AtomicBool, status: impl Into<String>) -> bool {
        let status = status.into();
        self.update(|s| {
            if s.state.is_terminal() || cancel.load(Ordering::SeqCst) {
                return false;
            }
            s.state = JobState::Completed;
            s.status = status;
            true
        })
    }

    /// Sets `cancel` unless the job already reached a terminal state.
    pub fn request_cancel(&self, cancel: &AtomicBool) -> bool {
        let guard = self.inner.lock();
        if guard.state.is_terminal() {
            return false;
        }
        cancel.store(true, Ordering::SeqCst);
        true
    }

    /// Terminal failure with a user-facing message.
    pub fn fail(&self, state: JobState, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(|s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = state;
            s.status = message.clone();
            s.error = Some(message);
            true
        })
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        let warning = warning.into();
        self.update(|s| {
            s.degraded = true;
            s.warnings.push(warning);
            true
        });
    }

    pub fn begin_scan(&self, total: usize) -> bool {
        self.update(|s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = JobState::Scanning;
            s.total = total;
            s.processed = 0;
            s.matched = 0;
            s.failed = 0;
            s.status = if s.degraded {
                format!("Searching {} images ({})...", total, s.warnings.join("; "))
            } else {
                format!("Searching {} images...", total)
            };
            true
        })
    }

    /// Counts one finished candidate and returns the new processed count.
    /// Extra calls past `total` are ignored so the count never overshoots.
    pub fn record_item(&self, outcome: ItemOutcome) -> usize {
        let mut processed = 0;
        self.update(|s| {
            if s.processed >= s.total {
                tracing::warn!("progress: item recorded after {} of {} already processed", s.processed, s.total);
                processed = s.processed;
                return false;
            }
            s.processed += 1;
            match outcome {
                ItemOutcome::Matched => s.matched += 1,
                ItemOutcome::Failed => s.failed += 1,
                ItemOutcome::NoMatch | ItemOutcome::NoFace => {}
            }
            s.status = format!("Searching image {} of {}...", s.processed, s.total);
            processed = s.processed;
            true
        });
        processed
    }
}
