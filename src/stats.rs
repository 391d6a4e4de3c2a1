use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use crate::pipeline::job::JobState;
use crate::pipeline::progress::ProgressSnapshot;

/// Process-wide search counters, exported on `/metrics`.
pub struct Stats {
    searches_started: AtomicU64,
    searches_completed: AtomicU64,
    searches_failed: AtomicU64,
    searches_cancelled: AtomicU64,
    images_scanned: AtomicU64,
    images_matched: AtomicU64,
    images_failed: AtomicU64,
    started: Instant,
    last_completed_elapsed: parking_lot::Mutex<Option<f64>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            searches_started: AtomicU64::new(0),
            searches_completed: AtomicU64::new(0),
            searches_failed: AtomicU64::new(0),
            searches_cancelled: AtomicU64::new(0),
            images_scanned: AtomicU64::new(0),
            images_matched: AtomicU64::new(0),
            images_failed: AtomicU64::new(0),
            started: Instant::now(),
            last_completed_elapsed: parking_lot::Mutex::new(None),
        }
    }

    pub fn inc_started(&self) { self.searches_started.fetch_add(1, Ordering::Relaxed); }

    /// Folds a finished job into the totals.
    pub fn record_finished(&self, snapshot: &ProgressSnapshot, elapsed_secs: f64) {
        match snapshot.state {
            JobState::Completed => {
                self.searches_completed.fetch_add(1, Ordering::Relaxed);
                *self.last_completed_elapsed.lock() = Some(elapsed_secs);
            }
            JobState::Cancelled => { self.searches_cancelled.fetch_add(1, Ordering::Relaxed); }
            s if s.is_failure() => { self.searches_failed.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }
        self.images_scanned.fetch_add(snapshot.processed as u64, Ordering::Relaxed);
        self.images_matched.fetch_add(snapshot.matched as u64, Ordering::Relaxed);
        self.images_failed.fetch_add(snapshot.failed as u64, Ordering::Relaxed);
    }

    pub fn searches_started(&self) -> u64 { self.searches_started.load(Ordering::Relaxed) }
    pub fn searches_completed(&self) -> u64 { self.searches_completed.load(Ordering::Relaxed) }
    pub fn searches_failed(&self) -> u64 { self.searches_failed.load(Ordering::Relaxed) }
    pub fn searches_cancelled(&self) -> u64 { self.searches_cancelled.load(Ordering::Relaxed) }
    pub fn images_scanned(&self) -> u64 { self.images_scanned.load(Ordering::Relaxed) }
    pub fn images_matched(&self) -> u64 { self.images_matched.load(Ordering::Relaxed) }
    pub fn images_failed(&self) -> u64 { self.images_failed.load(Ordering::Relaxed) }
    pub fn uptime_secs(&self) -> u64 { self.started.elapsed().as_secs() }
    pub fn last_completed_elapsed(&self) -> Option<f64> { *self.last_completed_elapsed.lock() }

    pub fn images_per_sec(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 { 0.0 } else { self.images_scanned() as f64 / secs }
    }

    pub fn metrics_text(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!("facefind_uptime_seconds {}\n", self.uptime_secs()));
        s.push_str(&format!("facefind_searches_started_total {}\n", self.searches_started()));
        s.push_str(&format!("facefind_searches_completed_total {}\n", self.searches_completed()));
        s.push_str(&format!("facefind_searches_failed_total {}\n", self.searches_failed()));
        s.push_str(&format!("facefind_searches_cancelled_total {}\n", self.searches_cancelled()));
        s.push_str(&format!("facefind_images_scanned_total {}\n", self.images_scanned()));
        s.push_str(&format!("facefind_images_matched_total {}\n", self.images_matched()));
        s.push_str(&format!("facefind_images_failed_total {}\n", self.images_failed()));
        s.push_str(&format!("facefind_images_scanned_per_second {}\n", self.images_per_sec()));
        if let Some(elapsed) = self.last_completed_elapsed() {
            s.push_str(&format!("facefind_last_search_seconds {}\n", elapsed));
        }
        s
    }
}
