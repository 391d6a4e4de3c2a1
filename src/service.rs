use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use crate::error::SearchError;
use crate::models::ImageReference;
use crate::pipeline::job::{JobController, JobId, ScanJob};
use crate::pipeline::progress::ProgressSnapshot;
use crate::stats::Stats;

pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(600);

/// Entry point for searches: starts jobs in the background and answers
/// progress, result and cancel requests by job id.
pub struct SearchService {
    controller: Arc<JobController>,
    jobs: RwLock<HashMap<JobId, Arc<ScanJob>>>,
    next_id: AtomicU64,
    retention: Duration,
    stats: Arc<Stats>,
}

impl SearchService {
    pub fn new(controller: Arc<JobController>, retention: Duration) -> Self {
        Self {
            controller,
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            retention,
            stats: Arc::new(Stats::new()),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn models_ready(&self) -> bool {
        self.controller.extractor_ready()
    }

    /// Registers a job and runs it on the tokio runtime. Returns as soon as the
    /// job is registered; probe failures show up in the job's progress.
    pub fn start_search(&self, probe: Bytes) -> Result<JobId, SearchError> {
        if probe.is_empty() {
            return Err(SearchError::EmptyProbe);
        }
        if !self.controller.extractor_ready() {
            return Err(SearchError::ModelsLoading);
        }
        self.evict_finished();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(ScanJob::new(id));
        self.jobs.write().insert(id, job.clone());
        self.stats.inc_started();
        info!("Search {} started ({} byte probe)", id, probe.len());

        let controller = self.controller.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            controller.run(job.clone(), probe).await;
            stats.record_finished(&job.progress(), job.created_at().elapsed().as_secs_f64());
        });
        Ok(id)
    }

    fn job(&self, id: JobId) -> Result<Arc<ScanJob>, SearchError> {
        self.jobs.read().get(&id).cloned().ok_or(SearchError::JobNotFound(id))
    }

    pub fn progress(&self, id: JobId) -> Result<ProgressSnapshot, SearchError> {
        Ok(self.job(id)?.progress())
    }

    pub fn subscribe(&self, id: JobId) -> Result<watch::Receiver<ProgressSnapshot>, SearchError> {
        Ok(self.job(id)?.progress_handle().subscribe())
    }

    pub fn results(&self, id: JobId) -> Result<Vec<ImageReference>, SearchError> {
        let job = self.job(id)?;
        job.results().ok_or(SearchError::NotCompleted { id, state: job.state() })
    }

    /// Returns whether a cancel was requested; false if the job already ended.
    pub fn cancel(&self, id: JobId) -> Result<bool, SearchError> {
        let requested = self.job(id)?.cancel();
        if requested {
            info!("Search {} cancel requested", id);
        }
        Ok(requested)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Drops finished jobs older than the retention period. Running jobs stay.
    pub fn evict_finished(&self) -> usize {
        let retention = self.retention;
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at() {
            Some(done) => done.elapsed() < retention,
            None => true,
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!("Evicted {} finished searches", evicted);
        }
        evicted
    }
}
