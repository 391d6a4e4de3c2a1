use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use crate::models::ImageReference;
use crate::pipeline::corpus::CorpusEnumerator;
use crate::pipeline::extractor::{DescriptorExtractor, ExtractError, FaceDescriptor};
use crate::pipeline::matcher::{DistanceMetric, FaceMatcher, DEFAULT_MATCH_THRESHOLD};
use crate::pipeline::progress::{ProgressAggregator, ProgressSnapshot};
use crate::pipeline::results::ResultCollector;
use crate::pipeline::scanner::{BatchScanner, ScanReport};

pub type JobId = u64;

/// Face taken from the probe photo. Lives only as long as its job.
pub type ProbeDescriptor = FaceDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    ExtractingProbe,
    EnumeratingCorpus,
    Scanning,
    Completed,
    NoFaceInProbe,
    ProbeUndecodable,
    TransportError,
    CorpusUnavailable,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::NoFaceInProbe
                | JobState::ProbeUndecodable
                | JobState::TransportError
                | JobState::CorpusUnavailable
                | JobState::Cancelled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobState::NoFaceInProbe | JobState::ProbeUndecodable | JobState::TransportError | JobState::CorpusUnavailable
        )
    }
}

/// Which probe faces take part in matching when the probe shows several people.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeSelection {
    /// Highest-confidence face only.
    #[default]
    BestFace,
    AllFaces,
}

impl FromStr for ProbeSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "best" => Ok(ProbeSelection::BestFace),
            "all" => Ok(ProbeSelection::AllFaces),
            other => Err(format!("unknown probe face selection: {}", other)),
        }
    }
}

impl ProbeSelection {
    pub fn select(&self, mut faces: Vec<FaceDescriptor>) -> Vec<ProbeDescriptor> {
        match self {
            ProbeSelection::AllFaces => faces,
            ProbeSelection::BestFace => {
                faces.sort_by(|a, b| {
                    b.region
                        .confidence
                        .partial_cmp(&a.region.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.region.area().partial_cmp(&a.region.area()).unwrap_or(std::cmp::Ordering::Equal))
                });
                faces.truncate(1);
                faces
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub probe_selection: ProbeSelection,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            metric: DistanceMetric::default(),
            probe_selection: ProbeSelection::default(),
        }
    }
}

/// One search from probe upload to final result list. Never reused.
pub struct ScanJob {
    id: JobId,
    created_at: Instant,
    finished_at: Mutex<Option<Instant>>,
    probe: OnceCell<Vec<ProbeDescriptor>>,
    report: OnceCell<ScanReport>,
    progress: Arc<ProgressAggregator>,
    results: Arc<ResultCollector>,
    cancel: Arc<AtomicBool>,
}

impl ScanJob {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            finished_at: Mutex::new(None),
            probe: OnceCell::new(),
            report: OnceCell::new(),
            progress: Arc::new(ProgressAggregator::new()),
            results: Arc::new(ResultCollector::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> JobId { self.id }
    pub fn created_at(&self) -> Instant { self.created_at }
    pub fn finished_at(&self) -> Option<Instant> { *self.finished_at.lock() }
    pub fn state(&self) -> JobState { self.progress.state() }
    pub fn progress(&self) -> ProgressSnapshot { self.progress.snapshot() }
    pub fn progress_handle(&self) -> Arc<ProgressAggregator> { self.progress.clone() }
    pub fn probe_faces(&self) -> usize { self.probe.get().map(|p| p.len()).unwrap_or(0) }

    /// Per-candidate accounting of the scan, including failed and faceless
    /// images as non-matches. `None` until the scan stage has run.
    pub fn report(&self) -> Option<&ScanReport> { self.report.get() }

    /// Asks the job to stop. Workers finish their in-flight item and dispatch
    /// nothing further; the controller then moves the job to `Cancelled`.
    /// No-op once the job reached a terminal state.
    pub fn cancel(&self) -> bool {
        self.progress.request_cancel(&self.cancel)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Final list in enumeration order; `None` unless the job completed.
    pub fn results(&self) -> Option<Vec<ImageReference>> {
        if self.state() == JobState::Completed {
            Some(self.results.sorted())
        } else {
            None
        }
    }

    fn mark_finished(&self) {
        *self.finished_at.lock() = Some(Instant::now());
    }
}

/// Runs a job through probe extraction, corpus enumeration and scanning.
pub struct JobController {
    extractor: Arc<dyn DescriptorExtractor>,
    enumerator: Arc<CorpusEnumerator>,
    scanner: BatchScanner,
    settings: MatchSettings,
}

impl JobController {
    pub fn new(
        extractor: Arc<dyn DescriptorExtractor>,
        enumerator: Arc<CorpusEnumerator>,
        scanner: BatchScanner,
        settings: MatchSettings,
    ) -> Self {
        Self { extractor, enumerator, scanner, settings }
    }

    pub fn extractor_ready(&self) -> bool {
        self.extractor.is_ready()
    }

    pub async fn run(&self, job: Arc<ScanJob>, probe: Bytes) -> JobState {
        let state = self.drive(&job, probe).await;
        job.mark_finished();
        let snap = job.progress();
        info!(
            "Job {} finished: state={:?} probe_faces={} processed={}/{} matched={} failed={}",
            job.id, state, job.probe_faces(), snap.processed, snap.total, snap.matched, snap.failed
        );
        state
    }

    async fn drive(&self, job: &ScanJob, probe: Bytes) -> JobState {
        let progress = &job.progress;

        if job.is_cancel_requested() {
            return self.finish_cancelled(job);
        }

        // Probe first: a photo without a usable face never costs a corpus scan.
        progress.transition(JobState::ExtractingProbe, "Analyzing reference photo...");
        let extractor = self.extractor.clone();
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&probe)).await;
        let faces = match extracted {
            Ok(Ok(faces)) => faces,
            Ok(Err(ExtractError::Decode(e))) => {
                warn!("Job {}: probe image could not be decoded: {}", job.id, e);
                progress.fail(JobState::ProbeUndecodable, "The reference photo could not be read");
                return progress.state();
            }
            Ok(Err(ExtractError::NotReady)) => {
                progress.fail(JobState::TransportError, "Face models are still loading");
                return progress.state();
            }
            Ok(Err(e)) => {
                error!("Job {}: probe extraction failed: {}", job.id, e);
                progress.fail(JobState::TransportError, format!("Face analysis failed: {}", e));
                return progress.state();
            }
            Err(e) => {
                error!("Job {}: probe extraction task failed: {}", job.id, e);
                progress.fail(JobState::TransportError, "Face analysis failed");
                return progress.state();
            }
        };
        if faces.is_empty() {
            info!("Job {}: no face detected in probe", job.id);
            progress.fail(JobState::NoFaceInProbe, "No face detected in the reference photo");
            return progress.state();
        }
        let detected = faces.len();
        let selected = self.settings.probe_selection.select(faces);
        info!("Job {}: probe has {} faces, matching against {}", job.id, detected, selected.len());
        let matcher = Arc::new(FaceMatcher::new(
            selected.iter().map(|f| f.vector.clone()),
            self.settings.threshold,
            self.settings.metric,
        ));
        let _ = job.probe.set(selected);

        if job.is_cancel_requested() {
            return self.finish_cancelled(job);
        }

        progress.transition(JobState::EnumeratingCorpus, "Loading images...");
        let enumeration = match self.enumerator.enumerate().await {
            Ok(e) => e,
            Err(e) => {
                error!("Job {}: {}", job.id, e);
                progress.fail(JobState::CorpusUnavailable, "No image sources are reachable right now");
                return progress.state();
            }
        };
        for (collection, reason) in &enumeration.unavailable {
            warn!("Job {}: continuing without {} source: {}", job.id, collection, reason);
            progress.add_warning(format!("{} images unavailable", collection));
        }

        if job.is_cancel_requested() {
            return self.finish_cancelled(job);
        }

        let total = enumeration.images.len();
        if !progress.begin_scan(total) {
            return progress.state();
        }
        let report = if total > 0 {
            self.scanner
                .scan(enumeration.images, matcher, job.progress.clone(), job.results.clone(), job.cancel.clone())
                .await
        } else {
            ScanReport::default()
        };
        let _ = job.report.set(report);

        if job.is_cancel_requested() {
            return self.finish_cancelled(job);
        }

        let found = job.results.len();
        let mut status = match found {
            0 => "Search complete: no matching images".to_string(),
            1 => "Search complete: found 1 matching image".to_string(),
            n => format!("Search complete: found {} matching images", n),
        };
        let snap = progress.snapshot();
        if snap.degraded {
            status.push_str(&format!(" ({})", snap.warnings.join("; ")));
        }
        // A cancel that lands before completion wins, even after the last item.
        if !progress.complete_unless(&job.cancel, status) && job.is_cancel_requested() {
            return self.finish_cancelled(job);
        }
        progress.state()
    }

    fn finish_cancelled(&self, job: &ScanJob) -> JobState {
        // Partial results are discarded on cancel.
        job.results.clear();
        job.progress.transition(JobState::Cancelled, "Search cancelled");
        info!("Job {} cancelled", job.id);
        job.progress.state()
    }
}
