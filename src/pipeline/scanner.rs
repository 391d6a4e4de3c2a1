use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use crate::models::{ImageReference, MatchRecord};
use crate::pipeline::extractor::{DescriptorExtractor, ExtractError};
use crate::pipeline::fetch::{FetchError, ImageFetcher};
use crate::pipeline::matcher::FaceMatcher;
use crate::pipeline::progress::ProgressAggregator;
use crate::pipeline::results::ResultCollector;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Matched,
    NoMatch,
    /// Image decoded but contained no face.
    NoFace,
    /// Fetch, decode, inference or timeout failure.
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    pub concurrency: usize,
    pub item_timeout: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self { concurrency: DEFAULT_CONCURRENCY, item_timeout: DEFAULT_ITEM_TIMEOUT }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// One record per candidate that was dispatched, in completion order.
    pub records: Vec<MatchRecord>,
    pub dispatched: usize,
    pub matched: usize,
    pub failed: usize,
    /// True if workers stopped early because of cancellation.
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
enum ItemError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Extract(#[from] ExtractError),
    #[error("extraction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Shared state of one scan, handed to every worker.
struct ScanShared {
    queue: Mutex<VecDeque<(usize, ImageReference)>>,
    /// One permit per worker. A permit stays with its extraction until the
    /// blocking call returns, even if the item already timed out.
    slots: Arc<Semaphore>,
    records: Mutex<Vec<MatchRecord>>,
    dispatched: AtomicUsize,
    matcher: Arc<FaceMatcher>,
    progress: Arc<ProgressAggregator>,
    results: Arc<ResultCollector>,
    cancel: Arc<AtomicBool>,
}

/// Drains a candidate list through fetch, extract and match with a fixed pool
/// of workers. A failing candidate is a non-match; nothing a single image does
/// stops the batch.
pub struct BatchScanner {
    extractor: Arc<dyn DescriptorExtractor>,
    fetcher: Arc<dyn ImageFetcher>,
    settings: ScanSettings,
}

impl BatchScanner {
    pub fn new(extractor: Arc<dyn DescriptorExtractor>, fetcher: Arc<dyn ImageFetcher>, settings: ScanSettings) -> Self {
        Self { extractor, fetcher, settings }
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings
    }

    pub async fn scan(
        &self,
        candidates: Vec<ImageReference>,
        matcher: Arc<FaceMatcher>,
        progress: Arc<ProgressAggregator>,
        results: Arc<ResultCollector>,
        cancel: Arc<AtomicBool>,
    ) -> ScanReport {
        let total = candidates.len();
        if total == 0 {
            return ScanReport::default();
        }

        let n_workers = self.settings.concurrency.max(1).min(total);
        let shared = Arc::new(ScanShared {
            queue: Mutex::new(candidates.into_iter().enumerate().collect()),
            slots: Arc::new(Semaphore::new(n_workers)),
            records: Mutex::new(Vec::with_capacity(total)),
            dispatched: AtomicUsize::new(0),
            matcher,
            progress,
            results,
            cancel,
        });

        info!("Scanning {} candidates with {} workers", total, n_workers);

        let mut workers = Vec::with_capacity(n_workers);
        for worker_id in 0..n_workers {
            let shared = shared.clone();
            let extractor = self.extractor.clone();
            let fetcher = self.fetcher.clone();
            let item_timeout = self.settings.item_timeout;
            workers.push(tokio::spawn(async move {
                loop {
                    // Waits here while an abandoned extraction still holds a slot.
                    let Ok(slot) = shared.slots.clone().acquire_owned().await else {
                        break;
                    };
                    if shared.cancel.load(Ordering::SeqCst) {
                        debug!("scan worker {} stopping: cancelled", worker_id);
                        break;
                    }
                    let next = shared.queue.lock().pop_front();
                    let Some((order, image)) = next else {
                        break;
                    };
                    shared.dispatched.fetch_add(1, Ordering::SeqCst);

                    let outcome = scan_one(&extractor, &fetcher, &shared.matcher, &image, item_timeout, slot).await;
                    let matched = outcome == ItemOutcome::Matched;
                    if matched {
                        shared.results.insert(order, image.clone());
                    }
                    shared.records.lock().push(MatchRecord { image, matched });
                    shared.progress.record_item(outcome);
                }
            }));
        }

        for (worker_id, joined) in join_all(workers).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!("scan worker {} panicked: {}", worker_id, e);
            }
        }
        // Extractions abandoned by a timeout still hold their slot; wait for them.
        if shared.slots.acquire_many(n_workers as u32).await.is_err() {
            warn!("scan slots closed before abandoned extractions drained");
        }

        let records = std::mem::take(&mut *shared.records.lock());
        let snapshot = shared.progress.snapshot();
        let dispatched = shared.dispatched.load(Ordering::SeqCst);
        let report = ScanReport {
            dispatched,
            matched: records.iter().filter(|r| r.matched).count(),
            failed: snapshot.failed,
            cancelled: dispatched < total && shared.cancel.load(Ordering::SeqCst),
            records,
        };
        info!(
            "Scan finished: {} of {} dispatched, {} matched, {} failed{}",
            report.dispatched, total, report.matched, report.failed,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        report
    }
}

async fn scan_one(
    extractor: &Arc<dyn DescriptorExtractor>,
    fetcher: &Arc<dyn ImageFetcher>,
    matcher: &FaceMatcher,
    image: &ImageReference,
    item_timeout: Duration,
    slot: OwnedSemaphorePermit,
) -> ItemOutcome {
    let work = async move {
        let bytes = fetcher.fetch(&image.url).await?;
        let extractor = extractor.clone();
        // On timeout the blocking task keeps running and keeps the slot until it returns.
        let faces = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            extractor.extract(&bytes)
        })
        .await??;
        Ok::<_, ItemError>(faces)
    };

    match tokio::time::timeout(item_timeout, work).await {
        Err(_) => {
            warn!("Timed out after {:?} scanning {}", item_timeout, image.url);
            ItemOutcome::Failed
        }
        Ok(Err(e)) => {
            warn!("Skipping {}: {}", image.url, e);
            ItemOutcome::Failed
        }
        Ok(Ok(faces)) if faces.is_empty() => {
            debug!("No face in {}", image.url);
            ItemOutcome::NoFace
        }
        Ok(Ok(faces)) => {
            if matcher.any_match(&faces) {
                debug!("Match in {} ({} faces)", image.url, faces.len());
                ItemOutcome::Matched
            } else {
                debug!("No match in {} ({} faces)", image.url, faces.len());
                ItemOutcome::NoMatch
            }
        }
    }
}
