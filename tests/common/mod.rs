#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use nazr_facefind::db::{self, DbPool};
use nazr_facefind::models::SourceCollection;
use nazr_facefind::pipeline::corpus::{CorpusEnumerator, ImageSource, SourceError, SourceHit};
use nazr_facefind::pipeline::extractor::{DescriptorExtractor, ExtractError, FaceDescriptor, FaceRegion};
use nazr_facefind::pipeline::fetch::{FetchError, ImageFetcher};
use nazr_facefind::pipeline::job::{JobController, JobState, MatchSettings, ScanJob};
use nazr_facefind::pipeline::progress::{ProgressAggregator, ProgressSnapshot};
use nazr_facefind::pipeline::scanner::{BatchScanner, ScanSettings};

/// Probe descriptor used throughout the tests.
pub const PROBE: &str = "0,0";
/// Candidate bytes that match `PROBE` under the default threshold.
pub const MATCHING: &str = "0.1,0";
/// Candidate bytes that never match `PROBE`.
pub const STRANGER: &str = "1,1";

/// Extractor that reads faces out of text bytes:
/// `"!"` is undecodable, `"boom"` fails inference, `"none"` has no face,
/// `"slow:<faces>"` sleeps before parsing, otherwise `;`-separated faces of
/// `,`-separated floats.
pub struct FakeExtractor {
    ready: AtomicBool,
    slow_delay: Duration,
    pub calls: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl FakeExtractor {
    pub fn new() -> Arc<Self> {
        Self::with_slow_delay(Duration::from_millis(300))
    }

    pub fn with_slow_delay(slow_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            slow_delay,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    /// Extractions currently executing, including ones whose item timed out.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn not_ready() -> Arc<Self> {
        let e = Self::new();
        e.ready.store(false, Ordering::SeqCst);
        e
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl DescriptorExtractor for FakeExtractor {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn extract(&self, image_bytes: &[u8]) -> Result<Vec<FaceDescriptor>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let out = self.parse(image_bytes);
        self.running.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

impl FakeExtractor {
    fn parse(&self, image_bytes: &[u8]) -> Result<Vec<FaceDescriptor>, ExtractError> {
        if !self.is_ready() {
            return Err(ExtractError::NotReady);
        }
        let text = std::str::from_utf8(image_bytes).map_err(|e| ExtractError::Decode(e.to_string()))?;
        let text = match text.strip_prefix("slow:") {
            Some(rest) => {
                std::thread::sleep(self.slow_delay);
                rest
            }
            None => text,
        };
        match text {
            "!" => Err(ExtractError::Decode("not an image".into())),
            "boom" => Err(ExtractError::Inference("backend crashed".into())),
            "none" => Ok(vec![]),
            faces => faces
                .split(';')
                .map(|face| -> Result<FaceDescriptor, ExtractError> {
                    let vector = face
                        .split(',')
                        .map(|v| v.trim().parse::<f32>())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| ExtractError::Decode(e.to_string()))?;
                    Ok(FaceDescriptor {
                        region: FaceRegion { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0, confidence: 0.9 },
                        vector,
                    })
                })
                .collect(),
        }
    }
}

/// In-memory fetcher. Unknown urls answer HTTP 404.
pub struct FakeFetcher {
    images: HashMap<String, Bytes>,
    delay: Duration,
    pub fetches: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    cancel_at: Mutex<Option<(usize, Arc<ScanJob>)>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeFetcher {
    pub fn new(images: HashMap<String, Bytes>) -> Arc<Self> {
        Self::with_delay(images, Duration::ZERO)
    }

    pub fn with_delay(images: HashMap<String, Bytes>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            images,
            delay,
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancel_at: Mutex::new(None),
            gate: None,
        })
    }

    /// Every fetch waits for a permit on the returned gate, which starts closed.
    pub fn gated(images: HashMap<String, Bytes>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(Self {
            images,
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancel_at: Mutex::new(None),
            gate: Some(gate.clone()),
        });
        (fetcher, gate)
    }

    /// Cancels `job` when the `n`th fetch starts.
    pub fn cancel_at(&self, n: usize, job: Arc<ScanJob>) {
        *self.cancel_at.lock() = Some((n, job));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, job)) = self.cancel_at.lock().as_ref() {
            if *at == n {
                job.cancel();
            }
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status { url: url.to_string(), status: 404 })
    }
}

/// Source listing a fixed set of hits.
pub struct StaticSource {
    collection: SourceCollection,
    hits: Vec<SourceHit>,
    pub calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(collection: SourceCollection, hits: Vec<SourceHit>) -> Arc<Self> {
        Arc::new(Self { collection, hits, calls: AtomicUsize::new(0) })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for StaticSource {
    fn collection(&self) -> SourceCollection {
        self.collection
    }

    async fn list(&self) -> Result<Vec<SourceHit>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.clone())
    }
}

/// Source that is always unreachable.
pub struct FailingSource {
    collection: SourceCollection,
    pub calls: AtomicUsize,
}

impl FailingSource {
    pub fn new(collection: SourceCollection) -> Arc<Self> {
        Arc::new(Self { collection, calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl ImageSource for FailingSource {
    fn collection(&self) -> SourceCollection {
        self.collection
    }

    async fn list(&self) -> Result<Vec<SourceHit>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::Unavailable("connection refused".into()))
    }
}

pub fn item_url(i: usize) -> String {
    format!("https://img.test/item{}.jpg", i)
}

/// `n` gallery items numbered from 1; the ones in `matches` show the probe face.
/// Returns the listing and the fetcher's image map.
pub fn corpus(n: usize, matches: &[usize]) -> (Vec<SourceHit>, HashMap<String, Bytes>) {
    let mut hits = Vec::with_capacity(n);
    let mut images = HashMap::new();
    for i in 1..=n {
        let url = item_url(i);
        let body = if matches.contains(&i) { MATCHING } else { STRANGER };
        images.insert(url.clone(), Bytes::from(body));
        hits.push(SourceHit::new(url, Some(format!("/gallery/{}", i))));
    }
    (hits, images)
}

/// Waits until `job` has processed exactly `want` items and stays there.
pub async fn wait_processed(job: &ScanJob, want: usize) -> ProgressSnapshot {
    for _ in 0..400 {
        if job.progress().processed >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    let snap = job.progress();
    assert_eq!(snap.processed, want, "progress moved past {}: {:?}", want, snap);
    snap
}

pub fn scan_settings(concurrency: usize) -> ScanSettings {
    ScanSettings { concurrency, item_timeout: Duration::from_secs(5) }
}

pub fn controller(
    extractor: Arc<FakeExtractor>,
    fetcher: Arc<FakeFetcher>,
    sources: Vec<Arc<dyn ImageSource>>,
    settings: ScanSettings,
) -> Arc<JobController> {
    controller_with(extractor, fetcher, sources, settings, MatchSettings::default())
}

pub fn controller_with(
    extractor: Arc<FakeExtractor>,
    fetcher: Arc<FakeFetcher>,
    sources: Vec<Arc<dyn ImageSource>>,
    settings: ScanSettings,
    matching: MatchSettings,
) -> Arc<JobController> {
    let enumerator = Arc::new(CorpusEnumerator::new(sources));
    let scanner = BatchScanner::new(extractor.clone(), fetcher, settings);
    Arc::new(JobController::new(extractor, enumerator, scanner, matching))
}

/// Waits until the job behind `progress` reaches a terminal state.
pub async fn wait_terminal(progress: &ProgressAggregator) -> JobState {
    let mut rx = progress.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let state = rx.borrow_and_update().state;
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return progress.state();
            }
        }
    })
    .await;
    match waited {
        Ok(state) => state,
        Err(_) => panic!("job did not finish; last progress: {:?}", progress.snapshot()),
    }
}

/// Temporary corpus database with the schema applied.
pub fn setup_test_db() -> (TempDir, PathBuf, DbPool) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("db").join("corpus.db");
    std::fs::create_dir_all(db_path.parent().unwrap()).unwrap();
    let pool = db::create_pool(&db_path, 2).unwrap();
    (tmp, db_path, pool)
}
