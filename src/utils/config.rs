use std::env;
use std::path::PathBuf;
use std::time::Duration;
use crate::models::SourceCollection;
use crate::pipeline::job::{MatchSettings, ProbeSelection};
use crate::pipeline::matcher::{DistanceMetric, DEFAULT_MATCH_THRESHOLD};
use crate::pipeline::scanner::{ScanSettings, DEFAULT_CONCURRENCY, DEFAULT_ITEM_TIMEOUT};
use crate::service::DEFAULT_JOB_RETENTION;

#[derive(Clone, Debug)]
pub struct Config {
    pub data: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
    pub concurrency: usize,
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub item_timeout: Duration,
    pub source_order: Vec<SourceCollection>,
    pub probe_selection: ProbeSelection,
    pub job_retention: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let data = PathBuf::from(env::var("FACEFIND_DATA").unwrap_or_else(|_| "/facefind-data".to_string()));
        let db_path = env::var("FACEFIND_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data.join("db").join("corpus.db"));
        let port = env::var("FACEFIND_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9162);
        let concurrency = env::var("FACEFIND_CONCURRENCY").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_CONCURRENCY).max(1);
        let threshold = env::var("FACEFIND_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);
        let metric = env::var("FACEFIND_METRIC").ok().and_then(|v| v.parse().ok()).unwrap_or_default();
        let item_timeout = env::var("FACEFIND_ITEM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ITEM_TIMEOUT);
        let source_order = env::var("FACEFIND_SOURCE_ORDER")
            .ok()
            .and_then(|v| parse_source_order(&v))
            .unwrap_or_else(default_source_order);
        let probe_selection = env::var("FACEFIND_PROBE_FACES").ok().and_then(|v| v.parse().ok()).unwrap_or_default();
        let job_retention = env::var("FACEFIND_JOB_RETENTION_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_JOB_RETENTION);
        Self {
            data,
            db_path,
            port,
            concurrency,
            threshold,
            metric,
            item_timeout,
            source_order,
            probe_selection,
            job_retention,
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data.join("models")
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings { concurrency: self.concurrency, item_timeout: self.item_timeout }
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings { threshold: self.threshold, metric: self.metric, probe_selection: self.probe_selection }
    }
}

fn default_source_order() -> Vec<SourceCollection> {
    vec![SourceCollection::Event, SourceCollection::Gallery]
}

/// Comma-separated collection names. `None` if any name is unknown or the
/// list is empty; duplicates keep their first position.
fn parse_source_order(raw: &str) -> Option<Vec<SourceCollection>> {
    let mut order = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let collection: SourceCollection = part.parse().ok()?;
        if !order.contains(&collection) {
            order.push(collection);
        }
    }
    if order.is_empty() { None } else { Some(order) }
}
