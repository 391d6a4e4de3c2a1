use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use crate::db::{self, DbPool};
use crate::models::{ImageReference, SourceCollection};

/// Raw listing row from a source collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHit {
    pub url: String,
    pub source_link: Option<String>,
}

impl SourceHit {
    pub fn new(url: impl Into<String>, source_link: Option<String>) -> Self {
        Self { url: url.into(), source_link }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Anything that can list image references for one collection.
#[async_trait]
pub trait ImageSource: Send + Sync {
    fn collection(&self) -> SourceCollection;
    async fn list(&self) -> Result<Vec<SourceHit>, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub images: Vec<ImageReference>,
    /// Sources whose listing failed, with the reason.
    pub unavailable: Vec<(SourceCollection, String)>,
}

impl Enumeration {
    pub fn is_degraded(&self) -> bool {
        !self.unavailable.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("all corpus sources are unavailable")]
pub struct CorpusUnavailable {
    pub failures: Vec<(SourceCollection, String)>,
}

/// Lists every configured source and merges the hits into one deduplicated
/// candidate list.
///
/// Source order is policy: hits are merged in the order sources were given,
/// and when two collections reference the same url the first one wins,
/// including its `source_link`.
pub struct CorpusEnumerator {
    sources: Vec<Arc<dyn ImageSource>>,
}

impl CorpusEnumerator {
    pub fn new(sources: Vec<Arc<dyn ImageSource>>) -> Self {
        Self { sources }
    }

    /// Sorts `sources` by their collection's position in `order`; collections
    /// missing from `order` go last in their given order.
    pub fn ordered(mut sources: Vec<Arc<dyn ImageSource>>, order: &[SourceCollection]) -> Self {
        sources.sort_by_key(|s| order.iter().position(|c| *c == s.collection()).unwrap_or(usize::MAX));
        Self { sources }
    }

    pub fn collections(&self) -> Vec<SourceCollection> {
        self.sources.iter().map(|s| s.collection()).collect()
    }

    pub async fn enumerate(&self) -> Result<Enumeration, CorpusUnavailable> {
        let listings = join_all(self.sources.iter().map(|s| s.list())).await;

        let mut out = Enumeration::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut any_ok = false;
        let mut duplicates = 0usize;

        for (source, listing) in self.sources.iter().zip(listings) {
            let collection = source.collection();
            let hits = match listing {
                Ok(hits) => hits,
                Err(e) => {
                    warn!("Corpus source {} unavailable: {}", collection, e);
                    out.unavailable.push((collection, e.to_string()));
                    continue;
                }
            };
            any_ok = true;
            let listed = hits.len();
            for hit in hits {
                let url = hit.url.trim();
                if url.is_empty() {
                    continue;
                }
                if !seen.insert(url.to_string()) {
                    duplicates += 1;
                    continue;
                }
                let source_link = hit
                    .source_link
                    .filter(|l| !l.trim().is_empty())
                    .unwrap_or_else(|| collection.default_link().to_string());
                out.images.push(ImageReference {
                    url: url.to_string(),
                    source_collection: collection,
                    source_link,
                });
            }
            info!("Corpus source {} listed {} images", collection, listed);
        }

        if !any_ok {
            return Err(CorpusUnavailable { failures: out.unavailable });
        }
        info!(
            "Corpus enumerated: {} unique images ({} duplicates dropped, {} sources unavailable)",
            out.images.len(), duplicates, out.unavailable.len()
        );
        Ok(out)
    }
}

/// Collection stored in the SQLite document store.
pub struct SqliteSource {
    pool: DbPool,
    collection: SourceCollection,
}

impl SqliteSource {
    pub fn new(pool: DbPool, collection: SourceCollection) -> Self {
        Self { pool, collection }
    }
}

#[async_trait]
impl ImageSource for SqliteSource {
    fn collection(&self) -> SourceCollection {
        self.collection
    }

    async fn list(&self) -> Result<Vec<SourceHit>, SourceError> {
        let pool = self.pool.clone();
        let collection = self.collection;
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| SourceError::Unavailable(e.to_string()))?;
            let rows = match collection {
                SourceCollection::Gallery => db::query::list_gallery_images(&conn),
                SourceCollection::Event => db::query::list_event_images(&conn),
            };
            rows.map_err(|e| SourceError::Database(e.to_string()))
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("listing task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Listed {
        collection: SourceCollection,
        hits: Result<Vec<SourceHit>, String>,
        calls: AtomicUsize,
    }

    impl Listed {
        fn ok(collection: SourceCollection, hits: Vec<(&str, Option<&str>)>) -> Arc<Self> {
            Arc::new(Self {
                collection,
                hits: Ok(hits.into_iter().map(|(u, l)| SourceHit::new(u, l.map(String::from))).collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(collection: SourceCollection) -> Arc<Self> {
            Arc::new(Self { collection, hits: Err("connection refused".into()), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl ImageSource for Listed {
        fn collection(&self) -> SourceCollection { self.collection }
        async fn list(&self) -> Result<Vec<SourceHit>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.hits.clone().map_err(SourceError::Unavailable)
        }
    }

    #[tokio::test]
    async fn test_dedup_across_collections_first_wins() {
        let events = Listed::ok(SourceCollection::Event, vec![("u1", Some("/events/gala")), ("u2", None)]);
        let gallery = Listed::ok(SourceCollection::Gallery, vec![("u1", Some("/gallery/7")), ("u3", Some("/gallery/8"))]);
        let e = CorpusEnumerator::new(vec![events, gallery]);
        let out = e.enumerate().await.unwrap();
        let urls: Vec<&str> = out.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["u1", "u2", "u3"]);
        assert_eq!(out.images[0].source_collection, SourceCollection::Event);
        assert_eq!(out.images[0].source_link, "/events/gala");
        assert_eq!(out.images[1].source_link, "/events");
        assert!(!out.is_degraded());
    }

    #[tokio::test]
    async fn test_ordered_puts_configured_collection_first() {
        let events = Listed::ok(SourceCollection::Event, vec![("shared", Some("/events/x"))]);
        let gallery = Listed::ok(SourceCollection::Gallery, vec![("shared", Some("/gallery/1"))]);
        let e = CorpusEnumerator::ordered(vec![events, gallery], &[SourceCollection::Gallery, SourceCollection::Event]);
        assert_eq!(e.collections(), vec![SourceCollection::Gallery, SourceCollection::Event]);
        let out = e.enumerate().await.unwrap();
        assert_eq!(out.images.len(), 1);
        assert_eq!(out.images[0].source_link, "/gallery/1");
    }

    #[tokio::test]
    async fn test_partial_failure_is_degraded() {
        let events = Listed::failing(SourceCollection::Event);
        let gallery = Listed::ok(SourceCollection::Gallery, vec![("g1", None)]);
        let out = CorpusEnumerator::new(vec![events, gallery]).enumerate().await.unwrap();
        assert_eq!(out.images.len(), 1);
        assert!(out.is_degraded());
        assert_eq!(out.unavailable[0].0, SourceCollection::Event);
    }

    #[tokio::test]
    async fn test_all_sources_failing() {
        let events = Listed::failing(SourceCollection::Event);
        let gallery = Listed::failing(SourceCollection::Gallery);
        let err = CorpusEnumerator::new(vec![events.clone(), gallery]).enumerate().await.unwrap_err();
        assert_eq!(err.failures.len(), 2);
        assert_eq!(events.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_sources_is_unavailable() {
        assert!(CorpusEnumerator::new(vec![]).enumerate().await.is_err());
    }

    #[tokio::test]
    async fn test_blank_urls_skipped() {
        let gallery = Listed::ok(SourceCollection::Gallery, vec![("  ", None), ("g1", Some(""))]);
        let out = CorpusEnumerator::new(vec![gallery]).enumerate().await.unwrap();
        assert_eq!(out.images.len(), 1);
        assert_eq!(out.images[0].source_link, "/gallery");
    }
}
