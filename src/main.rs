#![cfg_attr(not(feature = "facial-recognition"), allow(unused_imports))]

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use nazr_facefind::utils::config::Config;
use nazr_facefind::utils::logging;
use nazr_facefind::db;
use nazr_facefind::models::SourceCollection;
use nazr_facefind::pipeline::corpus::{CorpusEnumerator, ImageSource, SqliteSource};
use nazr_facefind::pipeline::fetch::HttpFetcher;
use nazr_facefind::pipeline::job::JobController;
use nazr_facefind::pipeline::scanner::BatchScanner;
use nazr_facefind::service::SearchService;
use tracing::info;

#[cfg(feature = "facial-recognition")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use nazr_facefind::pipeline::face::OnnxExtractor;

    logging::init();
    let cfg = Config::from_env();
    info!("Starting facefind {} with {:?}", env!("CARGO_PKG_VERSION"), cfg);

    if let Some(db_dir) = cfg.db_path.parent() {
        std::fs::create_dir_all(db_dir).context("Failed to create database directory")?;
    }
    let pool = db::create_pool(&cfg.db_path, 4)?;
    {
        let conn = pool.get().context("Failed to get connection from pool")?;
        let (gallery, events) = db::query::count_images(&conn)?;
        info!("Corpus: {} gallery images, {} event images", gallery, events);
    }

    let sources: Vec<Arc<dyn ImageSource>> = vec![
        Arc::new(SqliteSource::new(pool.clone(), SourceCollection::Gallery)),
        Arc::new(SqliteSource::new(pool.clone(), SourceCollection::Event)),
    ];
    let enumerator = Arc::new(CorpusEnumerator::ordered(sources, &cfg.source_order));
    info!("Source order: {:?}", enumerator.collections());

    // Models load in the background; searches answer 503 until they are ready.
    let extractor = OnnxExtractor::new(cfg.models_dir());
    extractor.spawn_initialize();
    let extractor = Arc::new(extractor);

    let fetcher = Arc::new(HttpFetcher::new(cfg.item_timeout)?);
    let scanner = BatchScanner::new(extractor.clone(), fetcher, cfg.scan_settings());
    let controller = Arc::new(JobController::new(extractor, enumerator, scanner, cfg.match_settings()));
    let service = Arc::new(SearchService::new(controller, cfg.job_retention));
    let state = Arc::new(nazr_facefind::AppState::new(service));

    let app = nazr_facefind::api::routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[cfg(not(feature = "facial-recognition"))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("facefind was built without the `facial-recognition` feature; no face extractor is available")
}
