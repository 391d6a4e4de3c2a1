pub mod utils;
pub mod stats;
pub mod models;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod service;
pub mod api;

use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub started_at: std::time::Instant,
    pub service: Arc<service::SearchService>,
    pub stats: Arc<stats::Stats>,
}

impl AppState {
    pub fn new(service: Arc<service::SearchService>) -> Self {
        Self {
            started_at: std::time::Instant::now(),
            stats: service.stats(),
            service,
        }
    }
}
