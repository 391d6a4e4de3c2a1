use std::sync::Arc;
use axum::{extract::{State, Path}, http::{StatusCode, header}, Json, response::{IntoResponse, Response}};
use bytes::Bytes;
use crate::AppState;
use crate::error::SearchError;
use crate::pipeline::job::JobId;
use tracing::{info, warn};

impl IntoResponse for SearchError {
    fn into_response(self) -> Response {
        let status = match &self {
            SearchError::ModelsLoading => StatusCode::SERVICE_UNAVAILABLE,
            SearchError::EmptyProbe => StatusCode::BAD_REQUEST,
            SearchError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SearchError::NotCompleted { .. } => StatusCode::CONFLICT,
        };
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let SearchError::NotCompleted { state, .. } = &self {
            body["state"] = serde_json::json!(state);
        }
        (status, Json(body)).into_response()
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models_ready": state.service.models_ready(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// Body is the raw reference photo. Answers 202 as soon as the job is queued.
pub async fn start_search(State(state): State<Arc<AppState>>, body: Bytes) -> Result<impl IntoResponse, SearchError> {
    let job_id = state.service.start_search(body).map_err(|e| {
        warn!("Search rejected: {}", e);
        e
    })?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "job_id": job_id }))))
}

pub async fn search_progress(State(state): State<Arc<AppState>>, Path(id): Path<JobId>) -> Result<impl IntoResponse, SearchError> {
    let snapshot = state.service.progress(id)?;
    Ok(Json(snapshot))
}

pub async fn search_results(State(state): State<Arc<AppState>>, Path(id): Path<JobId>) -> Result<impl IntoResponse, SearchError> {
    let results = state.service.results(id)?;
    Ok(Json(serde_json::json!({ "job_id": id, "results": results })))
}

pub async fn cancel_search(State(state): State<Arc<AppState>>, Path(id): Path<JobId>) -> Result<impl IntoResponse, SearchError> {
    let requested = state.service.cancel(id)?;
    let body = if requested {
        info!("Cancel requested for search {} via API", id);
        serde_json::json!({ "status": "cancelled", "job_id": id })
    } else {
        serde_json::json!({ "status": "finished", "job_id": id, "state": state.service.progress(id)?.state })
    };
    Ok(Json(body))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut text = state.stats.metrics_text();
    text.push_str(&format!("facefind_jobs_tracked {}\n", state.service.job_count()));
    text.push_str(&format!("facefind_models_ready {}\n", u8::from(state.service.models_ready())));
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text)
}
