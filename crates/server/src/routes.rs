//! HTTP read side. Snapshot endpoints read only the published `Arc`;
//! record endpoints clone under the cache lock. Nothing here blocks
//! the watchers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use tally_cache::AggregationCache;

pub fn router(cache: Arc<AggregationCache>) -> Router {
    Router::new()
        .route("/", get(snapshot))
        .route("/jobs", get(all_jobs))
        .route("/pods", get(all_pods))
        .route("/job/{namespace}/{name}", get(job_by_key).delete(cleanup_job))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(cache)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn snapshot(State(cache): State<Arc<AggregationCache>>) -> Response {
    Json(cache.snapshot().as_ref().clone()).into_response()
}

async fn all_jobs(State(cache): State<Arc<AggregationCache>>) -> Response {
    Json(cache.jobs()).into_response()
}

async fn all_pods(State(cache): State<Arc<AggregationCache>>) -> Response {
    Json(cache.pods()).into_response()
}

async fn job_by_key(
    State(cache): State<Arc<AggregationCache>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = tally_core::job_key(&namespace, &name);
    match cache.get_job(&key) {
        Some(job) => Json(job).into_response(),
        None => not_found(&key),
    }
}

async fn cleanup_job(
    State(cache): State<Arc<AggregationCache>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = tally_core::job_key(&namespace, &name);
    if cache.cleanup(&key) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(&key)
    }
}

fn not_found(key: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": format!("job not found: {key}") })))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_builds() {
        let _ = router(Arc::new(AggregationCache::new()));
    }
}
