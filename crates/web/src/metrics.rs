use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};

use crate::api::AppState;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn describe() {
    describe_gauge!(
        "trusttrade_web_build_info",
        "Build info for the TrustTrade web API (value is always 1)."
    );
    describe_counter!(
        "trusttrade_performance_scores_total",
        "Performance score calculations served by the API, by outcome."
    );
    describe_histogram!(
        "trusttrade_db_query_latency_ms",
        "SQLite call latency in milliseconds, including queueing."
    );
    describe_counter!(
        "trusttrade_db_query_errors_total",
        "SQLite calls that returned an error."
    );
    describe_counter!("tracing_error_events", "ERROR-level log events.");
}

/// Install the global Prometheus recorder once and return a handle for `/metrics`.
///
/// Upkeep runs on each `/metrics` request.
pub fn init_global() -> Result<PrometheusHandle> {
    let handle = match PROM_HANDLE.get() {
        Some(handle) => handle.clone(),
        None => {
            let handle = PrometheusBuilder::new().install_recorder()?;
            describe();
            PROM_HANDLE.get_or_init(|| handle).clone()
        }
    };

    let git_sha = std::env::var("GIT_SHA").unwrap_or_else(|_| "unknown".to_string());
    ::metrics::gauge!(
        "trusttrade_web_build_info",
        "version" => env!("CARGO_PKG_VERSION"),
        "git_sha" => git_sha,
    )
    .set(1.0);

    Ok(handle)
}

pub async fn render(State(state): State<Arc<AppState>>) -> Response {
    let Some(handle) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };
    handle.run_upkeep();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{get, test_state};
    use crate::api::{router, AppState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint_renders_text() {
        let (_db, state) = test_state(None).await;
        let response = router(state).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_404_without_recorder() {
        let db = common::db::AsyncDb::open(":memory:").await.unwrap();
        let config = common::config::Config::from_toml_str(include_str!(
            "../../../config/default.toml"
        ))
        .unwrap();
        let state = Arc::new(AppState::new(&db, &config, None));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = router(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
