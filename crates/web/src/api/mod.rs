pub mod posts;
pub mod profiles;
pub mod verification;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::config::Config;
use common::db::AsyncDb;
use common::holdings::SqliteHoldingsRepository;
use common::performance::{PerformanceScoreRepository, ScoringSettings};
use common::posts::{PostRepository, PostService};
use common::users::UserRepository;
use common::verification::VerificationHistoryRepository;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state available to all handlers.
pub struct AppState {
    pub posts: PostService,
    pub performance: PerformanceScoreRepository<SqliteHoldingsRepository>,
    pub verification: VerificationHistoryRepository,
    pub users: UserRepository,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(db: &AsyncDb, config: &Config, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            posts: PostService::new(PostRepository::new(db.clone()), config.feed.clone()),
            performance: PerformanceScoreRepository::new(
                db.clone(),
                SqliteHoldingsRepository::new(db.clone()),
                ScoringSettings::from(&config.performance_score),
            ),
            verification: VerificationHistoryRepository::new(db.clone()),
            users: UserRepository::new(db.clone()),
            metrics,
            started_at: chrono::Utc::now(),
            api_key: config.web.as_ref().and_then(|w| w.api_key.clone()),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct MessageResponse {
    pub message: String,
}

pub(crate) type ApiError = (StatusCode, Json<MessageResponse>);

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(MessageResponse {
            message: message.into(),
        }),
    )
}

/// Log a storage failure and hide its details from the client.
pub(crate) fn internal_error(e: &anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(crate::metrics::render))
        .route("/api/posts", get(posts::get_feed))
        .route(
            "/api/users/{id}/performance",
            get(profiles::get_performance),
        )
        .route(
            "/api/users/{id}/verification",
            get(verification::get_verification),
        );

    // Writes require a bearer token when an api_key is configured.
    let protected = Router::new()
        .route(
            "/api/users/{id}/verification",
            post(verification::set_verification),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer token auth middleware. Skipped when no api_key is configured.
async fn auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(api_key) = &state.api_key else {
        return next.run(req).await;
    };

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if constant_time_eq(token.as_bytes(), api_key.as_bytes()) => {
            next.run(req).await
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{get, send, test_state};
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_db, state) = test_state(None).await;
        let (status, json) = send(&state, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_i64().unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (_db, state) = test_state(None).await;
        let (status, _) = send(&state, get("/api/trades")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
    }
}
