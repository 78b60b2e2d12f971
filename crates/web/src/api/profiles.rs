use axum::{
    extract::{Path, State},
    Json,
};
use common::types::PerformanceScore;
use std::sync::Arc;

use crate::api::AppState;

/// Scoring never fails: unknown and ineligible users come back unrated.
pub async fn get_performance(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Json<PerformanceScore> {
    Json(state.performance.calculate_performance_score(user_id).await)
}
