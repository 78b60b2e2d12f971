use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use common::types::VerificationHistory;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{error_response, internal_error, ApiError, AppState};

pub const ADMIN_SOURCE: &str = "admin";

#[derive(Debug, Serialize)]
pub struct VerificationResponse {
    pub user_id: i64,
    pub is_verified: bool,
    pub verified_seconds: i64,
    pub first_verified: Option<DateTime<Utc>>,
    pub most_recent_verified: Option<DateTime<Utc>>,
    pub history: Vec<VerificationHistory>,
}

#[derive(Debug, Deserialize)]
pub struct SetVerificationRequest {
    pub is_verified: bool,
    pub reason: Option<String>,
}

async fn ensure_user(state: &AppState, user_id: i64) -> Result<(), ApiError> {
    match state.users.get_user(user_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("user {user_id} not found"),
        )),
        Err(e) => Err(internal_error(&e)),
    }
}

pub async fn get_verification(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<VerificationResponse>, ApiError> {
    ensure_user(&state, user_id).await?;

    let repo = &state.verification;
    let history = repo
        .get_history_for_user(user_id)
        .await
        .map_err(|e| internal_error(&e))?;
    let verified = repo
        .calculate_verified_duration(user_id)
        .await
        .map_err(|e| internal_error(&e))?;
    let dates = repo
        .get_verification_dates(user_id)
        .await
        .map_err(|e| internal_error(&e))?;

    Ok(Json(VerificationResponse {
        user_id,
        is_verified: history.last().is_some_and(|r| r.is_verified),
        verified_seconds: verified.num_seconds(),
        first_verified: dates.first_verified,
        most_recent_verified: dates.most_recent_verified,
        history,
    }))
}

/// Admin verify/unverify. Re-sending the current status is a no-op that
/// returns the existing record.
pub async fn set_verification(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<SetVerificationRequest>,
) -> Result<Json<VerificationHistory>, ApiError> {
    ensure_user(&state, user_id).await?;

    let record = state
        .verification
        .add_verification_record(
            user_id,
            req.is_verified,
            req.reason,
            Some(ADMIN_SOURCE.to_string()),
        )
        .await
        .map_err(|e| internal_error(&e))?;
    state
        .users
        .set_verified(user_id, req.is_verified)
        .await
        .map_err(|e| internal_error(&e))?;

    tracing::info!(user_id, is_verified = req.is_verified, "admin verification update");
    Ok(Json(record))
}
