//! Operator route for editing user records in the in-memory store.
//!
//! Edits go through [`MemoryRecordStore::update`], so they reach live players
//! through the change feed exactly like edits made by any other writer.

use crate::error::SyncError;
use crate::records::{AttributeChange, MemoryRecordStore, RecordStore, UserRecord};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::patch;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AdminState {
    records: Arc<MemoryRecordStore>,
    token: Arc<str>,
}

impl AdminState {
    pub fn new(records: Arc<MemoryRecordStore>, token: impl Into<Arc<str>>) -> Self {
        Self {
            records,
            token: token.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordPatch {
    pub coins: Option<i64>,
    pub color: Option<String>,
}

type ApiError = (StatusCode, String);

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/users/:username", patch(patch_user))
        .with_state(state)
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

fn api_error(e: SyncError) -> ApiError {
    match e {
        SyncError::UnknownUser(_) => (StatusCode::NOT_FOUND, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn patch_user(
    State(state): State<AdminState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<RecordPatch>,
) -> Result<Json<UserRecord>, ApiError> {
    if !authorized(&headers, &state.token) {
        return Err((StatusCode::UNAUTHORIZED, "invalid admin token".into()));
    }
    let mut changes = Vec::new();
    if let Some(coins) = patch.coins {
        changes.push(AttributeChange::Coins(coins));
    }
    if let Some(color) = patch.color {
        changes.push(AttributeChange::Color(color));
    }
    if changes.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "nothing to update".into()));
    }

    let record = state
        .records
        .find_user_by_username(&username)
        .await
        .map_err(api_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no user {}", username)))?;

    for change in changes {
        info!("Admin update for {}: {:?}", username, change);
        state
            .records
            .update(&record.id, change)
            .await
            .map_err(api_error)?;
    }

    let updated = state
        .records
        .find_user_by_id(&record.id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no user {}", username)))?;
    Ok(Json(updated))
}
