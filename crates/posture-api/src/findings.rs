//! Scan fact ingest.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/findings` | Body: [`NewFinding`]; 201 + stored finding |
//! | `GET`  | `/urls/:id/findings` | Every finding on the URL's endpoints, oldest first |
//!
//! Findings are append-only. Ingest only records them; ratings change when
//! the organization is next rebuilt.

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use posture_core::{
  finding::{Finding, NewFinding},
  store::RatingStore,
};
use tracing::debug;
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

/// `POST /findings`
pub async fn submit<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<NewFinding>,
) -> Result<impl IntoResponse, ApiError> {
  let finding = state.store.submit_finding(body).await.map_err(ApiError::from_store)?;
  debug!(
    endpoint = %finding.endpoint_id,
    finding_type = %finding.finding_type,
    sequence = finding.sequence,
    "finding recorded"
  );
  Ok((StatusCode::CREATED, Json(finding)))
}

/// `GET /urls/:id/findings`
pub async fn of_url<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<Finding>>, ApiError> {
  let findings = state.store.findings_of_url(id).await.map_err(ApiError::from_store)?;
  Ok(Json(findings))
}
