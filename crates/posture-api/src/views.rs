//! Point-in-time read endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/resolve` | `?as_of`; every organization and URL alive then |
//! | `GET`  | `/rankings` | `?as_of`, `?limit` (default 10) |
//! | `GET`  | `/organizations/:id/report` | `?as_of`; 404 if nothing to report |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use posture_core::{
  resolver::{
    self, OrganizationReport, PointInTime, ResolvedOrganization, ResolvedUrl, terrible_urls,
    top_failing, top_performing,
  },
  store::RatingStore,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiState, AsOf, error::ApiError};

/// `GET /resolve[?as_of=...]`
pub async fn resolve<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Query(params): Query<AsOf>,
) -> Result<Json<PointInTime>, ApiError> {
  let view = resolver::resolve(state.store.as_ref(), params.or_now())
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(view))
}

// ─── Rankings ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RankingParams {
  pub as_of: Option<DateTime<Utc>>,
  pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct Rankings {
  pub as_of:          DateTime<Utc>,
  pub top_failing:    Vec<ResolvedOrganization>,
  pub top_performing: Vec<ResolvedOrganization>,
  pub terrible_urls:  Vec<ResolvedUrl>,
}

/// `GET /rankings[?as_of=...][&limit=...]`
pub async fn rankings<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Query(params): Query<RankingParams>,
) -> Result<Json<Rankings>, ApiError> {
  let as_of = params.as_of.unwrap_or_else(Utc::now);
  let limit = params.limit.unwrap_or(10);
  let view = resolver::resolve(state.store.as_ref(), as_of)
    .await
    .map_err(ApiError::from_store)?;

  Ok(Json(Rankings {
    as_of,
    top_failing: top_failing(&view.organizations, limit).into_iter().cloned().collect(),
    top_performing: top_performing(&view.organizations, limit).into_iter().cloned().collect(),
    terrible_urls: terrible_urls(&view.urls, limit).into_iter().cloned().collect(),
  }))
}

// ─── Report ──────────────────────────────────────────────────────────────────

/// `GET /organizations/:id/report[?as_of=...]`
pub async fn report<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
  Query(params): Query<AsOf>,
) -> Result<Json<OrganizationReport>, ApiError> {
  let as_of = params.or_now();
  let report = resolver::organization_report(state.store.as_ref(), id, as_of)
    .await
    .map_err(ApiError::from_store)?
    .ok_or_else(|| ApiError::NotFound(format!("organization {id} has no rating at {as_of}")))?;
  Ok(Json(report))
}
