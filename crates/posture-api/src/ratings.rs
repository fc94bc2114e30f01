//! Handlers that write snapshots or reshape lineage.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/organizations/:id/rebuild` | Body: [`RebuildBody`]; returns a [`RebuildReport`] |
//! | `POST` | `/default-ratings` | Body: `{"as_of": ...}` (optional) |
//! | `POST` | `/merge` | Body: [`MergeBody`]; returns a [`MergeOutcome`] |
//!
//! Rebuilds and merges hold the per-organization lock for their whole run.

use axum::{
  Json,
  extract::{Path, State},
};
use chrono::{DateTime, Utc};
use posture_core::{
  builder::{self, RebuildReport, RebuildRequest},
  lineage::{MergeOutcome, MergeRequest},
  store::RatingStore,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

// ─── Rebuild ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RebuildBody {
  #[serde(default)]
  pub create_history: bool,
  /// Defaults to now.
  pub as_of:          Option<DateTime<Utc>>,
}

/// `POST /organizations/:id/rebuild`
pub async fn rebuild<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(organization_id): Path<Uuid>,
  Json(body): Json<RebuildBody>,
) -> Result<Json<RebuildReport>, ApiError> {
  let request = RebuildRequest {
    organization_id,
    create_history: body.create_history,
    as_of: body.as_of.unwrap_or_else(Utc::now),
  };
  let _guard = state.locks.lock(organization_id).await;
  let report = builder::rebuild(state.store.as_ref(), request)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(report))
}

// ─── Default ratings ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DefaultRatingsBody {
  pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DefaultRatingsReport {
  pub created: usize,
}

/// `POST /default-ratings`
pub async fn default_ratings<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<DefaultRatingsBody>,
) -> Result<Json<DefaultRatingsReport>, ApiError> {
  let created = builder::default_ratings(state.store.as_ref(), body.as_of.unwrap_or_else(Utc::now))
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(DefaultRatingsReport { created }))
}

// ─── Merge ───────────────────────────────────────────────────────────────────

/// A living organization named by identity rather than id.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedOrganization {
  pub name:    String,
  pub country: String,
  pub kind:    String,
}

#[derive(Debug, Deserialize)]
pub struct MergeBody {
  #[serde(default)]
  pub sources:      Vec<Uuid>,
  /// Looked up among the living and appended to `sources`.
  #[serde(default)]
  pub source_names: Vec<NamedOrganization>,
  pub target_name:  String,
  pub country:      String,
  pub kind:         String,
  /// Defaults to now.
  pub when:         Option<DateTime<Utc>>,
}

/// `POST /merge`
pub async fn merge<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<MergeBody>,
) -> Result<Json<MergeOutcome>, ApiError> {
  let mut sources = body.sources;
  for named in body.source_names {
    let organization = state
      .store
      .find_live_organization(named.name.clone(), named.country.clone(), named.kind.clone())
      .await
      .map_err(ApiError::from_store)?
      .ok_or_else(|| {
        ApiError::NotFound(format!(
          "no living organization {:?} ({}, {})",
          named.name, named.country, named.kind
        ))
      })?;
    sources.push(organization.organization_id);
  }

  let request = MergeRequest {
    sources,
    target_name: body.target_name,
    country: body.country,
    kind: body.kind,
    when: body.when.unwrap_or_else(Utc::now),
  };
  // A living namesake is retired by the merge, so it is locked as well.
  let namesake = state
    .store
    .find_live_organization(
      request.target_name.clone(),
      request.country.clone(),
      request.kind.clone(),
    )
    .await
    .map_err(ApiError::from_store)?;
  let locked = request.sources.iter().copied().chain(namesake.map(|o| o.organization_id));
  let _guards = state.locks.lock_many(locked).await;
  let outcome = state
    .store
    .merge_organizations(request)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(outcome))
}
