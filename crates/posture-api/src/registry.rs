//! Handlers for the administrative registry: organizations, URLs,
//! endpoints, coordinates and promises.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/organizations` | Every organization, living or dead |
//! | `POST` | `/organizations` | Body: [`NewOrganization`]; 201 |
//! | `GET`  | `/organizations/:id` | 404 if not found |
//! | `POST` | `/organizations/:id/kill` | Body: [`KillBody`] |
//! | `GET`  | `/organizations/:id/{urls,coordinates,promises}` | |
//! | `POST` | `/urls` | Body: [`NewUrl`]; 201 |
//! | `POST` | `/urls/:id/claim` | Body: `{"organization_id": ...}` |
//! | `POST` | `/urls/:id/kill` | Body: [`KillBody`] |
//! | `POST` | `/urls/:id/not-resolvable` | Body: `{"since": ...}` (optional) |
//! | `POST` | `/endpoints`, `/coordinates`, `/promises` | 201 |
//! | `POST` | `/endpoints/:id/kill`, `/coordinates/:id/kill` | Body: [`KillBody`] |

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, Utc};
use posture_core::{
  entity::{
    Coordinate, Endpoint, NewCoordinate, NewEndpoint, NewOrganization, NewPromise, NewUrl,
    Organization, Promise, Url,
  },
  store::RatingStore,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{ApiState, error::ApiError};

/// Body of every `.../kill` endpoint.
#[derive(Debug, Deserialize)]
pub struct KillBody {
  /// Defaults to now.
  pub when:   Option<DateTime<Utc>>,
  pub reason: String,
}

// ─── Organizations ───────────────────────────────────────────────────────────

/// `GET /organizations`
pub async fn list_organizations<S: RatingStore>(
  State(state): State<ApiState<S>>,
) -> Result<Json<Vec<Organization>>, ApiError> {
  let organizations = state.store.list_organizations().await.map_err(ApiError::from_store)?;
  Ok(Json(organizations))
}

/// `POST /organizations`
pub async fn create_organization<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<NewOrganization>,
) -> Result<impl IntoResponse, ApiError> {
  let organization = state.store.add_organization(body).await.map_err(ApiError::from_store)?;
  Ok((StatusCode::CREATED, Json(organization)))
}

/// `GET /organizations/:id`
pub async fn get_organization<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Organization>, ApiError> {
  let organization = state
    .store
    .get_organization(id)
    .await
    .map_err(ApiError::from_store)?
    .ok_or_else(|| ApiError::NotFound(format!("organization {id} not found")))?;
  Ok(Json(organization))
}

/// `POST /organizations/:id/kill`
pub async fn kill_organization<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<KillBody>,
) -> Result<Json<Organization>, ApiError> {
  let _guard = state.locks.lock(id).await;
  let organization = state
    .store
    .kill_organization(id, body.when.unwrap_or_else(Utc::now), body.reason)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(organization))
}

/// `GET /organizations/:id/urls`
pub async fn organization_urls<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<Url>>, ApiError> {
  let urls = state.store.urls_of_organization(id).await.map_err(ApiError::from_store)?;
  Ok(Json(urls))
}

/// `GET /organizations/:id/coordinates`
pub async fn organization_coordinates<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<Coordinate>>, ApiError> {
  let coordinates = state
    .store
    .coordinates_of_organization(id)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(coordinates))
}

/// `GET /organizations/:id/promises`
pub async fn organization_promises<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<Promise>>, ApiError> {
  let promises = state.store.promises_of_organization(id).await.map_err(ApiError::from_store)?;
  Ok(Json(promises))
}

// ─── Urls ────────────────────────────────────────────────────────────────────

/// `POST /urls`
pub async fn create_url<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<NewUrl>,
) -> Result<impl IntoResponse, ApiError> {
  let url = state.store.add_url(body).await.map_err(ApiError::from_store)?;
  Ok((StatusCode::CREATED, Json(url)))
}

/// `GET /urls/:id`
pub async fn get_url<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Url>, ApiError> {
  let url = state
    .store
    .get_url(id)
    .await
    .map_err(ApiError::from_store)?
    .ok_or_else(|| ApiError::NotFound(format!("url {id} not found")))?;
  Ok(Json(url))
}

#[derive(Debug, Deserialize)]
pub struct ClaimBody {
  pub organization_id: Uuid,
}

/// `POST /urls/:id/claim` (idempotent)
pub async fn claim_url<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<ClaimBody>,
) -> Result<StatusCode, ApiError> {
  state
    .store
    .claim_url(id, body.organization_id)
    .await
    .map_err(ApiError::from_store)?;
  Ok(StatusCode::NO_CONTENT)
}

/// `POST /urls/:id/kill`
pub async fn kill_url<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<KillBody>,
) -> Result<Json<Url>, ApiError> {
  let url = state
    .store
    .kill_url(id, body.when.unwrap_or_else(Utc::now), body.reason)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(url))
}

#[derive(Debug, Default, Deserialize)]
pub struct NotResolvableBody {
  pub since: Option<DateTime<Utc>>,
}

/// `POST /urls/:id/not-resolvable`
pub async fn not_resolvable<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<NotResolvableBody>,
) -> Result<Json<Url>, ApiError> {
  let url = state
    .store
    .mark_not_resolvable(id, body.since.unwrap_or_else(Utc::now))
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(url))
}

// ─── Endpoints ───────────────────────────────────────────────────────────────

/// `POST /endpoints`
pub async fn create_endpoint<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<NewEndpoint>,
) -> Result<impl IntoResponse, ApiError> {
  let endpoint = state.store.add_endpoint(body).await.map_err(ApiError::from_store)?;
  Ok((StatusCode::CREATED, Json(endpoint)))
}

/// `POST /endpoints/:id/kill`
pub async fn kill_endpoint<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<KillBody>,
) -> Result<Json<Endpoint>, ApiError> {
  let endpoint = state
    .store
    .kill_endpoint(id, body.when.unwrap_or_else(Utc::now), body.reason)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(endpoint))
}

// ─── Coordinates and promises ────────────────────────────────────────────────

/// `POST /coordinates`
pub async fn create_coordinate<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<NewCoordinate>,
) -> Result<impl IntoResponse, ApiError> {
  let coordinate = state.store.add_coordinate(body).await.map_err(ApiError::from_store)?;
  Ok((StatusCode::CREATED, Json(coordinate)))
}

/// `POST /coordinates/:id/kill`
pub async fn kill_coordinate<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<KillBody>,
) -> Result<Json<Coordinate>, ApiError> {
  let coordinate = state
    .store
    .kill_coordinate(id, body.when.unwrap_or_else(Utc::now), body.reason)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(coordinate))
}

/// `POST /promises`
pub async fn create_promise<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Json(body): Json<NewPromise>,
) -> Result<impl IntoResponse, ApiError> {
  let promise = state.store.add_promise(body).await.map_err(ApiError::from_store)?;
  Ok((StatusCode::CREATED, Json(promise)))
}
