//! HTTP server and batch plumbing for the rating engine.
//!
//! Mounts the JSON API under `/api`, adds a job endpoint that fans rebuilds
//! out over a [`worker::RebuildPool`], and wraps everything in request
//! tracing.

pub mod error;
pub mod worker;

pub use error::Error;

use std::{path::{Path, PathBuf}, sync::Arc};

use axum::{
  Json, Router,
  extract::State,
  http::StatusCode,
  response::IntoResponse,
  routing::{get, post},
};
use chrono::{DateTime, Utc};
use posture_api::ApiState;
use posture_core::{
  stats::{Timeframe, default_timeframes},
  store::RatingStore,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use worker::RebuildPool;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Runtime configuration, deserialised from `config.toml` layered with
/// `POSTURE_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:       String,
  #[serde(default = "default_port")]
  pub port:       u16,
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  /// Rebuild pool size.
  #[serde(default = "default_workers")]
  pub workers:    usize,
  /// Statistics offsets used when a request names none.
  #[serde(default = "default_timeframes")]
  pub timeframes: Vec<Timeframe>,
}

fn default_host() -> String { "127.0.0.1".to_owned() }

fn default_port() -> u16 { 8600 }

fn default_store_path() -> PathBuf { PathBuf::from("posture.sqlite") }

fn default_workers() -> usize { 4 }

impl ServerConfig {
  /// Read `path` if it exists, then apply the environment on top.
  pub fn load(path: &Path) -> error::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("POSTURE"))
      .build()?;
    Ok(settings.try_deserialize()?)
  }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

pub struct JobsState<S> {
  pub store: Arc<S>,
  pub pool:  Arc<RebuildPool>,
}

impl<S> Clone for JobsState<S> {
  fn clone(&self) -> Self { Self { store: self.store.clone(), pool: self.pool.clone() } }
}

#[derive(Debug, Default, Deserialize)]
pub struct RebuildAllBody {
  pub as_of:          Option<DateTime<Utc>>,
  #[serde(default)]
  pub create_history: bool,
}

/// `POST /jobs/rebuild`: queue a rebuild of every living organization and
/// return immediately.
async fn queue_rebuilds<S: RatingStore + 'static>(
  State(state): State<JobsState<S>>,
  Json(body): Json<RebuildAllBody>,
) -> Result<impl IntoResponse, Error> {
  let as_of = body.as_of.unwrap_or_else(Utc::now);
  let queued = state
    .pool
    .submit_all(state.store.as_ref(), as_of, body.create_history)
    .await?;
  Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued, "as_of": as_of }))))
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build the full application router.
pub fn router<S>(api: ApiState<S>, pool: Arc<RebuildPool>) -> Router
where
  S: RatingStore + 'static,
{
  let jobs = Router::new()
    .route("/jobs/rebuild", post(queue_rebuilds::<S>))
    .with_state(JobsState { store: api.store.clone(), pool });

  Router::new()
    .route("/health", get(|| async { "ok" }))
    .merge(jobs)
    .nest("/api", posture_api::api_router(api))
    .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
  use axum::{body::Body, http::Request};
  use posture_core::{entity::NewOrganization, locks::OrganizationLocks};
  use posture_store_sqlite::SqliteStore;
  use tower::ServiceExt as _;

  use super::*;

  async fn app() -> (Router, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let locks = OrganizationLocks::new();
    let pool = Arc::new(RebuildPool::spawn(store.clone(), locks.clone(), 2));
    let api = ApiState::new(store.clone(), locks, default_timeframes());
    (router(api, pool), store)
  }

  #[test]
  fn missing_config_file_falls_back_to_defaults() {
    let config = ServerConfig::load(Path::new("does-not-exist.toml")).unwrap();
    assert_eq!(config.workers, 4);
    assert_eq!(config.timeframes.len(), default_timeframes().len());
    assert_eq!(config.address(), format!("{}:{}", config.host, config.port));
  }

  #[tokio::test]
  async fn health_responds() {
    let (app, _) = app().await;
    let resp = app
      .oneshot(Request::get("/health").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
  }

  #[tokio::test]
  async fn api_is_nested() {
    let (app, _) = app().await;
    let resp = app
      .oneshot(Request::get("/api/organizations").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
  }

  #[tokio::test]
  async fn rebuild_job_is_accepted() {
    let (app, store) = app().await;
    store
      .add_organization(NewOrganization {
        name:           "Arnhem".into(),
        country:        "NL".into(),
        kind:           "municipality".into(),
        twitter_handle: None,
        created_on:     "2020-01-01T00:00:00Z".parse().unwrap(),
      })
      .await
      .unwrap();

    let req = Request::post("/jobs/rebuild")
      .header("content-type", "application/json")
      .body(Body::from(r#"{"as_of":"2020-02-01T00:00:00Z"}"#))
      .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["queued"], 1);
  }
}
