//! JSON REST API for the rating engine.
//!
//! Exposes an axum [`Router`] backed by any [`posture_core::store::RatingStore`].
//! Auth, TLS, and transport concerns are the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", posture_api::api_router(ApiState::new(store, locks, timeframes)))
//! ```

pub mod error;
pub mod findings;
pub mod ratings;
pub mod registry;
pub mod statistics;
pub mod views;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use chrono::{DateTime, Utc};
use posture_core::{locks::OrganizationLocks, stats::Timeframe, store::RatingStore};
use serde::Deserialize;

pub use error::ApiError;

// ─── State ───────────────────────────────────────────────────────────────────

/// Shared state threaded through all handlers.
pub struct ApiState<S> {
  pub store:      Arc<S>,
  /// Serialises rebuilds and merges per organization.
  pub locks:      OrganizationLocks,
  /// Used by the statistics endpoints when the request names none.
  pub timeframes: Arc<[Timeframe]>,
}

impl<S> ApiState<S> {
  pub fn new(store: Arc<S>, locks: OrganizationLocks, timeframes: Vec<Timeframe>) -> Self {
    Self { store, locks, timeframes: timeframes.into() }
  }
}

impl<S> Clone for ApiState<S> {
  fn clone(&self) -> Self {
    Self {
      store:      self.store.clone(),
      locks:      self.locks.clone(),
      timeframes: self.timeframes.clone(),
    }
  }
}

/// `?as_of=` query parameter shared by the read endpoints. Defaults to now.
#[derive(Debug, Default, Deserialize)]
pub struct AsOf {
  pub as_of: Option<DateTime<Utc>>,
}

impl AsOf {
  pub fn or_now(&self) -> DateTime<Utc> { self.as_of.unwrap_or_else(Utc::now) }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build a fully-materialised API router.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(state: ApiState<S>) -> Router<()>
where
  S: RatingStore + 'static,
{
  Router::new()
    // Registry
    .route("/organizations", get(registry::list_organizations::<S>).post(registry::create_organization::<S>))
    .route("/organizations/{id}", get(registry::get_organization::<S>))
    .route("/organizations/{id}/kill", post(registry::kill_organization::<S>))
    .route("/organizations/{id}/urls", get(registry::organization_urls::<S>))
    .route("/organizations/{id}/coordinates", get(registry::organization_coordinates::<S>))
    .route("/organizations/{id}/promises", get(registry::organization_promises::<S>))
    .route("/urls", post(registry::create_url::<S>))
    .route("/urls/{id}", get(registry::get_url::<S>))
    .route("/urls/{id}/claim", post(registry::claim_url::<S>))
    .route("/urls/{id}/kill", post(registry::kill_url::<S>))
    .route("/urls/{id}/not-resolvable", post(registry::not_resolvable::<S>))
    .route("/endpoints", post(registry::create_endpoint::<S>))
    .route("/endpoints/{id}/kill", post(registry::kill_endpoint::<S>))
    .route("/coordinates", post(registry::create_coordinate::<S>))
    .route("/coordinates/{id}/kill", post(registry::kill_coordinate::<S>))
    .route("/promises", post(registry::create_promise::<S>))
    // Ingest
    .route("/findings", post(findings::submit::<S>))
    .route("/urls/{id}/findings", get(findings::of_url::<S>))
    // Ratings
    .route("/organizations/{id}/rebuild", post(ratings::rebuild::<S>))
    .route("/default-ratings", post(ratings::default_ratings::<S>))
    .route("/merge", post(ratings::merge::<S>))
    // Views
    .route("/resolve", get(views::resolve::<S>))
    .route("/rankings", get(views::rankings::<S>))
    .route("/organizations/{id}/report", get(views::report::<S>))
    // Statistics
    .route("/statistics", get(statistics::measurements::<S>))
    .route("/statistics/vulnerabilities", get(statistics::vulnerabilities::<S>))
    .with_state(state)
}

#[cfg(test)]
mod tests;
