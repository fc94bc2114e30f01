//! API error type and [`axum::response::IntoResponse`] implementation.

use std::error::Error as StdError;

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use posture_core::Error as CoreError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  /// A concurrent writer won the race; the caller may retry.
  #[error("conflict: {0}")]
  Conflict(String),

  #[error("unprocessable: {0}")]
  Unprocessable(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn StdError + Send + Sync>),
}

impl ApiError {
  /// Classify a store error by the domain error somewhere in its source
  /// chain. Anything without one is an opaque 500.
  pub fn from_store<E>(e: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    let classified = std::iter::successors(Some(&e as &(dyn StdError + 'static)), |&err| err.source())
    .find_map(|err| err.downcast_ref::<CoreError>())
    .and_then(|core| match core {
      CoreError::NotFound { .. } => Some(Self::NotFound(core.to_string())),
      CoreError::ConcurrencyConflict { .. } => Some(Self::Conflict(core.to_string())),
      CoreError::InvariantViolation(_) => Some(Self::Unprocessable(core.to_string())),
      CoreError::InconsistentAggregate { .. } | CoreError::Serialization(_) => None,
    });
    classified.unwrap_or_else(|| Self::Store(Box::new(e)))
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::Conflict(m) => {
        warn!(%m, "write conflict");
        (StatusCode::CONFLICT, m.clone())
      }
      ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
      ApiError::Store(e) => {
        error!(error = %e, "store failure");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
      }
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}
