//! Error type for the server's own moving parts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("rebuild pool is shut down")]
  PoolClosed,

  #[error("rebuild worker panicked: {0}")]
  Join(#[from] tokio::task::JoinError),

  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl axum::response::IntoResponse for Error {
  fn into_response(self) -> axum::response::Response {
    use axum::{Json, http::StatusCode};

    let status = match &self {
      Error::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
  }
}
