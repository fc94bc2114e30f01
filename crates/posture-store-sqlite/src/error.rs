//! Error type for `posture-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] posture_core::Error),

  #[error("database error: {0}")]
  Database(#[source] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A column held a value outside its domain (unknown finding type, IP
  /// version, ...).
  #[error("corrupt row: {0}")]
  Corrupt(String),
}

impl From<tokio_rusqlite::Error> for Error {
  /// Errors raised inside a connection closure travel boxed in
  /// `tokio_rusqlite::Error::Other`; unwrap them back to their typed form.
  fn from(e: tokio_rusqlite::Error) -> Self {
    match e {
      tokio_rusqlite::Error::Other(inner) => match inner.downcast::<posture_core::Error>() {
        Ok(core) => Self::Core(*core),
        Err(inner) => match inner.downcast::<Error>() {
          Ok(ours) => *ours,
          Err(inner) => Self::Database(tokio_rusqlite::Error::Other(inner)),
        },
      },
      other => Self::Database(other),
    }
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self { Self::Database(tokio_rusqlite::Error::Rusqlite(e)) }
}

/// Box an error so it can leave a connection closure.
pub(crate) fn in_closure(e: impl Into<Error>) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e.into()))
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
