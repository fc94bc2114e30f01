//! Error types for `posture-core`.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// The kind of record a [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
  Organization,
  Url,
  Endpoint,
  Coordinate,
  Promise,
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Organization => "organization",
      Self::Url => "url",
      Self::Endpoint => "endpoint",
      Self::Coordinate => "coordinate",
      Self::Promise => "promise",
    })
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("{kind} not found: {id}")]
  NotFound { kind: EntityKind, id: Uuid },

  #[error("invariant violation: {0}")]
  InvariantViolation(String),

  /// Another writer appended to the same entity's snapshot history between
  /// our read of the latest snapshot and our append.
  #[error(
    "concurrent append on {entity_id}: expected sequence {expected:?}, found {found:?}"
  )]
  ConcurrencyConflict {
    entity_id: Uuid,
    expected:  Option<i64>,
    found:     Option<i64>,
  },

  #[error(
    "snapshot {snapshot_id} is inconsistent: stored {stored:?}, computed {computed:?}"
  )]
  InconsistentAggregate {
    snapshot_id: i64,
    stored:      (u32, u32, u32),
    computed:    (u32, u32, u32),
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
    Self::NotFound { kind, id }
  }

  pub fn invariant(message: impl Into<String>) -> Self {
    Self::InvariantViolation(message.into())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
