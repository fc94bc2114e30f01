//! Validity intervals shared by organizations, URLs, endpoints and
//! coordinates.
//!
//! Nothing is ever deleted. An entity is "killed" by recording the instant it
//! stopped existing; every query then decides liveness against the
//! timestamp it is answering for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// When an entity started and (optionally) stopped existing.
///
/// The interval is half-open: an entity killed at `T` is alive for every
/// instant before `T` and dead from `T` onwards. This lets a successor with
/// `created_on == T` take over without the two ever being alive together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
  pub created_on:     DateTime<Utc>,
  pub is_dead:        bool,
  pub is_dead_since:  Option<DateTime<Utc>>,
  pub is_dead_reason: Option<String>,
}

impl Lifecycle {
  /// A lifecycle that starts at `created_on` and has not ended.
  pub fn born(created_on: DateTime<Utc>) -> Self {
    Self {
      created_on,
      is_dead: false,
      is_dead_since: None,
      is_dead_reason: None,
    }
  }

  /// `true` iff the entity existed at `at`.
  pub fn alive_at(&self, at: DateTime<Utc>) -> bool {
    if self.created_on > at {
      return false;
    }
    match (self.is_dead, self.is_dead_since) {
      (false, _) => true,
      (true, Some(since)) => at < since,
      // Rejected by `validate`; never treat a corrupt row as alive.
      (true, None) => false,
    }
  }

  /// The instant the entity stopped existing, if it has.
  pub fn ended_at(&self) -> Option<DateTime<Utc>> {
    if self.is_dead { self.is_dead_since } else { None }
  }

  /// Check the write-time invariants.
  pub fn validate(&self) -> Result<()> {
    match (self.is_dead, self.is_dead_since) {
      (true, None) => Err(Error::invariant("is_dead is set without is_dead_since")),
      (false, Some(_)) => {
        Err(Error::invariant("is_dead_since is set on a living entity"))
      }
      (true, Some(since)) if since < self.created_on => Err(Error::invariant(
        format!("is_dead_since {since} precedes created_on {}", self.created_on),
      )),
      _ => Ok(()),
    }
  }

  /// Mark the entity dead from `when` onwards.
  ///
  /// Death is terminal: killing an already-dead entity is rejected rather
  /// than silently moving its end date.
  pub fn kill(&mut self, when: DateTime<Utc>, reason: impl Into<String>) -> Result<()> {
    if self.is_dead {
      return Err(Error::invariant("entity is already dead"));
    }
    if when < self.created_on {
      return Err(Error::invariant(format!(
        "cannot die at {when}, before creation at {}",
        self.created_on
      )));
    }
    self.is_dead = true;
    self.is_dead_since = Some(when);
    self.is_dead_reason = Some(reason.into());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone};

  use super::*;

  fn t(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 1, day, 0, 0, 0).unwrap()
  }

  #[test]
  fn living_entity_is_alive_from_creation() {
    let l = Lifecycle::born(t(10));
    assert!(!l.alive_at(t(9)));
    assert!(l.alive_at(t(10)));
    assert!(l.alive_at(t(31)));
  }

  #[test]
  fn death_is_exclusive() {
    let mut l = Lifecycle::born(t(1));
    l.kill(t(10), "gone").unwrap();
    assert!(l.alive_at(t(10) - Duration::seconds(1)));
    assert!(!l.alive_at(t(10)));
    assert!(!l.alive_at(t(11)));
    assert_eq!(l.ended_at(), Some(t(10)));
  }

  #[test]
  fn kill_twice_is_rejected() {
    let mut l = Lifecycle::born(t(1));
    l.kill(t(5), "first").unwrap();
    let err = l.kill(t(6), "second").unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
    assert_eq!(l.is_dead_since, Some(t(5)));
  }

  #[test]
  fn kill_before_creation_is_rejected() {
    let mut l = Lifecycle::born(t(5));
    assert!(l.kill(t(4), "too early").is_err());
    assert!(!l.is_dead);
  }

  #[test]
  fn validate_catches_inconsistent_flags() {
    let mut l = Lifecycle::born(t(5));
    l.is_dead = true;
    assert!(l.validate().is_err());
    assert!(!l.alive_at(t(6)));

    let mut l = Lifecycle::born(t(5));
    l.is_dead_since = Some(t(6));
    assert!(l.validate().is_err());

    let mut l = Lifecycle::born(t(5));
    l.is_dead = true;
    l.is_dead_since = Some(t(4));
    assert!(l.validate().is_err());
  }
}
