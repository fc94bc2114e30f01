//! Organization merges.
//!
//! A merge never rewrites history. The sources (and any living organization
//! already carrying the target identity) are killed at `when`, and a brand
//! new successor is born at the same instant. Coordinates and promises are
//! cloned onto the successor; URL ownership is extended, never transferred.
//!
//! The types and per-row transformations live here so every backend applies
//! them identically; the backend only provides the atomic boundary.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  entity::{Coordinate, Organization, Promise},
  error::EntityKind,
  lifecycle::Lifecycle,
};

/// Kill reason recorded on a living organization that already held the
/// target identity.
pub const SUPERSEDED_REASON: &str = "superseded by merge";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
  /// Organizations folded into the successor. Each must be alive at `when`.
  pub sources:     Vec<Uuid>,
  pub target_name: String,
  pub country:     String,
  pub kind:        String,
  /// Cut-over instant. Sources die and the successor is born here.
  pub when:        DateTime<Utc>,
}

impl MergeRequest {
  pub fn validate(&self) -> Result<()> {
    if self.target_name.trim().is_empty() {
      return Err(Error::invariant("merge target name is empty"));
    }
    if self.sources.is_empty() {
      return Err(Error::invariant("merge needs at least one source"));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = self.sources.iter().find(|id| !seen.insert(**id)) {
      return Err(Error::invariant(format!("source {dup} is listed twice")));
    }
    Ok(())
  }

  /// The successor organization, carrying over the advisory attributes of
  /// `predecessor` when there is one.
  pub fn successor(&self, predecessor: Option<&Organization>) -> Organization {
    Organization {
      organization_id: Uuid::new_v4(),
      name:            self.target_name.clone(),
      country:         self.country.clone(),
      kind:            self.kind.clone(),
      twitter_handle:  predecessor.and_then(|p| p.twitter_handle.clone()),
      lifecycle:       Lifecycle::born(self.when),
    }
  }

  /// Whether `org` is one of the named sources.
  pub fn is_source(&self, org: &Organization) -> bool {
    self.sources.contains(&org.organization_id)
  }
}

/// Kill reason recorded on each merge source.
pub fn merged_into_reason(successor: &Organization, when: DateTime<Utc>) -> String {
  format!(
    "Merged into {} ({}) on {}",
    successor.name,
    successor.organization_id,
    when.to_rfc3339()
  )
}

/// Check that `source` can take part in a merge at `when`. A source that is
/// not alive at `when` is treated as missing.
pub fn ensure_mergeable(source: &Organization, when: DateTime<Utc>) -> Result<()> {
  if !source.lifecycle.alive_at(when) {
    return Err(Error::not_found(EntityKind::Organization, source.organization_id));
  }
  Ok(())
}

/// A fresh coordinate row for `successor`, born at `when`, with the same
/// geometry as `coordinate`.
pub fn clone_coordinate(
  coordinate: &Coordinate,
  successor: Uuid,
  when: DateTime<Utc>,
) -> Coordinate {
  Coordinate {
    coordinate_id:   Uuid::new_v4(),
    organization_id: successor,
    area:            coordinate.area.clone(),
    geometry_kind:   coordinate.geometry_kind.clone(),
    lifecycle:       Lifecycle::born(when),
  }
}

/// A copy of `promise` owned by `successor`.
pub fn clone_promise(promise: &Promise, successor: Uuid) -> Promise {
  Promise {
    promise_id:      Uuid::new_v4(),
    organization_id: successor,
    ..promise.clone()
  }
}

/// What a merge did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
  pub organization:       Organization,
  /// Living organization with the target identity that was not a source and
  /// was killed as superseded.
  pub superseded:         Option<Uuid>,
  pub merged:             Vec<Uuid>,
  pub coordinates_cloned: usize,
  pub promises_cloned:    usize,
  pub urls_adopted:       usize,
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn when() -> DateTime<Utc> { Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap() }

  fn request(sources: Vec<Uuid>) -> MergeRequest {
    MergeRequest {
      sources,
      target_name: "Midden-Groningen".into(),
      country: "NL".into(),
      kind: "municipality".into(),
      when: when(),
    }
  }

  fn org(name: &str, created: DateTime<Utc>) -> Organization {
    Organization {
      organization_id: Uuid::new_v4(),
      name:            name.into(),
      country:         "NL".into(),
      kind:            "municipality".into(),
      twitter_handle:  Some("@hoogezand".into()),
      lifecycle:       Lifecycle::born(created),
    }
  }

  #[test]
  fn rejects_empty_and_duplicate_sources() {
    assert!(request(vec![]).validate().is_err());
    let a = Uuid::new_v4();
    assert!(request(vec![a, a]).validate().is_err());
    assert!(request(vec![a, Uuid::new_v4()]).validate().is_ok());

    let mut r = request(vec![a]);
    r.target_name = "  ".into();
    assert!(r.validate().is_err());
  }

  #[test]
  fn successor_is_born_at_cutover_and_keeps_handle() {
    let pred = org("Midden-Groningen", when() - chrono::Duration::days(400));
    let succ = request(vec![]).successor(Some(&pred));
    assert_eq!(succ.lifecycle.created_on, when());
    assert_eq!(succ.twitter_handle.as_deref(), Some("@hoogezand"));
    assert_ne!(succ.organization_id, pred.organization_id);

    let fresh = request(vec![]).successor(None);
    assert!(fresh.twitter_handle.is_none());
  }

  #[test]
  fn source_must_be_alive_at_cutover() {
    let mut src = org("Hoogezand", when() - chrono::Duration::days(10));
    assert!(ensure_mergeable(&src, when()).is_ok());
    src.lifecycle.kill(when() - chrono::Duration::days(1), "gone").unwrap();
    assert!(matches!(ensure_mergeable(&src, when()), Err(Error::NotFound { .. })));

    let unborn = org("Slochteren", when() + chrono::Duration::days(1));
    assert!(matches!(ensure_mergeable(&unborn, when()), Err(Error::NotFound { .. })));
  }

  #[test]
  fn clones_get_new_identity() {
    let src = org("Menterwolde", when() - chrono::Duration::days(10));
    let succ = Uuid::new_v4();
    let coord = Coordinate {
      coordinate_id:   Uuid::new_v4(),
      organization_id: src.organization_id,
      area:            serde_json::json!([[[6.8, 53.1]]]),
      geometry_kind:   "MultiPolygon".into(),
      lifecycle:       Lifecycle::born(src.lifecycle.created_on),
    };
    let cloned = clone_coordinate(&coord, succ, when());
    assert_eq!(cloned.organization_id, succ);
    assert_eq!(cloned.area, coord.area);
    assert_ne!(cloned.coordinate_id, coord.coordinate_id);
    assert_eq!(cloned.lifecycle.created_on, when());

    let promise = Promise {
      promise_id:      Uuid::new_v4(),
      organization_id: src.organization_id,
      created_on:      when() - chrono::Duration::days(5),
      expires_on:      Some(when() + chrono::Duration::days(5)),
      notes:           Some("ticket 12".into()),
    };
    let p = clone_promise(&promise, succ);
    assert_eq!(p.organization_id, succ);
    assert_eq!(p.expires_on, promise.expires_on);
    assert_eq!(p.notes, promise.notes);
  }

  #[test]
  fn reason_names_the_successor() {
    let succ = request(vec![]).successor(None);
    let reason = merged_into_reason(&succ, when());
    assert!(reason.starts_with("Merged into Midden-Groningen ("));
    assert!(reason.contains(&succ.organization_id.to_string()));
  }
}
