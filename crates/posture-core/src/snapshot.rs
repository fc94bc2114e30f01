//! Rating snapshots: the append-only rating history of each entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::{
  Error, Result,
  calculation::{Aggregate, OrganizationCalculation, UrlCalculation, digest},
  classify::{Color, classify},
  finding::Severity,
};

/// Rating of an organization that does not claim any URL yet. Snapshots with
/// this rating are skipped by every statistic.
pub const NO_RATING: i64 = -1;

/// One point in an entity's rating history.
///
/// `(entity_id, sequence)` is unique and `sequence` increases by one per
/// append, so within an entity snapshots are totally ordered both by
/// `sequence` and by `when`. `snapshot_id` is global and breaks ties between
/// snapshots sharing a `when`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<C> {
  pub snapshot_id: i64,
  pub entity_id:   Uuid,
  pub sequence:    i64,
  pub when:        DateTime<Utc>,
  pub rating:      i64,
  #[serde(flatten)]
  pub severity:    Severity,
  pub calculation: C,
  /// Structural hash of `(rating, calculation)`.
  pub digest:      String,
}

pub type UrlSnapshot = Snapshot<UrlCalculation>;
pub type OrganizationSnapshot = Snapshot<OrganizationCalculation>;

impl<C: Aggregate> Snapshot<C> {
  pub fn is_rated(&self) -> bool { self.rating != NO_RATING }

  pub fn color(&self) -> Color {
    let Severity { high, medium, low } = self.severity;
    classify(high, medium, low, self.calculation.has_endpoints())
  }

  /// Recompute the counts from the calculation tree and compare them with
  /// the stored scalars. A mismatch is logged and returned; the snapshot is
  /// never repaired.
  pub fn verify(&self) -> Result<()> {
    let computed = self.calculation.aggregate();
    if computed != self.severity || !self.calculation.is_consistent() {
      error!(
        snapshot_id = self.snapshot_id,
        entity_id = %self.entity_id,
        stored = ?self.severity,
        computed = ?computed,
        "snapshot scalars disagree with its calculation"
      );
      return Err(Error::InconsistentAggregate {
        snapshot_id: self.snapshot_id,
        stored:      self.severity.as_tuple(),
        computed:    computed.as_tuple(),
      });
    }
    Ok(())
  }

  /// `(when, snapshot_id)`, the order in which stacking picks the winner.
  pub fn stacking_key(&self) -> (DateTime<Utc>, i64) { (self.when, self.snapshot_id) }
}

// ─── NewSnapshot ─────────────────────────────────────────────────────────────

/// A snapshot computed by the builder and not yet appended.
#[derive(Debug, Clone)]
pub struct NewSnapshot<C> {
  pub entity_id:   Uuid,
  pub when:        DateTime<Utc>,
  pub rating:      i64,
  pub severity:    Severity,
  pub calculation: C,
  pub digest:      String,
}

pub type NewUrlSnapshot = NewSnapshot<UrlCalculation>;
pub type NewOrganizationSnapshot = NewSnapshot<OrganizationCalculation>;

impl<C: Aggregate + Serialize> NewSnapshot<C> {
  /// A snapshot whose rating is the total number of issues in `calculation`.
  pub fn rated(entity_id: Uuid, when: DateTime<Utc>, calculation: C) -> Result<Self> {
    let rating = i64::from(calculation.severity().total());
    Self::with_rating(entity_id, when, rating, calculation)
  }

  /// A snapshot carrying the [`NO_RATING`] sentinel.
  pub fn unrated(entity_id: Uuid, when: DateTime<Utc>, calculation: C) -> Result<Self> {
    Self::with_rating(entity_id, when, NO_RATING, calculation)
  }

  fn with_rating(
    entity_id: Uuid,
    when: DateTime<Utc>,
    rating: i64,
    calculation: C,
  ) -> Result<Self> {
    if !calculation.is_consistent() {
      return Err(Error::invariant(format!(
        "calculation for {entity_id} at {when} does not add up"
      )));
    }
    let digest = digest(&(rating, &calculation))?;
    Ok(Self {
      entity_id,
      when,
      rating,
      severity: calculation.severity(),
      calculation,
      digest,
    })
  }

  /// `true` when appending `self` after `previous` would record nothing new.
  pub fn same_as(&self, previous: &Snapshot<C>) -> bool { self.digest == previous.digest }

  /// Materialise as a stored snapshot with the identity assigned by a store.
  pub fn into_snapshot(self, snapshot_id: i64, sequence: i64) -> Snapshot<C> {
    Snapshot {
      snapshot_id,
      entity_id: self.entity_id,
      sequence,
      when: self.when,
      rating: self.rating,
      severity: self.severity,
      calculation: self.calculation,
      digest: self.digest,
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::{
    calculation::{EndpointCalculation, FindingRating},
    entity::IpVersion,
    finding::FindingType,
  };

  fn url_calc(high: u32, medium: u32) -> UrlCalculation {
    let when = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap();
    UrlCalculation::new(
      Uuid::nil(),
      "example.nl",
      Some(vec![EndpointCalculation::new(
        Uuid::nil(),
        "https",
        443,
        IpVersion::V4,
        vec![FindingRating {
          finding_type: FindingType::TlsQualys,
          severity:     Severity::new(high, medium, 0),
          explanation:  "F".into(),
          repeated:     false,
          since:        when,
        }],
      )]),
    )
  }

  #[test]
  fn rated_snapshot_caches_the_tree_totals() {
    let when = Utc::now();
    let s = NewSnapshot::rated(Uuid::nil(), when, url_calc(1, 2)).unwrap();
    assert_eq!(s.severity, Severity::new(1, 2, 0));
    assert_eq!(s.rating, 3);
    let stored = s.into_snapshot(7, 1);
    assert!(stored.verify().is_ok());
    assert_eq!(stored.color(), Color::Red);
  }

  #[test]
  fn unrated_snapshot_uses_sentinel() {
    let calc = OrganizationCalculation::new(Uuid::nil(), "Empty", vec![]);
    let s = NewSnapshot::unrated(Uuid::nil(), Utc::now(), calc)
      .unwrap()
      .into_snapshot(1, 1);
    assert!(!s.is_rated());
    assert_eq!(s.color(), Color::Gray);
  }

  #[test]
  fn verify_flags_tampered_scalars() {
    let mut s = NewSnapshot::rated(Uuid::nil(), Utc::now(), url_calc(1, 0))
      .unwrap()
      .into_snapshot(3, 1);
    s.severity.high = 5;
    let err = s.verify().unwrap_err();
    assert!(matches!(
      err,
      Error::InconsistentAggregate { snapshot_id: 3, stored: (5, 0, 0), computed: (1, 0, 0) }
    ));
  }

  #[test]
  fn identical_content_has_identical_digest() {
    let a = NewSnapshot::rated(Uuid::nil(), Utc::now(), url_calc(0, 1)).unwrap();
    let b = NewSnapshot::rated(Uuid::nil(), Utc::now(), url_calc(0, 1))
      .unwrap()
      .into_snapshot(1, 1);
    assert!(a.same_as(&b));

    let c = NewSnapshot::rated(Uuid::nil(), Utc::now(), url_calc(1, 1)).unwrap();
    assert!(!c.same_as(&b));
  }
}
