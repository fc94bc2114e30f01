//! The Point-in-Time Resolver.
//!
//! "What did the world look like at T?" For every entity alive at T, pick
//! its latest snapshot with `when <= T` (ties broken by the higher snapshot
//! id). Entities without such a snapshot are simply absent.

use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::{
  Error,
  calculation::Aggregate,
  classify::Color,
  entity::{Coordinate, Organization, Promise, Url},
  error::EntityKind,
  finding::Severity,
  snapshot::{OrganizationSnapshot, Snapshot, UrlSnapshot},
  store::RatingStore,
};

/// In-memory stacking: the snapshot a point-in-time query at `at` selects
/// from one entity's history.
pub fn latest_at<C: Aggregate>(snapshots: &[Snapshot<C>], at: DateTime<Utc>) -> Option<&Snapshot<C>> {
  snapshots
    .iter()
    .filter(|s| s.when <= at)
    .max_by_key(|s| s.stacking_key())
}

// ─── Ranking ─────────────────────────────────────────────────────────────────

/// Presentation order: more high issues first, then more medium, then more
/// low, then by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankKey<'a> {
  pub severity: Severity,
  pub name:     &'a str,
}

impl Ord for RankKey<'_> {
  fn cmp(&self, other: &Self) -> Ordering {
    other
      .severity
      .high
      .cmp(&self.severity.high)
      .then_with(|| other.severity.medium.cmp(&self.severity.medium))
      .then_with(|| other.severity.low.cmp(&self.severity.low))
      .then_with(|| self.name.cmp(other.name))
  }
}

impl PartialOrd for RankKey<'_> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

// ─── Resolved entities ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedOrganization {
  pub organization: Organization,
  pub snapshot_id:  i64,
  pub when:         DateTime<Utc>,
  pub rating:       i64,
  #[serde(flatten)]
  pub severity:     Severity,
  pub color:        Color,
  /// Node count of the calculation tree.
  pub size:         usize,
  /// The stored counts disagree with the calculation tree.
  pub suspect:      bool,
  pub coordinates:  Vec<Coordinate>,
}

impl ResolvedOrganization {
  fn new(
    organization: Organization,
    snapshot: &OrganizationSnapshot,
    coordinates: Vec<Coordinate>,
  ) -> Self {
    Self {
      organization,
      snapshot_id: snapshot.snapshot_id,
      when: snapshot.when,
      rating: snapshot.rating,
      severity: snapshot.severity,
      color: snapshot.color(),
      size: snapshot.calculation.size(),
      suspect: snapshot.verify().is_err(),
      coordinates,
    }
  }

  pub fn is_rated(&self) -> bool { self.rating != crate::snapshot::NO_RATING }

  pub fn rank_key(&self) -> RankKey<'_> {
    RankKey { severity: self.severity, name: &self.organization.name }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedUrl {
  pub url:         Url,
  pub snapshot_id: i64,
  pub when:        DateTime<Utc>,
  pub rating:      i64,
  #[serde(flatten)]
  pub severity:    Severity,
  pub color:       Color,
  pub suspect:     bool,
}

impl ResolvedUrl {
  fn new(url: Url, snapshot: &UrlSnapshot) -> Self {
    Self {
      url,
      snapshot_id: snapshot.snapshot_id,
      when: snapshot.when,
      rating: snapshot.rating,
      severity: snapshot.severity,
      color: snapshot.color(),
      suspect: snapshot.verify().is_err(),
    }
  }

  pub fn rank_key(&self) -> RankKey<'_> {
    RankKey { severity: self.severity, name: &self.url.url }
  }
}

/// The world at `as_of`, both lists in presentation order.
#[derive(Debug, Clone, Serialize)]
pub struct PointInTime {
  pub as_of:         DateTime<Utc>,
  pub organizations: Vec<ResolvedOrganization>,
  pub urls:          Vec<ResolvedUrl>,
}

/// Resolve every organization and URL alive at `as_of`.
///
/// Organizations carry the coordinates alive at `as_of`. Snapshots whose
/// counts disagree with their tree are included but flagged `suspect`.
pub async fn resolve<S: RatingStore>(
  store: &S,
  as_of: DateTime<Utc>,
) -> Result<PointInTime, S::Error> {
  let stacked_organizations = store.stacked_organizations(as_of).await?;
  let stacked_urls = store.stacked_urls(as_of).await?;

  let mut coordinates: HashMap<Uuid, Vec<Coordinate>> = HashMap::new();
  for coordinate in store.stacked_coordinates(as_of).await? {
    coordinates.entry(coordinate.organization_id).or_default().push(coordinate);
  }

  let mut organizations: Vec<_> = stacked_organizations
    .into_iter()
    .map(|(organization, snapshot)| {
      let coords = coordinates.remove(&organization.organization_id).unwrap_or_default();
      ResolvedOrganization::new(organization, &snapshot, coords)
    })
    .collect();
  organizations.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));

  let mut urls: Vec<_> = stacked_urls
    .into_iter()
    .map(|(url, snapshot)| ResolvedUrl::new(url, &snapshot))
    .collect();
  urls.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));

  let suspect = organizations.iter().filter(|o| o.suspect).count()
    + urls.iter().filter(|u| u.suspect).count();
  if suspect > 0 {
    warn!(%as_of, suspect, "resolved snapshots with inconsistent aggregates");
  }

  Ok(PointInTime { as_of, organizations, urls })
}

// ─── Leaderboards ────────────────────────────────────────────────────────────

/// Rated organizations with at least one high or medium issue, worst first.
pub fn top_failing(organizations: &[ResolvedOrganization], limit: usize) -> Vec<&ResolvedOrganization> {
  let mut failing: Vec<_> = organizations
    .iter()
    .filter(|o| o.is_rated() && (o.severity.high > 0 || o.severity.medium > 0))
    .collect();
  failing.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));
  failing.truncate(limit);
  failing
}

/// Rated, scanned organizations without high or medium issues: fewest low
/// issues first, then the largest estate, then by name.
pub fn top_performing(
  organizations: &[ResolvedOrganization],
  limit: usize,
) -> Vec<&ResolvedOrganization> {
  let mut performing: Vec<_> = organizations
    .iter()
    .filter(|o| o.is_rated() && o.color == Color::Green)
    .collect();
  performing.sort_by(|a, b| {
    a.severity
      .low
      .cmp(&b.severity.low)
      .then_with(|| b.size.cmp(&a.size))
      .then_with(|| a.organization.name.cmp(&b.organization.name))
  });
  performing.truncate(limit);
  performing
}

/// URLs with at least one high issue, worst first.
pub fn terrible_urls(urls: &[ResolvedUrl], limit: usize) -> Vec<&ResolvedUrl> {
  let mut terrible: Vec<_> = urls.iter().filter(|u| u.severity.high > 0).collect();
  terrible.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));
  terrible.truncate(limit);
  terrible
}

// ─── Organization report ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct OrganizationReport {
  pub organization: Organization,
  pub snapshot:     OrganizationSnapshot,
  pub color:        Color,
  pub suspect:      bool,
  /// The promise with the latest expiry that is still running at `as_of`.
  pub promise:      Option<Promise>,
}

/// Full report for one organization at `as_of`: its stacked snapshot with
/// the complete calculation tree.
///
/// `Ok(None)` when the organization was not alive at `as_of` or had no
/// snapshot yet.
pub async fn organization_report<S: RatingStore>(
  store: &S,
  organization_id: Uuid,
  as_of: DateTime<Utc>,
) -> Result<Option<OrganizationReport>, S::Error> {
  let organization = store
    .get_organization(organization_id)
    .await?
    .ok_or_else(|| Error::not_found(EntityKind::Organization, organization_id))?;
  if !organization.lifecycle.alive_at(as_of) {
    return Ok(None);
  }

  let history = store.organization_snapshots(organization_id).await?;
  let Some(snapshot) = latest_at(&history, as_of).cloned() else {
    return Ok(None);
  };

  let promise = store
    .promises_of_organization(organization_id)
    .await?
    .into_iter()
    .filter(|p| p.created_on <= as_of && p.active_at(as_of))
    .max_by_key(|p| p.expires_on);

  Ok(Some(OrganizationReport {
    color: snapshot.color(),
    suspect: snapshot.verify().is_err(),
    organization,
    snapshot,
    promise,
  }))
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::{
    calculation::{OrganizationCalculation, UrlCalculation},
    lifecycle::Lifecycle,
    snapshot::NewSnapshot,
  };

  fn t(day: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2018, 5, day, 0, 0, 0).unwrap() }

  fn url_snapshot(id: i64, when: DateTime<Utc>) -> UrlSnapshot {
    NewSnapshot::rated(Uuid::nil(), when, UrlCalculation::new(Uuid::nil(), "x.nl", None))
      .unwrap()
      .into_snapshot(id, id)
  }

  fn resolved(name: &str, high: u32, medium: u32, low: u32) -> ResolvedOrganization {
    ResolvedOrganization {
      organization: Organization {
        organization_id: Uuid::new_v4(),
        name:            name.into(),
        country:         "NL".into(),
        kind:            "municipality".into(),
        twitter_handle:  None,
        lifecycle:       Lifecycle::born(t(1)),
      },
      snapshot_id:  1,
      when:         t(1),
      rating:       i64::from(high + medium + low),
      severity:     Severity::new(high, medium, low),
      color:        crate::classify::classify(high, medium, low, true),
      size:         1,
      suspect:      false,
      coordinates:  vec![],
    }
  }

  #[test]
  fn latest_at_is_monotonic() {
    let history = vec![url_snapshot(1, t(2)), url_snapshot(2, t(5)), url_snapshot(3, t(9))];
    assert!(latest_at(&history, t(1)).is_none());
    let mut last = None;
    for day in 2..=12 {
      let picked = latest_at(&history, t(day)).unwrap();
      assert!(picked.when <= t(day));
      if let Some(prev) = last {
        assert!(picked.when >= prev);
      }
      last = Some(picked.when);
    }
    assert_eq!(latest_at(&history, t(5)).unwrap().snapshot_id, 2);
  }

  #[test]
  fn latest_at_breaks_ties_by_id() {
    let history = vec![url_snapshot(4, t(3)), url_snapshot(7, t(3))];
    assert_eq!(latest_at(&history, t(3)).unwrap().snapshot_id, 7);
  }

  #[test]
  fn ranking_order() {
    let orgs = vec![resolved("c", 1, 0, 9), resolved("b", 2, 0, 0), resolved("a", 1, 5, 0)];
    let ranked: Vec<_> = top_failing(&orgs, 10).iter().map(|o| o.severity.as_tuple()).collect();
    assert_eq!(ranked, vec![(2, 0, 0), (1, 5, 0), (1, 0, 9)]);
  }

  #[test]
  fn ties_fall_back_to_name() {
    let a = resolved("Appingedam", 1, 0, 0);
    let b = resolved("Borger-Odoorn", 1, 0, 0);
    assert!(a.rank_key() < b.rank_key());
  }

  #[test]
  fn top_failing_skips_clean_and_unrated() {
    let mut unrated = resolved("Empty", 0, 0, 0);
    unrated.rating = crate::snapshot::NO_RATING;
    unrated.color = Color::Gray;
    let orgs = vec![resolved("Clean", 0, 0, 3), unrated, resolved("Bad", 0, 1, 0)];
    let failing = top_failing(&orgs, 10);
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].organization.name, "Bad");
  }

  #[test]
  fn top_performing_prefers_fewer_lows_then_size() {
    let mut big = resolved("Big", 0, 0, 1);
    big.size = 40;
    let small = resolved("Small", 0, 0, 1);
    let perfect = resolved("Perfect", 0, 0, 0);
    let mut gray = resolved("Unscanned", 0, 0, 0);
    gray.color = Color::Gray;
    let orgs = vec![small, gray, big, perfect, resolved("Bad", 1, 0, 0)];
    let names: Vec<_> = top_performing(&orgs, 10)
      .iter()
      .map(|o| o.organization.name.as_str())
      .collect();
    assert_eq!(names, vec!["Perfect", "Big", "Small"]);
    assert_eq!(top_performing(&orgs, 1).len(), 1);
  }

  #[test]
  fn resolved_organization_flags_tampered_snapshot() {
    let calc = OrganizationCalculation::new(Uuid::nil(), "Assen", vec![]);
    let mut snap = NewSnapshot::unrated(Uuid::nil(), t(1), calc).unwrap().into_snapshot(1, 1);
    snap.severity.low = 2;
    let r = ResolvedOrganization::new(resolved("Assen", 0, 0, 0).organization, &snap, vec![]);
    assert!(r.suspect);
    assert!(!r.is_rated());
  }
}
