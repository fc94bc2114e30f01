//! The Snapshot Builder.
//!
//! Findings are folded into URL snapshots, and URL snapshots are rolled up
//! into organization snapshots. A snapshot is evaluated at every
//! *significant moment* (an instant at which an aggregate could have
//! changed) and appended only if its content differs from the entity's
//! previous snapshot.
//!
//! The calculation functions are pure. [`rebuild`] and [`default_ratings`]
//! drive them against a [`RatingStore`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
  Error, Result,
  calculation::{EndpointCalculation, FindingRating, OrganizationCalculation, UrlCalculation},
  entity::{Endpoint, Organization, Url},
  error::EntityKind,
  finding::{Finding, FindingType},
  resolver::latest_at,
  snapshot::{NewOrganizationSnapshot, NewSnapshot, NewUrlSnapshot, UrlSnapshot},
  store::RatingStore,
};

// ─── Url calculation ─────────────────────────────────────────────────────────

/// The newest finding of every type among `findings` at `at`, each paired
/// with the instant its unchanged condition was first observed.
///
/// `findings` must be ordered by `(determined_on, sequence)`.
pub fn current_ratings<'a>(
  findings: impl IntoIterator<Item = &'a Finding>,
  at: DateTime<Utc>,
) -> Vec<FindingRating> {
  let mut current: BTreeMap<FindingType, (&Finding, DateTime<Utc>)> = BTreeMap::new();
  for finding in findings.into_iter().filter(|f| f.determined_on <= at) {
    let since = match current.get(&finding.finding_type) {
      Some((prev, since)) if prev.same_condition(finding) => *since,
      _ => finding.determined_on,
    };
    current.insert(finding.finding_type, (finding, since));
  }
  current
    .into_values()
    .map(|(finding, since)| FindingRating::from_finding(finding, since))
    .collect()
}

/// The calculation tree of `url` at `at`.
///
/// A URL on which no endpoint had been observed yet gets no `endpoints` at
/// all. Once one has, only endpoints alive at `at` contribute, which may
/// leave an empty list.
pub fn url_calculation(
  url: &Url,
  endpoints: &[Endpoint],
  findings: &[Finding],
  at: DateTime<Utc>,
) -> UrlCalculation {
  if !endpoints.iter().any(|e| e.lifecycle.created_on <= at) {
    return UrlCalculation::new(url.url_id, url.url.clone(), None);
  }

  let mut ordered: Vec<&Finding> = findings.iter().collect();
  ordered.sort_by_key(|f| (f.determined_on, f.sequence));
  let mut by_endpoint: HashMap<Uuid, Vec<&Finding>> = HashMap::new();
  for finding in ordered {
    by_endpoint.entry(finding.endpoint_id).or_default().push(finding);
  }

  let calculations = endpoints
    .iter()
    .filter(|e| e.lifecycle.alive_at(at))
    .map(|e| {
      let ratings = current_ratings(
        by_endpoint.get(&e.endpoint_id).into_iter().flatten().copied(),
        at,
      );
      EndpointCalculation::new(e.endpoint_id, e.protocol.clone(), e.port, e.ip_version, ratings)
    })
    .collect();

  UrlCalculation::new(url.url_id, url.url.clone(), Some(calculations))
}

/// Every instant at which `url`'s calculation could change, restricted to
/// the URL's lifetime.
pub fn url_moments(
  url: &Url,
  endpoints: &[Endpoint],
  findings: &[Finding],
) -> BTreeSet<DateTime<Utc>> {
  let mut moments = BTreeSet::from([url.lifecycle.created_on]);
  for endpoint in endpoints {
    moments.insert(endpoint.lifecycle.created_on);
    moments.extend(endpoint.lifecycle.ended_at());
  }
  moments.extend(findings.iter().map(|f| f.determined_on));
  moments.retain(|m| url.lifecycle.alive_at(*m));
  moments
}

// ─── Organization rollup ─────────────────────────────────────────────────────

/// A URL together with its full snapshot history.
#[derive(Debug, Clone)]
pub struct UrlHistory {
  pub url:       Url,
  pub snapshots: Vec<UrlSnapshot>,
}

/// Every instant at which the organization's rollup could change.
pub fn organization_moments(
  organization: &Organization,
  urls: &[UrlHistory],
) -> BTreeSet<DateTime<Utc>> {
  let mut moments = BTreeSet::from([organization.lifecycle.created_on]);
  for history in urls {
    moments.insert(history.url.lifecycle.created_on);
    moments.extend(history.url.lifecycle.ended_at());
    moments.extend(history.snapshots.iter().map(|s| s.when));
  }
  moments.retain(|m| organization.lifecycle.alive_at(*m));
  moments
}

/// The organization's calculation at `at`: for every claimed URL alive at
/// `at`, the calculation of its latest snapshot at or before `at`.
pub fn organization_calculation(
  organization: &Organization,
  urls: &[UrlHistory],
  at: DateTime<Utc>,
) -> OrganizationCalculation {
  let calculations = urls
    .iter()
    .filter(|h| h.url.lifecycle.alive_at(at))
    .map(|h| match latest_at(&h.snapshots, at) {
      Some(snapshot) => snapshot.calculation.clone(),
      None => UrlCalculation::new(h.url.url_id, h.url.url.clone(), None),
    })
    .collect();
  OrganizationCalculation::new(organization.organization_id, organization.name.clone(), calculations)
}

/// Organization snapshot at `at`; unrated while the organization claims no
/// living URL.
pub fn organization_snapshot(
  organization: &Organization,
  urls: &[UrlHistory],
  at: DateTime<Utc>,
) -> Result<NewOrganizationSnapshot> {
  let calculation = organization_calculation(organization, urls, at);
  if calculation.urls().is_empty() {
    NewSnapshot::unrated(organization.organization_id, at, calculation)
  } else {
    NewSnapshot::rated(organization.organization_id, at, calculation)
  }
}

// ─── Scheduling ──────────────────────────────────────────────────────────────

/// The instants to evaluate, in ascending order.
///
/// Only instants strictly after `latest` are considered, which keeps every
/// history totally ordered by `when`. `as_of` itself is always evaluated
/// last; `create_history` adds the recorded moments before it.
pub fn schedule(
  moments: BTreeSet<DateTime<Utc>>,
  latest: Option<DateTime<Utc>>,
  create_history: bool,
  as_of: DateTime<Utc>,
  alive: impl Fn(DateTime<Utc>) -> bool,
) -> Vec<DateTime<Utc>> {
  let after_latest = |m: &DateTime<Utc>| latest.is_none_or(|l| *m > l);
  let mut scheduled: Vec<_> = if create_history {
    moments
      .into_iter()
      .filter(|m| *m < as_of && after_latest(m))
      .collect()
  } else {
    Vec::new()
  };
  if alive(as_of) && after_latest(&as_of) {
    scheduled.push(as_of);
  }
  scheduled
}

// ─── Orchestration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RebuildRequest {
  pub organization_id: Uuid,
  /// Also evaluate every significant moment before `as_of`, not only
  /// `as_of` itself.
  pub create_history:  bool,
  pub as_of:           DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
  pub organization_id:        Uuid,
  pub url_snapshots:          usize,
  pub organization_snapshots: usize,
}

/// Rebuild the URL snapshots of every URL the organization claims, then the
/// organization's own snapshots.
///
/// Callers must ensure no other rebuild or merge runs for the same
/// organization concurrently (see [`crate::locks`]). An append race on a
/// shared URL surfaces as [`Error::ConcurrencyConflict`].
#[instrument(skip(store), fields(organization = %request.organization_id))]
pub async fn rebuild<S: RatingStore>(
  store: &S,
  request: RebuildRequest,
) -> Result<RebuildReport, S::Error> {
  let RebuildRequest { organization_id, create_history, as_of } = request;
  let organization = store
    .get_organization(organization_id)
    .await?
    .ok_or_else(|| Error::not_found(EntityKind::Organization, organization_id))?;

  let mut report = RebuildReport { organization_id, ..Default::default() };
  let mut histories = Vec::new();
  for url in store.urls_of_organization(organization_id).await? {
    report.url_snapshots += rebuild_url(store, &url, create_history, as_of).await?;
    let snapshots = store.url_snapshots(url.url_id).await?;
    histories.push(UrlHistory { url, snapshots });
  }

  let latest = store.latest_organization_snapshot(organization_id).await?;
  if let Some(snapshot) = &latest {
    snapshot.verify()?;
  }
  let moments = schedule(
    organization_moments(&organization, &histories),
    latest.as_ref().map(|s| s.when),
    create_history,
    as_of,
    |m| organization.lifecycle.alive_at(m),
  );

  let mut previous = latest;
  for at in moments {
    let candidate = organization_snapshot(&organization, &histories, at)?;
    if previous.as_ref().is_some_and(|p| candidate.same_as(p)) {
      debug!(%at, "organization rating unchanged");
      continue;
    }
    let expected = previous.as_ref().map(|p| p.sequence);
    let stored = store.append_organization_snapshot(candidate, expected).await?;
    debug!(%at, rating = stored.rating, "organization snapshot appended");
    report.organization_snapshots += 1;
    previous = Some(stored);
  }

  info!(
    url_snapshots = report.url_snapshots,
    organization_snapshots = report.organization_snapshots,
    "rebuilt ratings"
  );
  Ok(report)
}

async fn rebuild_url<S: RatingStore>(
  store: &S,
  url: &Url,
  create_history: bool,
  as_of: DateTime<Utc>,
) -> Result<usize, S::Error> {
  let endpoints = store.endpoints_of_url(url.url_id).await?;
  let findings = store.findings_of_url(url.url_id).await?;
  let latest = store.latest_url_snapshot(url.url_id).await?;
  if let Some(snapshot) = &latest {
    snapshot.verify()?;
  }
  let moments = schedule(
    url_moments(url, &endpoints, &findings),
    latest.as_ref().map(|s| s.when),
    create_history,
    as_of,
    |m| url.lifecycle.alive_at(m),
  );

  let mut previous = latest;
  let mut appended = 0;
  for at in moments {
    let candidate: NewUrlSnapshot =
      NewSnapshot::rated(url.url_id, at, url_calculation(url, &endpoints, &findings, at))?;
    if previous.as_ref().is_some_and(|p| candidate.same_as(p)) {
      continue;
    }
    let expected = previous.as_ref().map(|p| p.sequence);
    let stored = store.append_url_snapshot(candidate, expected).await?;
    debug!(url = %url.url, %at, rating = stored.rating, "url snapshot appended");
    appended += 1;
    previous = Some(stored);
  }
  Ok(appended)
}

/// Give every organization created at or before `as_of` that has no
/// snapshot at all an unrated snapshot at its creation instant.
///
/// Returns the number of snapshots appended.
pub async fn default_ratings<S: RatingStore>(
  store: &S,
  as_of: DateTime<Utc>,
) -> Result<usize, S::Error> {
  let mut created = 0;
  for organization in store.list_organizations().await? {
    if organization.lifecycle.created_on > as_of {
      continue;
    }
    let id = organization.organization_id;
    if store.latest_organization_snapshot(id).await?.is_some() {
      continue;
    }
    let calculation = OrganizationCalculation::new(id, organization.name.clone(), vec![]);
    let snapshot = NewSnapshot::unrated(id, organization.lifecycle.created_on, calculation)?;
    store.append_organization_snapshot(snapshot, None).await?;
    created += 1;
  }
  info!(created, "default ratings assigned");
  Ok(created)
}
