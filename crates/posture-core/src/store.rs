//! The `RatingStore` trait.
//!
//! The trait is implemented by storage backends (e.g.
//! `posture-store-sqlite`). The builder, resolver and statistics reporter in
//! this crate are written against this abstraction only.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  entity::{
    Coordinate, Endpoint, NewCoordinate, NewEndpoint, NewOrganization, NewPromise,
    NewUrl, Organization, Promise, Url,
  },
  finding::{Finding, NewFinding},
  lineage::{MergeOutcome, MergeRequest},
  snapshot::{
    NewOrganizationSnapshot, NewUrlSnapshot, OrganizationSnapshot, UrlSnapshot,
  },
};

/// Abstraction over a rating store backend.
///
/// Findings and snapshots are append-only. Entities are never deleted; they
/// are killed by recording the instant they stopped existing.
///
/// Every write validates lifecycle invariants and rejects violations with
/// [`crate::Error::InvariantViolation`]; backends convert core errors into
/// their own error type through the `From` bound.
pub trait RatingStore: Send + Sync {
  type Error: std::error::Error + From<crate::Error> + Send + Sync + 'static;

  // ── Organizations ─────────────────────────────────────────────────────

  fn add_organization(
    &self,
    input: NewOrganization,
  ) -> impl Future<Output = Result<Organization, Self::Error>> + Send + '_;

  fn get_organization(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Organization>, Self::Error>> + Send + '_;

  /// All organizations, dead and alive.
  fn list_organizations(
    &self,
  ) -> impl Future<Output = Result<Vec<Organization>, Self::Error>> + Send + '_;

  /// The living (not killed) organization with this identity triple.
  fn find_live_organization(
    &self,
    name: String,
    country: String,
    kind: String,
  ) -> impl Future<Output = Result<Option<Organization>, Self::Error>> + Send + '_;

  fn kill_organization(
    &self,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> impl Future<Output = Result<Organization, Self::Error>> + Send + '_;

  // ── Urls ──────────────────────────────────────────────────────────────

  fn add_url(
    &self,
    input: NewUrl,
  ) -> impl Future<Output = Result<Url, Self::Error>> + Send + '_;

  fn get_url(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Url>, Self::Error>> + Send + '_;

  /// Add `organization_id` to the owners of `url_id`. Idempotent; ownership
  /// edges are never removed.
  fn claim_url(
    &self,
    url_id: Uuid,
    organization_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Every URL the organization claims, dead or alive.
  fn urls_of_organization(
    &self,
    organization_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Url>, Self::Error>> + Send + '_;

  fn owners_of_url(
    &self,
    url_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Uuid>, Self::Error>> + Send + '_;

  fn kill_url(
    &self,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> impl Future<Output = Result<Url, Self::Error>> + Send + '_;

  fn mark_not_resolvable(
    &self,
    id: Uuid,
    since: DateTime<Utc>,
  ) -> impl Future<Output = Result<Url, Self::Error>> + Send + '_;

  // ── Endpoints ─────────────────────────────────────────────────────────

  fn add_endpoint(
    &self,
    input: NewEndpoint,
  ) -> impl Future<Output = Result<Endpoint, Self::Error>> + Send + '_;

  /// Every endpoint ever observed on the URL.
  fn endpoints_of_url(
    &self,
    url_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Endpoint>, Self::Error>> + Send + '_;

  fn kill_endpoint(
    &self,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> impl Future<Output = Result<Endpoint, Self::Error>> + Send + '_;

  // ── Coordinates and promises ──────────────────────────────────────────

  fn add_coordinate(
    &self,
    input: NewCoordinate,
  ) -> impl Future<Output = Result<Coordinate, Self::Error>> + Send + '_;

  fn kill_coordinate(
    &self,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> impl Future<Output = Result<Coordinate, Self::Error>> + Send + '_;

  fn coordinates_of_organization(
    &self,
    organization_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Coordinate>, Self::Error>> + Send + '_;

  /// Coordinates alive at `as_of`, one per (organization, area); the most
  /// recently inserted wins.
  fn stacked_coordinates(
    &self,
    as_of: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Coordinate>, Self::Error>> + Send + '_;

  fn add_promise(
    &self,
    input: NewPromise,
  ) -> impl Future<Output = Result<Promise, Self::Error>> + Send + '_;

  fn promises_of_organization(
    &self,
    organization_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Promise>, Self::Error>> + Send + '_;

  // ── Findings (append-only) ────────────────────────────────────────────

  fn submit_finding(
    &self,
    input: NewFinding,
  ) -> impl Future<Output = Result<Finding, Self::Error>> + Send + '_;

  /// Full finding history of every endpoint on the URL, ordered by
  /// `(determined_on, sequence)`.
  fn findings_of_url(
    &self,
    url_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Finding>, Self::Error>> + Send + '_;

  // ── Snapshots (append-only) ───────────────────────────────────────────

  fn latest_url_snapshot(
    &self,
    url_id: Uuid,
  ) -> impl Future<Output = Result<Option<UrlSnapshot>, Self::Error>> + Send + '_;

  /// The URL's snapshot history ordered by `sequence`.
  fn url_snapshots(
    &self,
    url_id: Uuid,
  ) -> impl Future<Output = Result<Vec<UrlSnapshot>, Self::Error>> + Send + '_;

  /// Append a snapshot. `expected` is the sequence of the latest snapshot
  /// the caller based its decision on; if another writer appended in the
  /// meantime the append fails with
  /// [`crate::Error::ConcurrencyConflict`].
  fn append_url_snapshot(
    &self,
    snapshot: NewUrlSnapshot,
    expected: Option<i64>,
  ) -> impl Future<Output = Result<UrlSnapshot, Self::Error>> + Send + '_;

  fn latest_organization_snapshot(
    &self,
    organization_id: Uuid,
  ) -> impl Future<Output = Result<Option<OrganizationSnapshot>, Self::Error>> + Send + '_;

  fn organization_snapshots(
    &self,
    organization_id: Uuid,
  ) -> impl Future<Output = Result<Vec<OrganizationSnapshot>, Self::Error>> + Send + '_;

  fn append_organization_snapshot(
    &self,
    snapshot: NewOrganizationSnapshot,
    expected: Option<i64>,
  ) -> impl Future<Output = Result<OrganizationSnapshot, Self::Error>> + Send + '_;

  // ── Stacking ──────────────────────────────────────────────────────────

  /// For every organization alive at `as_of`, its latest snapshot with
  /// `when <= as_of`. Organizations without such a snapshot are omitted.
  fn stacked_organizations(
    &self,
    as_of: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<(Organization, OrganizationSnapshot)>, Self::Error>>
  + Send
  + '_;

  /// For every URL alive at `as_of`, its latest snapshot with
  /// `when <= as_of`.
  fn stacked_urls(
    &self,
    as_of: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<(Url, UrlSnapshot)>, Self::Error>> + Send + '_;

  // ── Lineage ───────────────────────────────────────────────────────────

  /// Execute a merge atomically; see [`crate::lineage`].
  fn merge_organizations(
    &self,
    request: MergeRequest,
  ) -> impl Future<Output = Result<MergeOutcome, Self::Error>> + Send + '_;
}
