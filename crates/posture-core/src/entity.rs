//! Organizations, URLs, endpoints, coordinates and promises.
//!
//! Each entity is a small identity record plus a [`Lifecycle`]. Ratings are
//! never stored on the entity itself; they live in append-only snapshot
//! histories (see [`crate::snapshot`]).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::Lifecycle;

// ─── Organization ────────────────────────────────────────────────────────────

/// An organization whose internet-facing estate is being rated.
///
/// `(name, country, kind)` identifies an organization to humans, but several
/// rows may share it over time: a merge kills the predecessor and creates a
/// successor, and the two are never alive at the same instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
  pub organization_id: Uuid,
  pub name:            String,
  /// ISO 3166 country code, e.g. `"NL"`.
  pub country:         String,
  /// Organization type, e.g. `"municipality"`.
  pub kind:            String,
  /// Advisory contact handle, carried across merges.
  pub twitter_handle:  Option<String>,
  pub lifecycle:       Lifecycle,
}

/// Input to [`crate::store::RatingStore::add_organization`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrganization {
  pub name:           String,
  pub country:        String,
  pub kind:           String,
  #[serde(default)]
  pub twitter_handle: Option<String>,
  pub created_on:     DateTime<Utc>,
}

// ─── Url ─────────────────────────────────────────────────────────────────────

/// A host name. Exists exactly once no matter how many organizations claim
/// it; ownership lives in a separate many-to-many edge set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Url {
  pub url_id:               Uuid,
  pub url:                  String,
  pub lifecycle:            Lifecycle,
  /// DNS no longer resolves. Independent of `lifecycle`.
  pub not_resolvable:       bool,
  pub not_resolvable_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUrl {
  pub url:           String,
  pub created_on:    DateTime<Utc>,
  /// Organizations that claim this URL from the start.
  #[serde(default)]
  pub organizations: Vec<Uuid>,
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
  V4,
  V6,
}

impl IpVersion {
  pub fn as_u8(self) -> u8 {
    match self {
      Self::V4 => 4,
      Self::V6 => 6,
    }
  }

  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      4 => Some(Self::V4),
      6 => Some(Self::V6),
      _ => None,
    }
  }
}

impl fmt::Display for IpVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::V4 => "IPv4",
      Self::V6 => "IPv6",
    })
  }
}

/// A reachable service on a URL, e.g. `https/443` over IPv6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
  pub endpoint_id: Uuid,
  pub url_id:      Uuid,
  pub protocol:    String,
  pub port:        u16,
  pub ip_version:  IpVersion,
  pub lifecycle:   Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEndpoint {
  pub url_id:     Uuid,
  pub protocol:   String,
  pub port:       u16,
  pub ip_version: IpVersion,
  pub created_on: DateTime<Utc>,
}

// ─── Coordinate ──────────────────────────────────────────────────────────────

/// A piece of geometry belonging to an organization.
///
/// Borders change over time, so an organization may have several
/// coordinates alive at once (e.g. disjoint territories) and a history of
/// dead ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordinate {
  pub coordinate_id:   Uuid,
  pub organization_id: Uuid,
  /// GeoJSON coordinates array.
  pub area:            serde_json::Value,
  /// GeoJSON geometry type, e.g. `"MultiPolygon"`.
  pub geometry_kind:   String,
  pub lifecycle:       Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCoordinate {
  pub organization_id: Uuid,
  pub area:            serde_json::Value,
  pub geometry_kind:   String,
  pub created_on:      DateTime<Utc>,
}

// ─── Promise ─────────────────────────────────────────────────────────────────

/// An organization's advisory commitment to fix things by a date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promise {
  pub promise_id:      Uuid,
  pub organization_id: Uuid,
  pub created_on:      DateTime<Utc>,
  pub expires_on:      Option<DateTime<Utc>>,
  /// Context, e.g. a ticket reference.
  pub notes:           Option<String>,
}

impl Promise {
  /// A promise without an expiry date is never considered active.
  pub fn active_at(&self, at: DateTime<Utc>) -> bool {
    self.expires_on.is_some_and(|e| e >= at)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPromise {
  pub organization_id: Uuid,
  pub created_on:      DateTime<Utc>,
  pub expires_on:      Option<DateTime<Utc>>,
  #[serde(default)]
  pub notes:           Option<String>,
}
