//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings. Calculation trees
//! and coordinate geometry are stored as compact JSON. UUIDs are stored as
//! hyphenated lowercase strings.

use chrono::{DateTime, SecondsFormat, Utc};
use posture_core::{
  entity::{Coordinate, Endpoint, IpVersion, Organization, Promise, Url},
  finding::{Finding, Severity},
  lifecycle::Lifecycle,
  snapshot::Snapshot,
};
use rusqlite::Row;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// The four lifecycle columns, in table order.
pub const LIFECYCLE_COLUMNS: &str = "created_on, is_dead, is_dead_since, is_dead_reason";

pub struct RawLifecycle {
  pub created_on:     String,
  pub is_dead:        bool,
  pub is_dead_since:  Option<String>,
  pub is_dead_reason: Option<String>,
}

impl RawLifecycle {
  /// Read the lifecycle columns starting at column `at`.
  pub fn from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      created_on:     row.get(at)?,
      is_dead:        row.get(at + 1)?,
      is_dead_since:  row.get(at + 2)?,
      is_dead_reason: row.get(at + 3)?,
    })
  }

  pub fn into_lifecycle(self) -> Result<Lifecycle> {
    Ok(Lifecycle {
      created_on:     decode_dt(&self.created_on)?,
      is_dead:        self.is_dead,
      is_dead_since:  decode_opt_dt(self.is_dead_since)?,
      is_dead_reason: self.is_dead_reason,
    })
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────
//
// Column lists are qualified with the alias every query uses for the table:
// `o` organizations, `u` urls, `e` endpoints, `c` coordinates, `p` promises,
// `f` findings, `s` snapshots.

pub const ORGANIZATION_COLUMNS: &str = "o.organization_id, o.name, o.country, o.kind, \
                                        o.twitter_handle, o.created_on, o.is_dead, \
                                        o.is_dead_since, o.is_dead_reason";

/// Raw strings read directly from an `organizations` row.
pub struct RawOrganization {
  pub organization_id: String,
  pub name:            String,
  pub country:         String,
  pub kind:            String,
  pub twitter_handle:  Option<String>,
  pub lifecycle:       RawLifecycle,
}

impl RawOrganization {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      organization_id: row.get(0)?,
      name:            row.get(1)?,
      country:         row.get(2)?,
      kind:            row.get(3)?,
      twitter_handle:  row.get(4)?,
      lifecycle:       RawLifecycle::from_row(row, 5)?,
    })
  }

  pub fn into_organization(self) -> Result<Organization> {
    Ok(Organization {
      organization_id: decode_uuid(&self.organization_id)?,
      name:            self.name,
      country:         self.country,
      kind:            self.kind,
      twitter_handle:  self.twitter_handle,
      lifecycle:       self.lifecycle.into_lifecycle()?,
    })
  }
}

pub const URL_COLUMNS: &str = "u.url_id, u.url, u.created_on, u.is_dead, u.is_dead_since, \
                               u.is_dead_reason, u.not_resolvable, u.not_resolvable_since";

pub struct RawUrl {
  pub url_id:               String,
  pub url:                  String,
  pub lifecycle:            RawLifecycle,
  pub not_resolvable:       bool,
  pub not_resolvable_since: Option<String>,
}

impl RawUrl {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      url_id:               row.get(0)?,
      url:                  row.get(1)?,
      lifecycle:            RawLifecycle::from_row(row, 2)?,
      not_resolvable:       row.get(6)?,
      not_resolvable_since: row.get(7)?,
    })
  }

  pub fn into_url(self) -> Result<Url> {
    Ok(Url {
      url_id:               decode_uuid(&self.url_id)?,
      url:                  self.url,
      lifecycle:            self.lifecycle.into_lifecycle()?,
      not_resolvable:       self.not_resolvable,
      not_resolvable_since: decode_opt_dt(self.not_resolvable_since)?,
    })
  }
}

pub const ENDPOINT_COLUMNS: &str = "e.endpoint_id, e.url_id, e.protocol, e.port, e.ip_version, \
                                    e.created_on, e.is_dead, e.is_dead_since, e.is_dead_reason";

pub struct RawEndpoint {
  pub endpoint_id: String,
  pub url_id:      String,
  pub protocol:    String,
  pub port:        u16,
  pub ip_version:  u8,
  pub lifecycle:   RawLifecycle,
}

impl RawEndpoint {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      endpoint_id: row.get(0)?,
      url_id:      row.get(1)?,
      protocol:    row.get(2)?,
      port:        row.get(3)?,
      ip_version:  row.get(4)?,
      lifecycle:   RawLifecycle::from_row(row, 5)?,
    })
  }

  pub fn into_endpoint(self) -> Result<Endpoint> {
    let ip_version = IpVersion::from_u8(self.ip_version)
      .ok_or_else(|| Error::Corrupt(format!("unknown ip version {}", self.ip_version)))?;
    Ok(Endpoint {
      endpoint_id: decode_uuid(&self.endpoint_id)?,
      url_id: decode_uuid(&self.url_id)?,
      protocol: self.protocol,
      port: self.port,
      ip_version,
      lifecycle: self.lifecycle.into_lifecycle()?,
    })
  }
}

pub const COORDINATE_COLUMNS: &str = "c.coordinate_id, c.organization_id, c.area, \
                                      c.geometry_kind, c.created_on, c.is_dead, \
                                      c.is_dead_since, c.is_dead_reason";

pub struct RawCoordinate {
  pub coordinate_id:   String,
  pub organization_id: String,
  pub area:            String,
  pub geometry_kind:   String,
  pub lifecycle:       RawLifecycle,
}

impl RawCoordinate {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      coordinate_id:   row.get(0)?,
      organization_id: row.get(1)?,
      area:            row.get(2)?,
      geometry_kind:   row.get(3)?,
      lifecycle:       RawLifecycle::from_row(row, 4)?,
    })
  }

  pub fn into_coordinate(self) -> Result<Coordinate> {
    Ok(Coordinate {
      coordinate_id:   decode_uuid(&self.coordinate_id)?,
      organization_id: decode_uuid(&self.organization_id)?,
      area:            serde_json::from_str(&self.area)?,
      geometry_kind:   self.geometry_kind,
      lifecycle:       self.lifecycle.into_lifecycle()?,
    })
  }
}

pub const PROMISE_COLUMNS: &str = "p.promise_id, p.organization_id, p.created_on, \
                                   p.expires_on, p.notes";

pub struct RawPromise {
  pub promise_id:      String,
  pub organization_id: String,
  pub created_on:      String,
  pub expires_on:      Option<String>,
  pub notes:           Option<String>,
}

impl RawPromise {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      promise_id:      row.get(0)?,
      organization_id: row.get(1)?,
      created_on:      row.get(2)?,
      expires_on:      row.get(3)?,
      notes:           row.get(4)?,
    })
  }

  pub fn into_promise(self) -> Result<Promise> {
    Ok(Promise {
      promise_id:      decode_uuid(&self.promise_id)?,
      organization_id: decode_uuid(&self.organization_id)?,
      created_on:      decode_dt(&self.created_on)?,
      expires_on:      decode_opt_dt(self.expires_on)?,
      notes:           self.notes,
    })
  }
}

pub const FINDING_COLUMNS: &str = "f.sequence, f.finding_id, f.endpoint_id, f.finding_type, \
                                   f.high, f.medium, f.low, f.explanation, f.repeated, \
                                   f.determined_on";

pub struct RawFinding {
  pub sequence:      i64,
  pub finding_id:    String,
  pub endpoint_id:   String,
  pub finding_type:  String,
  pub high:          u32,
  pub medium:        u32,
  pub low:           u32,
  pub explanation:   String,
  pub repeated:      bool,
  pub determined_on: String,
}

impl RawFinding {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sequence:      row.get(0)?,
      finding_id:    row.get(1)?,
      endpoint_id:   row.get(2)?,
      finding_type:  row.get(3)?,
      high:          row.get(4)?,
      medium:        row.get(5)?,
      low:           row.get(6)?,
      explanation:   row.get(7)?,
      repeated:      row.get(8)?,
      determined_on: row.get(9)?,
    })
  }

  pub fn into_finding(self) -> Result<Finding> {
    let finding_type = self
      .finding_type
      .parse()
      .map_err(|_| Error::Corrupt(format!("unknown finding type {:?}", self.finding_type)))?;
    Ok(Finding {
      finding_id: decode_uuid(&self.finding_id)?,
      endpoint_id: decode_uuid(&self.endpoint_id)?,
      finding_type,
      severity: Severity::new(self.high, self.medium, self.low),
      explanation: self.explanation,
      repeated: self.repeated,
      determined_on: decode_dt(&self.determined_on)?,
      sequence: self.sequence,
    })
  }
}

/// Snapshot columns; the entity column is aliased so one row type serves
/// both snapshot tables.
pub fn snapshot_columns(alias: &str, entity_column: &str) -> String {
  format!(
    "{alias}.snapshot_id, {alias}.{entity_column}, {alias}.sequence, {alias}.when_at, \
     {alias}.rating, {alias}.high, {alias}.medium, {alias}.low, {alias}.calculation, \
     {alias}.digest"
  )
}

pub struct RawSnapshot {
  pub snapshot_id: i64,
  pub entity_id:   String,
  pub sequence:    i64,
  pub when_at:     String,
  pub rating:      i64,
  pub high:        u32,
  pub medium:      u32,
  pub low:         u32,
  pub calculation: String,
  pub digest:      String,
}

impl RawSnapshot {
  /// Read the snapshot columns starting at column `at`.
  pub fn from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      snapshot_id: row.get(at)?,
      entity_id:   row.get(at + 1)?,
      sequence:    row.get(at + 2)?,
      when_at:     row.get(at + 3)?,
      rating:      row.get(at + 4)?,
      high:        row.get(at + 5)?,
      medium:      row.get(at + 6)?,
      low:         row.get(at + 7)?,
      calculation: row.get(at + 8)?,
      digest:      row.get(at + 9)?,
    })
  }

  pub fn into_snapshot<C: DeserializeOwned>(self) -> Result<Snapshot<C>> {
    Ok(Snapshot {
      snapshot_id: self.snapshot_id,
      entity_id:   decode_uuid(&self.entity_id)?,
      sequence:    self.sequence,
      when:        decode_dt(&self.when_at)?,
      rating:      self.rating,
      severity:    Severity::new(self.high, self.medium, self.low),
      calculation: serde_json::from_str(&self.calculation)?,
      digest:      self.digest,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_sort_as_strings() {
    let a = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap();
    let b = a + chrono::Duration::nanoseconds(1);
    let c = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 1).unwrap();
    let (ea, eb, ec) = (encode_dt(a), encode_dt(b), encode_dt(c));
    assert_eq!(ea.len(), eb.len());
    assert!(ea < eb && eb < ec);
    assert_eq!(decode_dt(&eb).unwrap(), b);
  }
}
