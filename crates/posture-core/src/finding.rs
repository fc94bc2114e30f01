//! Scan findings, the immutable facts every rating is derived from.
//!
//! Findings are produced by scanners outside this crate and are never
//! updated. A changed condition on an endpoint is recorded as a new finding
//! of the same type; the newest one wins for "current" aggregation while the
//! older ones remain visible in older snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

// ─── FindingType ─────────────────────────────────────────────────────────────

/// The check that produced a finding. The `snake_case` name is the
/// discriminant stored in the database and used on the wire.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Display,
  EnumString,
  EnumIter,
  IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum FindingType {
  /// TLS configuration grade.
  TlsQualys,
  /// Site only reachable over plain HTTP.
  PlainHttps,
  StrictTransportSecurity,
  XFrameOptions,
  XContentTypeOptions,
  XXssProtection,
}

impl FindingType {
  pub fn as_str(self) -> &'static str { self.into() }
}

impl Serialize for FindingType {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for FindingType {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse()
      .map_err(|_| serde::de::Error::custom(format!("unknown finding type: {s:?}")))
  }
}

// ─── Severity ────────────────────────────────────────────────────────────────

/// Counts of issues by severity. Additive across endpoints, URLs and
/// organizations.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Severity {
  pub high:   u32,
  pub medium: u32,
  pub low:    u32,
}

impl Severity {
  pub const fn new(high: u32, medium: u32, low: u32) -> Self {
    Self { high, medium, low }
  }

  pub fn total(self) -> u32 { self.high + self.medium + self.low }

  pub fn as_tuple(self) -> (u32, u32, u32) { (self.high, self.medium, self.low) }
}

impl std::ops::Add for Severity {
  type Output = Self;

  fn add(self, rhs: Self) -> Self {
    Self {
      high:   self.high + rhs.high,
      medium: self.medium + rhs.medium,
      low:    self.low + rhs.low,
    }
  }
}

impl std::ops::AddAssign for Severity {
  fn add_assign(&mut self, rhs: Self) { *self = *self + rhs; }
}

impl std::iter::Sum for Severity {
  fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
    iter.fold(Self::default(), |acc, s| acc + s)
  }
}

// ─── Finding ─────────────────────────────────────────────────────────────────

/// One scanner verdict about one endpoint at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
  pub finding_id:    Uuid,
  pub endpoint_id:   Uuid,
  pub finding_type:  FindingType,
  pub severity:      Severity,
  pub explanation:   String,
  /// The scanner re-reported a condition it had already seen; excluded from
  /// explanation statistics.
  pub repeated:      bool,
  pub determined_on: DateTime<Utc>,
  /// Store-assigned insertion order; breaks ties on `determined_on`.
  pub sequence:      i64,
}

impl Finding {
  /// `true` when `other` describes the same condition (ignoring when it was
  /// observed).
  pub fn same_condition(&self, other: &Finding) -> bool {
    self.finding_type == other.finding_type
      && self.severity == other.severity
      && self.explanation == other.explanation
      && self.repeated == other.repeated
  }
}

/// Input to [`crate::store::RatingStore::submit_finding`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFinding {
  pub endpoint_id:   Uuid,
  pub finding_type:  FindingType,
  #[serde(default)]
  pub high:          u32,
  #[serde(default)]
  pub medium:        u32,
  #[serde(default)]
  pub low:           u32,
  #[serde(default)]
  pub explanation:   String,
  #[serde(default)]
  pub repeated:      bool,
  pub determined_on: DateTime<Utc>,
}

impl NewFinding {
  pub fn new(
    endpoint_id: Uuid,
    finding_type: FindingType,
    severity: Severity,
    explanation: impl Into<String>,
    determined_on: DateTime<Utc>,
  ) -> Self {
    Self {
      endpoint_id,
      finding_type,
      high: severity.high,
      medium: severity.medium,
      low: severity.low,
      explanation: explanation.into(),
      repeated: false,
      determined_on,
    }
  }

  pub fn severity(&self) -> Severity { Severity::new(self.high, self.medium, self.low) }
}

#[cfg(test)]
mod tests {
  use strum::IntoEnumIterator;

  use super::*;

  #[test]
  fn discriminants_roundtrip_through_serde() {
    for ft in FindingType::iter() {
      let json = serde_json::to_string(&ft).unwrap();
      assert_eq!(json, format!("\"{}\"", ft.as_str()));
      let back: FindingType = serde_json::from_str(&json).unwrap();
      assert_eq!(back, ft);
    }
  }

  #[test]
  fn discriminant_names() {
    assert_eq!(FindingType::TlsQualys.as_str(), "tls_qualys");
    assert_eq!(FindingType::PlainHttps.to_string(), "plain_https");
    assert_eq!(
      "strict_transport_security".parse::<FindingType>().unwrap(),
      FindingType::StrictTransportSecurity
    );
  }

  #[test]
  fn unknown_discriminant_is_rejected() {
    let err = serde_json::from_str::<FindingType>("\"ftp\"").unwrap_err();
    assert!(err.to_string().contains("unknown finding type"));
  }

  #[test]
  fn severities_add_up() {
    let total: Severity =
      [Severity::new(1, 0, 2), Severity::new(0, 3, 1)].into_iter().sum();
    assert_eq!(total, Severity::new(1, 3, 3));
    assert_eq!(total.total(), 7);
  }
}
