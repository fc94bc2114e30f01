//! Calculation trees: the ground truth carried by every snapshot.
//!
//! A snapshot's scalar `(high, medium, low)` is a cache. The tree records
//! every endpoint and finding that contributed at snapshot time, so the
//! numbers can always be recomputed without touching the findings table.
//!
//! Trees are built with their children in a canonical order, which makes the
//! JSON encoding (and therefore [`digest`]) independent of the order rows
//! were read from storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
  Result,
  entity::IpVersion,
  finding::{Finding, FindingType, Severity},
};

// ─── Aggregation ─────────────────────────────────────────────────────────────

/// A node whose severity is the sum of its children.
pub trait Aggregate {
  /// The severity cached on this node.
  fn severity(&self) -> Severity;

  /// The severity recomputed from the leaves.
  fn aggregate(&self) -> Severity;

  /// Number of nodes below this one.
  fn size(&self) -> usize;

  /// Whether any endpoint was ever observed below this node.
  fn has_endpoints(&self) -> bool;

  /// Every cached severity in the subtree matches its recomputation.
  fn is_consistent(&self) -> bool;
}

// ─── Leaves ──────────────────────────────────────────────────────────────────

/// The current finding of one type on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingRating {
  #[serde(rename = "type")]
  pub finding_type: FindingType,
  #[serde(flatten)]
  pub severity:     Severity,
  pub explanation:  String,
  #[serde(default)]
  pub repeated:     bool,
  /// First observation of this unchanged condition.
  pub since:        DateTime<Utc>,
}

impl FindingRating {
  pub fn from_finding(finding: &Finding, since: DateTime<Utc>) -> Self {
    Self {
      finding_type: finding.finding_type,
      severity: finding.severity,
      explanation: finding.explanation.clone(),
      repeated: finding.repeated,
      since,
    }
  }
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCalculation {
  pub endpoint_id: Uuid,
  pub protocol:    String,
  pub port:        u16,
  pub ip_version:  IpVersion,
  #[serde(flatten)]
  pub severity:    Severity,
  pub ratings:     Vec<FindingRating>,
}

impl EndpointCalculation {
  pub fn new(
    endpoint_id: Uuid,
    protocol: impl Into<String>,
    port: u16,
    ip_version: IpVersion,
    mut ratings: Vec<FindingRating>,
  ) -> Self {
    ratings.sort_by_key(|r| r.finding_type);
    let severity = ratings.iter().map(|r| r.severity).sum();
    Self {
      endpoint_id,
      protocol: protocol.into(),
      port,
      ip_version,
      severity,
      ratings,
    }
  }

  /// `"https/443 (IPv6)"`, the key endpoint statistics are grouped by.
  pub fn class(&self) -> String {
    format!("{}/{} ({})", self.protocol, self.port, self.ip_version)
  }
}

impl Aggregate for EndpointCalculation {
  fn severity(&self) -> Severity { self.severity }

  fn aggregate(&self) -> Severity { self.ratings.iter().map(|r| r.severity).sum() }

  fn size(&self) -> usize { self.ratings.len() }

  fn has_endpoints(&self) -> bool { true }

  fn is_consistent(&self) -> bool { self.severity == self.aggregate() }
}

// ─── Url ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlCalculation {
  pub url_id:    Uuid,
  pub url:       String,
  #[serde(flatten)]
  pub severity:  Severity,
  /// `None` when no endpoint was ever observed for the URL. Serialised by
  /// omitting the key, which is distinct from an empty list.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub endpoints: Option<Vec<EndpointCalculation>>,
}

impl UrlCalculation {
  pub fn new(
    url_id: Uuid,
    url: impl Into<String>,
    endpoints: Option<Vec<EndpointCalculation>>,
  ) -> Self {
    let endpoints = endpoints.map(|mut eps| {
      eps.sort_by(|a, b| {
        (&a.protocol, a.port, a.ip_version, a.endpoint_id)
          .cmp(&(&b.protocol, b.port, b.ip_version, b.endpoint_id))
      });
      eps
    });
    let severity = endpoints
      .iter()
      .flatten()
      .map(|e| e.severity)
      .sum();
    Self { url_id, url: url.into(), severity, endpoints }
  }

  pub fn endpoints(&self) -> &[EndpointCalculation] {
    self.endpoints.as_deref().unwrap_or_default()
  }
}

impl Aggregate for UrlCalculation {
  fn severity(&self) -> Severity { self.severity }

  fn aggregate(&self) -> Severity { self.endpoints().iter().map(|e| e.aggregate()).sum() }

  fn size(&self) -> usize {
    self.endpoints().iter().map(|e| 1 + e.size()).sum()
  }

  fn has_endpoints(&self) -> bool { self.endpoints.is_some() }

  fn is_consistent(&self) -> bool {
    self.severity == self.aggregate()
      && self.endpoints().iter().all(|e| e.is_consistent())
  }
}

// ─── Organization ────────────────────────────────────────────────────────────

/// Wrapper so the encoded tree reads `{"organization": {"urls": [...]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationCalculation {
  pub organization: OrganizationTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationTree {
  pub organization_id: Uuid,
  pub name:            String,
  #[serde(flatten)]
  pub severity:        Severity,
  pub urls:            Vec<UrlCalculation>,
}

impl OrganizationCalculation {
  pub fn new(
    organization_id: Uuid,
    name: impl Into<String>,
    mut urls: Vec<UrlCalculation>,
  ) -> Self {
    urls.sort_by(|a, b| (&a.url, a.url_id).cmp(&(&b.url, b.url_id)));
    let severity = urls.iter().map(|u| u.severity).sum();
    Self {
      organization: OrganizationTree {
        organization_id,
        name: name.into(),
        severity,
        urls,
      },
    }
  }

  pub fn urls(&self) -> &[UrlCalculation] { &self.organization.urls }
}

impl Aggregate for OrganizationCalculation {
  fn severity(&self) -> Severity { self.organization.severity }

  fn aggregate(&self) -> Severity { self.urls().iter().map(|u| u.aggregate()).sum() }

  fn size(&self) -> usize { self.urls().iter().map(|u| 1 + u.size()).sum() }

  fn has_endpoints(&self) -> bool { self.urls().iter().any(|u| u.has_endpoints()) }

  fn is_consistent(&self) -> bool {
    self.organization.severity == self.aggregate()
      && self.urls().iter().all(|u| u.is_consistent())
  }
}

// ─── Digest ──────────────────────────────────────────────────────────────────

/// Hex SHA-256 over the JSON encoding of `value`.
///
/// Used to decide whether a freshly computed snapshot differs from the last
/// stored one without comparing whole trees.
pub fn digest<T: Serialize>(value: &T) -> Result<String> {
  let bytes = serde_json::to_vec(value)?;
  Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn rating(ft: FindingType, high: u32, medium: u32, low: u32) -> FindingRating {
    FindingRating {
      finding_type: ft,
      severity:     Severity::new(high, medium, low),
      explanation:  String::new(),
      repeated:     false,
      since:        Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap(),
    }
  }

  fn endpoint(port: u16, ratings: Vec<FindingRating>) -> EndpointCalculation {
    EndpointCalculation::new(Uuid::from_u128(port as u128), "https", port, IpVersion::V4, ratings)
  }

  #[test]
  fn url_without_endpoints_omits_the_key() {
    let url = UrlCalculation::new(Uuid::nil(), "example.nl", None);
    let json = serde_json::to_value(&url).unwrap();
    assert!(json.get("endpoints").is_none());
    assert!(!url.has_endpoints());

    let url = UrlCalculation::new(Uuid::nil(), "example.nl", Some(vec![]));
    let json = serde_json::to_value(&url).unwrap();
    assert_eq!(json["endpoints"], serde_json::json!([]));
    assert!(url.has_endpoints());
  }

  #[test]
  fn severities_roll_up() {
    let url = UrlCalculation::new(
      Uuid::nil(),
      "example.nl",
      Some(vec![
        endpoint(443, vec![rating(FindingType::TlsQualys, 1, 0, 0)]),
        endpoint(80, vec![
          rating(FindingType::PlainHttps, 0, 1, 0),
          rating(FindingType::XFrameOptions, 0, 0, 1),
        ]),
      ]),
    );
    assert_eq!(url.severity, Severity::new(1, 1, 1));
    assert!(url.is_consistent());
    assert_eq!(url.size(), 5);

    let org = OrganizationCalculation::new(Uuid::nil(), "Assen", vec![url]);
    assert_eq!(org.severity(), Severity::new(1, 1, 1));
    assert_eq!(org.size(), 6);
    assert!(org.has_endpoints());
  }

  #[test]
  fn tampered_cache_is_detected() {
    let mut url = UrlCalculation::new(
      Uuid::nil(),
      "example.nl",
      Some(vec![endpoint(443, vec![rating(FindingType::TlsQualys, 1, 0, 0)])]),
    );
    url.severity.high = 0;
    assert!(!url.is_consistent());
  }

  #[test]
  fn digest_ignores_input_order() {
    let a = UrlCalculation::new(
      Uuid::nil(),
      "example.nl",
      Some(vec![endpoint(443, vec![]), endpoint(80, vec![])]),
    );
    let b = UrlCalculation::new(
      Uuid::nil(),
      "example.nl",
      Some(vec![endpoint(80, vec![]), endpoint(443, vec![])]),
    );
    assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());

    let c = UrlCalculation::new(Uuid::nil(), "example.nl", None);
    assert_ne!(digest(&a).unwrap(), digest(&c).unwrap());
  }

  #[test]
  fn tree_survives_json() {
    let org = OrganizationCalculation::new(
      Uuid::nil(),
      "Assen",
      vec![UrlCalculation::new(
        Uuid::nil(),
        "assen.nl",
        Some(vec![endpoint(443, vec![rating(FindingType::TlsQualys, 0, 1, 0)])]),
      )],
    );
    let json = serde_json::to_string(&org).unwrap();
    assert!(json.starts_with("{\"organization\":"));
    let back: OrganizationCalculation = serde_json::from_str(&json).unwrap();
    assert_eq!(back, org);
  }
}
