//! The Statistics Reporter.
//!
//! Resolves the world at a list of relative timeframes and folds each
//! result into counts, percentages and tallies.

use std::{
  collections::{BTreeMap, HashSet},
  fmt,
  str::FromStr,
};

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  calculation::Aggregate,
  classify::{Color, classify},
  entity::{Organization, Url},
  finding::{FindingType, Severity},
  snapshot::{OrganizationSnapshot, UrlSnapshot},
  store::RatingStore,
};

// ─── Timeframes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
  Now,
  Days(u32),
  Weeks(u32),
  Months(u32),
}

/// A labelled offset such as `"2 weeks ago"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
  pub label:  String,
  pub offset: Offset,
}

impl Timeframe {
  /// The instant this timeframe denotes relative to `origin`.
  pub fn at(&self, origin: DateTime<Utc>) -> DateTime<Utc> {
    match self.offset {
      Offset::Now => origin,
      Offset::Days(n) => origin - Duration::days(i64::from(n)),
      Offset::Weeks(n) => origin - Duration::weeks(i64::from(n)),
      Offset::Months(n) => origin
        .checked_sub_months(Months::new(n))
        .unwrap_or_else(|| origin - Duration::days(30 * i64::from(n))),
    }
  }
}

impl FromStr for Timeframe {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let label = s.trim().to_owned();
    if label.eq_ignore_ascii_case("now") {
      return Ok(Self { label, offset: Offset::Now });
    }
    let invalid = || Error::invariant(format!("unrecognised timeframe {s:?}"));
    let mut words = label.split_whitespace();
    let (Some(count), Some(unit), Some("ago"), None) =
      (words.next(), words.next(), words.next(), words.next())
    else {
      return Err(invalid());
    };
    let n: u32 = count.parse().map_err(|_| invalid())?;
    let offset = match unit.trim_end_matches('s') {
      "day" => Offset::Days(n),
      "week" => Offset::Weeks(n),
      "month" => Offset::Months(n),
      _ => return Err(invalid()),
    };
    Ok(Self { label, offset })
  }
}

impl TryFrom<String> for Timeframe {
  type Error = Error;

  fn try_from(s: String) -> Result<Self> { s.parse() }
}

impl From<Timeframe> for String {
  fn from(t: Timeframe) -> Self { t.label }
}

impl fmt::Display for Timeframe {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.label) }
}

pub const DEFAULT_TIMEFRAMES: [&str; 7] = [
  "now",
  "7 days ago",
  "2 weeks ago",
  "3 weeks ago",
  "1 month ago",
  "2 months ago",
  "3 months ago",
];

pub fn default_timeframes() -> Vec<Timeframe> {
  DEFAULT_TIMEFRAMES
    .iter()
    .filter_map(|s| s.parse().ok())
    .collect()
}

/// `round(100 * count / total)`, or 0 when there is nothing to divide by.
pub fn percentage(count: u64, total: u64) -> u64 {
  if total == 0 {
    0
  } else {
    (count as f64 * 100.0 / total as f64).round() as u64
  }
}

// ─── Measurement ─────────────────────────────────────────────────────────────

/// Counts per classification tag with their share of `total`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCounts {
  pub total:             u64,
  pub red:               u64,
  pub orange:            u64,
  pub green:             u64,
  pub gray:              u64,
  pub red_percentage:    u64,
  pub orange_percentage: u64,
  pub green_percentage:  u64,
  pub gray_percentage:   u64,
}

impl TagCounts {
  fn add(&mut self, color: Color) {
    self.total += 1;
    match color {
      Color::Red => self.red += 1,
      Color::Orange => self.orange += 1,
      Color::Green => self.green += 1,
      Color::Gray => self.gray += 1,
    }
  }

  fn finish(&mut self) {
    self.red_percentage = percentage(self.red, self.total);
    self.orange_percentage = percentage(self.orange, self.total);
    self.green_percentage = percentage(self.green, self.total);
    self.gray_percentage = percentage(self.gray, self.total);
  }
}

/// How often each explanation of one finding type occurred.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explained {
  pub total:        u64,
  pub explanations: BTreeMap<String, u64>,
}

/// The fold of one resolved timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
  pub label:         String,
  pub when:          DateTime<Utc>,
  /// Rated organizations by tag.
  pub organizations: TagCounts,
  /// URLs by tag, each URL counted once however many organizations claim it.
  pub urls:          TagCounts,
  /// Organizations skipped for carrying the no-rating sentinel.
  pub no_rating:     u64,
  /// Snapshots skipped because their counts disagree with their tree.
  pub suspect:       u64,
  pub endpoints:     u64,
  /// Endpoint counts by class, e.g. `"https/443 (IPv4)"`.
  pub endpoint:      BTreeMap<String, u64>,
  pub explained:     BTreeMap<FindingType, Explained>,
}

impl Measurement {
  fn new(label: impl Into<String>, when: DateTime<Utc>) -> Self {
    Self {
      label: label.into(),
      when,
      organizations: TagCounts::default(),
      urls: TagCounts::default(),
      no_rating: 0,
      suspect: 0,
      endpoints: 0,
      endpoint: BTreeMap::new(),
      explained: BTreeMap::new(),
    }
  }
}

/// Fold a stacked organization set into a [`Measurement`].
pub fn measure(
  label: impl Into<String>,
  when: DateTime<Utc>,
  stacked: &[(Organization, OrganizationSnapshot)],
) -> Measurement {
  let mut m = Measurement::new(label, when);
  let mut seen_urls: HashSet<Uuid> = HashSet::new();

  for (organization, snapshot) in stacked {
    if !snapshot.is_rated() {
      m.no_rating += 1;
      continue;
    }
    if snapshot.verify().is_err() {
      warn!(organization = %organization.organization_id, "skipping suspect snapshot");
      m.suspect += 1;
      continue;
    }
    m.organizations.add(snapshot.color());

    for url in snapshot.calculation.urls() {
      if !seen_urls.insert(url.url_id) {
        continue;
      }
      let Severity { high, medium, low } = url.severity;
      m.urls.add(classify(high, medium, low, url.has_endpoints()));

      let mut classes = HashSet::new();
      for endpoint in url.endpoints() {
        let mut counted = false;
        for rating in &endpoint.ratings {
          let explained = m.explained.entry(rating.finding_type).or_default();
          if rating.repeated {
            continue;
          }
          counted = true;
          explained.total += 1;
          if !rating.explanation.is_empty() {
            *explained.explanations.entry(rating.explanation.clone()).or_default() += 1;
          }
        }
        if counted && classes.insert(endpoint.class()) {
          *m.endpoint.entry(endpoint.class()).or_default() += 1;
          m.endpoints += 1;
        }
      }
    }
  }

  m.organizations.finish();
  m.urls.finish();
  m
}

/// Resolve and measure every timeframe, measured from `as_of` shifted back
/// by `weeks_back` weeks.
pub async fn statistics<S: RatingStore>(
  store: &S,
  as_of: DateTime<Utc>,
  weeks_back: u32,
  timeframes: &[Timeframe],
) -> Result<Vec<Measurement>, S::Error> {
  let origin = as_of - Duration::weeks(i64::from(weeks_back));
  let mut series = Vec::with_capacity(timeframes.len());
  for timeframe in timeframes {
    let when = timeframe.at(origin);
    let stacked = store.stacked_organizations(when).await?;
    debug!(timeframe = %timeframe, %when, organizations = stacked.len(), "measuring");
    series.push(measure(timeframe.label.clone(), when, &stacked));
  }
  Ok(series)
}

// ─── Vulnerability series ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
  pub label:    String,
  pub when:     DateTime<Utc>,
  #[serde(flatten)]
  pub severity: Severity,
}

/// Severity per finding type over a stacked URL set. URLs on which no
/// endpoint was ever observed are skipped.
pub fn sum_by_type(stacked: &[(Url, UrlSnapshot)]) -> BTreeMap<FindingType, Severity> {
  let mut sums: BTreeMap<FindingType, Severity> = BTreeMap::new();
  for (_, snapshot) in stacked {
    if !snapshot.calculation.has_endpoints() || snapshot.verify().is_err() {
      continue;
    }
    for endpoint in snapshot.calculation.endpoints() {
      for rating in &endpoint.ratings {
        *sums.entry(rating.finding_type).or_default() += rating.severity;
      }
    }
  }
  sums
}

/// Per finding type, the summed severity at each timeframe, oldest first.
pub async fn vulnerability_series<S: RatingStore>(
  store: &S,
  as_of: DateTime<Utc>,
  weeks_back: u32,
  timeframes: &[Timeframe],
) -> Result<BTreeMap<FindingType, Vec<SeriesPoint>>, S::Error> {
  let origin = as_of - Duration::weeks(i64::from(weeks_back));
  let mut ordered: Vec<_> = timeframes.iter().map(|t| (t.at(origin), t)).collect();
  ordered.sort_by_key(|(when, _)| *when);

  let mut series: BTreeMap<FindingType, Vec<SeriesPoint>> = BTreeMap::new();
  for (when, timeframe) in ordered {
    let stacked = store.stacked_urls(when).await?;
    for (finding_type, severity) in sum_by_type(&stacked) {
      series.entry(finding_type).or_default().push(SeriesPoint {
        label: timeframe.label.clone(),
        when,
        severity,
      });
    }
  }
  Ok(series)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::{
    calculation::{EndpointCalculation, FindingRating, OrganizationCalculation, UrlCalculation},
    entity::IpVersion,
    lifecycle::Lifecycle,
    snapshot::NewSnapshot,
  };

  fn t() -> DateTime<Utc> { Utc.with_ymd_and_hms(2018, 6, 30, 12, 0, 0).unwrap() }

  fn rating(ft: FindingType, severity: Severity, explanation: &str, repeated: bool) -> FindingRating {
    FindingRating {
      finding_type: ft,
      severity,
      explanation: explanation.into(),
      repeated,
      since: t(),
    }
  }

  fn endpoint(id: u128, ip: IpVersion, ratings: Vec<FindingRating>) -> EndpointCalculation {
    EndpointCalculation::new(Uuid::from_u128(id), "https", 443, ip, ratings)
  }

  fn url(id: u128, endpoints: Option<Vec<EndpointCalculation>>) -> UrlCalculation {
    UrlCalculation::new(Uuid::from_u128(id), format!("u{id}.nl"), endpoints)
  }

  fn org(name: &str, urls: Vec<UrlCalculation>) -> (Organization, OrganizationSnapshot) {
    let id = Uuid::new_v4();
    let organization = Organization {
      organization_id: id,
      name:            name.into(),
      country:         "NL".into(),
      kind:            "municipality".into(),
      twitter_handle:  None,
      lifecycle:       Lifecycle::born(t()),
    };
    let calc = OrganizationCalculation::new(id, name, urls);
    let snap = if calc.urls().is_empty() {
      NewSnapshot::unrated(id, t(), calc)
    } else {
      NewSnapshot::rated(id, t(), calc)
    };
    (organization, snap.unwrap().into_snapshot(1, 1))
  }

  #[test]
  fn parses_timeframes() {
    let tf: Timeframe = "2 weeks ago".parse().unwrap();
    assert_eq!(tf.offset, Offset::Weeks(2));
    assert_eq!(tf.at(t()), t() - Duration::weeks(2));

    let tf: Timeframe = "1 month ago".parse().unwrap();
    assert_eq!(tf.at(t()), Utc.with_ymd_and_hms(2018, 5, 30, 12, 0, 0).unwrap());

    assert_eq!("now".parse::<Timeframe>().unwrap().at(t()), t());
    assert_eq!("7 days ago".parse::<Timeframe>().unwrap().offset, Offset::Days(7));
    assert!("soon".parse::<Timeframe>().is_err());
    assert!("3 fortnights ago".parse::<Timeframe>().is_err());
    assert!("x days ago".parse::<Timeframe>().is_err());
    assert_eq!(default_timeframes().len(), DEFAULT_TIMEFRAMES.len());
  }

  #[test]
  fn timeframes_deserialize_from_strings() {
    let tfs: Vec<Timeframe> = serde_json::from_str(r#"["now", "3 months ago"]"#).unwrap();
    assert_eq!(tfs[1].offset, Offset::Months(3));
    assert!(serde_json::from_str::<Vec<Timeframe>>(r#"["later"]"#).is_err());
  }

  #[test]
  fn percentages_round_and_guard_zero() {
    assert_eq!(percentage(0, 0), 0);
    assert_eq!(percentage(5, 0), 0);
    assert_eq!(percentage(1, 3), 33);
    assert_eq!(percentage(2, 3), 67);
    assert_eq!(percentage(1, 8), 13);
    assert_eq!(percentage(3, 3), 100);
  }

  #[test]
  fn counts_tags_and_skips_unrated() {
    let stacked = vec![
      org("red", vec![url(1, Some(vec![endpoint(1, IpVersion::V4, vec![rating(
        FindingType::TlsQualys,
        Severity::new(1, 0, 0),
        "F",
        false,
      )])]))]),
      org("green", vec![url(2, Some(vec![endpoint(2, IpVersion::V4, vec![])]))]),
      org("gray", vec![url(3, None)]),
      org("none", vec![]),
    ];
    let m = measure("now", t(), &stacked);
    assert_eq!(m.no_rating, 1);
    assert_eq!(m.organizations.total, 3);
    assert_eq!(
      (m.organizations.red, m.organizations.green, m.organizations.gray),
      (1, 1, 1)
    );
    assert_eq!(m.organizations.red_percentage, 33);
    assert_eq!(m.organizations.orange_percentage, 0);
    assert_eq!(m.urls.total, 3);
  }

  #[test]
  fn shared_urls_are_counted_once() {
    let shared = || {
      url(7, Some(vec![endpoint(7, IpVersion::V4, vec![rating(
        FindingType::PlainHttps,
        Severity::new(0, 1, 0),
        "no https",
        false,
      )])]))
    };
    let stacked = vec![org("a", vec![shared()]), org("b", vec![shared()])];
    let m = measure("now", t(), &stacked);
    assert_eq!(m.organizations.orange, 2);
    assert_eq!(m.urls.total, 1);
    assert_eq!(m.urls.orange_percentage, 100);
    assert_eq!(m.explained[&FindingType::PlainHttps].total, 1);
  }

  #[test]
  fn repeated_findings_are_not_tallied() {
    let u = url(1, Some(vec![endpoint(1, IpVersion::V4, vec![
      rating(FindingType::TlsQualys, Severity::new(1, 0, 0), "F", true),
      rating(FindingType::XFrameOptions, Severity::new(0, 0, 1), "missing", false),
      rating(FindingType::XContentTypeOptions, Severity::new(0, 0, 1), "", false),
    ])]));
    let m = measure("now", t(), &[org("a", vec![u])]);
    assert_eq!(m.explained[&FindingType::TlsQualys].total, 0);
    assert!(m.explained[&FindingType::TlsQualys].explanations.is_empty());
    assert_eq!(m.explained[&FindingType::XFrameOptions].explanations["missing"], 1);
    assert_eq!(m.explained[&FindingType::XContentTypeOptions].total, 1);
    assert!(m.explained[&FindingType::XContentTypeOptions].explanations.is_empty());
  }

  #[test]
  fn endpoint_classes_collapse_per_url() {
    let r = || rating(FindingType::TlsQualys, Severity::new(0, 0, 0), "A", false);
    let u = url(1, Some(vec![
      endpoint(1, IpVersion::V4, vec![r()]),
      endpoint(2, IpVersion::V4, vec![r()]),
      endpoint(3, IpVersion::V6, vec![r()]),
      endpoint(4, IpVersion::V6, vec![]),
    ]));
    let m = measure("now", t(), &[org("a", vec![u])]);
    assert_eq!(m.endpoints, 2);
    assert_eq!(m.endpoint["https/443 (IPv4)"], 1);
    assert_eq!(m.endpoint["https/443 (IPv6)"], 1);
  }

  #[test]
  fn sums_severity_by_type() {
    let snap = |id: u128, endpoints| {
      let calc = url(id, endpoints);
      let u = Url {
        url_id:               calc.url_id,
        url:                  calc.url.clone(),
        lifecycle:            Lifecycle::born(t()),
        not_resolvable:       false,
        not_resolvable_since: None,
      };
      (u, NewSnapshot::rated(calc.url_id, t(), calc).unwrap().into_snapshot(id as i64, 1))
    };
    let stacked = vec![
      snap(1, Some(vec![endpoint(1, IpVersion::V4, vec![rating(
        FindingType::TlsQualys,
        Severity::new(1, 0, 0),
        "F",
        false,
      )])])),
      snap(2, Some(vec![endpoint(2, IpVersion::V6, vec![rating(
        FindingType::TlsQualys,
        Severity::new(0, 1, 0),
        "B",
        false,
      )])])),
      snap(3, None),
    ];
    let sums = sum_by_type(&stacked);
    assert_eq!(sums.len(), 1);
    assert_eq!(sums[&FindingType::TlsQualys], Severity::new(1, 1, 0));
  }
}
