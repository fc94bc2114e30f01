//! The classification policy: severity counts to a traffic-light color.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

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
  EnumIter,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Color {
  /// Nothing was ever observed.
  Gray,
  Red,
  Orange,
  Green,
}

/// Map counts to a color. `high` dominates `medium`, which dominates a clean
/// result; `low` never changes the color.
pub fn classify(high: u32, medium: u32, _low: u32, has_endpoints: bool) -> Color {
  if !has_endpoints {
    Color::Gray
  } else if high > 0 {
    Color::Red
  } else if medium > 0 {
    Color::Orange
  } else {
    Color::Green
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn truth_table() {
    for h in 0..3 {
      for m in 0..3 {
        for l in 0..3 {
          let expected = if h > 0 {
            Color::Red
          } else if m > 0 {
            Color::Orange
          } else {
            Color::Green
          };
          assert_eq!(classify(h, m, l, true), expected, "({h},{m},{l})");
          assert_eq!(classify(h, m, l, false), Color::Gray, "({h},{m},{l})");
        }
      }
    }
  }

  #[test]
  fn serialises_lowercase() {
    assert_eq!(serde_json::to_string(&Color::Orange).unwrap(), "\"orange\"");
    assert_eq!(Color::Gray.to_string(), "gray");
  }
}
