//! Historical series.
//!
//! Both endpoints accept `?as_of`, `?weeks_back` (default 0) and
//! `?timeframes`, a comma-separated list such as `now,7 days ago,1 month ago`.
//! Without `timeframes` the configured defaults are used.

use std::collections::BTreeMap;

use axum::{
  Json,
  extract::{Query, State},
};
use chrono::{DateTime, Utc};
use posture_core::{
  finding::FindingType,
  stats::{self, Measurement, SeriesPoint, Timeframe},
  store::RatingStore,
};
use serde::Deserialize;

use crate::{ApiState, error::ApiError};

#[derive(Debug, Default, Deserialize)]
pub struct SeriesParams {
  pub as_of:      Option<DateTime<Utc>>,
  #[serde(default)]
  pub weeks_back: u32,
  pub timeframes: Option<String>,
}

impl SeriesParams {
  fn timeframes<S>(&self, state: &ApiState<S>) -> Result<Vec<Timeframe>, ApiError> {
    match &self.timeframes {
      None => Ok(state.timeframes.to_vec()),
      Some(list) => list
        .split(',')
        .map(|t| t.parse().map_err(|e: posture_core::Error| ApiError::BadRequest(e.to_string())))
        .collect(),
    }
  }
}

/// `GET /statistics`
pub async fn measurements<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Query(params): Query<SeriesParams>,
) -> Result<Json<Vec<Measurement>>, ApiError> {
  let timeframes = params.timeframes(&state)?;
  let as_of = params.as_of.unwrap_or_else(Utc::now);
  let series = stats::statistics(state.store.as_ref(), as_of, params.weeks_back, &timeframes)
    .await
    .map_err(ApiError::from_store)?;
  Ok(Json(series))
}

/// `GET /statistics/vulnerabilities`: per finding type, oldest point first.
pub async fn vulnerabilities<S: RatingStore>(
  State(state): State<ApiState<S>>,
  Query(params): Query<SeriesParams>,
) -> Result<Json<BTreeMap<FindingType, Vec<SeriesPoint>>>, ApiError> {
  let timeframes = params.timeframes(&state)?;
  let as_of = params.as_of.unwrap_or_else(Utc::now);
  let series =
    stats::vulnerability_series(state.store.as_ref(), as_of, params.weeks_back, &timeframes)
      .await
      .map_err(ApiError::from_store)?;
  Ok(Json(series))
}
