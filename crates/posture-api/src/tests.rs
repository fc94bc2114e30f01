//! Router tests against an in-memory store.

use std::sync::Arc;

use axum::{
  Router,
  body::Body,
  http::{Request, StatusCode, header},
};
use posture_core::{locks::OrganizationLocks, stats::default_timeframes};
use posture_store_sqlite::SqliteStore;
use serde_json::{Value, json};
use tower::ServiceExt as _;
use uuid::Uuid;

use crate::{ApiState, api_router};

async fn app() -> Router {
  let store = SqliteStore::open_in_memory().await.unwrap();
  api_router(ApiState::new(Arc::new(store), OrganizationLocks::new(), default_timeframes()))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
  let request = Request::builder()
    .method(method)
    .uri(uri)
    .header(header::CONTENT_TYPE, "application/json")
    .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
    .unwrap();
  let response = app.clone().oneshot(request).await.unwrap();
  let status = response.status();
  let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
  let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
  (status, value)
}

async fn organization(app: &Router, name: &str) -> String {
  let (status, body) = call(
    app,
    "POST",
    "/organizations",
    Some(json!({
      "name": name,
      "country": "NL",
      "kind": "municipality",
      "created_on": "2020-01-01T00:00:00Z",
    })),
  )
  .await;
  assert_eq!(status, StatusCode::CREATED, "{body}");
  body["organization_id"].as_str().unwrap().to_owned()
}

/// One URL with one endpoint and one finding.
async fn scanned(app: &Router, owner: &str, url: &str, high: u32) {
  let (_, url) = call(
    app,
    "POST",
    "/urls",
    Some(json!({
      "url": url,
      "created_on": "2020-01-01T00:00:00Z",
      "organizations": [owner],
    })),
  )
  .await;
  let (_, endpoint) = call(
    app,
    "POST",
    "/endpoints",
    Some(json!({
      "url_id": url["url_id"],
      "protocol": "https",
      "port": 443,
      "ip_version": "v4",
      "created_on": "2020-01-01T00:00:00Z",
    })),
  )
  .await;
  let (status, _) = call(
    app,
    "POST",
    "/findings",
    Some(json!({
      "endpoint_id": endpoint["endpoint_id"],
      "finding_type": "tls_qualys",
      "high": high,
      "explanation": "grade",
      "determined_on": "2020-01-02T00:00:00Z",
    })),
  )
  .await;
  assert_eq!(status, StatusCode::CREATED);
}

async fn rebuild(app: &Router, id: &str) -> Value {
  let (status, report) = call(
    app,
    "POST",
    &format!("/organizations/{id}/rebuild"),
    Some(json!({ "create_history": true, "as_of": "2020-01-05T00:00:00Z" })),
  )
  .await;
  assert_eq!(status, StatusCode::OK, "{report}");
  report
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_organization_is_404() {
  let app = app().await;
  let (status, body) = call(&app, "GET", &format!("/organizations/{}", Uuid::new_v4()), None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert!(body["error"].is_string());
}

#[tokio::test]
async fn duplicate_living_identity_is_422() {
  let app = app().await;
  organization(&app, "Arnhem").await;
  let (status, _) = call(
    &app,
    "POST",
    "/organizations",
    Some(json!({
      "name": "Arnhem",
      "country": "NL",
      "kind": "municipality",
      "created_on": "2020-01-03T00:00:00Z",
    })),
  )
  .await;
  assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn rebuild_of_unknown_organization_is_404() {
  let app = app().await;
  let (status, _) = call(
    &app,
    "POST",
    &format!("/organizations/{}/rebuild", Uuid::new_v4()),
    Some(json!({})),
  )
  .await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_timeframe_is_400() {
  let app = app().await;
  let (status, _) = call(&app, "GET", "/statistics?timeframes=yesterday", None).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─── Flow ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ingest_rebuild_and_rank() {
  let app = app().await;
  let a = organization(&app, "Arnhem").await;
  let b = organization(&app, "Baarn").await;
  scanned(&app, &a, "a.example", 2).await;
  scanned(&app, &b, "b.example", 0).await;

  let report = rebuild(&app, &a).await;
  assert!(report["organization_snapshots"].as_u64().unwrap() > 0);
  rebuild(&app, &b).await;
  let again = rebuild(&app, &a).await;
  assert_eq!(again["url_snapshots"], 0);
  assert_eq!(again["organization_snapshots"], 0);

  let (status, rankings) =
    call(&app, "GET", "/rankings?as_of=2020-01-05T00:00:00Z&limit=5", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(rankings["top_failing"][0]["organization"]["name"], "Arnhem");
  assert_eq!(rankings["top_performing"][0]["organization"]["name"], "Baarn");
  assert_eq!(rankings["terrible_urls"][0]["url"]["url"], "a.example");

  let (status, report) = call(
    &app,
    "GET",
    &format!("/organizations/{a}/report?as_of=2020-01-05T00:00:00Z"),
    None,
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(report["color"], "red");

  let (status, series) = call(
    &app,
    "GET",
    "/statistics?as_of=2020-01-05T00:00:00Z&timeframes=now",
    None,
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(series[0]["organizations"]["red"], 1);
  assert_eq!(series[0]["organizations"]["green"], 1);
}

#[tokio::test]
async fn merge_by_name() {
  let app = app().await;
  let a = organization(&app, "Arnhem").await;
  organization(&app, "Baarn").await;
  scanned(&app, &a, "a.example", 0).await;

  let (status, outcome) = call(
    &app,
    "POST",
    "/merge",
    Some(json!({
      "sources": [a],
      "source_names": [{ "name": "Baarn", "country": "NL", "kind": "municipality" }],
      "target_name": "Combined",
      "country": "NL",
      "kind": "municipality",
      "when": "2020-01-04T00:00:00Z",
    })),
  )
  .await;
  assert_eq!(status, StatusCode::OK, "{outcome}");
  assert_eq!(outcome["merged"].as_array().unwrap().len(), 2);
  assert_eq!(outcome["urls_adopted"], 1);

  let (_, arnhem) = call(&app, "GET", &format!("/organizations/{a}"), None).await;
  assert_eq!(arnhem["lifecycle"]["is_dead"], true);

  let (status, _) = call(
    &app,
    "POST",
    "/merge",
    Some(json!({
      "source_names": [{ "name": "Nowhere", "country": "NL", "kind": "municipality" }],
      "target_name": "Other",
      "country": "NL",
      "kind": "municipality",
    })),
  )
  .await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn merging_a_dead_source_is_404() {
  let app = app().await;
  let a = organization(&app, "Arnhem").await;
  let (status, _) = call(
    &app,
    "POST",
    &format!("/organizations/{a}/kill"),
    Some(json!({ "when": "2020-01-03T00:00:00Z", "reason": "dissolved" })),
  )
  .await;
  assert_eq!(status, StatusCode::OK);

  let (status, body) = call(
    &app,
    "POST",
    "/merge",
    Some(json!({
      "sources": [a],
      "target_name": "Combined",
      "country": "NL",
      "kind": "municipality",
      "when": "2020-01-05T00:00:00Z",
    })),
  )
  .await;
  assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
}

#[tokio::test]
async fn merge_waits_for_the_superseded_namesake() {
  let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
  let locks = OrganizationLocks::new();
  let app = api_router(ApiState::new(store, locks.clone(), default_timeframes()));
  let a = organization(&app, "Arnhem").await;
  let old = organization(&app, "Combined").await;
  let old_id: Uuid = old.parse().unwrap();

  let held = locks.lock(old_id).await;
  let merging = tokio::spawn({
    let app = app.clone();
    async move {
      call(
        &app,
        "POST",
        "/merge",
        Some(json!({
          "sources": [a],
          "target_name": "Combined",
          "country": "NL",
          "kind": "municipality",
          "when": "2020-01-05T00:00:00Z",
        })),
      )
      .await
    }
  });
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  assert!(!merging.is_finished());

  drop(held);
  let (status, outcome) = merging.await.unwrap();
  assert_eq!(status, StatusCode::OK, "{outcome}");
  assert_eq!(outcome["superseded"], old);
}
