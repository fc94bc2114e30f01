//! [`SqliteStore`]: the SQLite implementation of [`RatingStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, Params, Row, params};
use serde::{Serialize, de::DeserializeOwned};
use tracing::info;
use uuid::Uuid;

use posture_core::{
  Error as CoreError,
  calculation::Aggregate,
  entity::{
    Coordinate, Endpoint, NewCoordinate, NewEndpoint, NewOrganization, NewPromise, NewUrl,
    Organization, Promise, Url,
  },
  error::EntityKind,
  finding::{Finding, NewFinding},
  lifecycle::Lifecycle,
  lineage::{
    MergeOutcome, MergeRequest, SUPERSEDED_REASON, clone_coordinate, clone_promise,
    ensure_mergeable, merged_into_reason,
  },
  snapshot::{
    NewOrganizationSnapshot, NewSnapshot, NewUrlSnapshot, OrganizationSnapshot, Snapshot,
    UrlSnapshot,
  },
  store::RatingStore,
};

use crate::{
  Error, Result,
  encode::{
    COORDINATE_COLUMNS, ENDPOINT_COLUMNS, FINDING_COLUMNS, LIFECYCLE_COLUMNS,
    ORGANIZATION_COLUMNS, PROMISE_COLUMNS, RawCoordinate, RawEndpoint, RawFinding,
    RawLifecycle, RawOrganization, RawPromise, RawSnapshot, RawUrl, URL_COLUMNS, decode_uuid,
    encode_dt, encode_uuid, snapshot_columns,
  },
  error::in_closure,
  schema::SCHEMA,
};

// ─── Row helpers ─────────────────────────────────────────────────────────────
//
// Synchronous helpers run inside `Connection::call` closures, so they can be
// shared between single statements and the merge transaction.

fn query_all<T>(
  conn: &rusqlite::Connection,
  sql: &str,
  params: impl Params,
  map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt.query_map(params, map)?.collect::<rusqlite::Result<Vec<_>>>();
  rows
}

fn exists(conn: &rusqlite::Connection, table: &str, key: &str, id: &str) -> rusqlite::Result<bool> {
  conn.query_row(
    &format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE {key} = ?1)"),
    params![id],
    |r| r.get(0),
  )
}

/// Fail with `NotFound` unless the row exists.
fn require(
  conn: &rusqlite::Connection,
  table: &str,
  key: &str,
  kind: EntityKind,
  id: Uuid,
) -> tokio_rusqlite::Result<()> {
  if exists(conn, table, key, &encode_uuid(id))? {
    Ok(())
  } else {
    Err(in_closure(CoreError::not_found(kind, id)))
  }
}

/// Kill one lifecycle-bearing row, enforcing that death is terminal and
/// never precedes creation.
fn kill_row(
  conn: &rusqlite::Connection,
  table: &str,
  key: &str,
  kind: EntityKind,
  id: Uuid,
  when: DateTime<Utc>,
  reason: String,
) -> tokio_rusqlite::Result<()> {
  let id_str = encode_uuid(id);
  let raw = conn
    .query_row(
      &format!("SELECT {LIFECYCLE_COLUMNS} FROM {table} WHERE {key} = ?1"),
      params![id_str],
      |row| RawLifecycle::from_row(row, 0),
    )
    .optional()?
    .ok_or_else(|| in_closure(CoreError::not_found(kind, id)))?;

  let mut lifecycle = raw.into_lifecycle().map_err(in_closure)?;
  lifecycle.kill(when, reason).map_err(in_closure)?;

  conn.execute(
    &format!(
      "UPDATE {table} SET is_dead = 1, is_dead_since = ?2, is_dead_reason = ?3
       WHERE {key} = ?1"
    ),
    params![id_str, lifecycle.is_dead_since.map(encode_dt), lifecycle.is_dead_reason],
  )?;
  Ok(())
}

fn insert_organization(conn: &rusqlite::Connection, org: &Organization) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO organizations (
       organization_id, name, country, kind, twitter_handle, created_on
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    params![
      encode_uuid(org.organization_id),
      org.name,
      org.country,
      org.kind,
      org.twitter_handle,
      encode_dt(org.lifecycle.created_on),
    ],
  )?;
  Ok(())
}

fn insert_coordinate(conn: &rusqlite::Connection, c: &Coordinate) -> tokio_rusqlite::Result<()> {
  let area = serde_json::to_string(&c.area).map_err(in_closure)?;
  conn.execute(
    "INSERT INTO coordinates (
       coordinate_id, organization_id, area, geometry_kind, created_on
     ) VALUES (?1, ?2, ?3, ?4, ?5)",
    params![
      encode_uuid(c.coordinate_id),
      encode_uuid(c.organization_id),
      area,
      c.geometry_kind,
      encode_dt(c.lifecycle.created_on),
    ],
  )?;
  Ok(())
}

fn insert_promise(conn: &rusqlite::Connection, p: &Promise) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO promises (promise_id, organization_id, created_on, expires_on, notes)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    params![
      encode_uuid(p.promise_id),
      encode_uuid(p.organization_id),
      encode_dt(p.created_on),
      p.expires_on.map(encode_dt),
      p.notes,
    ],
  )?;
  Ok(())
}

fn decode_all<R, T>(raws: Vec<R>, decode: impl Fn(R) -> Result<T>) -> Result<Vec<T>> {
  raws.into_iter().map(decode).collect()
}

// ─── Snapshot tables ─────────────────────────────────────────────────────────

/// The two snapshot tables share a layout and differ only in names.
#[derive(Clone, Copy)]
struct SnapshotTable {
  table:  &'static str,
  entity: &'static str,
}

const URL_SNAPSHOTS: SnapshotTable = SnapshotTable { table: "url_snapshots", entity: "url_id" };

const ORGANIZATION_SNAPSHOTS: SnapshotTable = SnapshotTable {
  table:  "organization_snapshots",
  entity: "organization_id",
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A rating store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run `sql` with a single text parameter and collect the mapped rows.
  async fn fetch<R: Send + 'static>(
    &self,
    sql: String,
    param: String,
    map: fn(&Row<'_>) -> rusqlite::Result<R>,
  ) -> Result<Vec<R>> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(query_all(conn, &sql, params![param], map)?))
        .await?,
    )
  }

  async fn kill(
    &self,
    table: &'static str,
    key: &'static str,
    kind: EntityKind,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        kill_row(&tx, table, key, kind, id, when, reason)?;
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>> {
    let raws = self
      .fetch(
        format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints e WHERE e.endpoint_id = ?1"),
        encode_uuid(id),
        RawEndpoint::from_row,
      )
      .await?;
    raws.into_iter().next().map(RawEndpoint::into_endpoint).transpose()
  }

  pub async fn get_coordinate(&self, id: Uuid) -> Result<Option<Coordinate>> {
    let raws = self
      .fetch(
        format!("SELECT {COORDINATE_COLUMNS} FROM coordinates c WHERE c.coordinate_id = ?1"),
        encode_uuid(id),
        RawCoordinate::from_row,
      )
      .await?;
    raws.into_iter().next().map(RawCoordinate::into_coordinate).transpose()
  }

  // ── Snapshot plumbing shared by both tables ───────────────────────────────

  async fn snapshots<C: DeserializeOwned>(
    &self,
    t: SnapshotTable,
    entity_id: Uuid,
  ) -> Result<Vec<Snapshot<C>>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {} FROM {} s WHERE s.{} = ?1 ORDER BY s.sequence",
          snapshot_columns("s", t.entity),
          t.table,
          t.entity
        ),
        encode_uuid(entity_id),
        |row| RawSnapshot::from_row(row, 0),
      )
      .await?;
    decode_all(raws, RawSnapshot::into_snapshot)
  }

  async fn latest_snapshot<C: DeserializeOwned>(
    &self,
    t: SnapshotTable,
    entity_id: Uuid,
  ) -> Result<Option<Snapshot<C>>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {} FROM {} s WHERE s.{} = ?1 ORDER BY s.sequence DESC LIMIT 1",
          snapshot_columns("s", t.entity),
          t.table,
          t.entity
        ),
        encode_uuid(entity_id),
        |row| RawSnapshot::from_row(row, 0),
      )
      .await?;
    raws.into_iter().next().map(RawSnapshot::into_snapshot).transpose()
  }

  /// Append with an optimistic check: the entity's latest sequence must
  /// still be `expected`, and the new `when` must not precede the latest.
  async fn append_snapshot<C: Aggregate + Serialize>(
    &self,
    t: SnapshotTable,
    snapshot: NewSnapshot<C>,
    expected: Option<i64>,
  ) -> Result<Snapshot<C>> {
    let entity_id = snapshot.entity_id;
    let entity_str = encode_uuid(entity_id);
    let when_str = encode_dt(snapshot.when);
    let calculation = serde_json::to_string(&snapshot.calculation)?;
    let rating = snapshot.rating;
    let severity = snapshot.severity;
    let digest = snapshot.digest.clone();

    let (snapshot_id, sequence) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let latest: Option<(i64, String)> = tx
          .query_row(
            &format!(
              "SELECT sequence, when_at FROM {} WHERE {} = ?1
               ORDER BY sequence DESC LIMIT 1",
              t.table, t.entity
            ),
            params![entity_str],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )
          .optional()?;

        let found = latest.as_ref().map(|(sequence, _)| *sequence);
        if found != expected {
          return Err(in_closure(CoreError::ConcurrencyConflict { entity_id, expected, found }));
        }
        if let Some((_, latest_when)) = latest.as_ref().filter(|(_, w)| *w > when_str) {
          return Err(in_closure(CoreError::invariant(format!(
            "snapshot at {when_str} precedes the latest at {latest_when}"
          ))));
        }

        let sequence = found.unwrap_or(0) + 1;
        tx.execute(
          &format!(
            "INSERT INTO {} (
               {}, sequence, when_at, rating, high, medium, low, calculation, digest
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            t.table, t.entity
          ),
          params![
            entity_str,
            sequence,
            when_str,
            rating,
            severity.high,
            severity.medium,
            severity.low,
            calculation,
            digest,
          ],
        )?;
        let snapshot_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((snapshot_id, sequence))
      })
      .await?;

    Ok(snapshot.into_snapshot(snapshot_id, sequence))
  }
}

// ─── RatingStore impl ────────────────────────────────────────────────────────

impl RatingStore for SqliteStore {
  type Error = Error;

  // ── Organizations ─────────────────────────────────────────────────────────

  async fn add_organization(&self, input: NewOrganization) -> Result<Organization> {
    if input.name.trim().is_empty() {
      return Err(CoreError::invariant("organization name is empty").into());
    }
    let organization = Organization {
      organization_id: Uuid::new_v4(),
      name:            input.name,
      country:         input.country,
      kind:            input.kind,
      twitter_handle:  input.twitter_handle,
      lifecycle:       Lifecycle::born(input.created_on),
    };

    let row = organization.clone();
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        // Two organizations with one identity may never be alive together.
        let clash: bool = tx.query_row(
          "SELECT EXISTS (
             SELECT 1 FROM organizations
             WHERE name = ?1 AND country = ?2 AND kind = ?3
               AND (is_dead = 0 OR is_dead_since > ?4)
           )",
          params![row.name, row.country, row.kind, encode_dt(row.lifecycle.created_on)],
          |r| r.get(0),
        )?;
        if clash {
          return Err(in_closure(CoreError::invariant(format!(
            "a living organization {:?} ({}, {}) already exists",
            row.name, row.country, row.kind
          ))));
        }
        insert_organization(&tx, &row)?;
        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok(organization)
  }

  async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
    let raws = self
      .fetch(
        format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations o WHERE o.organization_id = ?1"),
        encode_uuid(id),
        RawOrganization::from_row,
      )
      .await?;
    raws.into_iter().next().map(RawOrganization::into_organization).transpose()
  }

  async fn list_organizations(&self) -> Result<Vec<Organization>> {
    let raws: Vec<RawOrganization> = self
      .conn
      .call(|conn| {
        Ok(query_all(
          conn,
          &format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations o
             ORDER BY o.name, o.created_on"
          ),
          [],
          RawOrganization::from_row,
        )?)
      })
      .await?;
    decode_all(raws, RawOrganization::into_organization)
  }

  async fn find_live_organization(
    &self,
    name: String,
    country: String,
    kind: String,
  ) -> Result<Option<Organization>> {
    let raw: Option<RawOrganization> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {ORGANIZATION_COLUMNS} FROM organizations o
                 WHERE o.name = ?1 AND o.country = ?2 AND o.kind = ?3 AND o.is_dead = 0
                 ORDER BY o.created_on DESC LIMIT 1"
              ),
              params![name, country, kind],
              RawOrganization::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawOrganization::into_organization).transpose()
  }

  async fn kill_organization(
    &self,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> Result<Organization> {
    self
      .kill("organizations", "organization_id", EntityKind::Organization, id, when, reason)
      .await?;
    self
      .get_organization(id)
      .await?
      .ok_or_else(|| CoreError::not_found(EntityKind::Organization, id).into())
  }

  // ── Urls ──────────────────────────────────────────────────────────────────

  async fn add_url(&self, input: NewUrl) -> Result<Url> {
    if input.url.trim().is_empty() {
      return Err(CoreError::invariant("url is empty").into());
    }
    let url = Url {
      url_id:               Uuid::new_v4(),
      url:                  input.url,
      lifecycle:            Lifecycle::born(input.created_on),
      not_resolvable:       false,
      not_resolvable_since: None,
    };

    let id_str = encode_uuid(url.url_id);
    let url_str = url.url.clone();
    let created_str = encode_dt(url.lifecycle.created_on);
    let owners = input.organizations;
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO urls (url_id, url, created_on) VALUES (?1, ?2, ?3)",
          params![id_str, url_str, created_str],
        )?;
        for owner in owners {
          require(&tx, "organizations", "organization_id", EntityKind::Organization, owner)?;
          tx.execute(
            "INSERT OR IGNORE INTO url_organizations (url_id, organization_id) VALUES (?1, ?2)",
            params![id_str, encode_uuid(owner)],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok(url)
  }

  async fn get_url(&self, id: Uuid) -> Result<Option<Url>> {
    let raws = self
      .fetch(
        format!("SELECT {URL_COLUMNS} FROM urls u WHERE u.url_id = ?1"),
        encode_uuid(id),
        RawUrl::from_row,
      )
      .await?;
    raws.into_iter().next().map(RawUrl::into_url).transpose()
  }

  async fn claim_url(&self, url_id: Uuid, organization_id: Uuid) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        require(conn, "urls", "url_id", EntityKind::Url, url_id)?;
        require(conn, "organizations", "organization_id", EntityKind::Organization, organization_id)?;
        conn.execute(
          "INSERT OR IGNORE INTO url_organizations (url_id, organization_id) VALUES (?1, ?2)",
          params![encode_uuid(url_id), encode_uuid(organization_id)],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn urls_of_organization(&self, organization_id: Uuid) -> Result<Vec<Url>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {URL_COLUMNS} FROM urls u
           JOIN url_organizations uo ON uo.url_id = u.url_id
           WHERE uo.organization_id = ?1
           ORDER BY u.url, u.url_id"
        ),
        encode_uuid(organization_id),
        RawUrl::from_row,
      )
      .await?;
    decode_all(raws, RawUrl::into_url)
  }

  async fn owners_of_url(&self, url_id: Uuid) -> Result<Vec<Uuid>> {
    let ids = self
      .fetch(
        "SELECT organization_id FROM url_organizations WHERE url_id = ?1
         ORDER BY organization_id"
          .to_owned(),
        encode_uuid(url_id),
        |row| row.get::<_, String>(0),
      )
      .await?;
    ids.iter().map(|s| decode_uuid(s)).collect()
  }

  async fn kill_url(&self, id: Uuid, when: DateTime<Utc>, reason: String) -> Result<Url> {
    self.kill("urls", "url_id", EntityKind::Url, id, when, reason).await?;
    self
      .get_url(id)
      .await?
      .ok_or_else(|| CoreError::not_found(EntityKind::Url, id).into())
  }

  async fn mark_not_resolvable(&self, id: Uuid, since: DateTime<Utc>) -> Result<Url> {
    let id_str = encode_uuid(id);
    let since_str = encode_dt(since);
    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE urls SET not_resolvable = 1,
             not_resolvable_since = COALESCE(not_resolvable_since, ?2)
           WHERE url_id = ?1",
          params![id_str, since_str],
        )?)
      })
      .await?;
    if changed == 0 {
      return Err(CoreError::not_found(EntityKind::Url, id).into());
    }
    self
      .get_url(id)
      .await?
      .ok_or_else(|| CoreError::not_found(EntityKind::Url, id).into())
  }

  // ── Endpoints ─────────────────────────────────────────────────────────────

  async fn add_endpoint(&self, input: NewEndpoint) -> Result<Endpoint> {
    let endpoint = Endpoint {
      endpoint_id: Uuid::new_v4(),
      url_id:      input.url_id,
      protocol:    input.protocol,
      port:        input.port,
      ip_version:  input.ip_version,
      lifecycle:   Lifecycle::born(input.created_on),
    };

    let row = endpoint.clone();
    self
      .conn
      .call(move |conn| {
        require(conn, "urls", "url_id", EntityKind::Url, row.url_id)?;
        conn.execute(
          "INSERT INTO endpoints (
             endpoint_id, url_id, protocol, port, ip_version, created_on
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          params![
            encode_uuid(row.endpoint_id),
            encode_uuid(row.url_id),
            row.protocol,
            row.port,
            row.ip_version.as_u8(),
            encode_dt(row.lifecycle.created_on),
          ],
        )?;
        Ok(())
      })
      .await?;

    Ok(endpoint)
  }

  async fn endpoints_of_url(&self, url_id: Uuid) -> Result<Vec<Endpoint>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {ENDPOINT_COLUMNS} FROM endpoints e WHERE e.url_id = ?1
           ORDER BY e.created_on, e.endpoint_id"
        ),
        encode_uuid(url_id),
        RawEndpoint::from_row,
      )
      .await?;
    decode_all(raws, RawEndpoint::into_endpoint)
  }

  async fn kill_endpoint(
    &self,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> Result<Endpoint> {
    self.kill("endpoints", "endpoint_id", EntityKind::Endpoint, id, when, reason).await?;
    self
      .get_endpoint(id)
      .await?
      .ok_or_else(|| CoreError::not_found(EntityKind::Endpoint, id).into())
  }

  // ── Coordinates and promises ──────────────────────────────────────────────

  async fn add_coordinate(&self, input: NewCoordinate) -> Result<Coordinate> {
    let coordinate = Coordinate {
      coordinate_id:   Uuid::new_v4(),
      organization_id: input.organization_id,
      area:            input.area,
      geometry_kind:   input.geometry_kind,
      lifecycle:       Lifecycle::born(input.created_on),
    };

    let row = coordinate.clone();
    self
      .conn
      .call(move |conn| {
        require(
          conn,
          "organizations",
          "organization_id",
          EntityKind::Organization,
          row.organization_id,
        )?;
        insert_coordinate(conn, &row)
      })
      .await?;

    Ok(coordinate)
  }

  async fn kill_coordinate(
    &self,
    id: Uuid,
    when: DateTime<Utc>,
    reason: String,
  ) -> Result<Coordinate> {
    self
      .kill("coordinates", "coordinate_id", EntityKind::Coordinate, id, when, reason)
      .await?;
    self
      .get_coordinate(id)
      .await?
      .ok_or_else(|| CoreError::not_found(EntityKind::Coordinate, id).into())
  }

  async fn coordinates_of_organization(&self, organization_id: Uuid) -> Result<Vec<Coordinate>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {COORDINATE_COLUMNS} FROM coordinates c WHERE c.organization_id = ?1
           ORDER BY c.rowid"
        ),
        encode_uuid(organization_id),
        RawCoordinate::from_row,
      )
      .await?;
    decode_all(raws, RawCoordinate::into_coordinate)
  }

  async fn stacked_coordinates(&self, as_of: DateTime<Utc>) -> Result<Vec<Coordinate>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {COORDINATE_COLUMNS} FROM coordinates c
           WHERE c.rowid = (
             SELECT MAX(c2.rowid) FROM coordinates c2
             WHERE c2.organization_id = c.organization_id
               AND c2.area = c.area
               AND c2.created_on <= ?1
               AND (c2.is_dead = 0 OR c2.is_dead_since > ?1)
           )
           ORDER BY c.organization_id, c.rowid"
        ),
        encode_dt(as_of),
        RawCoordinate::from_row,
      )
      .await?;
    decode_all(raws, RawCoordinate::into_coordinate)
  }

  async fn add_promise(&self, input: NewPromise) -> Result<Promise> {
    if input.expires_on.is_some_and(|e| e < input.created_on) {
      return Err(CoreError::invariant("promise expires before it was made").into());
    }
    let promise = Promise {
      promise_id:      Uuid::new_v4(),
      organization_id: input.organization_id,
      created_on:      input.created_on,
      expires_on:      input.expires_on,
      notes:           input.notes,
    };

    let row = promise.clone();
    self
      .conn
      .call(move |conn| {
        require(
          conn,
          "organizations",
          "organization_id",
          EntityKind::Organization,
          row.organization_id,
        )?;
        insert_promise(conn, &row)?;
        Ok(())
      })
      .await?;

    Ok(promise)
  }

  async fn promises_of_organization(&self, organization_id: Uuid) -> Result<Vec<Promise>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {PROMISE_COLUMNS} FROM promises p WHERE p.organization_id = ?1
           ORDER BY p.created_on, p.rowid"
        ),
        encode_uuid(organization_id),
        RawPromise::from_row,
      )
      .await?;
    decode_all(raws, RawPromise::into_promise)
  }

  // ── Findings (append-only) ────────────────────────────────────────────────

  async fn submit_finding(&self, input: NewFinding) -> Result<Finding> {
    let finding_id = Uuid::new_v4();
    let severity = input.severity();
    let id_str = encode_uuid(finding_id);
    let endpoint_id = input.endpoint_id;
    let finding_type = input.finding_type.as_str();
    let explanation = input.explanation.clone();
    let repeated = input.repeated;
    let determined_str = encode_dt(input.determined_on);

    let sequence = self
      .conn
      .call(move |conn| {
        require(conn, "endpoints", "endpoint_id", EntityKind::Endpoint, endpoint_id)?;
        conn.execute(
          "INSERT INTO findings (
             finding_id, endpoint_id, finding_type, high, medium, low,
             explanation, repeated, determined_on
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          params![
            id_str,
            encode_uuid(endpoint_id),
            finding_type,
            severity.high,
            severity.medium,
            severity.low,
            explanation,
            repeated,
            determined_str,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Finding {
      finding_id,
      endpoint_id,
      finding_type: input.finding_type,
      severity,
      explanation: input.explanation,
      repeated,
      determined_on: input.determined_on,
      sequence,
    })
  }

  async fn findings_of_url(&self, url_id: Uuid) -> Result<Vec<Finding>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {FINDING_COLUMNS} FROM findings f
           JOIN endpoints e ON e.endpoint_id = f.endpoint_id
           WHERE e.url_id = ?1
           ORDER BY f.determined_on, f.sequence"
        ),
        encode_uuid(url_id),
        RawFinding::from_row,
      )
      .await?;
    decode_all(raws, RawFinding::into_finding)
  }

  // ── Snapshots (append-only) ───────────────────────────────────────────────

  async fn latest_url_snapshot(&self, url_id: Uuid) -> Result<Option<UrlSnapshot>> {
    self.latest_snapshot(URL_SNAPSHOTS, url_id).await
  }

  async fn url_snapshots(&self, url_id: Uuid) -> Result<Vec<UrlSnapshot>> {
    self.snapshots(URL_SNAPSHOTS, url_id).await
  }

  async fn append_url_snapshot(
    &self,
    snapshot: NewUrlSnapshot,
    expected: Option<i64>,
  ) -> Result<UrlSnapshot> {
    self.append_snapshot(URL_SNAPSHOTS, snapshot, expected).await
  }

  async fn latest_organization_snapshot(
    &self,
    organization_id: Uuid,
  ) -> Result<Option<OrganizationSnapshot>> {
    self.latest_snapshot(ORGANIZATION_SNAPSHOTS, organization_id).await
  }

  async fn organization_snapshots(&self, organization_id: Uuid) -> Result<Vec<OrganizationSnapshot>> {
    self.snapshots(ORGANIZATION_SNAPSHOTS, organization_id).await
  }

  async fn append_organization_snapshot(
    &self,
    snapshot: NewOrganizationSnapshot,
    expected: Option<i64>,
  ) -> Result<OrganizationSnapshot> {
    self.append_snapshot(ORGANIZATION_SNAPSHOTS, snapshot, expected).await
  }

  // ── Stacking ──────────────────────────────────────────────────────────────
  //
  // Greatest-per-group in one statement: the correlated subquery walks the
  // (entity, when_at) index backwards from `as_of`.

  async fn stacked_organizations(
    &self,
    as_of: DateTime<Utc>,
  ) -> Result<Vec<(Organization, OrganizationSnapshot)>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {ORGANIZATION_COLUMNS}, {snapshot}
           FROM organizations o
           JOIN organization_snapshots s ON s.organization_id = o.organization_id
           WHERE o.created_on <= ?1
             AND (o.is_dead = 0 OR o.is_dead_since > ?1)
             AND s.snapshot_id = (
               SELECT s2.snapshot_id FROM organization_snapshots s2
               WHERE s2.organization_id = o.organization_id AND s2.when_at <= ?1
               ORDER BY s2.when_at DESC, s2.snapshot_id DESC
               LIMIT 1
             )
           ORDER BY o.name, o.organization_id",
          snapshot = snapshot_columns("s", "organization_id"),
        ),
        encode_dt(as_of),
        |row| Ok((RawOrganization::from_row(row)?, RawSnapshot::from_row(row, 9)?)),
      )
      .await?;
    raws
      .into_iter()
      .map(|(o, s)| Ok((o.into_organization()?, s.into_snapshot()?)))
      .collect()
  }

  async fn stacked_urls(&self, as_of: DateTime<Utc>) -> Result<Vec<(Url, UrlSnapshot)>> {
    let raws = self
      .fetch(
        format!(
          "SELECT {URL_COLUMNS}, {snapshot}
           FROM urls u
           JOIN url_snapshots s ON s.url_id = u.url_id
           WHERE u.created_on <= ?1
             AND (u.is_dead = 0 OR u.is_dead_since > ?1)
             AND s.snapshot_id = (
               SELECT s2.snapshot_id FROM url_snapshots s2
               WHERE s2.url_id = u.url_id AND s2.when_at <= ?1
               ORDER BY s2.when_at DESC, s2.snapshot_id DESC
               LIMIT 1
             )
           ORDER BY u.url, u.url_id",
          snapshot = snapshot_columns("s", "url_id"),
        ),
        encode_dt(as_of),
        |row| Ok((RawUrl::from_row(row)?, RawSnapshot::from_row(row, 8)?)),
      )
      .await?;
    raws
      .into_iter()
      .map(|(u, s)| Ok((u.into_url()?, s.into_snapshot()?)))
      .collect()
  }

  // ── Lineage ───────────────────────────────────────────────────────────────

  async fn merge_organizations(&self, request: MergeRequest) -> Result<MergeOutcome> {
    request.validate()?;
    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let outcome = merge_in(&tx, &request)?;
        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    info!(
      successor = %outcome.organization.organization_id,
      name = %outcome.organization.name,
      merged = outcome.merged.len(),
      superseded = ?outcome.superseded,
      coordinates = outcome.coordinates_cloned,
      promises = outcome.promises_cloned,
      urls = outcome.urls_adopted,
      "organizations merged"
    );
    Ok(outcome)
  }
}

// ─── Merge ───────────────────────────────────────────────────────────────────

fn load_organization(
  conn: &rusqlite::Connection,
  id: Uuid,
) -> tokio_rusqlite::Result<Organization> {
  conn
    .query_row(
      &format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations o WHERE o.organization_id = ?1"),
      params![encode_uuid(id)],
      RawOrganization::from_row,
    )
    .optional()?
    .ok_or_else(|| in_closure(CoreError::not_found(EntityKind::Organization, id)))?
    .into_organization()
    .map_err(in_closure)
}

/// Every step of a merge against one open transaction. Any error leaves the
/// transaction uncommitted, and dropping it rolls everything back.
fn merge_in(
  conn: &rusqlite::Connection,
  request: &MergeRequest,
) -> tokio_rusqlite::Result<MergeOutcome> {
  let when = request.when;

  let mut sources = Vec::with_capacity(request.sources.len());
  for id in &request.sources {
    let source = load_organization(conn, *id)?;
    ensure_mergeable(&source, when).map_err(in_closure)?;
    sources.push(source);
  }

  // A namesake that died after `when` would overlap the successor.
  let later_dead = query_all(
    conn,
    &format!(
      "SELECT {ORGANIZATION_COLUMNS} FROM organizations o
       WHERE o.name = ?1 AND o.country = ?2 AND o.kind = ?3
         AND o.is_dead = 1 AND o.is_dead_since > ?4"
    ),
    params![request.target_name, request.country, request.kind, encode_dt(when)],
    RawOrganization::from_row,
  )?;
  let later_dead = decode_all(later_dead, RawOrganization::into_organization).map_err(in_closure)?;
  if let Some(clash) = later_dead.iter().find(|o| !request.is_source(o)) {
    return Err(in_closure(CoreError::invariant(format!(
      "organization {:?} ({}) is still alive at {when}",
      clash.name, clash.organization_id
    ))));
  }

  // A living organization already carrying the target identity is retired
  // unless it is itself being merged.
  let living = query_all(
    conn,
    &format!(
      "SELECT {ORGANIZATION_COLUMNS} FROM organizations o
       WHERE o.name = ?1 AND o.country = ?2 AND o.kind = ?3 AND o.is_dead = 0
       ORDER BY o.created_on DESC"
    ),
    params![request.target_name, request.country, request.kind],
    RawOrganization::from_row,
  )?;
  let living = decode_all(living, RawOrganization::into_organization).map_err(in_closure)?;
  let mut superseded = None;
  for org in living.iter().filter(|o| !request.is_source(o)) {
    kill_row(
      conn,
      "organizations",
      "organization_id",
      EntityKind::Organization,
      org.organization_id,
      when,
      SUPERSEDED_REASON.to_owned(),
    )?;
    superseded = Some(org.organization_id);
  }

  let successor = request.successor(living.first());
  insert_organization(conn, &successor)?;
  let successor_id = encode_uuid(successor.organization_id);

  let (mut coordinates_cloned, mut promises_cloned, mut urls_adopted) = (0, 0, 0);
  for source in &sources {
    let source_id = encode_uuid(source.organization_id);

    let coordinates = query_all(
      conn,
      &format!(
        "SELECT {COORDINATE_COLUMNS} FROM coordinates c WHERE c.organization_id = ?1
         ORDER BY c.rowid"
      ),
      params![source_id],
      RawCoordinate::from_row,
    )?;
    for coordinate in decode_all(coordinates, RawCoordinate::into_coordinate).map_err(in_closure)? {
      if coordinate.lifecycle.alive_at(when) {
        insert_coordinate(conn, &clone_coordinate(&coordinate, successor.organization_id, when))?;
        coordinates_cloned += 1;
      }
    }

    let promises = query_all(
      conn,
      &format!(
        "SELECT {PROMISE_COLUMNS} FROM promises p WHERE p.organization_id = ?1
         ORDER BY p.created_on, p.rowid"
      ),
      params![source_id],
      RawPromise::from_row,
    )?;
    for promise in decode_all(promises, RawPromise::into_promise).map_err(in_closure)? {
      if promise.active_at(when) {
        insert_promise(conn, &clone_promise(&promise, successor.organization_id))?;
        promises_cloned += 1;
      }
    }

    urls_adopted += conn.execute(
      "INSERT OR IGNORE INTO url_organizations (url_id, organization_id)
       SELECT url_id, ?2 FROM url_organizations WHERE organization_id = ?1",
      params![source_id, successor_id],
    )?;

    kill_row(
      conn,
      "organizations",
      "organization_id",
      EntityKind::Organization,
      source.organization_id,
      when,
      merged_into_reason(&successor, when),
    )?;
  }

  Ok(MergeOutcome {
    organization: successor,
    superseded,
    merged: request.sources.clone(),
    coordinates_cloned,
    promises_cloned,
    urls_adopted,
  })
}
