//! SQL schema for the posture SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.
//!
//! Timestamps are fixed-width RFC 3339 strings (nanoseconds, `Z`), so string
//! comparison in SQL is chronological comparison.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS organizations (
    organization_id TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    country         TEXT NOT NULL,
    kind            TEXT NOT NULL,
    twitter_handle  TEXT,
    created_on      TEXT NOT NULL,
    is_dead         INTEGER NOT NULL DEFAULT 0,
    is_dead_since   TEXT,
    is_dead_reason  TEXT,
    CHECK ((is_dead = 0) = (is_dead_since IS NULL)),
    CHECK (is_dead_since IS NULL OR is_dead_since >= created_on)
);

CREATE TABLE IF NOT EXISTS urls (
    url_id               TEXT PRIMARY KEY,
    url                  TEXT NOT NULL,
    created_on           TEXT NOT NULL,
    is_dead              INTEGER NOT NULL DEFAULT 0,
    is_dead_since        TEXT,
    is_dead_reason       TEXT,
    not_resolvable       INTEGER NOT NULL DEFAULT 0,
    not_resolvable_since TEXT,
    CHECK ((is_dead = 0) = (is_dead_since IS NULL)),
    CHECK (is_dead_since IS NULL OR is_dead_since >= created_on)
);

-- Ownership edges are only ever added, never removed.
CREATE TABLE IF NOT EXISTS url_organizations (
    url_id          TEXT NOT NULL REFERENCES urls(url_id),
    organization_id TEXT NOT NULL REFERENCES organizations(organization_id),
    PRIMARY KEY (url_id, organization_id)
);

CREATE TABLE IF NOT EXISTS endpoints (
    endpoint_id    TEXT PRIMARY KEY,
    url_id         TEXT NOT NULL REFERENCES urls(url_id),
    protocol       TEXT NOT NULL,
    port           INTEGER NOT NULL,
    ip_version     INTEGER NOT NULL,   -- 4 | 6
    created_on     TEXT NOT NULL,
    is_dead        INTEGER NOT NULL DEFAULT 0,
    is_dead_since  TEXT,
    is_dead_reason TEXT,
    CHECK ((is_dead = 0) = (is_dead_since IS NULL)),
    CHECK (is_dead_since IS NULL OR is_dead_since >= created_on)
);

CREATE TABLE IF NOT EXISTS coordinates (
    coordinate_id   TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL REFERENCES organizations(organization_id),
    area            TEXT NOT NULL,     -- GeoJSON coordinates
    geometry_kind   TEXT NOT NULL,
    created_on      TEXT NOT NULL,
    is_dead         INTEGER NOT NULL DEFAULT 0,
    is_dead_since   TEXT,
    is_dead_reason  TEXT,
    CHECK ((is_dead = 0) = (is_dead_since IS NULL)),
    CHECK (is_dead_since IS NULL OR is_dead_since >= created_on)
);

CREATE TABLE IF NOT EXISTS promises (
    promise_id      TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL REFERENCES organizations(organization_id),
    created_on      TEXT NOT NULL,
    expires_on      TEXT,
    notes           TEXT
);

-- Findings are strictly append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS findings (
    sequence      INTEGER PRIMARY KEY AUTOINCREMENT,
    finding_id    TEXT NOT NULL UNIQUE,
    endpoint_id   TEXT NOT NULL REFERENCES endpoints(endpoint_id),
    finding_type  TEXT NOT NULL,
    high          INTEGER NOT NULL DEFAULT 0,
    medium        INTEGER NOT NULL DEFAULT 0,
    low           INTEGER NOT NULL DEFAULT 0,
    explanation   TEXT NOT NULL DEFAULT '',
    repeated      INTEGER NOT NULL DEFAULT 0,
    determined_on TEXT NOT NULL
);

-- Snapshots are strictly append-only.
CREATE TABLE IF NOT EXISTS url_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    url_id      TEXT NOT NULL REFERENCES urls(url_id),
    sequence    INTEGER NOT NULL,
    when_at     TEXT NOT NULL,
    rating      INTEGER NOT NULL,
    high        INTEGER NOT NULL,
    medium      INTEGER NOT NULL,
    low         INTEGER NOT NULL,
    calculation TEXT NOT NULL,       -- JSON calculation tree
    digest      TEXT NOT NULL,
    UNIQUE (url_id, sequence)
);

CREATE TABLE IF NOT EXISTS organization_snapshots (
    snapshot_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    organization_id TEXT NOT NULL REFERENCES organizations(organization_id),
    sequence        INTEGER NOT NULL,
    when_at         TEXT NOT NULL,
    rating          INTEGER NOT NULL,
    high            INTEGER NOT NULL,
    medium          INTEGER NOT NULL,
    low             INTEGER NOT NULL,
    calculation     TEXT NOT NULL,
    digest          TEXT NOT NULL,
    UNIQUE (organization_id, sequence)
);

CREATE INDEX IF NOT EXISTS organizations_identity_idx ON organizations(name, country, kind);
CREATE INDEX IF NOT EXISTS url_organizations_org_idx  ON url_organizations(organization_id);
CREATE INDEX IF NOT EXISTS endpoints_url_idx          ON endpoints(url_id);
CREATE INDEX IF NOT EXISTS coordinates_org_idx        ON coordinates(organization_id);
CREATE INDEX IF NOT EXISTS promises_org_idx           ON promises(organization_id);
CREATE INDEX IF NOT EXISTS findings_endpoint_idx      ON findings(endpoint_id, determined_on);
CREATE INDEX IF NOT EXISTS url_snapshots_when_idx     ON url_snapshots(url_id, when_at);
CREATE INDEX IF NOT EXISTS org_snapshots_when_idx     ON organization_snapshots(organization_id, when_at);

PRAGMA user_version = 1;
";
