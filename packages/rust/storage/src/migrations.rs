//! SQL migration definitions for the deltacrawl tracking database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: source groups, entities, url history, runs, checkpoints",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Source group bookkeeping (crawl configuration lives in the config file)
CREATE TABLE IF NOT EXISTS source_groups (
    slug          TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    root_url      TEXT NOT NULL,
    first_crawled TEXT,
    last_crawled  TEXT
);

-- Every entity ever seen. Rows are never deleted.
CREATE TABLE IF NOT EXISTS entities (
    fingerprint     TEXT PRIMARY KEY,
    source_group    TEXT NOT NULL,
    url             TEXT NOT NULL,
    first_seen      TEXT NOT NULL,
    last_seen       TEXT NOT NULL,
    last_url_change TEXT,
    status          TEXT NOT NULL CHECK (status IN ('active', 'disappeared')),
    attributes_json TEXT,
    enriched_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_entities_group ON entities(source_group, status);

-- Append-only URL history
CREATE TABLE IF NOT EXISTS entity_url_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL REFERENCES entities(fingerprint),
    url         TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_fingerprint ON entity_url_history(fingerprint);

-- One row per invocation
CREATE TABLE IF NOT EXISTS runs (
    run_id              TEXT PRIMARY KEY,
    started_at          TEXT NOT NULL,
    finished_at         TEXT,
    status              TEXT NOT NULL CHECK (status IN ('enriching', 'completed', 'abandoned')),
    new_count           INTEGER NOT NULL DEFAULT 0,
    reappeared_count    INTEGER NOT NULL DEFAULT 0,
    url_changed_count   INTEGER NOT NULL DEFAULT 0,
    disappeared_count   INTEGER NOT NULL DEFAULT 0,
    unchanged_count     INTEGER NOT NULL DEFAULT 0,
    enriched_count      INTEGER NOT NULL DEFAULT 0,
    failed_count        INTEGER NOT NULL DEFAULT 0,
    skipped_count       INTEGER NOT NULL DEFAULT 0,
    enrichment_units    INTEGER NOT NULL DEFAULT 0,
    enrichment_cost_usd REAL NOT NULL DEFAULT 0,
    duration_ms         INTEGER NOT NULL DEFAULT 0,
    degraded            INTEGER NOT NULL DEFAULT 0,
    anomalies_json      TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, started_at);

-- Classified lists per run
CREATE TABLE IF NOT EXISTS run_changes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL REFERENCES runs(run_id),
    source_group TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    kind         TEXT NOT NULL CHECK (kind IN ('new', 'url_changed', 'unchanged', 'disappeared')),
    url          TEXT NOT NULL,
    old_url      TEXT,
    reappeared   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_run_changes_run ON run_changes(run_id, kind);

-- Enrichment work queued by a run
CREATE TABLE IF NOT EXISTS run_work_items (
    run_id       TEXT NOT NULL REFERENCES runs(run_id),
    fingerprint  TEXT NOT NULL,
    source_group TEXT NOT NULL,
    url          TEXT NOT NULL,
    reappeared   INTEGER NOT NULL DEFAULT 0,
    position     INTEGER NOT NULL,
    PRIMARY KEY (run_id, fingerprint)
);

-- Enrichment progress, keyed by (run, fingerprint)
CREATE TABLE IF NOT EXISTS enrichment_checkpoints (
    run_id      TEXT NOT NULL REFERENCES runs(run_id),
    fingerprint TEXT NOT NULL,
    outcome     TEXT NOT NULL CHECK (outcome IN ('enriched', 'failed', 'skipped')),
    detail      TEXT,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (run_id, fingerprint)
);

-- Permanent-failure bucket
CREATE TABLE IF NOT EXISTS enrichment_failures (
    fingerprint    TEXT PRIMARY KEY,
    source_group   TEXT NOT NULL,
    url            TEXT NOT NULL,
    error          TEXT NOT NULL,
    attempts       INTEGER NOT NULL,
    last_failed_at TEXT NOT NULL,
    run_id         TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
