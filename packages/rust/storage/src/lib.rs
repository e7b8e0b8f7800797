//! Turso Embedded / libSQL state store (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding every entity ever
//! seen, its URL history, source-group bookkeeping, run records, classified
//! lists, enrichment work items, checkpoints, and the permanent-failure bucket.
//!
//! **Access rules:**
//! - The run coordinator is the single writer, via [`Storage::open`]
//! - Reporting commands read via [`Storage::open_readonly`]
//!
//! Multi-row mutations happen inside one transaction; a failure rolls the
//! whole transaction back and leaves the previous state untouched.

mod migrations;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Row, params};
use tracing::{debug, info, instrument};

use deltacrawl_shared::{
    Attributes, ChangeCounts, ChangeKind, CoverageAnomaly, DeltaCrawlError, DisappearedEntry,
    EnrichmentTotals, Entity, EntityStatus, GroupChanges, NewEntry, Result, RunId, RunRecord,
    RunStatus, SourceGroupState, UnchangedEntry, UrlChange, UrlHistoryEntry, WorkItem,
};

// ---------------------------------------------------------------------------
// Write payloads
// ---------------------------------------------------------------------------

/// Everything the classification phase of a run commits, in one transaction.
#[derive(Debug, Clone)]
pub struct ClassificationCommit<'a> {
    pub run_id: &'a RunId,
    pub started_at: DateTime<Utc>,
    /// Timestamp applied to entity and bookkeeping mutations.
    pub now: DateTime<Utc>,
    /// Source groups crawled by this run.
    pub source_groups: &'a [SourceGroupState],
    pub changes: &'a [GroupChanges],
    /// Enrichment queue, in processing order.
    pub work_items: &'a [WorkItem],
    pub anomalies: &'a [CoverageAnomaly],
    /// Active time spent so far (crawl and classification).
    pub duration_ms: u64,
    /// Unfinished run superseded by this one; marked abandoned.
    pub supersedes: Option<&'a RunId>,
}

/// Result of enriching one work item.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    Enriched(Attributes),
    Failed { error: String, attempts: u32 },
    Skipped { reason: String },
}

impl CheckpointOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Enriched(_) => "enriched",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// One buffered checkpoint, flushed atomically with its siblings.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub item: WorkItem,
    pub outcome: CheckpointOutcome,
    pub units: u64,
    pub cost_usd: f64,
}

/// An entity in the permanent-failure bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub fingerprint: String,
    pub source_group: String,
    pub url: String,
    pub error: String,
    pub attempts: u32,
    pub last_failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn to_work_item(&self) -> WorkItem {
        WorkItem {
            fingerprint: self.fingerprint.clone(),
            source_group: self.source_group.clone(),
            url: self.url.clone(),
            reappeared: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DeltaCrawlError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(DeltaCrawlError::storage)?;
        let conn = db.connect().map_err(DeltaCrawlError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        debug!(?path, "state store opened");
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DeltaCrawlError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(DeltaCrawlError::storage)?;
        let conn = db.connect().map_err(DeltaCrawlError::storage)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Release the database handle.
    pub fn close(self) {
        debug!(readonly = self.readonly, "state store closed");
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    DeltaCrawlError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DeltaCrawlError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Source groups
    // -----------------------------------------------------------------------

    /// Insert or refresh a source group's bookkeeping row.
    pub async fn upsert_source_group(&self, group: &SourceGroupState) -> Result<()> {
        self.check_writable()?;
        upsert_source_group(&self.conn, group).await
    }

    pub async fn list_source_groups(&self) -> Result<Vec<SourceGroupState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT slug, name, root_url, first_crawled, last_crawled
                 FROM source_groups ORDER BY slug",
                params![],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            results.push(SourceGroupState {
                slug: get_string(&row, 0)?,
                name: get_string(&row, 1)?,
                root_url: get_string(&row, 2)?,
                first_crawled: get_opt_ts(&row, 3)?,
                last_crawled: get_opt_ts(&row, 4)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// All entities of a source group (any status), ordered by fingerprint,
    /// each with its full URL history.
    pub async fn list_entities_by_group(&self, slug: &str) -> Result<Vec<Entity>> {
        let mut rows = self
            .conn
            .query(
                &format!("{ENTITY_SELECT} WHERE source_group = ?1 ORDER BY fingerprint"),
                params![slug],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            entities.push(row_to_entity(&row)?);
        }

        let mut rows = self
            .conn
            .query(
                "SELECT h.fingerprint, h.url, h.recorded_at
                 FROM entity_url_history h
                 JOIN entities e ON e.fingerprint = h.fingerprint
                 WHERE e.source_group = ?1
                 ORDER BY h.id",
                params![slug],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut history: HashMap<String, Vec<UrlHistoryEntry>> = HashMap::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            history
                .entry(get_string(&row, 0)?)
                .or_default()
                .push(UrlHistoryEntry {
                    url: get_string(&row, 1)?,
                    recorded_at: get_ts(&row, 2)?,
                });
        }

        for entity in &mut entities {
            entity.url_history = history.remove(&entity.fingerprint).unwrap_or_default();
        }
        Ok(entities)
    }

    /// Look up one entity with its full URL history.
    pub async fn get_entity(&self, fingerprint: &str) -> Result<Option<Entity>> {
        let mut rows = self
            .conn
            .query(
                &format!("{ENTITY_SELECT} WHERE fingerprint = ?1"),
                params![fingerprint],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? else {
            return Ok(None);
        };
        let mut entity = row_to_entity(&row)?;
        entity.url_history = self.entity_history(fingerprint).await?;
        Ok(Some(entity))
    }

    /// URL history of one entity, oldest first.
    pub async fn entity_history(&self, fingerprint: &str) -> Result<Vec<UrlHistoryEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT url, recorded_at FROM entity_url_history
                 WHERE fingerprint = ?1 ORDER BY id",
                params![fingerprint],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut history = Vec::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            history.push(UrlHistoryEntry {
                url: get_string(&row, 0)?,
                recorded_at: get_ts(&row, 1)?,
            });
        }
        Ok(history)
    }

    // -----------------------------------------------------------------------
    // Classification commit
    // -----------------------------------------------------------------------

    /// Atomically apply a run's classification: entity mutations, URL history,
    /// source-group bookkeeping, the run row (status `enriching`), classified
    /// lists, and enrichment work items.
    #[instrument(skip_all, fields(run_id = %commit.run_id))]
    pub async fn commit_classification(&self, commit: &ClassificationCommit<'_>) -> Result<()> {
        self.check_writable()?;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(DeltaCrawlError::storage)?;

        let applied = apply_classification(&tx, commit).await;
        match applied {
            Ok(()) => {
                tx.commit().await.map_err(DeltaCrawlError::storage)?;
                info!(
                    groups = commit.changes.len(),
                    work_items = commit.work_items.len(),
                    "classification committed"
                );
                Ok(())
            }
            Err(e) => {
                // Report the original failure even if rollback also fails.
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// The most recent run still in status `enriching`, if any.
    pub async fn unfinished_run(&self) -> Result<Option<RunRecord>> {
        self.query_one_run(
            &format!(
                "{RUN_SELECT} WHERE status = 'enriching' ORDER BY started_at DESC LIMIT 1"
            ),
            params![],
        )
        .await
    }

    /// The most recent run that was not abandoned.
    pub async fn latest_run(&self) -> Result<Option<RunRecord>> {
        self.query_one_run(
            &format!(
                "{RUN_SELECT} WHERE status != 'abandoned' ORDER BY started_at DESC LIMIT 1"
            ),
            params![],
        )
        .await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        self.query_one_run(
            &format!("{RUN_SELECT} WHERE run_id = ?1"),
            params![run_id.to_string()],
        )
        .await
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("{RUN_SELECT} ORDER BY started_at DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }

    async fn query_one_run(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(DeltaCrawlError::storage)?;

        match rows.next().await.map_err(DeltaCrawlError::storage)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Add active work time to a run that is still in progress.
    pub async fn add_run_duration(&self, run_id: &RunId, duration_ms: u64) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE runs SET duration_ms = duration_ms + ?1 WHERE run_id = ?2",
                params![duration_ms as i64, run_id.to_string()],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;
        Ok(())
    }

    /// Mark a run completed. The degraded flag is kept if already set and
    /// raised when enrichment left permanent failures behind.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn finalize_run(
        &self,
        run_id: &RunId,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Result<RunRecord> {
        self.check_writable()?;
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET
                   status = 'completed',
                   finished_at = ?1,
                   duration_ms = duration_ms + ?2,
                   degraded = CASE WHEN degraded = 1 OR failed_count > 0 THEN 1 ELSE 0 END
                 WHERE run_id = ?3 AND status = 'enriching'",
                params![ts(&finished_at), duration_ms as i64, run_id.to_string()],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        if updated == 0 {
            return Err(DeltaCrawlError::Storage(format!(
                "run {run_id} is not in progress"
            )));
        }

        self.get_run(run_id)
            .await?
            .ok_or_else(|| DeltaCrawlError::Storage(format!("run {run_id} vanished")))
    }

    /// The classified lists a run committed, one entry per source group.
    pub async fn run_changes(&self, run_id: &RunId) -> Result<Vec<GroupChanges>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_group, kind, fingerprint, url, old_url, reappeared
                 FROM run_changes WHERE run_id = ?1
                 ORDER BY source_group, fingerprint",
                params![run_id.to_string()],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut groups: BTreeMap<String, GroupChanges> = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            let source_group = get_string(&row, 0)?;
            let kind_str = get_string(&row, 1)?;
            let kind = ChangeKind::parse(&kind_str).ok_or_else(|| {
                DeltaCrawlError::validation(format!("unknown change kind '{kind_str}'"))
            })?;
            let fingerprint = get_string(&row, 2)?;
            let url = get_string(&row, 3)?;

            let changes = groups
                .entry(source_group.clone())
                .or_insert_with(|| GroupChanges::new(source_group));
            match kind {
                ChangeKind::New => changes.new.push(NewEntry {
                    fingerprint,
                    url,
                    reappeared: get_i64(&row, 5)? != 0,
                }),
                ChangeKind::UrlChanged => changes.url_changed.push(UrlChange {
                    fingerprint,
                    old_url: get_opt_string(&row, 4).unwrap_or_default(),
                    new_url: url,
                }),
                ChangeKind::Unchanged => {
                    changes.unchanged.push(UnchangedEntry { fingerprint, url })
                }
                ChangeKind::Disappeared => {
                    changes.disappeared.push(DisappearedEntry { fingerprint, url })
                }
            }
        }

        if let Some(run) = self.get_run(run_id).await? {
            for anomaly in run.anomalies {
                let slug = anomaly.source_group.clone();
                groups
                    .entry(slug.clone())
                    .or_insert_with(|| GroupChanges::new(slug))
                    .anomaly = Some(anomaly);
            }
        }

        Ok(groups.into_values().collect())
    }

    // -----------------------------------------------------------------------
    // Enrichment work and checkpoints
    // -----------------------------------------------------------------------

    /// All work items a run queued, in processing order.
    pub async fn work_items(&self, run_id: &RunId) -> Result<Vec<WorkItem>> {
        self.query_work_items(
            "SELECT fingerprint, source_group, url, reappeared
             FROM run_work_items WHERE run_id = ?1 ORDER BY position",
            run_id,
        )
        .await
    }

    /// Work items of a run without a checkpoint row, in processing order.
    pub async fn pending_work_items(&self, run_id: &RunId) -> Result<Vec<WorkItem>> {
        self.query_work_items(
            "SELECT w.fingerprint, w.source_group, w.url, w.reappeared
             FROM run_work_items w
             LEFT JOIN enrichment_checkpoints c
               ON c.run_id = w.run_id AND c.fingerprint = w.fingerprint
             WHERE w.run_id = ?1 AND c.fingerprint IS NULL
             ORDER BY w.position",
            run_id,
        )
        .await
    }

    async fn query_work_items(&self, sql: &str, run_id: &RunId) -> Result<Vec<WorkItem>> {
        let mut rows = self
            .conn
            .query(sql, params![run_id.to_string()])
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            items.push(WorkItem {
                fingerprint: get_string(&row, 0)?,
                source_group: get_string(&row, 1)?,
                url: get_string(&row, 2)?,
                reappeared: get_i64(&row, 3)? != 0,
            });
        }
        Ok(items)
    }

    /// Atomically persist a batch of enrichment outcomes: entity attributes,
    /// checkpoint rows, the failure bucket, and the run's totals.
    ///
    /// With `run_id = None` (retrying the failure bucket outside a run) only
    /// entity attributes and the failure bucket are touched.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub async fn flush_checkpoint(
        &self,
        run_id: Option<&RunId>,
        entries: &[CheckpointEntry],
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        if entries.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(DeltaCrawlError::storage)?;

        let applied = apply_checkpoint(&tx, run_id, entries, now).await;
        match applied {
            Ok(()) => {
                tx.commit().await.map_err(DeltaCrawlError::storage)?;
                debug!("checkpoint flushed");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Fingerprints that already have a checkpoint row for the run.
    pub async fn completed_fingerprints(&self, run_id: &RunId) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT fingerprint FROM enrichment_checkpoints
                 WHERE run_id = ?1 ORDER BY fingerprint",
                params![run_id.to_string()],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            out.push(get_string(&row, 0)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Permanent failures
    // -----------------------------------------------------------------------

    pub async fn list_failures(&self) -> Result<Vec<FailureRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT fingerprint, source_group, url, error, attempts, last_failed_at
                 FROM enrichment_failures ORDER BY source_group, fingerprint",
                params![],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(DeltaCrawlError::storage)? {
            out.push(FailureRecord {
                fingerprint: get_string(&row, 0)?,
                source_group: get_string(&row, 1)?,
                url: get_string(&row, 2)?,
                error: get_string(&row, 3)?,
                attempts: get_i64(&row, 4)? as u32,
                last_failed_at: get_ts(&row, 5)?,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

async fn apply_classification(conn: &Connection, commit: &ClassificationCommit<'_>) -> Result<()> {
    let now = ts(&commit.now);
    let run_id = commit.run_id.to_string();

    if let Some(previous) = commit.supersedes {
        abandon_run(conn, previous).await?;
    }

    let mut counts = ChangeCounts::default();
    for changes in commit.changes {
        counts.new += changes.new.len() - changes.reappeared_count();
        counts.reappeared += changes.reappeared_count();
        counts.url_changed += changes.url_changed.len();
        counts.unchanged += changes.unchanged.len();
        counts.disappeared += changes.disappeared.len();
    }

    let anomalies_json = if commit.anomalies.is_empty() {
        None
    } else {
        Some(serde_json::to_string(commit.anomalies).map_err(|e| DeltaCrawlError::parse(e.to_string()))?)
    };

    conn.execute(
        "INSERT INTO runs (run_id, started_at, status,
                           new_count, reappeared_count, url_changed_count,
                           disappeared_count, unchanged_count,
                           duration_ms, degraded, anomalies_json)
         VALUES (?1, ?2, 'enriching', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run_id.as_str(),
            ts(&commit.started_at),
            counts.new as i64,
            counts.reappeared as i64,
            counts.url_changed as i64,
            counts.disappeared as i64,
            counts.unchanged as i64,
            commit.duration_ms as i64,
            i64::from(!commit.anomalies.is_empty()),
            anomalies_json,
        ],
    )
    .await
    .map_err(DeltaCrawlError::storage)?;

    for group in commit.source_groups {
        let state = SourceGroupState {
            first_crawled: group.first_crawled.or(Some(commit.now)),
            last_crawled: Some(commit.now),
            ..group.clone()
        };
        upsert_source_group(conn, &state).await?;
    }

    for changes in commit.changes {
        let group = changes.source_group.as_str();

        for entry in &changes.new {
            if entry.reappeared {
                conn.execute(
                    "UPDATE entities SET
                       status = 'active',
                       last_url_change = CASE WHEN url != ?1 THEN ?2 ELSE last_url_change END,
                       url = ?1,
                       last_seen = ?2
                     WHERE fingerprint = ?3",
                    params![entry.url.as_str(), now.as_str(), entry.fingerprint.as_str()],
                )
                .await
                .map_err(DeltaCrawlError::storage)?;
            } else {
                conn.execute(
                    "INSERT INTO entities (fingerprint, source_group, url, first_seen, last_seen, status)
                     VALUES (?1, ?2, ?3, ?4, ?4, 'active')",
                    params![entry.fingerprint.as_str(), group, entry.url.as_str(), now.as_str()],
                )
                .await
                .map_err(|e| {
                    DeltaCrawlError::Storage(format!(
                        "insert entity {}: {e}",
                        entry.fingerprint
                    ))
                })?;
            }
            append_history(conn, &entry.fingerprint, &entry.url, &now).await?;
            insert_change(
                conn,
                &run_id,
                group,
                &entry.fingerprint,
                ChangeKind::New,
                &entry.url,
                None,
                entry.reappeared,
            )
            .await?;
        }

        for change in &changes.url_changed {
            conn.execute(
                "UPDATE entities SET url = ?1, last_url_change = ?2, last_seen = ?2
                 WHERE fingerprint = ?3",
                params![change.new_url.as_str(), now.as_str(), change.fingerprint.as_str()],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;
            append_history(conn, &change.fingerprint, &change.new_url, &now).await?;
            insert_change(
                conn,
                &run_id,
                group,
                &change.fingerprint,
                ChangeKind::UrlChanged,
                &change.new_url,
                Some(&change.old_url),
                false,
            )
            .await?;
        }

        for entry in &changes.unchanged {
            conn.execute(
                "UPDATE entities SET last_seen = ?1 WHERE fingerprint = ?2",
                params![now.as_str(), entry.fingerprint.as_str()],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;
            insert_change(
                conn,
                &run_id,
                group,
                &entry.fingerprint,
                ChangeKind::Unchanged,
                &entry.url,
                None,
                false,
            )
            .await?;
        }

        for entry in &changes.disappeared {
            conn.execute(
                "UPDATE entities SET status = 'disappeared' WHERE fingerprint = ?1",
                params![entry.fingerprint.as_str()],
            )
            .await
            .map_err(DeltaCrawlError::storage)?;
            insert_change(
                conn,
                &run_id,
                group,
                &entry.fingerprint,
                ChangeKind::Disappeared,
                &entry.url,
                None,
                false,
            )
            .await?;
        }
    }

    for (position, item) in commit.work_items.iter().enumerate() {
        conn.execute(
            "INSERT INTO run_work_items (run_id, fingerprint, source_group, url, reappeared, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id.as_str(),
                item.fingerprint.as_str(),
                item.source_group.as_str(),
                item.url.as_str(),
                i64::from(item.reappeared),
                position as i64,
            ],
        )
        .await
        .map_err(DeltaCrawlError::storage)?;
    }

    Ok(())
}

async fn apply_checkpoint(
    conn: &Connection,
    run_id: Option<&RunId>,
    entries: &[CheckpointEntry],
    now: DateTime<Utc>,
) -> Result<()> {
    let now = ts(&now);
    let mut totals = EnrichmentTotals::default();

    for entry in entries {
        let fingerprint = entry.item.fingerprint.as_str();
        let detail = match &entry.outcome {
            CheckpointOutcome::Enriched(attributes) => {
                let json = serde_json::to_string(attributes)
                    .map_err(|e| DeltaCrawlError::parse(e.to_string()))?;
                conn.execute(
                    "UPDATE entities SET attributes_json = ?1, enriched_at = ?2
                     WHERE fingerprint = ?3",
                    params![json, now.as_str(), fingerprint],
                )
                .await
                .map_err(DeltaCrawlError::storage)?;
                clear_failure(conn, fingerprint).await?;
                totals.enriched += 1;
                None
            }
            CheckpointOutcome::Failed { error, attempts } => {
                conn.execute(
                    "INSERT INTO enrichment_failures
                       (fingerprint, source_group, url, error, attempts, last_failed_at, run_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(fingerprint) DO UPDATE SET
                       url = excluded.url,
                       error = excluded.error,
                       attempts = enrichment_failures.attempts + excluded.attempts,
                       last_failed_at = excluded.last_failed_at,
                       run_id = excluded.run_id",
                    params![
                        fingerprint,
                        entry.item.source_group.as_str(),
                        entry.item.url.as_str(),
                        error.as_str(),
                        i64::from(*attempts),
                        now.as_str(),
                        run_id.map(|r| r.to_string()),
                    ],
                )
                .await
                .map_err(DeltaCrawlError::storage)?;
                totals.failed += 1;
                Some(error.clone())
            }
            CheckpointOutcome::Skipped { reason } => {
                clear_failure(conn, fingerprint).await?;
                totals.skipped += 1;
                Some(reason.clone())
            }
        };
        totals.units += entry.units;
        totals.cost_usd += entry.cost_usd;

        if let Some(run_id) = run_id {
            conn.execute(
                "INSERT INTO enrichment_checkpoints (run_id, fingerprint, outcome, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    fingerprint,
                    entry.outcome.as_str(),
                    detail,
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| {
                DeltaCrawlError::Storage(format!("checkpoint {fingerprint}: {e}"))
            })?;
        }
    }

    if let Some(run_id) = run_id {
        conn.execute(
            "UPDATE runs SET
               enriched_count = enriched_count + ?1,
               failed_count = failed_count + ?2,
               skipped_count = skipped_count + ?3,
               enrichment_units = enrichment_units + ?4,
               enrichment_cost_usd = enrichment_cost_usd + ?5
             WHERE run_id = ?6",
            params![
                totals.enriched as i64,
                totals.failed as i64,
                totals.skipped as i64,
                totals.units as i64,
                totals.cost_usd,
                run_id.to_string(),
            ],
        )
        .await
        .map_err(DeltaCrawlError::storage)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Statement helpers (usable on a connection or inside a transaction)
// ---------------------------------------------------------------------------

async fn upsert_source_group(conn: &Connection, group: &SourceGroupState) -> Result<()> {
    conn.execute(
        "INSERT INTO source_groups (slug, name, root_url, first_crawled, last_crawled)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(slug) DO UPDATE SET
           name = excluded.name,
           root_url = excluded.root_url,
           first_crawled = COALESCE(source_groups.first_crawled, excluded.first_crawled),
           last_crawled = COALESCE(excluded.last_crawled, source_groups.last_crawled)",
        params![
            group.slug.as_str(),
            group.name.as_str(),
            group.root_url.as_str(),
            group.first_crawled.as_ref().map(ts),
            group.last_crawled.as_ref().map(ts),
        ],
    )
    .await
    .map_err(DeltaCrawlError::storage)?;
    Ok(())
}

async fn abandon_run(conn: &Connection, run_id: &RunId) -> Result<()> {
    conn.execute(
        "UPDATE runs SET status = 'abandoned' WHERE run_id = ?1 AND status = 'enriching'",
        params![run_id.to_string()],
    )
    .await
    .map_err(DeltaCrawlError::storage)?;
    info!(%run_id, "run abandoned");
    Ok(())
}

async fn append_history(conn: &Connection, fingerprint: &str, url: &str, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_url_history (fingerprint, url, recorded_at) VALUES (?1, ?2, ?3)",
        params![fingerprint, url, now],
    )
    .await
    .map_err(DeltaCrawlError::storage)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_change(
    conn: &Connection,
    run_id: &str,
    source_group: &str,
    fingerprint: &str,
    kind: ChangeKind,
    url: &str,
    old_url: Option<&str>,
    reappeared: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO run_changes (run_id, source_group, fingerprint, kind, url, old_url, reappeared)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id,
            source_group,
            fingerprint,
            kind.as_str(),
            url,
            old_url,
            i64::from(reappeared),
        ],
    )
    .await
    .map_err(DeltaCrawlError::storage)?;
    Ok(())
}

async fn clear_failure(conn: &Connection, fingerprint: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM enrichment_failures WHERE fingerprint = ?1",
        params![fingerprint],
    )
    .await
    .map_err(DeltaCrawlError::storage)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

const ENTITY_SELECT: &str = "SELECT fingerprint, source_group, url, first_seen, last_seen,
        last_url_change, status, attributes_json, enriched_at
 FROM entities";

const RUN_SELECT: &str = "SELECT run_id, started_at, finished_at, status,
        new_count, reappeared_count, url_changed_count, disappeared_count, unchanged_count,
        enriched_count, failed_count, skipped_count, enrichment_units, enrichment_cost_usd,
        duration_ms, degraded, anomalies_json
 FROM runs";

/// Convert an [`ENTITY_SELECT`] row; URL history is filled in by the caller.
fn row_to_entity(row: &Row) -> Result<Entity> {
    let attributes = match get_opt_string(row, 7) {
        Some(json) => Some(
            serde_json::from_str::<Attributes>(&json)
                .map_err(|e| DeltaCrawlError::parse(format!("stored attributes: {e}")))?,
        ),
        None => None,
    };

    Ok(Entity {
        fingerprint: get_string(row, 0)?,
        source_group: get_string(row, 1)?,
        url: get_string(row, 2)?,
        url_history: Vec::new(),
        first_seen: get_ts(row, 3)?,
        last_seen: get_ts(row, 4)?,
        last_url_change: get_opt_ts(row, 5)?,
        status: EntityStatus::parse(&get_string(row, 6)?)?,
        attributes,
        enriched_at: get_opt_ts(row, 8)?,
    })
}

fn row_to_run(row: &Row) -> Result<RunRecord> {
    let run_id_str = get_string(row, 0)?;
    let run_id = run_id_str
        .parse::<RunId>()
        .map_err(|e| DeltaCrawlError::parse(format!("run id '{run_id_str}': {e}")))?;

    let anomalies = match get_opt_string(row, 16) {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| DeltaCrawlError::parse(format!("stored anomalies: {e}")))?,
        None => Vec::new(),
    };

    Ok(RunRecord {
        run_id,
        started_at: get_ts(row, 1)?,
        finished_at: get_opt_ts(row, 2)?,
        status: RunStatus::parse(&get_string(row, 3)?)?,
        counts: ChangeCounts {
            new: get_i64(row, 4)? as usize,
            reappeared: get_i64(row, 5)? as usize,
            url_changed: get_i64(row, 6)? as usize,
            disappeared: get_i64(row, 7)? as usize,
            unchanged: get_i64(row, 8)? as usize,
        },
        enrichment: EnrichmentTotals {
            enriched: get_i64(row, 9)? as usize,
            failed: get_i64(row, 10)? as usize,
            skipped: get_i64(row, 11)? as usize,
            units: get_i64(row, 12)? as u64,
            cost_usd: row.get::<f64>(13).map_err(DeltaCrawlError::storage)?,
        },
        duration_ms: get_i64(row, 14)? as u64,
        degraded: get_i64(row, 15)? != 0,
        anomalies,
    })
}

fn get_string(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(DeltaCrawlError::storage)
}

fn get_opt_string(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn get_i64(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(DeltaCrawlError::storage)
}

fn get_ts(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&get_string(row, idx)?)
}

fn get_opt_ts(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    get_opt_string(row, idx).map(|s| parse_ts(&s)).transpose()
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DeltaCrawlError::Storage(format!("invalid date '{s}': {e}")))
}
