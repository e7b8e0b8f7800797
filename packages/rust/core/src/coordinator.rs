//! One resumable run: crawl, fingerprint, classify, commit, enrich, finalize.
//!
//! An unfinished run (status `enriching`) is resumed instead of starting a
//! new crawl. Cancellation during the crawl writes nothing; cancellation
//! during enrichment flushes checkpoints and leaves the run resumable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use url::Url;

use deltacrawl_crawler::{CrawlReport, Fetcher, PatternCrawler};
use deltacrawl_shared::{
    AppConfig, CoverageAnomaly, CrawlConfig, DeltaCrawlError, GroupChanges, Result, RunId,
    RunRecord, SourceGroupConfig, SourceGroupState, WorkItem, validate_config,
};
use deltacrawl_storage::{ClassificationCommit, FailureRecord, Storage};

use crate::clock::Clock;
use crate::detector::{CoveragePolicy, Discovered, classify};
use crate::fingerprint::FingerprintEngine;
use crate::oracle::EnrichmentOracle;
use crate::progress::ProgressReporter;
use crate::scheduler::{ExtractionScheduler, ScheduleReport};

// ---------------------------------------------------------------------------
// Options & results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the crawl to these slugs. Empty means every configured group.
    pub groups: Vec<String>,
    /// Abandon an unfinished run instead of resuming it. Its pending work
    /// items are carried into the new run.
    pub fresh: bool,
    /// Record what the crawl finds as the known state without queueing any
    /// enrichment. Starts a new run like `fresh`; nothing is carried.
    pub baseline: bool,
}

/// Everything a finished run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub record: RunRecord,
    pub changes: Vec<GroupChanges>,
    /// The permanent-failure bucket after the run.
    pub failures: Vec<FailureRecord>,
    /// Per-group crawl reports; empty for a resumed run.
    pub crawl: Vec<CrawlReport>,
    pub resumed: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Box<RunReport>),
    /// Stopped cooperatively. `run_id` is set when classification had been
    /// committed; that run can be resumed.
    Cancelled { run_id: Option<RunId> },
}

/// Result of re-enriching the permanent-failure bucket.
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub attempted: usize,
    pub schedule: ScheduleReport,
    pub remaining: Vec<FailureRecord>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct RunCoordinator {
    config: AppConfig,
    storage: Storage,
    fetcher: Arc<dyn Fetcher>,
    oracle: Arc<dyn EnrichmentOracle>,
    clock: Arc<dyn Clock>,
}

impl RunCoordinator {
    /// Validates the configuration before anything else happens.
    pub fn new(
        config: AppConfig,
        storage: Storage,
        fetcher: Arc<dyn Fetcher>,
        oracle: Arc<dyn EnrichmentOracle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate_config(&config)?;
        Ok(Self {
            config,
            storage,
            fetcher,
            oracle,
            clock,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Hand the store back so the caller can close it.
    pub fn into_storage(self) -> Storage {
        self.storage
    }

    /// Run (or resume) one invocation.
    #[instrument(skip_all, fields(groups = ?options.groups, fresh = options.fresh, baseline = options.baseline))]
    pub async fn run(
        &self,
        options: &RunOptions,
        cancel: CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        let unfinished = self.storage.unfinished_run().await?;

        match unfinished {
            Some(run) if !options.fresh && !options.baseline => {
                info!(run_id = %run.run_id, "resuming unfinished run");
                self.resume(run.run_id, cancel, progress).await
            }
            previous => {
                let groups = self.select_groups(&options.groups)?;
                self.fresh_run(
                    &groups,
                    previous.map(|r| r.run_id),
                    options.baseline,
                    cancel,
                    progress,
                )
                .await
            }
        }
    }

    /// Re-enrich every entity in the permanent-failure bucket, outside any run.
    #[instrument(skip_all)]
    pub async fn retry_failed(
        &self,
        cancel: CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RetryReport> {
        let items: Vec<WorkItem> = self
            .storage
            .list_failures()
            .await?
            .iter()
            .map(FailureRecord::to_work_item)
            .collect();
        info!(items = items.len(), "retrying permanent failures");

        progress.phase("Retrying failed enrichments");
        let schedule = self.enrich(None, &items, &cancel, progress).await?;
        let remaining = self.storage.list_failures().await?;

        Ok(RetryReport {
            attempted: items.len(),
            schedule,
            remaining,
        })
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn resume(
        &self,
        run_id: RunId,
        cancel: CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let items = self.storage.work_items(&run_id).await?;

        progress.phase("Resuming enrichment");
        let schedule = self.enrich(Some(&run_id), &items, &cancel, progress).await?;
        self.conclude(run_id, schedule, started, Vec::new(), true).await
    }

    async fn fresh_run(
        &self,
        groups: &[&SourceGroupConfig],
        supersedes: Option<RunId>,
        baseline: bool,
        cancel: CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let started_at = self.clock.now();

        // --- Crawl ---
        progress.phase("Crawling source groups");
        let crawled = self.crawl_all(groups, &cancel, progress).await?;
        if cancel.is_cancelled() {
            info!("cancelled during crawl, nothing written");
            return Ok(RunOutcome::Cancelled { run_id: None });
        }

        // --- Classify ---
        progress.phase("Classifying entities");
        let policy = CoveragePolicy::from(&self.config.detection);
        let known_groups: HashMap<String, SourceGroupState> = self
            .storage
            .list_source_groups()
            .await?
            .into_iter()
            .map(|g| (g.slug.clone(), g))
            .collect();

        let mut changes: Vec<GroupChanges> = Vec::with_capacity(groups.len());
        let mut states: Vec<SourceGroupState> = Vec::with_capacity(groups.len());
        for (group, (urls, _)) in groups.iter().zip(&crawled) {
            let engine = FingerprintEngine::new(&group.noise_tokens);
            let discovered: Vec<Discovered> = urls
                .iter()
                .map(|u| Discovered::new(engine.fingerprint(&group.slug, u), u.as_str()))
                .collect();
            let existing = self.storage.list_entities_by_group(&group.slug).await?;

            let group_changes = classify(&group.slug, &discovered, &existing, &policy);
            if let Some(anomaly) = &group_changes.anomaly {
                warn!(
                    group = %group.slug,
                    discovered = anomaly.discovered,
                    previously_active = anomaly.previously_active,
                    suppressed = anomaly.suppressed,
                    "coverage below threshold, not marking anything disappeared"
                );
            }
            info!(
                group = %group.slug,
                new = group_changes.new.len(),
                reappeared = group_changes.reappeared_count(),
                url_changed = group_changes.url_changed.len(),
                unchanged = group_changes.unchanged.len(),
                disappeared = group_changes.disappeared.len(),
                "group classified"
            );

            states.push(SourceGroupState {
                slug: group.slug.clone(),
                name: group.display_name(),
                root_url: group.root_url.clone(),
                first_crawled: known_groups.get(&group.slug).and_then(|g| g.first_crawled),
                last_crawled: None,
            });
            changes.push(group_changes);
        }

        // --- Commit ---
        let carried = match &supersedes {
            Some(previous) if baseline => {
                info!(run_id = %previous, "abandoning unfinished run for a baseline");
                Vec::new()
            }
            Some(previous) => {
                let pending = self.storage.pending_work_items(previous).await?;
                info!(run_id = %previous, carried = pending.len(), "abandoning unfinished run");
                pending
            }
            None => Vec::new(),
        };
        let work_items = if baseline {
            Vec::new()
        } else {
            self.work_items(&changes, carried)
        };
        let anomalies: Vec<CoverageAnomaly> =
            changes.iter().filter_map(|c| c.anomaly.clone()).collect();

        let run_id = RunId::new();
        self.storage
            .commit_classification(&ClassificationCommit {
                run_id: &run_id,
                started_at,
                now: self.clock.now(),
                source_groups: &states,
                changes: &changes,
                work_items: &work_items,
                anomalies: &anomalies,
                duration_ms: started.elapsed().as_millis() as u64,
                supersedes: supersedes.as_ref(),
            })
            .await?;
        info!(%run_id, work_items = work_items.len(), "classification committed");

        // --- Enrich ---
        let enrich_started = Instant::now();
        progress.phase("Enriching new entities");
        let schedule = self.enrich(Some(&run_id), &work_items, &cancel, progress).await?;

        let crawl = crawled.into_iter().map(|(_, report)| report).collect();
        self.conclude(run_id, schedule, enrich_started, crawl, false).await
    }

    /// Finalize after enrichment, or leave the run resumable when cancelled.
    async fn conclude(
        &self,
        run_id: RunId,
        schedule: ScheduleReport,
        phase_started: Instant,
        crawl: Vec<CrawlReport>,
        resumed: bool,
    ) -> Result<RunOutcome> {
        let elapsed_ms = phase_started.elapsed().as_millis() as u64;

        if schedule.cancelled {
            self.storage.add_run_duration(&run_id, elapsed_ms).await?;
            info!(%run_id, "cancelled during enrichment, run left resumable");
            return Ok(RunOutcome::Cancelled {
                run_id: Some(run_id),
            });
        }

        let record = self
            .storage
            .finalize_run(&run_id, self.clock.now(), elapsed_ms)
            .await?;
        let changes = self.storage.run_changes(&run_id).await?;
        let failures = self.storage.list_failures().await?;

        info!(
            %run_id,
            new = record.counts.new,
            url_changed = record.counts.url_changed,
            disappeared = record.counts.disappeared,
            enriched = record.enrichment.enriched,
            failed = record.enrichment.failed,
            degraded = record.degraded,
            "run completed"
        );

        Ok(RunOutcome::Completed(Box::new(RunReport {
            record,
            changes,
            failures,
            crawl,
            resumed,
        })))
    }

    async fn enrich(
        &self,
        run_id: Option<&RunId>,
        items: &[WorkItem],
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<ScheduleReport> {
        let scheduler = ExtractionScheduler::new(
            self.oracle.as_ref(),
            &self.storage,
            self.clock.as_ref(),
            &self.config.extraction,
        );
        let outcome = scheduler.run(run_id, items, cancel, progress).await;
        self.oracle.shutdown().await;
        outcome
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn select_groups(&self, slugs: &[String]) -> Result<Vec<&SourceGroupConfig>> {
        if slugs.is_empty() {
            return Ok(self.config.source_groups.iter().collect());
        }
        slugs
            .iter()
            .map(|slug| {
                self.config.group(slug).ok_or_else(|| {
                    DeltaCrawlError::config(format!("unknown source group '{slug}'"))
                })
            })
            .collect()
    }

    /// Crawl every group, in parallel when configured. Results come back in
    /// `groups` order. All pattern sets compile before the first fetch.
    async fn crawl_all(
        &self,
        groups: &[&SourceGroupConfig],
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<(Vec<Url>, CrawlReport)>> {
        let crawlers = groups
            .iter()
            .map(|group| {
                let config = CrawlConfig::for_group(&self.config, group)?;
                PatternCrawler::new(config, self.fetcher.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut results: Vec<Option<(Vec<Url>, CrawlReport)>> =
            crawlers.iter().map(|_| None).collect();

        if self.config.crawl.parallel_groups {
            let mut tasks = JoinSet::new();
            for (index, crawler) in crawlers.iter().enumerate() {
                let stream = crawler.start(cancel.clone());
                tasks.spawn(async move { (index, stream.collect_all().await) });
            }
            while let Some(joined) = tasks.join_next().await {
                let (index, collected) =
                    joined.map_err(|e| DeltaCrawlError::Network(format!("crawl task failed: {e}")))?;
                let collected = collected?;
                progress.group_crawled(&collected.1);
                results[index] = Some(collected);
            }
        } else {
            for (index, crawler) in crawlers.iter().enumerate() {
                if cancel.is_cancelled() {
                    break;
                }
                let collected = crawler.start(cancel.clone()).collect_all().await?;
                progress.group_crawled(&collected.1);
                results[index] = Some(collected);
            }
        }

        Ok(results
            .into_iter()
            .zip(crawlers.iter())
            .map(|(result, crawler)| {
                result.unwrap_or_else(|| {
                    (
                        Vec::new(),
                        CrawlReport {
                            source_group: crawler.slug().to_string(),
                            cancelled: true,
                            ..Default::default()
                        },
                    )
                })
            })
            .collect())
    }

    /// New and reappeared entities in group order, optionally URL-changed
    /// ones, then whatever an abandoned run left pending.
    fn work_items(&self, changes: &[GroupChanges], carried: Vec<WorkItem>) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = Vec::new();
        let mut gone: HashSet<&str> = HashSet::new();

        for group in changes {
            items.extend(group.new.iter().map(|n| WorkItem {
                fingerprint: n.fingerprint.clone(),
                source_group: group.source_group.clone(),
                url: n.url.clone(),
                reappeared: n.reappeared,
            }));
            if self.config.extraction.reenrich_url_changed {
                items.extend(group.url_changed.iter().map(|c| WorkItem {
                    fingerprint: c.fingerprint.clone(),
                    source_group: group.source_group.clone(),
                    url: c.new_url.clone(),
                    reappeared: false,
                }));
            }
            gone.extend(group.disappeared.iter().map(|d| d.fingerprint.as_str()));
        }

        let mut queued: HashSet<String> = items.iter().map(|i| i.fingerprint.clone()).collect();
        for item in carried {
            if !gone.contains(item.fingerprint.as_str()) && queued.insert(item.fingerprint.clone()) {
                items.push(item);
            }
        }
        items
    }
}

// ---------------------------------------------------------------------------
// Read-only reporting
// ---------------------------------------------------------------------------

/// Load a finished or in-progress run's report. `None` picks the latest
/// non-abandoned run.
pub async fn load_report(storage: &Storage, run_id: Option<&RunId>) -> Result<Option<RunReport>> {
    let record = match run_id {
        Some(id) => storage.get_run(id).await?,
        None => storage.latest_run().await?,
    };
    let Some(record) = record else {
        return Ok(None);
    };

    let changes = storage.run_changes(&record.run_id).await?;
    let failures = storage.list_failures().await?;
    Ok(Some(RunReport {
        record,
        changes,
        failures,
        crawl: Vec::new(),
        resumed: false,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::oracle::EnrichmentError;
    use crate::progress::SilentProgress;
    use crate::testing::{ScriptedOracle, SiteFetcher, temp_db_path};
    use deltacrawl_shared::{EntityStatus, RunStatus};

    const ROOT: &str = "https://acme.test/";
    const BETA_ROOT: &str = "https://beta.test/";

    fn app_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.crawl.politeness_delay_ms = 0;
        config.extraction.delay_between_calls_ms = 0;
        config.extraction.delay_between_groups_ms = 0;
        config.extraction.checkpoint_every = 1;
        config.source_groups = vec![SourceGroupConfig {
            slug: "acme".into(),
            name: "Acme".into(),
            root_url: ROOT.into(),
            seed_urls: vec![],
            max_depth: 2,
            include_patterns: vec![
                "https://acme.test/catalog/*".into(),
                "https://acme.test/de/catalog/*".into(),
            ],
            exclude_patterns: vec![],
            keep_query_params: vec![],
            noise_tokens: vec![],
        }];
        config
    }

    /// Root links to each path; each path is a leaf page.
    fn site(paths: &[&str]) -> SiteFetcher {
        with_pages(SiteFetcher::new(), ROOT, paths)
    }

    fn with_pages(fetcher: SiteFetcher, root: &str, paths: &[&str]) -> SiteFetcher {
        let links: Vec<String> = paths.iter().map(|p| format!("{root}{p}")).collect();
        let refs: Vec<&str> = links.iter().map(String::as_str).collect();
        let mut fetcher = fetcher.page(root, &refs);
        for link in &links {
            fetcher = fetcher.page(link, &[]);
        }
        fetcher
    }

    /// Adds a second group, "beta", rooted at `BETA_ROOT`.
    fn two_group_config(parallel_groups: bool) -> AppConfig {
        let mut config = app_config();
        config.crawl.parallel_groups = parallel_groups;
        config.source_groups.push(SourceGroupConfig {
            slug: "beta".into(),
            name: "Beta".into(),
            root_url: BETA_ROOT.into(),
            seed_urls: vec![],
            max_depth: 2,
            include_patterns: vec!["https://beta.test/catalog/*".into()],
            exclude_patterns: vec![],
            keep_query_params: vec![],
            noise_tokens: vec![],
        });
        config
    }

    async fn coordinator(
        config: AppConfig,
        storage: Storage,
        fetcher: SiteFetcher,
        oracle: Arc<ScriptedOracle>,
    ) -> RunCoordinator {
        RunCoordinator::new(
            config,
            storage,
            Arc::new(fetcher),
            oracle,
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    async fn completed(
        coordinator: &RunCoordinator,
        options: &RunOptions,
    ) -> RunReport {
        match coordinator
            .run(options, CancellationToken::new(), &SilentProgress)
            .await
            .unwrap()
        {
            RunOutcome::Completed(report) => *report,
            other => panic!("expected completed run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relocated_new_and_removed_entities() {
        let path = temp_db_path();
        let storage = Storage::open(&path).await.unwrap();

        let first_oracle = Arc::new(ScriptedOracle::new());
        let first = coordinator(
            app_config(),
            storage,
            site(&["catalog/x1", "catalog/x3"]),
            first_oracle.clone(),
        )
        .await;
        let report = completed(&first, &RunOptions::default()).await;
        assert_eq!(report.record.counts.new, 2);
        assert_eq!(report.record.enrichment.enriched, 2);
        assert_eq!(
            first_oracle.called_fingerprints(),
            vec!["acme_catalog_x1", "acme_catalog_x3"]
        );

        // x1 moves under a language prefix, x2 appears, x3 is gone.
        let second_oracle = Arc::new(ScriptedOracle::new());
        let second = coordinator(
            app_config(),
            first.into_storage(),
            site(&["de/catalog/x1", "catalog/x2"]),
            second_oracle.clone(),
        )
        .await;
        let report = completed(&second, &RunOptions::default()).await;

        let changes = &report.changes[0];
        assert_eq!(changes.url_changed.len(), 1);
        assert_eq!(changes.url_changed[0].fingerprint, "acme_catalog_x1");
        assert_eq!(changes.url_changed[0].old_url, "https://acme.test/catalog/x1");
        assert_eq!(changes.url_changed[0].new_url, "https://acme.test/de/catalog/x1");
        assert_eq!(changes.new.len(), 1);
        assert_eq!(changes.new[0].fingerprint, "acme_catalog_x2");
        assert_eq!(changes.disappeared.len(), 1);
        assert_eq!(changes.disappeared[0].fingerprint, "acme_catalog_x3");
        assert_eq!(second_oracle.called_fingerprints(), vec!["acme_catalog_x2"]);

        let storage = second.storage();
        let x1 = storage.get_entity("acme_catalog_x1").await.unwrap().unwrap();
        assert_eq!(x1.url, "https://acme.test/de/catalog/x1");
        assert_eq!(x1.url_history.len(), 2);
        assert!(x1.attributes.is_some());
        let x3 = storage.get_entity("acme_catalog_x3").await.unwrap().unwrap();
        assert_eq!(x3.status, EntityStatus::Disappeared);
        let x2 = storage.get_entity("acme_catalog_x2").await.unwrap().unwrap();
        assert!(x2.is_active());
        assert_eq!(report.record.status, RunStatus::Completed);
        assert!(!report.record.degraded);
    }

    #[tokio::test]
    async fn repeated_run_is_all_unchanged() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let pages = ["catalog/a", "catalog/b"];

        let first = coordinator(app_config(), storage, site(&pages), Arc::new(ScriptedOracle::new())).await;
        completed(&first, &RunOptions::default()).await;

        let oracle = Arc::new(ScriptedOracle::new());
        let second = coordinator(app_config(), first.into_storage(), site(&pages), oracle.clone()).await;
        let report = completed(&second, &RunOptions::default()).await;

        assert_eq!(report.record.counts.unchanged, 2);
        assert_eq!(report.record.counts.new, 0);
        assert!(oracle.calls().is_empty());
    }

    #[tokio::test]
    async fn collapsed_crawl_marks_nothing_disappeared() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let pages = ["catalog/a", "catalog/b", "catalog/c", "catalog/d"];

        let first = coordinator(app_config(), storage, site(&pages), Arc::new(ScriptedOracle::new())).await;
        completed(&first, &RunOptions::default()).await;

        // Root page now fails: nothing is discovered.
        let second = coordinator(
            app_config(),
            first.into_storage(),
            SiteFetcher::new(),
            Arc::new(ScriptedOracle::new()),
        )
        .await;
        let report = completed(&second, &RunOptions::default()).await;

        assert!(report.record.degraded);
        assert_eq!(report.record.counts.disappeared, 0);
        assert_eq!(report.record.anomalies.len(), 1);
        assert_eq!(report.record.anomalies[0].previously_active, 4);
        assert_eq!(report.crawl[0].errors.len(), 1);
        let active = second
            .storage()
            .list_entities_by_group("acme")
            .await
            .unwrap()
            .iter()
            .filter(|e| e.is_active())
            .count();
        assert_eq!(active, 4);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_without_recrawl() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let pages = ["catalog/a", "catalog/b", "catalog/c"];

        let cancel = CancellationToken::new();
        let first_oracle = Arc::new(ScriptedOracle::new().cancel_after(1, cancel.clone()));
        let first = coordinator(app_config(), storage, site(&pages), first_oracle).await;
        let outcome = first
            .run(&RunOptions::default(), cancel, &SilentProgress)
            .await
            .unwrap();
        let RunOutcome::Cancelled { run_id: Some(run_id) } = outcome else {
            panic!("expected a resumable cancelled run, got {outcome:?}");
        };

        // The second invocation has no site at all: it must not crawl.
        let oracle = Arc::new(ScriptedOracle::new());
        let second = coordinator(app_config(), first.into_storage(), SiteFetcher::new(), oracle.clone()).await;
        let report = completed(&second, &RunOptions::default()).await;

        assert!(report.resumed);
        assert_eq!(report.record.run_id, run_id);
        assert_eq!(report.record.enrichment.enriched, 3);
        assert_eq!(
            oracle.called_fingerprints(),
            vec!["acme_catalog_b", "acme_catalog_c"]
        );
        assert!(second.storage().unfinished_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_run_abandons_and_carries_pending_items() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let pages = ["catalog/a", "catalog/b"];

        let cancel = CancellationToken::new();
        let first_oracle = Arc::new(ScriptedOracle::new().cancel_after(1, cancel.clone()));
        let first = coordinator(app_config(), storage, site(&pages), first_oracle).await;
        let RunOutcome::Cancelled { run_id: Some(old) } = first
            .run(&RunOptions::default(), cancel, &SilentProgress)
            .await
            .unwrap()
        else {
            panic!("expected a resumable cancelled run");
        };

        let oracle = Arc::new(ScriptedOracle::new());
        let second = coordinator(app_config(), first.into_storage(), site(&pages), oracle.clone()).await;
        let options = RunOptions {
            fresh: true,
            ..Default::default()
        };
        let report = completed(&second, &options).await;

        assert!(!report.resumed);
        assert_ne!(report.record.run_id, old);
        assert_eq!(report.record.counts.unchanged, 2);
        assert_eq!(oracle.called_fingerprints(), vec!["acme_catalog_b"]);
        let old_run = second.storage().get_run(&old).await.unwrap().unwrap();
        assert_eq!(old_run.status, RunStatus::Abandoned);
    }

    #[tokio::test]
    async fn cancellation_during_crawl_writes_nothing() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let coordinator = coordinator(
            app_config(),
            storage,
            site(&["catalog/a"]),
            Arc::new(ScriptedOracle::new()),
        )
        .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = coordinator
            .run(&RunOptions::default(), cancel, &SilentProgress)
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Cancelled { run_id: None }));
        assert!(coordinator.storage().latest_run().await.unwrap().is_none());
        assert!(coordinator.storage().get_entity("acme_catalog_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failures_degrade_run_and_retry_clears_them() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let oracle = Arc::new(
            ScriptedOracle::new()
                .script("acme_catalog_b", vec![Err(EnrichmentError::Terminal("401".into()))]),
        );
        let first = coordinator(app_config(), storage, site(&["catalog/a", "catalog/b"]), oracle).await;
        let report = completed(&first, &RunOptions::default()).await;

        assert!(report.record.degraded);
        assert_eq!(report.record.enrichment.failed, 1);
        assert_eq!(report.failures.len(), 1);
        // Classification is kept despite the failure.
        assert_eq!(report.record.counts.new, 2);

        let healthy = Arc::new(ScriptedOracle::new());
        let second = coordinator(app_config(), first.into_storage(), SiteFetcher::new(), healthy.clone()).await;
        let retry = second
            .retry_failed(CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(retry.attempted, 1);
        assert_eq!(retry.schedule.enriched, 1);
        assert!(retry.remaining.is_empty());
        assert_eq!(healthy.called_fingerprints(), vec!["acme_catalog_b"]);
    }

    #[tokio::test]
    async fn url_changed_reenrichment_is_opt_in() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let mut config = app_config();
        config.extraction.reenrich_url_changed = true;

        let first = coordinator(config.clone(), storage, site(&["catalog/a"]), Arc::new(ScriptedOracle::new())).await;
        completed(&first, &RunOptions::default()).await;

        let oracle = Arc::new(ScriptedOracle::new());
        let second = coordinator(config, first.into_storage(), site(&["de/catalog/a"]), oracle.clone()).await;
        let report = completed(&second, &RunOptions::default()).await;

        assert_eq!(report.record.counts.url_changed, 1);
        assert_eq!(oracle.called_fingerprints(), vec!["acme_catalog_a"]);
    }

    #[tokio::test]
    async fn unknown_group_is_config_error() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let coordinator =
            coordinator(app_config(), storage, SiteFetcher::new(), Arc::new(ScriptedOracle::new())).await;
        let options = RunOptions {
            groups: vec!["nope".into()],
            ..Default::default()
        };
        let err = coordinator
            .run(&options, CancellationToken::new(), &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaCrawlError::Config { .. }));
    }

    #[tokio::test]
    async fn load_report_reads_latest_run() {
        let path = temp_db_path();
        let storage = Storage::open(&path).await.unwrap();
        let first = coordinator(app_config(), storage, site(&["catalog/a"]), Arc::new(ScriptedOracle::new())).await;
        let report = completed(&first, &RunOptions::default()).await;
        first.into_storage().close();

        let readonly = Storage::open_readonly(&path).await.unwrap();
        let loaded = load_report(&readonly, None).await.unwrap().unwrap();
        assert_eq!(loaded.record.run_id, report.record.run_id);
        assert_eq!(loaded.changes[0].new.len(), 1);
        assert!(load_report(&readonly, Some(&RunId::new())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn baseline_records_state_without_enrichment() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let oracle = Arc::new(ScriptedOracle::new());
        let first = coordinator(
            app_config(),
            storage,
            site(&["catalog/a", "catalog/b"]),
            oracle.clone(),
        )
        .await;
        let options = RunOptions {
            baseline: true,
            ..Default::default()
        };
        let report = completed(&first, &options).await;

        assert_eq!(report.record.counts.new, 2);
        assert_eq!(report.record.enrichment.enriched, 0);
        assert!(oracle.calls().is_empty());
        assert!(first.storage().work_items(&report.record.run_id).await.unwrap().is_empty());
        let a = first.storage().get_entity("acme_catalog_a").await.unwrap().unwrap();
        assert!(a.is_active());
        assert!(a.attributes.is_none());

        // Only entities that appear after the baseline get enriched.
        let next_oracle = Arc::new(ScriptedOracle::new());
        let second = coordinator(
            app_config(),
            first.into_storage(),
            site(&["catalog/a", "catalog/b", "catalog/c"]),
            next_oracle.clone(),
        )
        .await;
        let report = completed(&second, &RunOptions::default()).await;
        assert_eq!(report.record.counts.unchanged, 2);
        assert_eq!(next_oracle.called_fingerprints(), vec!["acme_catalog_c"]);
    }

    #[tokio::test]
    async fn baseline_abandons_unfinished_run_without_carrying() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let pages = ["catalog/a", "catalog/b"];

        let cancel = CancellationToken::new();
        let first_oracle = Arc::new(ScriptedOracle::new().cancel_after(1, cancel.clone()));
        let first = coordinator(app_config(), storage, site(&pages), first_oracle).await;
        let RunOutcome::Cancelled { run_id: Some(old) } = first
            .run(&RunOptions::default(), cancel, &SilentProgress)
            .await
            .unwrap()
        else {
            panic!("expected a resumable cancelled run");
        };

        let oracle = Arc::new(ScriptedOracle::new());
        let second = coordinator(app_config(), first.into_storage(), site(&pages), oracle.clone()).await;
        let options = RunOptions {
            baseline: true,
            ..Default::default()
        };
        let report = completed(&second, &options).await;

        assert_ne!(report.record.run_id, old);
        assert!(oracle.calls().is_empty());
        let old_run = second.storage().get_run(&old).await.unwrap().unwrap();
        assert_eq!(old_run.status, RunStatus::Abandoned);
    }

    #[tokio::test]
    async fn kept_query_variants_stay_distinct_entities() {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let mut config = app_config();
        config.source_groups[0].keep_query_params = vec!["variant".into()];

        let oracle = Arc::new(ScriptedOracle::new());
        let coordinator = coordinator(
            config,
            storage,
            site(&["catalog/ix?variant=40", "catalog/ix?variant=50"]),
            oracle.clone(),
        )
        .await;
        let report = completed(&coordinator, &RunOptions::default()).await;

        assert_eq!(report.record.counts.new, 2);
        assert_eq!(
            oracle.called_fingerprints(),
            vec!["acme_catalog_ix_variant_40", "acme_catalog_ix_variant_50"]
        );
        let e = coordinator
            .storage()
            .get_entity("acme_catalog_ix_variant_50")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e.url, "https://acme.test/catalog/ix?variant=50");
    }

    /// acme collapses on the second run while beta loses one entity.
    async fn one_group_collapses_other_reports_disappearance(parallel_groups: bool) {
        let storage = Storage::open(&temp_db_path()).await.unwrap();
        let acme_pages = ["catalog/a", "catalog/b", "catalog/c", "catalog/d"];

        let first_site = with_pages(site(&acme_pages), BETA_ROOT, &["catalog/p", "catalog/q"]);
        let first = coordinator(
            two_group_config(parallel_groups),
            storage,
            first_site,
            Arc::new(ScriptedOracle::new()),
        )
        .await;
        let report = completed(&first, &RunOptions::default()).await;
        assert_eq!(report.record.counts.new, 6);
        let crawled: Vec<&str> = report.crawl.iter().map(|c| c.source_group.as_str()).collect();
        assert_eq!(crawled, vec!["acme", "beta"]);

        // acme's root is gone; beta still serves p.
        let second_site = with_pages(SiteFetcher::new(), BETA_ROOT, &["catalog/p"]);
        let second = coordinator(
            two_group_config(parallel_groups),
            first.into_storage(),
            second_site,
            Arc::new(ScriptedOracle::new()),
        )
        .await;
        let report = completed(&second, &RunOptions::default()).await;

        assert!(report.record.degraded);
        assert_eq!(report.record.anomalies.len(), 1);
        assert_eq!(report.record.anomalies[0].source_group, "acme");
        assert_eq!(report.record.counts.disappeared, 1);
        assert_eq!(report.record.counts.unchanged, 1);

        let crawled: Vec<&str> = report.crawl.iter().map(|c| c.source_group.as_str()).collect();
        assert_eq!(crawled, vec!["acme", "beta"]);
        assert_eq!(report.crawl[0].errors.len(), 1);
        assert_eq!(report.crawl[1].candidates, 1);

        let acme = report.changes.iter().find(|c| c.source_group == "acme").unwrap();
        assert!(acme.anomaly.is_some());
        assert!(acme.disappeared.is_empty());
        let beta = report.changes.iter().find(|c| c.source_group == "beta").unwrap();
        assert!(beta.anomaly.is_none());
        assert_eq!(beta.disappeared.len(), 1);
        assert_eq!(beta.disappeared[0].fingerprint, "beta_catalog_q");

        let storage = second.storage();
        let q = storage.get_entity("beta_catalog_q").await.unwrap().unwrap();
        assert_eq!(q.status, EntityStatus::Disappeared);
        let a = storage.get_entity("acme_catalog_a").await.unwrap().unwrap();
        assert!(a.is_active());
    }

    #[tokio::test]
    async fn parallel_groups_keep_order_and_guard_per_group() {
        one_group_collapses_other_reports_disappearance(true).await;
    }

    #[tokio::test]
    async fn sequential_groups_keep_order_and_guard_per_group() {
        one_group_collapses_other_reports_disappearance(false).await;
    }
}
