//! Throttled, retried, checkpointed enrichment of queued work items.
//!
//! Groups are processed one after another with at most one call in flight.
//! Outcomes are buffered and flushed to storage every `checkpoint_every`
//! successes, on cancellation, and at the end; fingerprints that already
//! have a checkpoint row for the run are skipped.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use deltacrawl_shared::{ExtractionConfig, Result, RunId, WorkItem};
use deltacrawl_storage::{CheckpointEntry, CheckpointOutcome, Storage};

use crate::clock::Clock;
use crate::oracle::{Enrichment, EnrichmentError, EnrichmentOracle, EnrichmentRequest};
use crate::progress::ProgressReporter;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What one scheduler pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleReport {
    pub enriched: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Items that already had a checkpoint row and were not called again.
    pub already_done: usize,
    pub units: u64,
    pub cost_usd: f64,
    /// Oracle calls made, retries included.
    pub calls: usize,
    pub cancelled: bool,
}

/// Terminal result for one item within this pass.
enum ItemOutcome {
    Enriched(Enrichment),
    Failed { error: EnrichmentError, attempts: u32 },
    Skipped(String),
    /// Cancelled mid-backoff; the item stays pending.
    Interrupted,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct ExtractionScheduler<'a> {
    oracle: &'a dyn EnrichmentOracle,
    storage: &'a Storage,
    clock: &'a dyn Clock,
    config: &'a ExtractionConfig,
}

/// Mutable state for a single pass.
struct Pass<'r> {
    run_id: Option<&'r RunId>,
    buffer: Vec<CheckpointEntry>,
    successes_since_flush: usize,
    last_call: Option<DateTime<Utc>>,
    report: ScheduleReport,
}

impl<'a> ExtractionScheduler<'a> {
    pub fn new(
        oracle: &'a dyn EnrichmentOracle,
        storage: &'a Storage,
        clock: &'a dyn Clock,
        config: &'a ExtractionConfig,
    ) -> Self {
        Self {
            oracle,
            storage,
            clock,
            config,
        }
    }

    /// Enrich `items` in order. With `run_id = None` the pass retries the
    /// permanent-failure bucket outside any run: no checkpoint rows, no
    /// run totals.
    #[instrument(skip_all, fields(items = items.len(), run_id = ?run_id))]
    pub async fn run(
        &self,
        run_id: Option<&RunId>,
        items: &[WorkItem],
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<ScheduleReport> {
        let done: HashSet<String> = match run_id {
            Some(id) => self
                .storage
                .completed_fingerprints(id)
                .await?
                .into_iter()
                .collect(),
            None => HashSet::new(),
        };
        let pending: Vec<&WorkItem> = items
            .iter()
            .filter(|i| !done.contains(&i.fingerprint))
            .collect();

        let mut pass = Pass {
            run_id,
            buffer: Vec::new(),
            successes_since_flush: 0,
            last_call: None,
            report: ScheduleReport {
                already_done: items.len() - pending.len(),
                ..Default::default()
            },
        };
        if pass.report.already_done > 0 {
            info!(skipped = pass.report.already_done, "resuming past checkpointed items");
        }

        let total = pending.len();
        let mut position = 0;

        'groups: for (group_index, (group, group_items)) in by_group(&pending).into_iter().enumerate()
        {
            if group_index > 0
                && !self
                    .wait(self.config.delay_between_groups(), cancel)
                    .await
            {
                pass.report.cancelled = true;
                break 'groups;
            }
            debug!(group = %group, items = group_items.len(), "enriching group");

            for (item_index, item) in group_items.into_iter().enumerate() {
                if cancel.is_cancelled()
                    || (item_index > 0
                        && !self.wait(self.config.delay_between_calls(), cancel).await)
                {
                    pass.report.cancelled = true;
                    break 'groups;
                }

                let outcome = self.enrich_with_retry(item, &mut pass, cancel).await;
                if matches!(outcome, ItemOutcome::Interrupted) {
                    pass.report.cancelled = true;
                    break 'groups;
                }

                position += 1;
                self.record(item, outcome, &mut pass).await?;
                progress.entity_enriched(&item.fingerprint, position, total);
            }
        }

        self.flush(&mut pass).await?;

        let report = pass.report;
        info!(
            enriched = report.enriched,
            failed = report.failed,
            skipped = report.skipped,
            units = report.units,
            cancelled = report.cancelled,
            "enrichment pass finished"
        );
        Ok(report)
    }

    async fn enrich_with_retry(
        &self,
        item: &WorkItem,
        pass: &mut Pass<'_>,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let request = match EnrichmentRequest::from_work_item(item, attempt) {
                Ok(request) => request,
                Err(error) => return ItemOutcome::Failed { error, attempts: attempt },
            };

            if !self.throttle(pass, cancel).await {
                return ItemOutcome::Interrupted;
            }
            pass.report.calls += 1;

            let timeout = self.config.call_timeout();
            let result = match tokio::time::timeout(timeout, self.oracle.enrich(&request)).await {
                Ok(result) => result,
                Err(_) => Err(EnrichmentError::Timeout(timeout)),
            };

            match result {
                Ok(enrichment) => return ItemOutcome::Enriched(enrichment),
                Err(EnrichmentError::NotApplicable(reason)) => return ItemOutcome::Skipped(reason),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let computed = self.config.backoff(attempt);
                    let delay = match error.retry_after() {
                        Some(hint) if hint > computed => hint,
                        _ => computed,
                    };
                    warn!(
                        fingerprint = %item.fingerprint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "enrichment attempt failed, backing off"
                    );
                    if !self.wait(delay, cancel).await {
                        return ItemOutcome::Interrupted;
                    }
                }
                Err(error) => {
                    return ItemOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }

        // max_attempts >= 1 and the last attempt always returns above.
        ItemOutcome::Interrupted
    }

    async fn record(&self, item: &WorkItem, outcome: ItemOutcome, pass: &mut Pass<'_>) -> Result<()> {
        let entry = match outcome {
            ItemOutcome::Enriched(enrichment) => {
                pass.report.enriched += 1;
                pass.report.units += enrichment.units;
                pass.report.cost_usd += enrichment.cost_usd;
                pass.successes_since_flush += 1;
                CheckpointEntry {
                    item: item.clone(),
                    units: enrichment.units,
                    cost_usd: enrichment.cost_usd,
                    outcome: CheckpointOutcome::Enriched(enrichment.attributes),
                }
            }
            ItemOutcome::Failed { error, attempts } => {
                pass.report.failed += 1;
                warn!(fingerprint = %item.fingerprint, url = %item.url, attempts, error = %error, "enrichment failed permanently");
                CheckpointEntry {
                    item: item.clone(),
                    units: 0,
                    cost_usd: 0.0,
                    outcome: CheckpointOutcome::Failed {
                        error: error.to_string(),
                        attempts,
                    },
                }
            }
            ItemOutcome::Skipped(reason) => {
                pass.report.skipped += 1;
                info!(fingerprint = %item.fingerprint, url = %item.url, %reason, "skipping entity");
                CheckpointEntry {
                    item: item.clone(),
                    units: 0,
                    cost_usd: 0.0,
                    outcome: CheckpointOutcome::Skipped { reason },
                }
            }
            ItemOutcome::Interrupted => return Ok(()),
        };

        pass.buffer.push(entry);
        if pass.successes_since_flush >= self.config.checkpoint_every.max(1) {
            self.flush(pass).await?;
        }
        Ok(())
    }

    async fn flush(&self, pass: &mut Pass<'_>) -> Result<()> {
        if pass.buffer.is_empty() {
            return Ok(());
        }
        self.storage
            .flush_checkpoint(pass.run_id, &pass.buffer, self.clock.now())
            .await?;
        debug!(entries = pass.buffer.len(), "checkpoint written");
        pass.buffer.clear();
        pass.successes_since_flush = 0;
        Ok(())
    }

    /// Enforce the global minimum interval between any two calls.
    async fn throttle(&self, pass: &mut Pass<'_>, cancel: &CancellationToken) -> bool {
        let min = self.config.global_min_interval();
        if let Some(last) = pass.last_call {
            let elapsed = (self.clock.now() - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < min && !self.wait(min - elapsed, cancel).await {
                return false;
            }
        }
        pass.last_call = Some(self.clock.now());
        true
    }

    /// Sleep on the clock unless cancelled first. Returns false on cancel.
    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.clock.sleep(duration) => !cancel.is_cancelled(),
        }
    }
}

/// Split items into per-group runs, keeping first-appearance order.
fn by_group<'i>(items: &[&'i WorkItem]) -> Vec<(String, Vec<&'i WorkItem>)> {
    let mut groups: Vec<(String, Vec<&'i WorkItem>)> = Vec::new();
    for &item in items {
        match groups.iter_mut().find(|(slug, _)| *slug == item.source_group) {
            Some((_, bucket)) => bucket.push(item),
            None => groups.push((item.source_group.clone(), vec![item])),
        }
    }
    groups
}
