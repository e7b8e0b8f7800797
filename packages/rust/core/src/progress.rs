//! Progress callbacks for long-running pipeline phases.

use deltacrawl_crawler::CrawlReport;

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when one source group's crawl has finished.
    fn group_crawled(&self, report: &CrawlReport);
    /// Called after each enrichment outcome.
    fn entity_enriched(&self, fingerprint: &str, current: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn group_crawled(&self, _report: &CrawlReport) {}
    fn entity_enriched(&self, _fingerprint: &str, _current: usize, _total: usize) {}
}
