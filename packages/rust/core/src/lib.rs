//! Change detection and incremental enrichment for deltacrawl.
//!
//! Ties the crawler and the state store together into resumable runs:
//! fingerprinting, New/UrlChanged/Disappeared classification, and the
//! throttled enrichment scheduler.

pub mod clock;
pub mod coordinator;
pub mod detector;
pub mod fingerprint;
pub mod oracle;
pub mod progress;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{RetryReport, RunCoordinator, RunOptions, RunOutcome, RunReport, load_report};
pub use detector::{CoveragePolicy, Discovered, classify};
pub use fingerprint::{DEFAULT_NOISE_TOKENS, FingerprintEngine};
pub use oracle::bridge::BridgeOracle;
pub use oracle::{Enrichment, EnrichmentError, EnrichmentOracle, EnrichmentRequest, parse_attributes};
pub use progress::{ProgressReporter, SilentProgress};
pub use scheduler::{ExtractionScheduler, ScheduleReport};
