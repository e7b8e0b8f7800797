//! Shared types, error model, and configuration for deltacrawl.
//!
//! This crate is the foundation depended on by all other deltacrawl crates.
//! It provides:
//! - [`DeltaCrawlError`], the unified error type
//! - Domain types ([`Entity`], [`RunRecord`], [`RunId`]) and classification
//!   results ([`GroupChanges`], [`WorkItem`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], config loading)

pub mod changes;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use changes::{
    ChangeKind, CoverageAnomaly, DisappearedEntry, GroupChanges, NewEntry, UnchangedEntry,
    UrlChange, WorkItem,
};
pub use config::{
    AppConfig, BridgeConfig, CrawlConfig, CrawlSettings, DefaultsConfig, DetectionConfig,
    ExtractionConfig, SourceGroupConfig, config_dir, config_file_path, init_config,
    init_config_at, load_config, load_config_from, validate_config,
};
pub use error::{DeltaCrawlError, Result};
pub use types::{
    Attributes, ChangeCounts, Entity, EntityStatus, EnrichmentTotals, RunId, RunRecord,
    RunStatus, SourceGroupState, UrlHistoryEntry,
};
