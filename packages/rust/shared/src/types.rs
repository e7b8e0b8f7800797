//! Core domain types: tracked entities, source groups, and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::changes::CoverageAnomaly;
use crate::error::{DeltaCrawlError, Result};

/// Opaque attribute record produced by enrichment.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Lifecycle status of a tracked entity. Entities are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Disappeared,
}

impl EntityStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disappeared => "disappeared",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "disappeared" => Ok(Self::Disappeared),
            other => Err(DeltaCrawlError::validation(format!(
                "unknown entity status '{other}'"
            ))),
        }
    }
}

/// One entry of an entity's append-only URL history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlHistoryEntry {
    pub url: String,
    pub recorded_at: DateTime<Utc>,
}

/// One trackable catalog item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier, immutable once assigned.
    pub fingerprint: String,
    /// Slug of the owning source group.
    pub source_group: String,
    /// Current canonical location.
    pub url: String,
    /// Ordered URL history, oldest first. Only ever appended to.
    #[serde(default)]
    pub url_history: Vec<UrlHistoryEntry>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_url_change: Option<DateTime<Utc>>,
    pub status: EntityStatus,
    /// Populated only after a successful enrichment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_at: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }
}

// ---------------------------------------------------------------------------
// SourceGroup bookkeeping
// ---------------------------------------------------------------------------

/// Persisted bookkeeping for a source group (configuration lives in
/// [`crate::SourceGroupConfig`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceGroupState {
    pub slug: String,
    pub name: String,
    pub root_url: String,
    pub first_crawled: Option<DateTime<Utc>>,
    pub last_crawled: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Classification committed, enrichment pending or in progress.
    Enriching,
    /// Finalized; a RunRecord exists.
    Completed,
    /// Superseded by a fresh run before it finished.
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enriching => "enriching",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "enriching" => Ok(Self::Enriching),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(DeltaCrawlError::validation(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// Counts produced by classification for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub new: usize,
    pub reappeared: usize,
    pub url_changed: usize,
    pub disappeared: usize,
    pub unchanged: usize,
}

/// Enrichment totals for a run (accumulated across resumes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentTotals {
    pub enriched: usize,
    pub failed: usize,
    pub skipped: usize,
    pub units: u64,
    pub cost_usd: f64,
}

/// Immutable record of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: ChangeCounts,
    pub enrichment: EnrichmentTotals,
    /// Active work time in milliseconds (excludes downtime between resumes).
    pub duration_ms: u64,
    /// Set when a group's Disappeared classification was suppressed or
    /// enrichment left permanent failures behind.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<CoverageAnomaly>,
}
