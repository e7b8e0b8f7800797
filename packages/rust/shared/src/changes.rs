//! Classification results shared between the detector, the state store, and
//! the enrichment scheduler.

use serde::{Deserialize, Serialize};

/// A fingerprint seen for the first time, or seen again after it had
/// disappeared (`reappeared`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub fingerprint: String,
    pub url: String,
    #[serde(default)]
    pub reappeared: bool,
}

/// A known active fingerprint discovered at a different URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlChange {
    pub fingerprint: String,
    pub old_url: String,
    pub new_url: String,
}

/// A known active fingerprint discovered at its stored URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnchangedEntry {
    pub fingerprint: String,
    pub url: String,
}

/// A known active fingerprint absent from this run's discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisappearedEntry {
    pub fingerprint: String,
    pub url: String,
}

/// Raw counts preserved when a group's discovered set collapsed below the
/// coverage threshold and its Disappeared classification was suppressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAnomaly {
    pub source_group: String,
    pub discovered: usize,
    pub previously_active: usize,
    pub min_coverage: f64,
    /// Fingerprints that would have been marked disappeared.
    pub suppressed: usize,
}

/// Disjoint classification of one source group for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupChanges {
    pub source_group: String,
    pub new: Vec<NewEntry>,
    pub url_changed: Vec<UrlChange>,
    pub unchanged: Vec<UnchangedEntry>,
    pub disappeared: Vec<DisappearedEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<CoverageAnomaly>,
}

impl GroupChanges {
    pub fn new(source_group: impl Into<String>) -> Self {
        Self {
            source_group: source_group.into(),
            ..Default::default()
        }
    }

    pub fn reappeared_count(&self) -> usize {
        self.new.iter().filter(|n| n.reappeared).count()
    }

    /// Total fingerprints that received any classification.
    pub fn classified_count(&self) -> usize {
        self.new.len() + self.url_changed.len() + self.unchanged.len() + self.disappeared.len()
    }
}

/// The kind of a persisted classification row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    UrlChanged,
    Unchanged,
    Disappeared,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::UrlChanged => "url_changed",
            Self::Unchanged => "unchanged",
            Self::Disappeared => "disappeared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "url_changed" => Some(Self::UrlChanged),
            "unchanged" => Some(Self::Unchanged),
            "disappeared" => Some(Self::Disappeared),
            _ => None,
        }
    }
}

/// One entity queued for enrichment within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub fingerprint: String,
    pub source_group: String,
    pub url: String,
    #[serde(default)]
    pub reappeared: bool,
}
