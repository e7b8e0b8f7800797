//! New / UrlChanged / Unchanged / Disappeared classification of one source
//! group's discovery against the stored entities.

use std::collections::{BTreeMap, HashMap};

use deltacrawl_shared::{
    CoverageAnomaly, DetectionConfig, DisappearedEntry, Entity, EntityStatus, GroupChanges,
    NewEntry, UnchangedEntry, UrlChange,
};

// ---------------------------------------------------------------------------
// Coverage policy
// ---------------------------------------------------------------------------

/// Guard against a collapsed crawl wiping out a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoveragePolicy {
    /// Minimum share of previously active entities that must be rediscovered
    /// before anything may be classified as disappeared.
    pub min_coverage: f64,
}

impl Default for CoveragePolicy {
    fn default() -> Self {
        Self { min_coverage: 0.5 }
    }
}

impl From<&DetectionConfig> for CoveragePolicy {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            min_coverage: config.min_coverage,
        }
    }
}

impl CoveragePolicy {
    /// True when `discovered` fingerprints are too few relative to
    /// `previously_active` to trust absences.
    pub fn is_below(&self, discovered: usize, previously_active: usize) -> bool {
        previously_active > 0 && (discovered as f64) < self.min_coverage * previously_active as f64
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// A discovered (fingerprint, url) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub fingerprint: String,
    pub url: String,
}

impl Discovered {
    pub fn new(fingerprint: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            url: url.into(),
        }
    }
}

/// Classify one group's discovery against its stored entities. Pure.
///
/// The result does not depend on the order of `discovered`: when several
/// URLs share a fingerprint, the stored URL wins if present, otherwise the
/// lexicographically smallest. Every list is sorted by fingerprint.
pub fn classify(
    source_group: &str,
    discovered: &[Discovered],
    existing: &[Entity],
    policy: &CoveragePolicy,
) -> GroupChanges {
    let existing_by_fp: HashMap<&str, &Entity> = existing
        .iter()
        .map(|e| (e.fingerprint.as_str(), e))
        .collect();

    // fingerprint -> chosen url
    let mut found: BTreeMap<&str, &str> = BTreeMap::new();
    for item in discovered {
        let stored = existing_by_fp
            .get(item.fingerprint.as_str())
            .map(|e| e.url.as_str());
        found
            .entry(item.fingerprint.as_str())
            .and_modify(|current| {
                let holds_stored = stored == Some(*current);
                let candidate = item.url.as_str();
                if !holds_stored && (stored == Some(candidate) || candidate < *current) {
                    *current = candidate;
                }
            })
            .or_insert(item.url.as_str());
    }

    let mut changes = GroupChanges::new(source_group);

    for (&fingerprint, &url) in &found {
        match existing_by_fp.get(fingerprint) {
            None => changes.new.push(NewEntry {
                fingerprint: fingerprint.to_string(),
                url: url.to_string(),
                reappeared: false,
            }),
            Some(entity) if entity.status == EntityStatus::Disappeared => {
                changes.new.push(NewEntry {
                    fingerprint: fingerprint.to_string(),
                    url: url.to_string(),
                    reappeared: true,
                })
            }
            Some(entity) if entity.url == url => changes.unchanged.push(UnchangedEntry {
                fingerprint: fingerprint.to_string(),
                url: url.to_string(),
            }),
            Some(entity) => changes.url_changed.push(UrlChange {
                fingerprint: fingerprint.to_string(),
                old_url: entity.url.clone(),
                new_url: url.to_string(),
            }),
        }
    }

    let mut absent: Vec<DisappearedEntry> = existing
        .iter()
        .filter(|e| e.is_active() && !found.contains_key(e.fingerprint.as_str()))
        .map(|e| DisappearedEntry {
            fingerprint: e.fingerprint.clone(),
            url: e.url.clone(),
        })
        .collect();
    absent.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

    let previously_active = existing.iter().filter(|e| e.is_active()).count();
    if policy.is_below(found.len(), previously_active) {
        changes.anomaly = Some(CoverageAnomaly {
            source_group: source_group.to_string(),
            discovered: found.len(),
            previously_active,
            min_coverage: policy.min_coverage,
            suppressed: absent.len(),
        });
    } else {
        changes.disappeared = absent;
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deltacrawl_shared::UrlHistoryEntry;

    fn entity(fp: &str, url: &str, status: EntityStatus) -> Entity {
        let now = Utc::now();
        Entity {
            fingerprint: fp.into(),
            source_group: "bmw".into(),
            url: url.into(),
            url_history: vec![UrlHistoryEntry {
                url: url.into(),
                recorded_at: now,
            }],
            first_seen: now,
            last_seen: now,
            last_url_change: None,
            status,
            attributes: None,
            enriched_at: None,
        }
    }

    fn policy() -> CoveragePolicy {
        CoveragePolicy::default()
    }

    #[test]
    fn classifies_scenario() {
        let existing = vec![
            entity("f1", "A", EntityStatus::Active),
            entity("f3", "D", EntityStatus::Active),
        ];
        let discovered = vec![Discovered::new("f2", "C"), Discovered::new("f1", "B")];

        let changes = classify("bmw", &discovered, &existing, &policy());

        assert_eq!(
            changes.url_changed,
            vec![UrlChange {
                fingerprint: "f1".into(),
                old_url: "A".into(),
                new_url: "B".into(),
            }]
        );
        assert_eq!(
            changes.new,
            vec![NewEntry {
                fingerprint: "f2".into(),
                url: "C".into(),
                reappeared: false,
            }]
        );
        assert_eq!(changes.disappeared.len(), 1);
        assert_eq!(changes.disappeared[0].fingerprint, "f3");
        assert!(changes.unchanged.is_empty());
        assert!(changes.anomaly.is_none());
    }

    #[test]
    fn identical_discovery_is_unchanged() {
        let existing = vec![
            entity("f1", "A", EntityStatus::Active),
            entity("f2", "B", EntityStatus::Active),
        ];
        let discovered = vec![Discovered::new("f1", "A"), Discovered::new("f2", "B")];

        let changes = classify("bmw", &discovered, &existing, &policy());
        assert_eq!(changes.unchanged.len(), 2);
        assert_eq!(changes.classified_count(), 2);
    }

    #[test]
    fn disappeared_entity_reappears_as_new() {
        let existing = vec![
            entity("f1", "A", EntityStatus::Disappeared),
            entity("f9", "Z", EntityStatus::Disappeared),
        ];
        let discovered = vec![Discovered::new("f1", "A2")];

        let changes = classify("bmw", &discovered, &existing, &policy());
        assert_eq!(changes.new.len(), 1);
        assert!(changes.new[0].reappeared);
        assert_eq!(changes.new[0].url, "A2");
        // f9 stays disappeared and is not reported again.
        assert!(changes.disappeared.is_empty());
        assert_eq!(changes.reappeared_count(), 1);
    }

    #[test]
    fn duplicate_fingerprints_resolve_independent_of_order() {
        let existing = vec![entity("f1", "https://x/b", EntityStatus::Active)];
        let a = vec![
            Discovered::new("f1", "https://x/c"),
            Discovered::new("f1", "https://x/b"),
            Discovered::new("f2", "https://x/z"),
            Discovered::new("f2", "https://x/y"),
        ];
        let mut b = a.clone();
        b.reverse();

        let first = classify("bmw", &a, &existing, &policy());
        let second = classify("bmw", &b, &existing, &policy());
        assert_eq!(first, second);
        // Stored URL wins for f1, smallest URL for f2.
        assert_eq!(first.unchanged[0].url, "https://x/b");
        assert_eq!(first.new[0].url, "https://x/y");
    }

    #[test]
    fn outputs_sorted_by_fingerprint() {
        let discovered = vec![
            Discovered::new("c", "3"),
            Discovered::new("a", "1"),
            Discovered::new("b", "2"),
        ];
        let changes = classify("bmw", &discovered, &[], &policy());
        let fps: Vec<_> = changes.new.iter().map(|n| n.fingerprint.as_str()).collect();
        assert_eq!(fps, ["a", "b", "c"]);
    }

    #[test]
    fn coverage_guard_suppresses_disappeared() {
        let existing: Vec<_> = (0..10)
            .map(|i| entity(&format!("f{i}"), &format!("u{i}"), EntityStatus::Active))
            .collect();
        let discovered = vec![Discovered::new("f0", "u0"), Discovered::new("f1", "u1")];

        let changes = classify("bmw", &discovered, &existing, &policy());
        assert!(changes.disappeared.is_empty());
        let anomaly = changes.anomaly.expect("anomaly recorded");
        assert_eq!(anomaly.discovered, 2);
        assert_eq!(anomaly.previously_active, 10);
        assert_eq!(anomaly.suppressed, 8);
        assert_eq!(changes.unchanged.len(), 2);
    }

    #[test]
    fn coverage_guard_at_threshold_allows_disappeared() {
        let existing: Vec<_> = (0..4)
            .map(|i| entity(&format!("f{i}"), &format!("u{i}"), EntityStatus::Active))
            .collect();
        let discovered = vec![Discovered::new("f0", "u0"), Discovered::new("f1", "u1")];

        let changes = classify("bmw", &discovered, &existing, &policy());
        assert!(changes.anomaly.is_none());
        assert_eq!(changes.disappeared.len(), 2);
    }

    #[test]
    fn empty_store_never_anomalous() {
        assert!(!policy().is_below(0, 0));
        let changes = classify("bmw", &[], &[], &policy());
        assert!(changes.anomaly.is_none());
        assert_eq!(changes.classified_count(), 0);
    }
}
