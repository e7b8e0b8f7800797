//! In-memory fakes shared by the scheduler and coordinator tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use url::Url;

use deltacrawl_crawler::{FetchError, FetchedPage, Fetcher};
use deltacrawl_shared::{
    Attributes, GroupChanges, NewEntry, RunId, SourceGroupState, WorkItem,
};
use deltacrawl_storage::{ClassificationCommit, Storage};

use crate::oracle::{Enrichment, EnrichmentError, EnrichmentOracle, EnrichmentRequest};

pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("deltacrawl-core-{}.db", uuid::Uuid::now_v7()))
}

pub async fn temp_storage() -> (Storage, PathBuf) {
    let path = temp_db_path();
    let storage = Storage::open(&path).await.unwrap();
    (storage, path)
}

pub fn work_item(group: &str, fp: &str) -> WorkItem {
    WorkItem {
        fingerprint: fp.into(),
        source_group: group.into(),
        url: format!("https://{group}.test/{fp}"),
        reappeared: false,
    }
}

/// Commit a run whose classification is "everything in `items` is new".
pub async fn seed_run(storage: &Storage, items: &[WorkItem]) -> RunId {
    let run_id = RunId::new();
    let now = Utc::now();

    let mut groups: Vec<String> = items.iter().map(|i| i.source_group.clone()).collect();
    groups.sort();
    groups.dedup();
    let states: Vec<SourceGroupState> = groups
        .iter()
        .map(|slug| SourceGroupState {
            slug: slug.clone(),
            name: slug.clone(),
            root_url: format!("https://{slug}.test/"),
            first_crawled: Some(now),
            last_crawled: Some(now),
        })
        .collect();
    let changes: Vec<GroupChanges> = groups
        .iter()
        .map(|slug| {
            let mut changes = GroupChanges::new(slug.clone());
            changes.new = items
                .iter()
                .filter(|i| &i.source_group == slug)
                .map(|i| NewEntry {
                    fingerprint: i.fingerprint.clone(),
                    url: i.url.clone(),
                    reappeared: false,
                })
                .collect();
            changes
        })
        .collect();

    storage
        .commit_classification(&ClassificationCommit {
            run_id: &run_id,
            started_at: now,
            now,
            source_groups: &states,
            changes: &changes,
            work_items: items,
            anomalies: &[],
            duration_ms: 0,
            supersedes: None,
        })
        .await
        .unwrap();
    run_id
}

// ---------------------------------------------------------------------------
// Oracle fake
// ---------------------------------------------------------------------------

/// Oracle answering from per-fingerprint scripts; unscripted calls succeed.
#[derive(Default)]
pub struct ScriptedOracle {
    scripts: Mutex<HashMap<String, VecDeque<std::result::Result<Enrichment, EnrichmentError>>>>,
    calls: Mutex<Vec<(String, u32)>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        self,
        fingerprint: &str,
        replies: Vec<std::result::Result<Enrichment, EnrichmentError>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(fingerprint.into(), replies.into());
        self
    }

    /// Cancel `token` once `calls` calls have been answered.
    pub fn cancel_after(self, calls: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((calls, token));
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_fingerprints(&self) -> Vec<String> {
        self.calls().into_iter().map(|(fp, _)| fp).collect()
    }
}

pub fn enrichment_for(fingerprint: &str) -> Enrichment {
    let mut attributes = Attributes::new();
    attributes.insert("fingerprint".into(), fingerprint.into());
    Enrichment {
        attributes,
        units: 10,
        cost_usd: 0.00001,
    }
}

#[async_trait]
impl EnrichmentOracle for ScriptedOracle {
    async fn enrich(
        &self,
        request: &EnrichmentRequest,
    ) -> std::result::Result<Enrichment, EnrichmentError> {
        let answered = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((request.fingerprint.clone(), request.attempt));
            calls.len()
        };

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.fingerprint)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(enrichment_for(&request.fingerprint)));

        if let Some((limit, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if answered >= *limit {
                token.cancel();
            }
        }
        reply
    }
}

// ---------------------------------------------------------------------------
// Fetcher fake
// ---------------------------------------------------------------------------

/// Serves a fixed link graph; unknown URLs fail terminally.
#[derive(Default)]
pub struct SiteFetcher {
    pages: HashMap<String, Vec<String>>,
}

impl SiteFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, links: &[&str]) -> Self {
        self.pages
            .insert(url.into(), links.iter().map(|l| l.to_string()).collect());
        self
    }
}

#[async_trait]
impl Fetcher for SiteFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError> {
        let links = self
            .pages
            .get(url.as_str())
            .ok_or_else(|| FetchError::terminal(url, "HTTP 404"))?;
        Ok(FetchedPage {
            url: url.clone(),
            status: 200,
            html: String::new(),
            links: links.iter().filter_map(|l| Url::parse(l).ok()).collect(),
        })
    }
}
