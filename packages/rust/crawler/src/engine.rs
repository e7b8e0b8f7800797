//! Pattern-bounded crawl engine.
//!
//! The crawler starts from a source group's seeds, performs BFS traversal one
//! depth level at a time, and streams every visited URL that passes the
//! group's include/exclude globs to the consumer through a bounded channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use deltacrawl_shared::{CrawlConfig, DeltaCrawlError, Result};

use crate::fetch::{FetchError, FetchedPage, Fetcher};
use crate::scope::{PatternSet, is_visited, matches_include_exclude, normalize_url, should_follow};

/// Candidates buffered between the crawl task and its consumer.
const CANDIDATE_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// CrawlReport
// ---------------------------------------------------------------------------

/// Summary of a completed (or cancelled) crawl of one source group.
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    /// Source group slug.
    pub source_group: String,
    /// Number of pages successfully fetched.
    pub pages_fetched: usize,
    /// Number of candidate URLs emitted.
    pub candidates: usize,
    /// Links dropped as duplicates of an already-visited URL.
    pub pages_skipped: usize,
    /// Fetch failures (URL, error message).
    pub errors: Vec<(String, String)>,
    /// Total duration of the crawl.
    pub duration: Duration,
    /// The crawl stopped early on a cancellation request.
    pub cancelled: bool,
    /// The visited set reached `max_pages`.
    pub truncated: bool,
}

// ---------------------------------------------------------------------------
// CandidateStream
// ---------------------------------------------------------------------------

/// Lazy sequence of deduplicated candidate URLs produced by a running crawl.
pub struct CandidateStream {
    rx: mpsc::Receiver<Url>,
    handle: JoinHandle<CrawlReport>,
}

impl CandidateStream {
    /// Next candidate, or `None` once the crawl has finished.
    pub async fn next(&mut self) -> Option<Url> {
        self.rx.recv().await
    }

    /// Stop consuming and wait for the crawl report. Candidates not yet
    /// received are discarded and the crawl stops at its next emission.
    pub async fn finish(self) -> Result<CrawlReport> {
        drop(self.rx);
        self.handle
            .await
            .map_err(|e| DeltaCrawlError::Network(format!("crawl task failed: {e}")))
    }

    /// Drain every candidate, then return them with the report.
    pub async fn collect_all(mut self) -> Result<(Vec<Url>, CrawlReport)> {
        let mut candidates = Vec::new();
        while let Some(url) = self.next().await {
            candidates.push(url);
        }
        let report = self.finish().await?;
        Ok((candidates, report))
    }
}

// ---------------------------------------------------------------------------
// PatternCrawler
// ---------------------------------------------------------------------------

/// Depth-bounded, pattern-filtered crawler for one source group.
///
/// Cheap to clone; every [`start`](Self::start) begins a fresh traversal.
#[derive(Clone)]
pub struct PatternCrawler {
    config: Arc<CrawlConfig>,
    patterns: Arc<PatternSet>,
    fetcher: Arc<dyn Fetcher>,
}

impl PatternCrawler {
    /// Compile the group's patterns. Invalid globs fail here, before any fetch.
    pub fn new(config: CrawlConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let patterns = PatternSet::compile(&config.include_patterns, &config.exclude_patterns)
            .map_err(|e| match e {
                DeltaCrawlError::Config { message } => {
                    DeltaCrawlError::config(format!("source group '{}': {message}", config.slug))
                }
                other => other,
            })?;

        Ok(Self {
            config: Arc::new(config),
            patterns: Arc::new(patterns),
            fetcher,
        })
    }

    pub fn slug(&self) -> &str {
        &self.config.slug
    }

    /// Spawn the crawl and return its candidate stream.
    pub fn start(&self, cancel: CancellationToken) -> CandidateStream {
        let (tx, rx) = mpsc::channel(CANDIDATE_BUFFER);
        let crawler = self.clone();
        let handle = tokio::spawn(async move { crawler.run(tx, cancel).await });
        CandidateStream { rx, handle }
    }

    /// Hosts links may stay on: the root's and every seed's.
    fn allowed_hosts(&self) -> HashSet<String> {
        std::iter::once(&self.config.root)
            .chain(self.config.seeds.iter())
            .filter_map(|u| u.host_str())
            .map(|h| h.to_ascii_lowercase())
            .collect()
    }

    #[instrument(skip_all, fields(group = %self.config.slug))]
    async fn run(self, tx: mpsc::Sender<Url>, cancel: CancellationToken) -> CrawlReport {
        let start_time = Instant::now();
        let config = &self.config;

        let mut report = CrawlReport {
            source_group: config.slug.clone(),
            ..Default::default()
        };

        let hosts = self.allowed_hosts();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1) as usize));
        let throttle = Arc::new(HostThrottle::new(Duration::from_millis(
            config.rate_limit_ms,
        )));
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: Vec<Url> = config.seeds.clone();

        info!(
            seeds = config.seeds.len(),
            depth = config.depth,
            concurrency = config.concurrency,
            rate_limit_ms = config.rate_limit_ms,
            "starting crawl"
        );

        'levels: for depth in 0..=config.depth {
            if frontier.is_empty() {
                break;
            }

            // Visit this level: dedup, emit candidates, select pages to fetch.
            let mut to_fetch: Vec<Url> = Vec::new();
            for url in frontier.drain(..) {
                let normalized = normalize_url(&url, &config.keep_query_params);
                let key = normalized.to_string();

                if is_visited(&visited, &key) {
                    report.pages_skipped += 1;
                    continue;
                }
                if visited.len() >= config.max_pages {
                    if !report.truncated {
                        warn!(max_pages = config.max_pages, "visited-set cap reached");
                    }
                    report.truncated = true;
                    break;
                }
                visited.insert(key.clone());

                if matches_include_exclude(&key, &self.patterns) {
                    debug!(url = %key, "candidate");
                    report.candidates += 1;
                    if tx.send(normalized.clone()).await.is_err() {
                        debug!("candidate consumer dropped, stopping crawl");
                        break 'levels;
                    }
                }

                // Pages at max depth could only contribute links beyond the bound.
                if depth < config.depth {
                    to_fetch.push(normalized);
                }
            }

            if to_fetch.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let results = self
                .fetch_level(to_fetch, &semaphore, &throttle, &cancel)
                .await;

            let mut next: Vec<Url> = Vec::new();
            for (url, result) in results {
                match result {
                    Some(Ok(page)) => {
                        report.pages_fetched += 1;
                        next.extend(page.links.into_iter().filter(|l| should_follow(l, &hosts)));
                    }
                    Some(Err(e)) => {
                        warn!(%url, transient = e.is_transient(), error = %e, "fetch failed, skipping");
                        report.errors.push((url.to_string(), e.to_string()));
                    }
                    None => report.cancelled = true,
                }
            }

            if report.cancelled {
                break;
            }
            frontier = next;
        }

        report.duration = start_time.elapsed();

        info!(
            pages_fetched = report.pages_fetched,
            candidates = report.candidates,
            pages_skipped = report.pages_skipped,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            duration_ms = report.duration.as_millis(),
            "crawl completed"
        );

        report
    }

    /// Fetch one BFS level concurrently. Results keep the input order so the
    /// next level is enqueued deterministically. `None` marks a fetch skipped
    /// because of cancellation.
    async fn fetch_level(
        &self,
        urls: Vec<Url>,
        semaphore: &Arc<Semaphore>,
        throttle: &Arc<HostThrottle>,
        cancel: &CancellationToken,
    ) -> Vec<(Url, Option<std::result::Result<FetchedPage, FetchError>>)> {
        let mut tasks = JoinSet::new();

        for (index, url) in urls.iter().cloned().enumerate() {
            let fetcher = self.fetcher.clone();
            let sem = semaphore.clone();
            let throttle = throttle.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (index, None);
                };
                if cancel.is_cancelled() {
                    return (index, None);
                }
                throttle.wait(url.host_str().unwrap_or_default()).await;
                if cancel.is_cancelled() {
                    return (index, None);
                }
                (index, Some(fetcher.fetch(&url).await))
            });
        }

        let mut slots: Vec<Option<std::result::Result<FetchedPage, FetchError>>> =
            urls.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = result,
                Err(e) => warn!(error = %e, "fetch task panicked"),
            }
        }

        urls.into_iter().zip(slots).collect()
    }
}

// ---------------------------------------------------------------------------
// Politeness
// ---------------------------------------------------------------------------

/// Enforces a minimum delay between requests to the same host.
struct HostThrottle {
    delay: Duration,
    next_slot: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl HostThrottle {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the host's next request slot and sleep until it arrives.
    async fn wait(&self, host: &str) {
        if self.delay.is_zero() {
            return;
        }

        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = tokio::time::Instant::now();
            let slot = slots
                .get(host)
                .copied()
                .filter(|t| *t > now)
                .unwrap_or(now);
            slots.insert(host.to_string(), slot + self.delay);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpFetcher;
    use async_trait::async_trait;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/html")
    }

    fn config_for(root: &str, depth: u32, include: &[&str], exclude: &[&str]) -> CrawlConfig {
        let root = Url::parse(root).unwrap();
        CrawlConfig {
            slug: "test".into(),
            seeds: vec![root.clone()],
            root,
            depth,
            concurrency: 2,
            include_patterns: include.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: exclude.iter().map(|s| s.to_string()).collect(),
            keep_query_params: vec![],
            rate_limit_ms: 0,
            max_pages: 1000,
        }
    }

    fn http_fetcher() -> Arc<dyn Fetcher> {
        Arc::new(
            HttpFetcher::new(Duration::from_secs(5))
                .unwrap()
                .allow_localhost(),
        )
    }

    async fn mount(server: &MockServer, p: &str, body: &str) {
        Mock::given(path(p))
            .respond_with(html(body))
            .mount(server)
            .await;
    }

    fn paths(urls: &[Url]) -> Vec<String> {
        let mut out: Vec<String> = urls.iter().map(|u| u.path().to_string()).collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn traverses_non_matching_pages_and_emits_matches() {
        let server = MockServer::start().await;
        mount(&server, "/", r#"<a href="/models">Models</a>"#).await;
        mount(
            &server,
            "/models",
            r#"<a href="/models/ix/specs">iX</a>
               <a href="/models/i4/specs#top">i4</a>
               <a href="/models/i4/configurator">cfg</a>"#,
        )
        .await;
        mount(&server, "/models/ix/specs", "<h1>iX</h1>").await;
        mount(&server, "/models/i4/specs", "<h1>i4</h1>").await;
        mount(&server, "/models/i4/configurator", "<h1>cfg</h1>").await;

        let config = config_for(&server.uri(), 3, &["*/specs"], &["*configurator*"]);
        let crawler = PatternCrawler::new(config, http_fetcher()).unwrap();
        let (candidates, report) = crawler
            .start(CancellationToken::new())
            .collect_all()
            .await
            .unwrap();

        assert_eq!(paths(&candidates), vec!["/models/i4/specs", "/models/ix/specs"]);
        assert_eq!(report.candidates, 2);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn respects_depth_and_emits_unfetched_leaves() {
        let server = MockServer::start().await;
        mount(&server, "/", r#"<a href="/a/item">a</a>"#).await;
        mount(&server, "/a/item", r#"<a href="/b/item">b</a>"#).await;
        mount(&server, "/b/item", r#"<a href="/c/item">c</a>"#).await;

        let config = config_for(&server.uri(), 2, &["*/item"], &[]);
        let crawler = PatternCrawler::new(config, http_fetcher()).unwrap();
        let (candidates, report) = crawler
            .start(CancellationToken::new())
            .collect_all()
            .await
            .unwrap();

        // /b/item sits at max depth: visited and emitted, never fetched.
        assert_eq!(paths(&candidates), vec!["/a/item", "/b/item"]);
        assert_eq!(report.pages_fetched, 2);
    }

    #[tokio::test]
    async fn failed_pages_are_skipped_not_fatal() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/",
            r#"<a href="/broken">x</a><a href="/ok/item">y</a>"#,
        )
        .await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount(&server, "/ok/item", r#"<a href="/ok/deeper/item">z</a>"#).await;
        mount(&server, "/ok/deeper/item", "leaf").await;

        let config = config_for(&server.uri(), 3, &["*/item"], &[]);
        let crawler = PatternCrawler::new(config, http_fetcher()).unwrap();
        let (candidates, report) = crawler
            .start(CancellationToken::new())
            .collect_all()
            .await
            .unwrap();

        assert_eq!(paths(&candidates), vec!["/ok/deeper/item", "/ok/item"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].0.ends_with("/broken"));
    }

    #[tokio::test]
    async fn dedups_by_normalized_url() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/",
            r#"<a href="/x/item?utm=1">1</a>
               <a href="/x/item/">2</a>
               <a href="/x/item#frag">3</a>
               <a href="https://elsewhere.example/x/item">off-site</a>
               <a href="/x/item.pdf">pdf</a>"#,
        )
        .await;
        mount(&server, "/x/item", r#"<a href="/">home</a>"#).await;

        let config = config_for(&server.uri(), 2, &["*item*"], &[]);
        let crawler = PatternCrawler::new(config, http_fetcher()).unwrap();
        let (candidates, report) = crawler
            .start(CancellationToken::new())
            .collect_all()
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path(), "/x/item");
        assert!(candidates[0].query().is_none());
        assert!(report.pages_skipped >= 2);
    }

    #[test]
    fn invalid_pattern_rejected_before_crawl() {
        let config = config_for("https://www.bmw.de/", 1, &["*[oops"], &[]);
        let err = PatternCrawler::new(config, http_fetcher()).err().unwrap();
        assert!(err.to_string().contains("source group 'test'"));
    }

    // In-memory fetcher over a fixed link graph.
    struct GraphFetcher {
        graph: HashMap<String, Vec<String>>,
        cancel_after: Option<(usize, CancellationToken)>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for GraphFetcher {
        async fn fetch(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if n >= *limit {
                    token.cancel();
                }
            }
            let links = self
                .graph
                .get(url.as_str())
                .ok_or_else(|| FetchError::terminal(url, "HTTP 404"))?
                .iter()
                .filter_map(|l| Url::parse(l).ok())
                .collect();
            Ok(FetchedPage {
                url: url.clone(),
                status: 200,
                html: String::new(),
                links,
            })
        }
    }

    fn chain_graph(len: usize) -> HashMap<String, Vec<String>> {
        (0..len)
            .map(|i| {
                (
                    format!("https://x.test/p{i}"),
                    vec![format!("https://x.test/p{}", i + 1)],
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let token = CancellationToken::new();
        let fetcher = Arc::new(GraphFetcher {
            graph: chain_graph(10),
            cancel_after: Some((2, token.clone())),
            calls: Default::default(),
        });

        let config = config_for("https://x.test/p0", 9, &["*"], &[]);
        let crawler = PatternCrawler::new(config, fetcher.clone()).unwrap();
        let (_, report) = crawler.start(token).collect_all().await.unwrap();

        assert!(report.cancelled);
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn consumer_pulls_candidates_and_stops_early() {
        let fetcher = Arc::new(GraphFetcher {
            graph: chain_graph(10),
            cancel_after: None,
            calls: Default::default(),
        });

        let config = config_for("https://x.test/p0", 9, &["*"], &[]);
        let crawler = PatternCrawler::new(config, fetcher).unwrap();
        let mut stream = crawler.start(CancellationToken::new());

        assert_eq!(stream.next().await.unwrap().as_str(), "https://x.test/p0");
        assert_eq!(stream.next().await.unwrap().as_str(), "https://x.test/p1");
        let report = stream.finish().await.unwrap();

        assert_eq!(report.source_group, "test");
        assert!(report.candidates >= 2);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn max_pages_caps_visited_set() {
        let fetcher = Arc::new(GraphFetcher {
            graph: chain_graph(10),
            cancel_after: None,
            calls: Default::default(),
        });

        let mut config = config_for("https://x.test/p0", 9, &["*"], &[]);
        config.max_pages = 3;
        let crawler = PatternCrawler::new(config, fetcher).unwrap();
        let (candidates, report) = crawler
            .start(CancellationToken::new())
            .collect_all()
            .await
            .unwrap();

        assert_eq!(candidates.len(), 3);
        assert!(report.truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn host_throttle_spaces_requests() {
        let throttle = HostThrottle::new(Duration::from_millis(500));
        let start = tokio::time::Instant::now();

        throttle.wait("a.test").await;
        throttle.wait("a.test").await;
        throttle.wait("b.test").await;
        throttle.wait("a.test").await;

        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }
}
