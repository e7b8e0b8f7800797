//! Application configuration for deltacrawl.
//!
//! User config lives at `~/.deltacrawl/deltacrawl.toml`. It is parsed once at
//! run start into [`AppConfig`] and handed down by reference; components
//! receive the narrow runtime views ([`CrawlConfig`], [`ExtractionConfig`]).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DeltaCrawlError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "deltacrawl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".deltacrawl";

// ---------------------------------------------------------------------------
// Config structs (matching deltacrawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Crawl-wide settings shared by every source group.
    #[serde(default)]
    pub crawl: CrawlSettings,

    /// Change-detection policy.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Enrichment throttling, retry, and checkpoint policy.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Enrichment bridge subprocess.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Configured source groups.
    #[serde(default)]
    pub source_groups: Vec<SourceGroupConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the tracking database.
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

fn default_state_path() -> String {
    "data/tracking.db".into()
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSettings {
    /// Concurrent fetches per source group.
    #[serde(default = "default_crawl_concurrency")]
    pub concurrency: u32,

    /// Minimum ms between requests to the same host.
    #[serde(default = "default_politeness_delay")]
    pub politeness_delay_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound on visited URLs per group.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Crawl source groups concurrently.
    #[serde(default = "default_true")]
    pub parallel_groups: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            concurrency: default_crawl_concurrency(),
            politeness_delay_ms: default_politeness_delay(),
            request_timeout_secs: default_request_timeout(),
            max_pages: default_max_pages(),
            parallel_groups: true,
        }
    }
}

fn default_crawl_concurrency() -> u32 {
    4
}
fn default_politeness_delay() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_pages() -> usize {
    5000
}
fn default_true() -> bool {
    true
}

/// `[detection]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum fraction of previously active fingerprints that must be
    /// re-discovered before Disappeared is trusted for a group.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_coverage: default_min_coverage(),
        }
    }
}

fn default_min_coverage() -> f64 {
    0.5
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Minimum ms between enrichment calls within one group.
    #[serde(default = "default_delay_between_calls")]
    pub delay_between_calls_ms: u64,

    /// Pause in ms when switching from one group to the next.
    #[serde(default = "default_delay_between_groups")]
    pub delay_between_groups_ms: u64,

    /// Minimum ms between any two enrichment calls, across groups.
    #[serde(default)]
    pub global_min_interval_ms: u64,

    /// Attempts per entity before it lands in the failure bucket.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Cap for the exponential backoff.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Timeout for one enrichment call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Flush checkpoints after this many successful enrichments.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Also enrich entities whose URL changed.
    #[serde(default)]
    pub reenrich_url_changed: bool,

    /// Cost of one enrichment unit (token).
    #[serde(default = "default_cost_per_unit")]
    pub cost_per_unit_usd: f64,

    /// Page content sent to the oracle is truncated to this many chars.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            delay_between_calls_ms: default_delay_between_calls(),
            delay_between_groups_ms: default_delay_between_groups(),
            global_min_interval_ms: 0,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            call_timeout_secs: default_call_timeout(),
            checkpoint_every: default_checkpoint_every(),
            reenrich_url_changed: false,
            cost_per_unit_usd: default_cost_per_unit(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

impl ExtractionConfig {
    pub fn delay_between_calls(&self) -> Duration {
        Duration::from_millis(self.delay_between_calls_ms)
    }

    pub fn delay_between_groups(&self) -> Duration {
        Duration::from_millis(self.delay_between_groups_ms)
    }

    pub fn global_min_interval(&self) -> Duration {
        Duration::from_millis(self.global_min_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based: the wait after the
    /// first failed attempt is `backoff(1)`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

fn default_delay_between_calls() -> u64 {
    10_000
}
fn default_delay_between_groups() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_max() -> u64 {
    60_000
}
fn default_call_timeout() -> u64 {
    120
}
fn default_checkpoint_every() -> usize {
    5
}
fn default_cost_per_unit() -> f64 {
    0.000_001
}
fn default_max_content_chars() -> usize {
    12_000
}

/// `[bridge]` section: the enrichment subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge command (e.g., "bun").
    #[serde(default = "default_bridge_cmd")]
    pub cmd: String,

    /// Script passed to `<cmd> run`.
    #[serde(default = "default_bridge_script")]
    pub script: String,

    /// Working directory for the bridge process.
    #[serde(default = "default_bridge_working_dir")]
    pub working_dir: String,

    /// Model identifier forwarded with every task.
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cmd: default_bridge_cmd(),
            script: default_bridge_script(),
            working_dir: default_bridge_working_dir(),
            model: default_model(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "bridge/enrich.ts".into()
}
fn default_bridge_working_dir() -> String {
    ".".into()
}
fn default_model() -> String {
    "claude-3-haiku-20240307".into()
}

/// `[[source_groups]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceGroupConfig {
    /// Short unique identifier (e.g. "bmw").
    pub slug: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// Site root; its host bounds the crawl.
    pub root_url: String,

    /// Crawl entry points. Defaults to `root_url`.
    #[serde(default)]
    pub seed_urls: Vec<String>,

    /// Maximum link hops from a seed.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// URL globs a candidate must match (at least one).
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// URL globs that disqualify a candidate.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Query parameters that identify content and survive normalization.
    #[serde(default)]
    pub keep_query_params: Vec<String>,

    /// Extra path tokens ignored when fingerprinting.
    #[serde(default)]
    pub noise_tokens: Vec<String>,
}

fn default_max_depth() -> u32 {
    3
}

impl SourceGroupConfig {
    /// Display name, falling back to the upper-cased slug.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.slug.to_uppercase()
        } else {
            self.name.clone()
        }
    }

    /// Seed URLs, or the root URL when none are configured.
    pub fn seeds(&self) -> Result<Vec<Url>> {
        let raw: Vec<&str> = if self.seed_urls.is_empty() {
            vec![self.root_url.as_str()]
        } else {
            self.seed_urls.iter().map(String::as_str).collect()
        };

        raw.into_iter()
            .map(|s| {
                Url::parse(s).map_err(|e| {
                    DeltaCrawlError::config(format!(
                        "source group '{}': invalid URL '{s}': {e}",
                        self.slug
                    ))
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Crawl config (runtime, merged per source group)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration for one source group.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Owning source group.
    pub slug: String,
    /// Site root; its host bounds the crawl together with the seeds' hosts.
    pub root: Url,
    /// Seed URLs (BFS depth 0).
    pub seeds: Vec<Url>,
    /// Maximum hops from a seed.
    pub depth: u32,
    /// Maximum concurrent HTTP requests.
    pub concurrency: u32,
    /// URL include glob patterns.
    pub include_patterns: Vec<String>,
    /// URL exclude glob patterns.
    pub exclude_patterns: Vec<String>,
    /// Query parameters kept by URL normalization.
    pub keep_query_params: Vec<String>,
    /// Minimum ms between requests to the same host.
    pub rate_limit_ms: u64,
    /// Upper bound on visited URLs.
    pub max_pages: usize,
}

impl CrawlConfig {
    /// Merge crawl-wide settings with one group's configuration.
    pub fn for_group(app: &AppConfig, group: &SourceGroupConfig) -> Result<Self> {
        let root = Url::parse(&group.root_url).map_err(|e| {
            DeltaCrawlError::config(format!(
                "source group '{}': invalid root_url: {e}",
                group.slug
            ))
        })?;

        Ok(Self {
            slug: group.slug.clone(),
            root,
            seeds: group.seeds()?,
            depth: group.max_depth,
            concurrency: app.crawl.concurrency,
            include_patterns: group.include_patterns.clone(),
            exclude_patterns: group.exclude_patterns.clone(),
            keep_query_params: group.keep_query_params.clone(),
            rate_limit_ms: app.crawl.politeness_delay_ms,
            max_pages: app.crawl.max_pages,
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reject configurations that cannot produce a meaningful run.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.source_groups.is_empty() {
        return Err(DeltaCrawlError::config("no source groups configured"));
    }

    let mut slugs = HashSet::new();
    for group in &config.source_groups {
        if group.slug.trim().is_empty() {
            return Err(DeltaCrawlError::config("source group with empty slug"));
        }
        if !slugs.insert(group.slug.as_str()) {
            return Err(DeltaCrawlError::config(format!(
                "duplicate source group slug '{}'",
                group.slug
            )));
        }
        Url::parse(&group.root_url).map_err(|e| {
            DeltaCrawlError::config(format!(
                "source group '{}': invalid root_url: {e}",
                group.slug
            ))
        })?;
        group.seeds()?;
        if group.include_patterns.is_empty() {
            return Err(DeltaCrawlError::config(format!(
                "source group '{}': include_patterns must not be empty",
                group.slug
            )));
        }
    }

    if !(0.0..=1.0).contains(&config.detection.min_coverage) {
        return Err(DeltaCrawlError::config(format!(
            "detection.min_coverage must be within [0, 1], got {}",
            config.detection.min_coverage
        )));
    }
    if config.extraction.max_attempts == 0 {
        return Err(DeltaCrawlError::config("extraction.max_attempts must be > 0"));
    }
    if config.extraction.checkpoint_every == 0 {
        return Err(DeltaCrawlError::config(
            "extraction.checkpoint_every must be > 0",
        ));
    }
    if config.crawl.concurrency == 0 {
        return Err(DeltaCrawlError::config("crawl.concurrency must be > 0"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.deltacrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DeltaCrawlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.deltacrawl/deltacrawl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DeltaCrawlError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        DeltaCrawlError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Header written above the starter config.
const STARTER_HEADER: &str = "\
# deltacrawl configuration.
# Every field is optional except the source groups; omitted fields take
# their defaults. Patterns are shell globs matched against full URLs.

";

/// Create the config directory and write a starter config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let path = config_file_path()?;
    init_config_at(&path)?;
    Ok(path)
}

/// Write a starter config file to `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| DeltaCrawlError::io(dir, e))?;
    }

    let config = AppConfig::starter();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DeltaCrawlError::config(e.to_string()))?;

    std::fs::write(path, format!("{STARTER_HEADER}{content}"))
        .map_err(|e| DeltaCrawlError::io(path, e))?;
    tracing::info!(?path, "created starter config file");

    Ok(())
}

impl AppConfig {
    /// Defaults plus one example source group, so the written file validates.
    pub fn starter() -> Self {
        Self {
            source_groups: vec![SourceGroupConfig {
                slug: "bmw".into(),
                name: "BMW".into(),
                root_url: "https://www.bmw.de/".into(),
                seed_urls: vec!["https://www.bmw.de/de/neufahrzeuge.html".into()],
                max_depth: 3,
                include_patterns: vec!["*/technische-daten*".into()],
                exclude_patterns: vec!["*/konfigurator/*".into()],
                keep_query_params: Vec::new(),
                noise_tokens: Vec::new(),
            }],
            ..Default::default()
        }
    }

    /// Look up a configured group by slug.
    pub fn group(&self, slug: &str) -> Option<&SourceGroupConfig> {
        self.source_groups.iter().find(|g| g.slug == slug)
    }
}
