//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use deltacrawl_core::{
    BridgeOracle, FingerprintEngine, ProgressReporter, RunCoordinator, RunOptions, RunOutcome,
    RunReport, SystemClock, load_report,
};
use deltacrawl_crawler::{CrawlReport, HttpFetcher, normalize_url};
use deltacrawl_shared::{
    AppConfig, RunId, config_file_path, init_config_at, load_config, load_config_from,
};
use deltacrawl_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// deltacrawl: detect catalog changes cheaply, enrich only what is new.
#[derive(Parser)]
#[command(
    name = "deltacrawl",
    version,
    about = "Re-crawl catalogs incrementally and enrich only newly seen entries.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.deltacrawl/deltacrawl.toml).
    #[arg(long, global = true, env = "DELTACRAWL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl, classify, and enrich. Resumes an unfinished run if one exists.
    Run {
        /// Only crawl these source groups (repeatable).
        #[arg(long = "group", value_name = "SLUG")]
        groups: Vec<String>,

        /// Abandon an unfinished run and start over, carrying its pending
        /// enrichment work into the new run.
        #[arg(long)]
        fresh: bool,

        /// Record the current catalog as known state without enriching
        /// anything. Use once on an empty store to skip the initial backfill.
        #[arg(long, conflicts_with = "fresh")]
        baseline: bool,
    },

    /// Re-enrich every entity in the permanent-failure bucket.
    RetryFailed,

    /// List recent runs, newest first.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Show the classified lists and record of a run.
    Report {
        /// Run id (defaults to the latest run).
        #[arg(long)]
        run: Option<String>,
    },

    /// Show an entity and its full URL history.
    History {
        fingerprint: String,
    },

    /// Print the fingerprint a URL would get in a source group.
    Fingerprint {
        slug: String,
        url: String,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a starter config file.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "deltacrawl=info",
        1 => "deltacrawl=debug",
        _ => "deltacrawl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            groups,
            fresh,
            baseline,
        } => cmd_run(config_path, RunOptions { groups, fresh, baseline }).await,
        Command::Runs { limit } => cmd_runs(config_path, limit).await,
        Command::RetryFailed => cmd_retry_failed(config_path).await,
        Command::Report { run } => cmd_report(config_path, run.as_deref()).await,
        Command::History { fingerprint } => cmd_history(config_path, &fingerprint).await,
        Command::Fingerprint { slug, url } => cmd_fingerprint(config_path, &slug, &url),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

async fn open_state(config: &AppConfig) -> Result<Storage> {
    let path = PathBuf::from(&config.defaults.state_path);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(Storage::open(&path).await?)
}

async fn open_state_readonly(config: &AppConfig) -> Result<Storage> {
    let path = PathBuf::from(&config.defaults.state_path);
    Storage::open_readonly(&path)
        .await
        .map_err(|e| eyre!("cannot open state at '{}': {e}", path.display()))
}

/// Production coordinator: HTTP fetcher, subprocess bridge, wall clock.
async fn build_coordinator(config: AppConfig) -> Result<RunCoordinator> {
    let storage = open_state(&config).await?;
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(
        config.crawl.request_timeout_secs,
    ))?);
    let oracle = Arc::new(BridgeOracle::new(
        config.bridge.clone(),
        &config.extraction,
        fetcher.clone(),
    ));

    Ok(RunCoordinator::new(
        config,
        storage,
        fetcher,
        oracle,
        Arc::new(SystemClock),
    )?)
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            token.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, options: RunOptions) -> Result<()> {
    let config = resolve_config(config_path)?;
    info!(
        groups = ?options.groups,
        fresh = options.fresh,
        baseline = options.baseline,
        "starting run"
    );

    let coordinator = build_coordinator(config).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let reporter = CliProgress::new();
    let outcome = coordinator
        .run(&options, cancel, &reporter)
        .await;
    reporter.finish();
    coordinator.into_storage().close();

    match outcome? {
        RunOutcome::Completed(report) => print_report(&report),
        RunOutcome::Cancelled { run_id: Some(run_id) } => {
            println!();
            println!("  Run {run_id} interrupted during enrichment.");
            println!("  Progress is checkpointed; `deltacrawl run` resumes it.");
            println!();
        }
        RunOutcome::Cancelled { run_id: None } => {
            println!();
            println!("  Run cancelled during crawl. Nothing was written.");
            println!();
        }
    }
    Ok(())
}

async fn cmd_retry_failed(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let coordinator = build_coordinator(config).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let reporter = CliProgress::new();
    let retry = coordinator.retry_failed(cancel, &reporter).await;
    reporter.finish();
    coordinator.into_storage().close();
    let retry = retry?;

    println!();
    println!("  Retried:   {}", retry.attempted);
    println!("  Enriched:  {}", retry.schedule.enriched);
    println!("  Skipped:   {}", retry.schedule.skipped);
    println!("  Failed:    {}", retry.schedule.failed);
    println!("  Remaining: {}", retry.remaining.len());
    println!("  Cost:      ${:.4}", retry.schedule.cost_usd);
    if retry.schedule.cancelled {
        println!("  (interrupted)");
    }
    println!();
    Ok(())
}

async fn cmd_runs(config_path: Option<&Path>, limit: u32) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_state_readonly(&config).await?;
    let runs = storage.list_runs(limit).await?;
    storage.close();

    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!();
    for run in &runs {
        println!(
            "  {}  {:<10} {}  new {:>4}  moved {:>4}  gone {:>4}  enriched {:>4}  failed {:>3}{}",
            run.run_id,
            run.status.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.counts.new,
            run.counts.url_changed,
            run.counts.disappeared,
            run.enrichment.enriched,
            run.enrichment.failed,
            if run.degraded { "  DEGRADED" } else { "" }
        );
    }
    println!();
    Ok(())
}

async fn cmd_report(config_path: Option<&Path>, run: Option<&str>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let run_id = run
        .map(|r| r.parse::<RunId>().map_err(|e| eyre!("invalid run id '{r}': {e}")))
        .transpose()?;

    let storage = open_state_readonly(&config).await?;
    let report = load_report(&storage, run_id.as_ref()).await?;
    storage.close();

    match report {
        Some(report) => print_report(&report),
        None => println!("No runs recorded yet."),
    }
    Ok(())
}

async fn cmd_history(config_path: Option<&Path>, fingerprint: &str) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_state_readonly(&config).await?;
    let entity = storage.get_entity(fingerprint).await?;
    storage.close();

    let entity = entity.ok_or_else(|| eyre!("no entity with fingerprint '{fingerprint}'"))?;

    println!();
    println!("  Fingerprint: {}", entity.fingerprint);
    println!("  Group:       {}", entity.source_group);
    println!("  Status:      {}", entity.status.as_str());
    println!("  URL:         {}", entity.url);
    println!("  First seen:  {}", entity.first_seen.to_rfc3339());
    println!("  Last seen:   {}", entity.last_seen.to_rfc3339());
    if let Some(changed) = entity.last_url_change {
        println!("  URL changed: {}", changed.to_rfc3339());
    }
    println!();
    println!("  URL history:");
    for entry in &entity.url_history {
        println!("    {}  {}", entry.recorded_at.to_rfc3339(), entry.url);
    }
    if let Some(attributes) = &entity.attributes {
        println!();
        println!("  Attributes:");
        println!("{}", serde_json::to_string_pretty(attributes)?);
    }
    println!();
    Ok(())
}

fn cmd_fingerprint(config_path: Option<&Path>, slug: &str, url: &str) -> Result<()> {
    let config = resolve_config(config_path)?;
    let url = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;

    let (noise, keep) = match config.group(slug) {
        Some(group) => (group.noise_tokens.clone(), group.keep_query_params.clone()),
        None => (Vec::new(), Vec::new()),
    };
    let normalized = normalize_url(&url, &keep);
    let engine = FingerprintEngine::new(&noise);
    println!("{}", engine.fingerprint(slug, &normalized));
    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    if path.exists() {
        return Err(eyre!("config already exists at '{}'", path.display()));
    }
    init_config_at(&path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_report(report: &RunReport) {
    let record = &report.record;

    println!();
    println!(
        "  Run {} ({}){}",
        record.run_id,
        record.status.as_str(),
        if report.resumed { ", resumed" } else { "" }
    );
    println!("  Started:     {}", record.started_at.to_rfc3339());
    if let Some(finished) = record.finished_at {
        println!("  Finished:    {}", finished.to_rfc3339());
    }
    println!("  New:         {}", record.counts.new);
    println!("  Reappeared:  {}", record.counts.reappeared);
    println!("  URL changed: {}", record.counts.url_changed);
    println!("  Disappeared: {}", record.counts.disappeared);
    println!("  Unchanged:   {}", record.counts.unchanged);
    println!(
        "  Enrichment:  {} enriched, {} skipped, {} failed ({} units, ${:.4})",
        record.enrichment.enriched,
        record.enrichment.skipped,
        record.enrichment.failed,
        record.enrichment.units,
        record.enrichment.cost_usd
    );
    println!("  Time:        {:.1}s", record.duration_ms as f64 / 1000.0);
    if record.degraded {
        println!("  DEGRADED");
    }

    for anomaly in &record.anomalies {
        println!(
            "  ! {}: discovered {} of {} previously active (min coverage {:.0}%), {} disappearances suppressed",
            anomaly.source_group,
            anomaly.discovered,
            anomaly.previously_active,
            anomaly.min_coverage * 100.0,
            anomaly.suppressed
        );
    }

    for group in &report.changes {
        if group.new.is_empty() && group.url_changed.is_empty() && group.disappeared.is_empty() {
            continue;
        }
        println!();
        println!("  [{}]", group.source_group);
        for entry in &group.new {
            let tag = if entry.reappeared { "back" } else { "new " };
            println!("    {tag}  {}  {}", entry.fingerprint, entry.url);
        }
        for change in &group.url_changed {
            println!(
                "    moved {}  {} -> {}",
                change.fingerprint, change.old_url, change.new_url
            );
        }
        for entry in &group.disappeared {
            println!("    gone  {}  {}", entry.fingerprint, entry.url);
        }
    }

    if !report.failures.is_empty() {
        println!();
        println!("  Permanent failures ({}):", report.failures.len());
        for failure in &report.failures {
            println!(
                "    {}  {} attempt(s)  {}",
                failure.fingerprint, failure.attempts, failure.error
            );
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn group_crawled(&self, report: &CrawlReport) {
        self.spinner.println(format!(
            "  {}: {} candidates from {} pages ({} errors{})",
            report.source_group,
            report.candidates,
            report.pages_fetched,
            report.errors.len(),
            if report.truncated { ", truncated" } else { "" }
        ));
    }

    fn entity_enriched(&self, fingerprint: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Enriching [{current}/{total}] {fingerprint}"));
    }
}
