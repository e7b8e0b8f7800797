//! Subprocess enrichment bridge.
//!
//! Fetches the entity page, converts it to Markdown, and hands it to a
//! long-lived helper process speaking a JSON-lines protocol on stdin/stdout:
//!
//! ```text
//! <- {"type":"ready"}
//! -> {"type":"enrich","id":"req-1","task":{...}}
//! <- {"type":"result","id":"req-1","result":{"text":"...","tokens_in":..,...}}
//! <- {"type":"error","id":"req-1","error":"..."}
//! -> {"type":"shutdown"}
//! ```

use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use deltacrawl_crawler::{FetchError, Fetcher};
use deltacrawl_shared::{BridgeConfig, ExtractionConfig};

use super::{Enrichment, EnrichmentError, EnrichmentOracle, EnrichmentRequest, parse_attributes};

const TASK_TYPE: &str = "extract_attributes";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static RETRY_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"retry[- _]after[^0-9]*(\d+)").expect("valid regex"));

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Task payload sent with every `enrich` request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnrichmentTask {
    pub task_type: String,
    pub content: String,
    pub source_url: String,
    pub source_group: String,
    pub model: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage {
    #[serde(rename = "enrich")]
    Enrich { id: String, task: EnrichmentTask },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result { id: String, result: BridgeResult },
    #[serde(rename = "error")]
    Error { id: String, error: String },
}

/// Raw reply from the bridge.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BridgeResult {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to the spawned bridge subprocess.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    async fn spawn(config: &BridgeConfig) -> std::result::Result<Self, EnrichmentError> {
        info!(cmd = %config.cmd, script = %config.script, "spawning enrichment bridge");

        let mut child = Command::new(&config.cmd)
            .arg("run")
            .arg(&config.script)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EnrichmentError::Terminal(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EnrichmentError::Terminal("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EnrichmentError::Terminal("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };
        handle.wait_for_ready().await?;
        Ok(handle)
    }

    async fn wait_for_ready(&mut self) -> std::result::Result<(), EnrichmentError> {
        let line = self.read_line().await?;
        match serde_json::from_str::<ResponseMessage>(line.trim()) {
            Ok(ResponseMessage::Ready) => {
                info!("bridge is ready");
                Ok(())
            }
            _ => Err(EnrichmentError::Terminal(format!(
                "expected ready message, got: {}",
                preview(&line)
            ))),
        }
    }

    async fn read_line(&mut self) -> std::result::Result<String, EnrichmentError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| EnrichmentError::Transient(format!("bridge read error: {e}")))?;
        if read == 0 {
            return Err(EnrichmentError::Transient(
                "bridge closed stdout unexpectedly".into(),
            ));
        }
        Ok(line)
    }

    async fn send_task(
        &mut self,
        task: EnrichmentTask,
    ) -> std::result::Result<BridgeResult, EnrichmentError> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let json = serde_json::to_string(&RequestMessage::Enrich {
            id: id.clone(),
            task,
        })
        .map_err(|e| EnrichmentError::Terminal(format!("failed to serialize request: {e}")))?;

        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| EnrichmentError::Transient(format!("failed to write to bridge: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| EnrichmentError::Transient(format!("failed to flush bridge: {e}")))?;

        loop {
            let line = self.read_line().await?;
            let msg: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
                EnrichmentError::Malformed(format!(
                    "invalid bridge response: {e} (got: {})",
                    preview(&line)
                ))
            })?;

            match msg {
                ResponseMessage::Result { id: resp_id, result } if resp_id == id => {
                    return Ok(result);
                }
                ResponseMessage::Error { id: resp_id, error } if resp_id == id => {
                    return Err(classify_bridge_error(&error));
                }
                ResponseMessage::Ready => {
                    return Err(EnrichmentError::Transient(
                        "unexpected ready message during enrichment".into(),
                    ));
                }
                other => debug!(?other, expected = %id, "discarding stale bridge reply"),
            }
        }
    }

    async fn shutdown(mut self) {
        if let Ok(json) = serde_json::to_string(&RequestMessage::Shutdown) {
            let _ = self.stdin.write_all(format!("{json}\n").as_bytes()).await;
            let _ = self.stdin.flush().await;
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!("bridge did not exit in time, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Production [`EnrichmentOracle`]. The subprocess is spawned on first use
/// and respawned when a call fails mid-protocol or is cancelled.
pub struct BridgeOracle {
    bridge: BridgeConfig,
    fetcher: Arc<dyn Fetcher>,
    max_content_chars: usize,
    cost_per_unit_usd: f64,
    handle: Mutex<Option<BridgeHandle>>,
}

impl BridgeOracle {
    pub fn new(bridge: BridgeConfig, extraction: &ExtractionConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            bridge,
            fetcher,
            max_content_chars: extraction.max_content_chars,
            cost_per_unit_usd: extraction.cost_per_unit_usd,
            handle: Mutex::new(None),
        }
    }

    async fn page_markdown(&self, request: &EnrichmentRequest) -> std::result::Result<String, EnrichmentError> {
        let page = self.fetcher.fetch(&request.url).await.map_err(|e| match e {
            FetchError::Transient { .. } => EnrichmentError::Transient(e.to_string()),
            FetchError::Terminal { .. } => EnrichmentError::Terminal(e.to_string()),
        })?;

        let markdown = htmd::convert(&page.html)
            .map_err(|e| EnrichmentError::Terminal(format!("html conversion failed: {e}")))?;
        Ok(truncate_content(&markdown, self.max_content_chars))
    }
}

#[async_trait]
impl EnrichmentOracle for BridgeOracle {
    #[instrument(skip_all, fields(fingerprint = %request.fingerprint, attempt = request.attempt))]
    async fn enrich(
        &self,
        request: &EnrichmentRequest,
    ) -> std::result::Result<Enrichment, EnrichmentError> {
        let content = self.page_markdown(request).await?;

        let task = EnrichmentTask {
            task_type: TASK_TYPE.into(),
            content,
            source_url: request.url.to_string(),
            source_group: request.source_group.clone(),
            model: self.bridge.model.clone(),
        };

        let mut slot = self.handle.lock().await;
        // Taken out for the duration of the call: if this future is dropped
        // mid-protocol the handle goes with it and the next call respawns.
        let mut handle = match slot.take() {
            Some(handle) => handle,
            None => BridgeHandle::spawn(&self.bridge).await?,
        };

        let outcome = handle.send_task(task).await;
        match &outcome {
            Ok(_) | Err(EnrichmentError::RateLimited { .. }) | Err(EnrichmentError::Terminal(_)) => {
                *slot = Some(handle);
            }
            Err(e) => warn!(error = %e, "dropping bridge after protocol failure"),
        }
        drop(slot);

        let result = outcome?;
        debug!(
            tokens_in = result.tokens_in,
            tokens_out = result.tokens_out,
            latency_ms = result.latency_ms,
            "bridge call complete"
        );
        to_enrichment(&result, self.cost_per_unit_usd)
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
    }
}

/// Turn a bridge reply into an [`Enrichment`], honoring the `valid_source`
/// verdict (missing means "maybe").
fn to_enrichment(
    result: &BridgeResult,
    cost_per_unit_usd: f64,
) -> std::result::Result<Enrichment, EnrichmentError> {
    let attributes = parse_attributes(&result.text)?;

    let verdict = attributes
        .get("valid_source")
        .and_then(|v| v.as_str())
        .unwrap_or("maybe")
        .to_lowercase();
    if verdict == "no" {
        return Err(EnrichmentError::NotApplicable(
            "page is not a valid source (valid_source=no)".into(),
        ));
    }

    let units = result.tokens_in + result.tokens_out;
    Ok(Enrichment {
        attributes,
        units,
        cost_usd: units as f64 * cost_per_unit_usd,
    })
}

/// Map a bridge-reported error string onto the retry taxonomy.
fn classify_bridge_error(message: &str) -> EnrichmentError {
    let lower = message.to_lowercase();

    if lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded") {
        let retry_after = RETRY_AFTER
            .captures(&lower)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(Duration::from_secs);
        return EnrichmentError::RateLimited { retry_after };
    }

    let terminal_markers = ["401", "403", "invalid api key", "authentication", "permission"];
    if terminal_markers.iter().any(|m| lower.contains(m)) {
        return EnrichmentError::Terminal(message.to_string());
    }

    EnrichmentError::Transient(message.to_string())
}

/// Truncate content to at most `max_chars` characters.
fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((cut, _)) => format!(
            "{}\n\n[... content truncated for LLM context window ...]",
            &content[..cut]
        ),
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(200) {
        Some((cut, _)) => &line[..cut],
        None => line,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
