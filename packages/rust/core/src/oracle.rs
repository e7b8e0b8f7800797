//! Enrichment oracle boundary.
//!
//! The scheduler only sees [`EnrichmentOracle`]; the production
//! implementation is [`bridge::BridgeOracle`].

pub mod bridge;

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use deltacrawl_shared::{Attributes, WorkItem};

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// One enrichment call for one entity.
#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    pub fingerprint: String,
    pub source_group: String,
    pub url: Url,
    pub reappeared: bool,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl EnrichmentRequest {
    pub fn from_work_item(item: &WorkItem, attempt: u32) -> std::result::Result<Self, EnrichmentError> {
        let url = Url::parse(&item.url)
            .map_err(|e| EnrichmentError::Terminal(format!("invalid url '{}': {e}", item.url)))?;
        Ok(Self {
            fingerprint: item.fingerprint.clone(),
            source_group: item.source_group.clone(),
            url,
            reappeared: item.reappeared,
            attempt,
        })
    }
}

/// A successful enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub attributes: Attributes,
    /// Units consumed (tokens in + out for the bridge).
    pub units: u64,
    pub cost_usd: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnrichmentError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Terminal(String),

    /// The page is not a valid source for enrichment.
    #[error("not applicable: {0}")]
    NotApplicable(String),
}

impl EnrichmentError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited { .. } | Self::Timeout(_) | Self::Malformed(_)
        )
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Oracle trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EnrichmentOracle: Send + Sync {
    async fn enrich(
        &self,
        request: &EnrichmentRequest,
    ) -> std::result::Result<Enrichment, EnrichmentError>;

    /// Release any held resources. Called once after the last `enrich`.
    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Extract a JSON object from free-form model output.
///
/// A fenced ```` ```json ```` block is tried first, then the first balanced
/// `{...}` span.
pub fn parse_attributes(text: &str) -> std::result::Result<Attributes, EnrichmentError> {
    if let Some(candidate) = fenced_block(text) {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(candidate) {
            return Ok(map);
        }
    }

    let candidate = balanced_object(text)
        .ok_or_else(|| EnrichmentError::Malformed("no JSON object in response".into()))?;

    match serde_json::from_str(candidate) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(EnrichmentError::Malformed("response JSON is not an object".into())),
        Err(e) => Err(EnrichmentError::Malformed(format!("invalid JSON: {e}"))),
    }
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex")
});

fn fenced_block(text: &str) -> Option<&str> {
    FENCED_JSON
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// First `{...}` span with balanced braces, ignoring braces inside strings.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
