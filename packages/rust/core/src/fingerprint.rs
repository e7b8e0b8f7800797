//! Deterministic entity identifiers derived from URL structure.
//!
//! `https://www.bmw.de/de/neufahrzeuge/bmw-i/ix/xdrive50/2024/technische-daten.html`
//! becomes `bmw_i_ix_xdrive50_2024` for group `bmw`: language codes and
//! catalog boilerplate are dropped, the remaining segments are slugged and
//! joined, and the group slug leads unless the path already starts with it.
//!
//! Query parameters that survived normalization (the group's
//! `keep_query_params`) are identity too: `?variant=40` appends `variant_40`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

/// Path tokens that carry no identity.
pub const DEFAULT_NOISE_TOKENS: &[&str] = &[
    "technische-daten",
    "technical-data",
    "neufahrzeuge",
    "new-vehicles",
    "modelle",
    "models",
    "de",
    "en",
    "fr",
    "it",
    "passengercars",
    "cars",
    "html",
    "htm",
];

/// Hex characters of the content hash used when no structural token remains.
const HASH_SUFFIX_LEN: usize = 12;

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_]").expect("valid regex"));
static UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").expect("valid regex"));

/// Maps (source-group slug, URL) to a stable fingerprint. Pure.
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    noise: HashSet<String>,
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl FingerprintEngine {
    /// Engine with the default noise tokens plus `extra_noise`.
    pub fn new(extra_noise: &[String]) -> Self {
        let noise = DEFAULT_NOISE_TOKENS
            .iter()
            .map(|t| t.to_string())
            .chain(extra_noise.iter().map(|t| t.to_lowercase()))
            .collect();

        Self { noise }
    }

    pub fn fingerprint(&self, slug: &str, url: &Url) -> String {
        let slug = self.clean(slug);

        let mut tokens: Vec<String> = url
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                let lower = segment.to_lowercase();
                lower
                    .strip_suffix(".html")
                    .or_else(|| lower.strip_suffix(".htm"))
                    .map(str::to_string)
                    .unwrap_or(lower)
            })
            .filter(|segment| !self.noise.contains(segment))
            .map(|segment| self.clean(&segment))
            .filter(|token| !token.is_empty())
            .collect();

        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (self.clean(&k), self.clean(&v)))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        params.sort();
        for (key, value) in params {
            tokens.push(key);
            if !value.is_empty() {
                tokens.push(value);
            }
        }

        if tokens.is_empty() {
            return format!("{slug}_{}", content_hash(url));
        }

        let body = tokens.join("_");
        if body == slug || body.starts_with(&format!("{slug}_")) {
            body
        } else {
            format!("{slug}_{body}")
        }
    }

    /// Lower-case, `-` to `_`, drop everything outside `[a-z0-9_]`, collapse
    /// and trim underscores.
    fn clean(&self, raw: &str) -> String {
        let lowered = raw.to_lowercase().replace('-', "_");
        let stripped = NON_ALNUM.replace_all(&lowered, "");
        let collapsed = UNDERSCORES.replace_all(&stripped, "_");
        collapsed.trim_matches('_').to_string()
    }
}

/// Short SHA-256 of the URL's path and query.
fn content_hash(url: &Url) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.path().as_bytes());
    if let Some(query) = url.query() {
        hasher.update(b"?");
        hasher.update(query.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..HASH_SUFFIX_LEN].to_string()
}
