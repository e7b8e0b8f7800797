//! Crawl scope: URL normalization, glob patterns, and link-following rules.
//!
//! Everything here is pure so the traversal rules can be tested without a
//! network.

use std::collections::HashSet;

use regex::Regex;
use url::Url;

use deltacrawl_shared::{DeltaCrawlError, Result};

/// Extensions that never lead to crawlable HTML.
const BINARY_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".zip", ".gz", ".tar", ".rar",
    ".exe", ".dmg", ".msi", ".mp4", ".mp3",
];

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Compiled include/exclude globs for one source group.
#[derive(Debug, Clone)]
pub struct PatternSet {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PatternSet {
    /// Compile include and exclude globs. An invalid glob is a config error.
    pub fn compile(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile_all = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns.iter().map(|p| glob_to_regex(p)).collect()
        };

        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
        })
    }
}

/// Convert a shell-style glob into an anchored regex over the full URL.
///
/// `*` and `**` match any run of characters (including `/`), `?` matches one
/// character, `[...]` is a character class.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                out.push_str(".*");
            }
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' && !class.is_empty() {
                        closed = true;
                        break;
                    }
                    class.push(c);
                }
                if !closed {
                    return Err(DeltaCrawlError::config(format!(
                        "invalid glob '{pattern}': unterminated character class"
                    )));
                }
                out.push('[');
                if let Some(rest) = class.strip_prefix('!') {
                    out.push('^');
                    out.push_str(&rest.replace('\\', r"\\"));
                } else {
                    out.push_str(&class.replace('\\', r"\\"));
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');

    Regex::new(&out)
        .map_err(|e| DeltaCrawlError::config(format!("invalid glob '{pattern}': {e}")))
}

/// True when `url` matches at least one include pattern and no exclude pattern.
pub fn matches_include_exclude(url: &str, patterns: &PatternSet) -> bool {
    if patterns.exclude.iter().any(|p| p.is_match(url)) {
        return false;
    }
    patterns.include.iter().any(|p| p.is_match(url))
}

/// True when the normalized URL key has already been visited.
pub fn is_visited(visited: &HashSet<String>, normalized: &str) -> bool {
    visited.contains(normalized)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a URL for deduplication and fingerprinting.
///
/// Scheme and host are lower-cased (the `url` crate does this on parse), the
/// fragment is removed, the query keeps only `keep_query_params`, and a
/// trailing slash is trimmed from every path but the root.
pub fn normalize_url(url: &Url, keep_query_params: &[String]) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| keep_query_params.iter().any(|p| p == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        normalized.set_query(None);
    } else {
        normalized.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = normalized.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        normalized.set_path(if trimmed.is_empty() { "/" } else { &trimmed });
    }

    normalized
}

// ---------------------------------------------------------------------------
// Link following
// ---------------------------------------------------------------------------

/// Whether a discovered link should be enqueued for traversal.
pub fn should_follow(url: &Url, allowed_hosts: &HashSet<String>) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }

    match url.host_str() {
        Some(host) if allowed_hosts.contains(&host.to_ascii_lowercase()) => {}
        _ => return false,
    }

    let path = url.path().to_ascii_lowercase();
    !BINARY_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
