//! Candidate discovery for deltacrawl.
//!
//! This crate provides:
//! - [`fetch`]: the [`Fetcher`] seam and the reqwest-backed [`HttpFetcher`]
//! - [`scope`]: URL normalization, glob patterns, link-following rules
//! - [`engine`]: the depth-bounded, pattern-filtered [`PatternCrawler`]

pub mod engine;
pub mod fetch;
pub mod scope;

pub use engine::{CandidateStream, CrawlReport, PatternCrawler};
pub use fetch::{FetchError, FetchedPage, Fetcher, HttpFetcher, extract_links};
pub use scope::{
    PatternSet, glob_to_regex, is_visited, matches_include_exclude, normalize_url, should_follow,
};
