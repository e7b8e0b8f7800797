//! Page fetching: the [`Fetcher`] seam and its reqwest-backed implementation.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use deltacrawl_shared::{DeltaCrawlError, Result};

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("deltacrawl/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// FetchedPage / FetchError
// ---------------------------------------------------------------------------

/// A fetched HTML page and the links found on it.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub html: String,
    /// Absolute links found on the page, fragments removed.
    pub links: Vec<Url>,
}

/// A per-URL fetch failure. Never aborts a crawl.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Timeout, 5xx, 429, or transport failure.
    #[error("transient fetch failure for {url}: {message}")]
    Transient { url: String, message: String },

    /// Bad scheme, blocked host, 4xx, or non-HTML content.
    #[error("fetch failed for {url}: {message}")]
    Terminal { url: String, message: String },
}

impl FetchError {
    pub fn transient(url: &Url, message: impl Into<String>) -> Self {
        Self::Transient {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn terminal(url: &Url, message: impl Into<String>) -> Self {
        Self::Terminal {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Retrieves one page. Implemented over HTTP in production and in memory in tests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError>;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// reqwest-backed [`Fetcher`] with SSRF protection.
pub struct HttpFetcher {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpFetcher {
    /// Build a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| DeltaCrawlError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (for tests against mock servers).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::terminal(url, "unsupported scheme"));
        }
        if !self.allow_localhost && is_ssrf_target(url) {
            return Err(FetchError::terminal(url, "SSRF protection: blocked"));
        }

        debug!(%url, "fetching page");

        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            // Redirect loops and builder errors are permanent.
            if e.is_redirect() || e.is_builder() {
                FetchError::terminal(url, e.to_string())
            } else {
                FetchError::transient(url, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {status}");
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(FetchError::transient(url, message))
            } else {
                Err(FetchError::terminal(url, message))
            };
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            // Missing header: assume HTML.
            .unwrap_or(true);
        if !is_html {
            return Err(FetchError::terminal(url, "non-HTML content"));
        }

        let final_url = response.url().clone();
        let html = response
            .text()
            .await
            .map_err(|e| FetchError::transient(url, format!("body read failed: {e}")))?;

        let links = extract_links(&html, &final_url);

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            html,
            links,
        })
    }
}

// ---------------------------------------------------------------------------
// Link extraction
// ---------------------------------------------------------------------------

/// Extract all links from a document, resolved against the base URL.
pub fn extract_links(html: &str, base_url: &Url) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for el in doc.select(&link_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();

        // Skip anchors, javascript:, mailto:, tel:
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }

        if let Ok(mut resolved) = base_url.join(href) {
            resolved.set_fragment(None);
            links.push(resolved);
        }
    }

    links
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn html_response(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/html")
    }

    #[test]
    fn extracts_and_resolves_links() {
        let html = r##"<html><body>
            <a href="/page2">Page 2</a>
            <a href="https://external.com">External</a>
            <a href="#section">Anchor</a>
            <a href="relative/path#frag">Relative</a>
            <a href="mailto:sales@example.com">Mail</a>
            <a href="tel:+49123">Call</a>
        </body></html>"##;

        let base = Url::parse("https://www.bmw.de/de/page1").unwrap();
        let links: Vec<String> = extract_links(html, &base)
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(
            links,
            vec![
                "https://www.bmw.de/page2",
                "https://external.com/",
                "https://www.bmw.de/de/relative/path",
            ]
        );
    }

    #[test]
    fn ssrf_blocks_private_targets() {
        for raw in [
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://127.0.0.1:8080/",
            "http://localhost:3000/api",
            "http://[::1]/",
            "file:///etc/passwd",
        ] {
            let url = Url::parse(raw).unwrap();
            assert!(is_ssrf_target(&url), "{raw} should be blocked");
        }

        let url = Url::parse("https://www.audi.de/de/modelle/").unwrap();
        assert!(!is_ssrf_target(&url));
    }

    #[tokio::test]
    async fn fetches_html_and_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(html_response(r#"<a href="/models/ix">iX</a>"#))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        let url = Url::parse(&format!("{}/models", server.uri())).unwrap();
        let page = fetcher.fetch(&url).await.unwrap();

        assert_eq!(page.status, 200);
        assert_eq!(page.links.len(), 1);
        assert_eq!(page.links[0].path(), "/models/ix");
    }

    #[tokio::test]
    async fn classifies_http_failures() {
        let server = MockServer::start().await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/brochure"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(vec![0x25, 0x50, 0x44, 0x46], "application/pdf"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        let at = |p: &str| Url::parse(&format!("{}{p}", server.uri())).unwrap();

        assert!(fetcher.fetch(&at("/down")).await.unwrap_err().is_transient());
        assert!(!fetcher.fetch(&at("/missing")).await.unwrap_err().is_transient());
        assert!(!fetcher.fetch(&at("/brochure")).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn blocks_localhost_by_default() {
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("SSRF"));
    }
}
