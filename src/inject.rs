//! Web page injection.
//!
//! A user line may name a page between double chevrons, `<<https://example.com>>`.  The marker
//! is cut out of the line, the page is fetched and reduced to plain text, and the text is
//! appended to the same user turn after a blank line.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::debug;

use crate::error::{Error, Result};

/// Largest response body accepted from a page fetch.
const MAX_BODY_SIZE: usize = 5 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("chatloop/", env!("CARGO_PKG_VERSION"));

/// Elements whose entire subtree is dropped from the page text.
const SKIP_TAGS: &[&str] = &["script", "style", "noscript", "svg", "head", "template"];

/// A page reference found in a user line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    /// The address between the chevrons.
    pub url: String,
    /// The line with the marker removed.
    pub remainder: String,
}

impl Injection {
    /// The user turn content: the remainder, a blank line, then the page.
    pub fn compose(&self, page: &str) -> String {
        if self.remainder.is_empty() {
            page.to_string()
        } else {
            format!("{}\n\n{}", self.remainder, page)
        }
    }
}

/// Find a `<<URL>>` marker.
///
/// A marker is `<<`, a single `http://` or `https://` address with no whitespace inside, then the
/// next `>>`.  Anything else between chevrons, such as shift operators or heredocs, is not a
/// marker.  The first marker in the line wins.
pub fn extract_injection(input: &str) -> Option<Injection> {
    let mut from = 0;
    while let Some(offset) = input[from..].find("<<") {
        let open = from + offset;
        let Some(len) = input[open + 2..].find(">>") else {
            return None;
        };
        let close = open + 2 + len;
        let url = input[open + 2..close].trim();
        if is_web_address(url) {
            let remainder = format!("{}{}", &input[..open], &input[close + 2..]);
            return Some(Injection {
                url: url.to_string(),
                remainder: remainder.trim().to_string(),
            });
        }
        from = open + 2;
    }
    None
}

fn is_web_address(candidate: &str) -> bool {
    let rest = candidate
        .strip_prefix("https://")
        .or_else(|| candidate.strip_prefix("http://"));
    match rest {
        Some(rest) => !rest.is_empty() && !candidate.contains(char::is_whitespace),
        None => false,
    }
}

/// Page text ready to send, with what was cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// The text to inject.
    pub text: String,
    /// True when the page exceeded the limit.
    pub truncated: bool,
    /// Characters in the page before truncation.
    pub original_chars: usize,
}

/// Limit page text to `max_chars` characters.
///
/// A page over the limit is prefixed with a note telling the model it only sees the start of
/// the page, and the whole is cut to `max_chars`.
pub fn truncate_page(text: &str, max_chars: usize) -> PageText {
    let original_chars = text.chars().count();
    if original_chars <= max_chars {
        return PageText {
            text: text.to_string(),
            truncated: false,
            original_chars,
        };
    }
    let percent = max_chars as f64 / original_chars as f64 * 100.0;
    let noted = format!(
        "GPT please note that due to length, webpage truncated to first {max_chars} characters, \
         about {percent:.1}%, which may affect your interpretation of it:\n\
         ------------------\n{text}"
    );
    PageText {
        text: noted.chars().take(max_chars).collect(),
        truncated: true,
        original_chars,
    }
}

/// Extract readable text from HTML, dropping scripts and styles.
///
/// Whitespace, line breaks included, collapses to single spaces.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let body = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next());
    let root = body.unwrap_or_else(|| document.root_element());
    let mut parts = Vec::new();
    collect_text(root, &mut parts);
    collapse_whitespace(&parts.join(" "))
}

fn collect_text(element: ElementRef, parts: &mut Vec<String>) {
    if SKIP_TAGS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, parts);
                }
            }
            _ => {}
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Retrieves a page as plain text.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `url` and return its text.
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Fetches pages over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    /// Create a fetcher with a thirty second timeout.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::validation(
                format!("not a web address: {url}"),
                Some("url".to_string()),
            ));
        }
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(format!("Fetching {url} timed out"), None)
            } else {
                Error::connection(format!("Failed to fetch {url}: {e}"), Some(Box::new(e)))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::api(
                status.as_u16(),
                None,
                format!(
                    "fetching {url} returned {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
                None,
            ));
        }
        if response.content_length().unwrap_or(0) > MAX_BODY_SIZE as u64 {
            return Err(Error::validation(
                format!("page at {url} is larger than {MAX_BODY_SIZE} bytes"),
                Some("url".to_string()),
            ));
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await.map_err(|e| {
            Error::connection(format!("Failed to read {url}: {e}"), Some(Box::new(e)))
        })?;
        if body.len() > MAX_BODY_SIZE {
            return Err(Error::validation(
                format!("page at {url} is larger than {MAX_BODY_SIZE} bytes"),
                Some("url".to_string()),
            ));
        }
        debug!(bytes = body.len(), content_type = %content_type, "fetched page");
        let body = String::from_utf8_lossy(&body);
        if content_type.is_empty() || content_type.contains("html") {
            Ok(html_to_text(&body))
        } else {
            Ok(collapse_whitespace(&body))
        }
    }
}
