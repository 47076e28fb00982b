//! Feed fetcher.
//!
//! Retrieves one feed document over HTTP with a bounded timeout and parses
//! it into [`Entry`] values. Failures are returned as [`FetchError`] and are
//! meant to be logged by the caller, never propagated as fatal.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use feed_rs::parser;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::{FetchError, FetchErrorKind};
use crate::feed::types::Entry;
use crate::{RelayError, Result};

/// Source of feed entries.
///
/// The poll cycle only depends on this trait so tests can substitute an
/// in-memory implementation for the network.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the source and return its entries in feed order.
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<Entry>, FetchError>;
}

/// HTTP feed fetcher backed by reqwest and feed-rs.
pub struct HttpFetcher {
    client: Client,
    max_feed_size: u64,
}

impl HttpFetcher {
    /// Create a new fetcher from the fetch configuration.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| RelayError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_feed_size: config.max_feed_size_bytes,
        })
    }

    async fn fetch_body(&self, url: &str) -> std::result::Result<Vec<u8>, FetchErrorKind> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        if response.status() != StatusCode::OK {
            return Err(FetchErrorKind::Status(response.status().as_u16()));
        }

        if let Some(size) = response.content_length() {
            if size > self.max_feed_size {
                return Err(FetchErrorKind::TooLarge {
                    size,
                    max: self.max_feed_size,
                });
            }
        }

        let bytes = response.bytes().await.map_err(classify)?;
        if bytes.len() as u64 > self.max_feed_size {
            return Err(FetchErrorKind::TooLarge {
                size: bytes.len() as u64,
                max: self.max_feed_size,
            });
        }

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<Entry>, FetchError> {
        debug!("Fetching {}", url);

        let body = self
            .fetch_body(url)
            .await
            .map_err(|cause| FetchError::new(url, cause))?;
        let entries = parse_entries(&body).map_err(|cause| FetchError::new(url, cause))?;

        debug!("Fetched {} entries from {}", entries.len(), url);
        Ok(entries)
    }
}

/// Map a reqwest error onto the fetch error taxonomy.
fn classify(e: reqwest::Error) -> FetchErrorKind {
    if e.is_timeout() {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::Transport(e.to_string())
    }
}

/// Parse an RSS or Atom document into entries, preserving feed order.
///
/// Items without an ID are keyed by their link, so retitling an item does
/// not make it new.
pub fn parse_entries(bytes: &[u8]) -> std::result::Result<Vec<Entry>, FetchErrorKind> {
    // Leave missing IDs blank; Entry::from_parts substitutes the link
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)
        .map_err(|e| FetchErrorKind::Parse(e.to_string()))?;

    Ok(feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let title = entry.title.map(|t| t.content);
            let parsed = Entry::from_parts(Some(&entry.id), title, link);
            if parsed.is_none() {
                debug!("Skipping entry without ID or link");
            }
            parsed
        })
        .collect())
}

/// Validate a source URL before it is subscribed.
///
/// The URL must be http(s) with a host. Unless `allow_private` is set,
/// loopback, private and link-local addresses and intranet-style hostnames
/// are refused.
pub fn validate_url(url: &str, allow_private: bool) -> Result<()> {
    let parsed =
        url::Url::parse(url).map_err(|e| RelayError::Validation(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RelayError::Validation(format!(
                "unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| RelayError::Validation("URL has no host".to_string()))?;

    if allow_private {
        return Ok(());
    }

    let private = match host {
        url::Host::Domain(domain) => is_internal_hostname(domain),
        url::Host::Ipv4(ip) => is_private_ip(&IpAddr::V4(ip)),
        url::Host::Ipv6(ip) => is_private_ip(&IpAddr::V6(ip)),
    };

    if private {
        return Err(RelayError::Validation(format!(
            "private or local host not allowed: {host}"
        )));
    }

    Ok(())
}

fn is_internal_hostname(host: &str) -> bool {
    const SUFFIXES: [&str; 6] = [".local", ".localhost", ".internal", ".intranet", ".lan", ".home"];

    let host = host.to_lowercase();
    host == "localhost" || SUFFIXES.iter().any(|s| host.ends_with(s))
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_documentation()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (first & 0xffc0) == 0xfe80
        }
    }
}
