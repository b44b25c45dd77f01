//! Upstream feed access: outbound URL guarding, schema discovery, and the
//! paginated fetch client used by the sync pipeline.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ipnet::IpNet;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "polirank-feed";

/// Keys under which feed responses carry their record list.
const RECORD_LIST_KEYS: &[&str] = &["results", "records", "items", "data", "value"];

/// Keys under which feed responses carry a continuation link.
const NEXT_LINK_KEYS: &[&str] = &["next", "next_link", "nextLink", "@odata.nextLink", "next_page"];

/// Keys under which the metadata document lists its collections.
const COLLECTION_LIST_KEYS: &[&str] = &["collections", "datasets", "tables", "resources"];

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid outbound url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("host {host} is not covered by the outbound allow-list")]
    DisallowedHost { host: String },
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("upstream status {status} for {url} still failing after {attempts} attempts")]
    Transient {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("fatal upstream status {status} for {url}")]
    Fatal { status: u16, url: String },
    #[error("transport failure for {url}: {reason}")]
    Transport { url: String, reason: String },
    #[error("undecodable payload from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// Outbound URL gate. Every feed fetch, metadata included, passes through here
/// before a request is issued; continuation links are re-checked like any
/// other URL.
#[derive(Debug, Clone)]
pub struct UrlGuard {
    allowed_hosts: Vec<String>,
    blocked_nets: Arc<Vec<IpNet>>,
}

fn blocked_nets() -> Vec<IpNet> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "100.64.0.0/10",
        "169.254.0.0/16",
        "127.0.0.0/8",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|cidr| cidr.parse().expect("static cidr literal"))
    .collect()
}

impl UrlGuard {
    pub fn new<I, S>(allowed_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
            blocked_nets: Arc::new(blocked_nets()),
        }
    }

    /// Validate the URL itself: scheme, allow-list membership, and literal IP
    /// ranges. Does not touch the network.
    pub fn check(&self, raw: &str) -> Result<(), GuardError> {
        let parsed = Url::parse(raw).map_err(|err| GuardError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(GuardError::InvalidUrl {
                    url: raw.to_string(),
                    reason: format!("scheme {other} is not allowed outbound"),
                })
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| GuardError::InvalidUrl {
                url: raw.to_string(),
                reason: "url has no host".to_string(),
            })?
            .to_ascii_lowercase();

        // IP literals are range-checked before the allow-list so a blocked
        // address can never be configured back in.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            if self.ip_blocked(&ip) {
                return Err(GuardError::DisallowedHost { host });
            }
            if self.allowed_hosts.iter().any(|allowed| allowed == &host) {
                return Ok(());
            }
            return Err(GuardError::DisallowedHost { host });
        }

        if self.host_allowed(&host) {
            Ok(())
        } else {
            Err(GuardError::DisallowedHost { host })
        }
    }

    /// `check` plus DNS resolution: every address the hostname resolves to
    /// must clear the blocked ranges. A hostname that cannot be resolved is
    /// rejected rather than given the benefit of the doubt.
    pub async fn check_resolved(&self, raw: &str) -> Result<(), GuardError> {
        self.check(raw)?;

        let parsed = Url::parse(raw).map_err(|err| GuardError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;
        let host = match parsed.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return Ok(()),
        };
        if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        let port = parsed.port().unwrap_or(match parsed.scheme() {
            "https" => 443,
            _ => 80,
        });
        let addrs = match tokio::net::lookup_host((host.clone(), port)).await {
            Ok(addrs) => addrs,
            Err(err) => {
                warn!(%host, error = %err, "dns resolution failed for outbound host");
                return Err(GuardError::DisallowedHost { host });
            }
        };
        for addr in addrs {
            if self.ip_blocked(&addr.ip()) {
                warn!(%host, ip = %addr.ip(), "outbound host resolved to a blocked address");
                return Err(GuardError::DisallowedHost { host });
            }
        }
        Ok(())
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    }

    fn ip_blocked(&self, ip: &IpAddr) -> bool {
        self.blocked_nets.iter().any(|net| net.contains(ip))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    if status == 429 || (500..=599).contains(&status) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Raw reply from the transport layer; the client decides what to do with the
/// status.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
#[error("{reason}")]
pub struct TransportError {
    pub reason: String,
    pub retryable: bool,
}

/// Minimal HTTP surface the fetch client needs; tests drive the client with a
/// scripted implementation.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<FeedResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// reqwest-backed transport. Re-validates every URL with DNS resolution so a
/// hostname that clears the literal checks cannot point the request at an
/// internal address.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    guard: UrlGuard,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig, guard: UrlGuard) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, guard })
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<FeedResponse, TransportError> {
        if let Err(err) = self.guard.check_resolved(url).await {
            return Err(TransportError {
                reason: err.to_string(),
                retryable: false,
            });
        }

        let response = self.client.get(url).send().await.map_err(|err| TransportError {
            retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
            reason: err.to_string(),
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError {
                retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
                reason: err.to_string(),
            })?
            .to_vec();

        Ok(FeedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// One discoverable collection at the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub url: String,
    pub fields: Vec<String>,
}

/// In-memory registry of discovered collections. Nothing about the upstream
/// naming is assumed; whatever the metadata document advertises is what gets
/// registered.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    collections: Vec<CollectionInfo>,
}

impl SchemaRegistry {
    pub fn parse(metadata_url: &Url, document: &JsonValue) -> Result<Self, FeedError> {
        let entries = if let Some(array) = document.as_array() {
            array.as_slice()
        } else {
            let mut found: Option<&[JsonValue]> = None;
            for key in COLLECTION_LIST_KEYS {
                if let Some(array) = document.get(*key).and_then(JsonValue::as_array) {
                    found = Some(array.as_slice());
                    break;
                }
            }
            found.ok_or_else(|| FeedError::Decode {
                url: metadata_url.to_string(),
                reason: "metadata document carries no collection list".to_string(),
            })?
        };

        let mut collections = Vec::new();
        for entry in entries {
            let Some(name) = string_at(entry, &["name", "id", "title"]) else {
                debug!("skipping metadata entry without a name");
                continue;
            };
            let Some(raw_url) = string_at(entry, &["url", "href", "path"]) else {
                debug!(collection = %name, "skipping metadata entry without a url");
                continue;
            };
            let url = match metadata_url.join(&raw_url) {
                Ok(abs) => abs.to_string(),
                Err(err) => {
                    warn!(collection = %name, raw = %raw_url, error = %err, "unusable collection url");
                    continue;
                }
            };
            let fields = field_names(entry);
            collections.push(CollectionInfo { name, url, fields });
        }

        Ok(Self { collections })
    }

    /// First candidate with a case-insensitive exact name match wins; when no
    /// candidate matches exactly, the first whose text appears inside a
    /// collection name wins. Absence is `None`, never an error.
    pub fn resolve<S: AsRef<str>>(&self, candidates: &[S]) -> Option<&CollectionInfo> {
        for candidate in candidates {
            let want = candidate.as_ref().to_ascii_lowercase();
            if let Some(hit) = self
                .collections
                .iter()
                .find(|c| c.name.to_ascii_lowercase() == want)
            {
                return Some(hit);
            }
        }
        for candidate in candidates {
            let want = candidate.as_ref().to_ascii_lowercase();
            if want.is_empty() {
                continue;
            }
            if let Some(hit) = self
                .collections
                .iter()
                .find(|c| c.name.to_ascii_lowercase().contains(&want))
            {
                return Some(hit);
            }
        }
        None
    }

    pub fn collections(&self) -> &[CollectionInfo] {
        &self.collections
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

fn string_at(value: &JsonValue, keys: &[&str]) -> Option<String> {
    for key in keys {
        match value.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn field_names(entry: &JsonValue) -> Vec<String> {
    let mut names = Vec::new();
    for key in ["fields", "columns"] {
        if let Some(array) = entry.get(key).and_then(JsonValue::as_array) {
            for field in array {
                match field {
                    JsonValue::String(s) if !s.trim().is_empty() => names.push(s.trim().to_string()),
                    JsonValue::Object(_) => {
                        if let Some(name) = string_at(field, &["name", "id"]) {
                            names.push(name);
                        }
                    }
                    _ => {}
                }
            }
            break;
        }
    }
    names
}

/// Filter/sort options for one collection listing.
#[derive(Debug, Clone, Default)]
pub struct FeedQuery {
    pub filters: Vec<(String, String)>,
    pub sort: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PagingConfig {
    pub page_size: usize,
    pub polite_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            polite_delay: Duration::from_millis(250),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One fetched page of raw records.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub url: String,
    pub records: Vec<JsonValue>,
}

/// Entry point to the upstream feed: one metadata discovery call plus a page
/// cursor per collection.
#[derive(Clone)]
pub struct FeedClient {
    transport: Arc<dyn FeedTransport>,
    guard: UrlGuard,
    paging: PagingConfig,
}

impl FeedClient {
    pub fn new(transport: Arc<dyn FeedTransport>, guard: UrlGuard, paging: PagingConfig) -> Self {
        Self {
            transport,
            guard,
            paging,
        }
    }

    pub async fn discover(&self, metadata_url: &str) -> Result<SchemaRegistry, FeedError> {
        let (document, final_url) = fetch_json(
            self.transport.as_ref(),
            &self.guard,
            &self.paging.backoff,
            metadata_url,
        )
        .await?;
        // Relative collection URLs resolve against wherever the metadata
        // document was actually served from.
        let base = Url::parse(&final_url).map_err(|err| GuardError::InvalidUrl {
            url: final_url.clone(),
            reason: err.to_string(),
        })?;
        let registry = SchemaRegistry::parse(&base, &document)?;
        debug!(collections = registry.collections().len(), "discovered feed schema");
        Ok(registry)
    }

    /// Start a fresh page sequence for a collection. The cursor is finite and
    /// not restartable; call `pages` again to start over from page one.
    pub fn pages(&self, collection_url: &str, query: FeedQuery) -> PageCursor {
        PageCursor {
            transport: Arc::clone(&self.transport),
            guard: self.guard.clone(),
            paging: self.paging.clone(),
            base_url: collection_url.to_string(),
            query,
            offset: 0,
            pending_url: None,
            pages_fetched: 0,
            done: false,
        }
    }
}

/// Pull-based page sequence: continuation links when the server provides
/// them, manual offset advance otherwise, done on the first short page.
pub struct PageCursor {
    transport: Arc<dyn FeedTransport>,
    guard: UrlGuard,
    paging: PagingConfig,
    base_url: String,
    query: FeedQuery,
    offset: usize,
    pending_url: Option<String>,
    pages_fetched: usize,
    done: bool,
}

impl PageCursor {
    pub async fn next_page(&mut self) -> Result<Option<RecordPage>, FeedError> {
        if self.done {
            return Ok(None);
        }

        let url = match self.pending_url.take() {
            Some(url) => url,
            None => self.offset_url()?,
        };

        // Polite spacing between consecutive page fetches, success or not.
        if self.pages_fetched > 0 && !self.paging.polite_delay.is_zero() {
            tokio::time::sleep(self.paging.polite_delay).await;
        }

        let (value, final_url) = match fetch_json(
            self.transport.as_ref(),
            &self.guard,
            &self.paging.backoff,
            &url,
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };
        self.pages_fetched += 1;

        let envelope = match parse_envelope(&final_url, &value) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };
        debug!(url = %final_url, records = envelope.records.len(), "fetched feed page");

        // Keep the offset in step with every page so a source that stops
        // sending continuation links mid-stream resumes at the right place.
        self.offset += envelope.records.len();

        // Relative continuation links resolve against the URL the page was
        // served from, so a redirected collection keeps paging in place.
        if let Some(link) = envelope.next_link {
            let absolute = Url::parse(&final_url)
                .and_then(|base| base.join(&link))
                .map_err(|err| GuardError::InvalidUrl {
                    url: link.clone(),
                    reason: err.to_string(),
                })?;
            self.pending_url = Some(absolute.to_string());
        } else if envelope.records.len() < self.paging.page_size {
            self.done = true;
        }

        Ok(Some(RecordPage {
            url: final_url,
            records: envelope.records,
        }))
    }

    fn offset_url(&self) -> Result<String, FeedError> {
        let mut url = Url::parse(&self.base_url).map_err(|err| GuardError::InvalidUrl {
            url: self.base_url.clone(),
            reason: err.to_string(),
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("limit", &self.paging.page_size.to_string());
            pairs.append_pair("offset", &self.offset.to_string());
            for (key, value) in &self.query.filters {
                pairs.append_pair(key, value);
            }
            if let Some(sort) = &self.query.sort {
                pairs.append_pair("sort", sort);
            }
        }
        Ok(url.to_string())
    }
}

#[derive(Debug)]
struct Envelope {
    records: Vec<JsonValue>,
    next_link: Option<String>,
}

fn parse_envelope(url: &str, value: &JsonValue) -> Result<Envelope, FeedError> {
    if let Some(array) = value.as_array() {
        return Ok(Envelope {
            records: array.clone(),
            next_link: None,
        });
    }

    let mut records: Option<Vec<JsonValue>> = None;
    for key in RECORD_LIST_KEYS {
        if let Some(array) = value.get(*key).and_then(JsonValue::as_array) {
            records = Some(array.clone());
            break;
        }
    }
    let records = records.ok_or_else(|| FeedError::Decode {
        url: url.to_string(),
        reason: "response envelope carries no record list".to_string(),
    })?;

    let next_link = NEXT_LINK_KEYS.iter().find_map(|key| {
        value
            .get(*key)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    });

    Ok(Envelope { records, next_link })
}

/// One guarded, retried fetch returning decoded JSON plus the URL the reply
/// was finally served from (the post-redirect base for relative links).
/// 429/5xx and retryable transport failures back off exponentially up to the
/// policy limit; any other non-2xx status fails immediately.
async fn fetch_json(
    transport: &dyn FeedTransport,
    guard: &UrlGuard,
    policy: &BackoffPolicy,
    url: &str,
) -> Result<(JsonValue, String), FeedError> {
    guard.check(url)?;

    let mut attempt = 0usize;
    loop {
        match transport.get(url).await {
            Ok(response) if (200..300).contains(&response.status) => {
                let value =
                    serde_json::from_slice(&response.body).map_err(|err| FeedError::Decode {
                        url: url.to_string(),
                        reason: err.to_string(),
                    })?;
                return Ok((value, response.final_url));
            }
            Ok(response) => match classify_status(response.status) {
                RetryDisposition::Retryable if attempt < policy.max_retries => {
                    warn!(url = %url, status = response.status, attempt, "retryable upstream status");
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                RetryDisposition::Retryable => {
                    return Err(FeedError::Transient {
                        status: response.status,
                        url: url.to_string(),
                        attempts: attempt + 1,
                    });
                }
                RetryDisposition::NonRetryable => {
                    return Err(FeedError::Fatal {
                        status: response.status,
                        url: url.to_string(),
                    });
                }
            },
            Err(err) if err.retryable && attempt < policy.max_retries => {
                warn!(url = %url, error = %err, attempt, "retryable transport failure");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(FeedError::Transport {
                    url: url.to_string(),
                    reason: err.reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Mutex;

    enum Reply {
        Json(JsonValue),
        Status(u16),
        Moved(String, JsonValue),
    }

    struct ScriptedTransport {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<(&str, Vec<Reply>)>) -> Self {
            let mut replies = HashMap::new();
            for (url, queue) in script {
                replies.insert(url.to_string(), queue.into_iter().collect::<VecDeque<_>>());
            }
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }

        async fn requests(&self) -> Vec<String> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl FeedTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<FeedResponse, TransportError> {
            self.requests.lock().await.push(url.to_string());
            let mut replies = self.replies.lock().await;
            let queue = replies
                .get_mut(url)
                .unwrap_or_else(|| panic!("unexpected request for {url}"));
            let reply = queue.pop_front().expect("script exhausted");
            Ok(match reply {
                Reply::Json(value) => FeedResponse {
                    status: 200,
                    final_url: url.to_string(),
                    body: serde_json::to_vec(&value).expect("serialize"),
                },
                Reply::Status(status) => FeedResponse {
                    status,
                    final_url: url.to_string(),
                    body: Vec::new(),
                },
                Reply::Moved(final_url, value) => FeedResponse {
                    status: 200,
                    final_url,
                    body: serde_json::to_vec(&value).expect("serialize"),
                },
            })
        }
    }

    fn test_guard() -> UrlGuard {
        UrlGuard::new(["allowed.example"])
    }

    fn fast_paging(page_size: usize) -> PagingConfig {
        PagingConfig {
            page_size,
            polite_delay: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    #[test]
    fn guard_rejects_hosts_outside_the_allow_list() {
        let guard = test_guard();
        assert!(matches!(
            guard.check("https://evil.example/x"),
            Err(GuardError::DisallowedHost { .. })
        ));
    }

    #[test]
    fn guard_rejects_link_local_and_private_literals() {
        let guard = test_guard();
        for url in [
            "http://169.254.169.254/x",
            "http://10.0.0.1/x",
            "http://172.16.0.1/x",
            "http://192.168.1.1/x",
            "http://127.0.0.1/x",
            "http://[::1]/x",
        ] {
            assert!(
                matches!(guard.check(url), Err(GuardError::DisallowedHost { .. })),
                "expected {url} to be rejected"
            );
        }
    }

    #[test]
    fn guard_accepts_allow_listed_subdomains() {
        let guard = test_guard();
        assert!(guard.check("https://sub.allowed.example/x").is_ok());
        assert!(guard.check("https://allowed.example/x").is_ok());
        // Suffix tricks do not count as subdomains.
        assert!(guard.check("https://notallowed.example/x").is_err());
    }

    #[test]
    fn guard_rejects_unparsable_and_non_http_urls() {
        let guard = test_guard();
        assert!(matches!(
            guard.check("not a url"),
            Err(GuardError::InvalidUrl { .. })
        ));
        assert!(matches!(
            guard.check("file:///etc/passwd"),
            Err(GuardError::InvalidUrl { .. })
        ));
        assert!(matches!(
            guard.check("ftp://allowed.example/x"),
            Err(GuardError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn resolution_cannot_launder_an_allowed_name_into_a_blocked_range() {
        // localhost resolves to loopback everywhere; an unresolvable host is
        // rejected as well.
        let guard = UrlGuard::new(["localhost"]);
        assert!(matches!(
            guard.check_resolved("http://localhost/x").await,
            Err(GuardError::DisallowedHost { .. })
        ));
        // Literal checks still pass without touching the resolver.
        assert!(guard.check("http://localhost/x").is_ok());
    }

    #[test]
    fn registry_parses_nested_and_bare_collection_lists() {
        let base = Url::parse("https://allowed.example/api/meta").expect("url");

        let nested = json!({
            "datasets": [
                {"name": "Parties", "url": "/api/parties", "fields": ["id", "name"]},
                {"id": 7, "href": "https://allowed.example/api/bills",
                 "columns": [{"name": "id"}, {"id": "title"}]},
                {"name": "broken-no-url"}
            ]
        });
        let registry = SchemaRegistry::parse(&base, &nested).expect("parse");
        assert_eq!(registry.collections().len(), 2);
        assert_eq!(registry.collections()[0].name, "Parties");
        assert_eq!(registry.collections()[0].url, "https://allowed.example/api/parties");
        assert_eq!(registry.collections()[1].name, "7");
        assert_eq!(registry.collections()[1].fields, vec!["id", "title"]);

        let bare = json!([{"name": "votes", "url": "votes"}]);
        let registry = SchemaRegistry::parse(&base, &bare).expect("parse");
        assert_eq!(registry.collections()[0].url, "https://allowed.example/api/votes");

        let empty = json!({"nothing": true});
        assert!(matches!(
            SchemaRegistry::parse(&base, &empty),
            Err(FeedError::Decode { .. })
        ));
    }

    #[test]
    fn resolver_prefers_exact_match_in_candidate_order() {
        let base = Url::parse("https://allowed.example/meta").expect("url");
        let doc = json!({
            "collections": [
                {"name": "acts-archive", "url": "/acts-archive"},
                {"name": "Bar", "url": "/bar"},
                {"name": "bills", "url": "/bills"}
            ]
        });
        let registry = SchemaRegistry::parse(&base, &doc).expect("parse");

        // Exact match on a later candidate beats a substring hit on an earlier one.
        let hit = registry.resolve(&["acts", "bills"]).expect("resolved");
        assert_eq!(hit.name, "bills");

        let hit = registry.resolve(&["Foo", "Bar"]).expect("resolved");
        assert_eq!(hit.name, "Bar");

        let hit = registry.resolve(&["archive"]).expect("resolved");
        assert_eq!(hit.name, "acts-archive");

        assert!(registry.resolve(&["missing"]).is_none());
        assert!(SchemaRegistry::default().resolve(&["anything"]).is_none());
    }

    #[tokio::test]
    async fn cursor_follows_continuation_links_without_drops_or_duplicates() {
        let page_one = "https://allowed.example/api/bills?limit=2&offset=0";
        let transport = ScriptedTransport::new(vec![
            (
                page_one,
                vec![Reply::Json(json!({
                    "results": [{"id": 1}, {"id": 2}],
                    "next": "https://allowed.example/api/bills?page=2"
                }))],
            ),
            (
                "https://allowed.example/api/bills?page=2",
                vec![Reply::Json(json!({
                    "results": [{"id": 3}, {"id": 4}],
                    // Relative continuation resolves against the page URL.
                    "next": "bills?page=3"
                }))],
            ),
            (
                "https://allowed.example/api/bills?page=3",
                vec![Reply::Json(json!({"results": [{"id": 5}]}))],
            ),
        ]);
        let client = FeedClient::new(Arc::new(transport), test_guard(), fast_paging(2));

        let mut cursor = client.pages("https://allowed.example/api/bills", FeedQuery::default());
        let mut seen = Vec::new();
        while let Some(page) = cursor.next_page().await.expect("page") {
            for record in page.records {
                seen.push(record["id"].as_i64().expect("id"));
            }
        }

        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(cursor.next_page().await.expect("done").is_none());
    }

    #[tokio::test]
    async fn cursor_falls_back_to_offset_paging() {
        let transport = ScriptedTransport::new(vec![
            (
                "https://allowed.example/api/parties?limit=2&offset=0",
                vec![Reply::Json(json!({"items": [{"id": "a"}, {"id": "b"}]}))],
            ),
            (
                "https://allowed.example/api/parties?limit=2&offset=2",
                vec![Reply::Json(json!({"items": [{"id": "c"}]}))],
            ),
        ]);
        let client = FeedClient::new(Arc::new(transport), test_guard(), fast_paging(2));

        let mut cursor = client.pages("https://allowed.example/api/parties", FeedQuery::default());
        let mut pages = 0;
        let mut ids = Vec::new();
        while let Some(page) = cursor.next_page().await.expect("page") {
            pages += 1;
            ids.extend(
                page.records
                    .iter()
                    .map(|r| r["id"].as_str().expect("id").to_string()),
            );
        }
        assert_eq!(pages, 2);
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn continuation_links_resolve_against_the_redirected_base() {
        let transport = ScriptedTransport::new(vec![
            (
                "https://allowed.example/api/bills?limit=2&offset=0",
                vec![Reply::Moved(
                    "https://allowed.example/v2/bills?limit=2&offset=0".to_string(),
                    json!({"results": [{"id": 1}, {"id": 2}], "next": "bills?page=2"}),
                )],
            ),
            (
                // The relative link joins against the URL the page was served
                // from, not the one requested.
                "https://allowed.example/v2/bills?page=2",
                vec![Reply::Json(json!({"results": [{"id": 3}]}))],
            ),
        ]);
        let transport = Arc::new(transport);
        let client = FeedClient::new(
            Arc::clone(&transport) as Arc<dyn FeedTransport>,
            test_guard(),
            fast_paging(2),
        );

        let mut cursor = client.pages("https://allowed.example/api/bills", FeedQuery::default());
        let first = cursor.next_page().await.expect("page").expect("some");
        assert_eq!(first.url, "https://allowed.example/v2/bills?limit=2&offset=0");
        assert_eq!(first.records.len(), 2);
        let second = cursor.next_page().await.expect("page").expect("some");
        assert_eq!(second.records[0]["id"], 3);
        assert!(cursor.next_page().await.expect("done").is_none());
        assert_eq!(
            transport.requests().await,
            vec![
                "https://allowed.example/api/bills?limit=2&offset=0",
                "https://allowed.example/v2/bills?page=2",
            ]
        );
    }

    #[tokio::test]
    async fn transient_statuses_are_retried_until_success() {
        let url = "https://allowed.example/api/votes?limit=5&offset=0";
        let transport = ScriptedTransport::new(vec![(
            url,
            vec![
                Reply::Status(429),
                Reply::Status(503),
                Reply::Json(json!({"records": [{"id": 1}]})),
            ],
        )]);
        let transport = Arc::new(transport);
        let client = FeedClient::new(Arc::clone(&transport) as Arc<dyn FeedTransport>, test_guard(), fast_paging(5));

        let mut cursor = client.pages("https://allowed.example/api/votes", FeedQuery::default());
        let page = cursor.next_page().await.expect("page").expect("some");
        assert_eq!(page.records.len(), 1);
        assert_eq!(transport.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn fatal_statuses_fail_without_retry() {
        let url = "https://allowed.example/api/votes?limit=5&offset=0";
        let transport = ScriptedTransport::new(vec![(url, vec![Reply::Status(404)])]);
        let transport = Arc::new(transport);
        let client = FeedClient::new(Arc::clone(&transport) as Arc<dyn FeedTransport>, test_guard(), fast_paging(5));

        let mut cursor = client.pages("https://allowed.example/api/votes", FeedQuery::default());
        let err = cursor.next_page().await.expect_err("fatal");
        assert!(matches!(err, FeedError::Fatal { status: 404, .. }));
        assert_eq!(transport.requests().await.len(), 1);
        // The cursor is dead after an error.
        assert!(cursor.next_page().await.expect("done").is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let url = "https://allowed.example/api/votes?limit=5&offset=0";
        let transport = ScriptedTransport::new(vec![(
            url,
            vec![
                Reply::Status(500),
                Reply::Status(500),
                Reply::Status(500),
                Reply::Status(500),
            ],
        )]);
        let transport = Arc::new(transport);
        let client = FeedClient::new(Arc::clone(&transport) as Arc<dyn FeedTransport>, test_guard(), fast_paging(5));

        let mut cursor = client.pages("https://allowed.example/api/votes", FeedQuery::default());
        let err = cursor.next_page().await.expect_err("transient");
        assert!(matches!(
            err,
            FeedError::Transient {
                status: 500,
                attempts: 4,
                ..
            }
        ));
        assert_eq!(transport.requests().await.len(), 4);
    }

    #[tokio::test]
    async fn continuation_links_pass_through_the_guard() {
        let transport = ScriptedTransport::new(vec![(
            "https://allowed.example/api/bills?limit=2&offset=0",
            vec![Reply::Json(json!({
                "results": [{"id": 1}, {"id": 2}],
                "next": "http://169.254.169.254/latest/meta-data"
            }))],
        )]);
        let client = FeedClient::new(Arc::new(transport), test_guard(), fast_paging(2));

        let mut cursor = client.pages("https://allowed.example/api/bills", FeedQuery::default());
        let first = cursor.next_page().await.expect("page").expect("some");
        assert_eq!(first.records.len(), 2);
        let err = cursor.next_page().await.expect_err("guarded");
        assert!(matches!(
            err,
            FeedError::Guard(GuardError::DisallowedHost { .. })
        ));
    }

    #[tokio::test]
    async fn discovery_fetches_and_parses_metadata() {
        let transport = ScriptedTransport::new(vec![(
            "https://allowed.example/api/v1/meta",
            vec![Reply::Json(json!({
                "collections": [{"name": "parties", "url": "/api/v1/parties"}]
            }))],
        )]);
        let client = FeedClient::new(Arc::new(transport), test_guard(), fast_paging(10));

        let registry = client
            .discover("https://allowed.example/api/v1/meta")
            .await
            .expect("discover");
        assert_eq!(registry.collections().len(), 1);

        let err = client
            .discover("https://evil.example/api/v1/meta")
            .await
            .expect_err("guarded");
        assert!(matches!(err, FeedError::Guard(_)));
    }

    #[test]
    fn envelope_rejects_objects_without_a_record_list() {
        let err = parse_envelope("https://allowed.example/x", &json!({"total": 3})).expect_err("decode");
        assert!(matches!(err, FeedError::Decode { .. }));
    }

    #[test]
    fn backoff_delays_double_and_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(429), RetryDisposition::Retryable);
        assert_eq!(classify_status(500), RetryDisposition::Retryable);
        assert_eq!(classify_status(503), RetryDisposition::Retryable);
        assert_eq!(classify_status(404), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(401), RetryDisposition::NonRetryable);
    }
}
