//! Subscription fetchers: HTTP(S), local file, and token-authenticated API.
//!
//! All fetchers enforce the scheme whitelist, a hard body cap and explicit
//! timeouts. Transient HTTP failures are retried with capped exponential
//! backoff and jitter before surfacing as recoverable fetch errors.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

use sboxpipe_types::{SourceKind, SubscriptionSource};

/// Default response body cap: 2 MiB.
pub const DEFAULT_BODY_CAP: usize = 2 * 1024 * 1024;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default User-Agent sent with subscription requests.
pub const DEFAULT_USER_AGENT: &str = "ClashMeta/1.0";

/// Allowed URL schemes for URL-bearing sources.
pub const SCHEME_WHITELIST: [&str; 3] = ["http", "https", "file"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UserAgent {
    /// `ClashMeta/1.0`
    #[default]
    Default,
    Custom(String),
    /// Omit the header entirely.
    Omit,
}

impl UserAgent {
    fn header_value(&self) -> Option<&str> {
        match self {
            UserAgent::Default => Some(DEFAULT_USER_AGENT),
            UserAgent::Custom(value) => Some(value),
            UserAgent::Omit => None,
        }
    }

    fn cache_token(&self) -> &str {
        match self {
            UserAgent::Default => DEFAULT_USER_AGENT,
            UserAgent::Custom(value) => value,
            UserAgent::Omit => "",
        }
    }
}

/// Per-fetch knobs, derived from profile + CLI flags by the manager.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub body_cap: usize,
    pub user_agent: UserAgent,
    pub force_reload: bool,
    /// Attempts for transient failures; 1 disables retry.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            body_cap: DEFAULT_BODY_CAP,
            user_agent: UserAgent::Default,
            force_reload: false,
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("oversize response body (cap {limit} bytes)")]
    Oversize { limit: usize },
    #[error("http status {status}")]
    Status { status: u16 },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("path escapes fetch base directory: {}", .0.display())]
    PathEscape(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Transient failures are worth a retry; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Network(_) => true,
            FetchError::Status { status } => *status >= 500,
            _ => false,
        }
    }
}

/// Retrieval of raw subscription bytes.
pub trait Fetcher: Send + Sync {
    fn id(&self) -> &'static str;

    fn fetch(
        &self,
        source: &SubscriptionSource,
        options: &FetchOptions,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Validate a source URL against the scheme whitelist before any I/O.
///
/// Bare paths (no scheme separator) are treated as `file`.
pub fn validate_scheme(url: &str) -> Result<&'static str, FetchError> {
    let Some((scheme, _)) = url.split_once("://") else {
        return Ok("file");
    };
    let scheme = scheme.to_ascii_lowercase();
    SCHEME_WHITELIST
        .iter()
        .find(|allowed| **allowed == scheme)
        .copied()
        .ok_or(FetchError::UnsupportedScheme(scheme))
}

/// Pick the fetcher matching a source.
pub fn fetcher_for(source: &SubscriptionSource) -> Result<Box<dyn Fetcher>, FetchError> {
    let scheme = validate_scheme(&source.url)?;
    match source.kind {
        SourceKind::ApiToken => Ok(Box::new(ApiTokenFetcher::from_env())),
        SourceKind::File => Ok(Box::new(FileFetcher::unrestricted())),
        SourceKind::Url => match scheme {
            "file" => Ok(Box::new(FileFetcher::unrestricted())),
            _ => Ok(Box::new(UrlFetcher)),
        },
    }
}

/// HTTP(S) fetcher with automatic gzip/deflate decompression.
pub struct UrlFetcher;

impl Fetcher for UrlFetcher {
    fn id(&self) -> &'static str {
        "url"
    }

    fn fetch(
        &self,
        source: &SubscriptionSource,
        options: &FetchOptions,
    ) -> Result<Vec<u8>, FetchError> {
        validate_scheme(&source.url)?;
        fetch_with_retry(&source.url, options, None)
    }
}

/// HTTP fetcher adding a bearer token. The token is never logged and never
/// stored in the cache.
pub struct ApiTokenFetcher {
    token: String,
}

impl ApiTokenFetcher {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Token from `SBOXPIPE_API_TOKEN`; empty when unset.
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("SBOXPIPE_API_TOKEN").unwrap_or_default(),
        }
    }
}

impl Fetcher for ApiTokenFetcher {
    fn id(&self) -> &'static str {
        "api-token"
    }

    fn fetch(
        &self,
        source: &SubscriptionSource,
        options: &FetchOptions,
    ) -> Result<Vec<u8>, FetchError> {
        validate_scheme(&source.url)?;
        fetch_with_retry(&source.url, options, Some(&self.token))
    }
}

/// Local file fetcher, optionally confined to a base directory.
pub struct FileFetcher {
    base_dir: Option<PathBuf>,
}

impl FileFetcher {
    pub fn confined(base_dir: PathBuf) -> Self {
        Self {
            base_dir: Some(base_dir),
        }
    }

    pub fn unrestricted() -> Self {
        Self { base_dir: None }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, FetchError> {
        let raw = url.strip_prefix("file://").unwrap_or(url);
        let path = PathBuf::from(raw);

        let Some(base) = &self.base_dir else {
            return Ok(path);
        };

        // Canonicalization resolves symlinks, so a link pointing outside
        // the base is caught the same way a `..` traversal is.
        let canonical_base = base.canonicalize()?;
        let canonical = path.canonicalize()?;
        if !canonical.starts_with(&canonical_base) {
            return Err(FetchError::PathEscape(path));
        }
        Ok(canonical)
    }
}

impl Fetcher for FileFetcher {
    fn id(&self) -> &'static str {
        "file"
    }

    fn fetch(
        &self,
        source: &SubscriptionSource,
        options: &FetchOptions,
    ) -> Result<Vec<u8>, FetchError> {
        validate_scheme(&source.url)?;
        let path = self.resolve(&source.url)?;

        let meta = std::fs::metadata(&path)?;
        if meta.len() > options.body_cap as u64 {
            return Err(FetchError::Oversize {
                limit: options.body_cap,
            });
        }
        Ok(std::fs::read(&path)?)
    }
}

fn fetch_with_retry(
    url: &str,
    options: &FetchOptions,
    bearer: Option<&str>,
) -> Result<Vec<u8>, FetchError> {
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match http_fetch_once(url, options, bearer) {
            Ok(body) => return Ok(body),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                std::thread::sleep(backoff_delay(options.base_delay, attempt));
            }
            Err(err) => return Err(err),
        }
    }
}

fn http_fetch_once(
    url: &str,
    options: &FetchOptions,
    bearer: Option<&str>,
) -> Result<Vec<u8>, FetchError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(options.timeout)
        .gzip(true)
        .deflate(true)
        .build()
        .map_err(|e| FetchError::Network(e.to_string()))?;

    let mut request = client.get(url);
    if let Some(ua) = options.user_agent.header_value() {
        request = request.header("User-Agent", ua);
    }
    if let Some(token) = bearer {
        if !token.is_empty() {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
    }

    let response = request.send().map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout(options.timeout)
        } else {
            FetchError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
        });
    }

    // Read one byte past the cap so a lying Content-Length cannot smuggle
    // an oversize body through.
    let mut body = Vec::new();
    let mut limited = response.take(options.body_cap as u64 + 1);
    limited
        .read_to_end(&mut body)
        .map_err(|e| FetchError::Network(e.to_string()))?;
    if body.len() > options.body_cap {
        return Err(FetchError::Oversize {
            limit: options.body_cap,
        });
    }
    Ok(body)
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(8));
    // ±50% jitter.
    let factor = 0.5 + rand::random::<f64>();
    Duration::from_millis((exp.as_millis() as f64 * factor) as u64)
}

/// Cache key for successful raw bodies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fetcher_id: String,
    pub url: String,
    pub user_agent: String,
    pub headers_hash: String,
}

impl CacheKey {
    pub fn for_fetch(fetcher: &dyn Fetcher, source: &SubscriptionSource, options: &FetchOptions) -> Self {
        Self {
            fetcher_id: fetcher.id().to_string(),
            url: source.url.clone(),
            user_agent: options.user_agent.cache_token().to_string(),
            headers_hash: String::new(),
        }
    }

    pub fn with_headers_fingerprint(mut self, parts: &[&str]) -> Self {
        self.headers_hash = fingerprint(parts);
        self
    }
}

/// Short SHA-256 fingerprint, used so secrets never appear in cache keys.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..6])
}

/// Process-lifetime cache of successful fetch bodies. Errors are never
/// cached; `force_reload` bypasses reads but still refreshes the entry.
#[derive(Default)]
pub struct FetchCache {
    map: Mutex<HashMap<CacheKey, Arc<Vec<u8>>>>,
}

impl FetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static FetchCache {
        static GLOBAL: OnceLock<FetchCache> = OnceLock::new();
        GLOBAL.get_or_init(FetchCache::new)
    }

    pub fn get(&self, key: &CacheKey, force_reload: bool) -> Option<Arc<Vec<u8>>> {
        if force_reload {
            return None;
        }
        self.map.lock().expect("fetch cache lock poisoned").get(key).cloned()
    }

    pub fn store(&self, key: CacheKey, body: Vec<u8>) -> Arc<Vec<u8>> {
        let body = Arc::new(body);
        self.map
            .lock()
            .expect("fetch cache lock poisoned")
            .insert(key, Arc::clone(&body));
        body
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("fetch cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetch through the cache: read-through on hit, store on success.
pub fn fetch_cached(
    cache: &FetchCache,
    fetcher: &dyn Fetcher,
    source: &SubscriptionSource,
    options: &FetchOptions,
) -> Result<Arc<Vec<u8>>, FetchError> {
    let key = CacheKey::for_fetch(fetcher, source, options);
    if let Some(hit) = cache.get(&key, options.force_reload) {
        return Ok(hit);
    }
    let body = fetcher.fetch(source, options)?;
    Ok(cache.store(key, body))
}

/// SHA-256 content hash of a fetched body, hex encoded. Recorded in
/// profile metadata `cache_hashes`.
pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use tiny_http::{Response, Server};

    use super::*;

    fn source(url: &str) -> SubscriptionSource {
        SubscriptionSource::from_url("test", url)
    }

    fn spawn_server<F>(handler: F) -> String
    where
        F: Fn(tiny_http::Request) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let port = server.server_addr().to_ip().expect("ip addr").port();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                handler(request);
            }
        });
        format!("http://127.0.0.1:{port}")
    }

    #[test]
    fn unsupported_scheme_fails_before_any_io() {
        let err = UrlFetcher
            .fetch(&source("ftp://example.com/sub"), &FetchOptions::default())
            .expect_err("must fail");
        assert!(matches!(err, FetchError::UnsupportedScheme(s) if s == "ftp"));
    }

    #[test]
    fn bare_paths_count_as_file_scheme() {
        assert_eq!(validate_scheme("/tmp/list.txt").expect("scheme"), "file");
        assert_eq!(
            validate_scheme("file:///tmp/list.txt").expect("scheme"),
            "file"
        );
        assert!(validate_scheme("data:text/plain,hi").is_err());
    }

    #[test]
    fn url_fetcher_returns_body_and_sends_default_user_agent() {
        let base = spawn_server(|request| {
            let ua = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("User-Agent"))
                .map(|h| h.value.as_str().to_string());
            assert_eq!(ua.as_deref(), Some(DEFAULT_USER_AGENT));
            request
                .respond(Response::from_string("ss://host"))
                .expect("respond");
        });

        let body = UrlFetcher
            .fetch(&source(&format!("{base}/sub")), &FetchOptions::default())
            .expect("fetch");
        assert_eq!(body, b"ss://host");
    }

    #[test]
    fn omitted_user_agent_sends_no_header() {
        let base = spawn_server(|request| {
            let has_ua = request
                .headers()
                .iter()
                .any(|h| h.field.equiv("User-Agent"));
            assert!(!has_ua, "User-Agent must be absent");
            request.respond(Response::from_string("ok")).expect("respond");
        });

        let options = FetchOptions {
            user_agent: UserAgent::Omit,
            ..FetchOptions::default()
        };
        UrlFetcher
            .fetch(&source(&format!("{base}/sub")), &options)
            .expect("fetch");
    }

    #[test]
    fn oversize_body_is_rejected() {
        let base = spawn_server(|request| {
            request
                .respond(Response::from_data(vec![b'a'; 4096]))
                .expect("respond");
        });

        let options = FetchOptions {
            body_cap: 1024,
            ..FetchOptions::default()
        };
        let err = UrlFetcher
            .fetch(&source(&format!("{base}/big")), &options)
            .expect_err("must fail");
        assert!(matches!(err, FetchError::Oversize { limit: 1024 }));
    }

    #[test]
    fn non_success_status_is_an_error() {
        let base = spawn_server(|request| {
            request
                .respond(Response::from_string("gone").with_status_code(404))
                .expect("respond");
        });

        let options = FetchOptions {
            max_attempts: 1,
            ..FetchOptions::default()
        };
        let err = UrlFetcher
            .fetch(&source(&format!("{base}/missing")), &options)
            .expect_err("must fail");
        assert!(matches!(err, FetchError::Status { status: 404 }));
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient_and_retried() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static HITS: AtomicU32 = AtomicU32::new(0);

        let base = spawn_server(|request| {
            let n = HITS.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                request
                    .respond(Response::from_string("oops").with_status_code(503))
                    .expect("respond");
            } else {
                request.respond(Response::from_string("ok")).expect("respond");
            }
        });

        let options = FetchOptions {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            ..FetchOptions::default()
        };
        let body = UrlFetcher
            .fetch(&source(&format!("{base}/flaky")), &options)
            .expect("fetch succeeds on retry");
        assert_eq!(body, b"ok");
    }

    #[test]
    fn bearer_token_is_attached_but_not_cached() {
        let base = spawn_server(|request| {
            let auth = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            assert_eq!(auth.as_deref(), Some("Bearer sekrit"));
            request.respond(Response::from_string("ok")).expect("respond");
        });

        let fetcher = ApiTokenFetcher::new("sekrit");
        fetcher
            .fetch(&source(&format!("{base}/api")), &FetchOptions::default())
            .expect("fetch");

        let key = CacheKey::for_fetch(&fetcher, &source("u"), &FetchOptions::default())
            .with_headers_fingerprint(&["sekrit"]);
        assert!(!key.headers_hash.contains("sekrit"));
        assert_eq!(key.headers_hash.len(), 12);
    }

    #[test]
    #[serial_test::serial]
    fn api_token_fetcher_reads_token_from_env() {
        let base = spawn_server(|request| {
            let auth = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            assert_eq!(auth.as_deref(), Some("Bearer env-token"));
            request.respond(Response::from_string("ok")).expect("respond");
        });

        temp_env::with_var("SBOXPIPE_API_TOKEN", Some("env-token"), || {
            let fetcher = ApiTokenFetcher::from_env();
            fetcher
                .fetch(&source(&format!("{base}/api")), &FetchOptions::default())
                .expect("fetch");
        });
    }

    #[test]
    fn file_fetcher_reads_and_respects_cap() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("sub.txt");
        std::fs::write(&path, "trojan://pw@host:443#Slow").expect("write");

        let fetcher = FileFetcher::unrestricted();
        let body = fetcher
            .fetch(
                &source(&format!("file://{}", path.display())),
                &FetchOptions::default(),
            )
            .expect("fetch");
        assert_eq!(body, b"trojan://pw@host:443#Slow");

        let options = FetchOptions {
            body_cap: 4,
            ..FetchOptions::default()
        };
        let err = fetcher
            .fetch(&source(&format!("file://{}", path.display())), &options)
            .expect_err("must fail");
        assert!(matches!(err, FetchError::Oversize { .. }));
    }

    #[test]
    fn confined_file_fetcher_rejects_escapes() {
        let td = tempfile::tempdir().expect("tempdir");
        let inside = td.path().join("inside");
        std::fs::create_dir_all(&inside).expect("mkdir");
        std::fs::write(inside.join("ok.txt"), "x").expect("write");

        let outside = td.path().join("outside.txt");
        std::fs::write(&outside, "secret").expect("write");

        let fetcher = FileFetcher::confined(inside.clone());
        fetcher
            .fetch(
                &source(inside.join("ok.txt").to_str().expect("utf8")),
                &FetchOptions::default(),
            )
            .expect("inside path allowed");

        let err = fetcher
            .fetch(
                &source(outside.to_str().expect("utf8")),
                &FetchOptions::default(),
            )
            .expect_err("must fail");
        assert!(matches!(err, FetchError::PathEscape(_)));
    }

    #[cfg(unix)]
    #[test]
    fn confined_file_fetcher_rejects_symlink_escapes() {
        let td = tempfile::tempdir().expect("tempdir");
        let inside = td.path().join("inside");
        std::fs::create_dir_all(&inside).expect("mkdir");
        let outside = td.path().join("outside.txt");
        std::fs::write(&outside, "secret").expect("write");
        let link = inside.join("link.txt");
        std::os::unix::fs::symlink(&outside, &link).expect("symlink");

        let fetcher = FileFetcher::confined(inside);
        let err = fetcher
            .fetch(
                &source(link.to_str().expect("utf8")),
                &FetchOptions::default(),
            )
            .expect_err("must fail");
        assert!(matches!(err, FetchError::PathEscape(_)));
    }

    #[test]
    fn cache_hits_skip_the_fetcher_and_force_reload_bypasses() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);

        struct Counting;
        impl Fetcher for Counting {
            fn id(&self) -> &'static str {
                "counting"
            }
            fn fetch(
                &self,
                _source: &SubscriptionSource,
                _options: &FetchOptions,
            ) -> Result<Vec<u8>, FetchError> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(b"body".to_vec())
            }
        }

        let cache = FetchCache::new();
        let src = source("https://example.com/sub");
        let options = FetchOptions::default();

        fetch_cached(&cache, &Counting, &src, &options).expect("fetch");
        fetch_cached(&cache, &Counting, &src, &options).expect("fetch");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        let forced = FetchOptions {
            force_reload: true,
            ..options
        };
        fetch_cached(&cache, &Counting, &src, &forced).expect("fetch");
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn errors_are_never_cached() {
        struct Failing;
        impl Fetcher for Failing {
            fn id(&self) -> &'static str {
                "failing"
            }
            fn fetch(
                &self,
                _source: &SubscriptionSource,
                _options: &FetchOptions,
            ) -> Result<Vec<u8>, FetchError> {
                Err(FetchError::Status { status: 500 })
            }
        }

        let cache = FetchCache::new();
        let result = fetch_cached(
            &cache,
            &Failing,
            &source("https://example.com/sub"),
            &FetchOptions::default(),
        );
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        let h = content_hash(b"abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
