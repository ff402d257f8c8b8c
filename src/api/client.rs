//! HTTP request executor with circuit breaking, bounded retries and safe logging.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

use crate::api::circuit_breaker::CircuitBreaker;
use crate::auth::{
    AuthRedirectReason, CredentialStore, MemoryCredentialStore, NoopSessionHooks, SessionHooks,
};
use crate::error::{ApiError, RateLimitInfo};
use crate::state::ConnectionContext;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// User agent string for all API requests.
const CLIENT_USER_AGENT: &str = "image-tools-client/0.1";

/// Query parameter keys (case-insensitive) that should have their values redacted.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "refresh_token",
    "token",
    "code",
    "signature",
    "sig",
    "key",
    "authorization",
];

const RATE_LIMIT_LIMIT: &str = "ratelimit-limit";
const RATE_LIMIT_REMAINING: &str = "ratelimit-remaining";
const RATE_LIMIT_RESET_AFTER: &str = "ratelimit-reset-after";
const RETRY_AFTER: &str = "retry-after";

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Log only the path component. Strips scheme, host, query, and fragment.
    /// Example: `/api/images/status/42`
    #[default]
    PathOnly,

    /// Log path and query parameters, but redact sensitive values.
    /// Example: `/api/images/status/42?type=compress&token=***`
    PathAndQueryRedacted,
}

/// Determines if a query parameter key is sensitive and should be redacted.
fn is_sensitive_param(key: &str) -> bool {
    let key_lower = key.to_ascii_lowercase();
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|&sensitive| key_lower == sensitive)
}

/// Sanitizes a URL for safe logging based on the specified mode.
///
/// The result never contains the scheme, host, or fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let path = url.path();

    match mode {
        LoggingMode::PathOnly => path.to_string(),
        LoggingMode::PathAndQueryRedacted => {
            let query_pairs: Vec<_> = url.query_pairs().collect();
            if query_pairs.is_empty() {
                return path.to_string();
            }

            let redacted_pairs: Vec<String> = query_pairs
                .into_iter()
                .map(|(key, value)| {
                    if is_sensitive_param(&key) {
                        format!("{}=***", key)
                    } else {
                        format!("{}={}", key, value)
                    }
                })
                .collect();

            format!("{}?{}", path, redacted_pairs.join("&"))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RequestDescriptor
// ─────────────────────────────────────────────────────────────────────────────

/// One part of a multipart body. Kept as owned bytes so a retry can rebuild
/// the form.
#[derive(Debug, Clone)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: Option<String>,
        bytes: Vec<u8>,
    },
}

/// Request payload.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<FormPart>),
}

/// Everything needed to perform one logical request.
///
/// Built once with the consuming `with_*` methods and then only read.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    body: RequestBody,
    headers: HeaderMap,
    require_auth: bool,
    retry_count: Option<u32>,
    retry_delay: Option<Duration>,
    bypass_circuit_breaker: bool,
    allow_auth_redirect: bool,
}

impl RequestDescriptor {
    /// `path` is relative to the client's base URL and must start with `/`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            headers: HeaderMap::new(),
            require_auth: true,
            retry_count: None,
            retry_delay: None,
            bypass_circuit_breaker: false,
            allow_auth_redirect: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn with_form(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Form(parts);
        self
    }

    /// Adds a header. Invalid names or values are dropped with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!("[API] Dropping invalid header '{}'", name),
        }
        self
    }

    /// Sends the request without a bearer token.
    pub fn without_auth(mut self) -> Self {
        self.require_auth = false;
        self
    }

    /// Overrides the client's default retry policy for network errors.
    pub fn with_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.retry_count = Some(retries);
        self.retry_delay = Some(delay);
        self
    }

    pub fn bypass_circuit_breaker(mut self) -> Self {
        self.bypass_circuit_breaker = true;
        self
    }

    /// Keeps the login redirect hook from firing on auth failures.
    pub fn suppress_auth_redirect(mut self) -> Self {
        self.allow_auth_redirect = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn requires_auth(&self) -> bool {
        self.require_auth
    }

    pub fn is_form_data(&self) -> bool {
        matches!(self.body, RequestBody::Form(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ApiClient
// ─────────────────────────────────────────────────────────────────────────────

/// Thread-safe HTTP client for the image tools backend.
///
/// Every request passes the shared [`CircuitBreaker`] gate, network errors are
/// retried per the request's policy, and every outcome is reported back to the
/// breaker.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    ctx: ConnectionContext,
    credentials: Arc<dyn CredentialStore>,
    hooks: Arc<dyn SessionHooks>,
    logging_mode: LoggingMode,
}

impl ApiClient {
    /// Creates a client with an empty in-memory credential store and no-op
    /// session hooks.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Internal` if the base URL is invalid or the HTTP
    /// client fails to initialize.
    pub fn new(ctx: ConnectionContext) -> Result<Self, ApiError> {
        let base_url = Url::parse(&ctx.config.base_url)
            .map_err(|_| ApiError::Internal("Invalid base URL".to_string()))?;
        let http = build_http_client(ctx.config.request_timeout())?;

        Ok(Self {
            http,
            base_url,
            ctx,
            credentials: Arc::new(MemoryCredentialStore::new()),
            hooks: Arc::new(NoopSessionHooks),
            logging_mode: LoggingMode::default(),
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_session_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.ctx.breaker
    }

    /// Joins `path` onto the base URL, keeping any path prefix of the base.
    pub fn build_url(&self, path: &str) -> Result<Url, ApiError> {
        if !path.starts_with('/') {
            return Err(ApiError::Internal(format!("Invalid path: {}", path)));
        }
        let joined = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|_| ApiError::Internal(format!("Invalid path: {}", path)))
    }

    /// Executes a request and deserializes the JSON body into `T`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        req: &RequestDescriptor,
    ) -> Result<T, ApiError> {
        let value = self.execute(req).await?;
        serde_json::from_value(value).map_err(|e| {
            ApiError::InvalidResponse(format!("Unexpected response shape: {}", e))
        })
    }

    /// Executes a request, retrying network errors only.
    ///
    /// Returns the parsed JSON body (`Value::Null` for an empty body).
    ///
    /// # Errors
    ///
    /// - `ApiError::CircuitOpen` - the breaker rejected the call, nothing was sent
    /// - `ApiError::AuthRequired` - no credential, or the server answered 401
    /// - `ApiError::Http` - any other non-success status, never retried
    /// - `ApiError::Network` - connection-level failure after all retries
    pub async fn execute(&self, req: &RequestDescriptor) -> Result<Value, ApiError> {
        let retries = req.retry_count.unwrap_or(self.ctx.config.retry.retries);
        let delay = req
            .retry_delay
            .unwrap_or_else(|| self.ctx.config.retry.delay());

        let mut attempt = 0u32;
        loop {
            match self.execute_once(req).await {
                Err(err) if err.is_network() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        "[API] {} {} network error, retry {}/{} in {}ms",
                        req.method,
                        req.path,
                        attempt,
                        retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// One attempt: auth check, breaker gate, send, classify.
    async fn execute_once(&self, req: &RequestDescriptor) -> Result<Value, ApiError> {
        let token = if req.require_auth {
            match self.credentials.access_token() {
                Some(token) => Some(token),
                None => {
                    self.notify_auth_failure(req, AuthRedirectReason::MissingCredential);
                    return Err(ApiError::AuthRequired);
                }
            }
        } else {
            None
        };

        let admission = self
            .ctx
            .breaker
            .admit(&req.path, req.bypass_circuit_breaker)
            .map_err(|err| {
                info!("[API] {} {} blocked by open circuit", req.method, req.path);
                err
            })?;

        let url = self.build_url(&req.path)?;
        let sanitized_url = sanitize_url_for_logs(&url, self.logging_mode);

        let mut request = self
            .http
            .request(req.method.clone(), url.as_str())
            .headers(req.headers.clone());
        if let Some(token) = &token {
            request = request.bearer_auth(token.expose_secret());
        }
        request = match &req.body {
            RequestBody::Empty => request,
            RequestBody::Json(body) => request.json(body),
            RequestBody::Form(parts) => request.multipart(build_form(parts)?),
        };

        let start = Instant::now();
        let result = request.send().await;
        let duration_ms = start.elapsed().as_millis();

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                // Never surface the raw reqwest error: it may embed the full URL.
                info!(
                    "[API] {} {} FAILED {}ms",
                    req.method, sanitized_url, duration_ms
                );
                if err.is_builder() {
                    return Err(ApiError::Internal("Failed to build request".to_string()));
                }
                self.ctx.breaker.on_network_failure();
                let message = if err.is_timeout() {
                    "Request timed out"
                } else {
                    "Connection to server failed"
                };
                return Err(ApiError::Network(message.to_string()));
            }
        };

        let status = response.status();
        let x_request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        info!(
            "[API] {} {} {} {}ms {}",
            req.method,
            sanitized_url,
            status.as_u16(),
            duration_ms,
            x_request_id
        );

        if status.is_success() {
            self.ctx.breaker.on_success();
            drop(admission);
            let bytes = response.bytes().await.map_err(|_| {
                ApiError::InvalidResponse("Failed to read response body".to_string())
            })?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::InvalidResponse(format!("Response is not JSON: {}", e)));
        }

        // The server answered, so this is not a breaker failure. Dropping the
        // admission frees a half-open probe slot.
        drop(admission);
        Err(self.error_from_response(req, response).await)
    }

    /// Maps a non-success response to `ApiError`, running 401 side effects.
    async fn error_from_response(
        &self,
        req: &RequestDescriptor,
        response: reqwest::Response,
    ) -> ApiError {
        let status = response.status();
        let rate_limit = (status == reqwest::StatusCode::TOO_MANY_REQUESTS)
            .then(|| parse_rate_limit(response.headers()));

        let body = response.text().await.unwrap_or_default();
        let message = extract_error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

        if status == reqwest::StatusCode::UNAUTHORIZED && req.require_auth {
            warn!("[API] {} {} unauthorized, clearing credential", req.method, req.path);
            self.credentials.clear();
            self.notify_auth_failure(req, AuthRedirectReason::Unauthorized);
            return ApiError::AuthRequired;
        }

        ApiError::Http {
            status: status.as_u16(),
            message,
            rate_limit,
        }
    }

    fn notify_auth_failure(&self, req: &RequestDescriptor, reason: AuthRedirectReason) {
        if req.allow_auth_redirect {
            self.hooks
                .redirect_to_login(&self.ctx.config.login_path, reason);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the configured HTTP client.
fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| ApiError::Internal(format!("Failed to build HTTP client: {}", e)))
}

fn build_form(parts: &[FormPart]) -> Result<Form, ApiError> {
    let mut form = Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
            FormPart::File {
                name,
                file_name,
                mime,
                bytes,
            } => {
                let mut file_part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                if let Some(mime) = mime {
                    file_part = file_part
                        .mime_str(mime)
                        .map_err(|_| ApiError::Internal(format!("Invalid MIME type: {}", mime)))?;
                }
                form.part(name.clone(), file_part)
            }
        };
    }
    Ok(form)
}

/// Reads a numeric header, accepting fractional seconds (rounded up).
fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    let raw = headers.get(name)?.to_str().ok()?.trim();
    let value: f64 = raw.parse().ok()?;
    (value >= 0.0).then(|| value.ceil() as u64)
}

/// Extracts rate-limit metadata from standard response headers.
pub fn parse_rate_limit(headers: &HeaderMap) -> RateLimitInfo {
    RateLimitInfo {
        limit: header_u64(headers, RATE_LIMIT_LIMIT),
        remaining: header_u64(headers, RATE_LIMIT_REMAINING),
        reset_after_secs: header_u64(headers, RATE_LIMIT_RESET_AFTER),
        retry_after_secs: header_u64(headers, RETRY_AFTER),
    }
}

/// Pulls a human-readable message out of a JSON error body:
/// `{"message": ..}`, `{"error": ..}` or `{"error": {"message": ..}}`.
fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let candidate = value
        .get("message")
        .or_else(|| value.get("error").and_then(|e| e.get("message")))
        .or_else(|| value.get("error"))?;
    candidate
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use parking_lot::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<(String, AuthRedirectReason)>>,
    }

    impl SessionHooks for RecordingHooks {
        fn redirect_to_login(&self, login_path: &str, reason: AuthRedirectReason) {
            self.calls.lock().push((login_path.to_string(), reason));
        }
    }

    struct Harness {
        client: ApiClient,
        creds: Arc<MemoryCredentialStore>,
        hooks: Arc<RecordingHooks>,
    }

    fn harness(base_url: &str) -> Harness {
        let mut config = ClientConfig::with_base_url(base_url);
        config.retry.delay_ms = 10;
        let creds = Arc::new(MemoryCredentialStore::with_token("test_token"));
        let hooks = Arc::new(RecordingHooks::default());
        let client = ApiClient::new(ConnectionContext::new(config))
            .unwrap()
            .with_credentials(creds.clone())
            .with_session_hooks(hooks.clone());
        Harness {
            client,
            creds,
            hooks,
        }
    }

    /// A localhost URL with nothing listening on it.
    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}", port)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // URL handling
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn sanitize_strips_scheme_host_and_query() {
        let url = Url::parse("https://api.example.com/api/images/status/42?type=compress").unwrap();
        assert_eq!(
            sanitize_url_for_logs(&url, LoggingMode::PathOnly),
            "/api/images/status/42"
        );
    }

    #[test]
    fn sanitize_redacts_sensitive_params() {
        let url =
            Url::parse("https://api.example.com/download?type=zip&Token=abc123&sig=xyz#frag").unwrap();
        let result = sanitize_url_for_logs(&url, LoggingMode::PathAndQueryRedacted);

        assert!(result.contains("type=zip"));
        assert!(result.contains("Token=***"));
        assert!(result.contains("sig=***"));
        assert!(!result.contains("abc123"));
        assert!(!result.contains("xyz"));
        assert!(!result.contains("frag"));
    }

    #[test]
    fn is_sensitive_param_requires_exact_match() {
        assert!(is_sensitive_param("ACCESS_TOKEN"));
        assert!(!is_sensitive_param("tokens"));
        assert!(!is_sensitive_param("type"));
    }

    #[test]
    fn build_url_keeps_base_prefix() {
        let client = harness("https://api.example.com/api/").client;
        let url = client.build_url("/images/status/7?type=crop").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/api/images/status/7?type=crop");
        assert!(client.build_url("images").is_err());
    }

    #[test]
    fn descriptor_defaults() {
        let req = RequestDescriptor::get("/health");
        assert!(req.requires_auth());
        assert!(!req.is_form_data());
        assert!(req.retry_count.is_none());
        assert!(!req.bypass_circuit_breaker);
        assert!(req.allow_auth_redirect);

        let form = RequestDescriptor::post("/images/compress").with_form(vec![]);
        assert!(form.is_form_data());
    }

    #[test]
    fn rate_limit_headers_are_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("RateLimit-Limit", HeaderValue::from_static("100"));
        headers.insert("RateLimit-Remaining", HeaderValue::from_static("0"));
        headers.insert("RateLimit-Reset-After", HeaderValue::from_static("12.5"));
        headers.insert("Retry-After", HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));

        let info = parse_rate_limit(&headers);
        assert_eq!(info.limit, Some(100));
        assert_eq!(info.remaining, Some(0));
        assert_eq!(info.reset_after_secs, Some(13));
        assert_eq!(info.retry_after_secs, None);
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            extract_error_message(r#"{"status":"error","message":"File too large"}"#).as_deref(),
            Some("File too large")
        );
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"nested"}}"#).as_deref(),
            Some("nested")
        );
        assert_eq!(extract_error_message(r#"{"error":"flat"}"#).as_deref(), Some("flat"));
        assert_eq!(extract_error_message("<html>oops</html>"), None);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Request execution
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn success_attaches_bearer_and_resets_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/status/1"))
            .and(header("authorization", "Bearer test_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        for _ in 0..3 {
            h.client.breaker().on_network_failure();
        }

        let body = h
            .client
            .execute(&RequestDescriptor::get("/images/status/1"))
            .await
            .unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(h.client.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let body = h
            .client
            .execute(&RequestDescriptor::post("/ping").without_auth())
            .await
            .unwrap();
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn missing_credential_fails_without_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        h.creds.clear();

        let err = h
            .client
            .execute(&RequestDescriptor::get("/images/status/1"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::AuthRequired));
        assert_eq!(
            h.hooks.calls.lock().as_slice(),
            &[("/login".to_string(), AuthRedirectReason::MissingCredential)]
        );
    }

    #[tokio::test]
    async fn unauthorized_clears_credential_and_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/status/1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let err = h
            .client
            .execute(&RequestDescriptor::get("/images/status/1"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::AuthRequired));
        assert!(!h.creds.has_token());
        assert_eq!(h.hooks.calls.lock().len(), 1);
        assert_eq!(h.hooks.calls.lock()[0].1, AuthRedirectReason::Unauthorized);
    }

    #[tokio::test]
    async fn suppressed_redirect_still_clears_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let err = h
            .client
            .execute(&RequestDescriptor::get("/me").suppress_auth_redirect())
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::AuthRequired));
        assert!(!h.creds.has_token());
        assert!(h.hooks.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_response_carries_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/compress"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("RateLimit-Limit", "20")
                    .insert_header("RateLimit-Remaining", "0")
                    .insert_header("RateLimit-Reset-After", "30")
                    .insert_header("Retry-After", "30")
                    .set_body_json(serde_json::json!({"message": "Too many uploads"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let err = h
            .client
            .execute(&RequestDescriptor::post("/images/compress"))
            .await
            .unwrap_err();

        match err {
            ApiError::Http {
                status,
                message,
                rate_limit,
            } => {
                assert_eq!(status, 429);
                assert_eq!(message, "Too many uploads");
                let info = rate_limit.expect("rate limit info");
                assert_eq!(info.limit, Some(20));
                assert_eq!(info.remaining, Some(0));
                assert_eq!(info.reset_after_secs, Some(30));
                assert_eq!(info.retry_after_secs, Some(30));
            }
            other => panic!("expected Http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn http_errors_are_not_retried_and_do_not_trip_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/status/1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(6)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let req = RequestDescriptor::get("/images/status/1").with_retry(3, Duration::from_millis(1));
        for _ in 0..6 {
            let err = h.client.execute(&req).await.unwrap_err();
            assert_eq!(err.status(), Some(500));
        }

        let snap = h.client.breaker().snapshot();
        assert_eq!(snap.failure_count, 0);
        assert!(!snap.is_open);
    }

    #[tokio::test]
    async fn network_errors_are_retried_and_counted() {
        let h = harness(&dead_url());
        let req = RequestDescriptor::get("/images/status/1").with_retry(2, Duration::from_millis(5));

        let err = h.client.execute(&req).await.unwrap_err();

        assert!(err.is_network());
        assert_eq!(h.client.breaker().snapshot().failure_count, 3);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast() {
        let h = harness(&dead_url());
        let req = RequestDescriptor::get("/images/status/1").with_retry(0, Duration::ZERO);

        for _ in 0..5 {
            assert!(h.client.execute(&req).await.unwrap_err().is_network());
        }
        assert!(h.client.breaker().snapshot().is_open);

        let err = h.client.execute(&req).await.unwrap_err();
        assert!(matches!(err, ApiError::CircuitOpen { .. }));
        assert_eq!(h.client.breaker().snapshot().failure_count, 5);
    }

    #[tokio::test]
    async fn health_and_bypass_requests_pass_open_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/images/status/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        for _ in 0..5 {
            h.client.breaker().on_network_failure();
        }

        let blocked = h
            .client
            .execute(&RequestDescriptor::get("/images/status/2"))
            .await
            .unwrap_err();
        assert!(matches!(blocked, ApiError::CircuitOpen { .. }));

        h.client
            .execute(&RequestDescriptor::get("/images/status/1").bypass_circuit_breaker())
            .await
            .unwrap();
        // A successful bypass call still proves the server is back.
        assert!(!h.client.breaker().snapshot().is_open);

        for _ in 0..5 {
            h.client.breaker().on_network_failure();
        }
        h.client
            .execute(&RequestDescriptor::get("/health").without_auth())
            .await
            .unwrap();
        assert!(!h.client.breaker().snapshot().is_open);
    }

    #[tokio::test]
    async fn execute_json_reports_shape_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"a": 1})))
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let result: Result<Vec<String>, _> = h
            .client
            .execute_json(&RequestDescriptor::get("/x"))
            .await;
        assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
    }
}
