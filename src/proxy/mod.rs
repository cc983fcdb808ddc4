//! Credential-injecting reverse proxy for the DEX-aggregation API.
//!
//! [`UpstreamProxy::forward`] takes an inbound request under a fixed path
//! prefix, rebuilds the URL against the upstream origin, attaches the
//! server-held API key, and relays the answer. The browser never sees the key.
//!
//! Every failure is answered with a JSON [`ErrorBody`]; nothing is retried.
//!
//! | Outcome              | Status             | Body                                   |
//! |----------------------|--------------------|----------------------------------------|
//! | credential missing   | `500`              | `error`                                |
//! | upstream `2xx`       | upstream status    | upstream body, streamed                |
//! | upstream non-`2xx`   | upstream status    | `error, status, statusText, details, url` |
//! | transport failure    | `500`              | `error, details, stack`                |

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::http::{Body, Framing, Headers, Request, Response, StatusCode};

/// Header carrying the API key alongside the bearer token.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Upstream response headers that are never relayed.
///
/// The body has been decoded and re-framed by the time it reaches the client,
/// so upstream's encoding and length no longer describe it. Connection
/// management belongs to this server.
pub const STRIPPED_RESPONSE_HEADERS: [&str; 5] = [
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "connection",
    "keep-alive",
];

/// Errors raised while constructing the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to build upstream HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid upstream origin {origin:?}: must start with http:// or https://")]
    InvalidOrigin { origin: String },
}

/// Supplies the upstream credential each time a request is forwarded.
pub trait CredentialSource: Send + Sync {
    /// Returns the credential, or `None` when it is not configured.
    fn credential(&self) -> Option<String>;
}

/// Reads the credential from a process environment variable on every call,
/// so rotating the key does not require a restart.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialSource for EnvCredential {
    fn credential(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|v| !v.trim().is_empty())
    }
}

/// A fixed credential, or none at all.
#[derive(Clone)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(credential: impl Into<String>) -> Self {
        Self(Some(credential.into()))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.as_deref().map(redact);
        f.debug_tuple("StaticCredential").field(&shown).finish()
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> Option<String> {
        self.0.clone()
    }
}

// First four characters only.
fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}…")
}

/// JSON body of every error response the proxy synthesizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    /// Describes a failure by its message and, when present, its chain of causes.
    pub fn from_error(error: impl Into<String>, err: &(dyn StdError + 'static)) -> Self {
        Self {
            error: error.into(),
            details: Some(err.to_string()),
            stack: source_chain(err),
            ..Self::default()
        }
    }

    /// Renders the body as a JSON response with the given status.
    pub fn into_response(self, status: StatusCode) -> Response {
        Response::json(status, &self)
    }
}

// One cause per line, outermost first, excluding `err` itself.
fn source_chain(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }
    (!causes.is_empty()).then(|| causes.join("\n"))
}

/// Where the proxy is mounted and where it forwards to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    prefix: String,
    origin: String,
    timeout: Option<Duration>,
}

impl ProxyConfig {
    /// Trailing slashes are trimmed from both `prefix` and `origin`.
    pub fn new(prefix: impl Into<String>, origin: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_owned();
        let origin = origin.into().trim_end_matches('/').to_owned();
        Self {
            prefix,
            origin,
            timeout: None,
        }
    }

    /// Bounds each upstream call. Expiry is reported as a transport failure.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Router pattern matching everything under the prefix.
    pub fn route_pattern(&self) -> String {
        format!("{}/*", self.prefix)
    }
}

/// Forwards requests under a fixed prefix to the upstream API.
///
/// Holds no per-request state; share one instance behind an [`Arc`].
pub struct UpstreamProxy {
    config: ProxyConfig,
    client: reqwest::Client,
    credential: Arc<dyn CredentialSource>,
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UpstreamProxy {
    /// Builds the proxy and its HTTP client.
    ///
    /// # Errors
    ///
    /// [`ProxyError::InvalidOrigin`] if the origin is not an http(s) URL, or
    /// [`ProxyError::Client`] if the TLS backend cannot be initialised.
    pub fn new(
        config: ProxyConfig,
        credential: Arc<dyn CredentialSource>,
    ) -> Result<Self, ProxyError> {
        if !(config.origin.starts_with("http://") || config.origin.starts_with("https://")) {
            return Err(ProxyError::InvalidOrigin {
                origin: config.origin,
            });
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("swapgate/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            config,
            credential,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Resolves the upstream URL for an inbound path and query string.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use swapgate::proxy::{ProxyConfig, StaticCredential, UpstreamProxy};
    /// let proxy = UpstreamProxy::new(
    ///     ProxyConfig::new("/proxy", "https://api.example.com"),
    ///     Arc::new(StaticCredential::missing()),
    /// )
    /// .unwrap();
    /// assert_eq!(
    ///     proxy.target_url("/proxy/v1/foo", Some("x=1")),
    ///     "https://api.example.com/v1/foo?x=1"
    /// );
    /// ```
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let rest = path.strip_prefix(self.config.prefix.as_str()).unwrap_or(path);
        let mut url = format!("{}{}", self.config.origin, rest);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Forwards `request` upstream and returns the client-facing response.
    ///
    /// Never fails: every error path produces a JSON [`ErrorBody`] response.
    ///
    /// For methods that carry a body, the inbound body is handed to the
    /// upstream request as it arrives; a declared `Content-Length` is kept.
    pub async fn forward(&self, request: Request) -> Response {
        let Some(credential) = self.credential.credential() else {
            error!("upstream API key is not configured; refusing to forward");
            return ErrorBody::new("Upstream API key is not configured on the server")
                .into_response(StatusCode::InternalServerError);
        };

        let url = self.target_url(request.path(), request.query_string());
        debug!(key_prefix = %redact(&credential), %url, "forwarding with server credential");

        let headers = match outbound_headers(request.headers(), &credential) {
            Ok(headers) => headers,
            Err(e) => {
                error!(error = %e, "upstream API key is not a valid header value");
                return ErrorBody::new("Upstream API key is not a valid header value")
                    .into_response(StatusCode::InternalServerError);
            }
        };

        let method = match reqwest::Method::from_bytes(request.method().as_str().as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                return ErrorBody::from_error("Unsupported request method", &e)
                    .into_response(StatusCode::MethodNotAllowed);
            }
        };

        info!(method = %request.method(), %url, framing = ?request.framing(), "proxying upstream");

        let mut outbound = self.client.request(method, &url).headers(headers);
        if request.method().forwards_body() {
            if let Framing::Length(len) = request.framing() {
                outbound = outbound.header(CONTENT_LENGTH, len);
            }
            outbound = match request.into_body() {
                Body::Full(bytes) => outbound.body(bytes),
                Body::Stream(stream) => outbound.body(reqwest::Body::wrap_stream(stream)),
            };
        }

        match outbound.send().await {
            Ok(upstream) if upstream.status().is_success() => relay(upstream),
            Ok(upstream) => upstream_rejection(&url, upstream).await,
            Err(e) => transport_failure(&url, &e),
        }
    }
}

/// Headers sent upstream: credential, accept, and the caller's content type.
///
/// Nothing else from the inbound request is forwarded, in particular not the
/// caller's own `Authorization`.
fn outbound_headers(
    inbound: &Headers,
    credential: &str,
) -> Result<HeaderMap, reqwest::header::InvalidHeaderValue> {
    let mut headers = HeaderMap::new();

    let mut bearer = HeaderValue::from_str(&format!("Bearer {credential}"))?;
    bearer.set_sensitive(true);
    headers.insert(AUTHORIZATION, bearer);

    let mut api_key = HeaderValue::from_str(credential)?;
    api_key.set_sensitive(true);
    headers.insert(API_KEY_HEADER, api_key);

    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    if let Some(content_type) = inbound
        .get("content-type")
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }

    Ok(headers)
}

fn relay(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BadGateway);

    let headers: Headers = upstream
        .headers()
        .iter()
        .filter(|(name, _)| !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned())))
        .collect();

    debug!(status = status.as_u16(), "relaying upstream response");
    Response::new(status)
        .headers(headers)
        .body_stream(upstream.bytes_stream().map_err(io::Error::other))
}

async fn upstream_rejection(url: &str, upstream: reqwest::Response) -> Response {
    let upstream_status = upstream.status();
    let status = StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::BadGateway);

    let details = match upstream.text().await {
        Ok(text) => text,
        Err(e) => return transport_failure(url, &e),
    };

    warn!(status = upstream_status.as_u16(), %url, "upstream rejected request");
    ErrorBody {
        error: format!("Upstream request failed with status {}", upstream_status.as_u16()),
        status: Some(upstream_status.as_u16()),
        status_text: Some(upstream_status.canonical_reason().unwrap_or("").to_owned()),
        details: Some(details),
        url: Some(url.to_owned()),
        stack: None,
    }
    .into_response(status)
}

fn transport_failure(url: &str, err: &reqwest::Error) -> Response {
    error!(error = %err, timeout = err.is_timeout(), %url, "upstream unreachable");
    let message = if err.is_timeout() {
        "Upstream request timed out"
    } else {
        "Failed to reach upstream"
    };
    ErrorBody::from_error(message, err).into_response(StatusCode::InternalServerError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(prefix: &str, origin: &str) -> UpstreamProxy {
        UpstreamProxy::new(
            ProxyConfig::new(prefix, origin),
            Arc::new(StaticCredential::new("sk_live_123456")),
        )
        .unwrap()
    }

    #[test]
    fn target_url_strips_prefix_and_keeps_query() {
        let p = proxy("/proxy", "https://api.example.com");
        assert_eq!(
            p.target_url("/proxy/v1/foo", Some("x=1")),
            "https://api.example.com/v1/foo?x=1"
        );
    }

    #[test]
    fn target_url_omits_empty_query() {
        let p = proxy("/api/proxy/", "https://api.1inch.dev/");
        assert_eq!(
            p.target_url("/api/proxy/swap/v6.0/1/quote", Some("")),
            "https://api.1inch.dev/swap/v6.0/1/quote"
        );
        assert_eq!(
            p.target_url("/api/proxy/swap/v6.0/1/tokens", None),
            "https://api.1inch.dev/swap/v6.0/1/tokens"
        );
    }

    #[test]
    fn target_url_of_bare_prefix_is_origin() {
        let p = proxy("/proxy", "https://api.example.com");
        assert_eq!(p.target_url("/proxy", None), "https://api.example.com");
    }

    #[test]
    fn origin_must_be_http() {
        let err = UpstreamProxy::new(
            ProxyConfig::new("/proxy", "ftp://api.example.com"),
            Arc::new(StaticCredential::missing()),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidOrigin { .. }));
    }

    #[test]
    fn outbound_headers_inject_credential_and_drop_caller_auth() {
        let inbound: Headers = [
            ("Authorization", "Bearer caller-token"),
            ("Content-Type", "application/json"),
            ("Cookie", "session=abc"),
        ]
        .into_iter()
        .collect();

        let headers = outbound_headers(&inbound, "sk_live_123456").unwrap();

        assert_eq!(headers[AUTHORIZATION], "Bearer sk_live_123456");
        assert_eq!(headers[API_KEY_HEADER], "sk_live_123456");
        assert_eq!(headers[ACCEPT], "application/json");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert!(headers.get("cookie").is_none());
        assert_eq!(headers.len(), 4);
    }

    #[test]
    fn outbound_headers_reject_control_characters_in_key() {
        assert!(outbound_headers(&Headers::new(), "bad\nkey").is_err());
    }

    #[test]
    fn credential_is_redacted_in_debug_output() {
        let shown = format!("{:?}", StaticCredential::new("sk_live_123456"));
        assert!(shown.contains("sk_l…"));
        assert!(!shown.contains("123456"));
    }

    #[test]
    fn env_credential_treats_unset_as_missing() {
        let source = EnvCredential::new("SWAPGATE_TEST_CREDENTIAL_THAT_IS_NEVER_SET");
        assert_eq!(source.credential(), None);
    }

    #[test]
    fn error_body_omits_absent_fields() {
        let json = serde_json::to_value(ErrorBody::new("nope")).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "nope" }));

        let json = serde_json::to_value(ErrorBody {
            status: Some(429),
            status_text: Some("Too Many Requests".into()),
            ..ErrorBody::new("limited")
        })
        .unwrap();
        assert_eq!(json["statusText"], "Too Many Requests");
        assert_eq!(json["status"], 429);
    }

    #[derive(Debug, Error)]
    #[error("connect failed")]
    struct Outer(#[source] io::Error);

    #[test]
    fn error_body_lists_causes() {
        let err = Outer(io::Error::other("connection refused"));
        let body = ErrorBody::from_error("Failed to reach upstream", &err);
        assert_eq!(body.details.as_deref(), Some("connect failed"));
        assert_eq!(body.stack.as_deref(), Some("connection refused"));
    }
}
