//! HTTP edge: request/response shapes and the transport seam.
//!
//! `Transport` is the boundary the rest of the pipeline sees: production
//! wraps `reqwest`, tests script it. One transport is built per account
//! acquisition and dropped with the Ctx.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use serde_json::{json, Value};

use crate::error::TransportError;
use crate::store::Account;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound call, fully composed by the API layer.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// `"GET"` or `"POST"`.
    pub method: String,
    pub url: String,
    /// Query parameters (values already JSON-serialized where required).
    pub params: Vec<(String, String)>,
    /// JSON body for mutations.
    pub body: Option<Value>,
    /// Per-call headers (the transaction id).
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            params: Vec::new(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            params: Vec::new(),
            body: Some(body),
            headers: Vec::new(),
        }
    }

    /// URL path component, `/` when the URL does not parse.
    pub fn path(&self) -> String {
        reqwest::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string())
    }
}

/// Rate-limit window state, parsed from response headers. `-1` = absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimit {
    pub remaining: i64,
    pub reset: i64,
    pub limit: i64,
}

impl RateLimit {
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(-1)
        };
        Self {
            remaining: read("x-rate-limit-remaining"),
            reset: read("x-rate-limit-reset"),
            limit: read("x-rate-limit-limit"),
        }
    }
}

/// A received response, body already parsed. Non-JSON bodies are wrapped as
/// `{"_raw": text}` so the classifier and parser always see an object.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub method: String,
    pub url: String,
    /// Account that issued the request; stamped by the executor.
    pub username: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub rate: RateLimit,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body errors formatted as `(code) message`, deduplicated, joined by
    /// `; `. `"OK"` when the body has no `errors` array.
    pub fn formatted_errors(&self) -> String {
        let errors = match self.body.get("errors").and_then(Value::as_array) {
            Some(errs) if !errs.is_empty() => errs,
            _ => return "OK".to_string(),
        };
        let mut parts: Vec<String> = errors
            .iter()
            .map(|e| {
                let code = e.get("code").and_then(Value::as_i64).unwrap_or(-1);
                let message = e.get("message").and_then(Value::as_str).unwrap_or("");
                format!("({code}) {message}")
            })
            .collect();
        parts.sort();
        parts.dedup();
        parts.join("; ")
    }
}

/// The HTTP boundary. Implementations must be cheap to call concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Builds one transport per account acquisition.
pub trait TransportFactory: Send + Sync {
    fn build(&self, account: &Account, proxy: Option<&str>) -> Result<Box<dyn Transport>>;
}

// ─── reqwest implementation ──────────────────────────────────────────────────

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Client bound to one account: bearer, CSRF, cookie jar, and user agent
    /// as default headers; the account's proxy wins over the pool-level one.
    pub fn for_account(account: &Account, proxy: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", account.auth_token))
                .context("invalid auth token")?,
        );
        let csrf = account.csrf_token();
        if !csrf.is_empty() {
            headers.insert(
                "x-csrf-token",
                HeaderValue::from_str(&csrf).context("invalid csrf token")?,
            );
        }
        let cookies = account.cookie_map();
        if !cookies.is_empty() {
            let mut pairs: Vec<String> =
                cookies.iter().map(|(k, v)| format!("{k}={v}")).collect();
            pairs.sort();
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&pairs.join("; ")).context("invalid cookie jar")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT);
        if !account.user_agent.is_empty() {
            builder = builder.user_agent(account.user_agent.clone());
        }
        if let Some(url) = account.proxy.as_deref().or(proxy) {
            builder = builder.proxy(reqwest::Proxy::all(url).context("invalid proxy url")?);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let mut builder = self.client.request(method, &req.url);
        if !req.params.is_empty() {
            builder = builder.query(&req.params);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }

        let rep = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = rep.status().as_u16();
        let url = rep.url().to_string();
        let headers: HashMap<String, String> = rep
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let text = rep.text().await.map_err(TransportError::from_reqwest)?;
        let body = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "_raw": text }));
        let rate = RateLimit::from_headers(&headers);

        Ok(ApiResponse {
            status,
            method: req.method.clone(),
            url,
            username: String::new(),
            headers,
            body,
            rate,
        })
    }
}

/// Default factory: a fresh `reqwest` client per acquisition.
pub struct ReqwestTransportFactory;

impl TransportFactory for ReqwestTransportFactory {
    fn build(&self, account: &Account, proxy: Option<&str>) -> Result<Box<dyn Transport>> {
        Ok(Box::new(ReqwestTransport::for_account(account, proxy)?))
    }
}
