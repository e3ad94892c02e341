use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rayon::prelude::*;
use reqwest::Method;
use reqwest::blocking::Client;
use reqwest::header::{RETRY_AFTER, USER_AGENT};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::HttpConfig;
use crate::error::{HubError, Result};
use crate::rate_limit::RateLimiter;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn host(&self) -> String {
        host_of(&self.url)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "timeout: {msg}"),
            TransportError::Connect(msg) => write!(f, "connect: {msg}"),
            TransportError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Sends one request, no retries. The seam between the client's policy and the wire.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| HubError::Http(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut req = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }
        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().map_err(classify_reqwest_error)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.text().map_err(classify_reqwest_error)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// Provider-agnostic HTTP client: per-host rate limiting, bounded retries with
/// exponential backoff, and a bounded worker pool for batches.
pub struct RateLimitedClient {
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    user_agent: String,
    max_retries: u32,
    base_delay: Duration,
    workers: Option<rayon::ThreadPool>,
}

impl RateLimitedClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: &HttpConfig, transport: Arc<dyn Transport>) -> Self {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_connections.max(1))
            .thread_name(|i| format!("http-worker-{i}"))
            .build()
            .ok();
        Self {
            transport,
            limiter: RateLimiter::new(config),
            user_agent: config.user_agent.clone(),
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            workers,
        }
    }

    pub fn get(&self, url: &str, cancel: &CancelToken) -> Result<HttpResponse> {
        self.request(&HttpRequest::get(url), cancel)
    }

    /// One logical request. 429, 5xx and transport failures are retried up to
    /// `max_retries` times; every other status is returned to the caller.
    pub fn request(&self, request: &HttpRequest, cancel: &CancelToken) -> Result<HttpResponse> {
        let host = request.host();
        let request = self.with_default_headers(request);
        let mut attempt: u32 = 0;

        loop {
            cancel.check()?;
            self.limiter.acquire(&host, cancel)?;

            let delay = match self.transport.send(&request) {
                Ok(resp) if resp.status == 429 => {
                    let retry_after = parse_retry_after(&resp);
                    if attempt >= self.max_retries {
                        warn!(host = %host, attempts = attempt + 1, "rate limited, giving up");
                        return Err(HubError::RateLimited {
                            host,
                            attempts: attempt + 1,
                            retry_after,
                        });
                    }
                    let delay = retry_after
                        .unwrap_or_else(|| self.exponential(attempt))
                        .min(MAX_BACKOFF);
                    warn!(host = %host, attempt, delay_ms = delay.as_millis() as u64, "429 received, backing off");
                    delay
                }
                Ok(resp) if resp.status >= 500 => {
                    let reason = format!("http {}", resp.status);
                    self.transient_delay(&request.url, attempt, reason)?
                }
                Ok(resp) => {
                    debug!(host = %host, status = resp.status, attempt, "request complete");
                    return Ok(resp);
                }
                Err(err) => self.transient_delay(&request.url, attempt, err.to_string())?,
            };

            cancel.sleep(delay)?;
            attempt += 1;
        }
    }

    /// Runs every request on the bounded worker pool. Output order matches
    /// input order; a failed request is an `Err` slot, not a failed batch.
    pub fn parallel_requests(
        &self,
        requests: &[HttpRequest],
        cancel: &CancelToken,
    ) -> Vec<Result<HttpResponse>> {
        let run = || {
            requests
                .par_iter()
                .map(|req| self.request(req, cancel))
                .collect::<Vec<_>>()
        };
        match self.workers.as_ref() {
            Some(pool) => pool.install(run),
            None => requests.iter().map(|req| self.request(req, cancel)).collect(),
        }
    }

    fn transient_delay(&self, url: &str, attempt: u32, reason: String) -> Result<Duration> {
        if attempt >= self.max_retries {
            warn!(url = %url, attempts = attempt + 1, reason = %reason, "retries exhausted");
            return Err(HubError::TransientNetwork {
                url: url.to_string(),
                attempts: attempt + 1,
                reason,
            });
        }
        let jitter = 0.5 + rand::thread_rng().gen_range(0.0..1.0);
        let delay = self.exponential(attempt).mul_f64(jitter).min(MAX_BACKOFF);
        warn!(url = %url, attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "transient failure, retrying");
        Ok(delay)
    }

    fn exponential(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(2f64.powi(attempt.min(16) as i32))
    }

    fn with_default_headers(&self, request: &HttpRequest) -> HttpRequest {
        let mut request = request.clone();
        let has_agent = request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(USER_AGENT.as_str()));
        if !has_agent {
            request
                .headers
                .push((USER_AGENT.as_str().to_string(), self.user_agent.clone()));
        }
        request
    }
}

pub fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(resp: &HttpResponse) -> Option<Duration> {
    let raw = resp.header(RETRY_AFTER.as_str())?.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
