//! HTTP transport abstraction.
//!
//! Every network call made by the asset resolver, the Splunkd client and
//! the search dispatcher goes through [`HttpTransport`]. Production code
//! uses [`ReqwestTransport`]; tests substitute in-memory transports that
//! record calls and return canned responses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use std::time::{Duration, Instant};

use crate::config::SplunkdConfig;
use crate::error::PublishError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// An outgoing request. `form` is sent `application/x-www-form-urlencoded`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            form: None,
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            form: Some(form),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Attach an `Authorization` header when credentials are present.
    pub fn auth(self, credentials: &Credentials) -> Self {
        match credentials.header_value() {
            Some(value) => self.header("Authorization", value),
            None => self,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// `Content-Type` header, verbatim.
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// REST convention used by Splunkd: anything above 299 is a failure.
    pub fn is_success(&self) -> bool {
        self.status <= 299
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body).context("response body is not valid JSON")
    }
}

/// Sends HTTP requests. Implementations must be shareable across tasks.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Authentication for Splunkd calls: a bearer token is preferred, otherwise
/// HTTP Basic from username/password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
    None,
}

impl Credentials {
    pub fn from_config(config: &SplunkdConfig) -> Self {
        if let Some(token) = config.token.as_ref().filter(|t| !t.is_empty()) {
            return Credentials::Bearer(token.clone());
        }
        match (&config.username, &config.password) {
            (None, None) => Credentials::None,
            (user, pass) => Credentials::Basic {
                username: user.clone().unwrap_or_default(),
                password: pass.clone().unwrap_or_default(),
            },
        }
    }

    pub fn header_value(&self) -> Option<String> {
        match self {
            Credentials::Bearer(token) => Some(format!("Bearer {}", token)),
            Credentials::Basic { username, password } => {
                let raw = format!("{}:{}", username, password);
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                ))
            }
            Credentials::None => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::Bearer(_) => "bearer",
            Credentials::Basic { .. } => "basic",
            Credentials::None => "none",
        }
    }
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &SplunkdConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

/// Wrap a reqwest failure, keeping its source chain. Timeouts become
/// [`PublishError::Timeout`] so callers can classify them.
fn request_error(request: &HttpRequest, e: reqwest::Error) -> anyhow::Error {
    tracing::error!(
        method = request.method.as_str(),
        url = %request.url,
        timeout = e.is_timeout(),
        error = %e,
        "request failed"
    );
    let timed_out = e.is_timeout();
    let err = anyhow::Error::new(e);
    if timed_out {
        err.context(PublishError::Timeout {
            method: request.method.as_str().to_string(),
            url: request.url.clone(),
        })
    } else {
        err.context(format!("{} {} failed", request.method.as_str(), request.url))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let started = Instant::now();
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| request_error(&request, e))?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| request_error(&request, e))?
            .to_vec();

        tracing::debug!(
            method = request.method.as_str(),
            url = %request.url,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "response received"
        );

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}


/// In-memory transport for unit tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Route {
        method: Method,
        url_contains: String,
        responses: VecDeque<HttpResponse>,
    }

    /// Answers requests from scripted routes and records every call.
    ///
    /// A route serves its queued responses in order and keeps repeating
    /// the last one. Unmatched requests fail as a transport error.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        routes: Mutex<Vec<Route>>,
        calls: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn on(self, method: Method, url_contains: &str, response: HttpResponse) -> Self {
            self.push(method, url_contains, response);
            self
        }

        pub(crate) fn push(&self, method: Method, url_contains: &str, response: HttpResponse) {
            let mut routes = self.routes.lock().unwrap();
            if let Some(route) = routes
                .iter_mut()
                .find(|r| r.method == method && r.url_contains == url_contains)
            {
                route.responses.push_back(response);
                return;
            }
            routes.push(Route {
                method,
                url_contains: url_contains.to_string(),
                responses: VecDeque::from([response]),
            });
        }

        pub(crate) fn calls(&self) -> Vec<HttpRequest> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, url_contains: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.url.contains(url_contains))
                .count()
        }
    }

    pub(crate) fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> HttpResponse {
        HttpResponse {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    pub(crate) fn json(value: serde_json::Value) -> HttpResponse {
        ok("application/json", value.to_string())
    }

    pub(crate) fn status(code: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status: code,
            content_type: Some("text/plain".to_string()),
            body: body.as_bytes().to_vec(),
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.calls.lock().unwrap().push(request.clone());
            let mut routes = self.routes.lock().unwrap();
            let route = routes
                .iter_mut()
                .filter(|r| r.method == request.method && request.url.contains(&r.url_contains))
                .max_by_key(|r| r.url_contains.len())
                .ok_or_else(|| anyhow::anyhow!("no mock route for {}", request.url))?;
            let response = if route.responses.len() > 1 {
                route.responses.pop_front()
            } else {
                route.responses.front().cloned()
            };
            response.ok_or_else(|| anyhow::anyhow!("mock route exhausted: {}", request.url))
        }
    }
}
