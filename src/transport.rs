use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Exact HTTP request a provider expects. Built by the provider adapters and
/// executed by a `Transport`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPayload {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub timeout: Duration,
}

impl ProviderPayload {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Body::Json(body),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn post_form(url: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Form(fields),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Serialized body exactly as it goes over the wire.
    pub fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            Body::Empty => Vec::new(),
            Body::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Body::Form(fields) => fields
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("&")
                .into_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: value.to_string().into_bytes(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn parse_json(&self) -> Result<Value, ProviderError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ProviderError::parse(format!("invalid JSON body: {err}")))
    }

    pub fn text_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(300).collect()
    }
}

/// Executes provider payloads. Implementations must classify failures:
/// network failures, 429 and 5xx become `ProviderError::Transient`, every
/// other non-success status becomes `ProviderError::Fatal`.
pub trait Transport: Send + Sync {
    fn call(&self, request: &ProviderPayload) -> Result<HttpResponse, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Fatal,
}

pub fn classify_status(status: u16) -> StatusClass {
    match StatusCode::from_u16(status) {
        Ok(code) if code.is_success() => StatusClass::Success,
        Ok(code) if should_retry_status(code) => StatusClass::Transient,
        Ok(_) => StatusClass::Fatal,
        Err(_) => StatusClass::Fatal,
    }
}

/// Turns a non-success response into the matching provider error.
pub fn status_error(response: &HttpResponse, url: &str) -> Option<ProviderError> {
    let message = format!(
        "{} returned status {}: {}",
        redact(url),
        response.status,
        response.text_excerpt()
    );
    match classify_status(response.status) {
        StatusClass::Success => None,
        StatusClass::Transient => Some(ProviderError::Transient(message)),
        StatusClass::Fatal => Some(ProviderError::Fatal(message)),
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    if let Some(status) = err.status() {
        if should_retry_status(status) {
            return true;
        }
    }
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Drops query strings so API keys passed as `?key=` never reach logs.
pub fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self { http })
    }
}

impl Transport for ReqwestTransport {
    fn call(&self, request: &ProviderPayload) -> Result<HttpResponse, ProviderError> {
        let mut builder = match request.method {
            Method::Get => self.http.get(&request.url),
            Method::Post => self.http.post(&request.url),
        };
        builder = builder.timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Form(fields) => builder.form(fields),
        };

        debug!(url = redact(&request.url), "issuing provider call");
        let resp = builder.send().map_err(|err| {
            let retryable = is_retryable_error(&err);
            let message = format!("calling {}: {}", redact(&request.url), err.without_url());
            if retryable {
                ProviderError::Transient(message)
            } else {
                ProviderError::Fatal(message)
            }
        })?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|s| s.to_string());
        let body = resp
            .bytes()
            .map_err(|err| {
                ProviderError::Transient(format!(
                    "reading body from {}: {}",
                    redact(&request.url),
                    err.without_url()
                ))
            })?
            .to_vec();
        let response = HttpResponse {
            status,
            content_type,
            body,
        };
        match status_error(&response, &request.url) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }
}
