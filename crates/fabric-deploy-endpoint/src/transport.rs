//! The single-request seam under the endpoint client.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::Value;
use thiserror::Error;

use crate::USER_AGENT;

/// Header carrying the service's machine-readable error code.
pub const ERROR_CODE_HEADER: &str = "x-ms-public-api-error-code";

/// A file sent as the multipart field `file` instead of a JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub file_name: String,
    pub path: PathBuf,
}

impl FileAttachment {
    /// Attach `path`, using its final component as the uploaded name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { file_name, path }
    }
}

/// One fully-resolved HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub file: Option<FileAttachment>,
}

/// One raw HTTP response. Header names are lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Builder-style header insertion, mostly for tests and fakes.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the server declared a JSON body.
    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.contains("application/json"))
    }

    /// Body parsed as JSON, or `None` when empty or not JSON.
    pub fn json(&self) -> Option<Value> {
        if self.body.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }

    /// Error code from the dedicated header, falling back to the body's `errorCode`.
    pub fn error_code(&self) -> Option<String> {
        if let Some(code) = self.header(ERROR_CODE_HEADER) {
            return Some(code.to_string());
        }
        self.json()
            .and_then(|body| body.get("errorCode").and_then(Value::as_str).map(str::to_string))
    }

    /// Value of the body's top-level `message`, when present.
    pub fn message(&self) -> Option<String> {
        self.json()
            .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends a single request and returns the raw response.
///
/// Implementations must not retry; the endpoint client owns retry policy.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking `reqwest` transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(file) = &request.file {
            let part = Part::file(&file.path)
                .map_err(|e| {
                    TransportError(format!("failed to read {}: {e}", file.path.display()))
                })?
                .file_name(file.file_name.clone());
            builder = builder.multipart(Form::new().part("file", part));
        } else if let Some(body) = &request.body {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| TransportError(format!("failed to encode request body: {e}")))?;
            builder = builder.body(bytes);
        }

        let response = builder
            .send()
            .map_err(|e| TransportError(format!("request to {} failed: {e}", request.url)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .map_err(|e| TransportError(format!("failed to read response body: {e}")))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
