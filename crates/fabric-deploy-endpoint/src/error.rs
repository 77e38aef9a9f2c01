use fabric_deploy_auth::AuthError;
use fabric_deploy_retry::RetryExhausted;
use serde_json::Value;
use thiserror::Error;

use crate::transport::{HttpRequest, HttpResponse, TransportError};

/// Why a call was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeErrorKind {
    #[error("The executing identity is not authorized to call {method} on '{url}'.")]
    Unauthorized { method: String, url: String },

    #[error("The executing principal type is not supported to call {method} on '{url}'.")]
    PrincipalTypeNotSupported { method: String, url: String },

    #[error(
        "Deployment attempted to remove a library that is not present in the environment. Description: {0}"
    )]
    LibraryNotPresent(String),

    #[error("Item type not supported. Description: {0}")]
    FeatureNotAvailable(String),

    #[error("Operation failed. Error Code: {code}. Error Message: {message}")]
    OperationFailed { code: String, message: String },

    #[error("Operation is in an undefined state. Full Body: {0}")]
    OperationUndefined(String),

    #[error("Accepted response from {method} on '{url}' did not include a Location header.")]
    MissingLocation { method: String, url: String },

    #[error("Unhandled error occurred calling {method} on '{url}'.{detail}")]
    Unhandled {
        method: String,
        url: String,
        detail: String,
    },

    #[error(transparent)]
    RetriesExhausted(#[from] RetryExhausted),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Transport failure calling {method} on '{url}': {message}")]
    Transport {
        method: String,
        url: String,
        message: String,
    },
}

/// Why [`crate::EndpointClient::connect`] could not build a client.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// A failed endpoint call together with the trace of its last exchange.
#[derive(Debug, Clone, Error)]
#[error("{prefix}{kind}")]
pub struct InvokeError {
    kind: InvokeErrorKind,
    trace: String,
    prefix: String,
}

impl InvokeError {
    pub fn new(kind: InvokeErrorKind, trace: impl Into<String>, prefix: &str) -> Self {
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{} ", prefix.trim_end())
        };
        Self {
            kind,
            trace: trace.into(),
            prefix,
        }
    }

    pub fn kind(&self) -> &InvokeErrorKind {
        &self.kind
    }

    /// Request and response dump of the exchange that failed.
    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self.kind, InvokeErrorKind::RetriesExhausted(_))
    }
}

/// Render one request/response exchange for debugging.
pub fn format_trace(request: &HttpRequest, response: Option<&HttpResponse>) -> String {
    let mut lines = vec![
        format!("URL: {}", request.url),
        format!("Method: {}", request.method),
    ];
    match (&request.body, &request.file) {
        (_, Some(file)) => lines.push(format!("Request File: {}", file.file_name)),
        (Some(body), None) => lines.push(format!("Request Body:\n{}", pretty(body))),
        (None, None) => lines.push("Request Body: None".to_string()),
    }

    if let Some(response) = response {
        lines.push(format!("Response Status: {}", response.status));
        lines.push("Response Headers:".to_string());
        let headers = serde_json::to_value(&response.headers).unwrap_or(Value::Null);
        lines.push(pretty(&headers));
        lines.push("Response Body:".to_string());
        lines.push(match response.json() {
            Some(body) => pretty(&body),
            None => response.body.clone(),
        });
    }

    lines.join("\n")
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
