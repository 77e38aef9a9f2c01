//! Maps one response to the next step of the invoke loop.
//!
//! Rules are checked in order; the first match wins:
//!
//! | Response | Step |
//! |---|---|
//! | 401 + `TokenExpired` | refresh token, resend |
//! | 202, or 200 while polling | start or continue long-running polling |
//! | 200, 201, 404 + `EnvironmentLibrariesNotFound` | done |
//! | 429 | throttled, back off |
//! | 401 + `Unauthorized` | fail |
//! | 400 + `ItemDisplayNameNotAvailableYet` | name reserved, back off |
//! | 400 with "is not present in the environment." | fail |
//! | 400 + `PrincipalTypeNotSupported` | fail |
//! | 403 + `FeatureNotAvailable` | fail |
//! | anything else | fail with the server's message |

use std::time::Duration;

use serde_json::Value;

use crate::error::InvokeErrorKind;
use crate::transport::HttpResponse;

const LIBRARY_NOT_PRESENT: &str = "is not present in the environment.";

/// What the invoke loop does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Return this response to the caller.
    Done,
    /// 401 `TokenExpired`: refresh and resend without counting an attempt.
    RefreshToken,
    /// 202 Accepted: wait, then poll the operation at `location`.
    StartPolling { location: String },
    /// Operation still running: back off and poll again.
    Pending {
        location: Option<String>,
        retry_after: Duration,
    },
    /// Operation finished; fetch the result when a location is given.
    Succeeded { location: Option<String> },
    Throttled { retry_after: Duration },
    NameReserved,
    Fail(InvokeErrorKind),
}

/// Classify `response` to a request made with `method` on `url`.
pub fn classify(
    response: &HttpResponse,
    long_running: bool,
    method: &str,
    url: &str,
    default_retry_after: Duration,
) -> Step {
    let status = response.status;
    let code = response.error_code();
    let code = code.as_deref();
    let location = response.header("location").map(str::to_string);
    let retry_after = retry_after(response, default_retry_after);

    if status == 401 && code == Some("TokenExpired") {
        return Step::RefreshToken;
    }

    if (status == 200 && long_running) || status == 202 {
        if !long_running {
            return match location {
                Some(location) => Step::StartPolling { location },
                None => Step::Fail(InvokeErrorKind::MissingLocation {
                    method: method.to_string(),
                    url: url.to_string(),
                }),
            };
        }
        return operation_step(response, location, retry_after);
    }

    if status == 200
        || status == 201
        || (status == 404 && code == Some("EnvironmentLibrariesNotFound"))
    {
        return Step::Done;
    }

    if status == 429 {
        return Step::Throttled { retry_after };
    }

    if status == 401 && code == Some("Unauthorized") {
        return Step::Fail(InvokeErrorKind::Unauthorized {
            method: method.to_string(),
            url: url.to_string(),
        });
    }

    if status == 400 {
        if code == Some("ItemDisplayNameNotAvailableYet") {
            return Step::NameReserved;
        }
        if let Some(message) = response.message()
            && message.contains(LIBRARY_NOT_PRESENT)
        {
            return Step::Fail(InvokeErrorKind::LibraryNotPresent(message));
        }
        if code == Some("PrincipalTypeNotSupported") {
            return Step::Fail(InvokeErrorKind::PrincipalTypeNotSupported {
                method: method.to_string(),
                url: url.to_string(),
            });
        }
    }

    if status == 403 && code == Some("FeatureNotAvailable") {
        return Step::Fail(InvokeErrorKind::FeatureNotAvailable(
            "FeatureNotAvailable".to_string(),
        ));
    }

    Step::Fail(InvokeErrorKind::Unhandled {
        method: method.to_string(),
        url: url.to_string(),
        detail: unhandled_detail(response),
    })
}

fn operation_step(response: &HttpResponse, location: Option<String>, retry_after: Duration) -> Step {
    let body = response.json().unwrap_or(Value::Null);
    match body.get("status").and_then(Value::as_str) {
        Some("Succeeded") => Step::Succeeded { location },
        Some("Failed") => {
            let error = body.get("error");
            let field = |name: &str| {
                error
                    .and_then(|e| e.get(name))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            Step::Fail(InvokeErrorKind::OperationFailed {
                code: field("errorCode"),
                message: field("message"),
            })
        }
        Some("Undefined") => Step::Fail(InvokeErrorKind::OperationUndefined(body.to_string())),
        _ => Step::Pending {
            location,
            retry_after,
        },
    }
}

/// `Retry-After` in (possibly fractional) seconds, or the default.
fn retry_after(response: &HttpResponse, default: Duration) -> Duration {
    response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

fn unhandled_detail(response: &HttpResponse) -> String {
    if !response.is_json() {
        return String::new();
    }
    let Some(body) = response.json() else {
        return String::new();
    };
    let Some(message) = body.get("message").and_then(Value::as_str) else {
        return String::new();
    };
    let more = body
        .get("moreDetails")
        .map(|details| match details {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    format!(" Message: {message}.  {more}").trim_end().to_string()
}
