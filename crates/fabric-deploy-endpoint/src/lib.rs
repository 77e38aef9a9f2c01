//! Authenticated REST client for the deployment service.
//!
//! [`EndpointClient::invoke`] sends one logical request and drives it to a
//! final answer:
//!
//! - `429` responses back off exponentially, bounded by `Retry-After`.
//! - `202 Accepted` starts long-running operation polling at the `Location`
//!   header until the operation succeeds, fails or is undefined.
//! - An expired bearer token is refreshed and the request resent.
//! - A display name still reserved after a delete is retried with backoff.
//! - Every other error becomes an [`InvokeError`] carrying a request/response
//!   trace.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fabric_deploy_auth::EnvTokenCredential;
//! use fabric_deploy_endpoint::{EndpointClient, EndpointSettings};
//! use fabric_deploy_types::{ConsoleReporter, FeatureFlags, shared};
//!
//! let client = EndpointClient::connect(
//!     Arc::new(EnvTokenCredential::default()),
//!     EndpointSettings::default(),
//!     &FeatureFlags::default(),
//!     shared(ConsoleReporter),
//! )
//! .expect("token");
//! let items = client.get("https://api.fabric.microsoft.com/v1/workspaces/ws/items");
//! ```

mod classify;
mod error;
mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fabric_deploy_auth::{AuthError, TokenCredential, TokenManager};
use fabric_deploy_retry::{
    BackoffPolicy, BackoffProfile, INDENT, RetryExhausted, Sleeper, ThreadSleeper,
};
use fabric_deploy_types::{FeatureFlag, FeatureFlags, ReporterHandle, SharedReporter};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use classify::{Step, classify};
pub use error::{ConnectError, InvokeError, InvokeErrorKind, format_trace};
pub use transport::{
    ERROR_CODE_HEADER, FileAttachment, HttpRequest, HttpResponse, ReqwestTransport, Transport,
    TransportError,
};

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("fabric-deploy/", env!("CARGO_PKG_VERSION"));

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Tunables for the invoke loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Backoff for HTTP 429.
    pub throttle: BackoffPolicy,
    /// Backoff while a deleted item's display name is still reserved.
    pub name_reserved: BackoffPolicy,
    #[serde(with = "humantime_serde")]
    pub name_reserved_retry_after: Duration,
    /// Backoff between long-running operation polls.
    pub operation_poll: BackoffPolicy,
    /// Pause between a 202 and the first poll.
    #[serde(with = "humantime_serde")]
    pub initial_poll_delay: Duration,
    /// Used when a response carries no `Retry-After`.
    #[serde(with = "humantime_serde")]
    pub default_retry_after: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub token_scope: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            throttle: BackoffProfile::Throttle.to_policy(),
            name_reserved: BackoffProfile::NameReserved.to_policy(),
            name_reserved_retry_after: Duration::from_secs(300),
            operation_poll: BackoffProfile::OperationPoll.to_policy(),
            initial_poll_delay: Duration::from_secs(1),
            default_retry_after: Duration::from_secs(60),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            token_scope: fabric_deploy_auth::DEFAULT_SCOPE.to_string(),
        }
    }
}

/// One logical call, before retries.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    method: Method,
    url: String,
    body: Option<Value>,
    file: Option<FileAttachment>,
    max_retries: Option<u32>,
    error_prefix: String,
}

impl InvokeRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            file: None,
            max_retries: None,
            error_prefix: String::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send `file` as multipart form data instead of a JSON body.
    pub fn file(mut self, file: FileAttachment) -> Self {
        self.file = Some(file);
        self
    }

    /// Override the throttle and name-reserved attempt ceiling for this call.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Text prepended to the error message if the call fails.
    pub fn error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.error_prefix = prefix.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Final answer to an [`InvokeRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body; an empty object when the body was not JSON.
    pub body: Value,
}

impl InvokeResponse {
    /// String at a JSON pointer in the body, e.g. `/id`.
    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.body.pointer(pointer).and_then(Value::as_str)
    }
}

impl From<HttpResponse> for InvokeResponse {
    fn from(response: HttpResponse) -> Self {
        Self {
            status: response.status,
            body: response.json().unwrap_or_else(|| Value::Object(Map::new())),
            headers: response.headers,
        }
    }
}

/// Client that owns authentication and the retry/poll state machine.
pub struct EndpointClient {
    transport: Arc<dyn Transport>,
    tokens: TokenManager,
    settings: EndpointSettings,
    sleeper: Arc<dyn Sleeper>,
    reporter: SharedReporter,
}

impl EndpointClient {
    /// Build a client over `transport`, acquiring the first token immediately.
    pub fn new(
        transport: Arc<dyn Transport>,
        credential: Arc<dyn TokenCredential>,
        settings: EndpointSettings,
        flags: &FeatureFlags,
        reporter: SharedReporter,
    ) -> Result<Self, AuthError> {
        let print_identity = !flags.contains(FeatureFlag::DisablePrintIdentity);
        let tokens = TokenManager::new(
            credential,
            &settings.token_scope,
            reporter.clone(),
            print_identity,
        )?;
        Ok(Self {
            transport,
            tokens,
            settings,
            sleeper: Arc::new(ThreadSleeper),
            reporter,
        })
    }

    /// Build a client over the blocking `reqwest` transport.
    pub fn connect(
        credential: Arc<dyn TokenCredential>,
        settings: EndpointSettings,
        flags: &FeatureFlags,
        reporter: SharedReporter,
    ) -> Result<Self, ConnectError> {
        let transport = Arc::new(ReqwestTransport::new(settings.request_timeout)?);
        Ok(Self::new(transport, credential, settings, flags, reporter)?)
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        Arc::clone(&self.sleeper)
    }

    pub fn reporter(&self) -> &SharedReporter {
        &self.reporter
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn get(&self, url: &str) -> Result<InvokeResponse, InvokeError> {
        self.invoke(InvokeRequest::get(url))
    }

    pub fn post(&self, url: &str, body: Option<Value>) -> Result<InvokeResponse, InvokeError> {
        let request = InvokeRequest::post(url);
        self.invoke(match body {
            Some(body) => request.body(body),
            None => request,
        })
    }

    pub fn patch(&self, url: &str, body: Value) -> Result<InvokeResponse, InvokeError> {
        self.invoke(InvokeRequest::patch(url).body(body))
    }

    pub fn delete(&self, url: &str) -> Result<InvokeResponse, InvokeError> {
        self.invoke(InvokeRequest::delete(url))
    }

    /// Send `request` and follow retries and long-running polling to the end.
    pub fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse, InvokeError> {
        let InvokeRequest {
            mut method,
            mut url,
            mut body,
            mut file,
            max_retries,
            error_prefix,
        } = request;

        let ceiling = |policy: BackoffPolicy| match max_retries {
            Some(max) => policy.with_max_attempts(Some(max)),
            None => policy,
        };
        let throttle = ceiling(self.settings.throttle);
        let name_reserved = ceiling(self.settings.name_reserved);

        let mut long_running = false;
        let mut attempt: u32 = 0;

        loop {
            let token = self
                .tokens
                .bearer()
                .map_err(|e| InvokeError::new(e.into(), "", &error_prefix))?;
            let http = HttpRequest {
                method: method.clone(),
                url: url.clone(),
                headers: request_headers(&token, file.is_none()),
                body: body.clone(),
                file: file.clone(),
            };

            let response = self.transport.send(&http).map_err(|e| {
                InvokeError::new(
                    InvokeErrorKind::Transport {
                        method: method.to_string(),
                        url: url.clone(),
                        message: e.0,
                    },
                    format_trace(&http, None),
                    &error_prefix,
                )
            })?;
            let trace = format_trace(&http, Some(&response));
            let fail = |kind: InvokeErrorKind| InvokeError::new(kind, trace.clone(), &error_prefix);

            let step = classify(
                &response,
                long_running,
                method.as_str(),
                &url,
                self.settings.default_retry_after,
            );
            if step != Step::RefreshToken {
                attempt += 1;
            }

            match step {
                Step::Done => return Ok(response.into()),
                Step::RefreshToken => {
                    self.reporter
                        .info(&format!("{INDENT}AAD token expired. Refreshing token."));
                    self.tokens.force_refresh().map_err(|e| fail(e.into()))?;
                }
                Step::StartPolling { location } => {
                    self.sleeper.sleep(self.settings.initial_poll_delay);
                    long_running = true;
                    (method, url, body, file) = (Method::GET, location, None, None);
                }
                Step::Pending {
                    location,
                    retry_after,
                } => {
                    self.back_off(
                        &self.settings.operation_poll,
                        attempt.saturating_sub(1),
                        retry_after,
                        &format!("{INDENT}Operation in progress."),
                    )
                    .map_err(|e| fail(e.into()))?;
                    if let Some(location) = location {
                        url = location;
                    }
                    (method, body, file) = (Method::GET, None, None);
                }
                Step::Succeeded { location: None } => return Ok(response.into()),
                Step::Succeeded {
                    location: Some(location),
                } => {
                    long_running = false;
                    (method, url, body, file) = (Method::GET, location, None, None);
                }
                Step::Throttled { retry_after } => {
                    self.back_off(&throttle, attempt, retry_after, "API is throttled.")
                        .map_err(|e| fail(e.into()))?;
                }
                Step::NameReserved => {
                    self.back_off(
                        &name_reserved,
                        attempt,
                        self.settings.name_reserved_retry_after,
                        "Item name is reserved.",
                    )
                    .map_err(|e| fail(e.into()))?;
                }
                Step::Fail(kind) => return Err(fail(kind)),
            }
        }
    }

    fn back_off(
        &self,
        policy: &BackoffPolicy,
        attempt: u32,
        retry_after: Duration,
        prefix: &str,
    ) -> Result<(), RetryExhausted> {
        let wait = policy.next_wait(attempt, retry_after)?;
        self.reporter.info(&wait.describe(prefix));
        self.sleeper.sleep(wait.delay);
        Ok(())
    }
}

impl std::fmt::Debug for EndpointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointClient")
            .field("tokens", &self.tokens)
            .field("settings", &self.settings)
            .finish()
    }
}

fn request_headers(token: &str, json_body: bool) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Authorization".to_string(), format!("Bearer {token}")),
        ("User-Agent".to_string(), USER_AGENT.to_string()),
    ];
    if json_body {
        headers.push((
            "Content-Type".to_string(),
            "application/json; charset=utf-8".to_string(),
        ));
    }
    headers
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Read;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use fabric_deploy_auth::StaticTokenCredential;
    use fabric_deploy_retry::RecordingSleeper;
    use fabric_deploy_types::Reporter;
    use serde_json::json;
    use tiny_http::{Header, Response, Server, StatusCode};

    use super::*;

    fn jwt(tag: &str) -> String {
        let exp = chrono::Utc::now().timestamp() + 3600;
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"oid":"{tag}"}}"#))
        )
    }

    #[derive(Default)]
    struct CollectingReporter {
        infos: Vec<String>,
    }

    impl Reporter for CollectingReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, _msg: &str) {}

        fn error(&mut self, _msg: &str) {}
    }

    struct CountingCredential {
        calls: AtomicUsize,
    }

    impl TokenCredential for CountingCredential {
        fn get_token(&self, _scope: &str) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(jwt(&format!("token-{n}")))
        }
    }

    /// Replays canned responses and records what was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(Ok).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::from([Err(TransportError(message.to_string()))])),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<HttpRequest> {
            self.requests.lock().expect("lock").clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().expect("lock").push(request.clone());
            self.responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(500, "script exhausted")))
        }
    }

    struct Harness {
        client: EndpointClient,
        sleeper: RecordingSleeper,
        reporter: Arc<Mutex<CollectingReporter>>,
    }

    fn harness_with(
        transport: Arc<dyn Transport>,
        credential: Arc<dyn TokenCredential>,
    ) -> Harness {
        let reporter = Arc::new(Mutex::new(CollectingReporter::default()));
        let shared: SharedReporter = reporter.clone();
        let sleeper = RecordingSleeper::new();
        let client = EndpointClient::new(
            transport,
            credential,
            EndpointSettings::default(),
            &FeatureFlags::default().with(FeatureFlag::DisablePrintIdentity),
            shared,
        )
        .expect("client")
        .with_sleeper(Arc::new(sleeper.clone()));
        Harness {
            client,
            sleeper,
            reporter,
        }
    }

    fn harness(transport: Arc<dyn Transport>) -> Harness {
        harness_with(transport, Arc::new(StaticTokenCredential::new(jwt("static"))))
    }

    fn json_response(status: u16, body: &str) -> HttpResponse {
        HttpResponse::new(status, body).with_header("Content-Type", "application/json")
    }

    #[derive(Clone)]
    struct MockResponse {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    }

    fn mock(status: u16, body: &str) -> MockResponse {
        MockResponse {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        }
    }

    impl MockResponse {
        fn header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_string(), value.to_string()));
            self
        }
    }

    #[derive(Debug, Clone)]
    struct SeenRequest {
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl SeenRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(field, _)| field.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    struct TestServer {
        base_url: String,
        seen: Arc<Mutex<Vec<SeenRequest>>>,
        handle: thread::JoinHandle<()>,
    }

    impl TestServer {
        fn join(self) -> Vec<SeenRequest> {
            self.handle.join().expect("join server");
            let seen = self.seen.lock().expect("lock").clone();
            seen
        }
    }

    /// Serve `expected_requests` requests. Routes are keyed by `"METHOD /path"`
    /// and built from the server's base URL so responses can point back at it.
    fn spawn_server(
        expected_requests: usize,
        routes: impl FnOnce(&str) -> BTreeMap<String, Vec<MockResponse>>,
    ) -> TestServer {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base_url = format!("http://{}", server.server_addr());
        let mut routes = routes(&base_url);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_thread = Arc::clone(&seen);

        let handle = thread::spawn(move || {
            for _ in 0..expected_requests {
                let mut req = server.recv().expect("request");
                let mut body = String::new();
                req.as_reader().read_to_string(&mut body).expect("body");
                let key = format!("{} {}", req.method().as_str(), req.url());
                seen_thread.lock().expect("lock").push(SeenRequest {
                    method: req.method().as_str().to_string(),
                    path: req.url().to_string(),
                    headers: req
                        .headers()
                        .iter()
                        .map(|h| (h.field.to_string(), h.value.as_str().to_string()))
                        .collect(),
                    body,
                });

                let response = match routes.get_mut(&key) {
                    Some(list) if list.len() > 1 => list.remove(0),
                    Some(list) if !list.is_empty() => list[0].clone(),
                    _ => mock(404, "{}"),
                };

                let mut resp = Response::from_data(response.body.into_bytes())
                    .with_status_code(StatusCode(response.status));
                for (name, value) in &response.headers {
                    resp = resp.with_header(
                        Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("header"),
                    );
                }
                req.respond(resp).expect("respond");
            }
        });

        TestServer {
            base_url,
            seen,
            handle,
        }
    }

    fn http_harness() -> Harness {
        harness(Arc::new(
            ReqwestTransport::new(Duration::from_secs(10)).expect("transport"),
        ))
    }

    #[test]
    fn throttled_request_waits_for_retry_after() {
        let server = spawn_server(2, |_| {
            BTreeMap::from([(
                "GET /v1/items".to_string(),
                vec![
                    mock(429, "{}").header("Retry-After", "1"),
                    mock(200, r#"{"value":[]}"#),
                ],
            )])
        });
        let h = http_harness();

        let response = h
            .client
            .get(&format!("{}/v1/items", server.base_url))
            .expect("invoke");

        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"value": []}));
        assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(1)]);
        let infos = &h.reporter.lock().expect("lock").infos;
        assert!(infos.contains(
            &"->API is throttled. Checking again in 1 second (Attempt 1)...".to_string()
        ));

        let seen = server.join();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].header("Authorization").is_some_and(|v| v.starts_with("Bearer ")));
        assert_eq!(seen[0].header("User-Agent"), Some(USER_AGENT));
        assert_eq!(
            seen[0].header("Content-Type"),
            Some("application/json; charset=utf-8")
        );
    }

    #[test]
    fn accepted_request_polls_until_succeeded() {
        let server = spawn_server(4, |base| {
            BTreeMap::from([
                (
                    "POST /v1/items".to_string(),
                    vec![mock(202, "").header("Location", &format!("{base}/v1/operations/1"))],
                ),
                (
                    "GET /v1/operations/1".to_string(),
                    vec![
                        mock(200, r#"{"status":"Running"}"#),
                        mock(200, r#"{"status":"Running"}"#),
                        mock(200, r#"{"status":"Succeeded"}"#),
                    ],
                ),
            ])
        });
        let h = http_harness();

        let response = h
            .client
            .post(
                &format!("{}/v1/items", server.base_url),
                Some(json!({"displayName": "Hello"})),
            )
            .expect("invoke");

        assert_eq!(response.str_at("/status"), Some("Succeeded"));
        assert_eq!(
            h.sleeper.delays(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(2)
            ]
        );

        let seen = server.join();
        assert_eq!(seen[0].method, "POST");
        assert!(seen[0].body.contains("\"displayName\":\"Hello\""));
        assert!(seen[1..].iter().all(|r| r.method == "GET" && r.path == "/v1/operations/1"));
    }

    #[test]
    fn succeeded_operation_fetches_result_location() {
        let server = spawn_server(3, |base| {
            BTreeMap::from([
                (
                    "POST /v1/items".to_string(),
                    vec![mock(202, "").header("Location", &format!("{base}/v1/operations/7"))],
                ),
                (
                    "GET /v1/operations/7".to_string(),
                    vec![
                        mock(200, r#"{"status":"Succeeded"}"#)
                            .header("Location", &format!("{base}/v1/operations/7/result")),
                    ],
                ),
                (
                    "GET /v1/operations/7/result".to_string(),
                    vec![mock(200, r#"{"id":"remote-1"}"#)],
                ),
            ])
        });
        let h = http_harness();

        let response = h
            .client
            .post(&format!("{}/v1/items", server.base_url), None)
            .expect("invoke");

        assert_eq!(response.str_at("/id"), Some("remote-1"));
        assert_eq!(server.join().len(), 3);
    }

    #[test]
    fn file_upload_is_multipart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("environment.yml");
        std::fs::write(&path, "dependencies: []\n").expect("write");

        let server = spawn_server(1, |_| {
            BTreeMap::from([(
                "POST /v1/libraries".to_string(),
                vec![mock(200, "{}")],
            )])
        });
        let h = http_harness();

        h.client
            .invoke(
                InvokeRequest::post(format!("{}/v1/libraries", server.base_url))
                    .file(FileAttachment::from_path(&path)),
            )
            .expect("invoke");

        let seen = server.join();
        let content_type = seen[0].header("Content-Type").unwrap_or_default();
        assert!(content_type.starts_with("multipart/form-data"));
        assert!(seen[0].body.contains("filename=\"environment.yml\""));
        assert!(seen[0].body.contains("dependencies: []"));
    }

    #[test]
    fn persistent_throttling_exhausts_retries() {
        let transport = ScriptedTransport::new(vec![
            HttpResponse::new(429, "").with_header("Retry-After", "1"),
            HttpResponse::new(429, "").with_header("Retry-After", "1"),
            HttpResponse::new(429, "").with_header("Retry-After", "1"),
            HttpResponse::new(429, "").with_header("Retry-After", "1"),
        ]);
        let h = harness(transport.clone());

        let err = h
            .client
            .invoke(InvokeRequest::get("https://api.test/items").max_retries(3))
            .expect_err("exhausted");

        assert!(err.is_retries_exhausted());
        assert_eq!(err.to_string(), "Maximum retry attempts (3) exceeded.");
        assert_eq!(transport.sent().len(), 3);
        assert_eq!(h.sleeper.delays().len(), 2);
    }

    #[test]
    fn throttle_delay_grows_until_capped() {
        let transport = ScriptedTransport::new(vec![
            HttpResponse::new(429, ""),
            HttpResponse::new(429, ""),
            HttpResponse::new(429, ""),
            HttpResponse::new(200, "{}"),
        ]);
        let h = harness(transport);

        h.client.get("https://api.test/items").expect("invoke");

        assert_eq!(
            h.sleeper.delays(),
            vec![
                Duration::from_secs(20),
                Duration::from_secs(40),
                Duration::from_secs(60)
            ]
        );
    }

    #[test]
    fn expired_token_is_refreshed_without_counting_attempts() {
        let transport = ScriptedTransport::new(vec![
            HttpResponse::new(401, "").with_header(ERROR_CODE_HEADER, "TokenExpired"),
            HttpResponse::new(401, "").with_header(ERROR_CODE_HEADER, "TokenExpired"),
            HttpResponse::new(429, "").with_header("Retry-After", "1"),
            json_response(200, r#"{"ok":true}"#),
        ]);
        let credential = Arc::new(CountingCredential {
            calls: AtomicUsize::new(0),
        });
        let h = harness_with(transport.clone(), credential.clone());

        let response = h
            .client
            .invoke(InvokeRequest::get("https://api.test/items").max_retries(2))
            .expect("invoke");

        assert_eq!(response.body, json!({"ok": true}));
        assert_eq!(credential.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(1)]);

        let sent = transport.sent();
        assert_ne!(sent[0].headers[0].1, sent[2].headers[0].1);
        let infos = &h.reporter.lock().expect("lock").infos;
        assert_eq!(
            infos
                .iter()
                .filter(|m| m.as_str() == "->AAD token expired. Refreshing token.")
                .count(),
            2
        );
    }

    #[test]
    fn reserved_name_waits_and_retries() {
        let transport = ScriptedTransport::new(vec![
            HttpResponse::new(400, "")
                .with_header(ERROR_CODE_HEADER, "ItemDisplayNameNotAvailableYet"),
            json_response(201, r#"{"id":"abc"}"#),
        ]);
        let h = harness(transport);

        let response = h
            .client
            .post("https://api.test/items", Some(json!({})))
            .expect("invoke");

        assert_eq!(response.str_at("/id"), Some("abc"));
        assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(60)]);
    }

    fn name_reserved() -> HttpResponse {
        HttpResponse::new(400, "").with_header(ERROR_CODE_HEADER, "ItemDisplayNameNotAvailableYet")
    }

    #[test]
    fn reserved_name_gives_up_after_default_attempts() {
        let transport = ScriptedTransport::new(vec![name_reserved(); 6]);
        let h = harness(transport.clone());

        let err = h
            .client
            .post("https://api.test/items", Some(json!({})))
            .expect_err("exhausted");

        assert!(err.is_retries_exhausted());
        assert_eq!(err.to_string(), "Maximum retry attempts (5) exceeded.");
        assert_eq!(transport.sent().len(), 5);
        assert_eq!(
            h.sleeper.delays(),
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240),
                Duration::from_secs(300),
            ]
        );
        let infos = &h.reporter.lock().expect("lock").infos;
        assert!(infos.contains(
            &"->Item name is reserved. Checking again in 60 seconds (Attempt 1)...".to_string()
        ));
    }

    #[test]
    fn max_retries_override_caps_reserved_name_waits() {
        let transport = ScriptedTransport::new(vec![name_reserved(); 4]);
        let h = harness(transport.clone());

        let err = h
            .client
            .invoke(
                InvokeRequest::post("https://api.test/items")
                    .body(json!({}))
                    .max_retries(2),
            )
            .expect_err("exhausted");

        assert!(err.is_retries_exhausted());
        assert_eq!(err.to_string(), "Maximum retry attempts (2) exceeded.");
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(60)]);
    }

    #[test]
    fn failed_operation_returns_error_with_trace() {
        let transport = ScriptedTransport::new(vec![
            HttpResponse::new(202, "").with_header("Location", "https://api.test/op/1"),
            json_response(
                200,
                r#"{"status":"Failed","error":{"errorCode":"InvalidDefinition","message":"bad part"}}"#,
            ),
        ]);
        let h = harness(transport);

        let err = h
            .client
            .invoke(InvokeRequest::post("https://api.test/items").error_prefix("Failed to publish."))
            .expect_err("failed operation");

        assert_eq!(
            err.to_string(),
            "Failed to publish. Operation failed. Error Code: InvalidDefinition. Error Message: bad part"
        );
        assert!(err.trace().contains("URL: https://api.test/op/1"));
        assert!(err.trace().contains("Response Status: 200"));
    }

    #[test]
    fn hard_failures_are_not_retried() {
        let transport = ScriptedTransport::new(vec![
            HttpResponse::new(401, "").with_header(ERROR_CODE_HEADER, "Unauthorized"),
        ]);
        let h = harness(transport.clone());

        let err = h.client.delete("https://api.test/items/1").expect_err("unauthorized");

        assert!(matches!(err.kind(), InvokeErrorKind::Unauthorized { .. }));
        assert_eq!(transport.sent().len(), 1);
        assert!(h.sleeper.delays().is_empty());
    }

    #[test]
    fn non_json_success_body_becomes_empty_object() {
        let transport = ScriptedTransport::new(vec![HttpResponse::new(200, "plain text")]);
        let h = harness(transport);

        let response = h.client.get("https://api.test/ping").expect("invoke");
        assert_eq!(response.body, json!({}));
    }

    #[test]
    fn transport_failure_is_reported() {
        let h = harness(ScriptedTransport::failing("connection refused"));

        let err = h.client.get("https://api.test/items").expect_err("transport");
        assert!(matches!(err.kind(), InvokeErrorKind::Transport { .. }));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn settings_deserialize_with_humantime() {
        let settings: EndpointSettings = serde_json::from_value(json!({
            "throttle": {"base_delay": "2s", "max_attempts": 3},
            "initial_poll_delay": "250ms"
        }))
        .expect("settings");
        assert_eq!(settings.throttle.base_delay, Duration::from_secs(2));
        assert_eq!(settings.throttle.max_attempts, Some(3));
        assert_eq!(settings.initial_poll_delay, Duration::from_millis(250));
        assert_eq!(settings.default_retry_after, Duration::from_secs(60));
    }

    #[test]
    fn user_agent_includes_version() {
        assert!(USER_AGENT.starts_with("fabric-deploy/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
