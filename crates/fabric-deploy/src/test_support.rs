//! Shared fixtures for unit tests: an in-process HTTP service with queued
//! per-route responses, a collecting reporter and on-disk item writers.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use fabric_deploy_auth::StaticTokenCredential;
use fabric_deploy_endpoint::{
    EndpointClient, EndpointSettings, HttpRequest, HttpResponse, Transport, TransportError,
};
use fabric_deploy_retry::RecordingSleeper;
use fabric_deploy_types::{FeatureFlag, FeatureFlags, Reporter, SharedReporter};
use tiny_http::{Header, Response, Server, StatusCode};

use crate::workspace::Workspace;

pub(crate) const WS_ID: &str = "12345678-1234-1234-1234-123456789abc";

pub(crate) fn jwt() -> String {
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
        URL_SAFE_NO_PAD.encode(r#"{"exp":4102444800,"oid":"tester"}"#)
    )
}

#[derive(Default)]
pub(crate) struct CollectingReporter {
    pub infos: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl Reporter for CollectingReporter {
    fn info(&mut self, msg: &str) {
        self.infos.push(msg.to_string());
    }

    fn warn(&mut self, msg: &str) {
        self.warns.push(msg.to_string());
    }

    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }
}

#[derive(Clone)]
pub(crate) struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

pub(crate) fn mock(status: u16, body: &str) -> MockResponse {
    MockResponse {
        status,
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body: body.to_string(),
    }
}

impl MockResponse {
    pub(crate) fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl SeenRequest {
    pub(crate) fn key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Serves routes keyed by `"METHOD /path?query"` until finished.
///
/// Each route replays its responses in order and repeats the last one.
/// Unknown routes answer 404.
pub(crate) struct MockService {
    base_url: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockService {
    pub(crate) fn start<F>(routes: F) -> Self
    where
        F: FnOnce(&str) -> Vec<(String, Vec<MockResponse>)>,
    {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base_url = format!("http://{}", server.server_addr());
        let mut routes: BTreeMap<String, Vec<MockResponse>> =
            routes(&base_url).into_iter().collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let seen_thread = Arc::clone(&seen);
        let stop_thread = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            while !stop_thread.load(Ordering::SeqCst) {
                let Ok(Some(mut req)) = server.recv_timeout(Duration::from_millis(20)) else {
                    continue;
                };
                let mut body = String::new();
                let _ = req.as_reader().read_to_string(&mut body);
                let seen_request = SeenRequest {
                    method: req.method().as_str().to_string(),
                    path: req.url().to_string(),
                    body,
                };
                let key = seen_request.key();
                seen_thread.lock().expect("lock").push(seen_request);

                let reply = match routes.get_mut(&key) {
                    Some(list) if list.len() > 1 => list.remove(0),
                    Some(list) if !list.is_empty() => list[0].clone(),
                    _ => mock(404, &format!(r#"{{"message":"no route for {key}"}}"#)),
                };
                let mut response = Response::from_data(reply.body.into_bytes())
                    .with_status_code(StatusCode(reply.status));
                for (name, value) in &reply.headers {
                    if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
                        response = response.with_header(header);
                    }
                }
                let _ = req.respond(response);
            }
        });

        Self {
            base_url,
            seen,
            stop,
            handle: Some(handle),
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop serving and return every request seen, in arrival order.
    pub(crate) fn finish(mut self) -> Vec<SeenRequest> {
        self.shutdown();
        self.seen.lock().expect("lock").clone()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("join server");
        }
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct OfflineTransport;

impl Transport for OfflineTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        Err(TransportError(format!("offline: {}", request.url)))
    }
}

pub(crate) struct TestWorkspace {
    pub workspace: Workspace,
    pub sleeper: RecordingSleeper,
    pub reporter: Arc<Mutex<CollectingReporter>>,
}

impl TestWorkspace {
    /// Workspace talking to `service`.
    pub(crate) fn new(service: &MockService, repo: &Path, flags: FeatureFlags) -> Self {
        let reporter = Arc::new(Mutex::new(CollectingReporter::default()));
        let shared: SharedReporter = reporter.clone();
        let sleeper = RecordingSleeper::new();
        let endpoint = EndpointClient::connect(
            Arc::new(StaticTokenCredential::new(jwt())),
            EndpointSettings::default(),
            &flags.clone().with(FeatureFlag::DisablePrintIdentity),
            shared,
        )
        .expect("endpoint")
        .with_sleeper(Arc::new(sleeper.clone()));
        let workspace = Workspace::new(WS_ID, repo, endpoint)
            .with_api_root_url(service.base_url())
            .with_flags(flags);
        Self {
            workspace,
            sleeper,
            reporter,
        }
    }

    /// Workspace whose every call fails at the transport.
    pub(crate) fn offline(repo: &Path) -> Self {
        let reporter = Arc::new(Mutex::new(CollectingReporter::default()));
        let shared: SharedReporter = reporter.clone();
        let sleeper = RecordingSleeper::new();
        let endpoint = EndpointClient::new(
            Arc::new(OfflineTransport),
            Arc::new(StaticTokenCredential::new(jwt())),
            EndpointSettings::default(),
            &FeatureFlags::default().with(FeatureFlag::DisablePrintIdentity),
            shared,
        )
        .expect("endpoint")
        .with_sleeper(Arc::new(sleeper.clone()));
        Self {
            workspace: Workspace::new(WS_ID, repo, endpoint),
            sleeper,
            reporter,
        }
    }

    pub(crate) fn infos(&self) -> Vec<String> {
        self.reporter.lock().expect("lock").infos.clone()
    }

    pub(crate) fn warnings(&self) -> Vec<String> {
        self.reporter.lock().expect("lock").warns.clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.reporter.lock().expect("lock").errors.clone()
    }
}

/// Write an item directory with a `.platform` file and `files` under `repo`.
pub(crate) fn write_item(
    repo: &Path,
    dir: &str,
    kind: &str,
    name: &str,
    logical_id: &str,
    files: &[(&str, &str)],
) {
    let item_dir = repo.join(dir);
    std::fs::create_dir_all(&item_dir).expect("item dir");
    let platform = serde_json::json!({
        "metadata": { "type": kind, "displayName": name },
        "config": { "version": "2.0", "logicalId": logical_id },
    });
    std::fs::write(item_dir.join(".platform"), platform.to_string()).expect("platform");
    for (file, content) in files {
        let path = item_dir.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("file dir");
        }
        std::fs::write(path, content).expect("file");
    }
}
