use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use uuid::Uuid;

use crate::db::Database;
use crate::errors::{AgentError, Result};
use crate::models::{Download, InstalledVersion};
use crate::services::download_worker::TransferJob;
use crate::services::endpoint_resolver::{EndpointResolver, SrvLookup, SrvRecord};
use crate::services::job_registry::JobControl;
use crate::services::notifier::Notifier;
use crate::services::package_system::{InstallRequest, PackageSystem};
use crate::services::{ApiClient, AuthService, CatalogService, TokenManager};
use crate::utils::crypto::SecretBox;
use crate::utils::file::FileManager;

pub struct NoRecords;

#[async_trait]
impl SrvLookup for NoRecords {
    async fn lookup(&self, _name: &str) -> Result<Vec<SrvRecord>> {
        Ok(Vec::new())
    }
}

/// Resolver that always lands on `url`.
pub fn static_resolver(url: &str) -> EndpointResolver {
    EndpointResolver::new(
        Arc::new(NoRecords),
        "example.invalid",
        "api",
        url,
        Duration::from_millis(50),
    )
}

pub fn test_secrets() -> SecretBox {
    SecretBox::new(&[7u8; 32]).expect("test key")
}

/// Catalog client pointed at a closed local port; only for paths that never call out.
pub fn test_catalog(db: &Database) -> CatalogService {
    let client = reqwest::Client::new();
    let endpoints = static_resolver("http://127.0.0.1:9/api/");
    let tokens = TokenManager::new(db.clone(), test_secrets());
    let auth = AuthService::new(client.clone(), endpoints.clone(), tokens);
    CatalogService::new(ApiClient::new(client, endpoints, auth))
}

pub fn temp_files() -> FileManager {
    let dir = std::env::temp_dir().join(format!("storefront-test-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir).expect("create downloads dir");
    FileManager::new(dir)
}

/// Writes a finished artifact for `package` and returns its path.
pub fn write_artifact(files: &FileManager, package: &str, bytes: &[u8]) -> PathBuf {
    let path = files.artifact_path(package).expect("artifact path");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create package dir");
    }
    fs::write(&path, bytes).expect("write artifact");
    path
}

#[derive(Default)]
pub struct FakePackageSystem {
    requests: Mutex<Vec<InstallRequest>>,
    versions: Mutex<HashMap<String, i64>>,
    fail_open: AtomicBool,
    next_session: AtomicI32,
}

impl FakePackageSystem {
    pub fn set_installed_version(&self, package: &str, version_code: i64) {
        self.versions
            .lock()
            .expect("versions lock")
            .insert(package.to_string(), version_code);
    }

    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<InstallRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl PackageSystem for FakePackageSystem {
    async fn begin_install(&self, request: InstallRequest) -> Result<i32> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            return Err(AgentError::Install("session could not be opened".to_string()));
        }
        self.requests.lock().expect("requests lock").push(request);
        Ok(self.next_session.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn installed_version(&self, package_name: &str) -> Result<Option<InstalledVersion>> {
        Ok(self
            .versions
            .lock()
            .expect("versions lock")
            .get(package_name)
            .map(|version_code| InstalledVersion {
                version_code: *version_code,
            }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    fn record(&self, event: String) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl Notifier for RecordingNotifier {
    fn install_succeeded(&self, package_name: &str, _display_name: &str, updated: bool) {
        let verb = if updated { "updated" } else { "installed" };
        self.record(format!("{verb}:{package_name}"));
    }

    fn install_failed(&self, package_name: &str, _display_name: &str, message: &str) {
        self.record(format!("failed:{package_name}:{message}"));
    }

    fn user_action_required(&self, package_name: &str, _confirmation: Option<&str>) {
        self.record(format!("confirm:{package_name}"));
    }
}

/// Transfer stand-in that records which packages started.
pub struct FakeTransfer {
    started: Mutex<Vec<String>>,
    hold: bool,
    fail: bool,
    release: tokio::sync::Notify,
}

impl FakeTransfer {
    /// Runs until `release` is called or the job is cancelled.
    pub fn holding() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            hold: true,
            fail: false,
            release: tokio::sync::Notify::new(),
        }
    }

    /// Fails straight away with a server error.
    pub fn failing() -> Self {
        Self {
            hold: false,
            fail: true,
            ..Self::holding()
        }
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().expect("started lock").clone()
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl TransferJob for FakeTransfer {
    async fn run(&self, download: Download, mut control: watch::Receiver<JobControl>) -> Result<()> {
        self.started
            .lock()
            .expect("started lock")
            .push(download.package_name.clone());
        if self.fail {
            return Err(AgentError::Http("HTTP 500: simulated".to_string()));
        }
        if self.hold {
            tokio::select! {
                _ = self.release.notified() => {}
                _ = control.changed() => {
                    return Err(AgentError::Cancelled(download.package_name));
                }
            }
        }
        Ok(())
    }
}

/// Polls `check` for up to a second.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(check(), "condition not reached in time");
}

/// One request as seen by [`StubServer`].
#[derive(Clone, Debug)]
pub struct StubRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

type Responder = dyn Fn(&StubRequest) -> (u16, String) + Send + Sync;

/// Local HTTP/1.1 server that answers each connection through `respond`.
pub struct StubServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
}

impl StubServer {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&StubRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let respond: Arc<Responder> = Arc::new(respond);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let seen = seen.clone();
                let respond = respond.clone();
                tokio::spawn(async move { answer(socket, seen, respond).await });
            }
        });
        Self {
            base_url: format!("http://{addr}/api/"),
            requests,
        }
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

async fn answer(
    mut socket: TcpStream,
    seen: Arc<Mutex<Vec<StubRequest>>>,
    respond: Arc<Responder>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => buf.extend_from_slice(&chunk[..read]),
        }
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let mut content_length = 0;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    while buf.len() < header_end + content_length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => buf.extend_from_slice(&chunk[..read]),
        }
    }

    let request = StubRequest {
        method,
        path,
        authorization,
        body: String::from_utf8_lossy(&buf[header_end..]).to_string(),
    };
    let (status, payload) = respond(&request);
    seen.lock().expect("requests lock").push(request);

    let response = format!(
        "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
