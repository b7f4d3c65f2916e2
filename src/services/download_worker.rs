use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::db::queries::{DownloadProgress, DownloadQueries};
use crate::db::Database;
use crate::errors::{AgentError, Result};
use crate::models::{Download, DownloadStatus};
use crate::services::catalog_service::CatalogService;
use crate::services::installation_controller::InstallationController;
use crate::services::job_registry::JobControl;
use crate::utils::crypto::md5_file_hex;
use crate::utils::file::FileManager;

const REPORT_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Background work for one claimed download row.
#[async_trait]
pub trait TransferJob: Send + Sync {
    async fn run(&self, download: Download, control: watch::Receiver<JobControl>) -> Result<()>;
}

/// Streams an artifact to disk, verifies it and hands it to the installer.
pub struct DownloadWorker {
    db: Database,
    files: FileManager,
    catalog: CatalogService,
    client: reqwest::Client,
    installer: InstallationController,
    attempts: u32,
    backoff: Duration,
}

impl DownloadWorker {
    pub fn new(
        db: Database,
        files: FileManager,
        catalog: CatalogService,
        client: reqwest::Client,
        installer: InstallationController,
        attempts: u32,
    ) -> Self {
        Self {
            db,
            files,
            catalog,
            client,
            installer,
            attempts: attempts.max(1),
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn resolve_link(&self, download: &mut Download) -> Result<String> {
        if let Some(url) = download.url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.to_string());
        }
        let link = self.catalog.download_link(&download.package_name).await?;
        self.db.set_download_link(&download.package_name, &link)?;
        tracing::info!(
            "resolved download link for {} (versionCode {})",
            download.package_name,
            link.version_code
        );
        download.version = link.version.clone();
        download.version_code = link.version_code;
        if link.md5.is_some() {
            download.md5 = link.md5.clone();
        }
        if let Some(size) = link.file_size {
            download.file_size = size;
        }
        download.url = Some(link.url.clone());
        Ok(link.url)
    }

    fn preflight_storage(&self, download: &Download, existing: u64) -> Result<()> {
        let needed = (download.file_size.max(0) as u64).saturating_sub(existing);
        if needed == 0 {
            return Ok(());
        }
        match self.files.available_space() {
            Some(free) if free < needed => Err(AgentError::Install(format!(
                "not enough storage for {}: need {} bytes, {} free",
                download.package_name, needed, free
            ))),
            _ => Ok(()),
        }
    }

    async fn transfer_with_retry(
        &self,
        download: &Download,
        url: &str,
        control: &mut watch::Receiver<JobControl>,
    ) -> Result<PathBuf> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.transfer(download, url, control).await {
                Ok(path) => return Ok(path),
                Err(err) if attempt < self.attempts && err.is_transient() => {
                    tracing::warn!(
                        "transfer of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        download.package_name,
                        attempt,
                        self.attempts,
                        delay,
                        err
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(control) => {
                            return Err(AgentError::Cancelled(download.package_name.clone()));
                        }
                    }
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn transfer(
        &self,
        download: &Download,
        url: &str,
        control: &mut watch::Receiver<JobControl>,
    ) -> Result<PathBuf> {
        ensure_running(control, &download.package_name)?;
        let package_name = download.package_name.as_str();
        let dir = self.files.package_dir(package_name)?;
        fs::create_dir_all(&dir).await?;
        let partial = self.files.partial_path(package_name)?;
        let artifact = self.files.artifact_path(package_name)?;

        let mut existing = match fs::metadata(&partial).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        self.preflight_storage(download, existing)?;

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, range_header(existing));
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            tracing::info!("{} partial already complete ({} bytes)", package_name, existing);
            fs::rename(&partial, &artifact).await?;
            return Ok(artifact);
        }
        if !status.is_success() {
            return Err(AgentError::Http(format!("HTTP {}: {}", status.as_u16(), url)));
        }
        if existing > 0 && status != StatusCode::PARTIAL_CONTENT {
            tracing::info!("server ignored range for {}, restarting from zero", package_name);
            existing = 0;
        }

        let total = response
            .content_length()
            .map(|length| length + existing)
            .unwrap_or_else(|| download.file_size.max(0) as u64);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(existing > 0)
            .truncate(existing == 0)
            .open(&partial)
            .await?;

        let mut reporter = ProgressReporter::new(existing);
        let mut downloaded = existing;
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                _ = cancelled(control) => {
                    file.flush().await?;
                    return Err(AgentError::Cancelled(package_name.to_string()));
                }
                next = stream.next() => {
                    let Some(next) = next else { break; };
                    let bytes = next?;
                    file.write_all(&bytes).await?;
                    downloaded = downloaded.saturating_add(bytes.len() as u64);
                    if let Some(progress) = reporter.maybe_report(downloaded, total, false) {
                        self.db.update_download_progress(package_name, &progress)?;
                    }
                }
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(mut progress) = reporter.maybe_report(downloaded, total.max(downloaded), true) {
            progress.downloaded_files = 1;
            self.db.update_download_progress(package_name, &progress)?;
        }
        fs::rename(&partial, &artifact).await?;
        tracing::info!("{} transferred ({} bytes)", package_name, downloaded);
        Ok(artifact)
    }

    async fn verify(&self, download: &Download, artifact: &Path) -> Result<()> {
        let Some(expected) = download.md5.as_deref().filter(|md5| !md5.trim().is_empty()) else {
            return Ok(());
        };
        let path = artifact.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || md5_file_hex(&path))
            .await
            .map_err(|err| AgentError::Verification(format!("checksum task failed: {err}")))??;
        if checksum_matches(expected, &actual) {
            return Ok(());
        }
        if let Err(err) = self.files.remove_package_dir(&download.package_name) {
            tracing::warn!("could not remove corrupt artifact of {}: {}", download.package_name, err);
        }
        Err(AgentError::Verification(format!(
            "md5 mismatch for {}: expected {}, got {}",
            download.package_name,
            expected.trim(),
            actual
        )))
    }
}

#[async_trait]
impl TransferJob for DownloadWorker {
    async fn run(&self, mut download: Download, mut control: watch::Receiver<JobControl>) -> Result<()> {
        let package_name = download.package_name.clone();
        let url = self.resolve_link(&mut download).await?;
        let artifact = self.transfer_with_retry(&download, &url, &mut control).await?;

        if !self.db.transition_download(
            &package_name,
            &[DownloadStatus::Downloading],
            DownloadStatus::Verifying,
        )? {
            tracing::info!("{} no longer downloading, dropping transfer result", package_name);
            return Ok(());
        }
        tracing::info!("{} VERIFYING", package_name);
        self.verify(&download, &artifact).await?;
        ensure_running(&control, &package_name)?;

        self.db
            .set_download_artifact(&package_name, &artifact.to_string_lossy())?;
        self.installer.begin_install(&package_name).await?;
        Ok(())
    }
}

fn ensure_running(control: &watch::Receiver<JobControl>, package_name: &str) -> Result<()> {
    match *control.borrow() {
        JobControl::Running => Ok(()),
        JobControl::Cancelled => Err(AgentError::Cancelled(package_name.to_string())),
    }
}

/// Resolves once the job is cancelled or its registry entry is dropped.
async fn cancelled(control: &mut watch::Receiver<JobControl>) {
    loop {
        if *control.borrow() == JobControl::Cancelled {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

pub fn range_header(offset: u64) -> String {
    format!("bytes={offset}-")
}

pub fn checksum_matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

struct ProgressReporter {
    started: Instant,
    initial: u64,
    last_sent: Option<Instant>,
    last_downloaded: u64,
}

impl ProgressReporter {
    fn new(initial: u64) -> Self {
        Self {
            started: Instant::now(),
            initial,
            last_sent: None,
            last_downloaded: initial,
        }
    }

    fn maybe_report(&mut self, downloaded: u64, total: u64, force: bool) -> Option<DownloadProgress> {
        let now = Instant::now();
        if !force
            && self
                .last_sent
                .map(|sent| now.duration_since(sent) < REPORT_INTERVAL)
                .unwrap_or(false)
        {
            return None;
        }

        let window = self
            .last_sent
            .unwrap_or(self.started)
            .elapsed()
            .as_secs_f64()
            .max(0.001);
        let delta = downloaded.saturating_sub(self.last_downloaded);
        let instant = (delta as f64 / window) as u64;
        let average = {
            let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
            (downloaded.saturating_sub(self.initial) as f64 / elapsed) as u64
        };
        let speed = if instant > 0 { instant } else { average };

        self.last_sent = Some(now);
        self.last_downloaded = downloaded;
        Some(progress_snapshot(downloaded, total, speed))
    }
}

pub(crate) fn progress_snapshot(downloaded: u64, total: u64, speed: u64) -> DownloadProgress {
    let progress = if total == 0 {
        0
    } else {
        ((downloaded as f64 / total as f64) * 100.0).floor().clamp(0.0, 100.0) as i32
    };
    let remaining = total.saturating_sub(downloaded);
    let time_remaining = if speed == 0 { 0 } else { remaining / speed };
    DownloadProgress {
        progress,
        file_size: total as i64,
        speed: speed as i64,
        time_remaining: time_remaining as i64,
        downloaded_files: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::db::queries::ApplicationQueries;
    use crate::models::ApplicationRecord;
    use crate::services::event_bus::StatusEventBus;
    use crate::test_support::{temp_files, test_catalog, FakePackageSystem, RecordingNotifier};

    const BODY: &[u8] = b"pretend this is an apk";

    /// Serves `body` once per connection with a plain 200.
    async fn serve(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/a.apk")
    }

    fn worker(db: &Database, files: &FileManager, packages: Arc<FakePackageSystem>) -> DownloadWorker {
        let installer = InstallationController::new(
            db.clone(),
            files.clone(),
            packages,
            StatusEventBus::default(),
            Arc::new(RecordingNotifier::default()),
        );
        DownloadWorker::new(
            db.clone(),
            files.clone(),
            test_catalog(db),
            reqwest::Client::new(),
            installer,
            2,
        )
        .with_backoff(Duration::from_millis(10))
    }

    fn claimed(db: &Database, url: &str, md5: Option<&str>) -> Download {
        let mut download = Download::new("com.example.a", "A", "1.0", 1).with_url(url);
        download.md5 = md5.map(str::to_string);
        download.status = DownloadStatus::Downloading;
        db.upsert_download(&download).expect("insert");
        db.upsert_application(&ApplicationRecord::new("com.example.a", "A"))
            .expect("record");
        download
    }

    #[tokio::test]
    async fn transfer_verifies_and_hands_off_to_installer() {
        let db = Database::in_memory().expect("open db");
        let files = temp_files();
        let packages = Arc::new(FakePackageSystem::default());
        let url = serve(BODY).await;
        let expected = hex::encode(<md5::Md5 as md5::Digest>::digest(BODY));
        let download = claimed(&db, &url, Some(&expected.to_ascii_uppercase()));
        let (_tx, rx) = watch::channel(JobControl::Running);

        worker(&db, &files, packages.clone())
            .run(download, rx)
            .await
            .expect("run");

        let row = db.get_download("com.example.a").expect("read").expect("row");
        assert_eq!(row.status, DownloadStatus::Installing);
        assert_eq!(row.progress, 100);
        let artifact = files.artifact_path("com.example.a").expect("path");
        assert_eq!(row.local_artifact(), Some(artifact.to_string_lossy().as_ref()));
        assert_eq!(std::fs::read(&artifact).expect("artifact"), BODY);
        assert!(!files.partial_path("com.example.a").expect("partial").exists());
        assert_eq!(packages.requests().len(), 1);
    }

    #[tokio::test]
    async fn checksum_mismatch_deletes_artifact() {
        let db = Database::in_memory().expect("open db");
        let files = temp_files();
        let url = serve(BODY).await;
        let download = claimed(&db, &url, Some("00000000000000000000000000000000"));
        let (_tx, rx) = watch::channel(JobControl::Running);

        let err = worker(&db, &files, Arc::new(FakePackageSystem::default()))
            .run(download, rx)
            .await
            .expect_err("mismatch");
        assert!(matches!(err, AgentError::Verification(_)));
        assert!(!files.package_dir("com.example.a").expect("dir").exists());
    }

    #[tokio::test]
    async fn cancelled_job_never_transfers() {
        let db = Database::in_memory().expect("open db");
        let files = temp_files();
        let download = claimed(&db, "http://127.0.0.1:9/a.apk", None);
        let (tx, rx) = watch::channel(JobControl::Running);
        tx.send(JobControl::Cancelled).expect("cancel");

        let err = worker(&db, &files, Arc::new(FakePackageSystem::default()))
            .run(download, rx)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, AgentError::Cancelled(_)));
    }

    #[test]
    fn helpers_format_range_and_compare_checksums() {
        assert_eq!(range_header(1024), "bytes=1024-");
        assert!(checksum_matches("ABCDEF", " abcdef"));
        assert!(!checksum_matches("abc", "abd"));
    }

    #[test]
    fn progress_snapshot_estimates_remaining_time() {
        let snapshot = progress_snapshot(250, 1000, 50);
        assert_eq!(snapshot.progress, 25);
        assert_eq!(snapshot.time_remaining, 15);
        assert_eq!(progress_snapshot(10, 0, 0).progress, 0);
    }
}
