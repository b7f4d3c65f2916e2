use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::db::queries::{ApplicationQueries, DownloadQueries};
use crate::db::{Database, Table};
use crate::errors::{AgentError, Result};
use crate::models::{AppStatus, ApplicationRecord, Download, DownloadStatus};
use crate::services::app_state::settle_abandoned;
use crate::services::download_worker::TransferJob;
use crate::services::job_registry::JobRegistry;
use crate::utils::file::{file_exists, is_safe_package_name, FileManager};

/// Owns the `download` table lifecycle and keeps at most one row active.
#[derive(Clone)]
pub struct DownloadQueueManager {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    db: Database,
    files: FileManager,
    registry: JobRegistry,
    job: Arc<dyn TransferJob>,
    poll_interval: Duration,
}

impl DownloadQueueManager {
    pub fn new(
        db: Database,
        files: FileManager,
        registry: JobRegistry,
        job: Arc<dyn TransferJob>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                db,
                files,
                registry,
                job,
                poll_interval,
            }),
        }
    }

    /// Inserts or replaces the row for `download.package_name`.
    ///
    /// A row that is already active keeps its status, session and artifact
    /// identity (url, version, md5); only display metadata is refreshed.
    pub fn enqueue(&self, download: Download) -> Result<Download> {
        let db = &self.inner.db;
        let package_name = download.package_name.clone();
        if !is_safe_package_name(&package_name) {
            return Err(AgentError::Config(format!(
                "invalid package name: {package_name:?}"
            )));
        }

        let record = db.get_application(&package_name)?;
        let existing = db.get_download(&package_name)?;
        let mut row = download;
        row.is_installed = record
            .as_ref()
            .map(|record| record.status.is_installed())
            .unwrap_or(false)
            || row.is_update;

        match existing {
            Some(current) if current.status.is_active() => {
                tracing::info!(
                    "{} already {}, refreshing metadata only",
                    package_name,
                    current.status
                );
                row.session_id = current.session_id;
                row.url = current.url;
                row.version = current.version;
                row.version_code = current.version_code;
                row.md5 = current.md5;
                row.is_update = current.is_update;
                row.status = current.status;
                row.progress = current.progress;
                row.file_size = current.file_size.max(row.file_size);
                row.speed = current.speed;
                row.time_remaining = current.time_remaining;
                row.downloaded_files = current.downloaded_files;
                row.apk_location = current.apk_location;
                row.is_installed = current.is_installed;
                row.enqueued_at = current.enqueued_at;
                db.upsert_download(&row)?;
                return Ok(row);
            }
            Some(current) => {
                if current.status == DownloadStatus::Queued {
                    row.enqueued_at = current.enqueued_at;
                    row.is_installed = current.is_installed || row.is_update;
                }
                if current.version_code != row.version_code {
                    self.inner.files.remove_package_dir(&package_name)?;
                }
            }
            None => {}
        }

        row.status = DownloadStatus::Queued;
        row.progress = 0;
        row.error_message = None;
        row.apk_location = None;
        db.upsert_download(&row)?;

        let mut record =
            record.unwrap_or_else(|| ApplicationRecord::new(&package_name, &row.display_name));
        record.status = if row.is_update {
            AppStatus::Updating
        } else {
            AppStatus::Downloading
        };
        record.latest_version_code = record.latest_version_code.max(row.version_code);
        db.upsert_application(&record)?;

        tracing::info!(
            "{} QUEUED (versionCode {}, update: {})",
            package_name,
            row.version_code,
            row.is_update
        );
        Ok(row)
    }

    /// Starts the oldest queued row when nothing is active.
    /// Returns the package that was started.
    pub fn advance_queue(&self) -> Result<Option<String>> {
        let Some(claimed) = self.inner.db.claim_next_queued()? else {
            return Ok(None);
        };
        let package_name = claimed.package_name.clone();
        tracing::info!("{} DOWNLOADING (session {})", package_name, claimed.session_id);

        let db = self.inner.db.clone();
        let job = self.inner.job.clone();
        let spawned = self.inner.registry.enqueue_unique(&package_name, move |control| {
            async move {
                let result = job.run(claimed.clone(), control).await;
                if let Err(err) = finish_job(&db, &claimed, result) {
                    tracing::warn!("could not settle job for {}: {}", claimed.package_name, err);
                }
            }
        })?;
        if !spawned {
            tracing::debug!("job for {} already running", package_name);
        }
        Ok(Some(package_name))
    }

    /// Re-evaluates the queue after every download-table write, with a
    /// periodic poll for writes made by other processes.
    pub fn spawn_observer(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run_observer().await })
    }

    pub async fn run_observer(&self) {
        let mut changes = self.inner.db.watch(Table::Downloads);
        loop {
            if let Err(err) = self.advance_queue() {
                tracing::warn!("queue advance failed: {}", err);
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        tracing::debug!("download change feed closed, observer exiting");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }

    /// Tears down the package's job, row and files. Returns whether anything existed.
    pub fn cancel(&self, package_name: &str) -> Result<bool> {
        let db = &self.inner.db;
        let had_job = self.inner.registry.cancel(package_name);
        let download = db.get_download(package_name)?;
        let removed = db.remove_download(package_name)?;
        self.inner.files.remove_package_dir(package_name)?;

        if let Some(record) = db.get_application(package_name)? {
            let installed = download
                .as_ref()
                .map(|download| download.is_installed)
                .unwrap_or_else(|| record.status.is_installed());
            if !installed && !record.is_favorite {
                db.delete_application(package_name)?;
            } else if let Some(download) = download.as_ref() {
                settle_abandoned(db, download)?;
            }
        }

        if removed || had_job {
            tracing::info!("{} CANCELLED and removed", package_name);
        }
        Ok(removed || had_job)
    }

    /// Cancels every queued row (optionally only updates). Running transfers are untouched.
    pub fn cancel_all(&self, updates_only: bool) -> Result<Vec<String>> {
        let db = &self.inner.db;
        let cancelled = db.cancel_queued_downloads(updates_only)?;
        for package_name in &cancelled {
            self.inner.registry.cancel(package_name);
            if let Some(download) = db.get_download(package_name)? {
                settle_abandoned(db, &download)?;
            }
        }
        if !cancelled.is_empty() {
            tracing::info!("cancelled {} queued downloads", cancelled.len());
        }
        Ok(cancelled)
    }

    /// Settles rows orphaned by a previous process. Call once, before the observer starts.
    pub fn reconcile_on_startup(&self) -> Result<Vec<String>> {
        let db = &self.inner.db;
        let mut settled = Vec::new();
        for download in db.downloads_with_status(&DownloadStatus::ACTIVE)? {
            let package_name = download.package_name.as_str();
            if self.inner.registry.is_active(package_name) {
                continue;
            }
            let next = match download.status {
                DownloadStatus::Installing
                    if download.local_artifact().map(file_exists).unwrap_or(false) =>
                {
                    DownloadStatus::Completed
                }
                _ => DownloadStatus::Failed,
            };
            db.update_download_status(package_name, next, Some("interrupted by restart"))?;
            settle_abandoned(db, &download)?;
            tracing::warn!(
                "{} was {} with no live job, marked {}",
                package_name,
                download.status,
                next
            );
            settled.push(package_name.to_string());
        }
        Ok(settled)
    }

    /// Removes COMPLETED rows and their files.
    pub fn clear_completed(&self) -> Result<usize> {
        self.remove_with_status(&[DownloadStatus::Completed])
    }

    /// Removes every terminal row and its files.
    pub fn clear_all(&self) -> Result<usize> {
        self.remove_with_status(&DownloadStatus::TERMINAL)
    }

    fn remove_with_status(&self, statuses: &[DownloadStatus]) -> Result<usize> {
        let removed = self.inner.db.remove_downloads_with_status(statuses)?;
        for download in &removed {
            self.inner.files.remove_package_dir(&download.package_name)?;
        }
        Ok(removed.len())
    }

    pub fn list(&self) -> Result<Vec<Download>> {
        self.inner.db.get_downloads()
    }

    pub fn get(&self, package_name: &str) -> Result<Option<Download>> {
        self.inner.db.get_download(package_name)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }
}

/// Marks the claimed row FAILED when its job errored, unless it was
/// cancelled or the row has since been replaced.
fn finish_job(db: &Database, claimed: &Download, result: Result<()>) -> Result<()> {
    let err = match result {
        Ok(()) => return Ok(()),
        Err(AgentError::Cancelled(_)) => {
            tracing::info!("job for {} stopped after cancellation", claimed.package_name);
            return Ok(());
        }
        Err(err) => err,
    };

    let current = db
        .get_download(&claimed.package_name)?
        .filter(|row| row.session_id == claimed.session_id && row.status.is_active());
    let Some(current) = current else {
        tracing::warn!(
            "job for {} failed after its row went away: {}",
            claimed.package_name,
            err
        );
        return Ok(());
    };

    let message = err.to_string();
    db.update_download_status(&current.package_name, DownloadStatus::Failed, Some(&message))?;
    settle_abandoned(db, &current)?;
    tracing::warn!("{} FAILED: {}", current.package_name, message);
    Ok(())
}
