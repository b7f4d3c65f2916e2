use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::db::queries::{ApplicationQueries, DownloadQueries};
use crate::db::Database;
use crate::errors::{AgentError, Result};
use crate::models::{
    AppStatus, Download, DownloadStatus, InstallCallback, InstallStatusUpdate, InstallerEvent,
    PackageSignal,
};
use crate::services::app_state::settle_abandoned;
use crate::services::event_bus::StatusEventBus;
use crate::services::notifier::Notifier;
use crate::services::package_system::{status, CallbackReceiver, InstallRequest, PackageSystem};
use crate::utils::file::{file_exists, FileManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallFailure {
    Aborted,
    Blocked,
    Conflict,
    Incompatible,
    Invalid,
    Storage,
    Generic,
}

impl InstallFailure {
    pub fn from_status(code: i32) -> Self {
        match code {
            status::FAILURE_ABORTED => InstallFailure::Aborted,
            status::FAILURE_BLOCKED => InstallFailure::Blocked,
            status::FAILURE_CONFLICT => InstallFailure::Conflict,
            status::FAILURE_INCOMPATIBLE => InstallFailure::Incompatible,
            status::FAILURE_INVALID => InstallFailure::Invalid,
            status::FAILURE_STORAGE => InstallFailure::Storage,
            _ => InstallFailure::Generic,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            InstallFailure::Aborted => "Installation was cancelled",
            InstallFailure::Blocked => "Installation was blocked by the device",
            InstallFailure::Conflict => "Conflicts with an installed version of this app",
            InstallFailure::Incompatible => "This app is not compatible with the device",
            InstallFailure::Invalid => "The downloaded package is invalid",
            InstallFailure::Storage => "Not enough storage to install this app",
            InstallFailure::Generic => "Installation failed",
        }
    }

    /// User-initiated aborts are not worth a notification.
    pub fn is_silent(&self) -> bool {
        matches!(self, InstallFailure::Aborted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Success,
    PendingUserAction,
    Failure(InstallFailure),
}

impl InstallOutcome {
    pub fn classify(code: i32) -> Self {
        match code {
            status::SUCCESS => InstallOutcome::Success,
            status::PENDING_USER_ACTION => InstallOutcome::PendingUserAction,
            other => InstallOutcome::Failure(InstallFailure::from_status(other)),
        }
    }
}

/// Opens OS install sessions for verified downloads and folds their
/// asynchronous outcomes back into the download table and the status bus.
#[derive(Clone)]
pub struct InstallationController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    db: Database,
    files: FileManager,
    packages: Arc<dyn PackageSystem>,
    bus: StatusEventBus,
    notifier: Arc<dyn Notifier>,
    /// Download session id -> package name for sessions handed to the OS.
    pending: Mutex<HashMap<String, String>>,
    updates: broadcast::Sender<InstallStatusUpdate>,
}

impl InstallationController {
    pub fn new(
        db: Database,
        files: FileManager,
        packages: Arc<dyn PackageSystem>,
        bus: StatusEventBus,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ControllerInner {
                db,
                files,
                packages,
                bus,
                notifier,
                pending: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    /// Outbound per-outcome updates for the UI layer.
    pub fn subscribe_status(&self) -> broadcast::Receiver<InstallStatusUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn is_pending(&self, package_name: &str) -> bool {
        self.inner
            .pending
            .lock()
            .map(|pending| pending.values().any(|pending| pending == package_name))
            .unwrap_or(false)
    }

    /// Hands a verified download to the OS. Returns whether a session was opened.
    ///
    /// A row that cannot be claimed is moved out of VERIFYING so it never
    /// holds the queue.
    pub async fn begin_install(&self, package_name: &str) -> Result<bool> {
        let Some(download) = self.inner.db.get_download(package_name)? else {
            tracing::info!("{} was removed before install, skipping", package_name);
            return Ok(false);
        };
        let session_id = download.session_id.clone();
        if !self.mark_pending(&session_id, package_name)? {
            tracing::warn!(
                "{} already enqueued for install (download session {})",
                package_name,
                session_id
            );
            self.release_unclaimed(&download)?;
            return Ok(false);
        }
        let claimed = self.inner.db.transition_download(
            package_name,
            &[DownloadStatus::Verifying],
            DownloadStatus::Installing,
        );
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                self.clear_pending(&session_id);
                tracing::info!("{} left VERIFYING before install, skipping", package_name);
                return Ok(false);
            }
            Err(err) => {
                self.clear_pending(&session_id);
                return Err(err);
            }
        }
        self.open_session(package_name, &session_id).await
    }

    fn release_unclaimed(&self, download: &Download) -> Result<()> {
        let package_name = download.package_name.as_str();
        let next = if download.local_artifact().map(file_exists).unwrap_or(false) {
            DownloadStatus::Completed
        } else {
            DownloadStatus::Failed
        };
        if !self
            .inner
            .db
            .transition_download(package_name, &[DownloadStatus::Verifying], next)?
        {
            return Ok(());
        }
        self.inner
            .db
            .update_download_status(package_name, next, Some("install already in progress"))?;
        settle_abandoned(&self.inner.db, download)?;
        tracing::warn!("{} could not be claimed for install, row now {}", package_name, next);
        Ok(())
    }

    /// Re-runs the install of a COMPLETED download whose artifact is still on disk.
    pub async fn retry_install(&self, package_name: &str) -> Result<bool> {
        let download = self
            .inner
            .db
            .get_download(package_name)?
            .ok_or_else(|| AgentError::NotFound(format!("no download for {package_name}")))?;
        if download.status != DownloadStatus::Completed {
            return Err(AgentError::Install(format!(
                "{package_name} is {}, only completed downloads can be retried",
                download.status
            )));
        }
        if !download.local_artifact().map(file_exists).unwrap_or(false) {
            return Err(AgentError::NotFound(format!(
                "artifact for {package_name} is gone, enqueue it again"
            )));
        }

        let session_id = download.session_id.clone();
        if !self.mark_pending(&session_id, package_name)? {
            return Ok(false);
        }
        match self.inner.db.claim_for_install(package_name) {
            Ok(true) => {}
            Ok(false) => {
                self.clear_pending(&session_id);
                return Err(AgentError::Conflict(format!(
                    "another download is active, {package_name} must wait"
                )));
            }
            Err(err) => {
                self.clear_pending(&session_id);
                return Err(err);
            }
        }
        self.open_session(package_name, &session_id).await
    }

    async fn open_session(&self, package_name: &str, session_id: &str) -> Result<bool> {
        let download = match self.inner.db.get_download(package_name) {
            Ok(Some(download)) => download,
            Ok(None) => {
                self.clear_pending(session_id);
                return Ok(false);
            }
            Err(err) => {
                self.clear_pending(session_id);
                return Err(err);
            }
        };

        let Some(artifact) = download.local_artifact().map(PathBuf::from) else {
            self.handle_callback(synthetic_failure(&download, "artifact path missing"))?;
            return Ok(false);
        };

        let app_status = if download.is_update {
            AppStatus::Updating
        } else {
            AppStatus::Installing
        };
        self.inner
            .db
            .update_application_status(package_name, app_status)?;

        let request = InstallRequest {
            package_name: package_name.to_string(),
            artifact,
            download_session_id: download.session_id.clone(),
            is_update: download.is_update,
        };
        match self.inner.packages.begin_install(request).await {
            Ok(session_id) => {
                tracing::info!(
                    "{} INSTALLING (install session {}, download session {})",
                    package_name,
                    session_id,
                    download.session_id
                );
                Ok(true)
            }
            Err(err) => {
                tracing::warn!("could not open install session for {}: {}", package_name, err);
                self.handle_callback(synthetic_failure(&download, &err.to_string()))?;
                Ok(false)
            }
        }
    }

    /// Entry point for outcomes delivered by the package system.
    pub fn handle_callback(&self, callback: InstallCallback) -> Result<()> {
        let result = self.apply_callback(&callback);
        self.clear_pending(&callback.download_session_id);
        result
    }

    /// Publishes `Uninstalled` for a package the OS removed.
    pub fn notify_removed(&self, package_name: &str) {
        tracing::info!("{} removed from the device", package_name);
        self.inner.bus.publish(InstallerEvent::Uninstalled {
            package_name: package_name.to_string(),
        });
    }

    pub fn handle_signal(&self, signal: PackageSignal) -> Result<()> {
        match signal {
            PackageSignal::Install(callback) => self.handle_callback(callback),
            PackageSignal::Removed { package_name } => {
                self.notify_removed(&package_name);
                Ok(())
            }
        }
    }

    fn apply_callback(&self, callback: &InstallCallback) -> Result<()> {
        let outcome = InstallOutcome::classify(callback.status);
        let package_name = callback.package_name.as_str();
        let download = self
            .inner
            .db
            .get_download(package_name)?
            .filter(|download| download.session_id == callback.download_session_id);

        let Some(download) = download else {
            tracing::warn!(
                "late install callback for {} (download session {}), row is gone",
                package_name,
                callback.download_session_id
            );
            if outcome == InstallOutcome::Success {
                self.inner.bus.publish(InstallerEvent::Installed {
                    package_name: package_name.to_string(),
                });
            }
            return Ok(());
        };

        match outcome {
            InstallOutcome::Success => self.on_success(&download),
            InstallOutcome::PendingUserAction => {
                tracing::info!("{} awaits user confirmation", package_name);
                self.inner
                    .notifier
                    .user_action_required(package_name, callback.confirmation.as_deref());
                Ok(())
            }
            InstallOutcome::Failure(failure) => {
                self.on_failure(&download, failure, callback.message.as_deref())
            }
        }
    }

    fn on_success(&self, download: &Download) -> Result<()> {
        let package_name = download.package_name.as_str();
        self.inner.db.remove_download(package_name)?;
        if let Err(err) = self.inner.files.remove_package_dir(package_name) {
            tracing::warn!("could not remove artifacts of {}: {}", package_name, err);
        }
        tracing::info!("{} installed, download row removed", package_name);

        self.inner.bus.publish(InstallerEvent::Installed {
            package_name: package_name.to_string(),
        });
        self.inner
            .notifier
            .install_succeeded(package_name, &download.display_name, download.is_update);
        self.send_update(download, true, None);
        Ok(())
    }

    fn on_failure(
        &self,
        download: &Download,
        failure: InstallFailure,
        raw_detail: Option<&str>,
    ) -> Result<()> {
        let package_name = download.package_name.as_str();
        let message = failure.user_message();
        let retryable = download.local_artifact().map(file_exists).unwrap_or(false);
        let next = if retryable {
            DownloadStatus::Completed
        } else {
            DownloadStatus::Failed
        };
        self.inner
            .db
            .update_download_status(package_name, next, Some(message))?;
        tracing::warn!(
            "install of {} failed ({:?}), row now {}: {}",
            package_name,
            failure,
            next,
            raw_detail.unwrap_or(message)
        );

        if failure != InstallFailure::Aborted {
            self.inner.db.increment_retry_count(package_name)?;
        }

        self.inner.bus.publish(InstallerEvent::Failed {
            package_name: package_name.to_string(),
            error_message: message.to_string(),
            raw_detail: raw_detail.map(str::to_string),
        });
        if !failure.is_silent() {
            self.inner
                .notifier
                .install_failed(package_name, &download.display_name, message);
        }
        self.send_update(download, false, Some(message));
        Ok(())
    }

    fn send_update(&self, download: &Download, success: bool, error_message: Option<&str>) {
        let _ = self.inner.updates.send(InstallStatusUpdate {
            package_name: download.package_name.clone(),
            success,
            download_session_id: download.session_id.clone(),
            error_message: error_message.map(str::to_string),
        });
    }

    /// Drains inbound package signals until every sender is dropped.
    pub async fn run(&self, mut signals: CallbackReceiver) {
        while let Some(signal) = signals.recv().await {
            let package_name = signal.package_name().to_string();
            if let Err(err) = self.handle_signal(signal) {
                tracing::warn!("package signal for {} failed: {}", package_name, err);
            }
        }
        tracing::debug!("package signal channel closed");
    }

    fn mark_pending(&self, session_id: &str, package_name: &str) -> Result<bool> {
        let mut pending = self
            .inner
            .pending
            .lock()
            .map_err(|_| AgentError::lock_poisoned("install pending set"))?;
        if pending.contains_key(session_id) {
            return Ok(false);
        }
        pending.insert(session_id.to_string(), package_name.to_string());
        Ok(true)
    }

    fn clear_pending(&self, session_id: &str) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(session_id);
        }
    }
}

fn synthetic_failure(download: &Download, message: &str) -> InstallCallback {
    InstallCallback {
        package_name: download.package_name.clone(),
        install_session_id: 0,
        download_session_id: download.session_id.clone(),
        status: status::FAILURE,
        message: Some(message.to_string()),
        confirmation: None,
    }
}
