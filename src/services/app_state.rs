use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::db::queries::ApplicationQueries;
use crate::db::Database;
use crate::errors::Result;
use crate::models::{AppDetails, AppStatus, ApplicationRecord, Download, InstallerEvent};
use crate::services::event_bus::StatusEventBus;
use crate::services::package_system::PackageSystem;

/// Applies installer outcomes to the persisted application catalog.
#[derive(Clone)]
pub struct AppStateReconciler {
    db: Database,
    packages: Arc<dyn PackageSystem>,
}

impl AppStateReconciler {
    pub fn new(db: Database, packages: Arc<dyn PackageSystem>) -> Self {
        Self { db, packages }
    }

    /// Subscribes before the task starts so nothing published afterwards is missed.
    pub fn spawn(&self, bus: &StatusEventBus) -> JoinHandle<()> {
        let mut subscription = bus.subscribe();
        let reconciler = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(err) = reconciler.handle_event(&event).await {
                    tracing::warn!(
                        "failed to reconcile {:?} for {}: {}",
                        event,
                        event.package_name(),
                        err
                    );
                }
            }
            tracing::debug!("status bus closed, reconciler exiting");
        })
    }

    pub async fn handle_event(&self, event: &InstallerEvent) -> Result<()> {
        match event {
            InstallerEvent::Installed { package_name } => self.on_installed(package_name).await,
            InstallerEvent::Uninstalled { package_name } => self.on_uninstalled(package_name),
            InstallerEvent::Failed { package_name, .. } => self.on_failed(package_name).await,
        }
    }

    async fn on_installed(&self, package_name: &str) -> Result<()> {
        let Some(record) = self.known(package_name)? else {
            return Ok(());
        };

        let version_code = match self.packages.installed_version(package_name).await {
            Ok(Some(installed)) => installed.version_code,
            Ok(None) => {
                tracing::warn!(
                    "{} reported installed but the OS has no version, assuming {}",
                    package_name,
                    record.latest_version_code
                );
                record.latest_version_code
            }
            Err(err) => {
                tracing::warn!("version lookup for {} failed: {}", package_name, err);
                record.latest_version_code
            }
        };

        let status = if record.latest_version_code > version_code {
            AppStatus::UpdateAvailable
        } else {
            AppStatus::Installed
        };
        self.db
            .update_installed_version(package_name, version_code, status)?;
        tracing::info!("{} is {} at versionCode {}", package_name, status, version_code);
        Ok(())
    }

    fn on_uninstalled(&self, package_name: &str) -> Result<()> {
        let Some(record) = self.known(package_name)? else {
            return Ok(());
        };

        if record.is_favorite {
            self.db.mark_not_installed(package_name)?;
            tracing::info!("{} uninstalled, kept as favorite", package_name);
        } else {
            self.db.delete_application(package_name)?;
            tracing::info!("{} uninstalled, removed from catalog", package_name);
        }
        Ok(())
    }

    /// Restores a status left mid-flight by a failed install from what the OS reports.
    async fn on_failed(&self, package_name: &str) -> Result<()> {
        let Some(record) = self.known(package_name)? else {
            return Ok(());
        };
        if !is_in_flight(record.status) {
            return Ok(());
        }

        let status = match self.packages.installed_version(package_name).await {
            Ok(Some(installed)) if record.latest_version_code > installed.version_code => {
                AppStatus::UpdateAvailable
            }
            Ok(Some(_)) => AppStatus::Installed,
            Ok(None) => AppStatus::NotInstalled,
            Err(err) => {
                tracing::warn!("version lookup for {} failed: {}", package_name, err);
                settled_status(&record, record.status == AppStatus::Updating)
            }
        };
        self.db.update_application_status(package_name, status)?;
        Ok(())
    }

    fn known(&self, package_name: &str) -> Result<Option<ApplicationRecord>> {
        let record = self.db.get_application(package_name)?;
        if record.is_none() {
            tracing::debug!("no catalog record for {}, ignoring installer event", package_name);
        }
        Ok(record)
    }

    /// Creates or refreshes a catalog record from server details, keeping local state.
    pub fn upsert_from_catalog(&self, details: &AppDetails) -> Result<ApplicationRecord> {
        let mut record = self
            .db
            .get_application(&details.package_name)?
            .unwrap_or_else(|| ApplicationRecord::new(&details.package_name, &details.name));
        record.uuid = Some(details.uuid.clone());
        record.name = details.name.clone();
        record.latest_version_code = details.latest_version_code;
        record.derive_has_update();
        if record.status == AppStatus::Installed && record.has_update {
            record.status = AppStatus::UpdateAvailable;
        }
        self.db.upsert_application(&record)?;
        Ok(record)
    }

    pub fn set_favorite(&self, package_name: &str, favorite: bool) -> Result<bool> {
        self.db.set_favorite(package_name, favorite)
    }
}

fn is_in_flight(status: AppStatus) -> bool {
    matches!(
        status,
        AppStatus::Downloading | AppStatus::Installing | AppStatus::Updating
    )
}

fn settled_status(record: &ApplicationRecord, was_installed: bool) -> AppStatus {
    match (was_installed, record.has_update) {
        (true, true) => AppStatus::UpdateAvailable,
        (true, false) => AppStatus::Installed,
        (false, _) => AppStatus::NotInstalled,
    }
}

/// Puts the catalog record back where it was before `download` was enqueued.
pub(crate) fn settle_abandoned(db: &Database, download: &Download) -> Result<()> {
    let Some(record) = db.get_application(&download.package_name)? else {
        return Ok(());
    };
    if !is_in_flight(record.status) {
        return Ok(());
    }
    db.update_application_status(
        &download.package_name,
        settled_status(&record, download.is_installed),
    )?;
    Ok(())
}
