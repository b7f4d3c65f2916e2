use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Verifying,
    Installing,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub const ACTIVE: [DownloadStatus; 3] = [
        DownloadStatus::Downloading,
        DownloadStatus::Verifying,
        DownloadStatus::Installing,
    ];
    pub const TERMINAL: [DownloadStatus; 3] = [
        DownloadStatus::Completed,
        DownloadStatus::Failed,
        DownloadStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Verifying => "verifying",
            DownloadStatus::Installing => "installing",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = AgentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(DownloadStatus::Queued),
            "downloading" => Ok(DownloadStatus::Downloading),
            "verifying" => Ok(DownloadStatus::Verifying),
            "installing" => Ok(DownloadStatus::Installing),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            other => Err(AgentError::Config(format!("unknown download status: {other}"))),
        }
    }
}

/// One row of the `download` table; `package_name` is the only identity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Download {
    pub package_name: String,
    pub session_id: String,
    pub url: Option<String>,
    pub version: String,
    pub version_code: i64,
    pub is_update: bool,
    pub display_name: String,
    pub icon: Option<String>,
    pub status: DownloadStatus,
    pub progress: i32,
    pub file_size: i64,
    pub speed: i64,
    pub time_remaining: i64,
    pub total_files: i32,
    pub downloaded_files: i32,
    pub apk_location: Option<String>,
    pub md5: Option<String>,
    pub is_installed: bool,
    pub error_message: Option<String>,
    pub enqueued_at: i64,
    pub updated_at: i64,
}

impl Download {
    pub fn new(package_name: &str, display_name: &str, version: &str, version_code: i64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            package_name: package_name.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            url: None,
            version: version.to_string(),
            version_code,
            is_update: false,
            display_name: display_name.to_string(),
            icon: None,
            status: DownloadStatus::Queued,
            progress: 0,
            file_size: 0,
            speed: 0,
            time_remaining: 0,
            total_files: 1,
            downloaded_files: 0,
            apk_location: None,
            md5: None,
            is_installed: false,
            error_message: None,
            enqueued_at: now,
            updated_at: now,
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn with_md5(mut self, md5: &str) -> Self {
        self.md5 = Some(md5.to_string());
        self
    }

    pub fn as_update(mut self) -> Self {
        self.is_update = true;
        self
    }

    /// Local artifact path when the file has been materialized.
    pub fn local_artifact(&self) -> Option<&str> {
        self.apk_location
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    NotInstalled,
    Installed,
    Downloading,
    Installing,
    UpdateAvailable,
    Updating,
    Uninstalling,
    Unavailable,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::NotInstalled => "not_installed",
            AppStatus::Installed => "installed",
            AppStatus::Downloading => "downloading",
            AppStatus::Installing => "installing",
            AppStatus::UpdateAvailable => "update_available",
            AppStatus::Updating => "updating",
            AppStatus::Uninstalling => "uninstalling",
            AppStatus::Unavailable => "unavailable",
        }
    }

    /// Whether the package is present on the device in this state.
    pub fn is_installed(&self) -> bool {
        matches!(
            self,
            AppStatus::Installed
                | AppStatus::UpdateAvailable
                | AppStatus::Updating
                | AppStatus::Uninstalling
        )
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = AgentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "not_installed" => Ok(AppStatus::NotInstalled),
            "installed" => Ok(AppStatus::Installed),
            "downloading" => Ok(AppStatus::Downloading),
            "installing" => Ok(AppStatus::Installing),
            "update_available" => Ok(AppStatus::UpdateAvailable),
            "updating" => Ok(AppStatus::Updating),
            "uninstalling" => Ok(AppStatus::Uninstalling),
            "unavailable" => Ok(AppStatus::Unavailable),
            other => Err(AgentError::Config(format!("unknown application status: {other}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ApplicationRecord {
    pub package_name: String,
    pub uuid: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub version_code: i64,
    pub latest_version_code: i64,
    pub has_update: bool,
    pub status: AppStatus,
    pub is_favorite: bool,
    pub retry_count: i32,
    pub updated_at: i64,
}

impl ApplicationRecord {
    pub fn new(package_name: &str, name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            uuid: None,
            name: name.to_string(),
            version: None,
            version_code: 0,
            latest_version_code: 0,
            has_update: false,
            status: AppStatus::NotInstalled,
            is_favorite: false,
            retry_count: 0,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn derive_has_update(&mut self) {
        self.has_update = self.latest_version_code > self.version_code;
    }
}

/// Installer outcome fanned out on the status bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallerEvent {
    Installed {
        package_name: String,
    },
    Uninstalled {
        package_name: String,
    },
    Failed {
        package_name: String,
        error_message: String,
        raw_detail: Option<String>,
    },
}

impl InstallerEvent {
    pub fn package_name(&self) -> &str {
        match self {
            InstallerEvent::Installed { package_name }
            | InstallerEvent::Uninstalled { package_name }
            | InstallerEvent::Failed { package_name, .. } => package_name,
        }
    }
}

/// Payload the operating system delivers when an install session settles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallCallback {
    pub package_name: String,
    pub install_session_id: i32,
    pub download_session_id: String,
    pub status: i32,
    pub message: Option<String>,
    /// Confirmation handle the OS hands out for pending user action.
    pub confirmation: Option<String>,
}

/// Inbound message from the operating system's package manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackageSignal {
    /// An install session settled.
    Install(InstallCallback),
    /// A package was removed from the device.
    Removed { package_name: String },
}

impl PackageSignal {
    pub fn package_name(&self) -> &str {
        match self {
            PackageSignal::Install(callback) => &callback.package_name,
            PackageSignal::Removed { package_name } => package_name,
        }
    }
}

/// Outbound status for the UI layer, one per terminal install outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatusUpdate {
    pub package_name: String,
    pub success: bool,
    pub download_session_id: String,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub device_uuid: Option<String>,
    pub expires_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub version_code: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EnrollmentResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub device_uuid: String,
    pub expires_in: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadLink {
    pub url: String,
    pub version: String,
    pub version_code: i64,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AppDetails {
    pub uuid: String,
    pub package_name: String,
    pub name: String,
    pub latest_version: Option<String>,
    pub latest_version_code: i64,
    #[serde(default)]
    pub icon: Option<String>,
}
