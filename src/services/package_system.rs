use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::{AgentError, Result};
use crate::models::{InstallCallback, InstalledVersion, PackageSignal};

/// Install session status codes, following the platform installer convention.
pub mod status {
    pub const PENDING_USER_ACTION: i32 = -1;
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const FAILURE_BLOCKED: i32 = 2;
    pub const FAILURE_ABORTED: i32 = 3;
    pub const FAILURE_INVALID: i32 = 4;
    pub const FAILURE_CONFLICT: i32 = 5;
    pub const FAILURE_STORAGE: i32 = 6;
    pub const FAILURE_INCOMPATIBLE: i32 = 7;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallRequest {
    pub package_name: String,
    pub artifact: PathBuf,
    pub download_session_id: String,
    pub is_update: bool,
}

/// The operating system's package installer. Outcomes of `begin_install`
/// arrive later through the callback channel, never as the return value.
#[async_trait]
pub trait PackageSystem: Send + Sync {
    /// Opens an install session and returns its id.
    async fn begin_install(&self, request: InstallRequest) -> Result<i32>;
    async fn installed_version(&self, package_name: &str) -> Result<Option<InstalledVersion>>;
}

pub type CallbackSender = mpsc::Sender<PackageSignal>;
pub type CallbackReceiver = mpsc::Receiver<PackageSignal>;

pub fn callback_channel() -> (CallbackSender, CallbackReceiver) {
    mpsc::channel(64)
}

/// Drives an external installer command (`pm install -r <apk>` by default).
pub struct CommandPackageSystem {
    install_command: Vec<String>,
    version_command: Vec<String>,
    callbacks: CallbackSender,
    next_session: AtomicI32,
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

impl CommandPackageSystem {
    pub fn new(install_command: &str, version_command: &str, callbacks: CallbackSender) -> Self {
        Self {
            install_command: split_command(install_command),
            version_command: split_command(version_command),
            callbacks,
            next_session: AtomicI32::new(1),
        }
    }

    fn command(parts: &[String]) -> Result<Command> {
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| AgentError::Config("installer command is empty".to_string()))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl PackageSystem for CommandPackageSystem {
    async fn begin_install(&self, request: InstallRequest) -> Result<i32> {
        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let mut command = Self::command(&self.install_command)?;
        command.arg(&request.artifact);
        let child = command.spawn()?;
        tracing::info!(
            "install session {} started for {} ({})",
            session_id,
            request.package_name,
            request.artifact.display()
        );

        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            let (status, message) = match child.wait_with_output().await {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let combined = format!("{}\n{}", stdout.trim(), stderr.trim());
                    let combined = combined.trim().to_string();
                    let status = if output.status.success() && !combined.contains("Failure") {
                        status::SUCCESS
                    } else {
                        status_from_installer_output(&combined)
                    };
                    (status, Some(combined).filter(|text| !text.is_empty()))
                }
                Err(err) => (status::FAILURE, Some(err.to_string())),
            };
            let callback = InstallCallback {
                package_name: request.package_name,
                install_session_id: session_id,
                download_session_id: request.download_session_id,
                status,
                message,
                confirmation: None,
            };
            if callbacks.send(PackageSignal::Install(callback)).await.is_err() {
                tracing::warn!("install callback dropped, controller is gone");
            }
        });

        Ok(session_id)
    }

    async fn installed_version(&self, package_name: &str) -> Result<Option<InstalledVersion>> {
        let mut command = Self::command(&self.version_command)?;
        command.arg(package_name);
        let output = command.output().await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_version_code(&String::from_utf8_lossy(&output.stdout))
            .map(|version_code| InstalledVersion { version_code }))
    }
}

/// Maps installer failure text (`Failure [INSTALL_FAILED_...]`) onto a status code.
pub fn status_from_installer_output(output: &str) -> i32 {
    let upper = output.to_ascii_uppercase();
    let has = |needle: &str| upper.contains(needle);
    if has("INSUFFICIENT_STORAGE") {
        status::FAILURE_STORAGE
    } else if has("ALREADY_EXISTS")
        || has("CONFLICTING_PROVIDER")
        || has("DUPLICATE_PACKAGE")
        || has("UPDATE_INCOMPATIBLE")
        || has("VERSION_DOWNGRADE")
    {
        status::FAILURE_CONFLICT
    } else if has("OLDER_SDK") || has("NEWER_SDK") || has("NO_MATCHING_ABIS") || has("MISSING_FEATURE") {
        status::FAILURE_INCOMPATIBLE
    } else if has("INVALID_APK") || has("PARSE_FAILED") || has("INVALID_URI") {
        status::FAILURE_INVALID
    } else if has("USER_RESTRICTED") || has("VERIFICATION_FAILURE") || has("BLOCKED") {
        status::FAILURE_BLOCKED
    } else if has("ABORTED") {
        status::FAILURE_ABORTED
    } else {
        status::FAILURE
    }
}

pub fn parse_version_code(output: &str) -> Option<i64> {
    output.split_whitespace().find_map(|token| {
        token
            .strip_prefix("versionCode=")
            .and_then(|value| value.trim_end_matches(',').parse::<i64>().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installer_output_maps_to_status_codes() {
        assert_eq!(
            status_from_installer_output("Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]"),
            status::FAILURE_STORAGE
        );
        assert_eq!(
            status_from_installer_output("Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: sig]"),
            status::FAILURE_CONFLICT
        );
        assert_eq!(
            status_from_installer_output("Failure [INSTALL_FAILED_NO_MATCHING_ABIS]"),
            status::FAILURE_INCOMPATIBLE
        );
        assert_eq!(
            status_from_installer_output("Failure [INSTALL_PARSE_FAILED_NOT_APK]"),
            status::FAILURE_INVALID
        );
        assert_eq!(
            status_from_installer_output("Failure [INSTALL_FAILED_ABORTED: User rejected]"),
            status::FAILURE_ABORTED
        );
        assert_eq!(status_from_installer_output("segfault"), status::FAILURE);
    }

    #[test]
    fn version_code_is_read_from_package_dump() {
        let dump = "Packages:\n  Package [com.example.a]\n    versionCode=42 minSdk=24 targetSdk=34\n    versionName=1.4.2";
        assert_eq!(parse_version_code(dump), Some(42));
        assert_eq!(parse_version_code("Unable to find package"), None);
    }

    #[tokio::test]
    async fn empty_install_command_is_a_config_error() {
        let (tx, _rx) = callback_channel();
        let system = CommandPackageSystem::new("", "", tx);
        let err = system
            .begin_install(InstallRequest {
                package_name: "com.example.a".to_string(),
                artifact: PathBuf::from("/nonexistent.apk"),
                download_session_id: "s".to_string(),
                is_update: false,
            })
            .await
            .expect_err("no program");
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command_reports_success_callback() {
        let (tx, mut rx) = callback_channel();
        let system = CommandPackageSystem::new("true", "false", tx);
        let session = system
            .begin_install(InstallRequest {
                package_name: "com.example.a".to_string(),
                artifact: PathBuf::from("/tmp/a.apk"),
                download_session_id: "session-1".to_string(),
                is_update: false,
            })
            .await
            .expect("begin");

        let Some(PackageSignal::Install(callback)) = rx.recv().await else {
            panic!("expected an install callback");
        };
        assert_eq!(callback.install_session_id, session);
        assert_eq!(callback.status, status::SUCCESS);
        assert_eq!(callback.download_session_id, "session-1");
        assert_eq!(
            system.installed_version("com.example.a").await.expect("installed version"),
            None
        );
    }
}
