use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use sysinfo::Disks;

use crate::errors::{AgentError, Result};

const ARTIFACT_EXTENSION: &str = "apk";

/// Owns the `downloads/<packageName>/` layout.
#[derive(Clone)]
pub struct FileManager {
    downloads_dir: PathBuf,
}

impl FileManager {
    pub fn new(downloads_dir: PathBuf) -> Self {
        Self { downloads_dir }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn package_dir(&self, package_name: &str) -> Result<PathBuf> {
        if !is_safe_package_name(package_name) {
            return Err(AgentError::Config(format!(
                "refusing unsafe package name: {package_name:?}"
            )));
        }
        Ok(self.downloads_dir.join(package_name))
    }

    pub fn artifact_path(&self, package_name: &str) -> Result<PathBuf> {
        Ok(self
            .package_dir(package_name)?
            .join(format!("{package_name}.{ARTIFACT_EXTENSION}")))
    }

    pub fn partial_path(&self, package_name: &str) -> Result<PathBuf> {
        Ok(self
            .package_dir(package_name)?
            .join(format!("{package_name}.{ARTIFACT_EXTENSION}.part")))
    }

    /// Deletes the whole package directory; a missing directory is not an error.
    pub fn remove_package_dir(&self, package_name: &str) -> Result<()> {
        let dir = self.package_dir(package_name)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!("removed download dir {}", dir.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Free bytes on the disk holding the downloads directory, if it can be determined.
    pub fn available_space(&self) -> Option<u64> {
        let target = fs::canonicalize(&self.downloads_dir).ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

pub fn is_safe_package_name(package_name: &str) -> bool {
    if package_name.trim().is_empty() || package_name.contains(['/', '\\']) {
        return false;
    }
    Path::new(package_name)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

pub fn file_exists(path: &str) -> bool {
    Path::new(path).is_file()
}
