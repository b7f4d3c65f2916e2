use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "storefront-agent";

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(&PathBuf::from(trimmed))
}

pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = env_dir("STOREFRONT_ROOT_DIR") {
        return dir;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    if let Some(data) = dirs::data_dir() {
        if let Some(found) = ensure_dir(&data.join(APP_DIR_NAME)) {
            return found;
        }
    }

    if let Some(local) = dirs::data_local_dir() {
        if let Some(found) = ensure_dir(&local.join(APP_DIR_NAME)) {
            return found;
        }
    }

    PathBuf::from(".")
}

pub fn resolve_downloads_dir(root: &Path) -> PathBuf {
    let candidate = root.join("downloads");
    ensure_dir(&candidate).unwrap_or(candidate)
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    if let Some(dir) = env_dir("STOREFRONT_LOG_DIR") {
        return dir;
    }

    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    if let Some(cache) = dirs::cache_dir() {
        if let Some(found) = ensure_dir(&cache.join(APP_DIR_NAME).join("logs")) {
            return found;
        }
    }

    PathBuf::from("logs")
}
