use std::path::PathBuf;
use std::time::Duration;

use crate::utils::paths::{resolve_downloads_dir, resolve_log_dir, resolve_root_dir};

pub const DEFAULT_SERVICE_DOMAIN: &str = "storefront.example.com";
pub const DEFAULT_API_PATH: &str = "api";
pub const DEFAULT_BASE_URL: &str = "https://storefront.example.com/api/";
pub const DEFAULT_INSTALL_COMMAND: &str = "pm install -r";
pub const DEFAULT_VERSION_COMMAND: &str = "dumpsys package";

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub root_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub log_dir: PathBuf,
    pub service_domain: String,
    pub api_path: String,
    pub default_base_url: String,
    pub discovery_timeout: Duration,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub download_attempts: u32,
    pub queue_poll_interval: Duration,
    pub install_command: String,
    pub version_command: String,
    pub proxy: Option<String>,
    pub disable_system_proxy: bool,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let root_dir = resolve_root_dir();
        Self::from_lookup(root_dir, |key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; directories derive from `root_dir`.
    pub fn from_lookup<F>(root_dir: PathBuf, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str| text(key).and_then(|value| value.parse::<u64>().ok());
        let truthy = |key: &str| {
            text(key)
                .map(|value| {
                    matches!(
                        value.to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    )
                })
                .unwrap_or(false)
        };

        let api_path = text("STOREFRONT_API_PATH")
            .map(|value| value.trim_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_PATH.to_string());

        Self {
            downloads_dir: resolve_downloads_dir(&root_dir),
            log_dir: resolve_log_dir(&root_dir),
            root_dir,
            service_domain: text("STOREFRONT_SERVICE_DOMAIN")
                .map(|value| value.trim_end_matches('.').to_string())
                .unwrap_or_else(|| DEFAULT_SERVICE_DOMAIN.to_string()),
            api_path,
            default_base_url: text("STOREFRONT_DEFAULT_URL")
                .map(|value| format!("{}/", value.trim_end_matches('/')))
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            discovery_timeout: Duration::from_millis(
                number("STOREFRONT_DISCOVERY_TIMEOUT_MS")
                    .unwrap_or(5_000)
                    .clamp(250, 60_000),
            ),
            http_timeout: Duration::from_secs(
                number("STOREFRONT_HTTP_TIMEOUT_SECONDS")
                    .unwrap_or(600)
                    .clamp(30, 7200),
            ),
            http_connect_timeout: Duration::from_secs(
                number("STOREFRONT_HTTP_CONNECT_TIMEOUT_SECONDS")
                    .unwrap_or(20)
                    .clamp(3, 120),
            ),
            download_attempts: number("STOREFRONT_DOWNLOAD_ATTEMPTS")
                .unwrap_or(3)
                .clamp(1, 10) as u32,
            queue_poll_interval: Duration::from_millis(
                number("STOREFRONT_QUEUE_POLL_MS")
                    .unwrap_or(5_000)
                    .clamp(250, 600_000),
            ),
            install_command: text("STOREFRONT_INSTALL_COMMAND")
                .unwrap_or_else(|| DEFAULT_INSTALL_COMMAND.to_string()),
            version_command: text("STOREFRONT_VERSION_COMMAND")
                .unwrap_or_else(|| DEFAULT_VERSION_COMMAND.to_string()),
            proxy: text("STOREFRONT_PROXY"),
            disable_system_proxy: truthy("STOREFRONT_DISABLE_SYSTEM_PROXY"),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_dir.join("agent.db")
    }

    pub fn key_path(&self) -> PathBuf {
        self.root_dir.join("secret.key")
    }

    pub fn http_client(&self) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .connect_timeout(self.http_connect_timeout)
            .tcp_nodelay(true);

        if self.disable_system_proxy {
            builder = builder.no_proxy();
        }

        if let Some(proxy_url) = self.proxy.as_deref() {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    tracing::info!("using agent proxy: {}", proxy_url);
                }
                Err(err) => tracing::warn!("invalid STOREFRONT_PROXY '{}': {}", proxy_url, err),
            }
        }

        builder.build().unwrap_or_else(|err| {
            tracing::warn!("http client build failed, using defaults: {}", err);
            reqwest::Client::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("storefront-config-test-{}", Uuid::new_v4()))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let root = temp_root();
        let config = AgentConfig::from_lookup(root.clone(), |_| None);
        assert_eq!(config.service_domain, DEFAULT_SERVICE_DOMAIN);
        assert_eq!(config.api_path, DEFAULT_API_PATH);
        assert_eq!(config.default_base_url, DEFAULT_BASE_URL);
        assert_eq!(config.download_attempts, 3);
        assert_eq!(config.discovery_timeout, Duration::from_secs(5));
        assert_eq!(config.database_path(), root.join("agent.db"));
        assert!(config.proxy.is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn values_are_normalized_and_clamped() {
        let root = temp_root();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("STOREFRONT_SERVICE_DOMAIN", "store.corp.test."),
            ("STOREFRONT_API_PATH", "/v2/api/"),
            ("STOREFRONT_DEFAULT_URL", "https://fallback.corp.test/v2"),
            ("STOREFRONT_DOWNLOAD_ATTEMPTS", "99"),
            ("STOREFRONT_DISCOVERY_TIMEOUT_MS", "not-a-number"),
            ("STOREFRONT_DISABLE_SYSTEM_PROXY", "Yes"),
        ]);
        let config =
            AgentConfig::from_lookup(root.clone(), |key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.service_domain, "store.corp.test");
        assert_eq!(config.api_path, "v2/api");
        assert_eq!(config.default_base_url, "https://fallback.corp.test/v2/");
        assert_eq!(config.download_attempts, 10);
        assert_eq!(config.discovery_timeout, Duration::from_secs(5));
        assert!(config.disable_system_proxy);
        let _ = std::fs::remove_dir_all(&root);
    }
}
