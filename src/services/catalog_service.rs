use crate::errors::Result;
use crate::models::{AppDetails, DownloadLink};
use crate::services::ApiClient;

#[derive(Clone)]
pub struct CatalogService {
    api: ApiClient,
}

fn app_path(package_name: &str, suffix: &str) -> String {
    let encoded = urlencoding::encode(package_name);
    if suffix.is_empty() {
        format!("apps/{encoded}")
    } else {
        format!("apps/{encoded}/{suffix}")
    }
}

impl CatalogService {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn app_details(&self, package_name: &str) -> Result<AppDetails> {
        self.api.get(&app_path(package_name, ""), true).await
    }

    pub async fn download_link(&self, package_name: &str) -> Result<DownloadLink> {
        self.api.get(&app_path(package_name, "download"), true).await
    }
}
