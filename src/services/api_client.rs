use reqwest::Method;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{AgentError, Result};
use crate::services::auth_service::join_url;
use crate::services::{AuthService, EndpointResolver};

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    endpoints: EndpointResolver,
    auth: AuthService,
}

impl ApiClient {
    pub fn new(client: reqwest::Client, endpoints: EndpointResolver, auth: AuthService) -> Self {
        Self {
            client,
            endpoints,
            auth,
        }
    }

    /// Get the underlying reqwest client for artifact transfers
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, auth: bool) -> Result<T> {
        self.request(Method::GET, path, Option::<()>::None, auth)
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + Clone>(
        &self,
        path: &str,
        body: B,
        auth: bool,
    ) -> Result<T> {
        self.request(Method::POST, path, Some(body), auth).await
    }

    async fn request<T: DeserializeOwned, B: Serialize + Clone>(
        &self,
        method: Method,
        path: &str,
        body: Option<B>,
        auth_required: bool,
    ) -> Result<T> {
        // Discovery runs here, in the request path, never during startup.
        let base = self.endpoints.get_base_url().await;
        let url = join_url(&base, path);
        let mut refreshed = false;

        loop {
            let mut request = self.client.request(method.clone(), &url);

            let token = if auth_required {
                let token = self.auth.ensure_fresh_token().await?;
                request = request.bearer_auth(&token);
                Some(token)
            } else {
                None
            };

            if let Some(payload) = body.as_ref() {
                request = request.json(payload);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    if err.is_connect() || err.is_timeout() {
                        tracing::warn!("request to {} failed, invalidating endpoint: {}", url, err);
                        self.endpoints.clear_cache();
                    }
                    return Err(err.into());
                }
            };

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                if let Some(stale) = token.as_deref() {
                    self.auth.force_refresh(stale).await?;
                    refreshed = true;
                    continue;
                }
            }

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(AgentError::Http(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    text
                )));
            }

            let value = response.json::<T>().await?;
            return Ok(value);
        }
    }
}
