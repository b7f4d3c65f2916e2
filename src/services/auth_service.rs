use std::sync::Arc;

use reqwest::StatusCode;

use crate::errors::{AgentError, Result};
use crate::models::{EnrollmentResponse, RefreshResponse};
use crate::services::{EndpointResolver, TokenManager};

/// Enrollment and refresh against the catalog service.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<AuthServiceInner>,
}

struct AuthServiceInner {
    client: reqwest::Client,
    endpoints: EndpointResolver,
    tokens: TokenManager,
    refresh_gate: tokio::sync::Mutex<()>,
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl AuthService {
    pub fn new(client: reqwest::Client, endpoints: EndpointResolver, tokens: TokenManager) -> Self {
        Self {
            inner: Arc::new(AuthServiceInner {
                client,
                endpoints,
                tokens,
                refresh_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub async fn enroll(&self, enrollment_code: &str) -> Result<EnrollmentResponse> {
        let base = self.inner.endpoints.get_base_url().await;
        let response = self
            .inner
            .client
            .post(join_url(&base, "devices/enroll"))
            .json(&serde_json::json!({ "enrollment_code": enrollment_code }))
            .send()
            .await
            .map_err(|err| self.on_transport_error(err))?;

        if !response.status().is_success() {
            return Err(AgentError::Auth(format!(
                "enrollment failed: {}",
                response.status()
            )));
        }

        let enrollment: EnrollmentResponse = response.json().await?;
        self.inner.tokens.save_tokens(
            &enrollment.access_token,
            &enrollment.refresh_token,
            &enrollment.device_uuid,
            enrollment.expires_in,
        )?;
        tracing::info!("device enrolled as {}", enrollment.device_uuid);
        Ok(enrollment)
    }

    pub fn logout(&self) -> Result<()> {
        self.inner.tokens.clear_tokens()
    }

    /// A usable access token, refreshing first when inside the expiry buffer.
    pub async fn ensure_fresh_token(&self) -> Result<String> {
        if !self.inner.tokens.is_token_expired() {
            if let Some(token) = self.inner.tokens.access_token() {
                return Ok(token);
            }
        }
        self.refresh(None).await
    }

    /// Refresh after the server rejected `stale_token`.
    pub async fn force_refresh(&self, stale_token: &str) -> Result<String> {
        self.refresh(Some(stale_token)).await
    }

    async fn refresh(&self, stale_token: Option<&str>) -> Result<String> {
        let _gate = self.inner.refresh_gate.lock().await;

        // Another caller may have refreshed while this one waited on the gate.
        if let Some(current) = self.inner.tokens.access_token() {
            let rotated = stale_token.map(|stale| stale != current).unwrap_or(false);
            if rotated || (stale_token.is_none() && !self.inner.tokens.is_token_expired()) {
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.inner.tokens.refresh_token() else {
            self.inner.tokens.clear_tokens()?;
            return Err(AgentError::Auth(
                "no refresh token available, re-enrollment required".to_string(),
            ));
        };

        let base = self.inner.endpoints.get_base_url().await;
        let response = self
            .inner
            .client
            .post(join_url(&base, "auth/refresh"))
            .json(&serde_json::json!({
                "refresh_token": refresh_token,
                "device_uuid": self.inner.tokens.device_uuid(),
            }))
            .send()
            .await
            .map_err(|err| self.on_transport_error(err))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!("token refresh rejected ({}), clearing credentials", status);
            self.inner.tokens.clear_tokens()?;
            return Err(AgentError::Auth(format!("refresh rejected: {status}")));
        }
        if !status.is_success() {
            return Err(AgentError::Http(format!(
                "HTTP {}: refresh failed",
                status.as_u16()
            )));
        }

        let payload: RefreshResponse = response.json().await?;
        self.inner.tokens.apply_refresh(
            &payload.access_token,
            payload.refresh_token.as_deref(),
            payload.expires_in,
        )?;
        tracing::info!("access token refreshed");
        Ok(payload.access_token)
    }

    fn on_transport_error(&self, err: reqwest::Error) -> AgentError {
        if err.is_connect() || err.is_timeout() {
            self.inner.endpoints.clear_cache();
        }
        AgentError::Network(err)
    }
}
