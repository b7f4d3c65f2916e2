use std::sync::Arc;

use crate::db::queries::SettingsQueries;
use crate::db::Database;
use crate::errors::Result;
use crate::models::Credentials;
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::crypto::SecretBox;

/// Tokens count as expired this long before their real expiry.
pub const REFRESH_BUFFER_MS: i64 = 300_000;

const ACCESS_TOKEN_KEY: &str = "auth.access_token";
const REFRESH_TOKEN_KEY: &str = "auth.refresh_token";
const DEVICE_UUID_KEY: &str = "auth.device_uuid";
const EXPIRES_AT_KEY: &str = "auth.expires_at_ms";

/// Credential state lives only in the settings table; every call re-reads it.
#[derive(Clone)]
pub struct TokenManager {
    db: Database,
    secrets: SecretBox,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new(db: Database, secrets: SecretBox) -> Self {
        Self::with_clock(db, secrets, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, secrets: SecretBox, clock: Arc<dyn Clock>) -> Self {
        Self { db, secrets, clock }
    }

    pub fn save_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        device_uuid: &str,
        expires_in_seconds: i64,
    ) -> Result<()> {
        let access = self.secrets.seal(access_token)?;
        let refresh = self.secrets.seal(refresh_token)?;
        let expires_at = self.expiry_from_now(expires_in_seconds).to_string();
        self.db.set_settings(&[
            (ACCESS_TOKEN_KEY, access.as_str()),
            (REFRESH_TOKEN_KEY, refresh.as_str()),
            (DEVICE_UUID_KEY, device_uuid),
            (EXPIRES_AT_KEY, expires_at.as_str()),
        ])?;
        tracing::info!("credentials saved for device {}", device_uuid);
        Ok(())
    }

    pub fn update_access_token(&self, access_token: &str, expires_in_seconds: i64) -> Result<()> {
        self.apply_refresh(access_token, None, expires_in_seconds)
    }

    /// Refresh result; a rotated refresh token is written in the same transaction.
    pub fn apply_refresh(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_seconds: i64,
    ) -> Result<()> {
        let access = self.secrets.seal(access_token)?;
        let expires_at = self.expiry_from_now(expires_in_seconds).to_string();
        match refresh_token {
            Some(refresh) => {
                let refresh = self.secrets.seal(refresh)?;
                self.db.set_settings(&[
                    (ACCESS_TOKEN_KEY, access.as_str()),
                    (REFRESH_TOKEN_KEY, refresh.as_str()),
                    (EXPIRES_AT_KEY, expires_at.as_str()),
                ])?;
            }
            None => {
                self.db.set_settings(&[
                    (ACCESS_TOKEN_KEY, access.as_str()),
                    (EXPIRES_AT_KEY, expires_at.as_str()),
                ])?;
            }
        }
        tracing::debug!("access token updated, expires in {}s", expires_in_seconds);
        Ok(())
    }

    pub fn get_bearer_token(&self) -> Option<String> {
        self.access_token().map(|token| format!("Bearer {token}"))
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_sealed(ACCESS_TOKEN_KEY)
            .filter(|token| !token.trim().is_empty())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_sealed(REFRESH_TOKEN_KEY)
            .filter(|token| !token.trim().is_empty())
    }

    pub fn device_uuid(&self) -> Option<String> {
        self.read_plain(DEVICE_UUID_KEY)
    }

    pub fn expires_at_ms(&self) -> Option<i64> {
        self.read_plain(EXPIRES_AT_KEY)
            .and_then(|value| value.trim().parse::<i64>().ok())
    }

    /// True from `expiry - 5 minutes` on, and whenever no expiry is recorded.
    pub fn is_token_expired(&self) -> bool {
        match self.expires_at_ms() {
            Some(expires_at) => self.clock.now_millis() >= expires_at - REFRESH_BUFFER_MS,
            None => true,
        }
    }

    pub fn is_enrolled(&self) -> bool {
        self.access_token().is_some()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        Some(Credentials {
            access_token: self.access_token()?,
            refresh_token: self.refresh_token(),
            device_uuid: self.device_uuid(),
            expires_at_ms: self.expires_at_ms().unwrap_or_default(),
        })
    }

    pub fn clear_tokens(&self) -> Result<()> {
        self.db.delete_settings(&[
            ACCESS_TOKEN_KEY,
            REFRESH_TOKEN_KEY,
            DEVICE_UUID_KEY,
            EXPIRES_AT_KEY,
        ])?;
        tracing::info!("credentials cleared");
        Ok(())
    }

    fn expiry_from_now(&self, expires_in_seconds: i64) -> i64 {
        self.clock.now_millis() + expires_in_seconds.max(0).saturating_mul(1000)
    }

    fn read_plain(&self, key: &str) -> Option<String> {
        match self.db.get_setting(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("credential read failed for {}: {}", key, err);
                None
            }
        }
    }

    fn read_sealed(&self, key: &str) -> Option<String> {
        let payload = self.read_plain(key)?;
        match self.secrets.open(&payload) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("stored credential {} unreadable, ignoring: {}", key, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;

    fn manager() -> (TokenManager, ManualClock, Database) {
        let db = Database::in_memory().expect("open db");
        let clock = ManualClock::starting_at(1_700_000_000_000);
        let secrets = SecretBox::new(&[3u8; 32]).expect("secret box");
        let tokens = TokenManager::with_clock(db.clone(), secrets, Arc::new(clock.clone()));
        (tokens, clock, db)
    }

    #[test]
    fn unenrolled_device_has_no_bearer_and_counts_as_expired() {
        let (tokens, _, _) = manager();
        assert!(!tokens.is_enrolled());
        assert!(tokens.get_bearer_token().is_none());
        assert!(tokens.is_token_expired());
    }

    #[test]
    fn expiry_honours_five_minute_buffer() {
        let (tokens, clock, _) = manager();
        tokens
            .save_tokens("access-1", "refresh-1", "device-1", 600)
            .expect("save");

        assert!(tokens.is_enrolled());
        assert!(!tokens.is_token_expired());
        clock.advance_secs(299);
        assert!(!tokens.is_token_expired());
        clock.advance_secs(1);
        assert!(tokens.is_token_expired());
    }

    #[test]
    fn bearer_header_and_refresh_path() {
        let (tokens, clock, _) = manager();
        tokens
            .save_tokens("access-1", "refresh-1", "device-1", 60)
            .expect("save");
        assert_eq!(tokens.get_bearer_token().as_deref(), Some("Bearer access-1"));
        assert!(tokens.is_token_expired());

        tokens.update_access_token("access-2", 3600).expect("update");
        assert_eq!(tokens.get_bearer_token().as_deref(), Some("Bearer access-2"));
        assert_eq!(tokens.refresh_token().as_deref(), Some("refresh-1"));
        assert_eq!(tokens.device_uuid().as_deref(), Some("device-1"));
        assert!(!tokens.is_token_expired());

        clock.advance_secs(3600);
        tokens
            .apply_refresh("access-3", Some("refresh-2"), 3600)
            .expect("rotate");
        assert_eq!(tokens.refresh_token().as_deref(), Some("refresh-2"));
    }

    #[test]
    fn tokens_are_sealed_at_rest_and_visible_across_handles() {
        let (tokens, _, db) = manager();
        tokens
            .save_tokens("access-1", "refresh-1", "device-1", 600)
            .expect("save");

        let raw = db.get_setting(ACCESS_TOKEN_KEY).expect("read").expect("row");
        assert!(!raw.contains("access-1"));

        let other = TokenManager::new(db.clone(), SecretBox::new(&[3u8; 32]).expect("box"));
        other.update_access_token("access-9", 600).expect("rotate elsewhere");
        assert_eq!(tokens.access_token().as_deref(), Some("access-9"));
    }

    #[test]
    fn blank_or_cleared_tokens_are_not_enrolled() {
        let (tokens, _, _) = manager();
        tokens.save_tokens("   ", "refresh", "device", 600).expect("save");
        assert!(!tokens.is_enrolled());

        tokens.save_tokens("access", "refresh", "device", 600).expect("save");
        tokens.clear_tokens().expect("clear");
        assert!(!tokens.is_enrolled());
        assert!(tokens.device_uuid().is_none());
        assert!(tokens.credentials().is_none());
    }
}
