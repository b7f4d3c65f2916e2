use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Install error: {0}")]
    Install(String),
    #[error("Discovery error: {0}")]
    Discovery(String),
    #[error("Verification failed: {0}")]
    Verification(String),
    #[error("download cancelled: {0}")]
    Cancelled(String),
}

impl AgentError {
    pub fn lock_poisoned(what: &str) -> Self {
        AgentError::Config(format!("{what} lock poisoned"))
    }

    /// Transport-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Network(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            AgentError::Http(message) => message.starts_with("HTTP 5"),
            AgentError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
