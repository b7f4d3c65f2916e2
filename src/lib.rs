pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::AgentConfig;
pub use errors::{AgentError, Result};
pub use state::{build_state, AgentState};
