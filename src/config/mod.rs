//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Only the binary reads this; the library takes explicit paths
//! and options.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::job::DEFAULT_PRIORITY;

#[derive(Debug, Clone)]
pub struct Config {
    pub queue_root: PathBuf,
    pub priority: u8,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::with_root(None)
    }

    /// Like [`Config::from_env`], but an explicit `root` makes
    /// `DIRQUEUE_ROOT` optional.
    pub fn with_root(root: Option<PathBuf>) -> Result<Self> {
        let queue_root = match root {
            Some(root) => root,
            None => PathBuf::from(required_var("DIRQUEUE_ROOT")?),
        };
        Ok(Self {
            queue_root,
            priority: priority_var("DIRQUEUE_PRIORITY")?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn priority_var(name: &str) -> Result<u8> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not a priority: {e}"))),
        Err(_) => Ok(DEFAULT_PRIORITY),
    }
}
