//! Error types for dirqueue.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to prepare queue directory {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve hostname: {0}")]
    Hostname(#[source] std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to link {src} to {dst} after {attempts} attempts")]
    LinkExhausted {
        src: PathBuf,
        dst: PathBuf,
        attempts: u32,
    },

    #[error("invalid metadatum {key:?}: {reason}")]
    InvalidMetadata { key: String, reason: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
