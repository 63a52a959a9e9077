use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OneError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("invalid dataset type name: {0}")]
    InvalidDatasetType(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("registry request failed: {0}")]
    Transport(String),

    #[error("registry returned status {status}: {message}")]
    RegistryStatus { status: u16, message: String },

    #[error("search matched {matched} sessions, expected exactly one")]
    AmbiguousSession { matched: usize },

    #[error("missing config file one-client.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
