//! Typed error channel for the core. Five error
//! kinds; each gets its own variant so callers can match on failure class
//! instead of string-sniffing an `anyhow::Error`.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, GockerError>;

#[derive(Debug, thiserror::Error)]
pub enum GockerError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel interface call failed ({context}): {source}")]
    Kernel {
        context: String,
        #[source]
        source: nix::Error,
    },

    #[error("network fabric operation failed: {0}")]
    Network(String),

    #[error("registry or image pull failed: {0}")]
    Registry(String),

    #[error("malformed image {image_id}: {reason}")]
    MalformedImage { image_id: String, reason: String },

    #[error("resource collision at {path}: {reason}")]
    ResourceCollision { path: PathBuf, reason: String },

    #[error("teardown step failed ({context}): {source}")]
    Teardown {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image index corrupt or unreadable: {0}")]
    Index(String),

    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("no such image: {0}")]
    NoSuchImage(String),

    #[error("image still in use by a running container: {0}")]
    ImageInUse(String),
}

impl From<serde_json::Error> for GockerError {
    fn from(source: serde_json::Error) -> Self {
        GockerError::Index(source.to_string())
    }
}

/// Logs a teardown failure and continues; a teardown failure is
/// never allowed to abort the remainder of the unwind.
pub fn log_teardown_failure(context: &str, err: impl std::fmt::Display) {
    tracing::error!(context, %err, "teardown step failed, continuing best-effort");
}
