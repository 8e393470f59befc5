//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transient IO error while {op} {}: {source}", path.display())]
    TransientIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture process for camera {camera_id} crashed: {reason}")]
    ProcessCrash { camera_id: String, reason: String },

    #[error("Volume {volume} health is degraded: {detail}")]
    HealthDegraded { volume: String, detail: String },

    #[error("Volume {volume} health is unknown: {detail}")]
    HealthUnknown { volume: String, detail: String },

    #[error("Volume {volume} is out of capacity ({free_bytes} bytes free)")]
    CapacityExhausted { volume: String, free_bytes: u64 },

    #[error("Duplicate segment for camera {camera_id} starting at {start_ms}")]
    DuplicateSegment { camera_id: String, start_ms: i64 },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        if is_transient_io(&source) {
            Self::TransientIo {
                op,
                path: path.to_path_buf(),
                source,
            }
        } else {
            Self::IoPath {
                op,
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientIo { .. } => true,
            Self::Io(e) => is_transient_io(e),
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

fn is_transient_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::ResourceBusy
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_path_classifies_transient() {
        let err = Error::io_path(
            "writing",
            Path::new("/rec/cam1/a.mkv"),
            std::io::Error::from(std::io::ErrorKind::Interrupted),
        );
        assert!(matches!(err, Error::TransientIo { .. }));
        assert!(err.is_transient());

        let err = Error::io_path(
            "writing",
            Path::new("/rec/cam1/a.mkv"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, Error::IoPath { .. }));
        assert!(!err.is_transient());
        assert!(err.to_string().contains("/rec/cam1/a.mkv"));
    }

    #[test]
    fn test_duplicate_segment_message() {
        let err = Error::DuplicateSegment {
            camera_id: "gate".into(),
            start_ms: 42,
        };
        assert_eq!(
            err.to_string(),
            "Duplicate segment for camera gate starting at 42"
        );
    }
}
