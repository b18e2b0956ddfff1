use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Frame processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

/// Transient per-frame transform failures. These never propagate past the
/// pipeline: the frame is logged and dropped, and the reorder stage's
/// skip-ahead keeps the stream moving.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Frame rotation failed: {details}")]
    Rotation { details: String },

    #[error("Frame encoding failed: {details}")]
    Encoding { details: String },

    #[error("Frame decoding failed: {details}")]
    Decoding { details: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create storage directory {path}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to persist frame {sequence}: {source}")]
    Persist {
        sequence: u64,
        source: std::io::Error,
    },

    #[error("Failed to load frame {sequence}: {source}")]
    Load {
        sequence: u64,
        source: std::io::Error,
    },

    #[error("Failed to delete frame {sequence}: {source}")]
    Delete {
        sequence: u64,
        source: std::io::Error,
    },

    #[error("Failed to clear storage directory {path}: {source}")]
    Clear {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Export failures abort the session and propagate to the caller. No
/// partially written container is ever left in a finished state.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Video encoder error: {details}")]
    Encoder { details: String },

    #[error("Video muxer error: {details}")]
    Muxer { details: String },

    #[error("Image sink error: {details}")]
    ImageSink { details: String },

    #[error("Export snapshot is empty")]
    EmptySnapshot,

    #[error("An export is already in progress for this session")]
    AlreadyExporting,
}

impl ReplayError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
