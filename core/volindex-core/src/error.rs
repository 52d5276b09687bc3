use std::fmt::Display;
use std::path::PathBuf;

use crate::controller::ControllerStatus;
use crate::volume::DeviceId;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no content extractor for {0}")]
    NotSupported(PathBuf),

    #[error("path is excluded from indexing: {0}")]
    Excluded(PathBuf),

    #[error("controller for volume {volume} is {status:?}")]
    InvalidState {
        volume: DeviceId,
        status: ControllerStatus,
    },

    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("index engine failed during {operation}: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },

    #[error("volume {0} has no live controller")]
    LifecycleRace(DeviceId),

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("control protocol error: {0}")]
    Control(String),
}

impl IndexError {
    pub fn engine(operation: &'static str, err: impl Display) -> Self {
        IndexError::Engine {
            operation,
            message: err.to_string(),
        }
    }

    /// Outcomes that mean "not for the index" rather than "something broke".
    pub fn is_skip(&self) -> bool {
        matches!(self, IndexError::NotSupported(_) | IndexError::Excluded(_))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
