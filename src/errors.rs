use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Integrity failure for {path}: expected {expected}, actual {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Download of {url} failed after {attempts} attempts: {reason}")]
    Download {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("Object store error: {0}")]
    ObjectStore(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("{} of {total} tasks failed; first: {}", .failures.len(), first_failure(.failures))]
    Batch {
        failures: Vec<EngineError>,
        total: usize,
    },
    #[error("Installation failed during {stage}: {source}")]
    Installation {
        stage: &'static str,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// True when the error is, or contains, a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::Batch { failures, .. } => failures.iter().any(EngineError::is_cancelled),
            EngineError::Installation { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        EngineError::IllegalState(message.into())
    }
}

fn first_failure(failures: &[EngineError]) -> String {
    failures
        .first()
        .map(|err| err.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub type Result<T> = std::result::Result<T, EngineError>;
