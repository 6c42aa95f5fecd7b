// src/error.rs
//
// =============================================================================
// RUNSCRIBE: ERROR TAXONOMY
// =============================================================================
//
// (a) TrackingError: backend configuration / connectivity / rejection.
//     Recovered by the run layer and downgraded to a warning.
// (b) CaptureError: misuse of the capture stack. Sink I/O failures are not
//     errors at all (best-effort).
// (c) Anything raised by user code inside a run is never wrapped here.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("tracking backend is misconfigured: {0}")]
    Configuration(String),

    #[error("tracking backend at {uri} is unreachable: {source}")]
    Unreachable {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("tracking backend rejected {endpoint} ({status}): {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("tracking store I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run exists, but this particular record cannot be stored there.
    #[error("not supported by this tracking backend: {0}")]
    Unsupported(String),

    /// Transfer to artifact storage outside the tracking server failed.
    #[error("artifact upload to {target} failed: {source}")]
    Upload {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to (de)serialize tracking payload: {0}")]
    Serialization(String),

    #[error("unknown run {0}")]
    UnknownRun(String),
}

impl TrackingError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrackingError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures that mean "the backend cannot be used at all",
    /// as opposed to a single call being refused. Only these make a run
    /// that already exists move to the local fallback store.
    pub fn is_backend_down(&self) -> bool {
        matches!(
            self,
            TrackingError::Configuration(_) | TrackingError::Unreachable { .. }
        )
    }
}

impl From<serde_json::Error> for TrackingError {
    fn from(e: serde_json::Error) -> Self {
        TrackingError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for TrackingError {
    fn from(e: serde_yaml::Error) -> Self {
        TrackingError::Serialization(e.to_string())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture scope at depth {depth} closed while depth {innermost} is still open")]
    OutOfOrder { depth: usize, innermost: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    #[error("row {row} has {got} cells, expected {expected}")]
    RowWidth {
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("csv encoding failed: {0}")]
    Csv(String),
}
