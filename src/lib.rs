// src/lib.rs
//
// =============================================================================
// RUNSCRIBE: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod artifacts;
pub mod capture;
pub mod config;
pub mod deferred;
pub mod error;
pub mod fallback;
pub mod logs;
mod redirect;
pub mod run;
pub mod table;
pub mod tags;
pub mod tracking;

// 2. Re-exports (The Public API)
// These allow `use runscribe::ActiveRun` or `use runscribe::OutputRouter`.

pub use capture::{CaptureScope, OutputRouter, Stream, TeeWriter};
pub use config::Settings;
pub use deferred::{EndRun, ExperimentRun};
pub use error::{CaptureError, TableError, TrackingError};
pub use fallback::FallbackNotice;
pub use logs::{init_logging, LogBuffer};
pub use run::{with_run, with_run_using, ActiveRun, RunOptions, RunOutcome};
pub use table::{Cell, Table};
pub use tracking::local::LocalStore;
pub use tracking::rest::RestBackend;
pub use tracking::{RunInfo, RunStatus, TrackingBackend};
