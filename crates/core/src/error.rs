//! Error taxonomy for the automation core.
//!
//! Each layer has its own enum: device transport, profile/settings loading,
//! single action steps, and whole runs. Only [`RunError`] leaves the
//! orchestrator; a cancelled run is an outcome, not an error.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::GameState;

/// Failure reported by the device transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device disconnected")]
    Disconnected,
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("device command failed: {0}")]
    Failed(String),
}

/// Malformed settings or profile. Produced while loading, never mid-run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("unknown state '{0}'")]
    UnknownState(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

/// Failure of a single action step, after its local retries are spent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("template '{template}' not found after {attempts} attempt(s)")]
    TransientMatchFailure { template: String, attempts: u32 },
    #[error("quantity stuck at {last_read:?}, wanted {target} ({attempts} attempt(s))")]
    QuantityNotReached {
        target: u32,
        last_read: Option<u32>,
        attempts: u32,
    },
    #[error("expected state {expected}, still in {actual}")]
    UnexpectedState { expected: GameState, actual: GameState },
    #[error("no frame available from the capture pipeline")]
    NoFrame,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("cancelled")]
    Cancelled,
}

/// Fatal outcome of an orchestrated run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no state change observed in {state} after {waited:?} (device degraded: {device_degraded})")]
    StateTimeout {
        state: GameState,
        waited: Duration,
        device_degraded: bool,
    },
    #[error("device unavailable")]
    DeviceUnavailable,
    #[error("step failed in {state}: {source}")]
    StepFailed {
        state: GameState,
        #[source]
        source: StepError,
    },
    #[error("gave up after {restarts} interruption restart(s)")]
    RestartLimit { restarts: u32 },
    #[error("{remaining} slot(s) still empty after {passes} fill pass(es)")]
    FillIncomplete { passes: u32, remaining: usize },
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}
