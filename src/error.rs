//! Error handling for genworker.
use std::time::Duration;

use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// Defines all errors raised by the supervision lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Semantically invalid configuration (bad duration, missing variable, ...).
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// A start was attempted on a process that is not idle.
    #[error("Service '{service}' is already running")]
    AlreadyRunning {
        /// The service that was already started.
        service: String,
    },

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error signalling a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Readiness was not observed before the startup deadline.
    #[error("Service '{service}' did not become healthy within {timeout:?}")]
    StartupTimeout {
        /// The service that missed its deadline.
        service: String,
        /// The configured startup timeout.
        timeout: Duration,
    },

    /// The process exited while its readiness gate was still open.
    #[error("Service '{service}' exited during startup ({outcome})")]
    ServiceExited {
        /// The service that exited.
        service: String,
        /// Human-readable exit outcome.
        outcome: String,
    },

    /// Readiness polling was abandoned before an outcome was observed.
    #[error("Startup of service '{service}' was cancelled")]
    StartupCancelled {
        /// The service whose polling loop was aborted.
        service: String,
    },

    /// A health check thread panicked instead of reporting a result.
    #[error("Health check for service '{service}' panicked")]
    HealthCheckPanicked {
        /// The service whose check panicked.
        service: String,
    },

    /// The shared HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for WorkerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        WorkerError::MutexPoisonError(err.to_string())
    }
}

/// Reason a single health probe failed. Surfaced as data, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No response arrived within the probe timeout.
    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be delivered (connection refused, DNS, ...).
    #[error("health check request failed: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("health check returned status {0}")]
    Status(u16),
}

/// Errors raised by object store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The object key contains empty or parent-directory segments.
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// The store answered with an unexpected status.
    #[error("Object store returned status {status} for {key}")]
    Status {
        /// The object key that was requested.
        key: String,
        /// HTTP status code.
        status: u16,
    },

    /// Transport failure talking to a remote store.
    #[error("Object store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem failure.
    #[error("Object store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Pipeline stage of the asset relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum RelayStage {
    /// Download from the object store.
    Fetch,
    /// Write into the local input directory.
    Store,
    /// Hand the generated name to the workflow.
    Provision,
}

/// Errors raised by the asset relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A stage failed; the stage is identified and the cause preserved.
    #[error("Asset relay failed at {stage} stage: {source}")]
    StageFailure {
        /// The failing stage.
        stage: RelayStage,
        /// The underlying error that occurred.
        #[source]
        source: StoreError,
    },
}

impl RelayError {
    /// Returns the stage that failed.
    pub fn stage(&self) -> RelayStage {
        match self {
            RelayError::StageFailure { stage, .. } => *stage,
        }
    }
}

/// Errors raised while routing an asset message.
#[derive(Debug, Error)]
pub enum AssetError {
    /// The message carried a task kind this worker does not handle.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// The relay pipeline failed.
    #[error("Asset processing failed: {0}")]
    Relay(#[from] RelayError),
}
