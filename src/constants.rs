//! Constants and default values for the generation worker.
//!
//! This module centralizes timing values, default paths and wire strings used
//! across the supervisor, the relay and the HTTP facade.

use std::time::Duration;

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Configuration file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "genworker.yaml";

/// Environment file loaded from the configuration directory, if present.
pub const ENV_FILE_NAME: &str = ".env";

/// Port the HTTP facade listens on when the configuration omits it.
pub const DEFAULT_PORT: u16 = 5001;

/// Local directory the generation engine reads input images from.
pub const DEFAULT_INPUT_DIR: &str = "/data/ComfyUI/input";

/// Public Firebase Storage REST endpoint.
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://firebasestorage.googleapis.com";

// ============================================================================
// Process Management Timing
// ============================================================================

/// Interval at which the exit watcher polls a child with `try_wait`.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default interval between readiness probes during startup.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Granularity at which sleeping readiness loops observe cancellation.
pub const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Default time allowed between SIGTERM and SIGKILL.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default deadline for a service to pass its readiness gate.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout of a single health probe request.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Lower bound of a single readiness probe, even when the deadline is nearly spent.
pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default timeout for object store requests.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Asset Layout
// ============================================================================

/// Object key prefix under which user images are stored.
pub const USER_IMAGE_PREFIX: &str = "users";

/// Object key segment between the user id and the file name.
pub const USER_IMAGE_SEGMENT: &str = "images";

// ============================================================================
// HTTP Facade
// ============================================================================

/// Message returned by the root endpoint.
pub const ROOT_MESSAGE: &str = "Generation Worker is running";

/// Value reported for a managed service that is alive.
pub const SERVICE_RUNNING: &str = "running";

/// Value reported for a managed service that is not alive.
pub const SERVICE_STOPPED: &str = "stopped";
