//! Genworker is the supervising entry point of a generation worker. It launches the
//! inference service and the generation engine as child processes, gates its own
//! readiness on their HTTP health endpoints, serves liveness and health over HTTP and
//! relays user images from an object store into the engine's input directory.

/// Asset message routing.
pub mod asset;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared defaults and timing values.
pub mod constants;

/// Error handling.
pub mod error;

/// Child output forwarding.
pub mod logs;

/// HTTP health probing.
pub mod probe;

/// Child process lifecycle.
pub mod process;

/// Object store to input directory relay.
pub mod relay;

/// HTTP facade.
pub mod server;

/// Object store backends.
pub mod store;

/// Supervisor of the dependent services.
pub mod supervisor;
