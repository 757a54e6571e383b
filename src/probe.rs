//! HTTP health probing of dependent services.
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use tracing::debug;

use crate::error::{ProbeError, WorkerError};

/// Result of a single probe. Recomputed on every call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHealth {
    /// Whether the endpoint answered with a 2xx status.
    pub healthy: bool,
    /// Status code, when a response arrived.
    pub status_code: Option<u16>,
    /// Round-trip time, when a response arrived.
    pub latency: Option<Duration>,
    /// Why the probe failed.
    pub error: Option<ProbeError>,
}

impl ServiceHealth {
    /// A successful probe.
    pub fn up(status_code: u16, latency: Duration) -> Self {
        Self {
            healthy: true,
            status_code: Some(status_code),
            latency: Some(latency),
            error: None,
        }
    }

    /// A failed probe.
    pub fn down(error: ProbeError) -> Self {
        let status_code = match error {
            ProbeError::Status(code) => Some(code),
            _ => None,
        };
        Self {
            healthy: false,
            status_code,
            latency: None,
            error: Some(error),
        }
    }
}

/// Anything able to answer "is this URL healthy right now".
pub trait HealthCheck: Send + Sync {
    /// Probes `url`, giving up after `timeout`. Failures are reported in the result.
    fn check(&self, url: &str, timeout: Duration) -> ServiceHealth;
}

/// Blocking HTTP GET probe.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client,
}

impl HealthProbe {
    /// Builds a probe with its own connection pool.
    pub fn new() -> Result<Self, WorkerError> {
        let client = Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }
}

impl HealthCheck for HealthProbe {
    fn check(&self, url: &str, timeout: Duration) -> ServiceHealth {
        let started = Instant::now();

        match self.client.get(url).timeout(timeout).send() {
            Ok(response) => {
                let status = response.status();
                let latency = started.elapsed();
                if status.is_success() {
                    ServiceHealth::up(status.as_u16(), latency)
                } else {
                    debug!("Health check against {url} returned {status}");
                    ServiceHealth {
                        latency: Some(latency),
                        ..ServiceHealth::down(ProbeError::Status(status.as_u16()))
                    }
                }
            }
            Err(err) if err.is_timeout() => {
                debug!("Health check against {url} timed out after {timeout:?}");
                ServiceHealth::down(ProbeError::Timeout(timeout))
            }
            Err(err) => {
                debug!("Health check against {url} failed: {err}");
                ServiceHealth::down(ProbeError::Transport(err.to_string()))
            }
        }
    }
}
