//! Supervisor that starts dependent services, gates on their readiness and
//! owns the shutdown sequence.
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::ServiceSpec,
    constants::{
        CANCEL_CHECK_INTERVAL, DEFAULT_SHUTDOWN_GRACE, MIN_PROBE_TIMEOUT,
        READINESS_POLL_INTERVAL,
    },
    error::{ProbeError, WorkerError},
    probe::{HealthCheck, ServiceHealth},
    process::{ManagedProcess, ProcessLauncher},
};

/// Tunables of the supervision lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Interval between readiness probes while a service starts.
    pub poll_interval: Duration,
    /// Grace period used when a failed startup tears services down.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: READINESS_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// A registered service: its immutable spec and the process running it.
#[derive(Debug, Clone)]
pub struct ManagedService {
    /// Launch description.
    pub spec: ServiceSpec,
    /// Process state machine.
    pub process: Arc<ManagedProcess>,
}

/// Point-in-time view of a managed service.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    /// Launch description.
    pub spec: ServiceSpec,
    /// Whether the process is alive.
    pub running: bool,
}

/// Orchestrates the dependent services of the worker.
pub struct ServiceSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthCheck>,
    settings: SupervisorSettings,
    /// Registry of managed services, keyed by name.
    services: Mutex<BTreeMap<String, ManagedService>>,
    /// Serialises `start_all` and `shutdown_all`.
    lifecycle: Mutex<()>,
    shutdown_requested: AtomicBool,
}

impl ServiceSupervisor {
    /// Creates a supervisor with an empty registry.
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthCheck>,
        settings: SupervisorSettings,
    ) -> Self {
        debug!("Initializing supervisor with {settings:?}");
        Self {
            launcher,
            probe,
            settings,
            services: Mutex::new(BTreeMap::new()),
            lifecycle: Mutex::new(()),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, ManagedService>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts every service concurrently and waits until all pass their readiness gate.
    ///
    /// On the first failure every service started by this call is terminated and the
    /// root-cause error is returned, e.g. [`WorkerError::StartupTimeout`].
    pub fn start_all(&self, specs: &[ServiceSpec]) -> Result<(), WorkerError> {
        let _lifecycle = self.lifecycle.lock()?;
        info!("Starting {} dependent service(s)...", specs.len());

        let abort = AtomicBool::new(false);
        let launched: Mutex<Vec<Arc<ManagedProcess>>> = Mutex::new(Vec::new());
        let results: Vec<(String, Result<(), WorkerError>)> = thread::scope(|scope| {
            let workers: Vec<_> = specs
                .iter()
                .map(|spec| {
                    let abort = &abort;
                    let launched = &launched;
                    let worker = thread::Builder::new()
                        .name(format!("{}-start", spec.name))
                        .spawn_scoped(scope, move || {
                            let result = self.launch_and_await(spec, abort, launched);
                            if result.is_err() {
                                abort.store(true, Ordering::SeqCst);
                            }
                            result
                        });
                    (spec.name.clone(), worker)
                })
                .collect();

            workers
                .into_iter()
                .map(|(name, worker)| {
                    let result = match worker {
                        Ok(handle) => handle.join().unwrap_or_else(|_| {
                            Err(WorkerError::ServiceStartError {
                                service: name.clone(),
                                source: std::io::Error::other("startup thread panicked"),
                            })
                        }),
                        Err(source) => {
                            abort.store(true, Ordering::SeqCst);
                            Err(WorkerError::ServiceStartError {
                                service: name.clone(),
                                source,
                            })
                        }
                    };
                    (name, result)
                })
                .collect()
        });

        let mut first_error: Option<WorkerError> = None;
        for (name, result) in results {
            match result {
                Ok(()) => debug!("Service '{name}' passed its readiness gate"),
                Err(err) => {
                    error!("Failed to start service '{name}': {err}");
                    // Cancellations caused by a sibling's failure are not the root cause.
                    let replace = match (&first_error, &err) {
                        (None, _) => true,
                        (Some(WorkerError::StartupCancelled { .. }), other) => {
                            !matches!(other, WorkerError::StartupCancelled { .. })
                        }
                        _ => false,
                    };
                    if replace {
                        first_error = Some(err);
                    }
                }
            }
        }

        let launched = launched.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = first_error {
            warn!("Startup failed; stopping {} service(s) launched by this call", launched.len());
            terminate_concurrently(&launched, self.settings.shutdown_grace);
            return Err(err);
        }

        for process in &launched {
            process.mark_ready();
        }
        info!("All dependent services are healthy.");
        Ok(())
    }

    /// Registers, launches and awaits one service. Processes that were launched are
    /// recorded in `launched` so a failed startup only tears down its own work.
    fn launch_and_await(
        &self,
        spec: &ServiceSpec,
        abort: &AtomicBool,
        launched: &Mutex<Vec<Arc<ManagedProcess>>>,
    ) -> Result<(), WorkerError> {
        self.ensure_not_cancelled(spec, abort)?;
        let process = {
            let mut registry = self.registry();
            if let Some(existing) = registry.get(&spec.name)
                && existing.process.is_running()
            {
                return Err(WorkerError::AlreadyRunning {
                    service: spec.name.clone(),
                });
            }

            let process = Arc::new(ManagedProcess::new(
                spec.name.clone(),
                Arc::clone(&self.launcher),
            ));
            registry.insert(
                spec.name.clone(),
                ManagedService {
                    spec: spec.clone(),
                    process: Arc::clone(&process),
                },
            );
            process
        };

        info!("Starting service: {}", spec.name);
        process.start(spec)?;
        launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&process));
        self.await_ready(spec, &process, abort)
    }

    /// Polls the readiness URL until it succeeds or the startup deadline passes.
    fn await_ready(
        &self,
        spec: &ServiceSpec,
        process: &ManagedProcess,
        abort: &AtomicBool,
    ) -> Result<(), WorkerError> {
        let deadline = Instant::now() + spec.startup_timeout;
        let mut attempt = 0u32;

        loop {
            self.ensure_not_cancelled(spec, abort)?;

            if !process.is_running() {
                let outcome = process
                    .last_exit()
                    .map(|outcome| outcome.to_string())
                    .unwrap_or_else(|| "no exit status".into());
                return Err(WorkerError::ServiceExited {
                    service: spec.name.clone(),
                    outcome,
                });
            }

            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = spec.health_timeout.min(remaining).max(MIN_PROBE_TIMEOUT);
            let health = self.probe.check(&spec.readiness_url, timeout);
            if health.healthy {
                info!(
                    "Service '{}' is ready (attempt {attempt}, {:?})",
                    spec.name, health.latency
                );
                return Ok(());
            }

            debug!(
                "Readiness attempt {attempt} for '{}' failed: {}",
                spec.name,
                health
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );

            let now = Instant::now();
            if now >= deadline {
                return Err(WorkerError::StartupTimeout {
                    service: spec.name.clone(),
                    timeout: spec.startup_timeout,
                });
            }

            self.sleep_cancellable(self.settings.poll_interval.min(deadline - now), spec, abort)?;
        }
    }

    fn ensure_not_cancelled(
        &self,
        spec: &ServiceSpec,
        abort: &AtomicBool,
    ) -> Result<(), WorkerError> {
        if abort.load(Ordering::SeqCst) || self.shutdown_requested.load(Ordering::SeqCst) {
            debug!("Readiness polling for '{}' cancelled", spec.name);
            return Err(WorkerError::StartupCancelled {
                service: spec.name.clone(),
            });
        }
        Ok(())
    }

    fn sleep_cancellable(
        &self,
        duration: Duration,
        spec: &ServiceSpec,
        abort: &AtomicBool,
    ) -> Result<(), WorkerError> {
        let wake_at = Instant::now() + duration;
        loop {
            self.ensure_not_cancelled(spec, abort)?;
            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }
            thread::sleep(CANCEL_CHECK_INTERVAL.min(wake_at - now));
        }
    }

    /// Cancels any in-flight readiness polling. Safe to call from a signal handler thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Whether [`request_shutdown`](Self::request_shutdown) has been called.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Terminates every managed service concurrently.
    ///
    /// Individual failures are logged and never propagated. Calling this again, or
    /// after a partial startup, is harmless.
    pub fn shutdown_all(&self, grace: Duration) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        info!("Shutting down dependent services...");
        self.terminate_all(grace);
        info!("Dependent services stopped.");
    }

    fn terminate_all(&self, grace: Duration) {
        let processes: Vec<Arc<ManagedProcess>> = self
            .registry()
            .values()
            .map(|service| Arc::clone(&service.process))
            .collect();
        terminate_concurrently(&processes, grace);
    }

    /// Liveness of every managed service. Never probes.
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.registry()
            .iter()
            .map(|(name, service)| (name.clone(), service.process.is_running()))
            .collect()
    }

    /// Specs and liveness of every managed service.
    pub fn services(&self) -> Vec<ServiceSnapshot> {
        self.registry()
            .values()
            .map(|service| ServiceSnapshot {
                spec: service.spec.clone(),
                running: service.process.is_running(),
            })
            .collect()
    }

    /// Returns the registered process for `name`.
    pub fn process(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.registry()
            .get(name)
            .map(|service| Arc::clone(&service.process))
    }

    /// Probes every running service concurrently. Stopped services are reported down.
    ///
    /// A check that panics is an internal failure, not a down service, and fails the
    /// whole check with [`WorkerError::HealthCheckPanicked`].
    pub fn check_health(&self) -> Result<BTreeMap<String, ServiceHealth>, WorkerError> {
        let snapshot = self.services();

        thread::scope(|scope| {
            let probes: Vec<_> = snapshot
                .iter()
                .map(|service| {
                    let name = service.spec.name.clone();
                    if !service.running {
                        return (name, None);
                    }
                    let probe = &self.probe;
                    let handle = scope.spawn(move || {
                        probe.check(&service.spec.readiness_url, service.spec.health_timeout)
                    });
                    (name, Some(handle))
                })
                .collect();

            // Join every handle before short-circuiting; an unjoined panicked
            // thread would make the scope itself panic.
            let joined: Vec<Result<(String, ServiceHealth), WorkerError>> = probes
                .into_iter()
                .map(|(name, handle)| {
                    let health = match handle {
                        None => ServiceHealth::down(ProbeError::Transport(
                            "service is not running".into(),
                        )),
                        Some(handle) => handle
                            .join()
                            .map_err(|_| WorkerError::HealthCheckPanicked {
                                service: name.clone(),
                            })?,
                    };
                    Ok((name, health))
                })
                .collect();
            joined.into_iter().collect()
        })
    }
}

fn terminate_concurrently(processes: &[Arc<ManagedProcess>], grace: Duration) {
    thread::scope(|scope| {
        for process in processes {
            scope.spawn(move || {
                if let Err(err) = process.terminate(grace) {
                    error!("Failed to terminate '{}': {err}", process.name());
                }
            });
        }
    });
}
