//! Managed child processes and their termination state machine.
//!
//! A [`ManagedProcess`] owns at most one live OS process at a time and moves
//! through `Idle → Starting → Running → (Exited | Terminating → Terminated)`.
//! The OS process sits behind [`ProcessHandle`] so termination can be
//! exercised without spawning real children.
use std::{
    fmt, io,
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServiceSpec,
    constants::EXIT_POLL_INTERVAL,
    error::WorkerError,
    logs::{OutputStream, spawn_log_writer},
};

/// Lifecycle state of a [`ManagedProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessState {
    /// Never started.
    Idle,
    /// Launched, readiness not yet confirmed.
    Starting,
    /// Launched and confirmed healthy.
    Running,
    /// Exited on its own.
    Exited,
    /// SIGTERM sent, waiting for the exit.
    Terminating,
    /// Exited after a termination request.
    Terminated,
}

/// Signal used to stop a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM.
    Graceful,
    /// SIGKILL.
    Forceful,
}

impl From<StopSignal> for Signal {
    fn from(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Forceful => Signal::SIGKILL,
        }
    }
}

/// How an observed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code if the process returned normally.
    pub code: Option<i32>,
    /// Signal that terminated the process.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Control surface over a single spawned OS process.
pub trait ProcessHandle: Send {
    /// Operating system process id.
    fn id(&self) -> u32;

    /// Non-blocking check for an exit. Reaps the process once it has exited.
    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>>;

    /// Delivers a stop signal. A process that is already gone is not an error.
    fn signal(&mut self, signal: StopSignal) -> io::Result<()>;
}

/// Spawns OS processes for service specs.
pub trait ProcessLauncher: Send + Sync {
    /// Launches `spec` and wires its output streams to the log sink.
    fn launch(&self, spec: &ServiceSpec) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Launches real child processes, each in its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(&self, spec: &ServiceSpec) -> io::Result<Box<dyn ProcessHandle>> {
        debug!(
            "Launching service '{}': {:?} {:?} in {:?}",
            spec.name, spec.executable, spec.args, spec.working_dir
        );

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so termination reaches grandchildren too.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(io::Error::from)
            });
        }

        let mut child = cmd.spawn()?;

        if let Some(out) = child.stdout.take() {
            spawn_log_writer(&spec.name, out, OutputStream::Stdout);
        }
        if let Some(err) = child.stderr.take() {
            spawn_log_writer(&spec.name, err, OutputStream::Stderr);
        }

        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from))
    }

    fn signal(&mut self, stop: StopSignal) -> io::Result<()> {
        let pid = Pid::from_raw(self.child.id() as i32);
        let sig = Signal::from(stop);

        match signal::killpg(pid, sig) {
            Ok(()) => return Ok(()),
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {
                debug!("Process group {pid} unavailable; signalling PID directly");
            }
            Err(err) => return Err(io::Error::from(err)),
        }

        match signal::kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(io::Error::from(err)),
        }
    }
}

struct ProcessSlot {
    state: ProcessState,
    handle: Option<Box<dyn ProcessHandle>>,
    pid: Option<u32>,
    last_exit: Option<ExitOutcome>,
}

impl ProcessSlot {
    /// Observes an exit if one happened. Returns true when no live handle remains.
    fn reap(&mut self, service: &str) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };

        match handle.try_wait() {
            Ok(Some(outcome)) => {
                self.handle = None;
                self.last_exit = Some(outcome);
                self.state = if self.state == ProcessState::Terminating {
                    ProcessState::Terminated
                } else {
                    ProcessState::Exited
                };

                if outcome.success() || self.state == ProcessState::Terminated {
                    info!("Service '{service}' exited ({outcome})");
                } else {
                    warn!("Service '{service}' exited unexpectedly ({outcome})");
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                error!("Failed to check status of '{service}': {err}");
                false
            }
        }
    }
}

/// A single supervised child process.
pub struct ManagedProcess {
    name: String,
    launcher: Arc<dyn ProcessLauncher>,
    slot: Arc<Mutex<ProcessSlot>>,
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl ManagedProcess {
    /// Creates an idle process that will be launched through `launcher`.
    pub fn new(name: impl Into<String>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            name: name.into(),
            launcher,
            slot: Arc::new(Mutex::new(ProcessSlot {
                state: ProcessState::Idle,
                handle: None,
                pid: None,
                last_exit: None,
            })),
        }
    }

    // Every mutation of the slot is a single assignment, so a poisoned lock
    // still guards a consistent value.
    fn lock_slot(&self) -> MutexGuard<'_, ProcessSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.lock_slot().state
    }

    /// PID of the current or most recent OS process.
    pub fn pid(&self) -> Option<u32> {
        self.lock_slot().pid
    }

    /// Outcome of the most recent observed exit.
    pub fn last_exit(&self) -> Option<ExitOutcome> {
        self.lock_slot().last_exit
    }

    /// True while the process is starting or running and still holds a live handle.
    pub fn is_running(&self) -> bool {
        let slot = self.lock_slot();
        matches!(slot.state, ProcessState::Starting | ProcessState::Running)
            && slot.handle.is_some()
    }

    /// Launches the OS process described by `spec`.
    ///
    /// Fails with [`WorkerError::AlreadyRunning`] unless the process is idle. Exit is
    /// observed on a background thread from then on.
    pub fn start(&self, spec: &ServiceSpec) -> Result<(), WorkerError> {
        let mut slot = self.lock_slot();
        if slot.state != ProcessState::Idle {
            return Err(WorkerError::AlreadyRunning {
                service: self.name.clone(),
            });
        }

        let handle = self.launcher.launch(spec).map_err(|source| {
            error!("Failed to start service '{}': {source}", self.name);
            WorkerError::ServiceStartError {
                service: self.name.clone(),
                source,
            }
        })?;

        let pid = handle.id();
        slot.handle = Some(handle);
        slot.pid = Some(pid);
        slot.state = ProcessState::Starting;
        drop(slot);

        info!("Service '{}' started with PID {pid}", self.name);
        self.spawn_exit_watcher();
        Ok(())
    }

    fn spawn_exit_watcher(&self) {
        let slot = Arc::clone(&self.slot);
        let name = self.name.clone();

        let spawned = thread::Builder::new()
            .name(format!("{name}-watch"))
            .spawn(move || {
                loop {
                    thread::sleep(EXIT_POLL_INTERVAL);
                    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    if guard.reap(&name) {
                        break;
                    }
                }
            });

        if let Err(err) = spawned {
            error!(
                "Failed to spawn exit watcher for '{}'; exits are only observed on demand: {err}",
                self.name
            );
        }
    }

    /// Promotes a starting process to running once its readiness gate passed.
    pub fn mark_ready(&self) {
        let mut slot = self.lock_slot();
        if slot.state == ProcessState::Starting && slot.handle.is_some() {
            slot.state = ProcessState::Running;
        }
    }

    /// Stops the process: SIGTERM, then SIGKILL once `grace` has elapsed.
    ///
    /// A no-op for processes that are idle, already exited, or already being
    /// terminated. Returns as soon as the exit is observed or SIGKILL is sent.
    pub fn terminate(&self, grace: Duration) -> Result<(), WorkerError> {
        {
            let mut slot = self.lock_slot();
            if slot.reap(&self.name) {
                debug!("Service '{}' has no live process to terminate", self.name);
                return Ok(());
            }

            match slot.state {
                ProcessState::Starting | ProcessState::Running => {}
                state => {
                    debug!("Service '{}' is {state}; skipping termination", self.name);
                    return Ok(());
                }
            }

            if let Some(handle) = slot.handle.as_mut() {
                handle.signal(StopSignal::Graceful).map_err(|source| {
                    WorkerError::ServiceStopError {
                        service: self.name.clone(),
                        source,
                    }
                })?;
            }
            slot.state = ProcessState::Terminating;
        }

        info!("Sent SIGTERM to '{}', allowing {grace:?} to exit", self.name);

        let deadline = Instant::now() + grace;
        loop {
            if self.lock_slot().reap(&self.name) {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }

        let mut slot = self.lock_slot();
        if slot.reap(&self.name) {
            return Ok(());
        }

        warn!(
            "Service '{}' did not exit after SIGTERM; sending SIGKILL",
            self.name
        );
        if let Some(handle) = slot.handle.as_mut() {
            handle.signal(StopSignal::Forceful).map_err(|source| {
                WorkerError::ServiceStopError {
                    service: self.name.clone(),
                    source,
                }
            })?;
        }

        Ok(())
    }

    /// Blocks until the exit is observed or `timeout` elapses.
    pub fn wait_for_exit(&self, timeout: Duration) -> Option<ExitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut slot = self.lock_slot();
                if slot.state == ProcessState::Idle {
                    return None;
                }
                if slot.reap(&self.name) {
                    return slot.last_exit;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }
    }
}
