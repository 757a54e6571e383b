//! Configuration management for genworker.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_HEALTH_TIMEOUT, DEFAULT_INPUT_DIR, DEFAULT_PORT,
    DEFAULT_SHUTDOWN_GRACE, DEFAULT_STARTUP_TIMEOUT, DEFAULT_STORAGE_ENDPOINT,
    DEFAULT_STORE_TIMEOUT, ENV_FILE_NAME, READINESS_POLL_INTERVAL,
};
use crate::error::WorkerError;

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// HTTP facade settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Time allowed between SIGTERM and SIGKILL during shutdown (e.g. "5s").
    pub shutdown_grace: Option<String>,
    /// Interval between readiness probes while services start (e.g. "2s").
    pub readiness_poll_interval: Option<String>,
    /// Map of dependent service names to their launch configuration.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Where user assets are fetched from.
    pub object_store: ObjectStoreConfig,
    /// Where relayed assets are written.
    #[serde(default)]
    pub assets: AssetsConfig,
    /// Root directory from which relative paths are resolved.
    #[serde(skip)]
    pub project_dir: Option<String>,
}

/// HTTP facade settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listening port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Configuration for an individual dependent service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Executable to launch (absolute, or relative to `working_dir`).
    pub executable: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative paths resolve against the config directory.
    pub working_dir: Option<String>,
    /// Base URL the service listens on.
    pub url: String,
    /// URL polled for readiness, defaults to `url`.
    pub readiness_url: Option<String>,
    /// Deadline for the readiness gate (e.g. "60s").
    pub startup_timeout: Option<String>,
    /// Timeout of a single health probe (e.g. "10s").
    pub health_timeout: Option<String>,
    /// Extra environment variables for the child.
    pub env: Option<HashMap<String, String>>,
}

/// Object store backend selection.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    /// Firebase Storage over its REST API.
    Firebase {
        /// Project identifier reported by `/health`.
        project_id: Option<String>,
        /// Storage bucket, e.g. `my-project.appspot.com`.
        bucket: String,
        /// REST endpoint override (emulators, proxies).
        endpoint: Option<String>,
        /// Pre-issued bearer token; empty means anonymous.
        access_token: Option<String>,
        /// Request timeout (e.g. "30s").
        timeout: Option<String>,
    },
    /// A local directory laid out like the bucket.
    Directory {
        /// Directory containing `users/<uid>/images/<file>`.
        root: String,
    },
}

/// Settings for relayed assets.
#[derive(Debug, Deserialize, Clone)]
pub struct AssetsConfig {
    /// Directory the generation engine reads input images from.
    #[serde(default = "default_input_dir")]
    pub input_dir: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
        }
    }
}

fn default_input_dir() -> String {
    DEFAULT_INPUT_DIR.to_string()
}

/// Fully resolved, immutable description of a dependent service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service name used in logs and status maps.
    pub name: String,
    /// Executable to launch.
    pub executable: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Base URL reported by the status endpoint.
    pub url: String,
    /// URL polled for readiness and health.
    pub readiness_url: String,
    /// Deadline for the readiness gate.
    pub startup_timeout: Duration,
    /// Timeout of a single health probe.
    pub health_timeout: Duration,
}

impl ServiceSpec {
    /// Builds a spec with default timeouts, mostly useful for tests and tooling.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        readiness_url: impl Into<String>,
    ) -> Self {
        let readiness_url = readiness_url.into();
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            env: Vec::new(),
            url: readiness_url.clone(),
            readiness_url,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    /// Replaces the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Replaces the startup and per-probe timeouts.
    pub fn with_timeouts(mut self, startup: Duration, health: Duration) -> Self {
        self.startup_timeout = startup;
        self.health_timeout = health;
        self
    }
}

impl Config {
    fn project_root(&self) -> PathBuf {
        self.project_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root().join(path)
        }
    }

    /// Resolves every configured service into an immutable [`ServiceSpec`].
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>, WorkerError> {
        let mut specs = Vec::with_capacity(self.services.len());

        for (name, service) in &self.services {
            let working_dir = service
                .working_dir
                .as_deref()
                .map(|dir| self.resolve_path(dir))
                .unwrap_or_else(|| self.project_root());

            let executable = {
                let path = Path::new(&service.executable);
                if path.is_absolute() || !service.executable.contains('/') {
                    path.to_path_buf()
                } else {
                    working_dir.join(path)
                }
            };

            let startup_timeout = match &service.startup_timeout {
                Some(raw) => parse_duration(raw)?,
                None => DEFAULT_STARTUP_TIMEOUT,
            };
            let health_timeout = match &service.health_timeout {
                Some(raw) => parse_duration(raw)?,
                None => DEFAULT_HEALTH_TIMEOUT,
            };

            let mut env: Vec<(String, String)> = service
                .env
                .as_ref()
                .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            env.sort();

            specs.push(ServiceSpec {
                name: name.clone(),
                executable,
                args: service.args.clone(),
                working_dir,
                env,
                url: service.url.clone(),
                readiness_url: service
                    .readiness_url
                    .clone()
                    .unwrap_or_else(|| service.url.clone()),
                startup_timeout,
                health_timeout,
            });
        }

        Ok(specs)
    }

    /// Grace period applied to every service during shutdown.
    pub fn shutdown_grace(&self) -> Result<Duration, WorkerError> {
        self.shutdown_grace
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map(|value| value.unwrap_or(DEFAULT_SHUTDOWN_GRACE))
    }

    /// Interval between readiness probes while services start.
    pub fn readiness_poll_interval(&self) -> Result<Duration, WorkerError> {
        self.readiness_poll_interval
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map(|value| value.unwrap_or(READINESS_POLL_INTERVAL))
    }

    /// Local directory relayed assets are written to.
    pub fn input_dir(&self) -> PathBuf {
        self.resolve_path(&self.assets.input_dir)
    }

    /// Resolves the directory backend root, if that backend is selected.
    pub fn store_root(&self) -> Option<PathBuf> {
        match &self.object_store {
            ObjectStoreConfig::Directory { root } => Some(self.resolve_path(root)),
            ObjectStoreConfig::Firebase { .. } => None,
        }
    }
}

impl ObjectStoreConfig {
    /// REST endpoint for the Firebase backend.
    pub fn endpoint(&self) -> &str {
        match self {
            ObjectStoreConfig::Firebase {
                endpoint: Some(endpoint),
                ..
            } if !endpoint.trim().is_empty() => endpoint.trim_end_matches('/'),
            _ => DEFAULT_STORAGE_ENDPOINT,
        }
    }

    /// Request timeout for remote backends.
    pub fn timeout(&self) -> Result<Duration, WorkerError> {
        match self {
            ObjectStoreConfig::Firebase {
                timeout: Some(raw), ..
            } => parse_duration(raw),
            _ => Ok(DEFAULT_STORE_TIMEOUT),
        }
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
///
/// A bare number is interpreted as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, WorkerError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(config_error("Duration value cannot be empty"));
    }

    let invalid = || config_error(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;

    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

fn config_error(message: impl Into<String>) -> WorkerError {
    WorkerError::ConfigError(message.into())
}

/// Expands `$VAR`, `${VAR}` and `${VAR:-default}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, WorkerError> {
    let re = Regex::new(
        r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
    )
    .map_err(|err| config_error(err.to_string()))?;

    let mut missing: Option<String> = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = caps
            .get(1)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();

        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var_name) = missing {
        return Err(config_error(format!(
            "Missing environment variable: {var_name}"
        )));
    }

    Ok(result.to_string())
}

/// Loads an `.env` file, leaving variables that are already set untouched.
fn load_env_file(path: &Path) -> Result<(), WorkerError> {
    let content = fs::read_to_string(path).map_err(WorkerError::ConfigReadError)?;
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().trim_start_matches("export ").trim();
            let mut value = value.trim();

            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }

            if env::var_os(key).is_none() {
                unsafe {
                    env::set_var(key, value);
                }
            }
        }
    }
    Ok(())
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, WorkerError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        WorkerError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let env_path = base_path.join(ENV_FILE_NAME);
    if env_path.is_file() {
        load_env_file(&env_path)?;
    }

    let expanded_content = expand_env_vars(&content)?;

    let mut config: Config = serde_yaml::from_str(&expanded_content)
        .map_err(WorkerError::ConfigParseError)?;

    config.project_dir = Some(base_path.to_string_lossy().to_string());
    Ok(config)
}
