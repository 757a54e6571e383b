//! Command-line interface for genworker.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::DEFAULT_CONFIG_FILE;

/// Log level accepted by `--log-level`: a level name or a 0-5 shorthand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// Directive suitable for an `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let level = match trimmed.to_ascii_lowercase().as_str() {
            "" => return Err("log level cannot be empty".into()),
            "err" => LevelFilter::ERROR,
            "warning" => LevelFilter::WARN,
            other => LevelFilter::from_str(other).map_err(|_| {
                format!(
                    "invalid log level '{trimmed}' (expected off, error, warn, info, debug, trace or 0-5)"
                )
            })?,
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for genworker.
#[derive(Parser)]
#[command(name = "genworker", version, author)]
#[command(
    about = "Supervises the inference and generation engines behind a health-gated HTTP facade",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for genworker.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the dependent services, wait until they are healthy and serve HTTP.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Relay one image from the object store into the engine's input directory.
    Relay {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,

        /// Owner of the image.
        #[arg(long)]
        uid: String,

        /// Name of the image in the owner's image folder.
        #[arg(long)]
        file_name: String,

        /// Task the image is destined for (img2vid or txt2img).
        #[arg(long)]
        task_type: String,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
