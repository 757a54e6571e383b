//! Forwarding of child service output into the worker's log stream.
use std::{
    io::{BufRead, BufReader, Read},
    thread,
};

use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

/// Standard stream of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum OutputStream {
    /// Standard output, logged at INFO.
    Stdout,
    /// Standard error, logged at WARN.
    Stderr,
}

/// Spawns a thread that relays `reader` line by line into `tracing`.
///
/// The thread ends when the child closes the stream, so callers never block on it.
/// Returns `None` when the thread cannot be spawned; the stream is then dropped
/// and the child's writes to it fail instead of blocking.
pub fn spawn_log_writer<R>(
    service_name: &str,
    reader: R,
    stream: OutputStream,
) -> Option<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let service = service_name.to_string();
    match thread::Builder::new()
        .name(format!("{service}-{stream}"))
        .spawn(move || forward_lines(&service, reader, stream))
    {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Failed to spawn {stream} forwarder for '{service_name}': {err}");
            None
        }
    }
}

fn forward_lines<R: Read>(service: &str, reader: R, stream: OutputStream) {
    let reader = BufReader::new(reader);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                match stream {
                    OutputStream::Stdout => {
                        info!(target: "genworker::child", service, stream = %stream, "{line}")
                    }
                    OutputStream::Stderr => {
                        warn!(target: "genworker::child", service, stream = %stream, "{line}")
                    }
                }
            }
            Err(err) => {
                debug!("Stopped reading {stream} of '{service}': {err}");
                break;
            }
        }
    }
}
