//! Configuration for spawned radare2 sessions
//!
//! [`SpawnOptions`] controls how the `radare2` child process is launched and
//! shut down, and how often event subscriptions poll the side channel.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use r2session::options::SpawnOptions;
//!
//! let options = SpawnOptions::builder()
//!     .r2_path("/usr/local/bin/radare2")
//!     .arg("-e")
//!     .arg("scr.color=0")
//!     .shutdown_timeout(Duration::from_secs(2))
//!     .build();
//!
//! assert_eq!(options.to_args("malloc://256"), vec!["-q0", "-e", "scr.color=0", "malloc://256"]);
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Flags that put radare2 into quiet, NUL-terminated pipe mode
pub const PIPE_FLAGS: &str = "-q0";

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options for spawning radare2
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// radare2 executable; discovered via PATH when unset
    pub r2_path: Option<PathBuf>,
    /// Extra arguments placed between the pipe flags and the target
    pub extra_args: Vec<String>,
    /// Environment variables added to the child's environment
    pub env: HashMap<String, String>,
    /// Working directory of the child
    pub cwd: Option<PathBuf>,
    /// How long close waits for exit before terminating the child
    pub shutdown_timeout: Duration,
    /// Sleep between side-channel reads that returned nothing
    pub event_poll_interval: Duration,
    /// Keep the child's stderr for [`PipeTransport::read_err`] instead of
    /// logging it
    ///
    /// A captured stream must be drained by the caller; radare2 blocks once
    /// the pipe buffer is full.
    ///
    /// [`PipeTransport::read_err`]: crate::transport::PipeTransport::read_err
    pub capture_stderr: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            r2_path: None,
            extra_args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            event_poll_interval: DEFAULT_EVENT_POLL_INTERVAL,
            capture_stderr: false,
        }
    }
}

impl SpawnOptions {
    /// Create a new options builder
    pub fn builder() -> SpawnOptionsBuilder {
        SpawnOptionsBuilder::default()
    }

    /// Command-line arguments for radare2 opening `target`
    ///
    /// The target always comes last, as a single argument.
    pub fn to_args(&self, target: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.extra_args.len() + 2);
        args.push(PIPE_FLAGS.to_string());
        args.extend(self.extra_args.iter().cloned());
        args.push(target.to_string());
        args
    }
}

/// Builder for [`SpawnOptions`]
#[derive(Debug, Default)]
pub struct SpawnOptionsBuilder {
    inner: SpawnOptions,
}

impl SpawnOptionsBuilder {
    /// Set the radare2 executable
    pub fn r2_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.r2_path = Some(path.into());
        self
    }

    /// Append one extra argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.inner.extra_args.push(arg.into());
        self
    }

    /// Replace the extra arguments
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.inner.extra_args = args;
        self
    }

    /// Add one environment variable
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.env.insert(key.into(), value.into());
        self
    }

    /// Replace the environment variables
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.inner.env = env;
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.cwd = Some(path.into());
        self
    }

    /// Set the wait-for-exit timeout used by close
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.inner.shutdown_timeout = timeout;
        self
    }

    /// Set the side-channel poll interval
    pub fn event_poll_interval(mut self, interval: Duration) -> Self {
        self.inner.event_poll_interval = interval;
        self
    }

    /// Keep stderr readable through the transport instead of logging it
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.inner.capture_stderr = capture;
        self
    }

    /// Build the options
    pub fn build(self) -> SpawnOptions {
        self.inner
    }
}
