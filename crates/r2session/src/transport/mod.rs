//! Transport abstraction for talking to radare2
//!
//! A [`Transport`] sends one command string and returns one response string.
//! Three implementations ship with the crate:
//!
//! - [`PipeTransport`] - spawns `radare2 -q0` (or reuses the descriptors that
//!   radare2 passed through `R2PIPE_IN`/`R2PIPE_OUT`) and frames responses on
//!   the NUL terminator with [`FrameReader`]
//! - [`DynamicTransport`] - loads `libr_core` at runtime and calls
//!   `r_core_cmd_str` directly
//! - `LinkedTransport` - the same calls against a `libr_core` linked at build
//!   time (cargo feature `r2api`)
//!
//! # Custom Transports
//!
//! The trait can be implemented for anything that answers commands, such as a
//! scripted mock in tests:
//!
//! ```
//! use async_trait::async_trait;
//! use r2session::error::R2Error;
//! use r2session::transport::{ShutdownMode, Transport, TransportKind};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Transport for Echo {
//!     async fn execute(&mut self, command: &str) -> Result<String, R2Error> {
//!         Ok(command.to_string())
//!     }
//!
//!     async fn shutdown(&mut self, _mode: ShutdownMode) -> Result<(), R2Error> {
//!         Ok(())
//!     }
//!
//!     fn kind(&self) -> TransportKind {
//!         TransportKind::Custom
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::R2Error;

mod discovery;
mod framing;
mod native;
mod pipe;

pub use discovery::{R2_PATH_ENV, R2Discovery};
pub use framing::{FrameReader, TERMINATOR, decode_frame};
#[cfg(feature = "r2api")]
pub use native::LinkedTransport;
pub use native::{DynamicTransport, R2_LIBR_CORE_ENV, load as load_native_library};
pub use pipe::{PipeTransport, R2PIPE_IN, R2PIPE_OUT};

#[cfg(test)]
pub(crate) use native::fake as fake_native;

/// How radare2 should be asked to quit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// `q` - let radare2 run its normal exit path
    Graceful,
    /// `q!` - quit without prompts or saving
    Force,
}

impl ShutdownMode {
    /// The radare2 command that requests this kind of exit
    pub fn quit_command(self) -> &'static str {
        match self {
            ShutdownMode::Graceful => "q",
            ShutdownMode::Force => "q!",
        }
    }
}

/// Which kind of transport backs a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process spawned by this crate
    Spawned,
    /// Descriptors inherited from a parent radare2 (`R2PIPE_IN`/`R2PIPE_OUT`)
    Inherited,
    /// `libr_core` linked at build time
    Linked,
    /// `libr_core` loaded at runtime
    Dynamic,
    /// A caller-provided implementation
    Custom,
}

impl TransportKind {
    /// Short name used in logs and error messages
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Spawned => "spawned pipe",
            TransportKind::Inherited => "inherited pipe",
            TransportKind::Linked => "linked native",
            TransportKind::Dynamic => "dynamic native",
            TransportKind::Custom => "custom",
        }
    }
}

/// Sends commands to one radare2 instance and returns their output.
///
/// # Lifecycle
///
/// A transport is fully connected once its constructor returns. It serves
/// [`execute`](Transport::execute) calls until [`shutdown`](Transport::shutdown),
/// after which further commands are an error.
///
/// # Concurrency
///
/// Methods take `&mut self`: one command is in flight at a time. The
/// [`Session`](crate::session::Session) wraps its transport in a mutex so
/// callers sharing a session never interleave commands.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run one command and return its output
    ///
    /// # Errors
    ///
    /// - [`R2Error::Stream`] if writing the command or reading its response fails
    /// - [`R2Error::Misuse`] if the transport was already shut down
    async fn execute(&mut self, command: &str) -> Result<String, R2Error>;

    /// Stop the radare2 instance and release its resources
    ///
    /// Calling this a second time must not touch the instance again.
    async fn shutdown(&mut self, mode: ShutdownMode) -> Result<(), R2Error>;

    /// Which variant this is
    fn kind(&self) -> TransportKind;

    /// Whether `===stderr` side-channel subscriptions work on this transport
    fn supports_events(&self) -> bool {
        false
    }

    /// The pipe behind this transport, for raw reads and writes
    fn as_pipe_mut(&mut self) -> Option<&mut PipeTransport> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_commands() {
        assert_eq!(ShutdownMode::Graceful.quit_command(), "q");
        assert_eq!(ShutdownMode::Force.quit_command(), "q!");
    }

    #[test]
    fn test_kind_names_are_distinct() {
        let kinds = [
            TransportKind::Spawned,
            TransportKind::Inherited,
            TransportKind::Linked,
            TransportKind::Dynamic,
            TransportKind::Custom,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.name(), b.name());
            }
        }
    }
}
