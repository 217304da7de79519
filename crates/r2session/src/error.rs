//! Error types for r2session
//!
//! All fallible operations return `Result<T, R2Error>`. Each variant belongs to
//! one of five broad [`ErrorKind`]s so callers can decide how to react without
//! matching every variant:
//!
//! - [`ErrorKind::Construction`]: the session never became usable
//! - [`ErrorKind::Stream`]: I/O failed mid-session; close and discard the session
//! - [`ErrorKind::Decode`]: the response was received but is not the expected JSON
//! - [`ErrorKind::Capability`]: the bound transport does not support the feature
//! - [`ErrorKind::Misuse`]: the session or transport is not in a usable state
//!
//! # Example
//!
//! ```rust
//! use r2session::error::{ErrorKind, R2Error};
//!
//! fn example() -> Result<(), R2Error> {
//!     // Auto-conversion from std::io::Error
//!     let _file = std::fs::read_to_string("/nonexistent")?;
//!     Ok(())
//! }
//!
//! let err = example().unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Stream);
//! ```

use thiserror::Error;

/// Broad classification of an [`R2Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Launch, handshake, environment or symbol resolution failure
    Construction,
    /// Read/write failure on an established stream
    Stream,
    /// JSON parse or shape mismatch
    Decode,
    /// Feature not supported by the bound transport
    Capability,
    /// Operation issued in a state that cannot serve it
    Misuse,
}

/// The main error type for all r2session operations
#[derive(Error, Debug)]
pub enum R2Error {
    /// radare2 executable was not found
    ///
    /// Returned by discovery and by spawning when the executable does not exist.
    ///
    /// # Resolution
    /// - Install radare2 and make sure `radare2` is in PATH
    /// - Or set `R2_PATH` / `SpawnOptions::r2_path` explicitly
    #[error("radare2 not found. Install it or set R2_PATH.")]
    NotFound,

    /// The radare2 process could not be launched or its pipes captured
    #[error("Failed to spawn radare2: {0}")]
    Spawn(String),

    /// The initial framed read after spawning failed
    ///
    /// This usually means radare2 could not open the target and exited before
    /// printing its first terminator.
    #[error("Handshake with radare2 failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// A required environment variable is missing (inherited handle mode)
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),

    /// An environment variable does not hold a usable value
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// The value that failed to parse
        value: String,
    },

    /// The native library could not be opened
    #[error("Failed to open {library}: {reason}")]
    Library {
        /// Library file name or path
        library: String,
        /// Loader error message
        reason: String,
    },

    /// A required symbol is missing from the native library
    #[error("Failed to load '{symbol}' from '{library}': {reason}")]
    MissingSymbol {
        /// Symbol name (e.g. `r_core_cmd_str`)
        symbol: &'static str,
        /// Library file name or path
        library: String,
        /// Loader error message
        reason: String,
    },

    /// radare2 reported a version older than required, or an unparsable one
    #[error("Invalid radare2 version: {version}")]
    InvalidVersion {
        /// The version text found
        version: String,
    },

    /// I/O failure on an established command stream
    ///
    /// Includes the stream closing before a terminator was read. The frame
    /// position is unknown afterwards; close the session.
    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// radare2 exited with a non-zero status during shutdown
    #[error("radare2 exited with code {code}")]
    Process {
        /// Exit code, -1 when terminated by a signal
        code: i32,
    },

    /// The response of `command` could not be decoded as the requested JSON shape
    ///
    /// An empty response is reported here too; it is never treated as `null`.
    #[error("Failed to decode JSON from '{command}': {source}")]
    JsonDecode {
        /// The command whose output failed to decode
        command: String,
        /// Underlying parser error
        #[source]
        source: serde_json::Error,
    },

    /// The bound transport does not support the requested feature
    #[error("{feature} is not supported by the {transport} transport")]
    Unsupported {
        /// Feature name (e.g. "event subscription")
        feature: &'static str,
        /// Transport name
        transport: &'static str,
    },

    /// The session has been closed
    #[error("Session is closed")]
    Closed,

    /// A call was made in a state that cannot serve it
    #[error("Misuse: {0}")]
    Misuse(String),
}

impl R2Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            R2Error::NotFound
            | R2Error::Spawn(_)
            | R2Error::Handshake(_)
            | R2Error::MissingEnv(_)
            | R2Error::InvalidEnv { .. }
            | R2Error::Library { .. }
            | R2Error::MissingSymbol { .. }
            | R2Error::InvalidVersion { .. } => ErrorKind::Construction,
            R2Error::Stream(_) | R2Error::Process { .. } => ErrorKind::Stream,
            R2Error::JsonDecode { .. } => ErrorKind::Decode,
            R2Error::Unsupported { .. } => ErrorKind::Capability,
            R2Error::Closed | R2Error::Misuse(_) => ErrorKind::Misuse,
        }
    }

    pub(crate) fn json(command: &str, source: serde_json::Error) -> Self {
        R2Error::JsonDecode {
            command: command.to_string(),
            source,
        }
    }
}
