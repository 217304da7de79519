//! r2session - drive radare2 from Rust
//!
//! This crate speaks the r2pipe protocol: send a radare2 command as a string,
//! get its textual output back. The same [`Session`](session::Session) API
//! works over several transports.
//!
//! # Overview
//!
//! - Spawned pipe: runs `radare2 -q0 <target>` and reads NUL-terminated
//!   responses from its stdout
//! - Inherited pipe: when this program runs inside radare2 (`#!pipe`), reuses
//!   the descriptors named by `R2PIPE_IN`/`R2PIPE_OUT`
//! - Native: calls `r_core_cmd_str` in a `libr_core` that is either loaded at
//!   runtime or linked at build time (cargo feature `r2api`)
//!
//! On top of plain commands a session offers formatted commands, JSON decoding
//! into `serde_json::Value` or any `Deserialize` type, and a side-channel event
//! subscription fed by radare2's `===stderr` file.
//!
//! # Architecture
//!
//! - `transport`: the [`Transport`](transport::Transport) trait, framing,
//!   radare2 discovery and the pipe/native implementations
//! - `session`: serialized command execution and the JSON helpers
//! - `events`: side-channel tailing
//! - `options`: spawn configuration
//! - `error`: error types
//!
//! # Example
//!
//! ```rust,no_run
//! use r2session::prelude::*;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Info {
//!     core: Core,
//! }
//!
//! #[derive(Deserialize)]
//! struct Core {
//!     file: String,
//!     size: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), R2Error> {
//!     let r2 = Session::open("/bin/ls").await?;
//!
//!     let info: Info = r2.execute_json_into("ij").await?;
//!     println!("{} is {} bytes", info.core.file, info.core.size);
//!
//!     let entry = cmdf!(r2, "pd {} @ entry0", 8).await?;
//!     println!("{}", entry);
//!
//!     r2.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//!
//! The crate logs through `tracing`: session lifecycle at `debug`, every
//! command at `trace`, radare2's stderr at `warn`. Install any subscriber to
//! see it.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Transports that carry commands to radare2
///
/// [`Transport`](transport::Transport) is the seam every backend implements.
/// [`PipeTransport`](transport::PipeTransport) handles both spawned and
/// inherited pipes; [`DynamicTransport`](transport::DynamicTransport) drives a
/// runtime-loaded `libr_core`.
///
/// The trait can be implemented for custom transports (e.g. scripted mocks,
/// remote radare2 instances).
pub mod transport;

/// Sessions: one radare2 instance and its command API
pub mod session;

/// Side-channel event subscriptions (`===stderr`)
pub mod events;

/// Spawn configuration and builder
pub mod options;

/// Error types and utilities
///
/// [`R2Error`](error::R2Error) covers every failure; [`ErrorKind`](error::ErrorKind)
/// groups them into construction, stream, decode, capability and misuse errors.
pub mod error;

// Prelude module for common imports
pub mod prelude {
    //! Common imports for r2session users
    //!
    //! Use `use r2session::prelude::*;` to import commonly used types.

    pub use crate::cmdf;
    pub use crate::error::{ErrorKind, R2Error};
    pub use crate::events::{EventAction, EventHandler, EventSubscription};
    pub use crate::options::SpawnOptions;
    pub use crate::session::Session;
    pub use crate::transport::{ShutdownMode, Transport, TransportKind};
}
