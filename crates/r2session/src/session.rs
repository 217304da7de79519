//! One radare2 instance and the commands sent to it
//!
//! A [`Session`] owns exactly one [`Transport`] for its whole life. Every
//! command goes through the session, which serializes access to the
//! transport so a shared session never has two commands in flight.
//!
//! # Lifecycle
//!
//! ```text
//!   constructor ──ok──▶ Open ──close / force_close──▶ Closed
//!        │
//!        └──err──▶ (no session)
//! ```
//!
//! A closed session rejects commands with [`R2Error::Closed`]; closing it again
//! is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use r2session::session::Session;
//!
//! # async fn example() -> Result<(), r2session::error::R2Error> {
//! let r2 = Session::open("malloc://256").await?;
//! r2.execute("w Hello World").await?;
//! assert_eq!(r2.execute("ps").await?, "Hello World");
//! r2.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Timeouts
//!
//! Commands have no deadline. Wrapping a call in `tokio::time::timeout` is
//! fine, but an expired call leaves the pipe in the middle of a frame: close
//! the session afterwards instead of issuing more commands.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::R2Error;
use crate::events::{self, EventHandler, EventSubscription, STDERR_COMMAND, StopFlag};
use crate::options::SpawnOptions;
#[cfg(feature = "r2api")]
use crate::transport::LinkedTransport;
use crate::transport::{DynamicTransport, PipeTransport, ShutdownMode, Transport, TransportKind};

/// Exclusive access to the pipe behind a session, see [`Session::pipe`]
pub type PipeGuard<'a> = MappedMutexGuard<'a, PipeTransport>;

/// Format a command and run it on a session
///
/// Expands to [`Session::execute_formatted`] with `format_args!`.
///
/// ```rust,no_run
/// # async fn example(r2: &r2session::session::Session) -> Result<(), r2session::error::R2Error> {
/// let disasm = r2session::cmdf!(r2, "pd {} @ {:#x}", 4, 0x1000).await?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! cmdf {
    ($session:expr, $($arg:tt)*) => {
        $session.execute_formatted(::std::format_args!($($arg)*))
    };
}

/// A connection to one radare2 instance
///
/// # Thread Safety
///
/// `Session` is `Send + Sync` and can be shared behind an `Arc`. Commands
/// from different tasks are queued on an internal mutex and run one at a
/// time, each seeing only its own response.
pub struct Session {
    target: String,
    kind: TransportKind,
    supports_events: bool,
    event_poll_interval: Duration,

    /// `None` once closed
    transport: Mutex<Option<Box<dyn Transport>>>,

    /// Stopped on close
    subscriptions: Mutex<Vec<StopFlag>>,

    closed: AtomicBool,
}

impl Session {
    /// Open `target` the default way
    ///
    /// A non-empty target spawns `radare2 -q0 <target>`. An empty target
    /// connects to the radare2 that started this process, through the
    /// descriptors in `R2PIPE_IN`/`R2PIPE_OUT`.
    pub async fn open(target: &str) -> Result<Self, R2Error> {
        if target.is_empty() {
            Self::from_env()
        } else {
            Self::spawn(target, SpawnOptions::default()).await
        }
    }

    /// Spawn radare2 on `target` with explicit options
    pub async fn spawn(target: &str, options: SpawnOptions) -> Result<Self, R2Error> {
        let transport = PipeTransport::spawn(target, &options).await?;
        let mut session = Self::with_transport(target, Box::new(transport));
        session.event_poll_interval = options.event_poll_interval;
        Ok(session)
    }

    /// Connect to the parent radare2 through `R2PIPE_IN`/`R2PIPE_OUT`
    pub fn from_env() -> Result<Self, R2Error> {
        let transport = PipeTransport::from_env()?;
        Ok(Self::with_transport("", Box::new(transport)))
    }

    /// Open `target` in a core from a `libr_core` loaded at runtime
    pub async fn native(target: &str) -> Result<Self, R2Error> {
        let transport = DynamicTransport::open(target).await?;
        Ok(Self::with_transport(target, Box::new(transport)))
    }

    /// Open `target` in a core from the `libr_core` linked at build time
    #[cfg(feature = "r2api")]
    pub async fn linked(target: &str) -> Result<Self, R2Error> {
        let transport = LinkedTransport::open(target).await?;
        Ok(Self::with_transport(target, Box::new(transport)))
    }

    /// Bind a session to an already-constructed transport
    pub fn with_transport(target: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let target = target.into();
        let kind = transport.kind();
        debug!("Session opened on {:?} ({})", target, kind.name());

        Self {
            target,
            kind,
            supports_events: transport.supports_events(),
            event_poll_interval: SpawnOptions::default().event_poll_interval,
            transport: Mutex::new(Some(transport)),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The file or URI this session was opened on (empty for inherited descriptors)
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Which transport variant backs this session
    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// Whether [`close`](Self::close) or [`force_close`](Self::force_close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run a command and return its output
    ///
    /// The output never ends with the frame terminator or a trailing newline
    /// (pipe transports); it may be empty.
    ///
    /// # Errors
    ///
    /// - [`R2Error::Closed`] after close
    /// - [`R2Error::Stream`] if the transport fails; close the session afterwards
    pub async fn execute(&self, command: &str) -> Result<String, R2Error> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(R2Error::Closed)?;
        trace!("execute {:?}", command);
        transport.execute(command).await
    }

    /// Format a command and run it
    ///
    /// Usually reached through the [`cmdf!`](crate::cmdf) macro.
    pub fn execute_formatted<'s>(
        &'s self,
        args: fmt::Arguments<'_>,
    ) -> impl Future<Output = Result<String, R2Error>> + Send + use<'s> {
        let command = fmt::format(args);
        async move { self.execute(&command).await }
    }

    /// Run a command and parse its output as JSON
    ///
    /// Empty output is a [`R2Error::JsonDecode`], not `null`.
    pub async fn execute_json(&self, command: &str) -> Result<Value, R2Error> {
        self.execute_json_into(command).await
    }

    /// Run a command and deserialize its JSON output into `T`
    ///
    /// ```rust,no_run
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Seek {
    ///     offset: u64,
    /// }
    ///
    /// # async fn example(r2: &r2session::session::Session) -> Result<(), r2session::error::R2Error> {
    /// let seek: Seek = r2.execute_json_into("sj").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_json_into<T: DeserializeOwned>(&self, command: &str) -> Result<T, R2Error> {
        let raw = self.execute(command).await?;
        serde_json::from_str(&raw).map_err(|e| {
            debug!("Decoding output of {:?} failed: {}", command, e);
            R2Error::json(command, e)
        })
    }

    /// Format a command and parse its output as JSON
    pub fn execute_json_formatted<'s>(
        &'s self,
        args: fmt::Arguments<'_>,
    ) -> impl Future<Output = Result<Value, R2Error>> + Send + use<'s> {
        let command = fmt::format(args);
        async move { self.execute_json(&command).await }
    }

    /// Format a command and deserialize its JSON output into `T`
    pub fn execute_json_into_formatted<'s, T>(
        &'s self,
        args: fmt::Arguments<'_>,
    ) -> impl Future<Output = Result<T, R2Error>> + Send + use<'s, T>
    where
        T: DeserializeOwned + Send,
    {
        let command = fmt::format(args);
        async move { self.execute_json_into(&command).await }
    }

    /// Lock the underlying pipe for raw reads and writes
    ///
    /// The guard holds the command lock: other callers wait until it is
    /// dropped. Anything written must be read back before then, or later
    /// commands see stale frames.
    ///
    /// ```rust,no_run
    /// # async fn example(r2: &r2session::session::Session) -> Result<(), r2session::error::R2Error> {
    /// let mut pipe = r2.pipe().await?;
    /// pipe.send_raw(b"?e one\n?e two\n").await?;
    /// let one = pipe.read_frame().await?;
    /// let two = pipe.read_frame().await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// - [`R2Error::Closed`] after close
    /// - [`R2Error::Unsupported`] if the session is not backed by a pipe
    pub async fn pipe(&self) -> Result<PipeGuard<'_>, R2Error> {
        let guard = self.transport.lock().await;
        MutexGuard::try_map(guard, |slot| {
            slot.as_mut().and_then(|transport| transport.as_pipe_mut())
        })
        .map_err(|guard| {
            if guard.is_none() {
                R2Error::Closed
            } else {
                R2Error::Unsupported {
                    feature: "raw pipe access",
                    transport: self.kind.name(),
                }
            }
        })
    }

    /// Ask radare2 to quit (`q`) and wait for it to exit
    ///
    /// Event subscriptions created by this session are cancelled.
    /// Inherited-descriptor sessions have no child to reap and only drop
    /// their streams. Closing an already closed session returns `Ok(())`.
    pub async fn close(&self) -> Result<(), R2Error> {
        self.shutdown(ShutdownMode::Graceful).await
    }

    /// Like [`close`](Self::close) but sends `q!`
    pub async fn force_close(&self) -> Result<(), R2Error> {
        self.shutdown(ShutdownMode::Force).await
    }

    async fn shutdown(&self, mode: ShutdownMode) -> Result<(), R2Error> {
        let mut guard = self.transport.lock().await;
        let Some(mut transport) = guard.take() else {
            debug!("Session already closed");
            return Ok(());
        };
        self.closed.store(true, Ordering::SeqCst);

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for stop in &subscriptions {
            stop.stop();
        }

        debug!(
            "Closing session on {:?} ({:?}, {} subscriptions cancelled)",
            self.target,
            mode,
            subscriptions.len()
        );
        transport.shutdown(mode).await
    }

    /// Subscribe to radare2's side channel
    ///
    /// Sends `===stderr`, opens the file path it returns and tails it on a
    /// background task. `handler` receives `event_name`, `user_data` and each
    /// batch of new text; returning [`EventAction::Stop`](crate::events::EventAction::Stop)
    /// ends the subscription.
    ///
    /// # Errors
    ///
    /// - [`R2Error::Unsupported`] for native transports (nothing is sent)
    /// - [`R2Error::Closed`] after close
    /// - [`R2Error::Stream`] if the command or opening the file fails
    pub async fn on<T, H>(
        &self,
        event_name: &str,
        user_data: T,
        handler: H,
    ) -> Result<EventSubscription, R2Error>
    where
        T: Send + 'static,
        H: EventHandler<T>,
    {
        if self.is_closed() {
            return Err(R2Error::Closed);
        }
        if !self.supports_events {
            return Err(R2Error::Unsupported {
                feature: "event subscription",
                transport: self.kind.name(),
            });
        }

        let path = self.execute(STDERR_COMMAND).await?;
        let subscription = events::subscribe(
            Path::new(&path),
            event_name,
            user_data,
            handler,
            self.event_poll_interval,
        )
        .await?;

        self.subscriptions
            .lock()
            .await
            .push(subscription.stop_flag());
        // A close that raced with this call has already drained the list
        if self.is_closed() {
            subscription.cancel();
        }
        Ok(subscription)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::EventAction;
    use crate::transport::fake_native;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// Replays canned responses and records commands
    struct Scripted {
        responses: VecDeque<&'static str>,
        sent: Arc<std::sync::Mutex<Vec<String>>>,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn execute(&mut self, command: &str) -> Result<String, R2Error> {
            self.sent.lock().unwrap().push(command.to_string());
            Ok(self.responses.pop_front().unwrap_or_default().to_string())
        }

        async fn shutdown(&mut self, _mode: ShutdownMode) -> Result<(), R2Error> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Custom
        }
    }

    fn scripted(
        responses: &[&'static str],
    ) -> (Session, Arc<std::sync::Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let transport = Scripted {
            responses: responses.iter().copied().collect(),
            sent: Arc::clone(&sent),
            shutdowns: Arc::clone(&shutdowns),
        };
        (
            Session::with_transport("test://", Box::new(transport)),
            sent,
            shutdowns,
        )
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Offset {
        offset: u64,
        current: bool,
    }

    #[tokio::test]
    async fn test_execute_delegates() {
        let (r2, sent, _) = scripted(&["Hello World"]);
        assert_eq!(r2.execute("ps").await.unwrap(), "Hello World");
        assert_eq!(*sent.lock().unwrap(), vec!["ps".to_string()]);
        assert_eq!(r2.target(), "test://");
        assert_eq!(r2.transport_kind(), TransportKind::Custom);
    }

    #[tokio::test]
    async fn test_execute_formatted() {
        let (r2, sent, _) = scripted(&[""]);
        crate::cmdf!(r2, "s {:#x}", 0x1000).await.unwrap();
        assert_eq!(*sent.lock().unwrap(), vec!["s 0x1000".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_json_value() {
        let (r2, _, _) = scripted(&[r#"{"offset":16,"current":true,"list":[1,2]}"#]);
        let value = r2.execute_json("sj").await.unwrap();
        assert_eq!(
            value,
            serde_json::json!({"offset": 16, "current": true, "list": [1, 2]})
        );
    }

    #[tokio::test]
    async fn test_execute_json_malformed_is_decode_error() {
        let (r2, _, _) = scripted(&["{not json"]);
        let err = r2.execute_json("sj").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(matches!(err, R2Error::JsonDecode { ref command, .. } if command == "sj"));
    }

    #[tokio::test]
    async fn test_execute_json_empty_is_decode_error() {
        let (r2, _, _) = scripted(&[""]);
        assert!(matches!(
            r2.execute_json("sj").await,
            Err(R2Error::JsonDecode { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_json_into_shape() {
        let (r2, _, _) = scripted(&[r#"{"offset":256,"current":false}"#]);
        let offset: Offset = r2.execute_json_into("sj").await.unwrap();
        assert_eq!(
            offset,
            Offset {
                offset: 256,
                current: false
            }
        );
    }

    #[tokio::test]
    async fn test_execute_json_into_shape_mismatch() {
        let (r2, _, _) = scripted(&[r#"{"offset":"high","current":false}"#]);
        let result: Result<Offset, _> = r2.execute_json_into("sj").await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_formatted_json_variants() {
        let (r2, sent, _) = scripted(&["[1,2,3]", r#"{"offset":0,"current":true}"#]);
        let list = r2
            .execute_json_formatted(format_args!("pxj {} @ {}", 3, 0))
            .await
            .unwrap();
        assert_eq!(list, serde_json::json!([1, 2, 3]));

        let offset: Offset = r2
            .execute_json_into_formatted(format_args!("sj ~{{{}}}", 0))
            .await
            .unwrap();
        assert!(offset.current);
        assert_eq!(
            *sent.lock().unwrap(),
            vec!["pxj 3 @ 0".to_string(), "sj ~{0}".to_string()]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (r2, _, shutdowns) = scripted(&[]);
        r2.close().await.unwrap();
        r2.close().await.unwrap();
        r2.force_close().await.unwrap();
        assert!(r2.is_closed());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_after_close() {
        let (r2, sent, _) = scripted(&["x"]);
        r2.close().await.unwrap();
        let err = r2.execute("ps").await.unwrap_err();
        assert!(matches!(err, R2Error::Closed));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_on_requires_event_support() {
        let (r2, sent, _) = scripted(&[]);
        let err = r2
            .on("errmsg", (), |_: &str, _: &mut (), _: &str| EventAction::Stop)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_on_native_transport_is_capability_error() {
        let transport = DynamicTransport::with_api(fake_native::api(), "")
            .await
            .unwrap();
        let r2 = Session::with_transport("", Box::new(transport));
        let err = r2
            .on("errmsg", (), |_: &str, _: &mut (), _: &str| EventAction::Stop)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            R2Error::Unsupported {
                transport: "dynamic native",
                ..
            }
        ));
        // The core never saw the side-channel command
        assert_eq!(r2.execute("history").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_native_session_close_then_execute() {
        let transport = DynamicTransport::with_api(fake_native::api(), "malloc://16")
            .await
            .unwrap();
        let r2 = Session::with_transport("malloc://16", Box::new(transport));
        assert_eq!(r2.execute("?e hi").await.unwrap(), "hi\n");
        r2.close().await.unwrap();
        r2.close().await.unwrap();
        assert!(matches!(r2.execute("?e hi").await, Err(R2Error::Closed)));
    }

    #[tokio::test]
    async fn test_pipe_access_needs_a_pipe() {
        let (r2, _, _) = scripted(&[]);
        let err = r2.pipe().await.unwrap_err();
        assert!(matches!(
            err,
            R2Error::Unsupported {
                feature: "raw pipe access",
                transport: "custom",
            }
        ));

        r2.close().await.unwrap();
        assert!(matches!(r2.pipe().await.unwrap_err(), R2Error::Closed));
    }

    #[tokio::test]
    async fn test_pipe_access_over_streams() {
        let (client, mut server) = tokio::io::duplex(256);
        let (read_half, write_half) = tokio::io::split(client);
        let transport = PipeTransport::from_streams(read_half, write_half, TransportKind::Custom);
        let r2 = Session::with_transport("", Box::new(transport));

        {
            let mut pipe = r2.pipe().await.unwrap();
            pipe.send_raw(b"?e raw\n").await.unwrap();

            let mut line = [0u8; 7];
            tokio::io::AsyncReadExt::read_exact(&mut server, &mut line)
                .await
                .unwrap();
            assert_eq!(&line, b"?e raw\n");
            tokio::io::AsyncWriteExt::write_all(&mut server, b"raw\n\0")
                .await
                .unwrap();

            assert_eq!(pipe.read_frame().await.unwrap(), "raw");
        }

        r2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let responses: Vec<&'static str> = vec!["0", "1", "2", "3", "4", "5", "6", "7"];
        let (r2, sent, _) = scripted(&responses);
        let r2 = Arc::new(r2);

        let mut handles = Vec::new();
        for i in 0..8 {
            let r2 = Arc::clone(&r2);
            handles.push(tokio::spawn(async move {
                r2.execute(&format!("cmd{}", i)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Each command consumed exactly one response, in arrival order
        assert_eq!(sent.lock().unwrap().len(), 8);
    }

    #[test]
    fn test_session_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Session>();
    }
}
