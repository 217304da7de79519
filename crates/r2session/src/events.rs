//! Side-channel event subscriptions
//!
//! radare2 can report diagnostics out of band: the `===stderr` command
//! answers with the path of a file that receives its error output. A
//! subscription opens that file and tails it on a background task, handing
//! each batch of new text to an [`EventHandler`] until the handler returns
//! [`EventAction::Stop`] or reading the file fails.
//!
//! # Limitations
//!
//! Delivery is best effort. Text that arrives while the handler is running is
//! delivered in the next batch; nothing bounds how much accumulates, and
//! there is no backpressure on radare2. A multibyte character split across
//! two reads is held back until it is complete.
//!
//! # Example
//!
//! ```rust,no_run
//! use r2session::events::EventAction;
//! use r2session::session::Session;
//!
//! # async fn example() -> Result<(), r2session::error::R2Error> {
//! let r2 = Session::open("/bin/ls").await?;
//! let subscription = r2.on("errmsg", 0usize, |event: &str, seen: &mut usize, text: &str| {
//!     *seen += 1;
//!     eprintln!("[{}] {}", event, text);
//!     if *seen < 10 { EventAction::Continue } else { EventAction::Stop }
//! }).await?;
//!
//! r2.execute("aaa").await?;
//! # drop(subscription);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::R2Error;

/// Command that makes radare2 reply with its side-channel path
pub const STDERR_COMMAND: &str = "===stderr";

/// What a handler wants after seeing a batch of text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Keep tailing
    Continue,
    /// End the subscription and close the file
    Stop,
}

/// Receives side-channel text
///
/// Implemented for any `FnMut(&str, &mut T, &str) -> EventAction` closure
/// taking the event name, the subscription's user data, and the new text.
pub trait EventHandler<T>: Send + 'static {
    /// Handle one batch of text
    fn handle(&mut self, event: &str, user_data: &mut T, text: &str) -> EventAction;
}

impl<T, F> EventHandler<T> for F
where
    F: FnMut(&str, &mut T, &str) -> EventAction + Send + 'static,
{
    fn handle(&mut self, event: &str, user_data: &mut T, text: &str) -> EventAction {
        self(event, user_data, text)
    }
}

/// Shared stop signal, checked by the tail task between cycles
#[derive(Debug, Clone, Default)]
pub(crate) struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub(crate) fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running side-channel tail
///
/// The task ends when its handler returns [`EventAction::Stop`], the file
/// becomes unreadable, [`cancel`](Self::cancel) is called, or the session that
/// created it is closed. Dropping the subscription detaches the task without
/// stopping it.
#[derive(Debug)]
pub struct EventSubscription {
    event: String,
    stop: StopFlag,
    task: JoinHandle<()>,
}

impl EventSubscription {
    /// Name given when subscribing
    pub fn event_name(&self) -> &str {
        &self.event
    }

    /// Ask the task to stop before its next read
    pub fn cancel(&self) {
        self.stop.stop();
    }

    pub(crate) fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Whether the background task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the background task to end
    pub async fn join(self) -> Result<(), R2Error> {
        self.task
            .await
            .map_err(|e| R2Error::Stream(std::io::Error::other(e)))
    }
}

/// Open `path` and start tailing it
pub(crate) async fn subscribe<T, H>(
    path: &Path,
    event: &str,
    user_data: T,
    handler: H,
    poll_interval: Duration,
) -> Result<EventSubscription, R2Error>
where
    T: Send + 'static,
    H: EventHandler<T>,
{
    let file = tokio::fs::File::open(path).await?;
    debug!("Tailing {} for '{}' events", path.display(), event);

    let name = event.to_string();
    let stop = StopFlag::default();
    let task = tokio::spawn(tail(
        file,
        name.clone(),
        user_data,
        handler,
        poll_interval,
        stop.clone(),
    ));
    Ok(EventSubscription {
        event: name,
        stop,
        task,
    })
}

/// Length of the prefix of `buf` that ends on a character boundary
fn complete_prefix(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => buf.len(),
    }
}

async fn tail<R, T, H>(
    mut source: R,
    event: String,
    mut user_data: T,
    mut handler: H,
    poll_interval: Duration,
    stop: StopFlag,
) where
    R: tokio::io::AsyncRead + Unpin,
    H: EventHandler<T>,
{
    let mut buf = Vec::new();
    while !stop.is_stopped() {
        if let Err(e) = source.read_to_end(&mut buf).await {
            debug!("'{}' side channel closed: {}", event, e);
            return;
        }

        let complete = complete_prefix(&buf);
        if complete == 0 {
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        let action = {
            let text = String::from_utf8_lossy(&buf[..complete]);
            handler.handle(&event, &mut user_data, &text)
        };
        match action {
            EventAction::Continue => {
                buf.drain(..complete);
            }
            EventAction::Stop => {
                debug!("'{}' handler stopped the subscription", event);
                return;
            }
        }
    }
    debug!("'{}' subscription cancelled", event);
}
