//! NUL-terminated response framing
//!
//! radare2 started with `-q0` ends every response with a single `0x00` byte.
//! There is no length prefix and no escaping, so a frame is simply every byte
//! up to the next terminator. [`FrameReader`] reads exactly one frame per call
//! and never hands out a partial one: if the stream ends or fails before the
//! terminator shows up, the whole read is an error.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, trace};

use crate::error::R2Error;

/// Byte that terminates every radare2 response
pub const TERMINATOR: u8 = 0x00;

/// Reads NUL-terminated frames from a byte stream
///
/// The reader is strictly call-and-response: each [`read_frame`](Self::read_frame)
/// consumes bytes up to and including one terminator and nothing past it.
/// Pipelining several commands before reading their responses is not supported.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte stream
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Read the next frame and return its decoded text
    ///
    /// Trailing newlines and NUL bytes are stripped from the right edge only.
    ///
    /// # Errors
    ///
    /// [`R2Error::Stream`] if the stream fails or closes before a terminator.
    pub async fn read_frame(&mut self) -> Result<String, R2Error> {
        let payload = self.read_payload().await?;
        Ok(decode_frame(&payload))
    }

    /// Read and discard the next frame, returning its payload length
    pub async fn skip_frame(&mut self) -> Result<usize, R2Error> {
        Ok(self.read_payload().await?.len())
    }

    async fn read_payload(&mut self) -> Result<Vec<u8>, R2Error> {
        let mut buf = Vec::new();
        let read = self.inner.read_until(TERMINATOR, &mut buf).await.map_err(|e| {
            error!("Frame read failed: {}", e);
            R2Error::Stream(e)
        })?;

        if buf.last() != Some(&TERMINATOR) {
            error!("Stream closed after {} bytes without a terminator", read);
            return Err(R2Error::Stream(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {} bytes without a terminator", read),
            )));
        }

        buf.pop();
        trace!("Read frame of {} bytes", buf.len());
        Ok(buf)
    }

    /// Unwrap the underlying reader, dropping any buffered bytes
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

/// Turn a raw frame payload into a response string
///
/// Strips trailing `\n` and `\0` bytes; interior bytes are kept. Invalid UTF-8
/// is replaced rather than rejected since radare2 may print raw bytes.
pub fn decode_frame(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .rposition(|b| *b != b'\n' && *b != TERMINATOR)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
