//! Byte-stream transport over radare2's stdin/stdout
//!
//! This module provides [`PipeTransport`], which either spawns `radare2 -q0`
//! as a child process or reuses the descriptors a parent radare2 passed down
//! through `R2PIPE_IN`/`R2PIPE_OUT` (the `#!pipe` case).

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::R2Error;
use crate::options::SpawnOptions;
use crate::transport::framing::FrameReader;
use crate::transport::{R2Discovery, ShutdownMode, Transport, TransportKind};

/// Environment variable naming the descriptor responses are read from
pub const R2PIPE_IN: &str = "R2PIPE_IN";
/// Environment variable naming the descriptor commands are written to
pub const R2PIPE_OUT: &str = "R2PIPE_OUT";

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Transport that talks to radare2 over a pair of byte streams
///
/// # Process Lifecycle
///
/// 1. **Spawn** - `radare2 -q0 [extra args] <target>` with piped stdio
/// 2. **Handshake** - read and discard the first NUL-terminated frame
/// 3. **Commands** - write `cmd\n`, read one frame per command
/// 4. **Shutdown** - send `q` or `q!`, close stdin, wait for exit;
///    escalate to SIGTERM then SIGKILL if radare2 does not exit in time
///
/// With inherited descriptors there is no child: no handshake is read and
/// shutdown only drops the streams.
///
/// radare2's stderr is logged at `warn` unless
/// [`SpawnOptions::capture_stderr`] is set, in which case it is read with
/// [`read_err`](Self::read_err).
pub struct PipeTransport {
    /// Child process handle (None for inherited descriptors or after shutdown)
    child: Option<Child>,

    /// Command stream (None after shutdown)
    writer: Option<BoxedWriter>,

    /// Response stream
    reader: FrameReader<BoxedReader>,

    /// Child's stderr when captured
    stderr: Option<ChildStderr>,

    kind: TransportKind,

    shutdown_timeout: Duration,

    closed: bool,
}

impl PipeTransport {
    /// Spawn radare2 on `target` and complete the handshake
    ///
    /// # Errors
    ///
    /// - [`R2Error::NotFound`] if the executable does not exist
    /// - [`R2Error::Spawn`] if the process cannot be started or its pipes captured
    /// - [`R2Error::Handshake`] if radare2 exits before printing its first
    ///   terminator, e.g. because it could not open `target`
    pub async fn spawn(target: &str, options: &SpawnOptions) -> Result<Self, R2Error> {
        let r2_path = match &options.r2_path {
            Some(path) => path.clone(),
            None => R2Discovery::find(None).await?,
        };

        let mut child = Self::launch(&r2_path, target, options)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| R2Error::Spawn("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| R2Error::Spawn("failed to capture stdout".to_string()))?;
        let mut stderr = child.stderr.take();
        if !options.capture_stderr {
            if let Some(stream) = stderr.take() {
                Self::spawn_stderr_task(stream);
            }
        }

        let mut reader = FrameReader::new(Box::new(stdout) as BoxedReader);
        match reader.skip_frame().await {
            Ok(banner) => debug!("Handshake complete, discarded {} banner bytes", banner),
            Err(e) => {
                warn!("Handshake failed for target {:?}: {}", target, e);
                if let Err(kill_err) = child.kill().await {
                    debug!("Reaping child after failed handshake: {}", kill_err);
                }
                return Err(match e {
                    R2Error::Stream(io_err) => R2Error::Handshake(io_err),
                    other => other,
                });
            }
        }

        Ok(Self {
            child: Some(child),
            writer: Some(Box::new(stdin)),
            reader,
            stderr,
            kind: TransportKind::Spawned,
            shutdown_timeout: options.shutdown_timeout,
            closed: false,
        })
    }

    /// Use the descriptors named by `R2PIPE_IN` and `R2PIPE_OUT`
    ///
    /// This is how a script started by radare2 (`#!pipe`) talks back to its
    /// parent. `R2PIPE_IN` is read for responses, `R2PIPE_OUT` receives commands.
    ///
    /// # Errors
    ///
    /// - [`R2Error::MissingEnv`] if either variable is unset
    /// - [`R2Error::InvalidEnv`] if either is not a descriptor number
    pub fn from_env() -> Result<Self, R2Error> {
        let in_fd = parse_fd_var(R2PIPE_IN, std::env::var(R2PIPE_IN).ok())?;
        let out_fd = parse_fd_var(R2PIPE_OUT, std::env::var(R2PIPE_OUT).ok())?;
        Self::from_raw_fds(in_fd, out_fd)
    }

    #[cfg(unix)]
    fn from_raw_fds(in_fd: i32, out_fd: i32) -> Result<Self, R2Error> {
        use std::os::fd::FromRawFd;

        debug!("Using inherited descriptors in={} out={}", in_fd, out_fd);

        // SAFETY: the parent radare2 hands these descriptors to this process
        // for its exclusive use; nothing else in the process owns them.
        let (input, output) = unsafe {
            (
                std::fs::File::from_raw_fd(in_fd),
                std::fs::File::from_raw_fd(out_fd),
            )
        };

        Ok(Self::from_streams(
            tokio::fs::File::from_std(input),
            tokio::fs::File::from_std(output),
            TransportKind::Inherited,
        ))
    }

    #[cfg(not(unix))]
    fn from_raw_fds(_in_fd: i32, _out_fd: i32) -> Result<Self, R2Error> {
        Err(R2Error::Spawn(
            "inherited descriptors are only supported on unix".to_string(),
        ))
    }

    /// Build a transport over already-connected streams
    ///
    /// No handshake is read. Shutdown drops the streams without sending a
    /// quit command, like the inherited-descriptor mode.
    pub fn from_streams<R, W>(reader: R, writer: W, kind: TransportKind) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        Self {
            child: None,
            writer: Some(Box::new(writer)),
            reader: FrameReader::new(Box::new(reader)),
            stderr: None,
            kind,
            shutdown_timeout: SpawnOptions::default().shutdown_timeout,
            closed: false,
        }
    }

    /// Write raw bytes to the command stream without reading a response
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), R2Error> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| R2Error::Misuse("pipe transport is shut down".to_string()))?;

        trace!("Writing {} bytes to radare2", bytes.len());
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next response frame
    pub async fn read_frame(&mut self) -> Result<String, R2Error> {
        self.reader.read_frame().await
    }

    /// Read from radare2's stderr
    ///
    /// Waits until some bytes are available and returns how many were read;
    /// `Ok(0)` means the stream is closed.
    ///
    /// # Errors
    ///
    /// - [`R2Error::Misuse`] unless the transport was spawned with
    ///   [`SpawnOptions::capture_stderr`]
    /// - [`R2Error::Stream`] if the read fails
    pub async fn read_err(&mut self, buf: &mut [u8]) -> Result<usize, R2Error> {
        let stderr = self
            .stderr
            .as_mut()
            .ok_or_else(|| R2Error::Misuse("stderr is not captured".to_string()))?;
        Ok(stderr.read(buf).await?)
    }

    /// OS process id of the spawned radare2, if any
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn launch(r2_path: &Path, target: &str, options: &SpawnOptions) -> Result<Child, R2Error> {
        let args = options.to_args(target);
        debug!("Spawning radare2: {} {:?}", r2_path.display(), args);

        let mut cmd = Command::new(r2_path);
        cmd.args(&args)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                R2Error::NotFound
            } else {
                R2Error::Spawn(e.to_string())
            }
        })?;

        debug!("radare2 spawned with pid: {:?}", child.id());
        Ok(child)
    }

    /// Drain stderr so radare2 never blocks on a full pipe
    fn spawn_stderr_task(stderr: ChildStderr) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("radare2 stderr: {}", line);
            }
            debug!("radare2 stderr closed");
        });
    }

    async fn quit_and_wait(&mut self, mode: ShutdownMode) -> Result<(), R2Error> {
        if let Some(mut writer) = self.writer.take() {
            let quit = format!("{}\n", mode.quit_command());
            let sent = async {
                writer.write_all(quit.as_bytes()).await?;
                writer.flush().await?;
                writer.shutdown().await
            };
            if let Err(e) = sent.await {
                // radare2 may already be gone; the wait below reports how it ended
                debug!("Sending {:?} failed: {}", mode.quit_command(), e);
            }
        }

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("radare2 exited with status: {:?}", status);
                if status.success() {
                    Ok(())
                } else {
                    Err(R2Error::Process {
                        code: status.code().unwrap_or(-1),
                    })
                }
            }
            Ok(Err(e)) => Err(R2Error::Stream(e)),
            Err(_) => {
                warn!("radare2 did not exit within {:?}, terminating", self.shutdown_timeout);
                terminate(child, self.shutdown_timeout).await;
                Ok(())
            }
        }
    }
}

/// SIGTERM, then SIGKILL if the process outlives `grace`
async fn terminate(mut child: Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to pid {}", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to pid {} failed: {}", pid, e);
            }

            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("radare2 exited after SIGTERM: {:?}", status);
                    return;
                }
                Ok(Err(e)) => warn!("Error waiting after SIGTERM: {}", e),
                Err(_) => warn!("SIGTERM timed out, sending SIGKILL"),
            }
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill radare2: {}", e);
    }
}

fn parse_fd_var(name: &'static str, value: Option<String>) -> Result<i32, R2Error> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or(R2Error::MissingEnv(name))?;
    match value.trim().parse::<i32>() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => Err(R2Error::InvalidEnv { name, value }),
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn execute(&mut self, command: &str) -> Result<String, R2Error> {
        trace!("-> {}", command);
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        self.send_raw(&line).await?;

        let response = self.reader.read_frame().await?;
        trace!("<- {} bytes", response.len());
        Ok(response)
    }

    async fn shutdown(&mut self, mode: ShutdownMode) -> Result<(), R2Error> {
        if self.closed {
            debug!("Pipe transport already shut down");
            return Ok(());
        }
        self.closed = true;

        if self.kind != TransportKind::Spawned {
            debug!("No child process to reap; dropping streams");
            self.writer = None;
            return Ok(());
        }

        debug!("Shutting down radare2 with {:?}", mode.quit_command());
        self.quit_and_wait(mode).await
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_events(&self) -> bool {
        true
    }

    fn as_pipe_mut(&mut self) -> Option<&mut PipeTransport> {
        Some(self)
    }
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("kind", &self.kind)
            .field("pid", &self.pid())
            .field("stderr_captured", &self.stderr.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        // kill_on_drop reaps a child that was never shut down
        if !self.closed {
            debug!("PipeTransport dropped without shutdown");
        }
    }
}
