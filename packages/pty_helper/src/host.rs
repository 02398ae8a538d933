//! Controller side of the helper: spawn it with the four channels wired in
//! fixed order and turn its traffic into [`TerminalHost`] callbacks.

use std::ffi::OsString;
use std::fmt;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::unistd::{dup2, pipe2};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pty_bridge::{BridgeError, Channel, FdStream, ResizeDirective, WindowSize};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to launch helper: {0}")]
    Launch(#[source] std::io::Error),
    #[error(transparent)]
    InvalidSize(#[from] BridgeError),
    #[error("helper is no longer running")]
    Gone,
}

/// How the helper process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostExit {
    Exited(i32),
    Signaled(i32),
    /// The helper's wait status could not be collected
    Unknown,
}

impl HostExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => HostExit::Exited(code),
            (None, Some(sig)) => HostExit::Signaled(sig),
            (None, None) => HostExit::Unknown,
        }
    }
}

impl fmt::Display for HostExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostExit::Exited(code) => write!(f, "exited with code {code}"),
            HostExit::Signaled(sig) => write!(f, "killed by signal {sig}"),
            HostExit::Unknown => f.write_str("ended with unknown status"),
        }
    }
}

/// Callbacks for one helper session, all run on the driver task.
pub trait TerminalHost: Send {
    fn on_start(&mut self, handle: HelperHandle);
    fn on_output(&mut self, data: &[u8]);
    fn on_diagnostic(&mut self, _data: &[u8]) {}
    /// Called exactly once, after Output and Diagnostics reached end-of-file.
    fn on_terminated(&mut self, exit: HostExit);
}

#[derive(Debug)]
enum Request {
    Input(Vec<u8>),
    Resize(WindowSize),
    Close,
    Kill,
}

/// Cheap to clone; requests are queued to the driver in order. Dropping every
/// handle closes the Input channel.
#[derive(Clone, Debug)]
pub struct HelperHandle {
    pid: u32,
    requests: mpsc::UnboundedSender<Request>,
}

impl HelperHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn write_input(&self, data: impl Into<Vec<u8>>) -> Result<(), HostError> {
        self.send(Request::Input(data.into()))
    }

    pub fn request_resize(&self, rows: u32, cols: u32) -> Result<(), HostError> {
        let size = WindowSize::new(rows, cols)?;
        self.send(Request::Resize(size))
    }

    /// Close the Input channel; the helper winds the shell down.
    pub fn request_close(&self) -> Result<(), HostError> {
        self.send(Request::Close)
    }

    pub fn kill(&self) -> Result<(), HostError> {
        self.send(Request::Kill)
    }

    fn send(&self, request: Request) -> Result<(), HostError> {
        self.requests.send(request).map_err(|_| HostError::Gone)
    }
}

/// What to launch and with which environment.
#[derive(Clone, Debug)]
pub struct HelperCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub term: String,
    pub colorterm: String,
    /// Sent as the first directive right after start
    pub initial_size: Option<WindowSize>,
}

impl HelperCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            term: "xterm-256color".to_string(),
            colorterm: "truecolor".to_string(),
            initial_size: None,
        }
    }

    /// Spawn the helper with Input, Output, Diagnostics and Control on fds 0-3.
    fn spawn(&self) -> std::io::Result<(Child, FdStream)> {
        let (control_rx, control_tx) = pipe2(OFlag::O_CLOEXEC)?;
        let control_fd = control_rx.as_raw_fd();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("TERM", &self.term)
            .env("COLORTERM", &self.colorterm)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                let target = Channel::Control.fd();
                if control_fd == target {
                    fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
                } else {
                    dup2(control_fd, target)?;
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        drop(control_rx);
        Ok((child, FdStream::new(control_tx)?))
    }
}

/// Launch the helper and drive `host` until the helper has exited.
pub async fn run<H: TerminalHost>(command: HelperCommand, mut host: H) -> Result<HostExit, HostError> {
    let (mut child, control) = command.spawn().map_err(HostError::Launch)?;
    let pid = child.id().unwrap_or_default();
    info!("Started helper {}", pid);

    let mut input = Outbox::new(child.stdin.take());
    let mut control = Outbox::new(Some(control));
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(HostError::Launch(std::io::Error::other("helper pipes missing")));
    };

    let (tx, mut requests) = mpsc::unbounded_channel();
    let handle = HelperHandle { pid, requests: tx };
    if let Some(size) = command.initial_size {
        let _ = handle.send(Request::Resize(size));
    }
    host.on_start(handle);

    let mut out_buf = vec![0u8; 8192];
    let mut err_buf = vec![0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;
    let mut requests_open = true;
    let mut exit = None;

    // Writes get their own branches so a helper that is slow to take input
    // never stops us from reading what it produces.
    while out_open || err_open || exit.is_none() {
        let write_input = input.has_pending();
        let write_control = control.has_pending();
        tokio::select! {
            result = stdout.read(&mut out_buf), if out_open => match result {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => host.on_output(&out_buf[..n]),
            },
            result = stderr.read(&mut err_buf), if err_open => match result {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => host.on_diagnostic(&err_buf[..n]),
            },
            result = write_some(input.split()), if write_input => {
                input.written(result, Channel::Input);
            },
            result = write_some(control.split()), if write_control => {
                control.written(result, Channel::Control);
            },
            request = requests.recv(), if requests_open => match request {
                Some(Request::Input(data)) => input.push(&data),
                Some(Request::Resize(size)) => {
                    control.push(ResizeDirective::from(size).encode().as_bytes());
                }
                Some(Request::Close) => input.close(),
                Some(Request::Kill) => {
                    if let Err(e) = child.start_kill() {
                        debug!("Helper already gone: {}", e);
                    }
                }
                None => {
                    // Nobody can write any more.
                    requests_open = false;
                    input.close();
                }
            },
            status = child.wait(), if exit.is_none() => {
                let status = match status {
                    Ok(status) => HostExit::from_status(status),
                    Err(e) => {
                        warn!("Failed to wait for helper {}: {}", pid, e);
                        HostExit::Unknown
                    }
                };
                debug!("Helper {} {}", pid, status);
                input.abort();
                control.abort();
                exit = Some(status);
            },
        }
    }

    let exit = exit.unwrap_or(HostExit::Unknown);
    host.on_terminated(exit);
    Ok(exit)
}

// Sent bytes are compacted away once this much has piled up in front.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Bytes queued for one of the helper's inbound pipes.
struct Outbox<W> {
    pipe: Option<W>,
    queued: Vec<u8>,
    sent: usize,
    close_when_flushed: bool,
}

impl<W> Outbox<W> {
    fn new(pipe: Option<W>) -> Self {
        Self {
            pipe,
            queued: Vec::new(),
            sent: 0,
            close_when_flushed: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        if self.pipe.is_some() && !self.close_when_flushed {
            self.queued.extend_from_slice(data);
        }
    }

    fn has_pending(&self) -> bool {
        self.pipe.is_some() && self.sent < self.queued.len()
    }

    fn split(&mut self) -> (Option<&mut W>, &[u8]) {
        (self.pipe.as_mut(), &self.queued[self.sent..])
    }

    fn written(&mut self, result: std::io::Result<usize>, channel: Channel) {
        match result {
            Ok(0) => {
                debug!("{} channel refused more bytes", channel);
                self.abort();
            }
            Ok(n) => self.advance(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("{} channel closed: {}", channel, e);
                self.abort();
            }
        }
    }

    fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.queued.len());
        if self.sent == self.queued.len() {
            self.queued.clear();
            self.sent = 0;
            if self.close_when_flushed {
                self.pipe = None;
            }
        } else if self.sent >= COMPACT_THRESHOLD {
            self.queued.drain(..self.sent);
            self.sent = 0;
        }
    }

    /// Close once everything queued so far has been written.
    fn close(&mut self) {
        if self.queued.is_empty() {
            self.pipe = None;
        } else {
            self.close_when_flushed = true;
        }
    }

    /// Close now, dropping anything unsent.
    fn abort(&mut self) {
        self.pipe = None;
        self.queued.clear();
        self.sent = 0;
    }
}

async fn write_some<W: AsyncWrite + Unpin>(
    (pipe, data): (Option<&mut W>, &[u8]),
) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.write(data).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_exit_display() {
        assert_eq!(HostExit::Exited(7).to_string(), "exited with code 7");
        assert_eq!(HostExit::Signaled(9).to_string(), "killed by signal 9");
    }

    #[test]
    fn unknown_status_is_explicit() {
        assert_eq!(HostExit::Unknown.to_string(), "ended with unknown status");
    }

    #[test]
    fn outbox_closes_only_after_flushing() {
        let mut outbox = Outbox::new(Some(()));
        outbox.push(b"hello");
        outbox.close();
        assert!(outbox.has_pending());
        // Queued after close is refused.
        outbox.push(b"late");

        outbox.written(Ok(3), Channel::Input);
        assert_eq!(outbox.split().1, b"lo");
        assert!(outbox.pipe.is_some());
        outbox.written(Ok(2), Channel::Input);
        assert!(!outbox.has_pending());
        assert!(outbox.pipe.is_none());
    }

    #[test]
    fn outbox_compacts_large_backlog() {
        let mut outbox = Outbox::new(Some(()));
        outbox.push(&vec![b'a'; COMPACT_THRESHOLD + 10]);
        outbox.written(Ok(COMPACT_THRESHOLD), Channel::Input);
        assert_eq!(outbox.sent, 0);
        assert_eq!(outbox.split().1.len(), 10);
    }

    #[test]
    fn outbox_write_error_drops_backlog() {
        let mut outbox = Outbox::new(Some(()));
        outbox.push(b"data");
        outbox.written(Err(std::io::ErrorKind::BrokenPipe.into()), Channel::Control);
        assert!(!outbox.has_pending());
        assert!(outbox.pipe.is_none());
    }

    #[test]
    fn resize_is_validated_before_sending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = HelperHandle { pid: 1, requests: tx };
        assert!(matches!(
            handle.request_resize(0, 80),
            Err(HostError::InvalidSize(BridgeError::InvalidSize { rows: 0, cols: 80 }))
        ));
        handle.request_resize(10, 40).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Request::Resize(WindowSize { rows: 10, cols: 40 })
        ));
    }

    #[test]
    fn requests_fail_once_driver_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = HelperHandle { pid: 1, requests: tx };
        drop(rx);
        assert!(matches!(handle.write_input("ls\n"), Err(HostError::Gone)));
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        struct Never;
        impl TerminalHost for Never {
            fn on_start(&mut self, _: HelperHandle) {
                panic!("started");
            }
            fn on_output(&mut self, _: &[u8]) {}
            fn on_terminated(&mut self, _: HostExit) {
                panic!("terminated");
            }
        }
        let err = run(HelperCommand::new("/nonexistent/pty-helper"), Never)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Launch(_)));
    }
}
