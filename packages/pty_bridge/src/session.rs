use std::cell::Cell;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{error, info, warn};

use crate::error::{BridgeError, Result};
use crate::fd::FdStream;

/// Shell used when neither the configuration nor `$SHELL` names one
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Largest row or column count accepted by [`WindowSize::new`]
pub const MAX_DIMENSION: u16 = 9999;

/// Terminal dimensions in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    /// Validated constructor: both dimensions must be in `1..=9999`.
    pub fn new(rows: u32, cols: u32) -> Result<Self> {
        let in_range = |n: u32| (1..=u32::from(MAX_DIMENSION)).contains(&n);
        if !in_range(rows) || !in_range(cols) {
            return Err(BridgeError::InvalidSize { rows, cols });
        }
        Ok(Self {
            rows: rows as u16,
            cols: cols as u16,
        })
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// The user's preferred shell: `$SHELL`, or [`DEFAULT_SHELL`] when unset.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SHELL.to_string())
}

/// Configuration for opening a PTY session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Shell executable; [`default_shell`] when `None`
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra variables layered over the inherited environment
    pub env: Vec<(String, String)>,
    pub size: WindowSize,
    pub term: String,
    pub colorterm: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            size: WindowSize::default(),
            term: "xterm-256color".to_string(),
            colorterm: "truecolor".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn shell_path(&self) -> String {
        self.shell.clone().unwrap_or_else(default_shell)
    }
}

/// A shell running on the subordinate side of a PTY pair.
///
/// The session keeps only the controlling side. All I/O on it is non-blocking
/// and driven by the tokio reactor; [`PtySession::close`] releases it without
/// signalling the shell.
pub struct PtySession {
    master: Option<Box<dyn MasterPty + Send>>,
    io: Option<FdStream>,
    pid: Pid,
    shell: String,
    size: Cell<WindowSize>,
}

impl PtySession {
    /// Allocate a PTY pair and spawn the configured shell on it.
    ///
    /// The shell gets the subordinate side as stdin, stdout, stderr and
    /// controlling terminal. Must be called from within a tokio runtime.
    pub fn open(config: &SessionConfig) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(config.size.to_pty_size())
            .map_err(|e| BridgeError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let shell = config.shell_path();
        let mut cmd = CommandBuilder::new(&shell);
        cmd.args(&config.args);

        if let Some(dir) = &config.working_dir {
            info!("Setting working directory: {}", dir.display());
            cmd.cwd(dir);
        }

        // Advertise color capability to the shell and everything it runs
        cmd.env("TERM", &config.term);
        cmd.env("COLORTERM", &config.colorterm);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!("Spawning shell {} with args {:?}", shell, config.args);
        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn shell '{}': {}", shell, e);
            BridgeError::SpawnFailed(format!("{shell}: {e}"))
        })?;
        // Only the shell may hold the subordinate side, otherwise the master
        // never reports end-of-file.
        drop(pair.slave);

        let pid = match child.process_id() {
            Some(pid) => Pid::from_raw(pid as i32),
            None => {
                abandon(&mut *child);
                return Err(BridgeError::SpawnFailed(format!(
                    "{shell}: no process id for spawned shell"
                )));
            }
        };

        let io = match attach(&*pair.master) {
            Ok(io) => io,
            Err(e) => {
                abandon(&mut *child);
                return Err(BridgeError::SpawnFailed(format!(
                    "failed to register PTY master: {e}"
                )));
            }
        };

        info!("Shell started with PID {} at {}", pid, config.size);
        Ok(Self {
            master: Some(pair.master),
            io: Some(io),
            pid,
            shell,
            size: Cell::new(config.size),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Last size applied through [`PtySession::set_size`] (or the initial size).
    pub fn size(&self) -> WindowSize {
        self.size.get()
    }

    /// Size as currently recorded by the kernel for this terminal.
    pub fn kernel_size(&self) -> Result<WindowSize> {
        let master = self.master.as_ref().ok_or(BridgeError::SessionClosed)?;
        let size = master
            .get_size()
            .map_err(|e| BridgeError::PtyFault(io::Error::other(e.to_string())))?;
        Ok(WindowSize {
            rows: size.rows,
            cols: size.cols,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    fn stream(&self) -> Result<&FdStream> {
        self.io.as_ref().ok_or(BridgeError::SessionClosed)
    }

    /// Read whatever shell output is buffered right now.
    ///
    /// Returns `Ok(0)` when nothing is available in this cycle and
    /// [`BridgeError::SessionClosed`] once the shell is gone and its output
    /// drained.
    pub fn read_available(&self, buf: &mut [u8]) -> Result<usize> {
        match self.stream()?.try_read(buf) {
            Ok(0) => Err(BridgeError::SessionClosed),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(classify(e)),
        }
    }

    /// Wait for shell output. Never returns `Ok(0)`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.stream()?.read(buf).await {
            Ok(0) => Err(BridgeError::SessionClosed),
            Ok(n) => Ok(n),
            Err(e) => Err(classify(e)),
        }
    }

    /// Forward bytes to the shell's input, returning how many were accepted.
    ///
    /// Callers retry the remainder until flushed.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        match self.stream()?.write(data).await {
            Ok(0) if !data.is_empty() => Err(BridgeError::SessionClosed),
            Ok(n) => Ok(n),
            Err(e) => Err(classify(e)),
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Change the terminal size.
    ///
    /// The kernel delivers SIGWINCH to the shell's foreground process group.
    /// Applying the size already in effect is harmless.
    pub fn set_size(&self, rows: u32, cols: u32) -> Result<()> {
        let size = WindowSize::new(rows, cols)?;
        let master = self.master.as_ref().ok_or(BridgeError::SessionClosed)?;
        master.resize(size.to_pty_size()).map_err(|e| {
            warn!("Failed to resize PTY to {}: {}", size, e);
            BridgeError::PtyFault(io::Error::other(e.to_string()))
        })?;
        self.size.set(size);
        Ok(())
    }

    /// Release the controlling side. The shell is not signalled; it sees a
    /// hangup once the last controlling descriptor is gone.
    pub fn close(&mut self) {
        if self.io.take().is_some() {
            info!("Closing PTY for shell PID {}", self.pid);
        }
        self.master = None;
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Duplicate the master descriptor into a non-blocking stream we own.
fn attach(master: &dyn MasterPty) -> io::Result<FdStream> {
    let raw = master
        .as_raw_fd()
        .ok_or_else(|| io::Error::other("PTY master has no descriptor"))?;
    // SAFETY: `raw` belongs to `master`, which outlives this borrow; the
    // duplicate is owned independently.
    let owned = unsafe { BorrowedFd::borrow_raw(raw) }.try_clone_to_owned()?;
    FdStream::new(owned)
}

/// Kill and reap a child whose session could not be completed.
fn abandon(child: &mut (dyn Child + Send + Sync)) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill partially started shell: {}", e);
    }
    let _ = child.wait();
}

/// Linux reports `EIO` on the master once every subordinate descriptor closed.
fn classify(e: io::Error) -> BridgeError {
    if e.raw_os_error() == Some(Errno::EIO as i32) {
        BridgeError::SessionClosed
    } else {
        BridgeError::PtyFault(e)
    }
}
