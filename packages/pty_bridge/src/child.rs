//! Asynchronous observation and signalling of the shell process.

use std::fmt;
use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{debug, warn};

// SIGCHLD delivered before the handler was installed is lost, so the watcher
// also polls at this interval.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(250);

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminal status of the shell, produced exactly once when it is reaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given code
    Exited(i32),
    /// Terminated by the given signal number
    Signaled(i32),
}

impl ExitStatus {
    fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(ExitStatus::Signaled(sig as i32)),
            _ => None,
        }
    }

    pub fn code(self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(code),
            ExitStatus::Signaled(_) => None,
        }
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(sig) => Some(sig),
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ExitStatus::Exited(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signaled(sig) => match Signal::try_from(sig) {
                Ok(name) => write!(f, "killed by signal {sig} ({})", name.as_str()),
                Err(_) => write!(f, "killed by signal {sig}"),
            },
        }
    }
}

/// Watches one child process without blocking the event loop.
///
/// Wakes on SIGCHLD and reaps with a non-blocking `waitpid`, so the status is
/// collected as soon as the kernel has it and no zombie is left behind.
pub struct ChildWatcher {
    pid: Pid,
    sigchld: tokio::signal::unix::Signal,
    status: Option<ExitStatus>,
}

impl ChildWatcher {
    /// Must be called from within a tokio runtime.
    pub fn new(pid: Pid) -> io::Result<Self> {
        Ok(Self {
            pid,
            sigchld: unix_signal(SignalKind::child())?,
            status: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Status collected so far, if the child has been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Reap the child if it has terminated. Never blocks.
    pub fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                if let Some(exit) = ExitStatus::from_wait(status) {
                    debug!("Reaped shell {}: {}", self.pid, exit);
                    self.status = Some(exit);
                }
                Ok(self.status)
            }
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the child to terminate.
    ///
    /// Cancel-safe: a status reaped by a cancelled call is kept and returned by
    /// the next one.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.try_reap()? {
                return Ok(status);
            }
            tokio::select! {
                _ = self.sigchld.recv() => {}
                _ = tokio::time::sleep(REAP_POLL_INTERVAL) => {}
            }
        }
    }

    /// Send `sig` to the child. A child that is already gone is not an error.
    pub fn signal(&self, sig: Signal) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Last resort when no watcher could be created: kill, then poll for the status.
pub async fn kill_and_reap(pid: Pid) {
    match signal::kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill shell {}: {}", pid, e),
    }
    let reap = async {
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Err(Errno::EINTR) | Ok(_) => tokio::time::sleep(KILL_POLL_INTERVAL).await,
                Err(_) => break,
            }
        }
    };
    if tokio::time::timeout(KILL_REAP_TIMEOUT, reap).await.is_err() {
        warn!("Shell {} not reaped {:?} after SIGKILL", pid, KILL_REAP_TIMEOUT);
    }
}
