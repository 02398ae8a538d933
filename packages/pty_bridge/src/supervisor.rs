//! Lifecycle owner for one shell session.
//!
//! ```text
//! Starting ──spawn ok──▶ Running ──exit / stop──▶ Exiting ──reaped──▶ Terminated
//!     └───────────────spawn failed────────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::child::{ChildWatcher, ExitStatus, kill_and_reap};
use crate::error::BridgeError;
use crate::multiplexer::{LoopExit, Multiplexer, MuxConfig, hang_up};
use crate::session::{PtySession, SessionConfig};

/// End-of-transmission; the line discipline turns it into end-of-file.
const EOF_BYTE: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Exiting,
    Terminated,
}

/// What the supervisor reports upstream, exactly once
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalStatus {
    /// The shell ran and was reaped
    Shell(ExitStatus),
    /// The PTY or the shell could not be started
    SpawnFailed(String),
    /// The session ended without a usable shell status
    Failed(String),
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalStatus::Shell(status) => write!(f, "shell {status}"),
            FinalStatus::SpawnFailed(reason) => write!(f, "failed to start shell: {reason}"),
            FinalStatus::Failed(reason) => write!(f, "session failed: {reason}"),
        }
    }
}

/// Controller-facing ends handed to the supervisor.
pub struct Channels<I, O, C> {
    pub input: I,
    pub output: O,
    /// `None` when the controller did not provide a control channel
    pub control: Option<C>,
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub session: SessionConfig,
    pub mux: MuxConfig,
    /// How long each shutdown step waits for the shell before escalating
    pub grace_period: Duration,
    /// Tag in front of the final status line, e.g. `[pty-helper]`
    pub status_prefix: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            mux: MuxConfig::default(),
            grace_period: Duration::from_secs(2),
            status_prefix: "pty-helper".to_string(),
        }
    }
}

/// Escalating ways of getting the shell to exit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Nudge {
    Wait,
    Eof,
    Hangup,
    Kill,
}

impl fmt::Display for Nudge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Nudge::Wait => "waiting",
            Nudge::Eof => "end-of-file",
            Nudge::Hangup => "SIGHUP",
            Nudge::Kill => "SIGKILL",
        })
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    state: watch::Sender<SupervisorState>,
    stop: CancellationToken,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            config,
            state,
            stop: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Cancelling the token is an explicit stop request.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn transition(&self, next: SupervisorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Session {:?} -> {:?}", prev, next);
        }
    }

    /// Run the session to completion.
    ///
    /// Consumes the supervisor, so the final status is produced once. The
    /// status line is written to `diagnostics` after every other channel has
    /// been closed.
    pub async fn run<I, O, C, D>(self, channels: Channels<I, O, C>, diagnostics: &mut D) -> FinalStatus
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        C: AsyncRead + Unpin,
        D: AsyncWrite + Unpin,
    {
        self.transition(SupervisorState::Starting);
        let status = match PtySession::open(&self.config.session) {
            Ok(session) => self.supervise(session, channels).await,
            Err(BridgeError::SpawnFailed(reason)) => {
                error!("Failed to start shell: {}", reason);
                FinalStatus::SpawnFailed(reason)
            }
            Err(e) => FinalStatus::SpawnFailed(e.to_string()),
        };

        self.report(&status, diagnostics).await;
        self.transition(SupervisorState::Terminated);
        status
    }

    async fn supervise<I, O, C>(&self, mut session: PtySession, channels: Channels<I, O, C>) -> FinalStatus
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        C: AsyncRead + Unpin,
    {
        let mut child = match ChildWatcher::new(session.pid()) {
            Ok(child) => child,
            Err(e) => {
                error!("Cannot watch shell {}: {}", session.pid(), e);
                session.close();
                kill_and_reap(session.pid()).await;
                return FinalStatus::SpawnFailed(format!("cannot watch shell: {e}"));
            }
        };

        self.transition(SupervisorState::Running);
        let mut mux = Multiplexer::new(
            channels.input,
            channels.output,
            channels.control,
            self.config.mux.clone(),
        );
        let exit = mux.run(&session, &mut child, &self.stop).await;
        self.transition(SupervisorState::Exiting);

        let nudges: &[Nudge] = match &exit {
            LoopExit::ChildExited(_) | LoopExit::ChildLost(_) => &[],
            LoopExit::InputClosed => &[Nudge::Eof, Nudge::Hangup, Nudge::Kill],
            LoopExit::SessionClosed => &[Nudge::Wait, Nudge::Hangup, Nudge::Kill],
            LoopExit::StopRequested | LoopExit::ChannelClosed(_) | LoopExit::Fault(_) => {
                &[Nudge::Hangup, Nudge::Kill]
            }
        };
        debug!("Pump ended: {:?}", exit);

        let result = match exit {
            LoopExit::ChildExited(status) => Ok(status),
            LoopExit::ChildLost(e) => Err(format!("lost track of shell: {e}")),
            _ => self.shut_down(&mut mux, &session, &mut child, nudges).await,
        };

        let stats = mux.stats();
        info!(
            "Forwarded {} bytes to shell, {} bytes to controller, {} resizes ({} directives rejected)",
            stats.bytes_to_shell,
            stats.bytes_to_controller,
            stats.resizes_applied,
            stats.directives_rejected
        );

        // Release every descriptor before reporting.
        let mut output = mux.into_output();
        let _ = output.shutdown().await;
        drop(output);
        session.close();

        match result {
            Ok(status) => FinalStatus::Shell(status),
            Err(reason) => {
                if child.status().is_none() {
                    self.force_reap(&mut child).await;
                }
                FinalStatus::Failed(reason)
            }
        }
    }

    /// Walk the nudges until the shell is reaped, forwarding its last output.
    async fn shut_down<I, O, C>(
        &self,
        mux: &mut Multiplexer<I, O, C>,
        session: &PtySession,
        child: &mut ChildWatcher,
        nudges: &[Nudge],
    ) -> Result<ExitStatus, String>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        C: AsyncRead + Unpin,
    {
        let grace = self.config.grace_period;
        for &nudge in nudges {
            match nudge {
                Nudge::Wait => {}
                Nudge::Eof => {
                    let sent = tokio::time::timeout(grace, session.write_all(&[EOF_BYTE])).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        debug!("Could not deliver end-of-file to shell");
                    }
                }
                Nudge::Hangup => hang_up(child),
                Nudge::Kill => {
                    if let Err(e) = child.signal(Signal::SIGKILL) {
                        warn!("Failed to kill shell {}: {}", child.pid(), e);
                    }
                }
            }

            match tokio::time::timeout(grace, mux.drain(session, child)).await {
                Ok(LoopExit::ChildExited(status)) => return Ok(status),
                Ok(LoopExit::ChildLost(e)) => return Err(format!("lost track of shell: {e}")),
                Ok(other) => debug!("Unexpected end of drain: {:?}", other),
                Err(_) => warn!(
                    "Shell {} still running {:?} after {}",
                    child.pid(),
                    grace,
                    nudge
                ),
            }
        }
        Err(format!("shell {} did not exit", child.pid()))
    }

    /// SIGKILL the shell and wait for it on the reactor, bounded by the grace period.
    async fn force_reap(&self, child: &mut ChildWatcher) {
        if let Err(e) = child.signal(Signal::SIGKILL) {
            warn!("Failed to kill shell {}: {}", child.pid(), e);
        }
        match tokio::time::timeout(self.config.grace_period, child.wait()).await {
            Ok(Ok(status)) => debug!("Shell {} {}", child.pid(), status),
            Ok(Err(e)) => warn!("Lost track of shell {}: {}", child.pid(), e),
            Err(_) => warn!("Shell {} survived SIGKILL", child.pid()),
        }
    }

    async fn report<D: AsyncWrite + Unpin>(&self, status: &FinalStatus, diagnostics: &mut D) {
        let line = format!("[{}] {}\n", self.config.status_prefix, status);
        let written = async {
            diagnostics.write_all(line.as_bytes()).await?;
            diagnostics.flush().await
        };
        if let Err(e) = written.await {
            warn!("Could not deliver final status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    fn config(shell: &str) -> SupervisorConfig {
        SupervisorConfig {
            session: SessionConfig {
                shell: Some(shell.to_string()),
                ..Default::default()
            },
            grace_period: Duration::from_millis(500),
            ..Default::default()
        }
    }

    struct Controller {
        input: DuplexStream,
        output: DuplexStream,
        control: DuplexStream,
    }

    fn wire() -> (Controller, Channels<DuplexStream, DuplexStream, DuplexStream>) {
        let (input, helper_input) = duplex(4096);
        let (helper_output, output) = duplex(64 * 1024);
        let (control, helper_control) = duplex(256);
        (
            Controller {
                input,
                output,
                control,
            },
            Channels {
                input: helper_input,
                output: helper_output,
                control: Some(helper_control),
            },
        )
    }

    async fn run_with(
        supervisor: Supervisor,
        channels: Channels<DuplexStream, DuplexStream, DuplexStream>,
    ) -> (FinalStatus, String) {
        let mut diag = Vec::new();
        let status = tokio::time::timeout(
            Duration::from_secs(20),
            supervisor.run(channels, &mut diag),
        )
        .await
        .unwrap();
        (status, String::from_utf8(diag).unwrap())
    }

    #[test]
    fn status_lines() {
        assert_eq!(
            FinalStatus::Shell(ExitStatus::Exited(7)).to_string(),
            "shell exited with code 7"
        );
        assert_eq!(
            FinalStatus::SpawnFailed("no such file".into()).to_string(),
            "failed to start shell: no such file"
        );
    }

    #[tokio::test]
    async fn spawn_failure_goes_straight_to_terminated() {
        let supervisor = Supervisor::new(config("/nonexistent/shell"));
        let state = supervisor.subscribe();
        let (_controller, channels) = wire();

        let (status, diag) = run_with(supervisor, channels).await;
        assert!(matches!(status, FinalStatus::SpawnFailed(_)));
        assert!(diag.starts_with("[pty-helper] failed to start shell:"), "{diag}");
        assert_eq!(diag.lines().count(), 1);
        assert_eq!(*state.borrow(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn exit_code_is_propagated() {
        let supervisor = Supervisor::new(config("/bin/sh"));
        let (mut controller, channels) = wire();
        controller.input.write_all(b"exit 7\n").await.unwrap();

        let drain = async {
            let mut out = Vec::new();
            let _ = controller.output.read_to_end(&mut out).await;
        };
        let ((status, diag), ()) = tokio::join!(run_with(supervisor, channels), drain);

        assert_eq!(status, FinalStatus::Shell(ExitStatus::Exited(7)));
        assert_eq!(diag, "[pty-helper] shell exited with code 7\n");
    }

    #[tokio::test]
    async fn closing_input_ends_idle_shell_normally() {
        let supervisor = Supervisor::new(config("/bin/sh"));
        let state = supervisor.subscribe();
        let (controller, channels) = wire();
        let Controller {
            input,
            mut output,
            control: _control,
        } = controller;

        let driver = async {
            let mut seen = Vec::new();
            let mut buf = [0u8; 256];
            // Wait for the prompt so the shell is idle at a fresh line.
            while seen.is_empty() {
                let n = output.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            drop(input);
            let _ = output.read_to_end(&mut seen).await;
        };
        let ((status, diag), ()) = tokio::join!(run_with(supervisor, channels), driver);

        assert_eq!(status, FinalStatus::Shell(ExitStatus::Exited(0)), "{diag}");
        assert_eq!(*state.borrow(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn stop_request_escalates_past_ignored_hangup() {
        let supervisor = Supervisor::new(config("/bin/sh"));
        let stop = supervisor.stop_token();
        let (controller, channels) = wire();
        let Controller {
            mut input,
            mut output,
            control: _control,
        } = controller;

        let driver = async {
            input
                .write_all(b"trap '' HUP; echo trapped-$((2 + 2))\n")
                .await
                .unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 256];
            while !String::from_utf8_lossy(&seen).contains("trapped-4") {
                let n = output.read(&mut buf).await.unwrap();
                assert!(n > 0);
                seen.extend_from_slice(&buf[..n]);
            }
            stop.cancel();
            let _ = output.read_to_end(&mut seen).await;
        };
        let ((status, diag), ()) = tokio::join!(run_with(supervisor, channels), driver);

        assert_eq!(
            status,
            FinalStatus::Shell(ExitStatus::Signaled(Signal::SIGKILL as i32)),
            "{diag}"
        );
        assert!(diag.contains("killed by signal 9"));
    }

    #[tokio::test]
    async fn session_runs_without_control_channel() {
        let supervisor = Supervisor::new(config("/bin/sh"));
        let (mut input, helper_input) = duplex(1024);
        let (helper_output, mut output) = duplex(64 * 1024);
        let channels: Channels<_, _, DuplexStream> = Channels {
            input: helper_input,
            output: helper_output,
            control: None,
        };

        input.write_all(b"exit 3\n").await.unwrap();
        let drain = async {
            let mut out = Vec::new();
            let _ = output.read_to_end(&mut out).await;
        };
        let ((status, _), ()) = tokio::join!(run_with(supervisor, channels), drain);
        assert_eq!(status, FinalStatus::Shell(ExitStatus::Exited(3)));
    }
}
