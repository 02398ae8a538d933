//! Single-threaded pump between the controller's channels and the PTY.
//!
//! One `select!` covers every descriptor, so the loop only suspends when all
//! of them are quiescent. Each wake-up moves at most one chunk per ready
//! source. A source is not read again until its previous chunk has been fully
//! accepted by the destination, which bounds memory and propagates
//! backpressure without ever blocking the other channels.

use std::future::pending;
use std::io;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::child::{ChildWatcher, ExitStatus};
use crate::control::{ControlDecoder, ResizeDirective};
use crate::error::BridgeError;
use crate::session::PtySession;

/// Consecutive failures on one descriptor before the loop gives up on it
pub const MAX_CONSECUTIVE_FAULTS: u32 = 2;

#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Bytes moved per source per wake-up
    pub chunk_size: usize,
    /// How long PTY output is still forwarded after the shell exits
    pub drain_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            drain_timeout: Duration::from_millis(200),
        }
    }
}

/// Why the pump stopped
#[derive(Debug)]
pub enum LoopExit {
    /// The shell was reaped and its output forwarded
    ChildExited(ExitStatus),
    /// The PTY reported end-of-file before the shell was reaped
    SessionClosed,
    /// The controller closed the Input channel
    InputClosed,
    /// A stop was requested through the cancellation token
    StopRequested,
    /// A controller-facing channel went away
    ChannelClosed(Channel),
    /// Repeated I/O failures on one descriptor
    Fault(BridgeError),
    /// The shell could no longer be waited on
    ChildLost(io::Error),
}

/// Counters kept for diagnostics and tests
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub bytes_to_shell: u64,
    pub bytes_to_controller: u64,
    pub resizes_applied: u64,
    pub directives_rejected: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Running,
    Draining,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Channel(Channel),
    Pty,
}

impl Source {
    fn slot(self) -> usize {
        match self {
            Source::Channel(channel) => channel.fd() as usize,
            Source::Pty => 4,
        }
    }
}

/// Consecutive-failure counters, one per descriptor
#[derive(Debug, Default)]
struct FaultTracker {
    consecutive: [u32; 5],
}

impl FaultTracker {
    /// Record a failure; true once it has recurred enough to escalate.
    fn record(&mut self, source: Source) -> bool {
        let count = &mut self.consecutive[source.slot()];
        *count += 1;
        *count >= MAX_CONSECUTIVE_FAULTS
    }

    fn clear(&mut self, source: Source) {
        self.consecutive[source.slot()] = 0;
    }
}

/// Bytes read from one side and not yet accepted by the other.
///
/// Filled by swapping in the scratch buffer the read landed in, so data is
/// never copied between buffers.
#[derive(Debug)]
struct Pending {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Pending {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.is_empty() {
            self.clear();
        }
    }

    fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn fill_from(&mut self, scratch: &mut Vec<u8>, n: usize) {
        debug_assert!(self.is_empty());
        std::mem::swap(&mut self.buf, scratch);
        self.start = 0;
        self.end = n;
    }
}

/// Routes Input→PTY, PTY→Output and Control→resize for one session.
///
/// The multiplexer owns the controller-facing ends and borrows the session
/// and child watcher only while a pump is running.
pub struct Multiplexer<I, O, C> {
    input: Option<I>,
    output: O,
    output_alive: bool,
    control: Option<C>,
    decoder: ControlDecoder,
    config: MuxConfig,
    mode: Mode,
    pty_closed: bool,
    pty_scratch: Vec<u8>,
    in_scratch: Vec<u8>,
    ctl_scratch: Vec<u8>,
    to_controller: Pending,
    to_shell: Pending,
    drain_deadline: Option<Instant>,
    faults: FaultTracker,
    stats: MuxStats,
}

impl<I, O, C> Multiplexer<I, O, C>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    C: AsyncRead + Unpin,
{
    /// `control` may be absent when the controller did not wire fd 3.
    pub fn new(input: I, output: O, control: Option<C>, config: MuxConfig) -> Self {
        let chunk = config.chunk_size.max(1);
        Self {
            input: Some(input),
            output,
            output_alive: true,
            control,
            decoder: ControlDecoder::new(),
            config,
            mode: Mode::Running,
            pty_closed: false,
            pty_scratch: vec![0; chunk],
            in_scratch: vec![0; chunk],
            ctl_scratch: vec![0; 256],
            to_controller: Pending::new(chunk),
            to_shell: Pending::new(chunk),
            drain_deadline: None,
            faults: FaultTracker::default(),
            stats: MuxStats::default(),
        }
    }

    pub fn stats(&self) -> MuxStats {
        self.stats
    }

    /// Give back the controller output so the caller can close it.
    pub fn into_output(self) -> O {
        self.output
    }

    /// Pump all channels until the session ends or the controller asks to stop.
    pub async fn run(
        &mut self,
        session: &PtySession,
        child: &mut ChildWatcher,
        stop: &CancellationToken,
    ) -> LoopExit {
        self.mode = Mode::Running;
        self.pump(session, child, Some(stop)).await
    }

    /// Stop taking input and keep forwarding output until the shell is reaped.
    ///
    /// Only returns [`LoopExit::ChildExited`] or [`LoopExit::ChildLost`]; the
    /// caller bounds it with its grace period.
    pub async fn drain(&mut self, session: &PtySession, child: &mut ChildWatcher) -> LoopExit {
        self.enter_draining();
        self.pump(session, child, None).await
    }

    fn enter_draining(&mut self) {
        if self.mode == Mode::Draining {
            return;
        }
        self.mode = Mode::Draining;
        self.input = None;
        if !self.to_shell.is_empty() {
            debug!("Dropping {} bytes of unsent input", self.to_shell.bytes().len());
            self.to_shell.clear();
        }
    }

    async fn pump(
        &mut self,
        session: &PtySession,
        child: &mut ChildWatcher,
        stop: Option<&CancellationToken>,
    ) -> LoopExit {
        loop {
            if self.pty_closed && self.to_controller.is_empty() {
                if let Some(status) = child.status() {
                    return LoopExit::ChildExited(status);
                }
                if self.mode == Mode::Running {
                    return LoopExit::SessionClosed;
                }
            }

            let read_pty = !self.pty_closed && self.to_controller.is_empty();
            let write_output = !self.to_controller.is_empty();
            let read_input =
                self.mode == Mode::Running && self.input.is_some() && self.to_shell.is_empty();
            let write_shell = !self.to_shell.is_empty() && !self.pty_closed;
            let read_control = self.control.is_some() && !self.pty_closed;
            let watch_child = child.status().is_none();
            let watch_stop = self.mode == Mode::Running && stop.is_some();
            let draining = self.drain_deadline;

            // Unbiased: a flooding PTY must not starve input or control.
            tokio::select! {
                r = session.read(&mut self.pty_scratch), if read_pty => {
                    if let Some(exit) = self.on_pty_read(r) {
                        return exit;
                    }
                }
                r = write_some(&mut self.output, self.to_controller.bytes()), if write_output => {
                    if let Some(exit) = self.on_output_written(r) {
                        return exit;
                    }
                }
                r = read_some(self.input.as_mut(), &mut self.in_scratch), if read_input => {
                    if let Some(exit) = self.on_input_read(r) {
                        return exit;
                    }
                }
                r = session.write(self.to_shell.bytes()), if write_shell => {
                    if let Some(exit) = self.on_shell_written(r) {
                        return exit;
                    }
                }
                r = read_some(self.control.as_mut(), &mut self.ctl_scratch), if read_control => {
                    if let Some(exit) = self.on_control_read(session, r) {
                        return exit;
                    }
                }
                r = child.wait(), if watch_child => {
                    match r {
                        Ok(status) => {
                            info!("Shell {}", status);
                            self.enter_draining();
                            self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                        }
                        Err(e) => {
                            warn!("Lost track of shell process: {}", e);
                            return LoopExit::ChildLost(e);
                        }
                    }
                }
                _ = cancelled(stop), if watch_stop => {
                    info!("Stop requested");
                    return LoopExit::StopRequested;
                }
                _ = sleep_until(draining), if draining.is_some() => {
                    if let Some(status) = child.status() {
                        warn!("Shell output still open after exit, abandoning it");
                        return LoopExit::ChildExited(status);
                    }
                    self.drain_deadline = None;
                }
                else => {
                    return LoopExit::SessionClosed;
                }
            }
        }
    }

    fn on_pty_read(&mut self, r: Result<usize, BridgeError>) -> Option<LoopExit> {
        match r {
            Ok(n) => {
                self.faults.clear(Source::Pty);
                if self.output_alive {
                    self.to_controller.fill_from(&mut self.pty_scratch, n);
                }
                None
            }
            Err(BridgeError::SessionClosed) => {
                debug!("PTY reached end-of-file");
                self.pty_closed = true;
                self.to_shell.clear();
                None
            }
            Err(e) => self.fault(Source::Pty, e),
        }
    }

    fn on_output_written(&mut self, r: io::Result<usize>) -> Option<LoopExit> {
        match r {
            Ok(n) if n > 0 => {
                self.faults.clear(Source::Channel(Channel::Output));
                self.stats.bytes_to_controller += n as u64;
                self.to_controller.consume(n);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
            Ok(_) => self.output_closed(),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => self.output_closed(),
            Err(e) => {
                let fault = BridgeError::IoFault {
                    channel: Channel::Output,
                    source: e,
                };
                match self.fault(Source::Channel(Channel::Output), fault) {
                    Some(_) if self.mode == Mode::Draining => self.output_closed(),
                    other => other,
                }
            }
        }
    }

    fn output_closed(&mut self) -> Option<LoopExit> {
        self.output_alive = false;
        self.to_controller.clear();
        match self.mode {
            Mode::Running => {
                info!("Controller stopped reading output");
                Some(LoopExit::ChannelClosed(Channel::Output))
            }
            // Keep reading the PTY so the exiting shell never blocks on it.
            Mode::Draining => None,
        }
    }

    fn on_input_read(&mut self, r: io::Result<usize>) -> Option<LoopExit> {
        match r {
            Ok(0) => {
                info!("Controller closed input");
                self.input = None;
                Some(LoopExit::InputClosed)
            }
            Ok(n) => {
                self.faults.clear(Source::Channel(Channel::Input));
                self.to_shell.fill_from(&mut self.in_scratch, n);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
            Err(e) => self.fault(
                Source::Channel(Channel::Input),
                BridgeError::IoFault {
                    channel: Channel::Input,
                    source: e,
                },
            ),
        }
    }

    fn on_shell_written(&mut self, r: Result<usize, BridgeError>) -> Option<LoopExit> {
        match r {
            Ok(n) => {
                self.faults.clear(Source::Pty);
                self.stats.bytes_to_shell += n as u64;
                self.to_shell.consume(n);
                None
            }
            Err(BridgeError::SessionClosed) => {
                // The read side reports the closure; unsent input is moot.
                self.to_shell.clear();
                None
            }
            Err(e) => self.fault(Source::Pty, e),
        }
    }

    fn on_control_read(&mut self, session: &PtySession, r: io::Result<usize>) -> Option<LoopExit> {
        let n = match r {
            Ok(0) => {
                if let Some(err) = self.decoder.finish() {
                    self.stats.directives_rejected += 1;
                    warn!("Discarding control input: {}", err);
                }
                info!("Control channel closed, size is fixed at {}", session.size());
                self.control = None;
                return None;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return None,
            Err(e) => {
                return self.fault(
                    Source::Channel(Channel::Control),
                    BridgeError::IoFault {
                        channel: Channel::Control,
                        source: e,
                    },
                );
            }
        };
        self.faults.clear(Source::Channel(Channel::Control));

        // Several directives in one read collapse to the newest valid one.
        let mut latest: Option<ResizeDirective> = None;
        for result in self.decoder.decode(&self.ctl_scratch[..n]) {
            match result {
                Ok(directive) => latest = Some(directive),
                Err(err) => {
                    self.stats.directives_rejected += 1;
                    warn!("Discarding control input: {}", err);
                }
            }
        }

        let directive = latest?;
        match session.set_size(u32::from(directive.rows), u32::from(directive.cols)) {
            Ok(()) => {
                debug!("Resized terminal to {}", directive);
                self.stats.resizes_applied += 1;
                self.faults.clear(Source::Pty);
                None
            }
            Err(BridgeError::SessionClosed) => None,
            Err(e) => self.fault(Source::Pty, e),
        }
    }

    /// Log a fault; escalate to teardown when it recurs on the same descriptor.
    fn fault(&mut self, source: Source, err: BridgeError) -> Option<LoopExit> {
        if !self.faults.record(source) {
            warn!("{}", err);
            return None;
        }
        warn!("{} (repeated, giving up)", err);
        match (self.mode, source) {
            // While draining a broken PTY is as good as closed.
            (Mode::Draining, Source::Pty) => {
                self.pty_closed = true;
                self.to_controller.clear();
                None
            }
            _ => Some(LoopExit::Fault(err)),
        }
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: Option<&mut R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => pending().await,
    }
}

async fn write_some<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    writer.write(buf).await
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Send the shell a polite hangup, as a closing terminal would.
pub(crate) fn hang_up(child: &ChildWatcher) {
    if let Err(e) = child.signal(Signal::SIGHUP) {
        warn!("Failed to send SIGHUP to shell {}: {}", child.pid(), e);
    }
}
