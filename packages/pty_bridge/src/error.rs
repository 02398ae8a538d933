use std::io;

use crate::channel::Channel;

/// Errors that can occur while bridging a PTY session to its controller
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// PTY allocation or shell execution failed
    #[error("failed to start shell: {0}")]
    SpawnFailed(String),
    /// Requested terminal size is outside 1..=9999
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u32, cols: u32 },
    /// A controller-facing pipe closed
    #[error("{0} channel closed")]
    ChannelClosed(Channel),
    /// The PTY reported end-of-file (shell exited and output drained)
    #[error("PTY session closed")]
    SessionClosed,
    /// Unexpected I/O failure on a controller-facing channel
    #[error("I/O fault on {channel} channel: {source}")]
    IoFault {
        channel: Channel,
        #[source]
        source: io::Error,
    },
    /// Unexpected I/O failure on the PTY itself
    #[error("I/O fault on PTY: {0}")]
    PtyFault(#[source] io::Error),
}

impl BridgeError {
    /// Structural errors end the session; the rest are absorbed by the loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::InvalidSize { .. })
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
