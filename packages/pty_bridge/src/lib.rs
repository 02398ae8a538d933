//! PTY bridge: run a shell behind a pseudo-terminal and relay it over four
//! byte channels.
//!
//! | fd | channel       | direction            |
//! |----|---------------|----------------------|
//! | 0  | input         | controller → shell   |
//! | 1  | output        | shell → controller   |
//! | 2  | diagnostics   | helper → controller  |
//! | 3  | control       | controller → helper  |
//!
//! The control channel carries resize directives, one per line, in the form
//! `<rows>x<cols>\n`.
//!
//! # Example
//!
//! ```no_run
//! use pty_bridge::{Channels, Supervisor, SupervisorConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let (input, helper_input) = tokio::io::duplex(4096);
//!     let (helper_output, output) = tokio::io::duplex(4096);
//!     let channels = Channels::<_, _, tokio::io::DuplexStream> {
//!         input: helper_input,
//!         output: helper_output,
//!         control: None,
//!     };
//!
//!     let supervisor = Supervisor::new(SupervisorConfig::default());
//!     let status = supervisor.run(channels, &mut tokio::io::stderr()).await;
//!     println!("{status}");
//!     drop((input, output));
//! }
//! ```

mod channel;
mod child;
pub mod control;
mod error;
pub mod fd;
mod multiplexer;
mod session;
mod supervisor;

pub use channel::Channel;
pub use child::{ChildWatcher, ExitStatus, kill_and_reap};
pub use control::{ControlDecoder, DirectiveError, MAX_LINE_LEN, ResizeDirective};
pub use error::{BridgeError, Result};
pub use fd::FdStream;
pub use multiplexer::{LoopExit, Multiplexer, MuxConfig, MuxStats};
pub use session::{DEFAULT_SHELL, MAX_DIMENSION, PtySession, SessionConfig, WindowSize, default_shell};
pub use supervisor::{Channels, FinalStatus, Supervisor, SupervisorConfig, SupervisorState};
