//! The `pty-helper` executable's building blocks, and the controller-side
//! [`host`] that launches it.

pub mod config;
pub mod exit;
pub mod host;

pub use config::{CliOverrides, HelperConfig};
pub use host::{HelperCommand, HelperHandle, HostError, HostExit, TerminalHost};
