use std::fmt;
use std::os::fd::RawFd;

/// One of the four byte pipes between the controller and the helper.
///
/// The descriptor numbers are fixed: controllers wire the pipes in this order
/// before exec, and the helper never re-creates them.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Channel {
    /// Controller keystrokes destined for the shell (fd 0)
    Input,
    /// Shell output and echo destined for the controller (fd 1)
    Output,
    /// Diagnostic text for the controller to surface out-of-band (fd 2)
    Diagnostics,
    /// Resize directives from the controller (fd 3)
    Control,
}

impl Channel {
    /// Descriptor number the channel occupies in the helper process
    pub fn fd(self) -> RawFd {
        match self {
            Channel::Input => 0,
            Channel::Output => 1,
            Channel::Diagnostics => 2,
            Channel::Control => 3,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Input => "input",
            Channel::Output => "output",
            Channel::Diagnostics => "diagnostics",
            Channel::Control => "control",
        };
        f.write_str(name)
    }
}
