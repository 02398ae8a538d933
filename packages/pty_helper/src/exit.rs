//! Mirror the shell's fate in the helper's own exit status.

use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use tracing::debug;

use pty_bridge::{ExitStatus, FinalStatus};

/// Exit code when the shell could not be started
pub const SPAWN_FAILED_CODE: i32 = 127;
/// Exit code when the session failed without a shell status
pub const FAILED_CODE: i32 = 1;
/// Exit code for an unusable configuration
pub const CONFIG_ERROR_CODE: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mirror {
    Code(i32),
    Raise(Signal),
}

/// How the helper should end for a given final status.
pub fn plan(status: &FinalStatus) -> Mirror {
    match status {
        FinalStatus::Shell(ExitStatus::Exited(code)) => Mirror::Code(*code),
        FinalStatus::Shell(ExitStatus::Signaled(sig)) => match Signal::try_from(*sig) {
            Ok(sig) if terminates_by_default(sig) => Mirror::Raise(sig),
            _ => Mirror::Code(128 + sig),
        },
        FinalStatus::SpawnFailed(_) => Mirror::Code(SPAWN_FAILED_CODE),
        FinalStatus::Failed(_) => Mirror::Code(FAILED_CODE),
    }
}

fn terminates_by_default(sig: Signal) -> bool {
    !matches!(
        sig,
        Signal::SIGCHLD
            | Signal::SIGCONT
            | Signal::SIGURG
            | Signal::SIGWINCH
            | Signal::SIGSTOP
            | Signal::SIGTSTP
            | Signal::SIGTTIN
            | Signal::SIGTTOU
    )
}

/// Terminate the process the way `status` says. Never returns.
///
/// Call only after the runtime has shut down so no handler is left that could
/// swallow the re-raised signal.
pub fn mirror(status: &FinalStatus) -> ! {
    let plan = plan(status);
    debug!("Exiting: {:?}", plan);
    match plan {
        Mirror::Code(code) => std::process::exit(code),
        Mirror::Raise(sig) => {
            // SIGKILL cannot have its disposition changed; raising it still works.
            // SAFETY: single-threaded at this point, and SIG_DFL installs no handler.
            let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
            let mut set = SigSet::empty();
            set.add(sig);
            let _ = set.thread_unblock();
            let _ = signal::raise(sig);
            std::process::exit(128 + sig as i32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_passes_through() {
        assert_eq!(plan(&FinalStatus::Shell(ExitStatus::Exited(0))), Mirror::Code(0));
        assert_eq!(plan(&FinalStatus::Shell(ExitStatus::Exited(7))), Mirror::Code(7));
    }

    #[test]
    fn fatal_signal_is_reraised() {
        assert_eq!(
            plan(&FinalStatus::Shell(ExitStatus::Signaled(15))),
            Mirror::Raise(Signal::SIGTERM)
        );
        assert_eq!(
            plan(&FinalStatus::Shell(ExitStatus::Signaled(9))),
            Mirror::Raise(Signal::SIGKILL)
        );
    }

    #[test]
    fn non_fatal_signal_falls_back_to_code() {
        let winch = Signal::SIGWINCH as i32;
        assert_eq!(
            plan(&FinalStatus::Shell(ExitStatus::Signaled(winch))),
            Mirror::Code(128 + winch)
        );
    }

    #[test]
    fn failures_have_fixed_codes() {
        assert_eq!(plan(&FinalStatus::SpawnFailed("x".into())), Mirror::Code(127));
        assert_eq!(plan(&FinalStatus::Failed("x".into())), Mirror::Code(1));
    }
}
