//! Signal delivery to child processes

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Deliver `signal` to `pid`.
///
/// Returns `Ok(false)` when the process no longer exists.
pub fn send(pid: u32, signal: Signal) -> Result<bool, Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_to_missing_process() {
        // pid_max on Linux is at most 2^22
        assert_eq!(send(4_194_304 + 1, Signal::SIGTERM), Ok(false));
    }

    #[test]
    fn test_pid_out_of_range() {
        assert_eq!(send(u32::MAX, Signal::SIGTERM), Err(Errno::EINVAL));
    }
}
