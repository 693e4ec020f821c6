//! Signal & Child Custodian: the session's signal dispositions, and
//! the fork/exec hand-off used for the send/receive/break commands.

use crate::error::AppError;
use crate::tda::{TerminalRegistry, TtyBackend};

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::signal::{self, pthread_sigmask, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, execvp, fork, ForkResult, Pid};

extern "C" fn child_empty_handler(_: libc::c_int) {}

/// Installs the session's top-level dispositions: SIGTERM tears the
/// whole process group down (it is never async-signal-safe to restore
/// termios from inside a handler, so it does not try — see
/// [`crate::error::AppError::Fatal`] for the synchronous path that
/// does); the rest are ignored so an accidental Ctrl-C at the
/// controlling terminal, or a hangup on a pty, can't kill the bridge
/// out from under the serial session.
pub fn install() -> Result<(), AppError> {
    unsafe {
        let deadly = SigAction::new(
            SigHandler::Handler(deadly_handler),
            nix::sys::signal::SaFlags::empty(),
            SigSet::empty(),
        );
        signal::sigaction(Signal::SIGTERM, &deadly)?;

        let ign = SigAction::new(
            SigHandler::SigIgn,
            nix::sys::signal::SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [
            Signal::SIGINT,
            Signal::SIGHUP,
            Signal::SIGALRM,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
            Signal::SIGPIPE,
        ] {
            signal::sigaction(sig, &ign)?;
        }
    }
    Ok(())
}

extern "C" fn deadly_handler(_: libc::c_int) {
    let _ = signal::kill(Pid::from_raw(0), Signal::SIGTERM);
    std::thread::sleep(std::time::Duration::from_secs(1));
    crate::lockfile::unlock_best_effort();
    std::process::exit(libc::EXIT_FAILURE);
}

/// Forks, connects the child's stdio to `serial_fd`, and execs
/// `argv.join(" ")` (capped at 511 bytes, matching the original
/// fixed-size command buffer) through the platform shell. The parent
/// blocks SIGTERM around the fork so the child can install its own
/// handlers before either process can be torn down, waits for the
/// child, then re-applies the controlling terminal's settings (a
/// foreground child may have left it in whatever state its own
/// program wanted).
pub fn run_cmd<B: TtyBackend>(
    serial_fd: RawFd,
    controlling_fd: RawFd,
    registry: &mut TerminalRegistry<B>,
    cmd: &str,
    args: &[String],
) -> Result<i32, AppError> {
    let mut argv = cmd.to_string();
    for arg in args {
        argv.push(' ');
        argv.push_str(arg);
    }
    if argv.len() > 511 {
        argv.truncate(511);
    }

    let mut block = SigSet::empty();
    block.add(Signal::SIGTERM);
    let mut old_mask = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut old_mask))?;

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None)?;
            let status = waitpid(child, None)?;
            registry.apply(controlling_fd)?;
            match status {
                WaitStatus::Exited(_, code) => Ok(code),
                _ => Ok(-1),
            }
        }
        ForkResult::Child => {
            let empty = SigAction::new(
                SigHandler::Handler(child_empty_handler),
                nix::sys::signal::SaFlags::empty(),
                SigSet::empty(),
            );
            unsafe {
                let _ = signal::sigaction(Signal::SIGINT, &empty);
                let _ = signal::sigaction(Signal::SIGTERM, &empty);
            }
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);

            registry.deregister(controlling_fd);
            registry.erase(serial_fd);

            if let Ok(flags) = fcntl(serial_fd, FcntlArg::F_GETFL) {
                let flags = OFlag::from_bits_truncate(flags) & !OFlag::O_NONBLOCK;
                let _ = fcntl(serial_fd, FcntlArg::F_SETFL(flags));
            }

            let _ = dup2(serial_fd, 0);
            let _ = dup2(serial_fd, 1);

            let shell = CString::new("/bin/sh").unwrap();
            let dash_c = CString::new("-c").unwrap();
            let command = CString::new(argv).unwrap();
            let _ = execvp(&shell, &[shell.clone(), dash_c, command]);
            std::process::exit(128);
        }
    }
}

/// Builds the argv used for the status report's *** send/receive ***
/// line, shared between the real hand-off and tests.
pub fn describe_cmd(cmd: &str, args: &[String]) -> String {
    let mut s = cmd.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_cmd_joins_with_spaces() {
        assert_eq!(
            describe_cmd("rz", &["-vv".to_string(), "file.bin".to_string()]),
            "rz -vv file.bin"
        );
    }
}
