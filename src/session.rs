//! The interactive loop: a single `poll` over the controlling terminal
//! and the serial fd, one byte at a time, with the controlling
//! terminal serviced first on each iteration.

use crate::config::Config;
use crate::error::AppError;
use crate::interpreter::{self, Action, Interpreter};
use crate::queue::OutboundQueue;
use crate::scc;
use crate::tda::{TerminalRegistry, TtyBackend};
use crate::timestamp::TimestampAnnotator;

use std::io::Write;
use std::os::unix::io::RawFd;

use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;

pub struct Session<B: TtyBackend> {
    pub cfg: Config,
    pub registry: TerminalRegistry<B>,
    pub oq: OutboundQueue,
    pub interp: Interpreter,
    pub timestamp: TimestampAnnotator,
    controlling_fd: RawFd,
    serial_fd: RawFd,
}

/// What happened while servicing one byte from the controlling
/// terminal: text to echo back, and whether the session should keep
/// running.
pub struct StepOutcome {
    pub output: String,
    pub keep_running: bool,
    pub reset_on_exit: bool,
}

impl<B: TtyBackend> Session<B> {
    pub fn new(
        cfg: Config,
        registry: TerminalRegistry<B>,
        controlling_fd: RawFd,
        serial_fd: RawFd,
    ) -> Self {
        Self {
            cfg,
            registry,
            oq: OutboundQueue::new(),
            interp: Interpreter::new(),
            timestamp: TimestampAnnotator::new(),
            controlling_fd,
            serial_fd,
        }
    }

    /// Services one byte read from the controlling terminal. Filename
    /// prompts are handled inline by the caller via the returned
    /// [`Action`]-adjacent prompt request, since they need further
    /// reads from `controlling_fd`.
    pub fn on_controlling_byte(
        &mut self,
        byte: u8,
        now: chrono::DateTime<chrono::Local>,
    ) -> (StepOutcome, Option<Action>) {
        let r = self.interp.handle(
            byte,
            &mut self.cfg,
            &mut self.registry,
            self.serial_fd,
            &mut self.oq,
            &mut self.timestamp,
            now,
        );
        let action = match r.action {
            Action::Continue => None,
            other => Some(other),
        };
        let keep_running = !matches!(
            r.action,
            Action::ExitAndReset | Action::ExitNoReset
        );
        let reset_on_exit = matches!(r.action, Action::ExitAndReset);
        (
            StepOutcome {
                output: r.output,
                keep_running,
                reset_on_exit,
            },
            action,
        )
    }

    /// Services one byte read from the serial fd: returns the bytes
    /// (timestamp prefix, if any, followed by the byte itself) to
    /// write to the controlling terminal.
    pub fn on_serial_byte(&mut self, byte: u8, now: chrono::DateTime<chrono::Local>) -> Vec<u8> {
        let mut out = Vec::with_capacity(2);
        if let Some(prefix) = self.timestamp.annotate(byte, now) {
            out.extend_from_slice(prefix.as_bytes());
        }
        out.push(byte);
        out
    }

    fn run_prompted_command<W: Write>(
        &mut self,
        action: Action,
        mut writer: W,
    ) -> Result<(), AppError> {
        let name = interpreter::read_filename(
            512,
            || read_one(self.controlling_fd),
            |b| {
                let _ = writer.write_all(&[b]);
            },
        )?;
        let _ = writer.write_all(b"\r\n");

        let (cmd, args) = match action {
            Action::PromptSend => interpreter::send_argv(&self.cfg, &name),
            Action::PromptReceive => interpreter::receive_argv(&self.cfg, &name),
            _ => return Ok(()),
        };

        match scc::run_cmd(
            self.serial_fd,
            self.controlling_fd,
            &mut self.registry,
            &cmd,
            &args,
        ) {
            Ok(code) => {
                let _ = write!(writer, "\r\n*** exit status: {} ***\r\n", code);
            }
            Err(e) => {
                let _ = write!(writer, "\r\n*** {} ***\r\n", e);
            }
        }
        Ok(())
    }

    /// Drains the outbound queue toward the serial fd when it reports
    /// writable, consuming however many bytes actually went out.
    /// Interrupted-syscall errors are retried, as on the read side.
    fn drain_outbound(&mut self) -> Result<(), AppError> {
        if self.oq.is_empty() {
            return Ok(());
        }
        loop {
            match unistd::write(self.serial_fd, self.oq.as_slice()) {
                Ok(n) => {
                    self.oq.consume(n);
                    return Ok(());
                }
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(AppError::Io(std::io::Error::from(e))),
            }
        }
    }

    /// Runs the interactive loop until a C-x/C-q exit, or a fatal I/O
    /// error on either fd. Matches the original's read-then-handle
    /// shape: the controlling terminal is always polled for
    /// readability, the serial fd is polled for both readability and
    /// (only while the queue is non-empty) writability.
    pub fn run(&mut self) -> Result<bool, AppError> {
        let mut stdout = std::io::stdout();
        loop {
            let mut fds = vec![
                PollFd::new(self.controlling_fd, PollFlags::POLLIN),
                PollFd::new(
                    self.serial_fd,
                    if self.oq.is_empty() {
                        PollFlags::POLLIN
                    } else {
                        PollFlags::POLLIN | PollFlags::POLLOUT
                    },
                ),
            ];
            poll(&mut fds, -1).map_err(|e| AppError::Fatal(format!("poll failed: {}", e)))?;

            let now = chrono::Local::now();

            if fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false)
            {
                let byte = read_one(self.controlling_fd)?
                    .ok_or_else(|| AppError::Fatal("stdin closed".to_string()))?;
                let (outcome, action) = self.on_controlling_byte(byte, now);
                write_screen(&mut stdout, outcome.output.as_bytes())?;
                if let Some(action) = action {
                    match action {
                        Action::PromptSend | Action::PromptReceive => {
                            self.run_prompted_command(action, &mut stdout)?;
                        }
                        _ => {}
                    }
                }
                if !outcome.keep_running {
                    return Ok(outcome.reset_on_exit);
                }
            }

            if fds[1]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false)
            {
                let byte = read_one(self.serial_fd)?
                    .ok_or_else(|| AppError::Fatal("term closed".to_string()))?;
                let bytes = self.on_serial_byte(byte, now);
                write_screen(&mut stdout, &bytes)?;
            }

            if fds[1]
                .revents()
                .map(|r| r.contains(PollFlags::POLLOUT))
                .unwrap_or(false)
            {
                self.drain_outbound()?;
            }
        }
    }
}

/// Writes a full buffer to the controlling terminal, retrying transient
/// wouldblock/interrupted conditions (`write_all` already retries
/// `Interrupted` internally; `WouldBlock` is retried here). Any other
/// failure is escalated to `Fatal` rather than silently dropped.
fn write_screen<W: Write>(out: &mut W, buf: &[u8]) -> Result<(), AppError> {
    loop {
        match out.write_all(buf) {
            Ok(()) => break,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(AppError::Fatal(format!("screen write failed: {}", e))),
        }
    }
    out.flush()
        .map_err(|e| AppError::Fatal(format!("screen flush failed: {}", e)))
}

fn read_one(fd: RawFd) -> Result<Option<u8>, AppError> {
    let mut buf = [0u8; 1];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(AppError::Io(std::io::Error::from(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tda::mock::MockBackend;
    use chrono::TimeZone;

    const CONTROLLING: RawFd = 10;
    const SERIAL: RawFd = 20;

    fn fresh() -> Session<MockBackend> {
        let mut cfg = Config::default();
        cfg.escape = crate::config::parse_escape('a');
        let mut registry = TerminalRegistry::new(MockBackend::seeded(
            SERIAL,
            crate::tda::mock::blank_termios(),
        ));
        registry.register(SERIAL).unwrap();
        Session::new(cfg, registry, CONTROLLING, SERIAL)
    }

    fn now() -> chrono::DateTime<chrono::Local> {
        chrono::Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn serial_byte_with_timestamp_disabled_passes_through_unprefixed() {
        let mut s = fresh();
        let out = s.on_serial_byte(b'X', now());
        assert_eq!(out, b"X");
    }

    #[test]
    fn serial_byte_with_timestamp_enabled_is_prefixed_once_per_line() {
        let mut s = fresh();
        s.timestamp.toggle(now());
        let out = s.on_serial_byte(b'X', now());
        assert!(out.starts_with(b"\x1b[36m"));
        let out2 = s.on_serial_byte(b'Y', now());
        assert_eq!(out2, b"Y");
    }

    #[test]
    fn escape_byte_transitions_without_echo() {
        let mut s = fresh();
        let (outcome, action) = s.on_controlling_byte(s.cfg.escape, now());
        assert!(outcome.keep_running);
        assert!(action.is_none());
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn ctrl_x_reports_exit_and_reset() {
        let mut s = fresh();
        let escape = s.cfg.escape;
        s.on_controlling_byte(escape, now());
        let (outcome, _) = s.on_controlling_byte(0x18, now());
        assert!(!outcome.keep_running);
        assert!(outcome.reset_on_exit);
    }

    #[test]
    fn ctrl_q_reports_exit_without_reset() {
        let mut s = fresh();
        let escape = s.cfg.escape;
        s.on_controlling_byte(escape, now());
        let (outcome, _) = s.on_controlling_byte(0x11, now());
        assert!(!outcome.keep_running);
        assert!(!outcome.reset_on_exit);
    }
}
