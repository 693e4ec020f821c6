//! Tty Driver Abstraction: a registry mapping an open fd to (saved,
//! desired) kernel attributes, with the primitives the command
//! interpreter and startup/shutdown paths need to mutate and commit
//! them.
//!
//! All raw syscalls go through the `TtyBackend` trait so the registry's
//! bookkeeping (desired/saved separation, apply-rollback, erase vs.
//! deregister) can be exercised against a mock in tests without a real
//! tty.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::libc;
use nix::sys::termios::{
    cfmakeraw, cfsetspeed, BaudRate, ControlFlags, SetArg, SpecialCharacterIndices as CC, Termios,
};

use crate::config::{Config, Flow, Parity};
use crate::error::AppError;

mod ioctl {
    use nix::libc;
    use nix::{ioctl_read_bad, ioctl_write_ptr_bad};

    ioctl_read_bad!(tiocmget, libc::TIOCMGET, libc::c_int);
    ioctl_write_ptr_bad!(tiocmset, libc::TIOCMSET, libc::c_int);
}

/// Raw syscall surface the registry drives. A real implementation talks
/// to the kernel; tests substitute a fake that tracks state in memory.
pub trait TtyBackend {
    fn get_attrs(&self, fd: RawFd) -> nix::Result<Termios>;
    /// Sets attributes with `TCSAFLUSH` semantics (drain output, flush
    /// input, then apply).
    fn set_attrs(&mut self, fd: RawFd, attrs: &Termios) -> nix::Result<()>;
    fn flush(&mut self, fd: RawFd) -> nix::Result<()>;
    fn send_break(&mut self, fd: RawFd) -> nix::Result<()>;
    fn modem_bits(&self, fd: RawFd) -> nix::Result<libc::c_int>;
    fn set_modem_bits(&mut self, fd: RawFd, bits: libc::c_int) -> nix::Result<()>;
    fn sleep(&self, d: Duration);
}

/// The real backend: POSIX termios via `nix`.
pub struct NixBackend;

impl TtyBackend for NixBackend {
    fn get_attrs(&self, fd: RawFd) -> nix::Result<Termios> {
        nix::sys::termios::tcgetattr(fd)
    }

    fn set_attrs(&mut self, fd: RawFd, attrs: &Termios) -> nix::Result<()> {
        nix::sys::termios::tcsetattr(fd, SetArg::TCSAFLUSH, attrs)
    }

    fn flush(&mut self, fd: RawFd) -> nix::Result<()> {
        nix::sys::termios::tcflush(fd, nix::sys::termios::FlushArg::TCIOFLUSH)
    }

    fn send_break(&mut self, fd: RawFd) -> nix::Result<()> {
        nix::sys::termios::tcsendbreak(fd, 0)
    }

    fn modem_bits(&self, fd: RawFd) -> nix::Result<libc::c_int> {
        let mut bits: libc::c_int = 0;
        unsafe { ioctl::tiocmget(fd, &mut bits) }?;
        Ok(bits)
    }

    fn set_modem_bits(&mut self, fd: RawFd, bits: libc::c_int) -> nix::Result<()> {
        unsafe { ioctl::tiocmset(fd, &bits) }?;
        Ok(())
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

struct Record {
    saved: Termios,
    desired: Termios,
}

pub struct TerminalRegistry<B: TtyBackend> {
    pub(crate) backend: B,
    records: HashMap<RawFd, Record>,
}

/// Field-wise comparison of the parts of `Termios` this registry
/// actually cares about. `tcsetattr` reports success if *any* requested
/// change took effect, so `apply` must read the attributes back and
/// compare them this way to know whether the kernel truly holds what
/// was asked for.
fn attrs_match(a: &Termios, b: &Termios) -> bool {
    a.input_flags == b.input_flags
        && a.output_flags == b.output_flags
        && a.control_flags == b.control_flags
        && a.local_flags == b.local_flags
        && a.control_chars == b.control_chars
}

impl<B: TtyBackend> TerminalRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            records: HashMap::new(),
        }
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.records.contains_key(&fd)
    }

    /// Captures the kernel attributes of `fd` into `saved`, copies them
    /// into `desired`. Errors with `DriverNack` if `fd` is already
    /// registered.
    pub fn register(&mut self, fd: RawFd) -> Result<(), AppError> {
        if self.records.contains_key(&fd) {
            return Err(AppError::DriverNack(format!(
                "fd {} is already registered",
                fd
            )));
        }
        let saved = self.backend.get_attrs(fd)?;
        let desired = saved.clone();
        self.records.insert(fd, Record { saved, desired });
        Ok(())
    }

    /// Writes `saved` back to the kernel and forgets the record.
    /// Best-effort: used during signal-driven teardown, so failures are
    /// swallowed rather than propagated.
    pub fn deregister(&mut self, fd: RawFd) {
        if let Some(record) = self.records.remove(&fd) {
            let _ = self.backend.set_attrs(fd, &record.saved);
        }
    }

    /// Forgets the record without touching the kernel.
    pub fn erase(&mut self, fd: RawFd) {
        self.records.remove(&fd);
    }

    fn record_mut(&mut self, fd: RawFd) -> Result<&mut Record, AppError> {
        self.records
            .get_mut(&fd)
            .ok_or_else(|| AppError::DriverNack(format!("fd {} is not registered", fd)))
    }

    pub fn set_raw(&mut self, fd: RawFd) -> Result<(), AppError> {
        let record = self.record_mut(fd)?;
        cfmakeraw(&mut record.desired);
        Ok(())
    }

    pub fn set_baud(&mut self, fd: RawFd, baud: u32) -> Result<(), AppError> {
        let baud = crate::config::clamp_to_ladder(baud);
        let rate = baud_to_rate(baud);
        let record = self.record_mut(fd)?;
        cfsetspeed(&mut record.desired, rate)
            .map_err(|e| AppError::DriverNack(format!("set_baud: {}", e)))
    }

    pub fn set_flow(&mut self, fd: RawFd, flow: Flow) -> Result<(), AppError> {
        let record = self.record_mut(fd)?;
        record.desired.input_flags.set(
            nix::sys::termios::InputFlags::IXON | nix::sys::termios::InputFlags::IXOFF,
            flow == Flow::XonXoff,
        );
        record
            .desired
            .control_flags
            .set(ControlFlags::CRTSCTS, flow == Flow::RtsCts);
        Ok(())
    }

    pub fn set_parity(&mut self, fd: RawFd, parity: Parity) -> Result<(), AppError> {
        let record = self.record_mut(fd)?;
        match parity {
            Parity::None => {
                record.desired.control_flags.remove(ControlFlags::PARENB);
            }
            Parity::Even => {
                record.desired.control_flags.insert(ControlFlags::PARENB);
                record.desired.control_flags.remove(ControlFlags::PARODD);
            }
            Parity::Odd => {
                record.desired.control_flags.insert(ControlFlags::PARENB);
                record.desired.control_flags.insert(ControlFlags::PARODD);
            }
        }
        Ok(())
    }

    pub fn set_databits(&mut self, fd: RawFd, databits: u8) -> Result<(), AppError> {
        let bits = match databits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            8 => ControlFlags::CS8,
            other => {
                return Err(AppError::DriverNack(format!(
                    "unsupported databits {}",
                    other
                )))
            }
        };
        let record = self.record_mut(fd)?;
        record.desired.control_flags.remove(ControlFlags::CSIZE);
        record.desired.control_flags.insert(bits);
        Ok(())
    }

    pub fn set_hupcl(&mut self, fd: RawFd, enable: bool) -> Result<(), AppError> {
        let record = self.record_mut(fd)?;
        record
            .desired
            .control_flags
            .set(ControlFlags::HUPCL, enable);
        Ok(())
    }

    /// Pushes `desired` to the kernel, then reads it back to confirm
    /// every requested bit actually stuck. On mismatch, rolls `desired`
    /// back to the observed kernel state and reports `DriverNack`.
    pub fn apply(&mut self, fd: RawFd) -> Result<(), AppError> {
        let desired = {
            let record = self.record_mut(fd)?;
            record.desired.clone()
        };
        self.backend.set_attrs(fd, &desired)?;
        let observed = self.backend.get_attrs(fd)?;
        let record = self.record_mut(fd)?;
        if attrs_match(&observed, &desired) {
            Ok(())
        } else {
            record.desired = observed;
            Err(AppError::DriverNack(format!(
                "kernel did not accept all requested attributes on fd {}",
                fd
            )))
        }
    }

    pub fn flush(&mut self, fd: RawFd) -> Result<(), AppError> {
        self.backend.flush(fd).map_err(AppError::from)
    }

    pub fn break_signal(&mut self, fd: RawFd) -> Result<(), AppError> {
        self.backend.send_break(fd).map_err(AppError::from)
    }

    pub fn raise_dtr(&mut self, fd: RawFd) -> Result<(), AppError> {
        self.set_dtr(fd, true)
    }

    pub fn lower_dtr(&mut self, fd: RawFd) -> Result<(), AppError> {
        self.set_dtr(fd, false)
    }

    pub fn pulse_dtr(&mut self, fd: RawFd) -> Result<(), AppError> {
        self.lower_dtr(fd)?;
        self.backend.sleep(Duration::from_secs(1));
        self.raise_dtr(fd)
    }

    fn set_dtr(&mut self, fd: RawFd, up: bool) -> Result<(), AppError> {
        let mut bits = self.backend.modem_bits(fd)?;
        if up {
            bits |= libc::TIOCM_DTR;
        } else {
            bits &= !libc::TIOCM_DTR;
        }
        self.backend.set_modem_bits(fd, bits).map_err(AppError::from)
    }

    /// Convenience combining raw-mode, `cfg`'s line parameters, and
    /// modem-control flags for first-time setup.
    pub fn initial_configure(
        &mut self,
        fd: RawFd,
        cfg: &Config,
        local_mode: bool,
        hupcl: bool,
    ) -> Result<(), AppError> {
        self.set_raw(fd)?;
        self.set_baud(fd, cfg.baud)?;
        self.set_parity(fd, cfg.parity)?;
        self.set_databits(fd, cfg.databits)?;
        self.set_flow(fd, cfg.flow)?;
        self.set_hupcl(fd, hupcl)?;
        let record = self.record_mut(fd)?;
        record
            .desired
            .control_flags
            .set(ControlFlags::CLOCAL, local_mode);
        record.desired.control_flags.insert(ControlFlags::CREAD);
        record.desired.control_chars[CC::VTIME as usize] = 0;
        record.desired.control_chars[CC::VMIN as usize] = 1;
        Ok(())
    }
}

fn baud_to_rate(baud: u32) -> BaudRate {
    match baud {
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        _ => BaudRate::B115200,
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;

    /// A backend that keeps attributes in memory, for exercising the
    /// registry's bookkeeping without a real tty. `reject_mask`, when
    /// set, simulates a kernel that silently drops a subset of
    /// requested flag bits, to exercise `apply`'s rollback path.
    #[derive(Default)]
    pub struct MockBackend {
        pub attrs: Map<RawFd, Termios>,
        pub modem: Map<RawFd, libc::c_int>,
        pub reject_control_flags: Option<ControlFlags>,
        pub slept: RefCell<Vec<Duration>>,
    }

    impl MockBackend {
        pub fn seeded(fd: RawFd, attrs: Termios) -> Self {
            let mut m = Self::default();
            m.attrs.insert(fd, attrs);
            m.modem.insert(fd, 0);
            m
        }
    }

    impl TtyBackend for MockBackend {
        fn get_attrs(&self, fd: RawFd) -> nix::Result<Termios> {
            self.attrs
                .get(&fd)
                .cloned()
                .ok_or(nix::errno::Errno::EBADF)
        }

        fn set_attrs(&mut self, fd: RawFd, attrs: &Termios) -> nix::Result<()> {
            let mut stored = attrs.clone();
            if let Some(mask) = self.reject_control_flags {
                // Simulate the kernel silently refusing these bits.
                stored.control_flags.remove(mask);
            }
            self.attrs.insert(fd, stored);
            Ok(())
        }

        fn flush(&mut self, _fd: RawFd) -> nix::Result<()> {
            Ok(())
        }

        fn send_break(&mut self, _fd: RawFd) -> nix::Result<()> {
            Ok(())
        }

        fn modem_bits(&self, fd: RawFd) -> nix::Result<libc::c_int> {
            Ok(*self.modem.get(&fd).unwrap_or(&0))
        }

        fn set_modem_bits(&mut self, fd: RawFd, bits: libc::c_int) -> nix::Result<()> {
            self.modem.insert(fd, bits);
            Ok(())
        }

        fn sleep(&self, d: Duration) {
            self.slept.borrow_mut().push(d);
        }
    }

    pub fn blank_termios() -> Termios {
        // SAFETY: zero-initialized termios is a valid (if meaningless)
        // bit pattern; tests only compare flag fields, never feed this
        // to a real syscall.
        unsafe { std::mem::zeroed() }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    const FD: RawFd = 3;

    fn registry() -> TerminalRegistry<MockBackend> {
        TerminalRegistry::new(MockBackend::seeded(FD, blank_termios()))
    }

    #[test]
    fn register_then_deregister_restores_saved_byte_for_byte() {
        let mut reg = registry();
        reg.register(FD).unwrap();
        reg.set_baud(FD, 9600).unwrap();
        reg.apply(FD).unwrap();
        reg.deregister(FD);
        assert!(!reg.is_registered(FD));
        assert_eq!(reg.backend.attrs[&FD], blank_termios());
    }

    #[test]
    fn registering_twice_is_an_error() {
        let mut reg = registry();
        reg.register(FD).unwrap();
        assert!(reg.register(FD).is_err());
    }

    #[test]
    fn erase_forgets_without_touching_kernel() {
        let mut reg = registry();
        reg.register(FD).unwrap();
        reg.set_raw(FD).unwrap();
        reg.apply(FD).unwrap();
        let before = reg.backend.attrs[&FD].clone();
        reg.erase(FD);
        assert!(!reg.is_registered(FD));
        assert_eq!(reg.backend.attrs[&FD], before);
    }

    #[test]
    fn apply_rolls_back_desired_on_partial_kernel_rejection() {
        let mut reg = registry();
        reg.register(FD).unwrap();
        reg.backend.reject_control_flags = Some(ControlFlags::PARENB);
        reg.set_parity(FD, Parity::Even).unwrap();
        let err = reg.apply(FD);
        assert!(err.is_err());
        // desired was rolled back to the observed (rejected) state, so
        // a retried apply is a no-op, not a retry-forever loop.
        assert!(reg.apply(FD).is_ok());
    }

    #[test]
    fn set_raw_apply_is_idempotent() {
        let mut reg = registry();
        reg.register(FD).unwrap();
        reg.set_raw(FD).unwrap();
        reg.apply(FD).unwrap();
        let after_first = reg.backend.attrs[&FD].clone();
        reg.set_raw(FD).unwrap();
        reg.apply(FD).unwrap();
        assert_eq!(reg.backend.attrs[&FD], after_first);
    }

    #[test]
    fn pulse_dtr_lowers_sleeps_then_raises() {
        let mut reg = registry();
        reg.register(FD).unwrap();
        reg.raise_dtr(FD).unwrap();
        reg.pulse_dtr(FD).unwrap();
        assert_eq!(reg.backend.slept.borrow().len(), 1);
        assert_eq!(reg.backend.modem[&FD] & libc::TIOCM_DTR, libc::TIOCM_DTR);
    }
}
