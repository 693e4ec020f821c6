use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use structopt::StructOpt;

mod config;
mod diag;
mod error;
mod interpreter;
mod lockfile;
mod log;
mod queue;
mod scc;
mod session;
mod tda;
mod timestamp;

use config::{Config, Flow, Parity};
use error::AppError;
use tda::{NixBackend, TerminalRegistry};

const UUCP_LOCK_DIR: &str = "/var/lock";

#[derive(Debug, StructOpt)]
#[structopt(name = "ttybridge", about = "Dumb-terminal bridge to a serial tty")]
struct Opt {
    /// Serial device to bridge to, e.g. /dev/ttyUSB0.
    device: PathBuf,

    /// Baud rate.
    #[structopt(long, short = "b", default_value = "115200")]
    baud: u32,

    /// Flow control: none, hard (RTS/CTS), or soft (xon/xoff).
    #[structopt(long, short = "f", default_value = "none")]
    flow: FlowArg,

    /// Parity: none, even, or odd.
    #[structopt(long, short = "p", default_value = "none")]
    parity: ParityArg,

    /// Number of data bits: 5, 6, 7, or 8.
    #[structopt(long, short = "d", default_value = "8")]
    databits: u8,

    /// Escape character, as a letter (C-<letter> enters command mode).
    #[structopt(long, short = "e", default_value = "a")]
    escape: char,

    /// Don't initialize the terminal at startup.
    #[structopt(long, short = "i")]
    noinit: bool,

    /// Don't reset the terminal on exit.
    #[structopt(long, short = "r")]
    noreset: bool,

    /// Don't acquire a device lockfile.
    #[structopt(long, short = "l")]
    nolock: bool,

    /// Command used to send a file (C-s).
    #[structopt(long, short = "s", default_value = "ascii_xfr -s -v -l10")]
    send_cmd: String,

    /// Command used to receive a file (C-r).
    #[structopt(long, short = "v", default_value = "rz -vv")]
    receive_cmd: String,

    /// Prefix each received line with an elapsed-time timestamp.
    #[structopt(long, short = "t")]
    timestamp: bool,

    /// Reproduce the historical Ctrl-R bug: a typed filename runs
    /// against send_cmd instead of receive_cmd.
    #[structopt(long)]
    compat_receive_bug: bool,
}

#[derive(Debug)]
struct FlowArg(Flow);
impl std::str::FromStr for FlowArg {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(FlowArg(Flow::None)),
            "hard" | "rtscts" => Ok(FlowArg(Flow::RtsCts)),
            "soft" | "xonxoff" => Ok(FlowArg(Flow::XonXoff)),
            other => Err(format!("unknown flow control: {}", other)),
        }
    }
}

#[derive(Debug)]
struct ParityArg(Parity);
impl std::str::FromStr for ParityArg {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ParityArg(Parity::None)),
            "even" => Ok(ParityArg(Parity::Even)),
            "odd" => Ok(ParityArg(Parity::Odd)),
            other => Err(format!("unknown parity: {}", other)),
        }
    }
}

impl From<Opt> for Config {
    fn from(opt: Opt) -> Self {
        Config {
            device: opt.device,
            baud: opt.baud,
            flow: opt.flow.0,
            parity: opt.parity.0,
            databits: opt.databits,
            escape: config::parse_escape(opt.escape),
            noinit: opt.noinit,
            noreset: opt.noreset,
            nolock: opt.nolock,
            send_cmd: opt.send_cmd,
            receive_cmd: opt.receive_cmd,
            timestamp: opt.timestamp,
            compat_receive_bug: opt.compat_receive_bug,
        }
    }
}

fn main() {
    let opt = Opt::from_args();
    if let Err(e) = run(opt.into()) {
        e.render();
        fatal_exit();
    }
}

/// Sleeps one second (giving in-flight writes a chance to drain) and
/// exits non-zero. Mirrors the original's `fatal()`, which is always
/// reached after both terminals have already been restored.
fn fatal_exit() -> ! {
    std::thread::sleep(std::time::Duration::from_secs(1));
    std::process::exit(1);
}

fn run(mut cfg: Config) -> Result<(), AppError> {
    scc::install()?;

    let lock_path = if cfg.nolock {
        None
    } else {
        lockfile::lockname(UUCP_LOCK_DIR, &cfg.device)
    };
    let held_lock = lockfile::acquire(lock_path).map_err(|e| {
        AppError::Fatal(format!(
            "cannot lock {}: {}",
            cfg.device.display(),
            e
        ))
    })?;

    let result = bridge(&mut cfg);
    lockfile::release(&held_lock);
    result
}

fn bridge(cfg: &mut Config) -> Result<(), AppError> {
    let serial = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(&cfg.device)?;
    let serial_fd = serial.as_raw_fd();
    let controlling_fd = std::io::stdin().as_raw_fd();

    let mut registry = TerminalRegistry::new(NixBackend);
    registry.register(controlling_fd)?;
    registry.register(serial_fd)?;

    registry.set_raw(controlling_fd)?;
    registry.apply(controlling_fd)?;

    if !cfg.noinit {
        registry.initial_configure(serial_fd, cfg, true, !cfg.noreset)?;
        registry.apply(serial_fd)?;
    }

    log::status("Ready", format!("{}", cfg.device.display()));

    let mut session = session::Session::new(cfg.clone(), registry, controlling_fd, serial_fd);
    let reset_serial = match session.run() {
        Ok(reset) => reset,
        Err(e) => {
            session.registry.deregister(controlling_fd);
            session.registry.deregister(serial_fd);
            return Err(e);
        }
    };

    session.registry.deregister(controlling_fd);
    if reset_serial && !cfg.noreset {
        session.registry.deregister(serial_fd);
    } else {
        session.registry.erase(serial_fd);
    }

    log::status("Done", "session closed".to_string());
    Ok(())
}
