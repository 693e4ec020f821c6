//! The two-state command interpreter: `Transparent` (bytes from the
//! controlling terminal are queued for the serial fd) and `Command`
//! (the next byte, unless it's the escape itself, is a directive).

use crate::config::{baud_down, baud_up, databits_next, Config};
use crate::error::AppError;
use crate::queue::OutboundQueue;
use crate::tda::{TerminalRegistry, TtyBackend};

use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Command,
    Transparent,
}

/// What the main loop should do after a keystroke has been dispatched.
pub enum Action {
    /// Nothing further; keep looping.
    Continue,
    /// C-x: drop the line and return to the caller so it can shut down
    /// after restoring both terminals.
    ExitAndReset,
    /// C-q: return without touching the serial fd's configuration.
    ExitNoReset,
    /// C-s: prompt for a filename on the controlling terminal, then
    /// hand off to `send_cmd`.
    PromptSend,
    /// C-r: prompt for a filename, then hand off to `send_cmd` or
    /// `receive_cmd` depending on what was typed (see [`receive_argv`]).
    PromptReceive,
}

/// Bytes written to the controlling terminal in response to a command
/// are handed back as a plain string; the caller writes them verbatim.
pub struct Response {
    pub action: Action,
    pub output: String,
}

impl Response {
    fn cont(output: String) -> Self {
        Self {
            action: Action::Continue,
            output,
        }
    }
}

pub struct Interpreter {
    pub state: State,
    dtr_up: bool,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            state: State::Transparent,
            dtr_up: false,
        }
    }

    /// Handles one byte read from the controlling terminal. `serial_fd`
    /// is the fd the reconfiguration commands act on; `oq` is the queue
    /// draining toward it.
    pub fn handle<B: TtyBackend>(
        &mut self,
        byte: u8,
        cfg: &mut Config,
        registry: &mut TerminalRegistry<B>,
        serial_fd: RawFd,
        oq: &mut OutboundQueue,
        timestamp: &mut crate::timestamp::TimestampAnnotator,
        now: chrono::DateTime<chrono::Local>,
    ) -> Response {
        match self.state {
            State::Command => {
                if byte == cfg.escape {
                    self.state = State::Transparent;
                    if !oq.push(byte) {
                        return Response::cont("\x07".to_string());
                    }
                    return Response::cont(String::new());
                }
                self.state = State::Transparent;
                self.dispatch(byte, cfg, registry, serial_fd, oq, timestamp, now)
            }
            State::Transparent => {
                if byte == cfg.escape {
                    self.state = State::Command;
                    Response::cont(String::new())
                } else if oq.push(byte) {
                    Response::cont(String::new())
                } else {
                    Response::cont("\x07".to_string())
                }
            }
        }
    }

    fn dispatch<B: TtyBackend>(
        &mut self,
        byte: u8,
        cfg: &mut Config,
        registry: &mut TerminalRegistry<B>,
        serial_fd: RawFd,
        oq: &mut OutboundQueue,
        timestamp: &mut crate::timestamp::TimestampAnnotator,
        now: chrono::DateTime<chrono::Local>,
    ) -> Response {
        const KEY_EXIT: u8 = 0x18; // C-x
        const KEY_QUIT: u8 = 0x11; // C-q
        const KEY_PULSE: u8 = 0x10; // C-p
        const KEY_TOGGLE: u8 = 0x14; // C-t
        const KEY_BAUD_UP: u8 = 0x15; // C-u
        const KEY_BAUD_DN: u8 = 0x04; // C-d
        const KEY_FLOW: u8 = 0x06; // C-f
        const KEY_PARITY: u8 = 0x19; // C-y
        const KEY_BITS: u8 = 0x02; // C-b
        const KEY_STATUS: u8 = 0x16; // C-v
        const KEY_SEND: u8 = 0x13; // C-s
        const KEY_RECEIVE: u8 = 0x12; // C-r
        const KEY_BREAK: u8 = 0x1c; // C-\
        const KEY_TIMESTAMP: u8 = 0x09; // C-i

        match byte {
            KEY_EXIT => Response {
                action: Action::ExitAndReset,
                output: String::new(),
            },
            KEY_QUIT => {
                let _ = registry.set_hupcl(serial_fd, false);
                let _ = registry.flush(serial_fd);
                let _ = registry.apply(serial_fd);
                registry.erase(serial_fd);
                Response {
                    action: Action::ExitNoReset,
                    output: String::new(),
                }
            }
            KEY_STATUS => Response::cont(format!(
                "\r\n*** baud: {}\r\n*** flow: {}\r\n*** parity: {}\r\n*** databits: {}\r\n*** dtr: {}\r\n*** timestamp: {}\r\n",
                cfg.baud,
                cfg.flow.as_str(),
                cfg.parity.as_str(),
                cfg.databits,
                if self.dtr_up { "up" } else { "down" },
                if cfg.timestamp { "on" } else { "off" },
            )),
            KEY_PULSE => {
                let mut out = "\r\n*** pulse DTR ***\r\n".to_string();
                if registry.pulse_dtr(serial_fd).is_err() {
                    out.push_str("*** FAILED\r\n");
                }
                Response::cont(out)
            }
            KEY_TOGGLE => {
                let r = if self.dtr_up {
                    registry.lower_dtr(serial_fd)
                } else {
                    registry.raise_dtr(serial_fd)
                };
                if r.is_ok() {
                    self.dtr_up = !self.dtr_up;
                }
                Response::cont(format!(
                    "\r\n*** DTR: {} ***\r\n",
                    if self.dtr_up { "up" } else { "down" }
                ))
            }
            KEY_BAUD_UP => {
                let newbaud = baud_up(cfg.baud);
                Response::cont(self.reconfigure_baud(cfg, registry, serial_fd, oq, newbaud))
            }
            KEY_BAUD_DN => {
                let newbaud = baud_down(cfg.baud);
                Response::cont(self.reconfigure_baud(cfg, registry, serial_fd, oq, newbaud))
            }
            KEY_FLOW => {
                let newflow = cfg.flow.next();
                let _ = registry.set_flow(serial_fd, newflow);
                oq.clear();
                let _ = registry.flush(serial_fd);
                let output = if registry.apply(serial_fd).is_ok() {
                    cfg.flow = newflow;
                    format!("\r\n*** flow: {} ***\r\n", cfg.flow.as_str())
                } else {
                    String::new()
                };
                Response::cont(output)
            }
            KEY_PARITY => {
                let newparity = cfg.parity.next();
                let _ = registry.set_parity(serial_fd, newparity);
                oq.clear();
                let _ = registry.flush(serial_fd);
                let output = if registry.apply(serial_fd).is_ok() {
                    cfg.parity = newparity;
                    format!("\r\n*** parity: {} ***\r\n", cfg.parity.as_str())
                } else {
                    String::new()
                };
                Response::cont(output)
            }
            KEY_BITS => {
                let newbits = databits_next(cfg.databits);
                let _ = registry.set_databits(serial_fd, newbits);
                oq.clear();
                let _ = registry.flush(serial_fd);
                let output = if registry.apply(serial_fd).is_ok() {
                    cfg.databits = newbits;
                    format!("\r\n*** databits: {} ***\r\n", cfg.databits)
                } else {
                    String::new()
                };
                Response::cont(output)
            }
            KEY_SEND => Response {
                action: Action::PromptSend,
                output: "\r\n*** file: ".to_string(),
            },
            KEY_RECEIVE => Response {
                action: Action::PromptReceive,
                output: "*** file: ".to_string(),
            },
            KEY_BREAK => {
                let _ = registry.break_signal(serial_fd);
                Response::cont("\r\n*** break sent ***\r\n".to_string())
            }
            KEY_TIMESTAMP => {
                if cfg.timestamp {
                    cfg.timestamp = false;
                    timestamp.toggle(now);
                    Response::cont("\r\n*** Time Stamp Disable ***\r\n".to_string())
                } else {
                    cfg.timestamp = true;
                    timestamp.toggle(now);
                    Response::cont("\r\n*** Time Stamp Enable ***\r\n".to_string())
                }
            }
            _ => Response::cont(String::new()),
        }
    }

    /// The baud commands share a reconfigure-then-confirm shape: stage
    /// the new rate, drop whatever was queued for the old one, apply,
    /// and report the rate only if the kernel actually accepted it; on
    /// a `DriverNack` the config is left untouched and nothing is
    /// printed.
    fn reconfigure_baud<B: TtyBackend>(
        &mut self,
        cfg: &mut Config,
        registry: &mut TerminalRegistry<B>,
        serial_fd: RawFd,
        oq: &mut OutboundQueue,
        newbaud: u32,
    ) -> String {
        let _ = registry.set_baud(serial_fd, newbaud);
        oq.clear();
        let _ = registry.flush(serial_fd);
        if registry.apply(serial_fd).is_ok() {
            cfg.baud = newbaud;
            format!("\r\n*** baud: {} ***\r\n", cfg.baud)
        } else {
            String::new()
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the filename prompt used by the send/receive commands: echoes
/// printable input, handles backspace (`\b \b`, or BEL at the left
/// edge) and BEL on overflow, and returns the collected name on `\r`.
///
/// Mirrors `fd_readline`'s read-one-byte-at-a-time shape; `read_byte`
/// is expected to retry internally on `EINTR` and return `Ok(None)` on
/// EOF. `echo` is called for every byte written back to the
/// controlling terminal, in order.
pub fn read_filename<R, E>(max_len: usize, mut read_byte: R, mut echo: E) -> Result<String, AppError>
where
    R: FnMut() -> Result<Option<u8>, AppError>,
    E: FnMut(u8),
{
    let mut name: Vec<u8> = Vec::with_capacity(max_len);
    loop {
        let byte = match read_byte()? {
            Some(b) => b,
            None => {
                return Err(AppError::UserInput(
                    "eof while reading filename".to_string(),
                ))
            }
        };
        match byte {
            b'\r' => break,
            0x08 | 0x7f => {
                if name.pop().is_some() {
                    echo(0x08);
                    echo(b' ');
                    echo(0x08);
                } else {
                    echo(0x07);
                }
            }
            _ => {
                if name.len() + 1 < max_len {
                    name.push(byte);
                    echo(byte);
                } else {
                    echo(0x07);
                }
            }
        }
    }
    String::from_utf8(name).map_err(|e| AppError::UserInput(e.to_string()))
}

/// Dispatches the send/receive hand-off once a filename has been
/// collected, reproducing the historical Ctrl-R mix-up (an empty
/// filename falls through to `receive_cmd`, but a non-empty one is
/// run against `send_cmd` instead of `receive_cmd`) only when
/// `compat_receive_bug` is set.
pub fn receive_argv(cfg: &Config, filename: &str) -> (String, Vec<String>) {
    if filename.is_empty() {
        (cfg.receive_cmd.clone(), vec![])
    } else if cfg.compat_receive_bug {
        (cfg.send_cmd.clone(), vec![filename.to_string()])
    } else {
        (cfg.receive_cmd.clone(), vec![filename.to_string()])
    }
}

pub fn send_argv(cfg: &Config, filename: &str) -> (String, Vec<String>) {
    (cfg.send_cmd.clone(), vec![filename.to_string()])
}
