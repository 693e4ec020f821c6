//! Colored status/diagnostic lines, written to stderr.
//!
//! Distinct from the in-band `\r\n*** ... ***\r\n` confirmations the
//! command interpreter writes to the controlling terminal: those are
//! part of the keyboard/screen protocol and go through the session's
//! own output, not here.
use colored::Colorize;

fn indent_with(header: colored::ColoredString, msg: String) {
    eprint!("{:>12} ", header);
    for (i, line) in msg.lines().enumerate() {
        if i == 0 {
            eprintln!("{}", line);
        } else {
            eprintln!("{:>12} {}", "", line);
        }
    }
}

pub fn status(header: &str, msg: String) {
    indent_with(header.green().bold(), msg);
}

pub fn warn(msg: String) {
    indent_with("Warning".yellow().bold(), msg);
}

pub fn err(msg: String) {
    indent_with("Error".red().bold(), msg);
}

pub fn hint(msg: String) {
    indent_with("Hint".blue().bold(), msg);
}
