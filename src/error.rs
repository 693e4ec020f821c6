use crate::diag::DiagnosableError;

use thiserror::Error;

/// The four error kinds named by the session's error handling design:
/// `Io`, `DriverNack`, `UserInput`, `Fatal`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Errno(#[from] nix::Error),

    #[error("terminal driver refused {0}")]
    DriverNack(String),

    #[error("bad input at filename prompt: {0}")]
    UserInput(String),

    #[error("{0}")]
    Fatal(String),
}

impl DiagnosableError for AppError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            AppError::DriverNack(op) if op.contains("baud") => {
                vec!["requested baud rate is outside the supported ladder".to_string()]
            }
            AppError::Fatal(_) => {
                vec!["both terminals were restored before this message was printed".to_string()]
            }
            _ => vec![],
        }
    }
}

impl AppError {
    /// Reports a fatal condition on both channels: the in-band
    /// `\r\nFATAL: …\r\n` line the controlling terminal's user is
    /// watching, and the stderr diagnostic (with hints) for whoever is
    /// looking at logs.
    pub fn render(&self) {
        use std::io::Write;
        let _ = write!(std::io::stdout(), "\r\nFATAL: {}\r\n", self);
        let _ = std::io::stdout().flush();

        crate::log::err(format!("{}", self));
        for hint in self.diagnose() {
            crate::log::hint(hint);
        }
    }
}
