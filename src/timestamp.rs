//! Inter-line timestamp annotation of bytes received from the serial
//! fd, inserted on the serial-to-screen path.

use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Timestamping has just been (re-)enabled; `t_ref` was captured at
    /// that moment and the next non-newline byte starts the first line.
    Reset,
    /// A previous line ended; the next non-newline byte starts a new
    /// one and should be prefixed from the same `t_ref`.
    AwaitingFirstByte,
    /// This line has already been prefixed; quiescent until `\n`/`\r`.
    AwaitingLineStart,
}

pub struct TimestampAnnotator {
    enabled: bool,
    state: State,
    t_ref: DateTime<Local>,
}

impl TimestampAnnotator {
    pub fn new() -> Self {
        Self {
            enabled: false,
            state: State::Reset,
            t_ref: Local::now(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Toggles timestamping. Enabling captures `now` as the reference
    /// instant against which every subsequent line is measured, until
    /// the next toggle-on.
    pub fn toggle(&mut self, now: DateTime<Local>) {
        self.enabled = !self.enabled;
        if self.enabled {
            self.t_ref = now;
            self.state = State::Reset;
        }
    }

    /// Processes one byte read from the serial fd, returning the prefix
    /// (if any) that should be written to the controlling terminal
    /// before the byte itself.
    pub fn annotate(&mut self, byte: u8, now: DateTime<Local>) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let is_newline = byte == b'\n' || byte == b'\r';
        let mut prefix = None;

        if !is_newline {
            match self.state {
                State::Reset | State::AwaitingFirstByte => {
                    prefix = Some(self.format_prefix(now));
                    self.state = State::AwaitingLineStart;
                }
                State::AwaitingLineStart => {}
            }
        } else {
            self.state = State::AwaitingFirstByte;
        }

        prefix
    }

    fn format_prefix(&self, now: DateTime<Local>) -> String {
        let (minutes, seconds, millis) = elapsed_parts(self.t_ref, now);
        format!("\x1b[36m{}:{:02}.{:03} \x1b[0m", minutes, seconds, millis)
    }
}

impl Default for TimestampAnnotator {
    fn default() -> Self {
        Self::new()
    }
}

/// `(minutes, seconds, millis)` elapsed between `t_ref` and `now`,
/// borrowing a second when the millisecond part would go negative —
/// matching a naive "separate sec + millis" subtraction rather than
/// working in a single signed-duration unit.
fn elapsed_parts(t_ref: DateTime<Local>, now: DateTime<Local>) -> (i64, i64, i64) {
    let mut diff_sec = now.timestamp() - t_ref.timestamp();
    let now_ms = now.timestamp_subsec_millis() as i64;
    let ref_ms = t_ref.timestamp_subsec_millis() as i64;
    let diff_ms = if now_ms < ref_ms {
        diff_sec -= 1;
        1000 + now_ms - ref_ms
    } else {
        now_ms - ref_ms
    };
    (diff_sec / 60, diff_sec % 60, diff_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64, millis: u32) -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000 + secs, millis * 1_000_000).unwrap()
    }

    #[test]
    fn disabled_emits_no_prefixes() {
        let mut ta = TimestampAnnotator::new();
        assert!(ta.annotate(b'X', at(0, 0)).is_none());
    }

    #[test]
    fn one_prefix_per_line_measured_from_enable_time() {
        let mut ta = TimestampAnnotator::new();
        ta.toggle(at(10, 0));

        let p1 = ta.annotate(b'X', at(10, 250)).unwrap();
        assert_eq!(p1, "\x1b[36m0:00.250 \x1b[0m");
        // Same line: no further prefix.
        assert!(ta.annotate(b'Y', at(10, 300)).is_none());

        ta.annotate(b'\n', at(10, 400));
        let p2 = ta.annotate(b'Z', at(10, 500)).unwrap();
        assert_eq!(p2, "\x1b[36m0:00.500 \x1b[0m");
    }

    #[test]
    fn millisecond_borrow_across_second_boundary() {
        let mut ta = TimestampAnnotator::new();
        ta.toggle(at(0, 900)); // t_ref = 0.900
        let prefix = ta.annotate(b'X', at(1, 100)).unwrap();
        // elapsed = 1.100 - 0.900 = 0.200s
        assert_eq!(prefix, "\x1b[36m0:00.200 \x1b[0m");
    }

    #[test]
    fn toggle_off_then_on_resets_reference() {
        let mut ta = TimestampAnnotator::new();
        ta.toggle(at(0, 0));
        ta.annotate(b'X', at(0, 50));
        ta.toggle(at(4, 0));
        assert!(!ta.enabled());
        ta.toggle(at(5, 0));
        assert!(ta.enabled());
        let prefix = ta.annotate(b'Y', at(5, 0)).unwrap();
        assert_eq!(prefix, "\x1b[36m0:00.000 \x1b[0m");
    }
}
