//! Session configuration: the mutable knobs the command interpreter
//! turns, and the pure little state machines (baud ladder, flow/parity
//! cycles) that drive them.

use std::path::PathBuf;

pub const BAUD_LADDER: [u32; 10] = [
    300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    None,
    RtsCts,
    XonXoff,
}

impl Flow {
    pub fn as_str(self) -> &'static str {
        match self {
            Flow::None => "none",
            Flow::RtsCts => "RTS/CTS",
            Flow::XonXoff => "xon/xoff",
        }
    }

    /// Advances the cycle None -> RtsCts -> XonXoff -> None.
    pub fn next(self) -> Flow {
        match self {
            Flow::None => Flow::RtsCts,
            Flow::RtsCts => Flow::XonXoff,
            Flow::XonXoff => Flow::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    pub fn as_str(self) -> &'static str {
        match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
        }
    }

    /// Advances the cycle None -> Even -> Odd -> None.
    pub fn next(self) -> Parity {
        match self {
            Parity::None => Parity::Even,
            Parity::Even => Parity::Odd,
            Parity::Odd => Parity::None,
        }
    }
}

/// Snaps a requested baud rate onto the nearest rung of the allowed
/// ladder, as used by both `set_baud` and the up/down walkers.
pub fn clamp_to_ladder(baud: u32) -> u32 {
    if baud <= BAUD_LADDER[0] {
        return BAUD_LADDER[0];
    }
    if baud >= *BAUD_LADDER.last().unwrap() {
        return *BAUD_LADDER.last().unwrap();
    }
    // Snap down to the nearest rung at or below the requested value.
    *BAUD_LADDER.iter().rev().find(|&&b| b <= baud).unwrap()
}

pub fn baud_up(baud: u32) -> u32 {
    let baud = if baud < 300 {
        300
    } else if baud == 38400 {
        57600
    } else {
        baud.saturating_mul(2)
    };
    baud.min(115200)
}

pub fn baud_down(baud: u32) -> u32 {
    let baud = if baud > 115200 {
        115200
    } else if baud == 57600 {
        38400
    } else {
        baud / 2
    };
    baud.max(300)
}

/// `5 -> 6 -> 7 -> 8 -> 5`.
pub fn databits_next(databits: u8) -> u8 {
    if databits >= 8 {
        5
    } else {
        databits + 1
    }
}

/// Parses an escape letter (as given on the CLI) into the control byte
/// it denotes: lowercased, then `letter - 'a' + 1`.
pub fn parse_escape(letter: char) -> u8 {
    let lower = letter.to_ascii_lowercase();
    (lower as u8).wrapping_sub(b'a').wrapping_add(1)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device: PathBuf,
    pub baud: u32,
    pub flow: Flow,
    pub parity: Parity,
    pub databits: u8,
    pub escape: u8,
    pub noinit: bool,
    pub noreset: bool,
    pub nolock: bool,
    pub send_cmd: String,
    pub receive_cmd: String,
    pub timestamp: bool,
    pub compat_receive_bug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::new(),
            baud: 115200,
            flow: Flow::None,
            parity: Parity::None,
            databits: 8,
            escape: parse_escape('a'),
            noinit: false,
            noreset: false,
            nolock: false,
            send_cmd: "ascii_xfr -s -v -l10".to_string(),
            receive_cmd: "rz -vv".to_string(),
            timestamp: false,
            compat_receive_bug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_up_ladder() {
        assert_eq!(baud_up(200), 300);
        assert_eq!(baud_up(38400), 57600);
        assert_eq!(baud_up(115200), 115200);
        assert_eq!(baud_up(9600), 19200);
    }

    #[test]
    fn baud_down_ladder() {
        assert_eq!(baud_down(300), 300);
        assert_eq!(baud_down(57600), 38400);
        assert_eq!(baud_down(200000), 115200);
        assert_eq!(baud_down(19200), 9600);
    }

    #[test]
    fn baud_up_down_roundtrip() {
        for &b in BAUD_LADDER.iter().filter(|&&b| b != 300 && b != 115200) {
            assert_eq!(baud_up(baud_down(b)), b);
            assert_eq!(baud_down(baud_up(b)), b);
        }
    }

    #[test]
    fn databits_cycle() {
        assert_eq!(databits_next(5), 6);
        assert_eq!(databits_next(6), 7);
        assert_eq!(databits_next(7), 8);
        assert_eq!(databits_next(8), 5);
    }

    #[test]
    fn flow_cycle() {
        assert_eq!(Flow::None.next(), Flow::RtsCts);
        assert_eq!(Flow::RtsCts.next(), Flow::XonXoff);
        assert_eq!(Flow::XonXoff.next(), Flow::None);
    }

    #[test]
    fn parity_cycle() {
        assert_eq!(Parity::None.next(), Parity::Even);
        assert_eq!(Parity::Even.next(), Parity::Odd);
        assert_eq!(Parity::Odd.next(), Parity::None);
    }

    #[test]
    fn escape_letter_parses_to_control_byte() {
        assert_eq!(parse_escape('a'), 0x01);
        assert_eq!(parse_escape('A'), 0x01);
        assert_eq!(parse_escape('x'), b'x' - b'a' + 1);
    }

    #[test]
    fn clamp_snaps_into_ladder() {
        assert_eq!(clamp_to_ladder(0), 300);
        assert_eq!(clamp_to_ladder(999_999), 115200);
        assert_eq!(clamp_to_ladder(5000), 4800);
    }
}
