//! TELNET wire constants and sequence types (RFC 854 / RFC 855).
//!
//! Everything on a TELNET connection is plain data until an IAC byte
//! (255) appears; the bytes after it form a command, a negotiation
//! triple, or a bracketed subnegotiation. A data byte of 255 is escaped
//! by doubling it.

use std::fmt;

/// Interpret As Command (RFC 854). Escaped in data as `IAC IAC`.
pub const IAC: u8 = 255;

/// TELNET commands that may follow an IAC byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// End of file from the client side.
    Eof = 236,
    /// Suspend the current process.
    Susp = 237,
    /// Abort the current process.
    Abort = 238,
    /// End of record marker.
    Eor = 239,
    /// End of subnegotiation parameters.
    Se = 240,
    /// No operation; sometimes used as a keepalive.
    Nop = 241,
    /// Data mark for the Synch mechanism.
    Dm = 242,
    /// Break / attention signal.
    Brk = 243,
    /// Interrupt process.
    Ip = 244,
    /// Abort output but let the process finish.
    Ao = 245,
    /// Are you there.
    Ayt = 246,
    /// Erase the last character entered.
    Ec = 247,
    /// Erase the current line.
    El = 248,
    /// Go ahead (half-duplex turn marker).
    Ga = 249,
    /// Begin subnegotiation.
    Sb = 250,
    Will = 251,
    Wont = 252,
    Do = 253,
    Dont = 254,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            236 => Some(Command::Eof),
            237 => Some(Command::Susp),
            238 => Some(Command::Abort),
            239 => Some(Command::Eor),
            240 => Some(Command::Se),
            241 => Some(Command::Nop),
            242 => Some(Command::Dm),
            243 => Some(Command::Brk),
            244 => Some(Command::Ip),
            245 => Some(Command::Ao),
            246 => Some(Command::Ayt),
            247 => Some(Command::Ec),
            248 => Some(Command::El),
            249 => Some(Command::Ga),
            250 => Some(Command::Sb),
            251 => Some(Command::Will),
            252 => Some(Command::Wont),
            253 => Some(Command::Do),
            254 => Some(Command::Dont),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// WILL / WONT / DO / DONT carry an option byte.
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            Command::Will | Command::Wont | Command::Do | Command::Dont
        )
    }
}

/// A TELNET option code.
///
/// Kept as a transparent byte rather than a closed enum: the negotiator
/// must be able to refuse options it has never heard of, which means it
/// has to represent them first.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TelnetOption(pub u8);

pub const BINARY: TelnetOption = TelnetOption(0);
/// Echo (RFC 857). Who echoes typed characters; key for password entry.
pub const ECHO: TelnetOption = TelnetOption(1);
/// Suppress go-ahead (RFC 858). Full-duplex character mode.
pub const SGA: TelnetOption = TelnetOption(3);
/// Status (RFC 859).
pub const STATUS: TelnetOption = TelnetOption(5);
/// Terminal type (RFC 1091).
pub const TTYPE: TelnetOption = TelnetOption(24);
/// Negotiate about window size (RFC 1073).
pub const NAWS: TelnetOption = TelnetOption(31);
/// Remote flow control (RFC 1372).
pub const LFLOW: TelnetOption = TelnetOption(33);

impl TelnetOption {
    /// Human-readable name for logging.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "BINARY",
            1 => "ECHO",
            3 => "SGA",
            5 => "STATUS",
            24 => "TTYPE",
            31 => "NAWS",
            33 => "LFLOW",
            _ => "?",
        }
    }
}

impl fmt::Debug for TelnetOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name == "?" {
            write!(f, "TelnetOption({})", self.0)
        } else {
            write!(f, "{}", name)
        }
    }
}

impl fmt::Display for TelnetOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name == "?" {
            write!(f, "option {}", self.0)
        } else {
            write!(f, "{}", name)
        }
    }
}

/// A complete command sequence lifted out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequence {
    /// `IAC <command>` with no operand.
    Command(Command),
    /// `IAC WILL/WONT/DO/DONT <option>`.
    Negotiation {
        command: Command,
        option: TelnetOption,
    },
    /// `IAC SB <option> <data...> IAC SE`.
    Subnegotiation { option: TelnetOption, data: Vec<u8> },
    /// `IAC <byte>` where the byte is not a known command. Logged and
    /// dropped upstream.
    Unknown(u8),
}

impl Sequence {
    /// Serialize for transmission. Subnegotiation payload bytes of 255
    /// are doubled per RFC 854.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Sequence::Command(cmd) => vec![IAC, cmd.to_byte()],
            Sequence::Negotiation { command, option } => {
                vec![IAC, command.to_byte(), option.0]
            }
            Sequence::Subnegotiation { option, data } => {
                let mut bytes = Vec::with_capacity(data.len() + 5);
                bytes.push(IAC);
                bytes.push(Command::Sb.to_byte());
                bytes.push(option.0);
                for &b in data {
                    bytes.push(b);
                    if b == IAC {
                        bytes.push(IAC);
                    }
                }
                bytes.push(IAC);
                bytes.push(Command::Se.to_byte());
                bytes
            }
            Sequence::Unknown(byte) => vec![IAC, *byte],
        }
    }
}

/// Copy `data` into `out`, doubling any literal IAC bytes.
pub fn escape_iac(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        for byte in 236..=254u8 {
            let cmd = Command::from_byte(byte).unwrap();
            assert_eq!(cmd.to_byte(), byte);
        }
        assert_eq!(Command::from_byte(100), None);
        assert_eq!(Command::from_byte(255), None);
    }

    #[test]
    fn negotiation_commands() {
        assert!(Command::Will.is_negotiation());
        assert!(Command::Dont.is_negotiation());
        assert!(!Command::Sb.is_negotiation());
        assert!(!Command::Ayt.is_negotiation());
    }

    #[test]
    fn sequence_serialization() {
        assert_eq!(
            Sequence::Command(Command::Nop).to_bytes(),
            vec![255, 241]
        );
        assert_eq!(
            Sequence::Negotiation {
                command: Command::Do,
                option: NAWS
            }
            .to_bytes(),
            vec![255, 253, 31]
        );
        assert_eq!(
            Sequence::Subnegotiation {
                option: TTYPE,
                data: vec![1]
            }
            .to_bytes(),
            vec![255, 250, 24, 1, 255, 240]
        );
    }

    #[test]
    fn subnegotiation_payload_iac_is_doubled() {
        let seq = Sequence::Subnegotiation {
            option: STATUS,
            data: vec![255, 7],
        };
        assert_eq!(seq.to_bytes(), vec![255, 250, 5, 255, 255, 7, 255, 240]);
    }

    #[test]
    fn escape_doubles_iac() {
        let mut out = Vec::new();
        escape_iac(&[1, 255, 2], &mut out);
        assert_eq!(out, vec![1, 255, 255, 2]);
    }

    #[test]
    fn option_names() {
        assert_eq!(ECHO.name(), "ECHO");
        assert_eq!(NAWS.name(), "NAWS");
        assert_eq!(TelnetOption(200).name(), "?");
    }
}
