//! Suboption payload codecs for the options this crate negotiates.

use std::fmt;

use crate::protocol::{NAWS, Sequence, TTYPE, TelnetOption};

/// TTYPE subnegotiation verbs (RFC 1091).
pub const TTYPE_IS: u8 = 0;
pub const TTYPE_SEND: u8 = 1;

/// Acceptable NAWS dimensions. Reports outside these ranges are kept
/// out of the terminal state; the previous size stands.
pub const NAWS_WIDTH: std::ops::Range<u16> = 15..1024;
pub const NAWS_HEIGHT: std::ops::Range<u16> = 3..1024;

/// A decoded `IAC SB ... IAC SE` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suboption {
    /// Window size report: width and height in characters.
    Naws { width: u16, height: u16 },
    /// The peer's terminal type name, lowercased.
    TtypeIs(String),
    /// A TTYPE SEND aimed at us. Clients answer SEND, they do not issue
    /// it; receiving one is a protocol error.
    TtypeSend,
    /// Any option we carry no decoder for.
    Other { option: TelnetOption, data: Vec<u8> },
}

/// Suboption decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuboptionError {
    pub option: TelnetOption,
    pub message: String,
}

impl fmt::Display for SuboptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad {} suboption: {}", self.option, self.message)
    }
}

impl std::error::Error for SuboptionError {}

/// Decode a subnegotiation payload by option.
pub fn decode(option: TelnetOption, data: &[u8]) -> Result<Suboption, SuboptionError> {
    match option {
        NAWS => {
            if data.len() != 4 {
                return Err(SuboptionError {
                    option,
                    message: format!("expected 4 bytes, got {}", data.len()),
                });
            }
            let width = u16::from_be_bytes([data[0], data[1]]);
            let height = u16::from_be_bytes([data[2], data[3]]);
            Ok(Suboption::Naws { width, height })
        }
        TTYPE => match data.first() {
            Some(&TTYPE_IS) => {
                let name = String::from_utf8_lossy(&data[1..])
                    .trim()
                    .to_ascii_lowercase();
                Ok(Suboption::TtypeIs(name))
            }
            Some(&TTYPE_SEND) => Ok(Suboption::TtypeSend),
            Some(&verb) => Err(SuboptionError {
                option,
                message: format!("unknown verb {}", verb),
            }),
            None => Err(SuboptionError {
                option,
                message: "empty payload".to_string(),
            }),
        },
        _ => Ok(Suboption::Other {
            option,
            data: data.to_vec(),
        }),
    }
}

/// True when a reported window size is usable.
pub fn naws_in_range(width: u16, height: u16) -> bool {
    NAWS_WIDTH.contains(&width) && NAWS_HEIGHT.contains(&height)
}

/// Build the `IAC SB TTYPE SEND IAC SE` query asking the peer for its
/// terminal type.
pub fn ttype_send() -> Sequence {
    Sequence::Subnegotiation {
        option: TTYPE,
        data: vec![TTYPE_SEND],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TelnetOption;

    #[test]
    fn naws_decodes_big_endian() {
        let sub = decode(NAWS, &[0x00, 0x50, 0x00, 0x18]).unwrap();
        assert_eq!(
            sub,
            Suboption::Naws {
                width: 80,
                height: 24
            }
        );
    }

    #[test]
    fn naws_wrong_length_is_an_error() {
        assert!(decode(NAWS, &[0, 80, 0]).is_err());
        assert!(decode(NAWS, &[0, 80, 0, 24, 0]).is_err());
    }

    #[test]
    fn naws_range_check() {
        assert!(naws_in_range(80, 24));
        assert!(naws_in_range(15, 3));
        assert!(naws_in_range(1023, 1023));
        assert!(!naws_in_range(10, 24)); // too narrow
        assert!(!naws_in_range(80, 2)); // too short
        assert!(!naws_in_range(1024, 24));
        assert!(!naws_in_range(0, 0));
    }

    #[test]
    fn ttype_is_lowercases() {
        let sub = decode(TTYPE, &[TTYPE_IS, b'X', b'T', b'E', b'R', b'M']).unwrap();
        assert_eq!(sub, Suboption::TtypeIs("xterm".to_string()));
    }

    #[test]
    fn ttype_send_is_recognized() {
        assert_eq!(decode(TTYPE, &[TTYPE_SEND]).unwrap(), Suboption::TtypeSend);
    }

    #[test]
    fn ttype_bad_verb() {
        assert!(decode(TTYPE, &[9, b'a']).is_err());
        assert!(decode(TTYPE, &[]).is_err());
    }

    #[test]
    fn unknown_options_pass_through() {
        let opt = TelnetOption(70);
        let sub = decode(opt, &[1, 2, 3]).unwrap();
        assert_eq!(
            sub,
            Suboption::Other {
                option: opt,
                data: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn ttype_send_wire_form() {
        assert_eq!(ttype_send().to_bytes(), vec![255, 250, 24, 1, 255, 240]);
    }
}
