//! Incremental IAC sequence parser.
//!
//! Feed it reads as they arrive; it separates plain data bytes from
//! command sequences and holds partial sequences across calls. A read
//! that ends mid-sequence (the classic case being a trailing lone IAC)
//! simply leaves the parser in that state until the next read supplies
//! the rest.

use crate::protocol::{Command, IAC, Sequence, TelnetOption};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Plain data until the next IAC.
    Data,
    /// Saw IAC, waiting for the command byte.
    Iac,
    /// Saw a negotiation command, waiting for the option byte.
    Negotiation(Command),
    /// Saw IAC SB, waiting for the option byte.
    SubOption,
    /// Collecting subnegotiation payload until IAC SE.
    SubData {
        option: TelnetOption,
        data: Vec<u8>,
        saw_iac: bool,
    },
}

/// What one `feed` call produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parsed {
    /// Application data with all command sequences removed.
    pub data: Vec<u8>,
    /// Command sequences in stream order.
    pub sequences: Vec<Sequence>,
}

/// Stateful TELNET stream parser.
#[derive(Debug, Clone)]
pub struct TelnetParser {
    state: State,
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetParser {
    pub fn new() -> Self {
        Self { state: State::Data }
    }

    /// True while a sequence is only partially received.
    pub fn mid_sequence(&self) -> bool {
        self.state != State::Data
    }

    /// Consume one read's worth of bytes. All input is consumed; any
    /// incomplete trailing sequence is carried in parser state.
    pub fn feed(&mut self, input: &[u8]) -> Parsed {
        let mut out = Parsed::default();

        for &byte in input {
            match &mut self.state {
                State::Data => {
                    if byte == IAC {
                        self.state = State::Iac;
                    } else {
                        out.data.push(byte);
                    }
                }

                State::Iac => {
                    if byte == IAC {
                        // Escaped literal 255.
                        out.data.push(IAC);
                        self.state = State::Data;
                    } else if let Some(cmd) = Command::from_byte(byte) {
                        if cmd == Command::Sb {
                            self.state = State::SubOption;
                        } else if cmd.is_negotiation() {
                            self.state = State::Negotiation(cmd);
                        } else {
                            out.sequences.push(Sequence::Command(cmd));
                            self.state = State::Data;
                        }
                    } else {
                        out.sequences.push(Sequence::Unknown(byte));
                        self.state = State::Data;
                    }
                }

                State::Negotiation(cmd) => {
                    out.sequences.push(Sequence::Negotiation {
                        command: *cmd,
                        option: TelnetOption(byte),
                    });
                    self.state = State::Data;
                }

                State::SubOption => {
                    self.state = State::SubData {
                        option: TelnetOption(byte),
                        data: Vec::new(),
                        saw_iac: false,
                    };
                }

                State::SubData {
                    option,
                    data,
                    saw_iac,
                } => {
                    if *saw_iac {
                        if byte == Command::Se.to_byte() {
                            out.sequences.push(Sequence::Subnegotiation {
                                option: *option,
                                data: std::mem::take(data),
                            });
                            self.state = State::Data;
                        } else if byte == IAC {
                            // Escaped 255 inside the payload.
                            data.push(IAC);
                            *saw_iac = false;
                        } else {
                            // IAC followed by neither SE nor IAC is a
                            // malformed bracket; keep both bytes so the
                            // payload is not silently truncated.
                            data.push(IAC);
                            data.push(byte);
                            *saw_iac = false;
                        }
                    } else if byte == IAC {
                        *saw_iac = true;
                    } else {
                        data.push(byte);
                    }
                }
            }
        }

        out
    }

    /// Drop any partial sequence and return to the data state.
    pub fn reset(&mut self) {
        self.state = State::Data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ECHO, NAWS, SGA, TTYPE};

    #[test]
    fn plain_data_passes_through() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(b"look north");
        assert_eq!(parsed.data, b"look north");
        assert!(parsed.sequences.is_empty());
        assert!(!parser.mid_sequence());
    }

    #[test]
    fn bare_command() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[255, 246]); // IAC AYT
        assert!(parsed.data.is_empty());
        assert_eq!(parsed.sequences, vec![Sequence::Command(Command::Ayt)]);
    }

    #[test]
    fn negotiation_triple() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[255, 251, 1]); // IAC WILL ECHO
        assert_eq!(
            parsed.sequences,
            vec![Sequence::Negotiation {
                command: Command::Will,
                option: ECHO
            }]
        );
    }

    #[test]
    fn unknown_option_is_still_parsed() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[255, 253, 86]); // IAC DO <unassigned>
        assert_eq!(
            parsed.sequences,
            vec![Sequence::Negotiation {
                command: Command::Do,
                option: TelnetOption(86)
            }]
        );
    }

    #[test]
    fn unknown_command_surfaces() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[255, 99, b'x']);
        assert_eq!(parsed.sequences, vec![Sequence::Unknown(99)]);
        assert_eq!(parsed.data, b"x");
    }

    #[test]
    fn escaped_iac_is_data() {
        let mut parser = TelnetParser::new();
        let parsed = parser.feed(&[b'a', 255, 255, b'b']);
        assert_eq!(parsed.data, vec![b'a', 255, b'b']);
        assert!(parsed.sequences.is_empty());
    }

    #[test]
    fn subnegotiation() {
        let mut parser = TelnetParser::new();
        // IAC SB NAWS 0 80 0 24 IAC SE
        let parsed = parser.feed(&[255, 250, 31, 0, 80, 0, 24, 255, 240]);
        assert_eq!(
            parsed.sequences,
            vec![Sequence::Subnegotiation {
                option: NAWS,
                data: vec![0, 80, 0, 24]
            }]
        );
    }

    #[test]
    fn subnegotiation_payload_iac_unescaped() {
        let mut parser = TelnetParser::new();
        // Payload contains a doubled IAC: one literal 255 byte.
        let parsed = parser.feed(&[255, 250, 24, 0, 255, 255, 65, 255, 240]);
        assert_eq!(
            parsed.sequences,
            vec![Sequence::Subnegotiation {
                option: TTYPE,
                data: vec![0, 255, 65]
            }]
        );
    }

    #[test]
    fn trailing_iac_survives_read_boundary() {
        let mut parser = TelnetParser::new();
        let first = parser.feed(&[b'h', b'i', 255]);
        assert_eq!(first.data, b"hi");
        assert!(first.sequences.is_empty());
        assert!(parser.mid_sequence());

        let second = parser.feed(&[253, 3]); // ... DO SGA
        assert_eq!(
            second.sequences,
            vec![Sequence::Negotiation {
                command: Command::Do,
                option: SGA
            }]
        );
        assert!(!parser.mid_sequence());
    }

    #[test]
    fn sequence_split_every_byte() {
        let bytes = [255u8, 250, 31, 0, 80, 0, 24, 255, 240];
        let mut parser = TelnetParser::new();
        let mut sequences = Vec::new();
        for &b in &bytes {
            sequences.extend(parser.feed(&[b]).sequences);
        }
        assert_eq!(
            sequences,
            vec![Sequence::Subnegotiation {
                option: NAWS,
                data: vec![0, 80, 0, 24]
            }]
        );
    }

    #[test]
    fn data_around_commands() {
        let mut parser = TelnetParser::new();
        let mut input = b"before".to_vec();
        input.extend([255, 251, 1]);
        input.extend(b"after");
        let parsed = parser.feed(&input);
        assert_eq!(parsed.data, b"beforeafter");
        assert_eq!(parsed.sequences.len(), 1);
    }

    #[test]
    fn reset_clears_partial_state() {
        let mut parser = TelnetParser::new();
        parser.feed(&[255, 250]);
        assert!(parser.mid_sequence());
        parser.reset();
        assert!(!parser.mid_sequence());
        assert_eq!(parser.feed(b"ok").data, b"ok");
    }
}
