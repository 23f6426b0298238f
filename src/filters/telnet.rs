//! TELNET-aware socket transport.
//!
//! [`TelnetProtocol`] layers the `telnet-codec` crate onto the socket
//! filter: IAC sequences are stripped out of the read stream and fed
//! to the Q-method negotiator, suboptions update the terminal state,
//! and plain bytes flow into the usual line assembly. On connect the
//! server offers ECHO and SGA and asks the peer for NAWS and TTYPE.
//!
//! With ECHO enabled the server echoes what the peer types; while the
//! echo mask is up (between a hidden-input prompt and the next
//! completed line) printable echo is replaced with `*`.

use std::sync::{Arc, Mutex};

use mio::net::TcpStream;
use tracing::{debug, trace, warn};

use telnet_codec::negotiation::{Action, Negotiator, OptionPolicy, Side};
use telnet_codec::protocol::{self, Command, Sequence};
use telnet_codec::suboption::{self, Suboption};
use telnet_codec::TelnetParser;

use crate::events::{Event, OutputEvent, OutputKind};
use crate::filters::socket::{LineAssembler, SocketFilter, WireProtocol};
use crate::reactor::Reactor;

const BS: u8 = 0x08;
const DEL: u8 = 0x7f;

pub const DEFAULT_TERMINAL_TYPE: &str = "dumb";
pub const DEFAULT_WINDOW: (u16, u16) = (80, 23);

/// Terminal attributes learned from negotiation, shared with whoever
/// renders for this connection.
#[derive(Debug)]
pub struct TerminalInfo {
    terminal_type: Mutex<String>,
    window: Mutex<(u16, u16)>,
}

impl TerminalInfo {
    fn new() -> Self {
        Self {
            terminal_type: Mutex::new(DEFAULT_TERMINAL_TYPE.to_string()),
            window: Mutex::new(DEFAULT_WINDOW),
        }
    }

    pub fn terminal_type(&self) -> String {
        self.terminal_type.lock().unwrap().clone()
    }

    /// Window size as (width, height).
    pub fn window_size(&self) -> (u16, u16) {
        *self.window.lock().unwrap()
    }
}

pub struct TelnetProtocol {
    parser: TelnetParser,
    negotiator: Negotiator,
    line: LineAssembler,
    info: Arc<TerminalInfo>,
    echo_mask: bool,
}

impl TelnetProtocol {
    pub fn new() -> (Self, Arc<TerminalInfo>) {
        let info = Arc::new(TerminalInfo::new());
        let policy = OptionPolicy {
            local: vec![protocol::ECHO, protocol::SGA, protocol::STATUS],
            remote: vec![protocol::NAWS, protocol::TTYPE, protocol::LFLOW],
        };
        (
            Self {
                parser: TelnetParser::new(),
                negotiator: Negotiator::new(policy),
                line: LineAssembler::new(),
                info: info.clone(),
                echo_mask: false,
            },
            info,
        )
    }

    fn server_echoes(&self) -> bool {
        self.negotiator.is_enabled(Side::Local, protocol::ECHO)
    }

    fn apply_actions(&mut self, actions: Vec<Action>, reply: &mut Vec<u8>) {
        for action in actions {
            match action {
                Action::Send(sequence) => reply.extend_from_slice(&sequence.to_bytes()),
                Action::Enabled(side, option) => {
                    debug!(?side, %option, "option enabled");
                    if side == Side::Remote && option == protocol::TTYPE {
                        // Ask for the terminal name now that the peer
                        // has agreed to provide it.
                        reply.extend_from_slice(&suboption::ttype_send().to_bytes());
                    }
                }
                Action::Disabled(side, option) => {
                    debug!(?side, %option, "option disabled");
                }
                Action::Violation {
                    side,
                    option,
                    detail,
                } => {
                    warn!(?side, %option, "negotiation violation: {}", detail);
                }
            }
        }
    }

    fn handle_suboption(&mut self, option: protocol::TelnetOption, data: &[u8]) {
        match suboption::decode(option, data) {
            Ok(Suboption::Naws { width, height }) => {
                if suboption::naws_in_range(width, height) {
                    debug!(width, height, "window size update");
                    *self.info.window.lock().unwrap() = (width, height);
                } else {
                    // Out-of-range reports are discarded; the last
                    // good size stands.
                    warn!(width, height, "ignoring out-of-range NAWS report");
                }
            }
            Ok(Suboption::TtypeIs(name)) => {
                if name.is_empty() {
                    warn!("empty terminal type report");
                } else {
                    debug!(terminal = %name, "terminal type update");
                    *self.info.terminal_type.lock().unwrap() = name;
                }
            }
            Ok(Suboption::TtypeSend) => {
                // SEND is a server-to-client query; a client must not
                // issue it.
                warn!("protocol error: peer sent TTYPE SEND");
            }
            Ok(Suboption::Other { option, data }) => {
                debug!(%option, len = data.len(), "ignoring suboption");
            }
            Err(e) => warn!("{}", e),
        }
    }

    fn handle_command(&mut self, command: Command, reply: &mut Vec<u8>) {
        match command {
            Command::Ayt => reply.extend_from_slice(b"[yes]\r\n"),
            Command::Ec => {
                self.line.erase_char();
                if self.server_echoes() {
                    reply.extend_from_slice(&[BS, b' ', BS]);
                }
            }
            Command::El => self.line.erase_line(),
            Command::Ip | Command::Brk | Command::Abort | Command::Susp => {
                debug!(?command, "client interrupt");
            }
            Command::Eof => debug!("client signalled EOF"),
            Command::Nop | Command::Dm | Command::Ga | Command::Eor => {
                trace!(?command, "ignoring command");
            }
            _ => trace!(?command, "ignoring command"),
        }
    }

    fn echo_byte(&mut self, byte: u8, reply: &mut Vec<u8>) {
        match byte {
            DEL | BS => reply.extend_from_slice(&[BS, b' ', BS]),
            b'\r' => reply.extend_from_slice(b"\r\n"),
            0x20..=0x7e => reply.push(if self.echo_mask { b'*' } else { byte }),
            _ => {}
        }
    }
}

impl WireProtocol for TelnetProtocol {
    fn name(&self) -> &'static str {
        "telnet"
    }

    fn ingest(&mut self, bytes: &[u8], events: &mut Vec<Event>, reply: &mut Vec<u8>) {
        let parsed = self.parser.feed(bytes);

        for sequence in parsed.sequences {
            match sequence {
                Sequence::Negotiation { command, option } => {
                    trace!(?command, %option, "negotiation received");
                    let actions = self.negotiator.receive(command, option);
                    self.apply_actions(actions, reply);
                }
                Sequence::Subnegotiation { option, data } => {
                    self.handle_suboption(option, &data);
                }
                Sequence::Command(command) => self.handle_command(command, reply),
                Sequence::Unknown(byte) => {
                    warn!(byte, "unknown command after IAC");
                }
            }
        }

        for &byte in &parsed.data {
            if self.server_echoes() {
                self.echo_byte(byte, reply);
            }
            if let Some(line) = self.line.push(byte) {
                // The mask covers exactly one secret.
                self.echo_mask = false;
                events.push(Event::input(line));
            }
        }
    }

    fn encode(&mut self, event: &OutputEvent, wire: &mut Vec<u8>) {
        for (i, line) in event.data.split('\n').enumerate() {
            if i > 0 {
                wire.extend_from_slice(b"\r\n");
            }
            protocol::escape_iac(line.as_bytes(), wire);
        }
        match event.kind {
            OutputKind::Prompt | OutputKind::HiddenPrompt => {
                if event.kind == OutputKind::HiddenPrompt {
                    self.echo_mask = true;
                }
                // In half-duplex mode a go-ahead marks the turn.
                if !self.negotiator.is_enabled(Side::Local, protocol::SGA) {
                    wire.extend_from_slice(&Sequence::Command(Command::Ga).to_bytes());
                }
            }
            _ => wire.extend_from_slice(b"\r\n"),
        }
    }

    fn greeting(&mut self) -> Vec<u8> {
        let mut reply = Vec::new();
        let mut actions = Vec::new();
        actions.extend(self.negotiator.request_enable(Side::Local, protocol::ECHO));
        actions.extend(self.negotiator.request_enable(Side::Local, protocol::SGA));
        actions.extend(self.negotiator.request_enable(Side::Remote, protocol::NAWS));
        actions.extend(self.negotiator.request_enable(Side::Remote, protocol::TTYPE));
        self.apply_actions(actions, &mut reply);
        reply
    }
}

pub type TelnetFilter = SocketFilter<TelnetProtocol>;

/// A TELNET socket filter plus the terminal info it maintains.
pub fn telnet_filter(sock: TcpStream, reactor: Arc<Reactor>) -> (TelnetFilter, Arc<TerminalInfo>) {
    let (protocol, info) = TelnetProtocol::new();
    (SocketFilter::with_protocol(sock, reactor, protocol), info)
}
