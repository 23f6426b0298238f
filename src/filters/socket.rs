//! Non-blocking socket transport for one connection.
//!
//! [`SocketFilter`] bridges an event stream to a TCP socket through
//! the reactor. Reads happen on the reactor thread: bytes are handed
//! to a [`WireProtocol`] which turns them into input events (queued
//! toward the stream) and immediate reply bytes (echo, negotiation).
//! Writes are buffered; the write buffer drains on the calling thread
//! as far as the kernel allows and write readiness is subscribed only
//! while bytes remain.
//!
//! The TELNET flavor of the protocol lives in
//! [`telnet`](crate::filters::telnet); the plain flavor here does bare
//! line assembly.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, error, trace, warn};

use crate::events::{Event, OutputEvent, OutputKind};
use crate::filters::{Filter, SOCKET_SORT};
use crate::reactor::{Reactor, ReactorHandler, Readiness};
use crate::stream::{FilterContext, FilterHandle};

/// Bytes read from the kernel per call.
pub const MTU: usize = 4096;

/// Write buffer size past which appends are logged.
const WRITE_WARN_THRESHOLD: usize = 64 * 1024;

const BS: u8 = 0x08;
const DEL: u8 = 0x7f;
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;
const NUL: u8 = 0x00;

/// Remove erase characters: a DEL or BS eats the byte before it;
/// leading erasures vanish.
pub fn collapse_erasures(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if b == DEL || b == BS {
            out.pop();
        } else {
            out.push(b);
        }
    }
    out
}

/// Accumulates bytes into lines. A line ends at CR followed by LF or
/// NUL; a bare LF is accepted too for clients that never send CR.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
    saw_cr: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a finished line when one terminates.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        if self.saw_cr {
            self.saw_cr = false;
            if byte == LF || byte == NUL {
                return Some(self.take_line());
            }
            // CR not followed by LF/NUL is not a terminator; drop it
            // and reconsider the byte.
        }
        match byte {
            CR => {
                self.saw_cr = true;
                None
            }
            LF => Some(self.take_line()),
            _ => {
                self.buf.push(byte);
                None
            }
        }
    }

    /// Drop the last buffered character (TELNET EC).
    pub fn erase_char(&mut self) {
        self.buf.pop();
    }

    /// Drop the whole buffered line (TELNET EL).
    pub fn erase_line(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_line(&mut self) -> String {
        let collapsed = collapse_erasures(&self.buf);
        self.buf.clear();
        String::from_utf8_lossy(&collapsed).into_owned()
    }
}

/// Byte-level behavior of a socket filter: how reads become events
/// and how output events become wire bytes.
pub trait WireProtocol: Send {
    fn name(&self) -> &'static str;

    /// Consume freshly read bytes. Completed input lines are pushed
    /// to `events`; bytes to send straight back (echo, negotiation
    /// replies) go to `reply`.
    fn ingest(&mut self, bytes: &[u8], events: &mut Vec<Event>, reply: &mut Vec<u8>);

    /// Serialize one output event onto the wire buffer.
    fn encode(&mut self, event: &OutputEvent, wire: &mut Vec<u8>);

    /// Bytes to send as soon as the connection is up.
    fn greeting(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Plain line-oriented protocol: no echo, no in-band commands.
#[derive(Debug, Default)]
pub struct PlainLineProtocol {
    line: LineAssembler,
}

impl WireProtocol for PlainLineProtocol {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn ingest(&mut self, bytes: &[u8], events: &mut Vec<Event>, _reply: &mut Vec<u8>) {
        for &byte in bytes {
            if let Some(line) = self.line.push(byte) {
                events.push(Event::input(line));
            }
        }
    }

    fn encode(&mut self, event: &OutputEvent, wire: &mut Vec<u8>) {
        for (i, line) in event.data.split('\n').enumerate() {
            if i > 0 {
                wire.extend_from_slice(b"\r\n");
            }
            wire.extend_from_slice(line.as_bytes());
        }
        match event.kind {
            OutputKind::Prompt | OutputKind::HiddenPrompt => {}
            _ => wire.extend_from_slice(b"\r\n"),
        }
    }
}

struct WriteBuffer {
    bytes: Vec<u8>,
    warned: bool,
}

/// Shared connection state: the filter owns one end, the reactor
/// callback the other.
pub struct SocketCore<P: WireProtocol> {
    sock: Mutex<TcpStream>,
    token: Mutex<Option<Token>>,
    reactor: Arc<Reactor>,
    protocol: Mutex<P>,
    write_buf: Mutex<WriteBuffer>,
    want_write: AtomicBool,
    connected: AtomicBool,
    filter: Mutex<Option<FilterHandle>>,
    peer: String,
}

impl<P: WireProtocol> SocketCore<P> {
    fn new(sock: TcpStream, reactor: Arc<Reactor>, protocol: P) -> Self {
        let peer = sock
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            sock: Mutex::new(sock),
            token: Mutex::new(None),
            reactor,
            protocol: Mutex::new(protocol),
            write_buf: Mutex::new(WriteBuffer {
                bytes: Vec::new(),
                warned: false,
            }),
            want_write: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            filter: Mutex::new(None),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_readable(&self) {
        let mut scratch = [0u8; MTU];
        loop {
            if !self.is_connected() {
                return;
            }
            let read = {
                let mut sock = self.sock.lock().unwrap();
                sock.read(&mut scratch)
            };
            match read {
                Ok(0) => {
                    debug!(peer = %self.peer, "peer closed the connection");
                    self.disconnect();
                    return;
                }
                Ok(n) => {
                    let mut events = Vec::new();
                    let mut reply = Vec::new();
                    self.protocol
                        .lock()
                        .unwrap()
                        .ingest(&scratch[..n], &mut events, &mut reply);
                    if !reply.is_empty() {
                        self.enqueue_bytes(&reply);
                    }
                    if !events.is_empty() {
                        trace!(peer = %self.peer, count = events.len(), "input events");
                        if let Some(filter) = self.filter.lock().unwrap().as_ref() {
                            filter.queue_input(events);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(peer = %self.peer, "read failed: {}", e);
                    self.disconnect();
                    return;
                }
            }
        }
    }

    /// Append bytes and drain as much as the kernel takes.
    fn enqueue_bytes(&self, bytes: &[u8]) {
        let mut buf = self.write_buf.lock().unwrap();
        buf.bytes.extend_from_slice(bytes);
        if buf.bytes.len() > WRITE_WARN_THRESHOLD && !buf.warned {
            buf.warned = true;
            warn!(
                peer = %self.peer,
                buffered = buf.bytes.len(),
                "write buffer is backing up"
            );
        }
        self.flush_locked(&mut buf);
    }

    fn on_writable(&self) {
        let mut buf = self.write_buf.lock().unwrap();
        self.flush_locked(&mut buf);
    }

    fn flush_locked(&self, buf: &mut WriteBuffer) {
        if !self.is_connected() {
            buf.bytes.clear();
            return;
        }
        let mut written = 0;
        {
            let mut sock = self.sock.lock().unwrap();
            while written < buf.bytes.len() {
                match sock.write(&buf.bytes[written..]) {
                    Ok(n) => written += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(peer = %self.peer, "write failed: {}", e);
                        drop(sock);
                        self.disconnect();
                        return;
                    }
                }
            }
        }
        buf.bytes.drain(..written);
        if buf.bytes.len() < WRITE_WARN_THRESHOLD {
            buf.warned = false;
        }

        let want = !buf.bytes.is_empty();
        if self.want_write.swap(want, Ordering::SeqCst) != want {
            self.update_interest(want);
        }
    }

    fn update_interest(&self, want_write: bool) {
        let token = *self.token.lock().unwrap();
        let Some(token) = token else {
            return;
        };
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let mut sock = self.sock.lock().unwrap();
        if let Err(e) = self.reactor.reregister(&mut *sock, token, interest) {
            warn!(peer = %self.peer, "reregister failed: {}", e);
        }
    }

    /// Tear the connection down from the socket side: flush what we
    /// can, close both halves, unregister, and finish the filter.
    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.peer, "socket disconnecting");

        let mut sock = self.sock.lock().unwrap();
        let pending = std::mem::take(&mut self.write_buf.lock().unwrap().bytes);
        if !pending.is_empty() {
            let _ = sock.write(&pending);
        }
        let _ = sock.shutdown(Shutdown::Both);
        if let Some(token) = self.token.lock().unwrap().take() {
            let _ = self.reactor.deregister(&mut *sock, token);
        }
        drop(sock);

        if let Some(filter) = self.filter.lock().unwrap().take() {
            filter.finish();
        }
    }
}

impl<P: WireProtocol> ReactorHandler for SocketCore<P> {
    fn ready(&self, readiness: Readiness) {
        if readiness.readable {
            self.on_readable();
        }
        if readiness.writable {
            self.on_writable();
        }
        if readiness.error || readiness.hangup {
            // Drain whatever arrived with the hangup first.
            self.on_readable();
            if readiness.error {
                error!(peer = %self.peer, "socket error");
            }
            self.disconnect();
        }
    }
}

/// The stream-side face of a connection.
pub struct SocketFilter<P: WireProtocol + 'static> {
    core: Arc<SocketCore<P>>,
}

impl<P: WireProtocol + 'static> SocketFilter<P> {
    pub fn with_protocol(sock: TcpStream, reactor: Arc<Reactor>, protocol: P) -> Self {
        Self {
            core: Arc::new(SocketCore::new(sock, reactor, protocol)),
        }
    }

    pub fn core(&self) -> Arc<SocketCore<P>> {
        self.core.clone()
    }
}

impl SocketFilter<PlainLineProtocol> {
    /// A bare line-oriented socket filter with no TELNET handling.
    pub fn plain(sock: TcpStream, reactor: Arc<Reactor>) -> Self {
        Self::with_protocol(sock, reactor, PlainLineProtocol::default())
    }
}

impl<P: WireProtocol + 'static> Filter for SocketFilter<P> {
    fn name(&self) -> &'static str {
        self.core.protocol.lock().unwrap().name()
    }

    fn sort_position(&self) -> u16 {
        SOCKET_SORT
    }

    fn start(&mut self, ctx: &FilterContext) -> Vec<Event> {
        *self.core.filter.lock().unwrap() = Some(ctx.filter.clone());

        let registered = {
            let mut sock = self.core.sock.lock().unwrap();
            self.core
                .reactor
                .register(&mut *sock, Interest::READABLE, self.core.clone())
        };
        match registered {
            Ok(token) => {
                *self.core.token.lock().unwrap() = Some(token);
            }
            Err(e) => {
                error!(peer = %self.core.peer, "could not register socket: {}", e);
                self.core.disconnect();
                return Vec::new();
            }
        }

        let greeting = self.core.protocol.lock().unwrap().greeting();
        if !greeting.is_empty() {
            self.core.enqueue_bytes(&greeting);
        }
        Vec::new()
    }

    fn stop(&mut self, _ctx: &FilterContext) -> Vec<Event> {
        if self.core.is_connected() {
            // Parting banner goes out ahead of the close, unbuffered.
            let mut wire = Vec::new();
            self.core
                .protocol
                .lock()
                .unwrap()
                .encode(&OutputEvent::text("Connection closed."), &mut wire);
            self.core.enqueue_bytes(&wire);
            self.core.disconnect();
        }
        Vec::new()
    }

    fn handle_output(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut wire = Vec::new();
        {
            let mut protocol = self.core.protocol.lock().unwrap();
            for event in &events {
                if let Event::Output(output) = event {
                    protocol.encode(output, &mut wire);
                }
            }
        }
        if !wire.is_empty() {
            self.core.enqueue_bytes(&wire);
        }
        // Serialized, not consumed: the default output filter below
        // keeps the replay history.
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_from(assembler: &mut LineAssembler, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if let Some(line) = assembler.push(b) {
                lines.push(line);
            }
        }
        lines
    }

    #[test]
    fn crlf_and_crnul_terminate() {
        let mut assembler = LineAssembler::new();
        assert_eq!(
            lines_from(&mut assembler, b"north\r\nsouth\r\x00"),
            vec!["north", "south"]
        );
        assert!(assembler.is_empty());
    }

    #[test]
    fn bare_lf_terminates() {
        let mut assembler = LineAssembler::new();
        assert_eq!(lines_from(&mut assembler, b"look\n"), vec!["look"]);
    }

    #[test]
    fn partial_lines_wait() {
        let mut assembler = LineAssembler::new();
        assert!(lines_from(&mut assembler, b"hal").is_empty());
        assert_eq!(lines_from(&mut assembler, b"f\r\n"), vec!["half"]);
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut assembler = LineAssembler::new();
        assert!(lines_from(&mut assembler, b"go\r").is_empty());
        assert_eq!(lines_from(&mut assembler, b"\n"), vec!["go"]);
    }

    #[test]
    fn erasures_collapse() {
        assert_eq!(collapse_erasures(b"cat\x7f\x7fow"), b"cow");
        assert_eq!(collapse_erasures(b"\x7f\x08abc"), b"abc");
        assert_eq!(collapse_erasures(b"ab\x08"), b"a");
    }

    #[test]
    fn embedded_erasures_in_lines() {
        let mut assembler = LineAssembler::new();
        assert_eq!(
            lines_from(&mut assembler, b"nirth\x7f\x7f\x7forth\r\n"),
            vec!["north"]
        );
    }

    #[test]
    fn ec_and_el() {
        let mut assembler = LineAssembler::new();
        for &b in b"word" {
            assembler.push(b);
        }
        assembler.erase_char();
        assert_eq!(lines_from(&mut assembler, b"\r\n"), vec!["wor"]);

        for &b in b"junk" {
            assembler.push(b);
        }
        assembler.erase_line();
        assert!(assembler.is_empty());
    }

    #[test]
    fn plain_encode_appends_crlf() {
        let mut protocol = PlainLineProtocol::default();
        let mut wire = Vec::new();
        protocol.encode(&OutputEvent::text("hello"), &mut wire);
        assert_eq!(wire, b"hello\r\n");
    }

    #[test]
    fn plain_encode_prompt_has_no_newline() {
        let mut protocol = PlainLineProtocol::default();
        let mut wire = Vec::new();
        protocol.encode(&OutputEvent::prompt("> "), &mut wire);
        assert_eq!(wire, b"> ");
    }

    #[test]
    fn plain_encode_converts_inner_newlines() {
        let mut protocol = PlainLineProtocol::default();
        let mut wire = Vec::new();
        protocol.encode(&OutputEvent::text("a\nb"), &mut wire);
        assert_eq!(wire, b"a\r\nb\r\n");
    }

    #[test]
    fn plain_ingest_produces_input_events() {
        let mut protocol = PlainLineProtocol::default();
        let mut events = Vec::new();
        let mut reply = Vec::new();
        protocol.ingest(b"say hi\r\n", &mut events, &mut reply);
        assert!(reply.is_empty());
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Input(input) => assert_eq!(input.data, "say hi"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
