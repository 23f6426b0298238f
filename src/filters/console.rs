//! Host-terminal transport: the console flavor of the socket filter.
//!
//! Reads come off stdin through the reactor like any socket; writes go
//! through a dedicated writer thread that sleeps on a condition
//! variable until output is queued. Only one console filter can exist
//! per process.

use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use mio::unix::SourceFd;
use mio::{Interest, Token};
use tracing::{debug, warn};

use crate::errors::{OutpostError, OutpostResult};
use crate::events::{Event, OutputEvent, OutputKind};
use crate::filters::socket::{LineAssembler, MTU};
use crate::filters::{Filter, SOCKET_SORT};
use crate::reactor::{Reactor, ReactorHandler, Readiness};
use crate::stream::{FilterContext, FilterHandle};

const STDIN_FD: i32 = 0;

static CONSOLE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Reactor side: parses stdin into input events.
struct ConsoleReader {
    line: Mutex<LineAssembler>,
    filter: Mutex<Option<FilterHandle>>,
}

impl ReactorHandler for ConsoleReader {
    fn ready(&self, readiness: Readiness) {
        if !readiness.readable {
            return;
        }

        // Borrow the process stdin fd without taking ownership of it.
        let mut stdin = ManuallyDrop::new(unsafe { File::from_raw_fd(STDIN_FD) });
        let mut scratch = [0u8; MTU];
        match stdin.read(&mut scratch) {
            Ok(0) => {
                debug!("console EOF");
                if let Some(filter) = self.filter.lock().unwrap().take() {
                    filter.finish();
                }
            }
            Ok(n) => {
                let mut events = Vec::new();
                {
                    let mut line = self.line.lock().unwrap();
                    for &byte in &scratch[..n] {
                        if let Some(text) = line.push(byte) {
                            events.push(Event::input(text));
                        }
                    }
                }
                if let Some(filter) = self.filter.lock().unwrap().as_ref() {
                    filter.queue_input(events);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("console read failed: {}", e),
        }
    }
}

/// Writer side: a thread draining a buffer to stdout.
struct ConsoleWriter {
    buf: Mutex<Vec<u8>>,
    cv: Condvar,
    done: AtomicBool,
}

impl ConsoleWriter {
    fn push(&self, bytes: &[u8]) {
        self.buf.lock().unwrap().extend_from_slice(bytes);
        self.cv.notify_one();
    }

    fn shut_down(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.cv.notify_one();
    }

    fn run(&self) {
        let mut buf = self.buf.lock().unwrap();
        loop {
            while buf.is_empty() && !self.done.load(Ordering::SeqCst) {
                buf = self.cv.wait(buf).unwrap();
            }
            let bytes = std::mem::take(&mut *buf);
            if bytes.is_empty() && self.done.load(Ordering::SeqCst) {
                return;
            }
            drop(buf);

            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(&bytes).and_then(|_| stdout.flush()) {
                warn!("console write failed: {}", e);
            }
            drop(stdout);

            buf = self.buf.lock().unwrap();
        }
    }
}

pub struct ConsoleFilter {
    reactor: Arc<Reactor>,
    reader: Arc<ConsoleReader>,
    writer: Arc<ConsoleWriter>,
    writer_thread: Option<thread::JoinHandle<()>>,
    token: Option<Token>,
}

impl ConsoleFilter {
    /// Claim the process console. Fails if another console filter is
    /// already alive.
    pub fn create(reactor: Arc<Reactor>) -> OutpostResult<Self> {
        if CONSOLE_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(OutpostError::Configuration(
                "console filter already active".to_string(),
            ));
        }
        Ok(Self {
            reactor,
            reader: Arc::new(ConsoleReader {
                line: Mutex::new(LineAssembler::new()),
                filter: Mutex::new(None),
            }),
            writer: Arc::new(ConsoleWriter {
                buf: Mutex::new(Vec::new()),
                cv: Condvar::new(),
                done: AtomicBool::new(false),
            }),
            writer_thread: None,
            token: None,
        })
    }

    fn encode(event: &OutputEvent, wire: &mut Vec<u8>) {
        wire.extend_from_slice(event.data.as_bytes());
        match event.kind {
            OutputKind::Prompt | OutputKind::HiddenPrompt => {}
            _ => wire.push(b'\n'),
        }
    }
}

impl Drop for ConsoleFilter {
    fn drop(&mut self) {
        CONSOLE_ACTIVE.store(false, Ordering::SeqCst);
    }
}

impl Filter for ConsoleFilter {
    fn name(&self) -> &'static str {
        "console"
    }

    fn sort_position(&self) -> u16 {
        SOCKET_SORT
    }

    fn start(&mut self, ctx: &FilterContext) -> Vec<Event> {
        *self.reader.filter.lock().unwrap() = Some(ctx.filter.clone());

        let writer = self.writer.clone();
        self.writer_thread = Some(
            thread::Builder::new()
                .name("console-writer".to_string())
                .spawn(move || writer.run())
                .expect("failed to spawn console writer"),
        );

        match self.reactor.register(
            &mut SourceFd(&STDIN_FD),
            Interest::READABLE,
            self.reader.clone(),
        ) {
            Ok(token) => self.token = Some(token),
            Err(e) => {
                warn!("cannot watch stdin: {}", e);
                ctx.filter.finish();
            }
        }
        Vec::new()
    }

    fn stop(&mut self, _ctx: &FilterContext) -> Vec<Event> {
        if let Some(token) = self.token.take() {
            let _ = self.reactor.deregister(&mut SourceFd(&STDIN_FD), token);
        }
        self.reader.filter.lock().unwrap().take();

        self.writer.shut_down();
        if let Some(thread) = self.writer_thread.take() {
            let _ = thread.join();
        }
        Vec::new()
    }

    fn handle_output(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut wire = Vec::new();
        for event in &events {
            if let Event::Output(output) = event {
                Self::encode(output, &mut wire);
            }
        }
        if !wire.is_empty() {
            self.writer.push(&wire);
        }
        events
    }
}
