//! Socket readiness dispatch.
//!
//! One thread owns a `mio::Poll` and fans readiness events out to
//! registered handlers by token. Filters register their sockets here;
//! callbacks run on the reactor thread and must return promptly, so
//! anything slow gets queued onto an event stream instead.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{error, trace};

const WAKER_TOKEN: Token = Token(0);

/// What a socket became ready for.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Receiver of readiness callbacks. At most one handler is attached
/// per registered source.
pub trait ReactorHandler: Send + Sync {
    fn ready(&self, readiness: Readiness);
}

struct Shared {
    registry: mio::Registry,
    handlers: Mutex<HashMap<Token, Arc<dyn ReactorHandler>>>,
    next_token: AtomicUsize,
    waker: Waker,
    shutdown: AtomicBool,
}

pub struct Reactor {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            waker,
            shutdown: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || run_loop(poll, worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register a source and attach its handler. The returned token is
    /// needed for reregistration and removal.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Arc<dyn ReactorHandler>,
    ) -> io::Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::SeqCst));
        self.shared.handlers.lock().unwrap().insert(token, handler);
        if let Err(e) = self.shared.registry.register(source, token, interest) {
            self.shared.handlers.lock().unwrap().remove(&token);
            return Err(e);
        }
        trace!(token = token.0, "registered reactor source");
        Ok(token)
    }

    /// Change the interest set for a registered source.
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.shared.registry.reregister(source, token, interest)
    }

    /// Detach the handler and remove the source from the poller.
    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> io::Result<()> {
        self.shared.handlers.lock().unwrap().remove(&token);
        self.shared.registry.deregister(source)
    }

    /// Stop the dispatch thread. Registered sources are left to their
    /// owners to close.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(256);

    while !shared.shutdown.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("reactor poll failed: {}", e);
            return;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }

            let handler = shared
                .handlers
                .lock()
                .unwrap()
                .get(&event.token())
                .cloned();

            // A handler may already be gone if the filter deregistered
            // between the poll and the dispatch; that is not an error.
            if let Some(handler) = handler {
                handler.ready(Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    error: event.is_error(),
                    hangup: event.is_read_closed() || event.is_write_closed(),
                });
            }
        }
    }
}
