//! Listener, connection assembly, and the per-connection control sink.
//!
//! The server owns the accepting socket (registered on the reactor)
//! and wires each accepted connection into an event stream: a TELNET
//! filter on the wire side and a login filter above it. The stream's
//! control sink is where session lifecycle happens: authentication
//! requests are routed to the authenticator, a successful login swaps
//! in macro and shell filters, and teardown unwinds the registry and
//! the connection count.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, bounded};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::command::CommandFactory;
use crate::config::OutpostConfig;
use crate::errors::{OutpostError, OutpostResult};
use crate::events::ControlEvent;
use crate::filters::console::ConsoleFilter;
use crate::filters::login::LoginFilter;
use crate::filters::macros::MacroFilter;
use crate::filters::telnet::{TerminalInfo, telnet_filter};
use crate::reactor::{Reactor, ReactorHandler, Readiness};
use crate::scheduler::Scheduler;
use crate::sessions::SessionRegistry;
use crate::stream::{ControlSink, EventStream, StreamHandle};
use crate::users::User;

struct ServerShared {
    config: Arc<OutpostConfig>,
    reactor: Arc<Reactor>,
    scheduler: Arc<Scheduler>,
    authenticator: Arc<dyn Authenticator>,
    factory: Arc<CommandFactory>,
    sessions: Arc<SessionRegistry>,
    connections: AtomicUsize,
    next_conn: AtomicU64,
}

impl ServerShared {
    /// The control sink for one connection's stream.
    fn control_sink(
        self: &Arc<Self>,
        peer: String,
        terminal: Option<Arc<TerminalInfo>>,
    ) -> ControlSink {
        let shared = self.clone();
        let mut current_user: Option<Arc<User>> = None;

        Box::new(move |stream: &StreamHandle, event: ControlEvent| match event {
            ControlEvent::LoginAuth(request) => {
                shared.authenticator.authenticate(request);
            }
            ControlEvent::UserLogin { user } => {
                if let Some(previous) = user.io_event_stream() {
                    // One session per account: the old one goes away.
                    info!(username = %user.username, "reconnect; closing previous session");
                    previous.shutdown();
                }
                user.attach_stream(stream.clone());
                shared.sessions.register(
                    user.clone(),
                    stream.clone(),
                    peer.clone(),
                    terminal.clone(),
                );
                current_user = Some(user.clone());

                stream.add_filter(Box::new(MacroFilter::new(user.clone())));
                stream.add_filter(Box::new(shared.factory.create_shell_for_user(user)));
            }
            ControlEvent::UserLogout { user } => {
                debug!(username = %user.username, "logout");
                if let Err(e) = shared.authenticator.save_user(&user) {
                    warn!(username = %user.username, "could not save user: {}", e);
                }
                stream.shutdown();
            }
            ControlEvent::LoginFailure { reason, .. } => {
                info!(peer = %peer, "login failed: {}", reason);
                stream.shutdown();
            }
            ControlEvent::ListenerCleanup => {
                if let Some(user) = current_user.take() {
                    shared.sessions.unregister(&user.username);
                    user.detach_stream();
                    if let Err(e) = shared.authenticator.save_user(&user) {
                        warn!(username = %user.username, "could not save user: {}", e);
                    }
                }
                let left = shared.connections.fetch_sub(1, Ordering::SeqCst) - 1;
                info!(peer = %peer, remaining = left, "connection closed");
            }
            other => debug!(?other, "unrouted control event"),
        })
    }

    fn spawn_connection(self: &Arc<Self>, sock: TcpStream, addr: SocketAddr) {
        let id = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let peer = addr.to_string();
        info!(peer = %peer, conn = id, "connection accepted");

        let (telnet, terminal) = telnet_filter(sock, self.reactor.clone());

        let mut stream = EventStream::with_history(
            format!("conn-{}", id),
            self.config.output.max_history_size,
        );
        stream.set_control_sink(self.control_sink(peer, Some(terminal)));
        stream.add_filter(Box::new(telnet));
        stream.add_filter(Box::new(LoginFilter::new(
            self.config.login.clone(),
            self.scheduler.clone(),
        )));
        stream.spawn();
    }
}

struct AcceptHandler {
    listener: Arc<Mutex<TcpListener>>,
    shared: Arc<ServerShared>,
}

impl ReactorHandler for AcceptHandler {
    fn ready(&self, readiness: Readiness) {
        if !readiness.readable {
            return;
        }
        loop {
            let accepted = self.listener.lock().unwrap().accept();
            match accepted {
                Ok((mut sock, addr)) => {
                    let live = self.shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
                    if live > self.shared.config.server.max_connections {
                        warn!(
                            peer = %addr,
                            live,
                            "connection limit reached, rejecting"
                        );
                        use std::io::Write;
                        let _ = sock.write(b"Server is full; try again later.\r\n");
                        self.shared.connections.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    self.shared.spawn_connection(sock, addr);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept failed: {}", e);
                    return;
                }
            }
        }
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl Server {
    pub fn new(
        config: Arc<OutpostConfig>,
        reactor: Arc<Reactor>,
        scheduler: Arc<Scheduler>,
        authenticator: Arc<dyn Authenticator>,
        factory: Arc<CommandFactory>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded(1);

        let requester_tx = stop_tx.clone();
        sessions.set_stop_requester(Arc::new(move || {
            let _ = requester_tx.try_send(());
        }));

        Self {
            shared: Arc::new(ServerShared {
                config,
                reactor,
                scheduler,
                authenticator,
                factory,
                sessions,
                connections: AtomicUsize::new(0),
                next_conn: AtomicU64::new(1),
            }),
            stop_tx,
            stop_rx,
        }
    }

    /// Handle for stopping the server from elsewhere (signals, tests).
    pub fn stop_handle(&self) -> Sender<()> {
        self.stop_tx.clone()
    }

    /// Bind, serve until a stop request, then unwind.
    pub fn run(&self) -> OutpostResult<()> {
        let config = &self.shared.config;
        let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
            .parse()
            .map_err(|e| OutpostError::Configuration(format!("bad bind address: {}", e)))?;

        let listener = Arc::new(Mutex::new(TcpListener::bind(addr)?));
        let handler = Arc::new(AcceptHandler {
            listener: listener.clone(),
            shared: self.shared.clone(),
        });
        let token = {
            let mut guard = listener.lock().unwrap();
            self.shared
                .reactor
                .register(&mut *guard, Interest::READABLE, handler)?
        };
        info!(%addr, "listening");

        if config.console.enabled {
            self.attach_console();
        }

        // Serve until someone asks us to stop.
        let _ = self.stop_rx.recv();
        info!("server stopping");

        {
            let mut guard = listener.lock().unwrap();
            let _ = self.shared.reactor.deregister(&mut *guard, token);
        }
        for entry in self.shared.sessions.list() {
            entry.stream.shutdown();
        }
        self.shared.factory.stop_auto_reload();
        self.shared.scheduler.shutdown();
        self.shared.reactor.shutdown();
        Ok(())
    }

    fn attach_console(&self) {
        match ConsoleFilter::create(self.shared.reactor.clone()) {
            Ok(console) => {
                let mut stream = EventStream::with_history(
                    "console",
                    self.shared.config.output.max_history_size,
                );
                stream.set_control_sink(self.shared.control_sink("console".to_string(), None));
                stream.add_filter(Box::new(console));
                stream.add_filter(Box::new(LoginFilter::new(
                    self.shared.config.login.clone(),
                    self.shared.scheduler.clone(),
                )));
                stream.spawn();
                self.shared.connections.fetch_add(1, Ordering::SeqCst);
                info!("console attached");
            }
            Err(e) => warn!("console unavailable: {}", e),
        }
    }
}
