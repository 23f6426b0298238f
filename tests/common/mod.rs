//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use outpost::auth::{AuthRequest, Authenticator};
use outpost::errors::OutpostResult;
use outpost::events::{ControlEvent, Event, OutputEvent};
use outpost::filters::{Filter, SOCKET_SORT};
use outpost::stream::EventStream;
use outpost::users::{AccountType, User};

/// Stands in for the wire at the socket position: records every
/// output event that reaches it and lets everything pass.
pub struct WireProbe {
    outputs: Arc<Mutex<Vec<OutputEvent>>>,
}

impl WireProbe {
    pub fn new() -> (Self, Arc<Mutex<Vec<OutputEvent>>>) {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                outputs: outputs.clone(),
            },
            outputs,
        )
    }
}

impl Filter for WireProbe {
    fn name(&self) -> &'static str {
        "wire-probe"
    }

    fn sort_position(&self) -> u16 {
        SOCKET_SORT
    }

    fn handle_output(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut outputs = self.outputs.lock().unwrap();
        for event in &events {
            if let Event::Output(output) = event {
                outputs.push(output.clone());
            }
        }
        events
    }
}

/// The recorded payloads, in arrival order.
pub fn texts(outputs: &Arc<Mutex<Vec<OutputEvent>>>) -> Vec<String> {
    outputs
        .lock()
        .unwrap()
        .iter()
        .map(|o| o.data.clone())
        .collect()
}

pub fn clear(outputs: &Arc<Mutex<Vec<OutputEvent>>>) {
    outputs.lock().unwrap().clear();
}

/// Sink that records control events without acting on them.
pub fn recording_sink(
    log: Arc<Mutex<Vec<ControlEvent>>>,
) -> Box<dyn FnMut(&outpost::stream::StreamHandle, ControlEvent) + Send> {
    Box::new(move |_, event| {
        log.lock().unwrap().push(event);
    })
}

/// Answers authentication requests synchronously from a fixed table.
pub struct TableAuthenticator {
    users: Mutex<HashMap<String, (String, Arc<User>)>>,
}

impl TableAuthenticator {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_user(self, username: &str, password: &str, account_type: AccountType) -> Self {
        let user = Arc::new(User::new(username.to_string(), password, account_type).unwrap());
        self.users
            .lock()
            .unwrap()
            .insert(username.to_string(), (password.to_string(), user));
        self
    }

    pub fn user(&self, username: &str) -> Option<Arc<User>> {
        self.users
            .lock()
            .unwrap()
            .get(username)
            .map(|(_, user)| user.clone())
    }
}

impl Authenticator for TableAuthenticator {
    fn authenticate(&self, request: AuthRequest) {
        let users = self.users.lock().unwrap();
        match users.get(&request.username) {
            Some((password, user)) if *password == request.password => {
                (request.on_success)(user.clone());
            }
            _ => (request.on_failure)("Unknown user or bad password.".to_string()),
        }
    }

    fn save_user(&self, _user: &User) -> OutpostResult<()> {
        Ok(())
    }
}

/// Holds requests for the test to answer by hand.
pub struct ManualAuthenticator {
    pub requests: Mutex<Vec<AuthRequest>>,
}

impl ManualAuthenticator {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn take_last(&self) -> Option<AuthRequest> {
        self.requests.lock().unwrap().pop()
    }
}

impl Authenticator for ManualAuthenticator {
    fn authenticate(&self, request: AuthRequest) {
        self.requests.lock().unwrap().push(request);
    }

    fn save_user(&self, _user: &User) -> OutpostResult<()> {
        Ok(())
    }
}

/// Run a few settling cycles over one or more streams.
pub fn pump(streams: &mut [&mut EventStream]) {
    for _ in 0..8 {
        for stream in streams.iter_mut() {
            stream.process_pending();
        }
    }
}
