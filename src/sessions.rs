use crate::filters::telnet::TerminalInfo;
use crate::stream::StreamHandle;
use crate::users::User;

use jiff::Timestamp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A logged-in user and the stream carrying their connection.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub user: Arc<User>,
    pub stream: StreamHandle,
    pub connected_at: Timestamp,
    pub peer: String,
    /// Negotiated terminal attributes; absent on console sessions.
    pub terminal: Option<Arc<TerminalInfo>>,
}

/// Registry of live sessions, keyed by username. Consulted by the
/// `who` command and by snooping, and used at shutdown to reach every
/// connected stream. It also carries the server's stop requester so
/// an admin command can bring the whole process down.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionEntry>>,
    stop: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        user: Arc<User>,
        stream: StreamHandle,
        peer: impl Into<String>,
        terminal: Option<Arc<TerminalInfo>>,
    ) {
        let entry = SessionEntry {
            user: user.clone(),
            stream,
            connected_at: Timestamp::now(),
            peer: peer.into(),
            terminal,
        };
        self.inner.lock().unwrap().insert(user.username.clone(), entry);
    }

    pub fn unregister(&self, username: &str) -> Option<SessionEntry> {
        self.inner.lock().unwrap().remove(username)
    }

    pub fn get(&self, username: &str) -> Option<SessionEntry> {
        self.inner.lock().unwrap().get(username).cloned()
    }

    /// Snapshot of all sessions, sorted by username.
    pub fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self.inner.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.user.username.cmp(&b.user.username));
        entries
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Install the closure that stops the server.
    pub fn set_stop_requester(&self, requester: Arc<dyn Fn() + Send + Sync>) {
        *self.stop.lock().unwrap() = Some(requester);
    }

    /// Ask the server to stop. Returns false when no requester is
    /// installed (tests, partial setups).
    pub fn request_server_stop(&self) -> bool {
        match self.stop.lock().unwrap().as_ref() {
            Some(requester) => {
                requester();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::EventStream;
    use crate::users::AccountType;

    #[test]
    fn register_and_list() {
        let registry = SessionRegistry::new();
        let stream = EventStream::new("test");

        for name in ["zed", "amy"] {
            let user =
                Arc::new(User::new(name.to_string(), "pw", AccountType::User).unwrap());
            registry.register(user, stream.handle(), "127.0.0.1", None);
        }

        assert_eq!(registry.count(), 2);
        let names: Vec<String> = registry
            .list()
            .into_iter()
            .map(|e| e.user.username.clone())
            .collect();
        assert_eq!(names, vec!["amy", "zed"]);

        assert!(registry.get("amy").is_some());
        assert!(registry.unregister("amy").is_some());
        assert!(registry.get("amy").is_none());
        assert_eq!(registry.count(), 1);
    }
}
