//! Events carried on a per-connection event stream.
//!
//! Everything a stream moves is an [`Event`]: text going up from the
//! wire ([`InputEvent`]), text going down to it ([`OutputEvent`]), or
//! out-of-band control traffic ([`ControlEvent`]) that is dispatched to
//! the stream's control sink rather than traversing the filter chain.
//! Events are plain values; filters hand them around by move and clone
//! them when they need a copy.

use std::fmt;
use std::sync::Arc;

use crate::auth::AuthRequest;
use crate::users::User;

/// The direction a kind of event travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    Control,
}

#[derive(Debug, Clone)]
pub enum Event {
    Input(InputEvent),
    Output(OutputEvent),
    Control(ControlEvent),
}

impl Event {
    pub fn direction(&self) -> Direction {
        match self {
            Event::Input(_) => Direction::Input,
            Event::Output(_) => Direction::Output,
            Event::Control(_) => Direction::Control,
        }
    }

    /// Shorthand for a plain input event.
    pub fn input(data: impl Into<String>) -> Self {
        Event::Input(InputEvent::new(data))
    }

    /// Shorthand for a plain output event.
    pub fn output(data: impl Into<String>) -> Self {
        Event::Output(OutputEvent::text(data))
    }
}

impl From<InputEvent> for Event {
    fn from(ev: InputEvent) -> Self {
        Event::Input(ev)
    }
}

impl From<OutputEvent> for Event {
    fn from(ev: OutputEvent) -> Self {
        Event::Output(ev)
    }
}

impl From<ControlEvent> for Event {
    fn from(ev: ControlEvent) -> Self {
        Event::Control(ev)
    }
}

/// One line of user input, already stripped of line terminators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub data: String,
}

impl InputEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

/// Flavors of output. Prompt and hidden-prompt events are I/O control
/// events: the wire filter drops line conventions for them and a hidden
/// prompt additionally masks the echo of whatever is typed next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    Normal,
    Error,
    Prompt,
    HiddenPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub data: String,
    pub kind: OutputKind,
}

impl OutputEvent {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            kind: OutputKind::Normal,
        }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            kind: OutputKind::Error,
        }
    }

    pub fn prompt(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            kind: OutputKind::Prompt,
        }
    }

    pub fn hidden_prompt(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            kind: OutputKind::HiddenPrompt,
        }
    }

    /// True for terminal-control outputs, which are excluded from
    /// mirroring (snoop) and similar observers.
    pub fn is_io_control(&self) -> bool {
        matches!(self.kind, OutputKind::Prompt | OutputKind::HiddenPrompt)
    }
}

/// A deferred closure carried as an event. Executed by the stream when
/// it is routed, after any control events queued before it.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Out-of-band events. These never traverse the filter chain; the
/// stream hands them to its control sink as soon as a filter emits
/// them. The exceptions are events queued directly into a filter's
/// pending-input queue (the login filter's authenticator callbacks do
/// this), which that filter consumes itself.
#[derive(Clone)]
pub enum ControlEvent {
    /// A user finished authenticating on a stream.
    UserLogin { user: Arc<User> },
    /// A user's session ended in an orderly way.
    UserLogout { user: Arc<User> },
    /// Request to authenticate a username/password pair.
    LoginAuth(AuthRequest),
    /// Authentication failed. `fatal` ends the session regardless of
    /// the remaining retry budget (timeouts, exhausted tries).
    LoginFailure { reason: String, fatal: bool },
    /// The listener owning this connection should tear down.
    ListenerCleanup,
    /// Run a closure on the stream thread.
    Callback(Callback),
}

impl fmt::Debug for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEvent::UserLogin { user } => {
                write!(f, "UserLogin({})", user.username)
            }
            ControlEvent::UserLogout { user } => {
                write!(f, "UserLogout({})", user.username)
            }
            ControlEvent::LoginAuth(req) => write!(f, "LoginAuth({})", req.username),
            ControlEvent::LoginFailure { reason, fatal } => {
                write!(f, "LoginFailure({:?}, fatal: {})", reason, fatal)
            }
            ControlEvent::ListenerCleanup => write!(f, "ListenerCleanup"),
            ControlEvent::Callback(_) => write!(f, "Callback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions() {
        assert_eq!(Event::input("n").direction(), Direction::Input);
        assert_eq!(Event::output("ok").direction(), Direction::Output);
        assert_eq!(
            Event::Control(ControlEvent::ListenerCleanup).direction(),
            Direction::Control
        );
    }

    #[test]
    fn prompts_are_io_control() {
        assert!(OutputEvent::prompt("> ").is_io_control());
        assert!(OutputEvent::hidden_prompt("Password: ").is_io_control());
        assert!(!OutputEvent::text("hello").is_io_control());
        assert!(!OutputEvent::error("bad").is_io_control());
    }
}
