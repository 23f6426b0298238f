//! Event stream filters.
//!
//! A filter is one processor in a connection's ordered chain. Filters
//! sit on a sort axis running from the wire (low positions) to the
//! interpreter side (high positions): the input pass climbs the axis,
//! the output pass descends it. Each handler receives the events
//! reaching its position and returns whatever it declines to consume,
//! possibly with new events of its own mixed in.
//!
//! Handlers run on the stream's processing thread, so a filter mutates
//! itself freely; cross-thread callers reach a filter only through its
//! [`FilterHandle`](crate::stream::FilterHandle) pending queues.

pub mod console;
pub mod defaults;
pub mod delegator;
pub mod login;
pub mod macros;
pub mod questionnaire;
pub mod shell;
pub mod snoop;
pub mod socket;
pub mod telnet;

use crate::events::Event;
use crate::stream::FilterContext;

/// Sort position of the default output filter: the output terminus.
pub const DEFAULT_OUTPUT_SORT: u16 = 0;
/// Wire filters: socket, telnet, console.
pub const SOCKET_SORT: u16 = 300;
/// Free-standing delegators.
pub const DELEGATOR_SORT: u16 = 500;
/// Snoop key routing, below the shell so snooped lines never reach it.
pub const SNOOP_SORT: u16 = 550;
pub const LOGIN_SORT: u16 = 600;
pub const QUESTIONNAIRE_SORT: u16 = 625;
/// Macro expansion, below the shell so expansions are visible to it.
pub const MACRO_SORT: u16 = 650;
pub const SHELL_SORT: u16 = 700;
/// Sort position of the default input filter: the input terminus.
pub const DEFAULT_INPUT_SORT: u16 = 1000;

/// A processor participating in an event stream.
///
/// `start` and `stop` bracket membership: each is called exactly once,
/// on insertion and removal, with the stream context. Events returned
/// from any method are routed by the stream. Input events continue
/// toward the input end, output events enter the output pass below the
/// filter's own position, and control events go to the stream's sink.
///
/// A filter ends its own life by calling `finish()` on the
/// `FilterHandle` it received at start; the stream removes it at the
/// end of the cycle and never hands it another event.
pub trait Filter: Send {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Position on the sort axis, in `[0, 1000]`. Fixed for the
    /// lifetime of the stream membership.
    fn sort_position(&self) -> u16;

    /// Called once when the filter joins a stream.
    fn start(&mut self, ctx: &FilterContext) -> Vec<Event> {
        let _ = ctx;
        Vec::new()
    }

    /// Called once when the filter leaves a stream.
    fn stop(&mut self, ctx: &FilterContext) -> Vec<Event> {
        let _ = ctx;
        Vec::new()
    }

    /// Process events climbing toward the input end.
    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        events
    }

    /// Process events descending toward the wire.
    fn handle_output(&mut self, events: Vec<Event>) -> Vec<Event> {
        events
    }
}
