//! Outpost: a multi-user text server.
//!
//! The heart of the crate is the per-connection event pipeline. Bytes
//! from a socket are parsed into input events by a wire filter and
//! climb an ordered chain of filters ([`stream`]): macro expansion,
//! login, questionnaires, the command shell. Whatever the chain
//! produces descends the same axis back to the wire as output events.
//!
//! Module map:
//!
//! - [`events`], [`stream`], [`filters`]: the event pipeline itself.
//! - [`command`]: command definitions, the abbreviation table, and the
//!   hot-reloading factory.
//! - [`reactor`], [`scheduler`]: socket readiness and timers.
//! - [`users`], [`auth`], [`sessions`]: accounts and live sessions.
//! - [`server`]: the listener that ties a connection to a stream.
//!
//! TELNET wire handling (RFC 854/1143 parsing and negotiation) lives
//! in the `telnet-codec` workspace crate; [`filters::telnet`] binds it
//! to the pipeline.

pub mod auth;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod filters;
pub mod reactor;
pub mod scheduler;
pub mod server;
pub mod sessions;
pub mod stream;
pub mod users;

pub use config::OutpostConfig;
pub use errors::{OutpostError, OutpostResult};
