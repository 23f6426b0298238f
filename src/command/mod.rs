//! User commands: definitions, parsing, lookup tables, and the
//! hot-reloading factory that ties them together.
//!
//! Commands are defined in plain-text `.cmd` files (see [`parser`]).
//! A command's body names a native handler registered with the factory
//! ([`handlers`]); parsing binds the two together, so reloading a file
//! rebinds metadata and handler wiring without touching running code.

pub mod factory;
pub mod handlers;
pub mod parser;
pub mod table;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::OutpostResult;
use crate::events::Event;
use crate::filters::shell::ShellContext;
use crate::users::AccountType;

pub use factory::{CommandFactory, ShellParams};
pub use handlers::HandlerRegistry;
pub use parser::{CommandParser, ParsedCommand};
pub use table::{CommandTable, Lookup};

/// A compiled command body: invoked with the command itself, the
/// shell's context, and the argument string.
pub type CommandBody =
    Arc<dyn Fn(&Command, &mut ShellContext, &str) -> OutpostResult<Vec<Event>> + Send + Sync>;

/// A loaded, dispatchable command.
pub struct Command {
    pub name: String,
    pub source_file: PathBuf,
    pub source_line: usize,
    /// One-line summary, as given by the `abstract` section.
    pub summary: String,
    pub description: String,
    pub usage: String,
    pub restriction: AccountType,
    pub synonyms: Vec<String>,
    /// The body text as written in the command file.
    pub body_source: String,
    body: CommandBody,
}

impl Command {
    pub fn new(parsed: ParsedCommand, body: CommandBody) -> Self {
        Self {
            name: parsed.name,
            source_file: parsed.source_file,
            source_line: parsed.source_line,
            summary: parsed.summary,
            description: parsed.description,
            usage: parsed.usage,
            restriction: parsed.restriction,
            synonyms: parsed.synonyms,
            body_source: parsed.body_source,
            body,
        }
    }

    /// Every name this command answers to.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.synonyms.iter().map(String::as_str))
    }

    pub fn invoke(&self, ctx: &mut ShellContext, args: &str) -> OutpostResult<Vec<Event>> {
        (self.body)(self, ctx, args)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("restriction", &self.restriction)
            .field("synonyms", &self.synonyms)
            .field("source", &self.source_file)
            .finish_non_exhaustive()
    }
}
