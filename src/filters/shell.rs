//! The command shell: recognizes prefixed command lines, resolves
//! them through an abbreviation table, and runs their bodies.
//!
//! Lines that do not start with the command prefix pass through for
//! whoever sits above the shell. Recognized commands run with a
//! [`ShellContext`]; whatever events the body returns are routed by
//! the stream, and filters it queues are installed into the stream.
//! After every input event the shell re-issues its prompt.
//!
//! The shell watches its factory for registry rebuilds through a
//! shared staleness flag and swaps in a freshly tailored table on the
//! next input after a rebuild.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use regex::Regex;
use tracing::{error, info, warn};

use crate::command::table::{CommandTable, Lookup};
use crate::command::{Command, CommandFactory};
use crate::errors::{OutpostError, OutpostResult};
use crate::events::{Event, OutputEvent};
use crate::filters::snoop::SnoopControl;
use crate::filters::{Filter, SHELL_SORT};
use crate::sessions::SessionRegistry;
use crate::stream::{FilterContext, FilterHandle, StreamHandle};
use crate::users::{AccountType, User};

/// Shell variable holding the prompt text.
pub const VAR_PROMPT: &str = "prompt";

const DENIAL: &str = "You are not permitted to do that.";

/// Everything a command body gets to work with. Created when the shell
/// starts on a stream and dropped when it stops.
pub struct ShellContext {
    pub user: Arc<User>,
    pub stream: StreamHandle,
    pub filter: FilterHandle,
    pub sessions: Arc<SessionRegistry>,
    pub factory: Weak<CommandFactory>,
    pub table: Arc<RwLock<CommandTable>>,
    /// Held reference for commands that operate on a prior target.
    pub eval_target: Option<Arc<User>>,
    vars: HashMap<String, String>,
    snoops: HashMap<String, SnoopControl>,
    queued_filters: Vec<Box<dyn Filter + Send>>,
}

impl ShellContext {
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn prompt(&self) -> String {
        self.vars.get(VAR_PROMPT).cloned().unwrap_or_default()
    }

    /// Queue a filter for installation into the stream once the
    /// current command finishes.
    pub fn add_filter(&mut self, filter: Box<dyn Filter + Send>) {
        self.queued_filters.push(filter);
    }

    pub fn register_snoop(&mut self, target: impl Into<String>, control: SnoopControl) {
        self.snoops.insert(target.into(), control);
    }

    pub fn end_snoop(&mut self, target: &str) -> bool {
        match self.snoops.remove(target) {
            Some(control) => {
                control.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_snooping(&self, target: &str) -> bool {
        self.snoops.contains_key(target)
    }

    /// End the shell's own life; the session usually follows.
    pub fn finish_shell(&self) {
        self.filter.finish();
    }
}

pub struct ShellFilter {
    user: Arc<User>,
    prefix: char,
    parse_re: Regex,
    default_prompt: String,
    table: Arc<RwLock<CommandTable>>,
    factory: Weak<CommandFactory>,
    stale: Arc<AtomicBool>,
    sessions: Arc<SessionRegistry>,
    ctx: Option<ShellContext>,
}

impl ShellFilter {
    pub fn new(
        user: Arc<User>,
        table: CommandTable,
        prefix: char,
        default_prompt: impl Into<String>,
        factory: Weak<CommandFactory>,
        stale: Arc<AtomicBool>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let parse_re = Regex::new(&format!(r"^{}(\w+)\b(.*)$", regex::escape(&prefix.to_string())))
            .expect("command line pattern");
        Self {
            user,
            prefix,
            parse_re,
            default_prompt: default_prompt.into(),
            table: Arc::new(RwLock::new(table)),
            factory,
            stale,
            sessions,
            ctx: None,
        }
    }

    /// The staleness flag the factory raises on rebuilds.
    pub fn stale_flag(&self) -> Arc<AtomicBool> {
        self.stale.clone()
    }

    fn refresh_table(&mut self) {
        let Some(factory) = self.factory.upgrade() else {
            warn!(user = %self.user.username, "command factory gone; keeping old table");
            return;
        };
        let table = factory.create_command_table_for_user(&self.user);
        info!(
            user = %self.user.username,
            commands = table.len(),
            "swapped in rebuilt command table"
        );
        *self.table.write().unwrap() = table;
    }

    fn dispatch(&mut self, name: &str, args: &str, out: &mut Vec<Event>) {
        let lookup = self.table.read().unwrap().lookup(name);
        match lookup {
            Lookup::Found(command) => self.run_command(&command, args, out),
            Lookup::Ambiguous(matches) => {
                out.push(Event::Output(OutputEvent::error(format!(
                    "Ambiguous command '{}': Matches [{}]",
                    name,
                    matches.join(", ")
                ))));
            }
            Lookup::Unknown => {
                out.push(Event::Output(OutputEvent::error(format!(
                    "No such command '{}'",
                    name
                ))));
            }
        }
    }

    fn run_command(&mut self, command: &Command, args: &str, out: &mut Vec<Event>) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };

        if command.restriction > ctx.user.account_type {
            warn!(
                user = %ctx.user.username,
                command = %command.name,
                "restricted command refused"
            );
            out.push(Event::Output(OutputEvent::error(DENIAL)));
            return;
        }

        match command.invoke(ctx, args) {
            Ok(events) => out.extend(events),
            Err(OutpostError::ShellCommand(message)) => {
                out.push(Event::Output(OutputEvent::error(message)));
                if !command.usage.is_empty() {
                    out.push(Event::Output(OutputEvent::text(format!(
                        "Usage: {}",
                        command.usage
                    ))));
                }
            }
            Err(OutpostError::Permission(message)) => {
                warn!(
                    user = %ctx.user.username,
                    command = %command.name,
                    "permission error: {}",
                    message
                );
                out.push(Event::Output(OutputEvent::error(DENIAL)));
            }
            Err(other) => {
                error!(
                    user = %ctx.user.username,
                    command = %command.name,
                    "command body failed: {}",
                    other
                );
                if ctx.user.account_type >= AccountType::Implementor {
                    out.push(Event::Output(OutputEvent::error(format!(
                        "Command '{}' failed: {}",
                        command.name, other
                    ))));
                }
            }
        }

        // Filters queued by the body go into the stream now.
        if let Some(ctx) = self.ctx.as_mut() {
            for filter in ctx.queued_filters.drain(..) {
                ctx.stream.add_filter(filter);
            }
        }
    }
}

impl Filter for ShellFilter {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn sort_position(&self) -> u16 {
        SHELL_SORT
    }

    fn start(&mut self, fctx: &FilterContext) -> Vec<Event> {
        let mut vars = HashMap::new();
        vars.insert(
            VAR_PROMPT.to_string(),
            self.user
                .preference(VAR_PROMPT)
                .unwrap_or_else(|| self.default_prompt.clone()),
        );

        let ctx = ShellContext {
            user: self.user.clone(),
            stream: fctx.stream.clone(),
            filter: fctx.filter.clone(),
            sessions: self.sessions.clone(),
            factory: self.factory.clone(),
            table: self.table.clone(),
            eval_target: None,
            vars,
            snoops: HashMap::new(),
            queued_filters: Vec::new(),
        };
        let prompt = ctx.prompt();
        self.ctx = Some(ctx);

        vec![
            Event::Output(OutputEvent::text(format!(
                "Shell ready; type {}help for commands.",
                self.prefix
            ))),
            Event::Output(OutputEvent::prompt(prompt)),
        ]
    }

    fn stop(&mut self, _fctx: &FilterContext) -> Vec<Event> {
        if let Some(mut ctx) = self.ctx.take() {
            let targets: Vec<String> = ctx.snoops.keys().cloned().collect();
            for target in targets {
                ctx.end_snoop(&target);
            }
        }
        Vec::new()
    }

    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        if self.stale.swap(false, Ordering::SeqCst) {
            self.refresh_table();
        }

        let mut out = Vec::new();
        for event in events {
            match event {
                Event::Input(input) => {
                    if !input.data.starts_with(self.prefix) {
                        // Not ours; let the rest of the chain see it.
                        out.push(Event::Input(input));
                    } else {
                        match self.parse_re.captures(&input.data) {
                            Some(caps) => {
                                let name = caps[1].to_string();
                                let args = caps[2].trim().to_string();
                                self.dispatch(&name, &args, &mut out);
                            }
                            None => {
                                out.push(Event::Output(OutputEvent::error(format!(
                                    "No such command '{}'",
                                    input.data.trim_start_matches(self.prefix)
                                ))));
                            }
                        }
                    }

                    if let Some(ctx) = &self.ctx
                        && !ctx.filter.is_finished()
                    {
                        out.push(Event::Output(OutputEvent::prompt(ctx.prompt())));
                    }
                }
                other => out.push(other),
            }
        }
        out
    }
}
