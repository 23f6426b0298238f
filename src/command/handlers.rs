//! Native command handlers.
//!
//! A command file's `code` section names one of these handlers on its
//! first line; the rest of the body is data the handler may use (the
//! `echo` handler treats it as an output template). Parsing binds the
//! name to the handler function, so a registry rebuild re-wires
//! commands without any code injection.

use std::collections::HashMap;
use std::sync::Arc;

use jiff::Timestamp;

use crate::command::table::Lookup;
use crate::command::{Command, CommandBody};
use crate::errors::{OutpostError, OutpostResult};
use crate::events::{ControlEvent, Event, OutputEvent};
use crate::filters::shell::{ShellContext, VAR_PROMPT};
use crate::filters::snoop::SnoopFilter;

pub type HandlerFn = fn(&Command, &mut ShellContext, &str) -> OutpostResult<Vec<Event>>;

/// Named handler functions command bodies can bind to.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, HandlerFn>,
}

impl HandlerRegistry {
    /// The standard handler set.
    pub fn builtin() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register("echo", echo);
        registry.register("help", help);
        registry.register("quit", quit);
        registry.register("set", set);
        registry.register("who", who);
        registry.register("target", target);
        registry.register("snoop", snoop);
        registry.register("unsnoop", unsnoop);
        registry.register("rebuild", rebuild);
        registry.register("shutdown", shutdown);
        registry
    }

    pub fn register(&mut self, name: &'static str, handler: HandlerFn) {
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).copied()
    }

    /// Resolve a parsed body to a callable. The first word of the
    /// first non-blank line is the handler name.
    pub fn compile(&self, body_source: &str) -> Option<CommandBody> {
        let name = body_source
            .lines()
            .find(|line| !line.trim().is_empty())?
            .trim()
            .split_whitespace()
            .next()?;
        let handler = self.get(name)?;
        let body: CommandBody = Arc::new(handler);
        Some(body)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn output(text: impl Into<String>) -> Event {
    Event::Output(OutputEvent::text(text))
}

/// Render the body lines after the handler name as output, with `%a`
/// (argument string), `%u` (username), and `%%` substitutions.
fn echo(cmd: &Command, ctx: &mut ShellContext, args: &str) -> OutpostResult<Vec<Event>> {
    Ok(cmd
        .body_source
        .lines()
        .skip(1)
        .map(|line| {
            let mut text = String::with_capacity(line.len());
            let mut chars = line.chars();
            while let Some(c) = chars.next() {
                if c != '%' {
                    text.push(c);
                    continue;
                }
                match chars.next() {
                    Some('a') => text.push_str(args),
                    Some('u') => text.push_str(&ctx.user.username),
                    Some('%') => text.push('%'),
                    Some(other) => {
                        text.push('%');
                        text.push(other);
                    }
                    None => text.push('%'),
                }
            }
            output(text)
        })
        .collect())
}

fn help(_cmd: &Command, ctx: &mut ShellContext, args: &str) -> OutpostResult<Vec<Event>> {
    let table = ctx.table.clone();
    let table = table.read().unwrap();

    if args.is_empty() {
        let mut out = vec![output("Available commands:")];
        for command in table.commands() {
            out.push(output(format!("  {:<12} {}", command.name, command.summary)));
        }
        return Ok(out);
    }

    match table.lookup(args) {
        Lookup::Found(command) => {
            let mut out = vec![output(format!("{} - {}", command.name, command.summary))];
            if !command.synonyms.is_empty() {
                out.push(output(format!("Synonyms: {}", command.synonyms.join(", "))));
            }
            if !command.usage.is_empty() {
                out.push(output(format!("Usage: {}", command.usage)));
            }
            if !command.description.is_empty() {
                for paragraph in command.description.split("\n\n") {
                    out.push(output(paragraph));
                }
            }
            Ok(out)
        }
        Lookup::Ambiguous(matches) => Err(OutpostError::ShellCommand(format!(
            "Ambiguous command '{}': Matches [{}]",
            args,
            matches.join(", ")
        ))),
        Lookup::Unknown => Err(OutpostError::ShellCommand(format!(
            "No such command '{}'",
            args
        ))),
    }
}

fn quit(_cmd: &Command, ctx: &mut ShellContext, _args: &str) -> OutpostResult<Vec<Event>> {
    ctx.finish_shell();
    Ok(vec![
        output(format!("Goodbye, {}.", ctx.user.username)),
        Event::Control(ControlEvent::UserLogout {
            user: ctx.user.clone(),
        }),
    ])
}

fn set(_cmd: &Command, ctx: &mut ShellContext, args: &str) -> OutpostResult<Vec<Event>> {
    if args.is_empty() {
        let mut pairs: Vec<(String, String)> = ctx
            .vars()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.sort();
        return Ok(pairs
            .into_iter()
            .map(|(name, value)| output(format!("{} = {}", name, value)))
            .collect());
    }

    match args.split_once(char::is_whitespace) {
        None => match ctx.var(args) {
            Some(value) => Ok(vec![output(format!("{} = {}", args, value))]),
            None => Err(OutpostError::ShellCommand(format!(
                "No shell variable '{}'",
                args
            ))),
        },
        Some((name, value)) => {
            let value = value.trim().to_string();
            ctx.set_var(name, value.clone());
            if name == VAR_PROMPT {
                // The prompt survives into the next session.
                ctx.user.set_preference(VAR_PROMPT, value.clone());
            }
            Ok(vec![output(format!("{} = {}", name, value))])
        }
    }
}

fn who(_cmd: &Command, ctx: &mut ShellContext, _args: &str) -> OutpostResult<Vec<Event>> {
    let sessions = ctx.sessions.list();
    let mut out = vec![output(format!("{} connected:", sessions.len()))];
    let now = Timestamp::now();
    for entry in sessions {
        let minutes = now
            .duration_since(entry.connected_at)
            .as_secs()
            .max(0) as u64
            / 60;
        let terminal = entry
            .terminal
            .as_ref()
            .map(|t| {
                let (width, height) = t.window_size();
                format!("{} {}x{}", t.terminal_type(), width, height)
            })
            .unwrap_or_else(|| "console".to_string());
        out.push(output(format!(
            "  {:<16} {:<12} on for {}m from {} ({})",
            entry.user.username,
            entry.user.account_type.name(),
            minutes,
            entry.peer,
            terminal
        )));
    }
    Ok(out)
}

fn target(_cmd: &Command, ctx: &mut ShellContext, args: &str) -> OutpostResult<Vec<Event>> {
    match args {
        "" => Ok(vec![output(match &ctx.eval_target {
            Some(user) => format!("Current target: {}", user.username),
            None => "No target set.".to_string(),
        })]),
        "clear" | "none" => {
            ctx.eval_target = None;
            Ok(vec![output("Target cleared.")])
        }
        name => match ctx.sessions.get(name) {
            Some(entry) => {
                let username = entry.user.username.clone();
                ctx.eval_target = Some(entry.user);
                Ok(vec![output(format!("Target set to {}.", username))])
            }
            None => Err(OutpostError::ShellCommand(format!(
                "No connected user named '{}'",
                name
            ))),
        },
    }
}

fn snoop(_cmd: &Command, ctx: &mut ShellContext, args: &str) -> OutpostResult<Vec<Event>> {
    let mut words = args.split_whitespace();
    let Some(target_name) = words.next() else {
        return Err(OutpostError::ShellCommand(
            "Whom do you want to snoop?".to_string(),
        ));
    };
    let silent = matches!(words.next(), Some("silent"));

    if target_name == ctx.user.username {
        return Err(OutpostError::ShellCommand(
            "Snooping yourself would never end.".to_string(),
        ));
    }
    if ctx.is_snooping(target_name) {
        return Err(OutpostError::ShellCommand(format!(
            "Already snooping {}.",
            target_name
        )));
    }

    let Some(entry) = ctx.sessions.get(target_name) else {
        return Err(OutpostError::ShellCommand(format!(
            "No connected user named '{}'",
            target_name
        )));
    };

    let (filter, control) = SnoopFilter::new(target_name, entry.stream, silent);
    ctx.register_snoop(target_name, control);
    ctx.add_filter(Box::new(filter));
    Ok(Vec::new())
}

fn unsnoop(_cmd: &Command, ctx: &mut ShellContext, args: &str) -> OutpostResult<Vec<Event>> {
    let target_name = args.trim();
    if target_name.is_empty() {
        return Err(OutpostError::ShellCommand(
            "Whom do you want to stop snooping?".to_string(),
        ));
    }
    if ctx.end_snoop(target_name) {
        Ok(Vec::new())
    } else {
        Err(OutpostError::ShellCommand(format!(
            "Not snooping {}.",
            target_name
        )))
    }
}

fn rebuild(_cmd: &Command, ctx: &mut ShellContext, _args: &str) -> OutpostResult<Vec<Event>> {
    let Some(factory) = ctx.factory.upgrade() else {
        return Err(OutpostError::ShellCommand(
            "The command factory is gone.".to_string(),
        ));
    };
    match factory.rebuild() {
        Ok(count) => Ok(vec![output(format!(
            "Command registry rebuilt: {} commands.",
            count
        ))]),
        Err(e) => Err(OutpostError::ShellCommand(format!(
            "Rebuild failed, previous registry kept: {}",
            e
        ))),
    }
}

fn shutdown(_cmd: &Command, ctx: &mut ShellContext, _args: &str) -> OutpostResult<Vec<Event>> {
    // Tell everyone before the streams start tearing down.
    let notice = format!("Server going down at {}'s request.", ctx.user.username);
    for entry in ctx.sessions.list() {
        if entry.user.username != ctx.user.username {
            entry.stream.inject_output(vec![output(notice.clone())]);
        }
    }
    if !ctx.sessions.request_server_stop() {
        return Err(OutpostError::ShellCommand(
            "No server is attached to this session.".to_string(),
        ));
    }
    Ok(vec![output(notice)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_the_core_set() {
        let registry = HandlerRegistry::builtin();
        for name in ["echo", "help", "quit", "set", "who", "snoop", "shutdown"] {
            assert!(registry.get(name).is_some(), "missing handler '{}'", name);
        }
        assert!(registry.get("fly").is_none());
    }

    #[test]
    fn compile_reads_first_word() {
        let registry = HandlerRegistry::builtin();
        assert!(registry.compile("who").is_some());
        assert!(registry.compile("\n  \necho\nHello %u").is_some());
        assert!(registry.compile("launch the missiles").is_none());
        assert!(registry.compile("").is_none());
    }
}
