//! Per-user input macro expansion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::events::Event;
use crate::filters::{Filter, MACRO_SORT};
use crate::stream::FilterContext;
use crate::users::User;

/// Preference keys the macro table persists under.
const PREF_MACROS: &str = "macros";
const PREF_PREFIX: &str = "macro.prefix";

pub const DEFAULT_MACRO_PREFIX: char = '~';
pub const DEFAULT_DEPTH_LIMIT: usize = 5;

/// Expands macro patterns in input lines that begin with the macro
/// prefix. Each pattern substitutes at most once per input; after
/// every substitution the scan restarts so expansions can reference
/// other macros, up to the depth limit. The table is loaded from the
/// owning user's preferences on construction and written back on stop.
pub struct MacroFilter {
    user: Arc<User>,
    prefix: char,
    macros: HashMap<String, String>,
    depth_limit: usize,
}

impl MacroFilter {
    pub fn new(user: Arc<User>) -> Self {
        let prefix = user
            .preference(PREF_PREFIX)
            .and_then(|s| s.chars().next())
            .unwrap_or(DEFAULT_MACRO_PREFIX);

        let macros = user
            .preference(PREF_MACROS)
            .and_then(|json| match serde_json::from_str(&json) {
                Ok(map) => Some(map),
                Err(e) => {
                    warn!(user = %user.username, "discarding unreadable macro table: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        Self {
            user,
            prefix,
            macros,
            depth_limit: DEFAULT_DEPTH_LIMIT,
        }
    }

    pub fn define(&mut self, pattern: impl Into<String>, expansion: impl Into<String>) {
        self.macros.insert(pattern.into(), expansion.into());
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        self.macros.remove(pattern).is_some()
    }

    fn expand(&self, line: &str) -> String {
        let mut text = line.to_string();
        let mut used: HashSet<&str> = HashSet::new();
        // Longest patterns first so overlapping names resolve the same
        // way every time.
        let mut patterns: Vec<&String> = self.macros.keys().collect();
        patterns.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut depth = 0;
        'scan: while depth < self.depth_limit {
            for &pattern in &patterns {
                if used.contains(pattern.as_str()) {
                    continue;
                }
                if let Some(at) = text.find(pattern.as_str()) {
                    text.replace_range(at..at + pattern.len(), &self.macros[pattern]);
                    used.insert(pattern);
                    depth += 1;
                    continue 'scan;
                }
            }
            break;
        }
        text
    }
}

impl Filter for MacroFilter {
    fn name(&self) -> &'static str {
        "macro"
    }

    fn sort_position(&self) -> u16 {
        MACRO_SORT
    }

    fn stop(&mut self, _ctx: &FilterContext) -> Vec<Event> {
        match serde_json::to_string(&self.macros) {
            Ok(json) => {
                self.user.set_preference(PREF_MACROS, json);
                self.user
                    .set_preference(PREF_PREFIX, self.prefix.to_string());
            }
            Err(e) => warn!(user = %self.user.username, "could not persist macros: {}", e),
        }
        Vec::new()
    }

    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        events
            .into_iter()
            .map(|event| match event {
                Event::Input(input) => match input.data.strip_prefix(self.prefix) {
                    Some(rest) => Event::input(self.expand(rest)),
                    None => Event::Input(input),
                },
                other => other,
            })
            .collect()
    }
}
