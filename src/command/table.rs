//! Abbreviation-resolving command lookup.
//!
//! A table is built once over a set of commands and maps every
//! unambiguous prefix of every name and synonym to its command. Full
//! names and synonyms are always present and win over abbreviations;
//! a prefix claimed by two commands resolves to neither.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::command::Command;

/// Result of looking a word up in a table.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Exactly one command answers to this word.
    Found(Arc<Command>),
    /// The word is a prefix of several commands; their names, sorted.
    Ambiguous(Vec<String>),
    /// Nothing matches.
    Unknown,
}

pub struct CommandTable {
    commands: Vec<Arc<Command>>,
    map: HashMap<String, Arc<Command>>,
}

impl CommandTable {
    /// Build the abbreviation map. Deterministic for a given command
    /// set regardless of input order.
    pub fn new(mut commands: Vec<Arc<Command>>) -> Self {
        commands.sort_by(|a, b| a.name.cmp(&b.name));

        let mut full: HashMap<String, Arc<Command>> = HashMap::new();
        let mut prefix_owners: HashMap<String, HashSet<String>> = HashMap::new();

        for command in &commands {
            for key in command.keys() {
                full.insert(key.to_string(), command.clone());
                for end in 1..key.len() {
                    prefix_owners
                        .entry(key[..end].to_string())
                        .or_default()
                        .insert(command.name.clone());
                }
            }
        }

        let mut map = full.clone();
        for (prefix, owners) in prefix_owners {
            if owners.len() == 1 && !full.contains_key(&prefix) {
                let owner = owners.iter().next().unwrap();
                if let Some(command) = full.get(owner) {
                    map.insert(prefix, command.clone());
                }
            }
        }

        Self { commands, map }
    }

    pub fn lookup(&self, word: &str) -> Lookup {
        if let Some(command) = self.map.get(word) {
            return Lookup::Found(command.clone());
        }

        // Absent from the map means either nothing or several things.
        let mut matches: Vec<String> = self
            .commands
            .iter()
            .filter(|command| command.keys().any(|key| key.starts_with(word)))
            .map(|command| command.name.clone())
            .collect();
        matches.sort();
        matches.dedup();

        match matches.len() {
            0 => Lookup::Unknown,
            _ => Lookup::Ambiguous(matches),
        }
    }

    pub fn commands(&self) -> &[Arc<Command>] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// All resolvable words, for diagnostics and invariant checks.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Arc<Command>)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}
