//! The two terminal filters every stream carries.

use std::collections::VecDeque;

use crate::events::{Event, OutputEvent};
use crate::filters::{DEFAULT_INPUT_SORT, DEFAULT_OUTPUT_SORT, Filter};

/// Replies sent for input nothing else wanted. Cycled in order; `%s`
/// is replaced with the offending input.
const UNRECOGNIZED_REPLIES: &[&str] = &[
    "Sorry, I don't know what you mean by '%s'.",
    "'%s' doesn't make any sense here.",
    "Try again; '%s' got me nowhere.",
    "I can't help you with '%s'.",
];

/// Sits at the top of the input climb and answers anything that made
/// it past every other filter with a rotating brush-off.
pub struct DefaultInputFilter {
    next_reply: usize,
}

impl DefaultInputFilter {
    pub fn new() -> Self {
        Self { next_reply: 0 }
    }
}

impl Default for DefaultInputFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for DefaultInputFilter {
    fn name(&self) -> &'static str {
        "default-input"
    }

    fn sort_position(&self) -> u16 {
        DEFAULT_INPUT_SORT
    }

    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        for event in events {
            match event {
                Event::Input(input) => {
                    let template = UNRECOGNIZED_REPLIES[self.next_reply];
                    self.next_reply = (self.next_reply + 1) % UNRECOGNIZED_REPLIES.len();
                    out.push(Event::Output(OutputEvent::error(
                        template.replace("%s", &input.data),
                    )));
                }
                other => out.push(other),
            }
        }
        out
    }
}

/// Sits at the bottom of the output descent, consuming every output
/// event and keeping the last few payloads for reconnection replay.
pub struct DefaultOutputFilter {
    history: VecDeque<String>,
    max_history_size: usize,
}

impl DefaultOutputFilter {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_history_size),
            max_history_size,
        }
    }

    /// The retained payloads, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }
}

impl Default for DefaultOutputFilter {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Filter for DefaultOutputFilter {
    fn name(&self) -> &'static str {
        "default-output"
    }

    fn sort_position(&self) -> u16 {
        DEFAULT_OUTPUT_SORT
    }

    fn handle_output(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut rest = Vec::new();
        for event in events {
            match event {
                Event::Output(output) => {
                    if self.max_history_size > 0 {
                        if self.history.len() == self.max_history_size {
                            self.history.pop_front();
                        }
                        self.history.push_back(output.data);
                    }
                }
                other => rest.push(other),
            }
        }
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutputKind;

    #[test]
    fn replies_rotate_and_substitute() {
        let mut filter = DefaultInputFilter::new();
        let first = filter.handle_input(vec![Event::input("xyzzy")]);
        let second = filter.handle_input(vec![Event::input("plugh")]);

        let text = |events: &[Event]| match &events[0] {
            Event::Output(out) => {
                assert_eq!(out.kind, OutputKind::Error);
                out.data.clone()
            }
            other => panic!("expected output, got {:?}", other),
        };

        let first = text(&first);
        let second = text(&second);
        assert!(first.contains("xyzzy"));
        assert!(second.contains("plugh"));
        assert_ne!(
            first.replace("xyzzy", "%s"),
            second.replace("plugh", "%s"),
            "replies should rotate"
        );
    }

    #[test]
    fn rotation_wraps_around() {
        let mut filter = DefaultInputFilter::new();
        let n = UNRECOGNIZED_REPLIES.len();
        let mut seen = Vec::new();
        for i in 0..=n {
            let events = filter.handle_input(vec![Event::input(format!("in{}", i))]);
            if let Event::Output(out) = &events[0] {
                seen.push(out.data.replace(&format!("in{}", i), "%s"));
            }
        }
        assert_eq!(seen[0], seen[n]);
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut filter = DefaultOutputFilter::new(3);
        for i in 0..5 {
            let leftover = filter.handle_output(vec![Event::output(format!("line {}", i))]);
            assert!(leftover.is_empty(), "outputs must be consumed");
        }
        let kept: Vec<&str> = filter.history().collect();
        assert_eq!(kept, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn non_output_events_pass() {
        let mut filter = DefaultOutputFilter::default();
        let events = filter.handle_output(vec![Event::input("typed")]);
        assert_eq!(events.len(), 1);
    }
}
