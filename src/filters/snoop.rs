//! Cross-stream mirroring: one user watching another's session.
//!
//! Snooping installs two pieces: a [`SnoopFilter`] on the watcher's
//! stream, and an [`EventDelegator`] on the target's stream whose
//! handlers copy the target's traffic into the watcher's output side.
//! Mirrored lines carry a key of the form `@target`; watcher input
//! beginning with that key is rerouted into the target's input side
//! with the key stripped, so the watcher can drive the target's
//! session.
//!
//! Prompt and hidden-prompt events are terminal control, not session
//! content, and are never mirrored.

use std::sync::{Arc, Mutex};

use crate::events::{Event, OutputEvent};
use crate::filters::delegator::{DelegatorControl, EventDelegator};
use crate::filters::{Filter, SNOOP_SORT};
use crate::stream::{FilterContext, FilterHandle, StreamHandle};

/// External control over an installed snoop. Stopping it finishes the
/// watcher-side filter, which tears the target-side delegator down.
#[derive(Clone)]
pub struct SnoopControl {
    handle: Arc<Mutex<Option<FilterHandle>>>,
}

impl SnoopControl {
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().as_ref() {
            handle.finish();
        }
    }
}

pub struct SnoopFilter {
    target_name: String,
    key: String,
    target_stream: StreamHandle,
    silent: bool,
    delegator: Option<DelegatorControl>,
    handle: Arc<Mutex<Option<FilterHandle>>>,
}

impl SnoopFilter {
    pub fn new(
        target_name: impl Into<String>,
        target_stream: StreamHandle,
        silent: bool,
    ) -> (Self, SnoopControl) {
        let target_name = target_name.into();
        let handle = Arc::new(Mutex::new(None));
        (
            Self {
                key: format!("@{}", target_name),
                target_name,
                target_stream,
                silent,
                delegator: None,
                handle: handle.clone(),
            },
            SnoopControl { handle },
        )
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }
}

impl Filter for SnoopFilter {
    fn name(&self) -> &'static str {
        "snoop"
    }

    fn sort_position(&self) -> u16 {
        SNOOP_SORT
    }

    fn start(&mut self, ctx: &FilterContext) -> Vec<Event> {
        *self.handle.lock().unwrap() = Some(ctx.filter.clone());

        let watcher = ctx.stream.clone();
        let key_in = self.key.clone();
        let input_mirror = move |_: &EventDelegator, events: Vec<Event>| {
            let mirrored: Vec<Event> = events
                .iter()
                .filter_map(|event| match event {
                    Event::Input(input) => Some(Event::Output(OutputEvent::text(format!(
                        "{} [Input]: {}",
                        key_in, input.data
                    )))),
                    _ => None,
                })
                .collect();
            watcher.inject_output(mirrored);
            events
        };

        let watcher = ctx.stream.clone();
        let key_out = self.key.clone();
        let output_mirror = move |_: &EventDelegator, events: Vec<Event>| {
            let mirrored: Vec<Event> = events
                .iter()
                .filter_map(|event| match event {
                    Event::Output(output) if !output.is_io_control() => {
                        Some(Event::Output(OutputEvent::text(format!(
                            "{} [Output]: {}",
                            key_out, output.data
                        ))))
                    }
                    _ => None,
                })
                .collect();
            watcher.inject_output(mirrored);
            events
        };

        let (delegator, control) =
            EventDelegator::new(Some(Arc::new(input_mirror)), Some(Arc::new(output_mirror)));
        self.target_stream.add_filter(Box::new(delegator));
        self.delegator = Some(control);

        vec![Event::output(format!("[snooping {}]", self.target_name))]
    }

    fn stop(&mut self, _ctx: &FilterContext) -> Vec<Event> {
        if let Some(delegator) = self.delegator.take() {
            delegator.disconnect();
        }
        self.handle.lock().unwrap().take();

        if self.silent {
            return Vec::new();
        }
        self.target_stream.inject_output(vec![Event::output(
            "[snoop connection closed]".to_string(),
        )]);
        vec![Event::output(format!(
            "[snoop of {} closed]",
            self.target_name
        ))]
    }

    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut rest = Vec::new();
        for event in events {
            match event {
                Event::Input(input) if input.data.starts_with(&self.key) => {
                    let line = input.data[self.key.len()..].trim_start();
                    self.target_stream.inject_input(vec![Event::input(line)]);
                }
                other => rest.push(other),
            }
        }
        rest
    }
}
