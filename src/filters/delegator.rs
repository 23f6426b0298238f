//! Bridges a stream to an arbitrary observer.
//!
//! An [`EventDelegator`] holds up to two handler closures, one per
//! direction. Events of a matching direction are passed through the
//! handler; whatever it returns replaces them for the rest of the
//! traversal. Snooping is built on top of this, but anything that
//! wants to watch or rewrite a stream's traffic can install one.

use std::sync::{Arc, Mutex};

use crate::events::Event;
use crate::filters::{DELEGATOR_SORT, Filter};
use crate::stream::{FilterContext, FilterHandle};

/// Handler invoked with the delegator itself and the events reaching
/// it. The return value continues the traversal.
pub type DelegateHandler = Arc<dyn Fn(&EventDelegator, Vec<Event>) -> Vec<Event> + Send + Sync>;

#[derive(Default)]
struct DelegatorShared {
    input: Mutex<Option<DelegateHandler>>,
    output: Mutex<Option<DelegateHandler>>,
    handle: Mutex<Option<FilterHandle>>,
}

/// Detached control for a delegator living in some stream. Cloneable;
/// disconnecting clears both handlers and finishes the filter.
#[derive(Clone)]
pub struct DelegatorControl {
    shared: Arc<DelegatorShared>,
}

impl DelegatorControl {
    pub fn disconnect(&self) {
        self.shared.input.lock().unwrap().take();
        self.shared.output.lock().unwrap().take();
        if let Some(handle) = self.shared.handle.lock().unwrap().as_ref() {
            handle.finish();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.input.lock().unwrap().is_some()
            || self.shared.output.lock().unwrap().is_some()
    }
}

pub struct EventDelegator {
    sort: u16,
    shared: Arc<DelegatorShared>,
}

impl EventDelegator {
    /// Build a delegator with zero, one, or two direction handlers.
    pub fn new(
        input: Option<DelegateHandler>,
        output: Option<DelegateHandler>,
    ) -> (Self, DelegatorControl) {
        let shared = Arc::new(DelegatorShared {
            input: Mutex::new(input),
            output: Mutex::new(output),
            handle: Mutex::new(None),
        });
        (
            Self {
                sort: DELEGATOR_SORT,
                shared: shared.clone(),
            },
            DelegatorControl { shared },
        )
    }

    /// Override the default sort position before installation.
    pub fn at_sort_position(mut self, sort: u16) -> Self {
        self.sort = sort;
        self
    }
}

impl Filter for EventDelegator {
    fn name(&self) -> &'static str {
        "delegator"
    }

    fn sort_position(&self) -> u16 {
        self.sort
    }

    fn start(&mut self, ctx: &FilterContext) -> Vec<Event> {
        *self.shared.handle.lock().unwrap() = Some(ctx.filter.clone());
        Vec::new()
    }

    fn stop(&mut self, _ctx: &FilterContext) -> Vec<Event> {
        self.shared.handle.lock().unwrap().take();
        Vec::new()
    }

    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        let handler = self.shared.input.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(self, events),
            None => events,
        }
    }

    fn handle_output(&mut self, events: Vec<Event>) -> Vec<Event> {
        let handler = self.shared.output.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(self, events),
            None => events,
        }
    }
}
