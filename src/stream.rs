//! The per-connection event stream: an ordered chain of filters and
//! the machinery that drives events through it.
//!
//! A stream owns its filters and is the only party that calls their
//! handlers, always from one processing thread. Everyone else (other
//! threads, timer callbacks, other streams) talks to it through a
//! cloneable [`StreamHandle`] (operations, injected events) or a
//! [`FilterHandle`] (per-filter pending queues, the finished flag).
//! Both wake the processing loop; a cycle then runs the input pass
//! (ascending sort order, ending at the default input filter) and the
//! output pass (descending, ending at the default output filter).

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, trace, warn};

use crate::events::{ControlEvent, Event};
use crate::filters::defaults::{DefaultInputFilter, DefaultOutputFilter};
use crate::filters::Filter;

pub type FilterId = u64;

/// Pending event queues for one filter, shared between the filter's
/// handle and the stream.
#[derive(Debug, Default)]
struct PendingQueues {
    input: Mutex<Vec<Event>>,
    output: Mutex<Vec<Event>>,
}

/// Cross-thread handle to one filter's membership in a stream. Queuing
/// events wakes the stream; the stream delivers them at the filter's
/// position on its next cycle.
#[derive(Clone)]
pub struct FilterHandle {
    id: FilterId,
    sort: u16,
    queues: Arc<PendingQueues>,
    finished: Arc<AtomicBool>,
    stream: StreamHandle,
}

impl FilterHandle {
    pub fn id(&self) -> FilterId {
        self.id
    }

    pub fn sort_position(&self) -> u16 {
        self.sort
    }

    pub fn stream(&self) -> &StreamHandle {
        &self.stream
    }

    /// Inject events into this filter's input queue, out of cycle.
    pub fn queue_input(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.queues.input.lock().unwrap().extend(events);
        self.stream.notify();
    }

    /// Inject events into this filter's output queue, out of cycle.
    pub fn queue_output(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.queues.output.lock().unwrap().extend(events);
        self.stream.notify();
    }

    /// Mark the filter done. The stream removes it at the end of the
    /// current cycle and never hands it another event.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.stream.notify();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn drain_input(&self) -> Vec<Event> {
        std::mem::take(&mut *self.queues.input.lock().unwrap())
    }

    fn drain_output(&self) -> Vec<Event> {
        std::mem::take(&mut *self.queues.output.lock().unwrap())
    }
}

impl fmt::Debug for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterHandle({}#{})", self.stream.name(), self.id)
    }
}

/// Context handed to a filter at start and stop.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub stream: StreamHandle,
    pub filter: FilterHandle,
}

enum StreamOp {
    InjectInput(Vec<Event>),
    InjectOutput(Vec<Event>),
    AddFilter(Box<dyn Filter + Send>),
    RemoveFilter(FilterId),
    Pause,
    Unpause,
    Notify,
    Shutdown,
}

/// Cloneable reference to a stream's operation queue. All calls are
/// asynchronous: they enqueue work and wake the processing loop. Calls
/// against a stream that has already finalized are quietly dropped.
#[derive(Clone)]
pub struct StreamHandle {
    name: Arc<str>,
    ops: Sender<StreamOp>,
}

impl StreamHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inject input events at the wire end of the chain.
    pub fn inject_input(&self, events: Vec<Event>) {
        if !events.is_empty() {
            let _ = self.ops.send(StreamOp::InjectInput(events));
        }
    }

    /// Inject output events at the interpreter end of the chain.
    pub fn inject_output(&self, events: Vec<Event>) {
        if !events.is_empty() {
            let _ = self.ops.send(StreamOp::InjectOutput(events));
        }
    }

    pub fn add_filter(&self, filter: Box<dyn Filter + Send>) {
        let _ = self.ops.send(StreamOp::AddFilter(filter));
    }

    pub fn remove_filter(&self, id: FilterId) {
        let _ = self.ops.send(StreamOp::RemoveFilter(id));
    }

    /// Stop processing input while continuing to deliver output.
    pub fn pause(&self) {
        let _ = self.ops.send(StreamOp::Pause);
    }

    pub fn unpause(&self) {
        let _ = self.ops.send(StreamOp::Unpause);
    }

    /// Wake the processing loop without queueing anything.
    pub fn notify(&self) {
        let _ = self.ops.send(StreamOp::Notify);
    }

    /// Tear the stream down: stop every filter and finalize.
    pub fn shutdown(&self) {
        let _ = self.ops.send(StreamOp::Shutdown);
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamHandle({})", self.name)
    }
}

/// Receiver of control events leaving the stream.
pub type ControlSink = Box<dyn FnMut(&StreamHandle, ControlEvent) + Send>;

struct FilterSlot {
    sort: u16,
    id: FilterId,
    filter: Box<dyn Filter + Send>,
    handle: FilterHandle,
    is_default: bool,
}

/// The ordered filter chain for one connection.
pub struct EventStream {
    name: Arc<str>,
    slots: Vec<FilterSlot>,
    next_id: FilterId,
    paused: bool,
    shutting_down: bool,
    finalized: bool,
    had_non_default: bool,
    injected_inputs: Vec<Event>,
    injected_outputs: Vec<Event>,
    ops_rx: Receiver<StreamOp>,
    handle: StreamHandle,
    sink: ControlSink,
}

impl EventStream {
    /// Create a stream with the two default terminal filters installed.
    /// Control events are logged and dropped until a sink is attached.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_history(name, 10)
    }

    /// As [`new`](Self::new), sizing the default output filter's replay
    /// ring explicitly.
    pub fn with_history(name: impl Into<String>, max_history_size: usize) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (ops_tx, ops_rx) = unbounded();
        let handle = StreamHandle {
            name: name.clone(),
            ops: ops_tx,
        };

        let mut stream = Self {
            name: name.clone(),
            slots: Vec::new(),
            next_id: 0,
            paused: false,
            shutting_down: false,
            finalized: false,
            had_non_default: false,
            injected_inputs: Vec::new(),
            injected_outputs: Vec::new(),
            ops_rx,
            handle,
            sink: Box::new(move |_, event| {
                trace!(stream = %name, ?event, "control event dropped (no sink)");
            }),
        };

        stream.insert_filter(Box::new(DefaultInputFilter::new()), true);
        stream.insert_filter(Box::new(DefaultOutputFilter::new(max_history_size)), true);
        stream
    }

    /// Attach the receiver for control events leaving the chain.
    pub fn set_control_sink(&mut self, sink: ControlSink) {
        self.sink = sink;
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn filter_count(&self) -> usize {
        self.slots.len()
    }

    /// Add a filter directly, calling its `start` and routing whatever
    /// it returns. Usable before the stream is spawned or from tests;
    /// cross-thread callers go through `StreamHandle::add_filter`.
    pub fn add_filter(&mut self, filter: Box<dyn Filter + Send>) -> FilterHandle {
        self.insert_filter(filter, false)
    }

    fn insert_filter(&mut self, filter: Box<dyn Filter + Send>, is_default: bool) -> FilterHandle {
        let sort = filter.sort_position();
        let id = self.next_id;
        self.next_id += 1;

        let handle = FilterHandle {
            id,
            sort,
            queues: Arc::new(PendingQueues::default()),
            finished: Arc::new(AtomicBool::new(false)),
            stream: self.handle.clone(),
        };

        // Ascending by (sort, insertion id): equal positions keep FIFO order.
        let index = self
            .slots
            .partition_point(|slot| (slot.sort, slot.id) <= (sort, id));
        self.slots.insert(
            index,
            FilterSlot {
                sort,
                id,
                filter,
                handle: handle.clone(),
                is_default,
            },
        );
        if !is_default {
            self.had_non_default = true;
        }

        debug!(stream = %self.name, filter = self.slots[index].filter.name(), sort, "filter added");

        let ctx = FilterContext {
            stream: self.handle.clone(),
            filter: handle.clone(),
        };
        let slot = &mut self.slots[index];
        let events = catch_unwind(AssertUnwindSafe(|| slot.filter.start(&ctx)))
            .unwrap_or_else(|_| {
                error!(stream = %ctx.stream.name, "filter start panicked");
                Vec::new()
            });
        self.route_results(index, events);

        handle
    }

    /// Remove a filter by id, calling its `stop`.
    pub fn remove_filter(&mut self, id: FilterId) {
        if let Some(index) = self.slots.iter().position(|slot| slot.id == id) {
            self.remove_slot(index);
        }
    }

    fn remove_slot(&mut self, index: usize) {
        let mut slot = self.slots.remove(index);
        let ctx = FilterContext {
            stream: self.handle.clone(),
            filter: slot.handle.clone(),
        };
        debug!(stream = %self.name, filter = slot.filter.name(), "filter removed");
        let events = catch_unwind(AssertUnwindSafe(|| slot.filter.stop(&ctx)))
            .unwrap_or_else(|_| {
                error!(stream = %self.name, "filter stop panicked");
                Vec::new()
            });
        // Stop events enter the chain where the filter used to sit.
        self.route_results(index, events);
    }

    /// Partition a handler's result and send each piece on its way.
    /// `below` is the index events of output direction start beneath.
    fn route_results(&mut self, below: usize, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut outputs = Vec::new();
        for event in events {
            match event {
                Event::Input(_) => self.injected_inputs.push(event),
                Event::Output(_) => outputs.push(event),
                Event::Control(control) => self.dispatch_control(control),
            }
        }
        if !outputs.is_empty() {
            self.output_pass(below, outputs);
        }
    }

    fn dispatch_control(&mut self, control: ControlEvent) {
        match control {
            ControlEvent::Callback(callback) => callback(),
            other => (self.sink)(&self.handle, other),
        }
    }

    /// One full processing cycle over whatever is queued.
    fn run_cycle(&mut self) {
        let inputs = std::mem::take(&mut self.injected_inputs);
        if self.paused {
            // Injected inputs wait; per-filter queues stay queued too.
            self.injected_inputs = inputs;
        } else {
            self.input_pass(inputs);
        }

        let outputs = std::mem::take(&mut self.injected_outputs);
        self.output_pass(self.slots.len(), outputs);
    }

    /// Climb the chain from the wire end. Each filter first receives
    /// its own queued input events, then the working set.
    fn input_pass(&mut self, initial: Vec<Event>) {
        let mut working = initial;
        let mut index = 0;
        while index < self.slots.len() {
            let slot = &self.slots[index];
            let mut incoming = slot.handle.drain_input();
            if slot.handle.is_finished() {
                // Finished filters get nothing; their queued events die
                // with them and the working set passes over.
                index += 1;
                continue;
            }
            incoming.append(&mut working);
            if incoming.is_empty() {
                index += 1;
                continue;
            }

            let results = self.call_handler(index, incoming, Direction::Input);
            let mut outputs = Vec::new();
            for event in results {
                match event {
                    Event::Input(_) => working.push(event),
                    Event::Output(_) => outputs.push(event),
                    Event::Control(control) => self.dispatch_control(control),
                }
            }
            if !outputs.is_empty() {
                // Outputs produced mid-climb descend from just below
                // the producing filter.
                self.output_pass(index, outputs);
            }
            index += 1;
        }

        if !working.is_empty() {
            trace!(stream = %self.name, count = working.len(), "unconsumed input dropped");
        }
    }

    /// Descend the chain toward the wire, starting below `upper`.
    fn output_pass(&mut self, upper: usize, initial: Vec<Event>) {
        let mut working = initial;
        for index in (0..upper.min(self.slots.len())).rev() {
            let slot = &self.slots[index];
            let mut incoming = slot.handle.drain_output();
            if slot.handle.is_finished() {
                continue;
            }
            incoming.append(&mut working);
            if incoming.is_empty() {
                continue;
            }

            let results = self.call_handler(index, incoming, Direction::Output);
            working = Vec::new();
            for event in results {
                match event {
                    Event::Output(_) => working.push(event),
                    // Inputs surfacing during the output pass are
                    // queued back at the input side for the next cycle.
                    Event::Input(_) => self.injected_inputs.push(event),
                    Event::Control(control) => self.dispatch_control(control),
                }
            }
        }

        if !working.is_empty() {
            trace!(stream = %self.name, count = working.len(), "unconsumed output dropped");
        }
    }

    fn call_handler(
        &mut self,
        index: usize,
        events: Vec<Event>,
        direction: Direction,
    ) -> Vec<Event> {
        let slot = &mut self.slots[index];
        let name = slot.filter.name();
        let result = catch_unwind(AssertUnwindSafe(|| match direction {
            Direction::Input => slot.filter.handle_input(events),
            Direction::Output => slot.filter.handle_output(events),
        }));
        match result {
            Ok(events) => events,
            Err(_) => {
                // A panicking handler loses its batch but keeps its
                // place in the chain unless it flagged itself finished.
                error!(stream = %self.name, filter = name, ?direction, "filter handler panicked");
                Vec::new()
            }
        }
    }

    /// Remove every filter whose finished flag went up this cycle.
    fn reap_finished(&mut self) {
        let mut index = 0;
        while index < self.slots.len() {
            if self.slots[index].handle.is_finished() {
                self.remove_slot(index);
            } else {
                index += 1;
            }
        }
    }

    fn apply_op(&mut self, op: StreamOp) {
        match op {
            StreamOp::InjectInput(events) => self.injected_inputs.extend(events),
            StreamOp::InjectOutput(events) => self.injected_outputs.extend(events),
            StreamOp::AddFilter(filter) => {
                self.insert_filter(filter, false);
            }
            StreamOp::RemoveFilter(id) => self.remove_filter(id),
            StreamOp::Pause => {
                debug!(stream = %self.name, "paused");
                self.paused = true;
            }
            StreamOp::Unpause => {
                debug!(stream = %self.name, "unpaused");
                self.paused = false;
            }
            StreamOp::Notify => {}
            StreamOp::Shutdown => self.shutting_down = true,
        }
    }

    /// Drain queued operations and run one cycle. Returns false once
    /// the stream has finalized.
    pub fn process_pending(&mut self) -> bool {
        while let Ok(op) = self.ops_rx.try_recv() {
            self.apply_op(op);
        }
        self.run_cycle();
        self.reap_finished();
        self.maybe_finalize();
        !self.finalized
    }

    fn maybe_finalize(&mut self) {
        if self.finalized {
            return;
        }
        let drained = self.had_non_default && self.slots.iter().all(|slot| slot.is_default);
        if self.shutting_down || drained {
            self.finalize();
        }
    }

    /// Stop all remaining filters, interpreter side first so their
    /// parting output still reaches the wire, then notify the sink.
    fn finalize(&mut self) {
        debug!(stream = %self.name, "finalizing");
        while let Some(index) = self.slots.len().checked_sub(1) {
            self.remove_slot(index);
        }
        self.finalized = true;
        (self.sink)(&self.handle, ControlEvent::ListenerCleanup);
    }

    /// Block on the operation queue, processing cycles until the
    /// stream finalizes.
    pub fn run(mut self) {
        loop {
            match self.ops_rx.recv() {
                Ok(op) => self.apply_op(op),
                Err(_) => self.shutting_down = true,
            }
            if !self.process_pending() {
                break;
            }
        }
        debug!(stream = %self.name, "stream ended");
    }

    /// Run the stream on its own named thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        let name = format!("stream-{}", self.name);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .expect("failed to spawn stream thread")
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Input,
    Output,
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.finalized && self.had_non_default {
            warn!(stream = %self.name, "stream dropped without finalizing");
        }
    }
}
