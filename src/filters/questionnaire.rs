//! Step-driven prompted dialogs.
//!
//! A questionnaire walks a connection through an ordered list of
//! [`Step`]s: ask, validate, record, advance. When the last step is
//! answered the finalizer runs with the collected answers and the
//! filter finishes. Output from elsewhere in the system is held back
//! while the dialog is active and released when it ends, so the
//! conversation is not interrupted; the questionnaire's own prompts
//! and error lines go out immediately.
//!
//! A step may block: its validator parks the dialog on an external
//! decision, the stream is paused, and a [`RestartHandle`] resumes the
//! dialog with the decision's value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;
use tracing::warn;

use crate::events::{Event, OutputEvent};
use crate::filters::{Filter, QUESTIONNAIRE_SORT};
use crate::stream::{FilterContext, FilterHandle};

/// An accepted answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerValue {
    Text(String),
    /// Capture groups from a pattern validator, in group order.
    Captures(Vec<String>),
    /// A skipped step with no default and no skip hook.
    Skipped,
}

impl AnswerValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AnswerValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Verdict of a procedural validator.
pub enum ProcOutcome {
    /// Ask the step again.
    Reject,
    /// Accept the raw input as the answer.
    AcceptInput,
    /// Accept this value as the answer.
    Accept(AnswerValue),
    /// Park the dialog on an external decision; only honored on steps
    /// marked blocking.
    Block,
}

pub type ProcValidator = Arc<dyn Fn(&mut QuestionnaireFilter, &str) -> ProcOutcome + Send + Sync>;
type SkipHook = Arc<dyn Fn(&Step) -> AnswerValue + Send + Sync>;
type UndoHook = Arc<dyn Fn(&Step) + Send + Sync>;

/// How an answer is checked. The kinds are mutually exclusive.
#[derive(Clone)]
pub enum Validator {
    Proc(ProcValidator),
    Pattern(Regex),
    OneOf(Vec<String>),
    Map(HashMap<String, String>),
}

/// How a step's question is produced.
pub enum StepPrompt {
    Text(String),
    Event(OutputEvent),
    Dynamic(Arc<dyn Fn(&QuestionnaireFilter) -> String + Send + Sync>),
}

/// One prompt-validate-accept stage.
pub struct Step {
    name: String,
    prompt: Option<StepPrompt>,
    validator: Option<Validator>,
    default: Option<String>,
    error_message: Option<String>,
    hidden: bool,
    blocking: bool,
    on_skip: Option<SkipHook>,
    on_undo: Option<UndoHook>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: None,
            validator: None,
            default: None,
            error_message: None,
            hidden: false,
            blocking: false,
            on_skip: None,
            on_undo: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(StepPrompt::Text(prompt.into()));
        self
    }

    pub fn prompt_event(mut self, event: OutputEvent) -> Self {
        self.prompt = Some(StepPrompt::Event(event));
        self
    }

    pub fn prompt_with(
        mut self,
        render: impl Fn(&QuestionnaireFilter) -> String + Send + Sync + 'static,
    ) -> Self {
        self.prompt = Some(StepPrompt::Dynamic(Arc::new(render)));
        self
    }

    pub fn validate_with(
        mut self,
        proc_validator: impl Fn(&mut QuestionnaireFilter, &str) -> ProcOutcome + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Validator::Proc(Arc::new(proc_validator)));
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.validator = Some(Validator::Pattern(pattern));
        self
    }

    pub fn one_of(mut self, choices: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.validator = Some(Validator::OneOf(
            choices.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn map<K, V, I>(mut self, table: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.validator = Some(Validator::Map(
            table
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ));
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn on_skip(mut self, hook: impl Fn(&Step) -> AnswerValue + Send + Sync + 'static) -> Self {
        self.on_skip = Some(Arc::new(hook));
        self
    }

    pub fn on_undo(mut self, hook: impl Fn(&Step) + Send + Sync + 'static) -> Self {
        self.on_undo = Some(Arc::new(hook));
        self
    }
}

pub type Finalizer = Arc<dyn Fn(&mut QuestionnaireFilter) -> Vec<Event> + Send + Sync>;

/// Resumes a blocked questionnaire with the external decision's value.
#[derive(Clone)]
pub struct RestartHandle {
    slot: Arc<Mutex<Option<AnswerValue>>>,
    filter: FilterHandle,
}

impl RestartHandle {
    pub fn restart(&self, value: AnswerValue) {
        *self.slot.lock().unwrap() = Some(value);
        self.filter.stream().unpause();
        // An empty poke event drives the next cycle; the blocked
        // branch consumes it and reads the slot instead.
        self.filter.queue_input(vec![Event::input("")]);
    }
}

pub struct QuestionnaireFilter {
    name: String,
    steps: Vec<Step>,
    current: isize,
    answers: HashMap<String, AnswerValue>,
    finalizer: Option<Finalizer>,
    result: Option<HashMap<String, AnswerValue>>,
    delayed: Vec<Event>,
    in_progress: bool,
    blocked: bool,
    finalized: bool,
    restart_slot: Arc<Mutex<Option<AnswerValue>>>,
    ctx: Option<FilterContext>,
}

impl QuestionnaireFilter {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            current: -1,
            answers: HashMap::new(),
            finalizer: None,
            result: None,
            delayed: Vec::new(),
            in_progress: false,
            blocked: false,
            finalized: false,
            restart_slot: Arc::new(Mutex::new(None)),
            ctx: None,
        }
    }

    pub fn with_finalizer(
        mut self,
        finalizer: impl Fn(&mut QuestionnaireFilter) -> Vec<Event> + Send + Sync + 'static,
    ) -> Self {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn questionnaire_name(&self) -> &str {
        &self.name
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn current_step_index(&self) -> isize {
        self.current
    }

    pub fn answers(&self) -> &HashMap<String, AnswerValue> {
        &self.answers
    }

    pub fn answer(&self, step_name: &str) -> Option<&AnswerValue> {
        self.answers.get(step_name)
    }

    /// The collected answers, set when the finalizer runs.
    pub fn result(&self) -> Option<&HashMap<String, AnswerValue>> {
        self.result.as_ref()
    }

    pub fn context(&self) -> Option<&FilterContext> {
        self.ctx.as_ref()
    }

    /// Handle for resuming a blocked dialog. Only meaningful once the
    /// questionnaire has started.
    pub fn restart_handle(&self) -> Option<RestartHandle> {
        self.ctx.as_ref().map(|ctx| RestartHandle {
            slot: self.restart_slot.clone(),
            filter: ctx.filter.clone(),
        })
    }

    /// Step back `n` steps, dropping their answers and running undo
    /// hooks. Clamped at the first step.
    pub fn undo_steps(&mut self, n: usize) {
        for _ in 0..n {
            if self.current <= 0 {
                self.current = 0;
                break;
            }
            self.current -= 1;
            let index = self.current as usize;
            if let Some(hook) = self.steps[index].on_undo.clone() {
                hook(&self.steps[index]);
            }
            let name = self.steps[index].name.clone();
            self.answers.remove(&name);
        }
    }

    /// Skip forward `n` steps, filling each skipped answer from its
    /// skip hook, then its default, then the skipped sentinel. Clamped
    /// at the end of the step list.
    pub fn skip_steps(&mut self, n: usize) {
        for _ in 0..n {
            let index = self.current.max(0) as usize;
            if index >= self.steps.len() {
                break;
            }
            let step = &self.steps[index];
            let value = match (&step.on_skip, &step.default) {
                (Some(hook), _) => hook(step),
                (None, Some(default)) => AnswerValue::Text(default.clone()),
                (None, None) => AnswerValue::Skipped,
            };
            self.answers.insert(step.name.clone(), value);
            self.current += 1;
        }
        if self.current as usize >= self.steps.len() {
            self.in_progress = false;
        }
    }

    /// Emit `message`, drop all progress, and finish the filter. Any
    /// delayed output is released first.
    pub fn abort(&mut self, message: impl Into<String>) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        let mut out: Vec<Event> = self.delayed.drain(..).collect();
        out.push(Event::Output(OutputEvent::error(message.into())));
        ctx.filter.queue_output(out);
        self.answers.clear();
        self.in_progress = false;
        self.blocked = false;
        self.finalized = true;
        ctx.filter.finish();
    }

    fn current_step(&self) -> Option<&Step> {
        if self.current < 0 {
            return None;
        }
        self.steps.get(self.current as usize)
    }

    /// Events that ask the current step's question.
    fn ask_current(&self) -> Vec<Event> {
        let Some(step) = self.current_step() else {
            return Vec::new();
        };

        let as_prompt = |text: String| {
            if step.hidden {
                OutputEvent::hidden_prompt(text)
            } else {
                OutputEvent::prompt(text)
            }
        };

        let output = match &step.prompt {
            Some(StepPrompt::Text(text)) => as_prompt(text.clone()),
            Some(StepPrompt::Event(event)) => event.clone(),
            Some(StepPrompt::Dynamic(render)) => as_prompt(render(self)),
            None => {
                let mut text = step.name.clone();
                if let Some(first) = text.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                as_prompt(format!("{}: ", text))
            }
        };
        vec![Event::Output(output)]
    }

    fn step_error(&self, data: &str) -> Event {
        let message = self
            .current_step()
            .and_then(|step| step.error_message.clone())
            .unwrap_or_else(|| format!("'{}' is not a valid answer.", data));
        Event::Output(OutputEvent::error(message))
    }

    /// Record an accepted answer and move on.
    fn accept(&mut self, value: AnswerValue, out: &mut Vec<Event>) {
        if let Some(step) = self.current_step() {
            let name = step.name.clone();
            self.answers.insert(name, value);
        }
        self.current += 1;
        if self.current as usize >= self.steps.len() {
            self.in_progress = false;
        } else {
            out.extend(self.ask_current());
        }
    }

    fn consume_input(&mut self, data: &str, out: &mut Vec<Event>) {
        // Clone the step pieces up front; validators may re-enter the
        // questionnaire mutably.
        let (validator, default, blocking) = match self.current_step() {
            Some(step) => (step.validator.clone(), step.default.clone(), step.blocking),
            None => return,
        };

        enum Verdict {
            Accept(AnswerValue),
            Retry,
            RetryQuiet,
            Block,
        }

        let verdict = match validator {
            None => {
                if data.is_empty() {
                    match default {
                        Some(default) => Verdict::Accept(AnswerValue::Text(default)),
                        None => {
                            self.abort("Aborted.");
                            return;
                        }
                    }
                } else {
                    Verdict::Accept(AnswerValue::Text(data.to_string()))
                }
            }
            Some(Validator::Proc(proc_validator)) => {
                match proc_validator(self, data) {
                    ProcOutcome::Reject => Verdict::RetryQuiet,
                    ProcOutcome::AcceptInput => {
                        Verdict::Accept(AnswerValue::Text(data.to_string()))
                    }
                    ProcOutcome::Accept(value) => Verdict::Accept(value),
                    ProcOutcome::Block if blocking => Verdict::Block,
                    ProcOutcome::Block => {
                        warn!(
                            questionnaire = %self.name,
                            "validator blocked on a non-blocking step"
                        );
                        Verdict::RetryQuiet
                    }
                }
            }
            Some(Validator::Pattern(pattern)) => match pattern.captures(data) {
                None => Verdict::Retry,
                Some(captures) => {
                    if captures.len() > 1 {
                        let groups = captures
                            .iter()
                            .skip(1)
                            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                            .collect();
                        Verdict::Accept(AnswerValue::Captures(groups))
                    } else {
                        Verdict::Accept(AnswerValue::Text(captures[0].to_string()))
                    }
                }
            },
            Some(Validator::OneOf(choices)) => {
                if choices.iter().any(|choice| choice == data) {
                    Verdict::Accept(AnswerValue::Text(data.to_string()))
                } else {
                    Verdict::Retry
                }
            }
            Some(Validator::Map(table)) => {
                let key = data.trim();
                match table
                    .get(key)
                    .or_else(|| table.get(&key.to_ascii_lowercase()))
                {
                    Some(value) => Verdict::Accept(AnswerValue::Text(value.clone())),
                    None => Verdict::Retry,
                }
            }
        };

        // The validator may have aborted the whole dialog.
        if self.finalized {
            return;
        }

        match verdict {
            Verdict::Accept(value) => self.accept(value, out),
            Verdict::Retry => {
                out.push(self.step_error(data));
                out.extend(self.ask_current());
            }
            Verdict::RetryQuiet => out.extend(self.ask_current()),
            Verdict::Block => {
                self.blocked = true;
                if let Some(ctx) = &self.ctx {
                    ctx.stream.pause();
                }
            }
        }
    }

    fn run_finalizer(&mut self) -> Vec<Event> {
        self.finalized = true;
        self.result = Some(self.answers.clone());

        let mut out: Vec<Event> = self.delayed.drain(..).collect();
        if let Some(finalizer) = self.finalizer.clone() {
            out.extend(finalizer(self));
        }
        if let Some(ctx) = &self.ctx {
            ctx.filter.finish();
        }
        out
    }
}

impl Filter for QuestionnaireFilter {
    fn name(&self) -> &'static str {
        "questionnaire"
    }

    fn sort_position(&self) -> u16 {
        QUESTIONNAIRE_SORT
    }

    fn start(&mut self, ctx: &FilterContext) -> Vec<Event> {
        self.ctx = Some(ctx.clone());
        if self.steps.is_empty() {
            self.in_progress = false;
            return self.run_finalizer();
        }
        self.in_progress = true;
        self.current = 0;
        self.ask_current()
    }

    fn stop(&mut self, _ctx: &FilterContext) -> Vec<Event> {
        // Anything still delayed goes out with the filter.
        self.delayed.drain(..).collect()
    }

    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut out = Vec::new();

        for event in events {
            match event {
                Event::Input(input) => {
                    if self.blocked {
                        let resumed = self.restart_slot.lock().unwrap().take();
                        match resumed {
                            Some(value) => {
                                self.blocked = false;
                                // The poke event that carried the
                                // resume is consumed here.
                                self.accept(value, &mut out);
                            }
                            None => out.push(Event::Input(input)),
                        }
                    } else if self.in_progress {
                        self.consume_input(&input.data, &mut out);
                    } else {
                        out.push(Event::Input(input));
                    }
                }
                other => out.push(other),
            }
        }

        if !self.in_progress && !self.finalized {
            out.extend(self.run_finalizer());
        }

        out
    }

    fn handle_output(&mut self, events: Vec<Event>) -> Vec<Event> {
        if !self.in_progress || self.finalized {
            return events;
        }
        let mut rest = Vec::new();
        for event in events {
            match event {
                Event::Output(_) => self.delayed.push(event),
                other => rest.push(other),
            }
        }
        rest
    }
}
