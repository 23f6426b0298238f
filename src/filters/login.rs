//! Credential collection and authentication hand-off.
//!
//! The login filter walks a connection through username and password
//! prompts, then emits a `LoginAuth` control event carrying the
//! credentials and a pair of callbacks. Whoever owns the stream's
//! control sink routes that to an authenticator; the callbacks queue
//! the verdict back into this filter's input queue from whatever
//! thread the authenticator answers on.
//!
//! Input arriving while the verdict is pending is held, not consumed:
//! a failure replays it through the username prompt, a success
//! reinjects it for the shell that replaces this filter.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use crate::auth::AuthRequest;
use crate::config::LoginConfig;
use crate::events::{ControlEvent, Event, OutputEvent};
use crate::filters::{Filter, LOGIN_SORT};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::stream::FilterContext;
use crate::users::User;

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z][a-z0-9_]+").expect("username pattern"));

const USERNAME_PROMPT: &str = "Username: ";
const PASSWORD_PROMPT: &str = "Password: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginState {
    CollectUsername,
    CollectPassword,
    AwaitingAuth,
    Done,
}

pub struct LoginFilter {
    config: LoginConfig,
    scheduler: Arc<Scheduler>,
    state: LoginState,
    attempts: u32,
    username: Option<String>,
    held: Vec<Event>,
    timeout: Option<TimerHandle>,
    ctx: Option<FilterContext>,
}

impl LoginFilter {
    pub fn new(config: LoginConfig, scheduler: Arc<Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            state: LoginState::CollectUsername,
            attempts: 0,
            username: None,
            held: Vec::new(),
            timeout: None,
            ctx: None,
        }
    }

    fn username_prompt(&self) -> Event {
        Event::Output(OutputEvent::prompt(USERNAME_PROMPT))
    }

    fn collect_username(&mut self, data: &str, out: &mut Vec<Event>) {
        let data = data.trim();
        if data.is_empty() {
            out.push(self.username_prompt());
            return;
        }
        match USERNAME_RE.find(data) {
            Some(found) => {
                self.username = Some(found.as_str().to_string());
                self.state = LoginState::CollectPassword;
                out.push(Event::Output(OutputEvent::hidden_prompt(PASSWORD_PROMPT)));
            }
            None => {
                out.push(Event::Output(OutputEvent::error(
                    "Usernames are lowercase letters, digits, and underscores.",
                )));
                out.push(self.username_prompt());
            }
        }
    }

    fn collect_password(&mut self, data: &str, out: &mut Vec<Event>) {
        if !data.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            out.push(Event::Output(OutputEvent::error(
                "Passwords are printable characters only.",
            )));
            out.push(Event::Output(OutputEvent::hidden_prompt(PASSWORD_PROMPT)));
            return;
        }

        let Some(ctx) = &self.ctx else {
            return;
        };
        let username = self.username.take().unwrap_or_default();

        let success_handle = ctx.filter.clone();
        let failure_handle = ctx.filter.clone();
        let request = AuthRequest {
            username,
            password: data.to_string(),
            on_success: Arc::new(move |user: Arc<User>| {
                success_handle.queue_input(vec![Event::Control(ControlEvent::UserLogin { user })]);
            }),
            on_failure: Arc::new(move |reason: String| {
                failure_handle.queue_input(vec![Event::Control(ControlEvent::LoginFailure {
                    reason,
                    fatal: false,
                })]);
            }),
        };

        self.state = LoginState::AwaitingAuth;
        out.push(Event::Control(ControlEvent::LoginAuth(request)));
    }

    fn auth_succeeded(&mut self, user: Arc<User>, out: &mut Vec<Event>) {
        info!(username = %user.username, "login succeeded");
        self.state = LoginState::Done;
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }

        out.push(Event::Output(OutputEvent::text(format!(
            "Logged in as {}.",
            user.username
        ))));
        out.push(Event::Control(ControlEvent::UserLogin { user }));

        // Input typed ahead of the verdict belongs to whatever replaces
        // this filter. The sink installs that replacement when it sees
        // UserLogin above, so a callback ordered after it reinjects the
        // held lines at the right moment.
        if !self.held.is_empty()
            && let Some(ctx) = &self.ctx
        {
            let stream = ctx.stream.clone();
            let held = std::mem::take(&mut self.held);
            out.push(Event::Control(ControlEvent::Callback(Arc::new(move || {
                stream.inject_input(held.clone());
            }))));
        }

        if let Some(ctx) = &self.ctx {
            ctx.filter.finish();
        }
    }

    fn auth_failed(
        &mut self,
        reason: String,
        fatal: bool,
        out: &mut Vec<Event>,
        pending: &mut VecDeque<Event>,
    ) {
        self.username = None;

        if fatal {
            warn!(reason = %reason, "login terminated");
            self.state = LoginState::Done;
            out.push(Event::Output(OutputEvent::error(reason.clone())));
            out.push(Event::Control(ControlEvent::LoginFailure { reason, fatal: true }));
            if let Some(timeout) = self.timeout.take() {
                timeout.cancel();
            }
            if let Some(ctx) = &self.ctx {
                ctx.filter.finish();
            }
            return;
        }

        self.attempts += 1;
        if self.attempts >= self.config.max_tries {
            let reason = format!("Too many failed logins ({}).", self.attempts);
            self.auth_failed(reason, true, out, pending);
            return;
        }

        warn!(attempt = self.attempts, reason = %reason, "login failed");
        self.state = LoginState::CollectUsername;
        out.push(Event::Output(OutputEvent::error(reason)));
        out.push(self.username_prompt());

        // Replay anything typed while the verdict was pending.
        for event in self.held.drain(..).rev() {
            pending.push_front(event);
        }
    }
}

impl Filter for LoginFilter {
    fn name(&self) -> &'static str {
        "login"
    }

    fn sort_position(&self) -> u16 {
        LOGIN_SORT
    }

    fn start(&mut self, ctx: &FilterContext) -> Vec<Event> {
        self.ctx = Some(ctx.clone());

        let timeout_handle = ctx.filter.clone();
        self.timeout = Some(self.scheduler.schedule_in(self.config.timeout, move || {
            timeout_handle.queue_input(vec![Event::Control(ControlEvent::LoginFailure {
                reason: "Login timed out.".to_string(),
                fatal: true,
            })]);
        }));

        vec![
            Event::Output(OutputEvent::text(self.config.banner.clone())),
            self.username_prompt(),
        ]
    }

    fn stop(&mut self, _ctx: &FilterContext) -> Vec<Event> {
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
        self.ctx = None;
        Vec::new()
    }

    fn handle_input(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        let mut pending: VecDeque<Event> = events.into();

        while let Some(event) = pending.pop_front() {
            match event {
                Event::Control(ControlEvent::UserLogin { user }) => {
                    if self.state == LoginState::AwaitingAuth {
                        self.auth_succeeded(user, &mut out);
                    } else {
                        // A verdict for a session that already ended.
                        warn!(username = %user.username, "late auth success rejected");
                    }
                }
                Event::Control(ControlEvent::LoginFailure { reason, fatal }) => {
                    if self.state == LoginState::Done {
                        continue;
                    }
                    self.auth_failed(reason, fatal, &mut out, &mut pending);
                }
                Event::Input(input) => match self.state {
                    LoginState::CollectUsername => self.collect_username(&input.data, &mut out),
                    LoginState::CollectPassword => self.collect_password(&input.data, &mut out),
                    LoginState::AwaitingAuth => self.held.push(Event::Input(input)),
                    LoginState::Done => out.push(Event::Input(input)),
                },
                other => out.push(other),
            }
        }

        out
    }
}
