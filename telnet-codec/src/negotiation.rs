//! RFC 1143 Q-method option negotiation.
//!
//! RFC 854's negotiation rules permit two well-meaning endpoints to
//! volley WILL/DONT forever. RFC 1143 fixes the loop with a per-option
//! state machine: each side of each option is in one of six states, and
//! a request made while a negotiation is already in flight is queued
//! and replayed when the in-flight exchange completes instead of being
//! sent immediately.
//!
//! `Negotiator` tracks both sides of every option. Feed it received
//! WILL/WONT/DO/DONT sequences and local enable/disable requests; it
//! returns the wire replies to send plus state-change notices for the
//! layer above.

use crate::protocol::{Command, Sequence, TelnetOption};

/// Per-side, per-option negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptionState {
    /// Disabled.
    #[default]
    No,
    /// Enabled.
    Yes,
    /// Disable requested, waiting for the acknowledging WONT/DONT.
    WantNo,
    /// Enable requested, waiting for the acknowledging WILL/DO.
    WantYes,
    /// Disabling, with an enable request queued behind it.
    WantNoQueued,
    /// Enabling, with a disable request queued behind it.
    WantYesQueued,
}

/// Which end of the connection an option state describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Our options: negotiated with WILL/WONT from us, DO/DONT from the peer.
    Local,
    /// The peer's options: negotiated with DO/DONT from us, WILL/WONT from them.
    Remote,
}

/// Result of processing one negotiation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write this sequence to the peer.
    Send(Sequence),
    /// The option reached the enabled state on the given side.
    Enabled(Side, TelnetOption),
    /// The option left the enabled state on the given side.
    Disabled(Side, TelnetOption),
    /// The peer answered a disable request with the opposite command.
    /// The state falls back to disabled; callers log and move on.
    Violation {
        side: Side,
        option: TelnetOption,
        detail: &'static str,
    },
}

/// Which options this endpoint is willing to see enabled.
#[derive(Debug, Clone, Default)]
pub struct OptionPolicy {
    /// Options we will enable on our side when asked (or offer ourselves).
    pub local: Vec<TelnetOption>,
    /// Options we want or accept on the peer's side.
    pub remote: Vec<TelnetOption>,
}

impl OptionPolicy {
    pub fn supports(&self, side: Side, option: TelnetOption) -> bool {
        match side {
            Side::Local => self.local.contains(&option),
            Side::Remote => self.remote.contains(&option),
        }
    }
}

/// Q-method negotiator covering all 256 option codes on both sides.
#[derive(Debug, Clone)]
pub struct Negotiator {
    local: [OptionState; 256],
    remote: [OptionState; 256],
    policy: OptionPolicy,
}

impl Negotiator {
    pub fn new(policy: OptionPolicy) -> Self {
        Self {
            local: [OptionState::No; 256],
            remote: [OptionState::No; 256],
            policy,
        }
    }

    pub fn state(&self, side: Side, option: TelnetOption) -> OptionState {
        match side {
            Side::Local => self.local[option.0 as usize],
            Side::Remote => self.remote[option.0 as usize],
        }
    }

    pub fn is_enabled(&self, side: Side, option: TelnetOption) -> bool {
        self.state(side, option) == OptionState::Yes
    }

    fn set(&mut self, side: Side, option: TelnetOption, state: OptionState) {
        match side {
            Side::Local => self.local[option.0 as usize] = state,
            Side::Remote => self.remote[option.0 as usize] = state,
        }
    }

    /// Process a received WILL/WONT/DO/DONT.
    pub fn receive(&mut self, command: Command, option: TelnetOption) -> Vec<Action> {
        match command {
            // Peer statements about its own side.
            Command::Will => self.receive_positive(Side::Remote, option),
            Command::Wont => self.receive_negative(Side::Remote, option),
            // Peer requests about our side.
            Command::Do => self.receive_positive(Side::Local, option),
            Command::Dont => self.receive_negative(Side::Local, option),
            _ => Vec::new(),
        }
    }

    /// WILL (remote side) or DO (local side): the peer wants the option on.
    fn receive_positive(&mut self, side: Side, option: TelnetOption) -> Vec<Action> {
        let accept = accept_command(side);
        let refuse = refuse_command(side);

        match self.state(side, option) {
            OptionState::No => {
                if self.policy.supports(side, option) {
                    self.set(side, option, OptionState::Yes);
                    vec![
                        Action::Send(Sequence::Negotiation {
                            command: accept,
                            option,
                        }),
                        Action::Enabled(side, option),
                    ]
                } else {
                    vec![Action::Send(Sequence::Negotiation {
                        command: refuse,
                        option,
                    })]
                }
            }
            OptionState::Yes => Vec::new(),
            OptionState::WantNo | OptionState::WantNoQueued => {
                // We asked for off and were answered with on. Fall back
                // to disabled rather than trusting the peer's state.
                self.set(side, option, OptionState::No);
                vec![Action::Violation {
                    side,
                    option,
                    detail: "disable request answered affirmatively",
                }]
            }
            OptionState::WantYes => {
                self.set(side, option, OptionState::Yes);
                vec![Action::Enabled(side, option)]
            }
            OptionState::WantYesQueued => {
                // Enable acknowledged, but a disable was queued behind
                // it; start that negotiation now.
                self.set(side, option, OptionState::WantNo);
                vec![
                    Action::Send(Sequence::Negotiation {
                        command: refuse,
                        option,
                    }),
                    Action::Disabled(side, option),
                ]
            }
        }
    }

    /// WONT (remote side) or DONT (local side): the peer wants the option off.
    fn receive_negative(&mut self, side: Side, option: TelnetOption) -> Vec<Action> {
        let accept = accept_command(side);
        let refuse = refuse_command(side);

        match self.state(side, option) {
            OptionState::No => Vec::new(),
            OptionState::Yes => {
                self.set(side, option, OptionState::No);
                vec![
                    Action::Send(Sequence::Negotiation {
                        command: refuse,
                        option,
                    }),
                    Action::Disabled(side, option),
                ]
            }
            OptionState::WantNo => {
                self.set(side, option, OptionState::No);
                Vec::new()
            }
            OptionState::WantNoQueued => {
                // Disable acknowledged; replay the queued enable.
                self.set(side, option, OptionState::WantYes);
                vec![Action::Send(Sequence::Negotiation {
                    command: accept,
                    option,
                })]
            }
            OptionState::WantYes | OptionState::WantYesQueued => {
                // Enable refused. A queued disable is moot.
                self.set(side, option, OptionState::No);
                Vec::new()
            }
        }
    }

    /// Ask for an option to be enabled on the given side.
    pub fn request_enable(&mut self, side: Side, option: TelnetOption) -> Vec<Action> {
        match self.state(side, option) {
            OptionState::No => {
                self.set(side, option, OptionState::WantYes);
                vec![Action::Send(Sequence::Negotiation {
                    command: accept_command(side),
                    option,
                })]
            }
            OptionState::WantNo => {
                self.set(side, option, OptionState::WantNoQueued);
                Vec::new()
            }
            OptionState::WantYesQueued => {
                // Cancel the queued disable.
                self.set(side, option, OptionState::WantYes);
                Vec::new()
            }
            OptionState::Yes | OptionState::WantYes | OptionState::WantNoQueued => Vec::new(),
        }
    }

    /// Ask for an option to be disabled on the given side.
    pub fn request_disable(&mut self, side: Side, option: TelnetOption) -> Vec<Action> {
        match self.state(side, option) {
            OptionState::Yes => {
                // Treated as off from this moment per RFC 1143.
                self.set(side, option, OptionState::WantNo);
                vec![
                    Action::Send(Sequence::Negotiation {
                        command: refuse_command(side),
                        option,
                    }),
                    Action::Disabled(side, option),
                ]
            }
            OptionState::WantYes => {
                self.set(side, option, OptionState::WantYesQueued);
                Vec::new()
            }
            OptionState::WantNoQueued => {
                // Cancel the queued enable.
                self.set(side, option, OptionState::WantNo);
                Vec::new()
            }
            OptionState::No | OptionState::WantNo | OptionState::WantYesQueued => Vec::new(),
        }
    }
}

/// The affirmative command for a side: WILL about us, DO about the peer.
fn accept_command(side: Side) -> Command {
    match side {
        Side::Local => Command::Will,
        Side::Remote => Command::Do,
    }
}

/// The negative command for a side: WONT about us, DONT about the peer.
fn refuse_command(side: Side) -> Command {
    match side {
        Side::Local => Command::Wont,
        Side::Remote => Command::Dont,
    }
}
