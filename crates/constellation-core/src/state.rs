//! Satellite lifecycle vocabulary.
//!
//! Steady states are spelled uppercase on the wire and in operator-facing
//! strings, transitional states lowercase; [`State::name`] preserves that
//! convention.

use std::fmt;

use thiserror::Error;

/// A state of the satellite finite state machine.
///
/// The discriminant values are fixed: they are carried as a single byte in
/// CHP1 heartbeat messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    /// Freshly started, not yet initialized.
    New = 0x10,
    /// `initialize` in progress.
    Initializing = 0x12,
    /// Initialized, configuration applied.
    Init = 0x20,
    /// `launch` in progress.
    Launching = 0x23,
    /// `land` in progress.
    Landing = 0x24,
    /// Ready for data taking.
    Orbit = 0x30,
    /// `reconfigure` in progress.
    Reconfiguring = 0x33,
    /// `start` in progress.
    Starting = 0x34,
    /// `stop` in progress.
    Stopping = 0x35,
    /// Data acquisition running.
    Run = 0x40,
    /// Interrupt in progress.
    Interrupting = 0x0E,
    /// Safe mode after an interrupt.
    Safe = 0xE0,
    /// Failure state, requires re-initialization.
    Error = 0xF0,
}

impl State {
    /// All states, in lifecycle order.
    pub const ALL: [State; 13] = [
        State::New,
        State::Initializing,
        State::Init,
        State::Launching,
        State::Landing,
        State::Orbit,
        State::Reconfiguring,
        State::Starting,
        State::Stopping,
        State::Run,
        State::Interrupting,
        State::Safe,
        State::Error,
    ];

    /// Whether this is a steady (non-transitional) state.
    #[must_use]
    pub const fn is_steady(self) -> bool {
        !self.is_transitional()
    }

    /// Whether a user action is currently executing in this state.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(
            self,
            State::Initializing
                | State::Launching
                | State::Landing
                | State::Reconfiguring
                | State::Starting
                | State::Stopping
                | State::Interrupting
        )
    }

    /// Whether a satellite may be shut down from this state.
    #[must_use]
    pub const fn shutdown_allowed(self) -> bool {
        matches!(self, State::New | State::Init | State::Safe | State::Error)
    }

    /// Wire representation, one byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the wire representation.
    ///
    /// # Errors
    /// Returns [`UnknownState`] for bytes that do not name a state.
    pub fn from_u8(byte: u8) -> Result<Self, UnknownState> {
        State::ALL
            .into_iter()
            .find(|state| state.as_u8() == byte)
            .ok_or(UnknownState { byte })
    }

    /// The state name as written on the wire and shown to operators.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            State::New => "NEW",
            State::Initializing => "initializing",
            State::Init => "INIT",
            State::Launching => "launching",
            State::Landing => "landing",
            State::Orbit => "ORBIT",
            State::Reconfiguring => "reconfiguring",
            State::Starting => "starting",
            State::Stopping => "stopping",
            State::Run => "RUN",
            State::Interrupting => "interrupting",
            State::Safe => "SAFE",
            State::Error => "ERROR",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for a state byte that does not name a state.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown FSM state byte {byte:#04x}")]
pub struct UnknownState {
    /// The byte that failed to decode.
    pub byte: u8,
}

/// An FSM transition, including the internal completion transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Initialize,
    Initialized,
    Launch,
    Launched,
    Land,
    Landed,
    Reconfigure,
    Reconfigured,
    Start,
    Started,
    Stop,
    Stopped,
    Interrupt,
    Interrupted,
    Failure,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Initialize => "initialize",
            Transition::Initialized => "initialized",
            Transition::Launch => "launch",
            Transition::Launched => "launched",
            Transition::Land => "land",
            Transition::Landed => "landed",
            Transition::Reconfigure => "reconfigure",
            Transition::Reconfigured => "reconfigured",
            Transition::Start => "start",
            Transition::Started => "started",
            Transition::Stop => "stop",
            Transition::Stopped => "stopped",
            Transition::Interrupt => "interrupt",
            Transition::Interrupted => "interrupted",
            Transition::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// The subset of transitions that may be requested via CSCP.
///
/// `interrupt` and `failure` are internal-only and deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionCommand {
    Initialize,
    Launch,
    Land,
    Reconfigure,
    Start,
    Stop,
}

impl TransitionCommand {
    /// Parse a CSCP verb (already lowercased) into a transition command.
    #[must_use]
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "initialize" => Some(Self::Initialize),
            "launch" => Some(Self::Launch),
            "land" => Some(Self::Land),
            "reconfigure" => Some(Self::Reconfigure),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    /// The corresponding FSM transition.
    #[must_use]
    pub const fn transition(self) -> Transition {
        match self {
            Self::Initialize => Transition::Initialize,
            Self::Launch => Transition::Launch,
            Self::Land => Transition::Land,
            Self::Reconfigure => Transition::Reconfigure,
            Self::Start => Transition::Start,
            Self::Stop => Transition::Stop,
        }
    }
}

impl fmt::Display for TransitionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.transition().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_and_transitional_partition_all_states() {
        for state in State::ALL {
            assert_ne!(state.is_steady(), state.is_transitional());
        }
    }

    #[test]
    fn state_bytes_roundtrip() {
        for state in State::ALL {
            assert_eq!(State::from_u8(state.as_u8()), Ok(state));
        }
        assert!(State::from_u8(0x00).is_err());
    }

    #[test]
    fn casing_convention() {
        assert_eq!(State::Orbit.name(), "ORBIT");
        assert_eq!(State::Launching.name(), "launching");
    }

    #[test]
    fn shutdown_only_from_idle_states() {
        let allowed: Vec<_> = State::ALL.into_iter().filter(|s| s.shutdown_allowed()).collect();
        assert_eq!(allowed, vec![State::New, State::Init, State::Safe, State::Error]);
    }

    #[test]
    fn transition_commands_parse_case_sensitive_lowercase() {
        assert_eq!(TransitionCommand::from_verb("launch"), Some(TransitionCommand::Launch));
        assert_eq!(TransitionCommand::from_verb("interrupt"), None);
        assert_eq!(TransitionCommand::from_verb("failure"), None);
    }
}
