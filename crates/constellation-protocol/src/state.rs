//! Lifecycle state machine definitions shared between the satellite FSM,
//! the heartbeat payload and remote controllers.

use std::fmt;

use crate::error::DecodeError;

/// Satellite lifecycle states. Lowercase names are transient: the satellite
/// sits in them while a transition routine is executing on its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    New = 0,
    Initializing = 1,
    Init = 2,
    Launching = 3,
    Landing = 4,
    Orbit = 5,
    Reconfiguring = 6,
    Starting = 7,
    Stopping = 8,
    Run = 9,
    Interrupting = 10,
    Safe = 11,
    Error = 12,
}

impl State {
    /// Steady states are the graph nodes a satellite can rest in.
    pub fn is_steady(self) -> bool {
        matches!(
            self,
            State::New | State::Init | State::Orbit | State::Run | State::Safe | State::Error
        )
    }

    pub fn is_transient(self) -> bool {
        !self.is_steady()
    }

    /// The `shutdown` command is only honored from these states.
    pub fn is_shutdown_allowed(self) -> bool {
        matches!(self, State::New | State::Init | State::Safe | State::Error)
    }

    pub fn name(self) -> &'static str {
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

impl TryFrom<u8> for State {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => State::New,
            1 => State::Initializing,
            2 => State::Init,
            3 => State::Launching,
            4 => State::Landing,
            5 => State::Orbit,
            6 => State::Reconfiguring,
            7 => State::Starting,
            8 => State::Stopping,
            9 => State::Run,
            10 => State::Interrupting,
            11 => State::Safe,
            12 => State::Error,
            other => {
                return Err(DecodeError::Field {
                    field: "state",
                    value: u64::from(other),
                })
            }
        })
    }
}

/// Every edge of the lifecycle graph, including the internal completion
/// transitions fired by transition workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
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
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The subset of transitions remote controllers may request via CSCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCommand {
    Initialize,
    Launch,
    Land,
    Reconfigure,
    Start,
    Stop,
}

impl TransitionCommand {
    /// Parse a lowercased command verb.
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "initialize" => Some(TransitionCommand::Initialize),
            "launch" => Some(TransitionCommand::Launch),
            "land" => Some(TransitionCommand::Land),
            "reconfigure" => Some(TransitionCommand::Reconfigure),
            "start" => Some(TransitionCommand::Start),
            "stop" => Some(TransitionCommand::Stop),
            _ => None,
        }
    }

    pub fn as_transition(self) -> Transition {
        match self {
            TransitionCommand::Initialize => Transition::Initialize,
            TransitionCommand::Launch => Transition::Launch,
            TransitionCommand::Land => Transition::Land,
            TransitionCommand::Reconfigure => Transition::Reconfigure,
            TransitionCommand::Start => Transition::Start,
            TransitionCommand::Stop => Transition::Stop,
        }
    }
}

/// The lifecycle graph. Returns the state entered when `transition` fires
/// in `state`, or `None` when the edge does not exist.
///
/// `Failure` is accepted from every state except the terminal ERROR.
pub fn transition_target(state: State, transition: Transition) -> Option<State> {
    use State::*;
    use Transition::*;

    let target = match (state, transition) {
        (New, Initialize) => Initializing,
        (Init, Initialize) => Initializing,
        (Safe, Initialize) => Initializing,
        (Initializing, Initialized) => Init,
        (Init, Launch) => Launching,
        (Launching, Launched) => Orbit,
        (Orbit, Land) => Landing,
        (Landing, Landed) => Init,
        (Orbit, Reconfigure) => Reconfiguring,
        (Reconfiguring, Reconfigured) => Orbit,
        (Orbit, Start) => Starting,
        (Starting, Started) => Run,
        (Run, Stop) => Stopping,
        (Stopping, Stopped) => Orbit,
        (Orbit, Interrupt) => Interrupting,
        (Run, Interrupt) => Interrupting,
        (Interrupting, Interrupted) => Safe,
        (Error, Failure) => return None,
        (_, Failure) => Error,
        _ => return None,
    };
    Some(target)
}
