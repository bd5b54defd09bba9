//! User-command registry: named handlers with allowed-state and arity
//! checks enforced at the call site.

use std::collections::HashMap;

use thiserror::Error;

use constellation_protocol::{List, State, TransitionCommand, Value};

/// Verbs reserved by the built-in command set.
const RESERVED: &[&str] = &[
    "get_name",
    "get_version",
    "get_commands",
    "get_state",
    "get_status",
    "get_config",
    "get_run_id",
    "shutdown",
];

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not registered")]
    Unknown,

    #[error("command '{command}' cannot be called in state {state}")]
    NotAllowed { command: String, state: State },

    #[error("command '{command}' expects {expected} arguments, got {got}")]
    WrongArity {
        command: String,
        expected: usize,
        got: usize,
    },

    #[error("{0}")]
    Failed(String),
}

pub type UserCommandHandler = Box<dyn Fn(&List) -> Result<Option<Value>, String> + Send + Sync>;

struct UserCommand {
    description: String,
    /// Empty means callable from any state.
    allowed_states: Vec<State>,
    arity: usize,
    handler: UserCommandHandler,
}

/// Registry of satellite-specific commands, dispatched after transition and
/// standard verbs.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, UserCommand>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry::default()
    }

    /// Register a command under a lowercased verb. Names colliding with
    /// transition or standard commands are refused.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        allowed_states: Vec<State>,
        arity: usize,
        handler: UserCommandHandler,
    ) -> bool {
        let name = name.into().to_lowercase();
        if TransitionCommand::from_verb(&name).is_some() || RESERVED.contains(&name.as_str()) {
            return false;
        }
        if self.commands.contains_key(&name) {
            return false;
        }
        self.commands.insert(
            name,
            UserCommand {
                description: description.into(),
                allowed_states,
                arity,
                handler,
            },
        );
        true
    }

    /// Command names with their descriptions, for `get_commands`.
    pub fn describe(&self) -> Vec<(String, String)> {
        let mut commands: Vec<(String, String)> = self
            .commands
            .iter()
            .map(|(name, command)| (name.clone(), command.description.clone()))
            .collect();
        commands.sort();
        commands
    }

    /// Invoke a command, enforcing allowed states and argument arity.
    pub fn call(
        &self,
        state: State,
        name: &str,
        args: &List,
    ) -> Result<Option<Value>, CommandError> {
        let command = self.commands.get(name).ok_or(CommandError::Unknown)?;

        if !command.allowed_states.is_empty() && !command.allowed_states.contains(&state) {
            return Err(CommandError::NotAllowed {
                command: name.to_owned(),
                state,
            });
        }
        if args.len() != command.arity {
            return Err(CommandError::WrongArity {
                command: name.to_owned(),
                expected: command.arity,
                got: args.len(),
            });
        }
        (command.handler)(args).map_err(CommandError::Failed)
    }
}
