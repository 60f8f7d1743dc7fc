//! Typed user-command registry.
//!
//! User commands are registered with a name, a description, the set of FSM
//! states in which they may be called (empty meaning any state) and a typed
//! handler. At dispatch time the payload is decoded as a value list, the
//! arity is checked and each argument converted to the handler's parameter
//! type; conversion failures and handler errors map onto `INCOMPLETE`
//! replies, unknown names fall through to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use constellation_core::{FromValue, IntoValue, List, State, Value};
use thiserror::Error;

/// Error reported by a user-command handler or the argument marshalling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct UserCommandError(pub String);

impl UserCommandError {
    /// Build an error from any displayable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Dispatch failure of a user command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No command is registered under this name.
    #[error("command {0:?} is not known")]
    Unknown(String),

    /// The command exists but may not be called in the current state.
    #[error("command {name:?} cannot be called in state {state}")]
    Invalid {
        name: String,
        state: State,
    },

    /// Argument marshalling or the handler itself failed.
    #[error(transparent)]
    User(#[from] UserCommandError),
}

/// Registration failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Command names must be non-empty.
    #[error("cannot register a command with an empty name")]
    EmptyName,

    /// Every command name may be registered once.
    #[error("command {0:?} is already registered")]
    Duplicate(String),
}

type HandlerFn = Arc<dyn Fn(&List) -> Result<Value, UserCommandError> + Send + Sync>;

struct Command {
    handler: HandlerFn,
    nargs: usize,
    description: String,
    valid_states: Vec<State>,
}

/// Registry of user commands, consulted after built-in dispatch.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
}

/// Conversion of closures into type-erased command handlers.
///
/// Implemented for functions of up to four [`FromValue`] arguments returning
/// `Result<R, UserCommandError>` for any [`IntoValue`] type `R`.
pub trait IntoCommandHandler<Args> {
    /// Number of arguments the handler expects.
    const NARGS: usize;

    /// Erase the argument types into a list-consuming handler.
    fn into_handler(self) -> HandlerFn;
}

fn argument<T: FromValue>(args: &List, index: usize) -> Result<T, UserCommandError> {
    let value = args
        .get(index)
        .ok_or_else(|| UserCommandError::new(format!("missing argument {index}")))?;
    value
        .get::<T>()
        .map_err(|err| UserCommandError::new(format!("argument {index}: {err}")))
}

macro_rules! impl_into_command_handler {
    ($count:expr $(, $arg:ident : $index:expr)*) => {
        impl<F, R $(, $arg)*> IntoCommandHandler<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> Result<R, UserCommandError> + Send + Sync + 'static,
            R: IntoValue,
            $($arg: FromValue + 'static,)*
        {
            const NARGS: usize = $count;

            fn into_handler(self) -> HandlerFn {
                Arc::new(move |_args: &List| {
                    let result = self($(argument::<$arg>(_args, $index)?),*)?;
                    Ok(result.into_value())
                })
            }
        }
    };
}

impl_into_command_handler!(0);
impl_into_command_handler!(1, A0: 0);
impl_into_command_handler!(2, A0: 0, A1: 1);
impl_into_command_handler!(3, A0: 0, A1: 1, A2: 2);
impl_into_command_handler!(4, A0: 0, A1: 1, A2: 2, A3: 3);

impl CommandRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command.
    ///
    /// `states` lists the FSM states in which the command is legal; an empty
    /// slice allows it everywhere. The name is matched case-insensitively at
    /// dispatch and stored lowercase.
    ///
    /// # Errors
    /// Returns [`RegistrationError`] for empty or duplicate names.
    pub fn add<Args, H>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        states: &[State],
        handler: H,
    ) -> Result<(), RegistrationError>
    where
        H: IntoCommandHandler<Args>,
    {
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        let name = name.to_lowercase();
        if self.commands.contains_key(&name) {
            return Err(RegistrationError::Duplicate(name));
        }
        self.commands.insert(
            name,
            Command {
                handler: H::into_handler(handler),
                nargs: H::NARGS,
                description: description.into(),
                valid_states: states.to_vec(),
            },
        );
        Ok(())
    }

    /// Whether a command is registered under this (lowercased) name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Dispatch a command against the current FSM state.
    ///
    /// # Errors
    /// - [`CommandError::Unknown`] if no command has this name
    /// - [`CommandError::Invalid`] if it may not run in `state`
    /// - [`CommandError::User`] for arity/conversion/handler failures
    pub fn call(&self, state: State, name: &str, args: &List) -> Result<Value, CommandError> {
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::Unknown(name.to_owned()))?;

        if !command.valid_states.is_empty() && !command.valid_states.contains(&state) {
            return Err(CommandError::Invalid {
                name: name.to_owned(),
                state,
            });
        }

        if args.len() != command.nargs {
            return Err(UserCommandError::new(format!(
                "command {name:?} requires {} arguments, got {}",
                command.nargs,
                args.len()
            ))
            .into());
        }

        Ok((command.handler)(args)?)
    }

    /// Command names with a description including arity and allowed states.
    #[must_use]
    pub fn describe_commands(&self) -> Vec<(String, String)> {
        self.commands
            .iter()
            .map(|(name, command)| {
                let mut description = command.description.clone();
                description.push_str(&format!(" (takes {} arguments", command.nargs));
                if !command.valid_states.is_empty() {
                    let states: Vec<&str> =
                        command.valid_states.iter().map(|state| state.name()).collect();
                    description.push_str(&format!(", allowed in states: {}", states.join(", ")));
                }
                description.push(')');
                (name.clone(), description)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: Vec<Value>) -> List {
        List::from(values)
    }

    fn sample_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry
            .add("echo", "echo a string", &[], |text: String| {
                Ok::<_, UserCommandError>(text)
            })
            .unwrap();
        registry
            .add(
                "add",
                "add two integers",
                &[State::Init, State::Orbit],
                |a: i64, b: i64| Ok::<_, UserCommandError>(a + b),
            )
            .unwrap();
        registry
            .add("noop", "do nothing", &[], || Ok::<_, UserCommandError>(()))
            .unwrap();
        registry
    }

    #[test]
    fn call_converts_arguments_and_return_value() {
        let registry = sample_registry();
        let result = registry
            .call(State::Init, "add", &args(vec![Value::Int(2), Value::Int(3)]))
            .unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn void_return_becomes_nil() {
        let registry = sample_registry();
        let result = registry.call(State::New, "noop", &args(vec![])).unwrap();
        assert_eq!(result, Value::Nil);
    }

    #[test]
    fn unknown_command_falls_through() {
        let registry = sample_registry();
        assert!(matches!(
            registry.call(State::New, "missing", &args(vec![])),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn state_validity_is_enforced() {
        let registry = sample_registry();
        let err = registry
            .call(State::Run, "add", &args(vec![Value::Int(1), Value::Int(2)]))
            .unwrap_err();
        assert!(matches!(err, CommandError::Invalid { .. }));
        assert!(err.to_string().contains("RUN"));
    }

    #[test]
    fn arity_mismatch_is_a_user_error() {
        let registry = sample_registry();
        let err = registry
            .call(State::Init, "add", &args(vec![Value::Int(1)]))
            .unwrap_err();
        assert!(matches!(err, CommandError::User(_)));
        assert!(err.to_string().contains("requires 2 arguments"));
    }

    #[test]
    fn conversion_failure_is_a_user_error() {
        let registry = sample_registry();
        let err = registry
            .call(
                State::Init,
                "add",
                &args(vec![Value::String("x".into()), Value::Int(2)]),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::User(_)));
        assert!(err.to_string().contains("argument 0"));
    }

    #[test]
    fn handler_errors_pass_through() {
        let mut registry = CommandRegistry::new();
        registry
            .add("fail", "always fails", &[], || {
                Err::<(), _>(UserCommandError::new("broken"))
            })
            .unwrap();
        let err = registry.call(State::New, "fail", &args(vec![])).unwrap_err();
        assert_eq!(err.to_string(), "broken");
    }

    #[test]
    fn names_are_stored_lowercase_and_unique() {
        let mut registry = CommandRegistry::new();
        registry
            .add("Echo", "one", &[], || Ok::<_, UserCommandError>(()))
            .unwrap();
        assert!(registry.contains("echo"));
        assert_eq!(
            registry.add("ECHO", "two", &[], || Ok::<_, UserCommandError>(())),
            Err(RegistrationError::Duplicate("echo".into()))
        );
        assert_eq!(
            registry.add("", "empty", &[], || Ok::<_, UserCommandError>(())),
            Err(RegistrationError::EmptyName)
        );
    }

    #[test]
    fn descriptions_include_arity_and_states() {
        let registry = sample_registry();
        let descriptions: BTreeMap<_, _> = registry.describe_commands().into_iter().collect();
        assert_eq!(
            descriptions["add"],
            "add two integers (takes 2 arguments, allowed in states: INIT, ORBIT)"
        );
        assert_eq!(descriptions["echo"], "echo a string (takes 1 arguments)");
    }
}
