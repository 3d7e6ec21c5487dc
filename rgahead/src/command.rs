//! Command descriptors, sequences, and per-invocation exchange records.
//!
//! A [`Command`] is immutable: opcode, parameter source, response kind and
//! validator. Every time the head issues one it creates a fresh
//! [`Exchange`] that carries the mutable completion/success/response fields,
//! so concurrent use of a shared catalog never races on command state.

use {
    crate::{
        catalog::CalibrationCache,
        device::{DeviceInfo, DeviceState},
        error::{Error, Result},
    },
    parking_lot::{Condvar, Mutex},
    std::{
        fmt,
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// Expected shape of a command's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Nothing comes back; the command completes when written.
    None,
    /// A decimal status byte (`0` means no error).
    StatusByte,
    /// Free text.
    Text,
    /// A decimal number.
    Number,
}

/// Where a command's parameter comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    /// No parameter.
    None,
    /// A fixed value, stringified at construction.
    Fixed(String),
    /// A value a calibration step may overwrite, with its initial value.
    Calibrated {
        /// Key into the [`CalibrationCache`].
        key: String,
        /// Used until calibration stores a value.
        default: String,
    },
}

/// State a validator may update.
pub struct ValidationContext<'a> {
    /// Values reported by the head.
    pub info: &'a mut DeviceInfo,
    /// Calibrated parameters shared through the catalog.
    pub calibration: &'a CalibrationCache,
}

/// Decides whether a response is the expected outcome.
///
/// Receives `None` for commands that expect no response.
pub type Validator =
    Arc<dyn Fn(&Command, &mut ValidationContext<'_>, Option<&str>) -> Result<bool> + Send + Sync>;

/// Immutable description of one protocol exchange.
#[derive(Clone)]
pub struct Command {
    name: String,
    parameter: Parameter,
    kind: ResponseKind,
    validator: Option<Validator>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("parameter", &self.parameter)
            .field("kind", &self.kind)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Command {
    /// Create a command. The opcode must not be empty.
    pub fn new(name: impl Into<String>, kind: ResponseKind) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidCommand("empty opcode".into()));
        }
        Ok(Self {
            name,
            parameter: Parameter::None,
            kind,
            validator: None,
        })
    }

    /// Attach a fixed parameter.
    #[must_use]
    pub fn with_parameter(mut self, value: impl fmt::Display) -> Self {
        self.parameter = Parameter::Fixed(value.to_string());
        self
    }

    /// Attach a parameter read from the calibration cache.
    #[must_use]
    pub fn with_calibrated_parameter(
        mut self,
        key: impl Into<String>,
        default: impl fmt::Display,
    ) -> Self {
        self.parameter = Parameter::Calibrated {
            key: key.into(),
            default: default.to_string(),
        };
        self
    }

    /// Attach a validator.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Command, &mut ValidationContext<'_>, Option<&str>) -> Result<bool>
            + Send
            + Sync
            + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Opcode.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter source.
    pub fn parameter(&self) -> &Parameter {
        &self.parameter
    }

    /// Response kind.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// Whether the head answers this command.
    pub fn expects_response(&self) -> bool {
        self.kind != ResponseKind::None
    }

    /// Opcode plus resolved parameter, without terminators.
    pub fn wire_text(&self, calibration: &CalibrationCache) -> String {
        match &self.parameter {
            Parameter::None => self.name.clone(),
            Parameter::Fixed(value) => format!("{}{value}", self.name),
            Parameter::Calibrated { key, default } => {
                let value = calibration.get(key).unwrap_or_else(|| default.clone());
                format!("{}{value}", self.name)
            },
        }
    }

    /// Run the validator. Without one, any response (or none) succeeds.
    pub fn validate(&self, ctx: &mut ValidationContext<'_>, response: Option<&str>) -> Result<bool> {
        match &self.validator {
            Some(validator) => validator(self, ctx, response),
            None => Ok(true),
        }
    }
}

/// Ordered commands with the states to land in on success and failure.
#[derive(Debug, Clone)]
pub struct CommandSequence {
    name: String,
    commands: Vec<Command>,
    error_reset_state: DeviceState,
    success_next_state: DeviceState,
}

impl CommandSequence {
    /// Create a sequence.
    pub fn new(
        name: impl Into<String>,
        commands: Vec<Command>,
        error_reset_state: DeviceState,
        success_next_state: DeviceState,
    ) -> Self {
        Self {
            name: name.into(),
            commands,
            error_reset_state,
            success_next_state,
        }
    }

    /// Sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commands in issue order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// State after any failure.
    pub fn error_reset_state(&self) -> DeviceState {
        self.error_reset_state
    }

    /// State after every command succeeded.
    pub fn success_next_state(&self) -> DeviceState {
        self.success_next_state
    }
}

#[derive(Debug, Default)]
struct ExchangeState {
    completed: bool,
    success: bool,
    response: Option<String>,
    failure: Option<String>,
}

/// One invocation of a [`Command`].
#[derive(Debug)]
pub struct Exchange {
    command: Command,
    wire: String,
    state: Mutex<ExchangeState>,
    done: Condvar,
}

impl Exchange {
    /// Start an exchange for `command` sent as `wire`.
    pub fn new(command: Command, wire: String) -> Self {
        Self {
            command,
            wire,
            state: Mutex::new(ExchangeState::default()),
            done: Condvar::new(),
        }
    }

    /// The command being exchanged.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Text sent on the wire.
    pub fn wire(&self) -> &str {
        &self.wire
    }

    /// Record the outcome and wake the waiter. Later calls are ignored.
    pub fn complete(&self, success: bool, response: Option<String>) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.completed = true;
        state.success = success;
        state.response = response;
        self.done.notify_all();
    }

    /// Record a validator error as a failed completion.
    pub fn fail(&self, response: Option<String>, reason: String) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.completed = true;
        state.success = false;
        state.response = response;
        state.failure = Some(reason);
        self.done.notify_all();
    }

    /// Whether an outcome has been recorded.
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Raw response, if one arrived.
    pub fn response(&self) -> Option<String> {
        self.state.lock().response.clone()
    }

    /// Block until completion or `timeout`; returns the success flag.
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.completed {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.completed.then_some(state.success)
    }

    /// Turn the recorded outcome into a result.
    pub fn outcome(&self, timeout: Duration) -> Result<()> {
        match self.wait(timeout) {
            Some(true) => Ok(()),
            Some(false) => {
                let state = self.state.lock();
                let reason = state.failure.clone().unwrap_or_else(|| match &state.response {
                    Some(text) => format!("unexpected response {text:?}"),
                    None => "rejected".to_string(),
                });
                Err(Error::ValidationFailure {
                    command: self.wire.clone(),
                    reason,
                })
            },
            None => Err(Error::CommandTimeout {
                command: self.wire.clone(),
                timeout,
            }),
        }
    }
}

/// Parse a decimal status byte.
pub fn parse_status(text: &str) -> Result<u8> {
    text.trim()
        .parse::<u8>()
        .map_err(|e| Error::Protocol(format!("invalid status byte {text:?}: {e}")))
}

/// Parse a decimal integer.
pub fn parse_integer(text: &str) -> Result<i64> {
    text.trim()
        .parse::<i64>()
        .map_err(|e| Error::Protocol(format!("invalid integer {text:?}: {e}")))
}

/// Parse a decimal number.
pub fn parse_number(text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|e| Error::Protocol(format!("invalid number {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            Command::new("  ", ResponseKind::Text),
            Err(Error::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_wire_text_fixed_parameter() {
        let cache = CalibrationCache::default();
        let cmd = Command::new("FL", ResponseKind::StatusByte)
            .unwrap()
            .with_parameter(1.0);
        assert_eq!(cmd.wire_text(&cache), "FL1");

        let cmd = Command::new("MI", ResponseKind::None)
            .unwrap()
            .with_parameter(29);
        assert_eq!(cmd.wire_text(&cache), "MI29");
    }

    #[test]
    fn test_wire_text_calibrated_parameter() {
        let cache = CalibrationCache::default();
        let cmd = Command::new("HV", ResponseKind::StatusByte)
            .unwrap()
            .with_calibrated_parameter("HV", 1400);
        assert_eq!(cmd.wire_text(&cache), "HV1400");
        cache.set("HV", "1285");
        assert_eq!(cmd.wire_text(&cache), "HV1285");
    }

    #[test]
    fn test_validate_without_validator_succeeds() {
        let cmd = Command::new("MR", ResponseKind::None).unwrap();
        let mut info = DeviceInfo::default();
        let cache = CalibrationCache::default();
        let mut ctx = ValidationContext {
            info: &mut info,
            calibration: &cache,
        };
        assert!(cmd.validate(&mut ctx, None).unwrap());
    }

    #[test]
    fn test_exchange_wait_times_out() {
        let cmd = Command::new("ID?", ResponseKind::Text).unwrap();
        let exchange = Exchange::new(cmd, "ID?".into());
        assert_eq!(exchange.wait(Duration::from_millis(10)), None);
        assert!(matches!(
            exchange.outcome(Duration::from_millis(1)),
            Err(Error::CommandTimeout { .. })
        ));
    }

    #[test]
    fn test_exchange_completed_from_other_thread() {
        let cmd = Command::new("ID?", ResponseKind::Text).unwrap();
        let exchange = Arc::new(Exchange::new(cmd, "ID?".into()));
        let remote = Arc::clone(&exchange);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            remote.complete(true, Some("SRSRGA200".into()));
        });
        assert_eq!(exchange.wait(Duration::from_secs(2)), Some(true));
        assert_eq!(exchange.response().as_deref(), Some("SRSRGA200"));
        handle.join().unwrap();
    }

    #[test]
    fn test_exchange_first_completion_wins() {
        let cmd = Command::new("IN", ResponseKind::StatusByte).unwrap();
        let exchange = Exchange::new(cmd, "IN0".into());
        exchange.complete(false, Some("4".into()));
        exchange.complete(true, Some("0".into()));
        assert_eq!(exchange.wait(Duration::ZERO), Some(false));
        let err = exchange.outcome(Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("\"4\""));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_status(" 0 ").unwrap(), 0);
        assert!(parse_status("300").is_err());
        assert_eq!(parse_integer("1711").unwrap(), 1711);
        assert!((parse_number("1285.5").unwrap() - 1285.5).abs() < f64::EPSILON);
        assert!(parse_number("abc").is_err());
    }
}
