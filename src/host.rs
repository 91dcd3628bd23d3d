//! Host session seam
//!
//! The engine talks to its host through [`Host`]: command dispatch for
//! inbound calls, variable access for `pointer-var` arguments, and a
//! background channel for errors that cannot cross the native boundary.
//! [`Session`] is a self-contained, thread-safe implementation.

use crate::error::FfiError;
use crate::value::Value;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error raised by host-level code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<FfiError> for HostError {
    fn from(err: FfiError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for HostError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HostError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub trait Host: Send + Sync {
    /// Run the command named by `words[0]` with the remaining words
    fn invoke(&self, words: &[Value]) -> Result<Value, HostError>;

    /// Current value of a variable
    fn var(&self, name: &str) -> Option<Value>;

    /// The variable's value, first replaced by a private duplicate when
    /// its byte buffer is aliased elsewhere
    fn unshare_var(&self, name: &str) -> Option<Value>;

    /// Deliver an error that happened outside any caller's reach
    fn report_background_error(&self, error: FfiError);
}

/// Registered host command
pub type Command = Arc<dyn Fn(&[Value]) -> Result<Value, HostError> + Send + Sync>;

/// Concrete host with a command table, variables and a background-error
/// channel
pub struct Session {
    commands: DashMap<String, Command>,
    vars: DashMap<String, Value>,
    errors_tx: flume::Sender<FfiError>,
    errors_rx: flume::Receiver<FfiError>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        let (errors_tx, errors_rx) = flume::unbounded();
        Arc::new(Self { commands: DashMap::new(), vars: DashMap::new(), errors_tx, errors_rx })
    }

    /// Register or replace a command
    pub fn register<F>(&self, name: impl Into<String>, command: F)
    where
        F: Fn(&[Value]) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        self.commands.insert(name.into(), Arc::new(command));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.commands.remove(name).is_some()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn set_var(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn unset_var(&self, name: &str) -> Option<Value> {
        self.vars.remove(name).map(|(_, v)| v)
    }

    /// Drain every background error reported so far
    pub fn background_errors(&self) -> Vec<FfiError> {
        self.errors_rx.try_iter().collect()
    }

    /// Receiver for hosts that want to watch errors as they arrive
    pub fn error_receiver(&self) -> flume::Receiver<FfiError> {
        self.errors_rx.clone()
    }
}

impl Host for Session {
    fn invoke(&self, words: &[Value]) -> Result<Value, HostError> {
        let name = words
            .first()
            .map(Value::as_str)
            .ok_or_else(|| HostError::new("empty command"))?;
        // Clone out so the command can reenter the table
        let command = self
            .commands
            .get(&*name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HostError::new(format!("invalid command name \"{}\"", name)))?;
        command(&words[1..])
    }

    fn var(&self, name: &str) -> Option<Value> {
        self.vars.get(name).map(|entry| entry.value().clone())
    }

    fn unshare_var(&self, name: &str) -> Option<Value> {
        let mut entry = self.vars.get_mut(name)?;
        let private = match entry.value() {
            Value::Bytes(buf) if Arc::strong_count(buf) > 1 => Some(Arc::new(buf.duplicate())),
            _ => None,
        };
        if let Some(private) = private {
            *entry.value_mut() = Value::Bytes(private);
        }
        Some(entry.value().clone())
    }

    fn report_background_error(&self, error: FfiError) {
        // The receiver lives in self, so the send cannot fail
        let _ = self.errors_tx.send(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_registered_command() {
        let session = Session::new();
        session.register("add", |args| {
            let sum = args.iter().map(Value::as_int).sum::<Result<i64, FfiError>>()?;
            Ok(Value::Int(sum))
        });

        let result = session.invoke(&["add".into(), 5.into(), 9.into()]).unwrap();
        assert_eq!(result, Value::Int(14));

        let err = session.invoke(&["nope".into()]).unwrap_err();
        assert_eq!(err.message, "invalid command name \"nope\"");
    }

    #[test]
    fn test_unshare_duplicates_aliased_buffer() {
        let session = Session::new();
        let shared = Value::bytes(vec![1u8, 2, 3]);
        session.set_var("buf", shared.clone());

        let unshared = session.unshare_var("buf").unwrap();
        match (&shared, &unshared) {
            (Value::Bytes(a), Value::Bytes(b)) => assert!(!Arc::ptr_eq(a, b)),
            _ => panic!("expected byte buffers"),
        }

        // Only the variable and the caller's copy hold it now, so a second
        // unshare keeps the same buffer alive
        drop(unshared);
        let again = session.unshare_var("buf").unwrap();
        let current = session.var("buf").unwrap();
        match (&again, &current) {
            (Value::Bytes(a), Value::Bytes(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected byte buffers"),
        }
        assert!(session.unshare_var("missing").is_none());
    }

    #[test]
    fn test_background_errors_drain_once() {
        let session = Session::new();
        session.report_background_error(FfiError::Config("boom".into()));
        assert_eq!(session.background_errors().len(), 1);
        assert!(session.background_errors().is_empty());
    }
}
