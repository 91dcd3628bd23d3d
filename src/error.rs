//! Error taxonomy for the marshaling engine
//!
//! Every failure is surfaced synchronously to the caller except dispatch
//! errors, which only ever travel on a session's background channel.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FfiError>;

/// Broad class of an error, used by callers that only care about recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Definition,
    Resolution,
    Marshal,
    Dispatch,
    Resource,
    Library,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Definition => "definition",
            Self::Resolution => "resolution",
            Self::Marshal => "marshal",
            Self::Dispatch => "dispatch",
            Self::Resource => "resource",
            Self::Library => "library",
        };
        f.write_str(name)
    }
}

/// Usage context a type is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageContext {
    Argument,
    Return,
    Element,
    CallbackArgument,
    CallbackReturn,
}

impl fmt::Display for UsageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Argument => "argument",
            Self::Return => "return",
            Self::Element => "element",
            Self::CallbackArgument => "callback argument",
            Self::CallbackReturn => "callback return",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum FfiError {
    // definition
    #[error("undefined type: {name}")]
    UnknownType { name: String },

    #[error("type is already defined: {name}")]
    TypeExists { name: String },

    #[error("type {name} is not permitted in {context} context")]
    ContextViolation { name: String, context: UsageContext },

    #[error("aggregate {name} needs at least one element")]
    EmptyAggregate { name: String },

    #[error(
        "layout of {name} disagrees with the backend: size {size} vs {backend_size}, alignment {align} vs {backend_align}"
    )]
    LayoutMismatch {
        name: String,
        size: usize,
        align: usize,
        backend_size: usize,
        backend_align: usize,
    },

    #[error("cannot format type {name}")]
    Unformattable { name: String },

    #[error("backend rejected the layout of {name}")]
    BackendRejected { name: String },

    #[error("cannot remove built-in type {name}")]
    BuiltinType { name: String },

    // resolution
    #[error("bad protocol \"{name}\": must be one of {known}")]
    UnknownProtocol { name: String, known: String },

    #[error("backend rejected signature {signature}")]
    PrepFailed { signature: String },

    // marshal
    #[error("wrong # args: expected {expected}, got {got}")]
    ArgCount { expected: usize, got: usize },

    #[error("parameter {index} is the wrong size, {got} bytes instead of {expected}")]
    SizeMismatch { index: usize, expected: usize, got: usize },

    #[error("parameter {index} must be a binary string")]
    NotBinary { index: usize },

    #[error("expected {expected} but got \"{value}\"")]
    Conversion { expected: &'static str, value: String },

    #[error("no callback named \"{name}\" is defined")]
    UnknownCallback { name: String },

    #[error("no callout named \"{name}\" is defined")]
    UnknownCallout { name: String },

    #[error("can't read \"{name}\": no such variable")]
    UnknownVariable { name: String },

    #[error("byte array for callback struct return has {got} bytes instead of {expected}")]
    ReturnSize { expected: usize, got: usize },

    // dispatch
    #[error("callback {callback} failed: {message}")]
    Dispatch { callback: String, message: String },

    #[error("callback {callback} fired after its session ended")]
    SessionGone { callback: String },

    // resource
    #[error("couldn't allocate closure for: {name}")]
    ClosureAlloc { name: String },

    // library
    #[error("couldn't load library \"{path}\": {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("library \"{path}\" already loaded")]
    AlreadyLoaded { path: String },

    #[error("couldn't find symbol \"{symbol}\" in \"{library}\"")]
    SymbolNotFound { library: String, symbol: String },

    #[error("load flags not supported on this platform: {flags}")]
    UnsupportedFlags { flags: String },

    // configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl FfiError {
    /// Taxonomy class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownType { .. }
            | Self::TypeExists { .. }
            | Self::ContextViolation { .. }
            | Self::EmptyAggregate { .. }
            | Self::LayoutMismatch { .. }
            | Self::Unformattable { .. }
            | Self::BackendRejected { .. }
            | Self::BuiltinType { .. }
            | Self::Config(_) => ErrorKind::Definition,
            Self::UnknownProtocol { .. } | Self::PrepFailed { .. } => ErrorKind::Resolution,
            Self::ArgCount { .. }
            | Self::SizeMismatch { .. }
            | Self::NotBinary { .. }
            | Self::Conversion { .. }
            | Self::UnknownCallback { .. }
            | Self::UnknownCallout { .. }
            | Self::UnknownVariable { .. }
            | Self::ReturnSize { .. } => ErrorKind::Marshal,
            Self::Dispatch { .. } | Self::SessionGone { .. } => ErrorKind::Dispatch,
            Self::ClosureAlloc { .. } => ErrorKind::Resource,
            Self::LoadFailed { .. }
            | Self::AlreadyLoaded { .. }
            | Self::SymbolNotFound { .. }
            | Self::UnsupportedFlags { .. } => ErrorKind::Library,
        }
    }

    pub(crate) fn conversion(expected: &'static str, value: impl fmt::Display) -> Self {
        Self::Conversion { expected, value: value.to_string() }
    }
}
