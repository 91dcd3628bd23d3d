//! ffidyn - describe native function signatures at run time, call native
//! code with host values, and hand native code entry points that run host
//! commands.

// Core modules
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod interop;
pub mod logging;
pub mod value;

// Re-export commonly used items
pub use config::{FfiConfig, MismatchPolicy};
pub use context::{FfiContext, Features};
pub use error::{ErrorKind, FfiError, Result, UsageContext};
pub use host::{Host, HostError, Session};
pub use interop::{BindingMode, LoadFlags, Visibility};
pub use value::{ByteBuffer, Value};
