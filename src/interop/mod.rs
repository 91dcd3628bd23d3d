//! Interoperability - describe native signatures at run time and call across
//!
//! Design: descriptors are built once, shared by reference count, and never
//! mutated after publication.
//!
//! Architecture:
//! - `types.rs` - type codes, usage contexts, type descriptors, built-ins
//! - `registry.rs` - named type registry (primitives, aliases, aggregates)
//! - `abi.rs` - calling-convention table
//! - `signature.rs` - signature cache of prepared call descriptors
//! - `marshal.rs` - host ↔ native value conversion
//! - `extended.rs` - `long double` bit conversion
//! - `call.rs` - outbound calls
//! - `callback.rs` - inbound calls through backend closures
//! - `library.rs` - dynamic library loading

mod abi;
mod call;
mod callback;
mod extended;
mod library;
mod marshal;
mod registry;
mod signature;
mod types;

pub use abi::{names as protocol_names, Protocol};
pub use call::{ArgResolver, Callout, Detached};
pub use callback::Callback;
pub use library::{BindingMode, Library, LibraryTable, LoadFlags, Visibility};
pub use registry::TypeRegistry;
pub use signature::{canonical_key, CallDescriptor, CifHandle, SignatureCache};
pub use types::{align_up, fold_layout, Contexts, Extraction, TypeCode, TypeDesc};
