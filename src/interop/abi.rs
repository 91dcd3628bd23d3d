//! Calling-convention (protocol) table
//!
//! Maps protocol names to the backend's ABI tags for the current target.
//! Only conventions the configured backend actually offers are listed.

use crate::error::{FfiError, Result};
use libffi::raw::{self, ffi_abi};

/// Resolved calling convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    name: &'static str,
    abi: ffi_abi,
}

impl Protocol {
    /// Platform default convention
    pub const fn default_abi() -> Self {
        Self { name: "default", abi: raw::ffi_abi_FFI_DEFAULT_ABI }
    }

    /// Resolve a protocol name; `None` and the empty string mean the default
    pub fn resolve(name: Option<&str>) -> Result<Self> {
        let name = match name {
            None | Some("") => return Ok(Self::default_abi()),
            Some(name) => name,
        };
        PROTOCOLS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(name, abi)| Self { name, abi })
            .ok_or_else(|| FfiError::UnknownProtocol {
                name: name.to_string(),
                known: names().join(", "),
            })
    }

    #[inline]
    pub const fn abi(self) -> ffi_abi {
        self.abi
    }

    #[inline]
    pub fn is_default(self) -> bool {
        self.abi == raw::ffi_abi_FFI_DEFAULT_ABI
    }

    /// Name used in signature keys; `None` for the default convention
    pub fn key_name(self) -> Option<&'static str> {
        (!self.is_default()).then_some(self.name)
    }

    pub fn name(self) -> &'static str {
        self.name
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::default_abi()
    }
}

/// Every accepted protocol name
pub fn names() -> Vec<&'static str> {
    PROTOCOLS.iter().map(|(n, _)| *n).collect()
}

#[cfg(all(target_arch = "x86_64", not(windows)))]
const PROTOCOLS: &[(&str, ffi_abi)] = &[
    ("default", raw::ffi_abi_FFI_DEFAULT_ABI),
    ("unix64", raw::ffi_abi_FFI_UNIX64),
    ("win64", raw::ffi_abi_FFI_WIN64),
    ("efi64", raw::ffi_abi_FFI_EFI64),
    ("gnuw64", raw::ffi_abi_FFI_GNUW64),
];

#[cfg(all(target_arch = "x86_64", windows))]
const PROTOCOLS: &[(&str, ffi_abi)] = &[
    ("default", raw::ffi_abi_FFI_DEFAULT_ABI),
    ("win64", raw::ffi_abi_FFI_WIN64),
    ("gnuw64", raw::ffi_abi_FFI_GNUW64),
];

#[cfg(target_arch = "x86")]
const PROTOCOLS: &[(&str, ffi_abi)] = &[
    ("default", raw::ffi_abi_FFI_DEFAULT_ABI),
    ("cdecl", raw::ffi_abi_FFI_SYSV),
    ("sysv", raw::ffi_abi_FFI_SYSV),
    ("stdcall", raw::ffi_abi_FFI_STDCALL),
    ("fastcall", raw::ffi_abi_FFI_FASTCALL),
    ("thiscall", raw::ffi_abi_FFI_THISCALL),
    ("mscdecl", raw::ffi_abi_FFI_MS_CDECL),
    ("pascal", raw::ffi_abi_FFI_PASCAL),
    ("register", raw::ffi_abi_FFI_REGISTER),
];

#[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
const PROTOCOLS: &[(&str, ffi_abi)] = &[
    ("default", raw::ffi_abi_FFI_DEFAULT_ABI),
    ("cdecl", raw::ffi_abi_FFI_SYSV),
    ("sysv", raw::ffi_abi_FFI_SYSV),
];

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm"
)))]
const PROTOCOLS: &[(&str, ffi_abi)] = &[("default", raw::ffi_abi_FFI_DEFAULT_ABI)];
