//! Shared-library loading
//!
//! Libraries are opened once per path and never closed: call descriptors and
//! bindings may hold addresses inside them for the life of the session.

use crate::error::{FfiError, Result};
use crate::logging;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// When symbols are bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingMode {
    Now,
    Lazy,
}

/// Whether the library's symbols join the global namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Local,
    Global,
}

/// Loader flags; unset fields take the platform default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadFlags {
    pub binding: Option<BindingMode>,
    pub visibility: Option<Visibility>,
}

impl LoadFlags {
    pub fn is_default(&self) -> bool {
        self.binding.is_none() && self.visibility.is_none()
    }
}

impl fmt::Display for LoadFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = match self.binding {
            Some(BindingMode::Lazy) => "lazy",
            Some(BindingMode::Now) | None => "now",
        };
        let visibility = match self.visibility {
            Some(Visibility::Local) => "local",
            Some(Visibility::Global) | None => "global",
        };
        write!(f, "{} {}", binding, visibility)
    }
}

/// An open library handle
pub struct Library {
    path: String,
    flags: LoadFlags,
    handle: ManuallyDrop<libloading::Library>,
}

impl Library {
    /// Open `path`; the empty path names the running program
    pub fn open(path: &str, flags: LoadFlags) -> Result<Self> {
        let handle = open_native(path, flags).map_err(|reason| FfiError::LoadFailed {
            path: path.to_string(),
            reason,
        })?;
        logging::log_library_loaded(path, &flags.to_string());
        Ok(Self { path: path.to_string(), flags, handle: ManuallyDrop::new(handle) })
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn flags(&self) -> LoadFlags {
        self.flags
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> Result<usize> {
        // SAFETY: the symbol is only read as an address, never called here
        let sym: libloading::Symbol<*mut c_void> = unsafe { self.handle.get(name.as_bytes()) }
            .map_err(|_| FfiError::SymbolNotFound {
                library: self.path.clone(),
                symbol: name.to_string(),
            })?;
        Ok(*sym as usize)
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library").field("path", &self.path).field("flags", &self.flags).finish()
    }
}

#[cfg(unix)]
fn open_native(path: &str, flags: LoadFlags) -> std::result::Result<libloading::Library, String> {
    use libloading::os::unix;

    let binding = match flags.binding {
        Some(BindingMode::Lazy) => unix::RTLD_LAZY,
        _ => unix::RTLD_NOW,
    };
    let visibility = match flags.visibility {
        Some(Visibility::Local) => unix::RTLD_LOCAL,
        _ => unix::RTLD_GLOBAL,
    };
    let target = if path.is_empty() { None } else { Some(path) };
    // SAFETY: library initializers run here; loading is the caller's request
    unsafe { unix::Library::open(target, binding | visibility) }
        .map(libloading::Library::from)
        .map_err(|err| err.to_string())
}

#[cfg(windows)]
fn open_native(path: &str, flags: LoadFlags) -> std::result::Result<libloading::Library, String> {
    if !flags.is_default() {
        return Err(FfiError::UnsupportedFlags { flags: flags.to_string() }.to_string());
    }
    // SAFETY: as above
    let handle = if path.is_empty() {
        libloading::os::windows::Library::this()
    } else {
        unsafe { libloading::os::windows::Library::new(path) }
    };
    handle.map(libloading::Library::from).map_err(|err| err.to_string())
}

/// Libraries opened in one session, keyed by path
#[derive(Default)]
pub struct LibraryTable {
    libraries: DashMap<String, Arc<Library>>,
}

impl LibraryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open and record a library; a path may only be loaded once
    pub fn load(&self, path: &str, flags: LoadFlags) -> Result<Arc<Library>> {
        #[cfg(windows)]
        if !flags.is_default() {
            return Err(FfiError::UnsupportedFlags { flags: flags.to_string() });
        }

        if self.libraries.contains_key(path) {
            return Err(FfiError::AlreadyLoaded { path: path.to_string() });
        }
        let library = Arc::new(Library::open(path, flags)?);
        match self.libraries.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(FfiError::AlreadyLoaded { path: path.to_string() })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&library));
                Ok(library)
            }
        }
    }

    /// The library at `path`, loading it with default flags if needed
    pub fn get_or_load(&self, path: &str) -> Result<Arc<Library>> {
        if let Some(library) = self.libraries.get(path) {
            return Ok(Arc::clone(library.value()));
        }
        let library = Arc::new(Library::open(path, LoadFlags::default())?);
        Ok(Arc::clone(self.libraries.entry(path.to_string()).or_insert(library).value()))
    }

    /// Resolve `symbol` in `path`, loading the library first if needed
    pub fn symbol(&self, path: &str, symbol: &str) -> Result<usize> {
        self.get_or_load(path)?.symbol(symbol)
    }

    pub fn get(&self, path: &str) -> Option<Arc<Library>> {
        self.libraries.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Sorted paths of every loaded library
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.libraries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}
