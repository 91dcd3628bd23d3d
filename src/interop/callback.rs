//! Inbound calls - native caller in, host command out
//!
//! A [`Callback`] owns a backend closure whose entry address can be handed to
//! native code. Each native invocation lands in [`trampoline`], which builds
//! host values from the native arguments, runs the host command and writes
//! the result back into the caller's return slot.
//!
//! Errors never cross back into the native caller. A failing command, an
//! unconvertible result or a panic leaves a zeroed return value and sends the
//! error to the host's background channel exactly once.

use super::marshal;
use super::signature::CifHandle;
use super::types::{TypeCode, TypeDesc};
use crate::error::{FfiError, Result};
use crate::host::Host;
use crate::logging;
use crate::value::Value;
use libffi::low::{self, CodePtr};
use libffi::raw;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Data reachable from the closure's user pointer
struct Dispatch {
    name: String,
    cif: CifHandle,
    prefix: Vec<Value>,
    host: Weak<dyn Host>,
    // Every pointer-obj result handed out, kept until the binding is dropped
    retained: Mutex<Vec<Box<Value>>>,
}

/// Inbound binding with its native entry point
pub struct Callback {
    closure: *mut raw::ffi_closure,
    code: CodePtr,
    dispatch: Box<Dispatch>,
}

// SAFETY: the closure is written once in `new` and freed only in drop;
// Dispatch state shared between threads is behind locks or immutable
unsafe impl Send for Callback {}
unsafe impl Sync for Callback {}

impl Callback {
    /// Allocate a closure dispatching to `prefix` + native arguments
    ///
    /// With no prefix the callback's own name is the command invoked.
    pub fn new(
        name: impl Into<String>,
        cif: CifHandle,
        prefix: Option<Vec<Value>>,
        host: &Arc<dyn Host>,
    ) -> Result<Self> {
        let name = name.into();
        let prefix = prefix.unwrap_or_else(|| vec![Value::string(&name)]);
        let dispatch = Box::new(Dispatch {
            name,
            cif,
            prefix,
            host: Arc::downgrade(host),
            retained: Mutex::new(Vec::new()),
        });

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(FfiError::ClosureAlloc { name: dispatch.name.clone() });
        }

        // SAFETY: closure was just allocated; the cif and the boxed dispatch
        // both live inside `Callback`, which frees the closure before either
        let prepared = unsafe {
            low::prep_closure::<Dispatch, u8>(
                closure,
                dispatch.cif.raw_cif(),
                trampoline,
                &*dispatch,
                code,
            )
        };
        if prepared.is_err() {
            // SAFETY: allocated above and never published
            unsafe { low::closure_free(closure) };
            return Err(FfiError::PrepFailed { signature: dispatch.cif.key().to_string() });
        }

        Ok(Self { closure, code, dispatch })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.dispatch.name
    }

    #[inline]
    pub fn cif(&self) -> &CifHandle {
        &self.dispatch.cif
    }

    /// Leading words passed to the host before the native arguments
    pub fn prefix(&self) -> &[Value] {
        &self.dispatch.prefix
    }

    /// Number of `pointer-obj` results kept alive for native callers
    pub fn retained(&self) -> usize {
        self.dispatch.retained.lock().len()
    }

    /// Native entry address of the trampoline
    #[inline]
    pub fn entry(&self) -> usize {
        self.code.0 as usize
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        // SAFETY: allocated by closure_alloc in `new` and freed only here
        unsafe { low::closure_free(self.closure) };
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.dispatch.name)
            .field("signature", &self.dispatch.cif.key())
            .field("entry", &format_args!("{:#x}", self.entry()))
            .finish()
    }
}

unsafe extern "C" fn trampoline(
    _cif: &raw::ffi_cif,
    result: &mut u8,
    args: *const *const c_void,
    dispatch: &Dispatch,
) {
    let ret = result as *mut u8;
    let rtype = dispatch.cif.rtype();

    let Some(host) = dispatch.host.upgrade() else {
        marshal::zero_return(rtype, ret);
        let error = FfiError::SessionGone { callback: dispatch.name.clone() };
        logging::log_session_gone(&dispatch.name, &error);
        return;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| dispatch.run(&*host, args, ret)));
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(message)) => message,
        Err(panic) => panic_message(panic.as_ref()),
    };

    marshal::zero_return(rtype, ret);
    let error = FfiError::Dispatch { callback: dispatch.name.clone(), message };
    logging::log_background_error(&dispatch.name, &error);
    host.report_background_error(error);
}

impl Dispatch {
    /// # Safety
    /// `args` must hold one valid pointer per declared argument and `ret`
    /// must be the backend's return buffer for this cif.
    unsafe fn run(
        &self,
        host: &dyn Host,
        args: *const *const c_void,
        ret: *mut u8,
    ) -> std::result::Result<(), String> {
        let atypes = self.cif.atypes();
        let mut words = Vec::with_capacity(self.prefix.len() + atypes.len());
        words.extend(self.prefix.iter().cloned());
        for (index, atype) in atypes.iter().enumerate() {
            let src = *args.add(index) as *const u8;
            words.push(marshal::load_value(atype, src));
        }

        logging::log_dispatch(&self.name, atypes.len());
        let value = host.invoke(&words).map_err(|err| err.message)?;
        drop(words);

        self.store_result(self.cif.rtype(), &value, ret).map_err(|err| {
            format!("{}, converting callback return value", err)
        })
    }

    unsafe fn store_result(&self, rtype: &TypeDesc, value: &Value, ret: *mut u8) -> Result<()> {
        match rtype.code() {
            TypeCode::Void => {}
            TypeCode::Struct => {
                let bytes = value.as_bytes()?;
                if bytes.len() != rtype.size() {
                    return Err(FfiError::ReturnSize { expected: rtype.size(), got: bytes.len() });
                }
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ret, rtype.size());
            }
            TypeCode::PointerObj => {
                let boxed = Box::new(value.clone());
                (ret as *mut *const Value).write(&*boxed);
                self.retained.lock().push(boxed);
            }
            _ => {
                let scalar = marshal::extract(rtype, value)?;
                marshal::store_return(rtype, ret, scalar);
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("callback panicked: {}", s)
    } else {
        "callback panicked".to_string()
    }
}
