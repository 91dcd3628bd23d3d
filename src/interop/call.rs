//! Outbound calls - host values in, native call, host value out
//!
//! A [`Callout`] binds a prepared call descriptor to a native address and
//! keeps one reusable call frame. An invocation takes the frame for its own
//! exclusive use; a reentrant or concurrent invocation of the same binding
//! finds the frame taken and builds a fresh one instead.

use super::marshal::{self, aligned_buffer, Slot};
use super::signature::CifHandle;
use super::types::TypeCode;
use crate::error::{FfiError, Result};
use crate::logging;
use crate::value::{ByteBuffer, Value};
use libffi::middle::CodePtr;
use libffi::raw;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::ffi::{c_void, CString};
use std::sync::Arc;

/// Host-side lookups some pointer arguments need
pub trait ArgResolver {
    /// Unshared byte buffer held by a host variable (`pointer-var`)
    fn variable(&self, name: &str) -> Result<Arc<ByteBuffer>>;

    /// Native entry address of an installed callback (`pointer-proc`)
    fn callback_entry(&self, name: &str) -> Result<usize>;
}

/// Resolver for callouts used outside any session
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl ArgResolver for Detached {
    fn variable(&self, name: &str) -> Result<Arc<ByteBuffer>> {
        Err(FfiError::UnknownVariable { name: name.to_string() })
    }

    fn callback_entry(&self, name: &str) -> Result<usize> {
        Err(FfiError::UnknownCallback { name: name.to_string() })
    }
}

/// Per-binding argument and return storage
struct CallFrame {
    args: Vec<Slot>,
    ptrs: Vec<*mut c_void>,
    ret: Vec<Slot>,
}

// SAFETY: the raw pointers only ever point into storage owned by the frame
// or pinned by the invocation currently holding the frame
unsafe impl Send for CallFrame {}

impl CallFrame {
    fn new(cif: &CifHandle) -> Self {
        let ret_size = cif.rtype().size().max(std::mem::size_of::<raw::ffi_arg>());
        Self {
            args: vec![Slot::ZERO; cif.argc()],
            ptrs: vec![std::ptr::null_mut(); cif.argc()],
            ret: aligned_buffer(ret_size),
        }
    }
}

/// Storage that must outlive the native call
enum Pinned {
    Text(CString),
    Wide(Vec<u16>),
    Bytes(Arc<ByteBuffer>),
    Var(Arc<ByteBuffer>),
    Obj(Box<Value>),
    Struct(Vec<Slot>),
}

/// Outbound binding
pub struct Callout {
    name: String,
    cif: CifHandle,
    address: CodePtr,
    frame: Mutex<Option<CallFrame>>,
}

// SAFETY: the code pointer is an immutable address; the frame is guarded
unsafe impl Send for Callout {}
unsafe impl Sync for Callout {}

impl Callout {
    /// Bind a descriptor to a native function
    ///
    /// # Safety
    /// `address` must be a function whose real signature and calling
    /// convention match `cif` for as long as this callout is invoked.
    pub unsafe fn new(name: impl Into<String>, cif: CifHandle, address: usize) -> Self {
        let frame = CallFrame::new(&cif);
        Self {
            name: name.into(),
            cif,
            address: CodePtr(address as *mut c_void),
            frame: Mutex::new(Some(frame)),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn cif(&self) -> &CifHandle {
        &self.cif
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.address.0 as usize
    }

    /// Usage string listing the declared argument types
    pub fn usage(&self) -> String {
        self.cif.key().to_string()
    }

    /// Marshal `args`, call, and convert the return value
    pub fn invoke(&self, args: &[Value], resolver: &dyn ArgResolver) -> Result<Value> {
        if args.len() != self.cif.argc() {
            return Err(FfiError::ArgCount { expected: self.cif.argc(), got: args.len() });
        }

        let taken = self.frame.lock().take();
        let fresh = taken.is_none();
        let mut frame = taken.unwrap_or_else(|| CallFrame::new(&self.cif));

        let result = self.call_with(&mut frame, args, resolver);
        logging::log_callout_return(self.cif.key(), fresh);

        let mut slot = self.frame.lock();
        if slot.is_none() {
            *slot = Some(frame);
        }
        result
    }

    fn call_with(
        &self,
        frame: &mut CallFrame,
        args: &[Value],
        resolver: &dyn ArgResolver,
    ) -> Result<Value> {
        let mut pinned: SmallVec<[Pinned; 4]> = SmallVec::new();

        // Sequential: a pointer-var unshare must precede later reads
        for (index, (atype, value)) in self.cif.atypes().iter().zip(args).enumerate() {
            let slot = frame.args[index].as_mut_ptr();
            frame.ptrs[index] = slot as *mut c_void;

            let address = match atype.code() {
                TypeCode::Struct => {
                    let mut scratch = marshal::struct_arg(index, atype, value)?;
                    frame.ptrs[index] = scratch.as_mut_ptr() as *mut c_void;
                    pinned.push(Pinned::Struct(scratch));
                    continue;
                }
                TypeCode::PointerObj => {
                    let boxed = Box::new(value.clone());
                    let address = &*boxed as *const Value as usize;
                    pinned.push(Pinned::Obj(boxed));
                    address
                }
                TypeCode::PointerUtf8 => {
                    let text = marshal::utf8_arg(value)?;
                    let address = text.as_ptr() as usize;
                    pinned.push(Pinned::Text(text));
                    address
                }
                TypeCode::PointerUtf16 => {
                    let wide = marshal::utf16_arg(value);
                    let address = wide.as_ptr() as usize;
                    pinned.push(Pinned::Wide(wide));
                    address
                }
                TypeCode::PointerByte => {
                    let bytes = marshal::binary_arg(index, value)?;
                    let address = bytes.as_mut_ptr() as usize;
                    pinned.push(Pinned::Bytes(bytes));
                    address
                }
                TypeCode::PointerVar => {
                    let bytes = resolver.variable(&value.as_str()).map_err(|err| match err {
                        FfiError::Conversion { .. } => FfiError::NotBinary { index },
                        other => other,
                    })?;
                    let address = bytes.as_mut_ptr() as usize;
                    pinned.push(Pinned::Var(bytes));
                    address
                }
                TypeCode::PointerProc => resolver.callback_entry(&value.as_str())?,
                _ => {
                    let scalar = marshal::extract(atype, value)?;
                    // SAFETY: slot is 16 aligned bytes, enough for any primitive
                    unsafe { marshal::store_scalar(atype, slot, scalar) };
                    continue;
                }
            };
            // SAFETY: slot is aligned for a pointer write
            unsafe { (slot as *mut usize).write(address) };
        }

        let rtype = self.cif.rtype();
        let ret = frame.ret.as_mut_ptr() as *mut u8;
        // SAFETY: ret spans at least max(rtype size, ffi_arg)
        unsafe { std::ptr::write_bytes(ret, 0, rtype.size().max(std::mem::size_of::<raw::ffi_arg>())) };

        logging::log_callout_enter(self.cif.key(), self.address());
        // SAFETY: the binding's creator vouched for the address; every
        // argument pointer refers to frame storage or a pinned value
        let result = unsafe {
            raw::ffi_call(
                self.cif.raw_cif(),
                Some(*self.address.as_fun()),
                ret as *mut c_void,
                frame.ptrs.as_mut_ptr(),
            );
            marshal::load_return(rtype, ret)
        };

        for entry in &pinned {
            if let Pinned::Var(bytes) = entry {
                bytes.invalidate_text();
            }
        }
        drop(pinned);

        Ok(result)
    }
}

impl std::fmt::Debug for Callout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callout")
            .field("name", &self.name)
            .field("signature", &self.cif.key())
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}
