//! Host ↔ native value conversion
//!
//! Scalars move through fixed-width slots. Integer returns narrower than the
//! backend's register-sized `ffi_arg` are widened by the callee and must be
//! narrowed by declared type, never read at their natural width.

use super::extended;
use super::types::{Extraction, TypeCode, TypeDesc};
use crate::error::{FfiError, Result};
use crate::value::{ByteBuffer, Value};
use libffi::raw::ffi_arg;
use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::os::raw::c_char;
use std::sync::Arc;

/// One argument or return slot, wide and aligned enough for any primitive
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot([u8; 16]);

impl Slot {
    pub const ZERO: Slot = Slot([0; 16]);

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

/// Zeroed, 16-byte aligned storage for at least `size` bytes
pub(crate) fn aligned_buffer(size: usize) -> Vec<Slot> {
    vec![Slot::ZERO; size.div_ceil(size_of::<Slot>()).max(1)]
}

/// Scalar pulled out of a host value by extraction class
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Scalar {
    Int(i64),
    Double(f64),
    Ptr(usize),
}

/// Convert a host value for a scalar-typed slot
pub(crate) fn extract(desc: &TypeDesc, value: &Value) -> Result<Scalar> {
    match desc.extraction() {
        Extraction::Int if desc.code() == TypeCode::Pointer => value.as_pointer().map(Scalar::Ptr),
        Extraction::Wide if desc.code() == TypeCode::Pointer => value.as_pointer().map(Scalar::Ptr),
        Extraction::Int => value.as_int().map(Scalar::Int),
        Extraction::Wide => value.as_wide().map(Scalar::Int),
        Extraction::Double => value.as_double().map(Scalar::Double),
        Extraction::None => Err(FfiError::conversion("a scalar type", format!("{:?}", desc.code()))),
    }
}

impl Scalar {
    fn int(self) -> i64 {
        match self {
            Self::Int(i) => i,
            Self::Double(d) => d as i64,
            Self::Ptr(p) => p as i64,
        }
    }

    fn double(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Double(d) => d,
            Self::Ptr(p) => p as f64,
        }
    }

    fn ptr(self) -> usize {
        match self {
            Self::Int(i) => i as usize,
            Self::Double(d) => d as usize,
            Self::Ptr(p) => p,
        }
    }
}

/// Store a scalar at its natural width
///
/// # Safety
/// `dst` must be valid and aligned for a write of `desc.size()` bytes.
pub(crate) unsafe fn store_scalar(desc: &TypeDesc, dst: *mut u8, value: Scalar) {
    match desc.code() {
        TypeCode::SInt8 => (dst as *mut i8).write(value.int() as i8),
        TypeCode::UInt8 => dst.write(value.int() as u8),
        TypeCode::SInt16 => (dst as *mut i16).write(value.int() as i16),
        TypeCode::UInt16 => (dst as *mut u16).write(value.int() as u16),
        TypeCode::SInt32 => (dst as *mut i32).write(value.int() as i32),
        TypeCode::UInt32 => (dst as *mut u32).write(value.int() as u32),
        TypeCode::SInt64 => (dst as *mut i64).write(value.int()),
        TypeCode::UInt64 => (dst as *mut u64).write(value.int() as u64),
        TypeCode::Float => (dst as *mut f32).write(value.double() as f32),
        TypeCode::Double => (dst as *mut f64).write(value.double()),
        TypeCode::LongDouble => extended::write(dst, desc.size(), value.double()),
        TypeCode::Void | TypeCode::Struct => {}
        _ => (dst as *mut usize).write(value.ptr()),
    }
}

/// Whether a return of this type travels in a widened `ffi_arg`
#[inline]
pub(crate) fn is_widened(desc: &TypeDesc) -> bool {
    desc.code().is_integral() && desc.size() < size_of::<ffi_arg>()
}

/// Store a return value the way the backend expects to find it
///
/// # Safety
/// `dst` must be valid for `max(desc.size(), size_of::<ffi_arg>())` bytes.
pub(crate) unsafe fn store_return(desc: &TypeDesc, dst: *mut u8, value: Scalar) {
    if !is_widened(desc) {
        return store_scalar(desc, dst, value);
    }
    let v = value.int();
    let widened = match desc.code() {
        TypeCode::SInt8 => v as i8 as i64 as ffi_arg,
        TypeCode::UInt8 => v as u8 as ffi_arg,
        TypeCode::SInt16 => v as i16 as i64 as ffi_arg,
        TypeCode::UInt16 => v as u16 as ffi_arg,
        TypeCode::SInt32 => v as i32 as i64 as ffi_arg,
        _ => v as u32 as ffi_arg,
    };
    (dst as *mut ffi_arg).write(widened);
}

/// Zero the bytes a caller reads back for this return type
///
/// # Safety
/// Same as [`store_return`].
pub(crate) unsafe fn zero_return(desc: &TypeDesc, dst: *mut u8) {
    let len = if is_widened(desc) { size_of::<ffi_arg>() } else { desc.size() };
    std::ptr::write_bytes(dst, 0, len);
}

/// Read a native return value, narrowing widened integers
///
/// # Safety
/// `src` must hold a value the backend wrote for `desc`.
pub(crate) unsafe fn load_return(desc: &TypeDesc, src: *const u8) -> Value {
    if !is_widened(desc) {
        return load_value(desc, src);
    }
    let raw = (src as *const ffi_arg).read();
    let v = match desc.code() {
        TypeCode::SInt8 => i64::from(raw as i8),
        TypeCode::UInt8 => i64::from(raw as u8),
        TypeCode::SInt16 => i64::from(raw as i16),
        TypeCode::UInt16 => i64::from(raw as u16),
        TypeCode::SInt32 => i64::from(raw as i32),
        _ => i64::from(raw as u32),
    };
    Value::Int(v)
}

/// Build a host value from a natively laid out value
///
/// # Safety
/// `src` must point at a valid value of type `desc`; pointer-family values
/// must be null or point at data of the declared kind.
pub(crate) unsafe fn load_value(desc: &TypeDesc, src: *const u8) -> Value {
    match desc.code() {
        TypeCode::Void => Value::Empty,
        TypeCode::SInt8 => Value::Int(i64::from((src as *const i8).read())),
        TypeCode::UInt8 => Value::Int(i64::from(src.read())),
        TypeCode::SInt16 => Value::Int(i64::from((src as *const i16).read())),
        TypeCode::UInt16 => Value::Int(i64::from((src as *const u16).read())),
        TypeCode::SInt32 => Value::Int(i64::from((src as *const i32).read())),
        TypeCode::UInt32 => Value::Int(i64::from((src as *const u32).read())),
        TypeCode::SInt64 => Value::Int((src as *const i64).read()),
        TypeCode::UInt64 => Value::from_u64((src as *const u64).read()),
        TypeCode::Float => Value::Double(f64::from((src as *const f32).read())),
        TypeCode::Double => Value::Double((src as *const f64).read()),
        TypeCode::LongDouble => Value::Double(extended::read(src, desc.size())),
        TypeCode::Struct => {
            Value::Bytes(Arc::new(ByteBuffer::new(std::slice::from_raw_parts(src, desc.size()).to_vec())))
        }
        TypeCode::PointerObj => {
            let ptr = (src as *const *const Value).read();
            ptr.as_ref().cloned().unwrap_or_default()
        }
        TypeCode::PointerUtf8 => {
            let ptr = (src as *const *const c_char).read();
            if ptr.is_null() {
                Value::Empty
            } else {
                Value::Str(CStr::from_ptr(ptr).to_string_lossy().into())
            }
        }
        TypeCode::PointerUtf16 => {
            let ptr = (src as *const *const u16).read();
            if ptr.is_null() {
                Value::Empty
            } else {
                Value::Str(String::from_utf16_lossy(wide_slice(ptr)).into())
            }
        }
        _ => Value::Pointer((src as *const usize).read()),
    }
}

unsafe fn wide_slice<'a>(ptr: *const u16) -> &'a [u16] {
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    std::slice::from_raw_parts(ptr, len)
}

/// NUL-terminated UTF-8 copy of a value's text
pub(crate) fn utf8_arg(value: &Value) -> Result<CString> {
    CString::new(value.as_str().as_bytes())
        .map_err(|_| FfiError::conversion("text without NUL characters", value))
}

/// NUL-terminated UTF-16 copy of a value's text
pub(crate) fn utf16_arg(value: &Value) -> Vec<u16> {
    value.as_str().encode_utf16().chain(std::iter::once(0)).collect()
}

/// A value that must already be a byte buffer
pub(crate) fn binary_arg(index: usize, value: &Value) -> Result<Arc<ByteBuffer>> {
    match value {
        Value::Bytes(b) => Ok(Arc::clone(b)),
        _ => Err(FfiError::NotBinary { index }),
    }
}

/// Copy a struct argument into aligned scratch after checking its size
pub(crate) fn struct_arg(index: usize, desc: &TypeDesc, value: &Value) -> Result<Vec<Slot>> {
    let bytes = binary_arg(index, value)?;
    if bytes.len() != desc.size() {
        return Err(FfiError::SizeMismatch { index, expected: desc.size(), got: bytes.len() });
    }
    let mut scratch = aligned_buffer(desc.size());
    // SAFETY: scratch holds at least desc.size() bytes
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), scratch.as_mut_ptr() as *mut u8, desc.size());
    }
    Ok(scratch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::types::builtin_types;

    fn ty(name: &str) -> Arc<TypeDesc> {
        builtin_types().into_iter().find(|(n, _)| *n == name).map(|(_, t)| t).unwrap()
    }

    fn round_trip(name: &str, value: Value) -> Value {
        let desc = ty(name);
        let mut slot = Slot::ZERO;
        unsafe {
            store_scalar(&desc, slot.as_mut_ptr(), extract(&desc, &value).unwrap());
            load_value(&desc, slot.as_mut_ptr())
        }
    }

    #[test]
    fn test_scalar_round_trips() {
        assert_eq!(round_trip("sint32", Value::Int(-123)), Value::Int(-123));
        assert_eq!(round_trip("uint8", Value::Int(255)), Value::Int(255));
        assert_eq!(round_trip("sint16", Value::Int(-32768)), Value::Int(-32768));
        assert_eq!(round_trip("double", Value::Double(3.5)), Value::Double(3.5));
        assert_eq!(round_trip("float", Value::Double(0.25)), Value::Double(0.25));
        assert_eq!(round_trip("long double", Value::Double(-7.5)), Value::Double(-7.5));
        assert_eq!(round_trip("pointer", Value::Pointer(0x1000)), Value::Pointer(0x1000));
        assert_eq!(round_trip("uint64", Value::from_u64(u64::MAX)), Value::from_u64(u64::MAX));
    }

    #[test]
    fn test_truncating_store() {
        assert_eq!(round_trip("uint8", Value::Int(0x1ff)), Value::Int(0xff));
        assert_eq!(round_trip("sint8", Value::Int(0x80)), Value::Int(-128));
    }

    #[test]
    fn test_widened_return() {
        let desc = ty("sint8");
        let mut slot = Slot::ZERO;
        unsafe {
            store_return(&desc, slot.as_mut_ptr(), Scalar::Int(-2));
            assert_eq!((slot.as_mut_ptr() as *const ffi_arg).read(), -2i64 as ffi_arg);
            assert_eq!(load_return(&desc, slot.as_mut_ptr()), Value::Int(-2));
            zero_return(&desc, slot.as_mut_ptr());
            assert_eq!(load_return(&desc, slot.as_mut_ptr()), Value::Int(0));
        }
    }

    #[test]
    fn test_text_pointers() {
        let text = CString::new("héllo").unwrap();
        let ptr = text.as_ptr();
        let desc = ty("pointer-utf8");
        let value = unsafe { load_value(&desc, &ptr as *const _ as *const u8) };
        assert_eq!(value, Value::from("héllo"));

        let wide = utf16_arg(&Value::from("wide"));
        let ptr = wide.as_ptr();
        let desc = ty("pointer-utf16");
        let value = unsafe { load_value(&desc, &ptr as *const _ as *const u8) };
        assert_eq!(value, Value::from("wide"));

        assert!(utf8_arg(&Value::from("a\0b")).is_err());
    }

    #[test]
    fn test_struct_arg_checks() {
        let reg = crate::interop::TypeRegistry::default();
        let point = reg.define("point", &["sint32", "sint32"]).unwrap();
        let err = struct_arg(1, &point, &Value::bytes(vec![0u8; 4])).unwrap_err();
        assert!(matches!(err, FfiError::SizeMismatch { index: 1, expected: 8, got: 4 }));
        let err = struct_arg(0, &point, &Value::Int(3)).unwrap_err();
        assert!(matches!(err, FfiError::NotBinary { index: 0 }));
        assert_eq!(struct_arg(0, &point, &Value::bytes(vec![1u8; 8])).unwrap().len(), 1);
    }

    #[test]
    fn test_extract_rejects_bad_text() {
        let desc = ty("sint32");
        assert!(matches!(
            extract(&desc, &Value::from("twelve")),
            Err(FfiError::Conversion { .. })
        ));
    }
}
