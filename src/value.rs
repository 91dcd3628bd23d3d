//! Host value model
//!
//! A `Value` is the duck-typed currency exchanged with the host: every value
//! has a textual form and converts to the numeric classes on demand. Byte
//! buffers are shared and may be written in place by native code, so their
//! cached text form can be invalidated after such out-of-band mutation.

use crate::error::{FfiError, Result};
use parking_lot::RwLock;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

/// Shared, natively writable byte storage
///
/// Native callees receive `as_mut_ptr()` for the duration of a call. The host
/// side must not read the buffer while a native call holds that pointer.
pub struct ByteBuffer {
    data: UnsafeCell<Box<[u8]>>,
    text: RwLock<Option<Arc<str>>>,
}

// SAFETY: writes through the raw data pointer only happen from native code
// during a call that owns a reference to the buffer, and callers serialize
// those calls against host-side reads.
unsafe impl Sync for ByteBuffer {}
unsafe impl Send for ByteBuffer {}

impl ByteBuffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: UnsafeCell::new(bytes.into().into_boxed_slice()),
            text: RwLock::new(None),
        }
    }

    /// Zero-filled buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { &*self.data.get() }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes().as_ptr()
    }

    /// Raw write pointer handed to native code
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    /// Independent copy with no cached text
    pub fn duplicate(&self) -> Self {
        Self::new(self.to_vec())
    }

    /// Latin-1 text form, computed once and cached
    pub fn text(&self) -> Arc<str> {
        if let Some(text) = self.text.read().as_ref() {
            return Arc::clone(text);
        }
        let text: Arc<str> = self.bytes().iter().map(|&b| b as char).collect::<String>().into();
        *self.text.write() = Some(Arc::clone(&text));
        text
    }

    pub fn has_cached_text(&self) -> bool {
        self.text.read().is_some()
    }

    /// Drop the cached text form after the bytes were mutated in place
    pub fn invalidate_text(&self) {
        *self.text.write() = None;
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer").field("len", &self.len()).finish()
    }
}

/// Host value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    Int(i64),
    Double(f64),
    Str(Arc<str>),
    Bytes(Arc<ByteBuffer>),
    Pointer(usize),
}

impl Value {
    pub fn int(v: i64) -> Self {
        Self::Int(v)
    }

    /// Unsigned 64-bit values past `i64::MAX` are kept as decimal text
    pub fn from_u64(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::Str(v.to_string().into()),
        }
    }

    pub fn double(v: f64) -> Self {
        Self::Double(v)
    }

    pub fn string(s: impl AsRef<str>) -> Self {
        Self::Str(s.as_ref().into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Arc::new(ByteBuffer::new(b)))
    }

    pub fn pointer(p: usize) -> Self {
        Self::Pointer(p)
    }

    pub fn null() -> Self {
        Self::Pointer(0)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Textual form shared by every representation
    pub fn as_str(&self) -> Arc<str> {
        match self {
            Self::Str(s) => Arc::clone(s),
            Self::Bytes(b) => b.text(),
            other => other.to_string().into(),
        }
    }

    /// Integer extraction at `long` width
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(i) => Ok(*i),
            Self::Pointer(p) => Ok(*p as i64),
            Self::Double(d) => {
                let i = *d as i64;
                if i as f64 == *d {
                    Ok(i)
                } else {
                    Err(FfiError::conversion("integer", self))
                }
            }
            Self::Empty => Err(FfiError::conversion("integer", "")),
            _ => {
                let text = self.as_str();
                parse_text_integer(&text)
                    .and_then(|i| i64::try_from(i).ok())
                    .ok_or_else(|| FfiError::conversion("integer", &*text))
            }
        }
    }

    /// Integer extraction at 64 bits, accepting the full unsigned range
    pub fn as_wide(&self) -> Result<i64> {
        match self {
            Self::Int(i) => Ok(*i),
            Self::Pointer(p) => Ok(*p as u64 as i64),
            Self::Double(d) => {
                let i = *d as i64;
                if i as f64 == *d {
                    return Ok(i);
                }
                let u = *d as u64;
                if u as f64 == *d {
                    return Ok(u as i64);
                }
                Err(FfiError::conversion("wide integer", self))
            }
            Self::Empty => Err(FfiError::conversion("wide integer", "")),
            _ => {
                let text = self.as_str();
                parse_text_integer(&text)
                    .and_then(wide_from_i128)
                    .ok_or_else(|| FfiError::conversion("wide integer", &*text))
            }
        }
    }

    /// Floating extraction
    pub fn as_double(&self) -> Result<f64> {
        match self {
            Self::Double(d) => Ok(*d),
            Self::Int(i) => {
                let d = *i as f64;
                if d as i64 == *i {
                    Ok(d)
                } else {
                    parse_double(&i.to_string())
                        .ok_or_else(|| FfiError::conversion("floating-point number", i))
                }
            }
            Self::Pointer(p) => Ok(*p as f64),
            Self::Empty => Err(FfiError::conversion("floating-point number", "")),
            _ => {
                let text = self.as_str();
                parse_double(&text)
                    .or_else(|| parse_integer_literal(&text).map(|i| i as f64))
                    .ok_or_else(|| FfiError::conversion("floating-point number", &*text))
            }
        }
    }

    /// Address bit pattern at platform pointer width
    pub fn as_pointer(&self) -> Result<usize> {
        match self {
            Self::Pointer(p) => Ok(*p),
            #[cfg(target_pointer_width = "64")]
            _ => self.as_wide().map(|w| w as u64 as usize),
            #[cfg(not(target_pointer_width = "64"))]
            _ => self.as_int().map(|i| i as usize),
        }
    }

    /// Byte-buffer view; text converts when every character is Latin-1
    pub fn as_bytes(&self) -> Result<Arc<ByteBuffer>> {
        match self {
            Self::Bytes(b) => Ok(Arc::clone(b)),
            _ => {
                let text = self.as_str();
                let bytes = text
                    .chars()
                    .map(|c| u8::try_from(u32::from(c)).ok())
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| FfiError::conversion("byte array", &*text))?;
                Ok(Arc::new(ByteBuffer::new(bytes)))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Int(i) => write!(f, "{}", i),
            Self::Double(d) => write!(f, "{:?}", d),
            Self::Str(s) => f.write_str(s),
            Self::Bytes(b) => f.write_str(&b.text()),
            Self::Pointer(p) => write!(f, "{:#x}", p),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::from_u64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v.into())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::bytes(v)
    }
}

impl From<Arc<ByteBuffer>> for Value {
    fn from(v: Arc<ByteBuffer>) -> Self {
        Self::Bytes(v)
    }
}

fn wide_from_i128(i: i128) -> Option<i64> {
    i64::try_from(i)
        .ok()
        .or_else(|| u64::try_from(i).ok().map(|u| u as i64))
}

/// Exact integer literal first, then a double that survives the round trip
fn parse_text_integer(text: &str) -> Option<i128> {
    if let Some(i) = parse_integer_literal(text) {
        return Some(i);
    }
    let d = parse_double(text)?;
    let i = d as i128;
    (i as f64 == d).then_some(i)
}

fn parse_double(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

/// Integer literal with optional sign and `0x`/`0o`/`0b` radix prefix
pub(crate) fn parse_integer_literal(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, body) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let lower = body.to_ascii_lowercase();
    let (radix, digits) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else {
        (10, lower.as_str())
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = u64::from_str_radix(digits, radix).ok()? as i128;
    Some(if negative { -magnitude } else { magnitude })
}
