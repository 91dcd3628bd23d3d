//! Type descriptors
//!
//! Defines the primitive type table and the aggregate layout rules. Every
//! descriptor carries the backend `ffi_type` it was materialized into so call
//! descriptors can point straight at it.

use crate::error::UsageContext;
use libffi::middle::Type;
use libffi::raw;
use std::fmt;
use std::sync::Arc;

/// Native type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    Void,
    SInt8,
    UInt8,
    SInt16,
    UInt16,
    SInt32,
    UInt32,
    SInt64,
    UInt64,
    Float,
    Double,
    LongDouble,
    Pointer,
    PointerObj,
    PointerUtf8,
    PointerUtf16,
    PointerByte,
    PointerVar,
    PointerProc,
    Struct,
}

impl TypeCode {
    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::SInt8
                | Self::UInt8
                | Self::SInt16
                | Self::UInt16
                | Self::SInt32
                | Self::UInt32
                | Self::SInt64
                | Self::UInt64
        )
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double | Self::LongDouble)
    }

    /// Any member of the pointer family, typed or opaque
    #[inline]
    pub const fn is_pointer(self) -> bool {
        matches!(
            self,
            Self::Pointer
                | Self::PointerObj
                | Self::PointerUtf8
                | Self::PointerUtf16
                | Self::PointerByte
                | Self::PointerVar
                | Self::PointerProc
        )
    }
}

/// Bitmask of usage contexts a type may appear in
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contexts(u8);

impl Contexts {
    pub const ARG: Self = Self(0x01);
    pub const RET: Self = Self(0x02);
    pub const ELT: Self = Self(0x04);
    pub const CBARG: Self = Self(0x08);
    pub const CBRET: Self = Self(0x10);
    pub const ALL: Self = Self(0x1f);

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn permits(self, context: UsageContext) -> bool {
        self.contains(context.into())
    }
}

impl From<UsageContext> for Contexts {
    fn from(context: UsageContext) -> Self {
        match context {
            UsageContext::Argument => Self::ARG,
            UsageContext::Return => Self::RET,
            UsageContext::Element => Self::ELT,
            UsageContext::CallbackArgument => Self::CBARG,
            UsageContext::CallbackReturn => Self::CBRET,
        }
    }
}

impl fmt::Debug for Contexts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contexts({:#04x})", self.0)
    }
}

/// How a host value is pulled out for a given native type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    None,
    Int,
    Wide,
    Double,
}

/// Shared, immutable type descriptor
pub struct TypeDesc {
    code: TypeCode,
    size: usize,
    align: usize,
    contexts: Contexts,
    extraction: Extraction,
    elements: Vec<Arc<TypeDesc>>,
    backend: BackendType,
}

/// Backend type record; never mutated once the descriptor is published
struct BackendType(Type);

// SAFETY: the wrapped ffi_type tree is only read after construction
unsafe impl Send for BackendType {}
unsafe impl Sync for BackendType {}

impl TypeDesc {
    fn primitive(code: TypeCode, contexts: Contexts) -> Self {
        let backend = BackendType(backend_type(code));
        let (size, align) = match code {
            TypeCode::Void => (0, 1),
            // SAFETY: primitive ffi_type records are statically initialized
            _ => unsafe {
                let raw = &*backend.0.as_raw_ptr();
                (raw.size, usize::from(raw.alignment))
            },
        };
        Self {
            code,
            size,
            align,
            contexts,
            extraction: extraction_class(code, size),
            elements: Vec::new(),
            backend,
        }
    }

    /// Aggregate laid out sequentially from `elements`
    ///
    /// Layout is folded locally; the backend's own view is available through
    /// [`TypeDesc::backend_layout`] for cross-checking.
    pub fn aggregate(elements: Vec<Arc<TypeDesc>>) -> Self {
        let (size, align) = fold_layout(elements.iter().map(|e| (e.size, e.align)));
        let backend = BackendType(Type::structure(elements.iter().map(|e| e.backend.0.clone())));
        Self {
            code: TypeCode::Struct,
            size,
            align,
            contexts: Contexts::ALL,
            extraction: Extraction::None,
            elements,
            backend,
        }
    }

    #[inline]
    pub fn code(&self) -> TypeCode {
        self.code
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn contexts(&self) -> Contexts {
        self.contexts
    }

    #[inline]
    pub fn permits(&self, context: UsageContext) -> bool {
        self.contexts.permits(context)
    }

    #[inline]
    pub fn extraction(&self) -> Extraction {
        self.extraction
    }

    #[inline]
    pub fn elements(&self) -> &[Arc<TypeDesc>] {
        &self.elements
    }

    #[inline]
    pub fn is_struct(&self) -> bool {
        self.code == TypeCode::Struct
    }

    /// Raw backend type record, valid while `self` is alive
    #[inline]
    pub fn backend_ptr(&self) -> *mut raw::ffi_type {
        self.backend.0.as_raw_ptr()
    }

    /// Size and alignment as materialized by the backend for the default ABI
    ///
    /// Returns `None` when the backend refuses the layout.
    pub fn backend_layout(&self) -> Option<(usize, usize)> {
        let raw_type = self.backend.0.as_raw_ptr();
        let mut offsets = vec![0usize; self.elements.len().max(1)];
        // SAFETY: raw_type is owned by self.backend and offsets has room for
        // one entry per element
        unsafe {
            let status = raw::ffi_get_struct_offsets(
                raw::ffi_abi_FFI_DEFAULT_ABI,
                raw_type,
                offsets.as_mut_ptr(),
            );
            if status != raw::ffi_status_FFI_OK {
                return None;
            }
            Some(((*raw_type).size, usize::from((*raw_type).alignment)))
        }
    }

    /// Tcl `binary` format string for this layout
    pub fn format(&self) -> Option<String> {
        let mut out = String::new();
        let mut offset = 0;
        self.format_into(&mut out, &mut offset, cfg!(target_endian = "big"))?;
        Some(out)
    }

    fn format_into(&self, out: &mut String, offset: &mut usize, big_endian: bool) -> Option<()> {
        if self.size == 0 {
            return Some(());
        }
        while *offset % self.align != 0 {
            out.push('x');
            *offset += 1;
        }
        let code = self.code;
        if code.is_integral() || code.is_pointer() {
            let tag = match self.size {
                8 => Some('w'),
                4 => Some('i'),
                2 => Some('s'),
                1 => Some('c'),
                _ => None,
            };
            match tag {
                Some('c') => out.push('c'),
                Some(t) if big_endian => out.push(t.to_ascii_uppercase()),
                Some(t) => out.push(t),
                None => out.push_str(&format!("c{}", self.size)),
            }
            *offset += self.size;
        } else if code.is_float() {
            match self.size {
                8 => out.push('d'),
                4 => out.push('f'),
                n => out.push_str(&format!("c{}", n)),
            }
            *offset += self.size;
        } else if code == TypeCode::Struct {
            let start = *offset;
            for element in &self.elements {
                element.format_into(out, offset, big_endian)?;
            }
            while *offset < start + self.size {
                out.push('x');
                *offset += 1;
            }
        } else {
            return None;
        }
        Some(())
    }
}

impl fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDesc")
            .field("code", &self.code)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("contexts", &self.contexts)
            .field("elements", &self.elements.len())
            .finish()
    }
}

/// Sequential struct layout: each field aligned to itself, tail padded to
/// the largest alignment seen
pub fn fold_layout(fields: impl IntoIterator<Item = (usize, usize)>) -> (usize, usize) {
    let (size, align) = fields.into_iter().fold((0usize, 1usize), |(size, align), (fsize, falign)| {
        let falign = falign.max(1);
        (align_up(size, falign) + fsize, align.max(falign))
    });
    (align_up(size, align), align)
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

fn backend_type(code: TypeCode) -> Type {
    match code {
        TypeCode::Void => Type::void(),
        TypeCode::SInt8 => Type::i8(),
        TypeCode::UInt8 => Type::u8(),
        TypeCode::SInt16 => Type::i16(),
        TypeCode::UInt16 => Type::u16(),
        TypeCode::SInt32 => Type::i32(),
        TypeCode::UInt32 => Type::u32(),
        TypeCode::SInt64 => Type::i64(),
        TypeCode::UInt64 => Type::u64(),
        TypeCode::Float => Type::f32(),
        TypeCode::Double => Type::f64(),
        TypeCode::LongDouble => Type::longdouble(),
        TypeCode::Struct => Type::void(),
        _ => Type::pointer(),
    }
}

fn extraction_class(code: TypeCode, size: usize) -> Extraction {
    match code {
        TypeCode::Void | TypeCode::Struct => Extraction::None,
        c if c.is_float() => Extraction::Double,
        c if c.is_integral() && size >= 8 => Extraction::Wide,
        c if c.is_integral() => Extraction::Int,
        TypeCode::Pointer if cfg!(target_pointer_width = "64") => Extraction::Wide,
        TypeCode::Pointer => Extraction::Int,
        _ => Extraction::None,
    }
}

fn sized_int(size: usize, signed: bool) -> TypeCode {
    match (size, signed) {
        (1, true) => TypeCode::SInt8,
        (1, false) => TypeCode::UInt8,
        (2, true) => TypeCode::SInt16,
        (2, false) => TypeCode::UInt16,
        (4, true) => TypeCode::SInt32,
        (4, false) => TypeCode::UInt32,
        (_, true) => TypeCode::SInt64,
        (_, false) => TypeCode::UInt64,
    }
}

/// The immortal primitive table, C names resolved to sized codes
pub fn builtin_types() -> Vec<(&'static str, Arc<TypeDesc>)> {
    use core::ffi::{c_char, c_int, c_long, c_longlong, c_short};
    use core::mem::size_of;

    let arg_ret = Contexts::ARG.union(Contexts::RET);
    let char_signed = c_char::MIN != 0;
    let table: [(&'static str, TypeCode, Contexts); 30] = [
        ("void", TypeCode::Void, Contexts::RET.union(Contexts::CBRET)),
        ("char", sized_int(size_of::<c_char>(), char_signed), Contexts::ALL),
        ("signed char", TypeCode::SInt8, Contexts::ALL),
        ("unsigned char", TypeCode::UInt8, Contexts::ALL),
        ("short", sized_int(size_of::<c_short>(), true), Contexts::ALL),
        ("unsigned short", sized_int(size_of::<c_short>(), false), Contexts::ALL),
        ("int", sized_int(size_of::<c_int>(), true), Contexts::ALL),
        ("unsigned", sized_int(size_of::<c_int>(), false), Contexts::ALL),
        ("long", sized_int(size_of::<c_long>(), true), Contexts::ALL),
        ("unsigned long", sized_int(size_of::<c_long>(), false), Contexts::ALL),
        ("long long", sized_int(size_of::<c_longlong>(), true), Contexts::ALL),
        ("unsigned long long", sized_int(size_of::<c_longlong>(), false), Contexts::ALL),
        ("float", TypeCode::Float, Contexts::ALL),
        ("double", TypeCode::Double, Contexts::ALL),
        ("long double", TypeCode::LongDouble, Contexts::ALL),
        ("sint8", TypeCode::SInt8, Contexts::ALL),
        ("uint8", TypeCode::UInt8, Contexts::ALL),
        ("sint16", TypeCode::SInt16, Contexts::ALL),
        ("uint16", TypeCode::UInt16, Contexts::ALL),
        ("sint32", TypeCode::SInt32, Contexts::ALL),
        ("uint32", TypeCode::UInt32, Contexts::ALL),
        ("sint64", TypeCode::SInt64, Contexts::ALL),
        ("uint64", TypeCode::UInt64, Contexts::ALL),
        ("pointer", TypeCode::Pointer, Contexts::ALL),
        (
            "pointer-obj",
            TypeCode::PointerObj,
            arg_ret.union(Contexts::CBARG).union(Contexts::CBRET),
        ),
        ("pointer-utf8", TypeCode::PointerUtf8, arg_ret.union(Contexts::CBARG)),
        ("pointer-utf16", TypeCode::PointerUtf16, arg_ret.union(Contexts::CBARG)),
        ("pointer-byte", TypeCode::PointerByte, Contexts::ARG),
        ("pointer-var", TypeCode::PointerVar, Contexts::ARG),
        ("pointer-proc", TypeCode::PointerProc, Contexts::ARG),
    ];

    table
        .into_iter()
        .map(|(name, code, contexts)| (name, Arc::new(TypeDesc::primitive(code, contexts))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin(name: &str) -> Arc<TypeDesc> {
        builtin_types()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
            .unwrap()
    }

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(builtin("sint8").size(), 1);
        assert_eq!(builtin("uint16").size(), 2);
        assert_eq!(builtin("sint32").size(), 4);
        assert_eq!(builtin("uint64").size(), 8);
        assert_eq!(builtin("double").size(), 8);
        assert_eq!(builtin("pointer").size(), core::mem::size_of::<usize>());
        assert_eq!(builtin("void").size(), 0);
    }

    #[test]
    fn test_extraction_classes() {
        assert_eq!(builtin("sint32").extraction(), Extraction::Int);
        assert_eq!(builtin("uint64").extraction(), Extraction::Wide);
        assert_eq!(builtin("float").extraction(), Extraction::Double);
        assert_eq!(builtin("pointer-utf8").extraction(), Extraction::None);
    }

    #[test]
    fn test_contexts() {
        let byte = builtin("pointer-byte");
        assert!(byte.permits(UsageContext::Argument));
        assert!(!byte.permits(UsageContext::Return));
        assert!(!builtin("void").permits(UsageContext::Element));
        assert!(builtin("pointer-obj").permits(UsageContext::CallbackReturn));
        assert!(!builtin("pointer-utf8").permits(UsageContext::CallbackReturn));
    }

    #[test]
    fn test_fold_layout() {
        assert_eq!(fold_layout([(4, 4), (4, 4)]), (8, 4));
        assert_eq!(fold_layout([(1, 1), (8, 8), (2, 2)]), (24, 8));
        assert_eq!(fold_layout([(2, 2), (1, 1)]), (4, 2));
        assert_eq!(fold_layout(std::iter::empty()), (0, 1));
    }

    #[test]
    fn test_aggregate_matches_backend() {
        let agg = TypeDesc::aggregate(vec![builtin("sint8"), builtin("double"), builtin("sint16")]);
        assert_eq!((agg.size(), agg.align()), (24, 8));
        assert_eq!(agg.backend_layout(), Some((24, 8)));
    }

    #[test]
    fn test_format() {
        let point = TypeDesc::aggregate(vec![builtin("sint32"), builtin("sint32")]);
        let expected = if cfg!(target_endian = "big") { "II" } else { "ii" };
        assert_eq!(point.format().unwrap(), expected);

        let padded = TypeDesc::aggregate(vec![builtin("sint8"), builtin("double")]);
        assert_eq!(padded.format().unwrap(), "cxxxxxxxd");

        let tail = TypeDesc::aggregate(vec![builtin("double"), builtin("uint8")]);
        assert_eq!(tail.format().unwrap(), "dcxxxxxxx");

        assert_eq!(builtin("void").format().unwrap(), "");
    }
}
