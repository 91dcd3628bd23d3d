use ffidyn::interop::{align_up, TypeRegistry};
use ffidyn::{FfiError, MismatchPolicy};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

const ELEMENTS: &[&str] = &[
    "sint8", "uint8", "sint16", "uint16", "sint32", "uint32", "sint64", "uint64", "float",
    "double", "pointer", "char", "short", "int", "long", "long long",
];

static NEXT: AtomicUsize = AtomicUsize::new(0);

fn fresh_name() -> String {
    format!("agg{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Sequential placement computed directly from the element layouts
fn expected_layout(reg: &TypeRegistry, elements: &[&str]) -> (usize, usize) {
    let mut size = 0;
    let mut align = 1;
    for name in elements {
        let (s, a) = (reg.size_of(name).unwrap(), reg.align_of(name).unwrap());
        size = align_up(size, a) + s;
        align = align.max(a);
    }
    (align_up(size, align), align)
}

proptest! {
    #[test]
    fn test_aggregate_layout_law(indices in prop::collection::vec(0..ELEMENTS.len(), 2..8)) {
        let reg = TypeRegistry::default();
        let elements: Vec<&str> = indices.iter().map(|&i| ELEMENTS[i]).collect();
        let name = fresh_name();

        let desc = reg.define(&name, &elements).unwrap();
        let (size, align) = expected_layout(&reg, &elements);
        prop_assert_eq!(desc.size(), size);
        prop_assert_eq!(desc.align(), align);
        prop_assert_eq!(desc.backend_layout(), Some((size, align)));
    }

    #[test]
    fn test_nested_aggregate_layout(
        inner in prop::collection::vec(0..ELEMENTS.len(), 2..4),
        outer in prop::collection::vec(0..ELEMENTS.len(), 1..4),
    ) {
        let reg = TypeRegistry::default();
        let inner: Vec<&str> = inner.iter().map(|&i| ELEMENTS[i]).collect();
        let inner_name = fresh_name();
        reg.define(&inner_name, &inner).unwrap();

        let mut elements: Vec<&str> = outer.iter().map(|&i| ELEMENTS[i]).collect();
        elements.insert(elements.len() / 2, &inner_name);
        let name = fresh_name();
        let desc = reg.define(&name, &elements).unwrap();

        let (size, align) = expected_layout(&reg, &elements);
        prop_assert_eq!((desc.size(), desc.align()), (size, align));
    }
}

#[test]
fn test_point_layout() {
    let reg = TypeRegistry::default();
    let point = reg.define("point", &["int", "int"]).unwrap();
    assert_eq!((point.size(), point.align()), (8, 4));
    let expected = if cfg!(target_endian = "big") { "II" } else { "ii" };
    assert_eq!(reg.format("point").unwrap(), expected);
}

#[test]
fn test_alias_shares_descriptor() {
    let reg = TypeRegistry::new(MismatchPolicy::Error);
    reg.define("point", &["sint32", "sint32"]).unwrap();
    let before = reg.refcount("point").unwrap();
    let alias = reg.define("vec2", &["point"]).unwrap();
    assert!(std::sync::Arc::ptr_eq(&alias, &reg.lookup("point").unwrap()));
    assert!(reg.refcount("point").unwrap() > before);
}

#[test]
fn test_definition_errors() {
    let reg = TypeRegistry::default();
    assert!(matches!(reg.define("int", &["sint32"]), Err(FfiError::TypeExists { .. })));
    assert!(matches!(reg.define("bad", &["sint32", "nothing"]), Err(FfiError::UnknownType { .. })));
    assert!(matches!(
        reg.define("bad", &["sint32", "pointer-utf8"]),
        Err(FfiError::ContextViolation { .. })
    ));
    assert!(!reg.contains("bad"));
}
