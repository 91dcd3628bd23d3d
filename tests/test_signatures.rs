use ffidyn::interop::{canonical_key, SignatureCache, TypeRegistry};
use ffidyn::{ErrorKind, FfiContext, FfiError, Session, Value};

extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a + b
}

#[repr(C)]
struct Pair {
    x: i32,
    y: i32,
}

#[repr(C)]
struct Triple {
    a: f64,
    b: f64,
    c: f64,
}

extern "C" fn pair_x(p: Pair) -> i32 {
    p.x
}

extern "C" fn triple_sum(t: Triple) -> i32 {
    (t.a + t.b + t.c) as i32
}

fn triple_bytes(a: f64, b: f64, c: f64) -> Vec<u8> {
    [a, b, c].iter().flat_map(|v| v.to_ne_bytes()).collect()
}

#[test]
fn test_same_signature_shares_descriptor() {
    let reg = TypeRegistry::default();
    let cache = SignatureCache::new();

    let first = cache.resolve(&reg, &["sint32", "sint32"], "sint32", None).unwrap();
    let second = cache.resolve(&reg, &["sint32", "sint32"], "sint32", None).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(first.refcount(), 2);
    assert_eq!(cache.len(), 1);

    drop(second);
    assert_eq!(first.refcount(), 1);
    drop(first);
    assert!(cache.is_empty());
}

#[test]
fn test_refcount_tracks_live_bindings() {
    let ctx = FfiContext::new(Session::new());
    let key = canonical_key(None, "sint32", &["sint32", "sint32"]);

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        unsafe {
            ctx.bind_outbound(name, &["sint32", "sint32"], "sint32", add_i32 as usize, None)
                .unwrap();
        }
        assert_eq!(ctx.signatures().get(&key).unwrap().refcount(), i + 1);
    }
    ctx.bind_inbound("cb", &["sint32", "sint32"], "sint32", None, None).unwrap();
    assert_eq!(ctx.signatures().get(&key).unwrap().refcount(), 4);
    assert_eq!(ctx.signature_keys(), vec![key.clone()]);

    ctx.unbind_outbound("a").unwrap();
    ctx.unbind_inbound("cb").unwrap();
    assert_eq!(ctx.signatures().get(&key).unwrap().refcount(), 2);

    ctx.unbind_outbound("b").unwrap();
    ctx.unbind_outbound("c").unwrap();
    assert!(ctx.signatures().get(&key).is_none());
}

#[test]
fn test_type_names_are_kept_verbatim_in_keys() {
    let reg = TypeRegistry::default();
    let cache = SignatureCache::new();
    let a = cache.resolve(&reg, &["int"], "int", None).unwrap();
    let b = cache.resolve(&reg, &["sint32"], "sint32", None).unwrap();
    assert_eq!(a.key(), "int(int)");
    assert_eq!(b.key(), "sint32(sint32)");
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_resolution_errors_leave_cache_clean() {
    let reg = TypeRegistry::default();
    let cache = SignatureCache::new();

    let err = cache.resolve(&reg, &["sint32"], "sint32", Some("no-such-abi")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert!(err.to_string().contains("default"));

    let err = cache.resolve(&reg, &["widget"], "sint32", None).unwrap_err();
    assert!(matches!(err, FfiError::UnknownType { ref name } if name == "widget"));
    assert_eq!(err.kind(), ErrorKind::Definition);
    assert!(cache.is_empty());
}

#[cfg(all(target_arch = "x86_64", not(windows)))]
#[test]
fn test_non_default_protocol_prefixes_key() {
    let reg = TypeRegistry::default();
    let cache = SignatureCache::new();
    let handle = cache.resolve(&reg, &["sint32"], "sint32", Some("win64")).unwrap();
    assert_eq!(handle.key(), "win64 sint32(sint32)");
    assert_eq!(handle.protocol().name(), "win64");
}

#[test]
fn test_redefined_struct_is_not_served_stale() {
    let ctx = FfiContext::new(Session::new());
    ctx.define_type("point", &["sint32", "sint32"]).unwrap();
    unsafe {
        ctx.bind_outbound("first", &["point"], "sint32", pair_x as usize, None).unwrap();
    }

    ctx.undefine_type("point").unwrap();
    ctx.define_type("point", &["double", "double", "double"]).unwrap();
    unsafe {
        ctx.bind_outbound("second", &["point"], "sint32", triple_sum as usize, None).unwrap();
    }

    let first = ctx.callout("first").unwrap();
    let second = ctx.callout("second").unwrap();
    assert!(!first.cif().ptr_eq(second.cif()));
    assert_eq!(second.cif().atypes()[0].size(), ctx.size_of("point").unwrap());
    assert_eq!(ctx.signature_keys(), vec!["sint32(point)".to_string()]);

    let err = ctx.call("second", &[Value::bytes(vec![0u8; 8])]).unwrap_err();
    assert!(matches!(err, FfiError::SizeMismatch { expected: 24, got: 8, .. }));
    let sum = ctx.call("second", &[Value::bytes(triple_bytes(1.0, 2.0, 4.0))]).unwrap();
    assert_eq!(sum, Value::Int(7));

    // The earlier binding keeps the layout it was bound with
    let mut pair = 9i32.to_ne_bytes().to_vec();
    pair.extend_from_slice(&1i32.to_ne_bytes());
    assert_eq!(ctx.call("first", &[Value::bytes(pair)]).unwrap(), Value::Int(9));

    ctx.unbind_outbound("first").unwrap();
    assert_eq!(ctx.signatures().get("sint32(point)").unwrap().refcount(), 1);
}
