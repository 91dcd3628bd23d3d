use ffidyn::{ErrorKind, FfiConfig, FfiContext, FfiError, Session, Value};
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C)]
struct Point {
    x: i32,
    y: i32,
}

extern "C" fn point_sum(p: *const Point, _copy: Point) -> i32 {
    unsafe { (*p).x + (*p).y }
}

static CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn counted(pt: Point) -> i32 {
    CALLS.fetch_add(1, Ordering::SeqCst);
    pt.x
}

fn point_bytes(x: i32, y: i32) -> Vec<u8> {
    let mut bytes = x.to_ne_bytes().to_vec();
    bytes.extend_from_slice(&y.to_ne_bytes());
    bytes
}

#[test]
fn test_point_scenario() {
    let ctx = FfiContext::new(Session::new());
    ctx.define_type("point", &["sint32", "sint32"]).unwrap();
    assert_eq!(ctx.size_of("point").unwrap(), 8);
    assert_eq!(ctx.align_of("point").unwrap(), 4);

    unsafe {
        ctx.bind_outbound("psum", &["pointer", "point"], "sint32", point_sum as usize, None)
            .unwrap();
    }
    let native = Point { x: 3, y: 4 };
    let p = Value::Pointer(&native as *const Point as usize);
    let result = ctx.call("psum", &[p, Value::bytes(point_bytes(3, 4))]).unwrap();
    assert_eq!(result, Value::Int(7));
}

#[test]
fn test_add_callback_scenario() {
    let session = Session::new();
    let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = std::sync::Arc::clone(&seen);
    session.register("add", move |args| {
        record.lock().push(args.to_vec());
        Ok(Value::Int(args[0].as_int()? + args[1].as_int()?))
    });
    let ctx = FfiContext::new(session.clone());

    let entry = ctx.bind_inbound("add", &["sint32", "sint32"], "sint32", None, None).unwrap();
    let native: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
    assert_eq!(native(5, 9), 14);
    assert_eq!(*seen.lock(), vec![vec![Value::Int(5), Value::Int(9)]]);
    assert!(session.background_errors().is_empty());
}

#[test]
fn test_struct_size_enforced_without_native_call() {
    let ctx = FfiContext::new(Session::new());
    ctx.define_type("point", &["sint32", "sint32"]).unwrap();
    unsafe {
        ctx.bind_outbound("counted", &["point"], "sint32", counted as usize, None).unwrap();
    }

    for len in [0usize, 4, 7, 9, 16] {
        let err = ctx.call("counted", &[Value::bytes(vec![1u8; len])]).unwrap_err();
        assert!(matches!(err, FfiError::SizeMismatch { expected: 8, got, .. } if got == len));
        assert_eq!(err.kind(), ErrorKind::Marshal);
    }
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);

    assert_eq!(ctx.call("counted", &[Value::bytes(point_bytes(5, 0))]).unwrap(), Value::Int(5));
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_inbound_isolation() {
    let session = Session::new();
    session.register("fails", |_| Err("deliberate failure".into()));
    let ctx = FfiContext::new(session.clone());

    let entry = ctx.bind_inbound("fails", &["sint32", "sint32"], "sint32", None, None).unwrap();
    let native: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
    assert_eq!(native(5, 9), 0);

    let errors = session.background_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), ErrorKind::Dispatch);
    assert!(errors[0].to_string().contains("deliberate failure"));
    assert!(session.background_errors().is_empty());
}

#[test]
fn test_context_from_config() {
    let config = FfiConfig::from_toml_str(
        r#"
        [[typedef]]
        name = "point"
        elements = ["sint32", "sint32"]

        [[typedef]]
        name = "segment"
        elements = ["point", "point"]
        "#,
    )
    .unwrap();
    let ctx = FfiContext::from_config(Session::new(), &config).unwrap();
    assert_eq!(ctx.size_of("segment").unwrap(), 16);
    assert!(ctx.typedefs().contains(&"segment".to_string()));

    let bad = FfiConfig::from_toml_str(
        r#"
        [[typedef]]
        name = "broken"
        elements = ["sint32", "missing"]
        "#,
    )
    .unwrap();
    assert!(matches!(
        FfiContext::from_config(Session::new(), &bad),
        Err(FfiError::UnknownType { .. })
    ));
}
