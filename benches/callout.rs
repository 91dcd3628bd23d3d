//! Call-path benchmarks
//!
//! Measures repeated outbound invocation, inbound round trips and
//! signature-cache hits.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ffidyn::interop::{SignatureCache, TypeRegistry};
use ffidyn::{FfiContext, Session, Value};

extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn sum_i64(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64, h: i64) -> i64 {
    a + b + c + d + e + f + g + h
}

extern "C" fn apply(f: extern "C" fn(i32, i32) -> i32, a: i32, b: i32) -> i32 {
    f(a, b)
}

fn bench_outbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbound");
    let ctx = FfiContext::new(Session::new());
    unsafe {
        ctx.bind_outbound("add", &["sint32", "sint32"], "sint32", add_i32 as usize, None).unwrap();
        ctx.bind_outbound("sum8", &["sint64"; 8], "sint64", sum_i64 as usize, None).unwrap();
    }

    let pair = [Value::Int(20), Value::Int(22)];
    group.bench_function("add_i32", |b| {
        b.iter(|| ctx.call("add", black_box(&pair)).unwrap());
    });

    let textual = [Value::from("20"), Value::from("22")];
    group.bench_function("add_i32_text_args", |b| {
        b.iter(|| ctx.call("add", black_box(&textual)).unwrap());
    });

    let eight: Vec<Value> = (1..=8).map(Value::Int).collect();
    group.bench_function("sum_eight_i64", |b| {
        b.iter(|| ctx.call("sum8", black_box(&eight)).unwrap());
    });

    let callout = ctx.callout("add").unwrap();
    group.bench_function("add_i32_direct", |b| {
        b.iter(|| callout.invoke(black_box(&pair), &ffidyn::interop::Detached).unwrap());
    });

    group.finish();
}

fn bench_inbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("inbound");
    let session = Session::new();
    session.register("add", |args| Ok(Value::Int(args[0].as_int()? + args[1].as_int()?)));
    let ctx = FfiContext::new(session);
    ctx.bind_inbound("add", &["sint32", "sint32"], "sint32", None, None).unwrap();
    unsafe {
        ctx.bind_outbound(
            "apply",
            &["pointer-proc", "sint32", "sint32"],
            "sint32",
            apply as usize,
            None,
        )
        .unwrap();
    }

    let args = [Value::from("add"), Value::Int(5), Value::Int(9)];
    group.bench_function("round_trip", |b| {
        b.iter(|| ctx.call("apply", black_box(&args)).unwrap());
    });
    group.finish();
}

fn bench_signature_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_cache");
    let reg = TypeRegistry::default();

    for argc in [0usize, 4, 16].iter() {
        let cache = SignatureCache::new();
        let args = vec!["double"; *argc];
        let _held = cache.resolve(&reg, &args, "double", None).unwrap();

        group.bench_with_input(BenchmarkId::new("warm_hit", argc), argc, |b, _| {
            b.iter(|| cache.resolve(&reg, black_box(&args), "double", None).unwrap());
        });
    }

    group.bench_function("cold_miss", |b| {
        let cache = SignatureCache::new();
        b.iter(|| cache.resolve(&reg, black_box(&["sint32", "pointer"]), "void", None).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_outbound, bench_inbound, bench_signature_cache);
criterion_main!(benches);
