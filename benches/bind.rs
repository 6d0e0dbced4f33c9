//! Microbenchmarks for the per-bind and per-call hot paths

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use swiftcall::abi::{classify, flatten};
use swiftcall::marshal::{buffer_from_words, words_from_bytes};
use swiftcall::trampoline::emit_stub;
use swiftcall::types::{Layout, SwiftType};

fn bench_classify(c: &mut Criterion) {
    let types = [
        SwiftType::primitive("Int64", 8),
        SwiftType::class("NSObject"),
        SwiftType::aggregate(
            "Pair",
            Layout {
                stride: 16,
                alignment: 8,
                trivially_movable: true,
            },
        ),
        SwiftType::aggregate(
            "Big",
            Layout {
                stride: 40,
                alignment: 8,
                trivially_movable: false,
            },
        ),
    ];

    c.bench_function("classify_and_flatten", |b| {
        b.iter(|| {
            for ty in &types {
                black_box(classify(black_box(ty)));
                black_box(flatten(black_box(ty)));
            }
        })
    });
}

fn bench_marshal(c: &mut Criterion) {
    let bytes: Vec<u8> = (0u8..32).collect();

    c.bench_function("marshal_round_trip_32b", |b| {
        b.iter(|| {
            let words = words_from_bytes(black_box(&bytes));
            black_box(buffer_from_words(&words, bytes.len()))
        })
    });
}

fn bench_emit(c: &mut Criterion) {
    c.bench_function("emit_full_stub", |b| {
        b.iter(|| {
            black_box(emit_stub(
                black_box(0x1234_5678_9ABC),
                Some(0x1111_2222_3333_4444),
                Some(0x5555_6666_7777_8888),
                true,
            ))
        })
    });
}

criterion_group!(benches, bench_classify, bench_marshal, bench_emit);
criterion_main!(benches);
