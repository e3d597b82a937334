// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Exercises the handshake's constant-time compare: it must take time
//! independent of the position of the first differing byte. Modeled on
//! `crates/hdds/benches/read_latency.rs` — one Criterion group, one
//! benchmark per case.

use criterion::{criterion_group, criterion_main, Criterion};
use shmif_core::segment::EXPECTED_KEY_LEN;
use shmif_core::state_machine::constant_time_eq;
use std::hint::black_box;

fn key_with_first_diff_at(position: usize) -> [u8; EXPECTED_KEY_LEN] {
    let mut buf = [0x41u8; EXPECTED_KEY_LEN];
    if position < EXPECTED_KEY_LEN {
        buf[position] = 0x42;
    }
    buf
}

fn bench_compare(c: &mut Criterion) {
    let expected = [0x41u8; EXPECTED_KEY_LEN];
    let mut group = c.benchmark_group("constant_time_eq");

    for position in [0usize, EXPECTED_KEY_LEN / 2, EXPECTED_KEY_LEN - 1] {
        let candidate = key_with_first_diff_at(position);
        group.bench_function(format!("diff_at_{position}"), |b| {
            b.iter(|| constant_time_eq(black_box(&candidate), black_box(&expected)))
        });
    }

    group.bench_function("identical", |b| {
        b.iter(|| constant_time_eq(black_box(&expected), black_box(&expected)))
    });

    group.finish();
}

criterion_group!(benches, bench_compare);
criterion_main!(benches);
