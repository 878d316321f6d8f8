//! Correlator scan benchmark: full rings, worst-case pairing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tof_correlator::{Correlator, TofChannel, TofSample, RING_CAPACITY};

fn bench_correlate(c: &mut Criterion) {
    c.bench_function("correlate_full_rings", |b| {
        let trigger_tag = 4242u16;
        b.iter(|| {
            let a = TofChannel::new();
            let ch_b = TofChannel::new();
            for i in 0..RING_CAPACITY as u16 {
                a.capture(TofSample::new(1000 + i, i * 7, trigger_tag).raw, trigger_tag);
                ch_b.capture(TofSample::new(1000 + i, i * 11, trigger_tag).raw, trigger_tag);
            }
            let correlator = Correlator::default();
            black_box(correlator.correlate(&a, &ch_b, black_box(trigger_tag)))
        })
    });
}

criterion_group!(benches, bench_correlate);
criterion_main!(benches);
