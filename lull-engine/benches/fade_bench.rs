//! Fade curve evaluation throughput.
//!
//! Curve math runs on every fade step of every volume ramp; it should be
//! negligible next to the mixer work it drives.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lull_common::FadeCurve;

fn bench_fade_curves(c: &mut Criterion) {
    let mut group = c.benchmark_group("fade_curves");

    let curves = vec![
        ("linear", FadeCurve::Linear),
        ("ease_power", FadeCurve::EasePower),
        ("ease_in", FadeCurve::EaseIn),
        ("ease_out", FadeCurve::EaseOut),
        ("equal_power", FadeCurve::EqualPower),
    ];

    // 10 seconds of per-sample gains at 44.1 kHz
    let sample_count = 441_000usize;

    for (name, curve) in curves {
        group.bench_function(BenchmarkId::new("fade_in", name), |b| {
            b.iter(|| {
                for i in 0..sample_count {
                    let progress = i as f32 / sample_count as f32;
                    black_box(curve.fade_in(progress));
                }
            });
        });

        group.bench_function(BenchmarkId::new("fade_out", name), |b| {
            b.iter(|| {
                for i in 0..sample_count {
                    let progress = i as f32 / sample_count as f32;
                    black_box(curve.fade_out(progress));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fade_curves);
criterion_main!(benches);
