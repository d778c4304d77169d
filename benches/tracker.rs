//! Dirty-region tracker benchmarks
//!
//! Measures block comparison and merge across common frame sizes using
//! criterion.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use station_capture::{DirtyRegionTracker, TrackerOptions};

fn frame(width: u32, height: u32, value: u8) -> Vec<u8> {
    vec![value; (width * height * 4) as usize]
}

fn bench_unchanged_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_unchanged");

    let sizes = [
        ("720p", 1280u32, 720u32),
        ("1080p", 1920, 1080),
        ("1440p", 2560, 1440),
    ];

    for (name, width, height) in sizes {
        group.throughput(Throughput::Elements(width as u64 * height as u64));
        group.bench_with_input(BenchmarkId::new("identical", name), &(width, height), |b, &(w, h)| {
            let mut tracker = DirtyRegionTracker::new(0, TrackerOptions::default());
            let current = frame(w, h, 0);
            tracker.track(&current, w, h, (w * 4) as usize);

            b.iter(|| {
                let regions = tracker.track(&current, w, h, (w * 4) as usize);
                criterion::black_box(regions);
            })
        });
    }

    group.finish();
}

fn bench_scattered_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_scattered");

    group.bench_function("1080p_cursor_sized_change", |b| {
        let mut tracker = DirtyRegionTracker::new(0, TrackerOptions::default());
        let base = frame(1920, 1080, 0);
        tracker.track(&base, 1920, 1080, 1920 * 4);

        let mut changed = base.clone();
        for row in 500..532usize {
            for col in 900..932usize {
                let off = (row * 1920 + col) * 4;
                changed[off..off + 4].copy_from_slice(&[255, 255, 255, 255]);
            }
        }

        let frames = [base, changed];
        let mut flip = 0usize;
        b.iter(|| {
            flip ^= 1;
            let regions = tracker.track(&frames[flip], 1920, 1080, 1920 * 4);
            criterion::black_box(regions);
        })
    });

    group.bench_function("1080p_full_repaint", |b| {
        let mut tracker = DirtyRegionTracker::new(0, TrackerOptions::default());
        let dark = frame(1920, 1080, 0);
        let light = frame(1920, 1080, 255);
        tracker.track(&dark, 1920, 1080, 1920 * 4);

        let frames = [dark, light];
        let mut flip = 0usize;
        b.iter(|| {
            flip ^= 1;
            let regions = tracker.track(&frames[flip], 1920, 1080, 1920 * 4);
            criterion::black_box(regions);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_unchanged_frames, bench_scattered_changes);
criterion_main!(benches);
