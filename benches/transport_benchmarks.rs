//! Benchmarks for the per-commit transport work: accumulating damage and
//! copying damaged rectangles between mappings.

use carafe::geometry::Rect;
use carafe::transport::damage::Region;
use carafe::transport::mmap::AccessSync;
use carafe::transport::Mmap;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::os::fd::OwnedFd;

fn mapping(width: usize, height: usize) -> Mmap {
    let size = width * height * 4;
    let file = tempfile::tempfile().expect("tempfile");
    file.set_len(size as u64).expect("set_len");
    Mmap::new(OwnedFd::from(file), size, 0, width * 4, 4, AccessSync::None).expect("mmap")
}

/// Damage rectangles scattered like a typing cursor and a scrolling view
fn damage_pattern(count: i32) -> Vec<Rect> {
    (0..count)
        .map(|i| Rect::new((i * 37) % 1800, (i * 53) % 1000, 8 + i % 64, 16 + i % 32))
        .collect()
}

fn bench_damage_accumulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("damage_accumulation");

    for count in [4, 32, 256] {
        let rects = damage_pattern(count);
        group.bench_function(format!("{}_rects", count), |b| {
            b.iter_batched(
                Region::new,
                |mut region| {
                    for rect in &rects {
                        region.add(*rect);
                    }
                    black_box(region.area())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.bench_function("full_after_partial", |b| {
        let rects = damage_pattern(64);
        b.iter(|| {
            let mut region = Region::new();
            for rect in &rects {
                region.add(*rect);
            }
            region.union_with(&Region::full());
            black_box(region.rects().len())
        });
    });

    group.finish();
}

fn bench_rect_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("rect_copy");
    let (width, height) = (1920, 1080);
    let src = mapping(width, height);
    let dst = mapping(width, height);
    let layout = src.layout();

    for (name, rect) in [
        ("cursor_16x32", Rect::new(100, 100, 16, 32)),
        ("quarter_960x540", Rect::new(0, 0, 960, 540)),
        ("full_1920x1080", Rect::new(0, 0, 1920, 1080)),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| dst.copy_rect_from(&src, &layout, &layout, black_box(&rect)));
        });
    }

    group.bench_function("clipped_damage", |b| {
        let mut region = Region::new();
        for rect in damage_pattern(32) {
            region.add(rect);
        }
        let bounds = Rect::new(0, 0, width as i32, height as i32);
        b.iter(|| {
            for rect in region.clipped(&bounds) {
                dst.copy_rect_from(&src, &layout, &layout, &rect);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_damage_accumulation, bench_rect_copy);
criterion_main!(benches);
