use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_corners::{
    fast::{FastDetector, KeypointDetector},
    image::{Geometry, GrayImage},
};

/// Checkerboard of 16-pixel squares.
fn checkerboard(width: u16, height: u16) -> GrayImage {
    let mut img = GrayImage::new(Geometry::new(height, width));
    for y in 0..height as usize {
        for x in 0..width as usize {
            if (x / 16 + y / 16) % 2 == 0 {
                img.set(x, y, 200);
            }
        }
    }
    img
}

pub fn benchmark_fast(c: &mut Criterion) {
    let mut group = c.benchmark_group("fast");
    let detectors = [
        ("fast9", FastDetector::new(9)),
        ("fast9-raw", FastDetector::new(9).with_nonmax_suppression(false)),
        ("fast12", FastDetector::new(12)),
    ];
    for dim in [(320, 240), (640, 480), (1280, 720)].iter() {
        let img = checkerboard(dim.0, dim.1);
        for (name, det) in detectors.iter() {
            group.bench_with_input(format!("{}/{}x{}", name, dim.0, dim.1), &img, |b, img| {
                b.iter(|| det.detect(img, 20))
            });
        }
    }
}

criterion_group!(benches, benchmark_fast);
criterion_main!(benches);
