use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use livecal_calib::RectificationMapBuilder;
use livecal_core::{CameraModel, CameraVariant, Frame, ImageSize, Intrinsics, PixelFormat};

fn model(width: usize, height: usize, variant: CameraVariant) -> CameraModel {
    let size = ImageSize::new(width, height);
    let k = Intrinsics {
        fx: width as f64 * 0.7,
        fy: width as f64 * 0.7,
        cx: width as f64 / 2.0,
        cy: height as f64 / 2.0,
        skew: 0.0,
    };
    let coeffs: &[f64] = match variant {
        CameraVariant::Pinhole => &[-0.2, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        CameraVariant::Fisheye => &[0.03, -0.01, 0.0, 0.0],
    };
    CameraModel::from_parts(size, variant, k, coeffs, 0.5).unwrap()
}

fn bench_build_tables(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_tables");
    for (width, height) in [(640, 480), (1280, 720)] {
        for variant in [CameraVariant::Pinhole, CameraVariant::Fisheye] {
            let id = format!("{variant:?}/{width}x{height}");
            let m = model(width, height, variant);
            group.bench_with_input(BenchmarkId::new("build", &id), &m, |b, m| {
                b.iter(|| RectificationMapBuilder::build(black_box(m)).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_remap(c: &mut Criterion) {
    let mut group = c.benchmark_group("remap");
    for (width, height) in [(640, 480), (1280, 720)] {
        let tables = RectificationMapBuilder::build(&model(width, height, CameraVariant::Pinhole)).unwrap();
        let frame = Frame::zeros(width, height, PixelFormat::Rgb8);
        let id = format!("{width}x{height}");
        group.bench_with_input(BenchmarkId::new("rgb8", &id), &frame, |b, f| {
            b.iter(|| tables.remap(black_box(f)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build_tables, bench_remap);
criterion_main!(benches);
