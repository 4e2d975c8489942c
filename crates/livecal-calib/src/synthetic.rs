//! Synthetic chessboard observations for tests and benchmarks.

use livecal_core::{Distortion, ImageSize, Intrinsics, RationalDistortion};
use nalgebra::{Point2, Point3, Rotation3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Ground-truth camera used to render observations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyntheticRig {
    pub size: ImageSize,
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
}

impl SyntheticRig {
    /// 1280x720 pinhole camera, `fx = fy = 900`, centred principal point and
    /// no distortion.
    pub fn hd_pinhole() -> Self {
        Self {
            size: ImageSize::new(1280, 720),
            intrinsics: Intrinsics {
                fx: 900.0,
                fy: 900.0,
                cx: 640.0,
                cy: 360.0,
                skew: 0.0,
            },
            distortion: Distortion::Pinhole(RationalDistortion::default()),
        }
    }

    /// Pixel position of a camera-frame point, `None` behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= f64::EPSILON {
            return None;
        }
        let d = self
            .distortion
            .distort(Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z));
        Some(self.intrinsics.to_pixel(d.x, d.y))
    }
}

/// Board pose for view `i` of `n`: tilted around a circle of directions and
/// pushed further away with each view.
pub fn synthetic_pose(i: usize, n: usize, board_center: &Point3<f64>) -> (Rotation3<f64>, Vector3<f64>) {
    let phase = 0.3 + std::f64::consts::TAU * i as f64 / n.max(1) as f64;
    let rot = Rotation3::new(Vector3::new(
        0.3 * phase.cos(),
        0.3 * phase.sin(),
        0.05 * (i % 3) as f64 - 0.05,
    ));
    let offset = Vector3::new(
        20.0 * (i % 3) as f64 - 20.0,
        15.0 * (i % 2) as f64 - 7.5,
        550.0 + 30.0 * i as f64,
    );
    (rot, offset - rot * board_center.coords)
}

/// Render `n_views` observations of `object_points` through `rig`.
///
/// The board centre is placed near the optical axis in every view. Pixel
/// noise with standard deviation `noise_sigma` is drawn from a generator
/// seeded with `seed`, so the output is reproducible. Points that would fall
/// behind the camera are skipped, which only happens for degenerate rigs.
pub fn synthetic_views(
    rig: &SyntheticRig,
    object_points: &[Point3<f64>],
    n_views: usize,
    noise_sigma: f64,
    seed: u64,
) -> Vec<Vec<Point2<f64>>> {
    let center = board_center(object_points);
    let noise = (noise_sigma > 0.0)
        .then(|| Normal::new(0.0, noise_sigma).ok())
        .flatten();
    let mut rng = StdRng::seed_from_u64(seed);

    (0..n_views)
        .map(|i| {
            let (rot, t) = synthetic_pose(i, n_views, &center);
            object_points
                .iter()
                .filter_map(|p| rig.project(&(rot * p.coords + t)))
                .map(|px| match &noise {
                    Some(n) => Point2::new(px.x + n.sample(&mut rng), px.y + n.sample(&mut rng)),
                    None => px,
                })
                .collect()
        })
        .collect()
}

fn board_center(points: &[Point3<f64>]) -> Point3<f64> {
    if points.is_empty() {
        return Point3::origin();
    }
    let sum = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Point3::from(sum / points.len() as f64)
}
