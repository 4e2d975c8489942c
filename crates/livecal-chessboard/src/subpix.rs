//! Gradient-orthogonality sub-pixel corner refinement.
//!
//! For a saddle point `q`, every image gradient `g(p)` in a neighborhood is
//! orthogonal to `p - q`. Summing `g gᵀ (p - q) = 0` over a Gaussian-weighted
//! window yields a 2x2 linear system for `q`, iterated until the update is
//! below `epsilon`.

use crate::params::SubpixParams;
use livecal_core::{sample_bilinear, GrayImageView};
use nalgebra::Point2;

/// Refine one corner; falls back to `start` if the estimate leaves the window.
pub fn refine_corner(img: &GrayImageView<'_>, start: Point2<f64>, params: &SubpixParams) -> Point2<f64> {
    let hw = params.half_window as i64;
    if hw == 0 {
        return start;
    }
    let inv_hw2 = 1.0 / (hw * hw) as f64;
    let eps2 = params.epsilon * params.epsilon;

    let mut q = start;
    for _ in 0..params.max_iterations.max(1) {
        let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
        let (mut bb1, mut bb2) = (0.0, 0.0);

        for dy in -hw..=hw {
            let wy = (-(dy * dy) as f64 * inv_hw2).exp();
            for dx in -hw..=hw {
                let w = wy * (-(dx * dx) as f64 * inv_hw2).exp();
                let px = q.x + dx as f64;
                let py = q.y + dy as f64;
                let gx = 0.5 * (sample_bilinear(img, px + 1.0, py) - sample_bilinear(img, px - 1.0, py));
                let gy = 0.5 * (sample_bilinear(img, px, py + 1.0) - sample_bilinear(img, px, py - 1.0));

                let gxx = gx * gx * w;
                let gxy = gx * gy * w;
                let gyy = gy * gy * w;
                let (ox, oy) = (dx as f64, dy as f64);

                a += gxx;
                b += gxy;
                c += gyy;
                bb1 += gxx * ox + gxy * oy;
                bb2 += gxy * ox + gyy * oy;
            }
        }

        let det = a * c - b * b;
        if det.abs() <= f64::EPSILON * (a * c).abs().max(1.0) {
            break;
        }
        let step_x = (c * bb1 - b * bb2) / det;
        let step_y = (a * bb2 - b * bb1) / det;
        q = Point2::new(q.x + step_x, q.y + step_y);
        if step_x * step_x + step_y * step_y < eps2 {
            break;
        }
    }

    let hwf = params.half_window as f64;
    if !q.x.is_finite()
        || !q.y.is_finite()
        || (q.x - start.x).abs() > hwf
        || (q.y - start.y).abs() > hwf
    {
        return start;
    }
    q
}

pub fn refine_corners(
    img: &GrayImageView<'_>,
    corners: &[Point2<f64>],
    params: &SubpixParams,
) -> Vec<Point2<f64>> {
    corners
        .iter()
        .map(|&p| refine_corner(img, p, params))
        .collect()
}
