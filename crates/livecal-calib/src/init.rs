//! Closed-form starting points for the nonlinear solve.

use livecal_core::{ImageSize, Intrinsics};
use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector3};

/// Focal lengths from plane -> pixel homographies, assuming zero skew and the
/// principal point at the image centre.
///
/// Each view contributes two linear constraints on `(1/fx², 1/fy²)`: the
/// first two rotation columns are orthogonal, and so are their sum and
/// difference (equal norms).
pub fn init_pinhole_intrinsics(homographies: &[Matrix3<f64>], size: ImageSize) -> Option<Intrinsics> {
    if homographies.is_empty() {
        return None;
    }
    let cx = (size.width as f64 - 1.0) * 0.5;
    let cy = (size.height as f64 - 1.0) * 0.5;
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);

    let n = homographies.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 2);
    let mut b = DVector::<f64>::zeros(2 * n);
    for (i, h) in homographies.iter().enumerate() {
        let h = shift * h;
        let h1 = h.column(0).into_owned();
        let h2 = h.column(1).into_owned();
        let d1 = (h1 + h2) * 0.5;
        let d2 = (h1 - h2) * 0.5;
        let (h1, h2, d1, d2) = (
            h1.try_normalize(1e-15)?,
            h2.try_normalize(1e-15)?,
            d1.try_normalize(1e-15)?,
            d2.try_normalize(1e-15)?,
        );

        a[(2 * i, 0)] = h1.x * h2.x;
        a[(2 * i, 1)] = h1.y * h2.y;
        b[2 * i] = -h1.z * h2.z;
        a[(2 * i + 1, 0)] = d1.x * d2.x;
        a[(2 * i + 1, 1)] = d1.y * d2.y;
        b[2 * i + 1] = -d1.z * d2.z;
    }

    let f = a.svd(true, true).solve(&b, 1e-12).ok()?;
    let fx = (1.0 / f[0]).abs().sqrt();
    let fy = (1.0 / f[1]).abs().sqrt();
    if !fx.is_finite() || !fy.is_finite() || fx <= 0.0 || fy <= 0.0 {
        return None;
    }
    Some(Intrinsics {
        fx,
        fy,
        cx,
        cy,
        skew: 0.0,
    })
}

/// Equidistant starting guess: the image diagonal spans roughly 180 degrees.
pub fn init_fisheye_intrinsics(size: ImageSize) -> Intrinsics {
    let f = size.width.max(size.height) as f64 / std::f64::consts::PI;
    Intrinsics {
        fx: f,
        fy: f,
        cx: (size.width as f64 - 1.0) * 0.5,
        cy: (size.height as f64 - 1.0) * 0.5,
        skew: 0.0,
    }
}

/// Board pose from a homography mapping board `(X, Y, 1)` to normalized
/// image coordinates. Returns `(rvec, t)` with the board in front of the
/// camera.
pub fn pose_from_homography(h: &Matrix3<f64>) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = 0.5 * (h1.norm() + h2.norm());
    if !norm.is_finite() || norm < 1e-15 {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let t = h3 * lambda;

    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = approx.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }

    let rvec = Rotation3::from_matrix_unchecked(r).scaled_axis();
    if !rvec.iter().chain(t.iter()).all(|v| v.is_finite()) {
        return None;
    }
    Some((rvec, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use livecal_core::{estimate_homography, ChessboardPattern};
    use nalgebra::{Point2, Point3};

    fn project(k: &Intrinsics, r: &Rotation3<f64>, t: &Vector3<f64>, p: &Point3<f64>) -> Point2<f64> {
        let pc = r * p.coords + t;
        k.to_pixel(pc.x / pc.z, pc.y / pc.z)
    }

    #[test]
    fn recovers_focal_from_tilted_views() {
        let size = ImageSize::new(1280, 720);
        let k = Intrinsics {
            fx: 900.0,
            fy: 900.0,
            cx: 639.5,
            cy: 359.5,
            skew: 0.0,
        };
        let obj = ChessboardPattern::new(5, 7, 25.0).object_points();
        let plane: Vec<Point2<f64>> = obj.iter().map(|p| Point2::new(p.x, p.y)).collect();

        let hs: Vec<Matrix3<f64>> = [(0.3, 0.1), (-0.25, 0.2), (0.1, -0.35)]
            .iter()
            .map(|&(rx, ry)| {
                let r = Rotation3::new(Vector3::new(rx, ry, 0.05));
                let t = Vector3::new(60.0, 40.0, 600.0);
                let img: Vec<Point2<f64>> = obj.iter().map(|p| project(&k, &r, &t, p)).collect();
                estimate_homography(&plane, &img).expect("homography").h
            })
            .collect();

        let est = init_pinhole_intrinsics(&hs, size).expect("init");
        assert_abs_diff_eq!(est.fx, 900.0, epsilon = 1.0);
        assert_abs_diff_eq!(est.fy, 900.0, epsilon = 1.0);
    }

    #[test]
    fn pose_round_trip() {
        let r = Rotation3::new(Vector3::new(0.2, -0.3, 0.1));
        let t = Vector3::new(-30.0, 10.0, 500.0);
        let m = r.matrix();
        let h = Matrix3::from_columns(&[m.column(0).into_owned(), m.column(1).into_owned(), t]) * -2.0;
        let (rvec, tt) = pose_from_homography(&h).expect("pose");
        assert_abs_diff_eq!(rvec, r.scaled_axis(), epsilon = 1e-9);
        assert_abs_diff_eq!(tt, t, epsilon = 1e-9);
    }

    #[test]
    fn fisheye_guess_is_centered() {
        let k = init_fisheye_intrinsics(ImageSize::new(640, 480));
        assert_abs_diff_eq!(k.fx, 640.0 / std::f64::consts::PI);
        assert_abs_diff_eq!(k.cx, 319.5);
    }
}
