//! Lens distortion models acting on normalized image coordinates.
//!
//! Both models map an ideal (pinhole) normalized point `(x, y) = (X/Z, Y/Z)`
//! to its distorted counterpart, and provide the iterative inverse used when
//! undistorting observations or building rectification tables.

use serde::{Deserialize, Serialize};

/// Iterations used by the fixed-point inverse of the rational model.
const RATIONAL_UNDISTORT_ITERS: usize = 20;
/// Newton iterations used by the fisheye inverse.
const FISHEYE_UNDISTORT_ITERS: usize = 20;
const FISHEYE_EPS: f64 = 1e-10;

/// Rational radial + tangential distortion (8 coefficients).
///
/// Coefficient order follows the usual `(k1, k2, p1, p2, k3, k4, k5, k6)`
/// layout. With `k4..k6 = 0` this reduces to the 5-parameter
/// Brown-Conrady model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RationalDistortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub k4: f64,
    pub k5: f64,
    pub k6: f64,
}

impl RationalDistortion {
    pub const LEN: usize = 8;

    /// Build from a coefficient slice, zero-padding missing trailing terms.
    pub fn from_slice(coeffs: &[f64]) -> Self {
        let mut c = [0.0; Self::LEN];
        for (dst, src) in c.iter_mut().zip(coeffs.iter()) {
            *dst = *src;
        }
        Self::from_array(c)
    }

    pub fn from_array(c: [f64; Self::LEN]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
            k4: c[5],
            k5: c[6],
            k6: c[7],
        }
    }

    pub fn to_array(&self) -> [f64; Self::LEN] {
        [
            self.k1, self.k2, self.p1, self.p2, self.k3, self.k4, self.k5, self.k6,
        ]
    }

    /// Apply distortion to an ideal normalized point.
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let num = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let den = 1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6;
        let radial = if den.abs() > f64::EPSILON { num / den } else { num };
        let xy = x * y;
        let xd = x * radial + 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
        (xd, yd)
    }

    /// Invert [`distort`](Self::distort) by fixed-point iteration.
    pub fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..RATIONAL_UNDISTORT_ITERS {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let num = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
            let den = 1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6;
            if num.abs() < f64::EPSILON {
                break;
            }
            let icdist = den / num;
            let xy = x * y;
            let dx = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
            let nx = (xd - dx) * icdist;
            let ny = (yd - dy) * icdist;
            let step = (nx - x).abs() + (ny - y).abs();
            x = nx;
            y = ny;
            if step < 1e-14 {
                break;
            }
        }
        (x, y)
    }
}

/// Equidistant fisheye (Kannala-Brandt) distortion with four radial terms.
///
/// `theta_d = theta * (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)`
/// where `theta` is the angle between the ray and the optical axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FisheyeDistortion {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
}

impl FisheyeDistortion {
    pub const LEN: usize = 4;

    pub fn from_slice(coeffs: &[f64]) -> Self {
        let mut c = [0.0; Self::LEN];
        for (dst, src) in c.iter_mut().zip(coeffs.iter()) {
            *dst = *src;
        }
        Self::from_array(c)
    }

    pub fn from_array(c: [f64; Self::LEN]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            k3: c[2],
            k4: c[3],
        }
    }

    pub fn to_array(&self) -> [f64; Self::LEN] {
        [self.k1, self.k2, self.k3, self.k4]
    }

    #[inline]
    fn theta_d(&self, theta: f64) -> f64 {
        let t2 = theta * theta;
        let t4 = t2 * t2;
        let t6 = t4 * t2;
        let t8 = t4 * t4;
        theta * (1.0 + self.k1 * t2 + self.k2 * t4 + self.k3 * t6 + self.k4 * t8)
    }

    /// Apply distortion to a point on the `z = 1` plane.
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r = (x * x + y * y).sqrt();
        if r < FISHEYE_EPS {
            return (x, y);
        }
        let theta = r.atan();
        let scale = self.theta_d(theta) / r;
        (x * scale, y * scale)
    }

    /// Invert [`distort`](Self::distort) with Newton iterations on `theta`.
    ///
    /// Returns `None` when the distorted radius cannot be reached by a ray in
    /// front of the camera.
    pub fn undistort(&self, xd: f64, yd: f64) -> Option<(f64, f64)> {
        let theta_d = (xd * xd + yd * yd).sqrt();
        if theta_d < FISHEYE_EPS {
            return Some((xd, yd));
        }
        let theta_d = theta_d.min(std::f64::consts::FRAC_PI_2);

        let mut theta = theta_d;
        let mut converged = false;
        for _ in 0..FISHEYE_UNDISTORT_ITERS {
            let t2 = theta * theta;
            let t4 = t2 * t2;
            let t6 = t4 * t2;
            let t8 = t6 * t2;
            let k0_theta2 = self.k1 * t2;
            let k1_theta4 = self.k2 * t4;
            let k2_theta6 = self.k3 * t6;
            let k3_theta8 = self.k4 * t8;
            let fix = (theta * (1.0 + k0_theta2 + k1_theta4 + k2_theta6 + k3_theta8) - theta_d)
                / (1.0 + 3.0 * k0_theta2 + 5.0 * k1_theta4 + 7.0 * k2_theta6 + 9.0 * k3_theta8);
            theta -= fix;
            if fix.abs() < FISHEYE_EPS {
                converged = true;
                break;
            }
        }

        if !converged || !theta.is_finite() || theta < 0.0 || theta >= std::f64::consts::FRAC_PI_2 {
            return None;
        }

        let scale = theta.tan() / theta_d;
        Some((xd * scale, yd * scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn strong_rational() -> RationalDistortion {
        RationalDistortion::from_array([-0.28, 0.09, 0.001, -0.0005, -0.01, 0.02, 0.0, 0.0])
    }

    #[test]
    fn rational_round_trip_inside_field_of_view() {
        let d = strong_rational();
        for &(x, y) in &[(0.0, 0.0), (0.3, -0.2), (-0.5, 0.4), (0.6, 0.1)] {
            let (xd, yd) = d.distort(x, y);
            let (xu, yu) = d.undistort(xd, yd);
            assert_abs_diff_eq!(xu, x, epsilon = 1e-6);
            assert_abs_diff_eq!(yu, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_rational_is_identity() {
        let d = RationalDistortion::default();
        assert_eq!(d.distort(0.42, -0.17), (0.42, -0.17));
    }

    #[test]
    fn from_slice_pads_missing_terms() {
        let d = RationalDistortion::from_slice(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(d.to_array(), [0.1, 0.2, 0.3, 0.4, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn fisheye_round_trip() {
        let d = FisheyeDistortion::from_array([0.05, -0.01, 0.002, -0.0003]);
        for &(x, y) in &[(0.01, 0.0), (0.5, 0.5), (-1.2, 0.7), (2.0, -1.5)] {
            let (xd, yd) = d.distort(x, y);
            let (xu, yu) = d.undistort(xd, yd).expect("invertible");
            assert_abs_diff_eq!(xu, x, epsilon = 1e-6);
            assert_abs_diff_eq!(yu, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn fisheye_compresses_wide_angles() {
        let d = FisheyeDistortion::default();
        let (xd, _) = d.distort(3.0, 0.0);
        // theta = atan(3) is below 3, so the equidistant model pulls the point in.
        assert!(xd < 3.0);
        assert_abs_diff_eq!(xd, 3.0_f64.atan(), epsilon = 1e-12);
    }
}
