//! Reprojection least-squares problem over intrinsics, distortion and
//! per-view board poses.
//!
//! Parameter layout:
//! `[fx, fy, cx, cy, d_0 .. d_{m-1}, (rx, ry, rz, tx, ty, tz) per view]`
//! where `m` is the number of free distortion coefficients. Skew is fixed at
//! zero and any distortion slots past `m` stay at zero.
//!
//! Residuals are written once, generic over [`DualNum`], and evaluated either
//! on `f64` or on forward-mode duals to get exact Jacobian columns.

use crate::lm::NllsProblem;
use livecal_core::{CameraVariant, Distortion, FisheyeDistortion, Intrinsics, RationalDistortion};
use nalgebra::{DMatrix, DVector, Point2, Point3, Vector3};
use num_dual::{Dual64, DualNum};

const INTRINSIC_LEN: usize = 4;
const POSE_LEN: usize = 6;
/// Squared rotation angle below which Rodrigues uses its first-order form.
const SMALL_ANGLE_SQ: f64 = 1e-20;
const FISHEYE_EPS: f64 = 1e-10;

pub(crate) struct ReprojectionProblem<'a> {
    pub variant: CameraVariant,
    /// Number of distortion coefficients being optimized.
    pub free_distortion: usize,
    pub object_points: &'a [Point3<f64>],
    pub views: &'a [Vec<Point2<f64>>],
}

impl<'a> ReprojectionProblem<'a> {
    fn camera_len(&self) -> usize {
        INTRINSIC_LEN + self.free_distortion
    }

    fn pose_offset(&self, view: usize) -> usize {
        self.camera_len() + POSE_LEN * view
    }

    fn view_residual_len(&self) -> usize {
        2 * self.object_points.len()
    }

    pub fn pack(
        &self,
        intrinsics: &Intrinsics,
        distortion: &[f64],
        poses: &[(Vector3<f64>, Vector3<f64>)],
    ) -> DVector<f64> {
        let mut p = DVector::zeros(self.num_params());
        p[0] = intrinsics.fx;
        p[1] = intrinsics.fy;
        p[2] = intrinsics.cx;
        p[3] = intrinsics.cy;
        for (k, d) in distortion.iter().take(self.free_distortion).enumerate() {
            p[INTRINSIC_LEN + k] = *d;
        }
        for (v, (r, t)) in poses.iter().enumerate() {
            let o = self.pose_offset(v);
            p.fixed_rows_mut::<3>(o).copy_from(r);
            p.fixed_rows_mut::<3>(o + 3).copy_from(t);
        }
        p
    }

    pub fn intrinsics(&self, p: &DVector<f64>) -> Intrinsics {
        Intrinsics {
            fx: p[0],
            fy: p[1],
            cx: p[2],
            cy: p[3],
            skew: 0.0,
        }
    }

    pub fn distortion(&self, p: &DVector<f64>) -> Distortion {
        let coeffs = &p.as_slice()[INTRINSIC_LEN..self.camera_len()];
        match self.variant {
            CameraVariant::Pinhole => Distortion::Pinhole(RationalDistortion::from_slice(coeffs)),
            CameraVariant::Fisheye => Distortion::Fisheye(FisheyeDistortion::from_slice(coeffs)),
        }
    }

    pub fn pose(&self, p: &DVector<f64>, view: usize) -> (Vector3<f64>, Vector3<f64>) {
        let o = self.pose_offset(view);
        (
            p.fixed_rows::<3>(o).into_owned(),
            p.fixed_rows::<3>(o + 3).into_owned(),
        )
    }

    /// Write `projected - observed` for one view into `out`.
    ///
    /// `camera` is `[fx, fy, cx, cy, d_0 .. d_{m-1}]`, `pose` is
    /// `[rx, ry, rz, tx, ty, tz]`.
    fn view_residuals<T: DualNum<f64> + Copy>(
        &self,
        camera: &[T],
        pose: &[T],
        observed: &[Point2<f64>],
        out: &mut [T],
    ) -> Option<()> {
        let (fx, fy, cx, cy) = (camera[0], camera[1], camera[2], camera[3]);
        let coeffs = &camera[INTRINSIC_LEN..];
        let rvec = [pose[0], pose[1], pose[2]];
        for (i, (obj, obs)) in self.object_points.iter().zip(observed).enumerate() {
            let pw = [T::from(obj.x), T::from(obj.y), T::from(obj.z)];
            let pr = rotate(rvec, pw);
            let (x, y, z) = (pr[0] + pose[3], pr[1] + pose[4], pr[2] + pose[5]);
            if z.re() <= f64::EPSILON {
                return None;
            }
            let (xd, yd) = distort(self.variant, coeffs, x / z, y / z);
            out[2 * i] = fx * xd + cx - T::from(obs.x);
            out[2 * i + 1] = fy * yd + cy - T::from(obs.y);
        }
        Some(())
    }

    fn residuals_into(&self, p: &DVector<f64>, out: &mut [f64]) -> Option<()> {
        let params = p.as_slice();
        let camera = &params[..self.camera_len()];
        let m = self.view_residual_len();
        for (v, observed) in self.views.iter().enumerate() {
            let o = self.pose_offset(v);
            let pose = &params[o..o + POSE_LEN];
            self.view_residuals(camera, pose, observed, &mut out[v * m..(v + 1) * m])?;
        }
        Some(())
    }

    /// Root-mean-square pixel distance between observed and projected corners.
    pub fn rms(&self, p: &DVector<f64>) -> Option<f64> {
        let r = self.residuals(p)?;
        let n = self.object_points.len() * self.views.len();
        if n == 0 {
            return None;
        }
        Some((r.norm_squared() / n as f64).sqrt())
    }
}

impl NllsProblem for ReprojectionProblem<'_> {
    fn num_params(&self) -> usize {
        self.camera_len() + POSE_LEN * self.views.len()
    }

    fn residuals(&self, p: &DVector<f64>) -> Option<DVector<f64>> {
        let mut out = DVector::zeros(self.view_residual_len() * self.views.len());
        self.residuals_into(p, out.as_mut_slice())?;
        Some(out)
    }

    /// Forward-mode duals, one seeded direction per local parameter of a
    /// view (camera block then that view's pose), scattered into the
    /// block-sparse global matrix.
    fn jacobian(&self, p: &DVector<f64>) -> Option<DMatrix<f64>> {
        let params = p.as_slice();
        let m = self.view_residual_len();
        let cl = self.camera_len();
        let mut jac = DMatrix::zeros(m * self.views.len(), self.num_params());

        let mut camera: Vec<Dual64> = params[..cl].iter().map(|&x| Dual64::new(x, 0.0)).collect();
        let mut out = vec![Dual64::new(0.0, 0.0); m];
        for (v, observed) in self.views.iter().enumerate() {
            let o = self.pose_offset(v);
            let mut pose: Vec<Dual64> = params[o..o + POSE_LEN]
                .iter()
                .map(|&x| Dual64::new(x, 0.0))
                .collect();

            for local in 0..cl + POSE_LEN {
                let (seed, col) = if local < cl {
                    (&mut camera[local], local)
                } else {
                    (&mut pose[local - cl], o + local - cl)
                };
                seed.eps = 1.0;
                let ok = self.view_residuals(&camera, &pose, observed, &mut out);
                if local < cl {
                    camera[local].eps = 0.0;
                } else {
                    pose[local - cl].eps = 0.0;
                }
                ok?;
                for (i, r) in out.iter().enumerate() {
                    jac[(v * m + i, col)] = r.eps;
                }
            }
        }
        Some(jac)
    }
}

/// Rodrigues rotation of `p` by the axis-angle vector `r`.
fn rotate<T: DualNum<f64> + Copy>(r: [T; 3], p: [T; 3]) -> [T; 3] {
    let theta_sq = r[0] * r[0] + r[1] * r[1] + r[2] * r[2];
    if theta_sq.re() < SMALL_ANGLE_SQ {
        let c = cross(r, p);
        return [p[0] + c[0], p[1] + c[1], p[2] + c[2]];
    }
    let theta = theta_sq.sqrt();
    let (s, c) = (theta.sin(), theta.cos());
    let k = [r[0] / theta, r[1] / theta, r[2] / theta];
    let kxp = cross(k, p);
    let kdp = (k[0] * p[0] + k[1] * p[1] + k[2] * p[2]) * (T::from(1.0_f64) - c);
    [
        p[0] * c + kxp[0] * s + k[0] * kdp,
        p[1] * c + kxp[1] * s + k[1] * kdp,
        p[2] * c + kxp[2] * s + k[2] * kdp,
    ]
}

#[inline]
fn cross<T: DualNum<f64> + Copy>(a: [T; 3], b: [T; 3]) -> [T; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Distort a normalized point with the first `coeffs.len()` coefficients of
/// the variant's model; missing trailing terms are zero.
fn distort<T: DualNum<f64> + Copy>(variant: CameraVariant, coeffs: &[T], x: T, y: T) -> (T, T) {
    let zero = T::from(0.0_f64);
    let one = T::from(1.0_f64);
    let two = T::from(2.0_f64);
    let c = |i: usize| coeffs.get(i).copied().unwrap_or(zero);
    match variant {
        CameraVariant::Pinhole => {
            let (k1, k2, p1, p2, k3, k4, k5, k6) = (c(0), c(1), c(2), c(3), c(4), c(5), c(6), c(7));
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let num = one + k1 * r2 + k2 * r4 + k3 * r6;
            let den = one + k4 * r2 + k5 * r4 + k6 * r6;
            let radial = if den.re().abs() > f64::EPSILON { num / den } else { num };
            let xy = x * y;
            let xd = x * radial + two * p1 * xy + p2 * (r2 + two * x * x);
            let yd = y * radial + p1 * (r2 + two * y * y) + two * p2 * xy;
            (xd, yd)
        }
        CameraVariant::Fisheye => {
            let r_sq = x * x + y * y;
            if r_sq.re().sqrt() < FISHEYE_EPS {
                return (x, y);
            }
            let r = r_sq.sqrt();
            let theta = r.atan();
            let t2 = theta * theta;
            let t4 = t2 * t2;
            let theta_d = theta * (one + c(0) * t2 + c(1) * t4 + c(2) * t4 * t2 + c(3) * t4 * t4);
            let scale = theta_d / r;
            (x * scale, y * scale)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecal_core::ChessboardPattern;
    use nalgebra::{Rotation3, Vector2};

    fn pinhole_view(obj: &[Point3<f64>], k: &Intrinsics, rvec: Vector3<f64>, t: Vector3<f64>) -> Vec<Point2<f64>> {
        let r = Rotation3::new(rvec);
        obj.iter()
            .map(|p| {
                let pc = r * p.coords + t;
                k.to_pixel(pc.x / pc.z, pc.y / pc.z)
            })
            .collect()
    }

    #[test]
    fn residuals_vanish_at_ground_truth() {
        let obj = ChessboardPattern::new(3, 4, 10.0).object_points();
        let k = Intrinsics {
            fx: 500.0,
            fy: 510.0,
            cx: 320.0,
            cy: 240.0,
            skew: 0.0,
        };
        let rvec = Vector3::new(0.1, -0.2, 0.05);
        let t = Vector3::new(5.0, -3.0, 200.0);
        let views = vec![pinhole_view(&obj, &k, rvec, t)];
        let problem = ReprojectionProblem {
            variant: CameraVariant::Pinhole,
            free_distortion: 8,
            object_points: &obj,
            views: &views,
        };
        let p = problem.pack(&k, &[0.0; 8], &[(rvec, t)]);
        assert_eq!(p.len(), 4 + 8 + 6);
        assert!(problem.rms(&p).expect("rms") < 1e-9);

        let j = problem.jacobian(&p).expect("jacobian");
        assert_eq!(j.shape(), (24, 18));
        // d(u)/d(cx) is exactly one for every point.
        for i in 0..12 {
            assert_eq!(j[(2 * i, 2)], 1.0);
            assert_eq!(j[(2 * i + 1, 2)], 0.0);
        }
    }

    #[test]
    fn residuals_match_core_distortion() {
        let obj = ChessboardPattern::new(3, 3, 20.0).object_points();
        let rvec = Vector3::new(-0.3, 0.25, 0.1);
        let t = Vector3::new(-20.0, -15.0, 150.0);
        let k = Intrinsics {
            fx: 420.0,
            fy: 415.0,
            cx: 330.0,
            cy: 250.0,
            skew: 0.0,
        };
        let cases: [(CameraVariant, Vec<f64>); 2] = [
            (CameraVariant::Pinhole, vec![-0.2, 0.05, 0.001, -0.002, 0.01, 0.1, -0.02, 0.003]),
            (CameraVariant::Fisheye, vec![0.05, -0.01, 0.002, -0.0005]),
        ];
        for (variant, coeffs) in cases {
            let dist = match variant {
                CameraVariant::Pinhole => Distortion::Pinhole(RationalDistortion::from_slice(&coeffs)),
                CameraVariant::Fisheye => Distortion::Fisheye(FisheyeDistortion::from_slice(&coeffs)),
            };
            let r = Rotation3::new(rvec);
            let observed: Vec<Point2<f64>> = obj
                .iter()
                .map(|p| {
                    let pc = r * p.coords + t;
                    let d = dist.distort(Vector2::new(pc.x / pc.z, pc.y / pc.z));
                    k.to_pixel(d.x, d.y)
                })
                .collect();
            let views = vec![observed];
            let problem = ReprojectionProblem {
                variant,
                free_distortion: coeffs.len(),
                object_points: &obj,
                views: &views,
            };
            let p = problem.pack(&k, &coeffs, &[(rvec, t)]);
            let res = problem.residuals(&p).expect("residuals");
            assert!(res.amax() < 1e-9, "{variant:?}: {}", res.amax());
        }
    }

    #[test]
    fn dual_jacobian_agrees_with_central_differences() {
        let obj = ChessboardPattern::new(3, 4, 10.0).object_points();
        let k = Intrinsics {
            fx: 300.0,
            fy: 305.0,
            cx: 320.0,
            cy: 240.0,
            skew: 0.0,
        };
        let poses = [
            (Vector3::new(0.2, -0.1, 0.3), Vector3::new(-10.0, 5.0, 120.0)),
            (Vector3::new(-0.15, 0.3, -0.05), Vector3::new(8.0, -6.0, 140.0)),
        ];
        for (variant, coeffs) in [
            (CameraVariant::Pinhole, vec![-0.1, 0.02, 0.001, 0.002, -0.003]),
            (CameraVariant::Fisheye, vec![0.03, -0.01, 0.004, -0.001]),
        ] {
            // Offset observations so residuals are non-zero.
            let views: Vec<Vec<Point2<f64>>> = poses
                .iter()
                .map(|(r, t)| {
                    pinhole_view(&obj, &k, *r, *t)
                        .into_iter()
                        .map(|p| Point2::new(p.x + 0.7, p.y - 0.4))
                        .collect()
                })
                .collect();
            let problem = ReprojectionProblem {
                variant,
                free_distortion: coeffs.len(),
                object_points: &obj,
                views: &views,
            };
            let p = problem.pack(&k, &coeffs, &poses);
            let j = problem.jacobian(&p).expect("jacobian");

            for c in 0..p.len() {
                let h = 1e-6 * (1.0 + p[c].abs());
                let mut hi = p.clone();
                let mut lo = p.clone();
                hi[c] += h;
                lo[c] -= h;
                let diff = (problem.residuals(&hi).expect("hi") - problem.residuals(&lo).expect("lo"))
                    / (2.0 * h);
                for r in 0..diff.len() {
                    let tol = 1e-4 * (1.0 + diff[r].abs());
                    assert!(
                        (j[(r, c)] - diff[r]).abs() < tol,
                        "{variant:?} ({r}, {c}): {} vs {}",
                        j[(r, c)],
                        diff[r]
                    );
                }
            }

            // Poses only touch their own view's rows.
            let m = problem.view_residual_len();
            let o1 = problem.pose_offset(1);
            for r in 0..m {
                for c in o1..o1 + POSE_LEN {
                    assert_eq!(j[(r, c)], 0.0);
                }
            }
        }
    }

    #[test]
    fn points_behind_camera_are_invalid() {
        let obj = ChessboardPattern::new(2, 2, 10.0).object_points();
        let views = vec![vec![Point2::new(0.0, 0.0); 4]];
        let problem = ReprojectionProblem {
            variant: CameraVariant::Fisheye,
            free_distortion: 4,
            object_points: &obj,
            views: &views,
        };
        let k = Intrinsics::initial_guess(livecal_core::ImageSize::new(640, 480));
        let p = problem.pack(&k, &[0.0; 4], &[(Vector3::zeros(), Vector3::new(0.0, 0.0, -50.0))]);
        assert!(problem.residuals(&p).is_none());
        assert!(problem.jacobian(&p).is_none());
    }
}
