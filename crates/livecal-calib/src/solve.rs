use crate::init::{init_fisheye_intrinsics, init_pinhole_intrinsics, pose_from_homography};
use crate::lm::{LmError, LmOptions, TerminationReason};
use crate::problem::ReprojectionProblem;
use livecal_core::{
    estimate_homography, CameraModel, CameraVariant, Distortion, FisheyeDistortion, ImageSize,
    Intrinsics, RationalDistortion,
};
use log::debug;
use nalgebra::{Point2, Point3, Vector3};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Minimum points per view for a homography-based pose.
const MIN_POINTS_PER_VIEW: usize = 4;
/// Coefficients of the non-rational (Brown-Conrady) pinhole model.
const BROWN_CONRADY_LEN: usize = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("no observations to calibrate from")]
    NoViews,
    #[error("view {view} has {got} corners, expected {expected}")]
    CornerCount {
        view: usize,
        expected: usize,
        got: usize,
    },
    #[error("pattern has {0} points, need at least 4")]
    TooFewPoints(usize),
    #[error("view {0} has a degenerate plane-to-image homography")]
    DegenerateView(usize),
    #[error("focal length initialization failed")]
    FocalInit,
    #[error(transparent)]
    Optimizer(#[from] LmError),
    #[error("solution is not physically valid (fx={fx}, fy={fy})")]
    InvalidSolution { fx: f64, fy: f64 },
}

/// Solver switches derived from the camera variant and the refinement state.
///
/// Skew is never estimated: both variants keep it at zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibrationFlags {
    /// Start from the supplied model instead of a closed-form guess.
    pub use_intrinsic_guess: bool,
    /// Pinhole only: solve all 8 rational coefficients instead of 5.
    pub rational_model: bool,
}

impl CalibrationFlags {
    pub fn for_variant(variant: CameraVariant, refined: bool) -> Self {
        match variant {
            CameraVariant::Pinhole => Self {
                use_intrinsic_guess: refined,
                rational_model: true,
            },
            CameraVariant::Fisheye => Self {
                use_intrinsic_guess: refined,
                rational_model: false,
            },
        }
    }

    fn free_distortion(&self, variant: CameraVariant) -> usize {
        match variant {
            CameraVariant::Pinhole if self.rational_model => RationalDistortion::LEN,
            CameraVariant::Pinhole => BROWN_CONRADY_LEN,
            CameraVariant::Fisheye => FisheyeDistortion::LEN,
        }
    }
}

/// Output of a successful calibration.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationResult {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    /// RMS reprojection distance in pixels.
    pub reprojection_error: f64,
    /// Per-view `(rvec, t)` board poses.
    pub poses: Vec<(Vector3<f64>, Vector3<f64>)>,
    pub iterations: usize,
    pub termination: TerminationReason,
}

/// Calibrate `seed.variant()` from planar correspondences.
///
/// Every view must list the same number of points as `object_points`, in the
/// same order. `seed` provides the image size and, with
/// `flags.use_intrinsic_guess`, the starting intrinsics and distortion.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(views = views.len(), variant = ?seed.variant()))
)]
pub fn calibrate(
    object_points: &[Point3<f64>],
    views: &[Vec<Point2<f64>>],
    seed: &CameraModel,
    flags: CalibrationFlags,
    solver: &LmOptions,
) -> Result<CalibrationResult, SolveError> {
    if views.is_empty() {
        return Err(SolveError::NoViews);
    }
    if object_points.len() < MIN_POINTS_PER_VIEW {
        return Err(SolveError::TooFewPoints(object_points.len()));
    }
    for (view, obs) in views.iter().enumerate() {
        if obs.len() != object_points.len() {
            return Err(SolveError::CornerCount {
                view,
                expected: object_points.len(),
                got: obs.len(),
            });
        }
    }

    let variant = seed.variant();
    let plane: Vec<Point2<f64>> = object_points.iter().map(|p| Point2::new(p.x, p.y)).collect();

    let (intrinsics, distortion) = if flags.use_intrinsic_guess {
        (*seed.intrinsics(), seed.distortion())
    } else {
        initial_camera(&plane, views, variant, seed.image_size())?
    };

    let poses = views
        .iter()
        .enumerate()
        .map(|(v, obs)| initial_pose(&plane, obs, &intrinsics, &distortion).ok_or(SolveError::DegenerateView(v)))
        .collect::<Result<Vec<_>, _>>()?;

    let problem = ReprojectionProblem {
        variant,
        free_distortion: flags.free_distortion(variant),
        object_points,
        views,
    };
    let start = problem.pack(&intrinsics, &distortion.coeffs(), &poses);
    let report = solver.minimize(&problem, start)?;

    let k = problem.intrinsics(&report.params);
    if !(k.fx.is_finite() && k.fy.is_finite() && k.fx > 0.0 && k.fy > 0.0)
        || !(k.cx.is_finite() && k.cy.is_finite())
    {
        return Err(SolveError::InvalidSolution { fx: k.fx, fy: k.fy });
    }
    let reprojection_error = problem
        .rms(&report.params)
        .filter(|e| e.is_finite())
        .ok_or(SolveError::InvalidSolution { fx: k.fx, fy: k.fy })?;

    debug!(
        "calibrated {:?} from {} views: fx={:.2} fy={:.2} rms={:.4}px ({} iterations, {:?})",
        variant,
        views.len(),
        k.fx,
        k.fy,
        reprojection_error,
        report.iterations,
        report.termination
    );

    Ok(CalibrationResult {
        intrinsics: k,
        distortion: problem.distortion(&report.params),
        reprojection_error,
        poses: (0..views.len()).map(|v| problem.pose(&report.params, v)).collect(),
        iterations: report.iterations,
        termination: report.termination,
    })
}

fn initial_camera(
    plane: &[Point2<f64>],
    views: &[Vec<Point2<f64>>],
    variant: CameraVariant,
    size: ImageSize,
) -> Result<(Intrinsics, Distortion), SolveError> {
    match variant {
        CameraVariant::Pinhole => {
            let homographies = views
                .iter()
                .enumerate()
                .map(|(v, obs)| {
                    estimate_homography(plane, obs)
                        .map(|h| h.h)
                        .ok_or(SolveError::DegenerateView(v))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let k = init_pinhole_intrinsics(&homographies, size).ok_or(SolveError::FocalInit)?;
            Ok((k, Distortion::Pinhole(RationalDistortion::default())))
        }
        CameraVariant::Fisheye => Ok((
            init_fisheye_intrinsics(size),
            Distortion::Fisheye(FisheyeDistortion::default()),
        )),
    }
}

/// Pose from the homography between the board plane and undistorted,
/// normalized observations.
fn initial_pose(
    plane: &[Point2<f64>],
    observed: &[Point2<f64>],
    k: &Intrinsics,
    distortion: &Distortion,
) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let normalized = observed
        .iter()
        .map(|p| distortion.undistort(k.to_normalized(p)).map(|n| Point2::new(n.x, n.y)))
        .collect::<Option<Vec<_>>>()?;
    let h = estimate_homography(plane, &normalized)?;
    pose_from_homography(&h.h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{synthetic_views, SyntheticRig};
    use approx::assert_abs_diff_eq;
    use livecal_core::ChessboardPattern;

    #[test]
    fn pinhole_recovers_known_camera() {
        let rig = SyntheticRig::hd_pinhole();
        let pattern = ChessboardPattern::new(5, 7, 25.0);
        let obj = pattern.object_points();
        let views = synthetic_views(&rig, &obj, 6, 0.0, 7);

        let seed = CameraModel::initial(rig.size, CameraVariant::Pinhole);
        let res = calibrate(
            &obj,
            &views,
            &seed,
            CalibrationFlags::for_variant(CameraVariant::Pinhole, false),
            &LmOptions::default(),
        )
        .expect("solve");
        assert!(res.reprojection_error < 1e-3, "rms {}", res.reprojection_error);
        assert_abs_diff_eq!(res.intrinsics.fx, 900.0, epsilon = 1.0);
        assert_abs_diff_eq!(res.intrinsics.cy, 360.0, epsilon = 1.0);
    }

    #[test]
    fn fisheye_fits_equidistant_lens() {
        let mut rig = SyntheticRig::hd_pinhole();
        rig.distortion = Distortion::Fisheye(FisheyeDistortion::from_array([0.02, -0.01, 0.0, 0.0]));
        rig.intrinsics.fx = 500.0;
        rig.intrinsics.fy = 500.0;
        let obj = ChessboardPattern::new(5, 7, 25.0).object_points();
        let views = synthetic_views(&rig, &obj, 8, 0.0, 3);

        let seed = CameraModel::initial(rig.size, CameraVariant::Fisheye);
        let res = calibrate(
            &obj,
            &views,
            &seed,
            CalibrationFlags::for_variant(CameraVariant::Fisheye, false),
            &LmOptions::default(),
        )
        .expect("solve");
        assert!(res.reprojection_error < 0.05, "rms {}", res.reprojection_error);
        assert_abs_diff_eq!(res.intrinsics.fx, 500.0, epsilon = 5.0);
        assert!(matches!(res.distortion, Distortion::Fisheye(_)));
    }

    #[test]
    fn rejects_mismatched_views() {
        let obj = ChessboardPattern::new(5, 7, 25.0).object_points();
        let seed = CameraModel::initial(ImageSize::new(640, 480), CameraVariant::Pinhole);
        let err = calibrate(
            &obj,
            &[vec![Point2::new(0.0, 0.0); 3]],
            &seed,
            CalibrationFlags::for_variant(CameraVariant::Pinhole, false),
            &LmOptions::default(),
        )
        .expect_err("bad view");
        assert_eq!(
            err,
            SolveError::CornerCount {
                view: 0,
                expected: 35,
                got: 3
            }
        );
    }

    #[test]
    fn brown_conrady_leaves_rational_terms_at_zero() {
        let rig = SyntheticRig::hd_pinhole();
        let obj = ChessboardPattern::new(5, 7, 25.0).object_points();
        let views = synthetic_views(&rig, &obj, 5, 0.0, 11);
        let seed = CameraModel::initial(rig.size, CameraVariant::Pinhole);
        let flags = CalibrationFlags {
            rational_model: false,
            ..CalibrationFlags::for_variant(CameraVariant::Pinhole, false)
        };
        let res = calibrate(&obj, &views, &seed, flags, &LmOptions::default()).expect("solve");
        let Distortion::Pinhole(d) = res.distortion else {
            panic!("pinhole expected");
        };
        assert_eq!((d.k4, d.k5, d.k6), (0.0, 0.0, 0.0));
    }
}
