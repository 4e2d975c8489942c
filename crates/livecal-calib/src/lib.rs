//! Calibration from accumulated chessboard observations, and rectification.
//!
//! - [`CorrespondenceAccumulator`] stores ordered corner sets, applies the
//!   reset/refine policy and re-solves the camera model.
//! - [`calibrate`] runs a Levenberg-Marquardt reprojection solve for either
//!   camera variant, seeded in closed form or from an existing model.
//! - [`RectificationMapBuilder`] turns a [`CameraModel`](livecal_core::CameraModel)
//!   into fixed-point remap tables; [`RectificationTables::remap`] applies them.
//!
//! ```no_run
//! use livecal_calib::{AccumulatorConfig, CorrespondenceAccumulator, RectificationMapBuilder};
//! use livecal_core::{CameraModel, CameraVariant, ChessboardPattern, ImageSize};
//!
//! # fn corners() -> Vec<nalgebra::Point2<f64>> { Vec::new() }
//! let pattern = ChessboardPattern::new(5, 7, 25.0);
//! let mut acc = CorrespondenceAccumulator::new(pattern, AccumulatorConfig::default()).unwrap();
//! let mut model = CameraModel::initial(ImageSize::new(1280, 720), CameraVariant::Pinhole);
//! acc.add_observation(corners(), &mut model).unwrap();
//! let tables = RectificationMapBuilder::build(&model).unwrap();
//! ```

mod accumulator;
mod init;
mod lm;
mod problem;
mod rectify;
mod solve;
pub mod synthetic;

pub use accumulator::{
    AccumulatorConfig, AccumulatorError, AddOutcome, CorrespondenceAccumulator, ResolvePolicy,
    SolveSummary,
};
pub use init::{init_fisheye_intrinsics, init_pinhole_intrinsics, pose_from_homography};
pub use lm::{LmError, LmOptions, LmReport, NllsProblem, TerminationReason};
pub use rectify::{
    optimal_intrinsics, RectificationMapBuilder, RectificationTables, RectifyError, INTER_BITS,
    INTER_TAB_SIZE,
};
pub use solve::{calibrate, CalibrationFlags, CalibrationResult, SolveError};
