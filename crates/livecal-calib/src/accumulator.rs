//! Growing window of chessboard observations and the re-solve policy.
//!
//! Observations are appended in arrival order. Once the window holds
//! `refine_threshold` observations the next addition clears it and switches
//! the accumulator to refinement mode, where the current camera model seeds
//! every subsequent solve.

use crate::lm::{LmError, LmOptions};
use crate::solve::{calibrate, CalibrationFlags, SolveError};
use crate::TerminationReason;
use livecal_core::{CameraModel, ChessboardPattern};
use log::{debug, info};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AccumulatorError {
    #[error("observation has {got} corners, expected {expected}")]
    CornerCount { expected: usize, got: usize },
    #[error("corner {0} has non-finite coordinates")]
    NonFiniteCorner(usize),
    #[error("min_observations ({min_observations}) must be in 1..=refine_threshold ({refine_threshold})")]
    InvalidConfig {
        min_observations: usize,
        refine_threshold: usize,
    },
    #[error("solver options: {0}")]
    SolverOptions(#[from] LmError),
    #[error(transparent)]
    Solve(#[from] SolveError),
}

/// When to re-run the solve once enough observations are stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePolicy {
    /// Re-solve over the whole window on every addition.
    #[default]
    EveryObservation,
    /// Re-solve only when the window first reaches `min_observations` and
    /// when it reaches `refine_threshold`.
    AtThreshold,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    pub refine_threshold: usize,
    pub min_observations: usize,
    pub resolve_policy: ResolvePolicy,
    pub solver: LmOptions,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            refine_threshold: 10,
            min_observations: 5,
            resolve_policy: ResolvePolicy::default(),
            solver: LmOptions::default(),
        }
    }
}

impl AccumulatorConfig {
    pub fn validate(&self) -> Result<(), AccumulatorError> {
        if self.min_observations == 0 || self.min_observations > self.refine_threshold {
            return Err(AccumulatorError::InvalidConfig {
                min_observations: self.min_observations,
                refine_threshold: self.refine_threshold,
            });
        }
        self.solver.validate()?;
        Ok(())
    }
}

/// Result of a successful solve, already applied to the camera model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveSummary {
    /// RMS reprojection error in pixels.
    pub reprojection_error: f64,
    pub refined: bool,
    pub observation_count: usize,
    pub iterations: usize,
    pub termination: TerminationReason,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AddOutcome {
    /// The observation was stored; the model was not touched.
    Stored { observation_count: usize },
    /// The observation was stored and the model re-estimated.
    Calibrated(SolveSummary),
}

#[derive(Clone, Debug)]
pub struct CorrespondenceAccumulator {
    config: AccumulatorConfig,
    pattern: ChessboardPattern,
    object_points: Vec<Point3<f64>>,
    observations: Vec<Vec<Point2<f64>>>,
    refined: bool,
    reprojection_error: f64,
}

impl CorrespondenceAccumulator {
    pub fn new(pattern: ChessboardPattern, config: AccumulatorConfig) -> Result<Self, AccumulatorError> {
        config.validate()?;
        Ok(Self {
            object_points: pattern.object_points(),
            pattern,
            config,
            observations: Vec::new(),
            refined: false,
            reprojection_error: f64::NAN,
        })
    }

    pub fn pattern(&self) -> &ChessboardPattern {
        &self.pattern
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    /// Canonical board points shared by every observation.
    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn observations(&self) -> &[Vec<Point2<f64>>] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn refined(&self) -> bool {
        self.refined
    }

    /// RMS error of the last successful solve, NaN before the first one.
    pub fn reprojection_error(&self) -> f64 {
        self.reprojection_error
    }

    /// Seed future solves from the current model, e.g. after a manual edit.
    pub fn mark_refined(&mut self) {
        self.refined = true;
    }

    /// Drop all observations and forget refinement state.
    pub fn clear(&mut self) {
        self.observations.clear();
        self.refined = false;
        self.reprojection_error = f64::NAN;
    }

    /// Store one ordered set of image corners and re-solve if due.
    ///
    /// On success `model` receives the new intrinsics and distortion; its
    /// image size, variant and alpha are kept. If the solve fails, both the
    /// stored observations (including a reset triggered by this call) and
    /// `model` are left as they were before the call.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(stored = self.observations.len()))
    )]
    pub fn add_observation(
        &mut self,
        corners: Vec<Point2<f64>>,
        model: &mut CameraModel,
    ) -> Result<AddOutcome, AccumulatorError> {
        let expected = self.pattern.corner_count();
        if corners.len() != expected {
            return Err(AccumulatorError::CornerCount {
                expected,
                got: corners.len(),
            });
        }
        if let Some(i) = corners.iter().position(|p| !(p.x.is_finite() && p.y.is_finite())) {
            return Err(AccumulatorError::NonFiniteCorner(i));
        }

        let reset = if self.observations.len() >= self.config.refine_threshold {
            debug!(
                "observation window reached {} entries, restarting in refinement mode",
                self.observations.len()
            );
            let previous = std::mem::take(&mut self.observations);
            let was_refined = std::mem::replace(&mut self.refined, true);
            Some((previous, was_refined))
        } else {
            None
        };
        self.observations.push(corners);

        if !self.solve_due() {
            return Ok(AddOutcome::Stored {
                observation_count: self.observations.len(),
            });
        }

        let flags = CalibrationFlags::for_variant(model.variant(), self.refined);
        match calibrate(
            &self.object_points,
            &self.observations,
            model,
            flags,
            &self.config.solver,
        ) {
            Ok(res) => {
                model.set_intrinsics(res.intrinsics);
                model.set_distortion(res.distortion);
                self.reprojection_error = res.reprojection_error;
                info!(
                    "calibrated from {} observations: fx={:.2} fy={:.2} cx={:.2} cy={:.2} rms={:.4}px",
                    self.observations.len(),
                    res.intrinsics.fx,
                    res.intrinsics.fy,
                    res.intrinsics.cx,
                    res.intrinsics.cy,
                    res.reprojection_error
                );
                Ok(AddOutcome::Calibrated(SolveSummary {
                    reprojection_error: res.reprojection_error,
                    refined: self.refined,
                    observation_count: self.observations.len(),
                    iterations: res.iterations,
                    termination: res.termination,
                }))
            }
            Err(err) => {
                self.observations.pop();
                if let Some((previous, was_refined)) = reset {
                    self.observations = previous;
                    self.refined = was_refined;
                }
                Err(err.into())
            }
        }
    }

    fn solve_due(&self) -> bool {
        let n = self.observations.len();
        if n < self.config.min_observations {
            return false;
        }
        match self.config.resolve_policy {
            ResolvePolicy::EveryObservation => true,
            ResolvePolicy::AtThreshold => {
                n == self.config.min_observations || n == self.config.refine_threshold
            }
        }
    }
}
