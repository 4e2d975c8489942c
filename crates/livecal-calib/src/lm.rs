//! Levenberg-Marquardt over a flat parameter vector, backed by the
//! `levenberg-marquardt` crate.
//!
//! Problems implement [`NllsProblem`]; [`LmOptions::minimize`] adapts them
//! to the crate's stateful `LeastSquaresProblem` and maps its report.

use levenberg_marquardt::{
    LeastSquaresProblem, LevenbergMarquardt, TerminationReason as LmTermination,
};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};

/// Residual value substituted for every entry when a trial step leaves the
/// problem's domain, so the step is rejected rather than ending the solve.
const OUT_OF_DOMAIN_RESIDUAL: f64 = 1e8;

/// A nonlinear least-squares problem over a flat parameter vector.
pub trait NllsProblem {
    fn num_params(&self) -> usize;

    /// Residual vector, or `None` if `params` is outside the valid domain.
    fn residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>>;

    /// Jacobian of [`residuals`](Self::residuals) with respect to `params`.
    fn jacobian(&self, params: &DVector<f64>) -> Option<DMatrix<f64>>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LmError {
    #[error("problem has no parameters")]
    Empty,
    #[error("residuals are not defined at the initial guess")]
    InvalidStart,
    #[error("tolerances must be finite and non-negative")]
    InvalidOptions,
    #[error("optimizer stopped: {0}")]
    Terminated(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Residuals reached exactly zero.
    ResidualsZero,
    /// Relative cost or step change fell below tolerance.
    Converged,
    /// Residuals are orthogonal to the Jacobian columns (gradient tolerance).
    GradientConverged,
    /// Evaluation budget (`max_iterations * (n + 1)`) used up.
    MaxEvaluations,
    /// A tolerance is below machine precision and cannot be met.
    NoImprovementPossible,
}

#[derive(Debug, Clone)]
pub struct LmReport {
    pub params: DVector<f64>,
    /// Sum of squared residuals at `params`.
    pub cost: f64,
    /// Residual evaluations performed.
    pub iterations: usize,
    pub termination: TerminationReason,
}

/// Solver tolerances, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmOptions {
    /// Patience: the evaluation budget is `max_iterations * (n + 1)`.
    pub max_iterations: usize,
    /// Relative cost reduction below which the solve stops (`ftol`).
    pub cost_tolerance: f64,
    /// Relative step size below which the solve stops (`xtol`).
    pub step_tolerance: f64,
    /// Orthogonality between residuals and Jacobian columns (`gtol`).
    pub gradient_tolerance: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-10,
            step_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
        }
    }
}

struct LmWrapper<'a, P: NllsProblem> {
    problem: &'a P,
    params: DVector<f64>,
    /// Residual count of a valid evaluation.
    residual_len: usize,
}

impl<P: NllsProblem> LeastSquaresProblem<f64, Dyn, Dyn> for LmWrapper<'_, P> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self
            .problem
            .residuals(&self.params)
            .unwrap_or_else(|| DVector::from_element(self.residual_len, OUT_OF_DOMAIN_RESIDUAL));
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.problem.jacobian(&self.params)
    }
}

impl LmOptions {
    pub fn validate(&self) -> Result<(), LmError> {
        let ok = [self.cost_tolerance, self.step_tolerance, self.gradient_tolerance]
            .iter()
            .all(|t| t.is_finite() && *t >= 0.0);
        if ok {
            Ok(())
        } else {
            Err(LmError::InvalidOptions)
        }
    }

    pub fn minimize<P: NllsProblem>(
        &self,
        problem: &P,
        start: DVector<f64>,
    ) -> Result<LmReport, LmError> {
        self.validate()?;
        let n = problem.num_params();
        if n == 0 || start.len() != n {
            return Err(LmError::Empty);
        }
        let residual_len = problem
            .residuals(&start)
            .filter(|r| r.iter().all(|v| v.is_finite()))
            .ok_or(LmError::InvalidStart)?
            .len();

        let lm = LevenbergMarquardt::new()
            .with_ftol(self.cost_tolerance)
            .with_xtol(self.step_tolerance)
            .with_gtol(self.gradient_tolerance)
            .with_patience(self.max_iterations.max(1));
        let wrapper = LmWrapper {
            problem,
            params: start,
            residual_len,
        };
        let (wrapper, report) = lm.minimize(wrapper);

        let termination = match report.termination {
            LmTermination::ResidualsZero => TerminationReason::ResidualsZero,
            LmTermination::Converged { .. } => TerminationReason::Converged,
            LmTermination::Orthogonal => TerminationReason::GradientConverged,
            LmTermination::LostPatience => TerminationReason::MaxEvaluations,
            LmTermination::NoImprovementPossible(_) => TerminationReason::NoImprovementPossible,
            other => return Err(LmError::Terminated(format!("{other:?}"))),
        };
        let params = wrapper.params;
        let cost = problem
            .residuals(&params)
            .map(|r| r.norm_squared())
            .filter(|c| c.is_finite())
            .ok_or_else(|| LmError::Terminated("final parameters left the valid domain".into()))?;

        Ok(LmReport {
            params,
            cost,
            iterations: report.number_of_evaluations,
            termination,
        })
    }
}
