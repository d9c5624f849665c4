//! Bounded nonlinear least squares for four-parameter curves.
//!
//! The solver minimizes
//!
//! ```text
//! cost(p) = ½ Σᵢ (f(xᵢ; p) − yᵢ)²     subject to  lower ≤ p ≤ upper
//! ```
//!
//! with a projected Levenberg–Marquardt iteration. Each step solves the
//! damped normal equations
//!
//! ```text
//! (JᵀJ + λ·diag(JᵀJ)) v = −Jᵀr
//! ```
//!
//! over the free parameters only. A parameter resting on a bound whose
//! gradient points out of the box is held fixed for that step, so the
//! clamped step still moves the others.
//!
//! The velocity `v` is corrected with a geodesic acceleration term `a`,
//! solved from the same matrix with right-hand side `−Jᵀr''`, where `r''`
//! is the second directional derivative of the residuals along `v`
//! (estimated by a finite difference). The corrected step `v + a/2` is used
//! while `2‖a‖ ≤ 0.75‖v‖`. This lets the iteration follow the curved
//! valleys the logarithmic form produces on near-linear data.
//!
//! `p + step` is projected onto the parameter box and accepted only if the
//! cost decreases. Accepted steps shrink `λ`, rejected steps grow it.
//!
//! A single attempt is made from the supplied initial guess; there is no
//! restart logic.

use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::curve::CurveParams;
use crate::error::{Result, TrainUtilsError};

/// Floor applied to the Marquardt scaling diagonal.
const MIN_DIAGONAL: f64 = 1e-12;

/// Damping is never reduced below this.
const MIN_DAMPING: f64 = 1e-15;

/// Damping above this means no improving step exists.
const MAX_DAMPING: f64 = 1e16;

/// Finite-difference length for the second directional derivative.
const GEODESIC_STEP: f64 = 0.1;

/// Largest accepted ratio `2‖a‖ / ‖v‖`.
const MAX_ACCELERATION_RATIO: f64 = 0.75;

/// A differentiable curve model with four parameters.
pub trait CurveModel {
    /// Model value at `x`.
    fn value(&self, x: f64, params: &CurveParams) -> f64;

    /// Gradient of the model value with respect to the parameters at `x`.
    fn gradient(&self, x: f64, params: &CurveParams) -> Vector4<f64>;
}

/// Box constraints on `(a, b, c, d)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterBounds {
    /// Lower bound per parameter.
    pub lower: [f64; 4],
    /// Upper bound per parameter.
    pub upper: [f64; 4],
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self {
            lower: [-10_000.0, -1.0, -10_000.0, -10_000.0],
            upper: [10_000.0, 1.0, 10_000.0, 10_000.0],
        }
    }
}

impl ParameterBounds {
    /// Create bounds from explicit arrays.
    #[must_use]
    pub const fn new(lower: [f64; 4], upper: [f64; 4]) -> Self {
        Self { lower, upper }
    }

    /// Check that every interval is finite and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::Config`] for NaN or inverted intervals.
    pub fn validate(&self) -> Result<()> {
        for (i, (lo, hi)) in self.lower.iter().zip(&self.upper).enumerate() {
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(TrainUtilsError::Config(format!(
                    "invalid bounds for parameter {i}: [{lo}, {hi}]"
                )));
            }
        }
        Ok(())
    }

    /// Whether every parameter lies inside its interval.
    #[must_use]
    pub fn contains(&self, params: &CurveParams) -> bool {
        params
            .to_array()
            .iter()
            .enumerate()
            .all(|(i, v)| *v >= self.lower[i] && *v <= self.upper[i])
    }

    /// Clamp a parameter vector onto the box.
    #[must_use]
    pub fn project(&self, p: &Vector4<f64>) -> Vector4<f64> {
        Vector4::from_fn(|i, _| p[i].clamp(self.lower[i], self.upper[i]))
    }

    /// Which parameters sit exactly on a bound.
    #[must_use]
    pub fn active(&self, params: &CurveParams) -> [bool; 4] {
        let values = params.to_array();
        std::array::from_fn(|i| values[i] <= self.lower[i] || values[i] >= self.upper[i])
    }
}

/// Stopping criteria for the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Maximum number of outer iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Relative cost reduction below which the fit is converged.
    #[serde(default = "default_tolerance")]
    pub ftol: f64,
    /// Relative step size below which the fit is converged.
    #[serde(default = "default_tolerance")]
    pub xtol: f64,
    /// Projected-gradient infinity norm below which the fit is converged.
    #[serde(default = "default_tolerance")]
    pub gtol: f64,
    /// Starting damping factor λ.
    #[serde(default = "default_initial_damping")]
    pub initial_damping: f64,
}

fn default_max_iterations() -> usize {
    10_000
}
fn default_tolerance() -> f64 {
    1e-8
}
fn default_initial_damping() -> f64 {
    1e-3
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            ftol: default_tolerance(),
            xtol: default_tolerance(),
            gtol: default_tolerance(),
            initial_damping: default_initial_damping(),
        }
    }
}

impl SolverConfig {
    /// Builder: Set the iteration budget.
    #[must_use]
    pub const fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    /// Builder: Set all three tolerances at once.
    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.ftol = tolerance;
        self.xtol = tolerance;
        self.gtol = tolerance;
        self
    }

    /// Builder: Set the starting damping factor.
    #[must_use]
    pub const fn with_initial_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    /// Check that the stopping criteria are usable.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::Config`] for a zero iteration budget or
    /// negative tolerances.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(TrainUtilsError::Config(
                "solver.max_iterations must be > 0".into(),
            ));
        }
        for (name, value) in [("ftol", self.ftol), ("xtol", self.xtol), ("gtol", self.gtol)] {
            if value.is_nan() || value < 0.0 {
                return Err(TrainUtilsError::Config(format!(
                    "solver.{name} must be >= 0, got {value}"
                )));
            }
        }
        if self.initial_damping.is_nan() || self.initial_damping <= 0.0 {
            return Err(TrainUtilsError::Config(
                "solver.initial_damping must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Projected gradient fell below `gtol`.
    GradientTolerance,
    /// Relative cost reduction fell below `ftol`.
    CostTolerance,
    /// Relative step fell below `xtol`.
    StepTolerance,
    /// No cost-reducing step could be found at any damping.
    Stalled,
}

/// Outcome of a successful fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    /// Fitted parameters, inside the bounds.
    pub params: CurveParams,
    /// Final cost `½ Σ r²`.
    pub cost: f64,
    /// Outer iterations performed.
    pub iterations: usize,
    /// Stopping reason.
    pub termination: Termination,
    /// Parameters resting on a bound.
    pub active_bounds: [bool; 4],
}

/// Projected Levenberg–Marquardt solver.
#[derive(Debug, Clone, Default)]
pub struct BoundedLeastSquares {
    config: SolverConfig,
    bounds: ParameterBounds,
}

impl BoundedLeastSquares {
    /// Create a solver.
    #[must_use]
    pub const fn new(config: SolverConfig, bounds: ParameterBounds) -> Self {
        Self { config, bounds }
    }

    /// Parameter bounds in use.
    #[must_use]
    pub const fn bounds(&self) -> &ParameterBounds {
        &self.bounds
    }

    /// Fit `model` to the points `(xs[i], ys[i])` starting from `initial`.
    ///
    /// The initial guess is projected onto the bounds before the first step.
    ///
    /// # Errors
    ///
    /// - [`TrainUtilsError::EmptyInput`] / [`TrainUtilsError::ShapeMismatch`]
    ///   for unusable data.
    /// - [`TrainUtilsError::NonFinite`] if the cost or Jacobian is NaN/∞.
    /// - [`TrainUtilsError::NotConverged`] if the iteration budget runs out.
    pub fn minimize<M: CurveModel>(
        &self,
        model: &M,
        xs: &[f64],
        ys: &[f64],
        initial: CurveParams,
    ) -> Result<FitReport> {
        if xs.is_empty() {
            return Err(TrainUtilsError::EmptyInput(
                "no observations to fit".into(),
            ));
        }
        if xs.len() != ys.len() {
            return Err(TrainUtilsError::ShapeMismatch {
                expected: vec![xs.len()],
                actual: vec![ys.len()],
            });
        }
        self.bounds.validate()?;
        self.config.validate()?;

        let mut p = self.bounds.project(&initial.to_vector());
        let mut cost = sum_of_squares(model, xs, ys, &p);
        if !cost.is_finite() {
            return Err(TrainUtilsError::NonFinite(format!(
                "initial cost is {cost} at {}",
                CurveParams::from_vector(&p)
            )));
        }
        let mut damping = self.config.initial_damping;

        for iteration in 0..self.config.max_iterations {
            let (jtj, jtr) = normal_equations(model, xs, ys, &p);
            if jtj.iter().chain(jtr.iter()).any(|v| !v.is_finite()) {
                return Err(TrainUtilsError::NonFinite(format!(
                    "Jacobian at iteration {iteration}"
                )));
            }

            let blocked = self.blocked(&p, &jtr);
            if projected_norm(&jtr, &blocked) <= self.config.gtol {
                return Ok(self.report(&p, cost, iteration, Termination::GradientTolerance));
            }

            loop {
                let mut lhs = jtj;
                let mut rhs = -jtr;
                for i in 0..4 {
                    if blocked[i] {
                        lhs.row_mut(i).fill(0.0);
                        lhs.column_mut(i).fill(0.0);
                        lhs[(i, i)] = 1.0;
                        rhs[i] = 0.0;
                    } else {
                        lhs[(i, i)] += damping * jtj[(i, i)].max(MIN_DIAGONAL);
                    }
                }

                let lu = lhs.lu();
                if let Some(velocity) = lu.solve(&rhs) {
                    let step = match curvature_gradient(model, xs, ys, &p, &velocity, &jtj, &jtr) {
                        Some(mut curvature) => {
                            for i in (0..4).filter(|i| blocked[*i]) {
                                curvature[i] = 0.0;
                            }
                            match lu.solve(&(-curvature)) {
                                Some(acceleration)
                                    if 2.0 * acceleration.norm()
                                        <= MAX_ACCELERATION_RATIO * velocity.norm() =>
                                {
                                    velocity + acceleration * 0.5
                                }
                                _ => velocity,
                            }
                        }
                        None => velocity,
                    };

                    let candidate = self.bounds.project(&(p + step));
                    let candidate_cost = sum_of_squares(model, xs, ys, &candidate);

                    if candidate_cost.is_finite() && candidate_cost < cost {
                        let step_norm = (candidate - p).norm();
                        let reduction = cost - candidate_cost;
                        let previous = cost;
                        p = candidate;
                        cost = candidate_cost;
                        damping = (damping / 10.0).max(MIN_DAMPING);
                        trace!(iteration, cost, damping, "accepted step");

                        if reduction <= self.config.ftol * previous {
                            return Ok(self.report(&p, cost, iteration + 1, Termination::CostTolerance));
                        }
                        if step_norm <= self.config.xtol * (p.norm() + self.config.xtol) {
                            return Ok(self.report(&p, cost, iteration + 1, Termination::StepTolerance));
                        }
                        break;
                    }
                }

                damping *= 10.0;
                if damping > MAX_DAMPING {
                    return Ok(self.report(&p, cost, iteration + 1, Termination::Stalled));
                }
            }
        }

        Err(TrainUtilsError::NotConverged {
            iterations: self.config.max_iterations,
            cost,
        })
    }

    /// Parameters on a bound whose descent direction leaves the box.
    fn blocked(&self, p: &Vector4<f64>, gradient: &Vector4<f64>) -> [bool; 4] {
        std::array::from_fn(|i| {
            let g = gradient[i];
            (p[i] <= self.bounds.lower[i] && g > 0.0) || (p[i] >= self.bounds.upper[i] && g < 0.0)
        })
    }

    fn report(
        &self,
        p: &Vector4<f64>,
        cost: f64,
        iterations: usize,
        termination: Termination,
    ) -> FitReport {
        let params = CurveParams::from_vector(p);
        debug!(?termination, iterations, cost, %params, "least-squares fit finished");
        FitReport {
            params,
            cost,
            iterations,
            termination,
            active_bounds: self.bounds.active(&params),
        }
    }
}

/// `½ Σ r²` at `p`.
fn sum_of_squares<M: CurveModel>(model: &M, xs: &[f64], ys: &[f64], p: &Vector4<f64>) -> f64 {
    let params = CurveParams::from_vector(p);
    0.5 * xs
        .iter()
        .zip(ys)
        .map(|(x, y)| {
            let r = model.value(*x, &params) - y;
            r * r
        })
        .sum::<f64>()
}

/// Accumulate `JᵀJ` and `Jᵀr` row by row.
fn normal_equations<M: CurveModel>(
    model: &M,
    xs: &[f64],
    ys: &[f64],
    p: &Vector4<f64>,
) -> (Matrix4<f64>, Vector4<f64>) {
    let params = CurveParams::from_vector(p);
    let mut jtj = Matrix4::zeros();
    let mut jtr = Vector4::zeros();
    for (x, y) in xs.iter().zip(ys) {
        let row = model.gradient(*x, &params);
        let r = model.value(*x, &params) - y;
        jtj += row * row.transpose();
        jtr += row * r;
    }
    (jtj, jtr)
}

/// Infinity norm of the gradient over the free parameters.
fn projected_norm(gradient: &Vector4<f64>, blocked: &[bool; 4]) -> f64 {
    gradient
        .iter()
        .zip(blocked)
        .filter(|(_, b)| !**b)
        .map(|(g, _)| g.abs())
        .fold(0.0, f64::max)
}

/// `Jᵀr''` for the second directional derivative of the residuals along
/// `velocity`, or `None` if it is not finite.
///
/// ```text
/// r'' ≈ (2/h)·((r(p + h·v) − r(p))/h − J·v)
/// ```
///
/// `Jᵀr(p)` and `JᵀJ` are reused from the current iteration, so only the
/// shifted residuals are evaluated.
fn curvature_gradient<M: CurveModel>(
    model: &M,
    xs: &[f64],
    ys: &[f64],
    p: &Vector4<f64>,
    velocity: &Vector4<f64>,
    jtj: &Matrix4<f64>,
    jtr: &Vector4<f64>,
) -> Option<Vector4<f64>> {
    let params = CurveParams::from_vector(p);
    let shifted = CurveParams::from_vector(&(p + velocity * GEODESIC_STEP));
    let mut jt_shifted = Vector4::zeros();
    for (x, y) in xs.iter().zip(ys) {
        jt_shifted += model.gradient(*x, &params) * (model.value(*x, &shifted) - y);
    }
    let curvature =
        ((jt_shifted - jtr) / GEODESIC_STEP - jtj * velocity) * (2.0 / GEODESIC_STEP);
    curvature.iter().all(|v| v.is_finite()).then_some(curvature)
}
