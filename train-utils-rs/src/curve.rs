//! Parametric learning-curve forms.
//!
//! Two four-parameter families are available for modelling a per-epoch metric:
//!
//! ```text
//! Logarithmic:           f(x) = a·ln(t) + d,   t = b·x + c   (t ≤ 0 → ε)
//! Geometric progression: f(x) = a·(1 − bˣ)/(1 − b) − c
//! ```
//!
//! The logarithmic form never raises a domain error: a non-positive argument is
//! replaced by a small epsilon (default [`DEFAULT_LOG_EPSILON`]). Positive
//! arguments below epsilon are used as-is.
//!
//! The geometric form does not use `d`, and is singular at `b = 1`; there the
//! analytic limit `a·x − c` is evaluated instead.

use std::fmt;
use std::str::FromStr;

use nalgebra::Vector4;
use serde::{Deserialize, Serialize};

use crate::error::TrainUtilsError;
use crate::solver::CurveModel;

/// Substitute for non-positive logarithm arguments.
pub const DEFAULT_LOG_EPSILON: f64 = 1e-4;

/// Below this distance from 1 the geometric ratio is evaluated at its limit.
const GEOMETRIC_SINGULARITY: f64 = 1e-12;

/// Below this distance from 1 the geometric derivative uses its series limit.
const GEOMETRIC_DERIVATIVE_SINGULARITY: f64 = 1e-6;

/// A ratio this close to ±1 marks a saturated (degenerate) geometric fit.
const SATURATION_TOLERANCE: f64 = 1e-6;

/// Parametric family used to model a learning curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveForm {
    /// `a·ln(b·x + c) + d`
    #[default]
    Logarithmic,
    /// `a·(1 − bˣ)/(1 − b) − c`
    GeometricProgression,
}

impl CurveForm {
    /// Every supported form, in declaration order.
    pub const ALL: [Self; 2] = [Self::Logarithmic, Self::GeometricProgression];

    /// Evaluate the curve at `x`.
    #[must_use]
    pub fn evaluate(self, x: f64, params: &CurveParams, epsilon: f64) -> f64 {
        let CurveParams { a, b, c, d } = *params;
        match self {
            Self::Logarithmic => {
                let t = b * x + c;
                let t = if t <= 0.0 { epsilon } else { t };
                a * t.ln() + d
            }
            Self::GeometricProgression => a * geometric_sum(b, x) - c,
        }
    }

    /// Partial derivatives of the curve at `x` with respect to `(a, b, c, d)`.
    ///
    /// In the substituted region of the logarithmic form the curve is constant
    /// in `b` and `c`, so those partials are zero.
    #[must_use]
    pub fn partials(self, x: f64, params: &CurveParams, epsilon: f64) -> Vector4<f64> {
        let CurveParams { a, b, c, .. } = *params;
        match self {
            Self::Logarithmic => {
                let t = b * x + c;
                if t <= 0.0 {
                    Vector4::new(epsilon.ln(), 0.0, 0.0, 1.0)
                } else {
                    Vector4::new(t.ln(), a * x / t, a / t, 1.0)
                }
            }
            Self::GeometricProgression => {
                Vector4::new(geometric_sum(b, x), a * geometric_sum_db(b, x), -1.0, 0.0)
            }
        }
    }

    /// Whether fitted parameters sit on a numerically degenerate configuration.
    ///
    /// Only the geometric form has one: a ratio saturated at either bound
    /// (`b ≈ ±1`).
    #[must_use]
    pub fn is_degenerate(self, params: &CurveParams) -> bool {
        match self {
            Self::Logarithmic => false,
            Self::GeometricProgression => {
                (1.0 - params.b).abs() < SATURATION_TOLERANCE
                    || (1.0 + params.b).abs() < SATURATION_TOLERANCE
            }
        }
    }

    /// Short name used on the command line and in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Logarithmic => "logarithmic",
            Self::GeometricProgression => "geometric_progression",
        }
    }
}

impl fmt::Display for CurveForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CurveForm {
    type Err = TrainUtilsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" | "logarithmic" => Ok(Self::Logarithmic),
            "gp" | "geometric" | "geometric_progression" => Ok(Self::GeometricProgression),
            _ => Err(TrainUtilsError::Config(format!(
                "unknown curve form '{s}', use log or gp"
            ))),
        }
    }
}

/// `(1 − bˣ)/(1 − b)`, with the `b → 1` limit `x`.
fn geometric_sum(b: f64, x: f64) -> f64 {
    if (1.0 - b).abs() < GEOMETRIC_SINGULARITY {
        x
    } else {
        (1.0 - b.powf(x)) / (1.0 - b)
    }
}

/// `d/db (1 − bˣ)/(1 − b)`, with the `b → 1` limit `x(x − 1)/2`.
fn geometric_sum_db(b: f64, x: f64) -> f64 {
    if x == 0.0 {
        return 0.0;
    }
    let one_minus_b = 1.0 - b;
    if one_minus_b.abs() < GEOMETRIC_DERIVATIVE_SINGULARITY {
        return x * (x - 1.0) / 2.0;
    }
    (1.0 - b.powf(x) - x * b.powf(x - 1.0) * one_minus_b) / (one_minus_b * one_minus_b)
}

/// A curve form paired with its log-domain epsilon.
///
/// This is the model handed to the least-squares solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    /// Parametric family.
    pub form: CurveForm,
    /// Substitute for non-positive logarithm arguments.
    pub epsilon: f64,
}

impl Curve {
    /// Create a curve model.
    #[must_use]
    pub const fn new(form: CurveForm, epsilon: f64) -> Self {
        Self { form, epsilon }
    }
}

impl From<CurveForm> for Curve {
    fn from(form: CurveForm) -> Self {
        Self::new(form, DEFAULT_LOG_EPSILON)
    }
}

impl CurveModel for Curve {
    fn value(&self, x: f64, params: &CurveParams) -> f64 {
        self.form.evaluate(x, params, self.epsilon)
    }

    fn gradient(&self, x: f64, params: &CurveParams) -> Vector4<f64> {
        self.form.partials(x, params, self.epsilon)
    }
}

/// The four curve parameters `(a, b, c, d)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveParams {
    /// Scale.
    pub a: f64,
    /// Rate (slope of the log argument, or geometric ratio).
    pub b: f64,
    /// Offset of the log argument, or negated constant term.
    pub c: f64,
    /// Additive constant (logarithmic form only).
    pub d: f64,
}

impl CurveParams {
    /// Create parameters from their components.
    #[must_use]
    pub const fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self { a, b, c, d }
    }

    /// Parameters as `[a, b, c, d]`.
    #[must_use]
    pub const fn to_array(self) -> [f64; 4] {
        [self.a, self.b, self.c, self.d]
    }

    /// Parameters from `[a, b, c, d]`.
    #[must_use]
    pub const fn from_array(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub(crate) fn to_vector(self) -> Vector4<f64> {
        Vector4::new(self.a, self.b, self.c, self.d)
    }

    pub(crate) fn from_vector(v: &Vector4<f64>) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    /// Whether every component is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

impl Default for CurveParams {
    fn default() -> Self {
        Self::new(0.0, 0.5, 0.5, 1.0)
    }
}

impl fmt::Display for CurveParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.8e} {:.8e} {:.8e} {:.8e}]",
            self.a, self.b, self.c, self.d
        )
    }
}
