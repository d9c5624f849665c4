//! Learning-curve extrapolation.
//!
//! Fits one of the [`CurveForm`]s to the observed epochs `x = 0..n` of a
//! [`MetricHistory`] and evaluates the fitted curve over `x = 0..h` for a
//! horizon `h ≥ n`.
//!
//! ```rust
//! use train_utils_rs::{EpochExtrapolator, ExtrapolationConfig, MetricHistory};
//!
//! let history = MetricHistory::from_values([0.42, 0.61, 0.68, 0.71, 0.72])?;
//! let extrapolator = EpochExtrapolator::new(ExtrapolationConfig::default())?;
//!
//! let result = extrapolator.extrapolate(&history, 10)?;
//! assert_eq!(result.predicted.len(), 10);
//! assert!((result.predicted[0] - 0.42).abs() < 0.05);
//! # Ok::<(), train_utils_rs::TrainUtilsError>(())
//! ```
//!
//! Fitting is a single attempt; a failure surfaces as an error and there is
//! no retry from a different starting point.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ExtrapolationConfig;
use crate::curve::{Curve, CurveForm, CurveParams};
use crate::error::{Result, TrainUtilsError};
use crate::history::MetricHistory;
use crate::solver::{BoundedLeastSquares, CurveModel, FitReport, Termination};

/// Fits learning curves and projects them forward.
#[derive(Debug, Clone)]
pub struct EpochExtrapolator {
    config: ExtrapolationConfig,
    solver: BoundedLeastSquares,
}

impl EpochExtrapolator {
    /// Create an extrapolator.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::Config`] if the configuration is invalid.
    pub fn new(config: ExtrapolationConfig) -> Result<Self> {
        config.validate()?;
        let solver = BoundedLeastSquares::new(config.solver.clone(), config.bounds);
        Ok(Self { config, solver })
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ExtrapolationConfig {
        &self.config
    }

    /// Fit the configured form to `history`.
    ///
    /// # Errors
    ///
    /// See [`EpochExtrapolator::fit_form`].
    pub fn fit(&self, history: &MetricHistory) -> Result<FittedCurve> {
        self.fit_form(history, self.config.form)
    }

    /// Fit a specific form to `history`.
    ///
    /// # Errors
    ///
    /// - [`TrainUtilsError::EmptyInput`] for an empty history.
    /// - [`TrainUtilsError::NotConverged`] / [`TrainUtilsError::NonFinite`]
    ///   when the solver fails.
    pub fn fit_form(&self, history: &MetricHistory, form: CurveForm) -> Result<FittedCurve> {
        if history.is_empty() {
            return Err(TrainUtilsError::EmptyInput(
                "metric history has no epochs".into(),
            ));
        }

        let curve = Curve::new(form, self.config.log_epsilon);
        let xs = history.epochs();
        let report = self
            .solver
            .minimize(&curve, &xs, history.values(), self.config.initial_guess)?;

        let fitted = FittedCurve {
            curve,
            report,
            observed: history.len(),
        };
        let rmse = fitted.rmse(history);

        if fitted.is_degenerate() {
            warn!(
                %form,
                b = fitted.params().b,
                "geometric ratio saturated at a bound; predictions are unreliable"
            );
        } else if fitted.report.active_bounds.iter().any(|active| *active) {
            warn!(%form, params = %fitted.params(), "fit rests on a parameter bound");
        }
        if fitted.report.termination == Termination::Stalled {
            warn!(%form, cost = fitted.report.cost, "solver stalled before meeting a tolerance");
        }
        info!(
            %form,
            params = %fitted.params(),
            rmse,
            iterations = fitted.report.iterations,
            "fitted learning curve"
        );

        Ok(fitted)
    }

    /// Fit the configured form and predict `horizon` epochs.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::InvalidHorizon`] if `horizon` is shorter
    /// than the history, or any error from [`EpochExtrapolator::fit`].
    pub fn extrapolate(&self, history: &MetricHistory, horizon: usize) -> Result<Extrapolation> {
        self.extrapolate_form(history, horizon, self.config.form)
    }

    /// Fit a specific form and predict `horizon` epochs.
    ///
    /// # Errors
    ///
    /// See [`EpochExtrapolator::extrapolate`].
    pub fn extrapolate_form(
        &self,
        history: &MetricHistory,
        horizon: usize,
        form: CurveForm,
    ) -> Result<Extrapolation> {
        check_horizon(horizon, history.len())?;
        let fitted = self.fit_form(history, form)?;
        Ok(fitted.extrapolation(history, horizon))
    }

    /// Fit every form independently and rank the successes by RMSE.
    ///
    /// Forms whose fit fails are returned separately with their error rather
    /// than aborting the comparison.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::InvalidHorizon`] before fitting anything if
    /// `horizon` is shorter than the history.
    pub fn compare_forms(
        &self,
        history: &MetricHistory,
        horizon: usize,
    ) -> Result<FormComparison> {
        check_horizon(horizon, history.len())?;
        let mut ranked = Vec::new();
        let mut failed = Vec::new();
        for form in CurveForm::ALL {
            match self.extrapolate_form(history, horizon, form) {
                Ok(extrapolation) => ranked.push(extrapolation),
                Err(e) => {
                    warn!(%form, error = %e, "form could not be fitted");
                    failed.push((form, e.to_string()));
                }
            }
        }
        ranked.sort_by(|a, b| a.rmse.total_cmp(&b.rmse));
        Ok(FormComparison { ranked, failed })
    }
}

fn check_horizon(horizon: usize, observed: usize) -> Result<()> {
    if horizon < observed {
        return Err(TrainUtilsError::InvalidHorizon { horizon, observed });
    }
    Ok(())
}

/// A curve fitted to a metric history.
#[derive(Debug, Clone)]
pub struct FittedCurve {
    curve: Curve,
    report: FitReport,
    observed: usize,
}

impl FittedCurve {
    /// Curve family.
    #[must_use]
    pub const fn form(&self) -> CurveForm {
        self.curve.form
    }

    /// Fitted parameters.
    #[must_use]
    pub const fn params(&self) -> CurveParams {
        self.report.params
    }

    /// Solver report.
    #[must_use]
    pub const fn report(&self) -> &FitReport {
        &self.report
    }

    /// Number of epochs the curve was fitted on.
    #[must_use]
    pub const fn observed(&self) -> usize {
        self.observed
    }

    /// Whether the parameters sit on a degenerate configuration.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.curve.form.is_degenerate(&self.report.params)
    }

    /// Curve value at epoch `x`.
    #[must_use]
    pub fn evaluate(&self, x: f64) -> f64 {
        self.curve.value(x, &self.report.params)
    }

    /// Curve values at epochs `0..horizon`.
    #[must_use]
    pub fn predict(&self, horizon: usize) -> Vec<f64> {
        (0..horizon).map(|x| self.evaluate(x as f64)).collect()
    }

    /// Root-mean-square error against `history`.
    #[must_use]
    pub fn rmse(&self, history: &MetricHistory) -> f64 {
        if history.is_empty() {
            return 0.0;
        }
        let sum: f64 = history
            .values()
            .iter()
            .enumerate()
            .map(|(x, y)| (self.evaluate(x as f64) - y).powi(2))
            .sum();
        (sum / history.len() as f64).sqrt()
    }

    fn extrapolation(&self, history: &MetricHistory, horizon: usize) -> Extrapolation {
        Extrapolation {
            form: self.form(),
            params: self.params(),
            observed: history.values().to_vec(),
            predicted: self.predict(horizon),
            rmse: self.rmse(history),
            iterations: self.report.iterations,
            termination: self.report.termination,
            degenerate: self.is_degenerate(),
        }
    }
}

/// Observed and predicted values for one fitted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extrapolation {
    /// Curve family.
    pub form: CurveForm,
    /// Fitted parameters.
    pub params: CurveParams,
    /// Observed values, epochs `0..n`.
    pub observed: Vec<f64>,
    /// Predicted values, epochs `0..horizon`.
    pub predicted: Vec<f64>,
    /// Root-mean-square error over the observed epochs.
    pub rmse: f64,
    /// Solver iterations.
    pub iterations: usize,
    /// Solver stopping reason.
    pub termination: Termination,
    /// Whether the fit is degenerate.
    pub degenerate: bool,
}

impl Extrapolation {
    /// Prediction for the last epoch of the horizon.
    #[must_use]
    pub fn final_value(&self) -> Option<f64> {
        self.predicted.last().copied()
    }
}

/// Result of fitting every curve form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormComparison {
    /// Successful fits, best (lowest RMSE) first.
    pub ranked: Vec<Extrapolation>,
    /// Forms that could not be fitted, with the error message.
    pub failed: Vec<(CurveForm, String)>,
}

impl FormComparison {
    /// The best-fitting form, if any fit succeeded.
    #[must_use]
    pub fn best(&self) -> Option<&Extrapolation> {
        self.ranked.first()
    }
}
