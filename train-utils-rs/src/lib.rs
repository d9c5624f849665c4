//! # train-utils-rs
//!
//! Utilities around an image-classification training run: learning-curve
//! extrapolation, class-conditional augmentation routing, and assembly of
//! several labeled image directories into one train/validation dataset.
//!
//! ## Learning-curve extrapolation
//!
//! [`EpochExtrapolator`] fits a four-parameter curve to the first `n` epochs
//! of a [`MetricHistory`] with a bounded Levenberg–Marquardt solver and
//! evaluates it over a longer horizon:
//!
//! ```text
//! logarithmic:           f(x) = a·ln(b·x + c) + d
//! geometric progression: f(x) = a·(1 − bˣ)/(1 − b) − c
//! ```
//!
//! ```rust
//! use train_utils_rs::{EpochExtrapolator, ExtrapolationConfig, MetricHistory};
//!
//! let history = MetricHistory::from_values([0.42, 0.61, 0.68, 0.71, 0.72])?;
//! let extrapolator = EpochExtrapolator::new(ExtrapolationConfig::default())?;
//! let result = extrapolator.extrapolate(&history, 65)?;
//!
//! assert_eq!(result.predicted.len(), 65);
//! # Ok::<(), train_utils_rs::TrainUtilsError>(())
//! ```
//!
//! ## Class-conditional augmentation
//!
//! [`ClassConditionalTrainer`] wraps any [`TrainStep`] and sends each sample
//! through one of two [`Augmenter`]s depending on whether its arg-max class is
//! in a [`ClassIndexSet`].
//!
//! ## Dataset assembly
//!
//! [`assemble`] splits each configured directory with its own validation
//! ratio, remaps labels into the primary directory's vocabulary and exposes
//! the result as partitioned [`SampleStream`]s; [`BatchLoader`] decodes a
//! batch into candle tensors.
//!
//! ## Modules
//!
//! - [`class_set`]: Immutable class index sets
//! - [`config`]: YAML configuration
//! - [`curve`]: Curve forms and their partial derivatives
//! - [`dataset`]: Directory splitting, concatenation and batch loading
//! - [`error`]: Error types and result alias
//! - [`extrapolate`]: Curve fitting and projection
//! - [`history`]: Per-epoch metric histories
//! - [`router`]: Class-conditional augmentation routing
//! - [`solver`]: Box-constrained nonlinear least squares

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod class_set;
pub mod config;
pub mod curve;
pub mod dataset;
pub mod error;
pub mod extrapolate;
pub mod history;
pub mod router;
pub mod solver;

// Re-export main types at crate root for convenience
pub use class_set::ClassIndexSet;
pub use config::{DatasetConfig, ExtrapolationConfig, SourceConfig, TrainUtilsConfig};
pub use curve::{Curve, CurveForm, CurveParams};
pub use error::{Result, TrainUtilsError};
pub use extrapolate::{EpochExtrapolator, Extrapolation, FittedCurve, FormComparison};
pub use history::{load_runs, MetricHistory, MetricStatistics};
pub use solver::{BoundedLeastSquares, FitReport, ParameterBounds, SolverConfig, Termination};

pub use dataset::{assemble, AssembledDataset, BatchLoader, Sample, SampleStream};
pub use router::{
    route_augmentation, Augmenter, ClassConditionalTrainer, RoutingStats, TrainStep,
};
