//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::curve::{CurveForm, CurveParams, DEFAULT_LOG_EPSILON};
use crate::error::{Result, TrainUtilsError};
use crate::solver::{ParameterBounds, SolverConfig};

/// Top-level configuration file.
///
/// # Example
///
/// ```rust
/// use train_utils_rs::TrainUtilsConfig;
///
/// let yaml = r#"
/// extrapolation:
///   form: geometric_progression
///   horizon: 30
/// dataset:
///   primary:
///     path: datasets/all_classes
///     validation_split: 0.5
///   batch_size: 16
/// "#;
///
/// let config = TrainUtilsConfig::from_yaml(yaml)?;
/// config.validate()?;
/// assert_eq!(config.extrapolation.horizon, 30);
/// assert_eq!(config.dataset.seed, 21);
/// # Ok::<(), train_utils_rs::TrainUtilsError>(())
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainUtilsConfig {
    /// Learning-curve extrapolation settings.
    #[serde(default)]
    pub extrapolation: ExtrapolationConfig,

    /// Image dataset assembly settings.
    #[serde(default)]
    pub dataset: DatasetConfig,
}

impl TrainUtilsConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::ConfigParse`] on malformed YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A filled-in starting point: the food/fruit directory layout with
    /// per-directory validation ratios and the fruit directory as the
    /// special source.
    #[must_use]
    pub fn sample() -> Self {
        let source = |path: &str, validation_split: f64, special: bool| SourceConfig {
            path: PathBuf::from(path),
            validation_split,
            special,
        };
        Self {
            extrapolation: ExtrapolationConfig::default(),
            dataset: DatasetConfig {
                primary: source("datasets/all_classes", 0.5, false),
                sources: vec![
                    source("datasets/cropped/continental", 0.01, false),
                    source("datasets/cropped/indian_0", 0.2, false),
                    source("datasets/cropped/indian_1", 0.2, false),
                    source("datasets/fruits-360/Training", 0.02, true),
                ],
                ..DatasetConfig::default()
            },
        }
    }

    /// Validate both sections.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.extrapolation.validate()?;
        self.dataset.validate()
    }
}

/// Learning-curve extrapolation settings.
///
/// # Example
///
/// ```rust
/// use train_utils_rs::{CurveForm, ExtrapolationConfig};
///
/// let config = ExtrapolationConfig::default()
///     .with_form(CurveForm::GeometricProgression)
///     .with_horizon(40);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtrapolationConfig {
    /// Curve family to fit.
    #[serde(default)]
    pub form: CurveForm,

    /// Number of epochs to predict (including the observed ones).
    #[serde(default = "default_horizon")]
    pub horizon: usize,

    /// Substitute for non-positive logarithm arguments.
    #[serde(default = "default_log_epsilon")]
    pub log_epsilon: f64,

    /// Starting point of the fit.
    #[serde(default)]
    pub initial_guess: CurveParams,

    /// Box constraints on the parameters.
    #[serde(default)]
    pub bounds: ParameterBounds,

    /// Solver stopping criteria.
    #[serde(default)]
    pub solver: SolverConfig,
}

fn default_horizon() -> usize {
    65
}
fn default_log_epsilon() -> f64 {
    DEFAULT_LOG_EPSILON
}

impl Default for ExtrapolationConfig {
    fn default() -> Self {
        Self {
            form: CurveForm::default(),
            horizon: default_horizon(),
            log_epsilon: default_log_epsilon(),
            initial_guess: CurveParams::default(),
            bounds: ParameterBounds::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl ExtrapolationConfig {
    /// Builder: Set the curve family.
    #[must_use]
    pub const fn with_form(mut self, form: CurveForm) -> Self {
        self.form = form;
        self
    }

    /// Builder: Set the prediction horizon.
    #[must_use]
    pub const fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon;
        self
    }

    /// Builder: Set the initial guess.
    #[must_use]
    pub const fn with_initial_guess(mut self, guess: CurveParams) -> Self {
        self.initial_guess = guess;
        self
    }

    /// Builder: Set the parameter bounds.
    #[must_use]
    pub const fn with_bounds(mut self, bounds: ParameterBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Builder: Set the solver criteria.
    #[must_use]
    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Validate the extrapolation settings.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::Config`] for a zero horizon, a non-positive
    /// epsilon, unusable bounds or solver criteria, or an initial guess
    /// outside the bounds.
    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(TrainUtilsError::Config(
                "extrapolation.horizon must be > 0".into(),
            ));
        }
        if !self.log_epsilon.is_finite() || self.log_epsilon <= 0.0 {
            return Err(TrainUtilsError::Config(format!(
                "extrapolation.log_epsilon must be > 0, got {}",
                self.log_epsilon
            )));
        }
        self.bounds.validate()?;
        self.solver.validate()?;
        if !self.bounds.contains(&self.initial_guess) {
            return Err(TrainUtilsError::Config(format!(
                "extrapolation.initial_guess {} lies outside the bounds",
                self.initial_guess
            )));
        }
        Ok(())
    }
}

/// One labeled image directory (`<path>/<class name>/<image files>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory with one sub-directory per class.
    pub path: PathBuf,

    /// Fraction of the directory's samples held out for validation.
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,

    /// Whether this directory's classes form the special augmentation set.
    #[serde(default)]
    pub special: bool,
}

fn default_validation_split() -> f64 {
    0.2
}

impl SourceConfig {
    /// Create a non-special source.
    pub fn new(path: impl Into<PathBuf>, validation_split: f64) -> Self {
        Self {
            path: path.into(),
            validation_split,
            special: false,
        }
    }

    /// Builder: Mark this source as special.
    #[must_use]
    pub fn with_special(mut self, special: bool) -> Self {
        self.special = special;
        self
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(TrainUtilsError::Config(format!("{field}.path is required")));
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(TrainUtilsError::Config(format!(
                "{field}.validation_split must be in (0, 1), got {}",
                self.validation_split
            )));
        }
        Ok(())
    }
}

/// Image dataset assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory whose class names define the label vocabulary. Its samples
    /// come first in both streams.
    pub primary: SourceConfig,

    /// Further directories, concatenated in this order.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Target `[height, width]` every image is resized to.
    #[serde(default = "default_image_size")]
    pub image_size: [usize; 2],

    /// Seed for the per-directory shuffle.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Shuffle each directory before splitting.
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_batch_size() -> usize {
    32
}
fn default_image_size() -> [usize; 2] {
    [224, 224]
}
fn default_seed() -> u64 {
    21
}
fn default_shuffle() -> bool {
    true
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            primary: SourceConfig::new("datasets/all_classes", 0.5),
            sources: Vec::new(),
            batch_size: default_batch_size(),
            image_size: default_image_size(),
            seed: default_seed(),
            shuffle: default_shuffle(),
        }
    }
}

impl DatasetConfig {
    /// Create a configuration around a primary directory.
    #[must_use]
    pub fn new(primary: SourceConfig) -> Self {
        Self {
            primary,
            ..Self::default()
        }
    }

    /// Builder: Append a source directory.
    #[must_use]
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    /// Builder: Set the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder: Set the target `[height, width]`.
    #[must_use]
    pub fn with_image_size(mut self, height: usize, width: usize) -> Self {
        self.image_size = [height, width];
        self
    }

    /// Builder: Set the shuffle seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Primary source followed by the others, in concatenation order.
    pub fn all_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        std::iter::once(&self.primary).chain(self.sources.iter())
    }

    /// Validate the dataset settings.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::Config`] for empty paths, split ratios
    /// outside `(0, 1)`, a zero batch size, or zero image dimensions.
    pub fn validate(&self) -> Result<()> {
        self.primary.validate("dataset.primary")?;
        for (i, source) in self.sources.iter().enumerate() {
            source.validate(&format!("dataset.sources[{i}]"))?;
        }
        if self.batch_size == 0 {
            return Err(TrainUtilsError::Config(
                "dataset.batch_size must be > 0".into(),
            ));
        }
        if self.image_size.contains(&0) {
            return Err(TrainUtilsError::Config(format!(
                "dataset.image_size must be non-zero, got {:?}",
                self.image_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = TrainUtilsConfig::default();
        assert_eq!(config.extrapolation.form, CurveForm::Logarithmic);
        assert_eq!(config.extrapolation.horizon, 65);
        assert_eq!(config.extrapolation.initial_guess, CurveParams::new(0.0, 0.5, 0.5, 1.0));
        assert_eq!(config.dataset.seed, 21);
        assert_eq!(config.dataset.batch_size, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = TrainUtilsConfig::sample();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored = TrainUtilsConfig::from_yaml(&yaml).unwrap();
        assert_eq!(restored.dataset.sources, config.dataset.sources);
        assert_eq!(restored.extrapolation.bounds, config.extrapolation.bounds);
    }

    #[test]
    fn test_sample_marks_fruit_source_special() {
        let config = TrainUtilsConfig::sample();
        let special: Vec<_> = config.dataset.all_sources().filter(|s| s.special).collect();
        assert_eq!(special.len(), 1);
        assert!(special[0].path.ends_with("fruits-360/Training"));
        assert_eq!(config.dataset.all_sources().count(), 5);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = TrainUtilsConfig::from_yaml("extrapolation:\n  form: gp_missing\n");
        assert!(config.is_err());

        let config = TrainUtilsConfig::from_yaml("extrapolation:\n  horizon: 12\n").unwrap();
        assert_eq!(config.extrapolation.horizon, 12);
        assert_eq!(config.extrapolation.solver.max_iterations, 10_000);
        assert_eq!(config.extrapolation.solver.gtol, 1e-8);
    }

    #[test]
    fn test_extrapolation_validation() {
        assert!(ExtrapolationConfig::default().with_horizon(0).validate().is_err());

        let mut config = ExtrapolationConfig::default();
        config.log_epsilon = 0.0;
        assert!(config.validate().is_err());

        let config = ExtrapolationConfig::default()
            .with_initial_guess(CurveParams::new(0.0, 2.0, 0.5, 1.0));
        assert!(config.validate().is_err());

        let config =
            ExtrapolationConfig::default().with_solver(SolverConfig::default().with_max_iterations(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dataset_validation() {
        let config = DatasetConfig::default().with_batch_size(0);
        assert!(config.validate().is_err());

        let config = DatasetConfig::default().with_image_size(0, 32);
        assert!(config.validate().is_err());

        let config = DatasetConfig::default().with_source(SourceConfig::new("extra", 1.0));
        assert!(config.validate().is_err());

        let config = DatasetConfig::new(SourceConfig::new("", 0.5));
        assert!(config.validate().is_err());

        let config = DatasetConfig::default().with_source(SourceConfig::new("extra", 0.25));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "dataset:\n  primary:\n    path: data/all\n  image_size: [64, 48]").unwrap();
        let config = TrainUtilsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dataset.primary.path, PathBuf::from("data/all"));
        assert!((config.dataset.primary.validation_split - 0.2).abs() < 1e-12);
        assert_eq!(config.dataset.image_size, [64, 48]);

        let out = NamedTempFile::new().unwrap();
        config.to_file(out.path()).unwrap();
        let reloaded = TrainUtilsConfig::from_file(out.path()).unwrap();
        assert_eq!(reloaded.dataset.image_size, [64, 48]);
    }
}
