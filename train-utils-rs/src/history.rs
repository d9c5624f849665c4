//! Per-epoch metric history.
//!
//! A [`MetricHistory`] is the append-only record of an evaluation metric
//! (accuracy, top-k, ...) with one value per epoch. Values are restricted to
//! `[0, 1]`. The extrapolator reads it; nothing in the crate mutates it after
//! recording.
//!
//! # Example
//!
//! ```rust
//! use train_utils_rs::MetricHistory;
//!
//! let mut history = MetricHistory::new();
//! history.record(0.42)?;
//! history.record(0.61)?;
//!
//! let stats = history.statistics().unwrap();
//! assert_eq!(stats.count, 2);
//! assert_eq!(history.best(), Some((1, 0.61)));
//! # Ok::<(), train_utils_rs::TrainUtilsError>(())
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainUtilsError};

/// Run name given to a history file that holds a bare array.
pub const DEFAULT_RUN: &str = "default";

/// Statistical summary of a metric history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatistics {
    /// Number of epochs recorded.
    pub count: usize,
    /// Mean value.
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
}

/// Append-only per-epoch metric values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricHistory {
    values: Vec<f64>,
}

impl MetricHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history from existing values.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::InvalidValue`] if any value is non-finite or
    /// outside `[0, 1]`.
    pub fn from_values<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut history = Self::new();
        for value in values {
            history.record(value)?;
        }
        Ok(history)
    }

    /// Record the metric for the next epoch.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::InvalidValue`] if `value` is non-finite or
    /// outside `[0, 1]`.
    pub fn record(&mut self, value: f64) -> Result<()> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(TrainUtilsError::InvalidValue(format!(
                "metric value {value} at epoch {} is outside [0, 1]",
                self.values.len()
            )));
        }
        self.values.push(value);
        Ok(())
    }

    /// Number of recorded epochs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Recorded values in epoch order.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Epoch indices `0..len` as reals.
    #[must_use]
    pub fn epochs(&self) -> Vec<f64> {
        (0..self.values.len()).map(|i| i as f64).collect()
    }

    /// Most recent value.
    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Highest value and the first epoch it was reached.
    #[must_use]
    pub fn best(&self) -> Option<(usize, f64)> {
        self.values
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (epoch, value)| match best {
                Some((_, v)) if v >= value => best,
                _ => Some((epoch, value)),
            })
    }

    /// Summary statistics over every recorded epoch.
    #[must_use]
    pub fn statistics(&self) -> Option<MetricStatistics> {
        if self.values.is_empty() {
            return None;
        }
        let n = self.values.len() as f64;
        let mean = self.values.iter().sum::<f64>() / n;
        let variance = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let (min, max) = self
            .values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        Some(MetricStatistics {
            count: self.values.len(),
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
        })
    }

    /// Whether the last `window` epochs moved by less than `tolerance`.
    #[must_use]
    pub fn is_plateaued(&self, window: usize, tolerance: f64) -> bool {
        if window < 2 || self.values.len() < window {
            return false;
        }
        let recent = &self.values[self.values.len() - window..];
        let (lo, hi) = recent
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        hi - lo < tolerance
    }
}

/// On-disk layout of a history file.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Single(Vec<f64>),
    Runs(serde_json::Map<String, serde_json::Value>),
}

/// Load metric histories from a JSON file.
///
/// Two layouts are accepted:
///
/// - a bare array, returned as a single run named [`DEFAULT_RUN`];
/// - an object mapping run names to arrays, returned in file order.
///   Empty runs are kept so callers can report them.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not one of the layouts
/// above, or holds values outside `[0, 1]`.
pub fn load_runs<P: AsRef<Path>>(path: P) -> Result<Vec<(String, MetricHistory)>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_runs(&content)
}

/// Parse metric histories from JSON text; see [`load_runs`].
///
/// # Errors
///
/// Returns an error on malformed JSON or invalid metric values.
pub fn parse_runs(content: &str) -> Result<Vec<(String, MetricHistory)>> {
    match serde_json::from_str::<HistoryFile>(content)? {
        HistoryFile::Single(values) => Ok(vec![(
            DEFAULT_RUN.to_string(),
            MetricHistory::from_values(values)?,
        )]),
        HistoryFile::Runs(runs) => runs
            .into_iter()
            .map(|(name, value)| -> Result<(String, MetricHistory)> {
                let values: Vec<f64> = serde_json::from_value(value)?;
                let history = MetricHistory::from_values(values)?;
                Ok((name, history))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_record_and_read_back() {
        let mut history = MetricHistory::new();
        assert!(history.is_empty());
        history.record(0.5).unwrap();
        history.record(0.7).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.values(), &[0.5, 0.7]);
        assert_eq!(history.epochs(), vec![0.0, 1.0]);
        assert_eq!(history.last(), Some(0.7));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut history = MetricHistory::new();
        assert!(history.record(-0.01).is_err());
        assert!(history.record(1.01).is_err());
        assert!(history.record(f64::NAN).is_err());
        assert!(history.is_empty());
        assert!(history.record(0.0).is_ok());
        assert!(history.record(1.0).is_ok());
    }

    #[test]
    fn test_best_keeps_first_maximum() {
        let history = MetricHistory::from_values([0.3, 0.8, 0.6, 0.8]).unwrap();
        assert_eq!(history.best(), Some((1, 0.8)));
        assert_eq!(MetricHistory::new().best(), None);
    }

    #[test]
    fn test_statistics() {
        let history = MetricHistory::from_values([0.2, 0.4, 0.6]).unwrap();
        let stats = history.statistics().unwrap();
        assert_eq!(stats.count, 3);
        assert!((stats.mean - 0.4).abs() < 1e-12);
        assert!((stats.std_dev - (0.08f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(stats.min, 0.2);
        assert_eq!(stats.max, 0.6);
        assert!(MetricHistory::new().statistics().is_none());
    }

    #[test]
    fn test_plateau_detection() {
        let history = MetricHistory::from_values([0.4, 0.6, 0.700, 0.701, 0.702]).unwrap();
        assert!(history.is_plateaued(3, 0.01));
        assert!(!history.is_plateaued(4, 0.01));
        assert!(!history.is_plateaued(10, 0.01));
    }

    #[test]
    fn test_parse_bare_array() {
        let runs = parse_runs("[0.1, 0.2, 0.3]").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, DEFAULT_RUN);
        assert_eq!(runs[0].1.len(), 3);
    }

    #[test]
    fn test_parse_named_runs_keeps_file_order_and_empty_runs() {
        let runs = parse_runs(r#"{"zeta": [0.1], "0.5": [0.42, 0.61], "alpha": [], "0.1": []}"#)
            .unwrap();
        let names: Vec<&str> = runs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "0.5", "alpha", "0.1"]);
        let lengths: Vec<usize> = runs.iter().map(|(_, h)| h.len()).collect();
        assert_eq!(lengths, vec![1, 2, 0, 0]);
    }

    #[test]
    fn test_parse_rejects_invalid_documents() {
        assert!(parse_runs(r#"{"run": "not an array"}"#).is_err());
        assert!(parse_runs("[0.5, 2.0]").is_err());
        assert!(parse_runs("42").is_err());
    }

    #[test]
    fn test_load_runs_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[0.55, 0.60, 0.63]").unwrap();
        let runs = load_runs(file.path()).unwrap();
        assert_eq!(runs[0].1.values(), &[0.55, 0.60, 0.63]);
    }
}
