//! Class-conditional augmentation routing.
//!
//! Each sample in a batch is sent through one of two augmentation pipelines
//! depending on whether its class belongs to a [`ClassIndexSet`]:
//!
//! ```text
//! class_i   = argmax(labels[i, :])
//! special_i = class_i ∈ S
//! out[i]    = special_i ? special(images)[i] : default(images)[i]
//! ```
//!
//! The membership mask is broadcast over every non-batch dimension of the
//! images and applied with a tensor select. The routed batch is then handed to
//! a wrapped base training step; [`ClassConditionalTrainer`] composes the two
//! and is itself a [`TrainStep`], so wrappers can be stacked.
//!
//! Pipelines are only run when their output is used: a batch with no special
//! samples never calls the special pipeline, and vice versa.

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::class_set::ClassIndexSet;
use crate::error::{Result, TrainUtilsError};

/// An image augmentation pipeline over a batch `[N, ...]`.
///
/// Implementations must return a tensor with the input's shape.
pub trait Augmenter {
    /// Augment a batch of images.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn augment(&self, images: &Tensor) -> Result<Tensor>;
}

impl<F> Augmenter for F
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    fn augment(&self, images: &Tensor) -> Result<Tensor> {
        self(images)
    }
}

/// A supervised training step over `(images, one-hot labels)`.
pub trait TrainStep {
    /// Whatever the step reports (loss, metrics, ...).
    type Output;

    /// Run one optimization step on a batch.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<Self::Output>;
}

impl<F, O> TrainStep for F
where
    F: FnMut(&Tensor, &Tensor) -> Result<O>,
{
    type Output = O;

    fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<O> {
        self(images, labels)
    }
}

/// Per-sample class index: arg-max of each one-hot label row.
///
/// # Errors
///
/// Returns [`TrainUtilsError::ShapeMismatch`] unless `labels` is `[N, K]`
/// with `K > 0`.
pub fn class_indices(labels: &Tensor) -> Result<Vec<usize>> {
    let dims = labels.dims();
    if dims.len() != 2 || dims[1] == 0 {
        return Err(TrainUtilsError::ShapeMismatch {
            expected: vec![dims.first().copied().unwrap_or(0), 1],
            actual: dims.to_vec(),
        });
    }
    let indices = labels.argmax(D::Minus1)?.to_vec1::<u32>()?;
    Ok(indices.into_iter().map(|i| i as usize).collect())
}

/// Per-sample membership of the arg-max class in `classes`.
///
/// # Errors
///
/// See [`class_indices`].
pub fn membership_mask(labels: &Tensor, classes: &ClassIndexSet) -> Result<Vec<bool>> {
    Ok(classes.membership(&class_indices(labels)?))
}

/// A batch after routing.
#[derive(Debug, Clone)]
pub struct RoutedBatch {
    /// Augmented images, same shape as the input.
    pub images: Tensor,
    /// Which samples took the special pipeline.
    pub mask: Vec<bool>,
}

impl RoutedBatch {
    /// Samples routed to the special pipeline.
    #[must_use]
    pub fn special_count(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }

    /// Samples routed to the default pipeline.
    #[must_use]
    pub fn default_count(&self) -> usize {
        self.mask.len() - self.special_count()
    }
}

/// Route each sample of `images` through `special` or `default` by class.
///
/// # Errors
///
/// - [`TrainUtilsError::ShapeMismatch`] if labels are not `[N, K]`, the
///   images' leading dimension is not `N`, or a pipeline changes the shape.
/// - Any error raised by a pipeline.
pub fn route_augmentation<P, Q>(
    images: &Tensor,
    labels: &Tensor,
    classes: &ClassIndexSet,
    special: &P,
    default: &Q,
) -> Result<RoutedBatch>
where
    P: Augmenter + ?Sized,
    Q: Augmenter + ?Sized,
{
    let mask = membership_mask(labels, classes)?;
    let dims = images.dims();
    if dims.first() != Some(&mask.len()) {
        let mut expected = dims.to_vec();
        match expected.first_mut() {
            Some(n) => *n = mask.len(),
            None => expected.push(mask.len()),
        }
        return Err(TrainUtilsError::ShapeMismatch {
            expected,
            actual: dims.to_vec(),
        });
    }

    let special_count = mask.iter().filter(|m| **m).count();
    let routed = if special_count == 0 {
        same_shape(default.augment(images)?, images)?
    } else if special_count == mask.len() {
        same_shape(special.augment(images)?, images)?
    } else {
        let on_special = same_shape(special.augment(images)?, images)?;
        let on_default = same_shape(default.augment(images)?, images)?;
        selection_mask(&mask, images)?.where_cond(&on_special, &on_default)?
    };

    debug!(
        special = special_count,
        default = mask.len() - special_count,
        "routed augmentation batch"
    );
    Ok(RoutedBatch {
        images: routed,
        mask,
    })
}

/// `[N]` booleans broadcast to the full image shape as a `u8` tensor.
fn selection_mask(mask: &[bool], images: &Tensor) -> Result<Tensor> {
    let values: Vec<u8> = mask.iter().map(|m| u8::from(*m)).collect();
    let mut shape = vec![1usize; images.rank()];
    shape[0] = mask.len();
    let mask = Tensor::from_vec(values, mask.len(), images.device())?
        .reshape(shape)?
        .broadcast_as(images.shape())?;
    Ok(mask)
}

fn same_shape(augmented: Tensor, original: &Tensor) -> Result<Tensor> {
    if augmented.dims() != original.dims() {
        return Err(TrainUtilsError::ShapeMismatch {
            expected: original.dims().to_vec(),
            actual: augmented.dims().to_vec(),
        });
    }
    Ok(augmented)
}

/// Running totals of routing decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingStats {
    /// Training steps run.
    pub steps: usize,
    /// Samples sent through the special pipeline.
    pub special_samples: usize,
    /// Samples sent through the default pipeline.
    pub default_samples: usize,
}

impl RoutingStats {
    fn record(&mut self, batch: &RoutedBatch) {
        self.steps += 1;
        self.special_samples += batch.special_count();
        self.default_samples += batch.default_count();
    }

    /// Fraction of samples that took the special pipeline.
    #[must_use]
    pub fn special_fraction(&self) -> f64 {
        let total = self.special_samples + self.default_samples;
        if total == 0 {
            0.0
        } else {
            self.special_samples as f64 / total as f64
        }
    }
}

/// Wraps a base training step with class-conditional augmentation.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use train_utils_rs::{ClassConditionalTrainer, ClassIndexSet, Result, TrainStep};
///
/// let device = Device::Cpu;
/// let images = Tensor::zeros((2, 4, 4, 3), candle_core::DType::F32, &device)?;
/// let labels = Tensor::new(&[[1f32, 0.0, 0.0], [0.0, 0.0, 1.0]], &device)?;
///
/// let fruit = |x: &Tensor| -> Result<Tensor> { Ok(x.affine(1.0, 1.0)?) };
/// let food = |x: &Tensor| -> Result<Tensor> { Ok(x.clone()) };
/// let base = |x: &Tensor, _y: &Tensor| -> Result<f32> { Ok(x.sum_all()?.to_scalar::<f32>()?) };
///
/// let mut trainer = ClassConditionalTrainer::new(base, fruit, food, ClassIndexSet::from_indices([2]));
/// let total = trainer.train_step(&images, &labels)?;
/// assert_eq!(total, 48.0);
/// assert_eq!(trainer.routing_stats().special_samples, 1);
/// # Ok::<(), train_utils_rs::TrainUtilsError>(())
/// ```
#[derive(Debug)]
pub struct ClassConditionalTrainer<S, P, Q> {
    base: S,
    special: P,
    default: Q,
    classes: ClassIndexSet,
    stats: RoutingStats,
}

impl<S, P, Q> ClassConditionalTrainer<S, P, Q>
where
    S: TrainStep,
    P: Augmenter,
    Q: Augmenter,
{
    /// Compose a base step with a special and a default pipeline.
    pub fn new(base: S, special: P, default: Q, classes: ClassIndexSet) -> Self {
        Self {
            base,
            special,
            default,
            classes,
            stats: RoutingStats::default(),
        }
    }

    /// Classes routed to the special pipeline.
    #[must_use]
    pub const fn classes(&self) -> &ClassIndexSet {
        &self.classes
    }

    /// Routing totals so far.
    #[must_use]
    pub const fn routing_stats(&self) -> &RoutingStats {
        &self.stats
    }

    /// The wrapped base step.
    #[must_use]
    pub const fn base(&self) -> &S {
        &self.base
    }

    /// Mutable access to the wrapped base step.
    pub fn base_mut(&mut self) -> &mut S {
        &mut self.base
    }

    /// Unwrap the base step.
    pub fn into_base(self) -> S {
        self.base
    }
}

impl<S, P, Q> TrainStep for ClassConditionalTrainer<S, P, Q>
where
    S: TrainStep,
    P: Augmenter,
    Q: Augmenter,
{
    type Output = S::Output;

    fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<S::Output> {
        let routed =
            route_augmentation(images, labels, &self.classes, &self.special, &self.default)?;
        self.stats.record(&routed);
        self.base.train_step(&routed.images, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::cell::Cell;

    /// One-hot labels for the given class indices.
    fn one_hot(classes: &[usize], num_classes: usize) -> Tensor {
        let mut data = vec![0f32; classes.len() * num_classes];
        for (row, class) in classes.iter().enumerate() {
            data[row * num_classes + class] = 1.0;
        }
        Tensor::from_vec(data, (classes.len(), num_classes), &Device::Cpu).unwrap()
    }

    fn images(n: usize) -> Tensor {
        Tensor::zeros((n, 2, 2, 3), DType::F32, &Device::Cpu).unwrap()
    }

    fn plus(value: f64) -> impl Fn(&Tensor) -> Result<Tensor> {
        move |x: &Tensor| -> Result<Tensor> { Ok(x.affine(1.0, value)?) }
    }

    /// Per-sample mean after routing.
    fn sample_means(t: &Tensor) -> Vec<f32> {
        t.flatten_from(1)
            .unwrap()
            .mean(1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn test_class_indices_are_argmax() {
        let labels = one_hot(&[1, 2, 5, 7], 8);
        assert_eq!(class_indices(&labels).unwrap(), vec![1, 2, 5, 7]);
    }

    #[test]
    fn test_membership_mask() {
        let labels = one_hot(&[1, 2, 5, 7], 8);
        let classes = ClassIndexSet::from_indices([2, 5]);
        assert_eq!(
            membership_mask(&labels, &classes).unwrap(),
            vec![false, true, true, false]
        );
    }

    #[test]
    fn test_empty_set_mask_is_all_false() {
        let labels = one_hot(&[0, 3, 3, 1, 2], 4);
        let mask = membership_mask(&labels, &ClassIndexSet::empty()).unwrap();
        assert_eq!(mask, vec![false; 5]);
    }

    #[test]
    fn test_labels_must_be_rank_two() {
        let labels = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            class_indices(&labels),
            Err(TrainUtilsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_route_selects_per_sample() {
        let labels = one_hot(&[1, 2, 5, 7], 8);
        let classes = ClassIndexSet::from_indices([2, 5]);
        let routed =
            route_augmentation(&images(4), &labels, &classes, &plus(10.0), &plus(1.0)).unwrap();

        assert_eq!(routed.images.dims(), &[4, 2, 2, 3]);
        assert_eq!(sample_means(&routed.images), vec![1.0, 10.0, 10.0, 1.0]);
        assert_eq!(routed.special_count(), 2);
        assert_eq!(routed.default_count(), 2);
    }

    #[test]
    fn test_empty_set_only_runs_default_pipeline() {
        let special_calls = Cell::new(0);
        let default_calls = Cell::new(0);
        let special = |x: &Tensor| -> Result<Tensor> {
            special_calls.set(special_calls.get() + 1);
            Ok(x.clone())
        };
        let default = |x: &Tensor| -> Result<Tensor> {
            default_calls.set(default_calls.get() + 1);
            Ok(x.affine(1.0, 2.0)?)
        };

        let labels = one_hot(&[0, 1, 2], 3);
        let routed =
            route_augmentation(&images(3), &labels, &ClassIndexSet::empty(), &special, &default)
                .unwrap();

        assert_eq!(sample_means(&routed.images), vec![2.0, 2.0, 2.0]);
        assert_eq!(special_calls.get(), 0);
        assert_eq!(default_calls.get(), 1);
    }

    #[test]
    fn test_all_special_skips_default_pipeline() {
        let default = |_: &Tensor| -> Result<Tensor> {
            Err(TrainUtilsError::Augment("default pipeline must not run".into()))
        };
        let labels = one_hot(&[4, 4], 5);
        let routed = route_augmentation(
            &images(2),
            &labels,
            &ClassIndexSet::from_indices([4]),
            &plus(3.0),
            &default,
        )
        .unwrap();
        assert_eq!(sample_means(&routed.images), vec![3.0, 3.0]);
    }

    #[test]
    fn test_batch_size_mismatch() {
        let labels = one_hot(&[0, 1], 2);
        let err = route_augmentation(
            &images(3),
            &labels,
            &ClassIndexSet::empty(),
            &plus(0.0),
            &plus(0.0),
        )
        .unwrap_err();
        assert!(matches!(err, TrainUtilsError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_pipeline_changing_shape_is_rejected() {
        let shrink = |x: &Tensor| -> Result<Tensor> { Ok(x.narrow(1, 0, 1)?) };
        let labels = one_hot(&[0, 1], 2);
        let err = route_augmentation(
            &images(2),
            &labels,
            &ClassIndexSet::from_indices([0]),
            &shrink,
            &plus(0.0),
        )
        .unwrap_err();
        assert!(matches!(err, TrainUtilsError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_trainer_delegates_augmented_batch() {
        let mut seen = Vec::new();
        let base = |x: &Tensor, y: &Tensor| -> Result<usize> {
            seen.push(sample_means(x));
            Ok(y.dims()[0])
        };
        let mut trainer =
            ClassConditionalTrainer::new(base, plus(5.0), plus(-1.0), ClassIndexSet::from_indices([1]));

        let labels = one_hot(&[1, 0, 1], 2);
        assert_eq!(trainer.train_step(&images(3), &labels).unwrap(), 3);
        let labels = one_hot(&[0, 0], 2);
        assert_eq!(trainer.train_step(&images(2), &labels).unwrap(), 2);

        let stats = *trainer.routing_stats();
        assert_eq!(stats.steps, 2);
        assert_eq!(stats.special_samples, 2);
        assert_eq!(stats.default_samples, 3);
        assert!((stats.special_fraction() - 0.4).abs() < 1e-12);

        drop(trainer);
        assert_eq!(seen[0], vec![5.0, -1.0, 5.0]);
        assert_eq!(seen[1], vec![-1.0, -1.0]);
    }

    #[test]
    fn test_trainers_compose() {
        let base = |x: &Tensor, _: &Tensor| -> Result<Vec<f32>> { Ok(sample_means(x)) };
        let inner =
            ClassConditionalTrainer::new(base, plus(100.0), plus(0.0), ClassIndexSet::from_indices([0]));
        let mut outer =
            ClassConditionalTrainer::new(inner, plus(10.0), plus(0.0), ClassIndexSet::from_indices([1]));

        let labels = one_hot(&[0, 1, 2], 3);
        let means = outer.train_step(&images(3), &labels).unwrap();
        assert_eq!(means, vec![100.0, 10.0, 0.0]);
        assert_eq!(outer.base().routing_stats().special_samples, 1);
    }
}
