//! Immutable sets of class indices.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainUtilsError};

/// A fixed subset of class indices out of a label vocabulary.
///
/// Built once, before training; lookups of unknown class names fail here
/// rather than inside a training step.
///
/// # Example
///
/// ```rust
/// use train_utils_rs::ClassIndexSet;
///
/// let vocabulary = ["apple", "curry", "banana", "naan"];
/// let fruit = ClassIndexSet::from_names(&vocabulary, &["banana", "apple"])?;
///
/// assert_eq!(fruit.indices(), vec![0, 2]);
/// assert!(fruit.contains(2));
/// assert!(!fruit.contains(1));
/// # Ok::<(), train_utils_rs::TrainUtilsError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassIndexSet {
    indices: BTreeSet<usize>,
}

impl ClassIndexSet {
    /// The empty set: no class is special.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a set from raw indices.
    pub fn from_indices<I>(indices: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        Self {
            indices: indices.into_iter().collect(),
        }
    }

    /// Resolve class names against `vocabulary` (the ordered list of all
    /// class names, whose positions are the label indices).
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::UnknownClass`] for the first name that is
    /// not in the vocabulary.
    pub fn from_names<V, N>(vocabulary: &[V], names: &[N]) -> Result<Self>
    where
        V: AsRef<str>,
        N: AsRef<str>,
    {
        let indices = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                vocabulary
                    .iter()
                    .position(|entry| entry.as_ref() == name)
                    .ok_or_else(|| TrainUtilsError::UnknownClass {
                        name: name.to_string(),
                        vocabulary_size: vocabulary.len(),
                    })
            })
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self { indices })
    }

    /// Whether `class_index` is in the set.
    #[must_use]
    pub fn contains(&self, class_index: usize) -> bool {
        self.indices.contains(&class_index)
    }

    /// Number of classes in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Indices in ascending order.
    #[must_use]
    pub fn indices(&self) -> Vec<usize> {
        self.indices.iter().copied().collect()
    }

    /// Membership of each class index in `class_indices`.
    #[must_use]
    pub fn membership(&self, class_indices: &[usize]) -> Vec<bool> {
        class_indices.iter().map(|i| self.contains(*i)).collect()
    }

    /// Union with another set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            indices: self.indices.union(&other.indices).copied().collect(),
        }
    }
}

impl FromIterator<usize> for ClassIndexSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::from_indices(iter)
    }
}
