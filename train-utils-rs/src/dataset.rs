//! Image dataset assembly.
//!
//! Several labeled image directories (`<dir>/<class name>/<image>`) are split
//! into train/validation subsets independently, then concatenated into two
//! streams that share one label vocabulary:
//!
//! 1. Every directory gets its own seeded shuffle and its own validation
//!    ratio: the last `floor(ratio * n)` shuffled samples are held out.
//! 2. The primary directory's sorted class names are the vocabulary. Other
//!    directories' labels are remapped into it by class name.
//! 3. Subsets are concatenated in configuration order. Each directory stays a
//!    separate partition so that batches never mix directories.
//! 4. The classes of directories marked `special` become the
//!    [`ClassIndexSet`] used for class-conditional augmentation.
//!
//! Pixels are only read when a batch is loaded with [`BatchLoader`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::class_set::ClassIndexSet;
use crate::config::DatasetConfig;
use crate::error::{Result, TrainUtilsError};

/// File extensions picked up as images (case-insensitive).
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif"];

/// One labeled image on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Image file.
    pub path: PathBuf,
    /// Class index into the vocabulary.
    pub label: usize,
    /// Index of the directory the sample came from, in concatenation order.
    pub source: usize,
}

/// Train/validation split of a single directory, labels local to it.
#[derive(Debug, Clone)]
pub struct DirectorySplit {
    /// Sorted class names; a sample's label indexes this list.
    pub classes: Vec<String>,
    /// Training subset.
    pub train: Vec<Sample>,
    /// Validation subset.
    pub validation: Vec<Sample>,
}

/// Sorted names of the class sub-directories of `dir`.
///
/// # Errors
///
/// Returns [`TrainUtilsError::Dataset`] if `dir` is missing, unreadable, or
/// has no sub-directories.
pub fn discover_classes(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(TrainUtilsError::Dataset(format!(
            "dataset directory not found: {}",
            dir.display()
        )));
    }
    let entries = std::fs::read_dir(dir).map_err(|e| {
        TrainUtilsError::Dataset(format!("failed to read directory {}: {e}", dir.display()))
    })?;

    let mut classes = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name() {
                classes.push(name.to_string_lossy().into_owned());
            }
        }
    }
    if classes.is_empty() {
        return Err(TrainUtilsError::Dataset(format!(
            "no class directories under {}",
            dir.display()
        )));
    }
    classes.sort();
    Ok(classes)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        TrainUtilsError::Dataset(format!("failed to read directory {}: {e}", dir.display()))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Split one class-per-sub-directory image directory.
///
/// Files are listed in sorted order per class, optionally shuffled with a
/// `ChaCha8` generator seeded by `seed`, and the last
/// `floor(validation_split * n)` samples form the validation subset.
///
/// # Errors
///
/// - [`TrainUtilsError::Config`] if `validation_split` is not in `(0, 1)`.
/// - [`TrainUtilsError::Dataset`] if the directory is missing, holds no
///   images, or the ratio leaves either subset empty.
pub fn split_directory(
    dir: &Path,
    validation_split: f64,
    seed: u64,
    shuffle: bool,
) -> Result<DirectorySplit> {
    if !(validation_split > 0.0 && validation_split < 1.0) {
        return Err(TrainUtilsError::Config(format!(
            "validation_split must be in (0, 1), got {validation_split}"
        )));
    }
    let classes = discover_classes(dir)?;

    let mut samples = Vec::new();
    for (label, class) in classes.iter().enumerate() {
        for path in image_files(&dir.join(class))? {
            samples.push(Sample {
                path,
                label,
                source: 0,
            });
        }
    }
    if samples.is_empty() {
        return Err(TrainUtilsError::Dataset(format!(
            "no images found under {}",
            dir.display()
        )));
    }

    if shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        samples.shuffle(&mut rng);
    }

    let total = samples.len();
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let held_out = (validation_split * total as f64).floor() as usize;
    if held_out == 0 || held_out >= total {
        return Err(TrainUtilsError::Dataset(format!(
            "validation_split {validation_split} of {total} samples in {} leaves an empty subset",
            dir.display()
        )));
    }
    let validation = samples.split_off(total - held_out);

    debug!(
        dir = %dir.display(),
        classes = classes.len(),
        train = samples.len(),
        validation = validation.len(),
        "split directory"
    );
    Ok(DirectorySplit {
        classes,
        train: samples,
        validation,
    })
}

/// Concatenated samples, kept as one partition per source directory.
#[derive(Debug, Clone, Default)]
pub struct SampleStream {
    partitions: Vec<Vec<Sample>>,
}

impl SampleStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a partition at the end of the stream.
    pub fn push_partition(&mut self, samples: Vec<Sample>) {
        self.partitions.push(samples);
    }

    /// Partitions in concatenation order.
    #[must_use]
    pub fn partitions(&self) -> &[Vec<Sample>] {
        &self.partitions
    }

    /// Total number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    /// Whether the stream holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All samples in order.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.partitions.iter().flatten()
    }

    /// Batches of at most `batch_size` samples. A partition's final batch may
    /// be short; the next partition starts a new batch.
    ///
    /// # Errors
    ///
    /// Returns [`TrainUtilsError::InvalidValue`] for a zero batch size.
    pub fn batches(&self, batch_size: usize) -> Result<impl Iterator<Item = &[Sample]>> {
        if batch_size == 0 {
            return Err(TrainUtilsError::InvalidValue(
                "batch_size must be > 0".into(),
            ));
        }
        Ok(self
            .partitions
            .iter()
            .flat_map(move |partition| partition.chunks(batch_size)))
    }

    /// Number of batches [`Self::batches`] yields.
    #[must_use]
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.partitions
            .iter()
            .map(|p| p.len().div_ceil(batch_size))
            .sum()
    }
}

/// Per-directory counts after assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    /// Directory path.
    pub path: PathBuf,
    /// Class sub-directories found.
    pub classes: usize,
    /// Training samples contributed.
    pub train: usize,
    /// Validation samples contributed.
    pub validation: usize,
    /// Whether its classes are in the special set.
    pub special: bool,
}

/// Train and validation streams over a shared vocabulary.
#[derive(Debug, Clone)]
pub struct AssembledDataset {
    /// Class names from the primary directory; labels index this list.
    pub vocabulary: Vec<String>,
    /// Concatenated training subsets.
    pub train: SampleStream,
    /// Concatenated validation subsets.
    pub validation: SampleStream,
    /// Classes contributed by special directories.
    pub special_classes: ClassIndexSet,
    /// Counts per directory, in concatenation order.
    pub sources: Vec<SourceSummary>,
}

impl AssembledDataset {
    /// Number of classes in the vocabulary.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.vocabulary.len()
    }
}

/// Split every configured directory and concatenate the subsets.
///
/// # Errors
///
/// - [`TrainUtilsError::Config`] if the configuration is invalid.
/// - [`TrainUtilsError::UnknownClass`] if a directory has a class the primary
///   directory does not.
/// - Any error from [`split_directory`].
pub fn assemble(config: &DatasetConfig) -> Result<AssembledDataset> {
    config.validate()?;

    let mut vocabulary: Vec<String> = Vec::new();
    let mut train = SampleStream::new();
    let mut validation = SampleStream::new();
    let mut special_classes = ClassIndexSet::empty();
    let mut sources = Vec::new();

    for (index, source) in config.all_sources().enumerate() {
        let split = split_directory(
            &source.path,
            source.validation_split,
            config.seed,
            config.shuffle,
        )?;
        if index == 0 {
            vocabulary.clone_from(&split.classes);
        }

        let remap = split
            .classes
            .iter()
            .map(|name| {
                vocabulary
                    .iter()
                    .position(|entry| entry == name)
                    .ok_or_else(|| TrainUtilsError::UnknownClass {
                        name: name.clone(),
                        vocabulary_size: vocabulary.len(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        if source.special {
            special_classes = special_classes.union(&ClassIndexSet::from_indices(remap.iter().copied()));
        }

        let relabel = |samples: Vec<Sample>| -> Vec<Sample> {
            samples
                .into_iter()
                .map(|sample| Sample {
                    label: remap[sample.label],
                    source: index,
                    ..sample
                })
                .collect()
        };
        sources.push(SourceSummary {
            path: source.path.clone(),
            classes: split.classes.len(),
            train: split.train.len(),
            validation: split.validation.len(),
            special: source.special,
        });
        train.push_partition(relabel(split.train));
        validation.push_partition(relabel(split.validation));
    }

    info!(
        classes = vocabulary.len(),
        train = train.len(),
        validation = validation.len(),
        special = special_classes.len(),
        "assembled dataset"
    );
    Ok(AssembledDataset {
        vocabulary,
        train,
        validation,
        special_classes,
        sources,
    })
}

/// Decodes samples into `(images, labels)` tensors.
///
/// Images come out as `[B, H, W, 3]` `f32` RGB in `0..=255`, resized to the
/// target size; labels as `[B, K]` one-hot `f32`.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    image_size: [usize; 2],
    num_classes: usize,
    device: Device,
}

impl BatchLoader {
    /// Create a loader for `[height, width]` images over `num_classes`.
    #[must_use]
    pub fn new(image_size: [usize; 2], num_classes: usize, device: Device) -> Self {
        Self {
            image_size,
            num_classes,
            device,
        }
    }

    /// Load and stack a batch.
    ///
    /// # Errors
    ///
    /// - [`TrainUtilsError::EmptyInput`] for an empty batch.
    /// - [`TrainUtilsError::InvalidValue`] for a label outside the
    ///   vocabulary or an image size that does not fit in `u32`.
    /// - [`TrainUtilsError::Image`] if a file cannot be decoded.
    pub fn load(&self, samples: &[Sample]) -> Result<(Tensor, Tensor)> {
        if samples.is_empty() {
            return Err(TrainUtilsError::EmptyInput("batch has no samples".into()));
        }
        let [height, width] = self.image_size;
        let to_u32 = |v: usize| {
            u32::try_from(v)
                .map_err(|_| TrainUtilsError::InvalidValue(format!("image size {v} is too large")))
        };
        let (h, w) = (to_u32(height)?, to_u32(width)?);

        let mut pixels = Vec::with_capacity(samples.len() * height * width * 3);
        let mut labels = vec![0f32; samples.len() * self.num_classes];
        for (row, sample) in samples.iter().enumerate() {
            if sample.label >= self.num_classes {
                return Err(TrainUtilsError::InvalidValue(format!(
                    "label {} of {} is outside {} classes",
                    sample.label,
                    sample.path.display(),
                    self.num_classes
                )));
            }
            let image = image::open(&sample.path)?
                .resize_exact(w, h, FilterType::Triangle)
                .to_rgb8();
            pixels.extend(image.into_raw().into_iter().map(f32::from));
            labels[row * self.num_classes + sample.label] = 1.0;
        }

        let images = Tensor::from_vec(pixels, (samples.len(), height, width, 3), &self.device)?;
        let labels = Tensor::from_vec(labels, (samples.len(), self.num_classes), &self.device)?;
        Ok((images, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Write `count` small PNGs per class under `root`.
    fn make_tree(root: &Path, classes: &[(&str, usize)]) {
        for (class, count) in classes {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let shade = u8::try_from(i * 10).unwrap();
                RgbImage::from_pixel(4, 4, Rgb([shade, 20, 30]))
                    .save(dir.join(format!("img_{i:03}.png")))
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_discover_classes_sorted_dirs_only() {
        let tmp = TempDir::new().unwrap();
        make_tree(tmp.path(), &[("naan", 1), ("apple", 1), ("curry", 1)]);
        std::fs::write(tmp.path().join("README.txt"), "not a class").unwrap();

        let classes = discover_classes(tmp.path()).unwrap();
        assert_eq!(classes, vec!["apple", "curry", "naan"]);
    }

    #[test]
    fn test_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let err = split_directory(&tmp.path().join("missing"), 0.2, 21, true).unwrap_err();
        assert!(matches!(err, TrainUtilsError::Dataset(_)));
    }

    #[test]
    fn test_split_counts_and_disjointness() {
        let tmp = TempDir::new().unwrap();
        make_tree(tmp.path(), &[("a", 5), ("b", 5)]);
        std::fs::write(tmp.path().join("a").join("notes.txt"), "skip me").unwrap();

        let split = split_directory(tmp.path(), 0.2, 21, true).unwrap();
        assert_eq!(split.train.len(), 8);
        assert_eq!(split.validation.len(), 2);

        let train: HashSet<_> = split.train.iter().map(|s| s.path.clone()).collect();
        let validation: HashSet<_> = split.validation.iter().map(|s| s.path.clone()).collect();
        assert!(train.is_disjoint(&validation));
        assert_eq!(train.len() + validation.len(), 10);
    }

    #[test]
    fn test_split_is_deterministic_per_seed() {
        let tmp = TempDir::new().unwrap();
        make_tree(tmp.path(), &[("a", 6), ("b", 6)]);

        let first = split_directory(tmp.path(), 0.25, 7, true).unwrap();
        let second = split_directory(tmp.path(), 0.25, 7, true).unwrap();
        assert_eq!(first.train, second.train);
        assert_eq!(first.validation, second.validation);
    }

    #[test]
    fn test_unshuffled_split_holds_out_tail() {
        let tmp = TempDir::new().unwrap();
        make_tree(tmp.path(), &[("a", 2), ("b", 2)]);

        let split = split_directory(tmp.path(), 0.5, 0, false).unwrap();
        assert!(split.validation.iter().all(|s| s.label == 1));
        assert!(split.train.iter().all(|s| s.label == 0));
    }

    #[test]
    fn test_split_leaving_empty_subset() {
        let tmp = TempDir::new().unwrap();
        make_tree(tmp.path(), &[("a", 2)]);
        let err = split_directory(tmp.path(), 0.2, 21, true).unwrap_err();
        assert!(matches!(err, TrainUtilsError::Dataset(_)));
    }

    #[test]
    fn test_assemble_remaps_labels_and_special_classes() {
        let tmp = TempDir::new().unwrap();
        let primary = tmp.path().join("all");
        let fruit = tmp.path().join("fruit");
        make_tree(&primary, &[("apple", 2), ("banana", 2), ("curry", 2), ("naan", 2)]);
        make_tree(&fruit, &[("apple", 2), ("banana", 3)]);

        let config = DatasetConfig::new(SourceConfig::new(&primary, 0.5))
            .with_source(SourceConfig::new(&fruit, 0.2).with_special(true));
        let dataset = assemble(&config).unwrap();

        assert_eq!(dataset.vocabulary, vec!["apple", "banana", "curry", "naan"]);
        assert_eq!(dataset.special_classes.indices(), vec![0, 1]);
        assert_eq!(dataset.train.len(), 4 + 4);
        assert_eq!(dataset.validation.len(), 4 + 1);
        assert_eq!(dataset.sources.len(), 2);
        assert!(dataset.sources[1].special);

        let partitions = dataset.train.partitions();
        assert!(partitions[0].iter().all(|s| s.source == 0));
        assert!(partitions[1].iter().all(|s| s.source == 1 && s.label <= 1));
        for sample in dataset.train.iter() {
            let class = sample.path.parent().unwrap().file_name().unwrap();
            assert_eq!(dataset.vocabulary[sample.label], class.to_string_lossy());
        }
    }

    #[test]
    fn test_assemble_unknown_class() {
        let tmp = TempDir::new().unwrap();
        let primary = tmp.path().join("all");
        let extra = tmp.path().join("extra");
        make_tree(&primary, &[("apple", 2), ("naan", 2)]);
        make_tree(&extra, &[("durian", 2)]);

        let config = DatasetConfig::new(SourceConfig::new(&primary, 0.5))
            .with_source(SourceConfig::new(&extra, 0.5));
        let err = assemble(&config).unwrap_err();
        assert!(matches!(err, TrainUtilsError::UnknownClass { ref name, .. } if name == "durian"));
    }

    #[test]
    fn test_batches_do_not_cross_partitions() {
        let sample = |source| Sample {
            path: PathBuf::from("x.png"),
            label: 0,
            source,
        };
        let mut stream = SampleStream::new();
        stream.push_partition(vec![sample(0), sample(0), sample(0)]);
        stream.push_partition(vec![sample(1), sample(1)]);

        let sizes: Vec<usize> = stream.batches(2).unwrap().map(<[Sample]>::len).collect();
        assert_eq!(sizes, vec![2, 1, 2]);
        assert_eq!(stream.num_batches(2), 3);
        for batch in stream.batches(2).unwrap() {
            assert!(batch.iter().all(|s| s.source == batch[0].source));
        }
        assert!(stream.batches(0).is_err());
    }

    #[test]
    fn test_batch_loader_shapes_and_values() {
        let tmp = TempDir::new().unwrap();
        make_tree(tmp.path(), &[("a", 2), ("b", 2)]);
        let split = split_directory(tmp.path(), 0.5, 0, false).unwrap();

        let loader = BatchLoader::new([2, 3], 2, Device::Cpu);
        let (images, labels) = loader.load(&split.validation).unwrap();
        assert_eq!(images.dims(), &[2, 2, 3, 3]);
        assert_eq!(labels.dims(), &[2, 2]);

        let first: Vec<f32> = images.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(&first[..3], &[0.0, 20.0, 30.0]);
        assert_eq!(
            labels.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 1.0], vec![0.0, 1.0]]
        );
    }

    #[test]
    fn test_batch_loader_rejects_bad_input() {
        let loader = BatchLoader::new([2, 2], 2, Device::Cpu);
        assert!(matches!(
            loader.load(&[]),
            Err(TrainUtilsError::EmptyInput(_))
        ));
        let bad = Sample {
            path: PathBuf::from("nowhere.png"),
            label: 5,
            source: 0,
        };
        assert!(matches!(
            loader.load(&[bad]),
            Err(TrainUtilsError::InvalidValue(_))
        ));
    }
}
