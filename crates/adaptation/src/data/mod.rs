//! Source/target batch pipeline.
//!
//! Splits live on the host; the solver moves each batch to its compute device.
//! Training batches pair a source and a target sub-batch. The longer domain
//! defines the epoch length and the shorter one wraps around, so the final
//! batch of an epoch is usually short, which the solver treats as the end of
//! the epoch.

use std::{collections::HashMap, fmt, path::Path};

use candle_core::{DType, Device, Tensor};
use networks::ArchitectureConfig;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{config::DataConfig, loss::labels_as_indices, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Side length used when `scale` is enabled.
pub const SCALED_IMAGE_SIZE: usize = 32;

/// One paired training batch.
#[derive(Debug, Clone)]
pub struct DomainBatch {
    pub source_images: Tensor,
    pub source_labels: Tensor,
    pub target_images: Tensor,
    pub target_labels: Tensor,
}

impl DomainBatch {
    pub fn source_len(&self) -> usize {
        self.source_images.dims().first().copied().unwrap_or(0)
    }

    pub fn target_len(&self) -> usize {
        self.target_images.dims().first().copied().unwrap_or(0)
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            source_images: self.source_images.to_device(device)?,
            source_labels: self.source_labels.to_device(device)?,
            target_images: self.target_images.to_device(device)?,
            target_labels: self.target_labels.to_device(device)?,
        })
    }
}

/// One held-out target batch.
#[derive(Debug, Clone)]
pub struct EvalBatch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl EvalBatch {
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }
}

/// Yields paired source/target batches, one epoch at a time.
pub trait DomainLoader {
    /// Rewinds to the first batch and reshuffles for `epoch`.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;

    fn next_batch(&mut self) -> Result<Option<DomainBatch>>;

    fn batches_per_epoch(&self) -> usize;
}

/// Yields held-out target batches in a fixed order.
pub trait EvalLoader {
    fn rewind(&mut self);

    fn next_batch(&mut self) -> Result<Option<EvalBatch>>;
}

/// Images `(N, C, H, W)` with `N` matching u32 labels.
#[derive(Clone)]
pub struct DomainSplit {
    images: Tensor,
    labels: Tensor,
}

impl DomainSplit {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let count = images.dims().first().copied().ok_or_else(|| {
            TrainingError::initialization("domain images must have a leading batch dimension")
        })?;
        let labels = labels_as_indices(&labels, count)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    /// Keeps the first `limit` samples.
    pub fn truncate(self, limit: usize) -> Result<Self> {
        if limit >= self.len() {
            return Ok(self);
        }
        Ok(Self {
            images: self.images.narrow(0, 0, limit)?,
            labels: self.labels.narrow(0, 0, limit)?,
        })
    }

    fn select(&self, indices: &[u32]) -> Result<(Tensor, Tensor)> {
        let index = Tensor::from_vec(indices.to_vec(), indices.len(), self.images.device())?;
        Ok((
            self.images.index_select(&index, 0)?,
            self.labels.index_select(&index, 0)?,
        ))
    }
}

impl fmt::Debug for DomainSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainSplit")
            .field("images", &self.images.dims())
            .field("labels", &self.labels.dims())
            .finish()
    }
}

/// In-memory paired loader with independent per-epoch shuffles.
pub struct PairedDomainLoader {
    source: DomainSplit,
    target: DomainSplit,
    batch_size: usize,
    seed: u64,
    source_order: Vec<u32>,
    target_order: Vec<u32>,
    cursor: usize,
}

impl PairedDomainLoader {
    pub fn new(
        source: DomainSplit,
        target: DomainSplit,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if source.is_empty() || target.is_empty() {
            return Err(TrainingError::empty_dataset(
                "both source and target training splits need samples",
            ));
        }
        let source_order = (0..source.len() as u32).collect();
        let target_order = (0..target.len() as u32).collect();
        Ok(Self {
            source,
            target,
            batch_size,
            seed,
            source_order,
            target_order,
            cursor: 0,
        })
    }

    fn epoch_len(&self) -> usize {
        self.source.len().max(self.target.len())
    }
}

impl DomainLoader for PairedDomainLoader {
    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        self.source_order.shuffle(&mut rng);
        self.target_order.shuffle(&mut rng);
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<DomainBatch>> {
        let total = self.epoch_len();
        if self.cursor >= total {
            return Ok(None);
        }
        let take = self.batch_size.min(total - self.cursor);
        let window = |order: &[u32]| -> Vec<u32> {
            (0..take)
                .map(|offset| order[(self.cursor + offset) % order.len()])
                .collect()
        };
        let (source_images, source_labels) = self.source.select(&window(&self.source_order))?;
        let (target_images, target_labels) = self.target.select(&window(&self.target_order))?;
        self.cursor += take;

        Ok(Some(DomainBatch {
            source_images,
            source_labels,
            target_images,
            target_labels,
        }))
    }

    fn batches_per_epoch(&self) -> usize {
        self.epoch_len().div_ceil(self.batch_size)
    }
}

/// Sequential loader over the held-out split, including the trailing partial batch.
pub struct SequentialEvalLoader {
    split: DomainSplit,
    batch_size: usize,
    cursor: usize,
}

impl SequentialEvalLoader {
    pub fn new(split: DomainSplit, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self {
            split,
            batch_size,
            cursor: 0,
        })
    }
}

impl EvalLoader for SequentialEvalLoader {
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<EvalBatch>> {
        let total = self.split.len();
        if self.cursor >= total {
            return Ok(None);
        }
        let take = self.batch_size.min(total - self.cursor);
        let images = self.split.images.narrow(0, self.cursor, take)?;
        let labels = self.split.labels.narrow(0, self.cursor, take)?;
        self.cursor += take;
        Ok(Some(EvalBatch { images, labels }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// How raw images are brought to the shape the networks expect.
#[derive(Debug, Clone, Copy)]
pub struct ImageFormat {
    pub channels: usize,
    pub resize_to: Option<usize>,
}

/// Reads `{data_dir}/{domain}_{split}.safetensors` holding `images` and `labels`.
///
/// u8 images are scaled to `[0, 1]`; `(N, H, W)` images gain a channel axis;
/// single-channel images are replicated when `format.channels` asks for more.
pub fn load_split(
    data_dir: &Path,
    domain: &str,
    split: Split,
    format: ImageFormat,
    limit: Option<usize>,
) -> Result<DomainSplit> {
    let path = data_dir.join(format!("{domain}_{}.safetensors", split.as_str()));
    if !path.is_file() {
        return Err(TrainingError::initialization(format!(
            "missing dataset file {}",
            path.display()
        )));
    }
    let mut tensors: HashMap<String, Tensor> =
        candle_core::safetensors::load(&path, &Device::Cpu).map_err(|err| {
            TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
        })?;
    let images = tensors.remove("images").ok_or_else(|| {
        TrainingError::initialization(format!("{} has no `images` tensor", path.display()))
    })?;
    let labels = tensors.remove("labels").ok_or_else(|| {
        TrainingError::initialization(format!("{} has no `labels` tensor", path.display()))
    })?;

    let images = prepare_images(images, format)?;
    let split = DomainSplit::new(images, labels)?;
    match limit {
        Some(limit) => split.truncate(limit),
        None => Ok(split),
    }
}

fn prepare_images(images: Tensor, format: ImageFormat) -> Result<Tensor> {
    let images = match images.rank() {
        3 => images.unsqueeze(1)?,
        4 => images,
        rank => {
            return Err(TrainingError::initialization(format!(
                "images must be (N, H, W) or (N, C, H, W), got rank {rank}"
            )))
        }
    };
    let images = match images.dtype() {
        DType::U8 => images.to_dtype(DType::F32)?.affine(1.0 / 255.0, 0.0)?,
        DType::F32 => images,
        other => images.to_dtype(DType::F32).map_err(|err| {
            TrainingError::initialization(format!("cannot convert {other:?} images: {err}"))
        })?,
    };

    let (count, channels, height, width) = images.dims4()?;
    let images = if channels == format.channels {
        images
    } else if channels == 1 {
        images
            .broadcast_as((count, format.channels, height, width))?
            .contiguous()?
    } else {
        return Err(TrainingError::initialization(format!(
            "images have {channels} channels but the network expects {}",
            format.channels
        )));
    };

    match format.resize_to {
        Some(size) if (height, width) != (size, size) => Ok(images.upsample_nearest2d(size, size)?),
        _ => Ok(images),
    }
}

/// Training and evaluation loaders for one domain pair.
pub struct DatasetBundle {
    pub train: PairedDomainLoader,
    pub test: SequentialEvalLoader,
}

pub fn load_datasets(
    config: &DataConfig,
    architecture: &ArchitectureConfig,
    seed: u64,
) -> Result<DatasetBundle> {
    let format = ImageFormat {
        channels: architecture.channels,
        resize_to: config.scale().then_some(SCALED_IMAGE_SIZE),
    };
    let limit = config.sample_limit();
    let source = load_split(&config.data_dir, &config.source, Split::Train, format, limit)?;
    let target = load_split(&config.data_dir, &config.target, Split::Train, format, limit)?;
    let test = load_split(&config.data_dir, &config.target, Split::Test, format, None)?;

    Ok(DatasetBundle {
        train: PairedDomainLoader::new(source, target, config.batch_size, seed)?,
        test: SequentialEvalLoader::new(test, config.batch_size)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(count: usize, offset: f32) -> DomainSplit {
        let pixels: Vec<f32> = (0..count * 4).map(|v| v as f32 + offset).collect();
        let images = Tensor::from_vec(pixels, (count, 1, 2, 2), &Device::Cpu).unwrap();
        let labels = Tensor::from_vec(
            (0..count as u32).map(|v| v % 10).collect::<Vec<_>>(),
            count,
            &Device::Cpu,
        )
        .unwrap();
        DomainSplit::new(images, labels).unwrap()
    }

    #[test]
    fn longer_domain_sets_epoch_length_and_last_batch_is_short() -> Result<()> {
        let mut loader = PairedDomainLoader::new(split(10, 0.0), split(4, 100.0), 4, 7)?;
        loader.start_epoch(0)?;
        assert_eq!(loader.batches_per_epoch(), 3);

        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch()? {
            sizes.push((batch.source_len(), batch.target_len()));
        }
        assert_eq!(sizes, vec![(4, 4), (4, 4), (2, 2)]);
        Ok(())
    }

    #[test]
    fn shuffles_are_reproducible_per_epoch() -> Result<()> {
        let mut a = PairedDomainLoader::new(split(16, 0.0), split(16, 0.0), 16, 3)?;
        let mut b = PairedDomainLoader::new(split(16, 0.0), split(16, 0.0), 16, 3)?;
        a.start_epoch(2)?;
        b.start_epoch(2)?;
        let first = a.next_batch()?.unwrap().source_labels.to_vec1::<u32>()?;
        let second = b.next_batch()?.unwrap().source_labels.to_vec1::<u32>()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn eval_loader_keeps_trailing_batch() -> Result<()> {
        let mut loader = SequentialEvalLoader::new(split(5, 0.0), 2)?;
        let mut seen = 0;
        while let Some(batch) = loader.next_batch()? {
            seen += batch.labels.dims()[0];
        }
        assert_eq!(seen, 5);
        loader.rewind();
        assert!(loader.next_batch()?.is_some());
        Ok(())
    }

    #[test]
    fn load_split_scales_replicates_and_resizes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let images = Tensor::full(255u8, (3, 28, 28), &Device::Cpu)?;
        let labels = Tensor::new(&[1u8, 2, 3], &Device::Cpu)?;
        let tensors = HashMap::from([
            ("images".to_string(), images),
            ("labels".to_string(), labels),
        ]);
        candle_core::safetensors::save(&tensors, dir.path().join("mnist_train.safetensors"))?;

        let format = ImageFormat {
            channels: 3,
            resize_to: Some(SCALED_IMAGE_SIZE),
        };
        let loaded = load_split(dir.path(), "mnist", Split::Train, format, Some(2))?;

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.images().dims(), &[2, 3, 32, 32]);
        assert!((loaded.images().max_all()?.to_scalar::<f32>()? - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn missing_file_is_an_initialization_error() {
        let format = ImageFormat {
            channels: 1,
            resize_to: None,
        };
        let err = load_split(Path::new("/nonexistent"), "usps", Split::Test, format, None)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }
}
