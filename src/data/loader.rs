//! Safetensors-backed image/label datasets and a shuffling data loader

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{Batch, BatchProvider, DatasetName};
use crate::error::{Error, Result};

/// Key of the image tensor in a dataset file
pub const IMAGES_KEY: &str = "images";

/// Key of the label tensor in a dataset file
pub const LABELS_KEY: &str = "labels";

/// Decoded dataset: images `[N, C, H, W]` and optional labels `[N, H, W]`
#[derive(Debug, Clone)]
pub struct TensorDataset {
    name: String,
    images: Tensor,
    labels: Option<Tensor>,
}

impl TensorDataset {
    /// Build a dataset from tensors, validating shapes
    pub fn new(name: impl Into<String>, images: Tensor, labels: Option<Tensor>) -> Result<Self> {
        let (n, _c, h, w) = images
            .dims4()
            .map_err(|_| Error::data(format!("images must be [N, C, H, W], got {:?}", images.dims())))?;

        let labels = match labels {
            Some(labels) => {
                let dims = labels.dims3().map_err(|_| {
                    Error::data(format!("labels must be [N, H, W], got {:?}", labels.dims()))
                })?;
                if dims != (n, h, w) {
                    return Err(Error::data(format!(
                        "labels {:?} do not match images {:?}",
                        labels.dims(),
                        images.dims()
                    )));
                }
                Some(labels.to_dtype(DType::I64)?)
            }
            None => None,
        };

        Ok(Self {
            name: name.into(),
            images: images.to_dtype(DType::F32)?,
            labels,
        })
    }

    /// Load `images` and optional `labels` tensors from a safetensors file
    #[instrument(skip(path, device), fields(path = %path.as_ref().display()))]
    pub fn from_safetensors<P: AsRef<Path>>(
        name: DatasetName,
        path: P,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::data(format!("dataset file {} not found", path.display())));
        }

        let mut tensors = candle_core::safetensors::load(path, device)?;
        let images = tensors
            .remove(IMAGES_KEY)
            .ok_or_else(|| Error::data(format!("{} has no '{}' tensor", path.display(), IMAGES_KEY)))?;
        let labels = tensors.remove(LABELS_KEY);

        let dataset = Self::new(name.as_str(), images, labels)?;
        info!(
            "Loaded {} samples from {} ({})",
            dataset.len(),
            path.display(),
            if dataset.labels.is_some() { "labeled" } else { "unlabeled" }
        );
        Ok(dataset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather a batch by sample index
    pub fn gather(&self, indices: &[usize]) -> Result<Batch> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::new(idx.as_slice(), self.images.device())?;

        let image = self.images.index_select(&idx, 0)?;
        let label = match &self.labels {
            Some(labels) => Some(labels.index_select(&idx, 0)?),
            None => None,
        };
        let ids = indices
            .iter()
            .map(|i| format!("{}_{:06}", self.name, i))
            .collect();

        Ok(Batch { image, label, ids })
    }
}

/// Data loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: true,
            drop_last: true,
            seed: 42,
        }
    }
}

/// Batches a [`TensorDataset`], reshuffling on every reset
pub struct DataLoader {
    dataset: TensorDataset,
    config: DataLoaderConfig,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(dataset: TensorDataset, config: DataLoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }

        let mut loader = Self {
            order: (0..dataset.len()).collect(),
            rng: StdRng::seed_from_u64(config.seed),
            cursor: 0,
            dataset,
            config,
        };
        loader.reset()?;
        Ok(loader)
    }

    pub fn dataset(&self) -> &TensorDataset {
        &self.dataset
    }
}

impl BatchProvider for DataLoader {
    fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        if self.config.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        debug!("Reset loader for {} ({} batches)", self.dataset.name(), self.len());
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let remaining = self.order.len().saturating_sub(self.cursor);
        if remaining == 0 || (self.config.drop_last && remaining < self.config.batch_size) {
            return Ok(None);
        }

        let end = (self.cursor + self.config.batch_size).min(self.order.len());
        let batch = self.dataset.gather(&self.order[self.cursor..end])?;
        self.cursor = end;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn dataset(n: usize) -> TensorDataset {
        let device = Device::Cpu;
        let images = Tensor::arange(0f32, (n * 3 * 2 * 2) as f32, &device)
            .unwrap()
            .reshape((n, 3, 2, 2))
            .unwrap();
        let labels = Tensor::zeros((n, 2, 2), DType::U8, &device).unwrap();
        TensorDataset::new("toy", images, Some(labels)).unwrap()
    }

    #[test]
    fn test_drop_last_batch_count() {
        let config = DataLoaderConfig {
            batch_size: 2,
            shuffle: false,
            drop_last: true,
            seed: 0,
        };
        let mut loader = DataLoader::new(dataset(5), config).unwrap();
        assert_eq!(loader.len(), 2);

        let mut seen = 0;
        while let Some(batch) = loader.next_batch().unwrap() {
            assert_eq!(batch.len(), 2);
            assert_eq!(batch.require_label().unwrap().dtype(), DType::I64);
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_keep_last_partial_batch() {
        let config = DataLoaderConfig {
            batch_size: 2,
            shuffle: true,
            drop_last: false,
            seed: 7,
        };
        let mut loader = DataLoader::new(dataset(5), config).unwrap();
        assert_eq!(loader.len(), 3);

        let sizes: Vec<usize> = std::iter::from_fn(|| loader.next_batch().unwrap())
            .map(|b| b.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        loader.reset().unwrap();
        assert!(loader.next_batch().unwrap().is_some());
    }

    #[test]
    fn test_mismatched_labels_rejected() {
        let device = Device::Cpu;
        let images = Tensor::zeros((2, 3, 4, 4), DType::F32, &device).unwrap();
        let labels = Tensor::zeros((2, 4, 5), DType::I64, &device).unwrap();
        assert!(matches!(
            TensorDataset::new("bad", images, Some(labels)),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn test_load_from_safetensors_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gta5.safetensors");
        let device = Device::Cpu;

        let mut tensors = HashMap::new();
        tensors.insert(
            IMAGES_KEY.to_string(),
            Tensor::zeros((3, 3, 4, 4), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            LABELS_KEY.to_string(),
            Tensor::ones((3, 4, 4), DType::I64, &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let dataset = TensorDataset::from_safetensors(DatasetName::Gta5, &path, &device).unwrap();
        assert_eq!(dataset.len(), 3);
        let batch = dataset.gather(&[2]).unwrap();
        assert_eq!(batch.ids, vec!["gta5_000002".to_string()]);
    }
}
