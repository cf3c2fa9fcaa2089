//! Batches, batch providers and the dataset registry
//!
//! Training consumes two providers in lockstep: a labeled source domain and
//! an unlabeled target domain. A pass over the data ends as soon as either
//! provider runs dry.

pub mod loader;
pub mod memory;

pub use loader::{DataLoader, DataLoaderConfig, TensorDataset};
pub use memory::InMemoryProvider;

use candle_core::Tensor;

use crate::error::{Error, Result};

/// One batch of images with optional per-pixel labels
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images `[N, C, H, W]`, f32
    pub image: Tensor,

    /// Labels `[N, H, W]`, i64; `-1` marks ignored pixels
    pub label: Option<Tensor>,

    /// Sample identifiers, one per image
    pub ids: Vec<String>,
}

impl Batch {
    /// Create a labeled batch
    pub fn labeled(image: Tensor, label: Tensor, ids: Vec<String>) -> Self {
        Self {
            image,
            label: Some(label),
            ids,
        }
    }

    /// Create a batch without labels
    pub fn unlabeled(image: Tensor, ids: Vec<String>) -> Self {
        Self {
            image,
            label: None,
            ids,
        }
    }

    /// Number of images in the batch
    pub fn len(&self) -> usize {
        self.image.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels, or a data error when the batch carries none
    pub fn require_label(&self) -> Result<&Tensor> {
        self.label
            .as_ref()
            .ok_or_else(|| Error::data("batch has no labels"))
    }
}

/// Finite, restartable source of batches
pub trait BatchProvider {
    /// Number of batches in one pass
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewind to the start of a new pass
    fn reset(&mut self) -> Result<()>;

    /// Next batch, `None` once the pass is exhausted
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

impl<P: BatchProvider + ?Sized> BatchProvider for Box<P> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        (**self).next_batch()
    }
}

/// Pull one batch from each provider; `None` as soon as either is exhausted
pub fn next_pair(
    source: &mut dyn BatchProvider,
    target: &mut dyn BatchProvider,
) -> Result<Option<(Batch, Batch)>> {
    let Some(source_batch) = source.next_batch()? else {
        return Ok(None);
    };
    let Some(target_batch) = target.next_batch()? else {
        return Ok(None);
    };
    Ok(Some((source_batch, target_batch)))
}

/// Number of steps in one lockstep pass
pub fn paired_len(source: &dyn BatchProvider, target: &dyn BatchProvider) -> usize {
    source.len().min(target.len())
}

/// Which side of the adaptation a dataset may be used on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetRole {
    Source,
    Target,
}

/// Registered datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetName {
    Synthia,
    Gta5,
    Cityscapes,
    Idd,
    MapillaryVistas,
}

impl DatasetName {
    /// Parse a registered dataset name
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "synthia" => Ok(Self::Synthia),
            "gta5" => Ok(Self::Gta5),
            "cityscapes" => Ok(Self::Cityscapes),
            "idd" => Ok(Self::Idd),
            "mapillaryvistas" | "mapillary_vistas" => Ok(Self::MapillaryVistas),
            other => Err(Error::config(format!("unknown dataset '{}'", other))),
        }
    }

    /// Synthetic datasets are source domains; real-world ones are targets
    pub fn role(&self) -> DatasetRole {
        match self {
            Self::Synthia | Self::Gta5 => DatasetRole::Source,
            Self::Cityscapes | Self::Idd | Self::MapillaryVistas => DatasetRole::Target,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synthia => "synthia",
            Self::Gta5 => "gta5",
            Self::Cityscapes => "cityscapes",
            Self::Idd => "idd",
            Self::MapillaryVistas => "mapillary_vistas",
        }
    }
}

impl std::fmt::Display for DatasetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
