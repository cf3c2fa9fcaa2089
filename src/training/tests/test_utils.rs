//! Shared helpers for the trainer and checkpoint tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::data::{Batch, InMemoryProvider};
use crate::error::Result;
use crate::model::{DualHeadConfig, DualHeadSegNet, SegmentationModel};
use crate::perturb::{
    Augmenter, BoxCutMixer, CutMixer, FlipJitterAugmenter, FourierMixer, Perturbations, SpectralMixer,
};
use crate::training::config::TrainerConfig;
use crate::training::metrics::MemorySink;
use crate::training::trainer::{DataProviders, DomainAdaptationTrainer};

pub const NUM_CLASSES: usize = 3;
pub const BATCH: usize = 2;
pub const SIZE: usize = 8;

pub fn create_test_device() -> Device {
    Device::Cpu
}

pub fn create_test_model() -> DualHeadSegNet {
    let config = DualHeadConfig {
        width: 4,
        num_classes: NUM_CLASSES,
        ..Default::default()
    };
    DualHeadSegNet::new(config, &create_test_device()).unwrap()
}

/// Small, fast configuration writing checkpoints into `dir`
pub fn create_test_config(dir: &Path) -> TrainerConfig {
    let mut config = TrainerConfig::default();
    config.name = "test_run".to_string();
    config.data.num_classes = NUM_CLASSES;
    config.data.batch_size = BATCH;
    config.data.source_val_iterations = 2;
    config.model.width = 4;
    config.optimizer.lr = 1e-2;
    config.optimizer.iterations = 1000;
    config.validation.interval = 1000;
    config.validation.image_log_interval = 1;
    config.logging.log_every = 1;
    config.checkpointing.output_dir = dir.join("checkpoints");
    config
}

/// Labeled batch of random images with labels in `[0, NUM_CLASSES)`
pub fn create_labeled_batch(index: usize) -> Batch {
    let device = create_test_device();
    let image = Tensor::randn(0f32, 1.0, (BATCH, 3, SIZE, SIZE), &device).unwrap();
    let label = Tensor::rand(0f32, NUM_CLASSES as f32, (BATCH, SIZE, SIZE), &device)
        .unwrap()
        .floor()
        .unwrap()
        .to_dtype(DType::I64)
        .unwrap();
    let ids = (0..BATCH).map(|i| format!("batch{}_{}", index, i)).collect();
    Batch::labeled(image, label, ids)
}

pub fn create_provider(batches: usize) -> InMemoryProvider {
    InMemoryProvider::new((0..batches).map(create_labeled_batch).collect())
}

pub fn create_providers(train_batches: usize, val_batches: usize) -> DataProviders {
    DataProviders {
        source_train: Box::new(create_provider(train_batches)),
        target_train: Box::new(create_provider(train_batches)),
        target_val: Box::new(create_provider(val_batches)),
        source_val: Some(Box::new(create_provider(val_batches))),
    }
}

/// Calls made to each perturbation
#[derive(Debug, Clone, Default)]
pub struct PerturbationCalls {
    pub augment: Arc<AtomicUsize>,
    pub fourier: Arc<AtomicUsize>,
    pub cutmix: Arc<AtomicUsize>,
}

impl PerturbationCalls {
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.augment.load(Ordering::SeqCst),
            self.fourier.load(Ordering::SeqCst),
            self.cutmix.load(Ordering::SeqCst),
        )
    }
}

struct CountingAugmenter {
    inner: FlipJitterAugmenter,
    calls: Arc<AtomicUsize>,
}

impl Augmenter for CountingAugmenter {
    fn augment(&mut self, images: &Tensor, label_maps: &[&Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.augment(images, label_maps)
    }
}

struct CountingFourier {
    inner: SpectralMixer,
    calls: Arc<AtomicUsize>,
}

impl FourierMixer for CountingFourier {
    fn mix(&mut self, src: &Tensor, tgt: &Tensor, beta: f64) -> Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.mix(src, tgt, beta)
    }
}

struct CountingCutMix {
    inner: BoxCutMixer,
    calls: Arc<AtomicUsize>,
}

impl CutMixer for CountingCutMix {
    fn combine(
        &mut self,
        img1: &Tensor,
        lab1: &Tensor,
        img2: &Tensor,
        lab2: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.combine(img1, lab1, img2, lab2)
    }
}

/// Standard perturbations wrapped with call counters
pub fn counting_perturbations(seed: u64) -> (Perturbations, PerturbationCalls) {
    let calls = PerturbationCalls::default();
    let perturbations = Perturbations {
        augmenter: Box::new(CountingAugmenter {
            inner: FlipJitterAugmenter::new(seed),
            calls: calls.augment.clone(),
        }),
        fourier: Box::new(CountingFourier {
            inner: SpectralMixer::new(),
            calls: calls.fourier.clone(),
        }),
        cutmix: Box::new(CountingCutMix {
            inner: BoxCutMixer::new(seed + 1),
            calls: calls.cutmix.clone(),
        }),
    };
    (perturbations, calls)
}

pub struct TestTrainer {
    pub trainer: DomainAdaptationTrainer<DualHeadSegNet>,
    pub calls: PerturbationCalls,
    pub sink: MemorySink,
}

pub fn create_test_trainer(config: TrainerConfig, train_batches: usize) -> TestTrainer {
    let (perturbations, calls) = counting_perturbations(0);
    let sink = MemorySink::new();
    let trainer = DomainAdaptationTrainer::new(
        config,
        create_test_model(),
        create_providers(train_batches, 2),
        perturbations,
        Box::new(sink.clone()),
    )
    .unwrap();
    TestTrainer { trainer, calls, sink }
}

/// Flattened values of every trainable parameter, by name
pub fn snapshot<M: SegmentationModel>(model: &M) -> Vec<(String, Vec<f32>)> {
    model
        .named_parameters()
        .unwrap()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
        .collect()
}

pub fn assert_tensor_close(a: &Tensor, b: &Tensor, tolerance: f32) {
    assert_eq!(a.dims(), b.dims());
    let diff = (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff <= tolerance, "max abs difference {} exceeds {}", diff, tolerance);
}
