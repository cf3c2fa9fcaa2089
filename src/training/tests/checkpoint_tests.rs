//! Tests for checkpoint save/load and resume behaviour

use std::collections::HashMap;

use candle_core::Tensor;
use tempfile::TempDir;

use super::test_utils::*;
use crate::error::Error;
use crate::model::SegmentationModel;
use crate::training::checkpoint::{CheckpointManager, ResumePolicy, WeightSource};
use crate::training::config::TrainerConfig;

fn trained(dir: &TempDir, steps: usize) -> TestTrainer {
    let mut t = create_test_trainer(create_test_config(dir.path()), 3);
    for i in 0..steps {
        t.trainer
            .train_step(i, &create_labeled_batch(2 * i), &create_labeled_batch(2 * i + 1))
            .unwrap();
    }
    t
}

fn fresh(config: TrainerConfig) -> TestTrainer {
    create_test_trainer(config, 3)
}

#[test]
fn test_save_load_round_trip_uses_live_weights_when_training() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(&dir, 2);
    let path = source.trainer.save_checkpoint("snapshot").unwrap();

    let other = TempDir::new().unwrap();
    let mut target = fresh(create_test_config(other.path()));
    assert_ne!(snapshot(target.trainer.model()), snapshot(source.trainer.model()));

    let outcome = target.trainer.load_checkpoint(&path).unwrap();
    assert_eq!(outcome.source, WeightSource::StateDict);
    assert_eq!(outcome.summary.unmatched, 0);
    assert_eq!(outcome.summary.missing, 0);
    assert_eq!(snapshot(target.trainer.model()), snapshot(source.trainer.model()));
}

#[test]
fn test_evaluation_load_prefers_shadow() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(&dir, 2);
    let path = source.trainer.save_checkpoint("snapshot").unwrap();
    let shadow = source.trainer.ema().state_tensors();

    let other = TempDir::new().unwrap();
    let mut config = create_test_config(other.path());
    config.train = false;
    let mut target = fresh(config);

    let outcome = target.trainer.load_checkpoint(&path).unwrap();
    assert_eq!(outcome.source, WeightSource::Shadow);
    assert!(outcome.optimizer_entries.is_none());
    for (name, var) in target.trainer.model().named_parameters().unwrap() {
        assert_tensor_close(var.as_tensor(), &shadow[&name], 1e-6);
    }
}

#[test]
fn test_missing_checkpoint_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut t = fresh(create_test_config(dir.path()));
    let before = snapshot(t.trainer.model());

    let missing = dir.path().join("nope.safetensors");
    assert!(matches!(
        t.trainer.load_checkpoint(&missing),
        Err(Error::CheckpointNotFound(p)) if p == missing
    ));
    assert_eq!(snapshot(t.trainer.model()), before);
}

#[test]
fn test_wrapped_raw_weights_are_stripped() {
    let dir = TempDir::new().unwrap();
    let model = create_test_model();
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for (name, var) in model.named_state().unwrap() {
        tensors.insert(format!("module.{}", name), var.as_tensor().copy().unwrap());
    }
    tensors.insert("module.unknown.weight".to_string(), Tensor::zeros(3, candle_core::DType::F32, &create_test_device()).unwrap());
    let path = dir.path().join("legacy.safetensors");
    candle_core::safetensors::save(&tensors, &path).unwrap();

    let mut t = fresh(create_test_config(dir.path()));
    let outcome = t.trainer.load_checkpoint(&path).unwrap();

    assert_eq!(outcome.source, WeightSource::Raw);
    assert_eq!(outcome.summary.assigned, model.named_state().unwrap().len());
    assert_eq!(outcome.summary.unmatched, 1);
    assert!(outcome.meta.is_none());
    assert_eq!(snapshot(t.trainer.model()), snapshot(&model));
}

#[test]
fn test_resume_resets_counters_by_default() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(&dir, 3);
    let path = source.trainer.save_checkpoint("snapshot").unwrap();

    let other = TempDir::new().unwrap();
    let mut config = create_test_config(other.path());
    config.checkpointing.resume = true;
    let mut target = fresh(config);
    let outcome = target.trainer.load_checkpoint(&path).unwrap();

    assert_eq!(outcome.counters, Some((0, 0)));
    assert!(outcome.optimizer_entries.unwrap() > 0);
    assert_eq!(target.trainer.counters().iter, 0);
    assert_eq!(target.trainer.optimizer().step_count(), 3);
}

#[test]
fn test_resume_can_restore_counters() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(&dir, 3);
    let path = source.trainer.save_checkpoint("snapshot").unwrap();

    let other = TempDir::new().unwrap();
    let mut config = create_test_config(other.path());
    config.checkpointing.resume = true;
    config.checkpointing.restore_progress_counters = true;
    config.checkpointing.restore_optimizer_state = false;
    let mut target = fresh(config);
    let outcome = target.trainer.load_checkpoint(&path).unwrap();

    assert_eq!(outcome.counters, Some((1, 3)));
    assert!(outcome.optimizer_entries.is_none());
    assert_eq!(target.trainer.counters().iter, 3);
    assert_eq!(target.trainer.counters().epoch, 1);
    assert_eq!(target.trainer.optimizer().step_count(), 0);
}

#[test]
fn test_resync_on_load_seeds_shadow_from_loaded_weights() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(&dir, 2);
    let path = source.trainer.save_checkpoint("snapshot").unwrap();

    let other = TempDir::new().unwrap();
    let mut target = fresh(create_test_config(other.path()));
    target.trainer.load_checkpoint(&path).unwrap();

    let shadow = target.trainer.ema().state_tensors();
    for (name, var) in target.trainer.model().named_parameters().unwrap() {
        assert_tensor_close(var.as_tensor(), &shadow[&name], 0.0);
    }
}

#[test]
fn test_load_without_resync_restores_saved_shadow() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(&dir, 2);
    let path = source.trainer.save_checkpoint("snapshot").unwrap();
    let saved = source.trainer.ema().state_tensors();

    let other = TempDir::new().unwrap();
    let mut config = create_test_config(other.path());
    config.ema.resync_on_load = false;
    let mut target = fresh(config);
    target.trainer.load_checkpoint(&path).unwrap();

    let shadow = target.trainer.ema().state_tensors();
    assert_eq!(shadow.len(), saved.len());
    for (name, tensor) in &saved {
        assert_tensor_close(&shadow[name], tensor, 0.0);
    }

    // the shadow lags the live weights after two steps at decay 0.999
    let lagging = target
        .trainer
        .model()
        .named_parameters()
        .unwrap()
        .iter()
        .any(|(name, var)| snapshot_tensor(var.as_tensor()) != snapshot_tensor(&shadow[name]));
    assert!(lagging);
}

fn snapshot_tensor(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn test_keep_reference_holds_frozen_copy() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(&dir, 1);
    let path = source.trainer.save_checkpoint("snapshot").unwrap();

    let other = TempDir::new().unwrap();
    let mut config = create_test_config(other.path());
    config.model.keep_reference = true;
    let mut target = fresh(config);
    assert!(target.trainer.reference().is_none());

    target.trainer.load_checkpoint(&path).unwrap();
    let reference = target.trainer.reference().unwrap();
    assert!(!reference.is_empty());

    // training afterwards leaves the reference untouched
    let (name, var) = target.trainer.model().named_parameters().unwrap().remove(0);
    let frozen = reference.get(&name).unwrap().copy().unwrap();
    target
        .trainer
        .train_step(0, &create_labeled_batch(0), &create_labeled_batch(1))
        .unwrap();
    assert_tensor_close(target.trainer.reference().unwrap().get(&name).unwrap(), &frozen, 0.0);
    assert_eq!(var.as_tensor().dims(), frozen.dims());
}

#[test]
fn test_default_resume_policy() {
    let policy = ResumePolicy::default();
    assert!(policy.restore_optimizer_state);
    assert!(!policy.restore_progress_counters);
}

#[test]
fn test_checkpoint_meta_records_best_miou() {
    let dir = TempDir::new().unwrap();
    let mut t = trained(&dir, 1);
    t.trainer.counters_mut().best_miou = 0.41;
    let path = t.trainer.save_checkpoint("best").unwrap();
    assert_eq!(path, t.trainer.checkpoints().path_for("best"));

    let meta = CheckpointManager::read(&path, &create_test_device()).unwrap().meta.unwrap();
    approx::assert_relative_eq!(meta.best_miou, 0.41);
    assert_eq!(meta.iter, 1);
    assert_eq!(meta.epoch, 1);
}
