//! Small reference dual-head convolutional segmentation network
//!
//! Layout: a full-resolution stem, a stride-2 context block upsampled back to
//! the input size, a main 1x1 classifier on the context features and an
//! auxiliary 1x1 classifier on the stem features. Batch-norm running
//! statistics live in the same [`VarMap`] as the weights and are reported as
//! buffers rather than parameters.

use candle_core::{DType, Device, Module, ModuleT, Tensor, Var};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ParameterGroup, Prediction, SegmentationModel};
use crate::error::{Error, Result};

const BUFFER_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];
const HEAD_PREFIX: &str = "head.";

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualHeadConfig {
    pub in_channels: usize,
    pub width: usize,
    pub num_classes: usize,
    pub num_targets: usize,
    pub bn_eps: f64,
}

impl Default for DualHeadConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            width: 32,
            num_classes: 19,
            num_targets: 1,
            bn_eps: 1e-5,
        }
    }
}

/// Reference dual-head network
pub struct DualHeadSegNet {
    config: DualHeadConfig,
    var_map: VarMap,
    stem: Conv2d,
    stem_bn: BatchNorm,
    context: Conv2d,
    context_bn: BatchNorm,
    main_head: Conv2d,
    aux_head: Conv2d,
}

impl DualHeadSegNet {
    /// Build a freshly initialized network on `device`
    pub fn new(config: DualHeadConfig, device: &Device) -> Result<Self> {
        if config.num_classes == 0 || config.width == 0 {
            return Err(Error::config("num_classes and width must be greater than 0"));
        }

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let strided = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let stem = candle_nn::conv2d(config.in_channels, config.width, 3, padded, vb.pp("backbone.stem"))?;
        let stem_bn = candle_nn::batch_norm(config.width, config.bn_eps, vb.pp("backbone.stem_bn"))?;
        let context = candle_nn::conv2d(config.width, config.width, 3, strided, vb.pp("backbone.context"))?;
        let context_bn = candle_nn::batch_norm(config.width, config.bn_eps, vb.pp("backbone.context_bn"))?;
        let main_head = candle_nn::conv2d(
            config.width,
            config.num_classes,
            1,
            Default::default(),
            vb.pp("head.main"),
        )?;
        let aux_head = candle_nn::conv2d(
            config.width,
            config.num_classes,
            1,
            Default::default(),
            vb.pp("head.aux"),
        )?;

        debug!(
            "Built dual-head network: width={}, classes={}",
            config.width, config.num_classes
        );

        Ok(Self {
            config,
            var_map,
            stem,
            stem_bn,
            context,
            context_bn,
            main_head,
            aux_head,
        })
    }

    pub fn config(&self) -> &DualHeadConfig {
        &self.config
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn sorted_vars<F>(&self, keep: F) -> Result<Vec<(String, Var)>>
    where
        F: Fn(&str) -> bool,
    {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::invalid_state("variable map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| keep(name))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }
}

fn is_buffer(name: &str) -> bool {
    BUFFER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

impl SegmentationModel for DualHeadSegNet {
    fn forward_t(&self, images: &Tensor, target: usize, train: bool) -> Result<Prediction> {
        if target > self.config.num_targets {
            return Err(Error::invalid_input(format!(
                "target selector {} exceeds {} target domains",
                target, self.config.num_targets
            )));
        }
        let (_n, _c, h, w) = images.dims4()?;

        let low = self.stem.forward(images)?;
        let low = self.stem_bn.forward_t(&low, train)?.relu()?;

        let high = self.context.forward(&low)?;
        let high = self.context_bn.forward_t(&high, train)?.relu()?;
        let high = high.upsample_nearest2d(h, w)?;

        let main = self.main_head.forward(&high)?;
        let aux = self.aux_head.forward(&low)?;
        Ok(Prediction::Dual { main, aux })
    }

    fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        self.sorted_vars(|name| !is_buffer(name))
    }

    fn named_buffers(&self) -> Result<Vec<(String, Var)>> {
        self.sorted_vars(is_buffer)
    }

    fn parameter_groups(&self) -> Result<Vec<ParameterGroup>> {
        let (head, backbone): (Vec<_>, Vec<_>) = self
            .named_parameters()?
            .into_iter()
            .partition(|(name, _)| name.starts_with(HEAD_PREFIX));

        Ok(vec![
            ParameterGroup {
                name: "backbone".to_string(),
                params: backbone,
            },
            ParameterGroup {
                name: "head".to_string(),
                params: head,
            },
        ])
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> DualHeadSegNet {
        let config = DualHeadConfig {
            width: 4,
            num_classes: 3,
            ..Default::default()
        };
        DualHeadSegNet::new(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let model = tiny();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 5, 6), &Device::Cpu).unwrap();
        let pred = model.forward_t(&x, 1, false).unwrap();
        assert_eq!(pred.main().dims(), &[2, 3, 5, 6]);
        assert_eq!(pred.aux().unwrap().dims(), &[2, 3, 5, 6]);
    }

    #[test]
    fn test_buffers_are_not_parameters() {
        let model = tiny();
        let params = model.named_parameters().unwrap();
        let buffers = model.named_buffers().unwrap();

        assert_eq!(buffers.len(), 4);
        assert!(params.iter().all(|(name, _)| !is_buffer(name)));
        assert!(params.iter().any(|(name, _)| name == "head.main.weight"));
    }

    #[test]
    fn test_parameter_groups_split_head() {
        let model = tiny();
        let groups = model.parameter_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[1].params.iter().all(|(n, _)| n.starts_with(HEAD_PREFIX)));
        assert!(groups[0].params.iter().all(|(n, _)| n.starts_with("backbone.")));
        let total: usize = groups.iter().map(|g| g.params.len()).sum();
        assert_eq!(total, model.named_parameters().unwrap().len());
    }

    #[test]
    fn test_train_forward_moves_running_stats() {
        let model = tiny();
        let before = model.named_buffers().unwrap()[0].1.as_tensor().copy().unwrap();
        let x = Tensor::randn(3f32, 1.0, (2, 3, 4, 4), &Device::Cpu).unwrap();
        model.forward_t(&x, 1, true).unwrap();
        let after = model.named_buffers().unwrap()[0].1.as_tensor().clone();
        let diff = (after - before)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0);
    }
}
