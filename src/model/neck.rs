use burn::prelude::*;

use crate::model::blocks::{upsample_route, ConvBlock};
use crate::model::config::{DetectionScale, ModelConfig};

/// 1x1 -> 3x3 -> 1x1 bottleneck used after every fusion point.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    squeeze: ConvBlock<B>,
    spread: ConvBlock<B>,
    project: ConvBlock<B>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn new(device: &B::Device, in_channels: usize, channels: usize, slope: f64) -> Self {
        let half = channels / 2;
        Self {
            squeeze: ConvBlock::new(device, in_channels, half, 1, 1, slope),
            spread: ConvBlock::new(device, half, channels, 3, 1, slope),
            project: ConvBlock::new(device, channels, half, 1, 1, slope),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.project.out_channels()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.squeeze.forward(x);
        let x = self.spread.forward(x);
        self.project.forward(x)
    }
}

/// Top-down step: reduce the coarser feature, upsample it and fuse it with the
/// lateral backbone feature.
#[derive(Module, Debug)]
pub struct FpnLevel<B: Backend> {
    lateral: ConvBlock<B>,
    fuse: Bottleneck<B>,
}

impl<B: Backend> FpnLevel<B> {
    fn new(
        device: &B::Device,
        coarse_channels: usize,
        skip_channels: usize,
        slope: f64,
    ) -> Self {
        let reduced = skip_channels / 2;
        Self {
            lateral: ConvBlock::new(device, coarse_channels, reduced, 1, 1, slope),
            fuse: Bottleneck::new(device, reduced + skip_channels, skip_channels, slope),
        }
    }

    fn forward(&self, coarse: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let reduced = self.lateral.forward(coarse); // [B, C/2, H, W]
        let cat = upsample_route(reduced, skip); // [B, C/2 + C, 2H, 2W]
        self.fuse.forward(cat)
    }
}

/// Multi-scale features for the detection heads, finest first. Only scales
/// that are active (or needed to reach an active finer scale) are computed.
#[derive(Debug, Clone)]
pub struct NeckOutput<B: Backend> {
    pub small: Option<Tensor<B, 4>>,
    pub medium: Option<Tensor<B, 4>>,
    pub large: Tensor<B, 4>,
}

impl<B: Backend> NeckOutput<B> {
    pub fn get(&self, scale: DetectionScale) -> Option<Tensor<B, 4>> {
        match scale {
            DetectionScale::Small => self.small.clone(),
            DetectionScale::Medium => self.medium.clone(),
            DetectionScale::Large => Some(self.large.clone()),
        }
    }
}

#[derive(Module, Debug)]
pub struct Neck<B: Backend> {
    large: Bottleneck<B>,
    medium: Option<FpnLevel<B>>,
    small: Option<FpnLevel<B>>,
}

impl<B: Backend> Neck<B> {
    pub fn new(device: &B::Device, config: &ModelConfig) -> Self {
        let slope = config.negative_slope;
        let scales = config.scales();
        let c3 = config.backbone_channels(DetectionScale::Small);
        let c4 = config.backbone_channels(DetectionScale::Medium);
        let c5 = config.backbone_channels(DetectionScale::Large);

        let need_small = scales.contains(&DetectionScale::Small);
        let need_medium = need_small || scales.contains(&DetectionScale::Medium);

        let large = Bottleneck::new(device, c5, c5, slope); // c5 -> c5/2
        let medium = need_medium.then(|| FpnLevel::new(device, c5 / 2, c4, slope)); // -> c4/2
        let small = need_small.then(|| FpnLevel::new(device, c4 / 2, c3, slope)); // -> c3/2

        Self { large, medium, small }
    }

    /// Channels of each scale's output feature: half the backbone width at
    /// that stride.
    pub fn out_channels(config: &ModelConfig, scale: DetectionScale) -> usize {
        config.backbone_channels(scale) / 2
    }

    pub fn forward(
        &self,
        c3: Tensor<B, 4>, // [B, C3, H/8, W/8]
        c4: Tensor<B, 4>, // [B, C4, H/16, W/16]
        c5: Tensor<B, 4>, // [B, C5, H/32, W/32]
    ) -> NeckOutput<B> {
        let large = self.large.forward(c5); // [B, C5/2, H/32, W/32]
        let medium = self
            .medium
            .as_ref()
            .map(|level| level.forward(large.clone(), c4)); // [B, C4/2, H/16, W/16]
        let small = match (&self.small, &medium) {
            (Some(level), Some(m)) => Some(level.forward(m.clone(), c3)), // [B, C3/2, H/8, W/8]
            _ => None,
        };

        NeckOutput { small, medium, large }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_all_scales() {
        let device = Default::default();
        let config = ModelConfig::tiny();
        let neck = Neck::<TestBackend>::new(&device, &config);
        let out = neck.forward(
            Tensor::zeros([1, 8, 8, 8], &device),
            Tensor::zeros([1, 8, 4, 4], &device),
            Tensor::zeros([1, 8, 2, 2], &device),
        );
        assert_eq!(out.small.unwrap().dims(), [1, 4, 8, 8]);
        assert_eq!(out.medium.unwrap().dims(), [1, 4, 4, 4]);
        assert_eq!(out.large.dims(), [1, 4, 2, 2]);
    }

    #[test]
    fn test_medium_only_skips_small_branch() {
        let device = Default::default();
        let config = ModelConfig {
            active_scales: vec![DetectionScale::Medium],
            ..ModelConfig::tiny()
        };
        let neck = Neck::<TestBackend>::new(&device, &config);
        let out = neck.forward(
            Tensor::zeros([1, 8, 8, 8], &device),
            Tensor::zeros([1, 8, 4, 4], &device),
            Tensor::zeros([1, 8, 2, 2], &device),
        );
        assert!(out.small.is_none());
        assert_eq!(out.medium.unwrap().dims(), [1, 4, 4, 4]);
    }
}
