use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;

use crate::model::blocks::ConvBlock;
use crate::model::config::{DetectionScale, ModelConfig};
use crate::model::neck::{Neck, NeckOutput};

/// Prediction branch for one scale: 3x3 conv block, then a 1x1 projection to
/// `anchors * (5 + classes)` channels.
#[derive(Module, Debug)]
pub struct ScaleHead<B: Backend> {
    conv: ConvBlock<B>,
    pred: Conv2d<B>,
}

impl<B: Backend> ScaleHead<B> {
    fn new(device: &B::Device, in_channels: usize, out_channels: usize, slope: f64) -> Self {
        Self {
            conv: ConvBlock::new(device, in_channels, in_channels * 2, 3, 1, slope),
            pred: Conv2dConfig::new([in_channels * 2, out_channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pred.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct DetectionHead<B: Backend> {
    heads: Vec<ScaleHead<B>>,
    anchors_per_scale: usize,
    entry_size: usize,
}

impl<B: Backend> DetectionHead<B> {
    pub fn new(device: &B::Device, config: &ModelConfig) -> Self {
        let heads = config
            .scales()
            .into_iter()
            .map(|scale| {
                ScaleHead::new(
                    device,
                    Neck::<B>::out_channels(config, scale),
                    config.head_channels(),
                    config.negative_slope,
                )
            })
            .collect();

        log::info!(
            "DetectionHead init: scales={:?} channels={} ({} anchors x (5 + {}))",
            config.scales(),
            config.head_channels(),
            config.anchors_per_scale,
            config.num_classes
        );

        Self {
            heads,
            anchors_per_scale: config.anchors_per_scale,
            entry_size: config.entry_size(),
        }
    }

    /// One `[B, H, W, A, 5 + C]` tensor per active scale, finest first.
    pub fn forward(&self, features: &NeckOutput<B>, scales: &[DetectionScale]) -> Vec<Tensor<B, 5>> {
        self.heads
            .iter()
            .zip(scales)
            .filter_map(|(head, &scale)| features.get(scale).map(|f| head.forward(f)))
            .map(|raw| self.to_grid(raw))
            .collect()
    }

    /// `[B, A*(5+C), H, W]` -> `[B, H, W, A, 5+C]`
    fn to_grid(&self, raw: Tensor<B, 4>) -> Tensor<B, 5> {
        let [batch, _, height, width] = raw.dims();
        raw.reshape([batch, self.anchors_per_scale, self.entry_size, height, width])
            .permute([0, 3, 4, 1, 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_grid_layout() {
        let device = Default::default();
        let config = ModelConfig::tiny();
        let head = DetectionHead::<TestBackend>::new(&device, &config);

        // channel a*(5+C)+k of pixel (h, w) must land at [h, w, a, k]
        let raw = Tensor::<TestBackend, 1, Int>::arange(0..(18 * 2 * 3) as i64, &device)
            .float()
            .reshape([1, 18, 2, 3]);
        let grid = head.to_grid(raw);
        assert_eq!(grid.dims(), [1, 2, 3, 3, 6]);

        let (h, w, a, k) = (1, 2, 2, 4);
        let v: Vec<f32> = grid
            .slice([0..1, h..h + 1, w..w + 1, a..a + 1, k..k + 1])
            .into_data()
            .to_vec()
            .unwrap();
        let channel = a * 6 + k;
        assert_eq!(v[0], (channel * 6 + h * 3 + w) as f32);
    }
}
