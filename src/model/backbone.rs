use burn::prelude::*;

use super::blocks::{ConvBlock, ResidualBlock};
use super::config::ModelConfig;
use crate::error::Result;

/// One stride-2 downsample followed by residual blocks at the new width.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    down: ConvBlock<B>,
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> Stage<B> {
    fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        depth: usize,
        negative_slope: f64,
    ) -> Result<Self> {
        let down = ConvBlock::new(device, in_channels, out_channels, 3, 2, negative_slope);
        let blocks = (0..depth)
            .map(|_| ResidualBlock::new(device, out_channels, out_channels, negative_slope))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { down, blocks })
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.down.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }
}

/// Darknet-style residual backbone. Returns the stride 8, 16 and 32 feature
/// maps.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: ConvBlock<B>,
    stages: Vec<Stage<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn new(device: &B::Device, config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let slope = config.negative_slope;
        let stem = ConvBlock::new(device, 3, config.stem_channels, 3, 1, slope);

        let mut stages = Vec::with_capacity(ModelConfig::NUM_STAGES);
        let mut in_channels = config.stem_channels;
        for (&out_channels, &depth) in config.stage_channels.iter().zip(&config.stage_depths) {
            stages.push(Stage::new(device, in_channels, out_channels, depth, slope)?);
            in_channels = out_channels;
        }

        log::debug!(
            "Backbone: stem={} stages={:?} depths={:?}",
            config.stem_channels,
            config.stage_channels,
            config.stage_depths
        );

        Ok(Self { stem, stages })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let mut x = self.stem.forward(x);
        let mut features = Vec::with_capacity(3);
        for (i, stage) in self.stages.iter().enumerate() {
            x = stage.forward(x);
            // stages 2..=4 sit at strides 8, 16, 32
            if i >= 2 {
                features.push(x.clone());
            }
        }
        let c5 = features.pop().unwrap_or_else(|| x.clone());
        let c4 = features.pop().unwrap_or_else(|| c5.clone());
        let c3 = features.pop().unwrap_or_else(|| c4.clone());
        (c3, c4, c5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_strides() {
        let device = Default::default();
        let backbone = Backbone::<TestBackend>::new(&device, &ModelConfig::tiny()).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        let (c3, c4, c5) = backbone.forward(x);
        assert_eq!(c3.dims(), [1, 8, 8, 8]);
        assert_eq!(c4.dims(), [1, 8, 4, 4]);
        assert_eq!(c5.dims(), [1, 8, 2, 2]);
    }
}
