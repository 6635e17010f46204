use burn::prelude::*;

use super::ConvBlock;
use crate::error::{DetectionError, Result};

/// 1x1 reduction followed by a 3x3 expansion, added back onto the input.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    reduce: ConvBlock<B>,
    expand: ConvBlock<B>,
}

impl<B: Backend> ResidualBlock<B> {
    /// The skip-add needs the block output to match the input exactly, so a
    /// channel or stride change is rejected here instead of at the first
    /// forward pass.
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        negative_slope: f64,
    ) -> Result<Self> {
        let hidden = out_channels / 2;
        if hidden == 0 {
            return Err(DetectionError::shape(
                "residual block",
                "at least 2 output channels",
                out_channels,
            ));
        }

        let reduce = ConvBlock::new(device, in_channels, hidden, 1, 1, negative_slope);
        let expand = ConvBlock::new(device, hidden, out_channels, 3, 1, negative_slope);
        Self::from_parts(reduce, expand)
    }

    pub fn from_parts(reduce: ConvBlock<B>, expand: ConvBlock<B>) -> Result<Self> {
        if reduce.out_channels() != expand.in_channels() {
            return Err(DetectionError::shape(
                "residual block inner channels",
                reduce.out_channels(),
                expand.in_channels(),
            ));
        }
        if expand.out_channels() != reduce.in_channels() {
            return Err(DetectionError::shape(
                "residual skip channels",
                reduce.in_channels(),
                expand.out_channels(),
            ));
        }
        if reduce.stride() != 1 || expand.stride() != 1 {
            return Err(DetectionError::shape(
                "residual skip stride",
                1,
                reduce.stride() * expand.stride(),
            ));
        }
        Ok(Self { reduce, expand })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branch = self.reduce.forward(x.clone());
        let branch = self.expand.forward(branch);
        x + branch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_preserves_shape() {
        let device = Default::default();
        let block = ResidualBlock::<TestBackend>::new(&device, 8, 8, 0.1).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([2, 8, 5, 5], &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 5, 5]);
    }

    #[test]
    fn test_rejects_channel_change() {
        let device = Default::default();
        assert!(matches!(
            ResidualBlock::<TestBackend>::new(&device, 8, 16, 0.1),
            Err(DetectionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_strided_parts() {
        let device = Default::default();
        let reduce = ConvBlock::<TestBackend>::new(&device, 8, 4, 1, 1, 0.1);
        let expand = ConvBlock::<TestBackend>::new(&device, 4, 8, 3, 2, 0.1);
        assert!(ResidualBlock::from_parts(reduce, expand).is_err());
    }
}
