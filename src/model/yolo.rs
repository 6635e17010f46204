use burn::module::Ignored;
use burn::prelude::*;

use super::backbone::Backbone;
use super::config::{DetectionScale, ModelConfig};
use super::head::DetectionHead;
use super::neck::Neck;
use crate::error::{DetectionError, Result};

/// YOLO-style single-class text detector.
///
/// Input is a normalized `[B, 3, S, S]` canvas with `S` divisible by 32. The
/// output holds one `[B, S/stride, S/stride, A, 5 + C]` tensor per active
/// scale, finest grid first; the first five values of each entry are
/// `(tx, ty, tw, th, confidence_logit)`.
#[derive(Module, Debug)]
pub struct TextDetector<B: Backend> {
    pub backbone: Backbone<B>,
    pub neck: Neck<B>,
    pub head: DetectionHead<B>,
    config: Ignored<ModelConfig>,
}

impl<B: Backend> TextDetector<B> {
    pub fn new(device: &B::Device, config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let detector = Self {
            backbone: Backbone::new(device, config)?,
            neck: Neck::new(device, config),
            head: DetectionHead::new(device, config),
            config: Ignored(config.clone()),
        };
        log::info!(
            "TextDetector: {} parameters, scales {:?}",
            detector.num_params(),
            config.scales()
        );
        Ok(detector)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config.0
    }

    pub fn scales(&self) -> Vec<DetectionScale> {
        self.config.0.scales()
    }

    /// Checks an input batch before the forward pass.
    pub fn check_input(&self, x: &Tensor<B, 4>) -> Result<()> {
        let [_, channels, height, width] = x.dims();
        if channels != 3 {
            return Err(DetectionError::shape("detector input channels", 3, channels));
        }
        if height != width || height % 32 != 0 {
            return Err(DetectionError::shape(
                "detector input canvas",
                "square with side divisible by 32",
                format!("{}x{}", height, width),
            ));
        }
        Ok(())
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 5>> {
        let (c3, c4, c5) = self.backbone.forward(x);
        let features = self.neck.forward(c3, c4, c5);
        self.head.forward(&features, &self.scales())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = TextDetector::<TestBackend>::new(&device, &ModelConfig::tiny()).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        model.check_input(&x).unwrap();

        let outputs = model.forward(x);
        let dims: Vec<[usize; 5]> = outputs.iter().map(|t| t.dims()).collect();
        assert_eq!(
            dims,
            vec![[2, 8, 8, 3, 6], [2, 4, 4, 3, 6], [2, 2, 2, 3, 6]]
        );
    }

    #[test]
    fn test_single_scale() {
        let device = Default::default();
        let config = ModelConfig {
            active_scales: vec![DetectionScale::Medium],
            ..ModelConfig::tiny()
        };
        let model = TextDetector::<TestBackend>::new(&device, &config).unwrap();
        let outputs = model.forward(Tensor::zeros([1, 3, 64, 64], &device));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].dims(), [1, 4, 4, 3, 6]);
    }

    #[test]
    fn test_rejects_non_square_input() {
        let device = Default::default();
        let model = TextDetector::<TestBackend>::new(&device, &ModelConfig::tiny()).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 96], &device);
        assert!(model.check_input(&x).is_err());
    }
}
