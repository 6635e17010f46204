use burn::prelude::*;

/// Hard coordinate clipping with a straight-through gradient.
///
/// Forward clips every value into `[min, max]`. Backward passes the upstream
/// gradient through unchanged for inputs that were inside the range and zeroes
/// it for inputs that were clipped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampBoxCoords {
    pub min: f32,
    pub max: f32,
}

impl ClampBoxCoords {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Clamp onto a `[0, size]` canvas.
    pub fn canvas(size: f32) -> Self {
        Self::new(0.0, size)
    }

    /// Differentiable forward transform. Under an autodiff backend the
    /// resulting gradient is exactly [`ClampBoxCoords::backward`].
    pub fn forward<B: Backend, const D: usize>(&self, inputs: Tensor<B, D>) -> Tensor<B, D> {
        let in_range = self.in_range_mask(inputs.clone());
        let out_of_range = in_range.clone().neg().add_scalar(1.0);
        let clipped = inputs.clone().detach().clamp(self.min, self.max);

        inputs * in_range + clipped * out_of_range
    }

    /// Gradient rule: `grad_output` masked to zero wherever the input was
    /// outside `[min, max]`.
    pub fn backward<B: Backend, const D: usize>(
        &self,
        inputs: Tensor<B, D>,
        grad_output: Tensor<B, D>,
    ) -> Tensor<B, D> {
        grad_output
            .mask_fill(inputs.clone().lower_elem(self.min), 0.0)
            .mask_fill(inputs.greater_elem(self.max), 0.0)
    }

    /// Host-side forward for already-extracted coordinates.
    pub fn clamp_value(&self, v: f32) -> f32 {
        v.clamp(self.min, self.max)
    }

    fn in_range_mask<B: Backend, const D: usize>(&self, inputs: Tensor<B, D>) -> Tensor<B, D> {
        let above_min = inputs.clone().greater_equal_elem(self.min).float();
        let below_max = inputs.lower_equal_elem(self.max).float();
        above_min * below_max
    }
}
