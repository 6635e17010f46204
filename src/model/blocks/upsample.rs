use burn::prelude::*;

/// Darknet-style route: nearest-neighbour upsamples a coarse feature map to
/// the resolution of a lateral one and stacks the two along channels,
/// `[B, Cc, h, w]` + `[B, Cl, H, W]` -> `[B, Cc + Cl, H, W]`.
///
/// The per-axis factor is read from the shapes, so the lateral map must be a
/// whole multiple of the coarse one (always true for stride-2 pyramids).
pub fn upsample_route<B: Backend>(coarse: Tensor<B, 4>, lateral: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = lateral.dims();
    let up = nearest(coarse, height, width);
    Tensor::cat(vec![up, lateral], 1)
}

/// Repeats every pixel `height / h` times down and `width / w` times across.
fn nearest<B: Backend>(x: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, channels, h, w] = x.dims();
    let (fy, fx) = (height / h.max(1), width / w.max(1));
    if fy == 1 && fx == 1 {
        return x;
    }
    x.reshape([batch, channels, h, 1, w, 1])
        .repeat_dim(3, fy)
        .repeat_dim(5, fx)
        .reshape([batch, channels, h * fy, w * fx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_upsamples_then_stacks_lateral() {
        let device = Default::default();
        let coarse = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 2.0], [3.0, 4.0]]]], &device);
        let lateral = Tensor::<TestBackend, 4>::full([1, 2, 4, 4], 9.0, &device);

        let out = upsample_route(coarse, lateral);
        assert_eq!(out.dims(), [1, 3, 4, 4]);

        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert_eq!(
            &values[..16],
            &[
                1.0, 1.0, 2.0, 2.0, //
                1.0, 1.0, 2.0, 2.0, //
                3.0, 3.0, 4.0, 4.0, //
                3.0, 3.0, 4.0, 4.0,
            ]
        );
        assert!(values[16..].iter().all(|&v| v == 9.0));
    }

    #[test]
    fn test_same_resolution_is_plain_concat() {
        let device = Default::default();
        let coarse = Tensor::<TestBackend, 4>::ones([2, 1, 3, 3], &device);
        let lateral = Tensor::<TestBackend, 4>::zeros([2, 5, 3, 3], &device);
        assert_eq!(upsample_route(coarse, lateral).dims(), [2, 6, 3, 3]);
    }
}
