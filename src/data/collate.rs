use std::path::PathBuf;

use burn::prelude::*;

use super::dataset::DetectionSample;
use crate::boxes::{BBox, Letterbox};
use crate::error::{DetectionError, Result};

/// Zero-padded `[B, N, 4]` boxes on the host. All-zero rows are padding.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBoxes {
    pub data: Vec<f32>,
    pub shape: [usize; 3],
}

impl PaddedBoxes {
    pub fn row(&self, image: usize, row: usize) -> &[f32] {
        let start = (image * self.shape[1] + row) * 4;
        &self.data[start..start + 4]
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(self.data.clone(), self.shape), device)
    }
}

/// Pads every image's box list to the longest one in the batch.
pub fn pad_boxes(per_image: &[&[BBox]]) -> PaddedBoxes {
    let max_boxes = per_image.iter().map(|b| b.len()).max().unwrap_or(0);
    let mut data = vec![0.0f32; per_image.len() * max_boxes * 4];
    for (i, boxes) in per_image.iter().enumerate() {
        for (j, b) in boxes.iter().enumerate() {
            let start = (i * max_boxes + j) * 4;
            data[start..start + 4].copy_from_slice(&b.to_array());
        }
    }
    PaddedBoxes {
        data,
        shape: [per_image.len(), max_boxes, 4],
    }
}

/// A fixed-shape batch ready for the network and the loss.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// One `[B, N_s, 4]` tensor per scale; `N_s >= 1`.
    pub targets: Vec<Tensor<B, 3>>,
    /// Un-split ground truth per image, canvas space.
    pub boxes: Vec<Vec<BBox>>,
    pub paths: Vec<PathBuf>,
    pub letterboxes: Vec<Letterbox>,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Stacks samples into a [`Batch`], padding each scale group independently.
/// Returns `Ok(None)` for an empty sample list.
pub fn pad_batch<B: Backend>(samples: Vec<DetectionSample>, device: &B::Device) -> Result<Option<Batch<B>>> {
    let Some(first) = samples.first() else {
        return Ok(None);
    };
    let canvas = first.canvas;
    let num_scales = first.boxes.len();

    for s in &samples {
        if s.canvas != canvas || s.image.len() != 3 * canvas * canvas {
            return Err(DetectionError::shape(
                "batch image",
                format!("3x{}x{}", canvas, canvas),
                format!("{} values on a {} canvas", s.image.len(), s.canvas),
            ));
        }
        if s.boxes.len() != num_scales {
            return Err(DetectionError::shape("batch scale groups", num_scales, s.boxes.len()));
        }
    }

    let batch = samples.len();
    let mut pixels = Vec::with_capacity(batch * 3 * canvas * canvas);
    for s in &samples {
        pixels.extend_from_slice(&s.image);
    }
    let images = Tensor::from_data(TensorData::new(pixels, [batch, 3, canvas, canvas]), device);

    let targets = (0..num_scales)
        .map(|scale| {
            let groups: Vec<&[BBox]> = samples.iter().map(|s| s.boxes[scale].as_slice()).collect();
            let mut padded = pad_boxes(&groups);
            // keep a zero row so no tensor has an empty axis
            if padded.shape[1] == 0 {
                padded = PaddedBoxes {
                    data: vec![0.0; batch * 4],
                    shape: [batch, 1, 4],
                };
            }
            padded.to_tensor(device)
        })
        .collect();

    let boxes = samples.iter().map(DetectionSample::all_boxes).collect();
    let paths = samples.iter().map(|s| s.path.clone()).collect();
    let letterboxes = samples.iter().map(|s| s.letterbox).collect();

    Ok(Some(Batch {
        images,
        targets,
        boxes,
        paths,
        letterboxes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn boxes(n: usize) -> Vec<BBox> {
        (0..n)
            .map(|i| BBox::new(i as f32, 1.0, i as f32 + 2.0, 3.0))
            .collect()
    }

    #[test]
    fn test_pad_boxes_counts() {
        let (a, b, c) = (boxes(2), boxes(5), boxes(0));
        let padded = pad_boxes(&[&a, &b, &c]);
        assert_eq!(padded.shape, [3, 5, 4]);

        for row in 2..5 {
            assert_eq!(padded.row(0, row), &[0.0; 4]);
        }
        for row in 0..5 {
            assert_eq!(padded.row(2, row), &[0.0; 4]);
        }
        assert_eq!(padded.row(0, 1), &a[1].to_array());
        assert_eq!(padded.row(1, 4), &b[4].to_array());

        let tensor = padded.to_tensor::<TestBackend>(&Default::default());
        assert_eq!(tensor.dims(), [3, 5, 4]);
    }

    fn sample(per_scale: Vec<usize>) -> DetectionSample {
        DetectionSample {
            image: vec![0.5; 3 * 8 * 8],
            canvas: 8,
            boxes: per_scale.into_iter().map(boxes).collect(),
            path: PathBuf::from("x.png"),
            letterbox: Letterbox::centered(8, 8, 8).unwrap(),
        }
    }

    #[test]
    fn test_pad_batch_per_scale() {
        let device = Default::default();
        let batch = pad_batch::<TestBackend>(vec![sample(vec![1, 0, 3]), sample(vec![2, 0, 0])], &device)
            .unwrap()
            .unwrap();
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        let dims: Vec<[usize; 3]> = batch.targets.iter().map(|t| t.dims()).collect();
        assert_eq!(dims, vec![[2, 2, 4], [2, 1, 4], [2, 3, 4]]);
        assert_eq!(batch.boxes[0].len(), 4);
    }

    #[test]
    fn test_pad_batch_rejects_mixed_sizes() {
        let mut odd = sample(vec![1]);
        odd.canvas = 16;
        odd.image = vec![0.0; 3 * 16 * 16];
        let result = pad_batch::<TestBackend>(vec![sample(vec![1]), odd], &Default::default());
        assert!(result.is_err());
        assert!(pad_batch::<TestBackend>(Vec::new(), &Default::default())
            .unwrap()
            .is_none());
    }
}
