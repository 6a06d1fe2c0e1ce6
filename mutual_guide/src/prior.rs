use itertools::iproduct;

/// Feature strides of the five pyramid levels, finest first.
pub const STRIDES: [usize; 5] = [8, 16, 32, 64, 128];

/// Ordered anchor set shared read-only by training and evaluation.
///
/// One square anchor per feature-map cell, `[cx, cy, w, h]` normalized to the
/// input size. Level-major, then row-major within a level, which is the order
/// the detector head flattens its outputs in.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorBox {
    priors: Vec<[f32; 4]>,
    feature_sizes: Vec<usize>,
}

impl PriorBox {
    pub fn new(anchor_size: f32, image_size: usize) -> Self {
        let feature_sizes: Vec<usize> = STRIDES.iter().map(|s| feature_size(image_size, *s)).collect();
        let mut priors = Vec::new();

        for (stride, fsize) in STRIDES.iter().zip(feature_sizes.iter()) {
            let step = *stride as f32 / image_size as f32;
            let side = anchor_size * (*stride as f32 / STRIDES[0] as f32) / image_size as f32;
            for (i, j) in iproduct!(0..*fsize, 0..*fsize) {
                let cx = (j as f32 + 0.5) * step;
                let cy = (i as f32 + 0.5) * step;
                priors.push([cx, cy, side, side]);
            }
        }

        Self {
            priors,
            feature_sizes,
        }
    }

    pub fn len(&self) -> usize {
        self.priors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }

    pub fn as_slice(&self) -> &[[f32; 4]] {
        &self.priors
    }

    pub fn feature_sizes(&self) -> &[usize] {
        &self.feature_sizes
    }
}

/// Side of the feature map produced by repeated stride-2 3x3 convolutions (padding 1).
pub fn feature_size(image_size: usize, stride: usize) -> usize {
    (image_size + stride - 1) / stride
}
