use burn::tensor::{activation::relu, backend::Backend, Data, Shape, Tensor};
use derive_new::new;

use crate::{boxes::{center_to_corner, decode, encode, iou}, config::LossMode, data::Annotation, model::DetectorOutput, prior::PriorBox};

pub trait DetectionLoss<B: Backend> {
    /// Scalar training loss of a raw batch output against per-image ground truth.
    fn compute(
        &self,
        output: DetectorOutput<B>,
        priors: &PriorBox,
        targets: &[Vec<Annotation>],
    ) -> Tensor<B, 1>;
}

/// Reference multibox loss: sigmoid BCE on class logits, L1 on encoded offsets.
///
/// `Retina` labels priors by anchor overlap alone. `MutualGuide` keeps the
/// anchor-based regression set but lets the current localization quality
/// drive classification: a prior whose decoded prediction overlaps a ground
/// truth box is trained towards that IoU as its class score.
#[derive(Debug, Clone, new)]
pub struct MultiBoxLoss {
    mode: LossMode,
    #[new(value = "0.5")]
    pos_iou: f32,
    #[new(value = "0.4")]
    neg_iou: f32,
}

struct Targets {
    cls: Vec<f32>,
    cls_weight: Vec<f32>,
    reg: Vec<f32>,
    reg_weight: Vec<f32>,
    num_pos: usize,
}

impl MultiBoxLoss {
    pub fn mode(&self) -> LossMode {
        self.mode
    }

    fn assign(
        &self,
        priors: &PriorBox,
        targets: &[Vec<Annotation>],
        predicted: Option<&[f32]>,
        num_classes: usize,
    ) -> Targets {
        let num_priors = priors.len();
        let batch = targets.len();
        let mut out = Targets {
            cls: vec![0.0; batch * num_priors * num_classes],
            cls_weight: vec![1.0; batch * num_priors * num_classes],
            reg: vec![0.0; batch * num_priors * 4],
            reg_weight: vec![0.0; batch * num_priors * 4],
            num_pos: 0,
        };
        let corners: Vec<[f32; 4]> = priors.as_slice().iter().map(center_to_corner).collect();

        for (b, gts) in targets.iter().enumerate() {
            if gts.is_empty() {
                continue;
            }

            // best ground truth per prior, by anchor overlap
            let mut best: Vec<(usize, f32)> = corners
                .iter()
                .map(|prior| {
                    gts.iter()
                        .enumerate()
                        .map(|(g, gt)| (g, iou(prior, &gt.bbox)))
                        .fold((0, -1.0), |acc, cur| if cur.1 > acc.1 { cur } else { acc })
                })
                .collect();
            // every ground truth keeps at least its best prior
            for (g, gt) in gts.iter().enumerate() {
                let forced = corners
                    .iter()
                    .enumerate()
                    .map(|(k, prior)| (k, iou(prior, &gt.bbox)))
                    .fold((0, -1.0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
                best[forced.0] = (g, 2.0);
            }

            for (k, (g, overlap)) in best.into_iter().enumerate() {
                let gt = &gts[g];
                let row = b * num_priors + k;
                let cls_row = row * num_classes;

                let anchor_pos = overlap >= self.pos_iou;
                if anchor_pos {
                    let t = encode(&gt.bbox, &priors.as_slice()[k]);
                    out.reg[row * 4..row * 4 + 4].copy_from_slice(&t);
                    out.reg_weight[row * 4..row * 4 + 4].fill(1.0);
                    out.num_pos += 1;
                }

                match (self.mode, predicted) {
                    (LossMode::MutualGuide, Some(pred)) => {
                        let loc = [pred[row * 4], pred[row * 4 + 1], pred[row * 4 + 2], pred[row * 4 + 3]];
                        let quality = iou(&decode(&loc, &priors.as_slice()[k]), &gt.bbox);
                        if anchor_pos || quality >= self.pos_iou {
                            out.cls[cls_row + gt.label] = quality.max(0.0);
                        } else if overlap >= self.neg_iou || quality >= self.neg_iou {
                            out.cls_weight[cls_row..cls_row + num_classes].fill(0.0);
                        }
                    }
                    _ => {
                        if anchor_pos {
                            out.cls[cls_row + gt.label] = 1.0;
                        } else if overlap >= self.neg_iou {
                            out.cls_weight[cls_row..cls_row + num_classes].fill(0.0);
                        }
                    }
                }
            }
        }
        out
    }
}

impl<B: Backend> DetectionLoss<B> for MultiBoxLoss {
    fn compute(
        &self,
        output: DetectorOutput<B>,
        priors: &PriorBox,
        targets: &[Vec<Annotation>],
    ) -> Tensor<B, 1> {
        let device = output.conf.device();
        let [batch, num_priors, num_classes] = output.conf.dims();

        let predicted = match self.mode {
            LossMode::MutualGuide => Some(output.loc.clone().detach().to_data().convert::<f32>().value),
            LossMode::Retina => None,
        };
        let t = self.assign(priors, targets, predicted.as_deref(), num_classes);
        let tensor = |values: Vec<f32>, last: usize| {
            Tensor::<B, 3>::from_data(
                Data::new(values, Shape::new([batch, num_priors, last])).convert(),
                &device,
            )
        };

        let x = output.conf;
        let cls_target = tensor(t.cls, num_classes);
        let cls_weight = tensor(t.cls_weight, num_classes);
        let bce = relu(x.clone()) - x.clone() * cls_target + x.abs().neg().exp().add_scalar(1.0).log();
        let cls_loss = (bce * cls_weight).sum();

        let reg_target = tensor(t.reg, 4);
        let reg_weight = tensor(t.reg_weight, 4);
        let reg_loss = ((output.loc - reg_target).abs() * reg_weight).sum();

        (cls_loss + reg_loss).div_scalar(t.num_pos.max(1) as f32)
    }
}
