use burn::tensor::{activation::sigmoid, backend::Backend};
use ndarray::Array2;

use crate::{boxes::{decode, iou}, model::DetectorOutput, prior::PriorBox};

/// Greedy non-maximum suppression. Returns the kept indices, best score first.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));

    let mut keep: Vec<usize> = Vec::new();
    for i in order {
        if keep.iter().all(|k| iou(&boxes[*k], &boxes[i]) <= iou_thresh) {
            keep.push(i);
        }
    }
    keep
}

/// Decodes the raw output of a single image into pixel-space boxes `[N, 4]`
/// and class scores `[N, C]`.
///
/// Only priors whose best class clears `eval_thresh` become candidates.
/// Suppression runs per class; a suppressed candidate keeps its row with that
/// class score zeroed, so one box can survive for one class and not another.
pub fn post_process<B: Backend>(
    output: DetectorOutput<B>,
    priors: &PriorBox,
    scale: [f32; 4],
    eval_thresh: f32,
    nms_thresh: f32,
) -> (Array2<f32>, Array2<f32>) {
    let [_, num_priors, num_classes] = output.conf.dims();
    let loc = output.loc.into_data().convert::<f32>().value;
    let conf = sigmoid(output.conf).into_data().convert::<f32>().value;

    let mut boxes: Vec<[f32; 4]> = Vec::new();
    let mut scores: Vec<f32> = Vec::new();
    for (k, prior) in priors.as_slice().iter().enumerate().take(num_priors) {
        let row = &conf[k * num_classes..(k + 1) * num_classes];
        if !row.iter().any(|s| *s > eval_thresh) {
            continue;
        }
        let offsets = [loc[k * 4], loc[k * 4 + 1], loc[k * 4 + 2], loc[k * 4 + 3]];
        let corner = decode(&offsets, prior);
        boxes.push([
            corner[0] * scale[0],
            corner[1] * scale[1],
            corner[2] * scale[2],
            corner[3] * scale[3],
        ]);
        scores.extend_from_slice(row);
    }

    let n = boxes.len();
    for c in 0..num_classes {
        let members: Vec<usize> = (0..n).filter(|i| scores[i * num_classes + c] > eval_thresh).collect();
        let member_boxes: Vec<[f32; 4]> = members.iter().map(|i| boxes[*i]).collect();
        let member_scores: Vec<f32> = members.iter().map(|i| scores[i * num_classes + c]).collect();

        let mut kept = vec![false; members.len()];
        for k in nms(&member_boxes, &member_scores, nms_thresh) {
            kept[k] = true;
        }
        for (m, i) in members.iter().enumerate() {
            if !kept[m] {
                scores[i * num_classes + c] = 0.0;
            }
        }
    }

    let boxes = Array2::from_shape_vec((n, 4), boxes.into_iter().flatten().collect())
        .unwrap_or_else(|_| Array2::zeros((0, 4)));
    let scores = Array2::from_shape_vec((n, num_classes), scores).unwrap_or_else(|_| Array2::zeros((0, num_classes)));
    (boxes, scores)
}
