//! Box geometry shared by target assignment, decoding and matching.
//!
//! Corner boxes are `[x1, y1, x2, y2]`, center boxes are `[cx, cy, w, h]`.

/// Offsets are divided by these before regression, as in SSD/RetinaNet.
pub const VARIANCES: [f32; 2] = [0.1, 0.2];

pub fn area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x0 = a[0].max(b[0]);
    let y0 = a[1].max(b[1]);
    let x1 = a[2].min(b[2]);
    let y1 = a[3].min(b[3]);
    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

pub fn center_to_corner(b: &[f32; 4]) -> [f32; 4] {
    [
        b[0] - b[2] / 2.0,
        b[1] - b[3] / 2.0,
        b[0] + b[2] / 2.0,
        b[1] + b[3] / 2.0,
    ]
}

/// Regression target of a corner-form ground truth box against a center-form prior.
pub fn encode(gt: &[f32; 4], prior: &[f32; 4]) -> [f32; 4] {
    let w = (gt[2] - gt[0]).max(1e-6);
    let h = (gt[3] - gt[1]).max(1e-6);
    let cx = (gt[0] + gt[2]) / 2.0;
    let cy = (gt[1] + gt[3]) / 2.0;
    [
        (cx - prior[0]) / (VARIANCES[0] * prior[2]),
        (cy - prior[1]) / (VARIANCES[0] * prior[3]),
        (w / prior[2]).ln() / VARIANCES[1],
        (h / prior[3]).ln() / VARIANCES[1],
    ]
}

/// Inverse of [`encode`]: corner-form box in normalized coordinates.
pub fn decode(loc: &[f32; 4], prior: &[f32; 4]) -> [f32; 4] {
    let cx = prior[0] + loc[0] * VARIANCES[0] * prior[2];
    let cy = prior[1] + loc[1] * VARIANCES[0] * prior[3];
    let w = prior[2] * (loc[2] * VARIANCES[1]).exp();
    let h = prior[3] * (loc[3] * VARIANCES[1]).exp();
    center_to_corner(&[cx, cy, w, h])
}
