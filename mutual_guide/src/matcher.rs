use burn::config::Config;
use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::boxes::iou;

#[derive(Config, Debug)]
pub struct SeqMatcherConfig {
    /// Minimum overlap between a detection and a track of the same label.
    #[config(default = 0.5)]
    pub iou_thresh: f32,
    /// Frames a track may go unmatched before it is dropped.
    #[config(default = 3)]
    pub max_staleness: usize,
    /// Weight of the track state when blending with a matched detection.
    #[config(default = 0.5)]
    pub momentum: f32,
    /// Rows whose best class score is not above this are not detections.
    #[config(default = 0.05)]
    pub score_thresh: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: usize,
    pub label: usize,
    pub bbox: [f32; 4],
    pub scores: Vec<f32>,
    pub staleness: usize,
    pub last_seen: usize,
}

/// Temporal smoothing of per-frame detections over a sequence of images.
///
/// Rows whose best score does not clear `score_thresh` (candidates suppressed
/// for every class) pass through untouched and never touch a track. Every
/// other detection is labelled with its best class and greedily matched, in
/// row order, to an unclaimed track of the same label. A match blends the
/// track into the output row and refreshes the track. Unmatched detections
/// open new tracks, and tracks left unclaimed for more than `max_staleness`
/// frames are forgotten.
#[derive(Debug)]
pub struct SeqBoxMatcher {
    config: SeqMatcherConfig,
    tracks: Vec<Track>,
    frame: usize,
    next_id: usize,
}

fn argmax(row: ArrayView1<f32>) -> (usize, f32) {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
}

impl SeqBoxMatcher {
    pub fn new(config: SeqMatcherConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            frame: 0,
            next_id: 0,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Smooths one frame. `boxes` is `[N, 4]`, `scores` is `[N, C]`; the
    /// returned arrays have the same shapes and row order.
    pub fn update(&mut self, boxes: ArrayView2<f32>, scores: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        self.frame += 1;
        let momentum = self.config.momentum;
        let mut out_boxes = boxes.to_owned();
        let mut out_scores = scores.to_owned();
        let mut claimed = vec![false; self.tracks.len()];
        let mut opened = Vec::new();

        for (row, (bbox, score)) in boxes.outer_iter().zip(scores.outer_iter()).enumerate() {
            let bbox = [bbox[0], bbox[1], bbox[2], bbox[3]];
            let (label, best_score) = argmax(score);
            if best_score <= self.config.score_thresh {
                continue;
            }

            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(k, track)| !claimed[*k] && track.label == label)
                .map(|(k, track)| (k, iou(&track.bbox, &bbox), track.last_seen))
                .filter(|(_, overlap, _)| *overlap > self.config.iou_thresh)
                .max_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));

            match best {
                Some((k, _, _)) => {
                    claimed[k] = true;
                    let track = &mut self.tracks[k];
                    for (t, live) in track.bbox.iter_mut().zip(bbox.iter()) {
                        *t = momentum * *t + (1.0 - momentum) * live;
                    }
                    for (t, live) in track.scores.iter_mut().zip(score.iter()) {
                        *t = momentum * *t + (1.0 - momentum) * live;
                    }
                    track.staleness = 0;
                    track.last_seen = self.frame;

                    for (c, v) in track.bbox.iter().enumerate() {
                        out_boxes[[row, c]] = *v;
                    }
                    for (c, v) in track.scores.iter().enumerate() {
                        out_scores[[row, c]] = *v;
                    }
                }
                None => {
                    opened.push(Track {
                        id: self.next_id,
                        label,
                        bbox,
                        scores: score.to_vec(),
                        staleness: 0,
                        last_seen: self.frame,
                    });
                    self.next_id += 1;
                }
            }
        }

        for (track, claimed) in self.tracks.iter_mut().zip(claimed) {
            if !claimed {
                track.staleness += 1;
            }
        }
        let max_staleness = self.config.max_staleness;
        self.tracks.retain(|track| track.staleness <= max_staleness);
        self.tracks.extend(opened);

        (out_boxes, out_scores)
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::{Data, Shape, Tensor}};
    use ndarray::array;

    use super::*;
    use crate::{model::DetectorOutput, postprocess::post_process, prior::PriorBox};

    fn matcher() -> SeqBoxMatcher {
        SeqBoxMatcher::new(SeqMatcherConfig::new())
    }

    #[test]
    fn static_scene_is_stable() {
        let mut matcher = matcher();
        let boxes = array![[10.0, 10.0, 50.0, 50.0], [100.0, 100.0, 140.0, 160.0]];
        let scores = array![[0.9, 0.1], [0.2, 0.7]];

        for _ in 0..10 {
            let (out_boxes, out_scores) = matcher.update(boxes.view(), scores.view());
            assert_eq!(out_boxes, boxes);
            assert_eq!(out_scores, scores);
            assert_eq!(matcher.tracks().len(), 2);
        }
    }

    #[test]
    fn matched_rows_are_blended_with_the_track() {
        let mut matcher = matcher();
        matcher.update(array![[0.0, 0.0, 10.0, 10.0]].view(), array![[0.8]].view());
        let (boxes, scores) = matcher.update(array![[2.0, 0.0, 12.0, 10.0]].view(), array![[0.4]].view());

        assert_eq!(boxes, array![[1.0f32, 0.0, 11.0, 10.0]]);
        assert!((scores[[0, 0]] - 0.6).abs() < 1e-6);
        assert_eq!(matcher.tracks().len(), 1);
    }

    #[test]
    fn labels_do_not_match_across_classes() {
        let mut matcher = matcher();
        matcher.update(array![[0.0, 0.0, 10.0, 10.0]].view(), array![[0.9, 0.1]].view());
        let (_, scores) = matcher.update(array![[0.0, 0.0, 10.0, 10.0]].view(), array![[0.1, 0.9]].view());

        assert_eq!(scores, array![[0.1f32, 0.9]]);
        assert_eq!(matcher.tracks().len(), 2);
    }

    #[test]
    fn a_track_is_claimed_once_per_frame() {
        let mut matcher = matcher();
        matcher.update(array![[0.0, 0.0, 10.0, 10.0]].view(), array![[0.9]].view());
        let boxes = array![[0.0, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 10.0]];
        let (out, _) = matcher.update(boxes.view(), array![[0.5], [0.5]].view());

        assert_eq!(out, boxes);
        assert_eq!(matcher.tracks().len(), 2);
    }

    #[test]
    fn stale_tracks_are_dropped() {
        let mut matcher = matcher();
        let empty = Array2::<f32>::zeros((0, 4));
        let no_scores = Array2::<f32>::zeros((0, 1));
        matcher.update(array![[0.0, 0.0, 10.0, 10.0]].view(), array![[0.9]].view());

        for _ in 0..3 {
            matcher.update(empty.view(), no_scores.view());
        }
        assert_eq!(matcher.tracks().len(), 1);
        assert_eq!(matcher.tracks()[0].staleness, 3);

        matcher.update(empty.view(), no_scores.view());
        assert!(matcher.tracks().is_empty());
    }

    #[test]
    fn rows_below_the_score_threshold_are_passed_through() {
        let mut matcher = matcher();
        matcher.update(array![[0.0, 0.0, 10.0, 10.0]].view(), array![[0.0, 0.9]].view());

        // same place, but every class score already zeroed or negligible
        let boxes = array![[0.0, 0.0, 10.0, 10.0]];
        let scores = array![[0.0, 4.5e-5]];
        let (out_boxes, out_scores) = matcher.update(boxes.view(), scores.view());

        assert_eq!(out_boxes, boxes);
        assert_eq!(out_scores, scores);
        assert_eq!(matcher.tracks().len(), 1);
        assert_eq!(matcher.tracks()[0].staleness, 1);
    }

    #[test]
    fn suppressed_duplicates_do_not_open_tracks() {
        let device = Default::default();
        let priors = PriorBox::new(16.0, 32);
        let p = priors.len();

        // two widened neighbouring priors fire for class 0; the weaker one loses NMS
        let mut loc = vec![0f32; p * 4];
        for k in [2, 3, 6, 7] {
            loc[k] = 5.0;
        }
        let mut conf = vec![-10.0f32; p * 2];
        conf[0] = 3.0;
        conf[2] = 2.0;
        let frame = || DetectorOutput::<NdArray<f32>> {
            loc: Tensor::from_data(Data::new(loc.clone(), Shape::new([1, p, 4])).convert(), &device),
            conf: Tensor::from_data(Data::new(conf.clone(), Shape::new([1, p, 2])).convert(), &device),
        };

        let mut matcher = matcher();
        for _ in 0..5 {
            let (boxes, scores) = post_process(frame(), &priors, [64.0, 64.0, 64.0, 64.0], 0.05, 0.45);
            assert_eq!(scores.nrows(), 2);
            assert_eq!(scores[[1, 0]], 0.0);

            let (_, smoothed) = matcher.update(boxes.view(), scores.view());
            assert_eq!(matcher.tracks().len(), 1);
            assert_eq!(smoothed.row(1), scores.row(1));
        }
    }

    #[test]
    fn ties_prefer_the_most_recent_track() {
        let mut matcher = matcher();
        matcher.update(array![[0.0, 0.0, 10.0, 10.0], [2.0, 0.0, 12.0, 10.0]].view(), array![[0.9], [0.9]].view());
        assert_eq!(matcher.tracks().len(), 2);

        // refresh only the first track
        matcher.update(array![[0.0, 0.0, 10.0, 10.0]].view(), array![[0.9]].view());

        // equidistant from both tracks
        matcher.update(array![[1.0, 0.0, 11.0, 10.0]].view(), array![[0.9]].view());
        let refreshed: Vec<usize> = matcher.tracks().iter().filter(|t| t.staleness == 0).map(|t| t.id).collect();
        assert_eq!(refreshed, vec![0]);
    }
}
