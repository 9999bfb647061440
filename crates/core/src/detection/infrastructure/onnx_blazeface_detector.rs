/// BlazeFace face detector using ONNX Runtime via `ort`.
///
/// The short-range model is tuned for selfie-distance faces, which matches
/// front-camera frames. Produces untracked regions in descending score order.
use std::path::Path;

use crate::detection::domain::face_detector::FaceDetector;
use crate::shared::frame::Frame;
use crate::shared::onnx_session::open_session;
use crate::shared::region::Region;

/// BlazeFace model input resolution.
const INPUT_SIZE: u32 = 128;

/// NMS IoU threshold.
const NMS_IOU_THRESH: f64 = 0.3;

/// Number of BlazeFace anchors (short-range model).
const NUM_ANCHORS: usize = 896;

/// Values per anchor in the regressor output: box (4) + 6 keypoints (12).
const REGRESSOR_STRIDE: usize = 16;

pub struct OnnxBlazefaceDetector {
    session: ort::session::Session,
    confidence: f64,
    anchors: Vec<[f32; 2]>,
}

impl OnnxBlazefaceDetector {
    pub fn new(model_path: &Path, confidence: f64) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            session: open_session(model_path)?,
            confidence,
            anchors: generate_anchors(),
        })
    }
}

impl FaceDetector for OnnxBlazefaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Region>, Box<dyn std::error::Error>> {
        let input_value = ort::value::Tensor::from_array(preprocess(frame, INPUT_SIZE))?;
        let outputs = self.session.run(ort::inputs![input_value])?;

        // regressors: [1, 896, 16], classificators: [1, 896, 1]
        if outputs.len() < 2 {
            return Err(
                format!("BlazeFace model expected 2 outputs, got {}", outputs.len()).into(),
            );
        }
        let regressors = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        let reg_data = regressors.as_slice().ok_or("Cannot get regressor slice")?;
        let score_data = scores.as_slice().ok_or("Cannot get score slice")?;

        let mut candidates = decode(
            reg_data,
            score_data,
            &self.anchors,
            frame.width(),
            frame.height(),
            self.confidence,
        );
        let kept = nms(&mut candidates, NMS_IOU_THRESH);

        Ok(kept.iter().map(|c| c.to_region()).collect())
    }
}

/// Resize frame to `size × size` and normalize to [0,1] NCHW float32.
fn preprocess(frame: &Frame, size: u32) -> ndarray::Array4<f32> {
    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;
    let s = size as usize;

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, s, s));

    for y in 0..s {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / s as f64) as usize).min(src_h - 1);
        for x in 0..s {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / s as f64) as usize).min(src_w - 1);
            for c in 0..3 {
                tensor[[0, c, y, x]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    tensor
}

/// Anchor centers for the short-range model: a 16×16 grid with 2 anchors
/// per cell followed by an 8×8 grid with 6.
fn generate_anchors() -> Vec<[f32; 2]> {
    let strides = [(8, 2), (16, 6)]; // (stride, anchors_per_cell)
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, num) in &strides {
        let grid_size = INPUT_SIZE as usize / stride;
        for y in 0..grid_size {
            for x in 0..grid_size {
                let cx = (x as f32 + 0.5) / grid_size as f32;
                let cy = (y as f32 + 0.5) / grid_size as f32;
                for _ in 0..num {
                    anchors.push([cx, cy]);
                }
            }
        }
    }

    anchors
}

#[derive(Clone, Debug)]
struct Candidate {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    score: f64,
}

impl Candidate {
    fn iou(&self, other: &Candidate) -> f64 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let area_a = (self.x2 - self.x1) * (self.y2 - self.y1);
        let area_b = (other.x2 - other.x1) * (other.y2 - other.y1);
        inter / (area_a + area_b - inter)
    }

    fn to_region(&self) -> Region {
        let x = self.x1.round() as i32;
        let y = self.y1.round() as i32;
        Region::new(
            x,
            y,
            (self.x2.round() as i32 - x).max(0),
            (self.y2.round() as i32 - y).max(0),
        )
    }
}

/// Decodes anchor-relative boxes above `confidence` into frame pixels,
/// clamped to the frame.
fn decode(
    reg_data: &[f32],
    score_data: &[f32],
    anchors: &[[f32; 2]],
    frame_w: u32,
    frame_h: u32,
    confidence: f64,
) -> Vec<Candidate> {
    let fw = frame_w as f32;
    let fh = frame_h as f32;
    let size = INPUT_SIZE as f32;
    let mut candidates = Vec::new();

    for (i, (&raw_score, anchor)) in score_data.iter().zip(anchors).enumerate() {
        let score = sigmoid(raw_score);
        if (score as f64) < confidence {
            continue;
        }
        let offset = i * REGRESSOR_STRIDE;
        if offset + 4 > reg_data.len() {
            break;
        }

        let cx = anchor[0] + reg_data[offset] / size;
        let cy = anchor[1] + reg_data[offset + 1] / size;
        let w = reg_data[offset + 2] / size;
        let h = reg_data[offset + 3] / size;

        candidates.push(Candidate {
            x1: ((cx - w / 2.0) * fw).max(0.0) as f64,
            y1: ((cy - h / 2.0) * fh).max(0.0) as f64,
            x2: ((cx + w / 2.0) * fw).min(fw) as f64,
            y2: ((cy + h / 2.0) * fh).min(fh) as f64,
            score: score as f64,
        });
    }

    candidates
}

/// Greedy NMS; survivors come out highest score first.
fn nms(candidates: &mut [Candidate], iou_thresh: f64) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates.iter() {
        if keep.iter().all(|k| k.iou(candidate) <= iou_thresh) {
            keep.push(candidate.clone());
        }
    }
    keep
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn candidate(x1: f64, y1: f64, x2: f64, y2: f64, score: f64) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }

    #[test]
    fn test_preprocess_shape() {
        let frame = Frame::new(vec![128u8; 200 * 100 * 3], 200, 100, 3, 0);
        let tensor = preprocess(&frame, 128);
        assert_eq!(tensor.shape(), &[1, 3, 128, 128]);
    }

    #[test]
    fn test_preprocess_normalized() {
        let frame = Frame::new(vec![255u8; 50 * 50 * 3], 50, 50, 3, 0);
        let tensor = preprocess(&frame, 128);
        assert_relative_eq!(tensor[[0, 0, 0, 0]], 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_generate_anchors_count_and_range() {
        let anchors = generate_anchors();
        // 16×16 grid × 2 anchors + 8×8 grid × 6 anchors = 512 + 384 = 896
        assert_eq!(anchors.len(), NUM_ANCHORS);
        for a in &anchors {
            assert!(a[0] > 0.0 && a[0] < 1.0);
            assert!(a[1] > 0.0 && a[1] < 1.0);
        }
    }

    #[test]
    fn test_sigmoid() {
        assert_relative_eq!(sigmoid(0.0), 0.5, epsilon = 1e-6);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn test_decode_filters_by_confidence() {
        let anchors = [[0.5, 0.5], [0.25, 0.25]];
        let reg = vec![0.0f32; 2 * REGRESSOR_STRIDE];
        let scores = [10.0, -10.0];
        let decoded = decode(&reg, &scores, &anchors, 100, 100, 0.5);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_decode_maps_anchor_box_to_frame_pixels() {
        // Box centered on the anchor, 64/128 = half the input in each dimension.
        let anchors = [[0.5, 0.5]];
        let mut reg = vec![0.0f32; REGRESSOR_STRIDE];
        reg[2] = 64.0;
        reg[3] = 64.0;
        let decoded = decode(&reg, &[10.0], &anchors, 200, 100, 0.5);

        assert_eq!(decoded.len(), 1);
        let c = &decoded[0];
        assert_relative_eq!(c.x1, 50.0, epsilon = 1e-3);
        assert_relative_eq!(c.y1, 25.0, epsilon = 1e-3);
        assert_relative_eq!(c.x2, 150.0, epsilon = 1e-3);
        assert_relative_eq!(c.y2, 75.0, epsilon = 1e-3);
    }

    #[test]
    fn test_decode_clamps_to_frame() {
        let anchors = [[0.05, 0.05]];
        let mut reg = vec![0.0f32; REGRESSOR_STRIDE];
        reg[2] = 64.0;
        reg[3] = 64.0;
        let decoded = decode(&reg, &[10.0], &anchors, 100, 100, 0.5);
        assert_relative_eq!(decoded[0].x1, 0.0);
        assert_relative_eq!(decoded[0].y1, 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let mut dets = vec![
            candidate(5.0, 5.0, 105.0, 105.0, 0.7),
            candidate(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let kept = nms(&mut dets, 0.3);
        assert_eq!(kept.len(), 1);
        assert_relative_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn test_nms_keeps_separate_in_score_order() {
        let mut dets = vec![
            candidate(200.0, 200.0, 250.0, 250.0, 0.8),
            candidate(0.0, 0.0, 50.0, 50.0, 0.9),
        ];
        let kept = nms(&mut dets, 0.3);
        assert_eq!(kept.len(), 2);
        assert_relative_eq!(kept[0].score, 0.9);
        assert_relative_eq!(kept[1].score, 0.8);
    }

    #[test]
    fn test_candidate_to_region_rounds_corners() {
        let r = candidate(10.4, 20.6, 60.4, 70.6, 0.9).to_region();
        assert_eq!(r, Region::new(10, 21, 50, 50));
    }
}
