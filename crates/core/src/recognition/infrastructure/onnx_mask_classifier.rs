/// Two-class mask classifier (MobileNetV2 head) using ONNX Runtime.
///
/// Output index 0 is "mask", index 1 is "no mask".
use std::path::Path;
use std::sync::Mutex;

use crate::recognition::domain::mask_classifier::{MaskClassifier, MaskLabel};
use crate::recognition::infrastructure::preprocess::to_nchw;
use crate::shared::frame::Frame;
use crate::shared::onnx_session::open_session;

pub const MASK_INPUT_SIZE: usize = 224;

pub struct OnnxMaskClassifier {
    session: Mutex<ort::session::Session>,
}

impl OnnxMaskClassifier {
    pub fn new(model_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            session: Mutex::new(open_session(model_path)?),
        })
    }
}

impl MaskClassifier for OnnxMaskClassifier {
    fn classify(&self, crop: &Frame) -> Result<MaskLabel, Box<dyn std::error::Error>> {
        let tensor = to_nchw(crop, MASK_INPUT_SIZE, |v| v / 255.0)?;
        let input_value = ort::value::Tensor::from_array(tensor)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("Lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let logits = outputs[0].try_extract_array::<f32>()?;
        let logits = logits.as_slice().ok_or("Cannot get classifier slice")?;

        label_from_logits(logits)
    }
}

fn label_from_logits(logits: &[f32]) -> Result<MaskLabel, Box<dyn std::error::Error>> {
    if logits.len() != 2 {
        return Err(format!("Mask model expected 2 outputs, got {}", logits.len()).into());
    }
    let probs = softmax(logits);
    Ok(if probs[0] >= probs[1] {
        MaskLabel::Mask
    } else {
        MaskLabel::NoMask
    })
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}
