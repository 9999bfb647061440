/// FaceNet embedding model using ONNX Runtime.
///
/// Crops are resized to 160x160 and standardized per image (zero mean, unit
/// variance) before inference; the output vector is L2-normalized so cosine
/// similarity reduces to a dot product.
use std::path::Path;
use std::sync::Mutex;

use crate::recognition::domain::embedding::Embedding;
use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::recognition::infrastructure::preprocess::to_nchw;
use crate::shared::frame::Frame;
use crate::shared::onnx_session::open_session;

pub const FACENET_INPUT_SIZE: usize = 160;
pub const FACENET_EMBEDDING_DIM: usize = 512;

pub struct OnnxFaceEmbedder {
    session: Mutex<ort::session::Session>,
    embedding_dim: usize,
}

impl OnnxFaceEmbedder {
    pub fn new(model_path: &Path, embedding_dim: usize) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            session: Mutex::new(open_session(model_path)?),
            embedding_dim,
        })
    }
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn embed(&self, crop: &Frame) -> Result<Embedding, Box<dyn std::error::Error>> {
        let mut tensor = to_nchw(crop, FACENET_INPUT_SIZE, |v| v)?;
        standardize(tensor.as_slice_mut().ok_or("Input tensor is not contiguous")?);

        let input_value = ort::value::Tensor::from_array(tensor)?;
        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("Lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let embedding_array = outputs[0].try_extract_array::<f32>()?;
        let values = embedding_array
            .as_slice()
            .ok_or("Cannot get embedding slice")?;

        if values.len() != self.embedding_dim {
            return Err(format!(
                "Embedding model produced {} values, expected {}",
                values.len(),
                self.embedding_dim
            )
            .into());
        }
        Ok(Embedding::normalized(values.to_vec()))
    }
}

/// Per-image standardization; the std floor avoids blowing up flat crops.
fn standardize(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let std = variance.sqrt().max(1.0 / n.sqrt());
    for v in values.iter_mut() {
        *v = (*v - mean) / std;
    }
}
