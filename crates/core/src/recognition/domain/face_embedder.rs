use crate::recognition::domain::embedding::Embedding;
use crate::shared::frame::Frame;

/// Maps a face crop to an identity embedding.
///
/// Must be deterministic for identical crops. Shared across region workers,
/// so implementations take `&self` and must be `Sync`.
pub trait FaceEmbedder: Send + Sync {
    fn embedding_dim(&self) -> usize;

    fn embed(&self, crop: &Frame) -> Result<Embedding, Box<dyn std::error::Error>>;
}
