use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::pipeline::face_result::{FaceCrop, FaceResultConsumer};
use crate::video::domain::image_writer::ImageWriter;

/// Saves every delivered crop as `face_<frame>_<n>.png` under `output_dir`.
///
/// A failed write is logged and skipped; it never stalls the pipeline.
pub struct SavingResultConsumer {
    output_dir: PathBuf,
    writer: Box<dyn ImageWriter>,
    saved: Arc<AtomicUsize>,
}

impl SavingResultConsumer {
    pub fn new(output_dir: impl Into<PathBuf>, writer: Box<dyn ImageWriter>) -> Self {
        Self {
            output_dir: output_dir.into(),
            writer,
            saved: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Running count of saved crops, readable after the consumer has moved
    /// into the analyser.
    pub fn saved_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.saved)
    }
}

impl FaceResultConsumer for SavingResultConsumer {
    fn on_result(&mut self, crops: Vec<FaceCrop>) {
        for (n, crop) in crops.iter().enumerate() {
            let path = self
                .output_dir
                .join(format!("face_{:06}_{n}.png", crop.image.index()));
            match self.writer.write(&path, &crop.image) {
                Ok(()) => {
                    self.saved.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Saved {}", path.display());
                }
                Err(e) => log::warn!("Failed to save {}: {e}", path.display()),
            }
        }
    }
}
