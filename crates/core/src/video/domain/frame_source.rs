use std::path::{Path, PathBuf};

use crate::shared::frame::{LeasedFrame, Rotation};

/// Properties of an opened frame source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInfo {
    /// Dimensions of the frames handed out, before rotation is applied.
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 0 when the container does not report a frame count.
    pub total_frames: usize,
    pub rotation: Rotation,
    pub source_path: Option<PathBuf>,
}

/// A camera-like producer of frames.
///
/// Every frame is leased: the source may not reuse its buffer until the
/// lease is dropped or released, so consumers that discard a frame simply
/// drop it.
pub trait FrameSource: Send {
    fn open(&mut self, path: &Path) -> Result<SourceInfo, Box<dyn std::error::Error>>;

    /// Returns an iterator over frames in capture order.
    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<LeasedFrame, Box<dyn std::error::Error>>> + '_>;

    /// Number of frames handed out whose lease has not been returned yet.
    fn outstanding_leases(&self) -> usize;

    fn close(&mut self);
}
