use std::path::Path;

use crate::shared::frame::Frame;
use crate::video::domain::image_reader::ImageReader;

/// Decodes gallery images with the `image` crate.
///
/// Any supported format is converted to 8-bit RGB; alpha is discarded.
pub struct ImageFileReader;

impl ImageFileReader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ImageFileReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageReader for ImageFileReader {
    fn read(&self, path: &Path) -> Result<Frame, Box<dyn std::error::Error>> {
        let rgb = image::open(path)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(format!("{} has no pixels", path.display()).into());
        }
        Ok(Frame::new(rgb.into_raw(), width, height, 3, 0))
    }
}
