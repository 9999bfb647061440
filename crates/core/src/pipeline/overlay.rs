use crate::pipeline::face_result::Prediction;
use crate::shared::config::LensFacing;

/// A box ready to draw over the preview, in view coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub label: String,
}

/// UI-visible bounding-box state.
///
/// Only ever touched from the main context: the analysis worker posts
/// replacements, the view reads [`BoundingBoxOverlay::display_boxes`].
#[derive(Debug)]
pub struct BoundingBoxOverlay {
    lens_facing: LensFacing,
    draw_mask_labels: bool,
    frame_size: Option<(u32, u32)>,
    predictions: Vec<Prediction>,
    revision: u64,
}

impl BoundingBoxOverlay {
    pub fn new(lens_facing: LensFacing, draw_mask_labels: bool) -> Self {
        Self {
            lens_facing,
            draw_mask_labels,
            frame_size: None,
            predictions: Vec::new(),
            revision: 0,
        }
    }

    /// Swaps in the predictions of a newly analysed frame.
    pub fn replace(&mut self, frame_width: u32, frame_height: u32, predictions: Vec<Prediction>) {
        self.frame_size = Some((frame_width, frame_height));
        self.predictions = predictions;
        self.revision += 1;
    }

    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frame_size
    }

    /// Incremented on every change; lets a view skip redundant redraws.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Maps every prediction into a `view_width`x`view_height` view,
    /// mirroring horizontally for the front camera.
    pub fn display_boxes(&self, view_width: u32, view_height: u32) -> Vec<DisplayBox> {
        let Some((frame_w, frame_h)) = self.frame_size else {
            return Vec::new();
        };
        if frame_w == 0 || frame_h == 0 {
            return Vec::new();
        }
        let sx = view_width as f64 / frame_w as f64;
        let sy = view_height as f64 / frame_h as f64;

        self.predictions
            .iter()
            .map(|p| {
                let region = match self.lens_facing {
                    LensFacing::Front => p.region.mirrored(frame_w as i32),
                    LensFacing::Back => p.region.clone(),
                };
                DisplayBox {
                    x: region.x as f64 * sx,
                    y: region.y as f64 * sy,
                    width: region.width as f64 * sx,
                    height: region.height as f64 * sy,
                    label: self.label_for(p),
                }
            })
            .collect()
    }

    fn label_for(&self, prediction: &Prediction) -> String {
        let mask = prediction
            .mask
            .filter(|_| self.draw_mask_labels)
            .map(|m| m.to_string());
        match (prediction.identity.as_deref(), mask) {
            (Some(name), Some(mask)) => format!("{name} ({mask})"),
            (Some(name), None) => name.to_string(),
            (None, Some(mask)) => mask,
            (None, None) => String::new(),
        }
    }
}
