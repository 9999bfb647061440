use std::fmt;

use crate::shared::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskLabel {
    Mask,
    NoMask,
}

impl fmt::Display for MaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskLabel::Mask => write!(f, "Mask"),
            MaskLabel::NoMask => write!(f, "No Mask"),
        }
    }
}

/// Decides whether the face in a crop wears a mask.
pub trait MaskClassifier: Send + Sync {
    fn classify(&self, crop: &Frame) -> Result<MaskLabel, Box<dyn std::error::Error>>;
}
