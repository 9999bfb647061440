/// An axis-aligned face bounding box in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Reflects the region across the vertical center line of a frame.
    ///
    /// Front-facing previews are displayed mirrored, so boxes drawn over them
    /// must be mirrored too.
    pub fn mirrored(&self, frame_width: i32) -> Region {
        Region {
            x: frame_width - (self.x + self.width),
            ..self.clone()
        }
    }
}
