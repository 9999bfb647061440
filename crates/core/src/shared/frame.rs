use ndarray::ArrayView3;
use thiserror::Error;

use crate::shared::region::Region;

/// Clockwise rotation needed to bring a frame upright.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Accepts any multiple of 90, including negative values.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CropError {
    #[error("region origin ({x}, {y}) lies outside the {width}x{height} frame")]
    OutOfBounds {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
    #[error("region {width}x{height} is empty after clamping")]
    Empty { width: i32, height: i32 },
}

/// A single camera/gallery frame: contiguous RGB bytes in row-major order.
///
/// `rotation` is the clockwise rotation the source reported; pixel data is
/// stored as captured until [`Frame::rotate_upright`] is applied.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    index: usize,
    rotation: Rotation,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, index: usize) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            index,
            rotation: Rotation::Deg0,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.shape(), &self.data)
            .expect("Frame data length must match dimensions")
    }

    /// Applies the pending rotation in place; the frame is `Deg0` afterwards.
    pub fn rotate_upright(&mut self) {
        if self.rotation == Rotation::Deg0 {
            return;
        }

        let w = self.width as usize;
        let h = self.height as usize;
        let c = self.channels as usize;
        let (dst_w, dst_h) = match self.rotation {
            Rotation::Deg90 | Rotation::Deg270 => (h, w),
            _ => (w, h),
        };

        let mut rotated = vec![0u8; self.data.len()];
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = match self.rotation {
                    Rotation::Deg90 => (h - 1 - y, x),
                    Rotation::Deg180 => (w - 1 - x, h - 1 - y),
                    Rotation::Deg270 => (y, w - 1 - x),
                    Rotation::Deg0 => (x, y),
                };
                let src = (y * w + x) * c;
                let dst = (dy * dst_w + dx) * c;
                rotated[dst..dst + c].copy_from_slice(&self.data[src..src + c]);
            }
        }

        self.data = rotated;
        self.width = dst_w as u32;
        self.height = dst_h as u32;
        self.rotation = Rotation::Deg0;
    }

    /// Extracts the pixels under `region`.
    ///
    /// The right and bottom edges are clamped to the frame; an origin outside
    /// the frame is an error, as is a region with no remaining area.
    pub fn crop(&self, region: &Region) -> Result<Frame, CropError> {
        let fw = self.width as i32;
        let fh = self.height as i32;

        if region.x < 0 || region.y < 0 || region.x >= fw || region.y >= fh {
            return Err(CropError::OutOfBounds {
                x: region.x,
                y: region.y,
                width: self.width,
                height: self.height,
            });
        }

        let crop_w = region.width.min(fw - region.x);
        let crop_h = region.height.min(fh - region.y);
        if crop_w <= 0 || crop_h <= 0 {
            return Err(CropError::Empty {
                width: crop_w,
                height: crop_h,
            });
        }

        let x1 = region.x as usize;
        let y1 = region.y as usize;
        let cw = crop_w as usize;
        let ch = crop_h as usize;
        let c = self.channels as usize;
        let stride = self.width as usize * c;

        let mut data = Vec::with_capacity(cw * ch * c);
        for row in y1..y1 + ch {
            let start = row * stride + x1 * c;
            data.extend_from_slice(&self.data[start..start + cw * c]);
        }

        Ok(Frame::new(data, cw as u32, ch as u32, self.channels, self.index))
    }

    fn shape(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        )
    }
}

/// Callback a frame source runs once it may reuse the buffer behind a frame.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

struct ReleaseHook(Option<ReleaseFn>);

impl Drop for ReleaseHook {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// A frame still owned by its source.
///
/// The release hook runs exactly once: when the lease is dropped (a rejected
/// frame) or when [`LeasedFrame::release`] hands the pixels over.
pub struct LeasedFrame {
    frame: Frame,
    hook: ReleaseHook,
}

impl LeasedFrame {
    pub fn new(frame: Frame, release: ReleaseFn) -> Self {
        Self {
            frame,
            hook: ReleaseHook(Some(release)),
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    /// Returns the buffer to the source and keeps the pixels.
    pub fn release(self) -> Frame {
        let LeasedFrame { frame, hook } = self;
        drop(hook);
        frame
    }
}

impl From<Frame> for LeasedFrame {
    fn from(frame: Frame) -> Self {
        Self {
            frame,
            hook: ReleaseHook(None),
        }
    }
}
