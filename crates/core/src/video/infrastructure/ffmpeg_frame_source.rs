use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::shared::config::Resolution;
use crate::shared::frame::{Frame, LeasedFrame, Rotation};
use crate::video::domain::frame_source::{FrameSource, SourceInfo};

/// Plays a video file back as if it were a live camera.
///
/// Frames are scaled down to fit the target resolution, tagged with the
/// stream's rotation, and (when paced) handed out no faster than the video's
/// frame rate, so a slow consumer sees frames go by the way it would with a
/// real sensor.
pub struct FfmpegFrameSource {
    target: Option<Resolution>,
    paced: bool,
    decoding: Option<Decoding>,
    outstanding: Arc<AtomicUsize>,
}

struct Decoding {
    ictx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    stream_index: usize,
    width: u32,
    height: u32,
    fps: f64,
    rotation: Rotation,
}

// Safety: FfmpegFrameSource is only used from a single thread at a time.
// The raw pointers inside ffmpeg types are not shared across threads.
unsafe impl Send for FfmpegFrameSource {}

impl FfmpegFrameSource {
    pub fn new(target: Option<Resolution>) -> Self {
        Self {
            target,
            paced: true,
            decoding: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Disables frame-rate pacing; frames are decoded as fast as possible.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl FrameSource for FfmpegFrameSource {
    fn open(&mut self, path: &Path) -> Result<SourceInfo, Box<dyn std::error::Error>> {
        ffmpeg_next::init()?;

        let ictx = ffmpeg_next::format::input(path)?;
        let stream = ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or("No video stream found")?;

        let stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = codec_ctx.decoder().video()?;

        let rate = stream.rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };
        let rotation = extract_rotation(&stream);
        let total_frames = stream.frames().max(0) as usize;

        let (width, height) = match self.target {
            Some(target) => target.fit(decoder.width(), decoder.height()),
            None => (decoder.width(), decoder.height()),
        };
        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )?;

        log::info!(
            "Opened {}: {}x{} -> {width}x{height} @ {fps:.1} fps, rotation {}",
            path.display(),
            decoder.width(),
            decoder.height(),
            rotation.degrees()
        );

        self.decoding = Some(Decoding {
            ictx,
            decoder,
            scaler,
            stream_index,
            width,
            height,
            fps,
            rotation,
        });

        Ok(SourceInfo {
            width,
            height,
            fps,
            total_frames,
            rotation,
            source_path: Some(path.to_path_buf()),
        })
    }

    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<LeasedFrame, Box<dyn std::error::Error>>> + '_> {
        let Some(decoding) = self.decoding.as_mut() else {
            return Box::new(std::iter::once(Err("FfmpegFrameSource: not opened".into())));
        };

        let interval = (self.paced && decoding.fps > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / decoding.fps));

        Box::new(FfmpegFrameIter {
            decoding,
            outstanding: Arc::clone(&self.outstanding),
            interval,
            started: None,
            frame_index: 0,
            flushing: false,
            done: false,
        })
    }

    fn outstanding_leases(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        self.decoding = None;
    }
}

/// Lazy iterator that decodes one frame per call.
struct FfmpegFrameIter<'a> {
    decoding: &'a mut Decoding,
    outstanding: Arc<AtomicUsize>,
    interval: Option<Duration>,
    started: Option<Instant>,
    frame_index: usize,
    flushing: bool,
    done: bool,
}

impl FfmpegFrameIter<'_> {
    fn try_receive(&mut self) -> Option<Result<LeasedFrame, Box<dyn std::error::Error>>> {
        let d = &mut *self.decoding;
        let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
        if d.decoder.receive_frame(&mut decoded).is_err() {
            return None;
        }

        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
        if let Err(e) = d.scaler.run(&decoded, &mut rgb_frame) {
            return Some(Err(Box::new(e)));
        }

        let pixels = extract_rgb_pixels(&rgb_frame, d.width, d.height);
        let frame = Frame::new(pixels, d.width, d.height, 3, self.frame_index)
            .with_rotation(d.rotation);
        self.pace();
        self.frame_index += 1;
        Some(Ok(self.lease(frame)))
    }

    /// Sleeps until the presentation time of the current frame.
    fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + interval.mul_f64(self.frame_index as f64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }

    fn lease(&self, frame: Frame) -> LeasedFrame {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let outstanding = Arc::clone(&self.outstanding);
        LeasedFrame::new(
            frame,
            Box::new(move || {
                outstanding.fetch_sub(1, Ordering::AcqRel);
            }),
        )
    }
}

impl Iterator for FfmpegFrameIter<'_> {
    type Item = Result<LeasedFrame, Box<dyn std::error::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(result) = self.try_receive() {
            return Some(result);
        }

        if self.flushing {
            self.done = true;
            return None;
        }

        loop {
            let Some((stream, packet)) = self.decoding.ictx.packets().next() else {
                let _ = self.decoding.decoder.send_eof();
                self.flushing = true;
                if let Some(result) = self.try_receive() {
                    return Some(result);
                }
                self.done = true;
                return None;
            };

            if stream.index() != self.decoding.stream_index {
                continue;
            }

            if self.decoding.decoder.send_packet(&packet).is_err() {
                continue;
            }

            if let Some(result) = self.try_receive() {
                return Some(result);
            }
        }
    }
}

/// Reads the stream's rotation from DisplayMatrix side data, falling back to
/// the `rotate` metadata tag.
fn extract_rotation(stream: &ffmpeg_next::format::stream::Stream) -> Rotation {
    for side_data in stream.side_data() {
        if side_data.kind() == ffmpeg_next::codec::packet::side_data::Type::DisplayMatrix {
            if let Some(angle) = parse_display_matrix(side_data.data()) {
                return snap_rotation(angle);
            }
        }
    }

    if let Some(rotate_str) = stream.metadata().get("rotate") {
        if let Ok(angle) = rotate_str.parse::<i32>() {
            return snap_rotation(angle);
        }
    }

    Rotation::Deg0
}

/// Rotation angle in degrees from a 3x3 display matrix (9 x i32 LE, 16.16
/// fixed point). Negated: the matrix describes the display transform.
fn parse_display_matrix(data: &[u8]) -> Option<i32> {
    if data.len() < 36 {
        return None;
    }

    let m00 = i32::from_le_bytes(data[0..4].try_into().ok()?) as f64 / 65536.0;
    let m10 = i32::from_le_bytes(data[4..8].try_into().ok()?) as f64 / 65536.0;

    let angle_deg = -m10.atan2(m00).to_degrees().round() as i32;
    Some(angle_deg)
}

/// Snaps an arbitrary angle to the nearest quarter turn.
fn snap_rotation(angle: i32) -> Rotation {
    let quarter = ((angle.rem_euclid(360) + 45) / 90) % 4;
    Rotation::from_degrees(quarter * 90).unwrap_or_default()
}

/// Copies an RGB24 ffmpeg frame into a tightly packed buffer, dropping the
/// per-row stride padding.
fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let w = width as usize;
    let h = height as usize;

    let mut pixels = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + w * 3]);
    }
    pixels
}
