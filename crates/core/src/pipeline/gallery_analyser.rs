use std::path::Path;

use crate::pipeline::admission::Admission;
use crate::pipeline::analyser_error::AnalyserError;
use crate::pipeline::frame_analyser::FrameAnalyser;
use crate::shared::frame::LeasedFrame;
use crate::video::domain::image_reader::ImageReader;

/// Runs single still images through a [`FrameAnalyser`].
///
/// Shares the analyser's admission gate, so an image offered while a frame
/// or another image is in flight is rejected before it is decoded.
pub struct GalleryAnalyser<'a> {
    analyser: &'a FrameAnalyser,
    reader: Box<dyn ImageReader>,
}

impl<'a> GalleryAnalyser<'a> {
    pub fn new(analyser: &'a FrameAnalyser, reader: Box<dyn ImageReader>) -> Self {
        Self { analyser, reader }
    }

    pub fn process_image(&self, path: &Path) -> Result<Admission, AnalyserError> {
        let Some(permit) = self.analyser.try_admit() else {
            log::debug!("Image {} dropped: analyser busy", path.display());
            return Ok(Admission::Rejected);
        };

        let frame = self
            .reader
            .read(path)
            .map_err(|e| AnalyserError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        log::debug!(
            "Decoded {} ({}x{})",
            path.display(),
            frame.width(),
            frame.height()
        );

        Ok(self.analyser.dispatch(LeasedFrame::from(frame), permit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::domain::face_detector::FaceDetector;
    use crate::pipeline::face_result::{FaceCrop, FaceResultConsumer};
    use crate::pipeline::frame_analyser::AnalyserComponents;
    use crate::pipeline::main_context::MainLoop;
    use crate::recognition::domain::embedding::Embedding;
    use crate::recognition::domain::face_embedder::FaceEmbedder;
    use crate::shared::config::AnalyserConfig;
    use crate::shared::frame::Frame;
    use crate::shared::region::Region;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct OneFaceDetector {
        hold: Arc<AtomicBool>,
    }

    impl FaceDetector for OneFaceDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Region>, Box<dyn std::error::Error>> {
            while self.hold.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(vec![Region::new(1, 1, 4, 4)])
        }
    }

    struct ConstantEmbedder;

    impl FaceEmbedder for ConstantEmbedder {
        fn embedding_dim(&self) -> usize {
            2
        }

        fn embed(&self, _crop: &Frame) -> Result<Embedding, Box<dyn std::error::Error>> {
            Ok(Embedding::new(vec![1.0, 0.0]))
        }
    }

    /// Serves an 8x6 image, or fails for paths ending in `.bad`.
    struct StubReader {
        reads: Arc<AtomicUsize>,
    }

    impl ImageReader for StubReader {
        fn read(&self, path: &Path) -> Result<Frame, Box<dyn std::error::Error>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if path.extension().is_some_and(|e| e == "bad") {
                return Err("not an image".into());
            }
            Ok(Frame::new(vec![0u8; 8 * 6 * 3], 8, 6, 3, 0))
        }
    }

    struct Fixture {
        main_loop: MainLoop,
        analyser: FrameAnalyser,
        hold: Arc<AtomicBool>,
        reads: Arc<AtomicUsize>,
        delivered: Arc<Mutex<Vec<Vec<FaceCrop>>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let main_loop = MainLoop::new();
            let hold = Arc::new(AtomicBool::new(false));
            let delivered = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&delivered);
            let consumer: Box<dyn FaceResultConsumer> =
                Box::new(move |crops: Vec<FaceCrop>| sink.lock().unwrap().push(crops));
            let analyser = FrameAnalyser::new(
                AnalyserComponents::new(
                    Box::new(OneFaceDetector {
                        hold: Arc::clone(&hold),
                    }),
                    Arc::new(ConstantEmbedder),
                    consumer,
                ),
                &AnalyserConfig::default(),
                main_loop.context(),
            )
            .unwrap();
            Self {
                main_loop,
                analyser,
                hold,
                reads: Arc::new(AtomicUsize::new(0)),
                delivered,
            }
        }

        fn gallery(&self) -> GalleryAnalyser<'_> {
            GalleryAnalyser::new(
                &self.analyser,
                Box::new(StubReader {
                    reads: Arc::clone(&self.reads),
                }),
            )
        }

        fn wait_idle(&self) {
            assert!(self
                .main_loop
                .run_until(|| !self.analyser.is_busy(), WAIT));
        }
    }

    #[test]
    fn test_image_is_analysed_and_delivered() {
        let fx = Fixture::new();

        let admission = fx.gallery().process_image(&PathBuf::from("a.png")).unwrap();
        fx.wait_idle();

        assert_eq!(admission, Admission::Admitted);
        let delivered = fx.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len(), 1);
        assert_eq!(delivered[0][0].image.width(), 4);
        let overlay = fx.analyser.overlay();
        assert_eq!(overlay.lock().unwrap().frame_size(), Some((8, 6)));
    }

    #[test]
    fn test_busy_image_rejected_without_decoding() {
        let fx = Fixture::new();
        fx.hold.store(true, Ordering::SeqCst);
        let gallery = fx.gallery();

        assert_eq!(
            gallery.process_image(Path::new("first.png")).unwrap(),
            Admission::Admitted
        );
        assert_eq!(
            gallery.process_image(Path::new("second.png")).unwrap(),
            Admission::Rejected
        );
        assert_eq!(fx.reads.load(Ordering::SeqCst), 1);

        fx.hold.store(false, Ordering::SeqCst);
        fx.wait_idle();
        assert_eq!(fx.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_decode_failure_releases_busy() {
        let fx = Fixture::new();
        let gallery = fx.gallery();

        let err = gallery.process_image(Path::new("broken.bad")).unwrap_err();

        assert!(matches!(err, AnalyserError::Decode { .. }));
        assert!(err.to_string().contains("broken.bad"));
        assert!(!fx.analyser.is_busy());
        assert!(fx.delivered.lock().unwrap().is_empty());
        assert_eq!(
            gallery.process_image(Path::new("ok.png")).unwrap(),
            Admission::Admitted
        );
        fx.wait_idle();
    }

    #[test]
    fn test_stream_frame_blocks_gallery_image() {
        let fx = Fixture::new();
        fx.hold.store(true, Ordering::SeqCst);

        let frame = Frame::new(vec![0u8; 8 * 6 * 3], 8, 6, 3, 0);
        assert_eq!(fx.analyser.submit(frame.into()), Admission::Admitted);
        assert_eq!(
            fx.gallery().process_image(Path::new("a.png")).unwrap(),
            Admission::Rejected
        );

        fx.hold.store(false, Ordering::SeqCst);
        fx.wait_idle();
        assert_eq!(fx.reads.load(Ordering::SeqCst), 0);
    }
}
