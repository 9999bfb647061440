use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::face_result::{FaceCrop, Prediction};
use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::recognition::domain::identity_gallery::IdentityGallery;
use crate::recognition::domain::mask_classifier::MaskClassifier;
use crate::shared::frame::Frame;
use crate::shared::region::Region;

/// Per-region step that can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionStage {
    Crop,
    Embedding,
    MaskClassification,
}

impl fmt::Display for RegionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionStage::Crop => write!(f, "crop"),
            RegionStage::Embedding => write!(f, "embedding"),
            RegionStage::MaskClassification => write!(f, "mask classification"),
        }
    }
}

/// A region that was skipped; the rest of the frame is unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("region {index} failed at {stage}: {message}")]
pub struct RegionError {
    /// Position of the region in detector order.
    pub index: usize,
    pub stage: RegionStage,
    pub message: String,
}

impl RegionError {
    pub fn new(index: usize, stage: RegionStage, message: impl fmt::Display) -> Self {
        Self {
            index,
            stage,
            message: message.to_string(),
        }
    }
}

/// Outcome of processing every region of one frame.
///
/// `crops[i]` and `predictions[i]` describe the same face; both follow
/// detector order with failed regions left out.
#[derive(Debug, Default)]
pub struct ProcessedRegions {
    pub crops: Vec<FaceCrop>,
    pub predictions: Vec<Prediction>,
    pub failures: Vec<RegionError>,
}

type RegionOutcome = Result<(FaceCrop, Prediction), RegionError>;

/// Runs crop → embed → identify → classify for each detected region.
pub struct RegionProcessor {
    embedder: Arc<dyn FaceEmbedder>,
    mask_classifier: Option<Arc<dyn MaskClassifier>>,
    gallery: Option<IdentityGallery>,
    parallelism: usize,
}

impl RegionProcessor {
    /// Mask classification runs only when a classifier is given.
    pub fn new(
        embedder: Arc<dyn FaceEmbedder>,
        mask_classifier: Option<Arc<dyn MaskClassifier>>,
    ) -> Self {
        Self {
            embedder,
            mask_classifier,
            gallery: None,
            parallelism: 1,
        }
    }

    pub fn with_gallery(mut self, gallery: IdentityGallery) -> Self {
        self.gallery = Some(gallery);
        self
    }

    /// Number of regions processed concurrently (1 = sequential).
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn mask_detection_enabled(&self) -> bool {
        self.mask_classifier.is_some()
    }

    pub fn process(&self, frame: &Frame, regions: &[Region]) -> ProcessedRegions {
        let outcomes = if self.parallelism > 1 && regions.len() > 1 {
            self.process_parallel(frame, regions)
        } else {
            regions
                .iter()
                .enumerate()
                .map(|(index, region)| self.process_region(frame, index, region))
                .collect()
        };

        let mut processed = ProcessedRegions::default();
        for outcome in outcomes {
            match outcome {
                Ok((crop, prediction)) => {
                    processed.crops.push(crop);
                    processed.predictions.push(prediction);
                }
                Err(e) => processed.failures.push(e),
            }
        }
        processed
    }

    /// Splits regions into contiguous chunks, one scoped thread per chunk,
    /// and concatenates the chunk results in order.
    fn process_parallel(&self, frame: &Frame, regions: &[Region]) -> Vec<RegionOutcome> {
        let chunk_size = regions.len().div_ceil(self.parallelism);
        std::thread::scope(|scope| {
            let handles: Vec<_> = regions
                .chunks(chunk_size)
                .enumerate()
                .map(|(chunk_index, chunk)| {
                    let offset = chunk_index * chunk_size;
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .enumerate()
                            .map(|(i, region)| self.process_region(frame, offset + i, region))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }

    fn process_region(&self, frame: &Frame, index: usize, region: &Region) -> RegionOutcome {
        let image = guarded(index, RegionStage::Crop, || frame.crop(region))?;

        let embedding = guarded(index, RegionStage::Embedding, || self.embedder.embed(&image))?;

        let identity = self
            .gallery
            .as_ref()
            .and_then(|g| g.identify(&embedding))
            .map(str::to_owned);

        let mask = match &self.mask_classifier {
            Some(classifier) => Some(guarded(index, RegionStage::MaskClassification, || {
                classifier.classify(&image)
            })?),
            None => None,
        };

        Ok((
            FaceCrop {
                region: region.clone(),
                image,
            },
            Prediction {
                region: region.clone(),
                identity,
                mask,
                embedding,
            },
        ))
    }
}

/// Runs one region step, reporting both an error and a panic as a failure
/// of `stage`.
fn guarded<T, E: fmt::Display>(
    index: usize,
    stage: RegionStage,
    step: impl FnOnce() -> Result<T, E>,
) -> Result<T, RegionError> {
    match catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result.map_err(|e| RegionError::new(index, stage, e)),
        Err(payload) => Err(RegionError::new(
            index,
            stage,
            format!("panicked: {}", panic_message(&*payload)),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::domain::embedding::Embedding;
    use crate::recognition::domain::mask_classifier::MaskLabel;
    use rstest::rstest;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds a crop as `[x, y]` of its first pixel; fails for marked widths.
    struct StubEmbedder {
        fail_widths: HashSet<u32>,
        calls: AtomicUsize,
    }

    impl StubEmbedder {
        fn new(fail_widths: &[u32]) -> Arc<Self> {
            Arc::new(Self {
                fail_widths: fail_widths.iter().copied().collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl FaceEmbedder for StubEmbedder {
        fn embedding_dim(&self) -> usize {
            2
        }

        fn embed(&self, crop: &Frame) -> Result<Embedding, Box<dyn std::error::Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_widths.contains(&crop.width()) {
                return Err("model rejected input".into());
            }
            Ok(Embedding::new(vec![crop.data()[0] as f32, 1.0]))
        }
    }

    struct StubClassifier {
        fail: bool,
        calls: AtomicUsize,
    }

    impl MaskClassifier for StubClassifier {
        fn classify(&self, crop: &Frame) -> Result<MaskLabel, Box<dyn std::error::Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("classifier unavailable".into());
            }
            Ok(if crop.width() % 2 == 0 {
                MaskLabel::Mask
            } else {
                MaskLabel::NoMask
            })
        }
    }

    fn classifier(fail: bool) -> Arc<StubClassifier> {
        Arc::new(StubClassifier {
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    /// 100x20 grayscale frame whose pixel value equals its x coordinate.
    fn gradient_frame() -> Frame {
        let data = (0..20).flat_map(|_| 0..100u8).collect();
        Frame::new(data, 100, 20, 1, 3)
    }

    /// Regions at x = 0, 10, 20, ... with distinct widths 5, 6, 7, ...
    fn regions(n: usize) -> Vec<Region> {
        (0..n)
            .map(|i| Region::new(i as i32 * 10, 0, 5 + i as i32, 10))
            .collect()
    }

    #[test]
    fn test_all_regions_succeed_in_detector_order() {
        let processor = RegionProcessor::new(StubEmbedder::new(&[]), None);
        let out = processor.process(&gradient_frame(), &regions(3));

        assert!(out.failures.is_empty());
        let xs: Vec<i32> = out.crops.iter().map(|c| c.region.x).collect();
        assert_eq!(xs, vec![0, 10, 20]);
        let firsts: Vec<u8> = out.crops.iter().map(|c| c.image.data()[0]).collect();
        assert_eq!(firsts, vec![0, 10, 20]);
        assert_eq!(out.predictions.len(), 3);
        assert_eq!(out.predictions[1].region, out.crops[1].region);
    }

    #[test]
    fn test_embedding_failure_skips_only_that_region() {
        // Region 2 (width 6) fails embedding: expect crops for regions 1 and 3.
        let processor = RegionProcessor::new(StubEmbedder::new(&[6]), None);
        let out = processor.process(&gradient_frame(), &regions(3));

        let xs: Vec<i32> = out.crops.iter().map(|c| c.region.x).collect();
        assert_eq!(xs, vec![0, 20]);
        assert_eq!(
            out.failures,
            vec![RegionError::new(
                1,
                RegionStage::Embedding,
                "model rejected input"
            )]
        );
    }

    #[test]
    fn test_crop_failure_skips_region_without_embedding() {
        let embedder = StubEmbedder::new(&[]);
        let processor = RegionProcessor::new(Arc::clone(&embedder) as Arc<dyn FaceEmbedder>, None);
        let mut rs = regions(2);
        rs.insert(1, Region::new(500, 0, 10, 10));

        let out = processor.process(&gradient_frame(), &rs);

        assert_eq!(out.crops.len(), 2);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].index, 1);
        assert_eq!(out.failures[0].stage, RegionStage::Crop);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_region_clamped_at_frame_edge_still_processed() {
        let processor = RegionProcessor::new(StubEmbedder::new(&[]), None);
        let out = processor.process(&gradient_frame(), &[Region::new(95, 15, 50, 50)]);

        assert_eq!(out.crops.len(), 1);
        assert_eq!(
            (out.crops[0].image.width(), out.crops[0].image.height()),
            (5, 5)
        );
        // The reported region is the detector's, not the clamped one.
        assert_eq!(out.crops[0].region.width, 50);
    }

    #[test]
    fn test_mask_disabled_leaves_label_empty_and_never_classifies() {
        let processor = RegionProcessor::new(StubEmbedder::new(&[]), None);
        let out = processor.process(&gradient_frame(), &regions(2));

        assert!(!processor.mask_detection_enabled());
        assert!(out.predictions.iter().all(|p| p.mask.is_none()));
    }

    #[test]
    fn test_mask_enabled_labels_every_prediction() {
        let c = classifier(false);
        let processor = RegionProcessor::new(
            StubEmbedder::new(&[]),
            Some(Arc::clone(&c) as Arc<dyn MaskClassifier>),
        );
        let out = processor.process(&gradient_frame(), &regions(2));

        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.predictions[0].mask, Some(MaskLabel::NoMask));
        assert_eq!(out.predictions[1].mask, Some(MaskLabel::Mask));
    }

    #[test]
    fn test_mask_failure_skips_region() {
        let processor = RegionProcessor::new(
            StubEmbedder::new(&[]),
            Some(classifier(true) as Arc<dyn MaskClassifier>),
        );
        let out = processor.process(&gradient_frame(), &regions(2));

        assert!(out.crops.is_empty());
        assert_eq!(out.failures.len(), 2);
        assert!(out
            .failures
            .iter()
            .all(|f| f.stage == RegionStage::MaskClassification));
    }

    #[test]
    fn test_gallery_labels_matching_identity() {
        let gallery = IdentityGallery::from_json(r#"{ "left": [0.0, 1.0] }"#, 0.99).unwrap();
        let processor = RegionProcessor::new(StubEmbedder::new(&[]), None).with_gallery(gallery);
        let out = processor.process(&gradient_frame(), &regions(2));

        // Region at x=0 embeds to [0, 1]; region at x=10 to [10, 1].
        assert_eq!(out.predictions[0].identity.as_deref(), Some("left"));
        assert_eq!(out.predictions[1].identity, None);
    }

    #[test]
    fn test_no_regions_yields_empty_result() {
        let processor = RegionProcessor::new(StubEmbedder::new(&[]), None);
        let out = processor.process(&gradient_frame(), &[]);
        assert!(out.crops.is_empty() && out.predictions.is_empty() && out.failures.is_empty());
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    #[case(16)]
    fn test_parallel_processing_preserves_order(#[case] parallelism: usize) {
        let processor =
            RegionProcessor::new(StubEmbedder::new(&[7]), None).with_parallelism(parallelism);
        let out = processor.process(&gradient_frame(), &regions(7));

        let xs: Vec<i32> = out.crops.iter().map(|c| c.region.x).collect();
        assert_eq!(xs, vec![0, 10, 30, 40, 50, 60]);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].index, 2);
    }

    /// Panics while embedding crops of one width.
    struct PanickingEmbedder {
        width: u32,
    }

    impl FaceEmbedder for PanickingEmbedder {
        fn embedding_dim(&self) -> usize {
            2
        }

        fn embed(&self, crop: &Frame) -> Result<Embedding, Box<dyn std::error::Error>> {
            if crop.width() == self.width {
                panic!("tensor shape mismatch");
            }
            Ok(Embedding::new(vec![1.0, 0.0]))
        }
    }

    struct PanickingClassifier;

    impl MaskClassifier for PanickingClassifier {
        fn classify(&self, _crop: &Frame) -> Result<MaskLabel, Box<dyn std::error::Error>> {
            panic!("classifier state corrupted: {}", 42);
        }
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    fn test_embedding_panic_skips_only_that_region(#[case] parallelism: usize) {
        // Region 2 (width 6) panics: expect crops for regions 1 and 3.
        let processor = RegionProcessor::new(Arc::new(PanickingEmbedder { width: 6 }), None)
            .with_parallelism(parallelism);
        let out = processor.process(&gradient_frame(), &regions(3));

        let xs: Vec<i32> = out.crops.iter().map(|c| c.region.x).collect();
        assert_eq!(xs, vec![0, 20]);
        assert_eq!(
            out.failures,
            vec![RegionError::new(
                1,
                RegionStage::Embedding,
                "panicked: tensor shape mismatch"
            )]
        );
    }

    #[test]
    fn test_classifier_panic_reported_at_mask_stage() {
        let processor = RegionProcessor::new(
            StubEmbedder::new(&[]),
            Some(Arc::new(PanickingClassifier) as Arc<dyn MaskClassifier>),
        );
        let out = processor.process(&gradient_frame(), &regions(1));

        assert!(out.crops.is_empty());
        assert_eq!(out.failures[0].stage, RegionStage::MaskClassification);
        assert_eq!(
            out.failures[0].message,
            "panicked: classifier state corrupted: 42"
        );
    }

    #[test]
    fn test_region_error_display() {
        let e = RegionError::new(4, RegionStage::MaskClassification, "boom");
        assert_eq!(e.to_string(), "region 4 failed at mask classification: boom");
    }
}
