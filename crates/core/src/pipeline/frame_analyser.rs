use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::detection::domain::face_detector::FaceDetector;
use crate::pipeline::admission::{Admission, AdmissionGate, AdmissionPermit};
use crate::pipeline::analyser_error::AnalyserError;
use crate::pipeline::face_result::FaceResultConsumer;
use crate::pipeline::main_context::MainContext;
use crate::pipeline::overlay::BoundingBoxOverlay;
use crate::pipeline::pipeline_logger::{NullPipelineLogger, PipelineLogger};
use crate::pipeline::region_processor::RegionProcessor;
use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::recognition::domain::identity_gallery::IdentityGallery;
use crate::recognition::domain::mask_classifier::MaskClassifier;
use crate::shared::config::AnalyserConfig;
use crate::shared::frame::LeasedFrame;

/// One job may wait behind a stalled one. The watchdog only takes over
/// while this slot is free, so a hung collaborator leaves the gate busy
/// instead of admitting frames that can never run.
const JOB_QUEUE_CAPACITY: usize = 1;

/// Collaborators the analyser drives.
pub struct AnalyserComponents {
    pub detector: Box<dyn FaceDetector>,
    pub embedder: Arc<dyn FaceEmbedder>,
    /// Ignored when mask detection is disabled in the config.
    pub mask_classifier: Option<Arc<dyn MaskClassifier>>,
    pub gallery: Option<IdentityGallery>,
    pub consumer: Box<dyn FaceResultConsumer>,
    pub logger: Box<dyn PipelineLogger>,
}

impl AnalyserComponents {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        consumer: Box<dyn FaceResultConsumer>,
    ) -> Self {
        Self {
            detector,
            embedder,
            mask_classifier: None,
            gallery: None,
            consumer,
            logger: Box::new(NullPipelineLogger),
        }
    }

    pub fn with_mask_classifier(mut self, classifier: Arc<dyn MaskClassifier>) -> Self {
        self.mask_classifier = Some(classifier);
        self
    }

    pub fn with_gallery(mut self, gallery: IdentityGallery) -> Self {
        self.gallery = Some(gallery);
        self
    }

    pub fn with_logger(mut self, logger: Box<dyn PipelineLogger>) -> Self {
        self.logger = logger;
        self
    }
}

struct Job {
    frame: LeasedFrame,
    permit: AdmissionPermit,
    submitted_at: Instant,
}

/// Drop-on-busy face analysis of a live frame stream.
///
/// `submit` never blocks: a frame is either the single frame in flight or it
/// is dropped on the spot. Admitted frames are analysed on a dedicated worker
/// thread; the overlay update and the admission release are then posted to
/// the main context, in that order.
pub struct FrameAnalyser {
    gate: Arc<AdmissionGate>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<Box<dyn PipelineLogger>>>,
    overlay: Arc<Mutex<BoundingBoxOverlay>>,
}

impl FrameAnalyser {
    pub fn new(
        components: AnalyserComponents,
        config: &AnalyserConfig,
        main: MainContext,
    ) -> Result<Self, AnalyserError> {
        config.validate()?;

        let mask_classifier = components
            .mask_classifier
            .filter(|_| config.mask_detection_enabled);
        if config.mask_detection_enabled && mask_classifier.is_none() {
            log::warn!("Mask detection enabled but no classifier supplied; labels stay empty");
        }

        let mut regions = RegionProcessor::new(components.embedder, mask_classifier)
            .with_parallelism(config.region_parallelism);
        if let Some(gallery) = components.gallery {
            log::info!("Identity gallery with {} entries", gallery.len());
            regions = regions.with_gallery(gallery);
        }

        let overlay = Arc::new(Mutex::new(BoundingBoxOverlay::new(
            config.lens_facing,
            regions.mask_detection_enabled(),
        )));
        let gate = AdmissionGate::new(config.watchdog_timeout());

        let worker = Worker {
            detector: components.detector,
            regions,
            consumer: components.consumer,
            logger: components.logger,
            main,
            overlay: Arc::clone(&overlay),
        };
        let (jobs, job_rx) = crossbeam_channel::bounded::<Job>(JOB_QUEUE_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("frame-analyser".into())
            .spawn(move || worker.run(job_rx))
            .map_err(AnalyserError::Spawn)?;

        Ok(Self {
            gate,
            jobs: Some(jobs),
            worker: Some(handle),
            overlay,
        })
    }

    /// Offers a frame for analysis.
    ///
    /// A rejected frame is dropped immediately, which returns it to its
    /// source. An admitted frame's lease is returned right after detection.
    pub fn submit(&self, frame: LeasedFrame) -> Admission {
        let index = frame.frame().index();
        match self.try_admit() {
            Some(permit) => self.dispatch(frame, permit),
            None => {
                log::debug!("Frame {index} dropped: analyser busy");
                Admission::Rejected
            }
        }
    }

    pub(crate) fn try_admit(&self) -> Option<AdmissionPermit> {
        self.gate.try_admit_with(|| self.jobs.as_ref().is_some_and(Sender::is_empty))
    }

    /// Queues an admitted frame. If the worker cannot take it, the admission
    /// is handed back and the frame counts as rejected.
    pub(crate) fn dispatch(&self, frame: LeasedFrame, permit: AdmissionPermit) -> Admission {
        let Some(jobs) = self.jobs.as_ref() else {
            permit.hand_back();
            return Admission::Rejected;
        };
        let job = Job {
            frame,
            permit,
            submitted_at: Instant::now(),
        };
        match jobs.try_send(job) {
            Ok(()) => Admission::Admitted,
            Err(TrySendError::Full(job)) => {
                log::debug!(
                    "Frame {} dropped: analysis queue full",
                    job.frame.frame().index()
                );
                job.permit.hand_back();
                Admission::Rejected
            }
            Err(TrySendError::Disconnected(job)) => {
                log::error!("Analysis worker has stopped; frame dropped");
                job.permit.hand_back();
                Admission::Rejected
            }
        }
    }

    /// True while a frame is in flight.
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    pub fn rejected_count(&self) -> u64 {
        self.gate.rejected_count()
    }

    /// Overlay state. Lock it only from the main context.
    pub fn overlay(&self) -> Arc<Mutex<BoundingBoxOverlay>> {
        Arc::clone(&self.overlay)
    }

    /// Stops accepting frames, waits for the in-flight frame and emits the
    /// logger summary.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.jobs.take());
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(mut logger) => {
                logger.count("rejected_frames", self.gate.rejected_count());
                logger.count("watchdog_resets", self.gate.forced_reset_count());
                logger.summary();
            }
            Err(_) => log::error!("Analysis worker panicked"),
        }
    }
}

impl Drop for FrameAnalyser {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    detector: Box<dyn FaceDetector>,
    regions: RegionProcessor,
    consumer: Box<dyn FaceResultConsumer>,
    logger: Box<dyn PipelineLogger>,
    main: MainContext,
    overlay: Arc<Mutex<BoundingBoxOverlay>>,
}

impl Worker {
    fn run(mut self, jobs: Receiver<Job>) -> Box<dyn PipelineLogger> {
        self.logger.info(&format!(
            "Analysis worker started (mask detection {})",
            if self.regions.mask_detection_enabled() { "on" } else { "off" }
        ));
        for job in jobs {
            let frame_index = job.frame.frame().index();
            // Unwinding drops the job, which releases the lease and the permit.
            if catch_unwind(AssertUnwindSafe(|| self.analyse(job))).is_err() {
                log::error!("Analysis of frame {frame_index} panicked; frame dropped");
                self.logger.count("panics", 1);
            }
        }
        self.logger
    }

    fn analyse(&mut self, job: Job) {
        let Job {
            mut frame,
            permit,
            submitted_at,
        } = job;
        self.logger
            .timing("queue", submitted_at.elapsed().as_secs_f64() * 1000.0);

        frame.frame_mut().rotate_upright();
        let t0 = Instant::now();
        let detected = self.detector.detect(frame.frame());
        let frame = frame.release();
        self.logger
            .timing("detect", t0.elapsed().as_secs_f64() * 1000.0);

        let regions = match detected {
            Ok(regions) => regions,
            Err(e) => {
                let err = AnalyserError::DetectionFailed {
                    frame: frame.index(),
                    message: e.to_string(),
                };
                log::warn!("{err}");
                self.logger.count("detection_failures", 1);
                return;
            }
        };

        let t1 = Instant::now();
        let processed = self.regions.process(&frame, &regions);
        self.logger
            .timing("regions", t1.elapsed().as_secs_f64() * 1000.0);
        for failure in &processed.failures {
            log::warn!("Frame {}: {failure}", frame.index());
        }
        self.logger
            .count("region_failures", processed.failures.len() as u64);
        self.logger.metric("faces", processed.crops.len() as f64);

        let t2 = Instant::now();
        self.consumer.on_result(processed.crops);
        self.logger
            .timing("deliver", t2.elapsed().as_secs_f64() * 1000.0);
        self.logger.frame_analysed(frame.index());

        let overlay = Arc::clone(&self.overlay);
        let (width, height) = (frame.width(), frame.height());
        let predictions = processed.predictions;
        let posted = self.main.post(move || {
            if permit.is_current() {
                overlay
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(width, height, predictions);
            } else {
                log::debug!("Skipping overlay update from a frame superseded by the watchdog");
            }
            drop(permit);
        });
        if posted.is_err() {
            log::warn!("Main context closed; overlay not updated");
        }
    }
}
