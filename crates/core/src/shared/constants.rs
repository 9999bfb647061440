pub const BLAZEFACE_MODEL_NAME: &str = "blazeface_short_range.onnx";

pub const FACENET_MODEL_NAME: &str = "facenet_512.onnx";

pub const MASK_MODEL_NAME: &str = "mask_detector.onnx";

/// Portrait camera analysis resolution.
pub const DEFAULT_TARGET_RESOLUTION: (u32, u32) = (480, 640);

/// In-flight frames older than this are considered stalled.
pub const DEFAULT_WATCHDOG_TIMEOUT_MS: u64 = 3000;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];
