use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shared::constants::{DEFAULT_TARGET_RESOLUTION, DEFAULT_WATCHDOG_TIMEOUT_MS};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which camera produced the frames. Front-camera previews are mirrored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LensFacing {
    #[default]
    Front,
    Back,
}

impl fmt::Display for LensFacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LensFacing::Front => write!(f, "front"),
            LensFacing::Back => write!(f, "back"),
        }
    }
}

impl FromStr for LensFacing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "front" => Ok(LensFacing::Front),
            "back" => Ok(LensFacing::Back),
            other => Err(format!("lens facing must be 'front' or 'back', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Largest size with the source's aspect ratio that fits inside this
    /// resolution, after matching this resolution's orientation to the source.
    ///
    /// Never upscales.
    pub fn fit(&self, src_width: u32, src_height: u32) -> (u32, u32) {
        let (mut bound_w, mut bound_h) = (self.width, self.height);
        if (src_width > src_height) != (bound_w > bound_h) {
            std::mem::swap(&mut bound_w, &mut bound_h);
        }
        if src_width == 0 || src_height == 0 {
            return (src_width, src_height);
        }

        let scale = (bound_w as f64 / src_width as f64)
            .min(bound_h as f64 / src_height as f64)
            .min(1.0);
        // Even dimensions keep chroma-subsampled scalers happy.
        let w = ((src_width as f64 * scale).round() as u32 & !1).max(2);
        let h = ((src_height as f64 * scale).round() as u32 & !1).max(2);
        (w, h)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_RESOLUTION.0, DEFAULT_TARGET_RESOLUTION.1)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| part.trim().parse::<u32>().ok().filter(|v| *v > 0);
        match s.split_once(|c| c == 'x' || c == 'X') {
            Some((w, h)) => match (parse(w), parse(h)) {
                (Some(width), Some(height)) => Ok(Resolution { width, height }),
                _ => Err(format!("resolution must be WIDTHxHEIGHT, got '{s}'")),
            },
            None => Err(format!("resolution must be WIDTHxHEIGHT, got '{s}'")),
        }
    }
}

/// Runtime options for the analysers.
///
/// Loaded from JSON; every field is optional and falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyserConfig {
    pub mask_detection_enabled: bool,
    pub target_resolution: Resolution,
    pub lens_facing: LensFacing,
    /// `None` disables the stall watchdog.
    pub watchdog_timeout_ms: Option<u64>,
    pub detection_confidence: f64,
    /// Minimum cosine similarity for an identity match.
    pub identity_threshold: f64,
    /// Regions processed concurrently per frame (1 = sequential).
    pub region_parallelism: usize,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            mask_detection_enabled: true,
            target_resolution: Resolution::default(),
            lens_facing: LensFacing::default(),
            watchdog_timeout_ms: Some(DEFAULT_WATCHDOG_TIMEOUT_MS),
            detection_confidence: 0.5,
            identity_threshold: 0.6,
            region_parallelism: 1,
        }
    }
}

impl AnalyserConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return Err(ConfigError::Invalid(format!(
                "detection_confidence must be between 0.0 and 1.0, got {}",
                self.detection_confidence
            )));
        }
        if !(-1.0..=1.0).contains(&self.identity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "identity_threshold must be between -1.0 and 1.0, got {}",
                self.identity_threshold
            )));
        }
        if self.region_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "region_parallelism must be at least 1".into(),
            ));
        }
        if self.target_resolution.width == 0 || self.target_resolution.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "target_resolution must be non-zero, got {}",
                self.target_resolution
            )));
        }
        if self.watchdog_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "watchdog_timeout_ms must be positive or null".into(),
            ));
        }
        Ok(())
    }

    pub fn watchdog_timeout(&self) -> Option<Duration> {
        self.watchdog_timeout_ms.map(Duration::from_millis)
    }
}
