//! JSON session configuration.

use std::{fs, path::Path};

use livecal_calib::{AccumulatorConfig, AccumulatorError};
use livecal_chessboard::ChessboardFinderParams;
use livecal_core::{CameraVariant, ChessboardPattern, ImageSize};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("image size {width}x{height} is empty")]
    EmptyImage { width: usize, height: usize },
    #[error("pattern needs at least 2x2 inner corners (got {rows}x{cols})")]
    InvalidPattern { rows: usize, cols: usize },
    #[error("square size must be positive (got {0})")]
    InvalidSquareSize(f64),
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
}

/// Everything a [`CalibrationSession`](crate::CalibrationSession) and its
/// [`FramePipeline`](crate::FramePipeline) need at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capture resolution; frames of any other size are not supported.
    pub image_size: ImageSize,
    pub pattern: ChessboardPattern,
    pub variant: CameraVariant,
    pub alpha: f64,
    #[serde(flatten)]
    pub accumulator: AccumulatorConfig,
    /// Maximum number of concurrent detection tasks.
    pub pool_capacity: usize,
    /// Dispatch detection on every n-th frame.
    pub detection_interval_frames: u64,
    pub finder: ChessboardFinderParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image_size: ImageSize::new(1280, 720),
            pattern: ChessboardPattern::new(5, 7, 25.0),
            variant: CameraVariant::Pinhole,
            alpha: 0.0,
            accumulator: AccumulatorConfig::default(),
            pool_capacity: 3,
            detection_interval_frames: 30,
            finder: ChessboardFinderParams::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(image_size: ImageSize, pattern: ChessboardPattern) -> Self {
        Self {
            image_size,
            pattern,
            ..Self::default()
        }
    }

    /// Load and validate a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size.is_empty() {
            return Err(ConfigError::EmptyImage {
                width: self.image_size.width,
                height: self.image_size.height,
            });
        }
        let p = self.pattern.size;
        if p.rows < 2 || p.cols < 2 {
            return Err(ConfigError::InvalidPattern {
                rows: p.rows,
                cols: p.cols,
            });
        }
        if !(self.pattern.square_size.is_finite() && self.pattern.square_size > 0.0) {
            return Err(ConfigError::InvalidSquareSize(self.pattern.square_size));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Zero("pool_capacity"));
        }
        if self.detection_interval_frames == 0 {
            return Err(ConfigError::Zero("detection_interval_frames"));
        }
        self.accumulator.validate()?;
        Ok(())
    }
}
