//! Calibration parameter files.
//!
//! A file describes one camera completely:
//!
//! ```json
//! {
//!   "width": 1280, "height": 720, "fisheye": false, "alpha": 0.0,
//!   "camera_matrix": [[900.0, 0.0, 640.0], [0.0, 900.0, 360.0], [0.0, 0.0, 1.0]],
//!   "dist_coeffs": [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
//! }
//! ```
//!
//! Pinhole files carry 4 or 8 coefficients, fisheye files exactly 4.

use std::{fs, path::Path};

use livecal_core::{CameraModel, CameraVariant, ImageSize, Intrinsics, ModelError};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("file is for {got:?}, session captures at {expected:?}")]
    SizeMismatch { expected: ImageSize, got: ImageSize },
    #[error("{variant:?} file has {got} distortion coefficients")]
    DistortionLength { variant: CameraVariant, got: usize },
    #[error("invalid image size {width}x{height}")]
    InvalidImageSize { width: i64, height: i64 },
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub width: i64,
    pub height: i64,
    pub fisheye: bool,
    #[serde(default)]
    pub alpha: f64,
    /// Row-major intrinsic matrix.
    pub camera_matrix: [[f64; 3]; 3],
    pub dist_coeffs: Vec<f64>,
}

impl CalibrationFile {
    pub fn from_model(model: &CameraModel) -> Self {
        let k = model.intrinsic_matrix();
        let size = model.image_size();
        Self {
            width: size.width as i64,
            height: size.height as i64,
            fisheye: model.variant() == CameraVariant::Fisheye,
            alpha: model.alpha(),
            camera_matrix: [0, 1, 2].map(|r| [k[(r, 0)], k[(r, 1)], k[(r, 2)]]),
            dist_coeffs: model.effective_coeffs(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn variant(&self) -> CameraVariant {
        if self.fisheye {
            CameraVariant::Fisheye
        } else {
            CameraVariant::Pinhole
        }
    }

    pub fn image_size(&self) -> Result<ImageSize, PersistenceError> {
        if self.width < 1 || self.height < 1 {
            return Err(PersistenceError::InvalidImageSize {
                width: self.width,
                height: self.height,
            });
        }
        Ok(ImageSize::new(self.width as usize, self.height as usize))
    }

    /// Validated camera model; pinhole vectors of 4 are zero padded to 8.
    pub fn to_model(&self) -> Result<CameraModel, PersistenceError> {
        let size = self.image_size()?;
        let variant = self.variant();
        let n = self.dist_coeffs.len();
        let accepted = match variant {
            CameraVariant::Pinhole => n == 4 || n == 8,
            CameraVariant::Fisheye => n == 4,
        };
        if !accepted {
            return Err(PersistenceError::DistortionLength { variant, got: n });
        }
        let k = Matrix3::from_fn(|r, c| self.camera_matrix[r][c]);
        let intrinsics = Intrinsics::from_matrix(&k)?;
        Ok(CameraModel::from_parts(
            size,
            variant,
            intrinsics,
            &self.dist_coeffs,
            self.alpha,
        )?)
    }
}
