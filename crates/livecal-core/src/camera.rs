use crate::distortion::{FisheyeDistortion, RationalDistortion};
use nalgebra::{Matrix3, Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Number of distortion slots kept by a [`CameraModel`].
///
/// Both variants share the buffer so that switching from pinhole to fisheye
/// and back does not lose the higher-order pinhole terms.
pub const DISTORTION_SLOTS: usize = 8;

/// Initial focal length guess (pixels) used before any calibration.
pub const DEFAULT_FOCAL_GUESS: f64 = 884.0;

/// Image dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl ImageSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Which projection/distortion family a [`CameraModel`] uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraVariant {
    #[default]
    Pinhole,
    Fisheye,
}

impl CameraVariant {
    /// Number of distortion coefficients the variant consumes.
    pub fn distortion_len(self) -> usize {
        match self {
            CameraVariant::Pinhole => RationalDistortion::LEN,
            CameraVariant::Fisheye => FisheyeDistortion::LEN,
        }
    }

    /// Whether a persisted/user-supplied vector of `len` coefficients fits.
    pub fn accepts_distortion_len(self, len: usize) -> bool {
        match self {
            CameraVariant::Pinhole => len == 4 || len == 5 || len == RationalDistortion::LEN,
            CameraVariant::Fisheye => len == FisheyeDistortion::LEN,
        }
    }
}

/// Errors raised when a camera model cannot be used for projection or
/// rectification.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("intrinsic matrix is empty or not 3x3")]
    EmptyIntrinsics,
    #[error("distortion vector is empty")]
    EmptyDistortion,
    #[error("{variant:?} model cannot use {got} distortion coefficients")]
    DistortionLength { variant: CameraVariant, got: usize },
    #[error("invalid focal lengths (fx={fx}, fy={fy})")]
    InvalidFocal { fx: f64, fy: f64 },
    #[error("camera model contains non-finite values")]
    NonFinite,
    #[error("image size {width}x{height} is empty")]
    EmptyImage { width: usize, height: usize },
}

/// Pinhole intrinsics `K = [fx skew cx; 0 fy cy; 0 0 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
}

impl Intrinsics {
    /// Default guess: fixed focal length, principal point at the image centre.
    pub fn initial_guess(size: ImageSize) -> Self {
        Self {
            fx: DEFAULT_FOCAL_GUESS,
            fy: DEFAULT_FOCAL_GUESS,
            cx: size.width as f64 / 2.0,
            cy: size.height as f64 / 2.0,
            skew: 0.0,
        }
    }

    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Read intrinsics from a 3x3 matrix, normalizing by `K[2][2]`.
    pub fn from_matrix(k: &Matrix3<f64>) -> Result<Self, ModelError> {
        let s = k[(2, 2)];
        if !s.is_finite() || s.abs() < f64::EPSILON {
            return Err(ModelError::EmptyIntrinsics);
        }
        let out = Self {
            fx: k[(0, 0)] / s,
            fy: k[(1, 1)] / s,
            cx: k[(0, 2)] / s,
            cy: k[(1, 2)] / s,
            skew: k[(0, 1)] / s,
        };
        out.validate()?;
        Ok(out)
    }

    /// Read intrinsics from a row-major slice of exactly nine values.
    pub fn from_row_slice(values: &[f64]) -> Result<Self, ModelError> {
        if values.len() != 9 {
            return Err(ModelError::EmptyIntrinsics);
        }
        Self::from_matrix(&Matrix3::from_row_slice(values))
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let vals = [self.fx, self.fy, self.cx, self.cy, self.skew];
        if vals.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite);
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(ModelError::InvalidFocal {
                fx: self.fx,
                fy: self.fy,
            });
        }
        Ok(())
    }

    /// Pixel coordinates of a (distorted) normalized point.
    #[inline]
    pub fn to_pixel(&self, xd: f64, yd: f64) -> Point2<f64> {
        Point2::new(self.fx * xd + self.skew * yd + self.cx, self.fy * yd + self.cy)
    }

    /// Normalized coordinates of a pixel (inverse of [`to_pixel`](Self::to_pixel)).
    #[inline]
    pub fn to_normalized(&self, p: &Point2<f64>) -> Vector2<f64> {
        let y = (p.y - self.cy) / self.fy;
        let x = (p.x - self.cx - self.skew * y) / self.fx;
        Vector2::new(x, y)
    }
}

/// Lens distortion resolved for the active variant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Distortion {
    Pinhole(RationalDistortion),
    Fisheye(FisheyeDistortion),
}

impl Distortion {
    pub fn variant(&self) -> CameraVariant {
        match self {
            Distortion::Pinhole(_) => CameraVariant::Pinhole,
            Distortion::Fisheye(_) => CameraVariant::Fisheye,
        }
    }

    /// Effective coefficient vector (8 values for pinhole, 4 for fisheye).
    pub fn coeffs(&self) -> Vec<f64> {
        match self {
            Distortion::Pinhole(d) => d.to_array().to_vec(),
            Distortion::Fisheye(d) => d.to_array().to_vec(),
        }
    }

    /// Map an ideal normalized point (`X/Z`, `Y/Z`) to distorted normalized
    /// coordinates.
    #[inline]
    pub fn distort(&self, p: Vector2<f64>) -> Vector2<f64> {
        let (x, y) = match self {
            Distortion::Pinhole(d) => d.distort(p.x, p.y),
            Distortion::Fisheye(d) => d.distort(p.x, p.y),
        };
        Vector2::new(x, y)
    }

    /// Inverse of [`distort`](Self::distort).
    pub fn undistort(&self, pd: Vector2<f64>) -> Option<Vector2<f64>> {
        match self {
            Distortion::Pinhole(d) => {
                let (x, y) = d.undistort(pd.x, pd.y);
                Some(Vector2::new(x, y))
            }
            Distortion::Fisheye(d) => d.undistort(pd.x, pd.y).map(|(x, y)| Vector2::new(x, y)),
        }
    }
}

/// Intrinsic camera description shared by the calibrator and the rectifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    image_size: ImageSize,
    variant: CameraVariant,
    intrinsics: Intrinsics,
    coeffs: [f64; DISTORTION_SLOTS],
    alpha: f64,
}

impl CameraModel {
    /// Uncalibrated starting model for `image_size`.
    pub fn initial(image_size: ImageSize, variant: CameraVariant) -> Self {
        Self {
            image_size,
            variant,
            intrinsics: Intrinsics::initial_guess(image_size),
            coeffs: [0.0; DISTORTION_SLOTS],
            alpha: 0.0,
        }
    }

    /// Build a model from user supplied parameters.
    ///
    /// `distortion` is validated against `variant`; shorter pinhole vectors
    /// are zero padded. Extra fisheye slots (when 8 values are given) are kept
    /// in the buffer but ignored while the fisheye variant is active.
    pub fn from_parts(
        image_size: ImageSize,
        variant: CameraVariant,
        intrinsics: Intrinsics,
        distortion: &[f64],
        alpha: f64,
    ) -> Result<Self, ModelError> {
        if image_size.is_empty() {
            return Err(ModelError::EmptyImage {
                width: image_size.width,
                height: image_size.height,
            });
        }
        if distortion.is_empty() {
            return Err(ModelError::EmptyDistortion);
        }
        if !variant.accepts_distortion_len(distortion.len()) {
            return Err(ModelError::DistortionLength {
                variant,
                got: distortion.len(),
            });
        }
        intrinsics.validate()?;

        let mut coeffs = [0.0; DISTORTION_SLOTS];
        for (dst, src) in coeffs.iter_mut().zip(distortion.iter()) {
            *dst = *src;
        }

        let model = Self {
            image_size,
            variant,
            intrinsics,
            coeffs,
            alpha: clamp_alpha(alpha),
        };
        model.validate()?;
        Ok(model)
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }

    pub fn variant(&self) -> CameraVariant {
        self.variant
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn intrinsic_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.to_matrix()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Full 8-slot buffer, including slots unused by the active variant.
    pub fn stored_coeffs(&self) -> &[f64; DISTORTION_SLOTS] {
        &self.coeffs
    }

    /// Distortion for the active variant.
    pub fn distortion(&self) -> Distortion {
        match self.variant {
            CameraVariant::Pinhole => Distortion::Pinhole(RationalDistortion::from_array(self.coeffs)),
            CameraVariant::Fisheye => Distortion::Fisheye(FisheyeDistortion::from_slice(&self.coeffs)),
        }
    }

    /// Effective coefficient vector for the active variant (length 8 or 4).
    pub fn effective_coeffs(&self) -> Vec<f64> {
        self.coeffs[..self.variant.distortion_len()].to_vec()
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = clamp_alpha(alpha);
    }

    /// Switch variant; the coefficient buffer is left untouched.
    pub fn set_variant(&mut self, variant: CameraVariant) {
        self.variant = variant;
    }

    pub fn set_intrinsics(&mut self, intrinsics: Intrinsics) {
        self.intrinsics = intrinsics;
    }

    /// Store coefficients of `distortion` in the leading slots and switch to
    /// its variant. Trailing slots keep their previous values.
    pub fn set_distortion(&mut self, distortion: Distortion) {
        self.variant = distortion.variant();
        for (dst, src) in self.coeffs.iter_mut().zip(distortion.coeffs()) {
            *dst = src;
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.image_size.is_empty() {
            return Err(ModelError::EmptyImage {
                width: self.image_size.width,
                height: self.image_size.height,
            });
        }
        self.intrinsics.validate()?;
        if self.coeffs.iter().any(|c| !c.is_finite()) || !self.alpha.is_finite() {
            return Err(ModelError::NonFinite);
        }
        Ok(())
    }

    /// Project a camera-frame point into pixel coordinates.
    ///
    /// Returns `None` for points on or behind the image plane.
    #[inline]
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= f64::EPSILON {
            return None;
        }
        let ideal = Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        let d = self.distortion().distort(ideal);
        Some(self.intrinsics.to_pixel(d.x, d.y))
    }

    /// Back-project a pixel to ideal normalized coordinates (`z = 1` plane).
    pub fn unproject(&self, pixel: &Point2<f64>) -> Option<Vector2<f64>> {
        let pd = self.intrinsics.to_normalized(pixel);
        self.distortion().undistort(pd)
    }
}

fn clamp_alpha(alpha: f64) -> f64 {
    if alpha.is_finite() {
        alpha.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
