//! Core types for live camera calibration.
//!
//! This crate holds the pieces shared by the detector, the solver and the
//! session facade:
//!
//! - [`CameraModel`]: intrinsics, an 8-slot distortion buffer, the active
//!   [`CameraVariant`] and the rectification free-scaling `alpha`;
//! - [`RationalDistortion`] / [`FisheyeDistortion`]: the two lens models;
//! - [`Frame`] / [`GrayImage`]: owned pixel buffers;
//! - [`ChessboardPattern`]: board layout and canonical object points;
//! - [`estimate_homography`]: normalized DLT used for pose initialization.
//!
//! It does not depend on any corner detector or image crate.

mod camera;
mod distortion;
mod homography;
mod image;
mod logger;
mod pattern;

pub use camera::{
    CameraModel, CameraVariant, Distortion, ImageSize, Intrinsics, ModelError,
    DEFAULT_FOCAL_GUESS, DISTORTION_SLOTS,
};
pub use distortion::{FisheyeDistortion, RationalDistortion};
pub use homography::{estimate_homography, Homography};
pub use pattern::{ChessboardPattern, PatternSize};
pub use image::{sample_bilinear, Frame, FrameError, GrayImage, GrayImageView, PixelFormat};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
