//! Live camera calibration.
//!
//! `livecal` ties the workspace together: frames come in from a capture
//! thread, a bounded pool runs chessboard detection on a throttled subset of
//! them, detected corners feed an incremental calibration, and every frame is
//! rectified with the latest published tables.
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use livecal::{CalibrationSession, FramePipeline, SessionConfig, SessionEvent};
//! use livecal::core::{Frame, PixelFormat};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::load_json("session.json")?;
//! let session = Arc::new(CalibrationSession::new(config)?);
//! let events = session.events().subscribe();
//! let mut pipeline = FramePipeline::new(Arc::clone(&session))?;
//!
//! # let next_frame = || Some(Frame::zeros(1280, 720, PixelFormat::Rgb8));
//! while let Some(frame) = next_frame() {
//!     pipeline.push_frame(frame);
//!     for event in events.try_iter() {
//!         if let SessionEvent::NewParameters(p) = event {
//!             println!("rms {:.3}px after {} views", p.reprojection_error, p.observation_count);
//!         }
//!     }
//! #   break;
//! }
//! pipeline.shutdown();
//! session.save_file("camera.json")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - [`CalibrationSession`]: the model, observation window and published tables.
//! - [`FramePipeline`]: per-frame display, dispatch and rectification.
//! - [`ChessboardDetectionTask`] / [`DetectionPool`]: detection off the hot path.
//! - [`EventBus`]: frames, corners and new parameters for a UI.
//! - [`SessionConfig`] and [`CalibrationFile`]: JSON configuration and results.
//! - `livecal::core`, `livecal::chessboard`, `livecal::calib`: the underlying crates.

pub use livecal_calib as calib;
pub use livecal_chessboard as chessboard;
pub use livecal_core as core;

mod config;
mod events;
mod persistence;
mod pipeline;
mod pool;
mod session;
mod task;

pub use config::{ConfigError, SessionConfig};
pub use events::{CalibrationParameters, EventBus, FrameKind, SessionEvent};
pub use persistence::{CalibrationFile, PersistenceError};
pub use pipeline::{Dispatch, FramePipeline};
pub use pool::{DetectionPool, PoolError};
pub use session::{CalibrationSession, SessionError};
pub use task::{ChessboardDetectionTask, TaskError, TaskOutcome};

pub use livecal_calib::{AddOutcome, ResolvePolicy};
pub use livecal_core::{CameraModel, CameraVariant, Frame, ImageSize, Intrinsics, PixelFormat};
