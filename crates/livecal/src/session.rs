//! The calibration session: one camera model, its observation window and the
//! published rectification tables.
//!
//! Two locks are involved. `state` serializes every mutation, including the
//! calibration solve. `published` holds a copy-on-write snapshot (tables,
//! model, counters) that readers clone out of; it is only ever held for a
//! pointer copy. Lock order is always `state` then `published`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use livecal_calib::{
    AccumulatorError, AddOutcome, CorrespondenceAccumulator, RectificationMapBuilder,
    RectificationTables, RectifyError,
};
use livecal_core::{CameraModel, CameraVariant, Frame, Intrinsics, ModelError};
use log::{debug, info, warn};
use nalgebra::Point2;
use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::config::{ConfigError, SessionConfig};
use crate::events::{CalibrationParameters, EventBus, SessionEvent};
use crate::persistence::{CalibrationFile, PersistenceError};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
    #[error(transparent)]
    Rectify(#[from] RectifyError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("session has been shut down")]
    ShutDown,
}

struct SessionState {
    model: CameraModel,
    accumulator: CorrespondenceAccumulator,
    builder: RectificationMapBuilder,
    /// A calibration or manual model has been applied.
    ready: bool,
}

#[derive(Clone)]
struct Published {
    tables: Option<Arc<RectificationTables>>,
    model: CameraModel,
    observation_count: usize,
    refined: bool,
    reprojection_error: f64,
}

pub struct CalibrationSession {
    config: SessionConfig,
    state: Mutex<SessionState>,
    published: Mutex<Published>,
    events: Arc<EventBus>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for CalibrationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = self.published.lock();
        f.debug_struct("CalibrationSession")
            .field("image_size", &self.config.image_size)
            .field("variant", &p.model.variant())
            .field("observations", &p.observation_count)
            .field("ready", &p.tables.is_some())
            .finish()
    }
}

impl CalibrationSession {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_events(config, Arc::new(EventBus::new()))
    }

    /// Create a session that publishes into an existing bus.
    pub fn with_events(config: SessionConfig, events: Arc<EventBus>) -> Result<Self, SessionError> {
        config.validate()?;
        let mut model = CameraModel::initial(config.image_size, config.variant);
        model.set_alpha(config.alpha);
        let accumulator = CorrespondenceAccumulator::new(config.pattern, config.accumulator.clone())?;
        let published = Published {
            tables: None,
            model: model.clone(),
            observation_count: 0,
            refined: false,
            reprojection_error: f64::NAN,
        };
        Ok(Self {
            state: Mutex::new(SessionState {
                model,
                accumulator,
                builder: RectificationMapBuilder::new(),
                ready: false,
            }),
            published: Mutex::new(published),
            events,
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Undistort `frame` with the latest published tables.
    ///
    /// Returns `None` until a calibration or manual model has produced
    /// tables. Never waits for a running solve.
    pub fn rectify(&self, frame: &Frame) -> Option<Frame> {
        let tables = self.published.lock().tables.clone()?;
        Some(tables.remap(frame))
    }

    /// Latest published tables.
    pub fn tables(&self) -> Option<Arc<RectificationTables>> {
        self.published.lock().tables.clone()
    }

    /// Feed one ordered corner set to the accumulator.
    ///
    /// After a successful solve the new model and tables are published and a
    /// [`SessionEvent::NewParameters`] is emitted. Rejected observations and
    /// failed solves leave the session unchanged.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(corners = corners.len())))]
    pub fn submit_detected_corners(&self, corners: Vec<Point2<f64>>) -> Result<AddOutcome, SessionError> {
        if self.is_shut_down() {
            return Err(SessionError::ShutDown);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let outcome = match state.accumulator.add_observation(corners, &mut state.model) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("observation rejected: {err}");
                return Err(err.into());
            }
        };

        match outcome {
            AddOutcome::Stored { observation_count } => {
                debug!("stored observation {observation_count}, no solve yet");
                self.publish(state);
            }
            AddOutcome::Calibrated(summary) => {
                state.ready = true;
                if let Err(err) = state.builder.rebuild(&state.model) {
                    warn!("keeping previous rectification tables: {err}");
                }
                let params = self.publish(state);
                info!(
                    "new parameters: rms={:.4}px refined={} from {} observations",
                    summary.reprojection_error, summary.refined, summary.observation_count
                );
                self.events.publish(SessionEvent::NewParameters(params));
            }
        }
        Ok(outcome)
    }

    /// Change the rectification free-scaling parameter.
    ///
    /// Before the first calibration the value is only stored: no tables are
    /// built and the first solve still starts from the closed-form seed.
    pub fn set_alpha(&self, alpha: f64) -> Result<(), SessionError> {
        self.update_model(|model| model.set_alpha(alpha))
    }

    /// Switch between pinhole and fisheye. Coefficients stored for the other
    /// variant are kept.
    ///
    /// Like [`set_alpha`](Self::set_alpha), this does not mark the model
    /// refined until the session is ready.
    pub fn set_variant(&self, variant: CameraVariant) -> Result<(), SessionError> {
        self.update_model(|model| model.set_variant(variant))
    }

    /// Replace the model with user supplied parameters, e.g. from a file.
    ///
    /// Stored observations are kept; later solves start from this model.
    pub fn set_model(
        &self,
        intrinsics: Intrinsics,
        distortion: &[f64],
        alpha: f64,
        variant: CameraVariant,
    ) -> Result<(), SessionError> {
        let model = CameraModel::from_parts(self.config.image_size, variant, intrinsics, distortion, alpha)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.builder.rebuild(&model)?;
        state.model = model;
        state.ready = true;
        state.accumulator.mark_refined();
        self.publish(state);
        info!("camera model set manually ({variant:?})");
        Ok(())
    }

    /// Apply `edit` to the model. Before the first calibration the change is
    /// only stored; afterwards tables are rebuilt and later solves are seeded
    /// from the edited model. A failed rebuild rolls the edit back.
    fn update_model(&self, edit: impl FnOnce(&mut CameraModel)) -> Result<(), SessionError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut model = state.model.clone();
        edit(&mut model);
        if state.ready {
            state.builder.rebuild(&model)?;
            state.accumulator.mark_refined();
        }
        state.model = model;
        self.publish(state);
        Ok(())
    }

    /// Copy the current state into the published snapshot.
    fn publish(&self, state: &SessionState) -> CalibrationParameters {
        let snapshot = Published {
            tables: if state.ready { state.builder.current() } else { None },
            model: state.model.clone(),
            observation_count: state.accumulator.len(),
            refined: state.accumulator.refined(),
            reprojection_error: state.accumulator.reprojection_error(),
        };
        let params = parameters_of(&snapshot);
        *self.published.lock() = snapshot;
        params
    }

    pub fn get_model(&self) -> CameraModel {
        self.published.lock().model.clone()
    }

    pub fn get_observation_count(&self) -> usize {
        self.published.lock().observation_count
    }

    pub fn parameters(&self) -> CalibrationParameters {
        parameters_of(&self.published.lock())
    }

    pub fn is_ready(&self) -> bool {
        self.published.lock().tables.is_some()
    }

    /// Load a calibration file and apply it with [`set_model`](Self::set_model).
    ///
    /// Files for another resolution or with an incompatible distortion vector
    /// are rejected and the current model is kept.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let file = CalibrationFile::load(path)?;
        let size = file.image_size()?;
        if size != self.config.image_size {
            return Err(PersistenceError::SizeMismatch {
                expected: self.config.image_size,
                got: size,
            }
            .into());
        }
        let model = file.to_model()?;
        self.set_model(
            *model.intrinsics(),
            &model.effective_coeffs(),
            model.alpha(),
            model.variant(),
        )
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        CalibrationFile::from_model(&self.get_model()).save(path)?;
        Ok(())
    }

    /// Stop accepting observations. Detection tasks still in flight finish
    /// without touching the session.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            info!("calibration session shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

fn parameters_of(p: &Published) -> CalibrationParameters {
    CalibrationParameters {
        variant: p.model.variant(),
        intrinsics: *p.model.intrinsics(),
        distortion: p.model.effective_coeffs(),
        refined: p.refined,
        reprojection_error: p.reprojection_error,
        observation_count: p.observation_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecal_calib::synthetic::{synthetic_views, SyntheticRig};
    use livecal_core::{ImageSize, PixelFormat};

    fn session() -> CalibrationSession {
        CalibrationSession::new(SessionConfig::default()).expect("session")
    }

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 900.0,
            fy: 900.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
        }
    }

    #[test]
    fn rectify_is_empty_before_calibration() {
        let s = session();
        let frame = Frame::zeros(1280, 720, PixelFormat::Gray8);
        assert!(s.rectify(&frame).is_none());
        s.set_alpha(0.7).expect("alpha");
        assert!(s.rectify(&frame).is_none());
        assert_eq!(s.get_model().alpha(), 0.7);
    }

    #[test]
    fn set_model_publishes_tables_and_marks_refined() {
        let s = session();
        s.set_model(intrinsics(), &[-0.1, 0.01, 0.0, 0.0], 0.0, CameraVariant::Pinhole)
            .expect("set");
        assert!(s.is_ready());
        assert!(s.parameters().refined);
        let out = s
            .rectify(&Frame::zeros(1280, 720, PixelFormat::Rgb8))
            .expect("tables");
        assert_eq!(out.size(), ImageSize::new(1280, 720));
    }

    #[test]
    fn invalid_manual_model_keeps_previous() {
        let s = session();
        s.set_model(intrinsics(), &[0.0; 8], 0.0, CameraVariant::Pinhole)
            .expect("set");
        let before = s.tables().expect("tables");
        let err = s
            .set_model(intrinsics(), &[0.0; 6], 0.0, CameraVariant::Pinhole)
            .expect_err("six coefficients");
        assert!(matches!(err, SessionError::Model(ModelError::DistortionLength { .. })));
        assert!(Arc::ptr_eq(&before, &s.tables().expect("tables")));
    }

    #[test]
    fn fisheye_manual_model_needs_four_coefficients() {
        let s = session();
        let err = s
            .set_model(intrinsics(), &[0.0; 8], 0.0, CameraVariant::Fisheye)
            .expect_err("eight fisheye coefficients");
        assert!(matches!(
            err,
            SessionError::Model(ModelError::DistortionLength {
                variant: CameraVariant::Fisheye,
                got: 8
            })
        ));
        assert!(!s.is_ready());
        s.set_model(intrinsics(), &[0.01, 0.0, 0.0, 0.0], 0.0, CameraVariant::Fisheye)
            .expect("four coefficients");
        assert_eq!(s.get_model().variant(), CameraVariant::Fisheye);
    }

    #[test]
    fn edits_before_calibration_leave_seed_unrefined() {
        let s = session();
        let rx = s.events().subscribe();
        s.set_alpha(0.3).expect("alpha");
        s.set_variant(CameraVariant::Fisheye).expect("fisheye");
        s.set_variant(CameraVariant::Pinhole).expect("pinhole");
        assert!(!s.parameters().refined);
        assert!(!s.is_ready());

        let rig = SyntheticRig::hd_pinhole();
        let obj = s.config().pattern.object_points();
        for corners in synthetic_views(&rig, &obj, 5, 0.0, 23) {
            s.submit_detected_corners(corners).expect("submit");
        }
        let params = rx
            .try_iter()
            .find_map(|e| match e {
                SessionEvent::NewParameters(p) => Some(p),
                _ => None,
            })
            .expect("first solve");
        assert!(!params.refined);
        assert_eq!(s.get_model().alpha(), 0.3);
    }

    #[test]
    fn variant_round_trip_keeps_rational_terms() {
        let s = session();
        let coeffs = [0.05, -0.01, 0.001, 0.002, 0.0, 0.03, -0.02, 0.005];
        s.set_model(intrinsics(), &coeffs, 0.0, CameraVariant::Pinhole)
            .expect("set");
        s.set_variant(CameraVariant::Fisheye).expect("fisheye");
        assert_eq!(s.get_model().effective_coeffs().len(), 4);
        s.set_variant(CameraVariant::Pinhole).expect("pinhole");
        assert_eq!(s.get_model().effective_coeffs(), coeffs.to_vec());
    }

    #[test]
    fn solve_emits_new_parameters() {
        let s = session();
        let rx = s.events().subscribe();
        let rig = SyntheticRig::hd_pinhole();
        let obj = s.config().pattern.object_points();
        for corners in synthetic_views(&rig, &obj, 5, 0.0, 17) {
            s.submit_detected_corners(corners).expect("submit");
        }
        let params = rx
            .try_iter()
            .find_map(|e| match e {
                SessionEvent::NewParameters(p) => Some(p),
                _ => None,
            })
            .expect("event");
        assert_eq!(params.observation_count, 5);
        assert!(!params.refined);
        assert!(params.reprojection_error < 1e-2);
        assert!(s.is_ready());
    }

    #[test]
    fn shut_down_session_rejects_corners() {
        let s = session();
        s.shutdown();
        let err = s
            .submit_detected_corners(vec![Point2::new(0.0, 0.0); 35])
            .expect_err("shut down");
        assert!(matches!(err, SessionError::ShutDown));
        assert_eq!(s.get_observation_count(), 0);
    }
}
