//! Per-frame driver: display, throttled detection dispatch and rectification.

use std::sync::Arc;

use livecal_chessboard::{ChessboardFinder, CornerFinder};
use livecal_core::Frame;
use log::{debug, trace};

use crate::events::FrameKind;
use crate::pool::{DetectionPool, PoolError};
use crate::session::CalibrationSession;
use crate::task::ChessboardDetectionTask;

/// What [`FramePipeline::push_frame`] did with the detection slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Not a detection frame.
    Skipped,
    /// A detection task was started.
    Dispatched,
    /// Detection was due but every pool slot was busy; the frame was dropped.
    PoolFull,
    /// The session no longer accepts frames.
    ShutDown,
}

pub struct FramePipeline {
    session: Arc<CalibrationSession>,
    pool: DetectionPool,
    finder: Arc<dyn CornerFinder>,
    interval: u64,
    frame_index: u64,
}

impl std::fmt::Debug for FramePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePipeline")
            .field("session", &self.session)
            .field("pool", &self.pool)
            .field("interval", &self.interval)
            .field("frame_index", &self.frame_index)
            .finish()
    }
}

impl FramePipeline {
    /// Pipeline using the built-in [`ChessboardFinder`] configured from the
    /// session config.
    pub fn new(session: Arc<CalibrationSession>) -> Result<Self, PoolError> {
        let finder = Arc::new(ChessboardFinder::new(session.config().finder.clone()));
        Self::with_finder(session, finder)
    }

    pub fn with_finder(
        session: Arc<CalibrationSession>,
        finder: Arc<dyn CornerFinder>,
    ) -> Result<Self, PoolError> {
        let cfg = session.config();
        let pool = DetectionPool::new(cfg.pool_capacity)?;
        let interval = cfg.detection_interval_frames.max(1);
        Ok(Self {
            session,
            pool,
            finder,
            interval,
            frame_index: 0,
        })
    }

    pub fn session(&self) -> &Arc<CalibrationSession> {
        &self.session
    }

    pub fn pool(&self) -> &DetectionPool {
        &self.pool
    }

    /// Handle one captured frame.
    ///
    /// The raw frame is always published. Every `detection_interval_frames`
    /// frames a detection task is offered to the pool; if no slot is free the
    /// frame is skipped for detection. The rectified frame (or the raw frame
    /// while no calibration exists) is published last.
    pub fn push_frame(&mut self, frame: Frame) -> Dispatch {
        if self.session.is_shut_down() {
            return Dispatch::ShutDown;
        }
        let index = self.frame_index;
        self.frame_index = self.frame_index.wrapping_add(1);

        let events = Arc::clone(self.session.events());
        let frame = Arc::new(frame);
        events.publish_frame(FrameKind::Raw, Arc::clone(&frame));

        let dispatch = if index % self.interval == 0 {
            let task = ChessboardDetectionTask::new(
                &self.session,
                Arc::clone(&self.finder),
                Arc::clone(&frame),
            );
            if self.pool.try_spawn(move || {
                let outcome = task.run();
                trace!("detection task finished: {outcome:?}");
            }) {
                Dispatch::Dispatched
            } else {
                debug!("frame {index}: all {} detection slots busy", self.pool.capacity());
                Dispatch::PoolFull
            }
        } else {
            Dispatch::Skipped
        };

        let rectified = match self.session.rectify(&frame) {
            Some(out) => Arc::new(out),
            None => frame,
        };
        events.publish_frame(FrameKind::Rectified, rectified);
        dispatch
    }

    /// Block until every running detection task has finished.
    pub fn wait_idle(&self) {
        self.pool.wait_idle();
    }

    /// Stop the session and drain in-flight tasks.
    pub fn shutdown(&self) {
        self.session.shutdown();
        self.pool.wait_idle();
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.pool.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::SessionEvent;
    use crossbeam_channel::{bounded, Receiver};
    use livecal_chessboard::{DetectError, PatternSize};
    use livecal_core::{GrayImage, PixelFormat};
    use nalgebra::Point2;
    use parking_lot::Mutex;

    /// Blocks every call until released.
    struct Gate(Mutex<Receiver<()>>);

    impl CornerFinder for Gate {
        fn find_corners(
            &self,
            _gray: &GrayImage,
            _pattern: PatternSize,
        ) -> Result<Option<Vec<Point2<f64>>>, DetectError> {
            let _ = self.0.lock().recv();
            Ok(None)
        }
    }

    fn config(interval: u64, capacity: usize) -> SessionConfig {
        let mut cfg = SessionConfig::default();
        cfg.image_size = livecal_core::ImageSize::new(64, 48);
        cfg.detection_interval_frames = interval;
        cfg.pool_capacity = capacity;
        cfg
    }

    fn frame() -> Frame {
        Frame::zeros(64, 48, PixelFormat::Gray8)
    }

    #[test]
    fn detection_is_throttled_by_interval() {
        let (tx, rx) = bounded::<()>(0);
        let session = Arc::new(CalibrationSession::new(config(3, 4)).expect("session"));
        let mut pipe = FramePipeline::with_finder(session, Arc::new(Gate(Mutex::new(rx)))).expect("pipe");
        let got: Vec<Dispatch> = (0..7).map(|_| pipe.push_frame(frame())).collect();
        drop(tx);
        pipe.wait_idle();
        use Dispatch::*;
        assert_eq!(got, vec![Dispatched, Skipped, Skipped, Dispatched, Skipped, Skipped, Dispatched]);
    }

    #[test]
    fn busy_pool_drops_detection() {
        let (tx, rx) = bounded::<()>(0);
        let session = Arc::new(CalibrationSession::new(config(1, 1)).expect("session"));
        let mut pipe = FramePipeline::with_finder(session, Arc::new(Gate(Mutex::new(rx)))).expect("pipe");
        assert_eq!(pipe.push_frame(frame()), Dispatch::Dispatched);
        assert_eq!(pipe.push_frame(frame()), Dispatch::PoolFull);
        drop(tx);
        pipe.wait_idle();
        assert_eq!(pipe.push_frame(frame()), Dispatch::Dispatched);
    }

    #[test]
    fn uncalibrated_pipeline_shows_raw_frame() {
        let session = Arc::new(CalibrationSession::new(config(1000, 1)).expect("session"));
        let rx = session.events().subscribe();
        let mut pipe = FramePipeline::with_finder(
            Arc::clone(&session),
            Arc::new(Gate(Mutex::new(bounded(0).1))),
        )
        .expect("pipe");
        pipe.push_frame(frame());
        pipe.push_frame(frame());

        let frames: Vec<(FrameKind, Arc<Frame>)> = rx
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::Frame { kind, frame } => Some((kind, frame)),
                _ => None,
            })
            .collect();
        let raw: Vec<_> = frames.iter().filter(|(k, _)| *k == FrameKind::Raw).collect();
        let rect: Vec<_> = frames.iter().filter(|(k, _)| *k == FrameKind::Rectified).collect();
        assert_eq!(raw.len(), 2);
        assert_eq!(rect.len(), 2);
        assert!(Arc::ptr_eq(&raw[1].1, &rect[1].1));
    }

    #[test]
    fn shut_down_pipeline_ignores_frames() {
        let session = Arc::new(CalibrationSession::new(config(1, 1)).expect("session"));
        let mut pipe = FramePipeline::with_finder(session, Arc::new(ChessboardFinder::default())).expect("pipe");
        pipe.shutdown();
        assert_eq!(pipe.push_frame(frame()), Dispatch::ShutDown);
    }
}
