//! One chessboard detection pass over one frame.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use livecal_calib::AddOutcome;
use livecal_chessboard::{draw_chessboard_corners, CornerFinder, DetectError, PatternSize};
use livecal_core::Frame;
use log::{debug, warn};
use nalgebra::Point2;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::events::{EventBus, FrameKind, SessionEvent};
use crate::session::{CalibrationSession, SessionError};

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("detection task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub enum TaskOutcome {
    /// The session was dropped or shut down; nothing was published.
    SessionGone,
    /// No complete board in the frame.
    NotFound,
    /// Corners were found and handed to the session.
    Submitted(Result<AddOutcome, SessionError>),
    /// Detection failed, or a later step panicked; the unannotated frame was
    /// still published.
    Failed(TaskError),
}

/// Detects the board in one frame and feeds the session.
///
/// The task only holds a weak handle, so it never keeps a torn-down session
/// alive and becomes a no-op once the session is gone or shut down.
pub struct ChessboardDetectionTask {
    session: Weak<CalibrationSession>,
    events: Arc<EventBus>,
    finder: Arc<dyn CornerFinder>,
    pattern: PatternSize,
    frame: Arc<Frame>,
}

impl ChessboardDetectionTask {
    pub fn new(session: &Arc<CalibrationSession>, finder: Arc<dyn CornerFinder>, frame: Arc<Frame>) -> Self {
        Self {
            session: Arc::downgrade(session),
            events: Arc::clone(session.events()),
            finder,
            pattern: session.config().pattern.size,
            frame,
        }
    }

    fn session_alive(&self) -> Option<Arc<CalibrationSession>> {
        self.session.upgrade().filter(|s| !s.is_shut_down())
    }

    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
    pub fn run(self) -> TaskOutcome {
        if self.session_alive().is_none() {
            return TaskOutcome::SessionGone;
        }

        // Detection, overlay and submission all run inside the boundary; a
        // panic anywhere still leaves the raw frame on the display.
        let stage = catch_unwind(AssertUnwindSafe(|| self.detect_and_submit()))
            .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())))
            .and_then(|r| r);

        match stage {
            Ok(Stage::NotFound) => {
                debug!("no {}x{} board in frame", self.pattern.rows, self.pattern.cols);
                self.events.publish_frame(FrameKind::Overlay, Arc::clone(&self.frame));
                TaskOutcome::NotFound
            }
            Ok(Stage::SessionGone) => TaskOutcome::SessionGone,
            Ok(Stage::Submitted {
                overlay,
                corners,
                submitted,
            }) => {
                self.events.publish_frame(FrameKind::Overlay, Arc::new(overlay));
                self.events.publish(SessionEvent::CornersFound { corners });
                TaskOutcome::Submitted(submitted)
            }
            Err(err) => {
                warn!("detection task failed: {err}");
                self.events.publish_frame(FrameKind::Overlay, Arc::clone(&self.frame));
                TaskOutcome::Failed(err)
            }
        }
    }

    fn detect_and_submit(&self) -> Result<Stage, TaskError> {
        let gray = self.frame.to_gray();
        let Some(corners) = self.finder.find_corners(&gray, self.pattern)? else {
            return Ok(Stage::NotFound);
        };

        let mut overlay = self.frame.to_color();
        draw_chessboard_corners(&mut overlay, self.pattern, &corners, true);

        let Some(session) = self.session_alive() else {
            return Ok(Stage::SessionGone);
        };
        let shared = Arc::new(corners.clone());
        let submitted = session.submit_detected_corners(corners);
        Ok(Stage::Submitted {
            overlay,
            corners: shared,
            submitted,
        })
    }
}

/// Result of the guarded part of a task, published by `run`.
enum Stage {
    NotFound,
    SessionGone,
    Submitted {
        overlay: Frame,
        corners: Arc<Vec<Point2<f64>>>,
        submitted: Result<AddOutcome, SessionError>,
    },
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use livecal_core::{GrayImage, PixelFormat};

    struct Scripted(Option<Vec<Point2<f64>>>);

    impl CornerFinder for Scripted {
        fn find_corners(
            &self,
            _gray: &GrayImage,
            _pattern: PatternSize,
        ) -> Result<Option<Vec<Point2<f64>>>, DetectError> {
            Ok(self.0.clone())
        }
    }

    struct Panicking;

    impl CornerFinder for Panicking {
        fn find_corners(
            &self,
            _gray: &GrayImage,
            _pattern: PatternSize,
        ) -> Result<Option<Vec<Point2<f64>>>, DetectError> {
            panic!("detector blew up")
        }
    }

    fn setup() -> (Arc<CalibrationSession>, Arc<Frame>) {
        let session = Arc::new(CalibrationSession::new(SessionConfig::default()).expect("session"));
        (session, Arc::new(Frame::zeros(1280, 720, PixelFormat::Gray8)))
    }

    fn grid() -> Vec<Point2<f64>> {
        (0..5)
            .flat_map(|r| (0..7).map(move |c| Point2::new(100.0 + 30.0 * c as f64, 80.0 + 30.0 * r as f64)))
            .collect()
    }

    #[test]
    fn found_corners_reach_session_and_display() {
        let (session, frame) = setup();
        let rx = session.events().subscribe();
        let task = ChessboardDetectionTask::new(&session, Arc::new(Scripted(Some(grid()))), frame);
        let outcome = task.run();
        assert!(matches!(
            outcome,
            TaskOutcome::Submitted(Ok(AddOutcome::Stored { observation_count: 1 }))
        ));
        assert_eq!(session.get_observation_count(), 1);

        let events: Vec<SessionEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Frame { kind: FrameKind::Overlay, frame } if frame.format() == PixelFormat::Rgb8
        )));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::CornersFound { corners } if corners.len() == 35)));
    }

    #[test]
    fn panic_is_contained_and_frame_still_published() {
        let (session, frame) = setup();
        let rx = session.events().subscribe();
        let outcome = ChessboardDetectionTask::new(&session, Arc::new(Panicking), Arc::clone(&frame)).run();
        match outcome {
            TaskOutcome::Failed(TaskError::Panicked(msg)) => assert!(msg.contains("blew up")),
            other => panic!("unexpected {other:?}"),
        }
        let published = rx.try_iter().find_map(|e| match e {
            SessionEvent::Frame { frame, .. } => Some(frame),
            _ => None,
        });
        assert!(Arc::ptr_eq(&published.expect("frame"), &frame));
        assert_eq!(session.get_observation_count(), 0);
    }

    #[test]
    fn unusable_corners_still_publish_an_overlay() {
        let (session, frame) = setup();
        let rx = session.events().subscribe();
        let mut corners = grid();
        corners[3] = Point2::new(f64::NAN, 10.0);
        corners[4] = Point2::new(1e300, -1e300);
        let outcome = ChessboardDetectionTask::new(&session, Arc::new(Scripted(Some(corners))), frame).run();
        assert!(matches!(outcome, TaskOutcome::Submitted(Err(SessionError::Accumulator(_)))));
        assert_eq!(session.get_observation_count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Frame { kind: FrameKind::Overlay, frame }) if frame.format() == PixelFormat::Rgb8
        ));
    }

    #[test]
    fn dropped_session_makes_task_a_no_op() {
        let (session, frame) = setup();
        let rx = session.events().subscribe();
        let task = ChessboardDetectionTask::new(&session, Arc::new(Scripted(Some(grid()))), frame);
        drop(session);
        assert!(matches!(task.run(), TaskOutcome::SessionGone));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn shut_down_session_is_not_touched() {
        let (session, frame) = setup();
        session.shutdown();
        let task = ChessboardDetectionTask::new(&session, Arc::new(Scripted(Some(grid()))), frame);
        assert!(matches!(task.run(), TaskOutcome::SessionGone));
        assert_eq!(session.get_observation_count(), 0);
    }

    #[test]
    fn missing_board_forwards_raw_frame() {
        let (session, frame) = setup();
        let rx = session.events().subscribe();
        let outcome = ChessboardDetectionTask::new(&session, Arc::new(Scripted(None)), Arc::clone(&frame)).run();
        assert!(matches!(outcome, TaskOutcome::NotFound));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Frame { kind: FrameKind::Overlay, .. })));
    }
}
