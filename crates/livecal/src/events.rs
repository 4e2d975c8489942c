//! Fan-out of session events to display/UI consumers.

use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use livecal_core::{CameraVariant, Frame, Intrinsics};
use nalgebra::Point2;
use parking_lot::Mutex;

/// Which display stream a frame belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// As received from the capture thread.
    Raw,
    /// Output of a detection task, annotated when a board was found.
    Overlay,
    /// Undistorted frame, or the raw frame while no tables exist.
    Rectified,
}

/// Snapshot of the calibration published after every successful solve.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationParameters {
    pub variant: CameraVariant,
    pub intrinsics: Intrinsics,
    /// Effective coefficients of `variant` (8 pinhole, 4 fisheye).
    pub distortion: Vec<f64>,
    pub refined: bool,
    /// RMS reprojection error in pixels, NaN before the first solve.
    pub reprojection_error: f64,
    pub observation_count: usize,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Frame { kind: FrameKind, frame: Arc<Frame> },
    CornersFound { corners: Arc<Vec<Point2<f64>>> },
    NewParameters(CalibrationParameters),
}

enum Subscriber {
    /// Never drops events.
    Unbounded(Sender<SessionEvent>),
    /// Drops events while the receiver lags behind.
    Lossy(Sender<SessionEvent>),
}

/// Broadcasts [`SessionEvent`]s to every live subscriber.
///
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(Subscriber::Unbounded(tx));
        rx
    }

    /// Subscribe with a queue of `capacity` events; events published while
    /// the queue is full are dropped for this subscriber only.
    pub fn subscribe_lossy(&self, capacity: usize) -> Receiver<SessionEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.lock().push(Subscriber::Lossy(tx));
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn publish(&self, event: SessionEvent) {
        self.subscribers.lock().retain(|sub| match sub {
            Subscriber::Unbounded(tx) => tx.send(event.clone()).is_ok(),
            Subscriber::Lossy(tx) => match tx.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            },
        });
    }

    pub fn publish_frame(&self, kind: FrameKind, frame: Arc<Frame>) {
        self.publish(SessionEvent::Frame { kind, frame });
    }
}
