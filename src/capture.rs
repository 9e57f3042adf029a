//! Capture source contract.
//!
//! A capture source wraps the device camera and microphone. The session only
//! needs start/stop/switch plus a way to push settings; frames and device
//! events flow back through the [`CaptureSink`] handed over at start.

use crate::errors::StreamingError;
use crate::types::{
    AudioFrame, CaptureDevicePosition, DeviceKind, FocusPoint, PreviewSize, RawFrame,
    VideoFrame, VideoOrientation,
};
use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Device settings. Applied immediately while capture runs, otherwise used
/// as the initial configuration of the next start.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CaptureSettings {
    pub position: CaptureDevicePosition,
    pub orientation: VideoOrientation,
    pub torch_on: bool,
    pub focus_point: FocusPoint,
    pub continuous_autofocus: bool,
    pub touch_to_focus: bool,
    pub muted: bool,
    pub preview_size: PreviewSize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            position: CaptureDevicePosition::Back,
            orientation: VideoOrientation::Portrait,
            torch_on: false,
            focus_point: FocusPoint::default(),
            continuous_autofocus: true,
            touch_to_focus: true,
            muted: false,
            preview_size: PreviewSize::default(),
        }
    }
}

/// Events a capture source reports about its devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    DeviceStarted(DeviceKind),
    DeviceLost { kind: DeviceKind, reason: String },
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Camera positions physically present.
    fn available_positions(&self) -> Vec<CaptureDevicePosition>;

    /// Start delivering frames into `sink`. Starting a running source is a no-op.
    async fn start(
        &self,
        settings: CaptureSettings,
        sink: CaptureSink,
    ) -> Result<(), StreamingError>;

    /// Stop delivering frames. Stopping a stopped source is a no-op.
    async fn stop(&self);

    /// Apply settings to a running source.
    fn apply_settings(&self, settings: &CaptureSettings) -> Result<(), StreamingError>;

    /// Switch the running camera to `position`. Frames may gap briefly.
    async fn switch_camera(&self, position: CaptureDevicePosition)
        -> Result<(), StreamingError>;
}

#[derive(Debug, Default)]
pub(crate) struct SinkCounters {
    pub(crate) captured: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

type EventHook = Arc<dyn Fn(CaptureEvent) + Send + Sync>;

/// Producer end of the frame path, cloneable across capture threads.
///
/// Frames go into a bounded queue; when the encoder falls behind the oldest
/// queued frame is dropped.
#[derive(Clone)]
pub struct CaptureSink {
    frames: Sender<RawFrame>,
    drain: Receiver<RawFrame>,
    counters: Arc<SinkCounters>,
    on_event: EventHook,
}

impl CaptureSink {
    pub(crate) fn new(
        frames: Sender<RawFrame>,
        drain: Receiver<RawFrame>,
        counters: Arc<SinkCounters>,
        on_event: EventHook,
    ) -> Self {
        Self {
            frames,
            drain,
            counters,
            on_event,
        }
    }

    /// Sink that discards everything, for sources driven outside a session.
    pub fn detached() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self::new(tx, rx, Arc::default(), Arc::new(|_| {}))
    }

    pub fn push_video(&self, frame: VideoFrame) {
        self.push(RawFrame::Video(frame));
    }

    pub fn push_audio(&self, frame: AudioFrame) {
        self.push(RawFrame::Audio(frame));
    }

    pub fn push(&self, frame: RawFrame) {
        self.counters.captured.fetch_add(1, Ordering::Relaxed);
        let mut frame = frame;
        loop {
            match self.frames.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.drain.try_recv().is_ok() {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    frame = returned;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn device_started(&self, kind: DeviceKind) {
        (self.on_event)(CaptureEvent::DeviceStarted(kind));
    }

    pub fn device_lost(&self, kind: DeviceKind, reason: impl Into<String>) {
        (self.on_event)(CaptureEvent::DeviceLost {
            kind,
            reason: reason.into(),
        });
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}
