//! Shared mocks for session integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use crabstream::encoder::PassthroughEncoder;
use crabstream::events::is_callback_context;
use crabstream::testing::StaticAuthorization;
use crabstream::types::{PixelFormat, VideoFrame};
use crabstream::{
    AuthorizationGate, CaptureDevicePosition, CaptureSettings, CaptureSink, CaptureSource,
    DeviceKind, EncodedPacket, EncoderFactory, LinkSink, LinkStatus, MediaEncoder, Publisher,
    SessionDelegate, SessionEvent, Stream, StreamState, StreamingConfiguration, StreamingError,
    StreamingSession, Subsystems, VideoOrientation,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

pub const PUSH_URL: &str = "rtmp://host/app/key";

#[derive(Default)]
pub struct MockCapture {
    pub positions: Mutex<Vec<CaptureDevicePosition>>,
    pub start_calls: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub switches: AtomicUsize,
    pub applied: Mutex<Vec<CaptureSettings>>,
    pub fail_start: AtomicBool,
    pub gate: Mutex<Option<Arc<Semaphore>>>,
    running: AtomicBool,
    sink: Mutex<Option<CaptureSink>>,
    /// Every sink handed to `start`, stopped runs included.
    runs: Mutex<Vec<CaptureSink>>,
    sequence: AtomicUsize,
}

impl MockCapture {
    pub fn new(positions: Vec<CaptureDevicePosition>) -> Self {
        Self {
            positions: Mutex::new(positions),
            ..Self::default()
        }
    }

    /// Hold `start` until permits are added to the returned semaphore.
    pub fn gated(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Push one 4x2 RGB frame through the sink of the running capture.
    pub fn push_frame(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) as u64;
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.push_video(VideoFrame {
                sequence,
                timestamp_us: sequence * 33_000,
                width: 4,
                height: 2,
                format: PixelFormat::Rgb8,
                data: vec![200; 4 * 2 * 3],
            });
        }
    }

    pub fn lose_device(&self, kind: DeviceKind) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.device_lost(kind, "unplugged");
        }
    }

    /// Report device loss through the sink of an earlier run.
    pub fn lose_device_in_run(&self, run: usize, kind: DeviceKind) {
        let sink = self.runs.lock().unwrap()[run].clone();
        sink.device_lost(kind, "late report");
    }
}

#[async_trait]
impl CaptureSource for MockCapture {
    fn available_positions(&self) -> Vec<CaptureDevicePosition> {
        self.positions.lock().unwrap().clone()
    }

    async fn start(
        &self,
        _settings: CaptureSettings,
        sink: CaptureSink,
    ) -> Result<(), StreamingError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(StreamingError::CaptureStartFailure("mock".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        sink.device_started(DeviceKind::Camera);
        sink.device_started(DeviceKind::Microphone);
        self.runs.lock().unwrap().push(sink.clone());
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.sink.lock().unwrap().take();
    }

    fn apply_settings(&self, settings: &CaptureSettings) -> Result<(), StreamingError> {
        self.applied.lock().unwrap().push(settings.clone());
        Ok(())
    }

    async fn switch_camera(
        &self,
        _position: CaptureDevicePosition,
    ) -> Result<(), StreamingError> {
        self.switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockEncoderFactory {
    pub creates: AtomicUsize,
    pub fail: AtomicBool,
    pub last_config: Mutex<Option<StreamingConfiguration>>,
}

impl EncoderFactory for MockEncoderFactory {
    fn create(
        &self,
        config: &StreamingConfiguration,
    ) -> Result<Box<dyn MediaEncoder>, StreamingError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(StreamingError::EncodeInitFailure("mock".to_string()));
        }
        Ok(Box::new(PassthroughEncoder::new(config)))
    }
}

#[derive(Default)]
pub struct MockPublisher {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Number of upcoming connects that fail.
    pub failures: AtomicUsize,
    /// Report `Lost` on the link as soon as connect is called.
    pub lose_on_connect: AtomicBool,
    pub gate: Mutex<Option<Arc<Semaphore>>>,
    pub urls: Mutex<Vec<Url>>,
    pub packets: Mutex<Vec<EncodedPacket>>,
    connected: AtomicBool,
    link: Mutex<Option<LinkSink>>,
}

impl MockPublisher {
    pub fn gated(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        self.urls.lock().unwrap().last().map(|u| u.to_string())
    }

    pub fn report(&self, status: LinkStatus) {
        if let Some(link) = self.link.lock().unwrap().as_ref() {
            link.report(status);
        }
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn connect(&self, url: &Url, link: LinkSink) -> Result<(), StreamingError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        if self.lose_on_connect.load(Ordering::SeqCst) {
            link.report(LinkStatus::Lost("connection refused".to_string()));
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StreamingError::NetworkConnectFailure("refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        *self.link.lock().unwrap() = Some(link);
        Ok(())
    }

    fn publish(&self, packet: EncodedPacket) {
        self.packets.lock().unwrap().push(packet);
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Records every event and whether it arrived on the callback thread.
#[derive(Default)]
pub struct RecordingDelegate {
    pub events: Mutex<Vec<SessionEvent>>,
    pub off_thread: AtomicUsize,
}

impl RecordingDelegate {
    pub fn states(&self) -> Vec<StreamState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StreamStateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &SessionEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == event)
            .count()
    }
}

impl SessionDelegate for RecordingDelegate {
    fn handle_event(&self, event: &SessionEvent) {
        if !is_callback_context() {
            self.off_thread.fetch_add(1, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Completion handler that records outcomes.
#[derive(Clone, Default)]
pub struct Completions(pub Arc<Mutex<Vec<bool>>>);

impl Completions {
    pub fn handler(&self) -> impl FnOnce(bool) + Send + 'static {
        let seen = self.0.clone();
        move |ok| seen.lock().unwrap().push(ok)
    }

    pub fn get(&self) -> Vec<bool> {
        self.0.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub capture: Arc<MockCapture>,
    pub encoder: Arc<MockEncoderFactory>,
    pub publisher: Arc<MockPublisher>,
    pub authorization: Arc<StaticAuthorization>,
    pub gate: Arc<AuthorizationGate>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            vec![CaptureDevicePosition::Back, CaptureDevicePosition::Front],
            StaticAuthorization::granted(),
        )
    }

    pub fn with(positions: Vec<CaptureDevicePosition>, authorization: StaticAuthorization) -> Self {
        let authorization = Arc::new(authorization);
        Self {
            capture: Arc::new(MockCapture::new(positions)),
            encoder: Arc::new(MockEncoderFactory::default()),
            publisher: Arc::new(MockPublisher::default()),
            gate: AuthorizationGate::new(authorization.clone()),
            authorization,
        }
    }

    pub fn subsystems(&self) -> Subsystems {
        Subsystems {
            capture: self.capture.clone(),
            encoder: self.encoder.clone(),
            publisher: self.publisher.clone(),
            authorization: self.gate.clone(),
        }
    }

    pub fn session(&self) -> StreamingSession {
        StreamingSession::create(
            StreamingConfiguration::default(),
            Stream::new(PUSH_URL).unwrap(),
            VideoOrientation::Portrait,
            self.subsystems(),
        )
        .unwrap_or_else(|e| panic!("session creation failed: {e}"))
    }

    /// Session with a recording delegate attached. Keep the delegate alive.
    pub fn recorded_session(&self) -> (StreamingSession, Arc<RecordingDelegate>) {
        let session = self.session();
        let recorder = Arc::new(RecordingDelegate::default());
        let delegate: Arc<dyn SessionDelegate> = recorder.clone();
        session.set_delegate(Arc::downgrade(&delegate));
        (session, recorder)
    }
}

/// Poll `condition` for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
