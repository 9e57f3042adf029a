//! The streaming session.
//!
//! A session is a handle to one actor task. Every public operation is turned
//! into a [`Command`] and every subsystem report (start step results, link
//! status, capture device events, authorization changes) into an internal
//! message; the actor handles them one at a time, which makes it the single
//! owner of the stream state and of subsystem lifetimes.
//!
//! Start steps that may take unbounded time (authorization prompts, capture
//! start, network connect) run as separate tasks and report back to the
//! actor. A `stop` that arrives while such a step is in flight moves the
//! session to `Disconnected` immediately; the partial setup is unwound as soon
//! as the step returns.

use crate::capture::{CaptureEvent, CaptureSettings, CaptureSink, CaptureSource};
use crate::config::StreamingConfiguration;
use crate::encoder::{EncoderFactory, MediaEncoder, PassthroughEncoderFactory};
use crate::errors::StreamingError;
use crate::events::{CallbackDispatcher, SessionDelegate, SessionEvent};
use crate::permissions::{AuthorizationChange, AuthorizationGate, AuthorizationStatus};
use crate::pipeline::FramePipeline;
use crate::publisher::{BufferedPublisher, LinkSink, LinkStatus, Publisher};
use crate::stream::Stream;
use crate::types::{
    CaptureDevicePosition, DeviceKind, FocusPoint, PreviewSize, StreamState, VideoOrientation,
};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use url::Url;
use uuid::Uuid;

type Completion = Box<dyn FnOnce(bool) + Send>;
type ImageCompletion = Box<dyn FnOnce(Option<RgbImage>) + Send>;

/// The collaborators a session drives.
#[derive(Clone)]
pub struct Subsystems {
    pub capture: Arc<dyn CaptureSource>,
    pub encoder: Arc<dyn EncoderFactory>,
    pub publisher: Arc<dyn Publisher>,
    pub authorization: Arc<AuthorizationGate>,
}

impl Subsystems {
    /// Passthrough encoding and a TCP publisher around `capture`.
    pub fn with_capture(
        capture: Arc<dyn CaptureSource>,
        authorization: Arc<AuthorizationGate>,
        configuration: &StreamingConfiguration,
    ) -> Self {
        Self {
            capture,
            encoder: Arc::new(PassthroughEncoderFactory),
            publisher: Arc::new(BufferedPublisher::tcp(configuration)),
            authorization,
        }
    }
}

/// Point-in-time counters for a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub state: StreamState,
    pub frames_captured: u64,
    /// Frames dropped because the encoder fell behind.
    pub frames_dropped: u64,
    pub packets_published: u64,
    pub encode_errors: u64,
    pub degraded_link_reports: u64,
    pub connected_since: Option<DateTime<Utc>>,
}

/// What a start attempt captures by value at the moment `start` is called.
#[derive(Clone)]
struct StartSnapshot {
    configuration: StreamingConfiguration,
    stream: Stream,
    host: Option<String>,
}

struct Pending {
    snapshot: StartSnapshot,
    /// Set by the actor while an attempt owns the destination.
    locked: bool,
}

struct Shared {
    tag: String,
    pending: Mutex<Pending>,
    settings: RwLock<CaptureSettings>,
    idle_timer_disabled: AtomicBool,
    push_url: Mutex<Option<Url>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    degraded_reports: AtomicU64,
    destroyed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> CaptureSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

enum Command {
    Start {
        completion: Completion,
        snapshot: Result<StartSnapshot, StreamingError>,
    },
    Stop,
    Destroy,
    StartCapture,
    StopCapture,
    /// `None` toggles to the opposite camera.
    SwitchCamera(Option<CaptureDevicePosition>),
    ApplySettings,
    CaptureImage(ImageCompletion),
    Settle(oneshot::Sender<()>),
}

enum Step {
    Authorized,
    CaptureStarted,
    Connected,
}

enum Internal {
    StepDone {
        attempt: u64,
        outcome: Result<Step, StreamingError>,
    },
    Link {
        attempt: u64,
        status: LinkStatus,
    },
    Capture {
        generation: u64,
        event: CaptureEvent,
    },
}

/// A live-streaming session: camera and microphone in, encoded stream out.
///
/// Must be created inside a tokio runtime. All events and completion
/// handlers are delivered on one dedicated callback thread, in order.
pub struct StreamingSession {
    id: Uuid,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<StreamState>,
    dispatcher: Arc<CallbackDispatcher>,
    pipeline: Arc<FramePipeline>,
    authorization: Arc<AuthorizationGate>,
}

impl StreamingSession {
    /// Create a session. Fails with `DeviceUnavailable` when the capture
    /// source has neither a front nor a back camera.
    pub fn create(
        configuration: StreamingConfiguration,
        stream: Stream,
        orientation: VideoOrientation,
        subsystems: Subsystems,
    ) -> Result<Self, StreamingError> {
        configuration.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StreamingError::Runtime(e.to_string()))?;

        let positions = subsystems.capture.available_positions();
        if positions.is_empty() {
            log::error!("No capture device available, refusing to create session");
            return Err(StreamingError::DeviceUnavailable);
        }

        let mut settings = CaptureSettings {
            orientation,
            ..CaptureSettings::default()
        };
        if !positions.contains(&settings.position) {
            settings.position = settings.position.opposite();
        }

        let dispatcher = Arc::new(
            CallbackDispatcher::new().map_err(|e| StreamingError::Runtime(e.to_string()))?,
        );
        let pipeline = Arc::new(
            FramePipeline::start(configuration.session.frame_queue_capacity)
                .map_err(|e| StreamingError::Runtime(e.to_string()))?,
        );

        let id = Uuid::new_v4();
        let tag = id.simple().to_string()[..8].to_string();
        log::info!(
            "[{}] Session created for {} ({}x{}@{})",
            tag,
            stream.publish_url(),
            configuration.video.width,
            configuration.video.height,
            configuration.video.fps
        );

        let shared = Arc::new(Shared {
            tag,
            pending: Mutex::new(Pending {
                snapshot: StartSnapshot {
                    configuration,
                    stream,
                    host: None,
                },
                locked: false,
            }),
            settings: RwLock::new(settings),
            idle_timer_disabled: AtomicBool::new(true),
            push_url: Mutex::new(None),
            connected_since: Mutex::new(None),
            degraded_reports: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });

        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let authorization = subsystems.authorization.clone();
        let changes = authorization.subscribe();

        let actor = Actor {
            shared: shared.clone(),
            state: state_tx,
            dispatcher: dispatcher.clone(),
            pipeline: pipeline.clone(),
            subsystems,
            internal,
            attempt: None,
            queued: None,
            next_attempt: 0,
            capture_running: false,
            capture_generation: 0,
            host_capture: false,
            destroyed: false,
            released: false,
            settle_waiters: Vec::new(),
        };
        runtime.spawn(actor.run(commands_rx, internal_rx, changes));

        Ok(Self {
            id,
            shared,
            commands,
            state: state_rx,
            dispatcher,
            pipeline,
            authorization,
        })
    }

    /// Legacy constructor taking an explicit publish host.
    #[deprecated(note = "use `create` followed by `set_rtmp_publish_host`")]
    pub fn create_with_host(
        configuration: StreamingConfiguration,
        stream: Stream,
        rtmp_publish_host: &str,
        orientation: VideoOrientation,
        subsystems: Subsystems,
    ) -> Result<Self, StreamingError> {
        let session = Self::create(configuration, stream, orientation, subsystems)?;
        session.set_rtmp_publish_host(Some(rtmp_publish_host.to_string()))?;
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("[{}] Session actor is gone", self.shared.tag);
        }
    }

    /// The delegate is held weakly.
    pub fn set_delegate(&self, delegate: Weak<dyn SessionDelegate>) {
        self.dispatcher.set_delegate(Some(delegate));
    }

    pub fn clear_delegate(&self) {
        self.dispatcher.set_delegate(None);
    }

    /// Receive every event the delegate receives.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.dispatcher.subscribe()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Start streaming. `completion` runs on the callback thread with the
    /// outcome of this attempt. When a start is already connecting or
    /// connected the call is a no-op and `completion` is never invoked.
    pub fn start(&self, completion: impl FnOnce(bool) + Send + 'static) {
        let snapshot = self.shared.pending().snapshot.clone();
        self.send_start(Box::new(completion), Ok(snapshot));
    }

    /// A snapshot that failed to build still goes through the actor, so the
    /// caller sees the same `Connecting -> Error` as any other failed start.
    fn send_start(&self, completion: Completion, snapshot: Result<StartSnapshot, StreamingError>) {
        if self.is_destroyed() {
            log::debug!("[{}] Start ignored on destroyed session", self.shared.tag);
            return;
        }
        self.send(Command::Start {
            completion,
            snapshot,
        });
    }

    /// `start` as a future. Resolves to `false` when the attempt failed or
    /// the call was a no-op.
    pub async fn start_async(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.start(move |ok| {
            let _ = tx.send(ok);
        });
        rx.await.unwrap_or(false)
    }

    /// Legacy start taking a raw push URL instead of a stream/host pair.
    #[deprecated(note = "use `set_stream` and `start`")]
    pub fn start_with_push_url(
        &self,
        push_url: &str,
        completion: impl FnOnce(bool) + Send + 'static,
    ) {
        let snapshot = Stream::new(push_url).and_then(|stream| {
            let mut pending = self.shared.pending();
            if pending.locked {
                return Err(StreamingError::StreamLocked);
            }
            pending.snapshot.stream = stream;
            pending.snapshot.host = None;
            Ok(pending.snapshot.clone())
        });

        match snapshot {
            Err(StreamingError::StreamLocked) => {
                log::debug!("[{}] Start ignored while streaming", self.shared.tag);
            }
            snapshot => self.send_start(Box::new(completion), snapshot),
        }
    }

    /// Stop streaming. A no-op before the first start.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Stop and release every subsystem. Later operations are ignored.
    pub fn destroy(&self) {
        if !self.shared.destroyed.swap(true, Ordering::AcqRel) {
            self.send(Command::Destroy);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<(), StreamingError> {
        if self.is_destroyed() {
            return Err(StreamingError::SessionDestroyed);
        }
        Ok(())
    }

    /// Resolves once every previously issued operation has been handled, no
    /// start step is in flight, and all resulting callbacks have run.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Settle(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    // ---- state -----------------------------------------------------------

    pub fn stream_state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Watch the stream state.
    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.stream_state() == StreamState::Connected
    }

    /// URL of the current or last start attempt.
    pub fn push_url(&self) -> Option<Url> {
        self.shared
            .push_url
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.stream_state(),
            frames_captured: self.pipeline.frames_captured(),
            frames_dropped: self.pipeline.frames_dropped(),
            packets_published: self.pipeline.packets_published(),
            encode_errors: self.pipeline.encode_errors(),
            degraded_link_reports: self.shared.degraded_reports.load(Ordering::Relaxed),
            connected_since: *self
                .shared
                .connected_since
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    // ---- destination and configuration -----------------------------------

    pub fn configuration(&self) -> StreamingConfiguration {
        self.shared.pending().snapshot.configuration.clone()
    }

    /// Takes effect on the next start; a running attempt keeps its snapshot.
    /// Fails with `SessionDestroyed` after `destroy`.
    pub fn set_configuration(
        &self,
        configuration: StreamingConfiguration,
    ) -> Result<(), StreamingError> {
        self.ensure_alive()?;
        configuration.validate()?;
        self.shared.pending().snapshot.configuration = configuration;
        Ok(())
    }

    pub fn stream(&self) -> Stream {
        self.shared.pending().snapshot.stream.clone()
    }

    /// Rejected with `StreamLocked` while a start attempt is in flight and
    /// with `SessionDestroyed` after `destroy`.
    pub fn set_stream(&self, stream: Stream) -> Result<(), StreamingError> {
        self.ensure_alive()?;
        let mut pending = self.shared.pending();
        if pending.locked {
            return Err(StreamingError::StreamLocked);
        }
        pending.snapshot.stream = stream;
        Ok(())
    }

    pub fn rtmp_publish_host(&self) -> Option<String> {
        self.shared.pending().snapshot.host.clone()
    }

    /// Replace the host of the stream's publish URL. `None` clears it.
    /// Rejected with `StreamLocked` while a start attempt is in flight and
    /// with `SessionDestroyed` after `destroy`.
    pub fn set_rtmp_publish_host(&self, host: Option<String>) -> Result<(), StreamingError> {
        self.ensure_alive()?;
        let mut pending = self.shared.pending();
        if pending.locked {
            return Err(StreamingError::StreamLocked);
        }
        pending.snapshot.stream.push_url(host.as_deref())?;
        pending.snapshot.host = host;
        Ok(())
    }

    // ---- capture ---------------------------------------------------------

    /// Start the camera without streaming. Stopping the stream leaves a
    /// capture session started this way running.
    pub fn start_capture_session(&self) {
        self.send(Command::StartCapture);
    }

    /// Stop a capture session started with `start_capture_session`. Capture
    /// keeps running while a stream still needs it.
    pub fn stop_capture_session(&self) {
        self.send(Command::StopCapture);
    }

    /// Switch between front and back cameras. Emits
    /// `SessionEvent::CameraToggleFailed` when only one camera exists.
    pub fn toggle_camera(&self) {
        self.send(Command::SwitchCamera(None));
    }

    /// Decode the next live video frame. `completion` gets `None` when
    /// capture is not running.
    pub fn request_capture_image(
        &self,
        completion: impl FnOnce(Option<RgbImage>) + Send + 'static,
    ) {
        if self.is_destroyed() {
            self.dispatcher.run(move || completion(None));
            return;
        }
        self.send(Command::CaptureImage(Box::new(completion)));
    }

    pub async fn capture_image(&self) -> Option<RgbImage> {
        let (tx, rx) = oneshot::channel();
        self.request_capture_image(move |image| {
            let _ = tx.send(image);
        });
        rx.await.ok().flatten()
    }

    /// Still images are only available through `request_capture_image`.
    #[deprecated(note = "use `request_capture_image`")]
    pub fn still_capture_image(&self) -> Option<RgbImage> {
        None
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        self.shared.settings()
    }

    fn update_settings(&self, update: impl FnOnce(&mut CaptureSettings)) {
        update(
            &mut self
                .shared
                .settings
                .write()
                .unwrap_or_else(|e| e.into_inner()),
        );
        self.send(Command::ApplySettings);
    }

    pub fn capture_device_position(&self) -> CaptureDevicePosition {
        self.shared.settings().position
    }

    /// Applied by the session, which may have to switch devices.
    pub fn set_capture_device_position(&self, position: CaptureDevicePosition) {
        self.send(Command::SwitchCamera(Some(position)));
    }

    pub fn video_orientation(&self) -> VideoOrientation {
        self.shared.settings().orientation
    }

    pub fn set_video_orientation(&self, orientation: VideoOrientation) {
        self.update_settings(|s| s.orientation = orientation);
    }

    pub fn torch_on(&self) -> bool {
        self.shared.settings().torch_on
    }

    pub fn set_torch_on(&self, on: bool) {
        self.update_settings(|s| s.torch_on = on);
    }

    pub fn focus_point_of_interest(&self) -> FocusPoint {
        self.shared.settings().focus_point
    }

    /// Clamped to the unit square.
    pub fn set_focus_point_of_interest(&self, x: f32, y: f32) {
        self.update_settings(|s| s.focus_point = FocusPoint::new(x, y));
    }

    pub fn continuous_autofocus(&self) -> bool {
        self.shared.settings().continuous_autofocus
    }

    pub fn set_continuous_autofocus(&self, enabled: bool) {
        self.update_settings(|s| s.continuous_autofocus = enabled);
    }

    pub fn touch_to_focus_enabled(&self) -> bool {
        self.shared.settings().touch_to_focus
    }

    pub fn set_touch_to_focus_enabled(&self, enabled: bool) {
        self.update_settings(|s| s.touch_to_focus = enabled);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.settings().muted
    }

    pub fn set_muted(&self, muted: bool) {
        self.update_settings(|s| s.muted = muted);
    }

    pub fn preview_size(&self) -> PreviewSize {
        self.shared.settings().preview_size
    }

    /// Preview only; the encoded size comes from the configuration.
    pub fn set_preview_size(&self, size: PreviewSize) {
        self.update_settings(|s| s.preview_size = size);
    }

    pub fn idle_timer_disabled(&self) -> bool {
        self.shared.idle_timer_disabled.load(Ordering::Relaxed)
    }

    pub fn set_idle_timer_disabled(&self, disabled: bool) {
        self.shared
            .idle_timer_disabled
            .store(disabled, Ordering::Relaxed);
    }

    // ---- authorization ---------------------------------------------------

    pub fn authorization_gate(&self) -> &Arc<AuthorizationGate> {
        &self.authorization
    }

    pub fn authorization_status(&self, kind: DeviceKind) -> AuthorizationStatus {
        self.authorization.query_status(kind)
    }

    pub async fn request_authorization(&self, kind: DeviceKind) -> AuthorizationStatus {
        self.authorization.request_access(kind).await
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if !self.shared.destroyed.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Destroy);
        }
    }
}

struct Attempt {
    id: u64,
    configuration: StreamingConfiguration,
    url: Url,
    completion: Option<Completion>,
    encoder: Option<Box<dyn MediaEncoder>>,
    attached: bool,
    in_flight: bool,
    connected: bool,
    /// Finished for the caller; torn down once the in-flight step returns.
    cancelled: bool,
    device_lost: bool,
}

struct Actor {
    shared: Arc<Shared>,
    state: watch::Sender<StreamState>,
    dispatcher: Arc<CallbackDispatcher>,
    pipeline: Arc<FramePipeline>,
    subsystems: Subsystems,
    internal: mpsc::UnboundedSender<Internal>,
    attempt: Option<Attempt>,
    /// A start that arrived while a cancelled attempt was still unwinding.
    queued: Option<(Completion, Result<StartSnapshot, StreamingError>)>,
    next_attempt: u64,
    capture_running: bool,
    /// Bumped on every capture start and stop; events from older runs are
    /// dropped.
    capture_generation: u64,
    /// The host asked for capture through `start_capture_session`.
    host_capture: bool,
    destroyed: bool,
    released: bool,
    settle_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut changes: broadcast::Receiver<AuthorizationChange>,
    ) {
        let mut commands_open = true;
        let mut changes_open = true;

        loop {
            if !commands_open && self.attempt.is_none() {
                break;
            }

            tokio::select! {
                biased;
                Some(message) = internal.recv() => self.handle_internal(message).await,
                change = changes.recv(), if changes_open => match change {
                    Ok(change) => self.authorization_changed(change),
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("[{}] Missed {} authorization changes", self.tag(), missed);
                    }
                    Err(RecvError::Closed) => changes_open = false,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        commands_open = false;
                        self.destroy().await;
                    }
                },
            }

            self.release_settled(&mut changes);
        }

        log::debug!("[{}] Session actor finished", self.tag());
    }

    fn tag(&self) -> &str {
        &self.shared.tag
    }

    fn current_state(&self) -> StreamState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: StreamState) {
        let current = self.current_state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            log::error!("[{}] Refusing transition {} -> {}", self.tag(), current, next);
            return;
        }

        log::info!("[{}] Stream state {} -> {}", self.tag(), current, next);
        *self
            .shared
            .connected_since
            .lock()
            .unwrap_or_else(|e| e.into_inner()) =
            (next == StreamState::Connected).then(Utc::now);
        self.state.send_replace(next);
        self.dispatcher.emit(SessionEvent::StreamStateChanged(next));
    }

    fn complete(&self, completion: Completion, ok: bool) {
        self.dispatcher.run(move || completion(ok));
    }

    fn lock_destination(&self, locked: bool) {
        self.shared.pending().locked = locked;
    }

    fn capture_sink(&mut self) -> CaptureSink {
        self.capture_generation += 1;
        let generation = self.capture_generation;
        let internal = self.internal.clone();
        self.pipeline.sink(move |event| {
            let _ = internal.send(Internal::Capture { generation, event });
        })
    }

    fn link_sink(&self, attempt: u64) -> LinkSink {
        let internal = self.internal.clone();
        LinkSink::new(move |status| {
            let _ = internal.send(Internal::Link { attempt, status });
        })
    }

    fn step_in_flight(&self) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.in_flight)
    }

    /// Settle waiters are released only when nothing is in flight.
    fn release_settled(&mut self, changes: &mut broadcast::Receiver<AuthorizationChange>) {
        if self.settle_waiters.is_empty() || self.step_in_flight() {
            return;
        }
        while let Ok(change) = changes.try_recv() {
            self.authorization_changed(change);
        }
        for ack in self.settle_waiters.drain(..) {
            self.dispatcher.barrier(ack);
        }
    }

    fn authorization_changed(&self, change: AuthorizationChange) {
        if self.destroyed {
            return;
        }
        self.dispatcher
            .emit(SessionEvent::authorization(change.kind, change.status));
    }

    async fn handle_command(&mut self, command: Command) {
        if self.destroyed {
            match command {
                Command::CaptureImage(completion) => self.dispatcher.run(move || completion(None)),
                Command::Settle(ack) => self.settle_waiters.push(ack),
                _ => log::debug!("[{}] Ignoring command on destroyed session", self.tag()),
            }
            return;
        }

        match command {
            Command::Start {
                completion,
                snapshot,
            } => self.start(completion, snapshot),
            Command::Stop => self.stop().await,
            Command::Destroy => self.destroy().await,
            Command::StartCapture => self.start_capture_session().await,
            Command::StopCapture => self.stop_capture_session().await,
            Command::SwitchCamera(target) => self.switch_camera(target).await,
            Command::ApplySettings => self.apply_settings(),
            Command::CaptureImage(completion) => self.capture_image(completion),
            Command::Settle(ack) => self.settle_waiters.push(ack),
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::StepDone { attempt, outcome } => self.step_done(attempt, outcome).await,
            Internal::Link { attempt, status } => self.link_status(attempt, status).await,
            Internal::Capture { generation, event } => {
                self.capture_event(generation, event).await
            }
        }
    }

    // ---- start sequence --------------------------------------------------

    fn start(&mut self, completion: Completion, snapshot: Result<StartSnapshot, StreamingError>) {
        let state = self.current_state();
        if state.is_active() {
            log::debug!("[{}] Start ignored while {}", self.tag(), state);
            return;
        }
        if self.attempt.is_some() {
            log::debug!("[{}] Start queued behind unwinding attempt", self.tag());
            self.set_state(StreamState::Connecting);
            self.queued = Some((completion, snapshot));
            return;
        }
        self.begin(completion, snapshot);
    }

    fn begin(&mut self, completion: Completion, snapshot: Result<StartSnapshot, StreamingError>) {
        self.set_state(StreamState::Connecting);
        self.lock_destination(true);

        let resolved = snapshot.and_then(|snapshot| {
            let url = snapshot.stream.push_url(snapshot.host.as_deref())?;
            Ok((snapshot.configuration, url))
        });
        let (configuration, url) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                log::error!("[{}] Cannot resolve push URL: {}", self.tag(), e);
                self.set_state(StreamState::Error);
                self.complete(completion, false);
                self.lock_destination(false);
                return;
            }
        };
        *self
            .shared
            .push_url
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(url.clone());

        self.next_attempt += 1;
        log::info!(
            "[{}] Start attempt {} to {}",
            self.tag(),
            self.next_attempt,
            url
        );
        self.attempt = Some(Attempt {
            id: self.next_attempt,
            configuration,
            url,
            completion: Some(completion),
            encoder: None,
            attached: false,
            in_flight: false,
            connected: false,
            cancelled: false,
            device_lost: false,
        });
        self.authorize();
    }

    /// Statuses already known are reported right away; undetermined ones are
    /// requested and reported through the gate's change feed. A denial does
    /// not abort the start.
    fn authorize(&mut self) {
        let gate = self.subsystems.authorization.clone();
        for kind in [DeviceKind::Camera, DeviceKind::Microphone] {
            let status = gate.query_status(kind);
            match status {
                AuthorizationStatus::NotDetermined => {}
                AuthorizationStatus::Denied => {
                    log::warn!(
                        "[{}] {}, continuing",
                        self.tag(),
                        StreamingError::AuthorizationDenied(kind)
                    );
                    self.dispatcher.emit(SessionEvent::authorization(kind, status));
                }
                AuthorizationStatus::Authorized => {
                    self.dispatcher.emit(SessionEvent::authorization(kind, status));
                }
            }
        }

        self.spawn_step(async move {
            tokio::join!(
                gate.request_access(DeviceKind::Camera),
                gate.request_access(DeviceKind::Microphone)
            );
            Ok(Step::Authorized)
        });
    }

    fn spawn_step<F>(&mut self, step: F)
    where
        F: Future<Output = Result<Step, StreamingError>> + Send + 'static,
    {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.in_flight = true;
        let id = attempt.id;
        let internal = self.internal.clone();

        tokio::spawn(async move {
            let outcome = match tokio::spawn(step).await {
                Ok(outcome) => outcome,
                Err(e) => Err(StreamingError::Runtime(format!("start step aborted: {e}"))),
            };
            let _ = internal.send(Internal::StepDone {
                attempt: id,
                outcome,
            });
        });
    }

    async fn step_done(&mut self, id: u64, outcome: Result<Step, StreamingError>) {
        let Some(attempt) = self.attempt.as_mut().filter(|a| a.id == id) else {
            log::debug!("[{}] Stale step result for attempt {}", self.tag(), id);
            return;
        };
        attempt.in_flight = false;
        let (cancelled, device_lost) = (attempt.cancelled, attempt.device_lost);

        if matches!(outcome, Ok(Step::CaptureStarted)) {
            self.capture_running = true;
        }

        if cancelled {
            self.unwind().await;
            return;
        }
        if device_lost {
            self.fail_start(StreamingError::CaptureStartFailure(
                "capture device lost during start".to_string(),
            ))
            .await;
            return;
        }

        match outcome {
            Ok(Step::Authorized) => self.start_capture().await,
            Ok(Step::CaptureStarted) => self.connect().await,
            Ok(Step::Connected) => self.go_live(),
            Err(e) => self.fail_start(e).await,
        }
    }

    async fn start_capture(&mut self) {
        if self.capture_running {
            log::debug!("[{}] Reusing running capture session", self.tag());
            self.connect().await;
            return;
        }

        let capture = self.subsystems.capture.clone();
        let settings = self.shared.settings();
        let sink = self.capture_sink();
        self.spawn_step(async move {
            capture
                .start(settings, sink)
                .await
                .map(|()| Step::CaptureStarted)
        });
    }

    async fn connect(&mut self) {
        let Some(attempt) = self.attempt.as_ref() else {
            return;
        };
        let encoder = self.subsystems.encoder.create(&attempt.configuration);
        let url = attempt.url.clone();
        let timeout = attempt.configuration.connect_timeout();
        let link = self.link_sink(attempt.id);

        let encoder = match encoder {
            Ok(encoder) => encoder,
            Err(e) => {
                self.fail_start(e).await;
                return;
            }
        };
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.encoder = Some(encoder);
        }

        let publisher = self.subsystems.publisher.clone();
        self.spawn_step(async move {
            match tokio::time::timeout(timeout, publisher.connect(&url, link)).await {
                Ok(result) => result.map(|()| Step::Connected),
                Err(_) => Err(StreamingError::NetworkConnectFailure(format!(
                    "connect to {url} timed out after {timeout:?}"
                ))),
            }
        });
    }

    fn go_live(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if let Some(encoder) = attempt.encoder.take() {
            self.pipeline
                .attach(encoder, self.subsystems.publisher.clone());
            attempt.attached = true;
        }
        attempt.connected = true;
        let completion = attempt.completion.take();

        self.set_state(StreamState::Connected);
        if let Some(completion) = completion {
            self.complete(completion, true);
        }
    }

    async fn fail_start(&mut self, error: StreamingError) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        log::error!(
            "[{}] Start attempt {} failed: {}",
            self.tag(),
            attempt.id,
            error
        );
        let completion = attempt.completion.take();
        self.teardown(attempt).await;
        self.set_state(StreamState::Error);
        if let Some(completion) = completion {
            self.complete(completion, false);
        }
        self.finish().await;
    }

    // ---- teardown --------------------------------------------------------

    /// Detach, close the publisher, drop the encoder, stop capture.
    async fn teardown(&mut self, attempt: Attempt) {
        log::debug!("[{}] Tearing down attempt {}", self.tag(), attempt.id);
        if attempt.attached {
            self.pipeline.detach().await;
        }
        self.subsystems.publisher.close().await;
        drop(attempt);

        if self.host_capture {
            log::debug!("[{}] Leaving host capture session running", self.tag());
        } else {
            self.subsystems.capture.stop().await;
            self.capture_stopped();
        }
    }

    fn capture_stopped(&mut self) {
        self.capture_running = false;
        self.capture_generation += 1;
        self.pipeline.cancel_snapshots();
    }

    /// A cancelled attempt whose last step has returned.
    async fn unwind(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        log::debug!("[{}] Unwinding cancelled attempt {}", self.tag(), attempt.id);
        self.teardown(attempt).await;
        self.finish().await;
    }

    /// Runs after an attempt is gone.
    async fn finish(&mut self) {
        if let Some((completion, snapshot)) = self.queued.take() {
            self.begin(completion, snapshot);
            return;
        }
        self.lock_destination(false);

        if self.destroyed {
            self.release().await;
        } else if self.host_capture && !self.capture_running {
            self.start_host_capture().await;
        }
    }

    async fn stop(&mut self) {
        if let Some((completion, _)) = self.queued.take() {
            log::info!("[{}] Dropping queued start", self.tag());
            self.set_state(StreamState::Disconnected);
            self.complete(completion, false);
            return;
        }

        let Some(attempt) = self.attempt.as_mut() else {
            log::debug!("[{}] Stop ignored while {}", self.tag(), self.current_state());
            return;
        };
        if attempt.cancelled {
            return;
        }

        if attempt.in_flight {
            attempt.cancelled = true;
            let completion = attempt.completion.take();
            let id = attempt.id;
            log::info!(
                "[{}] Stop during attempt {}, unwinding when its step returns",
                self.tag(),
                id
            );
            self.set_state(StreamState::Disconnected);
            if let Some(completion) = completion {
                self.complete(completion, false);
            }
            return;
        }

        if let Some(attempt) = self.attempt.take() {
            log::info!("[{}] Stopping stream", self.tag());
            self.teardown(attempt).await;
            self.set_state(StreamState::Disconnected);
            self.finish().await;
        }
    }

    async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        log::info!("[{}] Destroying session", self.tag());
        self.destroyed = true;
        self.shared.destroyed.store(true, Ordering::Release);
        self.stop().await;
        if self.attempt.is_none() {
            self.release().await;
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.host_capture = false;
        if self.capture_running {
            self.subsystems.capture.stop().await;
            self.capture_stopped();
        }
        self.pipeline.shutdown();
        log::info!("[{}] Session released", self.tag());
    }

    // ---- unsolicited failures --------------------------------------------

    /// One transition per physical failure: the attempt is taken on the first
    /// report, so later reports for the same attempt find nothing to fail.
    async fn fail_live(&mut self, next: StreamState) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        self.teardown(attempt).await;
        self.set_state(next);
        self.finish().await;
    }

    async fn link_status(&mut self, attempt: u64, status: LinkStatus) {
        match status {
            LinkStatus::Degraded { dropped } => {
                self.shared.degraded_reports.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[{}] Link degraded, {} packets dropped so far",
                    self.tag(),
                    dropped
                );
            }
            LinkStatus::Lost(reason) => {
                let Some(current) = self
                    .attempt
                    .as_ref()
                    .filter(|a| a.id == attempt && !a.cancelled)
                else {
                    log::debug!(
                        "[{}] Ignoring link loss for attempt {}: {}",
                        self.tag(),
                        attempt,
                        reason
                    );
                    return;
                };
                let error = if current.connected {
                    StreamingError::NetworkLinkLost(reason)
                } else {
                    StreamingError::NetworkConnectFailure(reason)
                };
                self.link_failed(error).await;
            }
        }
    }

    /// Link loss after connect ends the stream; before connect it fails the
    /// start like any other connect failure.
    async fn link_failed(&mut self, error: StreamingError) {
        if error.is_post_connect() {
            log::warn!("[{}] {}", self.tag(), error);
            self.fail_live(StreamState::Disconnected).await;
            return;
        }

        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if !attempt.in_flight {
            self.fail_start(error).await;
            return;
        }
        attempt.cancelled = true;
        let completion = attempt.completion.take();
        let id = attempt.id;
        log::error!(
            "[{}] Start attempt {} failed: {}, unwinding when connect returns",
            self.tag(),
            id,
            error
        );
        self.set_state(StreamState::Error);
        if let Some(completion) = completion {
            self.complete(completion, false);
        }
    }

    async fn capture_event(&mut self, generation: u64, event: CaptureEvent) {
        if generation != self.capture_generation {
            log::debug!(
                "[{}] Ignoring {:?} from stopped capture run {}",
                self.tag(),
                event,
                generation
            );
            return;
        }
        match event {
            CaptureEvent::DeviceStarted(kind) => {
                log::debug!("[{}] {} started", self.tag(), kind);
                self.dispatcher.emit(SessionEvent::DeviceStarted(kind));
            }
            CaptureEvent::DeviceLost { kind, reason } => {
                log::error!("[{}] {} lost: {}", self.tag(), kind, reason);
                match self.attempt.as_ref().map(|a| a.connected) {
                    Some(true) => self.fail_live(StreamState::Error).await,
                    Some(false) => {
                        if let Some(attempt) = self.attempt.as_mut() {
                            attempt.device_lost = true;
                        }
                    }
                    None => {
                        self.host_capture = false;
                        self.capture_stopped();
                    }
                }
            }
        }
    }

    // ---- capture controls ------------------------------------------------

    async fn start_host_capture(&mut self) {
        let sink = self.capture_sink();
        match self
            .subsystems
            .capture
            .start(self.shared.settings(), sink)
            .await
        {
            Ok(()) => {
                self.capture_running = true;
                log::info!("[{}] Capture session started", self.tag());
            }
            Err(e) => {
                self.host_capture = false;
                log::error!("[{}] Capture session failed to start: {}", self.tag(), e);
            }
        }
    }

    async fn start_capture_session(&mut self) {
        self.host_capture = true;
        if self.capture_running || self.attempt.is_some() {
            return;
        }
        self.start_host_capture().await;
    }

    async fn stop_capture_session(&mut self) {
        self.host_capture = false;
        if self.attempt.is_some() {
            log::debug!("[{}] Capture stays up for the stream", self.tag());
            return;
        }
        if self.capture_running {
            self.subsystems.capture.stop().await;
            self.capture_stopped();
            log::info!("[{}] Capture session stopped", self.tag());
        }
    }

    /// Switching may leave a short gap in the frame stream; the stream state
    /// does not change.
    async fn switch_camera(&mut self, target: Option<CaptureDevicePosition>) {
        let available = self.subsystems.capture.available_positions();
        let current = self.shared.settings().position;
        let toggling = target.is_none();
        let target = target.unwrap_or_else(|| current.opposite());

        if !available.contains(&target) || (toggling && available.len() < 2) {
            log::warn!("[{}] No {:?} camera to switch to", self.tag(), target);
            if toggling {
                self.dispatcher.emit(SessionEvent::CameraToggleFailed);
            }
            return;
        }
        if target == current {
            return;
        }

        if self.capture_running {
            if let Err(e) = self.subsystems.capture.switch_camera(target).await {
                log::warn!("[{}] Camera switch failed: {}", self.tag(), e);
                if toggling {
                    self.dispatcher.emit(SessionEvent::CameraToggleFailed);
                }
                return;
            }
        }

        self.shared
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .position = target;
        log::info!("[{}] Camera position now {:?}", self.tag(), target);
    }

    fn apply_settings(&self) {
        if !self.capture_running {
            return;
        }
        if let Err(e) = self
            .subsystems
            .capture
            .apply_settings(&self.shared.settings())
        {
            log::warn!("[{}] Capture rejected settings: {}", self.tag(), e);
        }
    }

    fn capture_image(&self, completion: ImageCompletion) {
        if !self.capture_running {
            self.dispatcher.run(move || completion(None));
            return;
        }
        let dispatcher = self.dispatcher.clone();
        self.pipeline.snapshot(Box::new(move |frame| {
            dispatcher.run(move || completion(frame.and_then(|f| f.to_rgb_image())));
        }));
    }
}
