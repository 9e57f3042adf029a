//! Session events and the callback context they are delivered on.
//!
//! Every event and every completion handler runs on one dedicated thread,
//! in the order the session produced them, so callers can touch UI state
//! from a handler without their own synchronization.

use crate::permissions::AuthorizationStatus;
use crate::types::{DeviceKind, StreamState};
use crossbeam_channel::{Receiver, Sender};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{broadcast, oneshot};

/// Name of the callback delivery thread.
pub const CALLBACK_THREAD_NAME: &str = "crabstream-callbacks";

thread_local! {
    static IN_CALLBACK_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// True when called from the callback delivery thread.
pub fn is_callback_context() -> bool {
    IN_CALLBACK_CONTEXT.with(Cell::get)
}

/// Everything a session reports to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StreamStateChanged(StreamState),
    CameraAuthorization(AuthorizationStatus),
    MicrophoneAuthorization(AuthorizationStatus),
    DeviceStarted(DeviceKind),
    /// `toggle_camera` found only one camera.
    CameraToggleFailed,
}

impl SessionEvent {
    pub fn authorization(kind: DeviceKind, status: AuthorizationStatus) -> Self {
        match kind {
            DeviceKind::Camera => SessionEvent::CameraAuthorization(status),
            DeviceKind::Microphone => SessionEvent::MicrophoneAuthorization(status),
        }
    }
}

/// Caller-side handlers. Implement only the ones you need.
pub trait SessionDelegate: Send + Sync {
    fn stream_state_did_change(&self, _state: StreamState) {}

    fn did_get_camera_authorization_status(&self, _status: AuthorizationStatus) {}

    fn did_get_microphone_authorization_status(&self, _status: AuthorizationStatus) {}

    fn capture_device_did_start(&self, _kind: DeviceKind) {}

    fn camera_toggle_failed(&self) {}

    /// Routes an event to the handlers above.
    fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::StreamStateChanged(state) => self.stream_state_did_change(*state),
            SessionEvent::CameraAuthorization(status) => {
                self.did_get_camera_authorization_status(*status)
            }
            SessionEvent::MicrophoneAuthorization(status) => {
                self.did_get_microphone_authorization_status(*status)
            }
            SessionEvent::DeviceStarted(kind) => self.capture_device_did_start(*kind),
            SessionEvent::CameraToggleFailed => self.camera_toggle_failed(),
        }
    }
}

pub(crate) enum Delivery {
    Event(SessionEvent),
    Task(Box<dyn FnOnce() + Send>),
    Barrier(oneshot::Sender<()>),
}

type DelegateSlot = Arc<RwLock<Option<Weak<dyn SessionDelegate>>>>;

/// Serial delivery of events and completions on [`CALLBACK_THREAD_NAME`].
pub struct CallbackDispatcher {
    tx: Sender<Delivery>,
    delegate: DelegateSlot,
    events: broadcast::Sender<SessionEvent>,
}

impl CallbackDispatcher {
    pub fn new() -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let delegate: DelegateSlot = Arc::new(RwLock::new(None));
        let (events, _) = broadcast::channel(64);

        let thread_delegate = delegate.clone();
        let thread_events = events.clone();
        std::thread::Builder::new()
            .name(CALLBACK_THREAD_NAME.to_string())
            .spawn(move || delivery_loop(rx, thread_delegate, thread_events))?;

        Ok(Self {
            tx,
            delegate,
            events,
        })
    }

    /// The delegate is held weakly; dropping it silently stops delivery to it.
    pub fn set_delegate(&self, delegate: Option<Weak<dyn SessionDelegate>>) {
        *self.delegate.write().unwrap_or_else(|e| e.into_inner()) = delegate;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        log::debug!("Emitting {:?}", event);
        let _ = self.tx.send(Delivery::Event(event));
    }

    pub(crate) fn run(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Delivery::Task(Box::new(task)));
    }

    /// Fires `ack` once everything queued before it has been delivered.
    pub(crate) fn barrier(&self, ack: oneshot::Sender<()>) {
        let _ = self.tx.send(Delivery::Barrier(ack));
    }
}

fn delivery_loop(
    rx: Receiver<Delivery>,
    delegate: DelegateSlot,
    events: broadcast::Sender<SessionEvent>,
) {
    IN_CALLBACK_CONTEXT.with(|flag| flag.set(true));

    for delivery in rx.iter() {
        match delivery {
            Delivery::Event(event) => {
                let target = delegate
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .and_then(Weak::upgrade);
                if let Some(target) = target {
                    let result = catch_unwind(AssertUnwindSafe(|| target.handle_event(&event)));
                    if result.is_err() {
                        log::error!("Session delegate panicked handling {:?}", event);
                    }
                }
                let _ = events.send(event);
            }
            Delivery::Task(task) => {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log::error!("Completion handler panicked");
                }
            }
            Delivery::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }

    log::debug!("Callback dispatcher finished");
}
