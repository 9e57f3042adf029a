//! Camera and microphone authorization.
//!
//! The gate caches the last known status per device kind and coalesces
//! concurrent access requests: while one prompt is outstanding every further
//! caller waits on the same answer instead of prompting again.

use crate::types::DeviceKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};

/// Authorization status per device kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AuthorizationStatus {
    /// User hasn't been asked yet
    NotDetermined,
    /// Access denied or restricted by policy
    Denied,
    /// Access granted
    Authorized,
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorizationStatus::NotDetermined => write!(f, "not_determined"),
            AuthorizationStatus::Denied => write!(f, "denied"),
            AuthorizationStatus::Authorized => write!(f, "authorized"),
        }
    }
}

impl From<bool> for AuthorizationStatus {
    fn from(granted: bool) -> Self {
        if granted {
            AuthorizationStatus::Authorized
        } else {
            AuthorizationStatus::Denied
        }
    }
}

/// Platform backend that knows the current status and can show the prompt.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Current status as reported by the platform.
    fn status(&self, kind: DeviceKind) -> AuthorizationStatus;

    /// Show the platform prompt; resolves to whether access was granted.
    async fn request(&self, kind: DeviceKind) -> bool;
}

/// Emitted whenever a request resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorizationChange {
    pub kind: DeviceKind,
    pub status: AuthorizationStatus,
}

#[derive(Default)]
struct Slot {
    cached: Option<AuthorizationStatus>,
    waiters: Option<Vec<oneshot::Sender<AuthorizationStatus>>>,
}

/// Shared authorization gate. One instance is normally shared by every
/// session of a process, the way the platform status is process-wide.
pub struct AuthorizationGate {
    provider: Arc<dyn AuthorizationProvider>,
    slots: Mutex<HashMap<DeviceKind, Slot>>,
    changes: broadcast::Sender<AuthorizationChange>,
}

impl AuthorizationGate {
    pub fn new(provider: Arc<dyn AuthorizationProvider>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(16);
        Arc::new(Self {
            provider,
            slots: Mutex::new(HashMap::new()),
            changes,
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DeviceKind, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last known status. Asks the provider once, then serves the cache until
    /// the next explicit request.
    pub fn query_status(&self, kind: DeviceKind) -> AuthorizationStatus {
        let mut slots = self.slots();
        let slot = slots.entry(kind).or_default();
        *slot
            .cached
            .get_or_insert_with(|| self.provider.status(kind))
    }

    /// Subscribe to resolved requests.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthorizationChange> {
        self.changes.subscribe()
    }

    /// Request access. Already determined kinds resolve immediately without
    /// prompting; concurrent callers share one outstanding prompt.
    ///
    /// Must be called within a tokio runtime.
    pub async fn request_access(self: &Arc<Self>, kind: DeviceKind) -> AuthorizationStatus {
        let rx = {
            let mut slots = self.slots();
            let slot = slots.entry(kind).or_default();
            let status = *slot
                .cached
                .get_or_insert_with(|| self.provider.status(kind));
            if status != AuthorizationStatus::NotDetermined {
                return status;
            }

            let (tx, rx) = oneshot::channel();
            match slot.waiters.as_mut() {
                Some(waiters) => {
                    log::debug!("Joining outstanding {} authorization request", kind);
                    waiters.push(tx);
                }
                None => {
                    slot.waiters = Some(vec![tx]);
                    self.spawn_prompt(kind);
                }
            }
            rx
        };

        rx.await.unwrap_or(AuthorizationStatus::NotDetermined)
    }

    /// The prompt runs detached so a cancelled caller does not strand the
    /// other waiters.
    fn spawn_prompt(self: &Arc<Self>, kind: DeviceKind) {
        log::info!("Requesting {} authorization", kind);
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let status = AuthorizationStatus::from(gate.provider.request(kind).await);
            gate.resolve(kind, status);
        });
    }

    fn resolve(&self, kind: DeviceKind, status: AuthorizationStatus) {
        let waiters = {
            let mut slots = self.slots();
            let slot = slots.entry(kind).or_default();
            slot.cached = Some(status);
            slot.waiters.take().unwrap_or_default()
        };

        match status {
            AuthorizationStatus::Authorized => log::info!("{} authorization granted", kind),
            _ => log::warn!("{} authorization {}", kind, status),
        }

        for waiter in waiters {
            let _ = waiter.send(status);
        }
        let _ = self.changes.send(AuthorizationChange { kind, status });
    }
}

/// Provider backed by the host platform.
///
/// On Linux, camera access is granted through membership of the `video`
/// group and audio through `audio`; there is no interactive prompt, so a
/// request simply re-reads the current state.
pub struct SystemAuthorization;

#[async_trait]
impl AuthorizationProvider for SystemAuthorization {
    fn status(&self, kind: DeviceKind) -> AuthorizationStatus {
        system_status(kind)
    }

    async fn request(&self, kind: DeviceKind) -> bool {
        system_status(kind) == AuthorizationStatus::Authorized
    }
}

#[cfg(target_os = "linux")]
fn system_status(kind: DeviceKind) -> AuthorizationStatus {
    use std::path::Path;

    let (device_present, group) = match kind {
        DeviceKind::Camera => (
            (0..10).any(|i| Path::new(&format!("/dev/video{}", i)).exists()),
            "video",
        ),
        DeviceKind::Microphone => (Path::new("/dev/snd").exists(), "audio"),
    };

    if !device_present {
        return AuthorizationStatus::NotDetermined;
    }

    let in_group = std::process::Command::new("groups")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|groups| groups.split_whitespace().any(|g| g == group))
        .unwrap_or(false);

    AuthorizationStatus::from(in_group)
}

#[cfg(not(target_os = "linux"))]
fn system_status(_kind: DeviceKind) -> AuthorizationStatus {
    AuthorizationStatus::NotDetermined
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowPrompt {
        calls: AtomicUsize,
        grant: bool,
    }

    #[async_trait]
    impl AuthorizationProvider for SlowPrompt {
        fn status(&self, _kind: DeviceKind) -> AuthorizationStatus {
            AuthorizationStatus::NotDetermined
        }

        async fn request(&self, _kind: DeviceKind) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.grant
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_prompt_once() {
        let provider = Arc::new(SlowPrompt {
            calls: AtomicUsize::new(0),
            grant: true,
        });
        let gate = AuthorizationGate::new(provider.clone());

        let (a, b) = tokio::join!(
            gate.request_access(DeviceKind::Camera),
            gate.request_access(DeviceKind::Camera)
        );

        assert_eq!(a, AuthorizationStatus::Authorized);
        assert_eq!(b, AuthorizationStatus::Authorized);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            gate.query_status(DeviceKind::Camera),
            AuthorizationStatus::Authorized
        );
    }

    #[tokio::test]
    async fn test_determined_status_does_not_prompt() {
        let provider = Arc::new(SlowPrompt {
            calls: AtomicUsize::new(0),
            grant: false,
        });
        let gate = AuthorizationGate::new(provider.clone());

        assert_eq!(
            gate.request_access(DeviceKind::Microphone).await,
            AuthorizationStatus::Denied
        );
        assert_eq!(
            gate.request_access(DeviceKind::Microphone).await,
            AuthorizationStatus::Denied
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let provider = Arc::new(SlowPrompt {
            calls: AtomicUsize::new(0),
            grant: true,
        });
        let gate = AuthorizationGate::new(provider);
        let mut changes = gate.subscribe();

        gate.request_access(DeviceKind::Camera).await;
        let change = changes.recv().await.unwrap();
        assert_eq!(change.kind, DeviceKind::Camera);
        assert_eq!(change.status, AuthorizationStatus::Authorized);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(AuthorizationStatus::NotDetermined.to_string(), "not_determined");
        assert_eq!(AuthorizationStatus::from(true), AuthorizationStatus::Authorized);
    }

    #[test]
    fn test_system_status_no_panic() {
        let result = std::panic::catch_unwind(|| system_status(DeviceKind::Camera));
        assert!(result.is_ok());
    }
}
