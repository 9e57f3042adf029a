use crate::types::DeviceKind;

/// Errors surfaced by the streaming session and its adapters.
///
/// Payload strings are diagnostic detail only; callers branch on the variant
/// (or, for `start`, only on the boolean completion and the stream state).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamingError {
    #[error("No usable capture device available")]
    DeviceUnavailable,
    #[error("Authorization denied for {0}")]
    AuthorizationDenied(DeviceKind),
    #[error("Capture start failure: {0}")]
    CaptureStartFailure(String),
    #[error("Encoder initialization failure: {0}")]
    EncodeInitFailure(String),
    #[error("Encode failure: {0}")]
    EncodeFailure(String),
    #[error("Network connect failure: {0}")]
    NetworkConnectFailure(String),
    #[error("Network link lost: {0}")]
    NetworkLinkLost(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid stream: {0}")]
    InvalidStream(String),
    #[error("Stream destination is locked while a start attempt is in flight")]
    StreamLocked,
    #[error("Session has been destroyed")]
    SessionDestroyed,
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl StreamingError {
    /// True for failures that happen after a successful connect.
    pub fn is_post_connect(&self) -> bool {
        matches!(self, StreamingError::NetworkLinkLost(_))
    }
}
