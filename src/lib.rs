//! CrabStream: live-streaming sessions for camera and microphone capture
//!
//! This crate drives one streaming attempt at a time: it authorizes the
//! capture devices, starts capture, encodes frames and pushes the encoded
//! stream to a remote endpoint, while presenting a single linear stream
//! state to the caller.
//!
//! # Features
//! - One authoritative stream state per session (`Idle`, `Connecting`,
//!   `Connected`, `Disconnected`, `Error`)
//! - Safe start/stop/destroy from any thread, including mid-start
//! - Events and completions delivered on one dedicated callback thread
//! - Pluggable capture, encoder and publisher backends
//! - TOML configuration
//!
//! # Usage
//! ```rust,no_run
//! use crabstream::testing::{StaticAuthorization, SyntheticCapture};
//! use crabstream::{
//!     AuthorizationGate, Stream, StreamingConfiguration, StreamingSession, Subsystems,
//!     VideoOrientation,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), crabstream::StreamingError> {
//! let config = StreamingConfiguration::default();
//! let subsystems = Subsystems::with_capture(
//!     Arc::new(SyntheticCapture::new(&config)),
//!     AuthorizationGate::new(Arc::new(StaticAuthorization::granted())),
//!     &config,
//! );
//! let session = StreamingSession::create(
//!     config,
//!     Stream::new("rtmp://localhost/app/key")?,
//!     VideoOrientation::Portrait,
//!     subsystems,
//! )?;
//!
//! if session.start_async().await {
//!     println!("streaming to {:?}", session.push_url());
//! }
//! session.stop();
//! # Ok(())
//! # }
//! ```
pub mod capture;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod events;
pub mod permissions;
mod pipeline;
pub mod publisher;
pub mod session;
pub mod stream;
pub mod types;

// Testing utilities - synthetic capture for offline testing
pub mod testing;

// Re-exports for convenience
pub use capture::{CaptureEvent, CaptureSettings, CaptureSink, CaptureSource};
pub use config::{StreamingConfiguration, VideoQuality};
pub use encoder::{EncoderFactory, MediaEncoder, PassthroughEncoderFactory};
pub use errors::StreamingError;
pub use events::{SessionDelegate, SessionEvent};
pub use permissions::{
    AuthorizationGate, AuthorizationProvider, AuthorizationStatus, SystemAuthorization,
};
pub use publisher::{BufferedPublisher, LinkSink, LinkStatus, Publisher};
pub use session::{SessionStats, StreamingSession, Subsystems};
pub use stream::Stream;
pub use types::{
    CaptureDevicePosition, DeviceKind, EncodedPacket, FocusPoint, PreviewSize, RawFrame,
    StreamState, VideoOrientation,
};

/// Initialize logging for the streaming system
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabstream=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}
