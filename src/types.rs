//! Shared value types for the streaming session.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The single authoritative stream state of a session.
///
/// `Idle` is only ever observed before the first start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl StreamState {
    /// Whether `start` is accepted from this state.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            StreamState::Idle | StreamState::Disconnected | StreamState::Error
        )
    }

    /// Whether a start attempt is in flight or established.
    pub fn is_active(&self) -> bool {
        matches!(self, StreamState::Connecting | StreamState::Connected)
    }

    /// Transition graph check: `Connected` only from `Connecting`,
    /// `Disconnected`/`Error` only from non-`Idle` states.
    pub fn can_transition_to(&self, next: StreamState) -> bool {
        match (self, next) {
            (_, StreamState::Idle) => false,
            (s, StreamState::Connecting) => s.can_start(),
            (StreamState::Connecting, StreamState::Connected) => true,
            (_, StreamState::Connected) => false,
            (StreamState::Idle, _) => false,
            (StreamState::Connecting | StreamState::Connected, _) => true,
            (StreamState::Disconnected | StreamState::Error, _) => false,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Connecting => write!(f, "connecting"),
            StreamState::Connected => write!(f, "connected"),
            StreamState::Disconnected => write!(f, "disconnected"),
            StreamState::Error => write!(f, "error"),
        }
    }
}

/// Kind of capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Camera,
    Microphone,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Camera => write!(f, "camera"),
            DeviceKind::Microphone => write!(f, "microphone"),
        }
    }
}

/// Physical camera position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureDevicePosition {
    Back,
    Front,
}

impl CaptureDevicePosition {
    pub fn opposite(&self) -> Self {
        match self {
            CaptureDevicePosition::Back => CaptureDevicePosition::Front,
            CaptureDevicePosition::Front => CaptureDevicePosition::Back,
        }
    }
}

impl Default for CaptureDevicePosition {
    fn default() -> Self {
        CaptureDevicePosition::Back
    }
}

/// Orientation of the captured video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoOrientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeRight,
    LandscapeLeft,
}

impl Default for VideoOrientation {
    fn default() -> Self {
        VideoOrientation::Portrait
    }
}

/// Normalized point of interest, (0,0) top-left and (1,1) bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusPoint {
    pub x: f32,
    pub y: f32,
}

impl FocusPoint {
    /// Create a focus point clamped to the unit square. NaN maps to the center.
    pub fn new(x: f32, y: f32) -> Self {
        let clamp = |v: f32| if v.is_nan() { 0.5 } else { v.clamp(0.0, 1.0) };
        Self {
            x: clamp(x),
            y: clamp(y),
        }
    }
}

impl Default for FocusPoint {
    fn default() -> Self {
        Self { x: 0.5, y: 0.5 }
    }
}

/// Preview surface size in points. Does not affect the encoded size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PreviewSize {
    pub width: f64,
    pub height: f64,
}

/// Pixel layout of a raw video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }
}

/// Raw video frame as produced by a capture source.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Convert the frame into an RGB still. `None` if the buffer is short.
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        let pixels = self.width as usize * self.height as usize;
        if self.data.len() < pixels * self.format.bytes_per_pixel() {
            return None;
        }

        let rgb = match self.format {
            PixelFormat::Rgb8 => self.data[..pixels * 3].to_vec(),
            PixelFormat::Rgba8 => self
                .data
                .chunks_exact(4)
                .take(pixels)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::Bgra8 => self
                .data
                .chunks_exact(4)
                .take(pixels)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        };

        image::RgbImage::from_raw(self.width, self.height, rgb)
    }
}

/// Interleaved PCM audio frame.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

/// A raw frame on its way from capture to encode.
#[derive(Debug, Clone)]
pub enum RawFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl RawFrame {
    pub fn timestamp_us(&self) -> u64 {
        match self {
            RawFrame::Video(f) => f.timestamp_us,
            RawFrame::Audio(f) => f.timestamp_us,
        }
    }
}

/// Kind of an encoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    VideoKeyframe,
    VideoDelta,
    Audio,
}

impl PacketKind {
    pub fn as_byte(&self) -> u8 {
        match self {
            PacketKind::VideoKeyframe => 1,
            PacketKind::VideoDelta => 2,
            PacketKind::Audio => 3,
        }
    }
}

/// Encoded packet ready to push. Ownership moves to the publisher on hand-off.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub kind: PacketKind,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_graph() {
        assert!(StreamState::Idle.can_transition_to(StreamState::Connecting));
        assert!(!StreamState::Idle.can_transition_to(StreamState::Connected));
        assert!(!StreamState::Idle.can_transition_to(StreamState::Disconnected));
        assert!(StreamState::Connecting.can_transition_to(StreamState::Connected));
        assert!(StreamState::Connecting.can_transition_to(StreamState::Error));
        assert!(StreamState::Connected.can_transition_to(StreamState::Disconnected));
        assert!(!StreamState::Disconnected.can_transition_to(StreamState::Connected));
        assert!(StreamState::Error.can_transition_to(StreamState::Connecting));
        assert!(!StreamState::Connected.can_transition_to(StreamState::Idle));
    }

    #[test]
    fn test_focus_point_clamped() {
        let p = FocusPoint::new(1.5, -0.2);
        assert_eq!(p, FocusPoint { x: 1.0, y: 0.0 });
        assert_eq!(FocusPoint::new(f32::NAN, 0.3).x, 0.5);
    }

    #[test]
    fn test_bgra_frame_to_rgb() {
        let frame = VideoFrame {
            sequence: 1,
            timestamp_us: 0,
            width: 2,
            height: 1,
            format: PixelFormat::Bgra8,
            data: vec![10, 20, 30, 255, 40, 50, 60, 255],
        };
        let img = frame.to_rgb_image().unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(img.get_pixel(1, 0).0, [60, 50, 40]);
    }

    #[test]
    fn test_short_frame_has_no_image() {
        let frame = VideoFrame {
            sequence: 1,
            timestamp_us: 0,
            width: 4,
            height: 4,
            format: PixelFormat::Rgb8,
            data: vec![0; 10],
        };
        assert!(frame.to_rgb_image().is_none());
    }
}
