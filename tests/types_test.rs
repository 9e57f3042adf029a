//! Tests for CrabStream core types
//!
//! Ensures the stream state graph and the value types behave as callers expect.

use crabstream::{
    CaptureDevicePosition, CaptureSettings, DeviceKind, PreviewSize, StreamState, VideoOrientation,
};

#[cfg(test)]
mod stream_state_tests {
    use super::*;

    const ALL: [StreamState; 5] = [
        StreamState::Idle,
        StreamState::Connecting,
        StreamState::Connected,
        StreamState::Disconnected,
        StreamState::Error,
    ];

    #[test]
    fn test_nothing_returns_to_idle() {
        for state in ALL {
            assert!(!state.can_transition_to(StreamState::Idle));
        }
    }

    #[test]
    fn test_connected_only_from_connecting() {
        for state in ALL {
            assert_eq!(
                state.can_transition_to(StreamState::Connected),
                state == StreamState::Connecting
            );
        }
    }

    #[test]
    fn test_start_accepted_from_terminal_states() {
        assert!(StreamState::Idle.can_start());
        assert!(StreamState::Disconnected.can_start());
        assert!(StreamState::Error.can_start());
        assert!(!StreamState::Connecting.can_start());
        assert!(!StreamState::Connected.can_start());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(StreamState::Connecting.to_string(), "connecting");
        assert_eq!(StreamState::Error.to_string(), "error");
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&StreamState::Connected).unwrap();
        assert!(json.contains("Connected"));
        let back: StreamState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StreamState::Connected);
    }
}

#[cfg(test)]
mod device_tests {
    use super::*;

    #[test]
    fn test_position_opposite() {
        assert_eq!(
            CaptureDevicePosition::Front.opposite(),
            CaptureDevicePosition::Back
        );
        assert_eq!(
            CaptureDevicePosition::Back.opposite(),
            CaptureDevicePosition::Front
        );
    }

    #[test]
    fn test_device_kind_display() {
        assert_eq!(DeviceKind::Camera.to_string(), "camera");
        assert_eq!(DeviceKind::Microphone.to_string(), "microphone");
    }

    #[test]
    fn test_capture_settings_defaults() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.position, CaptureDevicePosition::Back);
        assert_eq!(settings.orientation, VideoOrientation::Portrait);
        assert!(!settings.torch_on);
        assert!(!settings.muted);
        assert_eq!(settings.preview_size, PreviewSize::default());
    }

    #[test]
    fn test_capture_settings_json() {
        let settings = CaptureSettings {
            torch_on: true,
            ..CaptureSettings::default()
        };
        let text = serde_json::to_string(&settings).unwrap();
        let back: CaptureSettings = serde_json::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }
}
