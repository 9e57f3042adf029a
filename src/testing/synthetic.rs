//! Synthetic frames for offline testing.

use crate::types::{AudioFrame, CaptureDevicePosition, PixelFormat, VideoFrame};

/// RGB gradient frame that changes every frame, so consecutive frames never
/// encode identically. The back camera is tinted red, the front blue.
pub fn synthetic_video_frame(
    sequence: u64,
    timestamp_us: u64,
    width: u32,
    height: u32,
    position: CaptureDevicePosition,
) -> VideoFrame {
    let mut data = vec![0u8; (width * height * 3) as usize];
    let base = (sequence % 256) as u8;
    let (tint_r, tint_b) = match position {
        CaptureDevicePosition::Back => (64u8, 0u8),
        CaptureDevicePosition::Front => (0u8, 64u8),
    };

    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8).wrapping_add(tint_r);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base
                .wrapping_add(((x + y) % 256) as u8)
                .wrapping_add(tint_b);
        }
    }

    VideoFrame {
        sequence,
        timestamp_us,
        width,
        height,
        format: PixelFormat::Rgb8,
        data,
    }
}

/// 440Hz sine at 0.3 amplitude, or silence when `muted`.
pub fn synthetic_audio_frame(
    sequence: u64,
    sample_rate: u32,
    channels: u16,
    samples_per_frame: usize,
    muted: bool,
) -> AudioFrame {
    let channels_usize = usize::from(channels.max(1));
    let mut samples = vec![0.0f32; samples_per_frame * channels_usize];

    if !muted {
        let rate = f64::from(sample_rate);
        for i in 0..samples_per_frame {
            let t = (sequence as f64 * samples_per_frame as f64 + i as f64) / rate;
            let value = (2.0 * std::f64::consts::PI * 440.0 * t).sin() as f32 * 0.3;
            for c in 0..channels_usize {
                samples[i * channels_usize + c] = value;
            }
        }
    }

    let timestamp_us = sequence * samples_per_frame as u64 * 1_000_000 / u64::from(sample_rate.max(1));

    AudioFrame {
        sequence,
        timestamp_us,
        sample_rate,
        channels,
        samples,
    }
}
