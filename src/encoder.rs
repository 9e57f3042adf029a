//! Encode pipeline contract.
//!
//! The session builds one encoder per start attempt from the configuration
//! snapshot taken at start; an encoder never sees a configuration change.

use crate::config::StreamingConfiguration;
use crate::errors::StreamingError;
use crate::types::{EncodedPacket, PacketKind, RawFrame};
use bytes::{BufMut, BytesMut};

/// Creates encoders from an immutable configuration snapshot.
pub trait EncoderFactory: Send + Sync {
    fn create(
        &self,
        config: &StreamingConfiguration,
    ) -> Result<Box<dyn MediaEncoder>, StreamingError>;
}

/// Consumes raw frames in capture order, emits packets in the same order.
pub trait MediaEncoder: Send {
    fn encode(&mut self, frame: RawFrame) -> Result<Vec<EncodedPacket>, StreamingError>;

    /// Drain anything still buffered. Called once when the pipeline detaches.
    fn flush(&mut self) -> Vec<EncodedPacket> {
        Vec::new()
    }
}

/// Packs raw frames as-is.
///
/// Video payloads are prefixed with `width:u16 height:u16` (big endian);
/// audio samples are written as little-endian f32. Useful for loopback
/// setups and tests where real codecs are not wanted.
pub struct PassthroughEncoder {
    keyframe_interval: u64,
    video_frames: u64,
    sequence: u64,
}

impl PassthroughEncoder {
    pub fn new(config: &StreamingConfiguration) -> Self {
        Self {
            keyframe_interval: u64::from(config.video.keyframe_interval.max(1)),
            video_frames: 0,
            sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

impl MediaEncoder for PassthroughEncoder {
    fn encode(&mut self, frame: RawFrame) -> Result<Vec<EncodedPacket>, StreamingError> {
        let timestamp_us = frame.timestamp_us();
        let (kind, data) = match frame {
            RawFrame::Video(video) => {
                let width = u16::try_from(video.width).map_err(|_| {
                    StreamingError::EncodeFailure(format!("width {} too large", video.width))
                })?;
                let height = u16::try_from(video.height).map_err(|_| {
                    StreamingError::EncodeFailure(format!("height {} too large", video.height))
                })?;

                let kind = if self.video_frames % self.keyframe_interval == 0 {
                    PacketKind::VideoKeyframe
                } else {
                    PacketKind::VideoDelta
                };
                self.video_frames += 1;

                let mut buf = BytesMut::with_capacity(4 + video.data.len());
                buf.put_u16(width);
                buf.put_u16(height);
                buf.extend_from_slice(&video.data);
                (kind, buf.freeze())
            }
            RawFrame::Audio(audio) => {
                let mut buf = BytesMut::with_capacity(audio.samples.len() * 4);
                for sample in &audio.samples {
                    buf.put_f32_le(*sample);
                }
                (PacketKind::Audio, buf.freeze())
            }
        };

        Ok(vec![EncodedPacket {
            sequence: self.next_sequence(),
            timestamp_us,
            kind,
            data,
        }])
    }
}

/// Factory for [`PassthroughEncoder`]; validates the snapshot first.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncoderFactory;

impl EncoderFactory for PassthroughEncoderFactory {
    fn create(
        &self,
        config: &StreamingConfiguration,
    ) -> Result<Box<dyn MediaEncoder>, StreamingError> {
        config
            .validate()
            .map_err(|e| StreamingError::EncodeInitFailure(e.to_string()))?;
        log::debug!(
            "Passthrough encoder {}x{}@{} keyframe every {}",
            config.video.width,
            config.video.height,
            config.video.fps,
            config.video.keyframe_interval
        );
        Ok(Box::new(PassthroughEncoder::new(config)))
    }
}
