//! Testing utilities for crabstream
//!
//! Synthetic frames and in-process backends so sessions can run end to end
//! without camera hardware or platform permission prompts.

pub mod sources;
pub mod synthetic;

pub use sources::{StaticAuthorization, SyntheticCapture};
pub use synthetic::{synthetic_audio_frame, synthetic_video_frame};
