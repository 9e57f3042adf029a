//! In-process capture and authorization backends.

use super::synthetic::{synthetic_audio_frame, synthetic_video_frame};
use crate::capture::{CaptureSettings, CaptureSink, CaptureSource};
use crate::config::StreamingConfiguration;
use crate::errors::StreamingError;
use crate::permissions::{AuthorizationProvider, AuthorizationStatus};
use crate::types::{CaptureDevicePosition, DeviceKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Running {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// A capture source that generates frames on its own thread.
pub struct SyntheticCapture {
    positions: Vec<CaptureDevicePosition>,
    width: u32,
    height: u32,
    fps: u32,
    sample_rate: u32,
    channels: u16,
    settings: Arc<RwLock<CaptureSettings>>,
    running: Mutex<Option<Running>>,
    starts: AtomicUsize,
}

impl SyntheticCapture {
    /// Front and back cameras producing frames at the configured size and rate.
    pub fn new(config: &StreamingConfiguration) -> Self {
        Self {
            positions: vec![CaptureDevicePosition::Back, CaptureDevicePosition::Front],
            width: config.video.width,
            height: config.video.height,
            fps: config.video.fps.max(1),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            settings: Arc::new(RwLock::new(CaptureSettings::default())),
            running: Mutex::new(None),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn with_positions(mut self, positions: Vec<CaptureDevicePosition>) -> Self {
        self.positions = positions;
        self
    }

    /// Override the generated frame size; full-size gradients are costly.
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// How many times capture actually started.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CaptureSource for SyntheticCapture {
    fn available_positions(&self) -> Vec<CaptureDevicePosition> {
        self.positions.clone()
    }

    async fn start(
        &self,
        settings: CaptureSettings,
        sink: CaptureSink,
    ) -> Result<(), StreamingError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Ok(());
        }
        if !self.positions.contains(&settings.position) {
            return Err(StreamingError::CaptureStartFailure(format!(
                "no {:?} camera",
                settings.position
            )));
        }

        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            let settings = self.settings.clone();
            let (width, height, fps) = (self.width, self.height, self.fps);
            let (sample_rate, channels) = (self.sample_rate, self.channels);
            std::thread::Builder::new()
                .name("synthetic-capture".to_string())
                .spawn(move || {
                    generate(stop, settings, sink, width, height, fps, sample_rate, channels)
                })
                .map_err(|e| StreamingError::CaptureStartFailure(e.to_string()))?
        };

        *running = Some(Running { stop, worker });
        self.starts.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "Synthetic capture started {}x{}@{}",
            self.width,
            self.height,
            self.fps
        );
        Ok(())
    }

    async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        let _ = tokio::task::spawn_blocking(move || running.worker.join()).await;
        log::info!("Synthetic capture stopped");
    }

    fn apply_settings(&self, settings: &CaptureSettings) -> Result<(), StreamingError> {
        let mut current = self.settings.write().unwrap_or_else(|e| e.into_inner());
        let position = current.position;
        *current = settings.clone();
        // Position changes go through switch_camera.
        current.position = position;
        Ok(())
    }

    async fn switch_camera(
        &self,
        position: CaptureDevicePosition,
    ) -> Result<(), StreamingError> {
        if !self.positions.contains(&position) {
            return Err(StreamingError::DeviceUnavailable);
        }
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .position = position;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn generate(
    stop: Arc<AtomicBool>,
    settings: Arc<RwLock<CaptureSettings>>,
    sink: CaptureSink,
    width: u32,
    height: u32,
    fps: u32,
    sample_rate: u32,
    channels: u16,
) {
    let frame_interval = Duration::from_secs(1) / fps;
    let samples_per_frame = (sample_rate / fps) as usize;
    let started = Instant::now();
    let mut sequence = 0u64;

    sink.device_started(DeviceKind::Camera);
    sink.device_started(DeviceKind::Microphone);

    while !stop.load(Ordering::SeqCst) {
        let (position, muted) = {
            let s = settings.read().unwrap_or_else(|e| e.into_inner());
            (s.position, s.muted)
        };
        let timestamp_us = started.elapsed().as_micros() as u64;

        sink.push_video(synthetic_video_frame(
            sequence,
            timestamp_us,
            width,
            height,
            position,
        ));
        let mut audio =
            synthetic_audio_frame(sequence, sample_rate, channels, samples_per_frame, muted);
        audio.timestamp_us = timestamp_us;
        sink.push_audio(audio);

        sequence += 1;
        let next = frame_interval * (sequence as u32);
        if let Some(wait) = next.checked_sub(started.elapsed()) {
            std::thread::sleep(wait);
        }
    }
}

/// Authorization backend with fixed answers.
pub struct StaticAuthorization {
    camera: AuthorizationStatus,
    microphone: AuthorizationStatus,
    grant: bool,
    requests: AtomicUsize,
}

impl StaticAuthorization {
    /// Both devices already authorized.
    pub fn granted() -> Self {
        Self::new(
            AuthorizationStatus::Authorized,
            AuthorizationStatus::Authorized,
            true,
        )
    }

    /// Neither device decided yet; a request answers `grant`.
    pub fn undetermined(grant: bool) -> Self {
        Self::new(
            AuthorizationStatus::NotDetermined,
            AuthorizationStatus::NotDetermined,
            grant,
        )
    }

    pub fn new(
        camera: AuthorizationStatus,
        microphone: AuthorizationStatus,
        grant: bool,
    ) -> Self {
        Self {
            camera,
            microphone,
            grant,
            requests: AtomicUsize::new(0),
        }
    }

    /// Prompts shown so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorizationProvider for StaticAuthorization {
    fn status(&self, kind: DeviceKind) -> AuthorizationStatus {
        match kind {
            DeviceKind::Camera => self.camera,
            DeviceKind::Microphone => self.microphone,
        }
    }

    async fn request(&self, _kind: DeviceKind) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.grant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawFrame;

    fn small_config() -> StreamingConfiguration {
        let mut config = StreamingConfiguration::default();
        config.video.fps = 60;
        config
    }

    #[tokio::test]
    async fn test_synthetic_capture_produces_frames() {
        let capture = SyntheticCapture::new(&small_config()).with_frame_size(16, 8);
        let (tx, rx) = crossbeam_channel::bounded(64);
        let events = Arc::new(Mutex::new(Vec::new()));
        let hook = events.clone();
        let sink = CaptureSink::new(
            tx,
            rx.clone(),
            Arc::default(),
            Arc::new(move |e| hook.lock().unwrap().push(e)),
        );

        capture.start(CaptureSettings::default(), sink).await.unwrap();
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(first, RawFrame::Video(ref v) if v.width == 16 && v.height == 8));
        capture.stop().await;
        capture.stop().await;

        assert!(!capture.is_running());
        assert_eq!(capture.start_count(), 1);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_switch_to_missing_camera_fails() {
        let capture = SyntheticCapture::new(&small_config())
            .with_positions(vec![CaptureDevicePosition::Front]);
        let result = capture.switch_camera(CaptureDevicePosition::Back).await;
        assert!(result.is_err());

        let result = capture
            .start(CaptureSettings::default(), CaptureSink::detached())
            .await;
        assert!(matches!(result, Err(StreamingError::CaptureStartFailure(_))));
    }

    #[tokio::test]
    async fn test_static_authorization_counts_requests() {
        let provider = StaticAuthorization::undetermined(false);
        assert_eq!(
            provider.status(DeviceKind::Camera),
            AuthorizationStatus::NotDetermined
        );
        assert!(!provider.request(DeviceKind::Camera).await);
        assert_eq!(provider.requests(), 1);
    }
}
