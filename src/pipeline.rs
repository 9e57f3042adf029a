//! The frame path: capture -> encode -> publish.
//!
//! Frames never touch the session's control path. A dedicated worker thread
//! drains the bounded frame queue; the session only talks to it to attach or
//! detach an encoder/publisher pair and to ask for still snapshots.

use crate::capture::{CaptureEvent, CaptureSink, SinkCounters};
use crate::encoder::MediaEncoder;
use crate::publisher::Publisher;
use crate::types::{RawFrame, VideoFrame};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) const ENCODE_THREAD_NAME: &str = "crabstream-encode";

pub(crate) type SnapshotCallback = Box<dyn FnOnce(Option<VideoFrame>) + Send>;

enum Control {
    Attach {
        encoder: Box<dyn MediaEncoder>,
        publisher: Arc<dyn Publisher>,
    },
    Detach(oneshot::Sender<()>),
    Snapshot(SnapshotCallback),
    CancelSnapshots,
    Shutdown,
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub(crate) packets: AtomicU64,
    pub(crate) encode_errors: AtomicU64,
}

pub(crate) struct FramePipeline {
    control: Sender<Control>,
    frames: Sender<RawFrame>,
    drain: Receiver<RawFrame>,
    sink_counters: Arc<SinkCounters>,
    counters: Arc<PipelineCounters>,
}

impl FramePipeline {
    pub(crate) fn start(frame_capacity: usize) -> std::io::Result<Self> {
        let (control, control_rx) = crossbeam_channel::unbounded();
        let (frames, frames_rx) = crossbeam_channel::bounded(frame_capacity.max(1));
        let counters = Arc::new(PipelineCounters::default());

        let worker_frames = frames_rx.clone();
        let worker_counters = counters.clone();
        std::thread::Builder::new()
            .name(ENCODE_THREAD_NAME.to_string())
            .spawn(move || run(control_rx, worker_frames, worker_counters))?;

        Ok(Self {
            control,
            frames,
            drain: frames_rx,
            sink_counters: Arc::default(),
            counters,
        })
    }

    /// A producer handle for a capture source.
    pub(crate) fn sink(&self, on_event: impl Fn(CaptureEvent) + Send + Sync + 'static) -> CaptureSink {
        CaptureSink::new(
            self.frames.clone(),
            self.drain.clone(),
            self.sink_counters.clone(),
            Arc::new(on_event),
        )
    }

    pub(crate) fn attach(&self, encoder: Box<dyn MediaEncoder>, publisher: Arc<dyn Publisher>) {
        let _ = self.control.send(Control::Attach { encoder, publisher });
    }

    /// Detach and drop the encoder after flushing it into the publisher.
    /// Resolves once no further packet will reach the old publisher.
    pub(crate) async fn detach(&self) {
        let (ack, done) = oneshot::channel();
        if self.control.send(Control::Detach(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Hand the next live video frame to `callback`.
    pub(crate) fn snapshot(&self, callback: SnapshotCallback) {
        if let Err(crossbeam_channel::SendError(Control::Snapshot(callback))) =
            self.control.send(Control::Snapshot(callback))
        {
            callback(None);
        }
    }

    /// Answer every outstanding snapshot with `None`.
    pub(crate) fn cancel_snapshots(&self) {
        let _ = self.control.send(Control::CancelSnapshots);
    }

    pub(crate) fn frames_captured(&self) -> u64 {
        self.sink_counters.captured.load(Ordering::Relaxed)
    }

    pub(crate) fn frames_dropped(&self) -> u64 {
        self.sink_counters.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn packets_published(&self) -> u64 {
        self.counters.packets.load(Ordering::Relaxed)
    }

    pub(crate) fn encode_errors(&self) -> u64 {
        self.counters.encode_errors.load(Ordering::Relaxed)
    }

    /// Ask the worker to exit. Pending snapshots are answered with `None`.
    pub(crate) fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

struct Attached {
    encoder: Box<dyn MediaEncoder>,
    publisher: Arc<dyn Publisher>,
}

impl Attached {
    fn flush(mut self, counters: &PipelineCounters) {
        for packet in self.encoder.flush() {
            self.publisher.publish(packet);
            counters.packets.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn run(control: Receiver<Control>, frames: Receiver<RawFrame>, counters: Arc<PipelineCounters>) {
    let mut attached: Option<Attached> = None;
    let mut snapshots: Vec<SnapshotCallback> = Vec::new();

    loop {
        crossbeam_channel::select! {
            recv(control) -> message => match message {
                Ok(Control::Attach { encoder, publisher }) => {
                    if let Some(previous) = attached.take() {
                        log::warn!("Replacing attached encoder without detach");
                        previous.flush(&counters);
                    }
                    log::debug!("Encoder attached");
                    attached = Some(Attached { encoder, publisher });
                }
                Ok(Control::Detach(ack)) => {
                    if let Some(previous) = attached.take() {
                        previous.flush(&counters);
                        log::debug!("Encoder detached");
                    }
                    let _ = ack.send(());
                }
                Ok(Control::Snapshot(callback)) => snapshots.push(callback),
                Ok(Control::CancelSnapshots) => {
                    for callback in snapshots.drain(..) {
                        callback(None);
                    }
                }
                Ok(Control::Shutdown) | Err(_) => break,
            },
            recv(frames) -> frame => {
                let Ok(frame) = frame else { break };

                if !snapshots.is_empty() {
                    if let RawFrame::Video(video) = &frame {
                        for callback in snapshots.drain(..) {
                            callback(Some(video.clone()));
                        }
                    }
                }

                if let Some(current) = attached.as_mut() {
                    match current.encoder.encode(frame) {
                        Ok(packets) => {
                            for packet in packets {
                                current.publisher.publish(packet);
                                counters.packets.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping frame: {}", e);
                        }
                    }
                }
            }
        }
    }

    if let Some(previous) = attached.take() {
        previous.flush(&counters);
    }
    for callback in snapshots.drain(..) {
        callback(None);
    }
    log::debug!("Encode worker finished");
}
