//! Network publisher contract and a queue-backed implementation.
//!
//! A publisher owns the connection to the remote endpoint. `publish` is
//! fire-and-forget and keeps submission order; link health is reported
//! asynchronously through the [`LinkSink`] given at connect.

use crate::errors::StreamingError;
use crate::stream::socket_target;
use crate::types::EncodedPacket;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

/// Health of a link, reported while connecting and after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Transport is behind; packets are being dropped. Not fatal.
    Degraded { dropped: u64 },
    /// Link is gone. Fatal for the current connection.
    Lost(String),
}

impl LinkStatus {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkStatus::Lost(_))
    }
}

/// Where a publisher reports link status.
#[derive(Clone)]
pub struct LinkSink {
    report: Arc<dyn Fn(LinkStatus) + Send + Sync>,
}

impl LinkSink {
    pub fn new(report: impl Fn(LinkStatus) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    pub fn detached() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, status: LinkStatus) {
        (self.report)(status);
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Connect to `url`. Link status goes to `link`; a failed connect may
    /// also be reported there as `LinkStatus::Lost`.
    async fn connect(&self, url: &Url, link: LinkSink) -> Result<(), StreamingError>;

    /// Queue a packet. Never blocks; order of submission is preserved.
    fn publish(&self, packet: EncodedPacket);

    /// Close the connection. Closing a closed publisher is a no-op.
    async fn close(&self);
}

/// A connected byte pipe the [`BufferedPublisher`] writes packets to.
#[async_trait]
pub trait Transport: Send {
    async fn write_packet(&mut self, packet: &EncodedPacket) -> Result<(), StreamingError>;
    async fn shutdown(&mut self);
}

/// Opens transports for a push URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, StreamingError>;
}

struct Running {
    queue: mpsc::Sender<EncodedPacket>,
    writer: JoinHandle<()>,
    link: LinkSink,
    queued: Arc<AtomicUsize>,
    congested: Arc<AtomicBool>,
}

/// Publisher with a bounded packet queue drained by a writer task.
///
/// When the queue is full the packet is dropped and a single
/// `LinkStatus::Degraded` is reported for the congestion episode; the episode
/// ends once the writer has drained half the queue. A failed write reports
/// `LinkStatus::Lost` once and ends the writer.
pub struct BufferedPublisher {
    connector: Arc<dyn Connector>,
    capacity: usize,
    connect_timeout: Duration,
    running: Mutex<Option<Running>>,
    dropped: AtomicU64,
    published: Arc<AtomicU64>,
}

impl BufferedPublisher {
    pub fn new(connector: Arc<dyn Connector>, capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            connector,
            capacity: capacity.max(1),
            connect_timeout,
            running: Mutex::new(None),
            dropped: AtomicU64::new(0),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// TCP publisher configured from the session section of `config`.
    pub fn tcp(config: &crate::config::StreamingConfiguration) -> Self {
        Self::new(
            Arc::new(TcpConnector),
            config.session.publish_queue_capacity,
            config.connect_timeout(),
        )
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Packets dropped on a full queue since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Packets written to a transport since construction.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.running().is_some()
    }
}

#[async_trait]
impl Publisher for BufferedPublisher {
    async fn connect(&self, url: &Url, link: LinkSink) -> Result<(), StreamingError> {
        if self.is_connected() {
            return Err(StreamingError::NetworkConnectFailure(
                "publisher already connected".to_string(),
            ));
        }

        log::info!("Connecting publisher to {}", url);
        let transport = tokio::time::timeout(self.connect_timeout, self.connector.connect(url))
            .await
            .unwrap_or_else(|_| {
                Err(StreamingError::NetworkConnectFailure(format!(
                    "connect to {} timed out after {:?}",
                    url, self.connect_timeout
                )))
            });
        let transport = match transport {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Publisher connect failed: {}", e);
                link.report(LinkStatus::Lost(e.to_string()));
                return Err(e);
            }
        };

        let (queue, rx) = mpsc::channel(self.capacity);
        let queued = Arc::new(AtomicUsize::new(0));
        let congested = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(write_loop(
            transport,
            rx,
            link.clone(),
            queued.clone(),
            congested.clone(),
            self.published.clone(),
            self.capacity,
        ));

        let mut running = self.running();
        if running.is_some() {
            writer.abort();
            return Err(StreamingError::NetworkConnectFailure(
                "publisher already connected".to_string(),
            ));
        }
        *running = Some(Running {
            queue,
            writer,
            link,
            queued,
            congested,
        });
        log::info!("Publisher connected to {}", url);
        Ok(())
    }

    fn publish(&self, packet: EncodedPacket) {
        let running = self.running();
        let Some(running) = running.as_ref() else {
            return;
        };

        running.queued.fetch_add(1, Ordering::AcqRel);
        match running.queue.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                running.queued.fetch_sub(1, Ordering::AcqRel);
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !running.congested.swap(true, Ordering::AcqRel) {
                    log::warn!("Publish queue full, dropping packets");
                    running.link.report(LinkStatus::Degraded { dropped });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                running.queued.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    async fn close(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };
        drop(running.queue);

        let mut writer = running.writer;
        if tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
        {
            log::warn!("Publisher writer did not drain in time, aborting");
            writer.abort();
        }
        log::info!("Publisher closed");
    }
}

async fn write_loop(
    mut transport: Box<dyn Transport>,
    mut rx: mpsc::Receiver<EncodedPacket>,
    link: LinkSink,
    queued: Arc<AtomicUsize>,
    congested: Arc<AtomicBool>,
    published: Arc<AtomicU64>,
    capacity: usize,
) {
    while let Some(packet) = rx.recv().await {
        let remaining = queued.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if let Err(e) = transport.write_packet(&packet).await {
            log::error!("Publisher write failed: {}", e);
            link.report(LinkStatus::Lost(e.to_string()));
            rx.close();
            return;
        }
        published.fetch_add(1, Ordering::Relaxed);

        if remaining <= capacity / 2 && congested.swap(false, Ordering::AcqRel) {
            log::info!("Publish queue recovered");
        }
    }
    transport.shutdown().await;
}

/// Plain TCP connector. Dials the host and port of the push URL
/// (port 1935 when absent) and announces the URL path.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, StreamingError> {
        let (host, port) = socket_target(url)?;
        let mut stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| StreamingError::NetworkConnectFailure(format!("{host}:{port}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| StreamingError::NetworkConnectFailure(e.to_string()))?;

        let path = url.path().trim_start_matches('/');
        let path_len = u16::try_from(path.len())
            .map_err(|_| StreamingError::InvalidStream("publish path too long".to_string()))?;
        let mut hello = BytesMut::with_capacity(6 + path.len());
        hello.put_slice(TcpTransport::MAGIC);
        hello.put_u16(path_len);
        hello.put_slice(path.as_bytes());
        stream
            .write_all(&hello)
            .await
            .map_err(|e| StreamingError::NetworkConnectFailure(e.to_string()))?;

        Ok(Box::new(TcpTransport { stream }))
    }
}

/// Length-prefixed packet framing over TCP:
/// `kind:u8 timestamp_us:u64 len:u32 payload`.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub const MAGIC: &'static [u8; 4] = b"CRAB";
    pub const HEADER_LEN: usize = 13;
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_packet(&mut self, packet: &EncodedPacket) -> Result<(), StreamingError> {
        let len = u32::try_from(packet.data.len())
            .map_err(|_| StreamingError::EncodeFailure("packet too large".to_string()))?;
        let mut header = [0u8; TcpTransport::HEADER_LEN];
        header[0] = packet.kind.as_byte();
        header[1..9].copy_from_slice(&packet.timestamp_us.to_be_bytes());
        header[9..13].copy_from_slice(&len.to_be_bytes());

        let lost = |e: std::io::Error| StreamingError::NetworkLinkLost(e.to_string());
        self.stream.write_all(&header).await.map_err(lost)?;
        self.stream.write_all(&packet.data).await.map_err(lost)
    }

    async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PacketKind;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::sync::Semaphore;

    fn packet(sequence: u64) -> EncodedPacket {
        EncodedPacket {
            sequence,
            timestamp_us: sequence * 10,
            kind: PacketKind::VideoDelta,
            data: Bytes::from(vec![sequence as u8; 4]),
        }
    }

    #[derive(Clone)]
    struct MemoryConnector {
        written: Arc<Mutex<Vec<u64>>>,
        fail_after: Option<usize>,
        gate: Option<Arc<Semaphore>>,
    }

    struct MemoryTransport {
        written: Arc<Mutex<Vec<u64>>>,
        fail_after: Option<usize>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _url: &Url) -> Result<Box<dyn Transport>, StreamingError> {
            Ok(Box::new(MemoryTransport {
                written: self.written.clone(),
                fail_after: self.fail_after,
                gate: self.gate.clone(),
            }))
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn write_packet(&mut self, packet: &EncodedPacket) -> Result<(), StreamingError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let mut written = self.written.lock().unwrap();
            if self.fail_after == Some(written.len()) {
                return Err(StreamingError::NetworkLinkLost("reset".to_string()));
            }
            written.push(packet.sequence);
            Ok(())
        }

        async fn shutdown(&mut self) {}
    }

    fn memory(fail_after: Option<usize>, gate: Option<Arc<Semaphore>>) -> MemoryConnector {
        MemoryConnector {
            written: Arc::new(Mutex::new(Vec::new())),
            fail_after,
            gate,
        }
    }

    fn recording_sink() -> (LinkSink, Arc<Mutex<Vec<LinkStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook = seen.clone();
        (LinkSink::new(move |s| hook.lock().unwrap().push(s)), seen)
    }

    fn url() -> Url {
        Url::parse("rtmp://localhost/app/key").unwrap()
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let connector = memory(None, None);
        let publisher = BufferedPublisher::new(
            Arc::new(connector.clone()),
            64,
            Duration::from_secs(1),
        );
        publisher.connect(&url(), LinkSink::detached()).await.unwrap();

        for seq in 1..=20 {
            publisher.publish(packet(seq));
        }
        publisher.close().await;

        let written = connector.written.lock().unwrap().clone();
        assert_eq!(written, (1..=20).collect::<Vec<_>>());
        assert_eq!(publisher.published(), 20);
    }

    #[tokio::test]
    async fn test_overflow_reports_degraded_once() {
        let gate = Arc::new(Semaphore::new(0));
        let connector = memory(None, Some(gate.clone()));
        let publisher =
            BufferedPublisher::new(Arc::new(connector), 2, Duration::from_secs(1));
        let (sink, seen) = recording_sink();
        publisher.connect(&url(), sink).await.unwrap();

        for seq in 1..=10 {
            publisher.publish(packet(seq));
        }

        let seen_now = seen.lock().unwrap().clone();
        assert_eq!(seen_now.len(), 1);
        assert!(matches!(seen_now[0], LinkStatus::Degraded { .. }));
        assert!(!seen_now[0].is_fatal());
        assert!(publisher.dropped() >= 7);

        gate.add_permits(16);
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_write_failure_reports_lost_once() {
        let connector = memory(Some(2), None);
        let publisher =
            BufferedPublisher::new(Arc::new(connector), 16, Duration::from_secs(1));
        let (sink, seen) = recording_sink();
        publisher.connect(&url(), sink).await.unwrap();

        for seq in 1..=5 {
            publisher.publish(packet(seq));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![LinkStatus::Lost("Network link lost: reset".to_string())]);
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let publisher =
            BufferedPublisher::new(Arc::new(memory(None, None)), 4, Duration::from_secs(1));
        publisher.close().await;
        publisher.connect(&url(), LinkSink::detached()).await.unwrap();
        assert!(publisher.is_connected());
        publisher.close().await;
        publisher.close().await;
        assert!(!publisher.is_connected());
    }

    #[tokio::test]
    async fn test_tcp_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let publisher = BufferedPublisher::new(
            Arc::new(TcpConnector),
            4,
            Duration::from_millis(500),
        );
        let url = Url::parse(&format!("rtmp://127.0.0.1:{port}/app/key")).unwrap();
        let (sink, seen) = recording_sink();
        let result = publisher.connect(&url, sink).await;
        assert!(matches!(result, Err(StreamingError::NetworkConnectFailure(_))));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_fatal());
        assert!(!publisher.is_connected());
    }

    #[tokio::test]
    async fn test_tcp_framing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let publisher = BufferedPublisher::new(
            Arc::new(TcpConnector),
            4,
            Duration::from_secs(1),
        );
        let url = Url::parse(&format!("rtmp://127.0.0.1:{port}/app/key")).unwrap();
        publisher.connect(&url, LinkSink::detached()).await.unwrap();
        publisher.publish(packet(7));
        publisher.close().await;

        let buf = server.await.unwrap();
        assert_eq!(&buf[..4], b"CRAB");
        assert_eq!(&buf[4..6], &7u16.to_be_bytes());
        assert_eq!(&buf[6..13], b"app/key");
        let frame = &buf[13..];
        assert_eq!(frame[0], PacketKind::VideoDelta.as_byte());
        assert_eq!(&frame[1..9], &70u64.to_be_bytes());
        assert_eq!(&frame[9..13], &4u32.to_be_bytes());
        assert_eq!(&frame[13..], &[7, 7, 7, 7]);
    }
}
