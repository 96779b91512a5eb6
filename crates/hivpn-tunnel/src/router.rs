//! Packet Router
//!
//! Duplex forwarding between the virtual interface and the upstream
//! connection once both are up.
//!
//! # Tasks
//!
//! ```text
//!                 ┌──────────── interface loop ─────────────┐
//!  device.recv ──▶│ DNS query?  → stub reply ───────────────┼──▶ writer ──▶ device.send
//!                 │ upstream ok? → upstream.write           │       ▲
//!                 │ otherwise   → loopback ─────────────────┼───────┤
//!                 └─────────────────────────────────────────┘       │
//!  upstream.read ───────────── upstream loop ───────────────────────┘
//! ```
//!
//! The writer task is the only code that writes to the device, so
//! packets from the two directions are never interleaved. The loops stop
//! on a shared `CancellationToken`; a loop whose read ends while the
//! token is still live reports a tunnel failure and cancels the rest.

use crate::dns;
use crate::error::{Result, TunnelError};
use crate::interface::PacketDevice;
use crate::status::StatusReporter;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Packets buffered for the interface writer
const WRITE_QUEUE_DEPTH: usize = 256;

/// Default read buffer per direction
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default packets between statistics log lines
const DEFAULT_STATS_INTERVAL: u64 = 500;

/// Forwarding loops for one session
pub struct PacketRouter {
    device: Arc<dyn PacketDevice>,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
    buffer_size: usize,
    stats_log_interval: u64,
}

impl PacketRouter {
    pub fn new(
        device: Arc<dyn PacketDevice>,
        reporter: Arc<StatusReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device,
            reporter,
            cancel,
            buffer_size: DEFAULT_BUFFER_SIZE,
            stats_log_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Log statistics every `interval` packets (0 disables)
    pub fn with_stats_interval(mut self, interval: u64) -> Self {
        self.stats_log_interval = interval;
        self
    }

    /// Start forwarding over `upstream`
    ///
    /// Takes ownership of the connection; its halves live inside the two
    /// loops until they stop.
    pub fn spawn<S>(self, upstream: S) -> RouterTask
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (upstream_rx, upstream_tx) = tokio::io::split(upstream);
        let (to_interface, from_loops) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let writer = tokio::spawn(run_direction(
            "interface writer",
            write_to_interface(self.device.clone(), from_loops, self.cancel.clone()),
            self.reporter.clone(),
            self.cancel.clone(),
        ));

        let outbound = tokio::spawn(run_direction(
            "interface",
            forward_from_interface(
                self.device.clone(),
                upstream_tx,
                to_interface.clone(),
                self.reporter.clone(),
                self.cancel.clone(),
                self.buffer_size,
                self.stats_log_interval,
            ),
            self.reporter.clone(),
            self.cancel.clone(),
        ));

        let inbound = tokio::spawn(run_direction(
            "upstream",
            forward_from_upstream(
                upstream_rx,
                to_interface,
                self.reporter.clone(),
                self.cancel.clone(),
                self.buffer_size,
            ),
            self.reporter.clone(),
            self.cancel.clone(),
        ));

        debug!("Packet router started on {}", self.device.name());

        let handle = tokio::spawn(async move {
            let mut first_error = None;

            for (name, task) in [("interface", outbound), ("upstream", inbound), ("writer", writer)] {
                let result = task.await.unwrap_or_else(|e| {
                    Err(TunnelError::Io(io::Error::other(format!(
                        "{} task aborted: {}",
                        name, e
                    ))))
                });
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }

            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        });

        RouterTask {
            handle,
            cancel: self.cancel,
        }
    }
}

/// Handle to running forwarding loops
pub struct RouterTask {
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
}

impl RouterTask {
    /// Ask every loop to exit
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loops to end
    ///
    /// `Ok` after a requested stop; `Err` when a direction failed first.
    pub async fn join(self) -> Result<()> {
        self.handle.await.unwrap_or_else(|e| {
            Err(TunnelError::Io(io::Error::other(format!(
                "packet router aborted: {}",
                e
            ))))
        })
    }
}

/// Run one direction, turning an unrequested exit into a tunnel failure
async fn run_direction<F>(
    name: &'static str,
    direction: F,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    // Any exit, including a panic, takes the other directions down too
    let _guard = cancel.clone().drop_guard();

    let result = direction.await;
    match result {
        Ok(()) => {
            debug!("{} loop stopped", name);
            Ok(())
        }
        Err(e) if cancel.is_cancelled() => {
            debug!("{} loop stopped: {}", name, e);
            Ok(())
        }
        Err(e) => {
            warn!("{} loop failed: {}", name, e);
            reporter.mark_upstream_broken();
            Err(TunnelError::Io(e))
        }
    }
}

async fn forward_from_interface<W>(
    device: Arc<dyn PacketDevice>,
    mut upstream: W,
    to_interface: mpsc::Sender<Vec<u8>>,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
    buffer_size: usize,
    stats_log_interval: u64,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let counters = reporter.counters();

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = device.recv(&mut buf) => read,
        };

        let len = match read? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "virtual interface closed",
                ));
            }
            len => len,
        };
        let packet = &buf[..len];
        let total = counters.record_packet();

        if dns::is_dns_query(packet) {
            counters.record_dns_response();
            queue(&to_interface, dns::synthesize_response(packet)).await?;
        } else if reporter.upstream_healthy() {
            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                written = write_packet(&mut upstream, packet) => written,
            };
            match written {
                Ok(()) => counters.record_sent(len),
                Err(e) => {
                    warn!("Tunnel write failed: {}", e);
                    reporter.mark_upstream_broken();
                }
            }
        } else {
            // loopback: echo the packet unmodified
            queue(&to_interface, packet.to_vec()).await?;
        }

        if stats_log_interval > 0 && total % stats_log_interval == 0 {
            debug!(
                "Stats: {} packets, {} DNS responses [{}]",
                total,
                counters.dns_responses(),
                if reporter.upstream_healthy() { "TUNNEL ACTIVE" } else { "LOCAL MODE" }
            );
        }
    }
}

async fn forward_from_upstream<R>(
    mut upstream: R,
    to_interface: mpsc::Sender<Vec<u8>>,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
    buffer_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = upstream.read(&mut buf) => read,
        };

        let len = match read? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tunnel server closed the connection",
                ));
            }
            len => len,
        };

        reporter.counters().record_received(len);
        queue(&to_interface, buf[..len].to_vec()).await?;
    }
}

async fn write_to_interface(
    device: Arc<dyn PacketDevice>,
    mut packets: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> io::Result<()> {
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            packet = packets.recv() => match packet {
                Some(packet) => packet,
                None => return Ok(()),
            },
        };

        device.send(&packet).await?;
    }
}

async fn write_packet<W>(upstream: &mut W, packet: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    upstream.write_all(packet).await?;
    upstream.flush().await
}

async fn queue(to_interface: &mpsc::Sender<Vec<u8>>, packet: Vec<u8>) -> io::Result<()> {
    to_interface
        .send(packet)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface writer stopped"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{dns_query, udp_packet, wait_until, MockDevice};
    use crate::status::ConnectionState;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Upstream that never delivers and rejects every write
    struct BrokenUpstream;

    impl AsyncRead for BrokenUpstream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenUpstream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn active_reporter() -> Arc<StatusReporter> {
        let reporter = Arc::new(StatusReporter::new());
        reporter.transition(ConnectionState::Establishing).unwrap();
        reporter.transition(ConnectionState::TunnelConnected).unwrap();
        assert!(reporter.mark_tunnel_up());
        reporter.transition(ConnectionState::Active).unwrap();
        reporter
    }

    fn start(reporter: &Arc<StatusReporter>) -> (Arc<MockDevice>, DuplexStream, RouterTask) {
        let device = Arc::new(MockDevice::new("mock0", 1500));
        let (local, remote) = duplex(64 * 1024);
        let task = PacketRouter::new(device.clone(), reporter.clone(), CancellationToken::new())
            .with_buffer_size(2048)
            .spawn(local);
        (device, remote, task)
    }

    #[tokio::test]
    async fn test_packets_forwarded_upstream() {
        let reporter = active_reporter();
        let (device, mut server, task) = start(&reporter);

        let packet = udp_packet(443, b"hello tunnel");
        device.inject(packet.clone());

        let mut received = vec![0u8; packet.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, packet);
        assert_eq!(reporter.stats().packets_total, 1);
        assert_eq!(reporter.stats().bytes_sent, packet.len() as u64);

        task.stop();
        task.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_bytes_written_to_interface() {
        let reporter = active_reporter();
        let (device, mut server, task) = start(&reporter);

        server.write_all(b"from server").await.unwrap();
        let written = device.wait_for_written(1).await;
        assert_eq!(written[0], b"from server");
        assert_eq!(reporter.stats().bytes_received, 11);
        // upstream bytes are not interface packets
        assert_eq!(reporter.stats().packets_total, 0);

        task.stop();
        task.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_dns_answered_locally() {
        let reporter = active_reporter();
        let (device, mut server, task) = start(&reporter);

        let query = dns_query(0x4242);
        device.inject(query.clone());

        let written = device.wait_for_written(1).await;
        assert_eq!(written[0], dns::synthesize_response(&query));
        assert_eq!(reporter.stats().dns_responses, 1);
        assert_eq!(reporter.stats().packets_total, 1);

        // nothing went upstream
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), server.read(&mut buf)).await;
        assert!(read.is_err());

        task.stop();
        task.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_when_upstream_broken() {
        let reporter = active_reporter();
        reporter.mark_upstream_broken();
        let (device, _server, task) = start(&reporter);

        let packet = udp_packet(8080, b"echo me");
        device.inject(packet.clone());

        let written = device.wait_for_written(1).await;
        assert_eq!(written[0], packet);
        // soft degradation leaves the state alone
        assert_eq!(reporter.state(), ConnectionState::Active);

        task.stop();
        task.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_counter_increments_once_per_packet() {
        let reporter = active_reporter();
        let (device, mut server, task) = start(&reporter);

        let mut expected = 0;
        for i in 0..25u8 {
            let packet = if i % 5 == 0 { dns_query(i as u16) } else { udp_packet(1000, &[i; 16]) };
            if i % 5 != 0 {
                expected += packet.len();
            }
            device.inject(packet);
        }

        let mut upstream = vec![0u8; expected];
        server.read_exact(&mut upstream).await.unwrap();
        device.wait_for_written(5).await;

        let stats = reporter.stats();
        assert_eq!(stats.packets_total, 25);
        assert_eq!(stats.dns_responses, 5);

        task.stop();
        task.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_close_is_failure() {
        let reporter = active_reporter();
        let (_device, server, task) = start(&reporter);

        drop(server);

        let err = tokio::time::timeout(Duration::from_secs(5), task.join())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Io(_)));
        assert!(!reporter.upstream_healthy());
    }

    #[tokio::test]
    async fn test_interface_close_is_failure() {
        let reporter = active_reporter();
        let (device, _server, task) = start(&reporter);

        device.close();

        let err = tokio::time::timeout(Duration::from_secs(5), task.join())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Io(_)));
    }

    #[tokio::test]
    async fn test_stop_unblocks_pending_reads() {
        let reporter = active_reporter();
        let (_device, _server, task) = start(&reporter);

        // both loops are parked in reads with nothing to deliver
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        task.stop();
        tokio::time::timeout(Duration::from_secs(5), task.join())
            .await
            .unwrap()
            .unwrap();
        assert!(reporter.upstream_healthy());
    }

    #[tokio::test]
    async fn test_writes_are_whole_packets() {
        let reporter = active_reporter();
        reporter.mark_upstream_broken();
        let (device, mut server, task) = start(&reporter);

        for i in 0..50u8 {
            device.inject(udp_packet(9000, &[i; 64]));
        }
        for _ in 0..50 {
            server.write_all(&[0xAB; 32]).await.unwrap();
        }

        wait_until(|| {
            let written = device.written();
            written.iter().filter(|p| p.len() == 92).count() == 50
        })
        .await;

        for packet in device.written() {
            let looped = packet.len() == 92 && packet[28..].iter().all(|b| *b == packet[28]);
            let from_server = packet.iter().all(|b| *b == 0xAB);
            assert!(looped || from_server);
        }

        task.stop();
        task.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_switches_to_loopback() {
        let reporter = active_reporter();
        let device = Arc::new(MockDevice::new("mock0", 1500));
        let task = PacketRouter::new(device.clone(), reporter.clone(), CancellationToken::new())
            .with_buffer_size(2048)
            .spawn(BrokenUpstream);

        // the packet that hits the failed write is dropped
        device.inject(udp_packet(443, b"lost"));
        wait_until(|| !reporter.upstream_healthy()).await;
        assert!(device.written().is_empty());

        let packet = udp_packet(443, b"echoed");
        device.inject(packet.clone());
        let written = device.wait_for_written(1).await;
        assert_eq!(written, vec![packet]);

        assert_eq!(reporter.state(), ConnectionState::Active);
        assert!(!reporter.is_connected());
        let stats = reporter.stats();
        assert_eq!(stats.packets_total, 2);
        assert_eq!(stats.bytes_sent, 0);

        task.stop();
        task.join().await.unwrap();
    }
}
