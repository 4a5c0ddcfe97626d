//! Frame transport to the device
//!
//! A [`Transport`] owns one channel to the device, either a serial line or
//! UDP datagrams to a WiFi bridge. The variant is picked from
//! [`TransportTarget`] when connecting. A background reader task decodes
//! incoming frames: announce frames flip the readiness flag, trace and
//! status frames are logged, and CoAP frames are queued for whichever
//! request is pending.
//!
//! Only one request is in flight at a time; concurrent callers queue on an
//! internal lock because the device side does not pipeline.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_COAP_PORT, TransportConfig, TransportTarget};
use crate::error::{CoreconfError, Result};
use crate::frame::{Frame, FrameDecoder, FrameType};

/// Queue depth for CoAP frames waiting to be claimed by a request
const INBOX_DEPTH: usize = 32;

/// Read size for stream links and datagram buffer size
const READ_CHUNK: usize = 2048;

/// Any bidirectional byte stream usable as a serial link
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

enum Writer {
    Stream(WriteHalf<Box<dyn ByteStream>>),
    Datagram(Arc<UdpSocket>),
}

impl Writer {
    async fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Writer::Stream(w) => {
                w.write_all(bytes).await?;
                w.flush().await
            }
            Writer::Datagram(socket) => socket.send(bytes).await.map(|_| ()),
        }
    }
}

struct Session {
    writer: AsyncMutex<Writer>,
    inbox: AsyncMutex<mpsc::Receiver<Frame>>,
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl Session {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoreconfError::ConnectionClosed),
            written = writer.write_frame(bytes) => written.map_err(CoreconfError::Io),
        }
    }
}

/// Routes decoded frames from the reader task
struct Dispatcher {
    frames: mpsc::Sender<Frame>,
    ready: watch::Sender<bool>,
}

impl Dispatcher {
    fn dispatch(&self, decoded: Result<Frame>) {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame.frame_type {
            FrameType::Announce => {
                let announce = String::from_utf8_lossy(&frame.payload);
                info!(announce = %announce, "device announced");
                self.ready.send_replace(true);
            }
            FrameType::Coap => {
                if let Err(e) = self.frames.try_send(frame) {
                    debug!(error = %e, "no room for CoAP frame, dropping");
                }
            }
            FrameType::Trace => {
                let text = String::from_utf8_lossy(&frame.payload);
                info!(trace = %text.trim_end(), "device trace");
            }
            other => {
                debug!(
                    frame_type = ?other,
                    bytes = frame.payload.len(),
                    "unsolicited frame"
                );
            }
        }
    }
}

/// Connection to the device carrying MUP1 frames
pub struct Transport {
    config: TransportConfig,
    session: Mutex<Option<Arc<Session>>>,
    request_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("target", &self.config.target)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            request_lock: AsyncMutex::new(()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open the configured channel, replacing any existing one
    pub async fn connect(&self) -> Result<()> {
        let target = self.config.target.describe();
        debug!(target = %target, "connecting");

        match &self.config.target {
            TransportTarget::Serial { device, baud_rate } => {
                let port = tokio_serial::new(device, *baud_rate)
                    .open_native_async()
                    .map_err(|e| CoreconfError::ConnectionFailed {
                        target: target.clone(),
                        source: e.into(),
                    })?;
                self.connect_stream(port);
            }
            TransportTarget::WifiBridge { address } => {
                let socket = open_udp(&with_default_port(address)).await.map_err(|e| {
                    CoreconfError::ConnectionFailed {
                        target: target.clone(),
                        source: e,
                    }
                })?;
                self.connect_datagram(socket);
                // The bridge learns our address from the first datagram it sees
                self.session()?
                    .send(&Frame::new(FrameType::Ping, Vec::new()).encode())
                    .await?;
            }
        }

        info!(target = %target, "connected");
        Ok(())
    }

    /// Use an already-open byte stream as the serial link
    pub fn connect_stream<S: ByteStream>(&self, stream: S) {
        let boxed: Box<dyn ByteStream> = Box::new(stream);
        let (rx, tx) = tokio::io::split(boxed);
        self.install(Writer::Stream(tx), |dispatcher, cancel| {
            tokio::spawn(read_stream(rx, dispatcher, cancel))
        });
    }

    fn connect_datagram(&self, socket: UdpSocket) {
        let socket = Arc::new(socket);
        let reader_socket = Arc::clone(&socket);
        self.install(Writer::Datagram(socket), |dispatcher, cancel| {
            tokio::spawn(read_datagrams(reader_socket, dispatcher, cancel))
        });
    }

    fn install<F>(&self, writer: Writer, spawn_reader: F)
    where
        F: FnOnce(Dispatcher, CancellationToken) -> JoinHandle<()>,
    {
        self.disconnect();

        let (frames_tx, frames_rx) = mpsc::channel(INBOX_DEPTH);
        let (ready_tx, ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            frames: frames_tx,
            ready: ready_tx,
        };
        let reader = spawn_reader(dispatcher, cancel.clone());

        let session = Session {
            writer: AsyncMutex::new(writer),
            inbox: AsyncMutex::new(frames_rx),
            ready: ready_rx,
            cancel,
            reader,
        };
        *self.lock_session() = Some(Arc::new(session));
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Arc<Session>>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.lock_session()
            .as_ref()
            .map(Arc::clone)
            .ok_or(CoreconfError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|s| !s.cancel.is_cancelled() && !s.reader.is_finished())
    }

    /// Wait until the device has sent an announce frame.
    ///
    /// Returns immediately if one was already seen on this connection.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let session = self.session()?;
        let mut ready = session.ready.clone();

        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => return Err(CoreconfError::ConnectionClosed),
            waited = tokio::time::timeout(timeout, ready.wait_for(|announced| *announced)) => {
                waited.map(|seen| seen.is_ok())
            }
        };

        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreconfError::ConnectionClosed),
            Err(_) => Err(CoreconfError::ReadyTimeout(timeout.as_millis() as u64)),
        }
    }

    /// Frame and send a CoAP message, then wait for the response whose
    /// message ID matches.
    ///
    /// On each per-attempt timeout the same bytes are retransmitted, up to
    /// the configured retry budget.
    pub async fn send_request(&self, coap: &[u8], message_id: u16) -> Result<Vec<u8>> {
        let _exclusive = self.request_lock.lock().await;
        let session = self.session()?;

        let wire = Frame::new(FrameType::Coap, coap.to_vec()).encode();
        let timeout = self.config.request_timeout();
        let attempts = self.config.max_retries + 1;

        let mut inbox = session.inbox.lock().await;
        while let Ok(stale) = inbox.try_recv() {
            debug!(
                message_id = ?peek_message_id(&stale.payload),
                "discarding CoAP frame received outside a request"
            );
        }

        for attempt in 1..=attempts {
            if attempt > 1 {
                warn!(message_id, attempt, "no response, retransmitting");
            } else {
                debug!(message_id, bytes = coap.len(), "sending request");
            }
            session.send(&wire).await?;

            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => return Err(CoreconfError::ConnectionClosed),
                    received = inbox.recv() => {
                        let Some(frame) = received else {
                            return Err(CoreconfError::ConnectionClosed);
                        };
                        match peek_message_id(&frame.payload) {
                            Some(id) if id == message_id => {
                                debug!(message_id, bytes = frame.payload.len(), "response received");
                                return Ok(frame.payload);
                            }
                            other => debug!(
                                expected = message_id,
                                received = ?other,
                                "ignoring unrelated CoAP frame"
                            ),
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        Err(CoreconfError::RequestTimeout {
            message_id,
            attempts,
        })
    }

    /// Release the channel. Safe to call when never connected.
    ///
    /// Any suspended `send_request` or `wait_for_ready` fails with
    /// `ConnectionClosed`.
    pub fn disconnect(&self) {
        if let Some(session) = self.lock_session().take() {
            session.cancel.cancel();
            session.reader.abort();
            info!(target = %self.config.target.describe(), "disconnected");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn peek_message_id(coap: &[u8]) -> Option<u16> {
    match coap {
        [_, _, hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

fn with_default_port(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_COAP_PORT).to_string();
    }
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{address}:{DEFAULT_COAP_PORT}"),
    }
}

async fn open_udp(address: &str) -> std::io::Result<UdpSocket> {
    let peer = tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve"),
        )
    })?;
    let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

async fn read_stream(
    mut rx: ReadHalf<Box<dyn ByteStream>>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = rx.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("serial link closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "serial read failed");
                    break;
                }
            },
        };
        for decoded in decoder.push(&buf[..n]) {
            dispatcher.dispatch(decoded);
        }
    }
}

async fn read_datagrams(socket: Arc<UdpSocket>, dispatcher: Dispatcher, cancel: CancellationToken) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(n) => n,
                Err(e) => {
                    // ICMP port-unreachable surfaces here; the bridge may not be up yet.
                    debug!(error = %e, "datagram receive failed");
                    continue;
                }
            },
        };
        dispatcher.dispatch(Frame::decode(&buf[..n]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn test_config(target: TransportTarget) -> TransportConfig {
        TransportConfig {
            target,
            request_timeout_ms: 50,
            max_retries: 2,
            ready_timeout_ms: 200,
        }
    }

    fn serial_transport() -> (Transport, DuplexStream) {
        let transport = Transport::new(test_config(TransportTarget::default()));
        let (ours, device) = tokio::io::duplex(4096);
        transport.connect_stream(ours);
        (transport, device)
    }

    fn coap_with_id(id: u16, body: &[u8]) -> Vec<u8> {
        let mut msg = vec![0x60, 0x45];
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(body);
        msg
    }

    /// Reads frames from the device end of a duplex and answers CoAP frames
    /// after ignoring the first `ignore` of them.
    async fn fake_device(device: DuplexStream, ignore: usize) -> usize {
        let (mut rx, mut tx) = tokio::io::split(device);
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 512];
        let mut seen = 0;
        loop {
            let n = match rx.read(&mut buf).await {
                Ok(0) | Err(_) => return seen,
                Ok(n) => n,
            };
            for frame in decoder.push(&buf[..n]).into_iter().flatten() {
                seen += 1;
                if seen <= ignore {
                    continue;
                }
                let id = peek_message_id(&frame.payload).unwrap();
                let trace = Frame::new(FrameType::Trace, b"handling request".to_vec());
                let stale = Frame::new(FrameType::Coap, coap_with_id(id.wrapping_add(7), b"old"));
                let reply = Frame::new(FrameType::Coap, coap_with_id(id, b"reply"));
                for f in [trace, stale, reply] {
                    if tx.write_all(&f.encode()).await.is_err() {
                        return seen;
                    }
                }
            }
        }
    }

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("192.168.4.1"), "192.168.4.1:5683");
        assert_eq!(with_default_port("10.0.0.2:6000"), "10.0.0.2:6000");
        assert_eq!(with_default_port("bridge.local"), "bridge.local:5683");
        assert_eq!(with_default_port("::1"), "[::1]:5683");
    }

    #[test]
    fn test_disconnect_without_connect() {
        let transport = Transport::new(TransportConfig::default());
        transport.disconnect();
        transport.disconnect();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let transport = Transport::new(TransportConfig::default());
        let err = transport.send_request(&coap_with_id(1, b""), 1).await.unwrap_err();
        assert!(matches!(err, CoreconfError::NotConnected));
    }

    #[tokio::test]
    async fn test_serial_connect_failure() {
        let transport = Transport::new(test_config(TransportTarget::Serial {
            device: "/dev/does-not-exist-tsn".into(),
            baud_rate: 115_200,
        }));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, CoreconfError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_ready_after_announce() {
        let (transport, mut device) = serial_transport();
        device
            .write_all(&Frame::new(FrameType::Announce, b"VelocitySP-v2025.03".to_vec()).encode())
            .await
            .unwrap();
        transport.wait_for_ready(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_times_out_without_announce() {
        let (transport, mut device) = serial_transport();
        device
            .write_all(&Frame::new(FrameType::Trace, b"booting".to_vec()).encode())
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = transport
            .wait_for_ready(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreconfError::ReadyTimeout(100)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_request_matches_message_id() {
        let (transport, device) = serial_transport();
        let device_task = tokio::spawn(fake_device(device, 0));

        let response = transport
            .send_request(&coap_with_id(0x1234, b"req"), 0x1234)
            .await
            .unwrap();
        assert_eq!(response, coap_with_id(0x1234, b"reply"));

        transport.disconnect();
        drop(transport);
        assert_eq!(device_task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retransmits_after_timeout() {
        let (transport, device) = serial_transport();
        let device_task = tokio::spawn(fake_device(device, 1));

        let response = transport
            .send_request(&coap_with_id(7, b"req"), 7)
            .await
            .unwrap();
        assert_eq!(response, coap_with_id(7, b"reply"));

        drop(transport);
        assert_eq!(device_task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_timeout_after_retry_budget() {
        let (transport, device) = serial_transport();
        let device_task = tokio::spawn(fake_device(device, usize::MAX));

        let err = transport
            .send_request(&coap_with_id(9, b"req"), 9)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreconfError::RequestTimeout {
                message_id: 9,
                attempts: 3
            }
        ));

        drop(transport);
        assert_eq!(device_task.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_request() {
        let transport = Arc::new(Transport::new(TransportConfig {
            request_timeout_ms: 10_000,
            ..test_config(TransportTarget::default())
        }));
        let (ours, _device) = tokio::io::duplex(1024);
        transport.connect_stream(ours);

        let pending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send_request(&coap_with_id(3, b""), 3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.disconnect();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreconfError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_ready_wait() {
        let transport = Arc::new(Transport::new(test_config(TransportTarget::default())));
        let (ours, _device) = tokio::io::duplex(1024);
        transport.connect_stream(ours);

        let waiting = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.wait_for_ready(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.disconnect();

        let started = tokio::time::Instant::now();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreconfError::ConnectionClosed));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_udp_bridge_exchange() {
        let bridge = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = bridge.local_addr().unwrap().to_string();
        let transport = Transport::new(test_config(TransportTarget::WifiBridge { address }));
        transport.connect().await.unwrap();

        let device = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, _) = bridge.recv_from(&mut buf).await.unwrap();
            assert_eq!(Frame::decode(&buf[..n]).unwrap().frame_type, FrameType::Ping);

            let (n, peer) = bridge.recv_from(&mut buf).await.unwrap();
            let request = Frame::decode(&buf[..n]).unwrap();
            assert_eq!(request.frame_type, FrameType::Coap);

            let announce = Frame::new(FrameType::Announce, b"bridge".to_vec());
            bridge.send_to(&announce.encode(), peer).await.unwrap();
            let reply = Frame::new(FrameType::Coap, coap_with_id(0x0101, b"ok"));
            bridge.send_to(&reply.encode(), peer).await.unwrap();
        });

        let response = transport
            .send_request(&coap_with_id(0x0101, b"hi"), 0x0101)
            .await
            .unwrap();
        assert_eq!(response, coap_with_id(0x0101, b"ok"));
        transport.wait_for_ready(Duration::from_millis(500)).await.unwrap();
        device.await.unwrap();
    }
}
