//! TCP transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{report_read_end, READ_CHUNK};
use crate::ecr::transport::{
    ByteSink, ConnectionType, EcrTransport, IoContext, ReadEnd, TransportState, DEFAULT_PORT,
    DEFAULT_RECONNECT_DELAY, DEFAULT_WRITE_TIMEOUT_MS,
};

/// TCP transport for terminals reachable over LAN.
pub struct TcpTransport {
    connect_timeout: Duration,
    write_timeout: Duration,
    keep_alive: bool,
    reconnect_delay: Duration,
    peer: String,
    io: Option<IoContext>,
    writer: Option<OwnedWriteHalf>,
    /// Held between `connect` and `start_listening`.
    reader: Option<OwnedReadHalf>,
    open: Arc<AtomicBool>,
    state: TransportState,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            keep_alive: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            peer: String::new(),
            io: None,
            writer: None,
            reader: None,
            open: Arc::new(AtomicBool::new(false)),
            state: TransportState::Disconnected,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Try every resolved address in order; first success wins.
async fn open_stream(host: &str, port: u16, keep_alive: bool) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host((host, port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(keep_alive)?;
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("TCP connect to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    tx: UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
    peer: String,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break ReadEnd::Cancelled,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break ReadEnd::Closed,
                Ok(n) => {
                    trace!("TCP RX ({n} bytes) from {peer}");
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break ReadEnd::Cancelled;
                    }
                }
                Err(e) => {
                    error!("TCP read from {peer}: {e}");
                    break ReadEnd::Failed;
                }
            }
        }
    };
    open.store(false, Ordering::SeqCst);
    report_read_end("TCP", &peer, end);
}

impl EcrTransport for TcpTransport {
    fn connect(&mut self, address: &str, port: Option<u16>) -> Result<(), String> {
        if self.is_connected() {
            return Err(format!("TCP already connected to {}", self.peer));
        }
        // Leftovers of a connection the peer closed.
        self.disconnect();

        let port = port.unwrap_or(DEFAULT_PORT);
        self.peer = format!("{address}:{port}");
        self.state = TransportState::Connecting;
        info!("Connecting TCP to {}", self.peer);

        let io = IoContext::new("ecr-tcp-io")?;
        let timeout = self.connect_timeout;
        let keep_alive = self.keep_alive;
        let result = io.block_on(async {
            tokio::time::timeout(timeout, open_stream(address, port, keep_alive)).await
        });
        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = TransportState::Error;
                io.shutdown();
                error!("TCP connect to {} failed: {e}", self.peer);
                return Err(format!("TCP connect to {} failed: {e}", self.peer));
            }
            Err(_) => {
                self.state = TransportState::Error;
                io.shutdown();
                error!("TCP connect to {} timed out after {timeout:?}", self.peer);
                return Err(format!(
                    "TCP connect to {} timed out after {}ms",
                    self.peer,
                    timeout.as_millis()
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("TCP_NODELAY on {}: {e}", self.peer);
        }
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.io = Some(io);
        self.open.store(true, Ordering::SeqCst);
        self.state = TransportState::Connected;
        info!("TCP connected to {}", self.peer);
        Ok(())
    }

    fn disconnect(&mut self) {
        let Some(io) = self.io.take() else {
            self.state = TransportState::Disconnected;
            return;
        };
        if let Some(mut writer) = self.writer.take() {
            io.block_on(async move {
                let _ = writer.shutdown().await;
            });
        }
        self.reader = None;
        io.shutdown();
        self.open.store(false, Ordering::SeqCst);
        self.state = TransportState::Disconnected;
        info!("TCP disconnected from {}", self.peer);
    }

    fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
            && self.writer.is_some()
            && self.open.load(Ordering::SeqCst)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("TCP not connected".into());
        }
        let (Some(io), Some(writer)) = (self.io.as_ref(), self.writer.as_mut()) else {
            return Err("TCP not connected".into());
        };
        trace!("TCP TX ({} bytes) to {}", data.len(), self.peer);
        let timeout = self.write_timeout;
        let written = io.block_on(async {
            tokio::time::timeout(timeout, async {
                writer.write_all(data).await?;
                writer.flush().await
            })
            .await
        });
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state = TransportState::Error;
                error!("TCP write to {}: {e}", self.peer);
                Err(format!("TCP write: {e}"))
            }
            Err(_) => {
                // A partial frame may be on the wire; the stream is unusable.
                self.open.store(false, Ordering::SeqCst);
                self.state = TransportState::Error;
                error!("TCP write to {} timed out after {timeout:?}", self.peer);
                Err(format!(
                    "TCP write to {} timed out after {}ms",
                    self.peer,
                    timeout.as_millis()
                ))
            }
        }
    }

    fn start_listening(&mut self, on_bytes: ByteSink) -> Result<(), String> {
        let reader = self
            .reader
            .take()
            .ok_or("TCP not connected or already listening")?;
        let io = self.io.as_mut().ok_or("TCP not connected")?;
        let tx = io.spawn_dispatcher(on_bytes);
        let cancel = io.cancel_token();
        io.spawn(read_loop(
            reader,
            tx,
            cancel,
            self.open.clone(),
            self.peer.clone(),
        ));
        debug!("TCP receive loop started for {}", self.peer);
        Ok(())
    }

    fn enable_keep_alive(&mut self, enable: bool) {
        self.keep_alive = enable;
    }

    fn set_reconnect_delay(&mut self, delay: Duration) {
        self.reconnect_delay = delay;
    }

    fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Tcp
    }

    fn state(&self) -> TransportState {
        if self.state == TransportState::Connected && !self.open.load(Ordering::SeqCst) {
            TransportState::Disconnected
        } else {
            self.state
        }
    }

    fn description(&self) -> String {
        format!("TCP({})", self.peer)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    fn transport() -> TcpTransport {
        TcpTransport::new(Duration::from_millis(2000))
    }

    #[test]
    fn test_initial_state() {
        let t = transport();
        assert_eq!(t.state(), TransportState::Disconnected);
        assert!(!t.is_connected());
        assert_eq!(t.reconnect_delay(), DEFAULT_RECONNECT_DELAY);
    }

    #[test]
    fn test_send_without_connect_errors() {
        let mut t = transport();
        assert!(t.send(&[0x01]).is_err());
        assert!(t.start_listening(Arc::new(|_: &[u8]| {})).is_err());
    }

    #[test]
    fn test_connect_refused_reports_error() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut t = transport();
        let err = t.connect("127.0.0.1", Some(port)).unwrap_err();
        assert!(err.contains("127.0.0.1"));
        assert_eq!(t.state(), TransportState::Error);
        assert!(!t.is_connected());
    }

    #[test]
    fn test_send_to_stalled_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release, released) = std::sync::mpsc::channel::<()>();
        let server = std::thread::spawn(move || {
            // Accept but never read.
            let (_conn, _) = listener.accept().unwrap();
            let _ = released.recv();
        });

        let mut t = transport().with_write_timeout(Duration::from_millis(200));
        t.connect("127.0.0.1", Some(port)).unwrap();
        let started = std::time::Instant::now();
        let err = t.send(&vec![0x55u8; 64 * 1024 * 1024]).unwrap_err();
        assert!(err.contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(t.state(), TransportState::Error);
        assert!(!t.is_connected());

        t.disconnect();
        assert_eq!(t.state(), TransportState::Disconnected);
        release.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_connect_and_disconnect_inside_async_runtime() {
        // Queued connections complete the handshake without accept().
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let runtimes = [
            tokio::runtime::Runtime::new().unwrap(),
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap(),
        ];
        for runtime in runtimes {
            runtime.block_on(async {
                let mut t = transport();
                t.connect("127.0.0.1", Some(port)).unwrap();
                t.start_listening(Arc::new(|_: &[u8]| {})).unwrap();
                t.send(b"ping").unwrap();
                t.disconnect();
                assert_eq!(t.state(), TransportState::Disconnected);

                // Dropping a live transport goes through the same path.
                let mut dropped = transport();
                dropped.connect("127.0.0.1", Some(port)).unwrap();
                drop(dropped);
            });
        }
    }

    #[test]
    fn test_echo_round_trip_and_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
            // Closing the socket ends the client's receive loop.
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_received = received.clone();
        let mut t = transport();
        t.enable_keep_alive(true);
        t.connect("127.0.0.1", Some(port)).unwrap();
        assert!(t.is_connected());
        assert!(t.connect("127.0.0.1", Some(port)).is_err());
        t.start_listening(Arc::new(move |chunk: &[u8]| {
            sink_received.lock().unwrap().extend_from_slice(chunk);
        }))
        .unwrap();
        t.send(b"hello").unwrap();
        server.join().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while (t.is_connected() || received.lock().unwrap().len() < 5)
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().unwrap().as_slice(), b"hello");
        assert!(!t.is_connected());
        t.disconnect();
        t.disconnect();
        assert_eq!(t.state(), TransportState::Disconnected);
    }
}
