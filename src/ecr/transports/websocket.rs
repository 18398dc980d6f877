//! WebSocket transport.
//!
//! Frames are carried as binary WebSocket messages; text messages from the
//! terminal are accepted and fed to the sink as their UTF-8 bytes. Keep-alive
//! is a periodic ping frame.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::report_read_end;
use crate::ecr::transport::{
    ByteSink, ConnectionType, EcrTransport, IoContext, ReadEnd, TransportState, DEFAULT_PORT,
    DEFAULT_RECONNECT_DELAY, DEFAULT_WRITE_TIMEOUT_MS,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<AsyncMutex<SplitSink<WsStream, Message>>>;

const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Build the endpoint URL. Addresses that already carry a scheme are used
/// as given.
pub fn endpoint_url(address: &str, port: u16) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{address}:{port}/")
    }
}

/// WebSocket transport for terminals exposing a WS endpoint.
pub struct WebSocketTransport {
    connect_timeout: Duration,
    write_timeout: Duration,
    keep_alive: bool,
    reconnect_delay: Duration,
    url: String,
    io: Option<IoContext>,
    writer: Option<WsWriter>,
    /// Held between `connect` and `start_listening`.
    reader: Option<SplitStream<WsStream>>,
    open: Arc<AtomicBool>,
    state: TransportState,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            keep_alive: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            url: String::new(),
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

async fn read_loop(
    mut reader: SplitStream<WsStream>,
    tx: UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
    url: String,
) {
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break ReadEnd::Cancelled,
            next = reader.next() => {
                let data = match next {
                    None | Some(Ok(Message::Close(_))) => break ReadEnd::Closed,
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("WebSocket read from {url}: {e}");
                        break ReadEnd::Failed;
                    }
                };
                trace!("WebSocket RX ({} bytes) from {url}", data.len());
                if tx.send(data).is_err() {
                    break ReadEnd::Cancelled;
                }
            }
        }
    };
    open.store(false, Ordering::SeqCst);
    report_read_end("WebSocket", &url, end);
}

async fn ping_loop(writer: WsWriter, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = writer.lock().await.send(Message::Ping(Vec::new())).await {
                    debug!("WebSocket keep-alive ping failed: {e}");
                    return;
                }
            }
        }
    }
}

impl EcrTransport for WebSocketTransport {
    fn connect(&mut self, address: &str, port: Option<u16>) -> Result<(), String> {
        if self.is_connected() {
            return Err(format!("WebSocket already connected to {}", self.url));
        }
        self.disconnect();

        self.url = endpoint_url(address, port.unwrap_or(DEFAULT_PORT));
        self.state = TransportState::Connecting;
        info!("Connecting WebSocket to {}", self.url);

        let mut io = IoContext::new("ecr-ws-io")?;
        let timeout = self.connect_timeout;
        let url = self.url.clone();
        let result = io.block_on(async { tokio::time::timeout(timeout, connect_async(url)).await });
        let stream = match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.state = TransportState::Error;
                io.shutdown();
                error!("WebSocket connect to {} failed: {e}", self.url);
                return Err(format!("WebSocket connect to {} failed: {e}", self.url));
            }
            Err(_) => {
                self.state = TransportState::Error;
                io.shutdown();
                error!("WebSocket connect to {} timed out after {timeout:?}", self.url);
                return Err(format!(
                    "WebSocket connect to {} timed out after {}ms",
                    self.url,
                    timeout.as_millis()
                ));
            }
        };

        let (writer, reader) = stream.split();
        let writer: WsWriter = Arc::new(AsyncMutex::new(writer));
        if self.keep_alive {
            let cancel = io.cancel_token();
            io.spawn(ping_loop(writer.clone(), cancel));
        }
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.io = Some(io);
        self.open.store(true, Ordering::SeqCst);
        self.state = TransportState::Connected;
        info!("WebSocket connected to {}", self.url);
        Ok(())
    }

    fn disconnect(&mut self) {
        let Some(io) = self.io.take() else {
            self.state = TransportState::Disconnected;
            return;
        };
        if let Some(writer) = self.writer.take() {
            let closing = io.block_on(async move {
                tokio::time::timeout(Duration::from_secs(1), async move {
                    writer.lock().await.close().await
                })
                .await
            });
            if let Ok(Err(e)) = closing {
                debug!("WebSocket close handshake with {}: {e}", self.url);
            }
        }
        self.reader = None;
        io.shutdown();
        self.open.store(false, Ordering::SeqCst);
        self.state = TransportState::Disconnected;
        info!("WebSocket disconnected from {}", self.url);
    }

    fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
            && self.writer.is_some()
            && self.open.load(Ordering::SeqCst)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("WebSocket not connected".into());
        }
        let (Some(io), Some(writer)) = (self.io.as_ref(), self.writer.as_ref()) else {
            return Err("WebSocket not connected".into());
        };
        trace!("WebSocket TX ({} bytes) to {}", data.len(), self.url);
        let frame = Message::Binary(data.to_vec());
        let timeout = self.write_timeout;
        let sent = io.block_on(async {
            tokio::time::timeout(timeout, async { writer.lock().await.send(frame).await }).await
        });
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state = TransportState::Error;
                error!("WebSocket write to {}: {e}", self.url);
                Err(format!("WebSocket write: {e}"))
            }
            Err(_) => {
                self.open.store(false, Ordering::SeqCst);
                self.state = TransportState::Error;
                error!("WebSocket write to {} timed out after {timeout:?}", self.url);
                Err(format!(
                    "WebSocket write to {} timed out after {}ms",
                    self.url,
                    timeout.as_millis()
                ))
            }
        }
    }

    fn start_listening(&mut self, on_bytes: ByteSink) -> Result<(), String> {
        let reader = self
            .reader
            .take()
            .ok_or("WebSocket not connected or already listening")?;
        let io = self.io.as_mut().ok_or("WebSocket not connected")?;
        let tx = io.spawn_dispatcher(on_bytes);
        let cancel = io.cancel_token();
        io.spawn(read_loop(
            reader,
            tx,
            cancel,
            self.open.clone(),
            self.url.clone(),
        ));
        debug!("WebSocket receive loop started for {}", self.url);
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
        ConnectionType::WebSocket
    }

    fn state(&self) -> TransportState {
        if self.state == TransportState::Connected && !self.open.load(Ordering::SeqCst) {
            TransportState::Disconnected
        } else {
            self.state
        }
    }

    fn description(&self) -> String {
        format!("WebSocket({})", self.url)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
