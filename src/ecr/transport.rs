//! Transport layer for terminal communication.
//!
//! Defines the `EcrTransport` trait, the connection-type tag used by driver
//! settings, and the background I/O context shared by the concrete TCP and
//! WebSocket transports. Each connection owns one small tokio runtime that
//! lives only while connected: a reader task pulls bytes off the socket and a
//! dispatcher task hands every chunk to the registered sink.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::transports::{tcp::TcpTransport, websocket::WebSocketTransport};

/// Port used when the caller gives none.
pub const DEFAULT_PORT: u16 = 2000;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);
/// Upper bound on one frame write; a terminal that stops reading fails the send.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;

/// How long `disconnect` waits for the background tasks to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Receives every chunk read from the connection, on the I/O thread.
pub type ByteSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

// ---------------------------------------------------------------------------
// Connection type
// ---------------------------------------------------------------------------

/// Physical connection kind, as stored in driver settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Tcp,
    Com,
    WebSocket,
    Usb,
}

impl ConnectionType {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionType::Tcp => "TCP",
            ConnectionType::Com => "COM",
            ConnectionType::WebSocket => "WebSocket",
            ConnectionType::Usb => "USB",
        }
    }

    pub fn index(self) -> u8 {
        match self {
            ConnectionType::Tcp => 0,
            ConnectionType::Com => 1,
            ConnectionType::WebSocket => 2,
            ConnectionType::Usb => 3,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    /// Accepts the settings index (`"0"`..`"3"`) or the name, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(index) = s.parse::<u8>() {
            return match index {
                0 => Ok(ConnectionType::Tcp),
                1 => Ok(ConnectionType::Com),
                2 => Ok(ConnectionType::WebSocket),
                3 => Ok(ConnectionType::Usb),
                other => Err(format!("Unknown connection type index: {other}")),
            };
        }
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "network" => Ok(ConnectionType::Tcp),
            "com" | "serial" => Ok(ConnectionType::Com),
            "websocket" | "ws" => Ok(ConnectionType::WebSocket),
            "usb" => Ok(ConnectionType::Usb),
            other => Err(format!("Unknown connection type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport state
// ---------------------------------------------------------------------------

/// Connection state for transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Duplex byte-stream connection to a terminal.
///
/// Failures come back as `Err(String)` after being logged; nothing panics.
/// Transports never reconnect on their own.
pub trait EcrTransport: Send {
    /// Resolve `address` and connect. Fails if already connected.
    fn connect(&mut self, address: &str, port: Option<u16>) -> Result<(), String>;

    /// Stop the receive pump, wait for it, and close the socket. Idempotent.
    fn disconnect(&mut self);

    /// Socket open/closed state only, not protocol readiness.
    fn is_connected(&self) -> bool;

    /// Write one complete frame.
    fn send(&mut self, data: &[u8]) -> Result<(), String>;

    /// Start the background read loop; every chunk read is handed to
    /// `on_bytes` until EOF, cancellation or a read error.
    fn start_listening(&mut self, on_bytes: ByteSink) -> Result<(), String>;

    fn enable_keep_alive(&mut self, enable: bool);

    fn set_reconnect_delay(&mut self, delay: Duration);

    fn reconnect_delay(&self) -> Duration;

    fn connection_type(&self) -> ConnectionType;

    /// Current transport state.
    fn state(&self) -> TransportState;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Background I/O context
// ---------------------------------------------------------------------------

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadEnd {
    Closed,
    Cancelled,
    Failed,
}

/// Runtime plus tasks backing one live connection.
pub(crate) struct IoContext {
    runtime: tokio::runtime::Runtime,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl IoContext {
    pub(crate) fn new(thread_name: &str) -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(thread_name)
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start I/O runtime: {e}"))?;
        Ok(Self {
            runtime,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub(crate) fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        off_runtime(|| self.runtime.block_on(future))
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(self.runtime.spawn(future));
    }

    /// Channel a reader task feeds; the receiving end is drained into `sink`.
    pub(crate) fn spawn_dispatcher(&mut self, sink: ByteSink) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.spawn(async move {
            while let Some(chunk) = rx.recv().await {
                sink(&chunk);
            }
        });
        tx
    }

    /// Cancel every task, wait for them, then drop the runtime.
    pub(crate) fn shutdown(self) {
        off_runtime(move || self.stop());
    }

    fn stop(mut self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        let joined = self.runtime.block_on(async move {
            tokio::time::timeout(SHUTDOWN_GRACE, async move {
                for task in tasks {
                    let _ = task.await;
                }
            })
            .await
        });
        if joined.is_err() {
            warn!("I/O tasks did not stop within {SHUTDOWN_GRACE:?}");
        }
        self.runtime.shutdown_timeout(SHUTDOWN_GRACE);
        debug!("I/O context stopped");
    }
}

/// Run `f` on the calling thread, or on a scoped thread when the caller is
/// itself driving a tokio runtime, where blocking on or dropping another
/// runtime panics.
fn off_runtime<R, F>(f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return f();
    }
    std::thread::scope(|scope| match scope.spawn(f).join() {
        Ok(out) => out,
        Err(panic) => std::panic::resume_unwind(panic),
    })
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Create a transport for a connection type. `details` carries per-transport
/// knobs (`connectTimeoutMs`, `writeTimeoutMs`).
pub fn create_transport(
    connection_type: ConnectionType,
    details: &serde_json::Value,
) -> Result<Box<dyn EcrTransport>, String> {
    let timeout = details
        .get("connectTimeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
    let timeout = Duration::from_millis(timeout);
    let write_timeout = details
        .get("writeTimeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_WRITE_TIMEOUT_MS);
    let write_timeout = Duration::from_millis(write_timeout);

    match connection_type {
        ConnectionType::Tcp => Ok(Box::new(
            TcpTransport::new(timeout).with_write_timeout(write_timeout),
        )),
        ConnectionType::WebSocket => Ok(Box::new(
            WebSocketTransport::new(timeout).with_write_timeout(write_timeout),
        )),
        ConnectionType::Com | ConnectionType::Usb => Err(format!(
            "{connection_type} transport is not implemented. Use TCP or WebSocket connection instead."
        )),
    }
}

// ---------------------------------------------------------------------------
// Scripted transport (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Produces the reply frames for one request (the JSON of the sent frame).
    pub(crate) type Responder = Arc<dyn Fn(&serde_json::Value) -> Vec<Vec<u8>> + Send + Sync>;

    #[derive(Debug, Default)]
    pub(crate) struct MockLog {
        pub connects: usize,
        pub disconnects: usize,
        pub listens: usize,
        pub sent: Vec<serde_json::Value>,
        pub keep_alive: bool,
        pub reconnect_delay: Option<Duration>,
    }

    /// In-memory transport: every send is answered synchronously by the
    /// responder through the registered sink.
    pub(crate) struct ScriptedTransport {
        log: Arc<Mutex<MockLog>>,
        responder: Responder,
        sink: Option<ByteSink>,
        connected: bool,
        refuse_connect_from: Option<usize>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(responder: Responder) -> (Self, Arc<Mutex<MockLog>>) {
            let log = Arc::new(Mutex::new(MockLog::default()));
            (
                Self {
                    log: log.clone(),
                    responder,
                    sink: None,
                    connected: false,
                    refuse_connect_from: None,
                },
                log,
            )
        }

        /// Fail the n-th (1-based) and later connect attempts.
        pub(crate) fn refuse_connect_from(mut self, attempt: usize) -> Self {
            self.refuse_connect_from = Some(attempt);
            self
        }
    }

    /// Frame a JSON value the way the terminal does.
    pub(crate) fn frame(value: serde_json::Value) -> Vec<u8> {
        let mut data = serde_json::to_vec(&value).unwrap();
        data.push(0);
        data
    }

    impl EcrTransport for ScriptedTransport {
        fn connect(&mut self, _address: &str, _port: Option<u16>) -> Result<(), String> {
            if self.connected {
                return Err("already connected".into());
            }
            let mut log = self.log.lock().unwrap();
            log.connects += 1;
            if self.refuse_connect_from.is_some_and(|n| log.connects >= n) {
                return Err("connection refused".into());
            }
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            if self.connected {
                self.log.lock().unwrap().disconnects += 1;
            }
            self.connected = false;
            self.sink = None;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn send(&mut self, data: &[u8]) -> Result<(), String> {
            if !self.connected {
                return Err("not connected".into());
            }
            let json: serde_json::Value =
                serde_json::from_slice(&data[..data.len() - 1]).map_err(|e| e.to_string())?;
            self.log.lock().unwrap().sent.push(json.clone());
            if let Some(sink) = &self.sink {
                for reply in (self.responder)(&json) {
                    sink(&reply);
                }
            }
            Ok(())
        }

        fn start_listening(&mut self, on_bytes: ByteSink) -> Result<(), String> {
            self.log.lock().unwrap().listens += 1;
            self.sink = Some(on_bytes);
            Ok(())
        }

        fn enable_keep_alive(&mut self, enable: bool) {
            self.log.lock().unwrap().keep_alive = enable;
        }

        fn set_reconnect_delay(&mut self, delay: Duration) {
            self.log.lock().unwrap().reconnect_delay = Some(delay);
        }

        fn reconnect_delay(&self) -> Duration {
            self.log
                .lock()
                .unwrap()
                .reconnect_delay
                .unwrap_or(DEFAULT_RECONNECT_DELAY)
        }

        fn connection_type(&self) -> ConnectionType {
            ConnectionType::Tcp
        }

        fn state(&self) -> TransportState {
            if self.connected {
                TransportState::Connected
            } else {
                TransportState::Disconnected
            }
        }

        fn description(&self) -> String {
            "Scripted".into()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
