//! Payment terminal emulator.
//!
//! Speaks the JSON channel protocol over TCP or WebSocket the way a PAX
//! terminal does: answers ping, identify, status queries and payment methods.
//! Behaviour (busy, forced response codes, silence, delays, chunked or noisy
//! writes) is switchable at runtime so integration tests and manual runs can
//! exercise every controller path.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ecr::protocol::*;

const GARBAGE_FRAME: &[u8] = b"{\"method\": \"Purchase\", broken\x00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorKind {
    Tcp,
    WebSocket,
}

/// Switchable terminal behaviour.
#[derive(Debug, Clone)]
pub struct EmulatorBehavior {
    /// Answer payments with a `deviceBusy` service message.
    pub busy: bool,
    /// Answer payments with this response code (and `error_description`).
    pub response_code: Option<String>,
    pub error_description: String,
    /// Leave payments unanswered until an `interrupt` arrives.
    pub silent_payments: bool,
    pub silent_ping: bool,
    pub identify_result: String,
    pub vendor: String,
    pub model: String,
    pub last_result: String,
    pub last_stat_msg_code: String,
    /// Wait before writing a reply.
    pub reply_delay: Duration,
    /// Split outgoing bytes into writes of this size.
    pub chunk_size: Option<usize>,
    /// Precede every reply with an unparseable datagram.
    pub inject_garbage: bool,
}

impl Default for EmulatorBehavior {
    fn default() -> Self {
        Self {
            busy: false,
            response_code: None,
            error_description: String::new(),
            silent_payments: false,
            silent_ping: false,
            identify_result: "true".into(),
            vendor: "PAX".into(),
            model: "s800".into(),
            last_result: "1".into(),
            last_stat_msg_code: "0".into(),
            reply_delay: Duration::ZERO,
            chunk_size: None,
            inject_garbage: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

/// Per-connection state.
#[derive(Debug, Default)]
pub struct EmulatorSession {
    buffer: Vec<u8>,
    /// Payment method left unanswered, answered with 1001 on interrupt.
    pending: Option<String>,
}

fn reply(method: &str, params: Value, error: bool, description: &str) -> Value {
    json!({
        "method": method,
        "step": 0,
        "params": params,
        "error": error,
        "errorDescription": description,
    })
}

fn service_reply(params: Value) -> Value {
    reply(METHOD_SERVICE_MESSAGE, params, false, "")
}

fn is_payment_method(method: &str) -> bool {
    [
        METHOD_PURCHASE,
        METHOD_REFUND,
        METHOD_WITHDRAWAL,
        METHOD_PREAUTHORIZATION,
        METHOD_SALE_COMPLETION,
        METHOD_CASHBACK,
    ]
    .iter()
    .any(|m| m.eq_ignore_ascii_case(method))
}

fn approved_params(request_params: &Map<String, Value>, seq: u64) -> Value {
    let now = chrono::Local::now();
    let text = |key: &str| {
        request_params
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let discount = match text("discount") {
        d if d.is_empty() => "0.00".to_string(),
        d => d,
    };
    json!({
        "amount": text("amount"),
        "approvalCode": format!("{:06}", 100_000 + seq % 900_000),
        "captureReference": "",
        "cardExpiryDate": format!("{}", now.format("%m%y")),
        "cardHolderName": format!("USER{:04}", seq % 10_000),
        "date": now.format("%d.%m.%Y").to_string(),
        "discount": discount,
        "hstFld63Sf89": "",
        "invoiceNumber": format!("{:06}", seq),
        "issuerName": "VISA",
        "merchant": text("merchantId"),
        "pan": "4731XXXXXXXX9838",
        "posConditionCode": "00",
        "posEntryMode": "022",
        "processingCode": "000000",
        "receipt": "text-of-receipt",
        "responseCode": "0000",
        "rrn": format!("{:012}", 100_000_000_000u64 + seq),
        "rrnExt": format!("{:013}", 1_000_000_000_000u64 + seq),
        "terminalId": "TSTSALE1",
        "time": now.format("%H:%M:%S").to_string(),
        "track1": "",
        "signVerif": "0",
        "txnType": "1",
        "trnStatus": "1",
        "adv": "",
        "adv2p": "",
        "bankAcquirer": "TEST BANK",
        "paymentSystem": "VISA",
        "subMerchant": text("subMerchant"),
    })
}

/// Replies for one decoded request.
pub fn respond(
    session: &mut EmulatorSession,
    request: &Value,
    behavior: &EmulatorBehavior,
    seq: u64,
) -> Vec<Value> {
    let method = request["method"].as_str().unwrap_or_default();
    let empty = Map::new();
    let params = request["params"].as_object().unwrap_or(&empty);

    if method.eq_ignore_ascii_case(METHOD_PING_DEVICE) {
        if behavior.silent_ping {
            return vec![];
        }
        return vec![reply(
            METHOD_PING_DEVICE,
            json!({PARAM_CODE: "00", PARAM_RESPONSE_CODE: "0000"}),
            false,
            "",
        )];
    }

    if method.eq_ignore_ascii_case(METHOD_SERVICE_MESSAGE) {
        let msg_type = params
            .get(PARAM_MSG_TYPE)
            .and_then(Value::as_str)
            .unwrap_or_default();
        return match msg_type {
            MSG_TYPE_IDENTIFY => vec![service_reply(json!({
                PARAM_MSG_TYPE: MSG_TYPE_IDENTIFY,
                PARAM_RESULT: behavior.identify_result,
                PARAM_VENDOR: behavior.vendor,
                PARAM_MODEL: behavior.model,
            }))],
            MSG_TYPE_GET_LAST_RESULT => vec![service_reply(json!({
                PARAM_MSG_TYPE: MSG_TYPE_GET_LAST_RESULT,
                PARAM_LAST_RESULT: behavior.last_result,
            }))],
            MSG_TYPE_GET_LAST_STAT_MSG_CODE => vec![service_reply(json!({
                PARAM_MSG_TYPE: MSG_TYPE_GET_LAST_STAT_MSG_CODE,
                PARAM_LAST_STAT_MSG_CODE: behavior.last_stat_msg_code,
            }))],
            MSG_TYPE_INTERRUPT => {
                let mut replies = vec![service_reply(
                    json!({PARAM_MSG_TYPE: MSG_TYPE_INTERRUPT_TRANSMITTED}),
                )];
                if let Some(pending) = session.pending.take() {
                    replies.push(reply(
                        &pending,
                        json!({PARAM_RESPONSE_CODE: RESPONSE_CODE_CANCELED_BY_USER.to_string()}),
                        true,
                        response_code_description(RESPONSE_CODE_CANCELED_BY_USER),
                    ));
                }
                replies
            }
            _ => vec![reply(
                METHOD_SERVICE_MESSAGE,
                json!({}),
                true,
                "Unsupported ServiceMessage type",
            )],
        };
    }

    if is_payment_method(method) {
        if behavior.busy {
            return vec![service_reply(json!({PARAM_MSG_TYPE: MSG_TYPE_DEVICE_BUSY}))];
        }
        if behavior.silent_payments {
            session.pending = Some(method.to_string());
            return vec![];
        }
        if let Some(code) = &behavior.response_code {
            return vec![reply(
                method,
                json!({PARAM_RESPONSE_CODE: code}),
                true,
                &behavior.error_description,
            )];
        }
        return vec![reply(method, approved_params(params, seq), false, "")];
    }

    vec![service_reply(
        json!({PARAM_MSG_TYPE: MSG_TYPE_METHOD_NOT_IMPLEMENTED}),
    )]
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Shared {
    behavior: Mutex<EmulatorBehavior>,
    requests: Mutex<Vec<Value>>,
    connections: AtomicUsize,
    seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    /// Feed received bytes; returns the reply delay and the writes to make.
    fn handle_bytes(&self, session: &mut EmulatorSession, data: &[u8]) -> (Duration, Vec<Vec<u8>>) {
        session.buffer.extend_from_slice(data);
        let behavior = lock(&self.behavior).clone();
        let mut out = Vec::new();

        while let Some(pos) = session.buffer.iter().position(|&b| b == FRAME_SENTINEL) {
            let datagram: Vec<u8> = session.buffer.drain(..=pos).take(pos).collect();
            let request: Value = match serde_json::from_slice(&datagram) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Emulator: bad request datagram: {e}");
                    continue;
                }
            };
            debug!("Emulator RX {request}");
            lock(&self.requests).push(request.clone());

            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            for value in respond(session, &request, &behavior, seq) {
                debug!("Emulator TX {value}");
                if behavior.inject_garbage {
                    out.extend_from_slice(GARBAGE_FRAME);
                }
                out.extend(value.to_string().into_bytes());
                out.push(FRAME_SENTINEL);
            }
        }

        if out.is_empty() {
            return (Duration::ZERO, vec![]);
        }
        let writes = match behavior.chunk_size {
            Some(n) if n > 0 => out.chunks(n).map(<[u8]>::to_vec).collect(),
            _ => vec![out],
        };
        (behavior.reply_delay, writes)
    }
}

async fn serve_tcp(mut stream: TcpStream, shared: Arc<Shared>, cancel: CancellationToken) {
    let mut session = EmulatorSession::default();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            }
        };
        let (delay, writes) = shared.handle_bytes(&mut session, &buf[..n]);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        for chunk in writes {
            if stream.write_all(&chunk).await.is_err() {
                return;
            }
            let _ = stream.flush().await;
        }
    }
}

async fn serve_ws(stream: TcpStream, shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Emulator: WebSocket upgrade failed: {e}");
            return;
        }
    };
    let mut session = EmulatorSession::default();
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return;
            }
            next = ws.next() => match next {
                Some(Ok(WsMessage::Binary(data))) => data,
                Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        };
        let (delay, writes) = shared.handle_bytes(&mut session, &data);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        for chunk in writes {
            if ws.send(WsMessage::Binary(chunk)).await.is_err() {
                return;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: EmulatorKind,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let count = shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Emulator: connection #{count} from {peer}");
                    let shared = shared.clone();
                    let cancel = cancel.clone();
                    match kind {
                        EmulatorKind::Tcp => tokio::spawn(serve_tcp(stream, shared, cancel)),
                        EmulatorKind::WebSocket => tokio::spawn(serve_ws(stream, shared, cancel)),
                    };
                }
                Err(e) => warn!("Emulator: accept failed: {e}"),
            },
            _ = cancel.cancelled() => break,
        }
    }
    debug!("Emulator accept loop stopped");
}

/// A running emulator. Stops when dropped.
pub struct TerminalEmulator {
    runtime: Option<tokio::runtime::Runtime>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    kind: EmulatorKind,
    shared: Arc<Shared>,
}

impl TerminalEmulator {
    /// Bind `bind` (e.g. `127.0.0.1:0`) and start serving.
    pub fn start(kind: EmulatorKind, bind: &str, behavior: EmulatorBehavior) -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ecr-emulator")
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start emulator runtime: {e}"))?;
        let listener = runtime
            .block_on(TcpListener::bind(bind))
            .map_err(|e| format!("Emulator bind {bind}: {e}"))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Emulator local address: {e}"))?;

        let shared = Arc::new(Shared {
            behavior: Mutex::new(behavior),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        runtime.spawn(accept_loop(listener, kind, shared.clone(), cancel.clone()));
        info!("Emulator ({kind:?}) listening on {local_addr}");

        Ok(Self {
            runtime: Some(runtime),
            cancel,
            local_addr,
            kind,
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn kind(&self) -> EmulatorKind {
        self.kind
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every request decoded so far, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        lock(&self.shared.requests).clone()
    }

    pub fn update_behavior(&self, update: impl FnOnce(&mut EmulatorBehavior)) {
        update(&mut lock(&self.shared.behavior));
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
            info!("Emulator on {} stopped", self.local_addr);
        }
    }
}

impl Drop for TerminalEmulator {
    fn drop(&mut self) {
        self.stop();
    }
}
