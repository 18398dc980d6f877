//! Terminal controller: connection handshake and transaction protocol.
//!
//! Owns one transport and one channel protocol. The transport's I/O thread
//! feeds received bytes into the protocol; every wait in this module runs on
//! the caller's thread and polls the protocol's message queue with a bounded
//! deadline, checking the stop flag on each tick.
//!
//! Connecting takes three transport sessions: ping on the first, identify on
//! the second, steady-state traffic on the third.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use super::error::TerminalError;
use super::operation::{OperationParameters, OperationResponse};
use super::protocol::*;
use super::transport::EcrTransport;

/// Called with every service message seen while a transaction is waiting.
pub type ServiceObserver = Arc<dyn Fn(&Message) + Send + Sync>;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    WaitingResponse,
    Busy,
    Processing,
    OperationCompleted,
    OperationFailed,
    Error,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Timing and default values the controller runs with.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Deadline for ping, identify and status-query replies.
    pub handshake_timeout: Duration,
    /// Deadline for a payment operation reply.
    pub transaction_timeout: Duration,
    /// Poll tick of the wait loops.
    pub poll_interval: Duration,
    /// Applied to the transport once the handshake completes.
    pub reconnect_delay: Duration,
    pub merchant_id: Option<u32>,
    pub facepay: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            transaction_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(25),
            reconnect_delay: Duration::from_millis(5000),
            merchant_id: None,
            facepay: false,
        }
    }
}

/// Identity reported by the terminal during identify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TerminalInfo {
    pub vendor: String,
    pub model: String,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct TerminalController {
    transport: Mutex<Box<dyn EcrTransport>>,
    protocol: Arc<dyn ChannelProtocol>,
    config: TerminalConfig,
    stop: AtomicBool,
    state: Mutex<SessionState>,
    info: Mutex<TerminalInfo>,
    observer: Mutex<Option<ServiceObserver>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TerminalController {
    pub fn new(
        transport: Box<dyn EcrTransport>,
        protocol: Arc<dyn ChannelProtocol>,
        config: TerminalConfig,
    ) -> Self {
        Self {
            transport: Mutex::new(transport),
            protocol,
            config,
            stop: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
            info: Mutex::new(TerminalInfo::default()),
            observer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn terminal_info(&self) -> TerminalInfo {
        lock(&self.info).clone()
    }

    /// Transport socket state; says nothing about protocol readiness.
    pub fn is_connected(&self) -> bool {
        lock(&self.transport).is_connected()
    }

    pub fn description(&self) -> String {
        format!(
            "{} over {}",
            self.protocol.name(),
            lock(&self.transport).description()
        )
    }

    pub fn set_service_observer(&self, observer: Option<ServiceObserver>) {
        *lock(&self.observer) = observer;
    }

    fn transition_to(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("Session state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Connect and run the ping / identify handshake.
    ///
    /// On failure the transport is left disconnected and the state is `Error`.
    pub fn connect(&self, address: &str, port: Option<u16>) -> Result<(), TerminalError> {
        if self.is_connected() {
            return Err(TerminalError::AlreadyConnected);
        }
        self.stop.store(false, Ordering::SeqCst);
        self.transition_to(SessionState::Connecting);
        info!("Connecting to POS terminal at {address}");

        match self.handshake(address, port) {
            Ok(()) => {
                self.transition_to(SessionState::Idle);
                let info = self.terminal_info();
                info!(
                    "POS terminal ready ({} {}) via {}",
                    info.vendor,
                    info.model,
                    self.description()
                );
                Ok(())
            }
            Err(e) => {
                error!("POS terminal connect failed: {e}");
                self.close_transport();
                self.transition_to(SessionState::Error);
                Err(e)
            }
        }
    }

    fn handshake(&self, address: &str, port: Option<u16>) -> Result<(), TerminalError> {
        {
            let mut transport = lock(&self.transport);
            transport.enable_keep_alive(true);
        }
        self.open_session(address, port)?;
        self.ping()?;

        self.close_transport();
        self.open_session(address, port)?;
        self.identify()?;

        self.close_transport();
        self.open_session(address, port)?;

        let mut transport = lock(&self.transport);
        transport.set_reconnect_delay(self.config.reconnect_delay);
        if transport.is_connected() {
            Ok(())
        } else {
            Err(TerminalError::NotConnected)
        }
    }

    /// Connect the transport and route its bytes into the protocol.
    fn open_session(&self, address: &str, port: Option<u16>) -> Result<(), TerminalError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(TerminalError::Stopped);
        }
        let protocol = self.protocol.clone();
        let mut transport = lock(&self.transport);
        transport
            .connect(address, port)
            .map_err(TerminalError::Transport)?;
        debug!("Start listening POS terminal");
        transport
            .start_listening(Arc::new(move |bytes: &[u8]| protocol.push_response(bytes)))
            .map_err(TerminalError::Transport)
    }

    fn close_transport(&self) {
        lock(&self.transport).disconnect();
        self.protocol.clear_messages();
    }

    fn ping(&self) -> Result<(), TerminalError> {
        self.send_request(&OutgoingRequest::new(METHOD_PING_DEVICE))?;
        self.poll_until(
            METHOD_PING_DEVICE,
            self.config.handshake_timeout,
            |msg| {
                if !msg.is_method(METHOD_PING_DEVICE) {
                    return None;
                }
                if msg.error {
                    return Some(Err(TerminalError::TerminalReported(msg.error_description)));
                }
                info!(
                    "Handshake successful, code: {}, responseCode: {}",
                    msg.param(PARAM_CODE).unwrap_or_default(),
                    msg.param(PARAM_RESPONSE_CODE).unwrap_or_default()
                );
                Some(Ok(()))
            },
        )
    }

    fn identify(&self) -> Result<(), TerminalError> {
        self.send_request(&OutgoingRequest::service_message(MSG_TYPE_IDENTIFY))?;
        let info = self.poll_until(
            MSG_TYPE_IDENTIFY,
            self.config.handshake_timeout,
            |msg| {
                if !msg.is_service_message() {
                    return None;
                }
                if msg.error {
                    return Some(Err(TerminalError::TerminalReported(msg.error_description)));
                }
                let msg_type = msg.msg_type().unwrap_or_default();
                if !msg_type.eq_ignore_ascii_case(MSG_TYPE_IDENTIFY) {
                    return Some(Err(TerminalError::UnexpectedReply(format!(
                        "identify answered with msgType '{msg_type}'"
                    ))));
                }
                let result = msg.param(PARAM_RESULT).unwrap_or_default();
                if !result.eq_ignore_ascii_case("true") {
                    return Some(Err(TerminalError::Handshake(format!(
                        "identify result: '{result}'"
                    ))));
                }
                Some(Ok(TerminalInfo {
                    vendor: msg.param(PARAM_VENDOR).unwrap_or_default(),
                    model: msg.param(PARAM_MODEL).unwrap_or_default(),
                }))
            },
        )?;
        info!("Identify terminal successful: {} {}", info.vendor, info.model);
        *lock(&self.info) = info;
        Ok(())
    }

    /// Stop every wait in progress and close the connection.
    pub fn disconnect(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.close_transport();
        self.transition_to(SessionState::Idle);
        info!("POS terminal disconnected");
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Encode, drop stale queued replies, and send.
    fn send_request(&self, request: &OutgoingRequest) -> Result<(), TerminalError> {
        let frame = self
            .protocol
            .encode_request(request)
            .map_err(TerminalError::Encode)?;
        self.send_fresh(&request.method, &frame)
    }

    /// Drop stale queued replies, then send an encoded frame.
    fn send_fresh(&self, method: &str, frame: &[u8]) -> Result<(), TerminalError> {
        self.protocol.clear_messages();
        self.send_frame(method, frame)
    }

    fn send_frame(&self, method: &str, frame: &[u8]) -> Result<(), TerminalError> {
        debug!(
            method = %method,
            "TX {}",
            String::from_utf8_lossy(frame.strip_suffix(&[FRAME_SENTINEL]).unwrap_or(frame))
        );
        lock(&self.transport).send(frame).map_err(|e| {
            error!("Failed to send {method}: {e}");
            TerminalError::Transport(e)
        })
    }

    /// Poll the queue until `handle` settles the outcome, the deadline passes
    /// or the controller is stopped. Messages `handle` returns `None` for are
    /// dropped.
    fn poll_until<T>(
        &self,
        operation: &str,
        timeout: Duration,
        mut handle: impl FnMut(Message) -> Option<Result<T, TerminalError>>,
    ) -> Result<T, TerminalError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                debug!("Wait for {operation} stopped");
                return Err(TerminalError::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Timeout waiting for {operation} response");
                return Err(TerminalError::Timeout {
                    operation: operation.to_string(),
                    after: timeout,
                });
            }
            let tick = self.config.poll_interval.min(deadline - now);
            let Some(msg) = self.protocol.wait_response_data(tick) else {
                continue;
            };
            if let Some(outcome) = handle(msg) {
                return outcome;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run one payment operation and wait for its result.
    pub fn process_transaction(
        &self,
        params: &OperationParameters,
    ) -> Result<OperationResponse, TerminalError> {
        if !self.is_connected() {
            return Err(TerminalError::NotConnected);
        }
        let params = params
            .clone()
            .with_defaults(self.config.merchant_id, self.config.facepay);
        params.validate().map_err(TerminalError::InvalidParameters)?;
        let method = params
            .operation_type
            .method_name()
            .ok_or_else(|| {
                TerminalError::Encode(format!(
                    "Operation {:?} has no protocol method",
                    params.operation_type
                ))
            })?
            .to_string();
        let frame = self
            .protocol
            .encode_operation(&params)
            .map_err(TerminalError::Encode)?;

        let span = info_span!("transaction", id = %Uuid::new_v4(), method = %method);
        let _entered = span.enter();
        info!("Processing {:?}", params.operation_type);

        if let Err(e) = self.send_fresh(&method, &frame) {
            self.transition_to(SessionState::Error);
            return Err(e);
        }
        self.transition_to(SessionState::WaitingResponse);

        let outcome = self.poll_until(&method, self.config.transaction_timeout, |msg| {
            self.on_transaction_message(&method, msg)
        });
        match &outcome {
            Ok(response) => info!(
                "{method} approved, rrn: {}, approvalCode: {}",
                response.rrn, response.approval_code
            ),
            Err(e) => {
                if matches!(e, TerminalError::Timeout { .. } | TerminalError::Stopped) {
                    self.transition_to(SessionState::Idle);
                }
                warn!("{method} failed: {e}");
            }
        }
        outcome
    }

    fn on_transaction_message(
        &self,
        method: &str,
        msg: Message,
    ) -> Option<Result<OperationResponse, TerminalError>> {
        if msg.is_service_message() {
            return self.on_service_message(&msg).map(Err);
        }
        if !msg.is_method(method) {
            debug!("Discarding {} while awaiting {method}", msg.method);
            return None;
        }

        self.transition_to(SessionState::Processing);
        let code = msg.param(PARAM_RESPONSE_CODE).unwrap_or_default();
        let code = code.trim();
        // Empty or unparsable codes read as 0.
        let numeric = code.parse::<u32>().unwrap_or(0);

        let failure = match numeric {
            0 => None,
            n if n >= TERMINAL_CODE_THRESHOLD => Some(TerminalError::Rejected {
                code: code.to_string(),
                description: response_code_description(n).to_string(),
            }),
            _ => Some(TerminalError::Declined {
                code: code.to_string(),
                description: msg.error_description.clone(),
            }),
        };
        if let Some(e) = failure {
            self.transition_to(SessionState::OperationFailed);
            return Some(Err(e));
        }

        let mut response = OperationResponse::from_message(&msg);
        response.result = true;
        self.transition_to(SessionState::OperationCompleted);
        Some(Ok(response))
    }

    /// Handle a service message arriving during a transaction wait. Returns
    /// the error that ends the wait, if any.
    fn on_service_message(&self, msg: &Message) -> Option<TerminalError> {
        let observer = lock(&self.observer).clone();
        if let Some(observer) = observer {
            observer(msg);
        }

        if msg.is_busy() {
            warn!("ServiceMessage: deviceBusy");
            self.transition_to(SessionState::Busy);
            return Some(TerminalError::Busy);
        }
        let msg_type = msg.msg_type().unwrap_or_default();
        if msg_type.eq_ignore_ascii_case(MSG_TYPE_METHOD_NOT_IMPLEMENTED) {
            error!("ServiceMessage: methodNotImplemented");
            self.transition_to(SessionState::Error);
            return Some(TerminalError::MethodNotImplemented);
        }
        if msg_type.eq_ignore_ascii_case(MSG_TYPE_INTERRUPT) {
            info!("ServiceMessage: interrupt, awaiting the operation result");
        } else if msg_type.eq_ignore_ascii_case(MSG_TYPE_INTERRUPT_TRANSMITTED) {
            info!("ServiceMessage: interruptTransmitted");
        } else {
            debug!("ServiceMessage: {msg_type}");
        }
        None
    }

    /// Ask the terminal to abort the operation in progress. Does not wait;
    /// the pending transaction ends with the terminal's reply.
    pub fn interrupt(&self) -> Result<(), TerminalError> {
        if !self.is_connected() {
            return Err(TerminalError::NotConnected);
        }
        let frame = self
            .protocol
            .encode_request(&OutgoingRequest::service_message(MSG_TYPE_INTERRUPT))
            .map_err(TerminalError::Encode)?;
        info!("Send ServiceMessage interrupt");
        self.send_frame(METHOD_SERVICE_MESSAGE, &frame)
    }

    // -----------------------------------------------------------------------
    // Status queries
    // -----------------------------------------------------------------------

    /// Outcome flag of the last operation (`0` or `1`).
    pub fn get_last_result(&self) -> Result<u8, TerminalError> {
        self.query_status_flag(MSG_TYPE_GET_LAST_RESULT, PARAM_LAST_RESULT)
    }

    /// Status-message flag of the last operation (`0` or `1`).
    pub fn get_last_stat_msg_code(&self) -> Result<u8, TerminalError> {
        self.query_status_flag(MSG_TYPE_GET_LAST_STAT_MSG_CODE, PARAM_LAST_STAT_MSG_CODE)
    }

    fn query_status_flag(&self, msg_type: &str, param: &str) -> Result<u8, TerminalError> {
        if !self.is_connected() {
            return Err(TerminalError::NotConnected);
        }
        self.send_request(&OutgoingRequest::service_message(msg_type))?;
        let outcome = self.poll_until(msg_type, self.config.handshake_timeout, |msg| {
            if !msg.is_service_message() {
                return None;
            }
            if msg.error {
                return Some(Err(TerminalError::TerminalReported(msg.error_description)));
            }
            Some(match msg.param(param).as_deref() {
                Some("0") => Ok(0),
                Some("1") => Ok(1),
                Some(other) => Err(TerminalError::UnexpectedReply(format!(
                    "{msg_type}: invalid {param} '{other}'"
                ))),
                None => Err(TerminalError::UnexpectedReply(format!(
                    "{msg_type}: missing {param}"
                ))),
            })
        });
        if let Err(e) = &outcome {
            error!("{msg_type} failed: {e}");
        }
        outcome
    }
}

impl Drop for TerminalController {
    fn drop(&mut self) {
        let transport = self.transport.get_mut().unwrap_or_else(|e| e.into_inner());
        if transport.is_connected() {
            transport.disconnect();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecr::operation::OperationType;
    use crate::ecr::protocols::json::JsonChannelProtocol;
    use crate::ecr::transport::mock::{frame, MockLog, Responder, ScriptedTransport};
    use serde_json::{json, Value};
    use serial_test::serial;

    fn method_of(request: &Value) -> &str {
        request["method"].as_str().unwrap_or_default()
    }

    fn msg_type_of(request: &Value) -> &str {
        request["params"]["msgType"].as_str().unwrap_or_default()
    }

    fn ping_reply() -> Vec<u8> {
        frame(json!({
            "method": "PingDevice", "step": 0, "error": false, "errorDescription": "",
            "params": {"code": "00", "responseCode": "0000"}
        }))
    }

    fn identify_reply(result: &str) -> Vec<u8> {
        frame(json!({
            "method": "ServiceMessage", "step": 0, "error": false, "errorDescription": "",
            "params": {"msgType": "identify", "result": result, "vendor": "PAX", "model": "s800"}
        }))
    }

    fn service(msg_type: &str) -> Vec<u8> {
        frame(json!({
            "method": "ServiceMessage", "step": 0, "error": false, "errorDescription": "",
            "params": {"msgType": msg_type}
        }))
    }

    fn purchase_reply(code: &str, description: &str) -> Vec<u8> {
        frame(json!({
            "method": "Purchase", "step": 0, "error": code != "00",
            "errorDescription": description,
            "params": {"responseCode": code, "amount": "12.50", "rrn": "123456789012",
                       "approvalCode": "A1B2C3", "pan": "4111********1111"}
        }))
    }

    /// Healthy terminal for the handshake; payment replies come from `payment`.
    fn terminal(payment: impl Fn(&Value) -> Vec<Vec<u8>> + Send + Sync + 'static) -> Responder {
        Arc::new(move |request: &Value| match method_of(request) {
            "PingDevice" => vec![ping_reply()],
            "ServiceMessage" if msg_type_of(request) == "identify" => vec![identify_reply("true")],
            _ => payment(request),
        })
    }

    fn short_config() -> TerminalConfig {
        TerminalConfig {
            handshake_timeout: Duration::from_millis(200),
            transaction_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(5),
            reconnect_delay: Duration::from_millis(1500),
            merchant_id: Some(7),
            facepay: false,
        }
    }

    fn controller(responder: Responder) -> (TerminalController, Arc<Mutex<MockLog>>) {
        let (transport, log) = ScriptedTransport::new(responder);
        let ctl = TerminalController::new(
            Box::new(transport),
            Arc::new(JsonChannelProtocol::new()),
            short_config(),
        );
        (ctl, log)
    }

    fn connected(responder: Responder) -> (TerminalController, Arc<Mutex<MockLog>>) {
        let (ctl, log) = controller(responder);
        ctl.connect("127.0.0.1", None).unwrap();
        (ctl, log)
    }

    #[test]
    fn test_connect_runs_three_sessions() {
        let (ctl, log) = connected(terminal(|_| vec![]));
        assert!(ctl.is_connected());
        assert_eq!(ctl.state(), SessionState::Idle);
        assert_eq!(
            ctl.terminal_info(),
            TerminalInfo { vendor: "PAX".into(), model: "s800".into() }
        );

        let log = log.lock().unwrap();
        assert_eq!(log.connects, 3);
        assert_eq!(log.disconnects, 2);
        assert_eq!(log.listens, 3);
        assert!(log.keep_alive);
        assert_eq!(log.reconnect_delay, Some(Duration::from_millis(1500)));
        assert_eq!(method_of(&log.sent[0]), "PingDevice");
        assert_eq!(msg_type_of(&log.sent[1]), "identify");
    }

    #[test]
    fn test_connect_twice_is_refused() {
        let (ctl, log) = connected(terminal(|_| vec![]));
        assert_eq!(ctl.connect("127.0.0.1", None), Err(TerminalError::AlreadyConnected));
        assert_eq!(log.lock().unwrap().connects, 3);
    }

    #[test]
    #[serial]
    fn test_unanswered_ping_fails_after_one_session() {
        let (ctl, log) = controller(Arc::new(|_: &Value| vec![]));
        let err = ctl.connect("127.0.0.1", Some(2000)).unwrap_err();
        assert!(err.is_timeout());
        assert!(!ctl.is_connected());
        assert_eq!(ctl.state(), SessionState::Error);
        assert_eq!(log.lock().unwrap().connects, 1);
    }

    #[test]
    fn test_ping_error_flag_fails_handshake() {
        let (ctl, _) = controller(Arc::new(|_: &Value| {
            vec![frame(json!({
                "method": "PingDevice", "step": 0, "error": true,
                "errorDescription": "terminal locked", "params": {}
            }))]
        }));
        assert_eq!(
            ctl.connect("127.0.0.1", None),
            Err(TerminalError::TerminalReported("terminal locked".into()))
        );
        assert!(!ctl.is_connected());
    }

    #[test]
    fn test_identify_rejection_leaves_transport_disconnected() {
        let (ctl, log) = controller(Arc::new(|request: &Value| match method_of(request) {
            "PingDevice" => vec![ping_reply()],
            _ => vec![identify_reply("false")],
        }));
        let err = ctl.connect("127.0.0.1", None).unwrap_err();
        assert!(matches!(err, TerminalError::Handshake(_)));
        assert!(!ctl.is_connected());
        assert_eq!(log.lock().unwrap().connects, 2);
    }

    #[test]
    fn test_refused_second_session_fails_connect() {
        let (transport, log) = ScriptedTransport::new(terminal(|_| vec![]));
        let ctl = TerminalController::new(
            Box::new(transport.refuse_connect_from(2)),
            Arc::new(JsonChannelProtocol::new()),
            short_config(),
        );
        assert!(matches!(
            ctl.connect("127.0.0.1", None),
            Err(TerminalError::Transport(_))
        ));
        assert_eq!(log.lock().unwrap().connects, 2);
        assert!(!ctl.is_connected());
    }

    #[test]
    fn test_purchase_success() {
        let (ctl, log) = connected(terminal(|_| vec![purchase_reply("00", "")]));
        let response = ctl.process_transaction(&OperationParameters::pay(1250)).unwrap();
        assert!(response.result);
        assert_eq!(response.rrn, "123456789012");
        assert_eq!(response.approval_code, "A1B2C3");
        assert_eq!(response.response_code, "00");
        assert_eq!(ctl.state(), SessionState::OperationCompleted);

        let log = log.lock().unwrap();
        let sent = log.sent.last().unwrap();
        assert_eq!(method_of(sent), "Purchase");
        assert_eq!(sent["params"]["amount"], "12.50");
        assert_eq!(sent["params"]["merchantId"], "7");
    }

    #[test]
    fn test_busy_short_circuits() {
        let (ctl, _) = connected(terminal(|_| vec![service("deviceBusy")]));
        let started = Instant::now();
        let err = ctl.process_transaction(&OperationParameters::pay(100)).unwrap_err();
        assert!(err.is_busy());
        assert_eq!(err.to_string(), "POS terminal is busy");
        assert_eq!(ctl.state(), SessionState::Busy);
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn test_terminal_level_code_is_rejected() {
        let (ctl, _) = connected(terminal(|_| vec![purchase_reply("1002", "ignored")]));
        let err = ctl.process_transaction(&OperationParameters::pay(100)).unwrap_err();
        assert_eq!(
            err,
            TerminalError::Rejected { code: "1002".into(), description: "EMV decline".into() }
        );
        assert_eq!(ctl.state(), SessionState::OperationFailed);
    }

    #[test]
    fn test_transaction_level_code_is_declined_verbatim() {
        let (ctl, _) = connected(terminal(|_| vec![purchase_reply("17", "Insufficient funds")]));
        let err = ctl.process_transaction(&OperationParameters::pay(100)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Transaction failed with error code: 17 (Insufficient funds)"
        );
        assert_eq!(err.response_code(), Some("17"));
        assert_eq!(ctl.state(), SessionState::OperationFailed);
    }

    #[test]
    fn test_unparsable_codes_complete_the_operation() {
        for code in ["OK", "-1", "99999999999", ""] {
            let (ctl, _) = connected(terminal(move |_| vec![purchase_reply(code, "")]));
            let response = ctl.process_transaction(&OperationParameters::pay(100)).unwrap();
            assert!(response.result, "code {code:?}");
            assert_eq!(ctl.state(), SessionState::OperationCompleted);
        }
    }

    #[test]
    fn test_unrelated_replies_are_dropped_and_service_messages_observed() {
        let (ctl, _) = connected(terminal(|_| {
            vec![
                frame(json!({"method": "Refund", "step": 0, "params": {"responseCode": "1000"}})),
                service("interrupt"),
                service("interruptTransmitted"),
                purchase_reply("00", ""),
            ]
        }));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctl.set_service_observer(Some(Arc::new(move |msg: &Message| {
            sink.lock().unwrap().push(msg.msg_type().unwrap_or_default());
        })));
        let response = ctl.process_transaction(&OperationParameters::pay(100)).unwrap();
        assert!(response.result);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["interrupt".to_string(), "interruptTransmitted".to_string()]
        );
    }

    #[test]
    fn test_method_not_implemented_fails_with_error_state() {
        let (ctl, _) = connected(terminal(|_| vec![service("methodNotImplemented")]));
        let params = OperationParameters {
            amount: 500,
            ..OperationParameters::new(OperationType::Authorisation)
        };
        assert_eq!(
            ctl.process_transaction(&params),
            Err(TerminalError::MethodNotImplemented)
        );
        assert_eq!(ctl.state(), SessionState::Error);
    }

    #[test]
    #[serial]
    fn test_unanswered_transaction_times_out() {
        let (ctl, _) = connected(terminal(|_| vec![]));
        let started = Instant::now();
        let err = ctl.process_transaction(&OperationParameters::pay(100)).unwrap_err();
        let elapsed = started.elapsed();
        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(ctl.state(), SessionState::Idle);
    }

    #[test]
    #[serial]
    fn test_disconnect_stops_waiting_transaction() {
        let (transport, _) = ScriptedTransport::new(terminal(|_| vec![]));
        let ctl = Arc::new(TerminalController::new(
            Box::new(transport),
            Arc::new(JsonChannelProtocol::new()),
            TerminalConfig {
                transaction_timeout: Duration::from_secs(20),
                ..short_config()
            },
        ));
        ctl.connect("127.0.0.1", None).unwrap();

        let worker = ctl.clone();
        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            worker.process_transaction(&OperationParameters::pay(100))
        });
        std::thread::sleep(Duration::from_millis(100));
        ctl.disconnect();

        assert_eq!(handle.join().unwrap(), Err(TerminalError::Stopped));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!ctl.is_connected());
    }

    #[test]
    fn test_requests_need_a_connection() {
        let (ctl, _) = controller(terminal(|_| vec![]));
        assert_eq!(
            ctl.process_transaction(&OperationParameters::pay(100)),
            Err(TerminalError::NotConnected)
        );
        assert_eq!(ctl.get_last_result(), Err(TerminalError::NotConnected));
        assert_eq!(ctl.interrupt(), Err(TerminalError::NotConnected));
    }

    #[test]
    fn test_invalid_parameters_are_not_sent() {
        let (ctl, log) = connected(terminal(|_| vec![]));
        let sent_before = log.lock().unwrap().sent.len();
        assert!(matches!(
            ctl.process_transaction(&OperationParameters::pay(0)),
            Err(TerminalError::InvalidParameters(_))
        ));
        let cancel_auth = OperationParameters {
            rrn: Some("123".into()),
            ..OperationParameters::new(OperationType::CancelAuthorisation)
        };
        assert!(matches!(
            ctl.process_transaction(&cancel_auth),
            Err(TerminalError::Encode(_))
        ));
        assert_eq!(log.lock().unwrap().sent.len(), sent_before);
    }

    #[test]
    fn test_status_queries() {
        let (ctl, log) = connected(terminal(|request| {
            let reply = |params: Value| {
                frame(json!({"method": "ServiceMessage", "step": 0, "params": params}))
            };
            match msg_type_of(request) {
                "getLastResult" => vec![reply(json!({"msgType": "getLastResult", "LastResult": 1}))],
                "getLastStatMsgCode" => {
                    vec![reply(json!({"msgType": "getLastStatMsgCode", "LastStatMsgCode": "7"}))]
                }
                _ => vec![],
            }
        }));
        assert_eq!(ctl.get_last_result(), Ok(1));
        assert!(matches!(
            ctl.get_last_stat_msg_code(),
            Err(TerminalError::UnexpectedReply(_))
        ));
        let log = log.lock().unwrap();
        assert_eq!(msg_type_of(&log.sent[log.sent.len() - 2]), "getLastResult");
        assert_eq!(msg_type_of(&log.sent[log.sent.len() - 1]), "getLastStatMsgCode");
    }

    #[test]
    fn test_interrupt_sends_service_message() {
        let (ctl, log) = connected(terminal(|_| vec![]));
        ctl.interrupt().unwrap();
        let log = log.lock().unwrap();
        let sent = log.sent.last().unwrap();
        assert_eq!(method_of(sent), "ServiceMessage");
        assert_eq!(msg_type_of(sent), "interrupt");
    }
}
