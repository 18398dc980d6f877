//! Channel protocol trait and shared wire types.
//!
//! Defines the `ChannelProtocol` trait that framing implementations provide,
//! along with the decoded `Message`, the `OutgoingRequest` and the well-known
//! method / parameter names of the terminal JSON protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::ecr::operation::OperationParameters;

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

/// Frame terminator. Every frame is a JSON document followed by this byte.
pub const FRAME_SENTINEL: u8 = 0x00;

pub const PROTOCOL_VERSION: &str = "1.0";

// Methods
pub const METHOD_PING_DEVICE: &str = "PingDevice";
pub const METHOD_SERVICE_MESSAGE: &str = "ServiceMessage";
pub const METHOD_PURCHASE: &str = "Purchase";
pub const METHOD_REFUND: &str = "Refund";
pub const METHOD_WITHDRAWAL: &str = "Withdrawal";
pub const METHOD_PREAUTHORIZATION: &str = "Preauthorization";
pub const METHOD_SALE_COMPLETION: &str = "SaleCompletion";
pub const METHOD_CASHBACK: &str = "Cashback";

// ServiceMessage `msgType` values
pub const MSG_TYPE_IDENTIFY: &str = "identify";
pub const MSG_TYPE_DEVICE_BUSY: &str = "deviceBusy";
pub const MSG_TYPE_INTERRUPT: &str = "interrupt";
pub const MSG_TYPE_INTERRUPT_TRANSMITTED: &str = "interruptTransmitted";
pub const MSG_TYPE_METHOD_NOT_IMPLEMENTED: &str = "methodNotImplemented";
pub const MSG_TYPE_GET_LAST_RESULT: &str = "getLastResult";
pub const MSG_TYPE_GET_LAST_STAT_MSG_CODE: &str = "getLastStatMsgCode";

// Param keys
pub const PARAM_MSG_TYPE: &str = "msgType";
pub const PARAM_RESPONSE_CODE: &str = "responseCode";
pub const PARAM_CODE: &str = "code";
pub const PARAM_RESULT: &str = "result";
pub const PARAM_VENDOR: &str = "vendor";
pub const PARAM_MODEL: &str = "model";
pub const PARAM_LAST_RESULT: &str = "LastResult";
pub const PARAM_LAST_STAT_MSG_CODE: &str = "LastStatMsgCode";

// ---------------------------------------------------------------------------
// Response codes
// ---------------------------------------------------------------------------

/// Codes at or above this value are terminal / protocol level conditions.
/// Anything below (and non-zero) is a transaction-level decline.
pub const TERMINAL_CODE_THRESHOLD: u32 = 1000;

pub const RESPONSE_CODE_GENERAL_ERROR: u32 = 1000;
pub const RESPONSE_CODE_CANCELED_BY_USER: u32 = 1001;
pub const RESPONSE_CODE_EMV_DECLINE: u32 = 1002;
pub const RESPONSE_CODE_TRANSACTION_LOG_FULL: u32 = 1003;
pub const RESPONSE_CODE_NO_HOST_CONNECTION: u32 = 1004;
pub const RESPONSE_CODE_NO_PAPER: u32 = 1005;
pub const RESPONSE_CODE_CRYPTO_KEYS_ERROR: u32 = 1006;
pub const RESPONSE_CODE_CARD_READER_NOT_CONNECTED: u32 = 1007;
pub const RESPONSE_CODE_ALREADY_COMPLETE: u32 = 1008;

/// Human-readable description of a terminal-level response code.
pub fn response_code_description(code: u32) -> &'static str {
    match code {
        RESPONSE_CODE_GENERAL_ERROR => "General error",
        RESPONSE_CODE_CANCELED_BY_USER => "Transaction canceled by user",
        RESPONSE_CODE_EMV_DECLINE => "EMV decline",
        RESPONSE_CODE_TRANSACTION_LOG_FULL => "Transaction log is full, close the batch",
        RESPONSE_CODE_NO_HOST_CONNECTION => "No connection with host",
        RESPONSE_CODE_NO_PAPER => "No paper in printer",
        RESPONSE_CODE_CRYPTO_KEYS_ERROR => "Crypto keys error",
        RESPONSE_CODE_CARD_READER_NOT_CONNECTED => "Card reader is not connected",
        RESPONSE_CODE_ALREADY_COMPLETE => "Transaction is already complete",
        _ => "Unknown response code",
    }
}

// ---------------------------------------------------------------------------
// Param values
// ---------------------------------------------------------------------------

/// A single `params` value. The protocol only carries strings, integers and
/// booleans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ParamValue {
    /// String rendering used when a param is read as text (`"true"`, `"42"`).
    pub fn as_text(&self) -> String {
        match self {
            ParamValue::Str(s) => s.clone(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Bool(b) => b.to_string(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

pub type Params = BTreeMap<String, ParamValue>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One decoded frame received from the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: String,
    pub step: i64,
    pub error: bool,
    pub error_description: String,
    pub params: Params,
}

impl Message {
    /// Read a param as text, whatever its wire type.
    pub fn param(&self, key: &str) -> Option<String> {
        self.params.get(key).map(ParamValue::as_text)
    }

    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }

    pub fn is_service_message(&self) -> bool {
        self.is_method(METHOD_SERVICE_MESSAGE)
    }

    /// `msgType` of a service message, if present.
    pub fn msg_type(&self) -> Option<String> {
        self.param(PARAM_MSG_TYPE)
    }

    pub fn is_busy(&self) -> bool {
        self.is_service_message()
            && self
                .msg_type()
                .is_some_and(|t| t.eq_ignore_ascii_case(MSG_TYPE_DEVICE_BUSY))
    }
}

/// A request to be framed and sent to the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    pub method: String,
    pub step: i64,
    pub params: Params,
}

impl OutgoingRequest {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            step: 0,
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// `ServiceMessage` request carrying only a `msgType`.
    pub fn service_message(msg_type: &str) -> Self {
        Self::new(METHOD_SERVICE_MESSAGE).with_param(PARAM_MSG_TYPE, msg_type)
    }
}

// ---------------------------------------------------------------------------
// Protocol trait
// ---------------------------------------------------------------------------

/// Framing protocol trait: turns requests into frames and a raw byte stream
/// into queued messages.
///
/// Implementations own the decode buffer and the message queue and are shared
/// between the transport's I/O thread (`push_response`) and the controller's
/// poll loop (`get_response_data`), so every entry point takes `&self`.
pub trait ChannelProtocol: Send + Sync {
    /// Protocol name (for logging/display).
    fn name(&self) -> &str;

    /// Serialize a request into one complete frame, sentinel included.
    fn encode_request(&self, request: &OutgoingRequest) -> Result<Vec<u8>, String>;

    /// Map an operation onto its request and frame it. Fails for operation
    /// types without a protocol method.
    fn encode_operation(&self, operation: &OperationParameters) -> Result<Vec<u8>, String> {
        let request = operation.to_request()?;
        self.encode_request(&request)
    }

    /// Append raw bytes and queue every complete message they finish.
    fn push_response(&self, data: &[u8]);

    /// Pop the oldest queued message without blocking.
    fn get_response_data(&self) -> Option<Message>;

    /// Pop the oldest queued message, waiting up to `timeout` for one to
    /// arrive.
    fn wait_response_data(&self, timeout: Duration) -> Option<Message>;

    /// Drop every queued message. Bytes of a partially received frame stay
    /// buffered.
    fn clear_messages(&self);

    /// Number of queued messages.
    fn pending(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
