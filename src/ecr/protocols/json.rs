//! JSON channel protocol.
//!
//! Each frame is a UTF-8 JSON object terminated by a single `0x00` byte, with
//! no length prefix and no checksum. Incoming bytes arrive in arbitrary chunk
//! sizes; they are buffered until a sentinel completes a datagram.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

use crate::ecr::protocol::*;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RequestFrame<'a> {
    method: &'a str,
    step: i64,
    params: &'a Params,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseFrame {
    method: String,
    #[serde(default, deserialize_with = "step_from_int_or_str")]
    step: i64,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    error_description: String,
    #[serde(default)]
    params: Option<serde_json::Map<String, Value>>,
}

/// `step` arrives as an integer from most firmware and as a string from some.
fn step_from_int_or_str<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("step out of range: {n}"))),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("bad step '{s}': {e}"))),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!("bad step: {other}"))),
    }
}

/// Decode one datagram (sentinel already stripped).
pub fn parse_datagram(datagram: &[u8]) -> Result<Message, String> {
    let frame: ResponseFrame =
        serde_json::from_slice(datagram).map_err(|e| format!("Failed to parse JSON: {e}"))?;

    let mut params = Params::new();
    for (key, value) in frame.params.unwrap_or_default() {
        let value = match value {
            Value::String(s) => ParamValue::Str(s),
            Value::Bool(b) => ParamValue::Bool(b),
            Value::Number(n) if n.is_i64() => ParamValue::Int(n.as_i64().unwrap_or_default()),
            other => {
                trace!(key = %key, "Skipping unsupported param value {other}");
                continue;
            }
        };
        params.insert(key, value);
    }

    Ok(Message {
        method: frame.method,
        step: frame.step,
        error: frame.error,
        error_description: frame.error_description,
        params,
    })
}

// ---------------------------------------------------------------------------
// Protocol implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelState {
    buffer: Vec<u8>,
    queue: VecDeque<Message>,
}

impl ChannelState {
    /// Slice every complete datagram out of the buffer and queue the ones
    /// that parse. A bad datagram is dropped on its own.
    fn drain_datagrams(&mut self) -> usize {
        let mut queued = 0;
        while let Some(pos) = self.buffer.iter().position(|&b| b == FRAME_SENTINEL) {
            let datagram: Vec<u8> = self.buffer.drain(..=pos).take(pos).collect();
            match parse_datagram(&datagram) {
                Ok(msg) => {
                    debug!(
                        "Received json data: {}",
                        String::from_utf8_lossy(&datagram)
                    );
                    self.queue.push_back(msg);
                    queued += 1;
                }
                Err(e) => {
                    error!(
                        "{e}; dropping {} byte datagram: {}",
                        datagram.len(),
                        String::from_utf8_lossy(&datagram[..datagram.len().min(64)])
                    );
                }
            }
        }
        queued
    }
}

/// JSON + NUL-sentinel framing. Owns the decode buffer and the message queue
/// of one terminal connection.
pub struct JsonChannelProtocol {
    state: Mutex<ChannelState>,
    arrived: Condvar,
}

impl JsonChannelProtocol {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                buffer: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
                queue: VecDeque::new(),
            }),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes of an incomplete frame still waiting for their sentinel.
    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }
}

impl Default for JsonChannelProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelProtocol for JsonChannelProtocol {
    fn name(&self) -> &str {
        "JSON"
    }

    fn encode_request(&self, request: &OutgoingRequest) -> Result<Vec<u8>, String> {
        if request.method.is_empty() {
            return Err("Request has no method".into());
        }
        let frame = RequestFrame {
            method: &request.method,
            step: request.step,
            params: &request.params,
        };
        let mut data =
            serde_json::to_vec(&frame).map_err(|e| format!("Failed to encode request: {e}"))?;
        debug!("Send json data: {}", String::from_utf8_lossy(&data));
        data.push(FRAME_SENTINEL);
        Ok(data)
    }

    fn push_response(&self, data: &[u8]) {
        trace!("Process incoming data: {} bytes", data.len());
        let queued = {
            let mut state = self.lock();
            state.buffer.extend_from_slice(data);
            state.drain_datagrams()
        };
        if queued > 0 {
            self.arrived.notify_all();
        }
    }

    fn get_response_data(&self) -> Option<Message> {
        self.lock().queue.pop_front()
    }

    fn wait_response_data(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(msg) = state.queue.pop_front() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .arrived
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn clear_messages(&self) {
        let mut state = self.lock();
        if !state.queue.is_empty() {
            debug!("Discarding {} stale message(s)", state.queue.len());
            state.queue.clear();
        }
    }

    fn pending(&self) -> usize {
        self.lock().queue.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecr::operation::{OperationParameters, OperationType};
    use std::sync::Arc;

    fn reply(method: &str, code: &str) -> Vec<u8> {
        let mut data = serde_json::to_vec(&serde_json::json!({
            "method": method,
            "step": 0,
            "error": false,
            "errorDescription": "",
            "params": {"responseCode": code, "rrn": "123"}
        }))
        .unwrap();
        data.push(0);
        data
    }

    #[test]
    fn test_encode_appends_single_sentinel() {
        let proto = JsonChannelProtocol::new();
        let req = OutgoingRequest::new(METHOD_PING_DEVICE);
        let frame = proto.encode_request(&req).unwrap();
        assert_eq!(*frame.last().unwrap(), 0x00);
        assert_eq!(frame.iter().filter(|&&b| b == 0).count(), 1);
        let json: Value = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(json["method"], "PingDevice");
        assert_eq!(json["step"], 0);
        assert!(json["params"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_encode_rejects_unmapped_operation() {
        let proto = JsonChannelProtocol::new();
        let mut op = OperationParameters::new(OperationType::CancelAuthorisation);
        op.rrn = Some("1".into());
        assert!(proto.encode_operation(&op).is_err());
    }

    #[test]
    fn test_round_trip_through_push() {
        let proto = JsonChannelProtocol::new();
        let req = OutgoingRequest::new("Purchase")
            .with_param("amount", "12.50")
            .with_param("count", 3_i64)
            .with_param("facepay", false);
        let frame = proto.encode_request(&req).unwrap();
        proto.push_response(&frame);

        let msg = proto.get_response_data().unwrap();
        assert_eq!(msg.method, req.method);
        assert_eq!(msg.step, req.step);
        assert_eq!(msg.params, req.params);
        assert!(!msg.error);
        assert!(proto.get_response_data().is_none());
    }

    #[test]
    fn test_chunked_delivery_matches_whole_delivery() {
        let frame = reply("Purchase", "0000");

        let whole = JsonChannelProtocol::new();
        whole.push_response(&frame);
        let expected = whole.get_response_data().unwrap();

        for chunk_size in [1, 2, 3, 7, frame.len() - 1] {
            let proto = JsonChannelProtocol::new();
            for chunk in frame.chunks(chunk_size) {
                proto.push_response(chunk);
            }
            assert_eq!(proto.get_response_data().as_ref(), Some(&expected));
            assert_eq!(proto.pending(), 0);
            assert_eq!(proto.buffered_len(), 0);
        }
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let frame = reply("Purchase", "0000");
        let proto = JsonChannelProtocol::new();
        proto.push_response(&frame[..10]);
        assert!(proto.get_response_data().is_none());
        assert_eq!(proto.buffered_len(), 10);
        proto.push_response(&frame[10..]);
        assert!(proto.get_response_data().is_some());
    }

    #[test]
    fn test_two_messages_in_one_push_keep_order() {
        let mut data = reply("PingDevice", "0000");
        data.extend(reply("Purchase", "0017"));
        let proto = JsonChannelProtocol::new();
        proto.push_response(&data);
        assert_eq!(proto.pending(), 2);
        assert_eq!(proto.get_response_data().unwrap().method, "PingDevice");
        assert_eq!(proto.get_response_data().unwrap().method, "Purchase");
    }

    #[test]
    fn test_malformed_datagram_is_isolated() {
        let mut data = b"garbage\x00".to_vec();
        data.extend(reply("Purchase", "0000"));
        let proto = JsonChannelProtocol::new();
        proto.push_response(&data);
        assert_eq!(proto.pending(), 1);
        assert_eq!(proto.get_response_data().unwrap().method, "Purchase");
    }

    #[test]
    fn test_missing_method_is_malformed() {
        let proto = JsonChannelProtocol::new();
        proto.push_response(b"{\"error\":true,\"errorDescription\":\"Unknown method\"}\x00");
        assert_eq!(proto.pending(), 0);
    }

    #[test]
    fn test_step_accepts_string_and_defaults() {
        let msg = parse_datagram(br#"{"method":"Purchase","step":"2","params":{}}"#).unwrap();
        assert_eq!(msg.step, 2);
        assert!(!msg.error);
        assert_eq!(msg.error_description, "");

        let msg = parse_datagram(br#"{"method":"Purchase"}"#).unwrap();
        assert_eq!(msg.step, 0);
        assert!(msg.params.is_empty());
    }

    #[test]
    fn test_unsupported_param_types_are_skipped() {
        let msg = parse_datagram(
            br#"{"method":"X","params":{"a":"s","b":5,"c":true,"d":1.5,"e":null,"f":{"x":1}}}"#,
        )
        .unwrap();
        assert_eq!(msg.params.len(), 3);
        assert_eq!(msg.param("b").as_deref(), Some("5"));
        assert_eq!(msg.param("c").as_deref(), Some("true"));
    }

    #[test]
    fn test_utf8_params_survive() {
        let msg = parse_datagram(
            r#"{"method":"Purchase","params":{"issuerName":"VISA ПРИВАТ"}}"#.as_bytes(),
        )
        .unwrap();
        assert_eq!(msg.param("issuerName").as_deref(), Some("VISA ПРИВАТ"));
    }

    #[test]
    fn test_clear_keeps_partial_bytes() {
        let proto = JsonChannelProtocol::new();
        let frame = reply("Purchase", "0000");
        proto.push_response(&frame);
        proto.push_response(&frame[..5]);
        proto.clear_messages();
        assert_eq!(proto.pending(), 0);
        proto.push_response(&frame[5..]);
        assert_eq!(proto.pending(), 1);
    }

    #[test]
    fn test_wait_wakes_on_push_from_other_thread() {
        let proto = Arc::new(JsonChannelProtocol::new());
        let producer = proto.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push_response(&reply("Purchase", "0000"));
        });
        let msg = proto.wait_response_data(Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(msg.unwrap().method, "Purchase");
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let proto = JsonChannelProtocol::new();
        let started = Instant::now();
        assert!(proto.wait_response_data(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
