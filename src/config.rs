//! Driver settings.
//!
//! Settings arrive as camelCase JSON (a file or a value handed over by the
//! host). They are read once and never written back.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ecr::controller::TerminalConfig;
use crate::ecr::transport::{ConnectionType, DEFAULT_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSettings {
    #[serde(
        default = "default_connection_type",
        serialize_with = "connection_type_name",
        deserialize_with = "connection_type_from_name_or_index"
    )]
    pub connection_type: ConnectionType,
    /// Host name, IP address, or a full `ws://` URL for WebSocket.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub merchant_id: Option<u32>,
    /// Pay by face (biometrics) on every payment.
    #[serde(default)]
    pub facepay: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-transport knobs (`connectTimeoutMs`).
    #[serde(default = "default_connection_details")]
    pub connection_details: Value,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_connection_type() -> ConnectionType {
    ConnectionType::Tcp
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_protocol() -> String {
    "json".into()
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_transaction_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    25
}
fn default_connection_details() -> Value {
    Value::Object(Default::default())
}

fn connection_type_name<S: Serializer>(ct: &ConnectionType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(ct.name())
}

/// Settings store the connection type either as its name or as its index.
fn connection_type_from_name_or_index<'de, D>(d: D) -> Result<ConnectionType, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "connectionType must be a name or an index, got {other}"
            )))
        }
    };
    raw.parse().map_err(serde::de::Error::custom)
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            connection_type: default_connection_type(),
            address: String::new(),
            port: default_port(),
            protocol: default_protocol(),
            merchant_id: None,
            facepay: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            connection_details: default_connection_details(),
            log_dir: None,
            log_level: None,
        }
    }
}

impl DriverSettings {
    pub fn from_value(value: Value) -> Result<Self, String> {
        let settings: Self =
            serde_json::from_value(value).map_err(|e| format!("Invalid driver settings: {e}"))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read settings {}: {e}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| format!("Settings {} are not valid JSON: {e}", path.display()))?;
        Self::from_value(value)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.address.trim().is_empty() {
            return Err("address is required".into());
        }
        if self.port == 0 {
            return Err("port must be between 1 and 65535".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("pollIntervalMs must be positive".into());
        }
        if self.handshake_timeout_ms == 0 || self.transaction_timeout_ms == 0 {
            return Err("timeouts must be positive".into());
        }
        Ok(())
    }

    /// The controller-facing part of the settings.
    pub fn terminal_config(&self) -> TerminalConfig {
        TerminalConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            transaction_timeout: Duration::from_millis(self.transaction_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            merchant_id: self.merchant_id,
            facepay: self.facepay,
        }
    }
}
