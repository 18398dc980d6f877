//! Channel protocol implementations and factory.

pub mod json;

use super::protocol::ChannelProtocol;
use std::sync::Arc;

/// Create the framing protocol for a given protocol name.
pub fn create_protocol(protocol: &str) -> Result<Arc<dyn ChannelProtocol>, String> {
    match protocol.to_ascii_lowercase().as_str() {
        "json" | "" => Ok(Arc::new(json::JsonChannelProtocol::new())),
        "base_ecr" | "baseecr" => Err("Protocol 'base_ecr' is not implemented".into()),
        other => Err(format!("Unsupported protocol: '{other}'. Supported: json")),
    }
}
