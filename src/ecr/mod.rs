//! ECR (Electronic Cash Register) payment terminal module.
//!
//! Three layers: a byte-stream transport (TCP or WebSocket), the JSON channel
//! protocol that frames and decodes messages, and the terminal controller
//! that runs the handshake and transaction protocol on top of both.

pub mod controller;
pub mod device_manager;
pub mod error;
pub mod operation;
pub mod protocol;
pub mod protocols;
pub mod transport;
pub mod transports;

pub use controller::{SessionState, TerminalConfig, TerminalController, TerminalInfo};
pub use device_manager::DeviceManager;
pub use error::TerminalError;
