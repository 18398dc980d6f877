//! Device manager: one terminal controller per device id.
//!
//! The registry lock is only held to look a controller up or to swap it in
//! or out; connect handshakes and transaction waits run outside it, so a
//! `disconnect_device` from another thread can stop an in-flight wait.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::DriverSettings;
use crate::ecr::controller::{SessionState, TerminalController};
use crate::ecr::error::TerminalError;
use crate::ecr::operation::{OperationParameters, OperationResponse};
use crate::ecr::protocols;
use crate::ecr::transport;

/// Snapshot of one managed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub connected: bool,
    pub state: SessionState,
    pub vendor: String,
    pub model: String,
    pub description: String,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            connected: false,
            state: SessionState::Idle,
            vendor: String::new(),
            model: String::new(),
            description: String::new(),
        }
    }
}

/// Build an unconnected controller from driver settings.
pub fn build_controller(settings: &DriverSettings) -> Result<TerminalController, TerminalError> {
    let transport =
        transport::create_transport(settings.connection_type, &settings.connection_details)
            .map_err(TerminalError::Configuration)?;
    let protocol =
        protocols::create_protocol(&settings.protocol).map_err(TerminalError::Configuration)?;
    Ok(TerminalController::new(
        transport,
        protocol,
        settings.terminal_config(),
    ))
}

pub struct DeviceManager {
    devices: Mutex<HashMap<String, Arc<TerminalController>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<TerminalController>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device(&self, device_id: &str) -> Result<Arc<TerminalController>, TerminalError> {
        self.registry()
            .get(device_id)
            .cloned()
            .ok_or_else(|| TerminalError::DeviceNotFound(device_id.to_string()))
    }

    /// Build a controller from `settings`, run its handshake and register it.
    /// A device already registered under `device_id` is disconnected first.
    pub fn connect_device(
        &self,
        device_id: &str,
        settings: &DriverSettings,
    ) -> Result<(), TerminalError> {
        settings.validate().map_err(TerminalError::Configuration)?;
        let controller = build_controller(settings)?;
        self.register_device(device_id, controller, &settings.address, Some(settings.port))?;
        info!(
            device_id = %device_id,
            "Device connected ({} via {})",
            settings.protocol,
            settings.connection_type
        );
        Ok(())
    }

    /// Connect an already built controller and register it.
    pub fn register_device(
        &self,
        device_id: &str,
        controller: TerminalController,
        address: &str,
        port: Option<u16>,
    ) -> Result<(), TerminalError> {
        self.disconnect_device(device_id);
        controller.connect(address, port)?;
        let replaced = self
            .registry()
            .insert(device_id.to_string(), Arc::new(controller));
        if let Some(old) = replaced {
            warn!(device_id = %device_id, "Replacing a device registered during connect");
            old.disconnect();
        }
        Ok(())
    }

    /// Stop any wait in progress, close the connection and forget the device.
    /// Returns whether the device was registered.
    pub fn disconnect_device(&self, device_id: &str) -> bool {
        let removed = self.registry().remove(device_id);
        match removed {
            Some(controller) => {
                controller.disconnect();
                info!(device_id = %device_id, "Device disconnected");
                true
            }
            None => false,
        }
    }

    pub fn process_transaction(
        &self,
        device_id: &str,
        params: &OperationParameters,
    ) -> Result<OperationResponse, TerminalError> {
        self.device(device_id)?.process_transaction(params)
    }

    pub fn get_last_result(&self, device_id: &str) -> Result<u8, TerminalError> {
        self.device(device_id)?.get_last_result()
    }

    pub fn get_last_stat_msg_code(&self, device_id: &str) -> Result<u8, TerminalError> {
        self.device(device_id)?.get_last_stat_msg_code()
    }

    pub fn interrupt(&self, device_id: &str) -> Result<(), TerminalError> {
        self.device(device_id)?.interrupt()
    }

    /// Status of a device; unknown devices report the default (disconnected).
    pub fn device_status(&self, device_id: &str) -> DeviceStatus {
        match self.device(device_id) {
            Ok(controller) => {
                let info = controller.terminal_info();
                DeviceStatus {
                    connected: controller.is_connected(),
                    state: controller.state(),
                    vendor: info.vendor,
                    model: info.model,
                    description: controller.description(),
                }
            }
            Err(_) => DeviceStatus::default(),
        }
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.device(device_id)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub fn connected_device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Disconnect every device.
    pub fn shutdown(&self) {
        let ids = self.connected_device_ids();
        for id in &ids {
            self.disconnect_device(id);
        }
        info!("DeviceManager shutdown, {} devices disconnected", ids.len());
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
