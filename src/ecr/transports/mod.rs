//! Concrete byte-stream transports.

pub mod tcp;
pub mod websocket;

use crate::ecr::transport::ReadEnd;
use tracing::{error, info};

/// Size of one socket read.
pub(crate) const READ_CHUNK: usize = 4096;

pub(crate) fn report_read_end(label: &str, peer: &str, end: ReadEnd) {
    match end {
        ReadEnd::Closed => info!("{label} connection closed by peer {peer}"),
        ReadEnd::Cancelled => info!("{label} receive loop for {peer} stopped"),
        ReadEnd::Failed => error!("{label} receive loop for {peer} ended with a read error"),
    }
}
