//! POS payment terminal driver.
//!
//! Connects to a payment terminal over TCP or WebSocket, exchanges
//! NUL-terminated JSON messages with it and drives its handshake and
//! transaction protocol. Hosts talk to it through [`ecr::DeviceManager`] or
//! a single [`ecr::TerminalController`].
//!
//! Every controller call blocks the calling thread until the terminal answers
//! or a deadline passes. Async hosts should call it from a blocking task.

pub mod config;
pub mod diagnostics;
pub mod ecr;
pub mod emulator;

pub use config::DriverSettings;
pub use ecr::operation::{OperationParameters, OperationResponse, OperationType};
pub use ecr::{DeviceManager, SessionState, TerminalController, TerminalError};

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,pos_terminal_driver=debug";

/// Install console + daily rolling file logging.
///
/// `RUST_LOG` wins over the settings' `logLevel`. Keep the returned guard
/// alive for as long as logs should be flushed to the file.
pub fn init_logging(settings: &DriverSettings) -> Result<WorkerGuard, String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(settings.log_level.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });

    let log_dir = settings
        .log_dir
        .clone()
        .unwrap_or_else(diagnostics::get_log_dir);
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| format!("Cannot create log dir {}: {e}", log_dir.display()))?;

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(&log_dir, diagnostics::MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("Logging already initialised: {e}"))?;

    info!(
        "POS terminal driver v{} logging to {}",
        env!("CARGO_PKG_VERSION"),
        log_dir.display()
    );
    Ok(guard)
}
