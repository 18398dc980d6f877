//! Stand-alone payment terminal emulator for manual driver testing.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use pos_terminal_driver::emulator::{EmulatorBehavior, EmulatorKind, TerminalEmulator};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Tcp,
    Ws,
}

#[derive(Debug, Parser)]
#[command(name = "ecr-emulator", version, about = "Emulates a JSON-protocol payment terminal")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = 2000)]
    port: u16,

    #[arg(short, long, value_enum, default_value_t = Transport::Tcp)]
    transport: Transport,

    /// Answer every payment with deviceBusy
    #[arg(long)]
    busy: bool,

    /// Answer every payment with this response code
    #[arg(long)]
    response_code: Option<String>,

    #[arg(long, default_value = "")]
    error_description: String,

    /// Leave payments unanswered until interrupted
    #[arg(long)]
    silent: bool,

    /// Delay before each reply, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Split replies into writes of this many bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Send an unparseable datagram before every reply
    #[arg(long)]
    garbage: bool,

    #[arg(long, default_value = "PAX")]
    vendor: String,

    #[arg(long, default_value = "s800")]
    model: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pos_terminal_driver=debug")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let kind = match cli.transport {
        Transport::Tcp => EmulatorKind::Tcp,
        Transport::Ws => EmulatorKind::WebSocket,
    };
    let behavior = EmulatorBehavior {
        busy: cli.busy,
        response_code: cli.response_code,
        error_description: cli.error_description,
        silent_payments: cli.silent,
        reply_delay: Duration::from_millis(cli.delay_ms),
        chunk_size: cli.chunk_size,
        inject_garbage: cli.garbage,
        vendor: cli.vendor,
        model: cli.model,
        ..Default::default()
    };

    let bind = format!("{}:{}", cli.host, cli.port);
    let mut emulator = TerminalEmulator::start(kind, &bind, behavior)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("starting emulator on {bind}"))?;
    println!("Emulating {kind:?} terminal on {}", emulator.local_addr());
    println!("Press Enter to stop");

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading stdin")?;

    emulator.stop();
    println!(
        "Stopped after {} connections, {} requests",
        emulator.connection_count(),
        emulator.requests().len()
    );
    Ok(())
}
