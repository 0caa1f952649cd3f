//! sermux: a serial-to-TCP multiplexer for line-oriented devices
//!
//! This controller shares one serial character device (typically a
//! 3D-printer's USB-serial link) between multiple TCP clients and the
//! operator's terminal:
//! - Line-by-line forwarding from any submitter to the device
//! - Token-based flow control (at most one unacknowledged command)
//! - Per-submitter response routing
//! - Automatic device reopen on disconnect
//! - Configuration via CLI arguments or TOML file

mod config;
mod endpoint;
mod ring;
mod serial;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging. Diagnostics go to stderr; stdout is reserved for
    // the mirrored device traffic.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        device = %config.device,
        baud = config.baud,
        port = config.port,
        "Starting sermux"
    );

    // Open the device, bind the listeners, and run until stdin closes.
    let mut server = Server::bootstrap(&config)?;
    server.run()?;

    Ok(())
}
