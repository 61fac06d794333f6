//! usb-supervisor daemon
//!
//! Watches USB devices on power-switchable hubs and power-cycles any port
//! whose device stops responding. Runs forever; only startup can fail.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;

use usb_supervisor::config::Config;
use usb_supervisor::usb::Monitor;
use usb_supervisor::{logging, service};

#[derive(Parser, Debug)]
#[command(name = "usb-supervisor")]
#[command(
    author,
    version,
    about = "Power-cycles unresponsive USB devices on switchable hubs"
)]
#[command(long_about = "
Supervisor for USB devices attached to programmable power-switching hubs.
Every supervised device is probed for liveness on a timer; a device that
stops answering gets its port power-cycled so flaky modems, radios, and
sensors recover without an operator.

EXAMPLES:
    # Supervise YKUSH hubs found on the bus
    usb-supervisor

    # Add GPIO-switched ports from a config file, log to a file
    usb-supervisor -c /etc/usb-supervisor.json -o /var/log/usb-supervisor.log

    # Run detached from the terminal
    usb-supervisor -d

SIGNALS:
    SIGUSR1 forces a power cycle of every supervised port.
")]
struct Args {
    /// Write log output to this file instead of standard error
    #[arg(short = 'o', long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Load handler configuration from this file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Detach from the controlling terminal after initialization
    #[arg(short, long)]
    detach: bool,
}

fn main() -> Result<()> {
    // refuse to run alongside another instance before touching anything else
    let _lock = service::lock_instance(Path::new(service::DEFAULT_PID_FILE))?;

    let args = Args::parse();

    logging::init(args.log_file.as_deref())?;

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    service::install_signal_handler()?;

    // fork before creating the USB context: libusb's hotplug machinery
    // starts an event thread that would not survive into the child
    if args.detach {
        service::daemonize().context("failed to start as daemon")?;
    }

    let mut monitor = Monitor::new(&config)?;

    info!("usb-supervisor v{} started", env!("CARGO_PKG_VERSION"));
    monitor.log_initial_state();
    monitor.run()
}
