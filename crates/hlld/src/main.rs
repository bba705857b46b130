//! hlld daemon entry point: loads configuration, boots the set manager
//! and the background maintenance workers, then waits for a shutdown
//! signal. The wire protocol front-end attaches to the core through
//! [`hlld_core::SetManager`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use hlld_core::{background, logging, GlobalConfig, SetManager};

#[derive(Parser, Debug)]
#[command(name = "hlld", about = "HyperLogLog cardinality estimation daemon")]
struct Args {
    /// Path to the configuration file.
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the configured TCP port.
    #[arg(short, long)]
    port: Option<u16>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GlobalConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        config.tcp_port = port;
    }

    logging::init_logging(&config.log_level).context("initializing logging")?;
    config.validate().context("validating configuration")?;

    info!(
        data_dir = %config.data_dir.display(),
        tcp_port = config.tcp_port,
        udp_port = config.udp_port,
        precision = config.default_precision,
        "Starting hlld"
    );

    let config = Arc::new(config);
    let mgr = SetManager::new(config, true).context("initializing set manager")?;

    let should_run = Arc::new(AtomicBool::new(true));
    let flush = background::start_flush_worker(mgr.clone(), should_run.clone());
    let cold = background::start_cold_unmap_worker(mgr.clone(), should_run.clone());

    install_signal_handlers();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(250));
    }

    info!("Shutting down");
    should_run.store(false, Ordering::Relaxed);
    for handle in [flush, cold].into_iter().flatten() {
        let _ = handle.join();
    }
    // Dropping the manager joins the vacuum thread and flushes every
    // resident set.
    drop(mgr);
    Ok(())
}
