//! skymount daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skymount::config::ServiceConfig;
use skymount::control::{server, ControlApi};
use skymount::fuse::FuseDriver;
use skymount::instance::{InstanceManager, InstanceStore};

/// Print usage information
fn print_usage() {
    eprintln!("Usage: skymount [config.yaml]");
    eprintln!();
    eprintln!("skymount - mount local or remote (SFTP) storage as virtual drives");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to service configuration (defaults apply when omitted)");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  skymount /etc/skymount/config.yaml");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        std::process::exit(1);
    }

    let config_path = args.get(1).map(PathBuf::from);

    // Load configuration
    let loaded = match &config_path {
        Some(path) => ServiceConfig::from_file(path),
        None => ServiceConfig::from_str(""),
    };
    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("skymount starting");
    match &config_path {
        Some(path) => info!("Loaded configuration from {:?}", path),
        None => info!("No configuration file given, using defaults"),
    }

    let handle = tokio::runtime::Handle::current();
    let driver = Arc::new(FuseDriver::new(handle, config.mount.clone()));
    let manager = Arc::new(InstanceManager::new(
        InstanceStore::new(config.state_dir.clone()),
        driver,
        config.instances.clone(),
    ));

    // Set up signal handling for graceful shutdown
    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        signal.notify_one();
    })?;

    let started = manager.autostart_on_boot().await;
    info!("{} instance(s) autostarted", started);

    let api = Arc::new(ControlApi::new(manager.clone(), shutdown));
    if let Err(e) = server::run(config.control.listen, api).await {
        error!("Control API failed: {}", e);
    }

    info!("Shutting down");
    let stopped = manager.stop_all().await;
    info!("{} instance(s) stopped, exiting", stopped);

    Ok(())
}
