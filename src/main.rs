//! cloudmount daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use cloudmount::config::Config;
use cloudmount::fs::CloudMountFs;
use cloudmount::mount;
use cloudmount::remote::s3::S3RemoteClient;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: cloudmount <config.yaml> <mountpoint>");
    eprintln!();
    eprintln!("cloudmount - mount remote object storage as a local filesystem");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!("  mountpoint     Directory to mount the drive at");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  cloudmount /etc/cloudmount/config.yaml /mnt/drive");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let mountpoint = PathBuf::from(&args[2]);

    // Load configuration
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    }

    // Initialize logging; the debug mount flag raises the default level
    let default_level = if config.debug {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("cloudmount starting");
    info!("loaded configuration from {config_path:?}");
    if !config.foreground {
        info!("daemonization is not supported; staying attached to the terminal");
    }

    // Create mount point directory if it doesn't exist
    if !mountpoint.exists() {
        debug!("creating mount point directory {mountpoint:?}");
        std::fs::create_dir_all(&mountpoint)?;
    }

    let remote = match S3RemoteClient::new(config.s3.clone()).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("failed to create S3 client: {e}");
            std::process::exit(1);
        }
    };

    let fs = CloudMountFs::new(config, remote)?;

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut session = mount::mount_background(fs, &mountpoint)?;
    info!("mounted at {mountpoint:?}, press Ctrl+C to unmount and exit");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    info!("shutting down");
    session.unmount();
    info!("unmounted, exiting");

    Ok(())
}
