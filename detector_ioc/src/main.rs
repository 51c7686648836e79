/*!
# Detector IOC

Exposes an imaging detector as a set of named process variables that lab
control software can read, write and monitor over a small UDP protocol.

## Features

- Start/stop of blocking detector acquisitions from a background worker
- Frame data, dimensions and counters published after every acquisition
- Automatic output file naming from a printf-style template
- Monitors pushed on a fixed poll interval

## Usage

### Serve with the configured values
```bash
detector_ioc --config detector_ioc.toml
```

### Override the network settings
```bash
detector_ioc run --bind-addr 127.0.0.1 --port 5064
```

### Write a default configuration file
```bash
detector_ioc config --output detector_ioc.toml
```
*/

use clap::{Parser, Subcommand};
use shared::ValueTable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn, Level};

mod acquisition;
mod callback;
mod config;
mod device;
mod dispatcher;
mod server;
mod shutdown;
mod simulated;

use acquisition::AcquisitionController;
use config::AppConfig;
use device::{Detector, EventKind};
use dispatcher::CommandDispatcher;
use server::PollServer;
use shutdown::Shutdown;
use simulated::SimulatedDetector;

#[derive(Parser)]
#[command(name = "detector_ioc")]
#[command(about = "Process-variable server for a scientific imaging detector")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "detector_ioc.toml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the detector (default)
    Run {
        /// UDP bind address, overriding the configuration
        #[arg(short, long)]
        bind_addr: Option<String>,

        /// UDP port, overriding the configuration
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "detector_ioc.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    match cli.command {
        Some(Commands::Config { output }) => generate_config_file(output),

        Some(Commands::Run { bind_addr, port }) => {
            let mut config = load_config(&cli.config)?;
            if let Some(bind_addr) = bind_addr {
                config.server.bind_addr = bind_addr;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_ioc(config)
        }

        None => run_ioc(load_config(&cli.config)?),
    }
}

/// Load the configuration, falling back to defaults when the file is missing
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let config = AppConfig::load_from_file(path)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    } else {
        warn!("⚠️ Config file {} not found, using defaults", path.display());
        Ok(AppConfig::new())
    }
}

/// Open the detector, build the table and serve until shutdown
fn run_ioc(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    println!("🚀 Starting detector IOC {}", shared::VERSION);
    let detector = &config.detector;
    let device: Arc<dyn Detector> = Arc::new(SimulatedDetector::new(
        detector.model.clone(),
        detector.width,
        detector.height,
        detector.frame_overhead(),
    )?);
    println!("📷 Detector {}: {} ({}x{})", detector.index, device.identity(), device.width(), device.height());

    let defaults = config.database_defaults(&device.identity(), device.width(), device.height());
    let table = Arc::new(ValueTable::with_subscriber_capacity(
        shared::pvdb::declarations(&defaults),
        config.server.subscriber_capacity,
    ));
    let controller = Arc::new(AcquisitionController::new(Arc::clone(&table), Arc::clone(&device)));
    let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&table), Arc::clone(&controller)));
    dispatcher.refresh_path_exists();

    let shutdown = Shutdown::new();

    // Set up Ctrl+C handler
    let ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        println!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        ctrlc_shutdown.trigger();
    })?;

    let exit_shutdown = shutdown.clone();
    let exit_handler = device.register_event(
        EventKind::Exit,
        Arc::new(move |kind: EventKind| {
            if kind == EventKind::Exit {
                info!("Detector requested exit");
                exit_shutdown.trigger();
            }
        }),
    );

    let server = PollServer::new(
        Arc::clone(&dispatcher),
        config.server.prefix.clone(),
        config.server.poll_interval(),
    );
    let listener = shutdown.listener();
    let bind_addr = config.server.bind_addr.clone();
    let port = config.server.port;
    println!("📡 Serving {}* on {}:{}", config.server.prefix, bind_addr, port);

    let server_handle = thread::Builder::new()
        .name("poll-loop".to_string())
        .spawn(move || -> anyhow::Result<()> {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(server.run(&bind_addr, port, listener))
        })?;

    let server_result = server_handle.join().map_err(|_| "Poll loop thread panicked")?;

    device.unregister_event(EventKind::Exit, exit_handler);
    controller.shutdown();

    if let Err(e) = server_result {
        eprintln!("Poll loop failed: {:#}", e);
        return Err(e.into());
    }

    println!("✅ Detector IOC stopped");
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   detector_ioc --config {}", output_path.display());

    Ok(())
}
