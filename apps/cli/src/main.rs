mod ble;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use cydfu_core::{
    Cyacd2Image, DfuConfig, DfuEvent, DfuObserver, DfuSession, ObservableTransport,
    TracingObserver, UpdateOrchestrator,
};
use dialoguer::Select;
use tracing::{error, info};

use crate::ble::BleTransport;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cypress/Infineon BLE bootloader DFU host", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices advertising the bootloader service
    Scan {
        /// Scan duration in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Print the header and contents of a .cyacd2 image
    Info {
        /// Path to the image
        image: PathBuf,
    },
    /// Program a .cyacd2 image into a device
    Update {
        /// Path to the image
        image: PathBuf,

        /// Device address; scan and choose interactively when omitted
        address: Option<String>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Row chunk size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Response timeout for every command, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// How long to look for the device, in seconds
        #[arg(long, default_value_t = 5)]
        scan_timeout: u64,
    },
}

/// Forwards events to tracing and reports progress in 10% steps at INFO.
struct CliObserver {
    inner: TracingObserver,
    last_decile: AtomicU64,
}

impl CliObserver {
    fn new() -> Self {
        Self {
            inner: TracingObserver,
            last_decile: AtomicU64::new(0),
        }
    }
}

impl DfuObserver for CliObserver {
    fn on_event(&self, event: &DfuEvent) {
        if let DfuEvent::Progress { current, total } = event
            && *total > 0
        {
            let decile = (current * 10 / total).min(10);
            if self.last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
                info!("Programmed {}% ({} / {} bytes)", decile * 10, current, total);
            }
        }
        self.inner.on_event(event);
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match args.command {
        Commands::Scan { timeout } => run_scan(Duration::from_secs(timeout)),
        Commands::Info { image } => run_info(&image),
        Commands::Update {
            image,
            address,
            config,
            chunk_size,
            timeout_ms,
            scan_timeout,
        } => load_config(config.as_deref(), chunk_size, timeout_ms).and_then(|config| {
            run_update(&image, address, config, Duration::from_secs(scan_timeout))
        }),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_scan(timeout: Duration) -> Result<()> {
    info!("Scanning for {} s...", timeout.as_secs());
    let devices = ble::scan(timeout)?;
    if devices.is_empty() {
        println!("No bootloader devices found");
    }
    for device in devices {
        println!("{device}");
    }
    Ok(())
}

fn run_info(path: &Path) -> Result<()> {
    let mut image =
        Cyacd2Image::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    println!("{}", image.header());
    let app = *image.app_descriptor();
    println!("App start:        0x{:08X}", app.start_address);
    println!("App length:       0x{:X} ({} bytes)", app.length, app.length);

    let mut rows = 0usize;
    let mut bytes = 0u64;
    for row in image.rows() {
        let row = row?;
        rows += 1;
        bytes += row.data.len() as u64;
    }
    println!("Rows:             {rows}");
    println!("Data bytes:       {bytes}");
    image.close();
    Ok(())
}

fn load_config(
    path: Option<&Path>,
    chunk_size: Option<usize>,
    timeout_ms: Option<u64>,
) -> Result<DfuConfig> {
    let mut config = match path {
        Some(path) => DfuConfig::load_from_file(path)?,
        None => DfuConfig::default(),
    };
    if let Some(chunk_size) = chunk_size {
        config.update.chunk_size = chunk_size;
    }
    if timeout_ms.is_some() {
        config.session.timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

fn pick_device(scan_timeout: Duration) -> Result<String> {
    info!("No address given, scanning for {} s...", scan_timeout.as_secs());
    let devices = ble::scan(scan_timeout)?;
    if devices.is_empty() {
        bail!("no device advertising the bootloader service was found");
    }

    let labels: Vec<String> = devices.iter().map(ToString::to_string).collect();
    let index = Select::new()
        .with_prompt("Select a device")
        .items(&labels)
        .default(0)
        .interact()?;
    Ok(devices[index].address.clone())
}

fn run_update(
    path: &Path,
    address: Option<String>,
    config: DfuConfig,
    scan_timeout: Duration,
) -> Result<()> {
    let mut image =
        Cyacd2Image::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let address = match address {
        Some(address) => address,
        None => pick_device(scan_timeout)?,
    };

    let observer = Arc::new(CliObserver::new());
    let ble = BleTransport::connect(&address, scan_timeout)
        .with_context(|| format!("failed to connect to {address}"))?
        .with_max_write_len(config.session.write_fragment_len);
    let transport = ObservableTransport::new(ble, observer.clone());
    let session = DfuSession::with_config(transport, config.session);
    let mut update = UpdateOrchestrator::with_observer(session, config.update, observer);

    let report = update.run(&mut image)?;
    image.close();
    info!(
        rows = report.rows,
        bytes = report.bytes,
        "Application {} updated on {}",
        report.app_id,
        report.device
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_update_args() {
        let args = Args::try_parse_from([
            "cydfu",
            "-v",
            "update",
            "app.cyacd2",
            "00:A0:50:11:22:33",
            "--chunk-size",
            "128",
            "--timeout-ms",
            "3000",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Commands::Update {
                image,
                address,
                chunk_size,
                timeout_ms,
                config,
                scan_timeout,
            } => {
                assert_eq!(image, PathBuf::from("app.cyacd2"));
                assert_eq!(address.as_deref(), Some("00:A0:50:11:22:33"));
                assert_eq!(chunk_size, Some(128));
                assert_eq!(timeout_ms, Some(3000));
                assert!(config.is_none());
                assert_eq!(scan_timeout, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_update_address_optional() {
        let args = Args::try_parse_from(["cydfu", "update", "app.cyacd2"]).unwrap();
        assert!(matches!(args.command, Commands::Update { address: None, .. }));
    }

    #[test]
    fn test_scan_default_timeout() {
        let args = Args::try_parse_from(["cydfu", "scan"]).unwrap();
        assert!(matches!(args.command, Commands::Scan { timeout: 5 }));
    }

    #[test]
    fn test_image_required() {
        assert!(Args::try_parse_from(["cydfu", "info"]).is_err());
        assert!(Args::try_parse_from(["cydfu", "update"]).is_err());
    }

    #[test]
    fn test_load_config_overrides() {
        let config = load_config(None, Some(64), Some(1500)).unwrap();
        assert_eq!(config.update.chunk_size, 64);
        assert_eq!(config.session.timeout_ms, Some(1500));

        assert!(load_config(None, Some(0), None).is_err());
    }
}
