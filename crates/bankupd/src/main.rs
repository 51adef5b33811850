//! bankupd: device-side OTA update daemon

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bankup::crypto::PUBLIC_KEY_FILE;
use bankup::{
    read_boot_offset_hint, DeviceConfig, EngineOptions, EngineState, HttpTransport, Keypair,
    OtaError, PowerControl, Stamp, UpdateEngine,
};

#[derive(Parser, Debug)]
#[command(name = "bankupd")]
#[command(version, about = "Poll a firmware repository and install signed updates")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/bankup/config.toml")]
    config: PathBuf,

    /// Verify only; never erase, flash, or reboot
    #[arg(long)]
    dry_run: bool,

    /// Accept any enabled image regardless of version
    #[arg(long)]
    force: bool,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

/// Reboot through the system `reboot` command.
struct SystemPower;

impl PowerControl for SystemPower {
    fn reboot(&self) -> Result<(), OtaError> {
        let status = std::process::Command::new("reboot")
            .status()
            .map_err(|e| OtaError::Reboot(e.to_string()))?;
        if !status.success() {
            return Err(OtaError::Reboot(format!("reboot exited with {status}")));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn open_banks(paths: &[PathBuf]) -> Result<bankup::BankSet> {
    use bankup::{FlashBank, MtdBank};

    let mut banks: Vec<Box<dyn FlashBank>> = Vec::with_capacity(paths.len());
    for path in paths {
        let bank = MtdBank::open(path)
            .with_context(|| format!("opening flash bank {}", path.display()))?;
        banks.push(Box::new(bank));
    }
    Ok(bankup::BankSet::new(banks)?)
}

#[cfg(not(target_os = "linux"))]
fn open_banks(_paths: &[PathBuf]) -> Result<bankup::BankSet> {
    anyhow::bail!("mtd flash banks are only available on linux; use dry_run elsewhere")
}

/// The running firmware version, from the persisted build stamp.
/// A device without a stamp reports version 0 and takes any update.
fn current_version(stamp_path: &Path) -> u32 {
    match Stamp::load(stamp_path) {
        Ok(stamp) => stamp.version,
        Err(e) => {
            warn!(path = %stamp_path.display(), error = %e, "no readable build stamp, assuming version 0");
            0
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = DeviceConfig::load_from_file(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    if args.dry_run {
        config.dry_run = true;
    }
    if args.force {
        config.force = true;
    }

    info!(host = config.host, path = config.path, "starting bankupd");

    // Devices hold only the pinned public key
    let keys = Keypair::load_from(&config.keys_dir.join(PUBLIC_KEY_FILE), None)
        .with_context(|| format!("loading public key from {}", config.keys_dir.display()))?;

    let version = current_version(&config.stamp_path);
    let boot_hint = config.boot_source.as_deref().and_then(read_boot_offset_hint);
    info!(version, ?boot_hint, "device state resolved");

    let banks = if config.banks.is_empty() {
        None
    } else {
        Some(open_banks(&config.banks)?)
    };

    let transport = HttpTransport::new(config.host.clone())?;
    let mut engine = UpdateEngine::new(
        Box::new(transport),
        Box::new(SystemPower),
        banks,
        keys.public().clone(),
        EngineOptions {
            base_path: config.path.clone(),
            current_version: version,
            force: config.force,
            dry_run: config.dry_run,
            boot_hint,
        },
    )?;

    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if engine.tick().await == EngineState::RebootPending {
                    info!("update installed, reboot pending");
                    break;
                }
                if args.once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
