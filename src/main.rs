mod chunker;
mod codec;
mod config;
mod engine;
mod error;
mod fallback;
mod firmware;
mod package;
mod protocol;
mod transport;
mod transport_btleplug;
mod upload;

#[cfg(test)]
mod testing;

use btleplug::api::BDAddr;
use clap::{CommandFactory, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::FlashConfig;
use crate::fallback::DfuFullUpdate;
use crate::firmware::FirmwareImage;
use crate::transport_btleplug::BleLink;
use crate::upload::{UploadEvent, UploadOutcome, Uploader};

/// Flash a Calliope mini over BLE, rewriting only the program when possible
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE target name
    #[arg(short, long, default_value = "")]
    name: String,

    /// BLE Address
    #[arg(short, long)]
    addr: Option<BDAddr>,

    /// Firmware hex file
    #[arg(long)]
    hex: PathBuf,

    /// DFU package used when partial flashing is not possible
    #[arg(short, long)]
    pkg: Option<PathBuf>,

    /// Name the DFU bootloader advertises with (defaults to --name, required with --addr alone)
    #[arg(long)]
    dfu_name: Option<String>,

    /// Program bytes per packet
    #[arg(long, env = "CALLIOPE_PFLASH_CHUNK_SIZE", default_value_t = config::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Wait for region and status replies, in milliseconds
    #[arg(long, env = "CALLIOPE_PFLASH_RESPONSE_TIMEOUT_MS", default_value_t = 5000)]
    response_timeout_ms: u64,

    /// Wait for a batch acknowledgement, in milliseconds
    #[arg(long, env = "CALLIOPE_PFLASH_ACK_TIMEOUT_MS", default_value_t = 5000)]
    ack_timeout_ms: u64,

    /// Wait for the device after the BLE-only reboot, in milliseconds
    #[arg(long, env = "CALLIOPE_PFLASH_RECONNECT_TIMEOUT_MS", default_value_t = 30000)]
    reconnect_timeout_ms: u64,

    /// Resends of a rejected batch before falling back to full flashing
    #[arg(long, env = "CALLIOPE_PFLASH_MAX_RETRIES", default_value_t = config::DEFAULT_MAX_WRITE_RETRIES)]
    max_retries: u32,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn flash_config(&self) -> FlashConfig {
        FlashConfig {
            chunk_size: self.chunk_size.max(1),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
            max_write_retries: self.max_retries,
        }
    }

    /// Name to scan for once the device has rebooted into its bootloader.
    fn dfu_target(&self) -> Option<String> {
        [self.dfu_name.as_deref(), Some(self.name.as_str())]
            .into_iter()
            .flatten()
            .find(|name| !name.is_empty())
            .map(str::to_owned)
    }
}

async fn show_progress(mut events: mpsc::UnboundedReceiver<UploadEvent>) {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{msg:24} [{bar:40}] {bytes}/{total_bytes}") {
        bar.set_style(style);
    }
    bar.set_message("partial flashing");
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::Progress { done, total } => {
                bar.set_length(total as u64);
                bar.set_position(done as u64);
            }
            UploadEvent::FallbackStarted(reason) => {
                bar.println(format!("partial flashing not possible: {reason}"));
                bar.reset();
                bar.set_message("full flashing");
            }
            UploadEvent::Log(line) => bar.println(line),
            UploadEvent::Phase(_) => {}
        }
    }
    bar.finish();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut image = FirmwareImage::from_file(&args.hex)?;
    if let Some(pkg) = &args.pkg {
        image = image.with_dfu_package_file(pkg)?;
    }
    info!("loaded {} ({} bytes)", args.hex.display(), image.raw().len());
    if image.partial_flash().is_none() {
        warn!("{} has no partial flashing information", args.hex.display());
    }

    let Some(dfu_name) = args.dfu_target() else {
        Args::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "--dfu-name is required when the device is selected by --addr only",
            )
            .exit();
    };

    let link = BleLink::connect(&args.name, args.addr).await?;
    let full_update = DfuFullUpdate::new(dfu_name, None);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let uploader = Uploader::new(&link, &full_update, args.flash_config(), events_tx);
    let control = uploader.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelling upload");
            control.cancel();
        }
    });
    let progress = tokio::spawn(show_progress(events_rx));

    let outcome = uploader.upload(&image).await;
    let _ = progress.await;
    match outcome? {
        UploadOutcome::PartialFlashed => info!("program updated by partial flashing"),
        UploadOutcome::FullFlashed => info!("firmware updated by full flashing"),
        UploadOutcome::Cancelled => warn!("upload cancelled"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let argv = ["calliope-pflash", "--hex", "app.hex"].iter().chain(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_dfu_target_defaults_to_name() {
        assert_eq!(parse(&["--name", "Calliope mini"]).dfu_target().as_deref(), Some("Calliope mini"));
    }

    #[test]
    fn test_dfu_name_overrides_name() {
        let args = parse(&["--name", "Calliope mini", "--dfu-name", "DfuTarg"]);
        assert_eq!(args.dfu_target().as_deref(), Some("DfuTarg"));
    }

    #[test]
    fn test_address_alone_has_no_dfu_target() {
        let args = parse(&["--addr", "AA:BB:CC:DD:EE:FF"]);
        assert!(args.addr.is_some());
        assert_eq!(args.dfu_target(), None);
    }

    #[test]
    fn test_flash_config_from_args() {
        let config = parse(&["--name", "x", "--chunk-size", "0", "--ack-timeout-ms", "250"]).flash_config();
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
    }
}
