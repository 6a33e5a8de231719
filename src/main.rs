use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use nrfdfu_ble::transport_btleplug::DfuTransportManagerBtleplug;
use nrfdfu_ble::{ComponentKind, DfuConfig, DfuDriver, DfuTransportManager, Event, FirmwarePackage};

/// Update firmware on nRF BLE Secure DFU targets
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE DFU target name or address
    name: String,

    #[command(subcommand)]
    command: Commands,

    /// Bytes per Packet characteristic write
    #[arg(long, global = true, default_value_t = 20)]
    packet_size: usize,

    /// Packet Receipt Notification interval (0 disables PRN)
    #[arg(long, global = true, default_value_t = 0)]
    prn_interval: u16,

    /// Re-upload from byte 0 even if the device reports a resumable offset
    #[arg(long, global = true)]
    force_restart: bool,

    /// Disable the Smart Speed degradation policy
    #[arg(long, global = true)]
    no_smart_speed: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start DFU mode using the Buttonless DFU Service
    Trigger {},
    /// Update the application image
    App {
        /// DFU package path
        pkg: String,
    },
    /// Update the SoftDevice + Bootloader image
    Sdbl {
        /// DFU package path
        pkg: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Info).parse_default_env().init();

    let args = Args::parse();

    let manager = DfuTransportManagerBtleplug;
    let transport = manager.connect(&args.name).await?;

    let mut config = DfuConfig {
        packet_size: args.packet_size,
        prn_interval: args.prn_interval,
        force_restart: args.force_restart,
        ..DfuConfig::default()
    };
    if args.no_smart_speed {
        config.smart_speed.enabled = false;
    }

    let driver = DfuDriver::new(transport, config);

    let progress = ProgressBar::new(1);
    progress.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap()
            .progress_chars("=>-"),
    );
    driver.events().on(move |event| match event {
        Event::Log { message } => log::info!("{message}"),
        Event::Progress(progress_event) => {
            progress.set_length(progress_event.total_bytes as u64);
            progress.set_position(progress_event.sent_bytes as u64);
            progress.set_message(progress_event.object.to_string());
        }
    });

    match &args.command {
        Commands::Trigger {} => driver.enter_dfu_mode().await?,
        Commands::App { pkg } => run_component(&driver, pkg, ComponentKind::Application).await?,
        Commands::Sdbl { pkg } => {
            let package = FirmwarePackage::open_path(pkg)?;
            let component = package
                .base_image()
                .ok_or_else(|| anyhow::anyhow!("package manifest has no softdevice/bootloader component"))?;
            let (init, firmware) = package.get_image(component)?;
            driver.update(&init, &firmware).await?;
        }
    }

    Ok(())
}

async fn run_component(
    driver: &DfuDriver<<DfuTransportManagerBtleplug as DfuTransportManager>::Transport>,
    pkg: &str,
    component: ComponentKind,
) -> anyhow::Result<()> {
    let package = FirmwarePackage::open_path(pkg)?;
    let (init, firmware) = package.get_image(component)?;
    driver.update(&init, &firmware).await?;
    Ok(())
}
