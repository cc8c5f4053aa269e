// gattlane: command-line front end
//
// Drives the connection layer against the simulated radio and manages the
// on-disk defaults handed to new connections.

mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use gattlane_core::transport::uuid_from_u16;
use gattlane_core::{
    Address, BringUpPolicy, CharacteristicProperty, CharacteristicRef, ConnectFailure,
    ConnectTimeoutKind, ConnectionHandle, ConnectionState, Device, EventObserver,
    GattCharacteristic, GattService, RadioAdapter, Registry, RequestDescriptor, RequestError,
    RequestInfo, RequestValue, SimulatedTransport, ThreadMode, WriteOptions,
};
use std::sync::Arc;
use std::time::Duration;

const DEMO_ADDRESS: &str = "C0:FF:EE:00:00:01";

#[derive(Parser)]
#[command(name = "gattlane")]
#[command(about = "BLE connection and request orchestration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session against the simulated radio
    Demo {
        /// Bytes written to the control characteristic
        #[arg(short, long, default_value = "64")]
        payload: usize,
        /// Drop the link mid-session to show reconnection
        #[arg(long)]
        drop_link: bool,
    },
    /// Configure connection defaults
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting
    Show,
    /// Overwrite the config file with defaults
    Init,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _logging = logging::init(&config.log_level, config.log_dir.as_deref())?;

    match cli.command {
        Commands::Demo { payload, drop_link } => cmd_demo(&config, payload, drop_link).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:32} {}", key.cyan(), value);
            }
            println!();
            println!("  {}", config::Config::config_file()?.display().to_string().dimmed());
        }
        ConfigAction::Init => {
            config::Config::default().save()?;
            let path = config::Config::config_file()?;
            println!("{} Wrote defaults to {}", "✓".green(), path.display());
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key, value);
        }
    }
    Ok(())
}

// ----- demo -----

fn battery_level() -> CharacteristicRef {
    CharacteristicRef::new(uuid_from_u16(0x180F), uuid_from_u16(0x2A19))
}

fn control_point() -> CharacteristicRef {
    CharacteristicRef::new(uuid_from_u16(0xFFE0), uuid_from_u16(0xFFE1))
}

fn data_stream() -> CharacteristicRef {
    CharacteristicRef::new(uuid_from_u16(0xFFE0), uuid_from_u16(0xFFE2))
}

fn demo_services() -> Vec<GattService> {
    vec![
        GattService::new(uuid_from_u16(0x180F)).with_characteristic(
            GattCharacteristic::new(uuid_from_u16(0x2A19))
                .with_property(CharacteristicProperty::Read)
                .with_property(CharacteristicProperty::Notify),
        ),
        GattService::new(uuid_from_u16(0xFFE0))
            .with_characteristic(
                GattCharacteristic::new(uuid_from_u16(0xFFE1))
                    .with_property(CharacteristicProperty::Write),
            )
            .with_characteristic(
                GattCharacteristic::new(uuid_from_u16(0xFFE2))
                    .with_property(CharacteristicProperty::Notify),
            ),
    ]
}

/// Prints every event it receives
struct ConsolePrinter;

impl EventObserver for ConsolePrinter {
    fn on_connection_state_changed(&self, device: &Arc<Device>, state: ConnectionState) {
        println!("  {} {} {}", "state".cyan(), device, state);
    }

    fn on_connect_failed(&self, device: &Arc<Device>, failure: ConnectFailure) {
        println!("  {} {} {:?}", "failed".red(), device, failure);
    }

    fn on_connect_timeout(&self, device: &Arc<Device>, kind: ConnectTimeoutKind) {
        println!("  {} {} {:?}", "timeout".yellow(), device, kind);
    }

    fn on_request_completed(
        &self,
        _device: &Arc<Device>,
        request: &RequestInfo,
        value: &RequestValue,
    ) {
        println!("  {} {} #{} {:?}", "done".green(), request.kind, request.id.value(), value);
    }

    fn on_request_failed(
        &self,
        _device: &Arc<Device>,
        request: &RequestInfo,
        error: &RequestError,
    ) {
        println!("  {} {} #{} {}", "error".red(), request.kind, request.id.value(), error);
    }

    fn on_characteristic_changed(
        &self,
        _device: &Arc<Device>,
        target: &CharacteristicRef,
        value: &[u8],
    ) {
        println!("  {} {} {:02x?}", "notify".magenta(), target.characteristic, value);
    }

    fn on_adapter_state_changed(&self, enabled: bool) {
        println!("  {} {}", "adapter".cyan(), if enabled { "on" } else { "off" });
    }

    fn on_device_discovered(&self, device: &Arc<Device>) {
        println!("  {} {} rssi {}", "found".blue(), device, device.rssi());
    }
}

async fn wait_for_state(
    handle: &ConnectionHandle,
    state: ConnectionState,
    within: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + within;
    while handle.state() != state {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("{} did not reach {} (now {})", handle.address(), state, handle.state());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn cmd_demo(config: &config::Config, payload: usize, drop_link: bool) -> Result<()> {
    println!("{}", "gattlane demo (simulated radio)".bold());
    println!();

    let sim = SimulatedTransport::new();
    let address = Address::new(DEMO_ADDRESS);
    sim.add_peer(address.clone(), demo_services());
    sim.set_value(&address, battery_level(), vec![87]);

    let mut registry = Registry::new(RadioAdapter::new(sim.clone()))
        .with_bond_settle_delay(config.bond_settle_delay())
        .with_default_configuration(config.connection.clone());
    if let Some(kind) = config.scanner {
        registry = registry.with_scanner_preference(kind);
    }
    registry.register_observer(Arc::new(ConsolePrinter), ThreadMode::Dedicated, None);

    registry.start_scan().context("Failed to start scanning")?;
    registry.on_device_discovered(
        Device::new(DEMO_ADDRESS)
            .with_name("demo-sensor")
            .with_rssi(-58),
    );
    registry.stop_scan();

    let connection = config.connection.clone().with_bring_up(
        BringUpPolicy::default()
            .with_mtu_policy(|_device| Some(247))
            .with_notify(data_stream())
            .with_initial_read(battery_level()),
    );
    let handle = registry.connect(
        Device::new(DEMO_ADDRESS).with_name("demo-sensor"),
        Some(connection),
        None,
    )?;
    wait_for_state(&handle, ConnectionState::ServiceDiscovered, Duration::from_secs(15)).await?;

    let data: Vec<u8> = (0..payload).map(|i| i as u8).collect();
    let written = handle
        .submit(
            RequestDescriptor::write_characteristic(control_point(), data)
                .with_tag("demo")
                .with_write_options(
                    WriteOptions::default()
                        .with_mtu_as_package_size(true)
                        .with_package_write_delay(Duration::from_millis(20)),
                ),
        )
        .await
        .context("Connection closed before the write finished")?;
    written?;
    let chunks = sim.writes(&address).len();
    println!(
        "  {} {} bytes in {} chunk(s) at mtu {}",
        "wrote".green(),
        payload,
        chunks,
        handle.mtu()
    );

    let rssi = handle
        .submit(RequestDescriptor::read_rssi())
        .await
        .context("Connection closed before the RSSI read finished")??;
    tracing::info!("rssi {:?}", rssi);

    sim.push_notification(&address, data_stream(), vec![0x01, 0x02, 0x03]);

    if drop_link {
        println!("  {}", "dropping link".yellow());
        sim.drop_link(&address);
        tokio::time::sleep(Duration::from_millis(100)).await;
        wait_for_state(&handle, ConnectionState::ServiceDiscovered, Duration::from_secs(30)).await?;
    }

    registry.release_all();
    // Let the dedicated printer lane drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.shutdown();
    println!();
    println!("{} demo finished", "✓".green());
    Ok(())
}
