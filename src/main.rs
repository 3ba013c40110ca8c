//! BLE Central - Main Entry Point

use std::{collections::HashSet, error::Error, sync::Arc};

use ble_central::{
    BleCentral, PeripheralId,
    backend::BluerTransport,
    config::{CliArgs, Settings, TargetPeripheral},
    core::types::{Characteristic, DiscoveredPeripheral, PeripheralHandle, PowerState},
    uuids,
};
use clap::Parser;
use futures::{StreamExt, stream};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

type Central = BleCentral<BluerTransport>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ble_central=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();
    info!(?args, "Starting BLE central");
    let settings = Settings::from(args);

    let (transport, events) = BluerTransport::open(settings.adapter.as_deref()).await?;
    let transport = Arc::new(transport);
    let central = Arc::new(BleCentral::new(
        transport.clone(),
        settings.discovery_config(),
    ));

    let event_loop = tokio::spawn({
        let central = central.clone();
        async move { central.run(events).await }
    });

    let result = tokio::select! {
        result = explore(&central, &transport, &settings) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
            Ok(())
        }
        _ = shutdown_signal() => {
            info!("Received SIGTERM, shutting down gracefully");
            Ok(())
        }
    };

    info!("Shutting down...");
    central.stop_scan().await;
    central.disconnect(false).await;
    event_loop.abort();

    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    // On non-Unix platforms, just wait forever
    std::future::pending().await
}

async fn explore(
    central: &Central,
    transport: &BluerTransport,
    settings: &Settings,
) -> Result<(), Box<dyn Error>> {
    wait_powered_on(central, transport).await?;

    let Some(peripheral) = scan(central, settings).await? else {
        return Ok(());
    };

    let mut outcomes = central.connect(&peripheral, settings.auto_reconnect).await?;
    if outcomes.next_outcome().await != Some(true) {
        return Err(format!("Failed to connect to {}", peripheral).into());
    }

    let handle = discover(central, settings).await?;
    print_tree(&handle, settings.json)?;

    if settings.read {
        read_all(central, &handle).await;
    }
    if settings.subscribe {
        stream_notifications(central, &handle).await?;
    }
    Ok(())
}

async fn wait_powered_on(central: &Central, transport: &BluerTransport) -> Result<(), Box<dyn Error>> {
    let mut power = central.adapter.subscribe();
    let mut requested = false;

    loop {
        let state = *power.borrow_and_update();
        match state {
            PowerState::PoweredOn => return Ok(()),
            PowerState::PoweredOff if !requested => {
                info!("Powering on adapter");
                transport.power_on().await?;
                requested = true;
            }
            state if state.is_terminal() => {
                return Err(format!("Bluetooth adapter is {}", state).into());
            }
            _ => {}
        }
        power.changed().await?;
    }
}

/// Scan until the target shows up or the scan ends
async fn scan(central: &Central, settings: &Settings) -> Result<Option<PeripheralId>, Box<dyn Error>> {
    let mut feed = central.scanner.subscribe();
    central.start_scan(settings.scan_options()).await?;

    let mut seen = HashSet::new();
    loop {
        feed.changed().await?;
        let snapshot = feed.borrow_and_update().clone();

        for peripheral in snapshot.iter().filter(|p| seen.insert(p.id.clone())) {
            print_peripheral(peripheral, settings.json)?;
        }

        if let Some(target) = &settings.target {
            if let Some(found) = snapshot.iter().find(|p| matches_target(target, p)) {
                info!("Found {} ({})", found.display_name(), found.id);
                return Ok(Some(found.id.clone()));
            }
        }

        if !central.scanner.is_scanning().await {
            info!("Scan finished, {} peripherals seen", seen.len());
            return match &settings.target {
                Some(target) => Err(format!("Peripheral {:?} not found", target).into()),
                None => Ok(None),
            };
        }
    }
}

fn matches_target(target: &TargetPeripheral, peripheral: &DiscoveredPeripheral) -> bool {
    target.matches(peripheral.id.as_str(), peripheral.name.as_deref())
}

/// Wait for the discovery started on connect, joining its requests
async fn discover(central: &Central, settings: &Settings) -> Result<PeripheralHandle, Box<dyn Error>> {
    let services = central.discover_services(&settings.services).await?.await?;

    let mut characteristics = Vec::new();
    for service in &services {
        let found = central
            .discover_characteristics(service, &settings.characteristics)
            .await?
            .await?;
        characteristics.extend(found);
    }

    if settings.descriptors {
        for characteristic in &characteristics {
            central.discover_descriptors(&characteristic.id).await?.await?;
        }
    }

    central
        .link
        .peripheral()
        .ok_or_else(|| "Peripheral released during discovery".into())
}

async fn read_all(central: &Central, handle: &PeripheralHandle) {
    for characteristic in readable(handle, |c| c.properties.read) {
        let result = match central.read(&characteristic.id).await {
            Ok(completion) => completion.await,
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => println!("{} = {}", format_uuid(&characteristic.id.uuid), hex::encode(value)),
            Err(e) => warn!("Failed to read {}: {}", characteristic.id, e),
        }
    }
}

async fn stream_notifications(central: &Central, handle: &PeripheralHandle) -> Result<(), Box<dyn Error>> {
    let mut streams = Vec::new();
    for characteristic in readable(handle, |c| c.properties.notify || c.properties.indicate) {
        streams.push(central.subscribe(&characteristic.id).await?);
    }
    if streams.is_empty() {
        warn!("No characteristic supports notifications");
        return Ok(());
    }

    info!("Streaming notifications from {} characteristics", streams.len());
    let mut merged = stream::select_all(
        streams
            .into_iter()
            .map(|s| {
                let uuid = s.characteristic().uuid;
                s.map(move |value| (uuid, value))
            }),
    );
    while let Some((uuid, value)) = merged.next().await {
        match value {
            Ok(value) => println!("{} -> {}", format_uuid(&uuid), hex::encode(value)),
            Err(e) => warn!("Notification error on {}: {}", format_uuid(&uuid), e),
        }
    }
    info!("All notification streams ended");
    Ok(())
}

fn readable<'a>(
    handle: &'a PeripheralHandle,
    predicate: impl Fn(&Characteristic) -> bool + 'a,
) -> impl Iterator<Item = &'a Characteristic> + 'a {
    handle
        .services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .filter(move |c| predicate(c))
}

fn format_uuid(uuid: &Uuid) -> String {
    match uuids::to_short(uuid) {
        Some(short) => format!("{:#06x}", short),
        None => uuid.to_string(),
    }
}

fn print_peripheral(peripheral: &DiscoveredPeripheral, json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string(peripheral)?);
    } else {
        println!(
            "{}  {:>4} dBm  {}",
            peripheral.id,
            peripheral.rssi,
            peripheral.display_name()
        );
    }
    Ok(())
}

fn print_tree(handle: &PeripheralHandle, json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string(handle)?);
        return Ok(());
    }

    println!("{} ({})", handle.name, handle.id);
    for service in &handle.services {
        println!("  Service {}", format_uuid(&service.service.uuid));
        for characteristic in &service.characteristics {
            let p = &characteristic.properties;
            let flags: Vec<&str> = [
                (p.read, "read"),
                (p.write, "write"),
                (p.write_without_response, "write-without-response"),
                (p.notify, "notify"),
                (p.indicate, "indicate"),
            ]
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            .collect();
            println!(
                "    Characteristic {} [{}]",
                format_uuid(&characteristic.id.uuid),
                flags.join(", ")
            );
            for descriptor in &characteristic.descriptors {
                println!("      Descriptor {}", format_uuid(&descriptor.uuid));
            }
        }
    }
    Ok(())
}
