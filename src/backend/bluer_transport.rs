//! BlueZ transport via bluer

use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, Session,
    gatt::{
        WriteOp,
        remote::{self, CharacteristicWriteRequest},
    },
};
use futures::{StreamExt, pin_mut};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BleTransport, TransportEvent};
use crate::core::error::{TransportError, TransportResult};
use crate::core::types::{
    Advertisement, Characteristic, CharacteristicId, CharacteristicProperties, Descriptor,
    PeripheralId, PeripheralSighting, PowerState, ServiceId,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// BlueZ resolves the GATT database in the background after connecting
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);
const SERVICES_RESOLVE_ATTEMPTS: u32 = 100;

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        match e.kind {
            bluer::ErrorKind::NotFound | bluer::ErrorKind::DoesNotExist => {
                TransportError::AttributeNotFound(e.to_string())
            }
            _ => TransportError::Stack(e.to_string()),
        }
    }
}

/// Background tasks owned by the transport
#[derive(Default)]
struct TransportTasks {
    power: Option<JoinHandle<()>>,
    scan: Option<JoinHandle<()>>,
    links: HashMap<PeripheralId, JoinHandle<()>>,
    notifications: HashMap<(PeripheralId, CharacteristicId), JoinHandle<()>>,
}

impl TransportTasks {
    fn abort_link(&mut self, peripheral: &PeripheralId) {
        if let Some(task) = self.links.remove(peripheral) {
            task.abort();
        }
        self.notifications.retain(|(owner, _), task| {
            if owner == peripheral {
                task.abort();
                false
            } else {
                true
            }
        });
    }
}

/// Transport over the host BlueZ daemon
pub struct BluerTransport {
    _session: Session,
    adapter: Adapter,
    events: mpsc::Sender<TransportEvent>,
    tasks: Arc<Mutex<TransportTasks>>,
}

impl BluerTransport {
    /// Open `adapter_name` (or the default adapter) and start reporting its
    /// power state on the returned channel
    pub async fn open(
        adapter_name: Option<&str>,
    ) -> TransportResult<(Self, mpsc::Receiver<TransportEvent>)> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session
                .adapter(name)
                .map_err(|e| TransportError::AdapterUnavailable(format!("{}: {}", name, e)))?,
            None => session
                .default_adapter()
                .await
                .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let power = tokio::spawn(monitor_power(adapter.clone(), events.clone()));

        let transport = Self {
            _session: session,
            adapter,
            events,
            tasks: Arc::new(Mutex::new(TransportTasks {
                power: Some(power),
                ..Default::default()
            })),
        };
        Ok((transport, rx))
    }

    /// Ask BlueZ to power the adapter on
    pub async fn power_on(&self) -> TransportResult<()> {
        self.adapter.set_powered(true).await?;
        Ok(())
    }

    fn device(&self, peripheral: &PeripheralId) -> TransportResult<Device> {
        let address: Address = peripheral
            .as_str()
            .parse()
            .map_err(|_| TransportError::InvalidAddress(peripheral.to_string()))?;
        Ok(self.adapter.device(address)?)
    }
}

impl Drop for BluerTransport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            let tasks = std::mem::take(&mut *tasks);
            tasks
                .power
                .into_iter()
                .chain(tasks.scan)
                .chain(tasks.links.into_values())
                .chain(tasks.notifications.into_values())
                .for_each(|task| task.abort());
        }
    }
}

async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if events.send(event).await.is_err() {
        debug!("Transport event dropped, receiver closed");
    }
}

fn power_state(powered: bool) -> PowerState {
    if powered {
        PowerState::PoweredOn
    } else {
        PowerState::PoweredOff
    }
}

async fn monitor_power(adapter: Adapter, events: mpsc::Sender<TransportEvent>) {
    let changes = match adapter.events().await {
        Ok(changes) => changes,
        Err(e) => {
            warn!("Failed to monitor adapter {}: {}", adapter.name(), e);
            emit(&events, TransportEvent::PowerStateChanged(PowerState::Unsupported)).await;
            return;
        }
    };
    pin_mut!(changes);

    match adapter.is_powered().await {
        Ok(powered) => emit(&events, TransportEvent::PowerStateChanged(power_state(powered))).await,
        Err(e) => warn!("Failed to read adapter power state: {}", e),
    }

    while let Some(event) = changes.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            emit(&events, TransportEvent::PowerStateChanged(power_state(powered))).await;
        }
    }

    warn!("Adapter {} went away", adapter.name());
    emit(&events, TransportEvent::PowerStateChanged(PowerState::Unsupported)).await;
}

async fn sighting(adapter: &Adapter, address: Address) -> bluer::Result<Option<PeripheralSighting>> {
    let device = adapter.device(address)?;
    // Cached devices carry no RSSI until they are heard again
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };
    let name = device.name().await?;

    let mut service_uuids: Vec<Uuid> = device.uuids().await?.unwrap_or_default().into_iter().collect();
    service_uuids.sort();

    let advertisement = Advertisement {
        local_name: name.clone(),
        manufacturer_data: device
            .manufacturer_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_uuids,
        service_data: device
            .service_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        tx_power: device.tx_power().await?,
    };

    Ok(Some(PeripheralSighting {
        id: PeripheralId::new(address.to_string()),
        name,
        advertisement,
        rssi,
    }))
}

/// Connect and then watch the link until it drops
async fn run_link(device: Device, peripheral: PeripheralId, events: mpsc::Sender<TransportEvent>) {
    let changes = match device.events().await {
        Ok(changes) => changes,
        Err(e) => {
            let error = e.into();
            emit(&events, TransportEvent::ConnectFailed { peripheral, error }).await;
            return;
        }
    };
    pin_mut!(changes);

    if !device.is_connected().await.unwrap_or(false) {
        if let Err(e) = device.connect().await {
            let error = e.into();
            emit(&events, TransportEvent::ConnectFailed { peripheral, error }).await;
            return;
        }
    }
    emit(
        &events,
        TransportEvent::Connected {
            peripheral: peripheral.clone(),
        },
    )
    .await;

    while let Some(event) = changes.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            emit(&events, TransportEvent::Disconnected { peripheral, error: None }).await;
            return;
        }
    }

    let error = Some(TransportError::Stack("device event stream ended".into()));
    emit(&events, TransportEvent::Disconnected { peripheral, error }).await;
}

async fn wait_services_resolved(device: &Device) -> TransportResult<()> {
    for _ in 0..SERVICES_RESOLVE_ATTEMPTS {
        if device.is_services_resolved().await? {
            return Ok(());
        }
        tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
    }
    Err(TransportError::Stack("GATT services not resolved".into()))
}

async fn resolve_services(device: &Device, filter: &[Uuid]) -> TransportResult<Vec<ServiceId>> {
    wait_services_resolved(device).await?;

    let mut services = Vec::new();
    for service in device.services().await? {
        let uuid = service.uuid().await?;
        if filter.is_empty() || filter.contains(&uuid) {
            services.push(ServiceId {
                uuid,
                handle: service.id(),
            });
        }
    }
    services.sort_by_key(|s| s.handle);
    Ok(services)
}

async fn resolve_characteristics(
    device: &Device,
    service: &ServiceId,
    filter: &[Uuid],
) -> TransportResult<Vec<Characteristic>> {
    let remote = device.service(service.handle).await?;

    let mut characteristics = Vec::new();
    for characteristic in remote.characteristics().await? {
        let uuid = characteristic.uuid().await?;
        if !filter.is_empty() && !filter.contains(&uuid) {
            continue;
        }
        let flags = characteristic.flags().await?;
        characteristics.push(Characteristic {
            id: CharacteristicId {
                service: *service,
                uuid,
                handle: characteristic.id(),
            },
            properties: CharacteristicProperties {
                read: flags.read,
                write: flags.write,
                write_without_response: flags.write_without_response,
                notify: flags.notify,
                indicate: flags.indicate,
            },
            descriptors: Vec::new(),
        });
    }
    characteristics.sort_by_key(|c| c.id.handle);
    Ok(characteristics)
}

async fn remote_characteristic(
    device: &Device,
    characteristic: &CharacteristicId,
) -> bluer::Result<remote::Characteristic> {
    device
        .service(characteristic.service.handle)
        .await?
        .characteristic(characteristic.handle)
        .await
}

async fn resolve_descriptors(
    device: &Device,
    characteristic: &CharacteristicId,
) -> TransportResult<Vec<Descriptor>> {
    let remote = remote_characteristic(device, characteristic).await?;

    let mut descriptors = Vec::new();
    for descriptor in remote.descriptors().await? {
        descriptors.push(Descriptor {
            uuid: descriptor.uuid().await?,
            handle: descriptor.id(),
        });
    }
    Ok(descriptors)
}

async fn forward_notifications(
    device: Device,
    peripheral: PeripheralId,
    characteristic: CharacteristicId,
    events: mpsc::Sender<TransportEvent>,
) {
    let report = |e: bluer::Error| {
        warn!("Failed to enable notifications on {}: {}", characteristic, e);
        TransportEvent::ValueUpdated {
            peripheral: peripheral.clone(),
            characteristic,
            result: Err(e.into()),
        }
    };
    let remote = match remote_characteristic(&device, &characteristic).await {
        Ok(remote) => remote,
        Err(e) => return emit(&events, report(e)).await,
    };
    let values = match remote.notify().await {
        Ok(values) => values,
        Err(e) => return emit(&events, report(e)).await,
    };
    pin_mut!(values);

    while let Some(value) = values.next().await {
        emit(
            &events,
            TransportEvent::ValueUpdated {
                peripheral: peripheral.clone(),
                characteristic,
                result: Ok(value),
            },
        )
        .await;
    }
    debug!("Notification stream of {} ended", characteristic);
}

impl BleTransport for BluerTransport {
    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> TransportResult<()> {
        let filter = DiscoveryFilter {
            uuids: services.iter().copied().collect(),
            transport: DiscoveryTransport::Le,
            duplicate_data: allow_duplicates,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let devices = match adapter.discover_devices_with_changes().await {
                Ok(devices) => {
                    let _ = ready_tx.send(Ok(()));
                    devices
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            pin_mut!(devices);

            // Dropping the stream ends discovery
            while let Some(event) = devices.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                match sighting(&adapter, address).await {
                    Ok(Some(sighting)) => {
                        emit(&events, TransportEvent::PeripheralSighted(sighting)).await
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Failed to read properties of {}: {}", address, e),
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| TransportError::Stack("discovery task ended".into()))??;

        if let Some(previous) = self.tasks.lock().await.scan.replace(task) {
            previous.abort();
        }
        debug!("BlueZ discovery running");
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        if let Some(task) = self.tasks.lock().await.scan.take() {
            task.abort();
            debug!("BlueZ discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> TransportResult<()> {
        let device = self.device(peripheral)?;
        let task = tokio::spawn(run_link(device, peripheral.clone(), self.events.clone()));

        let mut tasks = self.tasks.lock().await;
        tasks.abort_link(peripheral);
        tasks.links.insert(peripheral.clone(), task);
        Ok(())
    }

    async fn cancel_connect(&self, peripheral: &PeripheralId) -> TransportResult<()> {
        self.tasks.lock().await.abort_link(peripheral);
        // BlueZ aborts an ongoing connect on Disconnect
        self.device(peripheral)?.disconnect().await?;
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> TransportResult<()> {
        self.tasks.lock().await.abort_link(peripheral);
        self.device(peripheral)?.disconnect().await?;
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: &[Uuid],
    ) -> TransportResult<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let filter = filter.to_vec();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = resolve_services(&device, &filter).await;
            emit(&events, TransportEvent::ServicesDiscovered { peripheral, result }).await;
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceId,
        filter: &[Uuid],
    ) -> TransportResult<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let service = *service;
        let filter = filter.to_vec();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = resolve_characteristics(&device, &service, &filter).await;
            emit(
                &events,
                TransportEvent::CharacteristicsDiscovered {
                    peripheral,
                    service,
                    result,
                },
            )
            .await;
        });
        Ok(())
    }

    async fn discover_descriptors(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let characteristic = *characteristic;
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = resolve_descriptors(&device, &characteristic).await;
            emit(
                &events,
                TransportEvent::DescriptorsDiscovered {
                    peripheral,
                    characteristic,
                    result,
                },
            )
            .await;
        });
        Ok(())
    }

    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let characteristic = *characteristic;
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = match remote_characteristic(&device, &characteristic).await {
                Ok(remote) => remote.read().await.map_err(TransportError::from),
                Err(e) => Err(e.into()),
            };
            emit(
                &events,
                TransportEvent::ValueUpdated {
                    peripheral,
                    characteristic,
                    result,
                },
            )
            .await;
        });
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        value: &[u8],
        with_response: bool,
    ) -> TransportResult<()> {
        let device = self.device(peripheral)?;
        let peripheral = peripheral.clone();
        let characteristic = *characteristic;
        let value = value.to_vec();
        let events = self.events.clone();

        tokio::spawn(async move {
            let remote = match remote_characteristic(&device, &characteristic).await {
                Ok(remote) => remote,
                Err(e) => {
                    if with_response {
                        let result = Err(e.into());
                        emit(
                            &events,
                            TransportEvent::WriteAcknowledged {
                                peripheral,
                                characteristic,
                                result,
                            },
                        )
                        .await;
                    } else {
                        warn!("Write to {} dropped: {}", characteristic, e);
                    }
                    return;
                }
            };

            if !with_response {
                let request = CharacteristicWriteRequest {
                    op_type: WriteOp::Command,
                    ..Default::default()
                };
                if let Err(e) = remote.write_ext(&value, &request).await {
                    warn!("Write without response to {} failed: {}", characteristic, e);
                }
                return;
            }

            let result = remote.write(&value).await.map_err(TransportError::from);
            emit(
                &events,
                TransportEvent::WriteAcknowledged {
                    peripheral,
                    characteristic,
                    result,
                },
            )
            .await;
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> TransportResult<()> {
        let key = (peripheral.clone(), *characteristic);

        if !enabled {
            if let Some(task) = self.tasks.lock().await.notifications.remove(&key) {
                // Dropping the notify stream stops notifications
                task.abort();
            }
            return Ok(());
        }

        let device = self.device(peripheral)?;
        let task = tokio::spawn(forward_notifications(
            device,
            peripheral.clone(),
            *characteristic,
            self.events.clone(),
        ));
        if let Some(previous) = self.tasks.lock().await.notifications.insert(key, task) {
            previous.abort();
        }
        Ok(())
    }
}
