//! BLE central facade

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{BleTransport, TransportEvent},
    core::{
        adapter::{AdapterState, PowerTransition},
        completion::{Completion, ConnectOutcomes, Notifications},
        discovery::{DiscoveryConfig, DiscoveryPipeline},
        error::{CentralError, CentralResult},
        link::{ConnectReport, LinkDrop, LinkSupervisor},
        router::OperationRouter,
        scanner::{ScanOptions, ScanSession},
        types::{Characteristic, CharacteristicId, Descriptor, PeripheralId, ServiceId},
    },
};

/// Main BLE central facade
///
/// Owns all components and feeds them transport events, one at a time.
pub struct BleCentral<T: BleTransport> {
    pub adapter: Arc<AdapterState>,
    pub scanner: Arc<ScanSession<T>>,
    pub link: Arc<LinkSupervisor<T>>,
    pub discovery: Arc<DiscoveryPipeline<T>>,
    pub router: Arc<OperationRouter<T>>,
    transport: Arc<T>,
}

impl<T: BleTransport> BleCentral<T> {
    /// Create a new central over `transport`
    pub fn new(transport: Arc<T>, config: DiscoveryConfig) -> Self {
        let adapter = Arc::new(AdapterState::new());
        let scanner = Arc::new(ScanSession::new(transport.clone(), adapter.clone()));
        let link = Arc::new(LinkSupervisor::new(transport.clone(), adapter.clone()));
        let discovery = Arc::new(DiscoveryPipeline::new(
            transport.clone(),
            link.view(),
            config,
        ));
        let router = Arc::new(OperationRouter::new(transport.clone(), link.view()));

        Self {
            adapter,
            scanner,
            link,
            discovery,
            router,
            transport,
        }
    }

    pub async fn start_scan(&self, options: ScanOptions) -> CentralResult<()> {
        self.scanner.start(options).await
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop().await
    }

    /// Connect to a peripheral
    ///
    /// The outcome stream yields one item for the attempt made now and one
    /// per automatic reconnect.
    pub async fn connect(
        &self,
        id: &PeripheralId,
        auto_reconnect: bool,
    ) -> CentralResult<ConnectOutcomes> {
        let name = self.scanner.find(id).and_then(|p| p.name);
        let (outcomes, dropped) = self.link.connect(id.clone(), name, auto_reconnect).await?;
        if let Some(dropped) = dropped {
            self.teardown(dropped).await;
        }
        Ok(outcomes)
    }

    /// Disconnect the tracked peripheral; `auto_reconnect` replaces its policy
    pub async fn disconnect(&self, auto_reconnect: bool) {
        if let Some(dropped) = self.link.disconnect(auto_reconnect).await {
            self.teardown(dropped).await;
        }
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) {
        self.link.set_auto_reconnect(enabled).await
    }

    pub async fn discover_services(
        &self,
        filter: &[Uuid],
    ) -> CentralResult<Completion<Vec<ServiceId>>> {
        self.discovery.discover_services(filter).await
    }

    pub async fn discover_characteristics(
        &self,
        service: &ServiceId,
        filter: &[Uuid],
    ) -> CentralResult<Completion<Vec<Characteristic>>> {
        self.discovery.discover_characteristics(service, filter).await
    }

    pub async fn discover_descriptors(
        &self,
        characteristic: &CharacteristicId,
    ) -> CentralResult<Completion<Vec<Descriptor>>> {
        self.discovery.discover_descriptors(characteristic).await
    }

    pub async fn read(
        &self,
        characteristic: &CharacteristicId,
    ) -> CentralResult<Completion<Vec<u8>>> {
        self.router.read(characteristic).await
    }

    pub async fn write(
        &self,
        characteristic: &CharacteristicId,
        value: &[u8],
        ack_required: bool,
    ) -> CentralResult<Option<Completion<()>>> {
        self.router.write(characteristic, value, ack_required).await
    }

    pub async fn subscribe(&self, characteristic: &CharacteristicId) -> CentralResult<Notifications> {
        self.router.subscribe(characteristic).await
    }

    pub async fn unsubscribe(&self, characteristic: &CharacteristicId) -> CentralResult<()> {
        self.router.unsubscribe(characteristic).await
    }

    /// Consume transport events until the transport closes the channel
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) {
        info!("Central event loop started");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!("Transport event channel closed");
    }

    /// Apply a single transport event
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PowerStateChanged(state) => match self.adapter.apply(state) {
                PowerTransition::LeftPoweredOn => {
                    self.scanner.abandon().await;
                    if let Some(dropped) = self.link.on_power_lost().await {
                        self.teardown(dropped).await;
                    }
                }
                PowerTransition::PoweredOn => {
                    if let Err(e) = self.link.resume().await {
                        warn!("Failed to resume link: {}", e);
                    }
                }
                PowerTransition::Changed | PowerTransition::Unchanged => {}
            },
            TransportEvent::PeripheralSighted(sighting) => {
                self.scanner.record_sighting(sighting).await;
            }
            TransportEvent::Connected { peripheral } => {
                match self.link.on_connected(&peripheral).await {
                    ConnectReport::Accepted => {
                        self.scanner.stop().await;
                        self.discovery.start(&peripheral).await;
                    }
                    ConnectReport::Duplicate => {
                        debug!("Duplicate connect report for {}", peripheral);
                    }
                    ConnectReport::Stale => {
                        warn!("Unexpected connection to {}, disconnecting", peripheral);
                        if let Err(e) = self.transport.disconnect(&peripheral).await {
                            warn!("Failed to disconnect {}: {}", peripheral, e);
                        }
                    }
                }
            }
            TransportEvent::ConnectFailed { peripheral, error } => {
                self.link
                    .on_connect_failed(&peripheral, &error.to_string())
                    .await;
            }
            TransportEvent::Disconnected { peripheral, error } => {
                if let Some(error) = &error {
                    debug!("Disconnect reason for {}: {}", peripheral, error);
                }
                if let Some(dropped) = self.link.on_disconnected(&peripheral).await {
                    self.teardown(dropped).await;
                }
            }
            TransportEvent::ServicesDiscovered { peripheral, result } => {
                self.discovery
                    .on_services_discovered(&peripheral, result)
                    .await;
            }
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => {
                self.discovery
                    .on_characteristics_discovered(&peripheral, &service, result)
                    .await;
            }
            TransportEvent::DescriptorsDiscovered {
                peripheral,
                characteristic,
                result,
            } => {
                self.discovery
                    .on_descriptors_discovered(&peripheral, &characteristic, result)
                    .await;
            }
            TransportEvent::ValueUpdated {
                peripheral,
                characteristic,
                result,
            } => {
                self.router
                    .on_value_updated(&peripheral, &characteristic, result)
                    .await;
            }
            TransportEvent::WriteAcknowledged {
                peripheral,
                characteristic,
                result,
            } => {
                self.router
                    .on_write_acknowledged(&peripheral, &characteristic, result)
                    .await;
            }
        }
    }

    /// Release everything pending on a dropped link, then apply the
    /// reconnect policy
    async fn teardown(&self, dropped: LinkDrop) {
        self.discovery.fail_all(CentralError::LinkLost).await;
        self.router.fail_all(CentralError::LinkLost).await;

        if dropped.reconnect {
            if let Err(e) = self.link.reconnect().await {
                warn!("Failed to reconnect to {}: {}", dropped.peripheral, e);
            }
        }
    }
}
