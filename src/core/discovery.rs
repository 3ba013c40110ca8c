//! Service → characteristic → descriptor discovery for the connected peripheral

use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::BleTransport,
    core::{
        completion::{Completion, Responder, resolve_all},
        error::{CentralError, CentralResult, TransportResult},
        link::LinkView,
        types::{Characteristic, CharacteristicId, Descriptor, PeripheralId, ServiceId},
    },
};

/// Filters applied by the discovery that runs after every connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Services to discover; empty means all
    pub services: Vec<Uuid>,
    /// Characteristics to discover in each service; empty means all
    pub characteristics: Vec<Uuid>,
    /// Also discover descriptors of every characteristic
    pub descriptors: bool,
}

/// Outstanding discovery requests, one per target
///
/// A present entry means the transport request was issued; the vector holds
/// the callers waiting for it (possibly none for automatic discovery).
#[derive(Debug, Default)]
struct PendingDiscoveries {
    services: Option<Vec<Responder<Vec<ServiceId>>>>,
    characteristics: HashMap<ServiceId, Vec<Responder<Vec<Characteristic>>>>,
    descriptors: HashMap<CharacteristicId, Vec<Responder<Vec<Descriptor>>>>,
}

impl PendingDiscoveries {
    fn is_empty(&self) -> bool {
        self.services.is_none() && self.characteristics.is_empty() && self.descriptors.is_empty()
    }
}

/// Discovery pipeline
///
/// Requests to a target that already has one outstanding join it instead of
/// issuing a second transport request.
pub struct DiscoveryPipeline<T: BleTransport> {
    transport: Arc<T>,
    link: LinkView,
    config: DiscoveryConfig,
    pending: Mutex<PendingDiscoveries>,
}

impl<T: BleTransport> DiscoveryPipeline<T> {
    pub fn new(transport: Arc<T>, link: LinkView, config: DiscoveryConfig) -> Self {
        Self {
            transport,
            link,
            config,
            pending: Mutex::new(PendingDiscoveries::default()),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Kick off the configured cascade for a freshly connected peripheral
    pub(crate) async fn start(&self, peripheral: &PeripheralId) {
        info!("Starting discovery on {}", peripheral);
        let mut pending = self.pending.lock().await;
        self.request_services(&mut pending, peripheral, &self.config.services, None)
            .await;
    }

    /// Discover the services of the connected peripheral
    ///
    /// Joins an outstanding service discovery if there is one, in which case
    /// `filter` is not applied.
    pub async fn discover_services(
        &self,
        filter: &[Uuid],
    ) -> CentralResult<Completion<Vec<ServiceId>>> {
        let mut pending = self.pending.lock().await;
        let peripheral = self.link.connected_peripheral().await?;
        let (tx, completion) = Completion::channel();
        self.request_services(&mut pending, &peripheral, filter, Some(tx))
            .await;
        Ok(completion)
    }

    /// Discover the characteristics of one recorded service
    pub async fn discover_characteristics(
        &self,
        service: &ServiceId,
        filter: &[Uuid],
    ) -> CentralResult<Completion<Vec<Characteristic>>> {
        let mut pending = self.pending.lock().await;
        let peripheral = self.link.connected_peripheral().await?;
        if !self.link.read(|h| h.has_service(service)).await? {
            return Err(CentralError::UnknownAttribute(format!(
                "service {}",
                service.uuid
            )));
        }
        let (tx, completion) = Completion::channel();
        self.request_characteristics(&mut pending, &peripheral, service, filter, Some(tx))
            .await;
        Ok(completion)
    }

    /// Discover the descriptors of one recorded characteristic
    pub async fn discover_descriptors(
        &self,
        characteristic: &CharacteristicId,
    ) -> CentralResult<Completion<Vec<Descriptor>>> {
        let mut pending = self.pending.lock().await;
        let peripheral = self.link.connected_peripheral().await?;
        if self
            .link
            .read(|h| h.characteristic(characteristic).is_none())
            .await?
        {
            return Err(CentralError::UnknownAttribute(format!(
                "characteristic {}",
                characteristic
            )));
        }
        let (tx, completion) = Completion::channel();
        self.request_descriptors(&mut pending, &peripheral, characteristic, Some(tx))
            .await;
        Ok(completion)
    }

    async fn request_services(
        &self,
        pending: &mut PendingDiscoveries,
        peripheral: &PeripheralId,
        filter: &[Uuid],
        waiter: Option<Responder<Vec<ServiceId>>>,
    ) {
        if let Some(waiters) = pending.services.as_mut() {
            debug!("Joining outstanding service discovery");
            waiters.extend(waiter);
            return;
        }
        pending.services = Some(waiter.into_iter().collect());
        if let Err(e) = self.transport.discover_services(peripheral, filter).await {
            warn!("Failed to issue service discovery: {}", e);
            resolve_all(pending.services.take().unwrap_or_default(), Err(e.into()));
        }
    }

    async fn request_characteristics(
        &self,
        pending: &mut PendingDiscoveries,
        peripheral: &PeripheralId,
        service: &ServiceId,
        filter: &[Uuid],
        waiter: Option<Responder<Vec<Characteristic>>>,
    ) {
        if let Some(waiters) = pending.characteristics.get_mut(service) {
            debug!("Joining outstanding characteristic discovery for {}", service.uuid);
            waiters.extend(waiter);
            return;
        }
        pending
            .characteristics
            .insert(*service, waiter.into_iter().collect());
        if let Err(e) = self
            .transport
            .discover_characteristics(peripheral, service, filter)
            .await
        {
            warn!("Failed to issue characteristic discovery: {}", e);
            let waiters = pending.characteristics.remove(service).unwrap_or_default();
            resolve_all(waiters, Err(e.into()));
        }
    }

    async fn request_descriptors(
        &self,
        pending: &mut PendingDiscoveries,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        waiter: Option<Responder<Vec<Descriptor>>>,
    ) {
        if let Some(waiters) = pending.descriptors.get_mut(characteristic) {
            waiters.extend(waiter);
            return;
        }
        pending
            .descriptors
            .insert(*characteristic, waiter.into_iter().collect());
        if let Err(e) = self
            .transport
            .discover_descriptors(peripheral, characteristic)
            .await
        {
            warn!("Failed to issue descriptor discovery: {}", e);
            let waiters = pending.descriptors.remove(characteristic).unwrap_or_default();
            resolve_all(waiters, Err(e.into()));
        }
    }

    pub(crate) async fn on_services_discovered(
        &self,
        peripheral: &PeripheralId,
        result: TransportResult<Vec<ServiceId>>,
    ) {
        let mut pending = self.pending.lock().await;
        if self.link.connected_peripheral().await.as_ref() != Ok(peripheral) {
            debug!("Ignoring service discovery result from {}", peripheral);
            return;
        }
        let waiters = pending.services.take().unwrap_or_default();

        let services = match result {
            Ok(services) => services,
            Err(e) => {
                warn!("Service discovery on {} failed: {}", peripheral, e);
                resolve_all(waiters, Err(e.into()));
                return;
            }
        };

        info!("Discovered {} services on {}", services.len(), peripheral);
        self.link
            .update(peripheral, |h| h.record_services(&services))
            .await;
        resolve_all(waiters, Ok(services.clone()));

        for service in &services {
            self.request_characteristics(
                &mut pending,
                peripheral,
                service,
                &self.config.characteristics,
                None,
            )
            .await;
        }
    }

    pub(crate) async fn on_characteristics_discovered(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceId,
        result: TransportResult<Vec<Characteristic>>,
    ) {
        let mut pending = self.pending.lock().await;
        if self.link.connected_peripheral().await.as_ref() != Ok(peripheral) {
            debug!("Ignoring characteristic discovery result from {}", peripheral);
            return;
        }
        let waiters = pending.characteristics.remove(service).unwrap_or_default();

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!(
                    "Characteristic discovery for {} failed: {}",
                    service.uuid, e
                );
                resolve_all(waiters, Err(e.into()));
                return;
            }
        };

        // Only characteristics of the requested service are recorded
        let characteristics: Vec<Characteristic> = characteristics
            .into_iter()
            .filter(|c| c.id.service == *service)
            .collect();

        let recorded = self
            .link
            .update(peripheral, |h| {
                h.record_characteristics(service, characteristics.clone())
            })
            .await
            .unwrap_or(false);
        if !recorded {
            warn!("Characteristics reported for unknown service {}", service.uuid);
            resolve_all(
                waiters,
                Err(CentralError::UnknownAttribute(format!(
                    "service {}",
                    service.uuid
                ))),
            );
            return;
        }

        debug!(
            "Discovered {} characteristics in {}",
            characteristics.len(),
            service.uuid
        );
        resolve_all(waiters, Ok(characteristics.clone()));

        if self.config.descriptors {
            for characteristic in &characteristics {
                self.request_descriptors(&mut pending, peripheral, &characteristic.id, None)
                    .await;
            }
        }
    }

    pub(crate) async fn on_descriptors_discovered(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        result: TransportResult<Vec<Descriptor>>,
    ) {
        let mut pending = self.pending.lock().await;
        if self.link.connected_peripheral().await.as_ref() != Ok(peripheral) {
            debug!("Ignoring descriptor discovery result from {}", peripheral);
            return;
        }
        let waiters = pending
            .descriptors
            .remove(characteristic)
            .unwrap_or_default();

        match result {
            Ok(descriptors) => {
                self.link
                    .update(peripheral, |h| {
                        h.record_descriptors(characteristic, descriptors.clone())
                    })
                    .await;
                resolve_all(waiters, Ok(descriptors));
            }
            Err(e) => {
                warn!("Descriptor discovery for {} failed: {}", characteristic, e);
                resolve_all(waiters, Err(e.into()));
            }
        }
    }

    /// Fail every outstanding discovery (link dropped)
    pub(crate) async fn fail_all(&self, error: CentralError) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        let drained = std::mem::take(&mut *pending);
        debug!("Failing outstanding discoveries: {}", error);

        resolve_all(drained.services.unwrap_or_default(), Err(error.clone()));
        for (_, waiters) in drained.characteristics {
            resolve_all(waiters, Err(error.clone()));
        }
        for (_, waiters) in drained.descriptors {
            resolve_all(waiters, Err(error.clone()));
        }
    }
}
