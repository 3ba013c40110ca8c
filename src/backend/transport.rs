//! Bluetooth transport trait definition

use trait_variant::make;
use uuid::Uuid;

use crate::core::error::{TransportError, TransportResult};
use crate::core::types::{
    Characteristic, CharacteristicId, Descriptor, PeripheralId, PeripheralSighting, PowerState,
    ServiceId,
};

/// Abstraction over the host's Bluetooth LE central stack
///
/// Every method only issues a request. Its outcome is reported later as a
/// [`TransportEvent`] on the event channel handed out by the implementation;
/// an immediate error means the request was never issued.
#[make(Send)]
pub trait BleTransport: Sync + 'static {
    /// Start reporting advertisements, optionally limited to devices
    /// advertising one of `services`
    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> TransportResult<()>;

    async fn stop_scan(&self) -> TransportResult<()>;

    /// Answered by `Connected` or `ConnectFailed`
    async fn connect(&self, peripheral: &PeripheralId) -> TransportResult<()>;

    /// Abandon an attempt issued by `connect`
    async fn cancel_connect(&self, peripheral: &PeripheralId) -> TransportResult<()>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> TransportResult<()>;

    /// Answered by `ServicesDiscovered`
    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: &[Uuid],
    ) -> TransportResult<()>;

    /// Answered by `CharacteristicsDiscovered`
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceId,
        filter: &[Uuid],
    ) -> TransportResult<()>;

    /// Answered by `DescriptorsDiscovered`
    async fn discover_descriptors(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()>;

    /// Answered by `ValueUpdated`
    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()>;

    /// Answered by `WriteAcknowledged` when `with_response` is set
    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        value: &[u8],
        with_response: bool,
    ) -> TransportResult<()>;

    /// While enabled, value changes arrive as `ValueUpdated`
    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> TransportResult<()>;
}

/// Everything the platform stack reports back, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PowerStateChanged(PowerState),
    PeripheralSighted(PeripheralSighting),
    Connected {
        peripheral: PeripheralId,
    },
    ConnectFailed {
        peripheral: PeripheralId,
        error: TransportError,
    },
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        result: TransportResult<Vec<ServiceId>>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: ServiceId,
        result: TransportResult<Vec<Characteristic>>,
    },
    DescriptorsDiscovered {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: TransportResult<Vec<Descriptor>>,
    },
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: TransportResult<Vec<u8>>,
    },
    WriteAcknowledged {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: TransportResult<()>,
    },
}
