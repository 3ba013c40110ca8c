//! Domain types for the BLE central

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::SystemTime};
use uuid::Uuid;

/// Name reported for peripherals that never advertised one
pub const UNKNOWN_PERIPHERAL_NAME: &str = "Unknown";

/// Local radio power/capability state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl PowerState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, PowerState::PoweredOn)
    }

    /// States the radio does not leave for the lifetime of the process
    pub fn is_terminal(&self) -> bool {
        matches!(self, PowerState::Unsupported | PowerState::Unauthorized)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::Unknown => "unknown",
            PowerState::Resetting => "resetting",
            PowerState::Unsupported => "unsupported",
            PowerState::Unauthorized => "unauthorized",
            PowerState::PoweredOff => "powered off",
            PowerState::PoweredOn => "powered on",
        };
        f.write_str(name)
    }
}

/// Stable identifier of a remote peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advertisement payload of the most recent sighting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub tx_power: Option<i16>,
}

/// A single advertisement report from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralSighting {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub advertisement: Advertisement,
    /// Signal strength in dBm
    pub rssi: i16,
}

/// Deduplicated scan result, one per physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub advertisement: Advertisement,
    /// Signal strength of the latest sighting in dBm
    pub rssi: i16,
    /// Time of the first sighting in the current scan session
    pub discovered_at: SystemTime,
}

impl DiscoveredPeripheral {
    pub fn from_sighting(sighting: PeripheralSighting) -> Self {
        Self {
            id: sighting.id,
            name: sighting.name,
            advertisement: sighting.advertisement,
            rssi: sighting.rssi,
            discovered_at: SystemTime::now(),
        }
    }

    /// Refresh signal strength and payload from a repeat sighting
    pub fn update(&mut self, sighting: PeripheralSighting) {
        self.rssi = sighting.rssi;
        self.advertisement = sighting.advertisement;
        if sighting.name.is_some() {
            self.name = sighting.name;
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_PERIPHERAL_NAME)
    }
}

/// Link state of the tracked peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Primary service on a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub uuid: Uuid,
    /// Attribute handle; disambiguates repeated UUIDs
    pub handle: u16,
}

/// Characteristic within a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: ServiceId,
    pub uuid: Uuid,
    pub handle: u16,
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (handle {:#06x})", self.uuid, self.handle)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub id: CharacteristicId,
    pub properties: CharacteristicProperties,
    /// Empty until descriptor discovery ran for this characteristic
    pub descriptors: Vec<Descriptor>,
}

/// A discovered service and its characteristics, in discovery order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub service: ServiceId,
    pub characteristics: Vec<Characteristic>,
}

/// Owning record of the single peripheral tracked by the link supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralHandle {
    pub id: PeripheralId,
    pub name: String,
    pub state: ConnectionState,
    pub auto_reconnect: bool,
    pub services: Vec<DiscoveredService>,
}

impl PeripheralHandle {
    pub fn new(id: PeripheralId, name: Option<String>, auto_reconnect: bool) -> Self {
        Self {
            id,
            name: name.unwrap_or_else(|| UNKNOWN_PERIPHERAL_NAME.to_string()),
            state: ConnectionState::Disconnected,
            auto_reconnect,
            services: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn has_service(&self, service: &ServiceId) -> bool {
        self.services.iter().any(|s| s.service == *service)
    }

    pub fn characteristics(&self, service: &ServiceId) -> Option<&[Characteristic]> {
        self.services
            .iter()
            .find(|s| s.service == *service)
            .map(|s| s.characteristics.as_slice())
    }

    pub fn characteristic(&self, id: &CharacteristicId) -> Option<&Characteristic> {
        self.characteristics(&id.service)?
            .iter()
            .find(|c| c.id == *id)
    }

    /// Add newly discovered services, keeping characteristics already known
    pub fn record_services(&mut self, services: &[ServiceId]) {
        for service in services {
            if !self.has_service(service) {
                self.services.push(DiscoveredService {
                    service: *service,
                    characteristics: Vec::new(),
                });
            }
        }
    }

    /// Replace the characteristic list of one service.
    ///
    /// Returns false when the service was never recorded.
    pub fn record_characteristics(
        &mut self,
        service: &ServiceId,
        characteristics: Vec<Characteristic>,
    ) -> bool {
        match self.services.iter_mut().find(|s| s.service == *service) {
            Some(entry) => {
                entry.characteristics = characteristics;
                true
            }
            None => false,
        }
    }

    pub fn record_descriptors(
        &mut self,
        characteristic: &CharacteristicId,
        descriptors: Vec<Descriptor>,
    ) -> bool {
        let entry = self
            .services
            .iter_mut()
            .find(|s| s.service == characteristic.service)
            .and_then(|s| {
                s.characteristics
                    .iter_mut()
                    .find(|c| c.id == *characteristic)
            });
        match entry {
            Some(c) => {
                c.descriptors = descriptors;
                true
            }
            None => false,
        }
    }

    /// Forget the service tree (link dropped)
    pub fn clear_services(&mut self) {
        self.services.clear();
    }
}
