//! BLE Central
//!
//! Connection and discovery state machine for a Bluetooth LE central:
//! - adapter power tracking and scanning with deduplicated sightings
//! - single-peripheral link supervision with optional auto-reconnect
//! - service/characteristic/descriptor discovery
//! - read, write and notification routing

pub mod backend;
pub mod config;
pub mod core;
pub mod uuids;

pub use crate::core::{
    central::BleCentral,
    error::{CentralError, CentralResult, TransportError, TransportResult},
    types::{ConnectionState, DiscoveredPeripheral, PeripheralHandle, PeripheralId, PowerState},
};
