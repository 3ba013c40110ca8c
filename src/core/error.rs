//! Error types for the BLE central

use thiserror::Error;

use super::types::PowerState;

/// Result type for requests issued to the platform stack
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for central operations
pub type CentralResult<T> = Result<T, CentralError>;

/// Opaque errors surfaced by the underlying Bluetooth stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth stack error: {0}")]
    Stack(String),

    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Invalid peripheral address: {0}")]
    InvalidAddress(String),
}

/// Errors related to central operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CentralError {
    #[error("Adapter not ready (state: {0})")]
    NotReady(PowerState),

    #[error("Operation already in progress")]
    AlreadyInProgress,

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Link lost while the operation was pending")]
    LinkLost,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Characteristic already subscribed")]
    AlreadySubscribed,

    #[error("Characteristic not subscribed")]
    NotSubscribed,

    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),
}
