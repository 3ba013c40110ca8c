//! Bluetooth transport abstraction layer

pub mod bluer_transport;
pub mod mock_transport;
pub mod transport;

pub use bluer_transport::BluerTransport;
pub use transport::{BleTransport, TransportEvent};

#[cfg(test)]
pub use mock_transport::MockTransport;
