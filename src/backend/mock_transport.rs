//! Mock Bluetooth transport for testing

use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::BleTransport;
use crate::core::error::{TransportError, TransportResult};
use crate::core::types::{CharacteristicId, PeripheralId, ServiceId};

/// A request issued to the mock, recorded in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    StartScan {
        services: Vec<Uuid>,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(PeripheralId),
    CancelConnect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices {
        peripheral: PeripheralId,
        filter: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        peripheral: PeripheralId,
        service: ServiceId,
        filter: Vec<Uuid>,
    },
    DiscoverDescriptors {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    },
    Read {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    },
    Write {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        with_response: bool,
    },
    SetNotify {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
    },
}

/// Internal state for the mock transport
#[derive(Debug, Default)]
struct MockState {
    commands: Vec<TransportCommand>,
    should_fail_connect: bool,
    should_fail_read: bool,
    should_fail_write: bool,
    should_fail_disconnect: bool,
}

/// Mock transport for testing
///
/// Records every issued request; events are fed to the central by the test.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All requests issued so far
    pub async fn commands(&self) -> Vec<TransportCommand> {
        self.inner.lock().await.commands.clone()
    }

    /// Number of recorded requests matching `predicate`
    pub async fn count(&self, predicate: impl Fn(&TransportCommand) -> bool) -> usize {
        self.inner
            .lock()
            .await
            .commands
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    pub async fn clear_commands(&self) {
        self.inner.lock().await.commands.clear();
    }

    /// Configure mock to refuse issuing connect requests
    pub async fn set_connect_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_connect = should_fail;
    }

    /// Configure mock to refuse issuing read requests
    pub async fn set_read_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_read = should_fail;
    }

    /// Configure mock to refuse issuing write requests
    pub async fn set_write_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_write = should_fail;
    }

    /// Configure mock to fail cancel and disconnect requests
    ///
    /// The request is still recorded; only the result is an error.
    pub async fn set_disconnect_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_disconnect = should_fail;
    }

    async fn record(&self, command: TransportCommand) {
        self.inner.lock().await.commands.push(command);
    }
}

impl BleTransport for MockTransport {
    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> TransportResult<()> {
        self.record(TransportCommand::StartScan {
            services: services.to_vec(),
            allow_duplicates,
        })
        .await;
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.record(TransportCommand::StopScan).await;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> TransportResult<()> {
        let mut state = self.inner.lock().await;
        if state.should_fail_connect {
            return Err(TransportError::Stack("Mock connect failure".into()));
        }
        state
            .commands
            .push(TransportCommand::Connect(peripheral.clone()));
        Ok(())
    }

    async fn cancel_connect(&self, peripheral: &PeripheralId) -> TransportResult<()> {
        let mut state = self.inner.lock().await;
        state
            .commands
            .push(TransportCommand::CancelConnect(peripheral.clone()));
        if state.should_fail_disconnect {
            return Err(TransportError::Stack("Mock cancel failure".into()));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> TransportResult<()> {
        let mut state = self.inner.lock().await;
        state
            .commands
            .push(TransportCommand::Disconnect(peripheral.clone()));
        if state.should_fail_disconnect {
            return Err(TransportError::Stack("Mock disconnect failure".into()));
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: &[Uuid],
    ) -> TransportResult<()> {
        self.record(TransportCommand::DiscoverServices {
            peripheral: peripheral.clone(),
            filter: filter.to_vec(),
        })
        .await;
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceId,
        filter: &[Uuid],
    ) -> TransportResult<()> {
        self.record(TransportCommand::DiscoverCharacteristics {
            peripheral: peripheral.clone(),
            service: *service,
            filter: filter.to_vec(),
        })
        .await;
        Ok(())
    }

    async fn discover_descriptors(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()> {
        self.record(TransportCommand::DiscoverDescriptors {
            peripheral: peripheral.clone(),
            characteristic: *characteristic,
        })
        .await;
        Ok(())
    }

    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()> {
        let mut state = self.inner.lock().await;
        if state.should_fail_read {
            return Err(TransportError::Stack("Mock read failure".into()));
        }
        state.commands.push(TransportCommand::Read {
            peripheral: peripheral.clone(),
            characteristic: *characteristic,
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
        let mut state = self.inner.lock().await;
        if state.should_fail_write {
            return Err(TransportError::Stack("Mock write failure".into()));
        }
        state.commands.push(TransportCommand::Write {
            peripheral: peripheral.clone(),
            characteristic: *characteristic,
            value: value.to_vec(),
            with_response,
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> TransportResult<()> {
        self.record(TransportCommand::SetNotify {
            peripheral: peripheral.clone(),
            characteristic: *characteristic,
            enabled,
        })
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_commands_in_order() {
        let transport = MockTransport::new();
        let peripheral = PeripheralId::from("D1");

        transport.start_scan(&[], false).await.unwrap();
        transport.connect(&peripheral).await.unwrap();
        transport.stop_scan().await.unwrap();

        assert_eq!(
            transport.commands().await,
            vec![
                TransportCommand::StartScan {
                    services: vec![],
                    allow_duplicates: false
                },
                TransportCommand::Connect(peripheral),
                TransportCommand::StopScan,
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_connect_failure() {
        let transport = MockTransport::new();
        transport.set_connect_failure(true).await;

        assert!(transport.connect(&"D1".into()).await.is_err());
        assert!(transport.commands().await.is_empty());
    }
}
