//! Read, write and notification routing for the connected peripheral

use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::{
    backend::BleTransport,
    core::{
        completion::{Completion, Notifications, Responder, resolve_all},
        error::{CentralError, CentralResult, TransportResult},
        link::LinkView,
        types::{CharacteristicId, PeripheralId},
    },
};

#[derive(Debug, Default)]
struct OperationTable {
    /// Coalesced one-shot reads
    reads: HashMap<CharacteristicId, Vec<Responder<Vec<u8>>>>,
    /// At most one acknowledged write per characteristic
    writes: HashMap<CharacteristicId, Responder<()>>,
    subscriptions: HashMap<CharacteristicId, mpsc::UnboundedSender<TransportResult<Vec<u8>>>>,
}

/// Operation router
///
/// Matches value and acknowledgement reports from the transport to the
/// request that caused them.
pub struct OperationRouter<T: BleTransport> {
    transport: Arc<T>,
    link: LinkView,
    table: Mutex<OperationTable>,
}

impl<T: BleTransport> OperationRouter<T> {
    pub fn new(transport: Arc<T>, link: LinkView) -> Self {
        Self {
            transport,
            link,
            table: Mutex::new(OperationTable::default()),
        }
    }

    /// Connected peripheral, provided `characteristic` is part of its tree
    async fn target(&self, characteristic: &CharacteristicId) -> CentralResult<PeripheralId> {
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
        Ok(peripheral)
    }

    /// Read a characteristic value once
    ///
    /// Joins a read already outstanding for the same characteristic.
    pub async fn read(
        &self,
        characteristic: &CharacteristicId,
    ) -> CentralResult<Completion<Vec<u8>>> {
        let mut table = self.table.lock().await;
        let peripheral = self.target(characteristic).await?;
        let (tx, completion) = Completion::channel();

        if let Some(waiters) = table.reads.get_mut(characteristic) {
            debug!("Joining outstanding read of {}", characteristic);
            waiters.push(tx);
            return Ok(completion);
        }

        self.transport.read(&peripheral, characteristic).await?;
        table.reads.insert(*characteristic, vec![tx]);
        debug!("Reading {}", characteristic);
        Ok(completion)
    }

    /// Write a characteristic value
    ///
    /// With `ack_required` the returned completion resolves on the
    /// peripheral's acknowledgement; a second acknowledged write to the same
    /// characteristic is rejected until then. Without it nothing is returned.
    pub async fn write(
        &self,
        characteristic: &CharacteristicId,
        value: &[u8],
        ack_required: bool,
    ) -> CentralResult<Option<Completion<()>>> {
        let mut table = self.table.lock().await;
        let peripheral = self.target(characteristic).await?;

        if !ack_required {
            self.transport
                .write(&peripheral, characteristic, value, false)
                .await?;
            debug!("Wrote {} bytes to {} without response", value.len(), characteristic);
            return Ok(None);
        }

        if table.writes.contains_key(characteristic) {
            return Err(CentralError::AlreadyInProgress);
        }
        self.transport
            .write(&peripheral, characteristic, value, true)
            .await?;
        let (tx, completion) = Completion::channel();
        table.writes.insert(*characteristic, tx);
        debug!("Writing {} bytes to {}", value.len(), characteristic);
        Ok(Some(completion))
    }

    /// Receive every value change of a characteristic until unsubscribed or
    /// the link drops
    pub async fn subscribe(&self, characteristic: &CharacteristicId) -> CentralResult<Notifications> {
        let mut table = self.table.lock().await;
        let peripheral = self.target(characteristic).await?;
        if table.subscriptions.contains_key(characteristic) {
            return Err(CentralError::AlreadySubscribed);
        }

        self.transport
            .set_notify(&peripheral, characteristic, true)
            .await?;
        let (tx, notifications) = Notifications::channel(*characteristic);
        table.subscriptions.insert(*characteristic, tx);
        info!("Subscribed to {}", characteristic);
        Ok(notifications)
    }

    /// End a subscription; its notification stream terminates
    pub async fn unsubscribe(&self, characteristic: &CharacteristicId) -> CentralResult<()> {
        let mut table = self.table.lock().await;
        let peripheral = self.link.connected_peripheral().await?;
        if table.subscriptions.remove(characteristic).is_none() {
            return Err(CentralError::NotSubscribed);
        }
        info!("Unsubscribed from {}", characteristic);

        self.transport
            .set_notify(&peripheral, characteristic, false)
            .await?;
        Ok(())
    }

    pub async fn is_subscribed(&self, characteristic: &CharacteristicId) -> bool {
        self.table
            .lock()
            .await
            .subscriptions
            .contains_key(characteristic)
    }

    /// Route a value report to the pending read first, then the subscription
    pub(crate) async fn on_value_updated(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        result: TransportResult<Vec<u8>>,
    ) {
        let mut table = self.table.lock().await;
        if self.link.connected_peripheral().await.as_ref() != Ok(peripheral) {
            debug!("Ignoring value of {} from {}", characteristic, peripheral);
            return;
        }

        if let Some(waiters) = table.reads.remove(characteristic) {
            if let Err(e) = &result {
                warn!("Read of {} failed: {}", characteristic, e);
            }
            resolve_all(waiters, result.clone().map_err(CentralError::from));
        }

        if let Some(subscription) = table.subscriptions.get(characteristic) {
            if subscription.send(result).is_err() {
                debug!("Notification stream of {} no longer read", characteristic);
            }
        }
    }

    pub(crate) async fn on_write_acknowledged(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        result: TransportResult<()>,
    ) {
        let mut table = self.table.lock().await;
        if self.link.connected_peripheral().await.as_ref() != Ok(peripheral) {
            debug!("Ignoring write acknowledgement from {}", peripheral);
            return;
        }

        match table.writes.remove(characteristic) {
            Some(waiter) => {
                if let Err(e) = &result {
                    warn!("Write to {} failed: {}", characteristic, e);
                }
                let _ = waiter.send(result.map_err(CentralError::from));
            }
            None => debug!("Unexpected write acknowledgement for {}", characteristic),
        }
    }

    /// Fail pending operations and end every subscription (link dropped)
    pub(crate) async fn fail_all(&self, error: CentralError) {
        let mut table = self.table.lock().await;
        let drained = std::mem::take(&mut *table);
        if !drained.subscriptions.is_empty() {
            info!("Ending {} subscriptions", drained.subscriptions.len());
        }

        for (_, waiters) in drained.reads {
            resolve_all(waiters, Err(error.clone()));
        }
        for (_, waiter) in drained.writes {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockTransport, mock_transport::TransportCommand};
    use crate::core::{
        adapter::AdapterState,
        error::TransportError,
        link::LinkSupervisor,
        types::{Characteristic, CharacteristicProperties, PowerState, ServiceId},
    };
    use futures::{FutureExt, StreamExt};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    struct Fixture {
        transport: Arc<MockTransport>,
        link: LinkSupervisor<MockTransport>,
        router: OperationRouter<MockTransport>,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    }

    async fn connected() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let adapter = Arc::new(AdapterState::new());
        adapter.apply(PowerState::PoweredOn);
        let link = LinkSupervisor::new(transport.clone(), adapter);
        let router = OperationRouter::new(transport.clone(), link.view());

        let peripheral = PeripheralId::from("D1");
        link.connect(peripheral.clone(), None, false).await.unwrap();
        link.on_connected(&peripheral).await;

        let service = ServiceId {
            uuid: Uuid::from_u128(0x181c_0000_1000_8000_0080_5f9b_34fb),
            handle: 1,
        };
        let characteristic = CharacteristicId {
            service,
            uuid: Uuid::from_u128(0x2a99_0000_1000_8000_0080_5f9b_34fb),
            handle: 2,
        };
        link.view()
            .update(&peripheral, |h| {
                h.record_services(&[service]);
                h.record_characteristics(
                    &service,
                    vec![Characteristic {
                        id: characteristic,
                        properties: CharacteristicProperties {
                            read: true,
                            write: true,
                            notify: true,
                            ..Default::default()
                        },
                        descriptors: vec![],
                    }],
                )
            })
            .await;
        transport.clear_commands().await;

        Fixture {
            transport,
            link,
            router,
            peripheral,
            characteristic,
        }
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let f = connected().await;
        f.link.disconnect(false).await;

        assert!(matches!(
            f.router.read(&f.characteristic).await,
            Err(CentralError::NotConnected)
        ));
        assert!(matches!(
            f.router.write(&f.characteristic, &[1], true).await,
            Err(CentralError::NotConnected)
        ));
        assert!(matches!(
            f.router.subscribe(&f.characteristic).await,
            Err(CentralError::NotConnected)
        ));
        assert!(matches!(
            f.router.unsubscribe(&f.characteristic).await,
            Err(CentralError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unknown_characteristic_rejected() {
        let f = connected().await;
        let unknown = CharacteristicId {
            handle: 99,
            ..f.characteristic
        };

        assert!(matches!(
            f.router.read(&unknown).await,
            Err(CentralError::UnknownAttribute(_))
        ));
        assert!(f.transport.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_resolves_with_value() {
        let f = connected().await;
        let read = f.router.read(&f.characteristic).await.unwrap();

        f.router
            .on_value_updated(&f.peripheral, &f.characteristic, Ok(vec![0x2a]))
            .await;
        assert_eq!(read.await, Ok(vec![0x2a]));
    }

    #[tokio::test]
    async fn test_concurrent_reads_coalesce() {
        let f = connected().await;
        let first = f.router.read(&f.characteristic).await.unwrap();
        let second = f.router.read(&f.characteristic).await.unwrap();

        assert_eq!(
            f.transport
                .count(|c| matches!(c, TransportCommand::Read { .. }))
                .await,
            1
        );

        f.router
            .on_value_updated(&f.peripheral, &f.characteristic, Ok(vec![1, 2]))
            .await;
        assert_eq!(first.await, Ok(vec![1, 2]));
        assert_eq!(second.await, Ok(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_read_issue_failure_leaves_no_pending() {
        let f = connected().await;
        f.transport.set_read_failure(true).await;

        assert!(matches!(
            f.router.read(&f.characteristic).await,
            Err(CentralError::Transport(_))
        ));

        f.transport.set_read_failure(false).await;
        f.router.read(&f.characteristic).await.unwrap();
        assert_eq!(
            f.transport
                .count(|c| matches!(c, TransportCommand::Read { .. }))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_value_reaches_read_and_subscription() {
        let f = connected().await;
        let mut notifications = f.router.subscribe(&f.characteristic).await.unwrap();
        let read = f.router.read(&f.characteristic).await.unwrap();

        f.router
            .on_value_updated(&f.peripheral, &f.characteristic, Ok(vec![5]))
            .await;
        assert_eq!(read.await, Ok(vec![5]));
        assert_eq!(notifications.next().await, Some(Ok(vec![5])));

        // Later updates only reach the subscription
        f.router
            .on_value_updated(&f.peripheral, &f.characteristic, Ok(vec![6]))
            .await;
        assert_eq!(notifications.next().await, Some(Ok(vec![6])));
    }

    #[tokio::test]
    async fn test_acknowledged_write() {
        let f = connected().await;
        let write = f
            .router
            .write(&f.characteristic, &[1, 2, 3], true)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            f.router.write(&f.characteristic, &[4], true).await,
            Err(CentralError::AlreadyInProgress)
        ));

        f.router
            .on_write_acknowledged(&f.peripheral, &f.characteristic, Ok(()))
            .await;
        assert_eq!(write.await, Ok(()));

        // Slot is free again
        assert!(f.router.write(&f.characteristic, &[4], true).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_error_delivered() {
        let f = connected().await;
        let write = f
            .router
            .write(&f.characteristic, &[1], true)
            .await
            .unwrap()
            .unwrap();

        let error = TransportError::Stack("write not permitted".into());
        f.router
            .on_write_acknowledged(&f.peripheral, &f.characteristic, Err(error.clone()))
            .await;
        assert_eq!(write.await, Err(CentralError::Transport(error)));
    }

    #[tokio::test]
    async fn test_write_issue_failure_leaves_no_pending() {
        let f = connected().await;
        f.transport.set_write_failure(true).await;

        assert!(matches!(
            f.router.write(&f.characteristic, &[1], true).await,
            Err(CentralError::Transport(_))
        ));

        f.transport.set_write_failure(false).await;
        let write = f
            .router
            .write(&f.characteristic, &[2], true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            f.transport
                .count(|c| matches!(c, TransportCommand::Write { .. }))
                .await,
            1
        );

        f.router
            .on_write_acknowledged(&f.peripheral, &f.characteristic, Ok(()))
            .await;
        assert_eq!(write.await, Ok(()));
    }

    #[tokio::test]
    async fn test_write_without_response_takes_no_slot() {
        let f = connected().await;
        let pending = f
            .router
            .write(&f.characteristic, &[1], true)
            .await
            .unwrap();
        assert!(pending.is_some());

        assert!(
            f.router
                .write(&f.characteristic, &[2], false)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            f.transport
                .commands()
                .await
                .contains(&TransportCommand::Write {
                    peripheral: f.peripheral.clone(),
                    characteristic: f.characteristic,
                    value: vec![2],
                    with_response: false,
                })
        );
    }

    #[tokio::test]
    async fn test_subscribe_twice_rejected() {
        let f = connected().await;
        let _notifications = f.router.subscribe(&f.characteristic).await.unwrap();

        assert!(matches!(
            f.router.subscribe(&f.characteristic).await,
            Err(CentralError::AlreadySubscribed)
        ));
        assert_eq!(
            f.transport
                .count(|c| matches!(c, TransportCommand::SetNotify { enabled: true, .. }))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_tears_down() {
        let f = connected().await;
        let mut notifications = f.router.subscribe(&f.characteristic).await.unwrap();

        f.router.unsubscribe(&f.characteristic).await.unwrap();
        assert!(matches!(
            f.router.unsubscribe(&f.characteristic).await,
            Err(CentralError::NotSubscribed)
        ));

        f.router
            .on_value_updated(&f.peripheral, &f.characteristic, Ok(vec![9]))
            .await;
        assert_eq!(notifications.next().await, None);
        assert!(!f.router.is_subscribed(&f.characteristic).await);
    }

    #[tokio::test]
    async fn test_link_loss_fails_read_once_and_ends_subscription() {
        let f = connected().await;
        let mut notifications = f.router.subscribe(&f.characteristic).await.unwrap();
        let read = f.router.read(&f.characteristic).await.unwrap();

        f.link.on_disconnected(&f.peripheral).await;
        f.router.fail_all(CentralError::LinkLost).await;

        assert_eq!(read.await, Err(CentralError::LinkLost));
        assert_eq!(notifications.next().await, None);

        // Late value for the old link goes nowhere
        f.router
            .on_value_updated(&f.peripheral, &f.characteristic, Ok(vec![1]))
            .await;
        assert!(notifications.next().now_or_never().flatten().is_none());
    }
}
