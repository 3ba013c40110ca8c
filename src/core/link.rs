//! Connection lifecycle of the single tracked peripheral

use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    backend::BleTransport,
    core::{
        adapter::AdapterState,
        completion::ConnectOutcomes,
        error::{CentralError, CentralResult},
        types::{ConnectionState, PeripheralHandle, PeripheralId},
    },
};

/// A link that went away; pending operations on it must be failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkDrop {
    pub peripheral: PeripheralId,
    /// Auto-reconnect policy asks for a new attempt
    pub reconnect: bool,
}

/// How a connect-succeeded report relates to the tracked peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectReport {
    /// Pending attempt completed
    Accepted,
    /// Already connected, nothing changed
    Duplicate,
    /// No attempt is pending for this peripheral
    Stale,
}

#[derive(Debug, Default)]
struct LinkSlot {
    handle: Option<PeripheralHandle>,
    /// Completion handler of the `connect` call that created the handle
    outcomes: Option<mpsc::UnboundedSender<bool>>,
    /// Link was lost to a power cycle and should come back with the radio
    suspended: bool,
    /// A connected auto-reconnect link dropped and no new attempt is out yet
    reconnect_pending: bool,
}

impl LinkSlot {
    fn tracks(&self, id: &PeripheralId) -> Option<&PeripheralHandle> {
        self.handle.as_ref().filter(|h| h.id == *id)
    }

    fn report(&self, connected: bool) {
        if let Some(outcomes) = &self.outcomes {
            // Receiver gone means nobody is waiting for the outcome
            let _ = outcomes.send(connected);
        }
    }

    /// No attempt will follow; the outcome stream ends
    fn cancel_reconnect(&mut self) {
        self.suspended = false;
        self.reconnect_pending = false;
        self.outcomes = None;
    }

    /// Move the tracked handle to `Disconnected`, returning the drop if it
    /// was connecting or connected
    fn drop_link(&mut self) -> Option<LinkDrop> {
        let handle = self.handle.as_mut()?;
        let was_connected = match handle.state {
            ConnectionState::Disconnected => return None,
            ConnectionState::Connecting => false,
            ConnectionState::Connected => true,
        };
        handle.state = ConnectionState::Disconnected;
        handle.clear_services();
        let drop = LinkDrop {
            peripheral: handle.id.clone(),
            reconnect: was_connected && handle.auto_reconnect,
        };
        if !was_connected {
            self.report(false);
        }
        if drop.reconnect {
            self.reconnect_pending = true;
        } else {
            self.cancel_reconnect();
        }
        Some(drop)
    }
}

/// Link supervisor
///
/// Owns connect/disconnect of at most one peripheral at a time and applies
/// the auto-reconnect policy.
pub struct LinkSupervisor<T: BleTransport> {
    transport: Arc<T>,
    adapter: Arc<AdapterState>,
    slot: Arc<RwLock<LinkSlot>>,
    feed: Arc<watch::Sender<Option<PeripheralHandle>>>,
}

impl<T: BleTransport> LinkSupervisor<T> {
    pub fn new(transport: Arc<T>, adapter: Arc<AdapterState>) -> Self {
        let (feed, _) = watch::channel(None);
        Self {
            transport,
            adapter,
            slot: Arc::new(RwLock::new(LinkSlot::default())),
            feed: Arc::new(feed),
        }
    }

    fn publish(&self, slot: &LinkSlot) {
        self.feed.send_replace(slot.handle.clone());
    }

    /// Non-owning access for components working on the connected peripheral
    pub fn view(&self) -> LinkView {
        LinkView {
            slot: Arc::downgrade(&self.slot),
            feed: Arc::downgrade(&self.feed),
        }
    }

    /// Connect to a peripheral, replacing any other tracked one
    ///
    /// Returns the outcome stream for this request plus the link that had to
    /// be torn down to make room, if any.
    pub(crate) async fn connect(
        &self,
        id: PeripheralId,
        name: Option<String>,
        auto_reconnect: bool,
    ) -> CentralResult<(ConnectOutcomes, Option<LinkDrop>)> {
        let power = self.adapter.current_state();
        if !power.is_powered_on() {
            return Err(CentralError::NotReady(power));
        }

        let mut slot = self.slot.write().await;
        let mut dropped = None;

        if let Some(current) = slot.handle.as_ref() {
            let current_id = current.id.clone();
            match current.state {
                ConnectionState::Connecting | ConnectionState::Connected if current_id == id => {
                    debug!("Connect to {} ignored, already {:?}", id, current.state);
                    return Err(CentralError::AlreadyInProgress);
                }
                ConnectionState::Connecting => {
                    info!("Cancelling connection attempt to {}", current_id);
                    if let Err(e) = self.transport.cancel_connect(&current_id).await {
                        warn!("Failed to cancel connect to {}: {}", current_id, e);
                    }
                    slot.drop_link();
                }
                ConnectionState::Connected => {
                    info!("Disconnecting {} to connect {}", current_id, id);
                    if let Err(e) = self.transport.disconnect(&current_id).await {
                        warn!("Failed to disconnect {}: {}", current_id, e);
                    }
                    dropped = slot.drop_link().map(|lost| LinkDrop {
                        reconnect: false,
                        ..lost
                    });
                }
                ConnectionState::Disconnected => {}
            }
        }

        let (tx, outcomes) = ConnectOutcomes::channel();
        let mut handle = PeripheralHandle::new(id.clone(), name, auto_reconnect);
        handle.state = ConnectionState::Connecting;
        slot.handle = Some(handle);
        slot.outcomes = Some(tx);
        slot.suspended = false;
        slot.reconnect_pending = false;
        self.publish(&slot);

        if let Err(e) = self.transport.connect(&id).await {
            warn!("Failed to issue connect to {}: {}", id, e);
            if let Some(handle) = slot.handle.as_mut() {
                handle.state = ConnectionState::Disconnected;
            }
            slot.outcomes = None;
            self.publish(&slot);
            return Err(e.into());
        }

        info!(auto_reconnect, "Connecting to {}", id);
        Ok((outcomes, dropped))
    }

    /// Tear down the tracked link
    ///
    /// `auto_reconnect` replaces the handle's policy first, so passing false
    /// also ends any reconnect loop. The link is released locally even when
    /// the transport refuses the request.
    pub(crate) async fn disconnect(&self, auto_reconnect: bool) -> Option<LinkDrop> {
        let mut slot = self.slot.write().await;
        let handle = slot.handle.as_mut()?;
        handle.auto_reconnect = auto_reconnect;
        let id = handle.id.clone();

        let result = match handle.state {
            ConnectionState::Disconnected => {
                if !auto_reconnect {
                    slot.cancel_reconnect();
                }
                self.publish(&slot);
                return None;
            }
            ConnectionState::Connecting => self.transport.cancel_connect(&id).await,
            ConnectionState::Connected => self.transport.disconnect(&id).await,
        };
        if let Err(e) = result {
            warn!("Failed to disconnect {}: {}", id, e);
        }

        let dropped = slot.drop_link();
        self.publish(&slot);
        info!(auto_reconnect, "Disconnected from {}", id);
        dropped
    }

    /// Change the auto-reconnect policy of the tracked peripheral
    pub async fn set_auto_reconnect(&self, enabled: bool) {
        let mut slot = self.slot.write().await;
        let Some(handle) = slot.handle.as_mut() else {
            return;
        };
        handle.auto_reconnect = enabled;
        let state = handle.state;
        if !enabled {
            slot.suspended = false;
            slot.reconnect_pending = false;
            if state == ConnectionState::Disconnected {
                slot.outcomes = None;
            }
        }
        self.publish(&slot);
    }

    /// Issue a new attempt for a dropped auto-reconnect link
    ///
    /// Only a link that was connected when it dropped qualifies. Returns
    /// whether an attempt was issued. While the radio is off the link is
    /// parked until [`resume`](Self::resume).
    pub(crate) async fn reconnect(&self) -> CentralResult<bool> {
        let mut slot = self.slot.write().await;
        let (id, state, auto_reconnect) = match slot.handle.as_ref() {
            Some(h) => (h.id.clone(), h.state, h.auto_reconnect),
            None => return Ok(false),
        };
        if state != ConnectionState::Disconnected || !auto_reconnect || !slot.reconnect_pending {
            return Ok(false);
        }
        if !self.adapter.is_powered_on() {
            slot.suspended = true;
            debug!("Reconnect to {} deferred until adapter powers on", id);
            return Ok(false);
        }

        if let Some(handle) = slot.handle.as_mut() {
            handle.state = ConnectionState::Connecting;
        }
        slot.suspended = false;
        slot.reconnect_pending = false;
        self.publish(&slot);

        if let Err(e) = self.transport.connect(&id).await {
            warn!("Failed to issue reconnect to {}: {}", id, e);
            if let Some(handle) = slot.handle.as_mut() {
                handle.state = ConnectionState::Disconnected;
            }
            slot.report(false);
            slot.outcomes = None;
            self.publish(&slot);
            return Err(e.into());
        }

        info!("Reconnecting to {}", id);
        Ok(true)
    }

    /// Adapter powered on again; reconnect a link parked by power loss
    pub(crate) async fn resume(&self) -> CentralResult<bool> {
        if !self.slot.read().await.suspended {
            return Ok(false);
        }
        self.reconnect().await
    }

    pub(crate) async fn on_connected(&self, id: &PeripheralId) -> ConnectReport {
        let mut slot = self.slot.write().await;
        let state = match slot.tracks(id) {
            Some(handle) => handle.state,
            None => return ConnectReport::Stale,
        };

        match state {
            ConnectionState::Connecting => {
                if let Some(handle) = slot.handle.as_mut() {
                    handle.state = ConnectionState::Connected;
                }
                slot.report(true);
                self.publish(&slot);
                info!("Connected to {}", id);
                ConnectReport::Accepted
            }
            ConnectionState::Connected => ConnectReport::Duplicate,
            ConnectionState::Disconnected => ConnectReport::Stale,
        }
    }

    /// A pending attempt failed; reported once, never retried
    pub(crate) async fn on_connect_failed(&self, id: &PeripheralId, error: &str) -> bool {
        let mut slot = self.slot.write().await;
        if slot.tracks(id).map(|h| h.state) != Some(ConnectionState::Connecting) {
            debug!("Ignoring stale connect failure for {}", id);
            return false;
        }
        warn!("Failed to connect to {}: {}", id, error);
        slot.drop_link();
        self.publish(&slot);
        true
    }

    /// The transport reported the link gone
    pub(crate) async fn on_disconnected(&self, id: &PeripheralId) -> Option<LinkDrop> {
        let mut slot = self.slot.write().await;
        if slot.tracks(id).is_none() {
            debug!("Ignoring disconnect of untracked {}", id);
            return None;
        }
        let dropped = slot.drop_link()?;
        self.publish(&slot);
        info!(reconnect = dropped.reconnect, "Link to {} lost", id);
        Some(dropped)
    }

    /// The radio left the powered-on state; the link is gone without a
    /// transport report
    pub(crate) async fn on_power_lost(&self) -> Option<LinkDrop> {
        let mut slot = self.slot.write().await;
        let dropped = slot.drop_link()?;
        slot.suspended = dropped.reconnect;
        self.publish(&slot);
        info!("Link to {} lost with adapter power", dropped.peripheral);
        Some(LinkDrop {
            reconnect: false,
            ..dropped
        })
    }

    pub async fn state(&self) -> ConnectionState {
        self.slot
            .read()
            .await
            .handle
            .as_ref()
            .map(|h| h.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Snapshot of the tracked peripheral
    pub fn peripheral(&self) -> Option<PeripheralHandle> {
        self.feed.borrow().clone()
    }

    /// Receive the tracked peripheral after every change
    pub fn subscribe(&self) -> watch::Receiver<Option<PeripheralHandle>> {
        self.feed.subscribe()
    }
}

/// Non-owning reference to the connected peripheral
///
/// Cannot connect or disconnect; only reads the link and records discovery
/// results on the handle.
#[derive(Debug, Clone)]
pub struct LinkView {
    slot: Weak<RwLock<LinkSlot>>,
    feed: Weak<watch::Sender<Option<PeripheralHandle>>>,
}

impl LinkView {
    /// Identifier of the peripheral, if it is in the connected state
    pub async fn connected_peripheral(&self) -> CentralResult<PeripheralId> {
        let slot = self.slot.upgrade().ok_or(CentralError::NotConnected)?;
        let slot = slot.read().await;
        slot.handle
            .as_ref()
            .filter(|h| h.is_connected())
            .map(|h| h.id.clone())
            .ok_or(CentralError::NotConnected)
    }

    /// Inspect the connected handle
    pub async fn read<R>(&self, f: impl FnOnce(&PeripheralHandle) -> R) -> CentralResult<R> {
        let slot = self.slot.upgrade().ok_or(CentralError::NotConnected)?;
        let slot = slot.read().await;
        slot.handle
            .as_ref()
            .filter(|h| h.is_connected())
            .map(f)
            .ok_or(CentralError::NotConnected)
    }

    /// Mutate the handle of `id` if it is still the connected peripheral
    pub(crate) async fn update<R>(
        &self,
        id: &PeripheralId,
        f: impl FnOnce(&mut PeripheralHandle) -> R,
    ) -> Option<R> {
        let slot = self.slot.upgrade()?;
        let mut slot = slot.write().await;
        let handle = slot
            .handle
            .as_mut()
            .filter(|h| h.is_connected() && h.id == *id)?;
        let result = f(handle);
        if let Some(feed) = self.feed.upgrade() {
            feed.send_replace(slot.handle.clone());
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockTransport, mock_transport::TransportCommand};
    use crate::core::types::{PowerState, ServiceId};
    use futures::{FutureExt, StreamExt};
    use uuid::Uuid;

    fn supervisor() -> (
        Arc<MockTransport>,
        Arc<AdapterState>,
        LinkSupervisor<MockTransport>,
    ) {
        let transport = Arc::new(MockTransport::new());
        let adapter = Arc::new(AdapterState::new());
        adapter.apply(PowerState::PoweredOn);
        (
            transport.clone(),
            adapter.clone(),
            LinkSupervisor::new(transport, adapter),
        )
    }

    #[tokio::test]
    async fn test_connect_requires_powered_adapter() {
        let (_transport, adapter, link) = supervisor();
        adapter.apply(PowerState::PoweredOff);

        let result = link.connect("D1".into(), None, false).await;
        assert!(matches!(
            result,
            Err(CentralError::NotReady(PowerState::PoweredOff))
        ));
    }

    #[tokio::test]
    async fn test_connect_state_machine() {
        let (_transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, dropped) = link.connect(id.clone(), None, false).await.unwrap();
        assert!(dropped.is_none());
        assert_eq!(link.state().await, ConnectionState::Connecting);
        assert_eq!(link.peripheral().unwrap().name, "Unknown");

        assert_eq!(link.on_connected(&id).await, ConnectReport::Accepted);
        assert_eq!(link.state().await, ConnectionState::Connected);
        assert_eq!(outcomes.next_outcome().await, Some(true));

        assert_eq!(link.on_connected(&id).await, ConnectReport::Duplicate);

        let dropped = link.on_disconnected(&id).await.unwrap();
        assert!(!dropped.reconnect);
        assert_eq!(link.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_duplicate_connect_single_attempt() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, _) = link.connect(id.clone(), None, false).await.unwrap();
        assert!(matches!(
            link.connect(id.clone(), None, false).await,
            Err(CentralError::AlreadyInProgress)
        ));
        assert_eq!(
            transport
                .count(|c| matches!(c, TransportCommand::Connect(_)))
                .await,
            1
        );

        link.on_connected(&id).await;
        assert_eq!(outcomes.next_outcome().await, Some(true));
        assert_eq!(outcomes.next_outcome().now_or_never(), None);
    }

    #[tokio::test]
    async fn test_connect_other_cancels_pending_attempt() {
        let (transport, _adapter, link) = supervisor();

        let (mut first, _) = link.connect("D1".into(), None, false).await.unwrap();
        let (_second, dropped) = link.connect("D2".into(), None, false).await.unwrap();
        assert!(dropped.is_none());
        assert_eq!(first.next_outcome().await, Some(false));

        assert_eq!(
            transport.commands().await,
            vec![
                TransportCommand::Connect("D1".into()),
                TransportCommand::CancelConnect("D1".into()),
                TransportCommand::Connect("D2".into()),
            ]
        );

        // Late answer for the cancelled attempt is stale
        assert_eq!(link.on_connected(&"D1".into()).await, ConnectReport::Stale);
        assert!(!link.on_connect_failed(&"D1".into(), "late").await);
        assert_eq!(link.peripheral().unwrap().id, PeripheralId::from("D2"));
    }

    #[tokio::test]
    async fn test_connect_other_drops_live_link() {
        let (transport, _adapter, link) = supervisor();

        link.connect("D1".into(), None, true).await.unwrap();
        link.on_connected(&"D1".into()).await;

        let (_outcomes, dropped) = link.connect("D2".into(), None, false).await.unwrap();
        assert_eq!(
            dropped,
            Some(LinkDrop {
                peripheral: "D1".into(),
                reconnect: false
            })
        );
        assert!(
            transport
                .commands()
                .await
                .contains(&TransportCommand::Disconnect("D1".into()))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reports_false_without_retry() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, _) = link.connect(id.clone(), None, true).await.unwrap();
        assert!(link.on_connect_failed(&id, "timeout").await);
        assert_eq!(outcomes.next_outcome().await, Some(false));
        assert_eq!(link.state().await, ConnectionState::Disconnected);

        // No further attempt is issued
        assert!(!link.reconnect().await.unwrap());
        assert_eq!(
            transport
                .count(|c| matches!(c, TransportCommand::Connect(_)))
                .await,
            1
        );
        assert_eq!(outcomes.next_outcome().await, None);
    }

    #[tokio::test]
    async fn test_failed_reconnect_attempt_is_not_retried() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (outcomes, _) = link.connect(id.clone(), None, true).await.unwrap();
        link.on_connected(&id).await;
        link.on_disconnected(&id).await;
        assert!(link.reconnect().await.unwrap());

        // A second call for the same drop issues nothing
        assert!(!link.reconnect().await.unwrap());

        assert!(link.on_connect_failed(&id, "page timeout").await);
        assert!(!link.reconnect().await.unwrap());
        assert_eq!(
            transport
                .count(|c| matches!(c, TransportCommand::Connect(_)))
                .await,
            2
        );

        let reported: Vec<bool> = outcomes.collect().await;
        assert_eq!(reported, vec![true, false]);
    }

    #[tokio::test]
    async fn test_connect_issue_failure() {
        let (transport, _adapter, link) = supervisor();
        transport.set_connect_failure(true).await;

        assert!(matches!(
            link.connect("D1".into(), None, false).await,
            Err(CentralError::Transport(_))
        ));
        assert_eq!(link.state().await, ConnectionState::Disconnected);

        // Not stuck in connecting
        transport.set_connect_failure(false).await;
        assert!(link.connect("D1".into(), None, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_unsolicited_disconnect() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, _) = link.connect(id.clone(), None, true).await.unwrap();
        link.on_connected(&id).await;
        assert_eq!(outcomes.next_outcome().await, Some(true));

        let dropped = link.on_disconnected(&id).await.unwrap();
        assert!(dropped.reconnect);
        assert!(link.reconnect().await.unwrap());
        assert_eq!(link.state().await, ConnectionState::Connecting);

        // Same completion handler receives the reconnect outcome
        link.on_connected(&id).await;
        assert_eq!(outcomes.next_outcome().await, Some(true));
        assert_eq!(
            transport
                .count(|c| matches!(c, TransportCommand::Connect(_)))
                .await,
            2
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_auto_reconnect_ends_loop() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        link.connect(id.clone(), None, true).await.unwrap();
        link.on_connected(&id).await;

        let dropped = link.disconnect(false).await.unwrap();
        assert!(!dropped.reconnect);
        assert!(!link.reconnect().await.unwrap());
        assert!(!link.peripheral().unwrap().auto_reconnect);

        // Transport's own report afterwards is ignored
        assert!(link.on_disconnected(&id).await.is_none());
        assert!(
            transport
                .commands()
                .await
                .contains(&TransportCommand::Disconnect(id))
        );
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_cancels() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, _) = link.connect(id.clone(), None, false).await.unwrap();
        link.disconnect(false).await;

        assert_eq!(outcomes.next_outcome().await, Some(false));
        assert!(
            transport
                .commands()
                .await
                .contains(&TransportCommand::CancelConnect(id))
        );
    }

    #[tokio::test]
    async fn test_refused_cancel_still_releases_attempt() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");
        transport.set_disconnect_failure(true).await;

        let (mut outcomes, _) = link.connect(id.clone(), None, false).await.unwrap();
        let dropped = link.disconnect(false).await.unwrap();
        assert!(!dropped.reconnect);
        assert_eq!(link.state().await, ConnectionState::Disconnected);
        assert_eq!(outcomes.next_outcome().await, Some(false));
        assert_eq!(outcomes.next_outcome().await, None);

        // Peripheral can be connected again
        transport.set_disconnect_failure(false).await;
        let (mut outcomes, _) = link.connect(id.clone(), None, false).await.unwrap();
        link.on_connected(&id).await;
        assert_eq!(outcomes.next_outcome().await, Some(true));
    }

    #[tokio::test]
    async fn test_refused_disconnect_still_drops_link() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        link.connect(id.clone(), None, true).await.unwrap();
        link.on_connected(&id).await;
        transport.set_disconnect_failure(true).await;

        assert!(link.disconnect(false).await.is_some());
        assert_eq!(link.state().await, ConnectionState::Disconnected);
        assert!(
            transport
                .commands()
                .await
                .contains(&TransportCommand::Disconnect(id))
        );
    }

    #[tokio::test]
    async fn test_outcomes_end_after_requested_disconnect() {
        let (_transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, _) = link.connect(id.clone(), None, true).await.unwrap();
        link.on_connected(&id).await;
        link.disconnect(false).await;

        assert_eq!(outcomes.next_outcome().await, Some(true));
        assert_eq!(outcomes.next_outcome().await, None);
    }

    #[tokio::test]
    async fn test_clearing_auto_reconnect_cancels_pending_reconnect() {
        let (transport, _adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, _) = link.connect(id.clone(), None, true).await.unwrap();
        link.on_connected(&id).await;
        assert!(link.on_disconnected(&id).await.unwrap().reconnect);

        link.set_auto_reconnect(false).await;
        assert!(!link.reconnect().await.unwrap());
        assert_eq!(
            transport
                .count(|c| matches!(c, TransportCommand::Connect(_)))
                .await,
            1
        );
        assert_eq!(outcomes.next_outcome().await, Some(true));
        assert_eq!(outcomes.next_outcome().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_idle_is_noop() {
        let (transport, _adapter, link) = supervisor();
        assert!(link.disconnect(false).await.is_none());
        assert!(transport.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_power_loss_suspends_and_resumes() {
        let (transport, adapter, link) = supervisor();
        let id = PeripheralId::from("D1");

        let (mut outcomes, _) = link.connect(id.clone(), None, true).await.unwrap();
        link.on_connected(&id).await;
        outcomes.next_outcome().await;

        adapter.apply(PowerState::PoweredOff);
        let dropped = link.on_power_lost().await.unwrap();
        assert!(!dropped.reconnect);
        assert_eq!(link.state().await, ConnectionState::Disconnected);
        assert!(!link.resume().await.unwrap());

        adapter.apply(PowerState::PoweredOn);
        assert!(link.resume().await.unwrap());
        assert_eq!(link.state().await, ConnectionState::Connecting);
        assert_eq!(
            transport
                .count(|c| matches!(c, TransportCommand::Connect(_)))
                .await,
            2
        );
    }

    #[tokio::test]
    async fn test_view_only_sees_connected_handle() {
        let (_transport, _adapter, link) = supervisor();
        let view = link.view();
        let id = PeripheralId::from("D1");

        assert_eq!(
            view.connected_peripheral().await,
            Err(CentralError::NotConnected)
        );

        link.connect(id.clone(), Some("Thermo".into()), false)
            .await
            .unwrap();
        assert_eq!(
            view.connected_peripheral().await,
            Err(CentralError::NotConnected)
        );

        link.on_connected(&id).await;
        assert_eq!(view.connected_peripheral().await, Ok(id.clone()));

        let service = ServiceId {
            uuid: Uuid::from_u128(1),
            handle: 1,
        };
        assert_eq!(view.update(&id, |h| h.record_services(&[service])).await, Some(()));
        assert_eq!(link.peripheral().unwrap().services.len(), 1);

        // Dropping the link forgets the service tree
        link.on_disconnected(&id).await;
        assert!(link.peripheral().unwrap().services.is_empty());
        assert!(view.update(&id, |_| ()).await.is_none());
    }

    #[tokio::test]
    async fn test_view_outlived_by_supervisor() {
        let (_transport, _adapter, link) = supervisor();
        let view = link.view();
        drop(link);

        assert_eq!(
            view.connected_peripheral().await,
            Err(CentralError::NotConnected)
        );
    }
}
