//! Local radio power state

use tokio::sync::watch;
use tracing::{info, warn};

use crate::core::types::PowerState;

/// Effect of a power state report on the rest of the central
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PowerTransition {
    /// Same state reported again
    Unchanged,
    /// Radio became usable
    PoweredOn,
    /// Radio was usable and no longer is; scans and links are gone
    LeftPoweredOn,
    /// Any other change between unusable states
    Changed,
}

/// Read-only view of the adapter power state with change notifications
#[derive(Debug)]
pub struct AdapterState {
    tx: watch::Sender<PowerState>,
}

impl AdapterState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PowerState::Unknown);
        Self { tx }
    }

    pub fn current_state(&self) -> PowerState {
        *self.tx.borrow()
    }

    pub fn is_powered_on(&self) -> bool {
        self.current_state().is_powered_on()
    }

    /// Receive every subsequent state change
    pub fn subscribe(&self) -> watch::Receiver<PowerState> {
        self.tx.subscribe()
    }

    /// Record a state reported by the transport
    pub(crate) fn apply(&self, state: PowerState) -> PowerTransition {
        let previous = self.tx.send_replace(state);
        if previous == state {
            return PowerTransition::Unchanged;
        }

        if previous.is_terminal() {
            warn!("Adapter left terminal state {} for {}", previous, state);
        } else {
            info!("Adapter state: {} -> {}", previous, state);
        }

        match (previous.is_powered_on(), state.is_powered_on()) {
            (false, true) => PowerTransition::PoweredOn,
            (true, false) => PowerTransition::LeftPoweredOn,
            _ => PowerTransition::Changed,
        }
    }
}

impl Default for AdapterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_unknown() {
        let adapter = AdapterState::new();
        assert_eq!(adapter.current_state(), PowerState::Unknown);
        assert!(!adapter.is_powered_on());
    }

    #[test]
    fn test_transitions() {
        let adapter = AdapterState::new();

        assert_eq!(
            adapter.apply(PowerState::PoweredOff),
            PowerTransition::Changed
        );
        assert_eq!(
            adapter.apply(PowerState::PoweredOn),
            PowerTransition::PoweredOn
        );
        assert_eq!(
            adapter.apply(PowerState::PoweredOn),
            PowerTransition::Unchanged
        );
        assert_eq!(
            adapter.apply(PowerState::Resetting),
            PowerTransition::LeftPoweredOn
        );
        assert_eq!(
            adapter.apply(PowerState::PoweredOn),
            PowerTransition::PoweredOn
        );
        assert!(adapter.is_powered_on());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let adapter = AdapterState::new();
        let mut rx = adapter.subscribe();

        adapter.apply(PowerState::PoweredOn);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), PowerState::PoweredOn);

        adapter.apply(PowerState::PoweredOff);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PowerState::PoweredOff);
    }
}
