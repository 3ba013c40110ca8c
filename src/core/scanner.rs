//! Peripheral discovery sweep with deduplicated sightings

use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::BleTransport,
    core::{
        adapter::AdapterState,
        error::{CentralError, CentralResult},
        types::{DiscoveredPeripheral, PeripheralId, PeripheralSighting},
    },
};

/// Parameters of one scan session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Only report peripherals advertising one of these services
    pub services: Vec<Uuid>,
    /// Ask the stack to report each device once instead of every advertisement
    pub dedupe: bool,
    /// Stop automatically this long after start
    pub timeout: Option<Duration>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            dedupe: true,
            timeout: None,
        }
    }
}

/// Scan state machine
///
/// Holds the sighting set of the active session; a session always starts blank.
#[derive(Debug, Default)]
struct ScanStateMachine {
    scanning: bool,
    generation: u64,
    sightings: Vec<DiscoveredPeripheral>,
    timer: Option<JoinHandle<()>>,
}

impl ScanStateMachine {
    /// Begin a new session, returning its generation
    fn start(&mut self) -> CentralResult<u64> {
        if self.scanning {
            return Err(CentralError::AlreadyInProgress);
        }
        self.scanning = true;
        self.generation += 1;
        self.sightings.clear();
        Ok(self.generation)
    }

    /// End the session; false if none was active
    fn stop(&mut self) -> bool {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if !self.scanning {
            return false;
        }
        self.scanning = false;
        self.sightings.clear();
        true
    }

    /// Upsert a sighting keyed by identifier
    fn record(&mut self, sighting: PeripheralSighting) -> bool {
        if !self.scanning {
            return false;
        }
        match self.sightings.iter_mut().find(|p| p.id == sighting.id) {
            Some(existing) => existing.update(sighting),
            None => {
                debug!("New peripheral sighted: {}", sighting.id);
                self.sightings
                    .push(DiscoveredPeripheral::from_sighting(sighting));
            }
        }
        true
    }
}

/// Discovery sweep service
///
/// Gated on the adapter being powered on; exposes the deduplicated sighting
/// set as a push feed.
pub struct ScanSession<T: BleTransport> {
    transport: Arc<T>,
    adapter: Arc<AdapterState>,
    state_machine: Arc<Mutex<ScanStateMachine>>,
    feed: Arc<watch::Sender<Vec<DiscoveredPeripheral>>>,
}

impl<T: BleTransport> ScanSession<T> {
    pub fn new(transport: Arc<T>, adapter: Arc<AdapterState>) -> Self {
        let (feed, _) = watch::channel(Vec::new());
        Self {
            transport,
            adapter,
            state_machine: Arc::new(Mutex::new(ScanStateMachine::default())),
            feed: Arc::new(feed),
        }
    }

    /// Start a scan session
    ///
    /// Fails with `NotReady` unless the adapter is powered on and with
    /// `AlreadyInProgress` while another session is active.
    pub async fn start(&self, options: ScanOptions) -> CentralResult<()> {
        let power = self.adapter.current_state();
        if !power.is_powered_on() {
            return Err(CentralError::NotReady(power));
        }

        let mut sm = self.state_machine.lock().await;
        let generation = sm.start()?;
        self.feed.send_replace(Vec::new());

        if let Err(e) = self
            .transport
            .start_scan(&options.services, !options.dedupe)
            .await
        {
            warn!("Failed to start scan: {}", e);
            sm.stop();
            return Err(e.into());
        }

        info!(
            services = options.services.len(),
            dedupe = options.dedupe,
            timeout = ?options.timeout,
            "Scan started"
        );

        if let Some(timeout) = options.timeout {
            sm.timer = Some(self.spawn_timer(generation, timeout));
        }
        Ok(())
    }

    fn spawn_timer(&self, generation: u64, timeout: Duration) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let state_machine = self.state_machine.clone();
        let feed = self.feed.clone();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut sm = state_machine.lock().await;
            if sm.generation != generation {
                return;
            }
            // Detach ourselves so stop() does not abort the running task
            sm.timer = None;
            if sm.stop() {
                info!("Scan timed out after {:?}", timeout);
                feed.send_replace(Vec::new());
                if let Err(e) = transport.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
        })
    }

    /// Stop the active session and clear the sighting set; no-op when idle
    pub async fn stop(&self) {
        let mut sm = self.state_machine.lock().await;
        if !sm.stop() {
            return;
        }
        self.feed.send_replace(Vec::new());
        info!("Scan stopped");
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    /// Drop the session without talking to the radio (it already went away)
    pub(crate) async fn abandon(&self) {
        if self.state_machine.lock().await.stop() {
            info!("Scan abandoned, adapter no longer powered on");
        }
        self.feed.send_replace(Vec::new());
    }

    /// Upsert a transport sighting; ignored outside a session
    pub(crate) async fn record_sighting(&self, sighting: PeripheralSighting) {
        let mut sm = self.state_machine.lock().await;
        let id = sighting.id.clone();
        if sm.record(sighting) {
            self.feed.send_replace(sm.sightings.clone());
        } else {
            debug!("Ignoring sighting of {} outside a scan session", id);
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.state_machine.lock().await.scanning
    }

    /// Snapshot of the deduplicated sighting set, in first-seen order
    pub fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.feed.borrow().clone()
    }

    pub fn find(&self, id: &PeripheralId) -> Option<DiscoveredPeripheral> {
        self.feed.borrow().iter().find(|p| p.id == *id).cloned()
    }

    /// Receive the sighting set after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredPeripheral>> {
        self.feed.subscribe()
    }
}
