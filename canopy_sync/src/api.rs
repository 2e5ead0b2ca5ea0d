use std::{collections::HashMap, ops::ControlFlow, sync::Arc, time::Duration};

use canopy_auth::RolesEvent;
use canopy_core::{
    DATA_NAMESPACES, DeviceId, DiscoveryKey, Namespace, PRESYNC_NAMESPACES, PeerId,
    ReplicationSession,
};
use canopy_cores::{CoreManager, CoreManagerEvent};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, oneshot, watch,
    },
    time::{Instant, sleep_until},
};
use tracing::{debug, warn};

use crate::{
    capability::SyncCapabilities,
    controller::{PeerSyncController, SyncEnabledState, sync_enabled_state},
    sync_state::{NamespaceStates, SyncState},
};

/// Minimum delay between two recomputations of the sync state.
pub const DEFAULT_STATE_THROTTLE: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub throttle: Duration,
    /// Stop data sync after being fully synced for this long.
    pub autostop_data_sync_after: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_STATE_THROTTLE,
            autostop_data_sync_after: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncType {
    /// The presync namespaces.
    Initial,
    /// Every namespace.
    Full,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncTypeState {
    pub is_enabled: bool,
    pub is_synced: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteTypeState {
    pub is_enabled: bool,
    /// Blocks we have that the peer wants.
    pub want: u64,
    /// Blocks the peer has that we want.
    pub wanted: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteSyncState {
    pub initial: RemoteTypeState,
    pub data: RemoteTypeState,
}

/// Published after every recomputation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncApiState {
    pub enabled_state: SyncEnabledState,
    pub initial: SyncTypeState,
    pub data: SyncTypeState,
    pub remote: HashMap<DeviceId, RemoteSyncState>,
    pub namespaces: NamespaceStates,
}

impl SyncApiState {
    pub fn is_synced(&self, sync_type: SyncType) -> bool {
        match sync_type {
            SyncType::Initial => self.initial.is_synced,
            SyncType::Full => self.initial.is_synced && self.data.is_synced,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("sync actor has stopped")]
    Closed,
}

#[derive(Debug)]
enum SyncMessage {
    Start {
        responder: oneshot::Sender<()>,
    },
    Stop {
        responder: oneshot::Sender<()>,
    },
    AddPeer {
        session: Arc<dyn ReplicationSession>,
        responder: oneshot::Sender<()>,
    },
    RemovePeer {
        peer: PeerId,
        responder: oneshot::Sender<()>,
    },
    DiscoveryKey {
        peer: PeerId,
        discovery_key: DiscoveryKey,
        responder: oneshot::Sender<()>,
    },
    SetAutostop {
        after: Option<Duration>,
        responder: oneshot::Sender<()>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct Autostop {
    deadline: Instant,
    /// Local block count when the timer was armed.
    have: u64,
}

struct SyncActor {
    core_manager: CoreManager,
    capabilities: Arc<dyn SyncCapabilities>,
    config: SyncConfig,
    receiver: mpsc::Receiver<SyncMessage>,
    events: broadcast::Receiver<CoreManagerEvent>,
    capability_updates: Option<broadcast::Receiver<RolesEvent>>,
    sync_state: SyncState,
    controllers: HashMap<PeerId, PeerSyncController>,
    wants_data: bool,
    full_stop: bool,
    next_update: Option<Instant>,
    autostop: Option<Autostop>,
    state: watch::Sender<SyncApiState>,
}

impl SyncActor {
    async fn run(&mut self) {
        self.update().await;
        loop {
            let update_at = self.next_update;
            let autostop_at = self.autostop.as_ref().map(|a| a.deadline);
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(msg) => {
                        if self.handle_message(msg).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                event = self.events.recv() => match event {
                    Ok(event) => {
                        if self.sync_state.handle_event(&event) {
                            self.schedule_update();
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("sync state missed {n} core events, rebuilding");
                        self.rebuild();
                        self.schedule_update();
                    }
                    Err(RecvError::Closed) => break,
                },
                update = recv_update(&mut self.capability_updates) => match update {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        self.refresh_capabilities().await;
                        self.schedule_update();
                    }
                    Err(RecvError::Closed) => self.capability_updates = None,
                },
                _ = sleep_until(update_at.unwrap_or_else(Instant::now)), if update_at.is_some() => {
                    self.next_update = None;
                    self.update().await;
                }
                _ = sleep_until(autostop_at.unwrap_or_else(Instant::now)), if autostop_at.is_some() => {
                    debug!("data sync idle, stopping");
                    self.autostop = None;
                    self.wants_data = false;
                    self.update().await;
                }
            }
        }
        debug!("sync actor stopped");
    }

    async fn handle_message(&mut self, msg: SyncMessage) -> ControlFlow<()> {
        match msg {
            SyncMessage::Start { responder } => {
                self.wants_data = true;
                self.full_stop = false;
                self.update().await;
                let _ = responder.send(());
            }
            SyncMessage::Stop { responder } => {
                self.wants_data = false;
                self.full_stop = true;
                self.update().await;
                let _ = responder.send(());
            }
            SyncMessage::AddPeer { session, responder } => {
                let peer = session.peer_id();
                self.core_manager.add_peer(session).await;
                let mut controller = PeerSyncController::new(peer, self.core_manager.clone());
                controller.set_sync_capability(
                    self.capabilities
                        .sync_capability(&controller.device_id())
                        .await,
                );
                self.controllers.insert(peer, controller);
                self.update().await;
                let _ = responder.send(());
            }
            SyncMessage::RemovePeer { peer, responder } => {
                self.core_manager.remove_peer(&peer).await;
                self.controllers.remove(&peer);
                self.sync_state.remove_peer(&peer);
                self.update().await;
                let _ = responder.send(());
            }
            SyncMessage::DiscoveryKey {
                peer,
                discovery_key,
                responder,
            } => {
                if self
                    .core_manager
                    .get_core_by_discovery_key(&discovery_key)
                    .is_none()
                    && let Err(e) = self
                        .core_manager
                        .request_core_key(&peer, discovery_key)
                        .await
                {
                    warn!(peer = %peer.fmt_short(), "failed to request core key: {e}");
                }
                let _ = responder.send(());
            }
            SyncMessage::SetAutostop { after, responder } => {
                self.config.autostop_data_sync_after = after;
                self.autostop = None;
                self.update().await;
                let _ = responder.send(());
            }
            SyncMessage::Shutdown { responder } => {
                let _ = responder.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn schedule_update(&mut self) {
        if self.next_update.is_none() {
            self.next_update = Some(Instant::now() + self.config.throttle);
        }
    }

    fn rebuild(&mut self) {
        for record in self.core_manager.all_cores() {
            self.sync_state.add_core(&record);
        }
        self.sync_state.invalidate();
    }

    async fn refresh_capabilities(&mut self) {
        for controller in self.controllers.values_mut() {
            let capability = self
                .capabilities
                .sync_capability(&controller.device_id())
                .await;
            controller.set_sync_capability(capability);
        }
    }

    /// Whether every peer is caught up on the namespaces it may sync.
    fn is_synced(&self, states: &NamespaceStates, namespaces: &[Namespace]) -> bool {
        self.controllers.values().all(|c| {
            namespaces
                .iter()
                .filter(|&&ns| c.may_sync(ns))
                .all(|&ns| states[ns].is_caught_up_with(&c.peer_id()))
        })
    }

    async fn update(&mut self) {
        let states = self.sync_state.state();
        let fully_synced = if self.wants_data {
            self.is_synced(&states, &Namespace::ALL)
        } else {
            self.is_synced(&states, &PRESYNC_NAMESPACES)
        };
        let enabled_state = sync_enabled_state(self.wants_data, self.full_stop, fully_synced);
        for controller in self.controllers.values_mut() {
            controller.update(&states, enabled_state).await;
        }
        self.update_autostop(fully_synced, &states);
        self.publish(enabled_state, states);
    }

    fn update_autostop(&mut self, fully_synced: bool, states: &NamespaceStates) {
        let armable = self.wants_data && !self.full_stop && fully_synced;
        let Some(after) = self.config.autostop_data_sync_after.filter(|_| armable) else {
            self.autostop = None;
            return;
        };
        let have: u64 = states.values().map(|s| s.local.have).sum();
        if self.autostop.as_ref().is_some_and(|a| a.have == have) {
            return;
        }
        debug!(?after, have, "arming data sync autostop");
        self.autostop = Some(Autostop {
            deadline: Instant::now() + after,
            have,
        });
    }

    fn publish(&mut self, enabled_state: SyncEnabledState, states: NamespaceStates) {
        let remote = self
            .controllers
            .values()
            .map(|c| {
                let summary = |namespaces: &[Namespace]| {
                    let mut out = RemoteTypeState::default();
                    for &ns in namespaces {
                        out.is_enabled |= c.is_enabled(ns);
                        if let Some(peer) = states[ns].remote.get(&c.peer_id()) {
                            out.want += peer.counts.want;
                            out.wanted += peer.counts.wanted;
                        }
                    }
                    out
                };
                (
                    c.device_id(),
                    RemoteSyncState {
                        initial: summary(&PRESYNC_NAMESPACES),
                        data: summary(&DATA_NAMESPACES),
                    },
                )
            })
            .collect();
        let state = SyncApiState {
            enabled_state,
            initial: SyncTypeState {
                is_enabled: enabled_state != SyncEnabledState::None,
                is_synced: self.is_synced(&states, &PRESYNC_NAMESPACES),
            },
            data: SyncTypeState {
                is_enabled: enabled_state == SyncEnabledState::All,
                is_synced: self.is_synced(&states, &DATA_NAMESPACES),
            },
            remote,
            namespaces: states,
        };
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

async fn recv_update(
    updates: &mut Option<broadcast::Receiver<RolesEvent>>,
) -> Result<RolesEvent, RecvError> {
    match updates {
        Some(updates) => updates.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle to the task that drives replication for every connected peer.
///
/// The sync state is recomputed at most once per
/// [`throttle`](SyncConfig::throttle) and published to [`subscribe`]rs.
///
/// [`subscribe`]: SyncApi::subscribe
#[derive(Clone, Debug)]
pub struct SyncApi {
    sender: mpsc::Sender<SyncMessage>,
    state: watch::Receiver<SyncApiState>,
}

impl SyncApi {
    pub fn spawn(
        core_manager: CoreManager,
        capabilities: Arc<dyn SyncCapabilities>,
        config: SyncConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(SyncApiState::default());
        // subscribe before listing cores, duplicates are ignored
        let events = core_manager.subscribe();
        let mut sync_state = SyncState::new();
        for record in core_manager.all_cores() {
            sync_state.add_core(&record);
        }
        let mut actor = SyncActor {
            capability_updates: Some(capabilities.updates()),
            core_manager,
            capabilities,
            config,
            receiver,
            events,
            sync_state,
            controllers: HashMap::new(),
            wants_data: false,
            full_stop: false,
            next_update: None,
            autostop: None,
            state: state_tx,
        };
        tokio::spawn(async move {
            actor.run().await;
        });
        Self { sender, state }
    }

    async fn request(
        &self,
        msg: impl FnOnce(oneshot::Sender<()>) -> SyncMessage,
    ) -> Result<(), SyncError> {
        let (responder, recv) = oneshot::channel();
        self.sender
            .send(msg(responder))
            .await
            .map_err(|_| SyncError::Closed)?;
        recv.await.map_err(|_| SyncError::Closed)
    }

    /// Syncs every namespace the peers allow.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.request(|responder| SyncMessage::Start { responder })
            .await
    }

    /// Stops data sync, and all sync once everything is synced.
    pub async fn stop(&self) -> Result<(), SyncError> {
        self.request(|responder| SyncMessage::Stop { responder })
            .await
    }

    pub async fn add_peer(&self, session: Arc<dyn ReplicationSession>) -> Result<(), SyncError> {
        self.request(|responder| SyncMessage::AddPeer { session, responder })
            .await
    }

    pub async fn remove_peer(&self, peer: PeerId) -> Result<(), SyncError> {
        self.request(|responder| SyncMessage::RemovePeer { peer, responder })
            .await
    }

    /// A peer opened a core we may not know yet; asks it for the key.
    pub async fn handle_discovery_key(
        &self,
        peer: PeerId,
        discovery_key: DiscoveryKey,
    ) -> Result<(), SyncError> {
        self.request(|responder| SyncMessage::DiscoveryKey {
            peer,
            discovery_key,
            responder,
        })
        .await
    }

    pub async fn set_autostop_data_sync_timeout(
        &self,
        after: Option<Duration>,
    ) -> Result<(), SyncError> {
        self.request(|responder| SyncMessage::SetAutostop { after, responder })
            .await
    }

    pub fn state(&self) -> SyncApiState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncApiState> {
        self.state.clone()
    }

    pub async fn wait_for_sync(&self, sync_type: SyncType) -> Result<(), SyncError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| s.is_synced(sync_type))
            .await
            .map_err(|_| SyncError::Closed)?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self
            .request(|responder| SyncMessage::Shutdown { responder })
            .await;
    }
}
