//! Debounced have broadcasts for local writer cores.
//!
//! Every writer core gets one [`HaveActor`]. Appends are reported to it as
//! messages; once no append arrived for the debounce window it sends a
//! single have covering everything appended since the last broadcast to
//! every connected peer.

use std::{sync::Arc, time::Duration};

use canopy_core::{Core, ExtensionMessage, Namespace, wire::HaveExtension};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::manager::Sessions;

#[derive(Debug)]
pub(crate) enum HaveMessage {
    Appended { start: u64 },
    FlushTick { generation: u64 },
}

struct HaveActor {
    namespace: Namespace,
    core: Arc<dyn Core>,
    sessions: Sessions,
    receiver: mpsc::Receiver<HaveMessage>,
    sender: mpsc::WeakSender<HaveMessage>,
    debounce: Duration,
    /// Lowest block appended since the last broadcast.
    pending_start: Option<u64>,
    /// Bumped on every append; only the tick of the latest one flushes.
    generation: u64,
}

impl HaveActor {
    async fn run(&mut self, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.receiver.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                HaveMessage::Appended { start } => {
                    self.pending_start = Some(self.pending_start.map_or(start, |s| s.min(start)));
                    self.generation = self.generation.wrapping_add(1);
                    self.schedule_tick();
                }
                HaveMessage::FlushTick { generation } => {
                    if generation == self.generation {
                        self.flush().await;
                    }
                }
            }
        }
    }

    fn schedule_tick(&self) {
        let weak = self.sender.clone();
        let generation = self.generation;
        let delay = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = weak.upgrade() {
                let _ = sender.send(HaveMessage::FlushTick { generation }).await;
            }
        });
    }

    async fn flush(&mut self) {
        let Some(start) = self.pending_start.take() else {
            return;
        };
        let start = u32::try_from(start).unwrap_or(0);
        let have = HaveExtension::new(
            self.namespace,
            self.core.discovery_key(),
            start,
            &self.core.bitfield(),
        );
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        debug!(
            namespace = %self.namespace,
            start,
            peers = sessions.len(),
            "broadcasting have"
        );
        for session in sessions {
            let peer = session.peer_id();
            if let Err(e) = session.send(ExtensionMessage::Have(have.clone())).await {
                warn!(peer = %peer.fmt_short(), "failed to send have: {e:#}");
            }
        }
    }
}

/// Handle to a writer core's [`HaveActor`].
#[derive(Clone, Debug)]
pub(crate) struct HaveActorHandle {
    sender: mpsc::Sender<HaveMessage>,
}

impl HaveActorHandle {
    pub fn spawn(
        namespace: Namespace,
        core: Arc<dyn Core>,
        sessions: Sessions,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(256);
        let mut actor = HaveActor {
            namespace,
            core,
            sessions,
            receiver,
            sender: sender.downgrade(),
            debounce,
            pending_start: None,
            generation: 0,
        };
        tokio::spawn(async move {
            actor.run(cancel).await;
        });
        Self { sender }
    }

    pub async fn appended(&self, start: u64) {
        if self
            .sender
            .send(HaveMessage::Appended { start })
            .await
            .is_err()
        {
            debug!("have actor has been closed");
        }
    }
}
