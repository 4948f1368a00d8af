//! # Peer Status Manager
//!
//! Tracks the last [`StatusMessage`] each connected peer sent us. The table
//! is owned by a single [`PeerManager`] task; everyone else talks to it
//! through a cloneable [`PeerHandle`]. Commands are processed one at a time,
//! so no lock is ever shared across tasks.
//!
//! A peer is only recorded if its status is compatible with ours (same
//! protocol version, same minimum supported version, same genesis).

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::message::{PeerId, StatusMessage};
use crate::config::PEER_COMMAND_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer manager has shut down")]
    Closed,
}

/// Whether a remote status lets us talk to that peer at all.
pub fn is_compatible(local: &StatusMessage, remote: &StatusMessage) -> bool {
    local.protocol_version == remote.protocol_version
        && local.min_supported_version == remote.min_supported_version
        && local.genesis_hash == remote.genesis_hash
}

#[derive(Debug)]
pub enum PeerCommand {
    /// Record `status` for `peer`. Replies with whether it was accepted.
    SetStatus {
        peer: PeerId,
        status: StatusMessage,
        reply: oneshot::Sender<bool>,
    },
    GetStatus {
        peer: PeerId,
        reply: oneshot::Sender<Option<StatusMessage>>,
    },
    Remove {
        peer: PeerId,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    /// Every known peer, ordered by peer id.
    List {
        reply: oneshot::Sender<Vec<(PeerId, StatusMessage)>>,
    },
}

/// Task that owns the peer status table.
pub struct PeerManager {
    local: StatusMessage,
    peers: HashMap<PeerId, StatusMessage>,
    commands: mpsc::Receiver<PeerCommand>,
}

impl PeerManager {
    /// Create the manager and a handle to it. Call [`run`](Self::run) on a
    /// task to start serving commands.
    pub fn new(local: StatusMessage) -> (Self, PeerHandle) {
        let (tx, rx) = mpsc::channel(PEER_COMMAND_CAPACITY);
        let manager = Self {
            local,
            peers: HashMap::new(),
            commands: rx,
        };
        (manager, PeerHandle { tx })
    }

    /// Serve commands until every handle is dropped.
    pub async fn run(mut self) {
        debug!("peer manager started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        debug!(peers = self.peers.len(), "peer manager stopped");
    }

    fn handle(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::SetStatus {
                peer,
                status,
                reply,
            } => {
                let accepted = is_compatible(&self.local, &status);
                if accepted {
                    info!(
                        peer = %peer,
                        best = status.best_block_number,
                        "peer status updated"
                    );
                    self.peers.insert(peer, status);
                } else {
                    warn!(
                        peer = %peer,
                        version = status.protocol_version,
                        genesis = %status.genesis_hash,
                        "incompatible peer status"
                    );
                    self.peers.remove(&peer);
                }
                let _ = reply.send(accepted);
            }
            PeerCommand::GetStatus { peer, reply } => {
                let _ = reply.send(self.peers.get(&peer).cloned());
            }
            PeerCommand::Remove { peer } => {
                if self.peers.remove(&peer).is_some() {
                    debug!(peer = %peer, "peer removed");
                }
            }
            PeerCommand::Count { reply } => {
                let _ = reply.send(self.peers.len());
            }
            PeerCommand::List { reply } => {
                let mut all: Vec<_> = self
                    .peers
                    .iter()
                    .map(|(id, status)| (id.clone(), status.clone()))
                    .collect();
                all.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(all);
            }
        }
    }
}

/// Cloneable client for the [`PeerManager`] task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<PeerCommand>,
}

impl PeerHandle {
    pub async fn set_status(&self, peer: PeerId, status: StatusMessage) -> Result<bool, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(PeerCommand::SetStatus {
            peer,
            status,
            reply,
        })
        .await?;
        rx.await.map_err(|_| PeerError::Closed)
    }

    pub async fn get_status(&self, peer: &str) -> Result<Option<StatusMessage>, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(PeerCommand::GetStatus {
            peer: peer.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| PeerError::Closed)
    }

    pub async fn remove(&self, peer: &str) -> Result<(), PeerError> {
        self.send(PeerCommand::Remove {
            peer: peer.to_string(),
        })
        .await
    }

    pub async fn count(&self) -> Result<usize, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(PeerCommand::Count { reply }).await?;
        rx.await.map_err(|_| PeerError::Closed)
    }

    pub async fn list(&self) -> Result<Vec<(PeerId, StatusMessage)>, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(PeerCommand::List { reply }).await?;
        rx.await.map_err(|_| PeerError::Closed)
    }

    async fn send(&self, command: PeerCommand) -> Result<(), PeerError> {
        self.tx.send(command).await.map_err(|_| PeerError::Closed)
    }
}
