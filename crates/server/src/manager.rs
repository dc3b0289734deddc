use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::WebSocket;
use rtpcast_protocol::close_code;
use uuid::Uuid;

use crate::channel::SignalChannel;
use crate::peer::{PeerHandle, RelayPeer};
use crate::web::AppState;

/// The live peer set, capped at `max_peers`. Holders of the mutex never
/// perform I/O; an entry exists only between the completion of a peer's
/// construction and the start of its destruction.
pub struct PeerRegistry {
    peers: Mutex<HashMap<Uuid, PeerHandle>>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            max_peers,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_peers
    }

    /// Insert unless the registry is at capacity.
    pub fn try_insert(&self, handle: PeerHandle) -> bool {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.len() >= self.max_peers {
            return false;
        }
        peers.insert(handle.id(), handle);
        true
    }

    pub fn remove(&self, id: Uuid) -> Option<PeerHandle> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Empty the registry, returning every handle. Used on shutdown.
    pub fn drain(&self) -> Vec<PeerHandle> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.drain().map(|(_, handle)| handle).collect()
    }
}

/// Drive one upgraded WebSocket: spin up the signal channel and the peer,
/// admit it into the registry, and watch for its termination.
pub async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (channel, inbound) = SignalChannel::spawn(socket, &state.config.channel);

    let peer = match RelayPeer::connect(
        Arc::clone(&channel),
        inbound,
        &state.streams,
        state.config.peer.polite,
        &state.config.ice,
    )
    .await
    {
        Ok(peer) => peer,
        Err(e) => {
            tracing::error!("failed to set up peer: {e:#}");
            channel.close(close_code::INTERNAL_ERROR, "failed to set up peer");
            return;
        }
    };

    if !state.registry.try_insert(peer.handle()) {
        // the capacity check at upgrade time raced with another admission
        tracing::warn!(id = %peer.id(), "registry filled during upgrade, evicting peer");
        peer.close(close_code::GOING_AWAY, "max connections reached");
        peer.teardown().await;
        return;
    }

    tracing::info!(
        id = %peer.id(),
        current = state.registry.len(),
        max = state.registry.max_peers(),
        "peer connected"
    );

    // Error watcher: remove the registry entry before tearing the peer down
    // so admission capacity frees up as soon as termination starts.
    tokio::spawn(async move {
        let close = peer.closed().await;
        state.registry.remove(peer.id());
        peer.teardown().await;
        tracing::info!(
            id = %peer.id(),
            code = close.code,
            reason = %close.reason,
            current = state.registry.len(),
            max = state.registry.max_peers(),
            "peer disconnected"
        );
    });
}
