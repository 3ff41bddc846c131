//! In-process transport.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryNetwork`] can
//! reach the others by peer id. Links open immediately unless the network is
//! told to hold back open notifications, which leaves readiness to be found
//! by polling.

use crate::transport::{
    ConnectionId, ConnectionTransport, IceState, TransportError, TransportEvent, TransportFactory,
};
use pokechess_core::PeerIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

type Endpoint = (PeerIdentity, ConnectionId);

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerIdentity, mpsc::UnboundedSender<TransportEvent>>,
    /// Each open link appears twice, once per direction.
    links: HashMap<Endpoint, Endpoint>,
    next_conn: u64,
    suppress_open_events: bool,
}

impl NetworkState {
    fn deliver(&self, peer: &PeerIdentity, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(peer) {
            let _ = tx.send(event);
        }
    }

    fn allocate(&mut self) -> ConnectionId {
        self.next_conn += 1;
        ConnectionId(self.next_conn)
    }

    fn unlink(&mut self, end: &Endpoint) -> Option<Endpoint> {
        let remote = self.links.remove(end)?;
        self.links.remove(&remote);
        Some(remote)
    }
}

/// Shared switchboard for in-memory transports.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint under `id`.
    pub fn endpoint(&self, id: PeerIdentity) -> Result<MemoryTransport, TransportError> {
        let mut state = self.lock();
        if state.endpoints.contains_key(&id) {
            return Err(TransportError::IdTaken(id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Ready { id: id.clone() });
        state.endpoints.insert(id.clone(), tx);
        debug!(%id, "memory endpoint registered");
        Ok(MemoryTransport {
            network: self.clone(),
            id,
            events: rx,
            shut_down: false,
        })
    }

    /// When set, links still open but nobody hears about it.
    pub fn suppress_open_events(&self, suppress: bool) {
        self.lock().suppress_open_events = suppress;
    }

    pub fn is_registered(&self, id: &PeerIdentity) -> bool {
        self.lock().endpoints.contains_key(id)
    }

    /// Number of live links touching `id`.
    pub fn open_links(&self, id: &PeerIdentity) -> usize {
        self.lock().links.keys().filter(|(peer, _)| peer == id).count()
    }

    /// Drop every link of `id` as if its network went away. The remote
    /// sides see an ICE failure; `id` itself hears nothing.
    pub fn sever(&self, id: &PeerIdentity) {
        let mut state = self.lock();
        let ends: Vec<Endpoint> = state.links.keys().filter(|(peer, _)| peer == id).cloned().collect();
        for end in ends {
            if let Some((remote, remote_conn)) = state.unlink(&end) {
                state.deliver(
                    &remote,
                    TransportEvent::Ice {
                        conn: remote_conn,
                        state: IceState::Failed,
                    },
                );
            }
        }
    }

    /// Sever `id` and unregister it.
    pub fn vanish(&self, id: &PeerIdentity) {
        self.sever(id);
        self.lock().endpoints.remove(id);
        debug!(%id, "memory endpoint vanished");
    }

    fn release(&self, id: &PeerIdentity) {
        let mut state = self.lock();
        let ends: Vec<Endpoint> = state.links.keys().filter(|(peer, _)| peer == id).cloned().collect();
        for end in ends {
            if let Some((remote, remote_conn)) = state.unlink(&end) {
                state.deliver(&remote, TransportEvent::Close { conn: remote_conn });
            }
        }
        state.endpoints.remove(id);
    }
}

impl TransportFactory for MemoryNetwork {
    type Transport = MemoryTransport;

    fn create(&mut self, id: PeerIdentity) -> Result<MemoryTransport, TransportError> {
        self.endpoint(id)
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    id: PeerIdentity,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shut_down: bool,
}

impl ConnectionTransport for MemoryTransport {
    fn local_id(&self) -> &PeerIdentity {
        &self.id
    }

    fn open(&mut self, target: &PeerIdentity) -> Result<ConnectionId, TransportError> {
        if self.shut_down {
            return Err(TransportError::Shutdown);
        }
        let mut state = self.network.lock();
        let conn = state.allocate();
        if !state.endpoints.contains_key(target) {
            // Resolution failures arrive asynchronously, as with a real relay.
            state.deliver(
                &self.id,
                TransportEvent::Error {
                    conn: Some(conn),
                    error: TransportError::PeerUnreachable(target.clone()),
                },
            );
            return Ok(conn);
        }
        let remote_conn = state.allocate();
        let local = (self.id.clone(), conn);
        let remote = (target.clone(), remote_conn);
        state.links.insert(local.clone(), remote.clone());
        state.links.insert(remote, local);
        state.deliver(
            target,
            TransportEvent::Incoming {
                conn: remote_conn,
                peer: self.id.clone(),
            },
        );
        if !state.suppress_open_events {
            state.deliver(&self.id, TransportEvent::Open { conn });
            state.deliver(target, TransportEvent::Open { conn: remote_conn });
        }
        Ok(conn)
    }

    fn send(&mut self, conn: ConnectionId, frame: &str) -> Result<(), TransportError> {
        let state = self.network.lock();
        let Some((remote, remote_conn)) = state.links.get(&(self.id.clone(), conn)) else {
            return Err(TransportError::NotOpen);
        };
        state.deliver(
            remote,
            TransportEvent::Data {
                conn: *remote_conn,
                frame: frame.to_string(),
            },
        );
        Ok(())
    }

    fn is_open(&self, conn: ConnectionId) -> bool {
        self.network.lock().links.contains_key(&(self.id.clone(), conn))
    }

    fn close(&mut self, conn: ConnectionId) {
        let mut state = self.network.lock();
        if let Some((remote, remote_conn)) = state.unlink(&(self.id.clone(), conn)) {
            state.deliver(&remote, TransportEvent::Close { conn: remote_conn });
        }
    }

    fn shutdown(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            self.network.release(&self.id);
            self.events.close();
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
