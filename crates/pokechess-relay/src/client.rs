//! Peer endpoint that reaches other peers through a relay.
//!
//! [`RelayConnector::create`] returns immediately; the socket is opened by a
//! background task, which reports `Ready` once the id is claimed. Readiness
//! of individual connections is tracked locally so [`RelayTransport::is_open`]
//! never has to ask the relay.

use crate::protocol::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use pokechess_core::PeerIdentity;
use pokechess_session::{ConnectionId, ConnectionTransport, IceState, TransportError, TransportEvent, TransportFactory};
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

type OpenSet = Arc<Mutex<HashSet<ConnectionId>>>;

fn lock(open: &OpenSet) -> MutexGuard<'_, HashSet<ConnectionId>> {
    open.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates [`RelayTransport`]s against one relay URL.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    url: String,
}

impl RelayConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TransportFactory for RelayConnector {
    type Transport = RelayTransport;

    /// Must be called inside a tokio runtime.
    fn create(&mut self, id: PeerIdentity) -> Result<RelayTransport, TransportError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = OpenSet::default();
        let task = tokio::spawn(run_socket(
            self.url.clone(),
            id.clone(),
            out_rx,
            event_tx,
            open.clone(),
        ));
        Ok(RelayTransport {
            id,
            outbound: Some(out_tx),
            events: event_rx,
            open,
            next_conn: 0,
            task,
        })
    }
}

pub struct RelayTransport {
    id: PeerIdentity,
    /// `None` after shutdown.
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    open: OpenSet,
    next_conn: u64,
    task: JoinHandle<()>,
}

impl RelayTransport {
    fn push(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let Some(tx) = &self.outbound else {
            return Err(TransportError::Shutdown);
        };
        tx.send(frame)
            .map_err(|_| TransportError::Network("relay connection lost".to_string()))
    }
}

impl ConnectionTransport for RelayTransport {
    fn local_id(&self) -> &PeerIdentity {
        &self.id
    }

    fn open(&mut self, target: &PeerIdentity) -> Result<ConnectionId, TransportError> {
        self.next_conn += 1;
        let conn = self.next_conn;
        self.push(ClientFrame::Open {
            conn,
            target: target.clone(),
        })?;
        Ok(ConnectionId(conn))
    }

    fn send(&mut self, conn: ConnectionId, frame: &str) -> Result<(), TransportError> {
        if !self.is_open(conn) {
            return Err(TransportError::NotOpen);
        }
        self.push(ClientFrame::Data {
            conn: conn.0,
            payload: frame.to_string(),
        })
    }

    fn is_open(&self, conn: ConnectionId) -> bool {
        lock(&self.open).contains(&conn)
    }

    fn close(&mut self, conn: ConnectionId) {
        if lock(&self.open).remove(&conn) {
            let _ = self.push(ClientFrame::Close { conn: conn.0 });
        }
    }

    fn shutdown(&mut self) {
        if self.outbound.take().is_some() {
            debug!(id = %self.id, "shutting down");
        }
        lock(&self.open).clear();
        self.task.abort();
        self.events.close();
    }

    fn next_event(&mut self) -> impl Future<Output = Option<TransportEvent>> + Send {
        self.events.recv()
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_socket(
    url: String,
    id: PeerIdentity,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    open: OpenSet,
) {
    let (ws, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%url, error = %e, "cannot reach relay");
            let _ = events.send(network_error(e));
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let register = ClientFrame::Register { id };
    if let Err(e) = sink.send(Message::Text(register.encode().into())).await {
        let _ = events.send(network_error(e));
        return;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "relay socket error");
                        break;
                    }
                    None => break,
                };
                let Message::Text(text) = msg else { continue };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => {
                        let _ = events.send(translate(frame, &open));
                    }
                    Err(e) => warn!(error = %e, "invalid relay frame"),
                }
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Text(frame.encode().into())).await {
                    debug!(error = %e, "relay send failed");
                    break;
                }
            }
        }
    }

    // Every link dies with the socket.
    let lost: Vec<ConnectionId> = lock(&open).drain().collect();
    for conn in lost {
        let _ = events.send(TransportEvent::Ice {
            conn,
            state: IceState::Failed,
        });
    }
    let _ = sink.close().await;
}

fn network_error(e: impl Display) -> TransportEvent {
    TransportEvent::Error {
        conn: None,
        error: TransportError::Network(e.to_string()),
    }
}

fn translate(frame: ServerFrame, open: &OpenSet) -> TransportEvent {
    match frame {
        ServerFrame::Registered { id } => TransportEvent::Ready { id },
        ServerFrame::IdTaken { id } => TransportEvent::Error {
            conn: None,
            error: TransportError::IdTaken(id),
        },
        ServerFrame::Incoming { conn, peer } => TransportEvent::Incoming {
            conn: ConnectionId(conn),
            peer,
        },
        ServerFrame::Opened { conn } => {
            lock(open).insert(ConnectionId(conn));
            TransportEvent::Open {
                conn: ConnectionId(conn),
            }
        }
        ServerFrame::Unreachable { conn, target } => TransportEvent::Error {
            conn: Some(ConnectionId(conn)),
            error: TransportError::PeerUnreachable(target),
        },
        ServerFrame::Data { conn, payload } => TransportEvent::Data {
            conn: ConnectionId(conn),
            frame: payload,
        },
        ServerFrame::Closed { conn } => {
            lock(open).remove(&ConnectionId(conn));
            TransportEvent::Close {
                conn: ConnectionId(conn),
            }
        }
        ServerFrame::Lost { conn } => {
            lock(open).remove(&ConnectionId(conn));
            TransportEvent::Ice {
                conn: ConnectionId(conn),
                state: IceState::Failed,
            }
        }
        ServerFrame::Error { message } => {
            warn!(%message, "relay error");
            TransportEvent::Error {
                conn: None,
                error: TransportError::Network(message),
            }
        }
    }
}
