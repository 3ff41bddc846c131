//! Relay server.

use crate::protocol::{ClientFrame, INCOMING_BASE, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use pokechess_core::PeerIdentity;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

type Endpoint = (PeerIdentity, u64);

/// Who is registered and which logical connections join them.
struct Switchboard {
    peers: HashMap<PeerIdentity, mpsc::UnboundedSender<ServerFrame>>,
    /// Each link appears twice, once per direction.
    links: HashMap<Endpoint, Endpoint>,
    next_incoming: u64,
    max_peers: usize,
}

impl Switchboard {
    fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            links: HashMap::new(),
            next_incoming: INCOMING_BASE,
            max_peers,
        }
    }

    fn deliver(&self, peer: &PeerIdentity, frame: ServerFrame) {
        if let Some(tx) = self.peers.get(peer) {
            let _ = tx.send(frame);
        }
    }

    fn register(&mut self, id: &PeerIdentity, tx: mpsc::UnboundedSender<ServerFrame>) -> Result<(), ServerFrame> {
        if self.peers.contains_key(id) {
            return Err(ServerFrame::IdTaken { id: id.clone() });
        }
        if self.peers.len() >= self.max_peers {
            return Err(ServerFrame::Error {
                message: "relay is full".to_string(),
            });
        }
        self.peers.insert(id.clone(), tx);
        Ok(())
    }

    fn open(&mut self, from: &PeerIdentity, conn: u64, target: PeerIdentity) {
        if !self.peers.contains_key(&target) || &target == from {
            self.deliver(from, ServerFrame::Unreachable { conn, target });
            return;
        }
        let local = (from.clone(), conn);
        if let Some(stale) = self.links.remove(&local) {
            self.links.remove(&stale);
            self.deliver(&stale.0, ServerFrame::Closed { conn: stale.1 });
        }
        self.next_incoming += 1;
        let remote_conn = self.next_incoming;
        let remote = (target.clone(), remote_conn);
        self.links.insert(local, remote.clone());
        self.links.insert(remote, (from.clone(), conn));
        self.deliver(
            &target,
            ServerFrame::Incoming {
                conn: remote_conn,
                peer: from.clone(),
            },
        );
        self.deliver(&target, ServerFrame::Opened { conn: remote_conn });
        self.deliver(from, ServerFrame::Opened { conn });
        debug!(%from, %target, "linked");
    }

    fn route(&self, from: &PeerIdentity, conn: u64, payload: String) {
        match self.links.get(&(from.clone(), conn)) {
            Some((peer, remote_conn)) => self.deliver(
                peer,
                ServerFrame::Data {
                    conn: *remote_conn,
                    payload,
                },
            ),
            None => self.deliver(from, ServerFrame::Closed { conn }),
        }
    }

    fn close(&mut self, from: &PeerIdentity, conn: u64) {
        if let Some((peer, remote_conn)) = self.links.remove(&(from.clone(), conn)) {
            self.links.remove(&(peer.clone(), remote_conn));
            self.deliver(&peer, ServerFrame::Closed { conn: remote_conn });
        }
    }

    /// Forget `id` and tell everyone it was linked to.
    fn drop_peer(&mut self, id: &PeerIdentity) {
        self.peers.remove(id);
        let ends: Vec<Endpoint> = self.links.keys().filter(|(peer, _)| peer == id).cloned().collect();
        for end in ends {
            if let Some((peer, remote_conn)) = self.links.remove(&end) {
                self.links.remove(&(peer.clone(), remote_conn));
                self.deliver(&peer, ServerFrame::Lost { conn: remote_conn });
            }
        }
    }
}

type SharedState = Arc<RwLock<Switchboard>>;

pub async fn run(addr: SocketAddr, max_peers: usize) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, max_peers).await
}

/// Accept peers on an already bound listener.
pub async fn serve(listener: TcpListener, max_peers: usize) -> anyhow::Result<()> {
    let state = Arc::new(RwLock::new(Switchboard::new(max_peers)));
    info!(addr = %listener.local_addr()?, "relay listening");

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, state).await {
                warn!(%client_addr, error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: SharedState) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    debug!(%addr, "new connection");

    let id = loop {
        let msg = stream.next().await.ok_or(anyhow::anyhow!("Connection closed"))??;
        if let Message::Text(text) = msg {
            let frame: ClientFrame = serde_json::from_str(&text)?;
            match frame {
                ClientFrame::Register { id } => break id,
                other => warn!(%addr, frame = ?other, "expected register"),
            }
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let registered = state.write().await.register(&id, tx);
    if let Err(refusal) = registered {
        info!(%id, %addr, "registration refused");
        sink.send(Message::Text(refusal.encode().into())).await?;
        return Ok(());
    }
    sink.send(Message::Text(ServerFrame::Registered { id: id.clone() }.encode().into()))
        .await?;
    info!(%id, %addr, "registered");

    let result = pump(&id, &state, &mut sink, &mut stream, &mut rx).await;

    state.write().await.drop_peer(&id);
    info!(%id, "left");
    result
}

async fn pump(
    id: &PeerIdentity,
    state: &SharedState,
    sink: &mut futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>,
    stream: &mut futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>,
    rx: &mut mpsc::UnboundedReceiver<ServerFrame>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket error");
                        return Ok(());
                    }
                    None => return Ok(()),
                };
                let Message::Text(text) = msg else { continue };
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(%id, error = %e, "invalid frame");
                        continue;
                    }
                };
                match frame {
                    ClientFrame::Open { conn, target } => state.write().await.open(id, conn, target),
                    ClientFrame::Data { conn, payload } => state.read().await.route(id, conn, payload),
                    ClientFrame::Close { conn } => state.write().await.close(id, conn),
                    ClientFrame::Register { .. } => {
                        let error = ServerFrame::Error { message: "already registered".to_string() };
                        sink.send(Message::Text(error.encode().into())).await?;
                    }
                }
            }

            frame = rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                sink.send(Message::Text(frame.encode().into())).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerIdentity {
        PeerIdentity::new(s)
    }

    fn join(board: &mut Switchboard, id: &str) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        board.register(&peer(id), tx).unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn links_route_both_ways() {
        let mut board = Switchboard::new(8);
        let mut a = join(&mut board, "a");
        let mut b = join(&mut board, "b");

        board.open(&peer("a"), 1, peer("b"));
        assert_eq!(drain(&mut a), vec![ServerFrame::Opened { conn: 1 }]);
        let remote = INCOMING_BASE + 1;
        assert_eq!(
            drain(&mut b),
            vec![
                ServerFrame::Incoming {
                    conn: remote,
                    peer: peer("a")
                },
                ServerFrame::Opened { conn: remote },
            ]
        );

        board.route(&peer("b"), remote, "hi".into());
        assert_eq!(
            drain(&mut a),
            vec![ServerFrame::Data {
                conn: 1,
                payload: "hi".into()
            }]
        );

        board.drop_peer(&peer("b"));
        assert_eq!(drain(&mut a), vec![ServerFrame::Lost { conn: 1 }]);
        board.route(&peer("a"), 1, "anyone?".into());
        assert_eq!(drain(&mut a), vec![ServerFrame::Closed { conn: 1 }]);
    }

    #[test]
    fn registration_rules() {
        let mut board = Switchboard::new(1);
        let _a = join(&mut board, "a");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(board.register(&peer("a"), tx.clone()), Err(ServerFrame::IdTaken { id: peer("a") }));
        assert!(matches!(board.register(&peer("b"), tx), Err(ServerFrame::Error { .. })));
    }

    #[test]
    fn unknown_targets_are_unreachable() {
        let mut board = Switchboard::new(8);
        let mut a = join(&mut board, "a");
        board.open(&peer("a"), 4, peer("nobody"));
        assert_eq!(
            drain(&mut a),
            vec![ServerFrame::Unreachable {
                conn: 4,
                target: peer("nobody")
            }]
        );
    }
}
