//! Connection supervision.
//!
//! [`ConnectionSupervisor`] owns at most one live connection to the opponent
//! and walks it through [`ConnectionState`]. It never blocks: the driver
//! feeds it transport events and calls [`ConnectionSupervisor::poll_timers`]
//! when [`ConnectionSupervisor::next_deadline`] passes, then drains the
//! [`SupervisorEvent`]s it produced.

use crate::config::MatchConfig;
use crate::transport::{ConnectionId, ConnectionTransport, IceState, TransportError, TransportEvent};
use pokechess_core::{ConnectionState, PeerIdentity, WireMessage};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The transport claimed `id` and can be reached by it.
    Registered { id: PeerIdentity },
    /// The connection just became usable. Fires once per open.
    Connected { peer: PeerIdentity },
    Message(WireMessage),
    /// The target cannot be reached or our id cannot be claimed.
    Failed(TransportError),
}

/// Anything protocol code can hand a message to.
pub trait MessageSink {
    /// Send now if possible, otherwise queue until the next open.
    fn send(&mut self, msg: &WireMessage);

    /// Send now or report why not. Nothing is queued.
    fn try_send(&mut self, msg: &WireMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub reconnect_delay: Duration,
    pub open_poll_interval: Duration,
    pub open_poll_attempts: u32,
}

impl From<&MatchConfig> for SupervisorSettings {
    fn from(config: &MatchConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            open_poll_interval: config.open_poll_interval(),
            open_poll_attempts: config.open_poll_attempts,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        (&MatchConfig::default()).into()
    }
}

#[derive(Debug)]
struct OpenPoll {
    conn: ConnectionId,
    next_at: Instant,
    attempts: u32,
}

pub struct ConnectionSupervisor<T> {
    transport: T,
    settings: SupervisorSettings,
    state: ConnectionState,
    conn: Option<ConnectionId>,
    target: Option<PeerIdentity>,
    outbox: VecDeque<String>,
    reconnect_at: Option<Instant>,
    /// Set once the automatic retry for the current failure was scheduled.
    auto_reconnect_used: bool,
    /// Listening side: never dials, waits for the peer to come back.
    passive: bool,
    open_poll: Option<OpenPoll>,
    transport_gone: bool,
    events: VecDeque<SupervisorEvent>,
}

impl<T: ConnectionTransport> ConnectionSupervisor<T> {
    pub fn new(transport: T, settings: SupervisorSettings) -> Self {
        Self {
            transport,
            settings,
            state: ConnectionState::Idle,
            conn: None,
            target: None,
            outbox: VecDeque::new(),
            reconnect_at: None,
            auto_reconnect_used: false,
            passive: false,
            open_poll: None,
            transport_gone: false,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_id(&self) -> &PeerIdentity {
        self.transport.local_id()
    }

    /// The peer we are (or were last) connected to.
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.target.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Accept incoming connections instead of dialing.
    pub fn listen(&mut self) {
        self.passive = true;
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            self.set_state(ConnectionState::Waiting);
        }
    }

    pub fn is_listening(&self) -> bool {
        self.passive
    }

    /// Dial `peer`. A no-op when already open to it.
    pub fn connect(&mut self, peer: PeerIdentity) {
        if self.state == ConnectionState::Open && self.target.as_ref() == Some(&peer) && self.conn.is_some() {
            return;
        }
        self.reconnect_at = None;
        self.auto_reconnect_used = false;
        self.passive = false;
        self.teardown(true);
        info!(%peer, "connecting");
        self.target = Some(peer.clone());
        self.set_state(ConnectionState::Connecting);
        self.dial(&peer);
    }

    /// User-requested retry. Clears the automatic retry budget.
    pub fn reconnect(&mut self) {
        self.reconnect_at = None;
        self.auto_reconnect_used = false;
        let Some(peer) = self.target.clone().filter(|_| !self.passive) else {
            self.teardown(true);
            self.set_state(ConnectionState::Waiting);
            return;
        };
        self.teardown(true);
        self.set_state(ConnectionState::Reconnecting);
        self.dial(&peer);
    }

    /// Drop everything and release the transport identity.
    pub fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.auto_reconnect_used = false;
        self.teardown(true);
        self.target = None;
        let dropped = self.outbox.len();
        self.outbox.clear();
        if dropped > 0 {
            debug!(dropped, "discarding queued frames");
        }
        self.transport.shutdown();
        self.set_state(ConnectionState::Idle);
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready { id } => {
                debug!(%id, "transport ready");
                if self.target.is_none() && matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
                    self.set_state(ConnectionState::Waiting);
                }
                self.events.push_back(SupervisorEvent::Registered { id });
            }
            TransportEvent::Incoming { conn, peer } => {
                info!(%peer, %conn, "incoming connection");
                self.reconnect_at = None;
                self.target = Some(peer);
                self.attach(conn);
            }
            TransportEvent::Open { conn } => self.mark_open(conn),
            TransportEvent::Data { conn, frame } => {
                if self.conn != Some(conn) {
                    debug!(%conn, "data on stale connection dropped");
                    return;
                }
                match WireMessage::decode(&frame) {
                    Ok(msg) => {
                        debug!(kind = msg.kind(), "received");
                        self.events.push_back(SupervisorEvent::Message(msg));
                    }
                    Err(e) => warn!(error = %e, "dropping malformed frame"),
                }
            }
            TransportEvent::Close { conn } => {
                if self.conn != Some(conn) {
                    return;
                }
                self.teardown(false);
                if self.state == ConnectionState::Reconnecting && self.reconnect_at.is_some() {
                    debug!("connection closed, automatic retry still pending");
                    return;
                }
                info!(%conn, "connection closed");
                self.open_poll = None;
                self.reconnect_at = None;
                self.set_state(ConnectionState::Closed);
            }
            TransportEvent::Error { conn, error } => {
                if let Some(conn) = conn
                    && self.conn != Some(conn)
                {
                    debug!(%conn, error = %error, "error on stale connection");
                    return;
                }
                self.on_failure(error);
            }
            TransportEvent::Ice { conn, state } => {
                if self.conn != Some(conn) {
                    return;
                }
                match state {
                    IceState::Connected | IceState::Completed => {
                        if self.state == ConnectionState::Reconnecting && self.transport.is_open(conn) {
                            self.mark_open(conn);
                        }
                    }
                    IceState::Disconnected | IceState::Failed => {
                        self.on_failure(TransportError::Network(format!("ice {state:?}").to_lowercase()));
                    }
                    IceState::Checking => {}
                }
            }
        }
    }

    /// The transport's event stream ended.
    pub fn handle_transport_lost(&mut self) {
        if self.transport_gone {
            return;
        }
        warn!("transport event stream ended");
        self.transport_gone = true;
        self.reconnect_at = None;
        self.open_poll = None;
        self.conn = None;
        self.set_state(ConnectionState::Closed);
    }

    /// Run timers that are due.
    pub fn poll_timers(&mut self) {
        let now = Instant::now();
        if let Some(at) = self.reconnect_at
            && at <= now
        {
            self.reconnect_at = None;
            if self.passive && self.state == ConnectionState::Reconnecting {
                info!("peer did not come back");
                self.teardown(true);
                self.set_state(ConnectionState::Closed);
            } else if self.state != ConnectionState::Open
                && let Some(peer) = self.target.clone()
            {
                info!(%peer, "automatic reconnect");
                self.teardown(true);
                self.set_state(ConnectionState::Reconnecting);
                self.dial(&peer);
            }
        }
        if let Some(poll) = self.open_poll.as_mut()
            && poll.next_at <= now
        {
            poll.attempts += 1;
            let conn = poll.conn;
            if self.transport.is_open(conn) {
                debug!(%conn, attempts = poll.attempts, "open detected by polling");
                self.mark_open(conn);
            } else if poll.attempts >= self.settings.open_poll_attempts {
                self.open_poll = None;
                warn!(%conn, "connection never became ready");
                if self.state == ConnectionState::Reconnecting {
                    self.teardown(true);
                    self.set_state(ConnectionState::Closed);
                }
            } else {
                poll.next_at = now + self.settings.open_poll_interval;
            }
        }
    }

    /// Earliest instant at which [`Self::poll_timers`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let poll = self.open_poll.as_ref().map(|p| p.next_at);
        match (self.reconnect_at, poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Wait for the next transport event. Pending forever once the
    /// transport is gone.
    pub fn next_transport_event(&mut self) -> impl Future<Output = Option<TransportEvent>> + '_ {
        let gone = self.transport_gone;
        let transport = &mut self.transport;
        async move {
            if gone {
                std::future::pending::<()>().await;
            }
            transport.next_event().await
        }
    }

    pub fn pop_event(&mut self) -> Option<SupervisorEvent> {
        self.events.pop_front()
    }

    fn dial(&mut self, peer: &PeerIdentity) {
        match self.transport.open(peer) {
            Ok(conn) => self.attach(conn),
            Err(e) => self.on_failure(e),
        }
    }

    fn attach(&mut self, conn: ConnectionId) {
        if self.conn.is_some_and(|current| current != conn) {
            self.teardown(true);
        }
        self.conn = Some(conn);
        if self.state != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }
        if self.transport.is_open(conn) {
            self.mark_open(conn);
            return;
        }
        self.open_poll = Some(OpenPoll {
            conn,
            next_at: Instant::now() + self.settings.open_poll_interval,
            attempts: 0,
        });
    }

    fn mark_open(&mut self, conn: ConnectionId) {
        if self.conn != Some(conn) || self.state == ConnectionState::Open {
            return;
        }
        self.open_poll = None;
        self.reconnect_at = None;
        self.auto_reconnect_used = false;
        self.set_state(ConnectionState::Open);
        self.flush();
        if let Some(peer) = self.target.clone() {
            info!(%peer, %conn, "connected");
            self.events.push_back(SupervisorEvent::Connected { peer });
        }
    }

    fn flush(&mut self) {
        let Some(conn) = self.conn else { return };
        while let Some(frame) = self.outbox.pop_front() {
            if let Err(e) = self.transport.send(conn, &frame) {
                warn!(error = %e, remaining = self.outbox.len() + 1, "flush interrupted");
                self.outbox.push_front(frame);
                return;
            }
        }
    }

    fn on_failure(&mut self, error: TransportError) {
        if error.is_fatal() {
            warn!(error = %error, "connection failed");
            self.reconnect_at = None;
            self.teardown(true);
            self.set_state(ConnectionState::Closed);
            self.events.push_back(SupervisorEvent::Failed(error));
            return;
        }
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                warn!(error = %error, "connection degraded");
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect();
            }
            ConnectionState::Reconnecting if self.reconnect_at.is_none() && self.auto_reconnect_used => {
                warn!(error = %error, "reconnect failed");
                self.teardown(true);
                self.set_state(ConnectionState::Closed);
            }
            _ => debug!(error = %error, state = %self.state, "transport error"),
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.auto_reconnect_used || (self.target.is_none() && !self.passive) {
            return;
        }
        self.auto_reconnect_used = true;
        let delay = if self.passive {
            // Give the dialing side its delay plus a full readiness window.
            self.settings.reconnect_delay + self.settings.open_poll_interval * self.settings.open_poll_attempts
        } else {
            self.settings.reconnect_delay
        };
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn teardown(&mut self, close: bool) {
        self.open_poll = None;
        if let Some(conn) = self.conn.take()
            && close
        {
            self.transport.close(conn);
        }
    }

    fn set_state(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug!(%from, %to, "connection state");
        self.state = to;
        self.events.push_back(SupervisorEvent::StateChanged { from, to });
    }
}

impl<T: ConnectionTransport> MessageSink for ConnectionSupervisor<T> {
    fn send(&mut self, msg: &WireMessage) {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, kind = msg.kind(), "cannot encode message");
                return;
            }
        };
        if self.state == ConnectionState::Open
            && self.outbox.is_empty()
            && let Some(conn) = self.conn
        {
            match self.transport.send(conn, &frame) {
                Ok(()) => {
                    debug!(kind = msg.kind(), "sent");
                    return;
                }
                Err(e) => warn!(error = %e, kind = msg.kind(), "send failed, queueing"),
            }
        }
        self.outbox.push_back(frame);
        if self.state == ConnectionState::Open {
            self.flush();
        }
    }

    fn try_send(&mut self, msg: &WireMessage) -> Result<(), TransportError> {
        let conn = match self.conn {
            Some(conn) if self.state == ConnectionState::Open => conn,
            _ => return Err(TransportError::NotOpen),
        };
        let frame = msg.encode().map_err(|e| TransportError::Network(e.to_string()))?;
        self.transport.send(conn, &frame)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pokechess_core::MoveMessage;
    use std::collections::HashSet;

    /// Transport that records calls and only does what it is told.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub id: Option<PeerIdentity>,
        pub next_conn: u64,
        pub opened: Vec<(ConnectionId, PeerIdentity)>,
        pub ready: HashSet<ConnectionId>,
        pub closed: Vec<ConnectionId>,
        pub sent: Vec<(ConnectionId, String)>,
        pub fail_sends: bool,
        pub shut_down: bool,
    }

    impl ConnectionTransport for ScriptedTransport {
        fn local_id(&self) -> &PeerIdentity {
            self.id.as_ref().expect("scripted transport has an id")
        }

        fn open(&mut self, target: &PeerIdentity) -> Result<ConnectionId, TransportError> {
            self.next_conn += 1;
            let conn = ConnectionId(self.next_conn);
            self.opened.push((conn, target.clone()));
            Ok(conn)
        }

        fn send(&mut self, conn: ConnectionId, frame: &str) -> Result<(), TransportError> {
            if self.fail_sends || !self.ready.contains(&conn) {
                return Err(TransportError::NotOpen);
            }
            self.sent.push((conn, frame.to_string()));
            Ok(())
        }

        fn is_open(&self, conn: ConnectionId) -> bool {
            self.ready.contains(&conn)
        }

        fn close(&mut self, conn: ConnectionId) {
            self.ready.remove(&conn);
            self.closed.push(conn);
        }

        fn shutdown(&mut self) {
            self.shut_down = true;
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            std::future::pending().await
        }
    }

    fn supervisor() -> ConnectionSupervisor<ScriptedTransport> {
        let transport = ScriptedTransport {
            id: Some(PeerIdentity::new("me")),
            ..Default::default()
        };
        ConnectionSupervisor::new(transport, SupervisorSettings::default())
    }

    fn drain(s: &mut ConnectionSupervisor<ScriptedTransport>) -> Vec<SupervisorEvent> {
        std::iter::from_fn(|| s.pop_event()).collect()
    }

    fn states(events: &[SupervisorEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn mv(n: u8) -> WireMessage {
        WireMessage::Move(MoveMessage {
            from: pokechess_core::Square::new(n, 1).unwrap(),
            to: pokechess_core::Square::new(n, 3).unwrap(),
            promotion: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_flush_in_order_on_open() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("host"));
        for n in 0..3 {
            s.send(&mv(n));
        }
        assert_eq!(s.queued(), 3);

        let conn = s.transport.opened[0].0;
        s.transport.ready.insert(conn);
        s.handle_event(TransportEvent::Open { conn });

        assert_eq!(s.state(), ConnectionState::Open);
        assert_eq!(s.queued(), 0);
        let sent: Vec<WireMessage> = s
            .transport
            .sent
            .iter()
            .map(|(_, f)| WireMessage::decode(f).unwrap())
            .collect();
        assert_eq!(sent, vec![mv(0), mv(1), mv(2)]);

        // Later sends go straight out, behind the flushed ones.
        s.send(&mv(3));
        assert_eq!(s.transport.sent.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn open_event_and_poll_fire_once() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("host"));
        let conn = s.transport.opened[0].0;
        s.transport.ready.insert(conn);

        tokio::time::advance(Duration::from_millis(250)).await;
        s.poll_timers();
        s.handle_event(TransportEvent::Open { conn });

        let events = drain(&mut s);
        let connected = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Connected { .. }))
            .count();
        assert_eq!(connected, 1);
        assert_eq!(states(&events), vec![ConnectionState::Connecting, ConnectionState::Open]);
        assert_eq!(s.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn single_automatic_retry() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("host"));
        let first = s.transport.opened[0].0;
        s.transport.ready.insert(first);
        s.handle_event(TransportEvent::Open { conn: first });
        drain(&mut s);

        s.transport.ready.remove(&first);
        s.handle_event(TransportEvent::Ice {
            conn: first,
            state: IceState::Failed,
        });
        assert_eq!(s.state(), ConnectionState::Reconnecting);
        s.handle_event(TransportEvent::Error {
            conn: Some(first),
            error: TransportError::Network("again".into()),
        });
        tokio::time::advance(Duration::from_millis(1999)).await;
        s.poll_timers();
        assert_eq!(s.transport.opened.len(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        s.poll_timers();
        assert_eq!(s.transport.opened.len(), 2);
        assert_eq!(s.transport.closed, vec![first]);

        // The retry itself fails: no second automatic attempt.
        let second = s.transport.opened[1].0;
        s.handle_event(TransportEvent::Error {
            conn: Some(second),
            error: TransportError::Network("still down".into()),
        });
        assert_eq!(s.state(), ConnectionState::Closed);
        tokio::time::advance(Duration::from_secs(10)).await;
        s.poll_timers();
        assert_eq!(s.transport.opened.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ice_recovery_reopens() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("host"));
        let conn = s.transport.opened[0].0;
        s.transport.ready.insert(conn);
        s.handle_event(TransportEvent::Open { conn });
        s.send(&mv(0));
        s.handle_event(TransportEvent::Ice {
            conn,
            state: IceState::Disconnected,
        });
        s.send(&mv(1));
        assert_eq!(s.queued(), 1);
        s.handle_event(TransportEvent::Ice {
            conn,
            state: IceState::Connected,
        });
        assert_eq!(s.state(), ConnectionState::Open);
        assert_eq!(s.queued(), 0);
        assert_eq!(s.transport.sent.len(), 2);
        assert_eq!(s.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_during_reconnect() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("host"));
        let conn = s.transport.opened[0].0;
        s.transport.ready.insert(conn);
        s.handle_event(TransportEvent::Open { conn });
        s.transport.ready.remove(&conn);
        s.handle_event(TransportEvent::Ice {
            conn,
            state: IceState::Failed,
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        s.poll_timers();
        assert_eq!(s.state(), ConnectionState::Reconnecting);
        for _ in 0..40 {
            tokio::time::advance(Duration::from_millis(250)).await;
            s.poll_timers();
        }
        assert_eq!(s.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_peer_closes() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("nobody"));
        let conn = s.transport.opened[0].0;
        s.handle_event(TransportEvent::Error {
            conn: Some(conn),
            error: TransportError::PeerUnreachable(PeerIdentity::new("nobody")),
        });
        let events = drain(&mut s);
        assert_eq!(s.state(), ConnectionState::Closed);
        assert!(events.contains(&SupervisorEvent::Failed(TransportError::PeerUnreachable(
            PeerIdentity::new("nobody")
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn new_connection_replaces_old() {
        let mut s = supervisor();
        s.handle_event(TransportEvent::Ready {
            id: PeerIdentity::new("me"),
        });
        assert_eq!(s.state(), ConnectionState::Waiting);
        assert!(drain(&mut s).contains(&SupervisorEvent::Registered {
            id: PeerIdentity::new("me")
        }));
        s.handle_event(TransportEvent::Incoming {
            conn: ConnectionId(7),
            peer: PeerIdentity::new("a"),
        });
        assert_eq!(s.state(), ConnectionState::Connecting);
        s.transport.ready.insert(ConnectionId(7));
        s.handle_event(TransportEvent::Open { conn: ConnectionId(7) });
        s.handle_event(TransportEvent::Incoming {
            conn: ConnectionId(8),
            peer: PeerIdentity::new("b"),
        });
        assert_eq!(s.transport.closed, vec![ConnectionId(7)]);
        assert_eq!(s.peer(), Some(&PeerIdentity::new("b")));

        // Traffic from the replaced connection is ignored.
        s.handle_event(TransportEvent::Data {
            conn: ConnectionId(7),
            frame: r#"{"type":"resign"}"#.into(),
        });
        assert!(!drain(&mut s).iter().any(|e| matches!(e, SupervisorEvent::Message(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn dialing_another_peer_replaces_the_link() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("a"));
        let old = s.transport.opened[0].0;
        s.transport.ready.insert(old);
        s.handle_event(TransportEvent::Open { conn: old });
        drain(&mut s);

        s.connect(PeerIdentity::new("b"));
        assert_eq!(s.transport.closed, vec![old]);
        assert_eq!(s.state(), ConnectionState::Connecting);
        assert_eq!(s.peer(), Some(&PeerIdentity::new("b")));
        let new = s.transport.opened[1].0;
        assert_eq!(s.transport.opened[1].1, PeerIdentity::new("b"));

        s.send(&mv(0));
        s.send(&mv(1));
        // The old link dying late must not trigger a retry.
        s.handle_event(TransportEvent::Error {
            conn: Some(old),
            error: TransportError::Network("gone".into()),
        });
        s.handle_event(TransportEvent::Close { conn: old });
        assert_eq!(s.state(), ConnectionState::Connecting);

        s.transport.ready.insert(new);
        s.handle_event(TransportEvent::Open { conn: new });
        assert_eq!(
            s.transport.sent,
            vec![(new, mv(0).encode().unwrap()), (new, mv(1).encode().unwrap())]
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        s.poll_timers();
        assert_eq!(s.transport.opened.len(), 2);
        assert_eq!(s.state(), ConnectionState::Open);
        let connected: Vec<_> = drain(&mut s)
            .into_iter()
            .filter_map(|e| match e {
                SupervisorEvent::Connected { peer } => Some(peer),
                _ => None,
            })
            .collect();
        assert_eq!(connected, vec![PeerIdentity::new("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_dropped() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("host"));
        let conn = s.transport.opened[0].0;
        s.transport.ready.insert(conn);
        s.handle_event(TransportEvent::Open { conn });
        drain(&mut s);
        s.handle_event(TransportEvent::Data {
            conn,
            frame: "{not json".into(),
        });
        s.handle_event(TransportEvent::Data {
            conn,
            frame: r#"{"type":"resign"}"#.into(),
        });
        assert_eq!(drain(&mut s), vec![SupervisorEvent::Message(WireMessage::Resign { reason: None })]);
        assert_eq!(s.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_waits_for_peer_to_return() {
        let mut s = supervisor();
        s.listen();
        assert_eq!(s.state(), ConnectionState::Waiting);
        s.transport.ready.insert(ConnectionId(5));
        s.handle_event(TransportEvent::Incoming {
            conn: ConnectionId(5),
            peer: PeerIdentity::new("joiner"),
        });
        assert_eq!(s.state(), ConnectionState::Open);

        s.transport.ready.remove(&ConnectionId(5));
        s.handle_event(TransportEvent::Ice {
            conn: ConnectionId(5),
            state: IceState::Failed,
        });
        assert_eq!(s.state(), ConnectionState::Reconnecting);
        tokio::time::advance(Duration::from_secs(11)).await;
        s.poll_timers();
        assert_eq!(s.state(), ConnectionState::Reconnecting);

        // The joiner dials back in time.
        s.transport.ready.insert(ConnectionId(6));
        s.handle_event(TransportEvent::Incoming {
            conn: ConnectionId(6),
            peer: PeerIdentity::new("joiner"),
        });
        assert_eq!(s.state(), ConnectionState::Open);

        s.transport.ready.remove(&ConnectionId(6));
        s.handle_event(TransportEvent::Ice {
            conn: ConnectionId(6),
            state: IceState::Failed,
        });
        tokio::time::advance(Duration::from_secs(12)).await;
        s.poll_timers();
        assert_eq!(s.state(), ConnectionState::Closed);
        assert!(s.transport.opened.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_discards_outbox() {
        let mut s = supervisor();
        s.connect(PeerIdentity::new("host"));
        s.send(&WireMessage::Resign { reason: None });
        assert!(s.try_send(&WireMessage::Resign { reason: None }).is_err());
        s.disconnect();
        assert_eq!(s.queued(), 0);
        assert_eq!(s.state(), ConnectionState::Idle);
        assert!(s.transport.shut_down);
        assert_eq!(s.next_deadline(), None);
    }
}
