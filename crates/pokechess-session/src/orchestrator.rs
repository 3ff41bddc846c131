//! Match orchestration.
//!
//! [`MatchOrchestrator`] owns everything one match attempt needs: the
//! connection supervisor, the stake handshake, the game session and the turn
//! clock. It moves through [`Phase`]s in response to user actions, transport
//! events, timers and escrow replies, and reports what happened as
//! [`OrchestratorEvent`]s.
//!
//! Drive it by calling [`MatchOrchestrator::step`] in a loop. Every escrow
//! call is tagged with the epoch it was issued in; leaving a phase bumps the
//! epoch so late replies are dropped instead of applied.

use crate::clock::{ClockEvent, TurnClock, TurnClockState};
use crate::config::MatchConfig;
use crate::escrow::{CreatedMatch, EscrowClient, EscrowError};
use crate::game::{EndReason, GameOutcome, GameSession, LocalMove, MoveRejection, SessionMode};
use crate::handshake::{
    AcceptStep, Handshake, HandshakeError, HandshakeEvent, HostHandshake, JoinerHandshake, MatchReady, Role,
    StakeOffer,
};
use crate::rules::MoveRecord;
use crate::supervisor::{ConnectionSupervisor, MessageSink, SupervisorEvent, SupervisorSettings};
use crate::transport::{TransportError, TransportEvent, TransportFactory};
use futures_util::future::{FutureExt, LocalBoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use pokechess_core::{
    Color, ConnectionState, ForfeitReason, MatchError, MatchStakeInfo, MatchStatus, PeerIdentity, PromotionPiece,
    RewardBreakdown, RoomCode, Square, StakeError, WireMessage,
};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Landing,
    StakingSetup,
    WaitingForPeer,
    InGame,
    Settlement,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Landing => "landing",
            Phase::StakingSetup => "staking-setup",
            Phase::WaitingForPeer => "waiting-for-peer",
            Phase::InGame => "in-game",
            Phase::Settlement => "settlement",
        };
        f.write_str(s)
    }
}

/// The match from the local player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Win,
    Loss,
    Draw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    /// Casual game or a lost match.
    Unavailable,
    NotStarted,
    Declaring,
    Claiming,
    Claimed { signature: String },
    Refunding,
    /// `signature` is `None` when the opponent already settled the draw.
    Refunded { signature: Option<String> },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub outcome: GameOutcome,
    /// `None` for casual games.
    pub result: Option<MatchResult>,
    pub stake: Option<MatchStakeInfo>,
    pub reward: Option<RewardBreakdown>,
    pub claim: ClaimState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PhaseChanged { from: Phase, to: Phase },
    Connection(ConnectionState),
    /// Deposit is in and the relay has confirmed the host is reachable at
    /// `peer_id`.
    HostListening { room: RoomCode, peer_id: PeerIdentity },
    TermsOffered(StakeOffer),
    MatchStarted { role: Role, match_id: RoomCode, color: Color },
    OpponentMoved(MoveRecord),
    Strike { color: Color, strikes: u32 },
    GameOver(GameOutcome),
    Claim(ClaimState),
    /// A deposit left behind by an abandoned attempt was returned. No
    /// signature when the other side had already unwound the match.
    Refunded { match_id: RoomCode, signature: Option<String> },
    Error(MatchError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("not available during {0}")]
    WrongPhase(Phase),
    #[error("wallet is not connected")]
    WalletDisconnected,
    #[error("another request is still pending")]
    Busy,
    #[error("nothing to claim")]
    NothingToClaim,
    #[error(transparent)]
    Stake(#[from] StakeError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Move(#[from] MoveRejection),
}

enum EscrowResult {
    Created {
        room: RoomCode,
        result: Result<CreatedMatch, EscrowError>,
    },
    Joined {
        room: RoomCode,
        result: Result<String, EscrowError>,
    },
    WinnerDeclared(Result<String, EscrowError>),
    RewardClaimed(Result<String, EscrowError>),
    /// `Ok(None)`: the escrow already records a draw.
    DrawDeclared(Result<Option<String>, EscrowError>),
    /// `Ok(None)`: the match was already cancelled or drawn.
    Recovered {
        room: RoomCode,
        result: Result<Option<String>, EscrowError>,
    },
}

struct EscrowReply {
    epoch: u64,
    result: EscrowResult,
}

enum Wake {
    Transport(Option<TransportEvent>),
    Escrow(EscrowReply),
    Timer,
}

pub struct MatchOrchestrator<F: TransportFactory, E> {
    config: MatchConfig,
    factory: F,
    escrow: E,
    phase: Phase,
    epoch: u64,
    wallet_connected: bool,
    balance_sol: Option<f64>,
    role: Option<Role>,
    room: Option<RoomCode>,
    supervisor: Option<ConnectionSupervisor<F::Transport>>,
    handshake: Option<Handshake>,
    session: Option<GameSession>,
    clock: Option<TurnClock>,
    stake: Option<MatchStakeInfo>,
    /// Host deposit that has no opponent yet and must be cancelled if the
    /// attempt is abandoned.
    unmatched_deposit: Option<RoomCode>,
    /// Host listening on this room, announced once the transport registers.
    announce: Option<(RoomCode, PeerIdentity)>,
    settlement: Option<Settlement>,
    winner_declared: bool,
    in_flight: Option<&'static str>,
    pending: FuturesUnordered<LocalBoxFuture<'static, EscrowReply>>,
    events: VecDeque<OrchestratorEvent>,
}

impl<F, E> MatchOrchestrator<F, E>
where
    F: TransportFactory,
    E: EscrowClient + Clone + 'static,
{
    pub fn new(config: MatchConfig, factory: F, escrow: E) -> Self {
        Self {
            config,
            factory,
            escrow,
            phase: Phase::Landing,
            epoch: 0,
            wallet_connected: true,
            balance_sol: None,
            role: None,
            room: None,
            supervisor: None,
            handshake: None,
            session: None,
            clock: None,
            stake: None,
            unmatched_deposit: None,
            announce: None,
            settlement: None,
            winner_declared: false,
            in_flight: None,
            pending: FuturesUnordered::new(),
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn room(&self) -> Option<&RoomCode> {
        self.room.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.as_ref().map_or(ConnectionState::Idle, |s| s.state())
    }

    pub fn local_peer_id(&self) -> Option<&PeerIdentity> {
        self.supervisor.as_ref().map(|s| s.local_id())
    }

    pub fn session(&self) -> Option<&GameSession> {
        self.session.as_ref()
    }

    pub fn clock_state(&self) -> Option<TurnClockState> {
        self.clock.as_ref().map(|c| c.state())
    }

    pub fn stake(&self) -> Option<&MatchStakeInfo> {
        self.stake.as_ref()
    }

    pub fn settlement(&self) -> Option<&Settlement> {
        self.settlement.as_ref()
    }

    /// Terms the host offered, while the joiner is deciding.
    pub fn offer(&self) -> Option<&StakeOffer> {
        match &self.handshake {
            Some(Handshake::Joiner(j)) => j.offer(),
            _ => None,
        }
    }

    /// Whether any escrow call is still outstanding, stale ones included.
    pub fn escrow_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        self.events.drain(..).collect()
    }

    pub fn set_balance(&mut self, balance_sol: Option<f64>) {
        self.balance_sol = balance_sol;
    }

    pub fn wallet_reconnected(&mut self) {
        self.wallet_connected = true;
    }

    /// The wallet went away. Mid-match this forfeits a staked game.
    pub fn wallet_disconnected(&mut self) {
        self.wallet_connected = false;
        match self.phase {
            Phase::InGame => {
                let Some(local) = self.session.as_ref().and_then(|s| s.local_color()) else {
                    return;
                };
                warn!("wallet disconnected mid-match, forfeiting");
                self.send_to_peer(&WireMessage::Resign {
                    reason: Some(ForfeitReason::WalletDisconnected),
                });
                self.finish(GameOutcome::win(local.opponent(), EndReason::WalletDisconnected));
            }
            Phase::StakingSetup | Phase::WaitingForPeer => {
                self.abandon_attempt();
                self.set_phase(Phase::Landing);
            }
            Phase::Landing | Phase::Settlement => {}
        }
    }

    pub fn begin_staking(&mut self) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::Landing)?;
        if !self.wallet_connected {
            return Err(OrchestratorError::WalletDisconnected);
        }
        self.set_phase(Phase::StakingSetup);
        Ok(())
    }

    pub fn start_local_game(&mut self) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::Landing)?;
        self.session = Some(GameSession::new(SessionMode::Casual));
        self.clock = None;
        self.set_phase(Phase::InGame);
        Ok(())
    }

    /// Deposit `stake_sol` into a new escrow match and, once that lands,
    /// listen for a joiner on `room`.
    pub fn host_match(&mut self, room: RoomCode, stake_sol: f64) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::StakingSetup)?;
        self.expect_idle_setup()?;
        self.config.stake_limits().validate(stake_sol, self.balance_sol)?;
        info!(%room, stake = stake_sol, "creating escrow match");
        self.role = Some(Role::Host);
        self.room = Some(room.clone());
        self.in_flight = Some("create");
        let escrow = self.escrow.clone();
        self.spawn_escrow(async move {
            let result = escrow.create_match(&room, stake_sol).await;
            EscrowResult::Created { room, result }
        });
        Ok(())
    }

    /// Connect to the host of `room` and wait for its terms.
    pub fn join_match(&mut self, room: RoomCode) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::StakingSetup)?;
        self.expect_idle_setup()?;
        let transport = self.factory.create(PeerIdentity::ephemeral(&self.config.peer_prefix))?;
        let mut supervisor = ConnectionSupervisor::new(transport, SupervisorSettings::from(&self.config));
        let host = PeerIdentity::host(&self.config.peer_prefix, &room);
        info!(%room, %host, "joining match");
        supervisor.connect(host);
        self.handshake = Some(Handshake::Joiner(JoinerHandshake::new(
            room.clone(),
            self.escrow.wallet().clone(),
            &self.config,
        )));
        self.supervisor = Some(supervisor);
        self.role = Some(Role::Joiner);
        self.room = Some(room);
        self.process_events();
        Ok(())
    }

    /// Accept the host's terms. Deposits into escrow unless deposit proof
    /// is turned off.
    pub fn accept_terms(&mut self) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::StakingSetup)?;
        if self.in_flight.is_some() {
            return Err(OrchestratorError::Busy);
        }
        let (Some(Handshake::Joiner(joiner)), Some(supervisor)) = (self.handshake.as_mut(), self.supervisor.as_mut())
        else {
            return Err(OrchestratorError::WrongPhase(self.phase));
        };
        let offer = joiner.offer().cloned().ok_or(HandshakeError::NoTerms)?;
        self.config
            .stake_limits()
            .validate(offer.stake_amount_sol, self.balance_sol)?;
        match joiner.accept(supervisor)? {
            AcceptStep::Deposit { stake_amount_sol } => {
                info!(room = %offer.match_id, stake = stake_amount_sol, "depositing");
                self.in_flight = Some("join");
                let escrow = self.escrow.clone();
                let room = offer.match_id;
                self.spawn_escrow(async move {
                    let result = escrow.join_match(&room).await;
                    EscrowResult::Joined { room, result }
                });
            }
            AcceptStep::Done => {}
        }
        self.process_events();
        Ok(())
    }

    /// Walk away from the offered terms. The room can be joined again.
    pub fn decline_terms(&mut self) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::StakingSetup)?;
        if let Some(Handshake::Joiner(joiner)) = self.handshake.as_mut() {
            joiner.decline();
        }
        self.abandon_attempt();
        Ok(())
    }

    /// Back out of staking. Any host deposit without an opponent is
    /// cancelled to return the funds.
    pub fn cancel(&mut self) -> Result<(), OrchestratorError> {
        match self.phase {
            Phase::StakingSetup | Phase::WaitingForPeer => {
                self.abandon_attempt();
                self.set_phase(Phase::Landing);
                Ok(())
            }
            phase => Err(OrchestratorError::WrongPhase(phase)),
        }
    }

    /// Retry a dropped connection by hand.
    pub fn reconnect(&mut self) -> Result<(), OrchestratorError> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or(OrchestratorError::WrongPhase(self.phase))?;
        supervisor.reconnect();
        self.process_events();
        Ok(())
    }

    pub fn local_move(
        &mut self,
        from: Square,
        to: Square,
        promotion: Option<PromotionPiece>,
    ) -> Result<LocalMove, OrchestratorError> {
        self.expect_phase(Phase::InGame)?;
        let session = self
            .session
            .as_mut()
            .ok_or(OrchestratorError::WrongPhase(self.phase))?;
        let result = session.apply_local_move(from, to, promotion)?;
        let turn = session.turn();
        if let LocalMove::Applied(applied) = &result {
            if let Some(msg) = &applied.outbound {
                self.send_to_peer(msg);
            }
            if let Some(clock) = self.clock.as_mut() {
                clock.on_turn_change(turn);
            }
            if let Some(outcome) = applied.outcome {
                self.finish(outcome);
            }
        }
        self.process_events();
        Ok(result)
    }

    pub fn resign(&mut self) -> Result<GameOutcome, OrchestratorError> {
        self.expect_phase(Phase::InGame)?;
        let session = self
            .session
            .as_mut()
            .ok_or(OrchestratorError::WrongPhase(self.phase))?;
        let resignation = session.resign()?;
        if let Some(msg) = &resignation.outbound {
            self.send_to_peer(msg);
        }
        self.finish(resignation.outcome);
        Ok(resignation.outcome)
    }

    /// Winner only: declare the result on chain, then collect the pot.
    pub fn claim_reward(&mut self) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::Settlement)?;
        let Some(settlement) = self.settlement.as_ref() else {
            return Err(OrchestratorError::NothingToClaim);
        };
        if settlement.result != Some(MatchResult::Win) {
            return Err(OrchestratorError::NothingToClaim);
        }
        self.ensure_claimable()?;
        let match_id = self.staked_match_id()?;
        let escrow = self.escrow.clone();
        if self.winner_declared {
            self.set_claim(ClaimState::Claiming);
            self.spawn_escrow(async move { EscrowResult::RewardClaimed(escrow.claim_reward(&match_id).await) });
        } else {
            self.set_claim(ClaimState::Declaring);
            self.spawn_escrow(async move {
                let winner = escrow.wallet().clone();
                EscrowResult::WinnerDeclared(escrow.declare_winner(&match_id, &winner).await)
            });
        }
        Ok(())
    }

    /// Draw only: settle the match as a draw so both deposits are returned.
    pub fn claim_refund(&mut self) -> Result<(), OrchestratorError> {
        self.expect_phase(Phase::Settlement)?;
        let Some(settlement) = self.settlement.as_ref() else {
            return Err(OrchestratorError::NothingToClaim);
        };
        if settlement.result != Some(MatchResult::Draw) {
            return Err(OrchestratorError::NothingToClaim);
        }
        self.ensure_claimable()?;
        let match_id = self.staked_match_id()?;
        let escrow = self.escrow.clone();
        self.set_claim(ClaimState::Refunding);
        self.spawn_escrow(async move {
            let result = match escrow.declare_draw(&match_id).await {
                Ok(signature) => Ok(Some(signature)),
                Err(e) => match escrow.get_match_info(&match_id).await {
                    Ok(Some(info)) if info.status == MatchStatus::Draw => Ok(None),
                    _ => Err(e),
                },
            };
            EscrowResult::DrawDeclared(result)
        });
        Ok(())
    }

    /// Leave the game or the settlement screen.
    pub fn exit(&mut self) -> Result<(), OrchestratorError> {
        match self.phase {
            Phase::Landing => Ok(()),
            Phase::StakingSetup | Phase::WaitingForPeer => self.cancel(),
            Phase::InGame | Phase::Settlement => {
                info!(phase = %self.phase, "leaving match");
                let unresolved = self.session.as_ref().is_some_and(|s| !s.is_over() && s.local_color().is_some());
                if self.phase == Phase::InGame && unresolved {
                    self.send_to_peer(&WireMessage::Resign { reason: None });
                }
                self.reset();
                self.set_phase(Phase::Landing);
                Ok(())
            }
        }
    }

    /// Earliest instant any timer needs attention.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.supervisor.as_ref().and_then(|s| s.next_deadline()),
            self.handshake.as_ref().and_then(|h| h.next_deadline()),
            self.clock.as_ref().and_then(|c| c.next_deadline()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Wait for the next transport event, escrow reply or timer and handle
    /// it. Returns `false` when nothing can happen anymore.
    ///
    /// Cancel-safe: nothing is lost if the returned future is dropped.
    pub async fn step(&mut self) -> bool {
        let deadline = self.next_deadline();
        if self.supervisor.is_none() && self.pending.is_empty() && deadline.is_none() {
            return false;
        }
        let wake = {
            let has_pending = !self.pending.is_empty();
            let supervisor = &mut self.supervisor;
            let pending = &mut self.pending;
            let transport = async move {
                match supervisor.as_mut() {
                    Some(s) => s.next_transport_event().await,
                    None => std::future::pending().await,
                }
            };
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                event = transport => Wake::Transport(event),
                Some(reply) = pending.next(), if has_pending => Wake::Escrow(reply),
                () = timer => Wake::Timer,
            }
        };
        match wake {
            Wake::Transport(Some(event)) => {
                if let Some(s) = self.supervisor.as_mut() {
                    s.handle_event(event);
                }
            }
            Wake::Transport(None) => {
                if let Some(s) = self.supervisor.as_mut() {
                    s.handle_transport_lost();
                }
            }
            Wake::Escrow(reply) => self.on_escrow_reply(reply),
            Wake::Timer => {}
        }
        self.poll_timers();
        true
    }

    /// Step until `done` holds. `false` if the orchestrator went quiet first.
    pub async fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
        while !done(self) {
            if !self.step().await {
                return done(self);
            }
        }
        true
    }

    fn poll_timers(&mut self) {
        if let Some(s) = self.supervisor.as_mut() {
            s.poll_timers();
        }
        if let (Some(h), Some(s)) = (self.handshake.as_mut(), self.supervisor.as_mut()) {
            h.poll_timers(s);
        }
        let clock_events = self.clock.as_mut().map(|c| c.poll()).unwrap_or_default();
        for event in clock_events {
            self.on_clock_event(event);
        }
        self.process_events();
    }

    fn process_events(&mut self) {
        loop {
            if let Some(event) = self.supervisor.as_mut().and_then(|s| s.pop_event()) {
                self.on_supervisor_event(event);
                continue;
            }
            if let Some(event) = self.handshake.as_mut().and_then(|h| h.pop_event()) {
                self.on_handshake_event(event);
                continue;
            }
            break;
        }
    }

    fn on_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::StateChanged { to, .. } => {
                self.events.push_back(OrchestratorEvent::Connection(to));
                if to == ConnectionState::Closed {
                    self.on_connection_closed();
                }
            }
            SupervisorEvent::Registered { id } => {
                if let Some((room, peer_id)) = self.announce.take() {
                    info!(%room, %id, "host registered");
                    self.set_phase(Phase::WaitingForPeer);
                    self.events.push_back(OrchestratorEvent::HostListening { room, peer_id });
                }
            }
            SupervisorEvent::Connected { .. } => {
                if let (Some(h), Some(s)) = (self.handshake.as_mut(), self.supervisor.as_mut()) {
                    h.on_connected(s);
                }
            }
            SupervisorEvent::Message(msg) => self.on_peer_message(msg),
            SupervisorEvent::Failed(error) => match (&error, self.role) {
                (TransportError::IdTaken(_), Some(Role::Host)) if self.handshake.is_some() => {
                    self.events
                        .push_back(OrchestratorEvent::Error(MatchError::TransportUnavailable(error.to_string())));
                    self.abandon_attempt();
                    self.set_phase(Phase::StakingSetup);
                }
                _ => debug!(error = %error, "transport failure"),
            },
        }
    }

    fn on_connection_closed(&mut self) {
        match self.phase {
            Phase::InGame => {
                let unresolved = self.session.as_ref().is_some_and(|s| !s.is_over());
                if let Some(local) = self.session.as_ref().and_then(|s| s.local_color())
                    && unresolved
                {
                    warn!("opponent connection lost mid-match");
                    self.finish(GameOutcome::win(local, EndReason::OpponentDisconnected));
                }
            }
            Phase::StakingSetup | Phase::WaitingForPeer => {
                if let Some(h) = self.handshake.as_mut() {
                    h.on_disconnected();
                }
            }
            Phase::Landing | Phase::Settlement => {}
        }
    }

    fn on_peer_message(&mut self, msg: WireMessage) {
        if let (Some(h), Some(s)) = (self.handshake.as_mut(), self.supervisor.as_mut()) {
            h.on_message(&msg, s);
            return;
        }
        if self.phase != Phase::InGame {
            debug!(kind = msg.kind(), phase = %self.phase, "message outside a game");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let outcome = match msg {
            WireMessage::Move(m) => match session.apply_remote_move(&m) {
                Ok(applied) => {
                    let turn = session.turn();
                    if let Some(clock) = self.clock.as_mut() {
                        clock.on_turn_change(turn);
                    }
                    self.events.push_back(OrchestratorEvent::OpponentMoved(applied.record));
                    applied.outcome
                }
                Err(MoveRejection::GameOver) => None,
                Err(rejection) => {
                    self.events
                        .push_back(OrchestratorEvent::Error(MatchError::InvalidRemoteMove(rejection.to_string())));
                    None
                }
            },
            WireMessage::Resign { reason } => {
                info!(?reason, "opponent resigned");
                session.opponent_resigned(reason)
            }
            other => {
                debug!(kind = other.kind(), "handshake message after handoff");
                None
            }
        };
        if let Some(outcome) = outcome {
            self.finish(outcome);
        }
    }

    fn on_handshake_event(&mut self, event: HandshakeEvent) {
        match event {
            HandshakeEvent::TermsReceived(offer) => {
                self.events.push_back(OrchestratorEvent::TermsOffered(offer));
            }
            HandshakeEvent::Ready(ready) => self.start_staked_game(ready),
            HandshakeEvent::Failed(error) => {
                self.events.push_back(OrchestratorEvent::Error(error));
                self.abandon_attempt();
                self.set_phase(Phase::StakingSetup);
            }
        }
    }

    fn on_clock_event(&mut self, event: ClockEvent) {
        match event {
            ClockEvent::Strike { color, strikes } => {
                self.events.push_back(OrchestratorEvent::Strike { color, strikes });
            }
            ClockEvent::Expired(outcome) => {
                // Let the opponent settle too.
                self.send_to_peer(&WireMessage::Resign {
                    reason: Some(ForfeitReason::TimeExpired),
                });
                self.finish(outcome);
            }
        }
    }

    fn on_escrow_reply(&mut self, reply: EscrowReply) {
        let current = reply.epoch == self.epoch;
        if current {
            self.in_flight = None;
        }
        match reply.result {
            EscrowResult::Created { room, result } => match result {
                Ok(created) if current => self.start_hosting(room, created),
                Ok(_) => {
                    info!(%room, "escrow match created after the attempt was abandoned");
                    self.recover_deposit(room);
                }
                Err(e) if current => {
                    self.role = None;
                    self.room = None;
                    self.escrow_failed(e);
                }
                Err(e) => debug!(error = %e, "stale create failure"),
            },
            EscrowResult::Joined { room, result } => match result {
                Ok(signature) if current => {
                    if let (Some(Handshake::Joiner(j)), Some(s)) = (self.handshake.as_mut(), self.supervisor.as_mut())
                        && let Err(e) = j.confirm_deposit(signature, s)
                    {
                        warn!(error = %e, "deposit landed but the handshake moved on");
                    }
                }
                Ok(signature) => {
                    warn!(%room, %signature, "deposit landed after the join was abandoned");
                    self.recover_deposit(room);
                }
                Err(e) if current => {
                    if let Some(Handshake::Joiner(j)) = self.handshake.as_mut() {
                        j.deposit_failed();
                    }
                    self.escrow_failed(e);
                }
                Err(e) => debug!(error = %e, "stale join failure"),
            },
            EscrowResult::WinnerDeclared(result) if current => match result {
                Ok(signature) => {
                    info!(%signature, "winner declared");
                    self.winner_declared = true;
                    let wallet = self.escrow.wallet().clone();
                    if let Some(stake) = self.stake.as_mut()
                        && let Err(e) = stake.complete(wallet)
                    {
                        debug!(error = %e, "local stake view already settled");
                    }
                    self.sync_settlement_stake();
                    let Ok(match_id) = self.staked_match_id() else { return };
                    let escrow = self.escrow.clone();
                    self.set_claim(ClaimState::Claiming);
                    self.spawn_escrow(async move { EscrowResult::RewardClaimed(escrow.claim_reward(&match_id).await) });
                }
                Err(e) => self.claim_failed(e),
            },
            EscrowResult::RewardClaimed(result) if current => match result {
                Ok(signature) => {
                    info!(%signature, "reward claimed");
                    self.set_claim(ClaimState::Claimed { signature });
                }
                Err(e) => self.claim_failed(e),
            },
            EscrowResult::DrawDeclared(result) if current => match result {
                Ok(signature) => {
                    if let Some(stake) = self.stake.as_mut()
                        && let Err(e) = stake.draw()
                    {
                        debug!(error = %e, "local stake view already settled");
                    }
                    self.sync_settlement_stake();
                    self.set_claim(ClaimState::Refunded { signature });
                }
                Err(e) => self.claim_failed(e),
            },
            EscrowResult::Recovered { room, result } => match result {
                Ok(signature) => {
                    info!(%room, ?signature, "deposit returned");
                    self.events.push_back(OrchestratorEvent::Refunded {
                        match_id: room,
                        signature,
                    });
                }
                Err(e) => {
                    warn!(%room, error = %e, "could not return deposit");
                    self.events.push_back(OrchestratorEvent::Error(MatchError::EscrowCallFailed(format!(
                        "Could not return deposit for match {room}: {e}"
                    ))));
                }
            },
            EscrowResult::WinnerDeclared(_) | EscrowResult::RewardClaimed(_) | EscrowResult::DrawDeclared(_) => {
                debug!("dropping stale settlement reply");
            }
        }
    }

    fn start_hosting(&mut self, room: RoomCode, created: CreatedMatch) {
        info!(%room, signature = %created.signature, "host deposit confirmed");
        self.unmatched_deposit = Some(room.clone());
        let peer_id = PeerIdentity::host(&self.config.peer_prefix, &room);
        let transport = match self.factory.create(peer_id.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "cannot listen for a joiner");
                self.events
                    .push_back(OrchestratorEvent::Error(MatchError::TransportUnavailable(e.to_string())));
                self.abandon_attempt();
                return;
            }
        };
        let mut supervisor = ConnectionSupervisor::new(transport, SupervisorSettings::from(&self.config));
        supervisor.listen();
        self.handshake = Some(Handshake::Host(HostHandshake::new(
            room.clone(),
            created.stake.stake_amount_sol,
            created.stake.host_address.clone(),
            created.signature,
            &self.config,
        )));
        self.stake = Some(created.stake);
        self.supervisor = Some(supervisor);
        self.announce = Some((room, peer_id));
        self.process_events();
    }

    fn start_staked_game(&mut self, ready: MatchReady) {
        let color = ready.role.color();
        let match_id = ready.stake.match_id.clone();
        info!(role = ?ready.role, %match_id, %color, "match ready");
        self.handshake = None;
        self.unmatched_deposit = None;
        self.stake = Some(ready.stake);
        self.session = Some(GameSession::new(SessionMode::Staked { local: color }));
        self.clock = Some(TurnClock::new(color, &self.config));
        self.set_phase(Phase::InGame);
        self.events.push_back(OrchestratorEvent::MatchStarted {
            role: ready.role,
            match_id,
            color,
        });
    }

    fn finish(&mut self, outcome: GameOutcome) {
        if self.phase != Phase::InGame {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.end(outcome);
        }
        if let Some(clock) = self.clock.as_mut() {
            clock.stop();
        }
        let result = self
            .session
            .as_ref()
            .and_then(|s| s.local_color())
            .map(|local| match outcome.winner {
                None => MatchResult::Draw,
                Some(winner) if winner == local => MatchResult::Win,
                Some(_) => MatchResult::Loss,
            });
        let claim = match (result, &self.stake) {
            (Some(MatchResult::Win | MatchResult::Draw), Some(_)) => ClaimState::NotStarted,
            _ => ClaimState::Unavailable,
        };
        info!(%outcome, ?result, "match over");
        self.settlement = Some(Settlement {
            outcome,
            result,
            stake: self.stake.clone(),
            reward: self.stake.as_ref().map(|s| s.reward(self.config.platform_fee_bps)),
            claim,
        });
        self.events.push_back(OrchestratorEvent::GameOver(outcome));
        self.set_phase(Phase::Settlement);
    }

    /// Tear down the current attempt without changing phase.
    fn abandon_attempt(&mut self) {
        self.epoch += 1;
        self.in_flight = None;
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.disconnect();
        }
        self.handshake = None;
        self.announce = None;
        self.role = None;
        self.room = None;
        self.stake = None;
        if let Some(room) = self.unmatched_deposit.take() {
            self.recover_deposit(room);
        }
    }

    fn reset(&mut self) {
        self.abandon_attempt();
        self.session = None;
        self.clock = None;
        self.settlement = None;
        self.winner_declared = false;
    }

    /// Get a deposit back out of a match this side walked away from. A match
    /// still waiting for a joiner is cancelled; one that already holds both
    /// deposits is settled as a draw.
    fn recover_deposit(&mut self, room: RoomCode) {
        info!(%room, "returning deposit from abandoned match");
        let escrow = self.escrow.clone();
        self.spawn_escrow(async move {
            let status = escrow.get_match_info(&room).await.ok().flatten().map(|info| info.status);
            let attempt = match status {
                Some(MatchStatus::Cancelled | MatchStatus::Draw) => {
                    return EscrowResult::Recovered { room, result: Ok(None) };
                }
                Some(MatchStatus::Active) => escrow.declare_draw(&room).await,
                _ => escrow.cancel_match(&room).await,
            };
            let result = match attempt {
                Ok(signature) => Ok(Some(signature)),
                Err(e) => match escrow.get_match_info(&room).await {
                    Ok(Some(info)) if matches!(info.status, MatchStatus::Cancelled | MatchStatus::Draw) => Ok(None),
                    _ => Err(e),
                },
            };
            EscrowResult::Recovered { room, result }
        });
    }

    fn spawn_escrow(&mut self, call: impl Future<Output = EscrowResult> + 'static) {
        let epoch = self.epoch;
        self.pending.push(
            async move {
                EscrowReply {
                    epoch,
                    result: call.await,
                }
            }
            .boxed_local(),
        );
    }

    fn send_to_peer(&mut self, msg: &WireMessage) {
        if let Some(s) = self.supervisor.as_mut() {
            s.send(msg);
        }
    }

    fn escrow_failed(&mut self, error: EscrowError) {
        warn!(error = %error, "escrow call failed");
        self.events
            .push_back(OrchestratorEvent::Error(MatchError::EscrowCallFailed(error.to_string())));
    }

    fn claim_failed(&mut self, error: EscrowError) {
        self.set_claim(ClaimState::Failed {
            message: error.to_string(),
        });
        self.escrow_failed(error);
    }

    fn set_claim(&mut self, claim: ClaimState) {
        if let Some(settlement) = self.settlement.as_mut() {
            settlement.claim = claim.clone();
            self.events.push_back(OrchestratorEvent::Claim(claim));
        }
    }

    fn sync_settlement_stake(&mut self) {
        if let Some(settlement) = self.settlement.as_mut() {
            settlement.stake = self.stake.clone();
        }
    }

    fn ensure_claimable(&self) -> Result<(), OrchestratorError> {
        match self.settlement.as_ref().map(|s| &s.claim) {
            Some(ClaimState::NotStarted | ClaimState::Failed { .. }) => Ok(()),
            Some(ClaimState::Declaring | ClaimState::Claiming | ClaimState::Refunding) => Err(OrchestratorError::Busy),
            _ => Err(OrchestratorError::NothingToClaim),
        }
    }

    fn staked_match_id(&self) -> Result<RoomCode, OrchestratorError> {
        self.stake
            .as_ref()
            .map(|s| s.match_id.clone())
            .ok_or(OrchestratorError::NothingToClaim)
    }

    fn expect_phase(&self, phase: Phase) -> Result<(), OrchestratorError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(OrchestratorError::WrongPhase(self.phase))
        }
    }

    fn expect_idle_setup(&self) -> Result<(), OrchestratorError> {
        if !self.wallet_connected {
            return Err(OrchestratorError::WalletDisconnected);
        }
        if self.in_flight.is_some() || self.supervisor.is_some() {
            return Err(OrchestratorError::Busy);
        }
        Ok(())
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.phase;
        if from == to {
            return;
        }
        info!(%from, %to, "phase");
        self.phase = to;
        self.events.push_back(OrchestratorEvent::PhaseChanged { from, to });
    }
}
