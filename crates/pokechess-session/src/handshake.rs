//! Stake negotiation between host and joiner.
//!
//! Host: advertise terms (`stake_info`) as soon as the connection opens,
//! retrying while the channel is not writable, re-advertise on every
//! `request_stake_info`, and hand off once the joiner confirms its deposit.
//!
//! Joiner: wait for terms, nudging the host with `request_stake_info` after a
//! grace window, let the user review them, deposit, then confirm.
//!
//! Both sides are sans-IO. Messages go out through a [`MessageSink`] and
//! outcomes come back as [`HandshakeEvent`]s.

use crate::config::MatchConfig;
use crate::supervisor::MessageSink;
use pokechess_core::{Color, MatchError, MatchStakeInfo, RoomCode, WalletAddress, WireMessage};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner,
}

impl Role {
    /// The host plays White.
    pub fn color(self) -> Color {
        match self {
            Role::Host => Color::White,
            Role::Joiner => Color::Black,
        }
    }
}

/// Terms as the joiner sees them before accepting.
#[derive(Debug, Clone, PartialEq)]
pub struct StakeOffer {
    pub match_id: RoomCode,
    pub stake_amount_sol: f64,
    pub host_address: WalletAddress,
    pub host_tx_signature: String,
}

/// Both deposits are in; the game can start.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchReady {
    pub role: Role,
    pub stake: MatchStakeInfo,
    /// The opponent's deposit signature, when it sent one.
    pub opponent_tx: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEvent {
    TermsReceived(StakeOffer),
    Ready(MatchReady),
    Failed(MatchError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("no stake terms to act on")]
    NoTerms,
    #[error("handshake is {0}")]
    WrongPhase(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostPhase {
    AwaitingPeer { deadline: Instant },
    Advertising,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    attempt: u32,
    next_at: Instant,
}

pub struct HostHandshake {
    match_id: RoomCode,
    stake_amount_sol: f64,
    host_address: WalletAddress,
    tx_signature: String,
    require_deposit_proof: bool,
    host_wait_timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
    phase: HostPhase,
    retry: Option<Retry>,
    events: VecDeque<HandshakeEvent>,
}

impl HostHandshake {
    /// Starts the wait-for-joiner clock.
    pub fn new(
        match_id: RoomCode,
        stake_amount_sol: f64,
        host_address: WalletAddress,
        tx_signature: String,
        config: &MatchConfig,
    ) -> Self {
        Self {
            match_id,
            stake_amount_sol,
            host_address,
            tx_signature,
            require_deposit_proof: config.require_deposit_proof,
            host_wait_timeout: config.host_wait_timeout(),
            retry_attempts: config.send_retry_attempts.max(1),
            retry_backoff: config.send_retry_backoff(),
            phase: HostPhase::AwaitingPeer {
                deadline: Instant::now() + config.host_wait_timeout(),
            },
            retry: None,
            events: VecDeque::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, HostPhase::Ready | HostPhase::Failed)
    }

    fn stake_info(&self) -> WireMessage {
        WireMessage::StakeInfo {
            stake_amount: self.stake_amount_sol,
            host_address: self.host_address.clone(),
            tx_signature: self.tx_signature.clone(),
        }
    }

    pub fn on_connected(&mut self, sink: &mut impl MessageSink) {
        if self.is_finished() {
            return;
        }
        self.phase = HostPhase::Advertising;
        self.advertise(sink, 1);
    }

    /// The joiner went away before handoff. Start waiting again.
    pub fn on_disconnected(&mut self) {
        if self.is_finished() {
            return;
        }
        info!(room = %self.match_id, "joiner left before deposit, waiting again");
        self.retry = None;
        self.phase = HostPhase::AwaitingPeer {
            deadline: Instant::now() + self.host_wait_timeout,
        };
    }

    pub fn on_message(&mut self, msg: &WireMessage, sink: &mut impl MessageSink) {
        if self.is_finished() {
            debug!(kind = msg.kind(), "handshake over, ignoring");
            return;
        }
        match msg {
            WireMessage::RequestStakeInfo => {
                debug!("joiner asked for terms");
                sink.send(&self.stake_info());
            }
            WireMessage::StakeConfirmed {
                joiner_address: Some(joiner),
                tx_signature: Some(tx),
            } if !tx.is_empty() => self.ready(joiner.clone(), Some(tx.clone())),
            WireMessage::StakeConfirmed { .. } => {
                warn!("rejecting stake confirmation without address and signature");
            }
            WireMessage::StakeAccepted { joiner_address } => {
                if self.require_deposit_proof {
                    warn!(joiner = %joiner_address, "acceptance without deposit proof ignored");
                } else {
                    self.ready(joiner_address.clone(), None);
                }
            }
            other => debug!(kind = other.kind(), "unexpected message during handshake"),
        }
    }

    pub fn poll_timers(&mut self, sink: &mut impl MessageSink) {
        let now = Instant::now();
        if let HostPhase::AwaitingPeer { deadline } = self.phase
            && deadline <= now
        {
            warn!(room = %self.match_id, "no joiner arrived");
            self.phase = HostPhase::Failed;
            self.events.push_back(HandshakeEvent::Failed(MatchError::HandshakeTimeout));
            return;
        }
        if let Some(retry) = self.retry
            && retry.next_at <= now
            && self.phase == HostPhase::Advertising
        {
            self.advertise(sink, retry.attempt);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            HostPhase::AwaitingPeer { deadline } => Some(deadline),
            HostPhase::Advertising => self.retry.map(|r| r.next_at),
            _ => None,
        }
    }

    pub fn pop_event(&mut self) -> Option<HandshakeEvent> {
        self.events.pop_front()
    }

    fn advertise(&mut self, sink: &mut impl MessageSink, attempt: u32) {
        self.retry = None;
        let msg = self.stake_info();
        match sink.try_send(&msg) {
            Ok(()) => info!(room = %self.match_id, attempt, "stake terms sent"),
            Err(e) if attempt >= self.retry_attempts => {
                warn!(error = %e, attempt, "stake terms still unsendable, queueing");
                sink.send(&msg);
            }
            Err(e) => {
                debug!(error = %e, attempt, "stake terms not sent yet");
                self.retry = Some(Retry {
                    attempt: attempt + 1,
                    next_at: Instant::now() + self.retry_backoff,
                });
            }
        }
    }

    fn ready(&mut self, joiner: WalletAddress, opponent_tx: Option<String>) {
        let mut stake = MatchStakeInfo::new(self.match_id.clone(), self.host_address.clone(), self.stake_amount_sol);
        if let Err(e) = stake.activate(joiner.clone()) {
            warn!(error = %e, "joiner rejected");
            return;
        }
        info!(room = %self.match_id, %joiner, "joiner deposit confirmed");
        self.retry = None;
        self.phase = HostPhase::Ready;
        self.events.push_back(HandshakeEvent::Ready(MatchReady {
            role: Role::Host,
            stake,
            opponent_tx,
        }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinerPhase {
    Connecting,
    AwaitingTerms,
    Reviewing,
    Depositing,
    Ready,
    Failed,
    Declined,
}

/// What the caller has to do after [`JoinerHandshake::accept`].
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptStep {
    /// Deposit this much into escrow, then call
    /// [`JoinerHandshake::confirm_deposit`].
    Deposit { stake_amount_sol: f64 },
    /// Accepted without a deposit; a `Ready` event is queued.
    Done,
}

pub struct JoinerHandshake {
    match_id: RoomCode,
    joiner_address: WalletAddress,
    require_deposit_proof: bool,
    grace: Duration,
    phase: JoinerPhase,
    deadline: Instant,
    nudge_at: Option<Instant>,
    offer: Option<StakeOffer>,
    events: VecDeque<HandshakeEvent>,
}

impl JoinerHandshake {
    /// Starts the join timeout.
    pub fn new(match_id: RoomCode, joiner_address: WalletAddress, config: &MatchConfig) -> Self {
        Self {
            match_id,
            joiner_address,
            require_deposit_proof: config.require_deposit_proof,
            grace: config.stake_info_grace(),
            phase: JoinerPhase::Connecting,
            deadline: Instant::now() + config.join_timeout(),
            nudge_at: None,
            offer: None,
            events: VecDeque::new(),
        }
    }

    pub fn offer(&self) -> Option<&StakeOffer> {
        self.offer.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            JoinerPhase::Ready | JoinerPhase::Failed | JoinerPhase::Declined
        )
    }

    pub fn on_connected(&mut self, _sink: &mut impl MessageSink) {
        if matches!(self.phase, JoinerPhase::Connecting | JoinerPhase::AwaitingTerms) {
            self.phase = JoinerPhase::AwaitingTerms;
            self.nudge_at = Some(Instant::now() + self.grace);
        }
    }

    /// The host went away before handoff.
    pub fn on_disconnected(&mut self) {
        if self.is_finished() {
            return;
        }
        let error = if self.phase == JoinerPhase::Connecting {
            MatchError::MatchNotFound
        } else {
            MatchError::PeerDisconnected
        };
        self.fail(error);
    }

    pub fn on_message(&mut self, msg: &WireMessage, _sink: &mut impl MessageSink) {
        if self.is_finished() {
            return;
        }
        let WireMessage::StakeInfo {
            stake_amount,
            host_address,
            tx_signature,
        } = msg
        else {
            debug!(kind = msg.kind(), "unexpected message during handshake");
            return;
        };
        if !stake_amount.is_finite() || *stake_amount <= 0.0 {
            warn!(stake_amount, "ignoring terms with a bad stake");
            return;
        }
        let offer = StakeOffer {
            match_id: self.match_id.clone(),
            stake_amount_sol: *stake_amount,
            host_address: host_address.clone(),
            host_tx_signature: tx_signature.clone(),
        };
        match &self.offer {
            Some(existing) if *existing == offer => debug!("duplicate terms"),
            Some(_) => warn!("host sent different terms, keeping the first"),
            None => {
                info!(room = %self.match_id, stake = stake_amount, host = %host_address, "terms received");
                self.nudge_at = None;
                self.phase = JoinerPhase::Reviewing;
                self.offer = Some(offer.clone());
                self.events.push_back(HandshakeEvent::TermsReceived(offer));
            }
        }
    }

    pub fn accept(&mut self, sink: &mut impl MessageSink) -> Result<AcceptStep, HandshakeError> {
        if self.phase != JoinerPhase::Reviewing {
            return Err(self.wrong_phase());
        }
        let offer = self.offer.clone().ok_or(HandshakeError::NoTerms)?;
        if self.require_deposit_proof {
            self.phase = JoinerPhase::Depositing;
            return Ok(AcceptStep::Deposit {
                stake_amount_sol: offer.stake_amount_sol,
            });
        }
        sink.send(&WireMessage::StakeAccepted {
            joiner_address: self.joiner_address.clone(),
        });
        self.ready(offer, None);
        Ok(AcceptStep::Done)
    }

    /// The escrow deposit landed under `tx_signature`.
    pub fn confirm_deposit(&mut self, tx_signature: String, sink: &mut impl MessageSink) -> Result<(), HandshakeError> {
        if self.phase != JoinerPhase::Depositing {
            return Err(self.wrong_phase());
        }
        let offer = self.offer.clone().ok_or(HandshakeError::NoTerms)?;
        sink.send(&WireMessage::StakeConfirmed {
            joiner_address: Some(self.joiner_address.clone()),
            tx_signature: Some(tx_signature),
        });
        self.ready(offer, None);
        Ok(())
    }

    /// The deposit did not go through; the terms can be accepted again.
    pub fn deposit_failed(&mut self) {
        if self.phase == JoinerPhase::Depositing {
            self.phase = JoinerPhase::Reviewing;
        }
    }

    pub fn decline(&mut self) {
        if !self.is_finished() {
            info!(room = %self.match_id, "terms declined");
            self.phase = JoinerPhase::Declined;
        }
    }

    pub fn poll_timers(&mut self, sink: &mut impl MessageSink) {
        let now = Instant::now();
        let waiting = matches!(self.phase, JoinerPhase::Connecting | JoinerPhase::AwaitingTerms);
        if waiting && self.deadline <= now {
            let error = if self.phase == JoinerPhase::Connecting {
                MatchError::MatchNotFound
            } else {
                MatchError::HandshakeTimeout
            };
            self.fail(error);
            return;
        }
        if self.phase == JoinerPhase::AwaitingTerms
            && let Some(at) = self.nudge_at
            && at <= now
        {
            debug!("no terms yet, asking");
            sink.send(&WireMessage::RequestStakeInfo);
            self.nudge_at = Some(now + self.grace);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            JoinerPhase::Connecting => Some(self.deadline),
            JoinerPhase::AwaitingTerms => Some(self.nudge_at.map_or(self.deadline, |n| n.min(self.deadline))),
            _ => None,
        }
    }

    pub fn pop_event(&mut self) -> Option<HandshakeEvent> {
        self.events.pop_front()
    }

    fn ready(&mut self, offer: StakeOffer, opponent_tx: Option<String>) {
        let mut stake = MatchStakeInfo::new(offer.match_id, offer.host_address, offer.stake_amount_sol);
        if let Err(e) = stake.activate(self.joiner_address.clone()) {
            self.fail(MatchError::EscrowCallFailed(e.to_string()));
            return;
        }
        info!(room = %self.match_id, "stake locked in");
        self.phase = JoinerPhase::Ready;
        self.events.push_back(HandshakeEvent::Ready(MatchReady {
            role: Role::Joiner,
            stake,
            opponent_tx: opponent_tx.or(Some(offer.host_tx_signature)),
        }));
    }

    fn fail(&mut self, error: MatchError) {
        warn!(room = %self.match_id, error = %error, "join failed");
        self.phase = JoinerPhase::Failed;
        self.nudge_at = None;
        self.events.push_back(HandshakeEvent::Failed(error));
    }

    fn wrong_phase(&self) -> HandshakeError {
        HandshakeError::WrongPhase(match self.phase {
            JoinerPhase::Connecting => "connecting",
            JoinerPhase::AwaitingTerms => "awaiting terms",
            JoinerPhase::Reviewing => "reviewing terms",
            JoinerPhase::Depositing => "depositing",
            JoinerPhase::Ready => "complete",
            JoinerPhase::Failed => "failed",
            JoinerPhase::Declined => "declined",
        })
    }
}

/// Either side of the negotiation.
pub enum Handshake {
    Host(HostHandshake),
    Joiner(JoinerHandshake),
}

impl Handshake {
    pub fn role(&self) -> Role {
        match self {
            Handshake::Host(_) => Role::Host,
            Handshake::Joiner(_) => Role::Joiner,
        }
    }

    pub fn on_connected(&mut self, sink: &mut impl MessageSink) {
        match self {
            Handshake::Host(h) => h.on_connected(sink),
            Handshake::Joiner(j) => j.on_connected(sink),
        }
    }

    pub fn on_disconnected(&mut self) {
        match self {
            Handshake::Host(h) => h.on_disconnected(),
            Handshake::Joiner(j) => j.on_disconnected(),
        }
    }

    pub fn on_message(&mut self, msg: &WireMessage, sink: &mut impl MessageSink) {
        match self {
            Handshake::Host(h) => h.on_message(msg, sink),
            Handshake::Joiner(j) => j.on_message(msg, sink),
        }
    }

    pub fn poll_timers(&mut self, sink: &mut impl MessageSink) {
        match self {
            Handshake::Host(h) => h.poll_timers(sink),
            Handshake::Joiner(j) => j.poll_timers(sink),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            Handshake::Host(h) => h.next_deadline(),
            Handshake::Joiner(j) => j.next_deadline(),
        }
    }

    pub fn pop_event(&mut self) -> Option<HandshakeEvent> {
        match self {
            Handshake::Host(h) => h.pop_event(),
            Handshake::Joiner(j) => j.pop_event(),
        }
    }
}
