//! Match runtime for PokeChess.
//!
//! Layers, bottom up:
//!
//! - [`transport`]: the peer-to-peer channel abstraction, with an in-process
//!   implementation in [`memory`].
//! - [`supervisor`]: keeps one logical connection alive across drops and
//!   queues outbound messages until it is open.
//! - [`handshake`]: the host/joiner stake agreement.
//! - [`escrow`]: the on-chain match escrow, as seen by a wallet.
//! - [`rules`], [`game`] and [`clock`]: the chess game and its turn timer.
//! - [`orchestrator`]: ties it all together into the match lifecycle.
//!
//! The state machines are synchronous and driven by
//! [`MatchOrchestrator::step`], which is the only place that waits.

pub mod clock;
pub mod config;
pub mod escrow;
pub mod game;
pub mod handshake;
pub mod memory;
pub mod orchestrator;
pub mod rules;
pub mod supervisor;
pub mod transport;

pub use clock::{ClockEvent, TurnClock, TurnClockState};
pub use config::{ConfigError, MatchConfig};
pub use escrow::{CreatedMatch, EscrowClient, EscrowError, EscrowLedger, InMemoryEscrow};
pub use game::{AppliedMove, EndReason, GameOutcome, GameSession, LocalMove, MoveRejection, SessionMode};
pub use handshake::{Handshake, HandshakeError, HandshakeEvent, HostHandshake, JoinerHandshake, Role, StakeOffer};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use orchestrator::{
    ClaimState, MatchOrchestrator, MatchResult, OrchestratorError, OrchestratorEvent, Phase, Settlement,
};
pub use rules::{MoveRecord, RuleEngine, StandardChess};
pub use supervisor::{ConnectionSupervisor, MessageSink, SupervisorEvent, SupervisorSettings};
pub use transport::{ConnectionId, ConnectionTransport, IceState, TransportError, TransportEvent, TransportFactory};
