//! Escrow program seam.
//!
//! [`EscrowClient`] is the wallet-signed view of the on-chain match escrow.
//! [`InMemoryEscrow`] enforces the same rules against a shared
//! [`EscrowLedger`] and is what demos and tests run against.

use pokechess_core::{MatchStakeInfo, MatchStatus, RoomCode, StakeError, StakeLimits, WalletAddress};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EscrowError {
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Match not found")]
    MatchNotFound,
    #[error("{0}")]
    Program(String),
    #[error(transparent)]
    Stake(#[from] StakeError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedMatch {
    pub signature: String,
    pub stake: MatchStakeInfo,
}

/// Wallet-signed calls against the match escrow.
///
/// Every call either resolves with a transaction signature or fails with a
/// displayable error.
pub trait EscrowClient {
    /// The wallet that signs for this client.
    fn wallet(&self) -> &WalletAddress;

    fn create_match(
        &self,
        match_id: &RoomCode,
        stake_amount_sol: f64,
    ) -> impl Future<Output = Result<CreatedMatch, EscrowError>>;

    fn join_match(&self, match_id: &RoomCode) -> impl Future<Output = Result<String, EscrowError>>;

    fn declare_winner(
        &self,
        match_id: &RoomCode,
        winner: &WalletAddress,
    ) -> impl Future<Output = Result<String, EscrowError>>;

    fn claim_reward(&self, match_id: &RoomCode) -> impl Future<Output = Result<String, EscrowError>>;

    fn cancel_match(&self, match_id: &RoomCode) -> impl Future<Output = Result<String, EscrowError>>;

    fn declare_draw(&self, match_id: &RoomCode) -> impl Future<Output = Result<String, EscrowError>>;

    fn get_match_info(
        &self,
        match_id: &RoomCode,
    ) -> impl Future<Output = Result<Option<MatchStakeInfo>, EscrowError>>;
}

#[derive(Debug)]
struct LedgerEntry {
    info: MatchStakeInfo,
    reward_claimed: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    matches: HashMap<RoomCode, LedgerEntry>,
    signatures: u64,
    rejections: VecDeque<String>,
}

impl LedgerState {
    fn sign(&mut self, op: &str, match_id: &RoomCode) -> String {
        self.signatures += 1;
        format!("demo-{op}-{match_id}-{}", self.signatures)
    }

    fn entry(&mut self, match_id: &RoomCode) -> Result<&mut LedgerEntry, EscrowError> {
        self.matches.get_mut(match_id).ok_or(EscrowError::MatchNotFound)
    }
}

/// Shared escrow state. Clones see the same matches.
#[derive(Debug, Clone, Default)]
pub struct EscrowLedger {
    state: Arc<Mutex<LedgerState>>,
    latency: Duration,
}

impl EscrowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits this long before touching the ledger.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next call from any wallet fails as if the user rejected it.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.lock().rejections.push_back(reason.into());
    }

    pub fn info(&self, match_id: &RoomCode) -> Option<MatchStakeInfo> {
        self.lock().matches.get(match_id).map(|e| e.info.clone())
    }

    pub fn reward_claimed(&self, match_id: &RoomCode) -> bool {
        self.lock().matches.get(match_id).is_some_and(|e| e.reward_claimed)
    }

    /// A client signing as `wallet`.
    pub fn client(&self, wallet: WalletAddress) -> InMemoryEscrow {
        InMemoryEscrow {
            ledger: self.clone(),
            wallet,
            limits: StakeLimits::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryEscrow {
    ledger: EscrowLedger,
    wallet: WalletAddress,
    limits: StakeLimits,
}

impl InMemoryEscrow {
    pub fn with_limits(mut self, limits: StakeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn ledger(&self) -> &EscrowLedger {
        &self.ledger
    }

    async fn call<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut LedgerState, &WalletAddress) -> Result<R, EscrowError>,
    ) -> Result<R, EscrowError> {
        if !self.ledger.latency.is_zero() {
            tokio::time::sleep(self.ledger.latency).await;
        }
        let mut state = self.ledger.lock();
        if let Some(reason) = state.rejections.pop_front() {
            debug!(op, %reason, "call rejected");
            return Err(EscrowError::Rejected(reason));
        }
        let result = f(&mut state, &self.wallet);
        match &result {
            Ok(_) => info!(op, wallet = %self.wallet, "escrow call succeeded"),
            Err(e) => debug!(op, wallet = %self.wallet, error = %e, "escrow call failed"),
        }
        result
    }
}

fn program(message: &str) -> EscrowError {
    EscrowError::Program(message.to_string())
}

impl EscrowClient for InMemoryEscrow {
    fn wallet(&self) -> &WalletAddress {
        &self.wallet
    }

    async fn create_match(&self, match_id: &RoomCode, stake_amount_sol: f64) -> Result<CreatedMatch, EscrowError> {
        let limits = self.limits;
        self.call("create", |state, wallet| {
            limits.validate(stake_amount_sol, None)?;
            if state.matches.contains_key(match_id) {
                return Err(program("Match already exists"));
            }
            let info = MatchStakeInfo::new(match_id.clone(), wallet.clone(), stake_amount_sol);
            state.matches.insert(
                match_id.clone(),
                LedgerEntry {
                    info: info.clone(),
                    reward_claimed: false,
                },
            );
            Ok(CreatedMatch {
                signature: state.sign("create", match_id),
                stake: info,
            })
        })
        .await
    }

    async fn join_match(&self, match_id: &RoomCode) -> Result<String, EscrowError> {
        self.call("join", |state, wallet| {
            let entry = state.entry(match_id)?;
            if entry.info.status != MatchStatus::Waiting {
                return Err(program("Match is not joinable"));
            }
            entry.info.activate(wallet.clone())?;
            Ok(state.sign("join", match_id))
        })
        .await
    }

    async fn declare_winner(&self, match_id: &RoomCode, winner: &WalletAddress) -> Result<String, EscrowError> {
        self.call("declare", |state, wallet| {
            let entry = state.entry(match_id)?;
            if entry.info.status != MatchStatus::Active {
                return Err(program("Match is not in progress"));
            }
            if !entry.info.is_participant(wallet) {
                return Err(program("Caller is not a match participant"));
            }
            if !entry.info.is_participant(winner) {
                return Err(program("Invalid winner address"));
            }
            entry.info.complete(winner.clone())?;
            Ok(state.sign("declare", match_id))
        })
        .await
    }

    async fn claim_reward(&self, match_id: &RoomCode) -> Result<String, EscrowError> {
        self.call("claim", |state, wallet| {
            let entry = state.entry(match_id)?;
            if entry.info.status != MatchStatus::Completed {
                return Err(program("Match is not completed"));
            }
            if entry.info.winner.as_ref() != Some(wallet) {
                return Err(program("Only the winner can claim"));
            }
            if entry.reward_claimed {
                return Err(program("Reward already claimed"));
            }
            entry.reward_claimed = true;
            Ok(state.sign("claim", match_id))
        })
        .await
    }

    async fn cancel_match(&self, match_id: &RoomCode) -> Result<String, EscrowError> {
        self.call("cancel", |state, wallet| {
            let entry = state.entry(match_id)?;
            if entry.info.host_address != *wallet {
                return Err(program("Only host can cancel"));
            }
            if entry.info.status != MatchStatus::Waiting {
                return Err(program("Cannot cancel active match"));
            }
            entry.info.cancel()?;
            Ok(state.sign("cancel", match_id))
        })
        .await
    }

    async fn declare_draw(&self, match_id: &RoomCode) -> Result<String, EscrowError> {
        self.call("draw", |state, wallet| {
            let entry = state.entry(match_id)?;
            if entry.info.status != MatchStatus::Active {
                return Err(program("Match is not in progress"));
            }
            if !entry.info.is_participant(wallet) {
                return Err(program("Caller is not a match participant"));
            }
            entry.info.draw()?;
            Ok(state.sign("draw", match_id))
        })
        .await
    }

    async fn get_match_info(&self, match_id: &RoomCode) -> Result<Option<MatchStakeInfo>, EscrowError> {
        Ok(self.ledger.info(match_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomCode {
        "ROOM42".parse().unwrap()
    }

    fn clients() -> (EscrowLedger, InMemoryEscrow, InMemoryEscrow) {
        let ledger = EscrowLedger::new();
        let host = ledger.client("host".parse().unwrap());
        let joiner = ledger.client("joiner".parse().unwrap());
        (ledger, host, joiner)
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let (ledger, host, joiner) = clients();
        let created = host.create_match(&room(), 0.1).await.unwrap();
        assert_eq!(created.signature, "demo-create-ROOM42-1");
        assert_eq!(created.stake.status, MatchStatus::Waiting);

        joiner.join_match(&room()).await.unwrap();
        let info = joiner.get_match_info(&room()).await.unwrap().unwrap();
        assert_eq!(info.status, MatchStatus::Active);
        assert_eq!(info.total_pot, 0.2);

        host.declare_winner(&room(), host.wallet()).await.unwrap();
        assert_eq!(
            joiner.claim_reward(&room()).await,
            Err(EscrowError::Program("Only the winner can claim".into()))
        );
        host.claim_reward(&room()).await.unwrap();
        assert!(ledger.reward_claimed(&room()));
        assert_eq!(
            host.claim_reward(&room()).await,
            Err(EscrowError::Program("Reward already claimed".into()))
        );
    }

    #[tokio::test]
    async fn program_rules() {
        let (_ledger, host, joiner) = clients();
        assert!(matches!(
            host.create_match(&room(), 50.0).await,
            Err(EscrowError::Stake(StakeError::OutOfRange { .. }))
        ));
        assert_eq!(joiner.join_match(&room()).await, Err(EscrowError::MatchNotFound));

        host.create_match(&room(), 0.5).await.unwrap();
        assert_eq!(
            host.create_match(&room(), 0.5).await,
            Err(EscrowError::Program("Match already exists".into()))
        );
        assert_eq!(
            host.join_match(&room()).await,
            Err(EscrowError::Stake(StakeError::SelfPlay))
        );
        assert_eq!(
            joiner.cancel_match(&room()).await,
            Err(EscrowError::Program("Only host can cancel".into()))
        );
        assert_eq!(
            host.declare_draw(&room()).await,
            Err(EscrowError::Program("Match is not in progress".into()))
        );

        joiner.join_match(&room()).await.unwrap();
        assert_eq!(
            host.cancel_match(&room()).await,
            Err(EscrowError::Program("Cannot cancel active match".into()))
        );
        assert_eq!(
            joiner.join_match(&room()).await,
            Err(EscrowError::Program("Match is not joinable".into()))
        );
        joiner.declare_draw(&room()).await.unwrap();
    }

    #[tokio::test]
    async fn rejections_and_cancel() {
        let (ledger, host, _joiner) = clients();
        ledger.reject_next("User rejected the request.");
        assert_eq!(
            host.create_match(&room(), 0.1).await,
            Err(EscrowError::Rejected("User rejected the request.".into()))
        );
        assert!(ledger.info(&room()).is_none());

        host.create_match(&room(), 0.1).await.unwrap();
        host.cancel_match(&room()).await.unwrap();
        assert_eq!(ledger.info(&room()).unwrap().status, MatchStatus::Cancelled);
    }
}
