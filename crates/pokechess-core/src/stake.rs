//! Stake terms and escrow bookkeeping.

use crate::identity::{RoomCode, WalletAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;
pub const MIN_STAKE_SOL: f64 = 0.01;
pub const MAX_STAKE_SOL: f64 = 10.0;
/// 2.5% of the pot.
pub const PLATFORM_FEE_BPS: u64 = 250;
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Converts SOL to lamports, rounding down. Negative amounts become zero.
pub fn sol_to_lamports(sol: f64) -> u64 {
    if sol <= 0.0 {
        return 0;
    }
    // Round first so that 0.1 * 1e9 = 99_999_999.99... lands on 100_000_000.
    let scaled = sol * LAMPORTS_PER_SOL as f64;
    let rounded = scaled.round();
    if (scaled - rounded).abs() < 1e-6 {
        rounded as u64
    } else {
        scaled.floor() as u64
    }
}

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Escrow status of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Waiting,
    Active,
    Completed,
    Cancelled,
    Draw,
}

impl MatchStatus {
    /// No further mutation once terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchStatus::Completed | MatchStatus::Cancelled | MatchStatus::Draw
        )
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchStatus::Waiting => "waiting",
            MatchStatus::Active => "active",
            MatchStatus::Completed => "completed",
            MatchStatus::Cancelled => "cancelled",
            MatchStatus::Draw => "draw",
        };
        f.write_str(s)
    }
}

/// Stake state of one match as both peers and the escrow see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStakeInfo {
    pub match_id: RoomCode,
    pub host_address: WalletAddress,
    pub challenger_address: Option<WalletAddress>,
    pub stake_amount_sol: f64,
    pub total_pot: f64,
    pub status: MatchStatus,
    pub winner: Option<WalletAddress>,
}

impl MatchStakeInfo {
    /// A freshly created match holding only the host deposit.
    pub fn new(match_id: RoomCode, host_address: WalletAddress, stake_amount_sol: f64) -> Self {
        Self {
            match_id,
            host_address,
            challenger_address: None,
            stake_amount_sol,
            total_pot: stake_amount_sol,
            status: MatchStatus::Waiting,
            winner: None,
        }
    }

    /// Record the challenger once its deposit is verified.
    pub fn activate(&mut self, challenger: WalletAddress) -> Result<(), StakeError> {
        self.ensure_status(MatchStatus::Waiting)?;
        if challenger == self.host_address {
            return Err(StakeError::SelfPlay);
        }
        self.challenger_address = Some(challenger);
        self.total_pot = self.stake_amount_sol * 2.0;
        self.status = MatchStatus::Active;
        Ok(())
    }

    pub fn complete(&mut self, winner: WalletAddress) -> Result<(), StakeError> {
        self.ensure_status(MatchStatus::Active)?;
        if !self.is_participant(&winner) {
            return Err(StakeError::NotParticipant(winner));
        }
        self.winner = Some(winner);
        self.status = MatchStatus::Completed;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), StakeError> {
        self.ensure_status(MatchStatus::Waiting)?;
        self.status = MatchStatus::Cancelled;
        Ok(())
    }

    pub fn draw(&mut self) -> Result<(), StakeError> {
        self.ensure_status(MatchStatus::Active)?;
        self.winner = None;
        self.status = MatchStatus::Draw;
        Ok(())
    }

    pub fn is_participant(&self, address: &WalletAddress) -> bool {
        *address == self.host_address || self.challenger_address.as_ref() == Some(address)
    }

    /// The other participant, if known.
    pub fn opponent_of(&self, address: &WalletAddress) -> Option<&WalletAddress> {
        if *address == self.host_address {
            self.challenger_address.as_ref()
        } else if self.challenger_address.as_ref() == Some(address) {
            Some(&self.host_address)
        } else {
            None
        }
    }

    pub fn reward(&self, fee_bps: u64) -> RewardBreakdown {
        RewardBreakdown::for_stake(self.stake_amount_sol, fee_bps)
    }

    fn ensure_status(&self, expected: MatchStatus) -> Result<(), StakeError> {
        if self.status.is_terminal() {
            return Err(StakeError::Terminal(self.status));
        }
        if self.status != expected {
            return Err(StakeError::WrongStatus {
                expected,
                actual: self.status,
            });
        }
        Ok(())
    }
}

/// What the winner of a match receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub total_pot_lamports: u64,
    pub platform_fee_lamports: u64,
    pub winner_reward_lamports: u64,
}

impl RewardBreakdown {
    /// Fees above 100% are capped at the whole pot.
    pub fn for_stake(stake_sol: f64, fee_bps: u64) -> Self {
        let total = sol_to_lamports(stake_sol).saturating_mul(2);
        let fee_bps = fee_bps.min(BPS_DENOMINATOR);
        let fee = u64::try_from(u128::from(total) * u128::from(fee_bps) / u128::from(BPS_DENOMINATOR))
            .unwrap_or(total);
        Self {
            total_pot_lamports: total,
            platform_fee_lamports: fee,
            winner_reward_lamports: total.saturating_sub(fee),
        }
    }

    pub fn total_pot_sol(&self) -> f64 {
        lamports_to_sol(self.total_pot_lamports)
    }

    pub fn platform_fee_sol(&self) -> f64 {
        lamports_to_sol(self.platform_fee_lamports)
    }

    pub fn winner_reward_sol(&self) -> f64 {
        lamports_to_sol(self.winner_reward_lamports)
    }
}

/// Accepted stake range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StakeLimits {
    pub min_sol: f64,
    pub max_sol: f64,
}

impl Default for StakeLimits {
    fn default() -> Self {
        Self {
            min_sol: MIN_STAKE_SOL,
            max_sol: MAX_STAKE_SOL,
        }
    }
}

impl StakeLimits {
    /// Checks the amount against the range and, when known, the wallet balance.
    pub fn validate(&self, amount_sol: f64, balance_sol: Option<f64>) -> Result<(), StakeError> {
        if !amount_sol.is_finite() || amount_sol < self.min_sol || amount_sol > self.max_sol {
            return Err(StakeError::OutOfRange {
                amount: amount_sol,
                min: self.min_sol,
                max: self.max_sol,
            });
        }
        if let Some(balance) = balance_sol
            && amount_sol > balance
        {
            return Err(StakeError::InsufficientBalance {
                amount: amount_sol,
                balance,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StakeError {
    #[error("Stake must be between {min} and {max} SOL, got {amount}")]
    OutOfRange { amount: f64, min: f64, max: f64 },
    #[error("Insufficient balance: {amount} SOL needed, {balance} SOL available")]
    InsufficientBalance { amount: f64, balance: f64 },
    #[error("Match is already {0}")]
    Terminal(MatchStatus),
    #[error("Match is {actual}, expected {expected}")]
    WrongStatus {
        expected: MatchStatus,
        actual: MatchStatus,
    },
    #[error("Cannot play against yourself")]
    SelfPlay,
    #[error("{0} is not a match participant")]
    NotParticipant(WalletAddress),
}
