//! Per-turn countdown with strikes.
//!
//! Each peer only times its own turns and trusts the other to do the same.
//! A turn that runs out costs a strike and restarts the countdown; hitting
//! the strike ceiling loses the game.

use crate::config::MatchConfig;
use crate::game::{EndReason, GameOutcome};
use pokechess_core::Color;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnClockState {
    pub seconds_remaining: u32,
    pub strikes_white: u32,
    pub strikes_black: u32,
}

impl TurnClockState {
    pub fn strikes(&self, color: Color) -> u32 {
        match color {
            Color::White => self.strikes_white,
            Color::Black => self.strikes_black,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    Strike { color: Color, strikes: u32 },
    /// The strike ceiling was reached. Emitted once; the clock is frozen.
    Expired(GameOutcome),
}

pub struct TurnClock {
    local: Color,
    turn_seconds: u32,
    max_strikes: u32,
    state: TurnClockState,
    turn: Color,
    next_tick: Option<Instant>,
    frozen: bool,
}

impl TurnClock {
    /// A clock for the side playing `local`. White is on turn.
    pub fn new(local: Color, config: &MatchConfig) -> Self {
        let mut clock = Self {
            local,
            turn_seconds: config.turn_seconds,
            max_strikes: config.max_strikes,
            state: TurnClockState {
                seconds_remaining: config.turn_seconds,
                strikes_white: 0,
                strikes_black: 0,
            },
            turn: Color::White,
            next_tick: None,
            frozen: false,
        };
        clock.on_turn_change(Color::White);
        clock
    }

    pub fn state(&self) -> TurnClockState {
        self.state
    }

    pub fn turn(&self) -> Color {
        self.turn
    }

    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Reset the countdown. It only runs while `turn` is ours.
    pub fn on_turn_change(&mut self, turn: Color) {
        if self.frozen {
            return;
        }
        self.turn = turn;
        self.state.seconds_remaining = self.turn_seconds;
        self.next_tick = (turn == self.local).then(|| Instant::now() + TICK);
    }

    pub fn stop(&mut self) {
        self.frozen = true;
        self.next_tick = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Count down every second that has passed.
    pub fn poll(&mut self) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        let now = Instant::now();
        while let Some(at) = self.next_tick
            && at <= now
        {
            self.state.seconds_remaining = self.state.seconds_remaining.saturating_sub(1);
            if self.state.seconds_remaining > 0 {
                self.next_tick = Some(at + TICK);
                continue;
            }
            let strikes = self.add_strike();
            if strikes >= self.max_strikes {
                warn!(color = %self.turn, strikes, "out of time");
                self.stop();
                events.push(ClockEvent::Expired(GameOutcome::win(
                    self.turn.opponent(),
                    EndReason::TimeExpired,
                )));
                break;
            }
            info!(color = %self.turn, strikes, max = self.max_strikes, "turn timed out");
            events.push(ClockEvent::Strike {
                color: self.turn,
                strikes,
            });
            self.state.seconds_remaining = self.turn_seconds;
            self.next_tick = Some(at + TICK);
        }
        events
    }

    fn add_strike(&mut self) -> u32 {
        let slot = match self.turn {
            Color::White => &mut self.state.strikes_white,
            Color::Black => &mut self.state.strikes_black,
        };
        *slot += 1;
        *slot
    }
}
