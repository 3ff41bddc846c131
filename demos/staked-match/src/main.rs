//! Staked match between two in-process players.
//!
//! The host deposits, the joiner accepts the terms and deposits, they play
//! a short scripted game and the winner claims the pot.
//!
//!   cargo run -p pokechess-demo-staked-match -- --room ABC123 --stake 0.1
//!   cargo run -p pokechess-demo-staked-match -- --relay ws://127.0.0.1:9300

use anyhow::{Context, bail};
use pokechess_core::{RoomCode, Square};
use pokechess_relay::RelayConnector;
use pokechess_session::{
    ClaimState, EscrowLedger, InMemoryEscrow, MatchConfig, MatchOrchestrator, MemoryNetwork, OrchestratorEvent, Phase,
    TransportFactory,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// Fool's mate: black wins in four plies.
const SCRIPT: [(&str, &str); 4] = [("f2", "f3"), ("e7", "e5"), ("g2", "g4"), ("d8", "h4")];

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pokechess_session=info".parse()?)
                .add_directive("pokechess_demo_staked_match=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let room: RoomCode = match parse_arg(&args, "--room") {
        Some(code) => code.parse()?,
        None => RoomCode::generate(),
    };
    let stake: f64 = parse_arg(&args, "--stake").map(|s| s.parse::<f64>()).transpose()?.unwrap_or(0.1);
    let config = match parse_arg(&args, "--config") {
        Some(path) => MatchConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => MatchConfig::default(),
    };

    match parse_arg(&args, "--relay") {
        Some(url) => {
            tracing::info!(%url, "using relay");
            play(RelayConnector::new(url), config, room, stake).await
        }
        None => play(MemoryNetwork::new(), config, room, stake).await,
    }
}

async fn play<F>(factory: F, config: MatchConfig, room: RoomCode, stake: f64) -> anyhow::Result<()>
where
    F: TransportFactory + Clone,
{
    let ledger = EscrowLedger::new().with_latency(Duration::from_millis(150));
    let mut host = MatchOrchestrator::new(config.clone(), factory.clone(), ledger.client("DemoHostWallet".parse()?));
    let mut joiner = MatchOrchestrator::new(config, factory, ledger.client("DemoJoinerWallet".parse()?));
    host.set_balance(Some(1.0));
    joiner.set_balance(Some(1.0));

    host.begin_staking()?;
    host.host_match(room.clone(), stake)?;
    drive(&mut host, &mut joiner, |h, _| h.phase() == Phase::WaitingForPeer).await?;

    joiner.begin_staking()?;
    joiner.join_match(room.clone())?;
    drive(&mut host, &mut joiner, |_, j| j.offer().is_some()).await?;
    if let Some(offer) = joiner.offer() {
        tracing::info!(
            "Joiner sees {} SOL on match {} from {}",
            offer.stake_amount_sol,
            offer.match_id,
            offer.host_address
        );
    }
    joiner.accept_terms()?;
    drive(&mut host, &mut joiner, |h, j| h.phase() == Phase::InGame && j.phase() == Phase::InGame).await?;

    for (from, to) in SCRIPT {
        let mover = if host.session().is_some_and(|s| s.is_local_turn()) {
            &mut host
        } else {
            &mut joiner
        };
        let plies = mover.session().map_or(0, |s| s.history().len()) + 1;
        mover.local_move(from.parse::<Square>()?, to.parse::<Square>()?, None)?;
        drive(&mut host, &mut joiner, |h, j| {
            [h, j]
                .iter()
                .all(|o| o.session().is_some_and(|s| s.history().len() == plies))
        })
        .await?;
        tracing::info!(%from, %to, "played");
    }
    drive(&mut host, &mut joiner, |h, j| h.phase() == Phase::Settlement && j.phase() == Phase::Settlement).await?;

    for (name, side) in [("host", &host), ("joiner", &joiner)] {
        if let Some(settlement) = side.settlement() {
            tracing::info!(side = name, outcome = %settlement.outcome, result = ?settlement.result, "settled");
        }
    }

    let winner = if joiner.settlement().is_some_and(|s| s.claim == ClaimState::NotStarted) {
        &mut joiner
    } else {
        &mut host
    };
    winner.claim_reward()?;
    drive(&mut host, &mut joiner, |h, j| {
        [h, j]
            .iter()
            .any(|o| matches!(o.settlement().map(|s| &s.claim), Some(ClaimState::Claimed { .. } | ClaimState::Failed { .. })))
    })
    .await?;

    for event in host.drain_events().into_iter().chain(joiner.drain_events()) {
        if let OrchestratorEvent::Claim(ClaimState::Claimed { signature }) = event {
            tracing::info!(%signature, "reward claimed");
        }
    }
    if let Some(info) = ledger.info(&room) {
        tracing::info!(%room, status = ?info.status, "escrow final state");
    }
    Ok(())
}

type Demo<F> = MatchOrchestrator<F, InMemoryEscrow>;

async fn step_or_park<F: TransportFactory>(o: &mut Demo<F>) {
    if !o.step().await {
        std::future::pending::<()>().await;
    }
}

async fn drive<F: TransportFactory>(
    host: &mut Demo<F>,
    joiner: &mut Demo<F>,
    mut done: impl FnMut(&Demo<F>, &Demo<F>) -> bool,
) -> anyhow::Result<()> {
    let run = async {
        while !done(&*host, &*joiner) {
            for event in host.drain_events() {
                report("host", event);
            }
            for event in joiner.drain_events() {
                report("joiner", event);
            }
            tokio::select! {
                () = step_or_park(host) => {}
                () = step_or_park(joiner) => {}
                () = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), run).await.is_err() {
        bail!("match stalled");
    }
    Ok(())
}

fn report(who: &str, event: OrchestratorEvent) {
    match event {
        OrchestratorEvent::PhaseChanged { from, to } => tracing::info!(who, %from, %to, "phase changed"),
        OrchestratorEvent::Error(e) => tracing::warn!(who, error = %e, "match error"),
        OrchestratorEvent::GameOver(outcome) => tracing::info!(who, %outcome, "game over"),
        other => tracing::debug!(who, event = ?other, "orchestrator event"),
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
