//! Two peers playing staked matches over the in-memory network.

use pokechess_core::{Color, MatchError, MatchStatus, PeerIdentity, PieceKind, PromotionPiece, RoomCode, Square};
use pokechess_session::{
    ClaimState, EndReason, EscrowLedger, GameOutcome, InMemoryEscrow, LocalMove, MatchConfig, MatchOrchestrator,
    MatchResult, MemoryNetwork, OrchestratorEvent, Phase,
};
use std::time::Duration;

type Orchestrator = MatchOrchestrator<MemoryNetwork, InMemoryEscrow>;

struct Table {
    net: MemoryNetwork,
    ledger: EscrowLedger,
    host: Orchestrator,
    joiner: Orchestrator,
}

impl Table {
    fn new() -> Self {
        let net = MemoryNetwork::new();
        let ledger = EscrowLedger::new();
        let host = MatchOrchestrator::new(
            MatchConfig::default(),
            net.clone(),
            ledger.client("HostWallet1111".parse().unwrap()),
        );
        let joiner = MatchOrchestrator::new(
            MatchConfig::default(),
            net.clone(),
            ledger.client("JoinerWallet2222".parse().unwrap()),
        );
        Self {
            net,
            ledger,
            host,
            joiner,
        }
    }

    /// Step both sides until `done` holds.
    async fn drive(&mut self, mut done: impl FnMut(&Orchestrator, &Orchestrator) -> bool) {
        let host = &mut self.host;
        let joiner = &mut self.joiner;
        let run = async {
            while !done(&*host, &*joiner) {
                tokio::select! {
                    () = step_or_park(host) => {}
                    () = step_or_park(joiner) => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(3600), run)
            .await
            .expect("scenario stalled");
    }

    async fn host_waiting(&mut self, stake: f64) {
        self.host.begin_staking().unwrap();
        self.host.host_match(room(), stake).unwrap();
        self.drive(|h, _| h.phase() == Phase::WaitingForPeer).await;
    }

    async fn start(&mut self) {
        self.host_waiting(0.1).await;
        self.joiner.begin_staking().unwrap();
        self.joiner.join_match(room()).unwrap();
        self.drive(|_, j| j.offer().is_some()).await;
        self.joiner.accept_terms().unwrap();
        self.drive(|h, j| h.phase() == Phase::InGame && j.phase() == Phase::InGame)
            .await;
    }

    /// Play a move for the side to move and wait for the other side to see it.
    async fn play(&mut self, from: &str, to: &str) {
        let host_to_move = self.host.session().unwrap().is_local_turn();
        let mover = if host_to_move { &mut self.host } else { &mut self.joiner };
        let plies = mover.session().unwrap().history().len() + 1;
        let played = mover.local_move(sq(from), sq(to), None).unwrap();
        assert!(matches!(played, LocalMove::Applied(_)), "{from}{to} not applied");
        self.drive(|h, j| {
            h.session().unwrap().history().len() == plies && j.session().unwrap().history().len() == plies
        })
        .await;
    }
}

async fn step_or_park(o: &mut Orchestrator) {
    if !o.step().await {
        std::future::pending::<()>().await;
    }
}

fn room() -> RoomCode {
    "ABC123".parse().unwrap()
}

fn sq(s: &str) -> Square {
    s.parse().unwrap()
}

fn result(o: &Orchestrator) -> Option<MatchResult> {
    o.settlement().and_then(|s| s.result)
}

fn claim(o: &Orchestrator) -> ClaimState {
    o.settlement().map(|s| s.claim.clone()).unwrap_or(ClaimState::Unavailable)
}

#[tokio::test(start_paused = true)]
async fn staked_match_from_deposit_to_claim() {
    let mut t = Table::new();
    t.host.set_balance(Some(1.0));
    t.host_waiting(0.1).await;

    let events = t.host.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::HostListening { peer_id, .. } if *peer_id == PeerIdentity::host("pkchess", &room())
    )));
    assert_eq!(t.ledger.info(&room()).unwrap().status, MatchStatus::Waiting);

    t.joiner.begin_staking().unwrap();
    t.joiner.join_match(room()).unwrap();
    t.drive(|_, j| j.offer().is_some()).await;
    let offer = t.joiner.offer().unwrap().clone();
    assert_eq!(offer.match_id, room());
    assert_eq!(offer.stake_amount_sol, 0.1);
    assert_eq!(t.joiner.phase(), Phase::StakingSetup);

    t.joiner.accept_terms().unwrap();
    t.drive(|h, j| h.phase() == Phase::InGame && j.phase() == Phase::InGame)
        .await;
    assert_eq!(t.host.session().unwrap().local_color(), Some(Color::White));
    assert_eq!(t.joiner.session().unwrap().local_color(), Some(Color::Black));
    let on_chain = t.ledger.info(&room()).unwrap();
    assert_eq!(on_chain.status, MatchStatus::Active);
    assert!((on_chain.total_pot - 0.2).abs() < 1e-9);

    // Fool's mate, black to win.
    t.play("f2", "f3").await;
    t.play("e7", "e5").await;
    t.play("g2", "g4").await;
    t.play("d8", "h4").await;
    t.drive(|h, j| h.phase() == Phase::Settlement && j.phase() == Phase::Settlement)
        .await;

    let mate = GameOutcome::win(Color::Black, EndReason::Checkmate);
    assert_eq!(t.host.settlement().unwrap().outcome, mate);
    assert_eq!(t.joiner.settlement().unwrap().outcome, mate);
    assert_eq!(result(&t.host), Some(MatchResult::Loss));
    assert_eq!(result(&t.joiner), Some(MatchResult::Win));
    assert_eq!(claim(&t.host), ClaimState::Unavailable);
    let reward = t.joiner.settlement().unwrap().reward.unwrap();
    assert_eq!(reward.winner_reward_lamports, 195_000_000);

    t.joiner.claim_reward().unwrap();
    t.drive(|_, j| matches!(claim(j), ClaimState::Claimed { .. }))
        .await;
    assert!(t.ledger.reward_claimed(&room()));
    assert_eq!(t.ledger.info(&room()).unwrap().status, MatchStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn moves_stay_in_sync_through_promotion() {
    let mut t = Table::new();
    t.start().await;

    for (from, to) in [
        ("e2", "e4"),
        ("d7", "d5"),
        ("e4", "d5"),
        ("c7", "c6"),
        ("d5", "c6"),
        ("g8", "f6"),
        ("c6", "b7"),
        ("b8", "d7"),
    ] {
        t.play(from, to).await;
    }

    let pending = t.host.local_move(sq("b7"), sq("a8"), None).unwrap();
    assert_eq!(
        pending,
        LocalMove::PromotionRequired {
            from: sq("b7"),
            to: sq("a8")
        }
    );
    t.host
        .local_move(sq("b7"), sq("a8"), Some(PromotionPiece::Queen))
        .unwrap();
    t.drive(|_, j| j.session().unwrap().history().len() == 9).await;

    let seen = t.joiner.drain_events();
    let last = seen
        .iter()
        .rev()
        .find_map(|e| match e {
            OrchestratorEvent::OpponentMoved(record) => Some(record.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last.promotion, Some(PromotionPiece::Queen));
    assert_eq!(last.captured, Some(PieceKind::Rook));
    assert_eq!(t.host.session().unwrap().fen(), t.joiner.session().unwrap().fen());
    let queen = t.joiner.session().unwrap().piece_at(sq("a8")).unwrap();
    assert_eq!((queen.kind, queen.color), (PieceKind::Queen, Color::White));
}

#[tokio::test(start_paused = true)]
async fn joiner_vanishing_hands_the_host_the_win() {
    let mut t = Table::new();
    t.start().await;
    t.play("e2", "e4").await;

    let joiner_id = t.joiner.local_peer_id().unwrap().clone();
    t.net.vanish(&joiner_id);
    t.drive(|h, _| h.phase() == Phase::Settlement).await;

    let settlement = t.host.settlement().unwrap();
    assert_eq!(
        settlement.outcome,
        GameOutcome::win(Color::White, EndReason::OpponentDisconnected)
    );
    assert_eq!(settlement.result, Some(MatchResult::Win));
    assert_eq!(settlement.claim, ClaimState::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn host_vanishing_hands_the_joiner_the_win() {
    let mut t = Table::new();
    t.start().await;

    let host_id = t.host.local_peer_id().unwrap().clone();
    t.net.vanish(&host_id);
    t.drive(|_, j| j.phase() == Phase::Settlement).await;

    assert_eq!(
        t.joiner.settlement().unwrap().outcome,
        GameOutcome::win(Color::Black, EndReason::OpponentDisconnected)
    );
    assert_eq!(result(&t.joiner), Some(MatchResult::Win));
}

#[tokio::test(start_paused = true)]
async fn running_out_of_strikes_forfeits() {
    let mut t = Table::new();
    t.start().await;

    t.drive(|h, j| h.phase() == Phase::Settlement && j.phase() == Phase::Settlement)
        .await;

    assert_eq!(
        t.host.settlement().unwrap().outcome,
        GameOutcome::win(Color::Black, EndReason::TimeExpired)
    );
    // Both sides agree on why the match ended.
    assert_eq!(
        t.joiner.settlement().unwrap().outcome,
        GameOutcome::win(Color::Black, EndReason::TimeExpired)
    );
    let strikes: Vec<u32> = t
        .host
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::Strike { color: Color::White, strikes } => Some(strikes),
            _ => None,
        })
        .collect();
    assert_eq!(strikes, vec![1, 2]);
    assert_eq!(t.host.clock_state().unwrap().strikes_white, 3);
}

#[tokio::test(start_paused = true)]
async fn resignation_reaches_the_opponent() {
    let mut t = Table::new();
    t.start().await;
    t.play("d2", "d4").await;

    t.joiner.resign().unwrap();
    t.drive(|h, _| h.phase() == Phase::Settlement).await;
    assert_eq!(
        t.host.settlement().unwrap().outcome,
        GameOutcome::win(Color::White, EndReason::OpponentResigned)
    );
    assert_eq!(
        t.joiner.settlement().unwrap().outcome,
        GameOutcome::win(Color::White, EndReason::Resigned)
    );
}

#[tokio::test(start_paused = true)]
async fn wallet_loss_mid_match_forfeits() {
    let mut t = Table::new();
    t.start().await;

    t.host.wallet_disconnected();
    assert_eq!(t.host.phase(), Phase::Settlement);
    assert_eq!(
        t.host.settlement().unwrap().outcome,
        GameOutcome::win(Color::Black, EndReason::WalletDisconnected)
    );
    t.drive(|_, j| j.phase() == Phase::Settlement).await;
    assert_eq!(result(&t.joiner), Some(MatchResult::Win));
    assert_eq!(
        t.joiner.settlement().unwrap().outcome,
        GameOutcome::win(Color::Black, EndReason::WalletDisconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_room_reports_match_not_found() {
    let mut t = Table::new();
    t.joiner.begin_staking().unwrap();
    t.joiner.join_match("ZZZZ".parse().unwrap()).unwrap();
    t.drive(|_, j| j.room().is_none()).await;

    assert_eq!(t.joiner.phase(), Phase::StakingSetup);
    assert!(
        t.joiner
            .drain_events()
            .contains(&OrchestratorEvent::Error(MatchError::MatchNotFound))
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_host_times_out_and_is_refunded() {
    let mut t = Table::new();
    t.host_waiting(0.1).await;

    t.drive(|h, _| h.phase() == Phase::StakingSetup && !h.escrow_pending())
        .await;
    let events = t.host.drain_events();
    assert!(events.contains(&OrchestratorEvent::Error(MatchError::HandshakeTimeout)));
    assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::Refunded { .. })));
    assert_eq!(t.ledger.info(&room()).unwrap().status, MatchStatus::Cancelled);
    assert!(!t.net.is_registered(&PeerIdentity::host("pkchess", &room())));
}

#[tokio::test(start_paused = true)]
async fn cancelling_while_waiting_returns_the_deposit() {
    let mut t = Table::new();
    t.host_waiting(0.25).await;

    t.host.cancel().unwrap();
    assert_eq!(t.host.phase(), Phase::Landing);
    t.drive(|h, _| !h.escrow_pending()).await;
    assert_eq!(t.ledger.info(&room()).unwrap().status, MatchStatus::Cancelled);

    // The room is free again.
    t.host.begin_staking().unwrap();
    t.host.host_match("XYZ789".parse().unwrap(), 0.1).unwrap();
    t.drive(|h, _| h.phase() == Phase::WaitingForPeer).await;
}

#[tokio::test(start_paused = true)]
async fn rejected_deposit_leaves_terms_open() {
    let mut t = Table::new();
    t.host_waiting(0.1).await;
    t.joiner.begin_staking().unwrap();
    t.joiner.join_match(room()).unwrap();
    t.drive(|_, j| j.offer().is_some()).await;

    t.ledger.reject_next("User rejected the request");
    t.joiner.accept_terms().unwrap();
    t.drive(|_, j| !j.escrow_pending()).await;
    assert_eq!(t.joiner.phase(), Phase::StakingSetup);
    assert!(t.joiner.drain_events().iter().any(|e| matches!(
        e,
        OrchestratorEvent::Error(MatchError::EscrowCallFailed(msg)) if msg.contains("User rejected")
    )));

    t.joiner.accept_terms().unwrap();
    t.drive(|h, j| h.phase() == Phase::InGame && j.phase() == Phase::InGame)
        .await;
}

#[tokio::test(start_paused = true)]
async fn exit_after_settlement_returns_to_landing() {
    let mut t = Table::new();
    t.start().await;
    t.host.resign().unwrap();
    t.drive(|_, j| j.phase() == Phase::Settlement).await;

    t.host.exit().unwrap();
    t.joiner.exit().unwrap();
    assert_eq!(t.host.phase(), Phase::Landing);
    assert!(t.host.session().is_none());
    assert!(t.host.settlement().is_none());
    assert!(!t.host.step().await);
    assert!(!t.net.is_registered(&PeerIdentity::host("pkchess", &room())));
}

#[tokio::test(start_paused = true)]
async fn leaving_mid_match_resigns() {
    let mut t = Table::new();
    t.start().await;
    t.play("e2", "e4").await;

    t.joiner.exit().unwrap();
    assert_eq!(t.joiner.phase(), Phase::Landing);
    t.drive(|h, _| h.phase() == Phase::Settlement).await;
    assert_eq!(
        t.host.settlement().unwrap().outcome,
        GameOutcome::win(Color::White, EndReason::OpponentResigned)
    );
    assert_eq!(claim(&t.host), ClaimState::NotStarted);
}
