//! UCT Monte Carlo tree search.
//!
//! The tree is an arena of nodes addressed by index. Each iteration
//! selects by UCT down to a frontier node, expands at most one child,
//! values it with the configured rollout policy and backs the value up
//! with sign flips per player alternation.
//!
//! Tree nodes stop at round boundaries: a child whose move drafts the
//! round out holds the resolved (wall-tiled, pre-deal) state and stays a
//! leaf, because the next factory deal is stochastic. Random playouts
//! carry on through fresh deals using the search RNG.

use std::time::{Duration, Instant};

use azul_core::{GameState, Move, PlayerIdx};
use rand::Rng;
use tracing::trace;

use crate::eval::{HeuristicEvaluator, ScoreProvider};
use crate::{validate_root, RolloutPolicy, SearchConfig, SearchError};

/// Score differential that saturates the normalized value at +/-1.
const VALUE_SCALE: f32 = 50.0;
/// Random playouts stop after this many moves and fall back to the
/// heuristic. Real games end well before this.
const ROLLOUT_HORIZON: u32 = 512;
/// Deadline granularity inside a playout, in moves.
const ROLLOUT_CHECK_MASK: u32 = 31;

/// Result of one MCTS run.
#[derive(Clone, Debug)]
pub struct MctsOutcome {
    pub best_move: Move,
    /// Mean root value in [-1, 1] from the searched player's view.
    pub value: f32,
    /// Iterations actually completed (may fall short of the budget when a
    /// deadline intervenes).
    pub rollouts: u32,
    pub elapsed: Duration,
    /// Visit count per explored root move.
    pub distribution: Vec<(Move, u32)>,
}

struct Node {
    state: GameState,
    mv: Option<Move>,
    parent: Option<u32>,
    /// Player whose perspective `value_sum` accumulates from: the player
    /// to move, or the notional next player at a round boundary.
    perspective: PlayerIdx,
    /// Exact normalized result when this node ends the game.
    terminal_value: Option<f32>,
    untried: Vec<Move>,
    children: Vec<u32>,
    visits: u32,
    value_sum: f64,
}

/// UCT searcher for 2-player states. Stateless between searches apart
/// from the heuristic weights; every search builds its own tree.
#[derive(Default)]
pub struct MctsEngine {
    heuristic: HeuristicEvaluator,
}

impl MctsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heuristic(heuristic: HeuristicEvaluator) -> Self {
        Self { heuristic }
    }

    /// Runs up to `config.max_rollouts` iterations within the optional
    /// time budget. Zero completed iterations still yields a legal move.
    pub fn search<R: Rng + ?Sized>(
        &self,
        root: &GameState,
        player: PlayerIdx,
        config: &SearchConfig,
        rng: &mut R,
    ) -> Result<MctsOutcome, SearchError> {
        validate_root(root, player)?;
        let root_moves = root.generate_moves(player);
        if root_moves.is_empty() {
            return Err(SearchError::NoLegalMoves);
        }
        let start = Instant::now();
        let deadline = config.max_time.map(|limit| start + limit);

        let mut tree = vec![Node {
            state: root.clone(),
            mv: None,
            parent: None,
            perspective: player,
            terminal_value: None,
            untried: root_moves.clone(),
            children: Vec::new(),
            visits: 0,
            value_sum: 0.0,
        }];
        let mut rollouts = 0u32;
        for _ in 0..config.max_rollouts {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }

            let mut idx = 0usize;
            while tree[idx].untried.is_empty() && !tree[idx].children.is_empty() {
                idx = select_child(&tree, idx, config.exploration_constant);
            }

            if let Some(mv) = tree[idx].untried.pop() {
                let mover = tree[idx].perspective;
                let mut state = tree[idx].state.clone();
                state.apply_move_mut(mv, mover)?;
                let (perspective, untried, terminal_value) = if state.is_round_over() {
                    state.score_round();
                    let next = 1 - mover;
                    if state.is_game_over() {
                        state.score_final();
                        (next, Vec::new(), Some(normalized_result(&state, next)))
                    } else {
                        (next, Vec::new(), None)
                    }
                } else {
                    let next = state.current_player;
                    let untried = state.generate_moves(next);
                    (next, untried, None)
                };
                let child = tree.len() as u32;
                tree.push(Node {
                    state,
                    mv: Some(mv),
                    parent: Some(idx as u32),
                    perspective,
                    terminal_value,
                    untried,
                    children: Vec::new(),
                    visits: 0,
                    value_sum: 0.0,
                });
                tree[idx].children.push(child);
                idx = child as usize;
            }

            let value = self.simulate(&tree[idx], &config.rollout_policy, deadline, rng)?;
            let perspective = tree[idx].perspective;
            backpropagate(&mut tree, idx, perspective, value);
            rollouts += 1;
            trace!(rollouts, value, "rollout complete");
        }

        let root_node = &tree[0];
        let mut distribution = Vec::with_capacity(root_node.children.len());
        let mut best: Option<(Move, u32, f32)> = None;
        for &child in &root_node.children {
            let node = &tree[child as usize];
            let Some(mv) = node.mv else { continue };
            let mean = if node.visits == 0 {
                0.0
            } else {
                -(node.value_sum as f32) / node.visits as f32
            };
            distribution.push((mv, node.visits));
            let better = match best {
                None => true,
                Some((_, visits, value)) => {
                    node.visits > visits || (node.visits == visits && mean > value)
                }
            };
            if better {
                best = Some((mv, node.visits, mean));
            }
        }
        let best_move = best.map(|(mv, _, _)| mv).unwrap_or(root_moves[0]);
        let value = if root_node.visits == 0 {
            0.0
        } else {
            (root_node.value_sum / root_node.visits as f64) as f32
        };
        Ok(MctsOutcome {
            best_move,
            value,
            rollouts,
            elapsed: start.elapsed(),
            distribution,
        })
    }

    /// Value of `node` from its own perspective, in [-1, 1].
    fn simulate<R: Rng + ?Sized>(
        &self,
        node: &Node,
        policy: &RolloutPolicy,
        deadline: Option<Instant>,
        rng: &mut R,
    ) -> Result<f32, SearchError> {
        if let Some(value) = node.terminal_value {
            return Ok(value);
        }
        let perspective = node.perspective;
        match policy {
            RolloutPolicy::Heuristic => {
                Ok(normalize(self.heuristic.evaluate(&node.state, perspective)?))
            }
            RolloutPolicy::External(provider) => {
                Ok(provider.evaluate(&node.state, perspective)?.clamp(-1.0, 1.0))
            }
            RolloutPolicy::Random => {
                let mut state = node.state.clone();
                let mut played = 0u32;
                let value = loop {
                    if state.is_game_over() {
                        state.score_final();
                        break normalized_result(&state, perspective);
                    }
                    if state.is_round_over() {
                        // Idempotent on the already-resolved boundary
                        // state this playout may have started from.
                        state.score_round();
                        if state.is_game_over() {
                            continue;
                        }
                        state.start_round(rng);
                        continue;
                    }
                    if played >= ROLLOUT_HORIZON
                        || (played & ROLLOUT_CHECK_MASK == 0
                            && deadline.is_some_and(|d| Instant::now() >= d))
                    {
                        break normalize(self.heuristic.evaluate(&state, perspective)?);
                    }
                    let moves = state.generate_moves(state.current_player);
                    if moves.is_empty() {
                        break normalize(self.heuristic.evaluate(&state, perspective)?);
                    }
                    let mv = moves[rng.random_range(0..moves.len())];
                    state.apply_move_mut(mv, state.current_player)?;
                    played += 1;
                };
                Ok(value)
            }
        }
    }
}

fn select_child(tree: &[Node], idx: usize, c: f32) -> usize {
    let ln_n = (tree[idx].visits.max(1) as f32).ln();
    let mut best = idx;
    let mut best_uct = f32::NEG_INFINITY;
    for &child in &tree[idx].children {
        let node = &tree[child as usize];
        let n = node.visits.max(1) as f32;
        // The child's mean is from the opponent's perspective; negate it.
        let exploit = -(node.value_sum as f32) / n;
        let uct = exploit + c * (ln_n / n).sqrt();
        if uct > best_uct {
            best_uct = uct;
            best = child as usize;
        }
    }
    best
}

fn backpropagate(tree: &mut [Node], leaf: usize, perspective: PlayerIdx, value: f32) {
    let mut cursor = Some(leaf as u32);
    while let Some(idx) = cursor {
        let node = &mut tree[idx as usize];
        node.visits += 1;
        let signed = if node.perspective == perspective { value } else { -value };
        node.value_sum += signed as f64;
        cursor = node.parent;
    }
}

/// Final-score differential for `player`, normalized and clamped.
fn normalized_result(state: &GameState, player: PlayerIdx) -> f32 {
    let own = state.players[player as usize].score as f32;
    let opp = state.players[(1 - player) as usize].score as f32;
    normalize(own - opp)
}

fn normalize(value: f32) -> f32 {
    (value / VALUE_SCALE).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EvalError;
    use azul_core::{Color, Destination, DraftSource, OverflowPolicy, TILE_COLORS, WALL_COL};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fresh2(seed: u64) -> GameState {
        let mut rng = StdRng::seed_from_u64(seed);
        GameState::new_game(2, 0, OverflowPolicy::default(), &mut rng).unwrap()
    }

    fn bare2() -> GameState {
        let mut state = fresh2(0);
        for f in 0..state.num_factories as usize {
            for c in 0..TILE_COLORS {
                state.supply.bag[c] += state.factories[f].counts[c];
                state.factories[f].counts[c] = 0;
            }
        }
        state.center.has_marker = false;
        state.rehash();
        state
    }

    /// Player 0 wins on the spot by completing wall row 0 with the lone
    /// blue tile.
    fn winning_completion_state() -> GameState {
        let mut state = bare2();
        for color in [Color::Yellow, Color::Red, Color::Black, Color::Teal] {
            state.supply.bag[color as usize] -= 1;
            state.players[0].wall[0][WALL_COL[0][color as usize]] = true;
        }
        state.supply.bag[Color::Blue as usize] -= 1;
        state.factories[0].counts[Color::Blue as usize] = 1;
        state.rehash();
        state
    }

    #[test]
    fn zero_rollout_budget_still_moves() {
        let state = fresh2(3);
        let config = SearchConfig::for_testing().with_max_rollouts(0);
        let mut rng = StdRng::seed_from_u64(0);
        let outcome = MctsEngine::new().search(&state, 0, &config, &mut rng).unwrap();
        assert_eq!(outcome.rollouts, 0);
        assert!(outcome.distribution.is_empty());
        assert!(state.generate_moves(0).contains(&outcome.best_move));
    }

    #[test]
    fn visit_distribution_accounts_for_every_rollout() {
        let state = fresh2(4);
        let config = SearchConfig::for_testing().with_max_rollouts(128);
        let mut rng = StdRng::seed_from_u64(9);
        let outcome = MctsEngine::new().search(&state, 0, &config, &mut rng).unwrap();
        assert_eq!(outcome.rollouts, 128);
        let visits: u32 = outcome.distribution.iter().map(|(_, n)| n).sum();
        assert_eq!(visits, 128, "every rollout passes through one root child");
        assert!((-1.0..=1.0).contains(&outcome.value));
        assert!(state.generate_moves(0).contains(&outcome.best_move));
    }

    #[test]
    fn search_is_deterministic_per_seed() {
        let state = fresh2(5);
        let config = SearchConfig::for_testing().with_max_rollouts(64);
        let engine = MctsEngine::new();
        let mut rng_a = StdRng::seed_from_u64(11);
        let mut rng_b = StdRng::seed_from_u64(11);
        let a = engine.search(&state, 0, &config, &mut rng_a).unwrap();
        let b = engine.search(&state, 0, &config, &mut rng_b).unwrap();
        assert_eq!(a.best_move, b.best_move);
        assert_eq!(a.value, b.value);
        assert_eq!(a.distribution, b.distribution);
    }

    #[test]
    fn finds_the_winning_completion() {
        let state = winning_completion_state();
        let config = SearchConfig::for_testing()
            .with_max_rollouts(256)
            .with_rollout_policy(RolloutPolicy::Heuristic);
        let mut rng = StdRng::seed_from_u64(2);
        let outcome = MctsEngine::new().search(&state, 0, &config, &mut rng).unwrap();
        assert_eq!(outcome.best_move.source, DraftSource::Factory(0));
        assert_eq!(outcome.best_move.dest, Destination::Line(0));
        assert!(outcome.value > 0.0);
    }

    #[test]
    fn expired_deadline_still_moves() {
        let state = fresh2(6);
        let config = SearchConfig::default()
            .with_max_rollouts(10_000)
            .with_max_time(Duration::ZERO);
        let mut rng = StdRng::seed_from_u64(0);
        let outcome = MctsEngine::new().search(&state, 0, &config, &mut rng).unwrap();
        assert_eq!(outcome.rollouts, 0);
        assert!(state.generate_moves(0).contains(&outcome.best_move));
    }

    struct FailingProvider;

    impl ScoreProvider for FailingProvider {
        fn evaluate(&self, _: &GameState, _: PlayerIdx) -> Result<f32, EvalError> {
            Err(EvalError::Provider("connection reset".into()))
        }
    }

    #[test]
    fn external_provider_failure_aborts_the_search() {
        let state = fresh2(7);
        let config = SearchConfig::for_testing()
            .with_rollout_policy(RolloutPolicy::External(Arc::new(FailingProvider)));
        let mut rng = StdRng::seed_from_u64(0);
        let result = MctsEngine::new().search(&state, 0, &config, &mut rng);
        assert!(matches!(result, Err(SearchError::Evaluation(_))));
    }

    struct CountingProvider(AtomicU32);

    impl ScoreProvider for CountingProvider {
        fn evaluate(&self, _: &GameState, _: PlayerIdx) -> Result<f32, EvalError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(0.0)
        }
    }

    #[test]
    fn external_provider_is_consulted_per_rollout() {
        let state = fresh2(8);
        let provider = Arc::new(CountingProvider(AtomicU32::new(0)));
        let config = SearchConfig::for_testing()
            .with_max_rollouts(32)
            .with_rollout_policy(RolloutPolicy::External(provider.clone()));
        let mut rng = StdRng::seed_from_u64(0);
        let outcome = MctsEngine::new().search(&state, 0, &config, &mut rng).unwrap();
        assert_eq!(outcome.rollouts, 32);
        assert_eq!(provider.0.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn rejects_illegal_roots() {
        let config = SearchConfig::for_testing();
        let mut rng = StdRng::seed_from_u64(0);
        let engine = MctsEngine::new();

        let state = fresh2(9);
        assert!(matches!(
            engine.search(&state, 1, &config, &mut rng),
            Err(SearchError::NotPlayersTurn { player: 1, current: 0 })
        ));

        let mut three_rng = StdRng::seed_from_u64(1);
        let three = GameState::new_game(3, 0, OverflowPolicy::default(), &mut three_rng).unwrap();
        assert!(matches!(
            engine.search(&three, 0, &config, &mut rng),
            Err(SearchError::UnsupportedPlayerCount(3))
        ));
    }
}
