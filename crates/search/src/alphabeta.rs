//! Iterative-deepening negamax with a transposition table.

use std::time::{Duration, Instant};

use azul_core::{Destination, DraftSource, GameState, Move, PlayerIdx, MOVE_INDEX_SPACE};
use tracing::debug;

use crate::eval::{HeuristicEvaluator, ScoreProvider};
use crate::tt::{Bound, TranspositionTable};
use crate::{validate_root, SearchConfig, SearchError};

const MAX_PLY: usize = 64;
/// Added to the exact final-score differential at proven ends of the game
/// so that a certain win outranks any heuristic estimate.
const WIN_BONUS: f32 = 1_000.0;
/// The deadline is consulted once per this many nodes.
const TIME_CHECK_MASK: u64 = 1023;

const TIER_TT: i64 = 1 << 40;
const TIER_WALL_COMPLETING: i64 = 1 << 36;
const TIER_FLOOR_FREE: i64 = 1 << 32;
/// History scores are clamped so that shifted by the killer bits they
/// stay strictly below [`TIER_FLOOR_FREE`].
const HISTORY_CLAMP: i64 = (1 << 29) - 1;

/// Result of one search: the move to play plus everything needed to
/// report or continue the analysis.
#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub best_move: Move,
    /// Negamax score from the searched player's perspective. Proven game
    /// ends score as the exact final differential plus a win bonus.
    pub score: f32,
    /// Deepest fully completed iteration.
    pub depth: u8,
    pub principal_variation: Vec<Move>,
    pub nodes: u64,
    pub elapsed: Duration,
    /// True when the time budget expired before `max_depth` completed.
    /// The outcome still reflects the deepest completed iteration.
    pub timed_out: bool,
}

/// Iterative-deepening negamax searcher for 2-player states.
///
/// The transposition table, killer slots and history scores live in the
/// struct, so a searcher kept warm across moves of the same game reuses
/// earlier work. Each call to [`Self::search`] opens a new table
/// generation rather than clearing it.
pub struct AlphaBetaSearch<E = HeuristicEvaluator> {
    evaluator: E,
    tt: TranspositionTable,
    killers: [[Option<u16>; 2]; MAX_PLY],
    history: [[i32; MOVE_INDEX_SPACE]; 2],
    nodes: u64,
    deadline: Option<Instant>,
    stopped: bool,
}

impl<E: ScoreProvider> AlphaBetaSearch<E> {
    pub fn new(evaluator: E) -> Self {
        Self::with_tt_capacity(evaluator, 1 << 20)
    }

    pub fn with_tt_capacity(evaluator: E, tt_capacity: usize) -> Self {
        Self {
            evaluator,
            tt: TranspositionTable::with_capacity(tt_capacity),
            killers: [[None; 2]; MAX_PLY],
            history: [[0; MOVE_INDEX_SPACE]; 2],
            nodes: 0,
            deadline: None,
            stopped: false,
        }
    }

    /// Searches `root` for `player`, deepening from 1 to
    /// `config.max_depth` within the optional time budget. Always returns
    /// a legal move on a legal input; illegal inputs are rejected before
    /// any work happens.
    pub fn search(
        &mut self,
        root: &GameState,
        player: PlayerIdx,
        config: &SearchConfig,
    ) -> Result<SearchOutcome, SearchError> {
        validate_root(root, player)?;
        let root_moves = root.generate_moves(player);
        if root_moves.is_empty() {
            return Err(SearchError::NoLegalMoves);
        }

        let start = Instant::now();
        self.deadline = config.max_time.map(|limit| start + limit);
        self.stopped = false;
        self.nodes = 0;
        self.killers = [[None; 2]; MAX_PLY];
        self.history = [[0; MOVE_INDEX_SPACE]; 2];
        self.tt.new_search();

        let mut state = root.clone();
        let mut outcome: Option<SearchOutcome> = None;
        let mut timed_out = false;
        let max_depth = config.max_depth.clamp(1, MAX_PLY as u8);
        for depth in 1..=max_depth {
            let mut pv = Vec::new();
            let score = self.negamax(&mut state, depth, 0, f32::NEG_INFINITY, f32::INFINITY, &mut pv)?;
            if self.stopped {
                timed_out = true;
                break;
            }
            let best_move = pv.first().copied().unwrap_or(root_moves[0]);
            debug!(depth, score, nodes = self.nodes, "completed deepening iteration");
            outcome = Some(SearchOutcome {
                best_move,
                score,
                depth,
                principal_variation: pv,
                nodes: self.nodes,
                elapsed: start.elapsed(),
                timed_out: false,
            });
        }

        let mut outcome = match outcome {
            Some(outcome) => outcome,
            // The budget expired inside the first iteration; fall back to
            // a static evaluation so the caller still gets a legal move.
            None => SearchOutcome {
                best_move: root_moves[0],
                score: self.evaluator.evaluate(root, player)?,
                depth: 0,
                principal_variation: Vec::new(),
                nodes: self.nodes,
                elapsed: start.elapsed(),
                timed_out: true,
            },
        };
        outcome.timed_out = timed_out || outcome.depth == 0;
        outcome.nodes = self.nodes;
        outcome.elapsed = start.elapsed();
        Ok(outcome)
    }

    fn negamax(
        &mut self,
        state: &mut GameState,
        depth: u8,
        ply: usize,
        mut alpha: f32,
        beta: f32,
        pv: &mut Vec<Move>,
    ) -> Result<f32, SearchError> {
        self.nodes += 1;
        if self.nodes & TIME_CHECK_MASK == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    self.stopped = true;
                }
            }
        }
        if self.stopped {
            return Ok(0.0);
        }

        let me = state.current_player;
        if depth == 0 {
            return Ok(self.evaluator.evaluate(state, me)?);
        }

        let key = state.position_hash();
        let alpha_orig = alpha;
        if ply > 0 {
            if let Some(score) = self.tt.probe(key, depth, alpha, beta) {
                return Ok(score);
            }
        }

        let mut moves = state.generate_moves(me);
        if moves.is_empty() {
            return Ok(self.evaluator.evaluate(state, me)?);
        }
        self.order_moves(&mut moves, state, key, ply, me);

        let mut best_score = f32::NEG_INFINITY;
        let mut best_move = None;
        let mut child_pv = Vec::new();
        for mv in moves {
            let undo = state.apply_move_mut(mv, me)?;
            child_pv.clear();
            let score = if state.is_round_over() {
                // The horizon of deterministic play: resolve the round and
                // either read off the exact final result or evaluate.
                self.round_boundary_value(state, me)?
            } else {
                -self.negamax(state, depth - 1, ply + 1, -beta, -alpha, &mut child_pv)?
            };
            state.undo_move(&undo);
            if self.stopped {
                return Ok(0.0);
            }
            if score > best_score {
                best_score = score;
                best_move = Some(mv);
                if score > alpha {
                    alpha = score;
                    pv.clear();
                    pv.push(mv);
                    pv.extend_from_slice(&child_pv);
                }
            }
            if alpha >= beta {
                self.record_cutoff(mv, depth, ply, me);
                break;
            }
        }

        let bound = if best_score <= alpha_orig {
            Bound::Upper
        } else if best_score >= beta {
            Bound::Lower
        } else {
            Bound::Exact
        };
        self.tt.store(key, depth, best_score, bound, best_move);
        Ok(best_score)
    }

    /// Value, for `perspective`, of a position whose round has just been
    /// drafted out. Wall tiling is deterministic, so it is resolved here;
    /// the next factory deal is not, so play stops.
    fn round_boundary_value(
        &self,
        state: &GameState,
        perspective: PlayerIdx,
    ) -> Result<f32, SearchError> {
        let mut resolved = state.clone();
        resolved.score_round();
        if resolved.is_game_over() {
            resolved.score_final();
            let own = resolved.players[perspective as usize].score as f32;
            let opp = resolved.players[(1 - perspective) as usize].score as f32;
            let diff = own - opp;
            Ok(diff + WIN_BONUS * diff.signum())
        } else {
            Ok(self.evaluator.evaluate(&resolved, perspective)?)
        }
    }

    fn order_moves(&self, moves: &mut [Move], state: &GameState, key: u64, ply: usize, me: PlayerIdx) {
        let tt_move = self.tt.best_move(key);
        moves.sort_by_cached_key(|&mv| {
            std::cmp::Reverse(self.move_order_key(mv, state, tt_move, ply, me))
        });
    }

    /// Ordering tiers, highest first: the table move, moves that complete
    /// a pattern line this round, moves that send nothing to the floor,
    /// then history score with killer moves breaking ties.
    fn move_order_key(
        &self,
        mv: Move,
        state: &GameState,
        tt_move: Option<Move>,
        ply: usize,
        me: PlayerIdx,
    ) -> i64 {
        let mut key = 0i64;
        if tt_move == Some(mv) {
            key += TIER_TT;
        }
        if let Destination::Line(row) = mv.dest {
            let line = state.players[me as usize].lines[row as usize];
            if line.count + mv.to_line == azul_core::line_capacity(row as usize) {
                key += TIER_WALL_COMPLETING;
            }
        }
        let takes_marker = mv.source == DraftSource::Center && state.center.has_marker;
        if mv.to_floor == 0 && !takes_marker {
            key += TIER_FLOOR_FREE;
        }
        let compact = mv.compact();
        let history = self.history[me as usize][compact as usize] as i64;
        key += history.clamp(0, HISTORY_CLAMP) << 2;
        if ply < MAX_PLY {
            if self.killers[ply][0] == Some(compact) {
                key += 2;
            } else if self.killers[ply][1] == Some(compact) {
                key += 1;
            }
        }
        key
    }

    fn record_cutoff(&mut self, mv: Move, depth: u8, ply: usize, me: PlayerIdx) {
        let compact = mv.compact();
        let slot = &mut self.history[me as usize][compact as usize];
        *slot = slot.saturating_add(depth as i32 * depth as i32);
        if ply < MAX_PLY && self.killers[ply][0] != Some(compact) {
            self.killers[ply][1] = self.killers[ply][0];
            self.killers[ply][0] = Some(compact);
        }
    }

    /// Table hit rate since construction, for diagnostics.
    pub fn tt_hit_rate(&self) -> f64 {
        self.tt.hit_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use azul_core::{Color, OverflowPolicy, TILE_COLORS, WALL_COL};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fresh2(seed: u64) -> GameState {
        let mut rng = StdRng::seed_from_u64(seed);
        GameState::new_game(2, 0, OverflowPolicy::default(), &mut rng).unwrap()
    }

    /// 2-player state with all tiles in the bag, empty boards, no marker.
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

    fn put_factory(state: &mut GameState, f: usize, color: Color, n: u8) {
        state.supply.bag[color as usize] -= n;
        state.factories[f].counts[color as usize] += n;
        state.rehash();
    }

    fn put_wall(state: &mut GameState, player: PlayerIdx, row: usize, color: Color) {
        state.supply.bag[color as usize] -= 1;
        state.players[player as usize].wall[row][WALL_COL[row][color as usize]] = true;
        state.rehash();
    }

    fn engine() -> AlphaBetaSearch {
        AlphaBetaSearch::with_tt_capacity(HeuristicEvaluator::default(), 1 << 14)
    }

    /// Player 0 can win on the spot by drafting the single blue tile onto
    /// line 0, completing wall row 0 and ending the game.
    fn winning_completion_state() -> GameState {
        let mut state = bare2();
        for color in [Color::Yellow, Color::Red, Color::Black, Color::Teal] {
            put_wall(&mut state, 0, 0, color);
        }
        put_factory(&mut state, 0, Color::Blue, 1);
        state
    }

    #[test]
    fn rejects_illegal_roots() {
        let mut eng = engine();
        let config = SearchConfig::for_testing();

        let state = fresh2(1);
        assert!(matches!(
            eng.search(&state, 1, &config),
            Err(SearchError::NotPlayersTurn { player: 1, current: 0 })
        ));

        let mut rng = StdRng::seed_from_u64(2);
        let three = GameState::new_game(3, 0, OverflowPolicy::default(), &mut rng).unwrap();
        assert!(matches!(
            eng.search(&three, 0, &config),
            Err(SearchError::UnsupportedPlayerCount(3))
        ));

        let mut over = winning_completion_state();
        let mv = over.generate_moves(0)[0];
        over.apply_move_mut(mv, 0).unwrap();
        over.score_round();
        assert!(over.is_game_over());
        assert!(matches!(eng.search(&over, 0, &config), Err(SearchError::GameOver)));
    }

    #[test]
    fn finds_the_game_winning_completion() {
        let state = winning_completion_state();
        let mut eng = engine();
        for depth in [1u8, 3] {
            let config = SearchConfig::for_testing().with_max_depth(depth);
            let outcome = eng.search(&state, 0, &config).unwrap();
            assert_eq!(outcome.best_move.dest, Destination::Line(0), "depth {depth}");
            assert_eq!(outcome.best_move.color, Color::Blue);
            assert!(outcome.score > WIN_BONUS, "a certain win dominates");
            assert_eq!(outcome.depth, depth);
            assert!(!outcome.timed_out);
        }
    }

    #[test]
    fn deepening_never_scores_below_depth_one() {
        let state = winning_completion_state();
        let mut eng = engine();
        let shallow = eng
            .search(&state, 0, &SearchConfig::for_testing().with_max_depth(1))
            .unwrap();
        let mut eng = engine();
        let deep = eng
            .search(&state, 0, &SearchConfig::for_testing().with_max_depth(4))
            .unwrap();
        assert!(deep.score >= shallow.score);
        assert_eq!(deep.best_move, shallow.best_move);
    }

    #[test]
    fn search_is_deterministic() {
        let state = fresh2(77);
        let config = SearchConfig::for_testing();
        let a = engine().search(&state, 0, &config).unwrap();
        let b = engine().search(&state, 0, &config).unwrap();
        assert_eq!(a.best_move, b.best_move);
        assert_eq!(a.score, b.score);
        assert_eq!(a.nodes, b.nodes);
    }

    #[test]
    fn warm_table_agrees_and_does_not_search_more() {
        let state = fresh2(78);
        let config = SearchConfig::for_testing();
        let mut eng = engine();
        let cold = eng.search(&state, 0, &config).unwrap();
        let warm = eng.search(&state, 0, &config).unwrap();
        assert_eq!(cold.best_move, warm.best_move);
        assert_eq!(cold.score, warm.score);
        assert!(warm.nodes <= cold.nodes);
    }

    #[test]
    fn principal_variation_is_playable() {
        let state = fresh2(79);
        let mut eng = engine();
        let outcome = eng
            .search(&state, 0, &SearchConfig::for_testing())
            .unwrap();
        assert_eq!(outcome.principal_variation.first(), Some(&outcome.best_move));

        let mut replay = state.clone();
        for mv in &outcome.principal_variation {
            assert!(!replay.is_round_over(), "pv must stop at the round boundary");
            replay.apply_move_mut(*mv, replay.current_player).unwrap();
        }
    }

    #[test]
    fn expired_budget_still_returns_a_legal_move() {
        let state = fresh2(80);
        let mut eng = engine();
        let config = SearchConfig::default()
            .with_max_depth(12)
            .with_max_time(Duration::ZERO);
        let outcome = eng.search(&state, 0, &config).unwrap();
        assert!(outcome.timed_out);
        assert!(state.generate_moves(0).contains(&outcome.best_move));
    }

    #[test]
    fn ordering_tiers_rank_as_documented() {
        let mut state = bare2();
        put_factory(&mut state, 0, Color::Blue, 1);
        put_factory(&mut state, 1, Color::Red, 2);
        let mut eng = engine();

        let completing = Move {
            source: DraftSource::Factory(0),
            color: Color::Blue,
            dest: Destination::Line(0),
            to_line: 1,
            to_floor: 0,
        };
        let quiet = Move {
            source: DraftSource::Factory(1),
            color: Color::Red,
            dest: Destination::Line(3),
            to_line: 2,
            to_floor: 0,
        };
        let dumping = Move {
            source: DraftSource::Factory(1),
            color: Color::Red,
            dest: Destination::Floor,
            to_line: 0,
            to_floor: 2,
        };

        let key = |eng: &AlphaBetaSearch, mv, tt| eng.move_order_key(mv, &state, tt, 0, 0);

        // Tier order with no history and no killers.
        assert!(key(&eng, completing, None) > key(&eng, quiet, None));
        assert!(key(&eng, quiet, None) > key(&eng, dumping, None));

        // The table move outranks everything.
        assert!(key(&eng, dumping, Some(dumping)) > key(&eng, completing, None));

        // History outranks a killer of the same tier.
        eng.history[0][dumping.compact() as usize] = 500;
        eng.killers[0][0] = Some(quiet.compact());
        let dumping_with_history = key(&eng, dumping, None);
        let mut floorbound_killer = quiet;
        floorbound_killer.dest = Destination::Floor;
        floorbound_killer.to_line = 0;
        floorbound_killer.to_floor = 2;
        eng.killers[0][0] = Some(floorbound_killer.compact());
        assert!(dumping_with_history > key(&eng, floorbound_killer, None));

        // But history never lifts a move past the floor-free tier.
        eng.history[0][dumping.compact() as usize] = i32::MAX;
        assert!(key(&eng, quiet, None) > key(&eng, dumping, None));
    }
}
