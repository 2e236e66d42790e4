//! Position evaluation.

use azul_core::{
    line_capacity, score_placement, Color, GameState, PlayerIdx, BOARD_SIZE, WALL_COL,
};
use thiserror::Error;

/// Evaluation failure, surfaced unchanged through the search result.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("external evaluator failed: {0}")]
    Provider(String),
}

/// Scores a position from one player's point of view; higher is better.
///
/// This is the hook external evaluators (e.g. a neural policy/value net
/// service) plug into. Implementations must be deterministic for a given
/// state so that searches stay reproducible.
pub trait ScoreProvider: Send + Sync {
    fn evaluate(&self, state: &GameState, player: PlayerIdx) -> Result<f32, EvalError>;
}

/// Hand-tuned static evaluator.
///
/// Combines the realized score differential against the strongest opponent
/// with three forward-looking terms per board: pattern-line completion
/// potential (discounted when the remaining supply cannot finish the
/// line), the penalty the current floor will cost at round end, and wall
/// structure (adjacency plus progress toward row/column/color bonuses).
#[derive(Clone, Debug)]
pub struct HeuristicEvaluator {
    pub line_weight: f32,
    pub floor_weight: f32,
    pub adjacency_weight: f32,
    pub structure_weight: f32,
}

impl Default for HeuristicEvaluator {
    fn default() -> Self {
        Self {
            line_weight: 1.0,
            floor_weight: 1.0,
            adjacency_weight: 0.25,
            structure_weight: 0.5,
        }
    }
}

/// Discount applied to a line the supply can no longer complete.
const STARVED_LINE_FACTOR: f32 = 0.2;

impl HeuristicEvaluator {
    /// Tiles of `color` still obtainable by anyone: on factories, in the
    /// center, or cycling through the bag and lid.
    fn obtainable(state: &GameState, color: Color) -> u8 {
        let c = color as usize;
        let mut n = state.center.counts[c]
            + state.supply.bag[c]
            + state.supply.discard[c]
            + state.overflow_count(color);
        for factory in &state.factories[..state.num_factories as usize] {
            n += factory.counts[c];
        }
        n
    }

    fn board_value(&self, state: &GameState, player: PlayerIdx) -> f32 {
        let board = &state.players[player as usize];
        let mut value = board.score as f32;

        // Floor tiles are a liability until score_round collects.
        value += self.floor_weight * board.floor.penalty() as f32;

        for (row, line) in board.lines.iter().enumerate() {
            let Some(color) = line.color else { continue };
            let capacity = line_capacity(row);
            let col = WALL_COL[row][color as usize];
            // Points the finished line would score on today's wall.
            let mut wall = board.wall;
            wall[row][col] = true;
            let placement = score_placement(&wall, row, col) as f32;
            let progress = line.count as f32 / capacity as f32;
            let needed = capacity - line.count;
            let feasible = if Self::obtainable(state, color) >= needed {
                1.0
            } else {
                STARVED_LINE_FACTOR
            };
            value += self.line_weight * placement * progress * feasible;
        }

        let mut adjacency = 0u32;
        for row in 0..BOARD_SIZE {
            for col in 0..BOARD_SIZE {
                if !board.wall[row][col] {
                    continue;
                }
                if row > 0 && board.wall[row - 1][col] {
                    adjacency += 1;
                }
                if col > 0 && board.wall[row][col - 1] {
                    adjacency += 1;
                }
            }
        }
        value += self.adjacency_weight * adjacency as f32;

        // Quadratic progress toward the end-game bonuses: four tiles in a
        // row are worth far more than twice two.
        let mut structure = 0.0f32;
        for row in 0..BOARD_SIZE {
            let filled = (0..BOARD_SIZE).filter(|&col| board.wall[row][col]).count() as f32;
            structure += (filled / BOARD_SIZE as f32).powi(2) * 2.0;
        }
        for col in 0..BOARD_SIZE {
            let filled = (0..BOARD_SIZE).filter(|&row| board.wall[row][col]).count() as f32;
            structure += (filled / BOARD_SIZE as f32).powi(2) * 7.0;
        }
        for color in Color::ALL {
            let placed = (0..BOARD_SIZE)
                .filter(|&row| board.wall[row][WALL_COL[row][color as usize]])
                .count() as f32;
            structure += (placed / BOARD_SIZE as f32).powi(2) * 10.0;
        }
        value += self.structure_weight * structure;

        value
    }
}

impl ScoreProvider for HeuristicEvaluator {
    /// Board value differential against the strongest opponent; works for
    /// any player count the engine supports.
    fn evaluate(&self, state: &GameState, player: PlayerIdx) -> Result<f32, EvalError> {
        let own = self.board_value(state, player);
        let best_opponent = (0..state.num_players)
            .filter(|&p| p != player)
            .map(|p| self.board_value(state, p))
            .fold(f32::NEG_INFINITY, f32::max);
        Ok(own - best_opponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use azul_core::{OverflowPolicy, PatternLine, TILE_COLORS};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// 2-player state with every tile back in the bag and empty boards.
    fn bare2() -> GameState {
        let mut rng = StdRng::seed_from_u64(0);
        let mut state =
            GameState::new_game(2, 0, OverflowPolicy::default(), &mut rng).unwrap();
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

    fn eval(state: &GameState, player: PlayerIdx) -> f32 {
        HeuristicEvaluator::default().evaluate(state, player).unwrap()
    }

    #[test]
    fn symmetric_position_is_neutral() {
        let state = bare2();
        assert_eq!(eval(&state, 0), 0.0);
        assert_eq!(eval(&state, 1), 0.0);
    }

    #[test]
    fn evaluation_is_antisymmetric_for_two_players() {
        let mut state = bare2();
        state.players[0].score = 12;
        state.players[1].score = 7;
        state.players[1].floor.counts[Color::Red as usize] = 2;
        state.supply.bag[Color::Red as usize] -= 2;
        state.rehash();
        assert_eq!(eval(&state, 0), -eval(&state, 1));
        assert!(eval(&state, 0) > 0.0);
    }

    #[test]
    fn realized_score_dominates() {
        let mut state = bare2();
        state.players[0].score = 20;
        state.rehash();
        assert!(eval(&state, 0) >= 20.0);
    }

    #[test]
    fn floor_tiles_cost_value() {
        let clean = bare2();
        let mut dirty = clean.clone();
        dirty.players[0].floor.counts[Color::Black as usize] = 3;
        dirty.supply.bag[Color::Black as usize] -= 3;
        dirty.rehash();
        assert!(eval(&dirty, 0) < eval(&clean, 0));
    }

    #[test]
    fn line_progress_adds_value() {
        let empty = bare2();
        let mut progressed = empty.clone();
        progressed.players[0].lines[3] = PatternLine {
            color: Some(Color::Teal),
            count: 3,
        };
        progressed.supply.bag[Color::Teal as usize] -= 3;
        progressed.rehash();
        assert!(eval(&progressed, 0) > eval(&empty, 0));
    }

    #[test]
    fn starved_line_is_discounted() {
        let blue = Color::Blue as usize;
        let mut starved = bare2();
        // Player 0 has one blue on line 2 and needs two more; every other
        // blue tile is locked up on walls and the opponent's lines, so
        // none remain obtainable.
        starved.players[0].lines[2] = PatternLine {
            color: Some(Color::Blue),
            count: 1,
        };
        for row in [0, 1, 3, 4] {
            starved.players[0].wall[row][WALL_COL[row][blue]] = true;
        }
        for row in 0..BOARD_SIZE {
            starved.players[1].lines[row] = PatternLine {
                color: Some(Color::Blue),
                count: line_capacity(row),
            };
        }
        starved.supply.bag[blue] = 0; // 1 + 4 + 15 parked
        starved.rehash();

        // Releasing the opponent's line 1 back to the bag makes the line
        // completable again; it also weakens the opponent, so both effects
        // push the same way.
        let mut fed = starved.clone();
        fed.players[1].lines[1] = PatternLine::default();
        fed.supply.bag[blue] = 2;
        fed.rehash();

        assert!(eval(&starved, 0) < eval(&fed, 0));
    }

    #[test]
    fn wall_structure_counts() {
        let empty = bare2();
        let mut built = empty.clone();
        for color in [Color::Blue, Color::Yellow, Color::Red, Color::Black] {
            built.players[0].wall[0][WALL_COL[0][color as usize]] = true;
            built.supply.bag[color as usize] -= 1;
        }
        built.rehash();
        assert!(eval(&built, 0) > eval(&empty, 0));
    }

    #[test]
    fn three_player_evaluation_tracks_best_opponent() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut state =
            GameState::new_game(3, 0, OverflowPolicy::default(), &mut rng).unwrap();
        state.players[0].score = 10;
        state.players[1].score = 4;
        state.players[2].score = 9;
        state.rehash();
        // Player 2 is the threat, not player 1: 10 - 9, not 10 - 4.
        let value = eval(&state, 0);
        assert!((value - 1.0).abs() < 1e-3);
    }
}
