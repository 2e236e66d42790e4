//! Search engines for Azul position analysis.
//!
//! Two engines share the [`azul_core`] rules engine and the
//! [`ScoreProvider`] evaluation hook:
//!
//! - [`AlphaBetaSearch`]: iterative-deepening negamax with a
//!   transposition table, killer/history move ordering and a time budget.
//! - [`MctsEngine`]: UCT Monte Carlo tree search with pluggable rollout
//!   policies.
//!
//! Both are restricted to 2-player states, where the sign-flipping value
//! convention is exact. Engines own their tables and trees, so callers may
//! run one search per worker thread without any shared state.

mod alphabeta;
mod config;
mod eval;
mod mcts;
mod tt;

pub use alphabeta::{AlphaBetaSearch, SearchOutcome};
pub use config::{RolloutPolicy, SearchConfig};
pub use eval::{EvalError, HeuristicEvaluator, ScoreProvider};
pub use mcts::{MctsEngine, MctsOutcome};
pub use tt::{Bound, TranspositionTable};

use azul_core::{IllegalMoveError, PlayerIdx};
use thiserror::Error;

/// Why a search could not produce a result. Running out of time is not an
/// error; it is reported through the outcome instead.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("the game is already over")]
    GameOver,
    #[error("search supports 2-player games, state has {0} players")]
    UnsupportedPlayerCount(u8),
    #[error("player {player} is not to move (current player is {current})")]
    NotPlayersTurn { player: PlayerIdx, current: PlayerIdx },
    #[error("no legal moves in this position")]
    NoLegalMoves,
    #[error("evaluation failed")]
    Evaluation(#[from] EvalError),
    #[error("search applied a move the rules engine rejected")]
    Engine(#[from] IllegalMoveError),
}

pub(crate) fn validate_root(
    state: &azul_core::GameState,
    player: PlayerIdx,
) -> Result<(), SearchError> {
    if state.is_game_over() {
        return Err(SearchError::GameOver);
    }
    if state.num_players != 2 {
        return Err(SearchError::UnsupportedPlayerCount(state.num_players));
    }
    if player != state.current_player {
        return Err(SearchError::NotPlayersTurn {
            player,
            current: state.current_player,
        });
    }
    Ok(())
}
