//! Rules engine for the Azul tile-drafting board game.
//!
//! The crate models the full drafting/scoring cycle for 2-4 players:
//! factories, the shared center pool, per-player pattern lines, the 5x5
//! wall, the floor line, and the bag/lid tile supply. A fixed pool of 100
//! tiles (20 per color) circulates between these zones; the engine treats
//! that conservation as a hard invariant and can verify it at any time.
//!
//! Moves are deterministic: drafting never touches the bag. The only
//! stochastic transition, refilling the factories, is isolated in
//! [`GameState::new_game`] and [`GameState::start_round`], which take an
//! explicit RNG. Search code built on top of this crate stays fully
//! deterministic by treating the end of a round as a horizon.
//!
//! Every state carries an incrementally maintained 64-bit Zobrist hash
//! (see [`zobrist`]) suitable for transposition tables.

use rand::Rng;
use thiserror::Error;

pub mod zobrist;

use zobrist::ZOBRIST;

/// Number of distinct tile colors.
pub const TILE_COLORS: usize = 5;
/// Tiles of each color in the game.
pub const TILES_PER_COLOR: u8 = 20;
/// Total tiles in circulation.
pub const TOTAL_TILES: u8 = 100;
/// Wall and pattern-line dimension.
pub const BOARD_SIZE: usize = 5;
/// Tiles drawn onto each factory at the start of a round.
pub const FACTORY_CAPACITY: u8 = 4;
/// Slots on the floor line.
pub const FLOOR_CAPACITY: u8 = 7;
pub const MIN_PLAYERS: u8 = 2;
pub const MAX_PLAYERS: usize = 4;
/// Factories in a 4-player game; smaller games use a prefix.
pub const MAX_FACTORIES: usize = 9;

/// Penalty per occupied floor slot, leftmost first.
pub const FLOOR_PENALTY: [i16; FLOOR_CAPACITY as usize] = [-1, -1, -2, -2, -2, -3, -3];

/// Index of a player seat, `0..num_players`.
pub type PlayerIdx = u8;

/// The five tile colors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Color {
    Blue = 0,
    Yellow = 1,
    Red = 2,
    Black = 3,
    Teal = 4,
}

impl Color {
    pub const ALL: [Color; TILE_COLORS] = [
        Color::Blue,
        Color::Yellow,
        Color::Red,
        Color::Black,
        Color::Teal,
    ];

    pub fn from_index(idx: u8) -> Option<Color> {
        match idx {
            0 => Some(Color::Blue),
            1 => Some(Color::Yellow),
            2 => Some(Color::Red),
            3 => Some(Color::Black),
            4 => Some(Color::Teal),
            _ => None,
        }
    }
}

/// Fixed wall coloring: each row shifts the palette one step right, so
/// every row and column holds each color exactly once.
pub const WALL_PATTERN: [[Color; BOARD_SIZE]; BOARD_SIZE] = [
    [Color::Blue, Color::Yellow, Color::Red, Color::Black, Color::Teal],
    [Color::Teal, Color::Blue, Color::Yellow, Color::Red, Color::Black],
    [Color::Black, Color::Teal, Color::Blue, Color::Yellow, Color::Red],
    [Color::Red, Color::Black, Color::Teal, Color::Blue, Color::Yellow],
    [Color::Yellow, Color::Red, Color::Black, Color::Teal, Color::Blue],
];

/// `WALL_COL[row][color]` is the column where `color` lands in `row`.
/// Derived from [`WALL_PATTERN`] so the two can never disagree.
pub const WALL_COL: [[usize; TILE_COLORS]; BOARD_SIZE] = wall_cols();

const fn wall_cols() -> [[usize; TILE_COLORS]; BOARD_SIZE] {
    let mut out = [[0usize; TILE_COLORS]; BOARD_SIZE];
    let mut row = 0;
    while row < BOARD_SIZE {
        let mut col = 0;
        while col < BOARD_SIZE {
            out[row][WALL_PATTERN[row][col] as usize] = col;
            col += 1;
        }
        row += 1;
    }
    out
}

/// Capacity of pattern line `row` (row 0 holds one tile, row 4 holds five).
pub const fn line_capacity(row: usize) -> u8 {
    row as u8 + 1
}

/// A single factory display, stored as per-color counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Factory {
    pub counts: [u8; TILE_COLORS],
}

impl Factory {
    pub fn count(&self, color: Color) -> u8 {
        self.counts[color as usize]
    }

    pub fn total(&self) -> u8 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&n| n == 0)
    }
}

/// The shared center pool, plus the first-player marker while unclaimed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CenterPool {
    pub counts: [u8; TILE_COLORS],
    pub has_marker: bool,
}

impl CenterPool {
    pub fn count(&self, color: Color) -> u8 {
        self.counts[color as usize]
    }

    /// Tile count; the marker is not a tile.
    pub fn total(&self) -> u8 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|&n| n == 0)
    }
}

/// One pattern line: at most one color, `count` never above the row
/// capacity. An empty line has `color == None` and `count == 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatternLine {
    pub color: Option<Color>,
    pub count: u8,
}

/// Wall occupancy. The color of an occupied cell is implied by
/// [`WALL_PATTERN`], so a boolean grid cannot represent an off-pattern
/// placement.
pub type Wall = [[bool; BOARD_SIZE]; BOARD_SIZE];

/// The floor line: overflow tiles and possibly the first-player marker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FloorLine {
    pub counts: [u8; TILE_COLORS],
    pub has_marker: bool,
}

impl FloorLine {
    pub fn count(&self, color: Color) -> u8 {
        self.counts[color as usize]
    }

    pub fn tiles(&self) -> u8 {
        self.counts.iter().sum()
    }

    /// Occupied penalty slots. The marker takes a slot when there is room;
    /// a marker claimed onto a full floor incurs no extra penalty.
    pub fn occupied(&self) -> u8 {
        (self.tiles() + self.has_marker as u8).min(FLOOR_CAPACITY)
    }

    /// Penalty owed at round end (non-positive).
    pub fn penalty(&self) -> i16 {
        FLOOR_PENALTY[..self.occupied() as usize].iter().sum()
    }
}

/// The bag tiles are drawn from and the lid discards return to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileSupply {
    pub bag: [u8; TILE_COLORS],
    pub discard: [u8; TILE_COLORS],
}

impl TileSupply {
    pub fn bag_total(&self) -> u8 {
        self.bag.iter().sum()
    }

    pub fn discard_total(&self) -> u8 {
        self.discard.iter().sum()
    }
}

/// One player's tableau.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayerBoard {
    pub wall: Wall,
    pub lines: [PatternLine; BOARD_SIZE],
    pub floor: FloorLine,
    pub score: i16,
}

impl PlayerBoard {
    pub fn has_complete_row(&self) -> bool {
        self.wall.iter().any(|row| row.iter().all(|&c| c))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Drafting,
    GameOver,
}

/// What happens to tiles that would land past the end of a full floor
/// line. Both options remove the tiles from play and preserve the
/// 100-tile invariant; they differ only in when the lid sees them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Excess tiles go to the lid immediately at placement.
    #[default]
    ImmediateDiscard,
    /// Excess tiles sit in a holding zone until `score_round` flushes
    /// them to the lid.
    HoldUntilRoundEnd,
}

/// Where a draft takes tiles from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DraftSource {
    Factory(u8),
    Center,
}

/// Where the drafted tiles go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Line(u8),
    Floor,
}

/// Distinct move indices produced by [`Move::compact`]:
/// 10 sources x 5 colors x 6 destinations.
pub const MOVE_INDEX_SPACE: usize = (MAX_FACTORIES + 1) * TILE_COLORS * 6;

/// A drafting move. `to_line`/`to_floor` record the forced split of the
/// drafted tiles: as many as fit on the destination line, the rest to the
/// floor. The generator fills the split in; `apply_move` re-derives and
/// verifies it, so a move carried over from a stale state is rejected
/// rather than silently misapplied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Move {
    pub source: DraftSource,
    pub color: Color,
    pub dest: Destination,
    pub to_line: u8,
    pub to_floor: u8,
}

impl Move {
    fn source_index(self) -> u16 {
        match self.source {
            DraftSource::Factory(f) => f as u16,
            DraftSource::Center => MAX_FACTORIES as u16,
        }
    }

    fn dest_index(self) -> u16 {
        match self.dest {
            Destination::Line(row) => row as u16,
            Destination::Floor => BOARD_SIZE as u16,
        }
    }

    /// Fixed-width encoding of the whole move, split included.
    pub fn packed(self) -> u32 {
        (self.source_index() as u32) << 14
            | (self.color as u32) << 11
            | (self.dest_index() as u32) << 8
            | (self.to_line as u32) << 5
            | self.to_floor as u32
    }

    /// Inverse of [`Move::packed`]. Returns `None` for malformed input.
    pub fn from_packed(raw: u32) -> Option<Move> {
        let source = match ((raw >> 14) & 0xF) as usize {
            s if s < MAX_FACTORIES => DraftSource::Factory(s as u8),
            s if s == MAX_FACTORIES => DraftSource::Center,
            _ => return None,
        };
        let color = Color::from_index(((raw >> 11) & 0x7) as u8)?;
        let dest = match ((raw >> 8) & 0x7) as usize {
            d if d < BOARD_SIZE => Destination::Line(d as u8),
            d if d == BOARD_SIZE => Destination::Floor,
            _ => return None,
        };
        Some(Move {
            source,
            color,
            dest,
            to_line: ((raw >> 5) & 0x7) as u8,
            to_floor: (raw & 0x1F) as u8,
        })
    }

    /// Dense index in `0..MOVE_INDEX_SPACE`, keyed on (source, color,
    /// destination) only. Distinct moves from the same state always get
    /// distinct indices, which makes this suitable for history and killer
    /// tables.
    pub fn compact(self) -> u16 {
        (self.source_index() * TILE_COLORS as u16 + self.color as u16) * 6 + self.dest_index()
    }
}

/// Rejection reasons for `apply_move`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum IllegalMoveError {
    #[error("the game is over")]
    GameOver,
    #[error("player {player} moved out of turn (current player is {current})")]
    OutOfTurn { player: PlayerIdx, current: PlayerIdx },
    #[error("factory {0} does not exist in this game")]
    NoSuchFactory(u8),
    #[error("pattern line {0} does not exist")]
    NoSuchLine(u8),
    #[error("the source holds no {color:?} tiles")]
    EmptySource { color: Color },
    #[error("pattern line {line} already holds {held:?}")]
    ColorMismatch { line: u8, held: Color },
    #[error("pattern line {0} is already full")]
    LineFull(u8),
    #[error("wall row {row} already holds a {color:?} tile")]
    WallOccupied { row: u8, color: Color },
    #[error("split {to_line}+{to_floor} does not match the {taken} tiles drafted")]
    BadSplit { to_line: u8, to_floor: u8, taken: u8 },
}

/// Structural violations reported by [`GameState::check_invariants`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InvalidStateError {
    #[error("unsupported player count {0}")]
    PlayerCount(u8),
    #[error("starting player {0} out of range")]
    StartingPlayer(u8),
    #[error("{color:?} conservation violated: counted {counted}, expected {expected}")]
    Conservation { color: Color, counted: u16, expected: u8 },
    #[error("player {player} line {line} holds {count} tiles, capacity {capacity}")]
    LineOverflow { player: PlayerIdx, line: u8, count: u8, capacity: u8 },
    #[error("player {player} line {line} conflicts with its wall row")]
    LineConflict { player: PlayerIdx, line: u8 },
    #[error("player {player} floor line overflows")]
    FloorOverflow { player: PlayerIdx },
    #[error("{0} first-player markers in play")]
    MarkerCount(u8),
    #[error("position hash out of sync: stored {stored:#018x}, recomputed {actual:#018x}")]
    HashMismatch { stored: u64, actual: u64 },
}

/// Reverse diff for one applied move; see [`GameState::undo_move`].
///
/// A draft only touches its source, the center, one pattern line, the
/// mover's floor, and one discard/overflow count, so the diff is a small
/// fixed-size snapshot rather than a state copy.
#[derive(Clone, Copy, Debug)]
pub struct Undo {
    hash: u64,
    mv: Move,
    player: PlayerIdx,
    factory: Factory,
    center: CenterPool,
    line: PatternLine,
    floor: FloorLine,
    discard: u8,
    overflow: u8,
    current_player: PlayerIdx,
    next_starter: PlayerIdx,
}

/// Complete game state. All zones are count-based, which keeps the
/// apply/undo diff small and makes the incremental hash a handful of XORs
/// per mutation.
///
/// Fields are public for inspection; code that mutates them directly must
/// call [`GameState::rehash`] afterwards or the stored hash goes stale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameState {
    pub num_players: u8,
    pub players: [PlayerBoard; MAX_PLAYERS],
    pub factories: [Factory; MAX_FACTORIES],
    pub num_factories: u8,
    pub center: CenterPool,
    pub supply: TileSupply,
    overflow: [u8; TILE_COLORS],
    pub policy: OverflowPolicy,
    pub current_player: PlayerIdx,
    pub next_starter: PlayerIdx,
    pub phase: Phase,
    pub round: u16,
    hash: u64,
}

impl GameState {
    /// Sets up a fresh game and deals the first round of factories.
    /// 2, 3 and 4 players play with 5, 7 and 9 factories respectively.
    pub fn new_game<R: Rng + ?Sized>(
        num_players: u8,
        starting_player: PlayerIdx,
        policy: OverflowPolicy,
        rng: &mut R,
    ) -> Result<GameState, InvalidStateError> {
        if !(MIN_PLAYERS..=MAX_PLAYERS as u8).contains(&num_players) {
            return Err(InvalidStateError::PlayerCount(num_players));
        }
        if starting_player >= num_players {
            return Err(InvalidStateError::StartingPlayer(starting_player));
        }
        let mut state = GameState {
            num_players,
            players: [PlayerBoard::default(); MAX_PLAYERS],
            factories: [Factory::default(); MAX_FACTORIES],
            num_factories: 1 + 2 * num_players,
            center: CenterPool::default(),
            supply: TileSupply {
                bag: [TILES_PER_COLOR; TILE_COLORS],
                discard: [0; TILE_COLORS],
            },
            overflow: [0; TILE_COLORS],
            policy,
            current_player: starting_player,
            next_starter: starting_player,
            phase: Phase::Drafting,
            round: 1,
            hash: 0,
        };
        state.hash = state.recompute_hash();
        state.refill_factories(rng);
        state.set_center_marker(true);
        state.debug_assert_invariants();
        Ok(state)
    }

    /// The incrementally maintained Zobrist hash of this position.
    pub fn position_hash(&self) -> u64 {
        self.hash
    }

    /// Recomputes the stored hash from scratch. Only needed after mutating
    /// public fields directly (e.g. test scaffolding).
    pub fn rehash(&mut self) {
        self.hash = self.recompute_hash();
    }

    /// Tiles of `color` held back by [`OverflowPolicy::HoldUntilRoundEnd`].
    pub fn overflow_count(&self, color: Color) -> u8 {
        self.overflow[color as usize]
    }

    /// The round is over when every factory and the center are out of
    /// tiles. An unclaimed marker does not keep the round alive.
    pub fn is_round_over(&self) -> bool {
        self.phase == Phase::Drafting
            && self.center.is_empty()
            && self.factories[..self.num_factories as usize]
                .iter()
                .all(Factory::is_empty)
    }

    pub fn is_game_over(&self) -> bool {
        self.phase == Phase::GameOver
    }

    /// All legal drafting moves for `player` on their own tableau. Empty
    /// once the game is over. The turn-order check lives in `apply_move`,
    /// not here, so analysis code can enumerate moves for any seat.
    pub fn generate_moves(&self, player: PlayerIdx) -> Vec<Move> {
        let mut moves = Vec::with_capacity(64);
        if self.phase == Phase::GameOver {
            return moves;
        }
        for f in 0..self.num_factories as usize {
            let factory = &self.factories[f];
            if factory.is_empty() {
                continue;
            }
            for color in Color::ALL {
                let taken = factory.count(color);
                if taken > 0 {
                    self.push_moves(&mut moves, DraftSource::Factory(f as u8), color, taken, player);
                }
            }
        }
        for color in Color::ALL {
            let taken = self.center.count(color);
            if taken > 0 {
                self.push_moves(&mut moves, DraftSource::Center, color, taken, player);
            }
        }
        moves
    }

    fn push_moves(
        &self,
        out: &mut Vec<Move>,
        source: DraftSource,
        color: Color,
        taken: u8,
        player: PlayerIdx,
    ) {
        let board = &self.players[player as usize];
        for row in 0..BOARD_SIZE {
            if board.wall[row][WALL_COL[row][color as usize]] {
                continue;
            }
            let line = board.lines[row];
            if line.color.is_some_and(|held| held != color) {
                continue;
            }
            let space = line_capacity(row) - line.count;
            if space == 0 {
                continue;
            }
            let to_line = taken.min(space);
            out.push(Move {
                source,
                color,
                dest: Destination::Line(row as u8),
                to_line,
                to_floor: taken - to_line,
            });
        }
        out.push(Move {
            source,
            color,
            dest: Destination::Floor,
            to_line: 0,
            to_floor: taken,
        });
    }

    /// Applies `mv` in place and returns the diff that [`Self::undo_move`]
    /// takes back. The state is untouched on error.
    pub fn apply_move_mut(&mut self, mv: Move, player: PlayerIdx) -> Result<Undo, IllegalMoveError> {
        if self.phase == Phase::GameOver {
            return Err(IllegalMoveError::GameOver);
        }
        if player != self.current_player {
            return Err(IllegalMoveError::OutOfTurn {
                player,
                current: self.current_player,
            });
        }

        let taken = match mv.source {
            DraftSource::Factory(f) => {
                if f >= self.num_factories {
                    return Err(IllegalMoveError::NoSuchFactory(f));
                }
                self.factories[f as usize].count(mv.color)
            }
            DraftSource::Center => self.center.count(mv.color),
        };
        if taken == 0 {
            return Err(IllegalMoveError::EmptySource { color: mv.color });
        }

        let board = &self.players[player as usize];
        let expected_to_line = match mv.dest {
            Destination::Line(row) => {
                if row as usize >= BOARD_SIZE {
                    return Err(IllegalMoveError::NoSuchLine(row));
                }
                let row_idx = row as usize;
                if board.wall[row_idx][WALL_COL[row_idx][mv.color as usize]] {
                    return Err(IllegalMoveError::WallOccupied { row, color: mv.color });
                }
                let line = board.lines[row_idx];
                if let Some(held) = line.color {
                    if held != mv.color {
                        return Err(IllegalMoveError::ColorMismatch { line: row, held });
                    }
                }
                let space = line_capacity(row_idx) - line.count;
                if space == 0 {
                    return Err(IllegalMoveError::LineFull(row));
                }
                taken.min(space)
            }
            Destination::Floor => 0,
        };
        if mv.to_line != expected_to_line || mv.to_floor != taken - expected_to_line {
            return Err(IllegalMoveError::BadSplit {
                to_line: mv.to_line,
                to_floor: mv.to_floor,
                taken,
            });
        }

        let undo = Undo {
            hash: self.hash,
            mv,
            player,
            factory: match mv.source {
                DraftSource::Factory(f) => self.factories[f as usize],
                DraftSource::Center => Factory::default(),
            },
            center: self.center,
            line: match mv.dest {
                Destination::Line(row) => self.players[player as usize].lines[row as usize],
                Destination::Floor => PatternLine::default(),
            },
            floor: self.players[player as usize].floor,
            discard: self.supply.discard[mv.color as usize],
            overflow: self.overflow[mv.color as usize],
            current_player: self.current_player,
            next_starter: self.next_starter,
        };

        // Empty the source; leftovers from a factory join the center.
        match mv.source {
            DraftSource::Factory(f) => {
                let f = f as usize;
                for color in Color::ALL {
                    let n = self.factories[f].count(color);
                    if n == 0 {
                        continue;
                    }
                    if color != mv.color {
                        self.set_center_count(color, self.center.count(color) + n);
                    }
                    self.set_factory_count(f, color, 0);
                }
            }
            DraftSource::Center => {
                self.set_center_count(mv.color, 0);
                if self.center.has_marker {
                    // First draft from the center this round: the mover
                    // takes the marker onto their floor and leads the next
                    // round.
                    self.set_center_marker(false);
                    self.set_floor_marker(player, true);
                    self.set_next_starter(player);
                }
            }
        }

        if let Destination::Line(row) = mv.dest {
            let row = row as usize;
            let count = self.players[player as usize].lines[row].count + mv.to_line;
            self.set_line(player, row, Some(mv.color), count);
        }
        if mv.to_floor > 0 {
            let floor = self.players[player as usize].floor;
            let free = FLOOR_CAPACITY - floor.occupied();
            let fit = mv.to_floor.min(free);
            if fit > 0 {
                self.set_floor_count(player, mv.color, floor.count(mv.color) + fit);
            }
            let excess = mv.to_floor - fit;
            if excess > 0 {
                match self.policy {
                    OverflowPolicy::ImmediateDiscard => {
                        let n = self.supply.discard[mv.color as usize] + excess;
                        self.set_discard(mv.color, n);
                    }
                    OverflowPolicy::HoldUntilRoundEnd => {
                        let n = self.overflow[mv.color as usize] + excess;
                        self.set_overflow(mv.color, n);
                    }
                }
            }
        }

        if !self.is_round_over() {
            self.set_current_player((player + 1) % self.num_players);
        }
        self.debug_assert_invariants();
        Ok(undo)
    }

    /// Pure counterpart of [`Self::apply_move_mut`].
    pub fn apply_move(&self, mv: Move, player: PlayerIdx) -> Result<GameState, IllegalMoveError> {
        let mut next = self.clone();
        next.apply_move_mut(mv, player)?;
        Ok(next)
    }

    /// Reverts the most recent un-undone `apply_move_mut`. Diffs must be
    /// taken back in reverse application order.
    pub fn undo_move(&mut self, undo: &Undo) {
        let player = undo.player as usize;
        if let DraftSource::Factory(f) = undo.mv.source {
            self.factories[f as usize] = undo.factory;
        }
        self.center = undo.center;
        if let Destination::Line(row) = undo.mv.dest {
            self.players[player].lines[row as usize] = undo.line;
        }
        self.players[player].floor = undo.floor;
        self.supply.discard[undo.mv.color as usize] = undo.discard;
        self.overflow[undo.mv.color as usize] = undo.overflow;
        self.current_player = undo.current_player;
        self.next_starter = undo.next_starter;
        self.hash = undo.hash;
        self.debug_assert_invariants();
    }

    /// Resolves the wall-tiling phase of a finished round: completed
    /// pattern lines tile the wall and score, floors are penalized and
    /// swept to the lid, held-back overflow is flushed, and the game ends
    /// if any wall row is complete. Caller must have checked
    /// [`Self::is_round_over`].
    pub fn score_round(&mut self) {
        debug_assert!(self.is_round_over());
        for p in 0..self.num_players {
            for row in 0..BOARD_SIZE {
                let line = self.players[p as usize].lines[row];
                if line.count < line_capacity(row) {
                    continue;
                }
                let Some(color) = line.color else { continue };
                let col = WALL_COL[row][color as usize];
                self.set_wall_cell(p, row, col);
                let gained = score_placement(&self.players[p as usize].wall, row, col);
                self.set_score(p, self.players[p as usize].score + gained);
                // One tile moves to the wall, the rest of the line to the lid.
                let residue = line.count - 1;
                if residue > 0 {
                    self.set_discard(color, self.supply.discard[color as usize] + residue);
                }
                self.set_line(p, row, None, 0);
            }

            let floor = self.players[p as usize].floor;
            if floor.occupied() > 0 {
                let rescored = (self.players[p as usize].score + floor.penalty()).max(0);
                self.set_score(p, rescored);
            }
            for color in Color::ALL {
                let n = floor.count(color);
                if n > 0 {
                    self.set_discard(color, self.supply.discard[color as usize] + n);
                    self.set_floor_count(p, color, 0);
                }
            }
            if floor.has_marker {
                self.set_floor_marker(p, false);
            }
        }

        for color in Color::ALL {
            let n = self.overflow[color as usize];
            if n > 0 {
                self.set_discard(color, self.supply.discard[color as usize] + n);
                self.set_overflow(color, 0);
            }
        }

        let finished = self.players[..self.num_players as usize]
            .iter()
            .any(PlayerBoard::has_complete_row);
        if finished {
            self.set_game_over();
        }
        self.debug_assert_invariants();
    }

    /// End-of-game bonuses: +2 per complete wall row, +7 per complete
    /// column, +10 per color placed five times. Caller must have checked
    /// [`Self::is_game_over`].
    pub fn score_final(&mut self) {
        debug_assert!(self.is_game_over());
        for p in 0..self.num_players {
            let wall = self.players[p as usize].wall;
            let mut bonus = 0i16;
            for row in wall {
                if row.iter().all(|&c| c) {
                    bonus += 2;
                }
            }
            for col in 0..BOARD_SIZE {
                if (0..BOARD_SIZE).all(|row| wall[row][col]) {
                    bonus += 7;
                }
            }
            for color in Color::ALL {
                let placed = (0..BOARD_SIZE)
                    .filter(|&row| wall[row][WALL_COL[row][color as usize]])
                    .count();
                if placed == BOARD_SIZE {
                    bonus += 10;
                }
            }
            if bonus > 0 {
                self.set_score(p, self.players[p as usize].score + bonus);
            }
        }
    }

    /// Deals the next round: refills the factories from the bag (topping
    /// the bag up from the lid when it runs dry), returns the marker to
    /// the center, and hands the lead to the marker holder. Caller must
    /// have run [`Self::score_round`] first.
    pub fn start_round<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        debug_assert!(self.is_round_over() && !self.is_game_over());
        self.refill_factories(rng);
        self.set_center_marker(true);
        self.set_current_player(self.next_starter);
        self.round += 1;
        self.debug_assert_invariants();
    }

    fn refill_factories<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for f in 0..self.num_factories as usize {
            for _ in 0..FACTORY_CAPACITY {
                // The supply can run dry outright; factories then stay
                // partially filled and the round plays with what there is.
                let Some(color) = self.draw_tile(rng) else {
                    return;
                };
                let n = self.factories[f].count(color) + 1;
                self.set_factory_count(f, color, n);
            }
        }
    }

    fn draw_tile<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Color> {
        if self.supply.bag_total() == 0 {
            if self.supply.discard_total() == 0 {
                return None;
            }
            for color in Color::ALL {
                let n = self.supply.discard[color as usize];
                if n > 0 {
                    self.set_bag(color, n);
                    self.set_discard(color, 0);
                }
            }
        }
        let mut pick = rng.random_range(0..self.supply.bag_total());
        for color in Color::ALL {
            let n = self.supply.bag[color as usize];
            if pick < n {
                self.set_bag(color, n - 1);
                return Some(color);
            }
            pick -= n;
        }
        None
    }

    /// Verifies tile conservation, zone shapes, marker uniqueness and hash
    /// consistency. Cheap enough to run after every mutation in debug
    /// builds.
    pub fn check_invariants(&self) -> Result<(), InvalidStateError> {
        for color in Color::ALL {
            let c = color as usize;
            let mut counted = (self.center.counts[c]
                + self.supply.bag[c]
                + self.supply.discard[c]
                + self.overflow[c]) as u16;
            for factory in &self.factories[..self.num_factories as usize] {
                counted += factory.counts[c] as u16;
            }
            for p in 0..self.num_players as usize {
                let board = &self.players[p];
                for line in board.lines {
                    if line.color == Some(color) {
                        counted += line.count as u16;
                    }
                }
                for row in 0..BOARD_SIZE {
                    if board.wall[row][WALL_COL[row][c]] {
                        counted += 1;
                    }
                }
                counted += board.floor.counts[c] as u16;
            }
            if counted != TILES_PER_COLOR as u16 {
                return Err(InvalidStateError::Conservation {
                    color,
                    counted,
                    expected: TILES_PER_COLOR,
                });
            }
        }

        let mut markers = self.center.has_marker as u8;
        for p in 0..self.num_players {
            let board = &self.players[p as usize];
            for (row, line) in board.lines.iter().enumerate() {
                let capacity = line_capacity(row);
                if line.count > capacity || (line.count > 0) != line.color.is_some() {
                    return Err(InvalidStateError::LineOverflow {
                        player: p,
                        line: row as u8,
                        count: line.count,
                        capacity,
                    });
                }
                if let Some(color) = line.color {
                    if board.wall[row][WALL_COL[row][color as usize]] {
                        return Err(InvalidStateError::LineConflict { player: p, line: row as u8 });
                    }
                }
            }
            if board.floor.tiles() > FLOOR_CAPACITY {
                return Err(InvalidStateError::FloorOverflow { player: p });
            }
            markers += board.floor.has_marker as u8;
        }
        if markers > 1 {
            return Err(InvalidStateError::MarkerCount(markers));
        }

        let actual = self.recompute_hash();
        if actual != self.hash {
            return Err(InvalidStateError::HashMismatch {
                stored: self.hash,
                actual,
            });
        }
        Ok(())
    }

    /// Debug-build invariant check; compiles to nothing in release.
    #[inline]
    pub fn debug_assert_invariants(&self) {
        #[cfg(debug_assertions)]
        if let Err(err) = self.check_invariants() {
            panic!("state invariant violated: {err}");
        }
    }

    fn recompute_hash(&self) -> u64 {
        let mut h = 0u64;
        for f in 0..self.num_factories as usize {
            for color in Color::ALL {
                h ^= ZOBRIST.factory(f, color, self.factories[f].count(color));
            }
        }
        for color in Color::ALL {
            h ^= ZOBRIST.center(color, self.center.count(color));
            h ^= ZOBRIST.bag(color, self.supply.bag[color as usize]);
            h ^= ZOBRIST.discard(color, self.supply.discard[color as usize]);
            h ^= ZOBRIST.overflow(color, self.overflow[color as usize]);
        }
        if self.center.has_marker {
            h ^= ZOBRIST.center_marker();
        }
        for p in 0..self.num_players {
            let board = &self.players[p as usize];
            for (row, line) in board.lines.iter().enumerate() {
                if let Some(color) = line.color {
                    h ^= ZOBRIST.line(p, row, color, line.count);
                }
            }
            for row in 0..BOARD_SIZE {
                for col in 0..BOARD_SIZE {
                    if board.wall[row][col] {
                        h ^= ZOBRIST.wall(p, row, col);
                    }
                }
            }
            for color in Color::ALL {
                h ^= ZOBRIST.floor(p, color, board.floor.count(color));
            }
            if board.floor.has_marker {
                h ^= ZOBRIST.floor_marker(p);
            }
            h ^= ZOBRIST.score(p, board.score);
        }
        h ^= ZOBRIST.to_move(self.current_player);
        h ^= ZOBRIST.next_starter(self.next_starter);
        if self.phase == Phase::GameOver {
            h ^= ZOBRIST.game_over();
        }
        h
    }

    // Mutation helpers. Every write to a hashed field goes through one of
    // these so the stored hash never drifts from the state.

    fn set_factory_count(&mut self, factory: usize, color: Color, n: u8) {
        let old = self.factories[factory].counts[color as usize];
        if old == n {
            return;
        }
        self.hash ^= ZOBRIST.factory(factory, color, old) ^ ZOBRIST.factory(factory, color, n);
        self.factories[factory].counts[color as usize] = n;
    }

    fn set_center_count(&mut self, color: Color, n: u8) {
        let old = self.center.counts[color as usize];
        if old == n {
            return;
        }
        self.hash ^= ZOBRIST.center(color, old) ^ ZOBRIST.center(color, n);
        self.center.counts[color as usize] = n;
    }

    fn set_center_marker(&mut self, present: bool) {
        if self.center.has_marker == present {
            return;
        }
        self.hash ^= ZOBRIST.center_marker();
        self.center.has_marker = present;
    }

    fn set_line(&mut self, player: PlayerIdx, row: usize, color: Option<Color>, count: u8) {
        let old = self.players[player as usize].lines[row];
        if let Some(held) = old.color {
            self.hash ^= ZOBRIST.line(player, row, held, old.count);
        }
        let new = if count == 0 {
            PatternLine::default()
        } else {
            PatternLine { color, count }
        };
        if let Some(held) = new.color {
            self.hash ^= ZOBRIST.line(player, row, held, new.count);
        }
        self.players[player as usize].lines[row] = new;
    }

    fn set_wall_cell(&mut self, player: PlayerIdx, row: usize, col: usize) {
        debug_assert!(!self.players[player as usize].wall[row][col]);
        self.hash ^= ZOBRIST.wall(player, row, col);
        self.players[player as usize].wall[row][col] = true;
    }

    fn set_floor_count(&mut self, player: PlayerIdx, color: Color, n: u8) {
        let old = self.players[player as usize].floor.counts[color as usize];
        if old == n {
            return;
        }
        self.hash ^= ZOBRIST.floor(player, color, old) ^ ZOBRIST.floor(player, color, n);
        self.players[player as usize].floor.counts[color as usize] = n;
    }

    fn set_floor_marker(&mut self, player: PlayerIdx, present: bool) {
        if self.players[player as usize].floor.has_marker == present {
            return;
        }
        self.hash ^= ZOBRIST.floor_marker(player);
        self.players[player as usize].floor.has_marker = present;
    }

    fn set_bag(&mut self, color: Color, n: u8) {
        let old = self.supply.bag[color as usize];
        if old == n {
            return;
        }
        self.hash ^= ZOBRIST.bag(color, old) ^ ZOBRIST.bag(color, n);
        self.supply.bag[color as usize] = n;
    }

    fn set_discard(&mut self, color: Color, n: u8) {
        let old = self.supply.discard[color as usize];
        if old == n {
            return;
        }
        self.hash ^= ZOBRIST.discard(color, old) ^ ZOBRIST.discard(color, n);
        self.supply.discard[color as usize] = n;
    }

    fn set_overflow(&mut self, color: Color, n: u8) {
        let old = self.overflow[color as usize];
        if old == n {
            return;
        }
        self.hash ^= ZOBRIST.overflow(color, old) ^ ZOBRIST.overflow(color, n);
        self.overflow[color as usize] = n;
    }

    fn set_score(&mut self, player: PlayerIdx, score: i16) {
        let old = self.players[player as usize].score;
        if old == score {
            return;
        }
        self.hash ^= ZOBRIST.score(player, old) ^ ZOBRIST.score(player, score);
        self.players[player as usize].score = score;
    }

    fn set_current_player(&mut self, player: PlayerIdx) {
        if self.current_player == player {
            return;
        }
        self.hash ^= ZOBRIST.to_move(self.current_player) ^ ZOBRIST.to_move(player);
        self.current_player = player;
    }

    fn set_next_starter(&mut self, player: PlayerIdx) {
        if self.next_starter == player {
            return;
        }
        self.hash ^= ZOBRIST.next_starter(self.next_starter) ^ ZOBRIST.next_starter(player);
        self.next_starter = player;
    }

    fn set_game_over(&mut self) {
        if self.phase == Phase::GameOver {
            return;
        }
        self.hash ^= ZOBRIST.game_over();
        self.phase = Phase::GameOver;
    }
}

/// Points scored by the tile just placed at `(row, col)`, which must
/// already be set in `wall`. An isolated tile scores 1; otherwise each
/// orthogonal direction contributes the length of its contiguous run
/// (placed tile included) when that run extends beyond the tile itself.
pub fn score_placement(wall: &Wall, row: usize, col: usize) -> i16 {
    debug_assert!(wall[row][col]);
    let mut horizontal = 1i16;
    let mut c = col;
    while c > 0 && wall[row][c - 1] {
        horizontal += 1;
        c -= 1;
    }
    c = col;
    while c + 1 < BOARD_SIZE && wall[row][c + 1] {
        horizontal += 1;
        c += 1;
    }

    let mut vertical = 1i16;
    let mut r = row;
    while r > 0 && wall[r - 1][col] {
        vertical += 1;
        r -= 1;
    }
    r = row;
    while r + 1 < BOARD_SIZE && wall[r + 1][col] {
        vertical += 1;
        r += 1;
    }

    match (horizontal > 1, vertical > 1) {
        (false, false) => 1,
        (true, false) => horizontal,
        (false, true) => vertical,
        (true, true) => horizontal + vertical,
    }
}
