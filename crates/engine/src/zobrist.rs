//! Compile-time Zobrist key tables for position hashing.
//!
//! Every hashable feature of a [`GameState`](crate::GameState) maps to a
//! pseudo-random 64-bit key. Keys are generated at compile time by an
//! xorshift64 stream from a fixed seed, so hashes are stable across builds
//! and platforms. Count-valued zones (factories, center, lines, floor, bag,
//! discard, overflow) key on `(zone, color, count)`; a count of zero always
//! hashes to zero so that incremental updates can uniformly XOR out the old
//! count and XOR in the new one.

use crate::{
    Color, PlayerIdx, BOARD_SIZE, FACTORY_CAPACITY, FLOOR_CAPACITY, MAX_FACTORIES, MAX_PLAYERS,
    TILES_PER_COLOR, TILE_COLORS,
};

const SEED: u64 = 0x123456789ABCDEF0;

const COUNTS_PER_FACTORY_SLOT: usize = FACTORY_CAPACITY as usize + 1;
const COUNTS_PER_POOL_SLOT: usize = TILES_PER_COLOR as usize + 1;
const COUNTS_PER_LINE_SLOT: usize = BOARD_SIZE + 1;
const COUNTS_PER_FLOOR_SLOT: usize = FLOOR_CAPACITY as usize + 1;

const FACTORY_KEYS: usize = MAX_FACTORIES * TILE_COLORS * COUNTS_PER_FACTORY_SLOT;
const CENTER_KEYS: usize = TILE_COLORS * COUNTS_PER_POOL_SLOT;
const LINE_KEYS: usize = MAX_PLAYERS * BOARD_SIZE * TILE_COLORS * COUNTS_PER_LINE_SLOT;
const WALL_KEYS: usize = MAX_PLAYERS * BOARD_SIZE * BOARD_SIZE;
const FLOOR_KEYS: usize = MAX_PLAYERS * TILE_COLORS * COUNTS_PER_FLOOR_SLOT;
const POOL_KEYS: usize = TILE_COLORS * COUNTS_PER_POOL_SLOT;

const OFF_FACTORY: usize = 0;
const OFF_CENTER: usize = OFF_FACTORY + FACTORY_KEYS;
const OFF_CENTER_MARKER: usize = OFF_CENTER + CENTER_KEYS;
const OFF_LINE: usize = OFF_CENTER_MARKER + 1;
const OFF_WALL: usize = OFF_LINE + LINE_KEYS;
const OFF_FLOOR: usize = OFF_WALL + WALL_KEYS;
const OFF_FLOOR_MARKER: usize = OFF_FLOOR + FLOOR_KEYS;
const OFF_BAG: usize = OFF_FLOOR_MARKER + MAX_PLAYERS;
const OFF_DISCARD: usize = OFF_BAG + POOL_KEYS;
const OFF_OVERFLOW: usize = OFF_DISCARD + POOL_KEYS;
const OFF_TO_MOVE: usize = OFF_OVERFLOW + POOL_KEYS;
const OFF_NEXT_STARTER: usize = OFF_TO_MOVE + MAX_PLAYERS;
const OFF_GAME_OVER: usize = OFF_NEXT_STARTER + MAX_PLAYERS;
const TABLE_SIZE: usize = OFF_GAME_OVER + 1;

const fn xorshift64(mut state: u64) -> u64 {
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state
}

/// splitmix64 finalizer; used for features whose domain is too large to
/// table (player scores).
const fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

/// Zobrist key tables, generated once at compile time.
pub struct ZobristKeys {
    keys: [u64; TABLE_SIZE],
}

impl ZobristKeys {
    const fn new() -> Self {
        let mut keys = [0u64; TABLE_SIZE];
        let mut state = SEED;
        let mut i = 0;
        while i < TABLE_SIZE {
            state = xorshift64(state);
            keys[i] = state;
            i += 1;
        }
        Self { keys }
    }

    /// Key for `count` tiles of `color` sitting on factory `factory`.
    #[inline]
    pub fn factory(&self, factory: usize, color: Color, count: u8) -> u64 {
        if count == 0 {
            return 0;
        }
        let idx = (factory * TILE_COLORS + color as usize) * COUNTS_PER_FACTORY_SLOT
            + count as usize;
        self.keys[OFF_FACTORY + idx]
    }

    #[inline]
    pub fn center(&self, color: Color, count: u8) -> u64 {
        if count == 0 {
            return 0;
        }
        self.keys[OFF_CENTER + color as usize * COUNTS_PER_POOL_SLOT + count as usize]
    }

    #[inline]
    pub fn center_marker(&self) -> u64 {
        self.keys[OFF_CENTER_MARKER]
    }

    /// Key for a pattern line holding `count` tiles of `color`. Empty lines
    /// (no color or zero count) hash to zero.
    #[inline]
    pub fn line(&self, player: PlayerIdx, row: usize, color: Color, count: u8) -> u64 {
        if count == 0 {
            return 0;
        }
        let idx = ((player as usize * BOARD_SIZE + row) * TILE_COLORS + color as usize)
            * COUNTS_PER_LINE_SLOT
            + count as usize;
        self.keys[OFF_LINE + idx]
    }

    #[inline]
    pub fn wall(&self, player: PlayerIdx, row: usize, col: usize) -> u64 {
        self.keys[OFF_WALL + (player as usize * BOARD_SIZE + row) * BOARD_SIZE + col]
    }

    #[inline]
    pub fn floor(&self, player: PlayerIdx, color: Color, count: u8) -> u64 {
        if count == 0 {
            return 0;
        }
        let idx = (player as usize * TILE_COLORS + color as usize) * COUNTS_PER_FLOOR_SLOT
            + count as usize;
        self.keys[OFF_FLOOR + idx]
    }

    #[inline]
    pub fn floor_marker(&self, player: PlayerIdx) -> u64 {
        self.keys[OFF_FLOOR_MARKER + player as usize]
    }

    #[inline]
    pub fn bag(&self, color: Color, count: u8) -> u64 {
        if count == 0 {
            return 0;
        }
        self.keys[OFF_BAG + color as usize * COUNTS_PER_POOL_SLOT + count as usize]
    }

    #[inline]
    pub fn discard(&self, color: Color, count: u8) -> u64 {
        if count == 0 {
            return 0;
        }
        self.keys[OFF_DISCARD + color as usize * COUNTS_PER_POOL_SLOT + count as usize]
    }

    #[inline]
    pub fn overflow(&self, color: Color, count: u8) -> u64 {
        if count == 0 {
            return 0;
        }
        self.keys[OFF_OVERFLOW + color as usize * COUNTS_PER_POOL_SLOT + count as usize]
    }

    /// Score keys mix instead of tabling: scores are bounded in practice but
    /// not by the rules. Every player's score contributes, including zero.
    #[inline]
    pub fn score(&self, player: PlayerIdx, score: i16) -> u64 {
        mix64(SEED ^ ((player as u64) << 32) ^ (score as u16 as u64))
    }

    #[inline]
    pub fn to_move(&self, player: PlayerIdx) -> u64 {
        self.keys[OFF_TO_MOVE + player as usize]
    }

    #[inline]
    pub fn next_starter(&self, player: PlayerIdx) -> u64 {
        self.keys[OFF_NEXT_STARTER + player as usize]
    }

    #[inline]
    pub fn game_over(&self) -> u64 {
        self.keys[OFF_GAME_OVER]
    }
}

/// Global key tables.
pub static ZOBRIST: ZobristKeys = ZobristKeys::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_nonzero_and_distinct_at_spot_checks() {
        let a = ZOBRIST.factory(0, Color::Blue, 1);
        let b = ZOBRIST.factory(0, Color::Blue, 2);
        let c = ZOBRIST.factory(1, Color::Blue, 1);
        let d = ZOBRIST.center(Color::Blue, 1);
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn zero_counts_hash_to_zero() {
        assert_eq!(ZOBRIST.factory(3, Color::Red, 0), 0);
        assert_eq!(ZOBRIST.center(Color::Teal, 0), 0);
        assert_eq!(ZOBRIST.line(1, 4, Color::Black, 0), 0);
        assert_eq!(ZOBRIST.floor(0, Color::Yellow, 0), 0);
        assert_eq!(ZOBRIST.bag(Color::Blue, 0), 0);
    }

    #[test]
    fn score_keys_distinguish_players_and_values() {
        assert_ne!(ZOBRIST.score(0, 5), ZOBRIST.score(1, 5));
        assert_ne!(ZOBRIST.score(0, 5), ZOBRIST.score(0, 6));
        assert_ne!(ZOBRIST.score(0, -1), ZOBRIST.score(0, 1));
    }

    #[test]
    fn table_is_deterministic() {
        let again = ZobristKeys::new();
        assert_eq!(again.keys[..16], ZOBRIST.keys[..16]);
    }
}
