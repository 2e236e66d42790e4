//! Fixed-capacity transposition table.

use azul_core::Move;

/// How the stored score relates to the true value of the position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    Exact,
    /// Score is a lower bound (search failed high).
    Lower,
    /// Score is an upper bound (search failed low).
    Upper,
}

const NO_MOVE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct Entry {
    key: u64,
    depth: u8,
    age: u8,
    bound: Bound,
    score: f32,
    best: u32,
}

/// Direct-mapped table indexed by `key & mask`. Capacity is fixed at
/// construction; collisions are resolved by replacement, never by
/// growing, so memory stays bounded no matter how long a search runs.
///
/// Replacement is depth-preferred with an age override: entries from a
/// previous search generation are always replaceable, entries for the
/// same position are always refreshed, and within a generation a deeper
/// entry survives a shallower newcomer.
pub struct TranspositionTable {
    entries: Vec<Option<Entry>>,
    mask: usize,
    age: u8,
    probes: u64,
    hits: u64,
}

impl TranspositionTable {
    /// `capacity` is rounded up to a power of two, at least 1024 slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(1024);
        Self {
            entries: vec![None; capacity],
            mask: capacity - 1,
            age: 0,
            probes: 0,
            hits: 0,
        }
    }

    /// Starts a new search generation. Existing entries stay readable but
    /// lose their replacement priority.
    pub fn new_search(&mut self) {
        self.age = self.age.wrapping_add(1);
    }

    /// Returns a score usable at `depth` within the `(alpha, beta)`
    /// window, if one is stored.
    pub fn probe(&mut self, key: u64, depth: u8, alpha: f32, beta: f32) -> Option<f32> {
        self.probes += 1;
        let entry = self.entries[key as usize & self.mask]?;
        if entry.key != key || entry.depth < depth {
            return None;
        }
        let usable = match entry.bound {
            Bound::Exact => true,
            Bound::Lower => entry.score >= beta,
            Bound::Upper => entry.score <= alpha,
        };
        if usable {
            self.hits += 1;
            Some(entry.score)
        } else {
            None
        }
    }

    /// Best move recorded for `key`, regardless of stored depth. Used for
    /// move ordering, where a stale hint is still better than none.
    pub fn best_move(&self, key: u64) -> Option<Move> {
        let entry = self.entries[key as usize & self.mask]?;
        if entry.key != key || entry.best == NO_MOVE {
            return None;
        }
        Move::from_packed(entry.best)
    }

    pub fn store(&mut self, key: u64, depth: u8, score: f32, bound: Bound, best: Option<Move>) {
        let idx = key as usize & self.mask;
        let mut best_packed = best.map(Move::packed).unwrap_or(NO_MOVE);
        if let Some(old) = self.entries[idx] {
            let replace = old.age != self.age || old.key == key || depth >= old.depth;
            if !replace {
                return;
            }
            // Keep the known best move when refreshing the same position
            // without a new one.
            if old.key == key && best_packed == NO_MOVE {
                best_packed = old.best;
            }
        }
        self.entries[idx] = Some(Entry {
            key,
            depth,
            age: self.age,
            bound,
            score,
            best: best_packed,
        });
    }

    /// Fraction of probes answered from the table since construction.
    pub fn hit_rate(&self) -> f64 {
        if self.probes == 0 {
            0.0
        } else {
            self.hits as f64 / self.probes as f64
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
