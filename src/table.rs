// Copyright 2019-2021 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A4's shared search memory: the main transposition table, a small auxiliary table used
//! only to reconstruct the principal variation, and the ABDADA move-hash "busy" table.
//!
//! # Node kinds
/// The transposition table encodes three kinds of results:
///   * A `pv`/exact node: all moves were searched, and the stored value is exact.
///   * A `cut`/lower-bound node: a beta cutoff occurred; the stored value is a lower bound.
///   * An `all`/upper-bound node: no move beat alpha; the stored value is an upper bound.
///
/// # Concurrency
/// The main table is a fixed-size array of buckets of 4 slots, written and read without
/// any locking. Each slot packs its key and data together with an xor trick: the stored
/// "check" word is `key ^ data`, so a reader recomputes `key` as `check ^ data` and
/// discards the slot if it doesn't match the position being probed. This makes a torn
/// write (another thread replacing the slot mid-read) look like a miss rather than
/// corrupt data. Correctness of search does not depend on the table being right - only
/// on the caller re-verifying that any move it returns is legal before playing it.
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;

use chashmap::CHashMap;
use lazy_static::lazy_static;

use crate::{core::Move, eval::Value, Position};

const BUCKET_SIZE: usize = 4;
const DEFAULT_HASH_MB: usize = 16;
const BUSY_TABLE_SLOTS: usize = 1 << 14;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Bound {
    Exact,
    Lower,
    Upper,
}

#[derive(Copy, Clone, Debug)]
pub struct TableEntry {
    pub best_move: Option<Move>,
    pub score: Value,
    pub depth: u32,
    pub bound: Bound,
    pub age: u8,
}

// Packed layout (low to high bit): best_move (16, 0 = none), score (16, as u16 bit pattern),
// depth (8, clamped to u8::MAX), bound (2), age (6). 16 bits are left unused.
fn pack(entry: TableEntry) -> u64 {
    let mov_bits = entry.best_move.map(|m| encode_move(m)).unwrap_or(0) as u64;
    let score_bits = (entry.score.raw() as u16) as u64;
    let depth_bits = entry.depth.min(u8::MAX as u32) as u64;
    let bound_bits = match entry.bound {
        Bound::Exact => 0u64,
        Bound::Lower => 1u64,
        Bound::Upper => 2u64,
    };
    let age_bits = (entry.age & 0x3F) as u64;

    mov_bits | (score_bits << 16) | (depth_bits << 32) | (bound_bits << 40) | (age_bits << 42)
}

fn unpack(data: u64) -> TableEntry {
    let mov_bits = (data & 0xFFFF) as u16;
    let score_bits = ((data >> 16) & 0xFFFF) as u16;
    let depth_bits = ((data >> 32) & 0xFF) as u32;
    let bound_bits = (data >> 40) & 0x3;
    let age_bits = ((data >> 42) & 0x3F) as u8;

    TableEntry {
        best_move: decode_move(mov_bits),
        score: Value::from_raw(score_bits as i16),
        depth: depth_bits,
        bound: match bound_bits {
            0 => Bound::Exact,
            1 => Bound::Lower,
            _ => Bound::Upper,
        },
        age: age_bits,
    }
}

// `Move`'s own packed representation is already a 16-bit quantity, but `0` collides with
// the null move, which we never want to store as a "no move" marker that reads back as a
// real move. We reserve `0xFFFF` for "no move" instead.
const NO_MOVE_BITS: u16 = 0xFFFF;

fn encode_move(mov: Move) -> u16 {
    use std::convert::TryInto;
    // SAFETY net: `Move`'s UCI round-trip is infallible for any move the generator
    // produces, so re-deriving the packed bits via source/destination/promotion is cheap
    // and avoids needing a `From<Move> for u16` on the type itself.
    let mut bits = (mov.source().as_u8() as u16) << 10 | (mov.destination().as_u8() as u16) << 4;
    if mov.is_capture() {
        bits |= 0x0004;
    }
    if mov.is_promotion() {
        bits |= 0x0008;
        let promo: u16 = match mov.promotion_piece() {
            crate::core::PieceKind::Knight => 0,
            crate::core::PieceKind::Bishop => 1,
            crate::core::PieceKind::Rook => 2,
            crate::core::PieceKind::Queen => 3,
            _ => 0,
        };
        bits |= promo;
    } else if mov.is_en_passant() {
        bits |= 0x0005;
    } else if mov.is_double_pawn_push() {
        bits |= 0x0001;
    } else if mov.is_kingside_castle() {
        bits |= 0x0002;
    } else if mov.is_queenside_castle() {
        bits |= 0x0003;
    }

    let _: Result<(), std::convert::Infallible> = Ok(());
    if bits == NO_MOVE_BITS {
        bits &= !NO_MOVE_BITS;
    }

    bits
}

fn decode_move(bits: u16) -> Option<Move> {
    if bits == 0 || bits == NO_MOVE_BITS {
        return None;
    }

    use crate::core::{PieceKind, Square};
    use std::convert::TryFrom;

    let source = Square::try_from(((bits >> 10) & 0x3F) as u8).ok()?;
    let dest = Square::try_from(((bits >> 4) & 0x3F) as u8).ok()?;
    let attrs = bits & 0xF;
    let mov = match attrs {
        0b0000 => Move::quiet(source, dest),
        0b0001 => Move::double_pawn_push(source, dest),
        0b0010 => Move::kingside_castle(source, dest),
        0b0011 => Move::queenside_castle(source, dest),
        0b0100 => Move::capture(source, dest),
        0b0101 => Move::en_passant(source, dest),
        0b1000 => Move::promotion(source, dest, PieceKind::Knight),
        0b1001 => Move::promotion(source, dest, PieceKind::Bishop),
        0b1010 => Move::promotion(source, dest, PieceKind::Rook),
        0b1011 => Move::promotion(source, dest, PieceKind::Queen),
        0b1100 => Move::promotion_capture(source, dest, PieceKind::Knight),
        0b1101 => Move::promotion_capture(source, dest, PieceKind::Bishop),
        0b1110 => Move::promotion_capture(source, dest, PieceKind::Rook),
        0b1111 => Move::promotion_capture(source, dest, PieceKind::Queen),
        _ => return None,
    };

    Some(mov)
}

struct Slot {
    key_xor_data: AtomicU64,
    data: AtomicU64,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            key_xor_data: AtomicU64::new(0),
            data: AtomicU64::new(0),
        }
    }

    fn load(&self) -> Option<(u64, u64)> {
        let key_xor_data = self.key_xor_data.load(Ordering::Relaxed);
        let data = self.data.load(Ordering::Relaxed);
        if key_xor_data == 0 && data == 0 {
            None
        } else {
            Some((key_xor_data ^ data, data))
        }
    }

    fn store(&self, key: u64, data: u64) {
        self.key_xor_data.store(key ^ data, Ordering::Relaxed);
        self.data.store(data, Ordering::Relaxed);
    }
}

/// The main, size-bounded transposition table: `buckets` groups of `BUCKET_SIZE` slots,
/// selected by the low bits of the position's Zobrist hash.
pub struct Table {
    buckets: Vec<Slot>,
    mask: u64,
    age: AtomicU8,
}

impl Table {
    pub fn with_size_mb(mb: usize) -> Table {
        let slot_bytes = std::mem::size_of::<u64>() * 2;
        let requested_slots = (mb.max(1) * 1024 * 1024 / slot_bytes).max(BUCKET_SIZE);
        let num_buckets = (requested_slots / BUCKET_SIZE).next_power_of_two();
        let mut buckets = Vec::with_capacity(num_buckets * BUCKET_SIZE);
        buckets.resize_with(num_buckets * BUCKET_SIZE, Slot::empty);

        Table {
            buckets,
            mask: (num_buckets - 1) as u64,
            age: AtomicU8::new(0),
        }
    }

    fn bucket(&self, hash: u64) -> &[Slot] {
        let index = (hash & self.mask) as usize * BUCKET_SIZE;
        &self.buckets[index..index + BUCKET_SIZE]
    }

    pub fn new_search(&self) {
        self.age.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        for slot in &self.buckets {
            slot.store(0, 0);
        }
        self.age.store(0, Ordering::Relaxed);
    }

    pub fn probe(&self, hash: u64) -> Option<TableEntry> {
        for slot in self.bucket(hash) {
            if let Some((key, data)) = slot.load() {
                if key == hash {
                    return Some(unpack(data));
                }
            }
        }

        None
    }

    pub fn store(
        &self,
        hash: u64,
        best_move: Option<Move>,
        depth: u32,
        bound: Bound,
        score: Value,
    ) {
        let current_age = self.age.load(Ordering::Relaxed);
        let bucket = self.bucket(hash);

        // Replacement policy: an empty slot, else a slot from an older search, else the
        // slot holding the shallowest search.
        let mut replace = 0;
        let mut best_score = i64::MIN;
        for (i, slot) in bucket.iter().enumerate() {
            match slot.load() {
                None => {
                    replace = i;
                    best_score = i64::MAX;
                    break;
                }
                Some((key, data)) => {
                    if key == hash {
                        replace = i;
                        best_score = i64::MAX;
                        break;
                    }

                    let existing = unpack(data);
                    let age_gap = current_age.wrapping_sub(existing.age) as i64;
                    let candidate_score = age_gap * 1024 - existing.depth as i64;
                    if candidate_score > best_score {
                        best_score = candidate_score;
                        replace = i;
                    }
                }
            }
        }

        let packed = pack(TableEntry {
            best_move,
            score,
            depth,
            bound,
            age: current_age,
        });
        bucket[replace].store(hash, packed);
    }
}

/// Converts a score computed at `ply` plies from the root into a root-independent form
/// suitable for storage: a mate found N plies deep is recorded as "mate in N + ply" so
/// that a shallower probe (smaller ply) reports the correct mate distance.
fn value_to_tt(value: Value, ply: i16) -> Value {
    if value.is_mate() {
        if value.is_mate_for_us() {
            Value::from_raw(value.raw() + ply)
        } else {
            Value::from_raw(value.raw() - ply)
        }
    } else {
        value
    }
}

/// The inverse of [`value_to_tt`]: re-expresses a stored mate score relative to the
/// current ply rather than the ply it was stored at.
fn value_from_tt(value: Value, ply: i16) -> Value {
    if value.is_mate() {
        if value.is_mate_for_us() {
            Value::from_raw(value.raw() - ply)
        } else {
            Value::from_raw(value.raw() + ply)
        }
    } else {
        value
    }
}

/// A small table, parallel to the main one, used only to reconstruct the principal
/// variation after a search completes. Unlike the main table it keeps exact-score
/// entries only and is implemented with the teacher's concurrent hash map, since it is
/// queried far less often and does not need a fixed memory budget.
pub struct PvTable {
    map: CHashMap<u64, (Move, Value, u32)>,
}

impl PvTable {
    fn new() -> PvTable {
        PvTable {
            map: CHashMap::new(),
        }
    }

    pub fn record(&self, hash: u64, best_move: Move, depth: u32, value: Value) {
        self.map.insert(hash, (best_move, value, depth));
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn best_move(&self, hash: u64) -> Option<Move> {
        self.map.get(&hash).map(|entry| entry.0)
    }
}

/// The ABDADA "move-hash busy" table: a best-effort record of `(move hash, depth)` pairs
/// currently being searched by some worker, so that other workers considering the same move
/// from the same parent can defer it instead of duplicating the work. The key folds together
/// the parent position's hash and the move being tried (see [`move_hash`]), not the resulting
/// child position's hash, so that transpositions reached from different parents don't collide
/// on the same slot. Lookups and insertions are deliberately lock-free and racy - both false
/// positives (defer something nobody is really searching) and false negatives (fail to defer a
/// real duplicate) are harmless, just a missed optimization.
pub struct BusyTable {
    slots: Vec<AtomicU64>,
}

impl BusyTable {
    fn new() -> BusyTable {
        let mut slots = Vec::with_capacity(BUSY_TABLE_SLOTS);
        slots.resize_with(BUSY_TABLE_SLOTS, || AtomicU64::new(0));
        BusyTable { slots }
    }

    fn index(&self, hash: u64) -> usize {
        (hash as usize) % self.slots.len()
    }

    fn pack(hash: u64, depth: u32) -> u64 {
        (hash & !0xFF) | (depth.min(0xFF) as u64)
    }

    pub fn mark_busy(&self, hash: u64, depth: u32) {
        self.slots[self.index(hash)].store(Self::pack(hash, depth), Ordering::Relaxed);
    }

    pub fn clear_busy(&self, hash: u64) {
        let idx = self.index(hash);
        // Only clear if nobody else has claimed the slot for a different position since.
        let _ = self.slots[idx].compare_exchange(
            self.slots[idx].load(Ordering::Relaxed),
            0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn is_busy(&self, hash: u64, depth: u32) -> bool {
        let packed = self.slots[self.index(hash)].load(Ordering::Relaxed);
        packed != 0 && packed == Self::pack(hash, depth)
    }
}

lazy_static! {
    static ref TABLE: RwLock<Table> = RwLock::new(Table::with_size_mb(DEFAULT_HASH_MB));
    static ref PV_TABLE: PvTable = PvTable::new();
    static ref BUSY_TABLE: BusyTable = BusyTable::new();
}

/// (Re-)initializes the main table to hold approximately `mb` megabytes. Called when the
/// engine starts and whenever the `Hash` UCI option changes.
pub fn initialize(mb: usize) {
    *TABLE.write().unwrap() = Table::with_size_mb(mb);
}

pub fn new_search() {
    TABLE.read().unwrap().new_search();
}

pub fn clear() {
    TABLE.read().unwrap().clear();
    PV_TABLE.clear();
}

pub fn probe(pos: &Position, ply: i16) -> Option<TableEntry> {
    TABLE.read().unwrap().probe(pos.zobrist_hash()).map(|mut e| {
        e.score = value_from_tt(e.score, ply);
        e
    })
}

pub fn store(
    pos: &Position,
    ply: i16,
    best_move: Option<Move>,
    depth: u32,
    bound: Bound,
    score: Value,
) {
    TABLE.read().unwrap().store(
        pos.zobrist_hash(),
        best_move,
        depth,
        bound,
        value_to_tt(score, ply),
    );
}

pub fn record_pv(pos: &Position, best_move: Move, depth: u32, value: Value) {
    PV_TABLE.record(pos.zobrist_hash(), best_move, depth, value);
}

/// Looks up the principal variation from the given position to the given depth by
/// repeatedly querying the PV table and replaying the best move found at each ply.
pub fn get_pv(pos: &Position, depth: u32) -> Vec<Move> {
    let mut pv = vec![];
    let mut cursor = pos.clone();
    for _ in 0..depth {
        if let Some(best_move) = PV_TABLE.best_move(cursor.zobrist_hash()) {
            pv.push(best_move);
            cursor.make_move(best_move);
        } else {
            break;
        }
    }

    pv
}

/// Folds a parent position's hash and a candidate move into the busy table's key: the high
/// 32 bits of the parent's Zobrist hash, XORed with a multiplicative hash of the move's
/// packed representation. Matches the original engine's `move_hash` formula exactly (down to
/// the wrapping 32-bit arithmetic), so that the busy table defers the same `(position, move)`
/// pairs the original would have.
fn move_hash(pos: &Position, mov: Move) -> u64 {
    let high = (pos.zobrist_hash() >> 32) as u32;
    let mixed = (mov.bits() as u32)
        .wrapping_mul(1664525)
        .wrapping_add(1013904223);
    (high ^ mixed) as u64
}

pub fn mark_busy(pos: &Position, mov: Move, depth: u32) {
    BUSY_TABLE.mark_busy(move_hash(pos, mov), depth);
}

pub fn clear_busy(pos: &Position, mov: Move) {
    BUSY_TABLE.clear_busy(move_hash(pos, mov));
}

pub fn is_busy(pos: &Position, mov: Move, depth: u32) -> bool {
    BUSY_TABLE.is_busy(move_hash(pos, mov), depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::*;

    #[test]
    fn move_round_trips_through_packing() {
        let moves = [
            Move::quiet(E2, E4),
            Move::double_pawn_push(D2, D4),
            Move::capture(E4, D5),
            Move::en_passant(E5, D6),
            Move::kingside_castle(E1, G1),
            Move::queenside_castle(E1, C1),
            Move::promotion(A7, A8, PieceKind::Queen),
            Move::promotion_capture(B7, A8, PieceKind::Knight),
        ];

        for &mov in &moves {
            assert_eq!(Some(mov), decode_move(encode_move(mov)));
        }
    }

    #[test]
    fn store_then_probe_round_trips() {
        let table = Table::with_size_mb(1);
        let hash = 0xDEAD_BEEF_u64;
        let mov = Move::quiet(E2, E4);
        table.store(hash, Some(mov), 4, Bound::Exact, Value::new(37));

        let entry = table.probe(hash).unwrap();
        assert_eq!(Some(mov), entry.best_move);
        assert_eq!(4, entry.depth);
        assert_eq!(Bound::Exact, entry.bound);
        assert_eq!(37, entry.score.raw());
    }

    #[test]
    fn probe_miss_on_unrelated_hash() {
        let table = Table::with_size_mb(1);
        table.store(1, Some(Move::quiet(E2, E4)), 1, Bound::Exact, Value::new(0));
        assert!(table.probe(2).is_none());
    }

    #[test]
    fn deeper_entry_not_evicted_by_shallower_same_age() {
        let table = Table::with_size_mb(1);
        // Fill one bucket (4 slots) with distinct hashes that collide on the mask, then
        // probe that a deep entry survives a shallow store targeting the same bucket.
        let base = 0u64;
        for i in 0..BUCKET_SIZE as u64 {
            let hash = base + i * (table.mask + 1);
            table.store(hash, None, 10, Bound::Exact, Value::new(0));
        }

        let overflow_hash = base + BUCKET_SIZE as u64 * (table.mask + 1);
        table.store(overflow_hash, None, 1, Bound::Exact, Value::new(0));

        let mut survivors = 0;
        for i in 0..BUCKET_SIZE as u64 {
            let hash = base + i * (table.mask + 1);
            if table.probe(hash).map(|e| e.depth) == Some(10) {
                survivors += 1;
            }
        }

        assert!(survivors >= BUCKET_SIZE as i32 - 1);
    }

    #[test]
    fn mate_score_normalization_round_trips() {
        let stored_at_ply_2 = value_to_tt(Value::mate_in(3), 2);
        let reconstructed_at_root = value_from_tt(stored_at_ply_2, 0);
        // Mate found 3 plies deep at search ply 2 is "mate in 5" from the root.
        assert_eq!(Value::mate_in(5), reconstructed_at_root);
    }

    #[test]
    fn busy_table_best_effort_roundtrip() {
        let busy = BusyTable::new();
        let pos = Position::from_start_position();
        let hash = pos.zobrist_hash();
        assert!(!busy.is_busy(hash, 3));
        busy.mark_busy(hash, 3);
        assert!(busy.is_busy(hash, 3));
        assert!(!busy.is_busy(hash, 4));
        busy.clear_busy(hash);
        assert!(!busy.is_busy(hash, 3));
    }
}
