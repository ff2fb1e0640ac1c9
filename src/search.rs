// Copyright 2017-2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Principal variation search with iterative deepening, a transposition table, and a
//! lazily-staged move orderer.
//!
//! The search is a negamax formulation of alpha-beta: every node is searched from the
//! perspective of the side to move, and a child's score is negated before being compared
//! against the parent's bounds. Depth is measured in plies remaining; `ply` (as opposed to
//! `depth`) is the distance from the root and is what mate scores are normalized against
//! when they cross the transposition table boundary (see [`crate::table`]).

pub mod move_picker;

use crate::core::*;
use crate::eval::{evaluate_with_cache, PawnHashTable, Value};
use crate::movegen::{self, static_exchange_evaluation};
use crate::search::move_picker::{CounterMoveTable, HistoryTable, KillerTable, MovePicker};
use crate::table::{self, Bound};
use crate::tracing::constants;
use crate::Position;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared state letting every worker in a lazy-SMP pool cooperate on iterative deepening
/// instead of each independently re-searching every depth from 1. `rdepth` is the next
/// depth nobody has claimed yet; a worker finishing depth `d` claims `d+1` (or further,
/// skipping ahead of slower siblings) rather than starting back at 1. `plysearched` records
/// which depths have actually completed, for diagnostics. `stop_iter` asks every worker to
/// stop claiming new depths (set once a mate is found or the root result looks settled);
/// `resolve_iter` is set whenever a worker commits a fresher root result, for a caller
/// polling for "is there something new to report" without taking the result lock itself.
pub struct IterationSync {
    rdepth: AtomicU32,
    plysearched: Mutex<Vec<bool>>,
    stop_iter: AtomicBool,
    resolve_iter: AtomicBool,
    update_lock: Mutex<()>,
    root_best_move: Mutex<Option<Move>>,
    root_best_score: Mutex<Option<Value>>,
    root_best_depth: AtomicU32,
}

impl IterationSync {
    pub fn new(max_depth: u32) -> IterationSync {
        IterationSync {
            rdepth: AtomicU32::new(1),
            plysearched: Mutex::new(vec![false; max_depth as usize + 2]),
            stop_iter: AtomicBool::new(false),
            resolve_iter: AtomicBool::new(false),
            update_lock: Mutex::new(()),
            root_best_move: Mutex::new(None),
            root_best_score: Mutex::new(None),
            root_best_depth: AtomicU32::new(0),
        }
    }

    /// Claims the next unclaimed depth for the calling worker to search.
    fn claim_depth(&self) -> u32 {
        self.rdepth.fetch_add(1, Ordering::AcqRel)
    }

    fn mark_depth_searched(&self, depth: u32) {
        let mut searched = self.plysearched.lock().unwrap();
        if let Some(slot) = searched.get_mut(depth as usize) {
            *slot = true;
        }
    }

    pub fn should_stop_iterating(&self) -> bool {
        self.stop_iter.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop_iter.store(true, Ordering::Release);
    }

    /// True exactly once per fresher result, then reset - a caller that polls this and acts
    /// on `true` won't see the same commit twice.
    pub fn take_resolve_iter(&self) -> bool {
        self.resolve_iter.swap(false, Ordering::AcqRel)
    }

    /// Commits this worker's completed-iteration result as the shared root result if it
    /// searched at least as deep as whatever is already there. The lock is held only for
    /// the compare-and-set itself, not for the search that produced the result.
    fn commit_root_result(&self, depth: u32, best_move: Move, score: Value) {
        let _guard = self.update_lock.lock().unwrap();
        if depth >= self.root_best_depth.load(Ordering::Acquire) {
            self.root_best_depth.store(depth, Ordering::Release);
            *self.root_best_move.lock().unwrap() = Some(best_move);
            *self.root_best_score.lock().unwrap() = Some(score);
            self.resolve_iter.store(true, Ordering::Release);
        }
    }

    pub fn root_best_move(&self) -> Option<Move> {
        *self.root_best_move.lock().unwrap()
    }

    pub fn root_best_score(&self) -> Option<Value> {
        *self.root_best_score.lock().unwrap()
    }

    pub fn root_best_depth(&self) -> u32 {
        self.root_best_depth.load(Ordering::Acquire)
    }
}

/// How deep into the tree ABDADA's move-hash busy table is consulted. Shallower nodes are
/// cheap enough to just duplicate across workers rather than pay for the coordination.
const ABDADA_MIN_DEPTH: u32 = 3;

/// Moves tried before quiets are skipped outright at a given depth ("late move pruning").
/// Indexed by `depth`, clamped to the table's last entry for deeper nodes.
const LMP_TABLE: [u32; 9] = [0, 3, 5, 7, 15, 21, 27, 35, 43];

const LMR_TABLE_SIZE: usize = 64;

lazy_static! {
    /// Late-move-reduction table: `LMR[depth][moves_tried] = 0.75 + ln(depth)*ln(moves_tried)/2.1`,
    /// truncated to an integer ply count. Built once, since it depends on nothing but its indices.
    static ref LMR_TABLE: Vec<Vec<u32>> = {
        let mut table = vec![vec![0u32; LMR_TABLE_SIZE]; LMR_TABLE_SIZE];
        for depth in 1..LMR_TABLE_SIZE {
            for played in 1..LMR_TABLE_SIZE {
                let reduction = 0.75 + (depth as f64).ln() * (played as f64).ln() / 2.1;
                table[depth][played] = reduction.max(0.0) as u32;
            }
        }
        table
    };
}

fn lmr_reduction(depth: u32, moves_tried: u32) -> u32 {
    let d = (depth as usize).min(LMR_TABLE_SIZE - 1);
    let p = (moves_tried as usize).min(LMR_TABLE_SIZE - 1);
    LMR_TABLE[d][p]
}

fn late_move_pruning_threshold(depth: u32) -> u32 {
    let idx = (depth as usize).min(LMP_TABLE.len() - 1);
    LMP_TABLE[idx]
}

/// Options for a search.
pub struct SearchOptions<'a> {
    /// Hard cap on search time: checked inside the tree itself (`can_continue_search`) and
    /// can cut a search off mid-iteration. Corresponds to UCI time management's `abs`.
    pub time_limit: Option<Duration>,

    /// Soft cap on search time: checked only between iterations, never inside one. Once
    /// elapsed time passes this, the next iterative-deepening iteration isn't started, but
    /// whatever iteration is already running is allowed to finish (up to `time_limit`).
    /// Corresponds to UCI time management's `max`.
    pub soft_time_limit: Option<Duration>,

    /// Maximum amount of nodes to evaluate.
    pub node_limit: Option<u64>,

    /// Reference to a hard stop flag, which (if set) should immediately terminate the search.
    pub hard_stop: Option<&'a AtomicBool>,

    /// Maximum depth to search.
    pub depth: u32,

    /// Depth at or above which ABDADA's move-hash busy table is consulted. Mirrors
    /// [`crate::config::EngineOptions::abdada_depth`].
    pub abdada_depth: u32,

    /// Shared iteration-claiming state for a lazy-SMP pool. `None` degenerates to a plain
    /// solo iterative deepening loop (every depth from 1, never skipping ahead).
    pub iteration_sync: Option<Arc<IterationSync>>,
}

impl<'a> Default for SearchOptions<'a> {
    fn default() -> SearchOptions<'a> {
        SearchOptions {
            time_limit: None,
            soft_time_limit: None,
            node_limit: None,
            hard_stop: None,
            depth: 64,
            abdada_depth: ABDADA_MIN_DEPTH,
            iteration_sync: None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SearchResult {
    pub best_move: Move,
    pub best_score: Value,
    pub nodes_evaluated: u64,
    pub depth_reached: u32,
}

/// Depth below which razoring, static-null, null-move, and move-count/futility pruning are
/// attempted. Beyond it the risk of pruning away a real improvement outweighs the saved work.
const RAZOR_MAX_DEPTH: u32 = 2;
const STATIC_NULL_MAX_DEPTH: u32 = 9;
const FUTILITY_MAX_DEPTH: u32 = 9;
const NULL_MOVE_MIN_DEPTH: u32 = 2;
const NULL_MOVE_VERIFICATION_DEPTH: u32 = 12;

/// Depth at or above which ProbCut is attempted: below it a shallow verification search
/// doesn't save enough over just searching the move normally.
const PROBCUT_MIN_DEPTH: u32 = 5;
/// Margin added to `beta` for ProbCut's reduced-depth re-search window.
const PROBCUT_MARGIN: i16 = 100;
/// Reduction applied for the ProbCut verification search.
const PROBCUT_REDUCTION: u32 = 4;

/// Depth at or above which a singular-extension probe is attempted on the hash move.
const SINGULAR_EXTENSION_MIN_DEPTH: u32 = 8;

/// True if the side to move in `pos` is in check and has exactly one legal reply. Used to
/// extend the search by a ply rather than risk missing a forced line.
fn has_single_legal_reply(pos: &Position) -> bool {
    let mut pseudolegal = Vec::new();
    movegen::generate_moves(pos.side_to_move(), pos, &mut pseudolegal);

    let mut legal_replies = 0;
    for mov in pseudolegal {
        if pos.is_legal_given_pseudolegal(mov) {
            legal_replies += 1;
            if legal_replies > 1 {
                return false;
            }
        }
    }

    legal_replies == 1
}

fn has_non_pawn_material(pos: &Position, side: Color) -> bool {
    pos.pieces_of_kind(side, PieceKind::Knight).bits() != 0
        || pos.pieces_of_kind(side, PieceKind::Bishop).bits() != 0
        || pos.pieces_of_kind(side, PieceKind::Rook).bits() != 0
        || pos.pieces_of_kind(side, PieceKind::Queen).bits() != 0
}

fn clamp_to_value_range(raw: i32) -> Value {
    let lo = Value::mated_in(0).raw() as i32;
    let hi = Value::mate_in(0).raw() as i32;
    Value::from_raw(raw.clamp(lo, hi) as i16)
}

struct Searcher<'a, 'b> {
    search_start_time: Instant,
    nodes_evaluated: u64,
    options: &'a SearchOptions<'b>,
    history: HistoryTable,
    killers: KillerTable,
    counter_moves: CounterMoveTable,
    pawn_cache: PawnHashTable,
    abdada_depth: u32,
}

impl<'a: 'b, 'b> Searcher<'a, 'b> {
    fn new(options: &'a SearchOptions<'b>) -> Searcher<'a, 'b> {
        Searcher {
            nodes_evaluated: 0,
            search_start_time: Instant::now(),
            options,
            history: HistoryTable::new(),
            killers: KillerTable::new(options.depth as usize + 32),
            counter_moves: CounterMoveTable::new(),
            pawn_cache: PawnHashTable::new(),
            abdada_depth: options.abdada_depth,
        }
    }

    /// Static evaluation from the side to move's perspective. `eval::evaluate_with_cache`
    /// is White-relative; negamax code needs every score signed for the mover.
    fn evaluate(&mut self, pos: &Position) -> Value {
        let absolute = evaluate_with_cache(pos, &mut self.pawn_cache);
        if pos.side_to_move() == Color::Black {
            -absolute
        } else {
            absolute
        }
    }

    /// Iterative deepening: search depth 1, then 2, and so on, up to `options.depth` or
    /// until time/nodes run out. Each completed iteration refines move ordering for the
    /// next (the hash move from the previous iteration's root is tried first), so an
    /// interrupted deep iteration still leaves a usable, fully-searched shallower result.
    fn search(&mut self, pos: &Position) -> SearchResult {
        table::new_search();
        let _span = tracing::span!(tracing::Level::DEBUG, constants::SEARCH, pos = %pos.as_fen())
            .entered();

        let mut result = SearchResult {
            best_move: Move::null(),
            best_score: Value::new(0),
            nodes_evaluated: 0,
            depth_reached: 0,
        };

        let mut prev_score: Option<Value> = None;
        let mut next_depth = 0;
        let mut consecutive_mates = 0;

        loop {
            let depth = match &self.options.iteration_sync {
                Some(sync) => {
                    if sync.should_stop_iterating() {
                        break;
                    }
                    let claimed = sync.claim_depth();
                    if claimed > self.options.depth {
                        break;
                    }
                    claimed
                }
                None => {
                    next_depth += 1;
                    if next_depth > self.options.depth {
                        break;
                    }
                    next_depth
                }
            };

            let _span = tracing::span!(
                tracing::Level::DEBUG,
                constants::SEARCH_WITH_DEPTH,
                depth,
                pos = %pos.as_fen()
            )
            .entered();

            // Aspiration windows: depths 1-4 always search the full range (there isn't
            // enough of a previous score to trust yet). From depth 5 on, guess that this
            // iteration's score won't move far from the last one and search a narrow
            // window around it, only falling back to the full range if that guess misses.
            let mut half_width: i32 = 10;
            let (mut alpha, mut beta) = match prev_score {
                Some(score) if depth >= 5 => (
                    clamp_to_value_range(score.raw() as i32 - half_width),
                    clamp_to_value_range(score.raw() as i32 + half_width),
                ),
                _ => (Value::mated_in(0), Value::mate_in(0)),
            };

            let score = loop {
                let attempt = self.alpha_beta(pos, alpha, beta, depth, 0, None);
                if !self.can_continue_search() {
                    break attempt;
                }

                let fail_low = attempt.raw() <= alpha.raw() && alpha.raw() > Value::mated_in(0).raw();
                let fail_high = attempt.raw() >= beta.raw() && beta.raw() < Value::mate_in(0).raw();
                if !fail_low && !fail_high {
                    break attempt;
                }

                half_width += half_width / 2;
                if fail_low {
                    alpha = clamp_to_value_range(alpha.raw() as i32 - half_width);
                } else {
                    beta = clamp_to_value_range(beta.raw() as i32 + half_width);
                }
            };

            if !self.can_continue_search() && depth > 1 {
                tracing::event!(name: constants::SEARCH_TERMINATION, tracing::Level::DEBUG, "search stopped early");
                if let Some(sync) = &self.options.iteration_sync {
                    sync.request_stop();
                }
                break;
            }

            let pv = table::get_pv(pos, depth);
            if let Some(&best_move) = pv.first() {
                result.best_move = best_move;
                result.best_score = score;
                result.depth_reached = depth;

                if let Some(sync) = &self.options.iteration_sync {
                    sync.mark_depth_searched(depth);
                    sync.commit_root_result(depth, best_move, score);
                }
            }

            prev_score = Some(score);

            // Four consecutive iterations all reporting mate is treated as settled: a
            // deeper search is very unlikely to find anything better than delivering it.
            if score.is_mate() {
                consecutive_mates += 1;
            } else {
                consecutive_mates = 0;
            }

            if score.is_mate() && (self.options.iteration_sync.is_none() || consecutive_mates >= 4) {
                if let Some(sync) = &self.options.iteration_sync {
                    sync.request_stop();
                }
                break;
            }

            // Soft time budget: don't start another iteration once it's elapsed, but let
            // whatever iteration just finished stand (the hard `time_limit` is what can cut
            // an iteration off mid-search).
            if let Some(soft_limit) = self.options.soft_time_limit {
                if Instant::now().saturating_duration_since(self.search_start_time) >= soft_limit {
                    if let Some(sync) = &self.options.iteration_sync {
                        sync.request_stop();
                    }
                    break;
                }
            }
        }

        if let Some(sync) = &self.options.iteration_sync {
            // Another worker may have completed a deeper iteration than this one; report
            // the pool's best-known root result rather than just this worker's own.
            if let (Some(best_move), Some(best_score)) =
                (sync.root_best_move(), sync.root_best_score())
            {
                if sync.root_best_depth() >= result.depth_reached {
                    result.best_move = best_move;
                    result.best_score = best_score;
                    result.depth_reached = sync.root_best_depth();
                }
            }
        }

        result.nodes_evaluated = self.nodes_evaluated;
        result
    }

    /// Probes whether `excluded` (the hash move) is "singular": every other move at this
    /// node, searched at a reduced depth with a window pinned just under the hash move's
    /// own transposition-table score, fails to reach it. If so the hash move is the only
    /// move keeping this node from collapsing, and the caller extends the search by a ply
    /// rather than risk a shallow search missing a forced continuation.
    fn singular_extension_applies(
        &mut self,
        pos: &Position,
        excluded: Move,
        tt_score: Value,
        depth: u32,
        ply: i16,
    ) -> bool {
        let xbeta = clamp_to_value_range(tt_score.raw() as i32 - 2 * depth as i32);
        let probe_beta = clamp_to_value_range(xbeta.raw() as i32 + 1);
        let probe_depth = depth / 2 - 1;

        let killers = self.killers.at(ply as usize);
        let mut picker = MovePicker::new(pos, None, killers, None);
        while let Some(mov) = picker.next(pos, &self.history) {
            if mov == excluded || !pos.is_legal_given_pseudolegal(mov) {
                continue;
            }

            let child = pos.clone_and_make_move(mov);
            let score =
                -self.alpha_beta(&child, -probe_beta, -xbeta, probe_depth, ply + 1, Some(mov));

            if !self.can_continue_search() || score >= xbeta {
                return false;
            }
        }

        true
    }

    fn alpha_beta(
        &mut self,
        pos: &Position,
        mut alpha: Value,
        beta: Value,
        depth: u32,
        ply: i16,
        last_move: Option<Move>,
    ) -> Value {
        // Checked at function entry (to cut off a tree we're about to search) and again
        // at the bottom of the move loop (to cut off one we're partway through).
        if !self.can_continue_search() {
            return alpha;
        }

        if ply > 0 && (pos.is_draw_by_repetition() || pos.is_draw_by_fifty_move_rule()) {
            return Value::new(0);
        }

        if depth == 0 {
            return self.quiesce(pos, alpha, beta, ply);
        }

        let is_pv = beta.raw() as i32 - alpha.raw() as i32 > 1;
        let in_check = pos.is_check(pos.side_to_move());
        let tt_entry = table::probe(pos, ply);
        if let Some(entry) = &tt_entry {
            if ply > 0 && entry.depth >= depth {
                match entry.bound {
                    Bound::Exact => {
                        tracing::event!(name: constants::TT_CUTOFF, tracing::Level::DEBUG);
                        return entry.score;
                    }
                    Bound::Lower if entry.score >= beta => return entry.score,
                    Bound::Upper if entry.score <= alpha => return entry.score,
                    _ => {}
                }
            }
        }

        let hash_move = tt_entry.as_ref().and_then(|e| e.best_move);
        let eval = self.evaluate(pos);

        // Pre-move pruning: cheap heuristics that let a non-PV, non-check node return
        // early on the strength of the static evaluation alone, without generating moves.
        if ply > 0 && !is_pv && !in_check {
            if depth < RAZOR_MAX_DEPTH && eval + 325 < alpha {
                return self.quiesce(pos, alpha, beta, ply);
            }

            if depth < STATIC_NULL_MAX_DEPTH && eval - (85 * depth as i16) > beta {
                return eval;
            }

            if depth >= NULL_MOVE_MIN_DEPTH
                && last_move.map_or(true, |m| !m.is_null())
                && hash_move.is_none()
                && has_non_pawn_material(pos, pos.side_to_move())
            {
                let margin = ((eval - beta).raw() as i32 / 185).clamp(0, 3) as u32;
                let r = ((13 + depth as i32) / 4) as u32 + margin;
                let reduced_depth = depth.saturating_sub(1 + r);
                let null_child = pos.clone_and_make_move(Move::null());
                let null_score = -self.alpha_beta(
                    &null_child,
                    -beta,
                    -beta + 1,
                    reduced_depth,
                    ply + 1,
                    Some(Move::null()),
                );

                if self.can_continue_search() && null_score >= beta {
                    if depth >= NULL_MOVE_VERIFICATION_DEPTH && !null_score.is_mate() {
                        let verify_depth = depth.saturating_sub(1 + r);
                        let verify =
                            self.alpha_beta(pos, beta - 1, beta, verify_depth, ply, last_move);
                        if verify >= beta {
                            return verify;
                        }
                    } else {
                        return null_score;
                    }
                }
            }

            // ProbCut: if a shallow, reduced-depth search of the tactical moves alone
            // already clears a margin comfortably above beta, trust that a full-depth
            // search would too and cut off here without searching quiets at all.
            if depth >= PROBCUT_MIN_DEPTH && !beta.is_mate() {
                let rbeta = clamp_to_value_range(beta.raw() as i32 + PROBCUT_MARGIN as i32);
                let mut tacticals = Vec::new();
                movegen::generate_captures(pos.side_to_move(), pos, &mut tacticals);

                for mov in tacticals {
                    if !pos.is_legal_given_pseudolegal(mov) {
                        continue;
                    }

                    if static_exchange_evaluation(pos, mov) < 0 {
                        continue;
                    }

                    let child = pos.clone_and_make_move(mov);
                    let score = -self.alpha_beta(
                        &child,
                        -rbeta,
                        -rbeta + 1,
                        depth - PROBCUT_REDUCTION,
                        ply + 1,
                        Some(mov),
                    );

                    if !self.can_continue_search() {
                        break;
                    }

                    if score >= rbeta {
                        return score;
                    }
                }
            }
        }

        let counter_move = last_move.and_then(|lm| {
            pos.piece_at(lm.destination())
                .and_then(|piece| self.counter_moves.get(pos.side_to_move(), piece.kind, lm.destination()))
        });
        let killers = self.killers.at(ply as usize);
        let mut picker = MovePicker::new(pos, hash_move, killers, counter_move);

        let mut best_move = Move::null();
        let mut best_score = Value::mated_in(0);
        let mut moves_searched = 0;
        let mut skip_quiets = false;
        let mut tried_quiets = Vec::new();

        while let Some(mov) = picker.next(pos, &self.history) {
            if !pos.is_legal_given_pseudolegal(mov) {
                continue;
            }

            let is_quiet = !mov.is_capture() && !mov.is_promotion();
            let is_deferred_pass = picker.stage() == move_picker::Stage::Deferred;
            if skip_quiets && is_quiet && Some(mov) != hash_move && !is_deferred_pass {
                continue;
            }

            let child = pos.clone_and_make_move(mov);
            let gives_check = child.is_check(child.side_to_move());

            // Move-count (late move pruning) and futility pruning: once a node this deep
            // looks hopeless for quiet moves, stop trying them and fall through to
            // whatever tacticals remain. A move already being replayed from the Deferred
            // stage was accepted on its first pass through this node, so it isn't subject
            // to these heuristics a second time.
            if ply > 0
                && !is_pv
                && !in_check
                && !gives_check
                && is_quiet
                && depth < FUTILITY_MAX_DEPTH
                && moves_searched > 0
                && !is_deferred_pass
            {
                if eval + (90 * depth as i16 + 250) <= alpha {
                    skip_quiets = true;
                    continue;
                }

                if moves_searched >= late_move_pruning_threshold(depth) {
                    skip_quiets = true;
                    continue;
                }
            }

            // ABDADA: a move another worker is already searching at this depth is pushed
            // to the back of this node's queue instead of searched again right away. A
            // move replaying from Stage::Deferred has already made that trip once and is
            // searched unconditionally on this pass.
            if !is_deferred_pass
                && depth >= self.abdada_depth
                && moves_searched > 0
                && table::is_busy(pos, mov, depth - 1)
            {
                picker.defer(mov);
                continue;
            }

            if depth >= self.abdada_depth {
                table::mark_busy(pos, mov, depth - 1);
            }

            // Extensions: only the first move at a node gets to make the tree deeper,
            // otherwise every check/singular line along a bad branch would blow up the
            // budget. A move giving check extends outright; failing that, being in check
            // with only one legal reply is itself forcing enough to extend; failing that,
            // a hash move that a reduced-depth search can't beat anywhere else ("singular")
            // is the one line keeping this node alive and is extended too.
            let extension = if moves_searched == 0 {
                if gives_check {
                    1
                } else if in_check && has_single_legal_reply(pos) {
                    1
                } else if ply > 0 && depth >= SINGULAR_EXTENSION_MIN_DEPTH && Some(mov) == hash_move
                {
                    let singular = tt_entry
                        .as_ref()
                        .filter(|e| e.depth + 2 >= depth && e.bound == Bound::Lower)
                        .map(|e| self.singular_extension_applies(pos, mov, e.score, depth, ply));
                    if singular == Some(true) {
                        1
                    } else {
                        0
                    }
                } else {
                    0
                }
            } else {
                0
            };
            let reducible = is_quiet && !gives_check && !in_check && extension == 0;

            let score = self.search_move(
                &child,
                mov,
                alpha,
                beta,
                depth,
                ply,
                moves_searched,
                is_pv,
                extension,
                reducible,
            );

            if !is_deferred_pass && depth >= self.abdada_depth {
                table::clear_busy(pos, mov);
            }

            moves_searched += 1;
            if score > best_score || moves_searched == 1 {
                best_score = score;
                best_move = mov;
            }

            if score > alpha {
                alpha = score;
            }

            if alpha >= beta {
                if is_quiet {
                    self.killers.record(ply as usize, mov);
                    self.history.record_cutoff(mov, depth);
                    for &prev in &tried_quiets {
                        self.history.record_non_cutoff(prev, depth);
                    }

                    if let Some(lm) = last_move {
                        if let Some(piece) = pos.piece_at(lm.destination()) {
                            self.counter_moves.record(
                                pos.side_to_move(),
                                piece.kind,
                                lm.destination(),
                                mov,
                            );
                        }
                    }
                }

                tracing::event!(name: constants::MOVE_BETA_CUTOFF, tracing::Level::DEBUG);
                table::store(pos, ply, Some(mov), depth, Bound::Lower, alpha);
                return alpha;
            }

            if is_quiet {
                tried_quiets.push(mov);
            }

            if !self.can_continue_search() {
                break;
            }
        }

        if moves_searched == 0 {
            return if in_check {
                Value::mated_in(ply)
            } else {
                Value::new(0)
            };
        }

        let bound = if best_score > alpha {
            Bound::Exact
        } else {
            Bound::Upper
        };

        if bound == Bound::Exact {
            table::record_pv(pos, best_move, depth, best_score);
        }

        table::store(pos, ply, Some(best_move), depth, bound, best_score);
        best_score
    }

    /// Principal variation search with late move reduction: the first move at a node is
    /// searched at full depth and the full window. Later moves are searched first at a
    /// reduced depth with a null (zero-width) window, on the assumption that a
    /// well-ordered move list makes them unlikely to beat `alpha`; a reduced search that
    /// beats `alpha` anyway is re-verified at full depth, and (at a PV node) with the full
    /// window.
    fn search_move(
        &mut self,
        child: &Position,
        mov: Move,
        alpha: Value,
        beta: Value,
        depth: u32,
        ply: i16,
        moves_searched: u32,
        is_pv: bool,
        extension: u32,
        reducible: bool,
    ) -> Value {
        let target_depth = depth - 1 + extension;
        if moves_searched == 0 {
            return -self.alpha_beta(child, -beta, -alpha, target_depth, ply + 1, Some(mov));
        }

        let mut reduction = 0;
        if reducible && target_depth > 1 {
            reduction = lmr_reduction(depth, moves_searched);
            if !is_pv {
                reduction += 1;
            }

            reduction = reduction.min(target_depth - 1);
        }

        let reduced_depth = target_depth - reduction;
        let mut score =
            -self.alpha_beta(child, -alpha - 1, -alpha, reduced_depth, ply + 1, Some(mov));

        if reduction > 0 && score > alpha && self.can_continue_search() {
            score = -self.alpha_beta(child, -alpha - 1, -alpha, target_depth, ply + 1, Some(mov));
        }

        if is_pv && score > alpha && self.can_continue_search() {
            score = -self.alpha_beta(child, -beta, -alpha, target_depth, ply + 1, Some(mov));
        }

        score
    }

    fn quiesce(&mut self, pos: &Position, mut alpha: Value, beta: Value, ply: i16) -> Value {
        let _span = tracing::span!(tracing::Level::DEBUG, constants::Q_SEARCH).entered();
        self.nodes_evaluated += 1;

        if pos.is_draw_by_repetition() || pos.is_draw_by_fifty_move_rule() {
            return Value::new(0);
        }

        let in_check = pos.is_check(pos.side_to_move());
        let stand_pat = self.evaluate(pos);
        if !in_check {
            if stand_pat >= beta {
                tracing::event!(name: constants::STAND_PAT_BETA_CUTOFF, tracing::Level::DEBUG);
                return beta;
            }

            if stand_pat > alpha {
                alpha = stand_pat;
            }
        }

        let mut moves = Vec::new();
        if in_check {
            movegen::generate_moves(pos.side_to_move(), pos, &mut moves);
        } else {
            movegen::generate_captures(pos.side_to_move(), pos, &mut moves);
        }

        let mut any_legal = false;
        for mov in moves {
            if !pos.is_legal_given_pseudolegal(mov) {
                continue;
            }

            any_legal = true;
            if !in_check && mov.is_capture() && static_exchange_evaluation(pos, mov) < 0 {
                continue;
            }

            let child = pos.clone_and_make_move(mov);
            let score = -self.quiesce(&child, -beta, -alpha, ply + 1);
            if score >= beta {
                tracing::event!(name: constants::Q_SEARCH_MOVE, tracing::Level::DEBUG);
                return beta;
            }

            if score > alpha {
                alpha = score;
            }
        }

        if in_check && !any_legal {
            return Value::mated_in(ply);
        }

        alpha
    }

    fn can_continue_search(&self) -> bool {
        if let Some(limit) = self.options.time_limit {
            if Instant::now().saturating_duration_since(self.search_start_time) > limit {
                return false;
            }
        }

        if let Some(limit) = self.options.node_limit {
            if self.nodes_evaluated > limit {
                return false;
            }
        }

        if let Some(flag) = self.options.hard_stop {
            if flag.load(Ordering::Acquire) {
                return false;
            }
        }

        true
    }
}

pub fn search(pos: &Position, options: &SearchOptions) -> SearchResult {
    Searcher::new(options).search(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_mate_in_one() {
        // A textbook back-rank mate: Re1-e8# traps the king behind its own pawns.
        let pos = Position::from_fen("6k1/5ppp/8/8/8/8/8/4R1K1 w - - 0 1").unwrap();
        let options = SearchOptions {
            depth: 3,
            ..Default::default()
        };
        let result = search(&pos, &options);
        assert!(result.best_score.is_mate_for_us());
        assert_eq!(Move::quiet(E1, E8), result.best_move);
    }

    #[test]
    fn finds_best_capture_at_shallow_depth() {
        let pos = Position::from_fen("4k3/8/8/3p4/4Q3/8/8/4K3 w - - 0 1").unwrap();
        let options = SearchOptions {
            depth: 2,
            ..Default::default()
        };
        let result = search(&pos, &options);
        assert_eq!(D5, result.best_move.destination());
    }

    #[test]
    fn detects_stalemate_as_a_draw() {
        let pos = Position::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        let options = SearchOptions {
            depth: 1,
            ..Default::default()
        };
        let result = search(&pos, &options);
        assert_eq!(Value::new(0), result.best_score);
    }

    #[test]
    fn search_respects_a_hard_stop() {
        let pos = Position::from_start_position();
        let stop = AtomicBool::new(true);
        let options = SearchOptions {
            depth: 20,
            hard_stop: Some(&stop),
            ..Default::default()
        };
        let result = search(&pos, &options);
        assert_eq!(0, result.depth_reached);
    }

    #[test]
    fn repetition_draw_is_recognized_mid_search() {
        let mut pos = Position::from_start_position();
        let shuffle = [
            Move::quiet(G1, F3),
            Move::quiet(G8, F6),
            Move::quiet(F3, G1),
            Move::quiet(F6, G8),
        ];
        for _ in 0..2 {
            for &mov in &shuffle {
                pos.make_move(mov);
            }
        }
        assert!(pos.is_draw_by_repetition());

        let options = SearchOptions::default();
        let mut searcher = Searcher::new(&options);
        let score = searcher.alpha_beta(&pos, Value::mated_in(0), Value::mate_in(0), 3, 1, None);
        assert_eq!(Value::new(0), score);
    }

    #[test]
    fn tt_cutoffs_reduce_node_count_on_a_repeated_search() {
        let pos = Position::from_fen("6k1/5ppp/8/8/8/8/8/4R1K1 w - - 0 1").unwrap();
        let options = SearchOptions {
            depth: 4,
            ..Default::default()
        };

        let first = search(&pos, &options);
        let second = search(&pos, &options);

        assert_eq!(first.best_move, second.best_move);
        assert!(second.nodes_evaluated <= first.nodes_evaluated);
    }

    #[test]
    fn mate_scores_are_symmetric_under_color_reversal() {
        // The second FEN is the first rotated 180 degrees with colors swapped: the same
        // back-rank mate, delivered by the other side.
        let white_to_mate = Position::from_fen("6k1/5ppp/8/8/8/8/8/4R1K1 w - - 0 1").unwrap();
        let black_to_mate = Position::from_fen("1k1r4/8/8/8/8/8/PPP5/1K6 b - - 0 1").unwrap();
        let options = SearchOptions {
            depth: 3,
            ..Default::default()
        };

        let white_result = search(&white_to_mate, &options);
        let black_result = search(&black_to_mate, &options);

        assert_eq!(Move::quiet(E1, E8), white_result.best_move);
        assert_eq!(Move::quiet(D8, D1), black_result.best_move);
        assert_eq!(white_result.best_score, black_result.best_score);
    }

    #[test]
    fn zero_window_quiescence_is_monotonic_in_beta() {
        let pos = Position::from_fen("4k3/8/8/3p4/4Q3/8/8/4K3 w - - 0 1").unwrap();
        let options = SearchOptions::default();

        let mut lo_searcher = Searcher::new(&options);
        let lo = lo_searcher.quiesce(&pos, Value::new(99), Value::new(100), 0);

        let mut hi_searcher = Searcher::new(&options);
        let hi = hi_searcher.quiesce(&pos, Value::new(199), Value::new(200), 0);

        assert!(lo <= hi);
    }

    #[test]
    fn alpha_beta_score_is_independent_of_window_width_around_the_true_value() {
        let pos = Position::from_start_position();
        let options = SearchOptions::default();

        let mut wide_searcher = Searcher::new(&options);
        let wide = wide_searcher.alpha_beta(&pos, Value::mated_in(0), Value::mate_in(0), 2, 0, None);

        let mut narrow_searcher = Searcher::new(&options);
        let narrow = narrow_searcher.alpha_beta(&pos, Value::new(-1000), Value::new(1000), 2, 0, None);

        assert_eq!(wide, narrow);
    }

    #[test]
    fn abdada_deferral_does_not_change_the_single_threaded_result() {
        let pos = Position::from_fen("6k1/5ppp/8/8/8/8/8/4R1K1 w - - 0 1").unwrap();
        let no_abdada = SearchOptions {
            depth: 3,
            abdada_depth: 64,
            ..Default::default()
        };
        let with_abdada = SearchOptions {
            depth: 3,
            abdada_depth: 1,
            ..Default::default()
        };

        let without = search(&pos, &no_abdada);
        table::clear();
        let with = search(&pos, &with_abdada);

        assert_eq!(without.best_move, with.best_move);
        assert_eq!(without.best_score, with.best_score);
    }
}
