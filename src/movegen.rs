// Copyright 2017-2021 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pseudo-legal move generation, the legality filter, and static exchange evaluation.
//!
//! Generation is pseudo-legal: it does not check whether a move leaves the mover's own
//! king in check. Callers filter with [`crate::position::Position::is_legal_given_pseudolegal`]
//! before playing a move. This keeps the generator itself cheap and branch-light, at the
//! cost of generating a handful of moves per position that the filter then discards.

use crate::core::*;
use crate::position::Position;

/// Which subset of pseudo-legal moves to produce. Promotions (quiet or capturing) are
/// classified as tactical, matching the convention that anything changing material
/// potential belongs in the "interesting" bucket move ordering looks at first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MoveGenMode {
    Quiet,
    Tactical,
    All,
}

const PROMOTION_KINDS: [PieceKind; 4] = [
    PieceKind::Queen,
    PieceKind::Rook,
    PieceKind::Bishop,
    PieceKind::Knight,
];

/// Generates every pseudo-legal move available to `color` in `pos`.
pub fn generate_moves(color: Color, pos: &Position, moves: &mut Vec<Move>) {
    generate(MoveGenMode::All, color, pos, moves);
}

/// Generates only pseudo-legal captures, en-passant captures, and promotions.
pub fn generate_captures(color: Color, pos: &Position, moves: &mut Vec<Move>) {
    generate(MoveGenMode::Tactical, color, pos, moves);
}

/// Generates only pseudo-legal quiet moves (including castles, excluding promotions).
pub fn generate_quiets(color: Color, pos: &Position, moves: &mut Vec<Move>) {
    generate(MoveGenMode::Quiet, color, pos, moves);
}

fn generate(mode: MoveGenMode, color: Color, pos: &Position, moves: &mut Vec<Move>) {
    generate_pawn_moves(mode, color, pos, moves);
    generate_knight_moves(mode, color, pos, moves);
    generate_sliding_moves(mode, color, pos, moves, PieceKind::Bishop);
    generate_sliding_moves(mode, color, pos, moves, PieceKind::Rook);
    generate_sliding_moves(mode, color, pos, moves, PieceKind::Queen);
    generate_king_moves(mode, color, pos, moves);
    if mode != MoveGenMode::Tactical {
        generate_castles(color, pos, moves);
    }
}

fn generate_pawn_moves(mode: MoveGenMode, color: Color, pos: &Position, moves: &mut Vec<Move>) {
    let occ = pos.pieces(Color::White) | pos.pieces(Color::Black);
    let enemy = pos.pieces(color.toggle());
    let (push_dir, start_rank, promo_rank) = match color {
        Color::White => (Direction::North, RANK_2, RANK_8),
        Color::Black => (Direction::South, RANK_7, RANK_1),
    };

    for pawn in pos.pawns(color) {
        let one_forward = pawn.towards(push_dir);
        if !occ.contains(one_forward) {
            if one_forward.rank() == promo_rank {
                if mode != MoveGenMode::Quiet {
                    for &kind in &PROMOTION_KINDS {
                        moves.push(Move::promotion(pawn, one_forward, kind));
                    }
                }
            } else {
                if mode != MoveGenMode::Tactical {
                    moves.push(Move::quiet(pawn, one_forward));
                }

                if mode != MoveGenMode::Tactical && pawn.rank() == start_rank {
                    let two_forward = one_forward.towards(push_dir);
                    if !occ.contains(two_forward) {
                        moves.push(Move::double_pawn_push(pawn, two_forward));
                    }
                }
            }
        }

        let attacks = pawn_attacks(pawn, color);
        if mode != MoveGenMode::Quiet {
            for target in attacks.and(enemy) {
                if target.rank() == promo_rank {
                    for &kind in &PROMOTION_KINDS {
                        moves.push(Move::promotion_capture(pawn, target, kind));
                    }
                } else {
                    moves.push(Move::capture(pawn, target));
                }
            }

            if let Some(ep) = pos.en_passant_square() {
                if attacks.contains(ep) {
                    moves.push(Move::en_passant(pawn, ep));
                }
            }
        }
    }
}

fn generate_knight_moves(mode: MoveGenMode, color: Color, pos: &Position, moves: &mut Vec<Move>) {
    let own = pos.pieces(color);
    let enemy = pos.pieces(color.toggle());
    for knight in pos.knights(color) {
        let targets = knight_attacks(knight).and(own.not());
        push_targets(mode, knight, targets, enemy, moves);
    }
}

fn generate_king_moves(mode: MoveGenMode, color: Color, pos: &Position, moves: &mut Vec<Move>) {
    let own = pos.pieces(color);
    let enemy = pos.pieces(color.toggle());
    if let Some(king) = pos.king(color) {
        let targets = king_attacks(king).and(own.not());
        push_targets(mode, king, targets, enemy, moves);
    }
}

fn generate_sliding_moves(
    mode: MoveGenMode,
    color: Color,
    pos: &Position,
    moves: &mut Vec<Move>,
    kind: PieceKind,
) {
    let occ = pos.pieces(Color::White) | pos.pieces(Color::Black);
    let own = pos.pieces(color);
    let enemy = pos.pieces(color.toggle());
    for source in pos.pieces_of_kind(color, kind) {
        let targets = core::attacks(kind, color, source, occ).and(own.not());
        push_targets(mode, source, targets, enemy, moves);
    }
}

fn push_targets(
    mode: MoveGenMode,
    source: Square,
    targets: SquareSet,
    enemy: SquareSet,
    moves: &mut Vec<Move>,
) {
    if mode != MoveGenMode::Quiet {
        for target in targets.and(enemy) {
            moves.push(Move::capture(source, target));
        }
    }

    if mode != MoveGenMode::Tactical {
        for target in targets.and(enemy.not()) {
            moves.push(Move::quiet(source, target));
        }
    }
}

fn generate_castles(color: Color, pos: &Position, moves: &mut Vec<Move>) {
    // A king may not castle out of check, nor pass through or land on an attacked square.
    if pos.is_check(color) {
        return;
    }

    let (king_sq, kingside_to, kingside_pass, queenside_to, queenside_pass, queenside_clear_only) =
        match color {
            Color::White => (E1, G1, [F1, G1], C1, [D1, C1], B1),
            Color::Black => (E8, G8, [F8, G8], C8, [D8, C8], B8),
        };

    if pos.can_castle_kingside(color)
        && kingside_pass.iter().all(|&sq| pos.piece_at(sq).is_none())
        && kingside_pass
            .iter()
            .all(|&sq| pos.squares_attacking(color.toggle(), sq).is_empty())
    {
        moves.push(Move::kingside_castle(king_sq, kingside_to));
    }

    if pos.can_castle_queenside(color)
        && pos.piece_at(queenside_clear_only).is_none()
        && queenside_pass.iter().all(|&sq| pos.piece_at(sq).is_none())
        && queenside_pass
            .iter()
            .all(|&sq| pos.squares_attacking(color.toggle(), sq).is_empty())
    {
        moves.push(Move::queenside_castle(king_sq, queenside_to));
    }
}

/// Static exchange evaluation: the material swing (in centipawns, from the mover's
/// perspective) of fully resolving the exchange of captures on `mov`'s destination
/// square, assuming both sides always recapture with their least valuable attacker.
///
/// Returns 0 for non-captures.
pub fn static_exchange_evaluation(pos: &Position, mov: Move) -> i32 {
    if !mov.is_capture() {
        return 0;
    }

    let target = mov.destination();
    let captured_value = pos
        .piece_at(target)
        .expect("static_exchange_evaluation: no piece at capture target")
        .kind
        .value();
    let promotion_bonus = if mov.is_promotion() {
        mov.promotion_piece().value() - PieceKind::Pawn.value()
    } else {
        0
    };

    let child = pos.clone_and_make_move(mov);
    captured_value + promotion_bonus - see_exchange(&child, target)
}

/// Returns whether `mov`'s static exchange evaluation is at least `threshold`. Used to
/// separate winning from losing captures during move ordering and to gate late-move/quiet
/// pruning by a depth-scaled threshold.
pub fn see_above_threshold(pos: &Position, mov: Move, threshold: i32) -> bool {
    static_exchange_evaluation(pos, mov) >= threshold
}

fn see_exchange(pos: &Position, target: Square) -> i32 {
    match smallest_attacker(pos, target) {
        None => 0,
        Some(attacker) => {
            let target_piece_value = pos
                .piece_at(target)
                .expect("see_exchange: no piece at target")
                .kind
                .value();
            let child = pos.clone_and_make_move(Move::capture(attacker, target));
            target_piece_value - see_exchange(&child, target)
        }
    }
}

fn smallest_attacker(pos: &Position, target: Square) -> Option<Square> {
    let attackers = pos.squares_attacking(pos.side_to_move(), target);
    attackers.into_iter().min_by_key(|&sq| {
        pos.piece_at(sq)
            .expect("attacker square is empty")
            .kind
            .value()
    })
}

/// Counts the number of leaf positions reachable from `pos` in exactly `depth` plies,
/// using the *legal* generator: pseudo-legal moves are filtered before recursing.
pub fn perft(pos: &Position, depth: u32) -> u64 {
    if depth == 0 {
        return 1;
    }

    let mut moves = Vec::new();
    generate_moves(pos.side_to_move(), pos, &mut moves);
    let mut nodes = 0;
    for mov in moves {
        if !pos.is_legal_given_pseudolegal(mov) {
            continue;
        }

        let child = pos.clone_and_make_move(mov);
        nodes += perft(&child, depth - 1);
    }

    nodes
}

/// Counts the number of leaf positions reachable from `pos` in exactly `depth` plies,
/// using pseudo-legal generation followed by a post-hoc legality check (the mover is in
/// check in the resulting position). A cross-check for [`perft`]: the two use independent
/// legality tests and must always agree.
pub fn perft2(pos: &Position, depth: u32) -> u64 {
    if depth == 0 {
        return 1;
    }

    let mover = pos.side_to_move();
    let mut moves = Vec::new();
    generate_moves(mover, pos, &mut moves);
    let mut nodes = 0;
    for mov in moves {
        let child = pos.clone_and_make_move(mov);
        if child.is_check(mover) {
            continue;
        }

        nodes += perft2(&child, depth - 1);
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    #[test]
    fn startpos_generates_twenty_moves() {
        let pos = Position::from_start_position();
        let mut moves = Vec::new();
        generate_moves(pos.side_to_move(), &pos, &mut moves);
        moves.retain(|&m| pos.is_legal_given_pseudolegal(m));
        assert_eq!(20, moves.len());
    }

    #[test]
    fn kingside_castle_blocked_by_attacked_square() {
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 0 1").unwrap();
        let mut moves = Vec::new();
        generate_moves(pos.side_to_move(), &pos, &mut moves);
        assert!(moves.iter().any(|m| m.is_kingside_castle()));

        // Black rook on f8's file covers f1, so white cannot castle kingside here.
        let pos = Position::from_fen("4kr2/8/8/8/8/8/8/4K2R w K - 0 1").unwrap();
        let mut moves = Vec::new();
        generate_moves(pos.side_to_move(), &pos, &mut moves);
        assert!(!moves.iter().any(|m| m.is_kingside_castle()));
    }

    #[test]
    fn castling_unavailable_while_in_check() {
        let pos = Position::from_fen("4k3/8/8/8/4r3/8/8/4K2R w K - 0 1").unwrap();
        let mut moves = Vec::new();
        generate_moves(pos.side_to_move(), &pos, &mut moves);
        assert!(!moves.iter().any(|m| m.is_castle()));
    }

    #[test]
    fn en_passant_is_generated() {
        let pos = Position::from_fen("8/8/8/3pP3/8/8/8/8 w - d6 0 1").unwrap();
        let mut moves = Vec::new();
        generate_moves(pos.side_to_move(), &pos, &mut moves);
        assert!(moves.iter().any(|m| m.is_en_passant()));
    }

    #[test]
    fn quiet_mode_excludes_promotions_and_captures() {
        let pos = Position::from_fen("5b2/4P3/8/8/8/8/8/8 w - - 0 1").unwrap();
        let mut moves = Vec::new();
        generate_quiets(pos.side_to_move(), &pos, &mut moves);
        assert!(moves.iter().all(|m| !m.is_capture() && !m.is_promotion()));
    }

    #[test]
    fn tactical_mode_includes_quiet_promotions() {
        let pos = Position::from_fen("8/4P3/8/8/8/8/8/8 w - - 0 1").unwrap();
        let mut moves = Vec::new();
        generate_captures(pos.side_to_move(), &pos, &mut moves);
        assert!(moves.iter().any(|m| m.is_promotion() && !m.is_capture()));
    }

    #[test]
    fn see_pawn_exchange_bad_for_player() {
        let pos = Position::from_fen("8/6p1/1R3b2/8/8/2B5/8/5r2 w - - 0 1").unwrap();
        let mov = Move::capture(B6, F6);
        assert_eq!(-4, static_exchange_evaluation(&pos, mov));
    }

    #[test]
    fn see_exchange_good_for_player() {
        let pos = Position::from_fen("8/r2q4/8/8/6B1/8/3Q4/8 w - - 0 1").unwrap();
        let mov = Move::capture(G4, D7);
        assert_eq!(11, static_exchange_evaluation(&pos, mov));
    }

    #[test]
    fn see_threshold_gate() {
        let pos = Position::from_fen("8/6p1/1R3b2/8/8/2B5/8/5r2 w - - 0 1").unwrap();
        let mov = Move::capture(B6, F6);
        assert!(!see_above_threshold(&pos, mov, 0));
        assert!(see_above_threshold(&pos, mov, -10));
    }

    #[test]
    fn perft_matches_perft2_startpos() {
        for depth in 0..=3 {
            let pos = Position::from_start_position();
            assert_eq!(perft(&pos, depth), perft2(&pos, depth));
        }
    }

    #[test]
    fn perft_startpos_depth_three() {
        let pos = Position::from_start_position();
        assert_eq!(8902, perft(&pos, 3));
    }

    #[test]
    fn perft_startpos_depth_four() {
        let pos = Position::from_start_position();
        assert_eq!(197_281, perft(&pos, 4));
    }

    #[test]
    #[ignore]
    fn perft_startpos_depth_six() {
        let pos = Position::from_start_position();
        assert_eq!(119_060_324, perft(&pos, 6));
    }

    #[test]
    #[ignore]
    fn perft_kiwipete_depth_five() {
        let pos = Position::from_fen(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        )
        .unwrap();
        assert_eq!(193_690_690, perft(&pos, 5));
    }
}
