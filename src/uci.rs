// Copyright 2021-2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An implementation of the UCI protocol for a4, driving our internal search routines.
//! See [here](http://wbec-ridderkerk.nl/html/UCIProtocol.html) for full documentation on the protocol.

use std::convert::TryFrom;
use std::io::{self, BufRead};
use std::time::Duration;

use thiserror::Error;

use crate::config::EngineOptions;
use crate::core::{Color, File, Move, PieceKind, Rank, Square};
use crate::movegen;
use crate::table;
use crate::threads;
use crate::Position;

/// Lower bound subtracted from the GUI-reported remaining time, as a margin against
/// communication/GC latency eating into a budget computed against the wire.
const TIME_SAFETY_MARGIN_MS: u64 = 1000;
/// `movestogo` is clamped into this range: UCI GUIs that don't use classical time controls
/// either omit it (treated as the top of the range) or send a huge/zero value.
const MIN_MOVES_TO_GO: u64 = 1;
const MAX_MOVES_TO_GO: u64 = 30;

/// Splits a remaining-time budget into a soft (`max`) and hard (`abs`) search time limit,
/// per the engine's time allocation formula: spend roughly `1/movestogo` of what's left
/// plus a fraction of the increment, but never risk more than 3/10 of it on one move.
/// `pondering` stretches the soft budget by 25%, since a ponder search's clock doesn't
/// really start running until `ponderhit`.
fn allocate_time(remaining_ms: u64, increment_ms: u64, movestogo: Option<u64>, pondering: bool) -> (Duration, Duration) {
    let my_time = remaining_ms.saturating_sub(TIME_SAFETY_MARGIN_MS);
    let moves_to_go = movestogo.unwrap_or(MAX_MOVES_TO_GO).clamp(MIN_MOVES_TO_GO, MAX_MOVES_TO_GO);

    let inc_share = (4 * increment_ms) / 5;
    let mut max_ms = my_time / moves_to_go + inc_share;
    if pondering {
        max_ms += max_ms / 4;
    }
    let abs_ms = (3 * my_time) / 10 + inc_share;

    let max_ms = max_ms.min(my_time);
    let abs_ms = abs_ms.min(my_time).max(max_ms);

    (Duration::from_millis(max_ms), Duration::from_millis(abs_ms))
}

/// Errors arising while parsing a UCI command or one of its arguments.
#[derive(Debug, Error)]
pub enum UciError {
    #[error("unrecognized command: {0}")]
    UnknownCommand(String),

    #[error("malformed square: {0}")]
    BadSquare(String),

    #[error("{0} is not a legal move in the current position")]
    IllegalMove(String),

    #[error("unrecognized option: {0}")]
    UnknownOption(String),

    #[error("malformed fen in position command")]
    BadFen,
}

/// Mutable state that persists across commands for the lifetime of the UCI session: the
/// options a GUI has configured and the position they apply to.
struct Engine {
    options: EngineOptions,
    position: Position,
    threads_started: bool,
    /// Set while a `go ... ponder` search is outstanding and no `ponderhit`/`stop` has
    /// arrived for it yet.
    pondering: bool,
    /// The `(max, abs)` time budget computed at `go` time for an in-flight ponder search.
    /// The clock on a ponder search doesn't really start until `ponderhit` tells us the
    /// opponent played the expected move, so the budget is stashed here rather than handed
    /// to the search immediately.
    pending_ponder_budget: Option<(Duration, Duration)>,
}

impl Engine {
    fn new() -> Engine {
        Engine {
            options: EngineOptions::default(),
            position: Position::from_start_position(),
            threads_started: false,
            pondering: false,
            pending_ponder_budget: None,
        }
    }

    /// The thread pool is created lazily, once options have had a chance to be set via
    /// `setoption`, rather than eagerly on `uci` - `initialize_with_options` only has an
    /// effect the first time it's called, so options set after the first `go` don't take
    /// effect until the process is restarted. This matches the common engine convention of
    /// not supporting options that change the size of the thread pool or table mid-game.
    fn ensure_threads_started(&mut self) {
        if !self.threads_started {
            threads::initialize_with_options(self.options);
            self.threads_started = true;
        }
    }
}

pub fn run() -> io::Result<()> {
    let stdin = io::stdin();
    let locked_stdin = stdin.lock();
    let mut engine = Engine::new();
    for maybe_line in locked_stdin.lines() {
        let line = maybe_line?;
        let components: Vec<_> = line.split_whitespace().collect();
        let (&command, arguments) = match components.split_first() {
            Some(pair) => pair,
            None => continue,
        };

        let result = match command {
            "uci" => Ok(handle_uci()),
            "isready" => Ok(println!("readyok")),
            "ucinewgame" => Ok(handle_new_game()),
            "setoption" => handle_set_option(&mut engine, arguments),
            "position" => handle_position(&mut engine, arguments),
            "go" => Ok(handle_go(&mut engine, arguments)),
            "stop" => Ok(handle_stop(&mut engine)),
            "ponderhit" => Ok(handle_ponderhit(&mut engine)),
            "quit" => return Ok(()),
            _ => Err(UciError::UnknownCommand(command.to_owned())),
        };

        if let Err(e) = result {
            eprintln!("info string {}", e);
        }
    }

    Ok(())
}

fn handle_uci() {
    println!(
        "id name {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    println!("id author {}", env!("CARGO_PKG_AUTHORS"));
    println!("option name Hash type spin default 256 min 1 max 65536");
    println!("option name Threads type spin default 8 min 1 max 512");
    println!("option name Ponder type check default false");
    println!("option name ABDADA Depth type spin default 3 min 0 max 32");
    println!("option name Cutoff Check Depth type spin default 4 min 0 max 32");
    println!("option name NUMA type check default false");
    println!("uciok");
}

fn handle_new_game() {
    table::clear();
}

fn handle_set_option(engine: &mut Engine, arguments: &[&str]) -> Result<(), UciError> {
    // "name <name...> value <value>" - the name may itself contain spaces ("ABDADA Depth"),
    // so everything between "name" and "value" belongs to it.
    let value_idx = arguments
        .iter()
        .position(|&tok| tok == "value")
        .unwrap_or(arguments.len());
    let name = arguments
        .iter()
        .skip(1)
        .take(value_idx.saturating_sub(1))
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    let value = arguments.get(value_idx + 1..).unwrap_or(&[]).join(" ");

    match name.as_str() {
        "Hash" => engine.options.set_hash_mb(value.parse().unwrap_or(256)),
        "Threads" => engine.options.set_threads(value.parse().unwrap_or(8)),
        "Ponder" => engine.options.set_ponder(value == "true"),
        "ABDADA Depth" => engine
            .options
            .set_abdada_depth(value.parse().unwrap_or(3)),
        "Cutoff Check Depth" => engine
            .options
            .set_cutoff_check_depth(value.parse().unwrap_or(4)),
        "NUMA" => engine.options.set_numa(value == "true"),
        _ => return Err(UciError::UnknownOption(name)),
    }

    Ok(())
}

fn handle_position(engine: &mut Engine, arguments: &[&str]) -> Result<(), UciError> {
    let moves_idx = arguments.iter().position(|&tok| tok == "moves");
    let setup = &arguments[..moves_idx.unwrap_or(arguments.len())];

    let mut position = match setup {
        ["startpos"] => Position::from_start_position(),
        fields if fields.first() == Some(&"fen") => {
            let fen = fields[1..].join(" ");
            Position::from_fen(fen).map_err(|_| UciError::BadFen)?
        }
        _ => return Err(UciError::BadFen),
    };

    if let Some(idx) = moves_idx {
        for token in &arguments[idx + 1..] {
            let mov = parse_uci_move(&position, token)
                .ok_or_else(|| UciError::IllegalMove((*token).to_owned()))?;
            position.make_move(mov);
        }
    }

    engine.position = position;
    Ok(())
}

fn handle_go(engine: &mut Engine, arguments: &[&str]) {
    engine.ensure_threads_started();

    let mut depth = 64;
    let mut explicit_time_limit = None;
    let mut node_limit = None;
    let mut wtime = None;
    let mut btime = None;
    let mut winc = 0u64;
    let mut binc = 0u64;
    let mut movestogo = None;
    let mut ponder = false;
    let mut infinite = false;

    let mut iter = arguments.iter();
    while let Some(&token) = iter.next() {
        match token {
            "depth" => {
                if let Some(v) = iter.next().and_then(|s| s.parse().ok()) {
                    depth = v;
                }
            }
            "movetime" => {
                if let Some(ms) = iter.next().and_then(|s| s.parse().ok()) {
                    explicit_time_limit = Some(Duration::from_millis(ms));
                }
            }
            "nodes" => {
                if let Some(v) = iter.next().and_then(|s| s.parse().ok()) {
                    node_limit = Some(v);
                }
            }
            "wtime" => wtime = iter.next().and_then(|s| s.parse().ok()),
            "btime" => btime = iter.next().and_then(|s| s.parse().ok()),
            "winc" => winc = iter.next().and_then(|s| s.parse().ok()).unwrap_or(0),
            "binc" => binc = iter.next().and_then(|s| s.parse().ok()).unwrap_or(0),
            "movestogo" => movestogo = iter.next().and_then(|s| s.parse().ok()),
            "mate" => {
                if let Some(moves) = iter.next().and_then(|s| s.parse::<u32>().ok()) {
                    depth = moves.saturating_mul(2);
                }
            }
            "ponder" => ponder = true,
            "infinite" => infinite = true,
            _ => {}
        }
    }

    engine.pondering = ponder;
    engine.pending_ponder_budget = None;

    let my_time = match engine.position.side_to_move() {
        Color::White => wtime,
        Color::Black => btime,
    };
    let my_inc = match engine.position.side_to_move() {
        Color::White => winc,
        Color::Black => binc,
    };

    let (soft_time_limit, time_limit) = if infinite {
        (None, None)
    } else if let Some(explicit) = explicit_time_limit {
        (None, Some(explicit))
    } else if let Some(remaining) = my_time {
        let budget = allocate_time(remaining, my_inc, movestogo, ponder);
        if ponder {
            // The clock hasn't really started: hold onto the budget and search without a
            // time limit until `ponderhit` tells us it's actually our move.
            engine.pending_ponder_budget = Some(budget);
            (None, None)
        } else {
            (Some(budget.0), Some(budget.1))
        }
    } else {
        (None, None)
    };

    threads::get().main_thread().set_position(engine.position.clone());
    threads::get()
        .main_thread()
        .search(depth, time_limit, soft_time_limit, node_limit);

    // `search` only dispatches the job and returns; report `bestmove` from a background
    // thread once every worker goes idle again, so this thread can keep reading stdin (and
    // in particular still notice a `stop`) while the search is running.
    std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(5));
        while threads::get().is_searching() {
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Some(result) = threads::get().best_result() {
            println!("bestmove {}", result.best_move.as_uci());
        }
    });
}

/// A `ponderhit` means the opponent played the move we were pondering on: the search
/// already underway keeps running, but its clock starts now. Since an in-flight search's
/// options can't be mutated in place, this spawns a watchdog that enforces the budget
/// computed at `go` time by stopping the search once it elapses.
fn handle_ponderhit(engine: &mut Engine) {
    if !engine.pondering {
        return;
    }

    engine.pondering = false;
    if let Some((_max, hard_limit)) = engine.pending_ponder_budget.take() {
        std::thread::spawn(move || {
            std::thread::sleep(hard_limit);
            if threads::get().is_searching() {
                threads::get().main_thread().stop();
            }
        });
    }
}

fn handle_stop(engine: &mut Engine) {
    engine.pondering = false;
    engine.pending_ponder_budget = None;
    if engine.threads_started {
        threads::get().main_thread().stop();
    }
}

fn parse_uci_move(pos: &Position, token: &str) -> Option<Move> {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() != 4 && chars.len() != 5 {
        return None;
    }

    let source = parse_square(chars[0], chars[1])?;
    let destination = parse_square(chars[2], chars[3])?;
    let promotion = match chars.get(4) {
        Some('q') => Some(PieceKind::Queen),
        Some('r') => Some(PieceKind::Rook),
        Some('b') => Some(PieceKind::Bishop),
        Some('n') => Some(PieceKind::Knight),
        Some(_) => return None,
        None => None,
    };

    let mut candidates = Vec::new();
    movegen::generate_moves(pos.side_to_move(), pos, &mut candidates);
    candidates
        .into_iter()
        .filter(|mov| pos.is_legal_given_pseudolegal(*mov))
        .find(|mov| {
            mov.source() == source
                && mov.destination() == destination
                && (!mov.is_promotion() || Some(mov.promotion_piece()) == promotion)
        })
}

fn parse_square(file: char, rank: char) -> Option<Square> {
    let file = File::try_from(file).ok()?;
    let rank = Rank::try_from(rank).ok()?;
    Some(Square::of(rank, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{E2, E4};

    #[test]
    fn parses_simple_quiet_move() {
        let pos = Position::from_start_position();
        let mov = parse_uci_move(&pos, "e2e4").unwrap();
        assert_eq!(E2, mov.source());
        assert_eq!(E4, mov.destination());
    }

    #[test]
    fn rejects_illegal_move() {
        let pos = Position::from_start_position();
        assert!(parse_uci_move(&pos, "e2e5").is_none());
    }

    #[test]
    fn set_option_updates_hash_size() {
        let mut engine = Engine::new();
        handle_set_option(&mut engine, &["name", "Hash", "value", "512"]).unwrap();
        assert_eq!(512, engine.options.hash_mb());
    }

    #[test]
    fn position_with_moves_advances_the_board() {
        let mut engine = Engine::new();
        handle_position(&mut engine, &["startpos", "moves", "e2e4", "e7e5"]).unwrap();
        assert_ne!(Position::from_start_position().zobrist_hash(), engine.position.zobrist_hash());
    }

    #[test]
    fn allocated_time_never_exceeds_remaining_time() {
        let (max, abs) = allocate_time(10_000, 0, Some(20), false);
        assert!(max.as_millis() <= 10_000);
        assert!(abs.as_millis() <= 10_000);
        assert!(max <= abs);
    }

    #[test]
    fn allocated_time_spends_less_with_more_moves_to_go() {
        let (fewer_togo, _) = allocate_time(60_000, 0, Some(5), false);
        let (more_togo, _) = allocate_time(60_000, 0, Some(30), false);
        assert!(fewer_togo > more_togo);
    }

    #[test]
    fn pondering_stretches_the_soft_budget() {
        let (normal_max, _) = allocate_time(60_000, 0, Some(20), false);
        let (ponder_max, _) = allocate_time(60_000, 0, Some(20), true);
        assert!(ponder_max > normal_max);
    }

    #[test]
    fn ponderhit_without_a_pending_ponder_search_is_a_no_op() {
        let mut engine = Engine::new();
        handle_ponderhit(&mut engine);
        assert!(!engine.pondering);
    }
}
