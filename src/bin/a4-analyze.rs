// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Replays a search log produced by [`a4::tracing::search::SearchGraphLayer`] and offers a
//! small REPL over the reconstructed iterative-deepening history.

use std::{
    fs::File,
    io::{stdin, stdout, BufRead, BufReader, Write},
    path::PathBuf,
};

use a4::tracing::search::{
    EndEventKind, InstantEventKind, SearchEvent, SearchEventKind, StartEventKind,
};
use structopt::StructOpt;

/// Analyzer for search logs, as produced by a4-search or a4's UCI driver.
#[derive(Debug, StructOpt)]
struct Options {
    /// A search log to analyze.
    #[structopt(name = "SEARCH_LOG")]
    search_log: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Options::from_args();
    let file = File::open(&args.search_log)?;
    let reader = BufReader::new(file);
    let mut events = vec![];
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event: SearchEvent = serde_json::from_str(&line)?;
        events.push(event);
    }

    let search = build(events);
    repl(&search)
}

struct Depth {
    depth: u32,
    fen: String,
    terminated_early: bool,
}

struct Search {
    fen: String,
    depths: Vec<Depth>,
}

fn build(events: Vec<SearchEvent>) -> Search {
    let mut fen = String::new();
    let mut depths = Vec::new();
    let mut current: Option<Depth> = None;

    for event in events {
        match event.kind() {
            SearchEventKind::Start(start) => match start.kind() {
                StartEventKind::Search(s) => fen = s.fen().to_owned(),
                StartEventKind::SearchDepth(d) => {
                    current = Some(Depth {
                        depth: d.depth(),
                        fen: d.fen().to_owned(),
                        terminated_early: false,
                    });
                }
            },
            SearchEventKind::Instant(instant) => {
                if let InstantEventKind::SearchTermination(_) = instant.kind() {
                    if let Some(ref mut depth) = current {
                        depth.terminated_early = true;
                    }
                }
            }
            SearchEventKind::End(end) => {
                if let EndEventKind::SearchDepth(_) = end.kind() {
                    if let Some(depth) = current.take() {
                        depths.push(depth);
                    }
                }
            }
        }
    }

    Search { fen, depths }
}

fn repl(search: &Search) -> anyhow::Result<()> {
    let mut stdin = BufReader::new(stdin());
    let mut stdout = stdout();
    loop {
        let mut line = String::new();
        write!(&mut stdout, "a4> ")?;
        stdout.flush()?;
        if stdin.read_line(&mut line)? == 0 {
            return Ok(());
        }

        let components: Vec<_> = line.trim().split_whitespace().collect();
        let (&command, arguments) = components.split_first().unwrap_or((&"", &[]));
        match (command, arguments) {
            ("info", []) => {
                writeln!(&mut stdout, "== Search Position ==============")?;
                writeln!(&mut stdout, "{}", search.fen)?;
                writeln!(&mut stdout, "Reached depth {}", search.depths.len())?;
            }
            ("depths", ["list"]) => {
                for (i, depth) in search.depths.iter().enumerate() {
                    let status = if depth.terminated_early {
                        "terminated early"
                    } else {
                        "complete"
                    };
                    writeln!(&mut stdout, "{:>3}. depth {:<2} {}", i, depth.depth, status)?;
                }
            }
            ("depths", ["select", idx]) => {
                if let Some(depth) = search.depths.get(idx.parse::<usize>()?) {
                    writeln!(&mut stdout, "== depth {} ==", depth.depth)?;
                    writeln!(&mut stdout, "{}", depth.fen)?;
                } else {
                    writeln!(&mut stdout, "depth index out of bounds")?;
                }
            }
            ("quit", []) => return Ok(()),
            (cmd, _) => {
                writeln!(&mut stdout, "unknown command {}", cmd)?;
            }
        }
    }
}
