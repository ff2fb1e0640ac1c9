// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Crate-wide error types for a4's parsing and protocol boundaries.
//!
//! Errors arising deep in the search/position/movegen hot path are not modeled here: those are
//! handled per the engine's narrow, documented policy (clamp, reject, return a sentinel) rather
//! than propagated as `Result`. This module only covers the boundaries where a4 talks to the
//! outside world - FEN text, UCI commands - and where `thiserror` is the idiomatic fit.

use thiserror::Error;

use crate::{core::SquareParseError, position::FenParseError, uci::UciError};

/// Top-level error type for a4's library surface, gathering the more specific per-module errors
/// so that binaries can bubble a single error type up through `anyhow`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to parse FEN: {0}")]
    Fen(#[from] FenParseError),

    #[error("failed to parse UCI command: {0}")]
    Uci(#[from] UciError),

    #[error("failed to parse square: {0}")]
    Square(#[from] SquareParseError),
}
