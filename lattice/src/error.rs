// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// The closed set of error codes crossing the public API.
///
/// There are deliberately no string payloads here; diagnostics go to the
/// log, the code is the whole contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid argument (unknown team, wrong unit, bad size).
    Inval,
    /// A lookup (segment id, team id, function id) found nothing.
    NotFound,
    /// The runtime is not initialized (or already finalized).
    NotInit,
    /// Transient resource exhaustion; drain pending work and retry.
    Again,
    /// Transport failure or other unrecoverable condition; the runtime is
    /// in an undefined state and should be finalized.
    Other,
}

pub type Result<T> = core::result::Result<T, ErrorCode>;

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Inval => f.write_str("invalid argument"),
            ErrorCode::NotFound => f.write_str("not found"),
            ErrorCode::NotInit => f.write_str("runtime not initialized"),
            ErrorCode::Again => f.write_str("resource temporarily exhausted"),
            ErrorCode::Other => f.write_str("unrecoverable runtime error"),
        }
    }
}

impl core::error::Error for ErrorCode {}
