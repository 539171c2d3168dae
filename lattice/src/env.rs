// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Environment variable parsing helpers.
//!
//! All runtime knobs are plain environment variables; unset or malformed
//! values fall back to a caller-provided default. Size values accept a
//! `B`/`K`/`M`/`G` suffix (powers of 1024), durations accept `s`/`ms`/`us`
//! with microseconds as the base unit.

use std::time::Duration;

/// Returns the raw string value of `name`, or `None` if unset or not
/// valid unicode.
pub fn string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Returns the integer in `name`, or `fallback` if unset or unparsable.
pub fn number(name: &str, fallback: i64) -> i64 {
    match string(name) {
        Some(s) => s.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring non-numeric value {s:?} in {name}");
            fallback
        }),
        None => fallback,
    }
}

/// Returns the byte count in `name`, honoring a `B`/`K`/`M`/`G` suffix,
/// or `fallback` if unset.
pub fn size(name: &str, fallback: usize) -> usize {
    let Some(s) = string(name) else {
        return fallback;
    };
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let Ok(base) = digits.parse::<usize>() else {
        tracing::warn!("ignoring malformed size {s:?} in {name}");
        return fallback;
    };
    let factor = match suffix.trim() {
        "" | "B" | "b" => 1,
        "K" | "k" => 1 << 10,
        "M" | "m" => 1 << 20,
        "G" | "g" => 1 << 30,
        other => {
            tracing::warn!("unknown size unit {other:?} in {name}, assuming bytes");
            1
        }
    };
    base * factor
}

/// Returns the duration in `name` (microseconds unless suffixed with
/// `s`/`ms`/`us`), or `fallback` if unset.
pub fn duration(name: &str, fallback: Duration) -> Duration {
    let Some(s) = string(name) else {
        return fallback;
    };
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let Ok(base) = digits.parse::<u64>() else {
        tracing::warn!("ignoring malformed duration {s:?} in {name}");
        return fallback;
    };
    match suffix.trim() {
        "s" => Duration::from_secs(base),
        "ms" | "m" => Duration::from_millis(base),
        "" | "us" | "u" => Duration::from_micros(base),
        other => {
            tracing::warn!("unknown time unit {other:?} in {name}, assuming microseconds");
            Duration::from_micros(base)
        }
    }
}

/// Returns the boolean in `name`. `yes`, `true` (case-insensitive) and
/// positive numbers are `true`; anything else is `false`; unset is
/// `fallback`.
pub fn boolean(name: &str, fallback: bool) -> bool {
    match string(name) {
        Some(s) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("yes")
                || s.eq_ignore_ascii_case("true")
                || s.parse::<i64>().is_ok_and(|n| n > 0)
        }
        None => fallback,
    }
}

/// Looks `name` up in a keyword table (case-insensitive). Unknown values
/// log a warning and keep the fallback.
pub fn keyword<T: Copy>(name: &str, table: &[(&str, T)], fallback: T) -> T {
    let Some(s) = string(name) else {
        return fallback;
    };
    let s = s.trim();
    for (key, value) in table {
        if s.eq_ignore_ascii_case(key) {
            return *value;
        }
    }
    tracing::warn!("unknown value {s:?} in environment variable {name}");
    fallback
}
