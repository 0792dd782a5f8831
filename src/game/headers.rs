//! Header normalization and result fixing.

use std::collections::BTreeMap;

use crate::error::GameError;
use crate::flags::{ExtraFlags, PositionFlags};

/// Normalized headers: lowercase keys, cleaned values.
pub type HeaderMap = BTreeMap<String, String>;

/// The three results a finished game can record.
pub const CANONICAL_RESULTS: [&str; 3] = ["1-0", "0-1", "1/2-1/2"];

// Placeholder values various archives use for "we don't know".
const EMPTY_VALUES: [&str; 15] = [
    "?", "??", "???", "????", "-", "--", "*", "**", "#", "##", "unknown", "no date", "none",
    "n/a", "????.??.??",
];

/// Clean raw headers: lowercase every key, trim values, collapse unknown
/// date parts (`1992.??.??` becomes `1992`) and drop placeholder values
/// entirely.
pub fn normalize_headers(raw: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in raw {
        let mut value = value.trim().to_string();
        for _ in 0..2 {
            value = strip_date_suffix(&value).to_string();
        }
        if value.is_empty()
            || EMPTY_VALUES
                .iter()
                .any(|empty| value.eq_ignore_ascii_case(empty))
        {
            continue;
        }
        headers.insert(key.to_lowercase(), value);
    }
    headers
}

fn strip_date_suffix(value: &str) -> &str {
    const SUFFIXES: [&str; 4] = [".??", ".xx", ".**", ".##"];
    for suffix in SUFFIXES {
        if value.len() >= suffix.len()
            && value[value.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
        {
            return &value[..value.len() - suffix.len()];
        }
    }
    value
}

/// Make sure `result` names how the game actually ended.
///
/// A missing or non-canonical result is inferred from the terminal position;
/// failing that, from the last line of the raw game text. A claimed draw
/// while the final position is checkmate is rewritten to the winning side.
/// Games whose ending stays unexplained are rejected.
pub fn fix_result(
    headers: &mut HeaderMap,
    terminal_flags: PositionFlags,
    terminal_extras: ExtraFlags,
    raw_text: &str,
) -> Result<(), GameError> {
    let recorded = headers.get("result").map(String::as_str);
    if !recorded.is_some_and(|r| CANONICAL_RESULTS.contains(&r)) {
        if let Some(result) = result_from_position(terminal_flags, terminal_extras) {
            tracing::info!(
                old = recorded.unwrap_or("*"),
                new = result,
                "adopting result forced by the final position"
            );
            headers.insert("result".to_string(), result.to_string());
        } else if let Some(result) = result_from_last_line(raw_text) {
            tracing::info!(
                old = recorded.unwrap_or("*"),
                new = result,
                "adopting result recorded at the end of the game text"
            );
            headers.insert("result".to_string(), result.to_string());
        } else {
            return Err(GameError::Ending(
                "game has no recorded result and no clear end".to_string(),
            ));
        }
    }
    // A "draw" that ends in mate is a recording mistake we can repair.
    if headers.get("result").map(String::as_str) == Some("1/2-1/2") {
        if let Some(winner) = terminal_flags.winner() {
            let result = if winner.is_white() { "1-0" } else { "0-1" };
            tracing::info!(new = result, "rewriting claimed draw: final position is checkmate");
            headers.insert("result".to_string(), result.to_string());
        }
    }
    Ok(())
}

fn result_from_position(flags: PositionFlags, extras: ExtraFlags) -> Option<&'static str> {
    if let Some(winner) = flags.winner() {
        return Some(if winner.is_white() { "1-0" } else { "0-1" });
    }
    if flags.is_mandatory_draw() || extras.forces_draw() {
        return Some("1/2-1/2");
    }
    None
}

fn result_from_last_line(raw_text: &str) -> Option<&'static str> {
    let last = raw_text.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    CANONICAL_RESULTS.into_iter().find(|r| *r == last)
}
