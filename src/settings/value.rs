//! Parsing of setting values

use std::time::Duration;

use super::control::SettingError;

/// Duration value meaning "never"
pub const INFINITY: &str = "infinity";

/// Period keyword: fire at the start and end of every chunk
pub const EVERY_CHUNK: &str = "everyChunk";

/// Period keyword: fire at the start of every chunk
pub const BEGIN_CHUNK: &str = "beginChunk";

/// Period keyword: fire at the end of every chunk
pub const END_CHUNK: &str = "endChunk";

/// A parsed `period` value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodValue {
    /// Both chunk boundaries
    EveryChunk,
    /// Chunk start only
    BeginChunk,
    /// Chunk end only
    EndChunk,
    /// Fixed interval in nanoseconds
    Every(u64),
}

/// Parse a duration such as `20 ms`, `1s`, `0` or `infinity` into nanoseconds
///
/// # Errors
///
/// Returns error if the number or unit is not recognized
pub fn parse_duration(text: &str) -> Result<u64, SettingError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case(INFINITY) {
        return Ok(u64::MAX);
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let amount: u64 = number
        .parse()
        .map_err(|_| invalid(text, "expected a whole number"))?;

    let multiplier: u64 = match unit.trim() {
        "" if amount == 0 => 1,
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        "d" => 86_400 * 1_000_000_000,
        "" => return Err(invalid(text, "missing unit")),
        other => return Err(invalid(text, &format!("unknown unit '{other}'"))),
    };

    Ok(amount.saturating_mul(multiplier))
}

/// Parse a duration into a [`Duration`], `None` for infinity
///
/// # Errors
///
/// Returns error if the text is not a duration
pub fn parse_std_duration(text: &str) -> Result<Option<Duration>, SettingError> {
    let nanos = parse_duration(text)?;
    Ok((nanos != u64::MAX).then(|| Duration::from_nanos(nanos)))
}

/// Parse `true` / `false`, ignoring case
///
/// # Errors
///
/// Returns error for any other text
pub fn parse_bool(text: &str) -> Result<bool, SettingError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(invalid(text, "expected true or false"))
    }
}

/// Parse a `period` value
///
/// # Errors
///
/// Returns error if the text is neither a chunk keyword nor a duration
pub fn parse_period(text: &str) -> Result<PeriodValue, SettingError> {
    match text.trim() {
        EVERY_CHUNK => Ok(PeriodValue::EveryChunk),
        BEGIN_CHUNK => Ok(PeriodValue::BeginChunk),
        END_CHUNK => Ok(PeriodValue::EndChunk),
        other => parse_duration(other).map(PeriodValue::Every),
    }
}

fn invalid(value: &str, reason: &str) -> SettingError {
    SettingError::InvalidValue {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
