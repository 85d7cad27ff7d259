//! Plain-text rendering and parsing for the control-plane attributes.
//!
//! Kernel-style conventions: one value per file, a trailing newline on
//! output, surrounding whitespace tolerated on input, booleans as `0`/`1`.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use snafu::{OptionExt, Snafu};

use crate::freq::{Khz, Window};

/// Errors parsing an attribute write.
#[derive(Debug, Snafu)]
pub enum ParseError {
    /// The input is not a decimal number.
    #[snafu(display("expected a decimal number"))]
    NotANumber,
    /// The input is not `0` or `1`.
    #[snafu(display("expected 0 or 1"))]
    NotAFlag,
}

/// Render one numeric value.
pub fn render_u32(value: u32) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{value}");
    out
}

/// Render one 64-bit numeric value.
pub fn render_u64(value: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{value}");
    out
}

/// Render a boolean as `0`/`1`.
pub fn render_flag(value: bool) -> String {
    render_u32(u32::from(value))
}

/// Render a domain's resolved QoS window.
pub fn render_window(window: &Window) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "qos_min: {}", window.min);
    let _ = writeln!(out, "qos_max: {}", window.max);
    out
}

/// Render ceiling residency rows as `frequency milliseconds` lines,
/// highest frequency first.
pub fn render_time_in_state(rows: &[(Khz, u64)]) -> String {
    let mut out = String::new();
    for (freq, ms) in rows {
        let _ = writeln!(out, "{freq} {ms}");
    }
    out
}

/// Parse one numeric value.
///
/// # Errors
/// [`ParseError::NotANumber`] for anything but a decimal integer.
pub fn parse_u32(input: &str) -> Result<u32, ParseError> {
    input.trim().parse().ok().context(NotANumberSnafu)
}

/// Parse one table-level count.
///
/// # Errors
/// [`ParseError::NotANumber`] for anything but a decimal integer.
pub fn parse_usize(input: &str) -> Result<usize, ParseError> {
    input.trim().parse().ok().context(NotANumberSnafu)
}

/// Parse a `0`/`1` boolean.
///
/// # Errors
/// [`ParseError::NotAFlag`] for any other input.
pub fn parse_flag(input: &str) -> Result<bool, ParseError> {
    match input.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => NotAFlagSnafu.fail(),
    }
}

/// Parse a rendered time-in-state table back into rows. Used by tooling
/// reading the attribute back.
///
/// # Errors
/// [`ParseError::NotANumber`] on any malformed line.
pub fn parse_time_in_state(input: &str) -> Result<Vec<(Khz, u64)>, ParseError> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.split_whitespace();
            let freq: Khz = fields
                .next()
                .and_then(|f| f.parse().ok())
                .context(NotANumberSnafu)?;
            let ms: u64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .context(NotANumberSnafu)?;
            Ok((freq, ms))
        })
        .collect()
}
