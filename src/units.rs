//! Human-readable byte sizes.
//!
//! Sizes given by users (`btrfs.min_space`, per-layer `size`) are parsed with
//! binary multipliers, so `"100M"` is 100 MiB.  Sizes printed back in error
//! messages use decimal units with four significant digits.

use crate::error::{DriverError, Result};

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;
const PIB: u64 = TIB * 1024;

const DECIMAL_UNITS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Parses a size like `"100M"`, `"1.5 GiB"` or `"4096"` into bytes.
///
/// The unit letter is one of `k`, `m`, `g`, `t`, `p` (any case), optionally followed by `i`
/// and/or `b`.  A single space may separate the number from the unit.
pub fn ram_in_bytes(size: &str) -> Result<u64> {
    let invalid = || DriverError::InvalidSize(size.to_string());

    let number_len = size
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size.len());
    let (number, suffix) = size.split_at(number_len);
    if !number.starts_with(|c: char| c.is_ascii_digit()) || number.ends_with('.') {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let mut suffix = suffix.strip_prefix(' ').unwrap_or(suffix).chars().peekable();
    let multiplier = match suffix.peek().map(char::to_ascii_lowercase) {
        Some('k') => KIB,
        Some('m') => MIB,
        Some('g') => GIB,
        Some('t') => TIB,
        Some('p') => PIB,
        _ => 1,
    };
    if multiplier != 1 {
        suffix.next();
    }
    suffix.next_if(|c| c.eq_ignore_ascii_case(&'i'));
    suffix.next_if(|c| c.eq_ignore_ascii_case(&'b'));
    if suffix.next().is_some() {
        return Err(invalid());
    }

    Ok((value * multiplier as f64) as u64)
}

/// Formats `size` bytes with decimal units, e.g. `10485760.0` becomes `"10.49MB"`.
pub fn human_size(size: f64) -> String {
    let mut size = size;
    let mut unit = 0;
    while size >= 1000.0 && unit < DECIMAL_UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    format!("{}{}", significant(size, 4), DECIMAL_UNITS[unit])
}

fn significant(value: f64, digits: i32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let exponent = value.abs().log10().floor() as i32;
    let precision = (digits - 1 - exponent).max(0) as usize;
    let formatted = format!("{value:.precision$}");
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}
