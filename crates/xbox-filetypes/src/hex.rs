//! Hexadecimal text helpers used when records are shown to or edited by a user.

use serde::Serializer;

use crate::Error;

/// Formats `bytes` as upper-case hex, optionally separating bytes with spaces.
pub fn to_hex_string(bytes: &[u8], spaced: bool) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (index, byte) in bytes.iter().enumerate() {
        if spaced && index > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

pub fn is_hex_string(value: &str) -> bool {
    let digits = strip_prefix(value.trim());
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parses a hex number of at most eight digits, with or without a `0x` prefix.
pub fn parse_hex_u32(value: &str, field: &str) -> Result<u32, Error> {
    let digits = strip_prefix(value.trim());
    if !is_hex_string(digits) || digits.len() > 8 {
        return Err(Error::InvalidArgument(format!(
            "{field} must be all hexadecimal digits"
        )));
    }
    u32::from_str_radix(digits, 16)
        .map_err(|err| Error::InvalidArgument(format!("{field}: {err}")))
}

/// Parses exactly `N` bytes written as `2 * N` hex digits. Whitespace between
/// digits is ignored.
pub fn parse_hex_buffer<const N: usize>(value: &str, field: &str) -> Result<[u8; N], Error> {
    let digits: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() != N * 2 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidArgument(format!(
            "{field} must be {} hexadecimal digits long",
            N * 2
        )));
    }

    let mut out = [0u8; N];
    for (index, slot) in out.iter_mut().enumerate() {
        let pair = &digits[index * 2..index * 2 + 2];
        *slot = u8::from_str_radix(pair, 16)
            .map_err(|err| Error::InvalidArgument(format!("{field}: {err}")))?;
    }
    Ok(out)
}

pub(crate) fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_str(&to_hex_string(bytes.as_ref(), false))
}

fn strip_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}
