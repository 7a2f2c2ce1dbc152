//! Logging utilities: sanitizing user/content strings so logs stay
//! single-line, plus public-key hex formatting shared by logs and the
//! console CLI.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 200;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Uppercase hex of the first four bytes of a key, e.g. `A1B2C3D4`.
/// The conventional operator-facing form for identifying a peer.
pub fn hex_prefix(key: &[u8]) -> String {
    hex::encode_upper(&key[..key.len().min(4)])
}

/// Uppercase hex of a full byte slice.
pub fn hex_full(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}
