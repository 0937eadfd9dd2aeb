//! ASCII armor: Base64 without padding, tolerant of quoting.
//!
//! Standard alphabet (+ and /), never URL-safe. Encoding picks a random
//! wrap length so line length does not fingerprint the tool; decoding
//! strips whatever decoration mail clients and chat apps typically add.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::seq::SliceRandom;

use crate::error::{CovertError, Result};

/// Output longer than this is wrapped into lines.
pub const MAX_SINGLELINE: usize = 4000;

fn is_b64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}

/// Base64 encode without padding, wrapping long output at a line length
/// drawn uniformly from {76, 80, ..., 120}.
pub fn encode(data: &[u8]) -> String {
    let s = STANDARD_NO_PAD.encode(data);
    if s.len() <= MAX_SINGLELINE {
        return s;
    }
    let lengths: Vec<usize> = (76..=120).step_by(4).collect();
    let linelen = *lengths
        .choose(&mut rand::thread_rng())
        .expect("non-empty length table");
    s.as_bytes()
        .chunks(linelen)
        .map(|c| std::str::from_utf8(c).expect("base64 is ascii"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode armored input, ignoring whitespace, backticks, blockquote
/// markers and a BOM.
pub fn decode(data: &str) -> Result<Vec<u8>> {
    let cleaned = data.trim_start_matches('\u{FEFF}');
    // Per-line decoration strip; backticks and '>' cannot appear in the
    // payload alphabet so they are safe to drop anywhere on a line.
    let lines: Vec<String> = cleaned
        .lines()
        .map(|l| {
            l.chars()
                .filter(|c| !c.is_ascii_whitespace() && *c != '`' && *c != '>')
                .collect::<String>()
        })
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(CovertError::Value("no armored data found".into()));
    }
    if lines.len() > 1 {
        let first = lines[0].len();
        for l in &lines[..lines.len() - 1] {
            if l.len() != first || l.len() < 76 || l.len() % 4 != 0 {
                return Err(CovertError::Value(
                    "invalid armor: line length or padding".into(),
                ));
            }
        }
    }
    let joined: String = lines.concat();
    if let Some(bad) = joined.bytes().find(|b| !is_b64_byte(*b)) {
        return Err(CovertError::Value(format!(
            "invalid armor: unexpected character {:?}",
            bad as char
        )));
    }
    let stripped = joined.trim_end_matches('=');
    if stripped.contains('=') {
        return Err(CovertError::Value("invalid armor: misplaced padding".into()));
    }
    if stripped.len() % 4 == 1 {
        return Err(CovertError::Value("invalid armor: impossible length".into()));
    }
    STANDARD_NO_PAD
        .decode(stripped)
        .map_err(|e| CovertError::Value(format!("invalid armor: {e}")))
}
