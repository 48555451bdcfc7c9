//! Recovery of JSON payloads from free-form model replies.
//!
//! Model output is often wrapped in prose, code fences or reasoning blocks,
//! and sometimes carries small syntax slips. Extraction strips the wrappers,
//! finds balanced `{...}`/`[...]` regions with a string-aware scan, and runs
//! each candidate through [`normalize_json`] before accepting it.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think pattern should compile"));

/// A fence line on its own. Backticks inside JSON strings are left alone.
static FENCE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*```[\w+-]*[ \t]*\r?$").expect("fence pattern should compile")
});

/// Shape of the JSON value the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Object,
    /// A single array. Several top-level arrays and bare objects are merged
    /// into one, in document order.
    Array,
    Any,
}

/// Model output that could not be turned into JSON.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ParseError {
    /// The reply exactly as the model sent it.
    pub raw: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(raw: &str, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

struct Region {
    text: String,
    value: Value,
}

/// Extract the JSON payload of `text`.
///
/// For well-formed JSON embedded in prose or fences the result is the
/// embedded text unchanged.
pub fn extract_json(text: &str, expect: Expect) -> Result<String, ParseError> {
    let cleaned = strip_wrappers(text);
    let (regions, saw_balanced) = scan_regions(&cleaned, expect);

    if regions.is_empty() {
        let reason = if saw_balanced {
            "balanced region found but it is not valid JSON"
        } else {
            "no balanced JSON region found"
        };
        return Err(ParseError::new(text, reason));
    }

    if expect != Expect::Array {
        return Ok(first_text(regions));
    }

    if regions.len() == 1 && regions[0].value.is_array() {
        return Ok(first_text(regions));
    }

    let merged = regions
        .into_iter()
        .flat_map(|region| match region.value {
            Value::Array(items) => items,
            other => vec![other],
        })
        .collect();
    Ok(Value::Array(merged).to_string())
}

fn first_text(regions: Vec<Region>) -> String {
    regions
        .into_iter()
        .next()
        .map(|region| region.text)
        .unwrap_or_default()
}

fn strip_wrappers(text: &str) -> String {
    let without_think = THINK_BLOCK.replace_all(text, "");
    FENCE_MARKER.replace_all(&without_think, "").into_owned()
}

/// Collect top-level regions that parse as JSON after normalization.
///
/// The second value reports whether any balanced region was seen at all.
fn scan_regions(text: &str, expect: Expect) -> (Vec<Region>, bool) {
    let bytes = text.as_bytes();
    let mut regions = Vec::new();
    let mut saw_balanced = false;
    let mut pos = 0;

    while pos < bytes.len() {
        let opens = match bytes[pos] {
            b'{' => true,
            b'[' => expect != Expect::Object,
            _ => false,
        };
        if opens && let Some(end) = balanced_end(bytes, pos) {
            saw_balanced = true;
            let normalized = normalize_json(&text[pos..=end]);
            if let Ok(value) = serde_json::from_str::<Value>(&normalized) {
                regions.push(Region {
                    text: normalized,
                    value,
                });
                pos = end + 1;
                continue;
            }
        }
        pos += 1;
    }

    (regions, saw_balanced)
}

/// Index of the bracket closing the one at `start`, ignoring brackets inside
/// string literals. `None` when the region never closes or closes with the
/// wrong bracket.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut closers: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => closers.push(b'}'),
            b'[' => closers.push(b']'),
            b'}' | b']' => {
                if closers.pop() != Some(byte) {
                    return None;
                }
                if closers.is_empty() {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Repair common slips in model-written JSON.
///
/// - trailing commas before `]`/`}` are dropped
/// - backslashes that do not start a valid escape are doubled
/// - raw control characters inside strings are escaped
///
/// Valid JSON is returned unchanged.
pub fn normalize_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\\' if is_valid_escape(&chars, i + 1) => {
                    out.push(c);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if u32::from(c) < 0x20 => out.push_str(&format!("\\u{:04x}", u32::from(c))),
                _ => out.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    out.push(c);
                }
                ',' if matches!(next_significant(&chars, i + 1), Some(']' | '}')) => {}
                _ => out.push(c),
            }
        }
        i += 1;
    }

    out
}

fn is_valid_escape(chars: &[char], at: usize) -> bool {
    match chars.get(at) {
        Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => true,
        Some('u') => chars
            .get(at + 1..at + 5)
            .is_some_and(|hex| hex.iter().all(char::is_ascii_hexdigit)),
        _ => false,
    }
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}
