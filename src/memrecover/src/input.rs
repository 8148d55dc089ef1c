//! Loading caller-supplied documents (profiles, ground truth, container specs)
//!
//! Documents are YAML unless the file extension is `.json`. Address-like
//! fields accept either an integer or a `"0x..."` string, since debugger logs
//! and symbol tools emit both.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// Load a YAML or JSON document
pub fn load_document<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        Ok(serde_json::from_str(&text)?)
    } else {
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Parse a hex (`0x` prefix) or decimal number
pub fn parse_u64(text: &str) -> Result<u64> {
    let text = text.trim().replace('_', "");
    let parsed = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    parsed.map_err(|_| Error::InvalidInput(format!("invalid number '{}'", text)))
}

/// Parse an absent-range list: one `START END` or `START-END` pair per line,
/// `#` starts a comment. Ranges are half-open physical offsets.
pub fn parse_ranges(text: &str) -> Result<Vec<(u64, u64)>> {
    let mut ranges = Vec::new();

    for (i, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let (start, end) = line
            .split_once('-')
            .or_else(|| line.split_once(char::is_whitespace))
            .ok_or_else(|| {
                Error::InvalidInput(format!("line {}: expected 'START END'", i + 1))
            })?;
        let (start, end) = (parse_u64(start)?, parse_u64(end)?);

        if end <= start {
            return Err(Error::InvalidInput(format!(
                "line {}: range {:#x}-{:#x} is empty",
                i + 1,
                start,
                end
            )));
        }
        ranges.push((start, end));
    }

    Ok(ranges)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberRepr {
    Int(u64),
    Text(String),
}

impl NumberRepr {
    fn resolve<E: serde::de::Error>(self) -> std::result::Result<u64, E> {
        match self {
            NumberRepr::Int(v) => Ok(v),
            NumberRepr::Text(s) => parse_u64(&s).map_err(E::custom),
        }
    }
}

/// `deserialize_with` helper for integer-or-hex-string fields
pub fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    NumberRepr::deserialize(deserializer)?.resolve()
}

/// Optional variant of [`de_u64`]
pub fn de_opt_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    Option::<NumberRepr>::deserialize(deserializer)?
        .map(NumberRepr::resolve)
        .transpose()
}
