//! Caller-supplied description of the archive container
//!
//! ```yaml
//! max_stitch_gap: 0x1000
//! entries:
//!   - name: metadata
//!     marker: MODH
//!     length: { declared: 0x100 }
//!   - name: weights
//!     marker: { hex: "57 47 ?? 54" }
//!     length: { prefixed: { width: 4, endian: little } }
//!     sha256: 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
//!   - name: bytecode
//!     marker: BYTC
//!     length: until_next_marker
//!     max_len: 0x100000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::input::{de_opt_u64, de_u64};
use crate::{Error, Result};

/// Default largest hole bridged when stitching pieces of one file
pub const DEFAULT_STITCH_GAP: u64 = 0x1000;

fn default_stitch_gap() -> u64 {
    DEFAULT_STITCH_GAP
}

/// Layout of the container to cut out of the recovered bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub entries: Vec<EntrySpec>,
    #[serde(default = "default_stitch_gap", deserialize_with = "de_u64")]
    pub max_stitch_gap: u64,
}

/// One named entry of the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub name: String,
    pub marker: Marker,
    /// `{ declared: N }`, `{ prefixed: { width, endian } }` or `until_next_marker`
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub length: LengthRule,
    /// Expected SHA-256 of the payload (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Upper bound for prefixed and until-next-marker lengths
    #[serde(
        default,
        deserialize_with = "de_opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_len: Option<u64>,
}

/// Leading magic of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Marker {
    /// Literal ASCII/UTF-8 text
    Text(String),
    /// Hex bytes; `??` matches any byte
    Hex { hex: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// How the payload length of an entry is found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthRule {
    /// Fixed payload length following the marker
    Declared(#[serde(deserialize_with = "de_u64")] u64),
    /// Length field of `width` bytes directly after the marker
    Prefixed {
        width: u8,
        #[serde(default)]
        endian: Endian,
    },
    /// Payload runs to the next recognised marker or the end of the stream
    UntilNextMarker,
}

/// Compiled marker: bytes plus a match mask (0 = wildcard)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPattern {
    pub bytes: Vec<u8>,
    pub mask: Vec<u8>,
}

impl MarkerPattern {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Longest run of fixed bytes, as (offset into the marker, bytes).
    /// Scans search for this run and check the rest around each hit.
    pub fn anchor(&self) -> (usize, &[u8]) {
        let mut best = (0, 0);
        let mut run_start = 0;
        // A trailing wildcard closes the last run
        for (i, &m) in self.mask.iter().chain(std::iter::once(&0)).enumerate() {
            if m == 0 {
                if i - run_start > best.1 {
                    best = (run_start, i - run_start);
                }
                run_start = i + 1;
            }
        }
        (best.0, &self.bytes[best.0..best.0 + best.1])
    }

    /// Whether `data` starts with the marker
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.len()
            && self
                .bytes
                .iter()
                .zip(&self.mask)
                .zip(data)
                .all(|((&b, &m), &d)| m == 0 || b == d)
    }
}

impl Marker {
    pub fn compile(&self) -> Result<MarkerPattern> {
        let pattern = match self {
            Marker::Text(text) => MarkerPattern {
                bytes: text.as_bytes().to_vec(),
                mask: vec![1; text.len()],
            },
            Marker::Hex { hex } => parse_hex_pattern(hex)?,
        };

        if !pattern.mask.iter().any(|&m| m != 0) {
            return Err(Error::InvalidInput(format!(
                "marker {:?} has no fixed bytes",
                self
            )));
        }
        Ok(pattern)
    }
}

fn parse_hex_pattern(text: &str) -> Result<MarkerPattern> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(Error::InvalidInput(format!(
            "hex marker '{}' has an odd number of digits",
            text
        )));
    }

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    let mut mask = Vec::with_capacity(digits.len() / 2);
    for pair in digits.as_bytes().chunks(2) {
        if pair == b"??" {
            bytes.push(0);
            mask.push(0);
            continue;
        }
        let byte = hex::decode(pair)
            .map_err(|e| Error::InvalidInput(format!("hex marker '{}': {}", text, e)))?;
        bytes.push(byte[0]);
        mask.push(1);
    }

    Ok(MarkerPattern { bytes, mask })
}

impl ContainerSpec {
    /// Validate the description and compile every marker, in entry order
    pub fn compile(&self) -> Result<Vec<MarkerPattern>> {
        if self.entries.is_empty() {
            return Err(Error::InvalidInput("container has no entries".into()));
        }

        let mut names = HashSet::new();
        let mut patterns = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            if entry.name.is_empty() || !names.insert(entry.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "entry names must be unique and non-empty ('{}')",
                    entry.name
                )));
            }

            if let LengthRule::Prefixed { width, .. } = entry.length {
                if ![1, 2, 4, 8].contains(&width) {
                    return Err(Error::InvalidInput(format!(
                        "entry '{}': prefix width {} is not 1, 2, 4 or 8",
                        entry.name, width
                    )));
                }
            }

            if let Some(digest) = &entry.sha256 {
                let valid = hex::decode(digest).is_ok_and(|bytes| bytes.len() == 32);
                if !valid {
                    return Err(Error::InvalidInput(format!(
                        "entry '{}': sha256 must be 64 hex digits",
                        entry.name
                    )));
                }
            }

            patterns.push(entry.marker.compile()?);
        }

        Ok(patterns)
    }
}
