//! LiME capture format
//!
//! A LiME file is a sequence of segments, each a 32-byte header followed by
//! the captured bytes of one physical range:
//! - Bytes 0-3: magic `0x4C694D45` ("EMiL" on disk)
//! - Bytes 4-7: version
//! - Bytes 8-15: first physical address
//! - Bytes 16-23: last physical address (inclusive)
//! - Bytes 24-31: reserved

use byteorder::{ByteOrder, LE};

use super::PhysicalRun;
use crate::{Error, Result};

pub const LIME_MAGIC: u32 = 0x4C69_4D45;
pub const HEADER_SIZE: usize = 32;

/// Check whether `data` starts with a LiME segment header.
pub fn is_lime(data: &[u8]) -> bool {
    data.len() >= 4 && LE::read_u32(&data[0..4]) == LIME_MAGIC
}

/// Parse every segment header and return the physical runs they describe.
pub fn parse_runs(data: &[u8]) -> Result<Vec<PhysicalRun>> {
    let mut runs = Vec::new();
    let mut offset = 0usize;

    while offset + HEADER_SIZE <= data.len() {
        let header = &data[offset..offset + HEADER_SIZE];
        if LE::read_u32(&header[0..4]) != LIME_MAGIC {
            break;
        }

        let start = LE::read_u64(&header[8..16]);
        let last = LE::read_u64(&header[16..24]);
        if last < start {
            return Err(Error::InvalidImage(format!(
                "LiME segment at {:#x} ends ({:#x}) before it starts ({:#x})",
                offset, last, start
            )));
        }

        let len = last - start + 1;
        let data_offset = (offset + HEADER_SIZE) as u64;
        let data_end = data_offset
            .checked_add(len)
            .filter(|&end| end <= data.len() as u64)
            .ok_or_else(|| {
                Error::InvalidImage(format!(
                    "LiME segment {:#x}-{:#x} is truncated (file is {:#x} bytes)",
                    start,
                    last,
                    data.len()
                ))
            })?;

        runs.push(PhysicalRun {
            start,
            len,
            file_offset: data_offset,
        });

        offset = data_end as usize;
    }

    if runs.is_empty() {
        return Err(Error::InvalidImage("no LiME segment headers found".into()));
    }

    runs.sort_by_key(|r| r.start);
    for pair in runs.windows(2) {
        if pair[0].end() > pair[1].start {
            return Err(Error::InvalidImage(format!(
                "LiME segments overlap at {:#x}",
                pair[1].start
            )));
        }
    }

    Ok(runs)
}

/// Build a LiME file from `(physical start, bytes)` ranges.
pub fn encode(ranges: &[(u64, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (start, bytes) in ranges {
        let mut header = [0u8; HEADER_SIZE];
        LE::write_u32(&mut header[0..4], LIME_MAGIC);
        LE::write_u32(&mut header[4..8], 1);
        LE::write_u64(&mut header[8..16], *start);
        LE::write_u64(&mut header[16..24], start + bytes.len() as u64 - 1);
        out.extend_from_slice(&header);
        out.extend_from_slice(bytes);
    }
    out
}
