//! Maps file parsing
//!
//! Two line formats may be mixed in one file:
//! - `/proc/<pid>/maps`: `START-END PERMS OFFSET DEV INODE [PATH]`
//! - region table written by the capture tool: `0xSTART 0xEND SIZE PHYS_OFFSET`,
//!   saying where each virtual range was stored in the image

use super::{Backing, Permissions, VmaEntry};
use crate::input::parse_u64;
use crate::translate::LinearRun;
use crate::{Error, Result};

/// Everything a maps file describes
#[derive(Debug, Clone, Default)]
pub struct MapsFile {
    pub vmas: Vec<VmaEntry>,
    pub runs: Vec<LinearRun>,
}

fn parse_hex(field: &str, line_no: usize) -> Result<u64> {
    u64::from_str_radix(field.trim_start_matches("0x"), 16)
        .map_err(|_| Error::InvalidInput(format!("line {}: bad hex field '{}'", line_no, field)))
}

fn parse_region_line(parts: &[&str], line_no: usize) -> Result<LinearRun> {
    if parts.len() < 4 {
        return Err(Error::InvalidInput(format!(
            "line {}: region table lines need 4 fields",
            line_no
        )));
    }

    let start = parse_hex(parts[0], line_no)?;
    let end = parse_hex(parts[1], line_no)?;
    let phys_start = parse_u64(parts[3])?;

    if end <= start {
        return Err(Error::InvalidInput(format!(
            "line {}: region ends before it starts",
            line_no
        )));
    }

    Ok(LinearRun {
        virt_start: start,
        len: end - start,
        phys_start,
    })
}

fn parse_proc_line(line: &str, parts: &[&str], line_no: usize) -> Result<VmaEntry> {
    let (start, end) = parts[0]
        .split_once('-')
        .ok_or_else(|| Error::InvalidInput(format!("line {}: missing address range", line_no)))?;
    let start = parse_hex(start, line_no)?;
    let end = parse_hex(end, line_no)?;

    let perms: Permissions = parts
        .get(1)
        .ok_or_else(|| Error::InvalidInput(format!("line {}: missing permissions", line_no)))?
        .parse()?;

    let offset = match parts.get(2) {
        Some(field) => parse_hex(field, line_no)?,
        None => 0,
    };

    // The path is everything after the inode column, and may contain spaces
    let path = if parts.len() > 5 {
        let mut rest = line;
        for field in &parts[..5] {
            rest = rest.trim_start();
            rest = &rest[field.len()..];
        }
        Some(rest.trim().to_string())
    } else {
        None
    };

    let backing = match path {
        Some(path) if path.starts_with('/') => Backing::File { path, offset },
        Some(label) => Backing::Anonymous { label: Some(label) },
        None => Backing::Anonymous { label: None },
    };

    Ok(VmaEntry::new(start, end, perms, backing))
}

/// Parse maps text (supports both /proc/pid/maps and the capture region table)
pub fn parse_maps(text: &str) -> Result<MapsFile> {
    let mut maps = MapsFile::default();

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts[0].starts_with("0x") {
            maps.runs.push(parse_region_line(&parts, line_no)?);
        } else {
            maps.vmas.push(parse_proc_line(line, &parts, line_no)?);
        }
    }

    Ok(maps)
}
