//! Output formatting
//!
//! Every command can print JSON or YAML of its result; text rendering is per
//! command.

use anyhow::{Context, Result};
use memrecover::report::{ChecksumStatus, Mismatch};
use memrecover::{Correlation, CorrelationResult, RecoveryReport, VmaIndex};
use serde::Serialize;
use std::fmt::Write as _;

use crate::cli::OutputFormat;

/// Print `value` as JSON or YAML, or run `text` for the text format
pub fn emit<T: Serialize>(value: &T, format: OutputFormat, text: impl FnOnce(&T)) -> Result<()> {
    match format {
        OutputFormat::Text => text(value),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
            println!("{}", json);
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(value).context("Failed to serialize YAML")?;
            print!("{}", yaml);
        }
    }
    Ok(())
}

/// 16 bytes per line, `[absent]` on lines touching memory the capture never held
pub fn hex_dump(base: u64, data: &[u8], absent: &[(u64, u64)]) -> String {
    let mut out = String::new();

    for (i, chunk) in data.chunks(16).enumerate() {
        let line_start = base + (i * 16) as u64;
        let line_end = line_start + chunk.len() as u64;

        let _ = write!(out, "{:08x}  ", line_start);
        for (j, byte) in chunk.iter().enumerate() {
            let _ = write!(out, "{:02x} ", byte);
            if j == 7 {
                out.push(' ');
            }
        }
        // Pad if last line is short
        for j in chunk.len()..16 {
            out.push_str("   ");
            if j == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for byte in chunk {
            let c = *byte as char;
            out.push(if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
        }
        out.push('|');

        if absent
            .iter()
            .any(|&(start, len)| start < line_end && line_start < start + len)
        {
            out.push_str(" [absent]");
        }
        out.push('\n');
    }

    out
}

pub fn print_vmas(index: &VmaIndex) {
    println!(
        "{:>4}  {:>16}  {:>16}  {:4}  {}",
        "ID", "START", "END", "PERM", "BACKING"
    );
    for vma in index.entries() {
        println!(
            "{:>4}  {:016x}  {:016x}  {}  {}",
            vma.id, vma.start, vma.end, vma.perms, vma.backing
        );
    }
    if index.degraded {
        println!("(index is degraded: overlapping areas present)");
    }
    for diag in &index.diagnostics {
        println!("! {}", diag);
    }
}

pub fn print_correlations(results: &[CorrelationResult]) {
    for result in results {
        match &result.correlation {
            Correlation::Mapped {
                primary,
                continuation,
            } => {
                print!(
                    "{:#x}  mapped    VMA {} +{:#x}",
                    result.address.address, primary.vma, primary.offset
                );
                for next in continuation {
                    print!(", VMA {} +{:#x}", next.vma, next.offset);
                }
                println!();
            }
            Correlation::Unmapped => println!("{:#x}  unmapped", result.address.address),
        }
        for conflict in &result.conflicts {
            println!("    also in VMA {}", conflict);
        }
        for diag in &result.diagnostics {
            println!("    ! {}", diag);
        }
    }
}

fn describe_mismatch(mismatch: &Mismatch) -> String {
    match mismatch {
        Mismatch::RoleEntryIncomplete {
            address,
            tag,
            entry,
            state,
        } => format!("{:#x} ({}): entry '{}' is {}", address, tag, entry, state),
        Mismatch::UnknownEntry {
            address,
            tag,
            entry,
        } => format!(
            "{:#x} ({}): no entry '{}' in the container",
            address, tag, entry
        ),
        Mismatch::LengthMismatch {
            address,
            entry,
            expected,
            recovered,
        } => format!(
            "{:#x}: entry '{}' expected {:#x} bytes, recovered {:#x}",
            address, entry, expected, recovered
        ),
        Mismatch::ChecksumMismatch {
            entry,
            expected,
            actual,
        } => format!(
            "entry '{}' sha256 {} does not match expected {}",
            entry, actual, expected
        ),
        Mismatch::LocationMismatch { address, entry } => format!(
            "{:#x}: mapped, but outside the bytes of entry '{}'",
            address, entry
        ),
    }
}

/// Human-readable recovery report
pub fn render_report(report: &RecoveryReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Outcome: {:?}", report.outcome);

    let _ = writeln!(out, "\nEntries:");
    for entry in &report.entries {
        let _ = write!(
            out,
            "  {:<16} {:<8} {:>6.2}%  {:#x}/{:#x} bytes",
            entry.name,
            entry.state,
            entry.completeness_percent,
            entry.recovered_len.saturating_sub(entry.missing_bytes),
            entry.expected_len
        );
        match &entry.checksum {
            ChecksumStatus::Match => out.push_str("  sha256 ok"),
            ChecksumStatus::Mismatch { .. } => out.push_str("  sha256 MISMATCH"),
            ChecksumStatus::Unverifiable => out.push_str("  sha256 unverifiable"),
            ChecksumStatus::NotProvided => {}
        }
        out.push('\n');
        for gap in &entry.gaps {
            let _ = writeln!(out, "      gap {:#x}+{:#x}", gap.offset, gap.len);
        }
        if let Some(reason) = &entry.malformed {
            let _ = writeln!(out, "      malformed: {}", reason);
        }
    }

    let _ = writeln!(out, "\nAddresses:");
    for addr in &report.addresses {
        let place = match addr.vmas.first() {
            Some(m) => format!("VMA {} +{:#x}", m.vma, m.offset),
            None => "unmapped".to_string(),
        };
        let _ = writeln!(
            out,
            "  {:#018x}  {:<24} {:<20} -> {}",
            addr.address,
            addr.tag,
            place,
            addr.entry.as_deref().unwrap_or("-")
        );
    }

    if !report.mismatches.is_empty() {
        let _ = writeln!(out, "\nMismatches:");
        for mismatch in &report.mismatches {
            let _ = writeln!(out, "  {}", describe_mismatch(mismatch));
        }
    }

    if !report.diagnostics.is_empty() {
        let _ = writeln!(out, "\nDiagnostics:");
        for diag in &report.diagnostics {
            let _ = writeln!(out, "  {}", diag);
        }
    }

    out
}
