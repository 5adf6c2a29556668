//! Check command implementation.
//!
//! Runs every entry of a signature file against an image and reports which
//! entries still locate exactly what they should.

use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;
use sigpatch::{BufferMemory, EngineConfig, Scanner, SignatureEntry, SignatureSet};
use strum::Display;

use crate::image::LoadedImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EntryStatus {
    #[strum(serialize = "found")]
    Found,
    #[strum(serialize = "not found")]
    NotFound,
    #[strum(serialize = "ambiguous")]
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    pub name: String,
    pub status: EntryStatus,
    /// Candidate that decided the status
    pub pattern_index: Option<usize>,
    pub address: Option<u64>,
    pub match_count: usize,
}

/// Run the check command. Returns false if any entry is not found or ambiguous.
pub fn run(image: &LoadedImage, config: &EngineConfig, signatures: &Path) -> Result<bool> {
    let set = SignatureSet::load(signatures)?;
    let scanner = Scanner::with_config(&image.memory, config);

    if !set.version.is_empty() {
        println!("Signature set version: {}", set.version);
    }

    let mut healthy = true;
    for entry in &set.entries {
        let report = check_entry(&scanner, image.base(), entry);
        healthy &= report.status == EntryStatus::Found;
        print_report(image, &report);
    }

    println!();
    println!("{} entries checked", set.entries.len());
    Ok(healthy)
}

/// Resolve the entry the way the engine does, then count the matches of the
/// winning candidate. An entry that resolves nothing is ambiguous when one of
/// its candidates matched more than once under `require_unique`.
pub fn check_entry(
    scanner: &Scanner<'_, BufferMemory>,
    module: u64,
    entry: &SignatureEntry,
) -> EntryReport {
    let count = |index: usize| {
        entry
            .candidates
            .get(index)
            .map_or(0, |signature| scanner.scan_all(module, signature, entry.all_sections).len())
    };

    if let Some(found) = scanner.scan_entry(module, entry) {
        return EntryReport {
            name: entry.name.clone(),
            status: EntryStatus::Found,
            pattern_index: Some(found.pattern_index),
            address: found.cursor.as_address(),
            match_count: count(found.pattern_index),
        };
    }

    let ambiguous = if entry.require_unique {
        (0..entry.candidates.len())
            .map(|index| (index, count(index)))
            .find(|&(_, matches)| matches > 1)
    } else {
        None
    };

    match ambiguous {
        Some((index, matches)) => EntryReport {
            name: entry.name.clone(),
            status: EntryStatus::Ambiguous,
            pattern_index: Some(index),
            address: None,
            match_count: matches,
        },
        None => EntryReport {
            name: entry.name.clone(),
            status: EntryStatus::NotFound,
            pattern_index: None,
            address: None,
            match_count: 0,
        },
    }
}

fn print_report(image: &LoadedImage, report: &EntryReport) {
    let status = match report.status {
        EntryStatus::Found => report.status.green().to_string(),
        EntryStatus::NotFound => report.status.red().to_string(),
        EntryStatus::Ambiguous => report.status.yellow().to_string(),
    };

    match (report.address, report.pattern_index) {
        (Some(address), Some(index)) => println!(
            "  {:<32} {:<10} 0x{:X} (rva 0x{:X}, candidate {}, {} match(es))",
            report.name,
            status,
            address,
            image.rva(address),
            index,
            report.match_count
        ),
        (None, Some(index)) => println!(
            "  {:<32} {:<10} (candidate {}, {} matches)",
            report.name, status, index, report.match_count
        ),
        _ => println!("  {:<32} {}", report.name, status),
    }
}
