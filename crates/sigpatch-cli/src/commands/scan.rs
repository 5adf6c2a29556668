//! Scan command implementation.

use anyhow::Result;
use owo_colors::OwoColorize;
use sigpatch::{Cursor, EngineConfig, ScanOptions, Scanner, Signature};

use super::hex_utils::format_hex_address;
use crate::image::LoadedImage;

pub struct ScanArgs<'a> {
    pub pattern: &'a str,
    pub all: bool,
    pub all_sections: bool,
    pub unique: bool,
}

/// Run the scan command
pub fn run(image: &LoadedImage, config: &EngineConfig, args: ScanArgs<'_>) -> Result<()> {
    let signature: Signature = args.pattern.parse()?;
    let scanner = Scanner::with_config(&image.memory, config);

    let matches: Vec<Cursor> = if args.all {
        scanner.scan_all(image.base(), &signature, args.all_sections)
    } else {
        let mut options = ScanOptions::default();
        if args.all_sections {
            options = options.with_all_sections();
        }
        if args.unique {
            options = options.unique();
        }
        let cursor = scanner.scan(image.base(), &signature, options);
        cursor.is_found().then_some(cursor).into_iter().collect()
    };

    println!("Signature: {}", signature);
    if matches.is_empty() {
        println!("{}", "Not found".red());
        return Ok(());
    }

    for cursor in &matches {
        if let Some(address) = cursor.as_address() {
            println!(
                "  {}  rva 0x{:X}  {}",
                format_hex_address(address).green(),
                image.rva(address),
                image.section_of(address).unwrap_or("?")
            );
        }
    }
    if args.all {
        println!("{} match(es)", matches.len());
    }
    Ok(())
}
