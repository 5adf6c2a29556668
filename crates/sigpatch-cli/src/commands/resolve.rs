//! Resolve command implementation.
//!
//! Scans for a pattern and walks a chain of cursor operations from the match,
//! printing the address after every step. Steps run in a fixed order:
//! offset, near scan, relative operand, dereference, function start.

use anyhow::Result;
use owo_colors::OwoColorize;
use sigpatch::{Cursor, EngineConfig, ReadMemory, ScanOptions, Scanner, Signature};

use super::hex_utils::{RelativeOperand, format_hex_address};
use crate::image::LoadedImage;

#[derive(Debug, Default)]
pub struct ResolveArgs {
    pub pattern: String,
    pub offset: Option<i64>,
    /// Second pattern searched from the match, within the configured range
    pub near: Option<String>,
    pub rel: Option<RelativeOperand>,
    pub deref: bool,
    pub align: bool,
}

/// A named step of the chain and the cursor it produced
pub type Step = (&'static str, Cursor);

/// Run the resolve command
pub fn run(image: &LoadedImage, config: &EngineConfig, args: &ResolveArgs) -> Result<()> {
    let steps = resolve_chain(&image.memory, image.base(), config, args)?;

    for (name, cursor) in &steps {
        match cursor.as_address() {
            Some(address) => println!(
                "  {:<10} {} (rva 0x{:X})",
                name,
                format_hex_address(address).green(),
                image.rva(address)
            ),
            None => println!("  {:<10} {}", name, cursor.red()),
        }
    }
    Ok(())
}

/// Run the chain against `host`. A not-found cursor flows through the
/// remaining steps unchanged.
pub fn resolve_chain<H: ReadMemory + ?Sized>(
    host: &H,
    module: u64,
    config: &EngineConfig,
    args: &ResolveArgs,
) -> Result<Vec<Step>> {
    let signature: Signature = args.pattern.parse()?;
    let near = args.near.as_deref().map(str::parse::<Signature>).transpose()?;

    let mut cursor = Scanner::with_config(host, config).scan(module, &signature, ScanOptions::default());
    let mut steps = vec![("scan", cursor)];

    if let Some(offset) = args.offset {
        cursor = cursor.offset(offset);
        steps.push(("offset", cursor));
    }
    if let Some(near) = &near {
        cursor = cursor.scan_relative(host, near, config.relative_scan_range);
        steps.push(("near", cursor));
    }
    if let Some(rel) = args.rel {
        cursor = cursor.resolve_relative(
            host,
            rel.instruction_size as i64,
            rel.displacement_offset as i64,
        );
        steps.push(("relative", cursor));
    }
    if args.deref {
        cursor = cursor.dereference(host, 0);
        steps.push(("deref", cursor));
    }
    if args.align {
        cursor = cursor.align_to_function_start_within(host, config.prologue_search_window);
        steps.push(("function", cursor));
    }
    Ok(steps)
}
