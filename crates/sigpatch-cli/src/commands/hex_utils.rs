//! Parsing of addresses and offsets given on the command line.

use anyhow::{Result, anyhow};

/// Parse a hex address string (with or without 0x prefix).
pub fn parse_hex_address(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(s, 16).map_err(|e| anyhow!("Invalid hex address: {}", e))
}

/// Format an address as a hex string with 0x prefix.
pub fn format_hex_address(addr: u64) -> String {
    format!("0x{:X}", addr)
}

/// Parse a signed offset: decimal, or hex with a 0x prefix (`-0x10`, `24`).
pub fn parse_offset(s: &str) -> Result<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|e| anyhow!("Invalid offset '{}': {}", s, e))?;

    Ok(if negative { -magnitude } else { magnitude })
}

/// Instruction layout for a relative operand, written `<size>:<disp>`:
/// `7:3` is a 7-byte instruction with its displacement at byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeOperand {
    pub instruction_size: usize,
    pub displacement_offset: usize,
}

pub fn parse_relative_operand(s: &str) -> Result<RelativeOperand> {
    let (size, disp) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("Expected <size>:<disp>, got '{}'", s))?;
    let instruction_size = size
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid instruction size '{}': {}", size, e))?;
    let displacement_offset: usize = disp
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid displacement offset '{}': {}", disp, e))?;

    if displacement_offset + 4 > instruction_size {
        return Err(anyhow!(
            "Displacement at {} does not fit a {}-byte instruction",
            displacement_offset,
            instruction_size
        ));
    }
    Ok(RelativeOperand {
        instruction_size,
        displacement_offset,
    })
}
