//! Hexdump command implementation.
//!
//! Displays mapped image bytes in traditional hexdump format. Unmapped holes
//! inside the requested range are skipped.
//!
//! # Output Format
//!
//! ```text
//! 0x140001000: 48 89 5C 24 08 57 48 83  EC 20 48 8B D9 E8 00 00  |H.\$.WH.. H.....|
//! ```

use anyhow::{Result, bail};
use sigpatch::memory::read_readable;

use crate::image::LoadedImage;

/// Run the hexdump command
pub fn run(image: &LoadedImage, address: u64, size: usize) -> Result<()> {
    let chunks = read_readable(&image.memory, address, size);
    if chunks.is_empty() {
        bail!("Nothing mapped at 0x{:X}..0x{:X}", address, address + size as u64);
    }

    println!("Hexdump at 0x{:X} ({} bytes):", address, size);
    println!();

    for (start, bytes) in chunks {
        for line in format_lines(start, &bytes) {
            println!("{}", line);
        }
    }
    Ok(())
}

fn format_lines(start: u64, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = format!("0x{:X}: ", start + (i * 16) as u64);

            for j in 0..16 {
                if j == 8 {
                    line.push(' ');
                }
                match chunk.get(j) {
                    Some(byte) => line.push_str(&format!("{:02X} ", byte)),
                    None => line.push_str("   "),
                }
            }

            line.push_str(" |");
            for byte in chunk {
                line.push(if (0x20..0x7F).contains(byte) {
                    *byte as char
                } else {
                    '.'
                });
            }
            for _ in chunk.len()..16 {
                line.push(' ');
            }
            line.push('|');
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_full_line() {
        let bytes: Vec<u8> = b"Hello World".iter().copied().chain([0; 5]).collect();
        let lines = format_lines(0x1000, &bytes);
        assert_eq!(
            lines,
            vec!["0x1000: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|"]
        );
    }

    #[test]
    fn test_format_partial_line() {
        let lines = format_lines(0x2010, &[0x41; 18]);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("0x2020: 41 41 "));
        assert!(lines[1].ends_with("|AA              |"));
    }
}
