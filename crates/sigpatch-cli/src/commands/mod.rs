//! CLI command implementations.
//!
//! Every command works on a PE image mapped from disk, never on a live process.

pub mod check;
pub mod hex_utils;
pub mod hexdump;
pub mod resolve;
pub mod scan;

/// Map a PE image built from `sections` at `base`.
#[cfg(test)]
pub(crate) fn test_memory(base: u64, sections: &[(&str, u32, &[u8], u32)]) -> sigpatch::BufferMemory {
    use sigpatch::memory::pe::{IMAGE_FILE_MACHINE_AMD64, build_test_image};

    let file = build_test_image(IMAGE_FILE_MACHINE_AMD64, sections);
    let memory = sigpatch::BufferMemory::new();
    memory.map_pe_image("game.exe", base, &file).unwrap();
    memory
}
