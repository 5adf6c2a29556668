//! PE images loaded from disk into an in-memory address space.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sigpatch::memory::pe::IMAGE_FILE_MACHINE_I386;
use sigpatch::{BufferMemory, ModuleImage};
use tracing::info;

/// Preferred load address of 64-bit executables
pub const DEFAULT_BASE_64: u64 = 0x1_4000_0000;
/// Preferred load address of 32-bit executables
pub const DEFAULT_BASE_32: u64 = 0x40_0000;

pub struct LoadedImage {
    pub memory: BufferMemory,
    pub image: ModuleImage,
}

impl LoadedImage {
    /// Map the PE file at `path`. Without `base`, the usual executable base
    /// for the image's machine type is used.
    pub fn load(path: &Path, base: Option<u64>) -> Result<Self> {
        let file = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let headers = ModuleImage::from_headers(0, &file)
            .with_context(|| format!("{} is not a PE image", path.display()))?;

        let base = base.unwrap_or(if headers.machine == IMAGE_FILE_MACHINE_I386 {
            DEFAULT_BASE_32
        } else {
            DEFAULT_BASE_64
        });

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let memory = BufferMemory::with_pointer_width(headers.pointer_width());
        let image = memory.map_pe_image(&name, base, &file)?;

        info!(
            "Loaded {} at 0x{:X} ({} sections)",
            name,
            base,
            image.sections.len()
        );
        Ok(Self { memory, image })
    }

    pub fn base(&self) -> u64 {
        self.image.base
    }

    /// Offset of `address` from the image base
    pub fn rva(&self, address: u64) -> u64 {
        address.wrapping_sub(self.image.base)
    }

    /// Name of the section containing `address`
    pub fn section_of(&self, address: u64) -> Option<&str> {
        self.image
            .sections
            .iter()
            .find(|s| self.image.section_range(s).contains(&address))
            .map(|s| s.name.as_str())
    }
}
