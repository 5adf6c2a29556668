//! PE section table.
//!
//! Headers are decoded with `object`; only the machine and the section table
//! are kept.

use std::fmt;
use std::ops::Range;

use object::pe::{
    ImageDosHeader, ImageFileHeader, ImageNtHeaders32, ImageNtHeaders64, ImageSectionHeader,
};
use object::read::pe::ImageNtHeaders;
use object::{FileKind, LittleEndian as LE, ReadRef};

use super::host::ReadMemory;
use crate::error::{Error, Result};

pub use object::pe::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386, IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE,
    IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};

/// Loader limit
const MAX_SECTIONS: usize = 96;
const MAX_NT_HEADER_OFFSET: usize = 0x1_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    fn from_raw(raw: &ImageSectionHeader) -> Self {
        Self {
            name: String::from_utf8_lossy(raw.raw_name()).into_owned(),
            virtual_address: raw.virtual_address.get(LE),
            virtual_size: raw.virtual_size.get(LE),
            raw_size: raw.size_of_raw_data.get(LE),
            raw_offset: raw.pointer_to_raw_data.get(LE),
            characteristics: raw.characteristics.get(LE),
        }
    }

    /// Mapped length: the virtual size, or the raw size when the linker left it zero
    pub fn len(&self) -> u32 {
        if self.virtual_size == 0 {
            self.raw_size
        } else {
            self.virtual_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_executable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }

    pub fn is_readable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_WRITE != 0
    }
}

/// Section layout of a module mapped at `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub base: u64,
    pub machine: u16,
    pub sections: Vec<SectionHeader>,
}

impl ModuleImage {
    /// Read the headers of a module mapped in a host.
    pub fn from_host<R: ReadMemory + ?Sized>(host: &R, base: u64) -> Result<Self> {
        let dos = host
            .read_bytes(base, size_of::<ImageDosHeader>())
            .map_err(|_| invalid(base, "DOS header is not readable"))?;
        let nt_offset = ImageDosHeader::parse(dos.as_slice())
            .map_err(|e| invalid(base, e))?
            .nt_headers_offset() as usize;
        if nt_offset > MAX_NT_HEADER_OFFSET {
            return Err(invalid(base, "NT header offset out of range"));
        }

        // signature, then the file header
        let file_header_start = nt_offset + size_of::<u32>();
        let nt = host
            .read_bytes(base, file_header_start + size_of::<ImageFileHeader>())
            .map_err(|_| invalid(base, "NT headers are not readable"))?;
        let file_header = nt
            .as_slice()
            .read_at::<ImageFileHeader>(file_header_start as u64)
            .map_err(|_| invalid(base, "truncated NT headers"))?;
        let section_count = section_count(base, file_header)?;

        let table_end = file_header_start
            + size_of::<ImageFileHeader>()
            + file_header.size_of_optional_header.get(LE) as usize
            + section_count * size_of::<ImageSectionHeader>();
        let headers = host
            .read_bytes(base, table_end)
            .map_err(|_| invalid(base, "section table is not readable"))?;
        Self::from_headers(base, &headers)
    }

    /// Parse headers from a byte slice starting at the DOS header.
    pub fn from_headers(base: u64, bytes: &[u8]) -> Result<Self> {
        match FileKind::parse(bytes).map_err(|e| invalid(base, e))? {
            FileKind::Pe32 => Self::parse::<ImageNtHeaders32>(base, bytes),
            FileKind::Pe64 => Self::parse::<ImageNtHeaders64>(base, bytes),
            other => Err(invalid(base, format!("not a PE image ({:?})", other))),
        }
    }

    fn parse<Pe: ImageNtHeaders>(base: u64, bytes: &[u8]) -> Result<Self> {
        let dos = ImageDosHeader::parse(bytes).map_err(|e| invalid(base, e))?;
        let mut offset = dos.nt_headers_offset().into();
        let (nt, _) = Pe::parse(bytes, &mut offset).map_err(|e| invalid(base, e))?;
        let file_header = nt.file_header();
        section_count(base, file_header)?;

        let sections = nt
            .sections(bytes, offset)
            .map_err(|e| invalid(base, e))?
            .iter()
            .map(SectionHeader::from_raw)
            .collect();

        Ok(Self {
            base,
            machine: file_header.machine.get(LE),
            sections,
        })
    }

    pub fn pointer_width(&self) -> usize {
        if self.machine == IMAGE_FILE_MACHINE_I386 {
            4
        } else {
            8
        }
    }

    pub fn section(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_range(&self, section: &SectionHeader) -> Range<u64> {
        let start = self.base + section.virtual_address as u64;
        start..start + section.len() as u64
    }

    /// End of the last section, relative to the base
    pub fn size_of_image(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.virtual_address as u64 + s.len() as u64)
            .max()
            .unwrap_or(0)
    }

    /// Address ranges a module scan covers: executable sections, or every
    /// readable section with `all_sections`.
    pub fn scan_ranges(&self, all_sections: bool) -> Vec<Range<u64>> {
        self.sections
            .iter()
            .filter(|s| !s.is_empty())
            .filter(|s| {
                if all_sections {
                    s.is_readable() || s.is_executable()
                } else {
                    s.is_executable()
                }
            })
            .map(|s| self.section_range(s))
            .collect()
    }
}

fn invalid(base: u64, message: impl fmt::Display) -> Error {
    Error::InvalidImage {
        base,
        message: message.to_string(),
    }
}

fn section_count(base: u64, file_header: &ImageFileHeader) -> Result<usize> {
    let count = file_header.number_of_sections.get(LE) as usize;
    if count > MAX_SECTIONS {
        return Err(invalid(base, "too many sections"));
    }
    Ok(count)
}

/// Build a minimal PE file: headers in the first 0x400 bytes, then each
/// section's raw data in order. Sections are `(name, rva, data, characteristics)`.
#[cfg(any(test, feature = "test-utils"))]
pub fn build_test_image(machine: u16, sections: &[(&str, u32, &[u8], u32)]) -> Vec<u8> {
    use object::pe::{
        IMAGE_DOS_SIGNATURE, IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC,
        IMAGE_NT_SIGNATURE, ImageOptionalHeader32, ImageOptionalHeader64,
    };
    use object::pod::{Pod, from_bytes_mut};
    use object::{U16, U32};

    fn header_mut<T: Pod>(file: &mut [u8], offset: usize) -> &mut T {
        from_bytes_mut(&mut file[offset..])
            .map(|(header, _)| header)
            .expect("header fits in the test image")
    }

    const HEADERS: usize = 0x400;
    const NT_OFFSET: usize = 0x80;

    let (magic, optional_size) = if machine == IMAGE_FILE_MACHINE_I386 {
        (IMAGE_NT_OPTIONAL_HDR32_MAGIC, size_of::<ImageOptionalHeader32>())
    } else {
        (IMAGE_NT_OPTIONAL_HDR64_MAGIC, size_of::<ImageOptionalHeader64>())
    };

    let mut file = vec![0u8; HEADERS];
    let dos = header_mut::<ImageDosHeader>(&mut file, 0);
    dos.e_magic = U16::new(LE, IMAGE_DOS_SIGNATURE);
    dos.e_lfanew = U32::new(LE, NT_OFFSET as u32);
    *header_mut::<U32<LE>>(&mut file, NT_OFFSET) = U32::new(LE, IMAGE_NT_SIGNATURE);

    let file_header_start = NT_OFFSET + size_of::<u32>();
    let file_header = header_mut::<ImageFileHeader>(&mut file, file_header_start);
    file_header.machine = U16::new(LE, machine);
    file_header.number_of_sections = U16::new(LE, sections.len() as u16);
    file_header.size_of_optional_header = U16::new(LE, optional_size as u16);

    // both optional header layouts start with the magic
    let optional_start = file_header_start + size_of::<ImageFileHeader>();
    *header_mut::<U16<LE>>(&mut file, optional_start) = U16::new(LE, magic);

    let mut table = optional_start + optional_size;
    for (name, rva, data, characteristics) in sections {
        let raw_offset = file.len() as u32;
        let header = header_mut::<ImageSectionHeader>(&mut file, table);
        let name_len = name.len().min(8);
        header.name[..name_len].copy_from_slice(&name.as_bytes()[..name_len]);
        header.virtual_size = U32::new(LE, data.len() as u32);
        header.virtual_address = U32::new(LE, *rva);
        header.size_of_raw_data = U32::new(LE, data.len() as u32);
        header.pointer_to_raw_data = U32::new(LE, raw_offset);
        header.characteristics = U32::new(LE, *characteristics);
        file.extend_from_slice(data);
        table += size_of::<ImageSectionHeader>();
    }
    file
}
