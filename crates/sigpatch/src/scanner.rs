//! Signature scanning over module sections and address ranges.
//!
//! Only committed, readable memory is read: the scanner walks the host's
//! readable ranges in chunks, carrying the last `len - 1` bytes of each chunk
//! into the next so matches that straddle a chunk boundary are still found.
//! Every match is reported, overlapping ones included.

use std::ops::Range;

use tracing::{debug, error, warn};

use crate::config::{DEFAULT_SCAN_CHUNK_SIZE, EngineConfig};
use crate::cursor::Cursor;
use crate::memory::{ModuleImage, ModuleLookup, ReadMemory};
use crate::signature::{Signature, SignatureEntry};

/// Where a module scan looks and how many matches it accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Scan every readable section instead of only executable ones
    pub all_sections: bool,
    /// Fail unless exactly one match exists
    pub require_unique: bool,
}

impl ScanOptions {
    pub fn with_all_sections(mut self) -> Self {
        self.all_sections = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.require_unique = true;
        self
    }
}

/// Result of an ordered multi-candidate scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateMatch {
    pub cursor: Cursor,
    /// Index of the signature that matched
    pub pattern_index: usize,
}

pub struct Scanner<'h, H: ?Sized> {
    host: &'h H,
    chunk_size: usize,
}

impl<'h, H: ReadMemory + ?Sized> Scanner<'h, H> {
    pub fn new(host: &'h H) -> Self {
        Self {
            host,
            chunk_size: DEFAULT_SCAN_CHUNK_SIZE,
        }
    }

    pub fn with_config(host: &'h H, config: &EngineConfig) -> Self {
        Self {
            host,
            chunk_size: config.scan_chunk_size.max(1),
        }
    }

    /// First match fully inside `[start, start + size)`.
    pub fn scan_range(&self, start: u64, size: usize, signature: &Signature) -> Cursor {
        self.search(start, size, signature, true)
            .first()
            .map_or(Cursor::NOT_FOUND, |&address| Cursor::found(address))
    }

    /// Every match fully inside `[start, start + size)`, in address order.
    pub fn scan_range_all(&self, start: u64, size: usize, signature: &Signature) -> Vec<Cursor> {
        self.search(start, size, signature, false)
            .into_iter()
            .map(Cursor::found)
            .collect()
    }

    /// Scan the sections of the module at `module`.
    pub fn scan(&self, module: u64, signature: &Signature, options: ScanOptions) -> Cursor {
        if options.require_unique {
            let matches = self.scan_all(module, signature, options.all_sections);
            return match matches.as_slice() {
                [single] => *single,
                [] => {
                    error!("Pattern not found for signature: {}", signature);
                    Cursor::NOT_FOUND
                }
                _ => {
                    error!(
                        "Multiple matches ({}) found for signature: {}",
                        matches.len(),
                        signature
                    );
                    Cursor::NOT_FOUND
                }
            };
        }

        for range in self.module_ranges(module, options.all_sections) {
            let cursor = self.scan_range(range.start, span(&range), signature);
            if cursor.is_found() {
                debug!("Signature {} found at {:?}", signature, cursor);
                return cursor;
            }
        }
        debug!("Signature {} not found in module {:#x}", signature, module);
        Cursor::NOT_FOUND
    }

    /// Every match in the sections of the module at `module`.
    pub fn scan_all(&self, module: u64, signature: &Signature, all_sections: bool) -> Vec<Cursor> {
        let matches: Vec<Cursor> = self
            .module_ranges(module, all_sections)
            .into_iter()
            .flat_map(|range| self.scan_range_all(range.start, span(&range), signature))
            .collect();
        debug!(
            "Signature {} matched {} time(s) in module {:#x}",
            signature,
            matches.len(),
            module
        );
        matches
    }

    /// Scan a single section by name, whatever its characteristics.
    pub fn scan_section(&self, module: u64, section: &str, signature: &Signature) -> Cursor {
        let image = match ModuleImage::from_host(self.host, module) {
            Ok(image) => image,
            Err(e) => {
                warn!("Cannot scan section {} of {:#x}: {}", section, module, e);
                return Cursor::NOT_FOUND;
            }
        };
        match image.section(section) {
            Some(header) => {
                let range = image.section_range(header);
                self.scan_range(range.start, span(&range), signature)
            }
            None => {
                debug!("Section {} not found in module {:#x}", section, module);
                Cursor::NOT_FOUND
            }
        }
    }

    /// Try each signature in order and return the first that matches.
    pub fn scan_candidates(
        &self,
        module: u64,
        candidates: &[Signature],
        options: ScanOptions,
    ) -> Option<CandidateMatch> {
        candidates
            .iter()
            .enumerate()
            .find_map(|(pattern_index, signature)| {
                let cursor = self.scan(module, signature, options);
                cursor.is_found().then_some(CandidateMatch {
                    cursor,
                    pattern_index,
                })
            })
    }

    pub fn scan_entry(&self, module: u64, entry: &SignatureEntry) -> Option<CandidateMatch> {
        let found = self.scan_candidates(module, &entry.candidates, entry.options());
        if found.is_none() {
            debug!("No candidate matched for {}", entry.name);
        }
        found
    }

    fn module_ranges(&self, module: u64, all_sections: bool) -> Vec<Range<u64>> {
        match ModuleImage::from_host(self.host, module) {
            Ok(image) => image.scan_ranges(all_sections),
            Err(e) => {
                warn!("Cannot scan module at {:#x}: {}", module, e);
                Vec::new()
            }
        }
    }

    /// Match addresses fully inside `[start, start + size)`.
    pub(crate) fn search(
        &self,
        start: u64,
        size: usize,
        signature: &Signature,
        first_only: bool,
    ) -> Vec<u64> {
        let mut results = Vec::new();
        let keep = signature.len().saturating_sub(1);

        for range in self.host.readable_ranges(start, size) {
            let mut tail: Vec<u8> = Vec::new();
            let mut address = range.start;

            while address < range.end {
                let read_size = ((range.end - address) as usize).min(self.chunk_size);
                let chunk = match self.host.read_bytes(address, read_size) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!("Scan stopped at {:#x}: {}", address, e);
                        break;
                    }
                };

                let mut data = Vec::with_capacity(tail.len() + chunk.len());
                data.extend_from_slice(&tail);
                data.extend_from_slice(&chunk);
                let data_base = address - tail.len() as u64;

                let mut done = false;
                find_matches(&data, signature, |pos| {
                    results.push(data_base + pos as u64);
                    done = first_only;
                    !first_only
                });
                if done {
                    return results;
                }

                tail = if data.len() > keep {
                    data[data.len() - keep..].to_vec()
                } else {
                    data
                };
                address += read_size as u64;
            }
        }
        results
    }
}

impl<'h, H: ReadMemory + ModuleLookup + ?Sized> Scanner<'h, H> {
    /// Scan the main executable.
    pub fn scan_main(&self, signature: &Signature, options: ScanOptions) -> Cursor {
        match self.host.main_module() {
            Some(module) => self.scan(module, signature, options),
            None => {
                warn!("Main module is not available");
                Cursor::NOT_FOUND
            }
        }
    }

    /// Scan a loaded module by file name.
    pub fn scan_module_named(&self, name: &str, signature: &Signature, options: ScanOptions) -> Cursor {
        match self.host.module_by_name(name) {
            Some(module) => self.scan(module, signature, options),
            None => {
                warn!("Module {} is not loaded", name);
                Cursor::NOT_FOUND
            }
        }
    }
}

fn span(range: &Range<u64>) -> usize {
    (range.end - range.start) as usize
}

/// Calls `visit` with each offset in `data` where `signature` matches, in
/// order, until it returns `false`. Skips to candidates with memchr when the
/// signature has a required byte.
pub(crate) fn find_matches(data: &[u8], signature: &Signature, mut visit: impl FnMut(usize) -> bool) {
    let len = signature.len();
    if len == 0 || data.len() < len {
        return;
    }
    let last = data.len() - len;

    match signature.anchor() {
        Some((index, byte)) => {
            for pos in memchr::memchr_iter(byte, &data[index..=last + index]) {
                if signature.matches(&data[pos..]) && !visit(pos) {
                    return;
                }
            }
        }
        None => {
            for pos in 0..=last {
                if !visit(pos) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pe::{
        IMAGE_FILE_MACHINE_AMD64, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
        build_test_image,
    };
    use crate::memory::{BufferMemory, Protection};

    const BASE: u64 = 0x14000_0000;
    const TEXT: u32 = IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;
    const DATA: u32 = IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;

    fn sig(text: &str) -> Signature {
        Signature::parse(text).unwrap()
    }

    fn image_with(text: &[u8], data: &[u8]) -> BufferMemory {
        let memory = BufferMemory::new();
        let file = build_test_image(
            IMAGE_FILE_MACHINE_AMD64,
            &[(".text", 0x1000, text, TEXT), (".data", 0x3000, data, DATA)],
        );
        memory.map_pe_image("game.exe", BASE, &file).unwrap();
        memory
    }

    #[test]
    fn test_unique_signature_found_at_offset() {
        let mut text = vec![0x90u8; 0x200];
        text[0x123..0x128].copy_from_slice(&[0x8B, 0x41, 0x2C, 0x84, 0xC0]);
        let memory = image_with(&text, &[0; 16]);
        let scanner = Scanner::new(&memory);
        let signature = sig("8B 41 2C 84 C0");

        let cursor = scanner.scan(BASE, &signature, ScanOptions::default());
        assert_eq!(cursor.as_address(), Some(BASE + 0x1123));
        let all = scanner.scan_all(BASE, &signature, false);
        assert_eq!(all, vec![Cursor::found(BASE + 0x1123)]);
        assert!(scanner.scan(BASE, &signature, ScanOptions::default().unique()).is_found());
    }

    #[test]
    fn test_wildcards_match_differing_bytes() {
        let mut text = vec![0u8; 0x40];
        text[0x10..0x14].copy_from_slice(&[0x48, 0x11, 0x22, 0xC3]);
        text[0x20..0x24].copy_from_slice(&[0x48, 0x33, 0x44, 0xC3]);
        let memory = image_with(&text, &[0; 16]);
        let scanner = Scanner::new(&memory);

        let all = scanner.scan_all(BASE, &sig("48 ?? ?? C3"), false);
        assert_eq!(
            all,
            vec![Cursor::found(BASE + 0x1010), Cursor::found(BASE + 0x1020)]
        );
    }

    #[test]
    fn test_scan_all_reports_overlapping_matches() {
        let memory = image_with(&[0xAA, 0xAA, 0xAA, 0xAA, 0x00], &[0; 16]);
        let scanner = Scanner::new(&memory);

        let all = scanner.scan_all(BASE, &sig("AA AA"), false);
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].as_address(), Some(BASE + 0x1001));
    }

    #[test]
    fn test_require_unique_rejects_multiple() {
        let memory = image_with(&[0xC3, 0x00, 0xC3, 0x00], &[0; 16]);
        let scanner = Scanner::new(&memory);
        let options = ScanOptions::default().unique();

        assert!(!scanner.scan(BASE, &sig("C3 00"), options).is_found());
        assert!(scanner.scan(BASE, &sig("C3 00"), ScanOptions::default()).is_found());
        assert!(!scanner.scan(BASE, &sig("C3 C3"), options).is_found());
    }

    #[test]
    fn test_data_sections_need_all_sections() {
        let memory = image_with(&[0x90; 8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        let scanner = Scanner::new(&memory);
        let signature = sig("DE AD BE EF");

        assert!(!scanner.scan(BASE, &signature, ScanOptions::default()).is_found());
        let cursor = scanner.scan(BASE, &signature, ScanOptions::default().with_all_sections());
        assert_eq!(cursor.as_address(), Some(BASE + 0x3000));
    }

    #[test]
    fn test_match_across_chunk_boundary() {
        let mut text = vec![0u8; 64];
        text[14..18].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        let memory = image_with(&text, &[0; 16]);
        let config = EngineConfig::builder().scan_chunk_size(16).build();
        let scanner = Scanner::with_config(&memory, &config);

        let all = scanner.scan_all(BASE, &sig("11 22 33 44"), false);
        assert_eq!(all, vec![Cursor::found(BASE + 0x100E)]);
    }

    #[test]
    fn test_scan_range_skips_unreadable_gaps() {
        let memory = BufferMemory::new();
        memory.map(0x1000, vec![0xAB; 0x10], Protection::READ).unwrap();
        memory.map(0x1010, vec![0xCD; 0x10], Protection::NONE).unwrap();
        memory.map(0x1030, vec![0xCD, 0xCD, 0xEF], Protection::READ).unwrap();

        let scanner = Scanner::new(&memory);
        assert_eq!(
            scanner.scan_range(0x1000, 0x40, &sig("CD ?? EF")).as_address(),
            Some(0x1030)
        );
        assert!(scanner.scan_range_all(0x1000, 0x40, &sig("AB CD")).is_empty());
    }

    #[test]
    fn test_scan_range_requires_full_match_inside() {
        let memory = BufferMemory::new();
        memory.map(0x1000, vec![0, 0, 0x11, 0x22], Protection::READ).unwrap();
        let scanner = Scanner::new(&memory);
        assert!(!scanner.scan_range(0x1000, 3, &sig("11 22")).is_found());
        assert!(scanner.scan_range(0x1000, 4, &sig("11 22")).is_found());
    }

    #[test]
    fn test_scan_section_by_name() {
        let memory = image_with(&[0x90; 8], &[0x90; 8]);
        let scanner = Scanner::new(&memory);
        assert_eq!(
            scanner.scan_section(BASE, ".data", &sig("90 90")).as_address(),
            Some(BASE + 0x3000)
        );
        assert!(!scanner.scan_section(BASE, ".rdata", &sig("90")).is_found());
    }

    #[test]
    fn test_scan_candidates_first_match_wins() {
        let memory = image_with(&[0x55, 0x48, 0x89, 0xE5, 0xC3], &[0; 16]);
        let scanner = Scanner::new(&memory);
        let candidates = [sig("55 8B EC"), sig("55 48 89 E5"), sig("C3")];

        let found = scanner
            .scan_candidates(BASE, &candidates, ScanOptions::default())
            .unwrap();
        assert_eq!(found.pattern_index, 1);
        assert_eq!(found.cursor.as_address(), Some(BASE + 0x1000));
        assert!(
            scanner
                .scan_candidates(BASE, &candidates[..1], ScanOptions::default())
                .is_none()
        );
    }

    #[test]
    fn test_scan_main_and_named_module() {
        let memory = image_with(&[0xCC, 0xC3], &[0; 16]);
        let scanner = Scanner::new(&memory);
        assert!(scanner.scan_main(&sig("CC C3"), ScanOptions::default()).is_found());
        assert!(
            scanner
                .scan_module_named("GAME.EXE", &sig("CC C3"), ScanOptions::default())
                .is_found()
        );
        assert!(
            !scanner
                .scan_module_named("other.dll", &sig("CC C3"), ScanOptions::default())
                .is_found()
        );
    }

    #[test]
    fn test_scan_invalid_module_is_not_found() {
        let memory = BufferMemory::new();
        memory.map(0x1000, vec![0xC3; 0x100], Protection::READ_EXECUTE).unwrap();
        let scanner = Scanner::new(&memory);
        assert!(!scanner.scan(0x1000, &sig("C3"), ScanOptions::default()).is_found());
    }

    #[test]
    fn test_find_matches_all_wildcards() {
        let mut seen = Vec::new();
        find_matches(&[1, 2, 3], &sig("?? ??"), |pos| {
            seen.push(pos);
            true
        });
        assert_eq!(seen, vec![0, 1]);
    }
}
