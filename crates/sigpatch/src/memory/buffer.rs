//! In-memory address space.

use std::cell::RefCell;
use std::ops::Range;

use tracing::debug;

use super::host::{ModuleLookup, ProcessMemory, ReadMemory, read_failed};
use super::pe::ModuleImage;
use crate::error::{Error, Result};

/// Granularity of [`BufferMemory`] allocations, as on Windows
pub const ALLOCATION_GRANULARITY: u64 = 0x1_0000;

/// Where allocations without a preferred address start
const DEFAULT_ALLOCATION_BASE: u64 = 0x10_0000_0000;

/// Page protection bits of a [`BufferMemory`] region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protection(u8);

impl Protection {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXECUTE: Self = Self(4);
    pub const READ_WRITE: Self = Self(1 | 2);
    pub const READ_EXECUTE: Self = Self(1 | 4);
    pub const READ_WRITE_EXECUTE: Self = Self(1 | 2 | 4);

    pub fn readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn executable(self) -> bool {
        self.0 & Self::EXECUTE.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0 as u32
    }

    pub fn from_bits(bits: u32) -> Self {
        Self((bits & 0x7) as u8)
    }

    /// Protection implied by PE section characteristics.
    pub fn from_section_characteristics(characteristics: u32) -> Self {
        let mut bits = 0;
        if characteristics & super::pe::IMAGE_SCN_MEM_READ != 0 {
            bits |= Self::READ.0;
        }
        if characteristics & super::pe::IMAGE_SCN_MEM_WRITE != 0 {
            bits |= Self::WRITE.0;
        }
        if characteristics & super::pe::IMAGE_SCN_MEM_EXECUTE != 0 {
            bits |= Self::EXECUTE.0;
        }
        Self(bits)
    }
}

#[derive(Debug)]
struct Region {
    base: u64,
    data: Vec<u8>,
    protection: Protection,
    allocated: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.base < end && start < self.end()
    }
}

#[derive(Debug)]
struct Module {
    name: String,
    base: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct State {
    /// Sorted by base, never overlapping
    regions: Vec<Region>,
    modules: Vec<Module>,
    main_module: Option<u64>,
    fail_allocations: bool,
    fail_protection: bool,
}

impl State {
    fn insert(&mut self, region: Region) -> Result<()> {
        let end = region.end();
        if region.data.is_empty() || self.regions.iter().any(|r| r.overlaps(region.base, end)) {
            return Err(Error::MemoryWriteFailed {
                address: region.base,
                message: "region overlaps an existing mapping".to_string(),
            });
        }
        let index = self.regions.partition_point(|r| r.base < region.base);
        self.regions.insert(index, region);
        Ok(())
    }

    /// Indices of the regions covering `[start, end)`, or `None` if any byte is unmapped.
    fn covering(&self, start: u64, end: u64) -> Option<Vec<usize>> {
        let mut indices = Vec::new();
        let mut cursor = start;
        for (index, region) in self.regions.iter().enumerate() {
            if cursor >= end {
                break;
            }
            if region.end() <= cursor {
                continue;
            }
            if region.base > cursor {
                return None;
            }
            indices.push(index);
            cursor = region.end();
        }
        (cursor >= end).then_some(indices)
    }
}

/// A fake address space backed by byte buffers.
///
/// Regions carry a [`Protection`] that is enforced by reads and writes.
/// Modules are named address ranges over mapped regions. Allocations are
/// placed on [`ALLOCATION_GRANULARITY`] boundaries at or after the preferred
/// address, skipping mapped regions, and fail once they would land farther
/// than the requested distance.
///
/// Interior mutability lets the engine share a `&BufferMemory` the same way it
/// shares a handle to a live process.
#[derive(Debug)]
pub struct BufferMemory {
    state: RefCell<State>,
    pointer_width: usize,
    allocation_base: u64,
}

impl Default for BufferMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferMemory {
    pub fn new() -> Self {
        Self::with_pointer_width(8)
    }

    pub fn with_pointer_width(pointer_width: usize) -> Self {
        Self {
            state: RefCell::new(State::default()),
            pointer_width,
            allocation_base: DEFAULT_ALLOCATION_BASE,
        }
    }

    /// Set where allocations without a preferred address are placed
    pub fn with_allocation_base(mut self, base: u64) -> Self {
        self.allocation_base = base;
        self
    }

    /// Map a region of raw bytes.
    pub fn map(&self, base: u64, data: Vec<u8>, protection: Protection) -> Result<()> {
        self.state.borrow_mut().insert(Region {
            base,
            data,
            protection,
            allocated: false,
        })
    }

    /// Map a region and register it as a module. The first module becomes the main module.
    pub fn map_module(&self, name: &str, base: u64, data: Vec<u8>, protection: Protection) -> Result<()> {
        let size = data.len() as u64;
        self.map(base, data, protection)?;
        self.register_module(name, base, size);
        Ok(())
    }

    /// Lay out a PE file the way the loader would: headers read-only, each
    /// section at its virtual address with the protection from its
    /// characteristics.
    pub fn map_pe_image(&self, name: &str, base: u64, file: &[u8]) -> Result<ModuleImage> {
        let image = ModuleImage::from_headers(base, file)?;

        let headers_len = image
            .sections
            .iter()
            .map(|s| s.virtual_address as usize)
            .filter(|&va| va > 0)
            .min()
            .unwrap_or(file.len())
            .min(file.len());
        self.map(base, file[..headers_len].to_vec(), Protection::READ)?;

        for section in &image.sections {
            let len = section.len() as usize;
            if len == 0 {
                continue;
            }
            let mut data = vec![0u8; len];
            let raw_start = section.raw_offset as usize;
            let raw_len = (section.raw_size as usize).min(len);
            if raw_start < file.len() {
                let available = raw_len.min(file.len() - raw_start);
                data[..available].copy_from_slice(&file[raw_start..raw_start + available]);
            }
            self.map(
                base + section.virtual_address as u64,
                data,
                Protection::from_section_characteristics(section.characteristics),
            )?;
        }

        self.register_module(name, base, image.size_of_image());
        debug!(
            "Mapped image '{}' at {:#x} ({} sections)",
            name,
            base,
            image.sections.len()
        );
        Ok(image)
    }

    fn register_module(&self, name: &str, base: u64, size: u64) {
        let mut state = self.state.borrow_mut();
        state.modules.push(Module {
            name: name.to_string(),
            base,
            size,
        });
        if state.main_module.is_none() {
            state.main_module = Some(base);
        }
    }

    pub fn set_main_module(&self, base: u64) {
        self.state.borrow_mut().main_module = Some(base);
    }

    /// Make every subsequent allocation fail
    pub fn set_fail_allocations(&self, fail: bool) {
        self.state.borrow_mut().fail_allocations = fail;
    }

    /// Make every subsequent protection change fail
    pub fn set_fail_protection(&self, fail: bool) {
        self.state.borrow_mut().fail_protection = fail;
    }

    /// Raw bytes regardless of protection; unmapped bytes read as zero.
    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        (0..len as u64)
            .map(|i| {
                let at = address + i;
                state
                    .regions
                    .iter()
                    .find(|r| r.base <= at && at < r.end())
                    .map(|r| r.data[(at - r.base) as usize])
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn protection_at(&self, address: u64) -> Option<Protection> {
        self.state
            .borrow()
            .regions
            .iter()
            .find(|r| r.base <= address && address < r.end())
            .map(|r| r.protection)
    }

    /// Bases of live allocations
    pub fn allocations(&self) -> Vec<u64> {
        self.state
            .borrow()
            .regions
            .iter()
            .filter(|r| r.allocated)
            .map(|r| r.base)
            .collect()
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl ReadMemory for BufferMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        if !self.is_readable(address, size) {
            return Err(read_failed(address, size));
        }
        Ok(self.peek(address, size))
    }

    fn readable_ranges(&self, address: u64, size: usize) -> Vec<Range<u64>> {
        let end = address.saturating_add(size as u64);
        let state = self.state.borrow();
        let mut ranges: Vec<Range<u64>> = Vec::new();

        for region in &state.regions {
            if !region.protection.readable() || !region.overlaps(address, end) {
                continue;
            }
            let start = region.base.max(address);
            let stop = region.end().min(end);
            match ranges.last_mut() {
                Some(last) if last.end == start => last.end = stop,
                _ => ranges.push(start..stop),
            }
        }
        ranges
    }

    fn pointer_width(&self) -> usize {
        self.pointer_width
    }
}

impl ProcessMemory for BufferMemory {
    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let end = address.saturating_add(bytes.len() as u64);
        let mut state = self.state.borrow_mut();
        let indices = state.covering(address, end).ok_or(Error::MemoryWriteFailed {
            address,
            message: "address range is not mapped".to_string(),
        })?;
        if indices
            .iter()
            .any(|&i| !state.regions[i].protection.writable())
        {
            return Err(Error::MemoryWriteFailed {
                address,
                message: "address range is not writable".to_string(),
            });
        }

        for (i, byte) in bytes.iter().enumerate() {
            let at = address + i as u64;
            if let Some(region) = state.regions.iter_mut().find(|r| r.base <= at && at < r.end()) {
                region.data[(at - region.base) as usize] = *byte;
            }
        }
        Ok(())
    }

    fn make_writable(&self, address: u64, size: usize) -> Result<Option<u32>> {
        let end = address.saturating_add(size as u64);
        let mut state = self.state.borrow_mut();
        if state.fail_protection {
            return Err(Error::ProtectionFailed {
                address,
                message: "protection changes are disabled".to_string(),
            });
        }
        let indices = state.covering(address, end).ok_or(Error::ProtectionFailed {
            address,
            message: "address range is not mapped".to_string(),
        })?;

        if indices
            .iter()
            .all(|&i| state.regions[i].protection.writable())
        {
            return Ok(None);
        }

        let previous = state.regions[indices[0]].protection;
        for &i in &indices {
            state.regions[i].protection = Protection::READ_WRITE_EXECUTE;
        }
        Ok(Some(previous.bits()))
    }

    fn restore_protection(&self, address: u64, size: usize, previous: u32) -> Result<()> {
        let end = address.saturating_add(size as u64);
        let mut state = self.state.borrow_mut();
        if state.fail_protection {
            return Err(Error::ProtectionFailed {
                address,
                message: "protection changes are disabled".to_string(),
            });
        }
        let indices = state.covering(address, end).ok_or(Error::ProtectionFailed {
            address,
            message: "address range is not mapped".to_string(),
        })?;
        for i in indices {
            state.regions[i].protection = Protection::from_bits(previous);
        }
        Ok(())
    }

    fn allocate_near(&self, size: usize, preferred: u64, max_distance: u64) -> Result<u64> {
        let size = size.max(1);
        let mut state = self.state.borrow_mut();
        if state.fail_allocations {
            return Err(Error::AllocationFailed {
                size,
                preferred,
                message: "allocations are disabled".to_string(),
            });
        }

        let origin = if preferred == 0 {
            self.allocation_base
        } else {
            preferred
        };
        let mut candidate = align_up(origin, ALLOCATION_GRANULARITY);
        loop {
            let end = candidate + size as u64;
            if preferred != 0 && end - preferred > max_distance {
                return Err(Error::AllocationFailed {
                    size,
                    preferred,
                    message: "no free region within reach".to_string(),
                });
            }
            match state.regions.iter().find(|r| r.overlaps(candidate, end)) {
                Some(blocking) => candidate = align_up(blocking.end(), ALLOCATION_GRANULARITY),
                None => break,
            }
        }

        state.insert(Region {
            base: candidate,
            data: vec![0u8; size],
            protection: Protection::READ_WRITE_EXECUTE,
            allocated: true,
        })?;
        debug!("Allocated {} bytes at {:#x}", size, candidate);
        Ok(candidate)
    }

    fn free(&self, address: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let index = state
            .regions
            .iter()
            .position(|r| r.allocated && r.base == address)
            .ok_or(Error::MemoryWriteFailed {
                address,
                message: "not an allocation".to_string(),
            })?;
        state.regions.remove(index);
        Ok(())
    }
}

impl ModuleLookup for BufferMemory {
    fn main_module(&self) -> Option<u64> {
        self.state.borrow().main_module
    }

    fn module_by_name(&self, name: &str) -> Option<u64> {
        self.state
            .borrow()
            .modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .map(|m| m.base)
    }

    fn module_containing(&self, address: u64) -> Option<u64> {
        self.state
            .borrow()
            .modules
            .iter()
            .find(|m| m.base <= address && address < m.base + m.size)
            .map(|m| m.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rejects_overlap() {
        let memory = BufferMemory::new();
        memory.map(0x1000, vec![0; 0x100], Protection::READ).unwrap();
        assert!(memory.map(0x10F0, vec![0; 0x20], Protection::READ).is_err());
        assert!(memory.map(0x1100, vec![0; 0x20], Protection::READ).is_ok());
    }

    #[test]
    fn test_readable_ranges_merge_and_clip() {
        let memory = BufferMemory::new();
        memory.map(0x1000, vec![0; 0x100], Protection::READ).unwrap();
        memory.map(0x1100, vec![0; 0x100], Protection::READ_EXECUTE).unwrap();
        memory.map(0x1200, vec![0; 0x100], Protection::NONE).unwrap();
        memory.map(0x1300, vec![0; 0x100], Protection::READ).unwrap();

        let ranges = memory.readable_ranges(0x1080, 0x300);
        assert_eq!(ranges, vec![0x1080..0x1200, 0x1300..0x1380]);
    }

    #[test]
    fn test_write_requires_writable() {
        let memory = BufferMemory::new();
        memory.map(0x1000, vec![0; 0x10], Protection::READ).unwrap();
        assert!(memory.write_bytes(0x1000, &[1]).is_err());
        assert!(memory.write_bytes(0x2000, &[1]).is_err());

        let previous = memory.make_writable(0x1000, 4).unwrap();
        assert_eq!(previous, Some(Protection::READ.bits()));
        memory.write_bytes(0x1000, &[1, 2]).unwrap();
        memory.restore_protection(0x1000, 4, Protection::READ.bits()).unwrap();
        assert_eq!(memory.peek(0x1000, 3), vec![1, 2, 0]);
        assert_eq!(memory.protection_at(0x1000), Some(Protection::READ));
    }

    #[test]
    fn test_make_writable_no_change_needed() {
        let memory = BufferMemory::new();
        memory.map(0x1000, vec![0; 0x10], Protection::READ_WRITE).unwrap();
        assert_eq!(memory.make_writable(0x1000, 0x10).unwrap(), None);
    }

    #[test]
    fn test_allocate_near_skips_mapped_regions() {
        let memory = BufferMemory::new();
        memory.map(0x14000_0000, vec![0; 0x2_0000], Protection::READ_EXECUTE).unwrap();

        let address = memory.allocate_near(16, 0x14000_1000, i32::MAX as u64).unwrap();
        assert_eq!(address, 0x14002_0000);
        assert_eq!(address % ALLOCATION_GRANULARITY, 0);
        assert_eq!(memory.protection_at(address), Some(Protection::READ_WRITE_EXECUTE));

        let second = memory.allocate_near(16, 0x14000_1000, i32::MAX as u64).unwrap();
        assert_eq!(second, 0x14003_0000);
        assert_eq!(memory.allocations(), vec![address, second]);
    }

    #[test]
    fn test_allocate_near_respects_reach() {
        let memory = BufferMemory::new();
        memory.map(0x1_0000, vec![0; 0x10_0000], Protection::READ).unwrap();
        let err = memory.allocate_near(16, 0x1_0000, 0x1000).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { .. }));
    }

    #[test]
    fn test_allocation_failure_injection_and_free() {
        let memory = BufferMemory::new();
        memory.set_fail_allocations(true);
        assert!(memory.allocate_near(16, 0, 0).is_err());

        memory.set_fail_allocations(false);
        let address = memory.allocate_near(16, 0, 0).unwrap();
        assert_eq!(address, DEFAULT_ALLOCATION_BASE);
        memory.free(address).unwrap();
        assert!(memory.allocations().is_empty());
        assert!(memory.free(address).is_err());
    }

    #[test]
    fn test_module_lookup() {
        let memory = BufferMemory::new();
        memory
            .map_module("game.exe", 0x4000_0000, vec![0; 0x1000], Protection::READ)
            .unwrap();
        memory
            .map_module("engine.dll", 0x5000_0000, vec![0; 0x1000], Protection::READ)
            .unwrap();

        assert_eq!(memory.main_module(), Some(0x4000_0000));
        assert_eq!(memory.module_by_name("ENGINE.DLL"), Some(0x5000_0000));
        assert_eq!(memory.module_containing(0x5000_0800), Some(0x5000_0000));
        assert_eq!(memory.module_containing(0x6000_0000), None);
    }
}
