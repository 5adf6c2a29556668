use std::ops::Range;

use tracing::warn;

use crate::error::{Error, Result};

/// Read access to a target address space.
///
/// Implementations must never fault: reads of uncommitted, guarded or
/// no-access memory return an error instead.
pub trait ReadMemory {
    /// Copy `size` bytes starting at `address`. Fails unless the whole range is readable.
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Readable sub-ranges of `[address, address + size)`, clipped to the query,
    /// sorted and merged where contiguous.
    fn readable_ranges(&self, address: u64, size: usize) -> Vec<Range<u64>>;

    /// Check that `[address, address + size)` is committed and readable.
    fn is_readable(&self, address: u64, size: usize) -> bool {
        if address == 0 {
            return false;
        }
        let size = size.max(1);
        let Some(end) = address.checked_add(size as u64) else {
            return false;
        };
        let ranges = self.readable_ranges(address, size);
        ranges.len() == 1 && ranges[0].start == address && ranges[0].end == end
    }

    /// Width in bytes of a pointer in the target.
    fn pointer_width(&self) -> usize {
        8
    }

    fn read_u8(&self, address: u64) -> Result<u8> {
        let bytes = self.read_bytes(address, 1)?;
        Ok(bytes[0])
    }

    fn read_u16(&self, address: u64) -> Result<u16> {
        let bytes = self.read_bytes(address, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        Ok(self.read_u32(address)? as i32)
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read_bytes(address, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a pointer-width value.
    fn read_pointer(&self, address: u64) -> Result<u64> {
        match self.pointer_width() {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }
}

/// Resolution of loaded modules to their base addresses.
pub trait ModuleLookup {
    /// Base of the main executable image.
    fn main_module(&self) -> Option<u64>;

    /// Base of a loaded module by file name (case-insensitive).
    fn module_by_name(&self, name: &str) -> Option<u64>;

    /// Base of the module whose image contains `address`.
    fn module_containing(&self, address: u64) -> Option<u64>;

    /// Like [`ModuleLookup::module_by_name`], failing when the module is not loaded.
    fn require_module(&self, name: &str) -> Result<u64> {
        self.module_by_name(name)
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }
}

/// Mutating access to a target address space.
pub trait ProcessMemory: ReadMemory {
    /// Copy `bytes` to `address`. The range must already be writable.
    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()>;

    /// Make `[address, address + size)` writable.
    ///
    /// Returns the previous protection, to be handed back to
    /// [`ProcessMemory::restore_protection`], or `None` if nothing was changed.
    fn make_writable(&self, address: u64, size: usize) -> Result<Option<u32>>;

    /// Restore a protection returned by [`ProcessMemory::make_writable`].
    fn restore_protection(&self, address: u64, size: usize, previous: u32) -> Result<()>;

    /// Allocate executable, writable memory within `max_distance` of `preferred`.
    /// A `preferred` of zero places the allocation anywhere.
    fn allocate_near(&self, size: usize, preferred: u64, max_distance: u64) -> Result<u64>;

    /// Release memory obtained from [`ProcessMemory::allocate_near`].
    fn free(&self, address: u64) -> Result<()>;

    /// No-op on x86.
    fn flush_instruction_cache(&self, _address: u64, _size: usize) {}
}

/// Overwrites bytes in a region that may not currently be writable.
///
/// Protection is relaxed immediately before the write and restored
/// immediately after it.
pub fn overwrite_code<M: ProcessMemory + ?Sized>(host: &M, address: u64, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    let previous = host.make_writable(address, bytes.len())?;
    let written = host.write_bytes(address, bytes);

    if let Some(previous) = previous
        && let Err(e) = host.restore_protection(address, bytes.len(), previous)
    {
        warn!("Failed to restore protection at {:#x}: {}", address, e);
    }

    written?;
    host.flush_instruction_cache(address, bytes.len());
    Ok(())
}

/// Read every readable byte of `[address, address + size)`, skipping holes.
pub fn read_readable<R: ReadMemory + ?Sized>(
    host: &R,
    address: u64,
    size: usize,
) -> Vec<(u64, Vec<u8>)> {
    host.readable_ranges(address, size)
        .into_iter()
        .filter_map(|range| {
            let len = (range.end - range.start) as usize;
            host.read_bytes(range.start, len)
                .ok()
                .map(|bytes| (range.start, bytes))
        })
        .collect()
}

pub(crate) fn read_failed(address: u64, len: usize) -> Error {
    Error::MemoryReadFailed { address, len }
}
