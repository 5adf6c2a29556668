//! The current process as a host.

use std::ffi::c_void;
use std::mem::{size_of, zeroed};
use std::ops::Range;

use tracing::{debug, warn};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::LibraryLoader::{
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    GetModuleHandleExW, GetModuleHandleW,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
    PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    PAGE_WRITECOPY, VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::Threading::GetCurrentProcess;
use windows::core::{HSTRING, PCWSTR};

use super::host::{ModuleLookup, ProcessMemory, ReadMemory, read_failed};
use crate::error::{Error, Result};

/// The process the engine is loaded into.
///
/// Reads and writes are plain memory copies, guarded by `VirtualQuery` so a
/// missing signature or a stale pointer never faults.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcess;

impl LocalProcess {
    pub fn new() -> Self {
        Self
    }

    fn query(&self, address: u64) -> Option<MEMORY_BASIC_INFORMATION> {
        // SAFETY: VirtualQuery only inspects the address space and writes into `info`.
        unsafe {
            let mut info: MEMORY_BASIC_INFORMATION = zeroed();
            let written = VirtualQuery(
                Some(address as *const c_void),
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            (written != 0).then_some(info)
        }
    }

    fn try_allocate_at(&self, address: u64, size: usize) -> Option<u64> {
        let info = self.query(address)?;
        let region_end = info.BaseAddress as u64 + info.RegionSize as u64;
        if info.State != MEM_FREE || region_end < address + size as u64 {
            return None;
        }
        // SAFETY: reserving fresh pages at a free address does not alias existing memory.
        let allocated = unsafe {
            VirtualAlloc(
                Some(address as *const c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        (!allocated.is_null()).then_some(allocated as u64)
    }
}

fn allocation_granularity() -> u64 {
    // SAFETY: GetSystemInfo only writes into `info`.
    let info = unsafe {
        let mut info: SYSTEM_INFO = zeroed();
        GetSystemInfo(&mut info);
        info
    };
    (info.dwAllocationGranularity as u64).max(0x1000)
}

fn is_readable_protection(protect: PAGE_PROTECTION_FLAGS) -> bool {
    protect.0 != 0 && (protect & PAGE_NOACCESS).0 == 0 && (protect & PAGE_GUARD).0 == 0
}

fn is_writable_protection(protect: PAGE_PROTECTION_FLAGS) -> bool {
    [
        PAGE_READWRITE,
        PAGE_WRITECOPY,
        PAGE_EXECUTE_READWRITE,
        PAGE_EXECUTE_WRITECOPY,
    ]
    .iter()
    .any(|flag| (protect & *flag).0 != 0)
}

impl ReadMemory for LocalProcess {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        if !self.is_readable(address, size) {
            return Err(read_failed(address, size));
        }
        let mut buffer = vec![0u8; size];
        // SAFETY: the whole range was just checked to be committed and readable.
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), size);
        }
        Ok(buffer)
    }

    fn readable_ranges(&self, address: u64, size: usize) -> Vec<Range<u64>> {
        let end = address.saturating_add(size as u64);
        let mut ranges: Vec<Range<u64>> = Vec::new();
        let mut cursor = address;

        while cursor < end {
            let Some(info) = self.query(cursor) else {
                break;
            };
            let region_start = info.BaseAddress as u64;
            let region_end = region_start + info.RegionSize as u64;
            if region_end <= cursor {
                break;
            }

            if info.State == MEM_COMMIT && is_readable_protection(info.Protect) {
                let start = cursor;
                let stop = region_end.min(end);
                match ranges.last_mut() {
                    Some(last) if last.end == start => last.end = stop,
                    _ => ranges.push(start..stop),
                }
            }
            cursor = region_end;
        }
        ranges
    }

    fn pointer_width(&self) -> usize {
        size_of::<usize>()
    }
}

impl ProcessMemory for LocalProcess {
    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let writable = self
            .query(address)
            .is_some_and(|info| info.State == MEM_COMMIT && is_writable_protection(info.Protect));
        if !writable {
            return Err(Error::MemoryWriteFailed {
                address,
                message: "address range is not writable".to_string(),
            });
        }
        // SAFETY: the destination is committed and writable.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn make_writable(&self, address: u64, size: usize) -> Result<Option<u32>> {
        let info = self.query(address).ok_or(Error::ProtectionFailed {
            address,
            message: "VirtualQuery failed".to_string(),
        })?;
        if info.State != MEM_COMMIT {
            return Err(Error::ProtectionFailed {
                address,
                message: "memory is not committed".to_string(),
            });
        }
        let region_end = info.BaseAddress as u64 + info.RegionSize as u64;
        if is_writable_protection(info.Protect) && region_end >= address + size as u64 {
            return Ok(None);
        }

        let mut previous = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: only the protection of committed pages changes.
        unsafe {
            VirtualProtect(
                address as *const c_void,
                size,
                PAGE_EXECUTE_READWRITE,
                &mut previous,
            )
        }
        .map_err(|e| Error::ProtectionFailed {
            address,
            message: e.to_string(),
        })?;
        Ok(Some(previous.0))
    }

    fn restore_protection(&self, address: u64, size: usize, previous: u32) -> Result<()> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: restores a protection obtained from make_writable on the same range.
        unsafe {
            VirtualProtect(
                address as *const c_void,
                size,
                PAGE_PROTECTION_FLAGS(previous),
                &mut old,
            )
        }
        .map_err(|e| Error::ProtectionFailed {
            address,
            message: e.to_string(),
        })
    }

    fn allocate_near(&self, size: usize, preferred: u64, max_distance: u64) -> Result<u64> {
        let size = size.max(1);
        if preferred == 0 {
            return self
                .try_allocate_anywhere(size)
                .ok_or(Error::AllocationFailed {
                    size,
                    preferred,
                    message: "VirtualAlloc failed".to_string(),
                });
        }

        let granularity = allocation_granularity();
        let origin = preferred / granularity * granularity;
        let lowest = preferred.saturating_sub(max_distance).max(granularity);
        let highest = preferred
            .saturating_add(max_distance)
            .saturating_sub(size as u64);

        // Walk outward so the closest free region wins
        let mut above = origin;
        let mut below = origin;
        loop {
            let mut progressed = false;
            if above <= highest {
                if let Some(address) = self.try_allocate_at(above, size) {
                    debug!("Allocated {} bytes at {:#x} near {:#x}", size, address, preferred);
                    return Ok(address);
                }
                above += granularity;
                progressed = true;
            }
            if below >= lowest + granularity {
                below -= granularity;
                if let Some(address) = self.try_allocate_at(below, size) {
                    debug!("Allocated {} bytes at {:#x} near {:#x}", size, address, preferred);
                    return Ok(address);
                }
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        warn!("No free region for {} bytes within reach of {:#x}", size, preferred);
        Err(Error::AllocationFailed {
            size,
            preferred,
            message: "no free region within reach".to_string(),
        })
    }

    fn free(&self, address: u64) -> Result<()> {
        // SAFETY: the address came from VirtualAlloc in allocate_near.
        unsafe { VirtualFree(address as *mut c_void, 0, MEM_RELEASE) }.map_err(|e| {
            Error::MemoryWriteFailed {
                address,
                message: e.to_string(),
            }
        })
    }

    fn flush_instruction_cache(&self, address: u64, size: usize) {
        // SAFETY: flushing is advisory and reads no memory.
        let flushed = unsafe {
            FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), size)
        };
        if let Err(e) = flushed {
            debug!("FlushInstructionCache at {:#x} failed: {}", address, e);
        }
    }
}

impl LocalProcess {
    fn try_allocate_anywhere(&self, size: usize) -> Option<u64> {
        // SAFETY: the system picks a free address.
        let allocated = unsafe {
            VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
        };
        (!allocated.is_null()).then_some(allocated as u64)
    }
}

fn module_base(module: HMODULE) -> Option<u64> {
    (!module.is_invalid()).then_some(module.0 as u64)
}

impl ModuleLookup for LocalProcess {
    fn main_module(&self) -> Option<u64> {
        // SAFETY: a null name asks for the executable's own handle.
        unsafe { GetModuleHandleW(PCWSTR::null()) }
            .ok()
            .and_then(module_base)
    }

    fn module_by_name(&self, name: &str) -> Option<u64> {
        let name = HSTRING::from(name);
        // SAFETY: `name` outlives the call.
        unsafe { GetModuleHandleW(&name) }
            .ok()
            .and_then(module_base)
    }

    fn module_containing(&self, address: u64) -> Option<u64> {
        let mut module = HMODULE::default();
        // SAFETY: with FROM_ADDRESS the name parameter is an address inside the module.
        unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                PCWSTR(address as *const u16),
                &mut module,
            )
        }
        .ok()
        .and_then(|_| module_base(module))
    }
}
