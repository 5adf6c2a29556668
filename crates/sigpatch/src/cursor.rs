//! Address cursors.
//!
//! A [`Cursor`] is the result of a scan: an address plus a found flag. Every
//! derivation returns a new cursor, and a not-found cursor stays not-found
//! through any chain of derivations, so code built on a signature that is
//! missing from the current build never touches a bogus address.
//!
//! ```ignore
//! let health = scanner
//!     .scan_main(&Signature::parse("8B 0D ?? ?? ?? ?? 85 C9")?, ScanOptions::default())
//!     .resolve_relative(&host, 6, 2)
//!     .dereference(&host, 0)
//!     .offset(0x2C);
//! if let Some(address) = health.as_address() { /* ... */ }
//! ```

use std::fmt;
use std::mem::size_of;

use tracing::{debug, error};

use crate::config::DEFAULT_PROLOGUE_SEARCH_WINDOW;
use crate::memory::ReadMemory;
use crate::scanner::Scanner;
use crate::signature::Signature;

/// `int3` padding between functions
const PADDING_BYTE: u8 = 0xCC;
/// `push ebp; mov ebp, esp`
const FRAME_PROLOGUE: [u8; 3] = [0x55, 0x8B, 0xEC];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cursor {
    address: u64,
    found: bool,
}

impl Cursor {
    pub const NOT_FOUND: Cursor = Cursor {
        address: 0,
        found: false,
    };

    pub fn found(address: u64) -> Self {
        Self {
            address,
            found: true,
        }
    }

    /// Found iff `address` is non-zero.
    pub fn from_address(address: u64) -> Self {
        Self {
            address,
            found: address != 0,
        }
    }

    pub fn is_found(self) -> bool {
        self.found
    }

    pub fn as_address(self) -> Option<u64> {
        self.found.then_some(self.address)
    }

    pub fn offset(self, delta: i64) -> Self {
        if !self.found {
            return self;
        }
        Self::found(self.address.wrapping_add_signed(delta))
    }

    /// Read a pointer-width value at `address + offset`.
    pub fn dereference<R: ReadMemory + ?Sized>(self, host: &R, offset: i64) -> Self {
        let Some(address) = self.as_address() else {
            return self;
        };
        match host.read_pointer(address.wrapping_add_signed(offset)) {
            Ok(value) => Self::found(value),
            Err(_) => Self::NOT_FOUND,
        }
    }

    /// Follow a displacement-relative operand: `address + instruction_size + disp32`,
    /// with the displacement read at `address + displacement_offset`.
    pub fn resolve_relative<R: ReadMemory + ?Sized>(
        self,
        host: &R,
        instruction_size: i64,
        displacement_offset: i64,
    ) -> Self {
        let Some(address) = self.as_address() else {
            return self;
        };
        match host.read_i32(address.wrapping_add_signed(displacement_offset)) {
            Ok(displacement) => Self::found(
                address
                    .wrapping_add_signed(instruction_size)
                    .wrapping_add_signed(displacement as i64),
            ),
            Err(_) => Self::NOT_FOUND,
        }
    }

    /// Search near the cursor: match starts in `[address, address + range)`
    /// for a positive range, `[address + range, address)` for a negative one.
    /// The nearest match wins. A match may extend past the window.
    pub fn scan_relative<R: ReadMemory + ?Sized>(
        self,
        host: &R,
        signature: &Signature,
        range: i64,
    ) -> Self {
        let Some(address) = self.as_address() else {
            return self;
        };
        if range == 0 {
            return Self::NOT_FOUND;
        }

        let (low, high) = if range > 0 {
            (address, address.saturating_add(range as u64))
        } else {
            (address.saturating_sub(range.unsigned_abs()), address)
        };
        let size = (high - low) as usize + signature.len().saturating_sub(1);
        let starts = Scanner::new(host)
            .search(low, size, signature, false)
            .into_iter()
            .filter(|&start| start < high);

        let nearest = if range > 0 { starts.min() } else { starts.max() };
        nearest.map_or(Self::NOT_FOUND, Self::found)
    }

    /// Walk a pointer chain: for each offset, `address = *(address + offset)`.
    /// An unreadable or null link ends the walk as not-found.
    pub fn resolve_pointer_chain<R: ReadMemory + ?Sized>(self, host: &R, offsets: &[i64]) -> Self {
        let Some(mut address) = self.as_address() else {
            return self;
        };
        for (depth, offset) in offsets.iter().enumerate() {
            let link = address.wrapping_add_signed(*offset);
            address = match host.read_pointer(link) {
                Ok(0) | Err(_) => {
                    debug!("Pointer chain broke at depth {} ({:#x})", depth, link);
                    return Self::NOT_FOUND;
                }
                Ok(value) => value,
            };
        }
        Self::found(address)
    }

    /// Read the 32-bit absolute address operand of the instruction at
    /// `address + instruction_offset`.
    ///
    /// Recognised forms: `A1`/`A3` moffs, `8B`/`89`/`8D` and the `0F` and
    /// `F3 0F` SSE/movzx forms with a `[disp32]` ModRM.
    pub fn extract_absolute_address<R: ReadMemory + ?Sized>(
        self,
        host: &R,
        instruction_offset: i64,
    ) -> Self {
        let Some(address) = self.as_address() else {
            return self;
        };
        let instruction = address.wrapping_add_signed(instruction_offset);
        let Ok(opcode) = host.read_bytes(instruction, 4) else {
            return Self::NOT_FOUND;
        };

        let operand_offset = match opcode[0] {
            0xA1 | 0xA3 => Some(1),
            0x8B | 0x89 | 0x8D => is_absolute_modrm(opcode[1]).then_some(2),
            0x0F => (matches!(opcode[1], 0x10 | 0x11 | 0x28 | 0x29 | 0xB6 | 0xB7)
                && is_absolute_modrm(opcode[2]))
            .then_some(3),
            0xF3 => (opcode[1] == 0x0F
                && matches!(opcode[2], 0x10 | 0x11)
                && is_absolute_modrm(opcode[3]))
            .then_some(4),
            other => {
                error!(
                    "Unsupported opcode {:#04x} for absolute address extraction at {:#x}",
                    other, instruction
                );
                return Self::NOT_FOUND;
            }
        };

        operand_offset
            .and_then(|offset| host.read_u32(instruction + offset).ok())
            .map_or(Self::NOT_FOUND, |value| Self::from_address(value as u64))
    }

    /// Walk back to the start of the enclosing function, within the default window.
    pub fn align_to_function_start<R: ReadMemory + ?Sized>(self, host: &R) -> Self {
        self.align_to_function_start_within(host, DEFAULT_PROLOGUE_SEARCH_WINDOW)
    }

    /// Walk back at most `window` bytes to the first byte after `CC` padding
    /// or to a `55 8B EC` frame prologue. Never crosses the start of the
    /// readable range holding the cursor.
    pub fn align_to_function_start_within<R: ReadMemory + ?Sized>(self, host: &R, window: usize) -> Self {
        let Some(address) = self.as_address() else {
            return self;
        };
        if window == 0 {
            return Self::NOT_FOUND;
        }

        // one byte below the lowest candidate, for the padding check
        let low = address.saturating_sub(window as u64);
        let query = (address - low) as usize + FRAME_PROLOGUE.len();
        let Some(range) = host
            .readable_ranges(low, query)
            .into_iter()
            .find(|r| r.start <= address && address < r.end)
        else {
            return Self::NOT_FOUND;
        };
        let Ok(bytes) = host.read_bytes(range.start, (range.end - range.start) as usize) else {
            return Self::NOT_FOUND;
        };

        let cursor = (address - range.start) as usize;
        let lowest = cursor.saturating_sub(window - 1);
        for index in (lowest..=cursor).rev() {
            if index > 0 && bytes[index - 1] == PADDING_BYTE && bytes[index] != PADDING_BYTE {
                return Self::found(range.start + index as u64);
            }
            if bytes[index..].starts_with(&FRAME_PROLOGUE) {
                return Self::found(range.start + index as u64);
            }
        }
        Self::NOT_FOUND
    }

    /// Pointer to a `T` at the cursor, if the cursor is found and the whole
    /// value is currently readable.
    pub fn as_ptr<T, R: ReadMemory + ?Sized>(self, host: &R) -> Option<*const T> {
        let address = self.as_address()?;
        host.is_readable(address, size_of::<T>())
            .then_some(address as usize as *const T)
    }
}

/// `mod = 00, r/m = 101`: a bare `[disp32]` operand
fn is_absolute_modrm(modrm: u8) -> bool {
    modrm & 0xC7 == 0x05
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.found {
            write!(f, "{:#x}", self.address)
        } else {
            f.write_str("<not found>")
        }
    }
}
