//! Common patch shapes.

use super::context::PatchContext;
use super::element::{abs, bytes, db, nop, rip};
use super::symbol::SymbolId;
use crate::error::{Error, Result};
use crate::memory::ProcessMemory;

/// `jmp rel32`
const JMP_REL32: u8 = 0xE9;
const JMP_REL32_LEN: usize = 5;
/// `jmp qword [rip+0]`, followed by the 8-byte destination
const JMP_INDIRECT_RIP: [u8; 6] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];

impl<M: ProcessMemory + ?Sized> PatchContext<'_, M> {
    /// Fill `count` bytes at `at` with the pad byte.
    pub fn preset_nop(&mut self, at: u64, count: usize) -> Result<SymbolId> {
        let site = self.define(&format!("nop_{:x}", at), at);
        self.set(site, &[nop(count)])?;
        Ok(site)
    }

    /// Jump from `at` to `target`, taking over `stolen` bytes of the original
    /// instructions. The bytes after the jump are padded.
    ///
    /// Returns the address execution should resume at, `at + stolen`.
    pub fn preset_inject_jump(&mut self, at: u64, target: u64, stolen: usize) -> Result<u64> {
        if stolen < JMP_REL32_LEN {
            return Err(Error::StolenBytesTooShort(stolen));
        }
        let site = self.define(&format!("inject_{:x}", at), at);
        let destination = self.define(&format!("inject_{:x}_target", at), target);
        self.set(
            site,
            &[db(JMP_REL32), rip(destination), nop(stolen - JMP_REL32_LEN)],
        )?;
        Ok(at + stolen as u64)
    }

    /// Redirect the function at `at` to `function` with an absolute jump.
    pub fn preset_replace_function(&mut self, at: u64, function: u64) -> Result<SymbolId> {
        let site = self.define(&format!("replace_{:x}", at), at);
        let replacement = self.define(&format!("replace_{:x}_target", at), function);
        self.set(site, &[bytes(&JMP_INDIRECT_RIP), abs(replacement, 8)])?;
        Ok(site)
    }
}
