//! Writing resolved symbols into the target and undoing it.

use tracing::{debug, error, info, warn};

use super::context::PatchContext;
use super::symbol::SymbolKind;
use crate::error::Result;
use crate::memory::{ProcessMemory, overwrite_code};

impl<M: ProcessMemory + ?Sized> PatchContext<'_, M> {
    /// Write every finalized symbol that carries code.
    ///
    /// Static symbols capture the bytes they replace on their first write and
    /// keep them for every later install. A failed write restores the symbols
    /// already written in this pass and returns the error.
    ///
    /// The context becomes active when anything was written or nothing is left
    /// unresolved. Returns the number of symbols written.
    pub fn write_changes(&mut self) -> Result<usize> {
        let mut written = Vec::new();

        for index in 0..self.symbols.len() {
            let symbol = &self.symbols[index];
            if !symbol.finalized || !symbol.has_code() {
                continue;
            }
            let Some(address) = symbol.address else {
                continue;
            };

            if let Err(e) = self.write_symbol(index, address) {
                error!(
                    "Failed to install '{}' at {:#x}: {}",
                    self.symbols[index].name, address, e
                );
                self.rollback(&written);
                return Err(e);
            }
            debug!(
                "Installed '{}': {} bytes at {:#x}",
                self.symbols[index].name,
                self.symbols[index].buffer.len(),
                address
            );
            written.push(index);
        }

        if !written.is_empty() || self.unresolved.is_empty() {
            self.active = true;
        }
        info!("Installed {} symbol(s)", written.len());
        Ok(written.len())
    }

    fn write_symbol(&mut self, index: usize, address: u64) -> Result<()> {
        let host = self.host;
        let symbol = &mut self.symbols[index];

        match &mut symbol.kind {
            SymbolKind::Static { original, .. } => {
                if original.is_none() {
                    *original = Some(host.read_bytes(address, symbol.buffer.len())?);
                }
                overwrite_code(host, address, &symbol.buffer)
            }
            SymbolKind::Allocated { .. } => {
                host.write_bytes(address, &symbol.buffer)?;
                host.flush_instruction_cache(address, symbol.buffer.len());
                Ok(())
            }
            SymbolKind::Label { .. } => Ok(()),
        }
    }

    fn rollback(&self, written: &[usize]) {
        for &index in written.iter().rev() {
            let symbol = &self.symbols[index];
            if let SymbolKind::Static {
                address: Some(address),
                original: Some(original),
            } = &symbol.kind
                && let Err(e) = overwrite_code(self.host, *address, original)
            {
                warn!("Failed to roll back '{}': {}", symbol.name, e);
            }
        }
    }

    /// Restore the captured bytes of every installed static symbol, in
    /// reverse declaration order. Every symbol is attempted; the first error
    /// is returned.
    pub fn unwrite(&mut self) -> Result<()> {
        let mut first_error = None;

        for symbol in self.symbols.iter().rev() {
            let SymbolKind::Static {
                address: Some(address),
                original: Some(original),
            } = &symbol.kind
            else {
                continue;
            };
            if !symbol.finalized {
                continue;
            }

            match overwrite_code(self.host, *address, original) {
                Ok(()) => debug!("Restored '{}' at {:#x}", symbol.name, address),
                Err(e) => {
                    error!("Failed to restore '{}' at {:#x}: {}", symbol.name, address, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.active = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Free the scratch memory of every allocated symbol.
    pub fn release_allocations(&mut self) {
        let host = self.host;
        for symbol in &mut self.symbols {
            if let SymbolKind::Allocated { allocation, .. } = &mut symbol.kind
                && let Some(address) = allocation.take()
            {
                match host.free(address) {
                    Ok(()) => debug!("Released '{}' at {:#x}", symbol.name, address),
                    Err(e) => warn!("Failed to release '{}' at {:#x}: {}", symbol.name, address, e),
                }
                symbol.address = None;
                symbol.finalized = false;
            }
        }
    }
}
