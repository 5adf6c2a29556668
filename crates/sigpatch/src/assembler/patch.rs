use tracing::{error, warn};

use super::context::PatchContext;
use crate::error::{Error, Result};
use crate::memory::ProcessMemory;

type Hook<'h> = Box<dyn FnMut() + 'h>;

/// A resolved [`PatchContext`] that can be switched on and off.
///
/// Resolution runs once, when the patch is built. Dropping an active patch
/// reverts it, and dropping a patch releases its scratch memory unless the
/// revert failed.
pub struct Patch<'h, M: ProcessMemory + ?Sized> {
    context: PatchContext<'h, M>,
    before_activate: Option<Hook<'h>>,
    before_deactivate: Option<Hook<'h>>,
}

impl<'h, M: ProcessMemory + ?Sized> Patch<'h, M> {
    pub fn new(mut context: PatchContext<'h, M>) -> Self {
        if let Err(e) = context.resolve() {
            warn!("Patch built with unresolved symbols: {}", e);
        }
        Self {
            context,
            before_activate: None,
            before_deactivate: None,
        }
    }

    /// Run `hook` right before the patch is written.
    pub fn on_before_activate(mut self, hook: impl FnMut() + 'h) -> Self {
        self.before_activate = Some(Box::new(hook));
        self
    }

    /// Run `hook` right before the patch is reverted.
    pub fn on_before_deactivate(mut self, hook: impl FnMut() + 'h) -> Self {
        self.before_deactivate = Some(Box::new(hook));
        self
    }

    /// Install the patch. Does nothing when already active.
    ///
    /// Finalized symbols are written even when others are unresolved; the
    /// unresolved ones are then reported as an error.
    pub fn activate(&mut self) -> Result<()> {
        if self.context.is_active() {
            return Ok(());
        }
        if let Some(hook) = self.before_activate.as_mut() {
            hook();
        }

        self.context.write_changes()?;
        match self.context.unresolved() {
            [] => Ok(()),
            unresolved => Err(Error::UnresolvedReferences(unresolved.to_vec())),
        }
    }

    /// Revert the patch. Does nothing when inactive.
    pub fn deactivate(&mut self) -> Result<()> {
        if !self.context.is_active() {
            return Ok(());
        }
        if let Some(hook) = self.before_deactivate.as_mut() {
            hook();
        }
        self.context.unwrite()
    }

    pub fn toggle(&mut self) -> Result<()> {
        self.set_active(!self.is_active())
    }

    pub fn set_active(&mut self, active: bool) -> Result<()> {
        if active {
            self.activate()
        } else {
            self.deactivate()
        }
    }

    pub fn is_active(&self) -> bool {
        self.context.is_active()
    }

    pub fn context(&self) -> &PatchContext<'h, M> {
        &self.context
    }
}

impl<M: ProcessMemory + ?Sized> Drop for Patch<'_, M> {
    fn drop(&mut self) {
        // Installed code may still jump into scratch memory after a failed
        // revert, so it is leaked rather than freed.
        if let Err(e) = self.deactivate() {
            error!("Failed to revert patch on drop, keeping its allocations: {}", e);
            return;
        }
        self.context.release_allocations();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::assembler::element::{db, rip};
    use crate::cursor::Cursor;
    use crate::memory::{BufferMemory, Protection};

    const CODE: u64 = 0x14000_1000;

    fn host() -> BufferMemory {
        let memory = BufferMemory::new();
        memory
            .map(CODE, vec![0x74; 0x40], Protection::READ_EXECUTE)
            .unwrap();
        memory
    }

    fn skip_patch(memory: &BufferMemory) -> Patch<'_, BufferMemory> {
        let mut ctx = PatchContext::new(memory);
        let site = ctx.define("skip", CODE);
        ctx.set(site, &[db(0xEB)]).unwrap();
        Patch::new(ctx)
    }

    #[test]
    fn test_activate_deactivate_toggle() {
        let memory = host();
        let mut patch = skip_patch(&memory);
        assert!(!patch.is_active());

        patch.activate().unwrap();
        assert!(patch.is_active());
        assert_eq!(memory.peek(CODE, 1), vec![0xEB]);

        patch.toggle().unwrap();
        assert!(!patch.is_active());
        assert_eq!(memory.peek(CODE, 1), vec![0x74]);

        patch.set_active(true).unwrap();
        assert_eq!(memory.peek(CODE, 1), vec![0xEB]);
    }

    #[test]
    fn test_hooks_run_on_state_change_only() {
        let memory = host();
        let activations = Cell::new(0);
        let deactivations = Cell::new(0);
        let mut patch = skip_patch(&memory)
            .on_before_activate(|| activations.set(activations.get() + 1))
            .on_before_deactivate(|| deactivations.set(deactivations.get() + 1));

        patch.activate().unwrap();
        patch.activate().unwrap();
        patch.deactivate().unwrap();
        patch.deactivate().unwrap();
        drop(patch);

        assert_eq!(activations.get(), 1);
        assert_eq!(deactivations.get(), 1);
    }

    #[test]
    fn test_drop_reverts_and_releases() {
        let memory = host();
        {
            let mut ctx = PatchContext::new(&memory);
            let site = ctx.define("site", CODE);
            let cave = ctx.alloc("cave", 8, CODE);
            ctx.set(site, &[db(0xE9), rip(cave)]).unwrap();
            ctx.set(cave, &[db(0xC3)]).unwrap();
            let mut patch = Patch::new(ctx);
            patch.activate().unwrap();
            assert_eq!(memory.peek(CODE, 1), vec![0xE9]);
        }
        assert_eq!(memory.peek(CODE, 5), vec![0x74; 5]);
        assert!(memory.allocations().is_empty());
    }

    #[test]
    fn test_partial_activation_reports_unresolved() {
        let memory = host();
        memory.set_fail_allocations(true);
        let mut ctx = PatchContext::new(&memory);
        let jmp = ctx.define("jmp", CODE);
        let cave = ctx.alloc("cave", 8, CODE);
        let other = ctx.define("other", CODE + 0x10);
        ctx.set(jmp, &[db(0xE9), rip(cave)]).unwrap();
        ctx.set(other, &[db(0xEB)]).unwrap();
        let mut patch = Patch::new(ctx);

        let err = patch.activate().unwrap_err();
        assert!(err.is_unresolved());
        assert!(patch.is_active());
        assert_eq!(memory.peek(CODE, 1), vec![0x74]);
        assert_eq!(memory.peek(CODE + 0x10, 1), vec![0xEB]);

        patch.deactivate().unwrap();
        assert_eq!(memory.peek(CODE + 0x10, 1), vec![0x74]);
    }

    #[test]
    fn test_nothing_resolvable_stays_inactive() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define_at("site", Cursor::NOT_FOUND);
        ctx.set(site, &[db(0xEB)]).unwrap();
        let mut patch = Patch::new(ctx);

        assert!(patch.activate().is_err());
        assert!(!patch.is_active());
    }

    #[test]
    fn test_jump_into_unwritable_cave_is_not_installed() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let jmp = ctx.define("jmp", CODE);
        let cave = ctx.alloc("cave", 8, CODE);
        let missing = ctx.define_at("missing", Cursor::NOT_FOUND);
        ctx.set(jmp, &[db(0xE9), rip(cave)]).unwrap();
        ctx.set(cave, &[db(0xE9), rip(missing)]).unwrap();
        let mut patch = Patch::new(ctx);

        let err = patch.activate().unwrap_err();
        assert!(err.is_unresolved());
        assert!(!patch.is_active());
        assert_eq!(memory.peek(CODE, 5), vec![0x74; 5]);
        let cave_address = patch.context().address_of(cave).unwrap();
        assert_eq!(memory.peek(cave_address, 5), vec![0; 5]);
    }

    #[test]
    fn test_failed_revert_keeps_allocations() {
        let memory = host();
        let mut ctx = PatchContext::new(&memory);
        let site = ctx.define("site", CODE);
        let cave = ctx.alloc("cave", 8, CODE);
        ctx.set(site, &[db(0xE9), rip(cave)]).unwrap();
        ctx.set(cave, &[db(0xC3)]).unwrap();
        let mut patch = Patch::new(ctx);
        patch.activate().unwrap();

        memory.set_fail_protection(true);
        drop(patch);

        assert_eq!(memory.peek(CODE, 1), vec![0xE9]);
        assert_eq!(memory.allocations().len(), 1);
    }
}
