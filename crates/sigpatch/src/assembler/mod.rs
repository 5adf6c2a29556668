//! Symbolic code assembly and installation.
//!
//! A [`PatchContext`] holds named symbols: code at fixed addresses, scratch
//! memory allocated near the target, and labels inside other symbols. Their
//! code is built from [`CodeElement`]s whose references to other symbols are
//! filled in once every address is known. A [`Patch`] installs the result and
//! reverts it.

mod context;
mod element;
mod encoder;
mod install;
mod patch;
mod presets;
mod symbol;

pub use context::PatchContext;
pub use element::{
    CodeElement, DEFAULT_REMAINING_BYTES, abs, bytes, db, dd, dds, dq, dqs, dw, hex, nop,
    put_label, rip, rip_with,
};
pub use encoder::{PendingReference, ReferenceKind};
pub use patch::Patch;
pub use symbol::{Symbol, SymbolId, SymbolKind};
