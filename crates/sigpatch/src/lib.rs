//! Signature scanning and code patching for x86/x64 processes.
//!
//! Locate code by byte pattern, derive addresses from the match with
//! [`Cursor`] operations, then describe replacement code symbolically and
//! install it with a [`Patch`]:
//!
//! ```no_run
//! use sigpatch::assembler::{Patch, PatchContext, db, nop, rip};
//! use sigpatch::{BufferMemory, ScanOptions, Scanner, Signature};
//!
//! # fn main() -> sigpatch::Result<()> {
//! let memory = BufferMemory::new();
//! let module = 0x1_4000_0000;
//! let site = Scanner::new(&memory).scan(
//!     module,
//!     &Signature::parse("74 ?? 48 8B 05")?,
//!     ScanOptions::default().unique(),
//! );
//!
//! let mut ctx = PatchContext::new(&memory);
//! let jump = ctx.define_at("skip_check", site);
//! let cave = ctx.alloc("cave", 64, site.as_address().unwrap_or(0));
//! ctx.set(jump, &[db(0xE9), rip(cave)])?;
//! ctx.set(cave, &[nop(4), db(0xC3)])?;
//!
//! let mut patch = Patch::new(ctx);
//! patch.activate()?;
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod config;
pub mod cursor;
pub mod error;
pub mod memory;
pub mod scanner;
pub mod signature;

pub use assembler::{Patch, PatchContext};
pub use config::EngineConfig;
pub use cursor::Cursor;
pub use error::{Error, Result, Unresolved};
#[cfg(target_os = "windows")]
pub use memory::LocalProcess;
pub use memory::{BufferMemory, ModuleImage, ModuleLookup, ProcessMemory, Protection, ReadMemory};
pub use scanner::{CandidateMatch, ScanOptions, Scanner};
pub use signature::{Signature, SignatureEntry, SignatureSet, Token};
