//! Access to the target address space.
//!
//! The engine never touches memory directly: every read, protection change,
//! write and allocation goes through the host traits in [`host`]. Two hosts
//! ship with the crate:
//!
//! - [`BufferMemory`]: a fake address space backed by byte buffers, used by the
//!   tests and by the offline CLI to scan images loaded from disk
//! - `LocalProcess` (Windows only): the process the engine is loaded into

mod buffer;
mod host;
#[cfg(target_os = "windows")]
mod local;
pub mod pe;

pub use buffer::{BufferMemory, Protection};
pub use host::{ModuleLookup, ProcessMemory, ReadMemory, overwrite_code, read_readable};
#[cfg(target_os = "windows")]
pub use local::LocalProcess;
pub use pe::{ModuleImage, SectionHeader};
