//! In-process code patching for x86-64 Windows binaries.
//!
//! The pieces compose in a fixed order during DLL initialization: scan for
//! byte signatures ([`pattern`]), open a write window over the target pages
//! ([`protect`]), allocate reachable scratch memory ([`trampoline`]), then
//! splice control flow ([`hook`]) or rewrite import slots ([`iat`]). All
//! patching is apply-only; nothing is rolled back at shutdown.
//!
//! Signature scanning, branch encoding, and PE parsing have no OS
//! dependencies and work over any in-memory image. Only the pieces that talk
//! to the virtual memory APIs are Windows-only.

pub mod error;
pub mod hook;
pub mod iat;
pub mod image;
pub mod pattern;
#[cfg(windows)]
pub mod protect;
pub mod stub;
#[cfg(windows)]
pub mod trampoline;

pub use error::{close_log, open_log};
pub use hook::{inject_hook, nop, patch, read_offset_value, write_offset_value, PatchMode};
pub use iat::{redirect_imports, ImportRedirect};
pub use image::ImageView;
#[cfg(windows)]
pub use pattern::pattern;
pub use pattern::{Match, Pattern, Region};
#[cfg(windows)]
pub use protect::{unprotect_range, unprotect_section_or_module, ScopedUnprotect};
#[cfg(windows)]
pub use trampoline::{make_trampoline, Trampoline};
