//! Import address table redirection.
//!
//! Runs once during initialization, before anything in the host caches the
//! original pointers. Absent modules or symbols are skipped without error:
//! a missing import only means this particular redirection does not apply to
//! the binary version we were loaded into.

use std::mem;

use anyhow::Result;
use log::debug;

use crate::image::{ImageView, ImportThunk};

/// One requested substitution, identified by module and symbol name.
/// `replacement` must point at a function of identical signature.
pub struct ImportRedirect<'a> {
    pub module: &'a str,
    pub symbol: &'a str,
    pub replacement: usize,
}

impl ImportRedirect<'_> {
    fn wants(&self, module: &str, symbol: &str) -> bool {
        // module names in the import directory vary in case between binaries
        self.module.eq_ignore_ascii_case(module) && self.symbol == symbol
    }
}

/// Walks the import descriptor chain of `view` and overwrites the IAT slot of
/// every matched (module, symbol) pair. Only name-based imports participate;
/// ordinal imports cannot be matched and are skipped. Returns the number of
/// slots patched.
///
/// # Safety
/// `view` must cover a loaded image whose IAT this process may rewrite, and
/// no other thread may be resolving imports concurrently.
pub unsafe fn redirect_imports(view: &ImageView, redirects: &[ImportRedirect]) -> Result<usize> {
    #[cfg(windows)]
    let _guard = {
        let (start, len) = match view.section(".idata")? {
            Some(s) => (
                view.base() + s.virtual_address as usize,
                s.virtual_size as usize,
            ),
            None => (view.base(), view.len()),
        };
        crate::protect::unprotect_range(start, len)?
    };

    let thunk_size = mem::size_of::<u64>() as u32;
    let mut patched = 0;
    for desc in view.import_descriptors()? {
        let module = view.cstr(desc.name)?;
        if !redirects.iter().any(|r| r.module.eq_ignore_ascii_case(module)) {
            continue;
        }

        // name thunks describe the symbols; the IAT at first_thunk holds the
        // resolved pointers at the same indices
        let names_rva = if desc.original_first_thunk != 0 {
            desc.original_first_thunk
        } else {
            desc.first_thunk
        };

        for index in 0.. {
            let Some(thunk) = ImportThunk::from_raw(view.read(names_rva + index * thunk_size)?)
            else {
                break;
            };
            let ImportThunk::Name(entry_rva) = thunk else {
                continue;
            };
            let symbol = view.cstr(entry_rva + 2)?; // skip the hint word
            for redirect in redirects.iter().filter(|r| r.wants(module, symbol)) {
                view.write(desc.first_thunk + index * thunk_size, redirect.replacement as u64)?;
                debug!("redirected {}!{} -> {:#x}", module, symbol, redirect.replacement);
                patched += 1;
            }
        }
    }
    Ok(patched)
}
