// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ELF symbol registry.
//!
//! Relocation resolves applet imports against this table: a fixed export
//! set (the libc surface, registered at boot when `EXPORT_LIBC_TO_ELF`
//! is on) plus a dynamic registry for anything drivers or tests want to
//! expose.

use std::sync::Once;

use crate::config::EXPORT_LIBC_TO_ELF;
use crate::libc;
use crate::port::Spinlock;

static STATIC_SYMS: Spinlock<Vec<(&'static str, usize)>> =
    Spinlock::new(Vec::new());
static DYN_SYMS: Spinlock<Vec<(String, usize)>> = Spinlock::new(Vec::new());

/// Installs the kernel libc export set. Idempotent; called from boot and
/// lazily from the first lookup.
pub fn populate_libc_exports() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        if EXPORT_LIBC_TO_ELF {
            *STATIC_SYMS.lock() = libc::exports::table();
        }
    });
}

/// Registers (or overrides) one symbol. Returns the address registered,
/// or zero for an unusable entry.
pub fn register_symbol(name: &str, addr: usize) -> usize {
    if name.is_empty() || addr == 0 {
        return 0;
    }
    let mut syms = DYN_SYMS.lock();
    if let Some(entry) = syms.iter_mut().find(|(n, _)| n == name) {
        entry.1 = addr;
    } else {
        syms.push((name.to_string(), addr));
    }
    addr
}

/// Looks up a symbol by name; zero when absent.
pub fn find_sym(name: &str) -> usize {
    if name.is_empty() {
        return 0;
    }
    populate_libc_exports();
    if let Some((_, addr)) =
        STATIC_SYMS.lock().iter().find(|(n, _)| *n == name)
    {
        return *addr;
    }
    if let Some((_, addr)) =
        DYN_SYMS.lock().iter().find(|(n, _)| n == name)
    {
        return *addr;
    }
    0
}
