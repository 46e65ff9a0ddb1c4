// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the in-crate test suites.
//!
//! The VFS root mount is process-global, so every test that touches the
//! file surface goes through [`boot`] and uses paths it owns. Tests that
//! only exercise a subsystem's own objects construct them directly.

use std::sync::{Arc, OnceLock};

use crate::startup::{self, BootOptions};
use crate::vfs::ramfs::RamFs;

/// Boots the kernel once per test process with a shared ramfs root and
/// no autostart.
pub fn boot() -> &'static Arc<RamFs> {
    static FS: OnceLock<Arc<RamFs>> = OnceLock::new();
    FS.get_or_init(|| {
        let fs = RamFs::new();
        startup::kernel_init(BootOptions {
            mount_root: Some(fs.clone()),
            autostart: false,
        });
        fs
    })
}

/// Serializes tests that touch the process-global console buffers.
pub fn console_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
