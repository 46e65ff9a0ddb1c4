// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-job file descriptor tables.
//!
//! Descriptors 0-2 are the console and never appear here; real
//! descriptors start at `FD_BASE`. A job's table is created on its first
//! open and reaped when its job handle is destroyed.

use std::sync::Arc;

use abi::{JobId, VfsError};

use super::object::{self, File};
use crate::config::MAX_FDS_PER_JOB;
use crate::port::Spinlock;

/// First descriptor number handed out by the table.
pub const FD_BASE: i32 = 3;

struct FdTable {
    job: JobId,
    slots: Vec<Option<Arc<File>>>,
}

static TABLES: Spinlock<Vec<FdTable>> = Spinlock::new(Vec::new());

fn slot_of(fd: i32) -> Option<usize> {
    if fd < FD_BASE {
        return None;
    }
    let slot = (fd - FD_BASE) as usize;
    (slot < MAX_FDS_PER_JOB).then_some(slot)
}

fn with_table<R>(
    job: JobId,
    create: bool,
    f: impl FnOnce(&mut FdTable) -> R,
) -> Option<R> {
    let mut tables = TABLES.lock();
    if let Some(table) = tables.iter_mut().find(|t| t.job == job) {
        return Some(f(table));
    }
    if !create {
        return None;
    }
    tables.push(FdTable {
        job,
        slots: (0..MAX_FDS_PER_JOB).map(|_| None).collect(),
    });
    let table = tables.last_mut();
    table.map(f)
}

/// Installs `file` in the lowest free slot, taking ownership of the
/// caller's reference.
pub fn install(job: JobId, file: Arc<File>) -> Result<i32, VfsError> {
    with_table(job, true, |table| {
        for (i, slot) in table.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file.clone());
                return Ok(FD_BASE + i as i32);
            }
        }
        Err(VfsError::TooManyEntries)
    })
    .unwrap_or(Err(VfsError::NoMemory))
}

/// Looks up a descriptor, returning the file with one extra reference
/// the caller must release.
pub fn lookup(job: JobId, fd: i32) -> Option<Arc<File>> {
    let slot = slot_of(fd)?;
    with_table(job, false, |table| {
        table.slots[slot].as_ref().map(|f| {
            object::file_acquire(f);
            f.clone()
        })
    })
    .flatten()
}

/// Removes a descriptor, returning the table's file reference.
pub fn remove(job: JobId, fd: i32) -> Option<Arc<File>> {
    let slot = slot_of(fd)?;
    with_table(job, false, |table| table.slots[slot].take()).flatten()
}

/// Duplicates a descriptor into the lowest free slot.
pub fn dup(job: JobId, oldfd: i32) -> Result<i32, VfsError> {
    let slot = slot_of(oldfd).ok_or(VfsError::Destroyed)?;
    with_table(job, false, |table| {
        let file =
            table.slots[slot].clone().ok_or(VfsError::Destroyed)?;
        for (i, s) in table.slots.iter_mut().enumerate() {
            if s.is_none() {
                object::file_acquire(&file);
                *s = Some(file);
                return Ok(FD_BASE + i as i32);
            }
        }
        Err(VfsError::TooManyEntries)
    })
    .unwrap_or(Err(VfsError::Destroyed))
}

/// Duplicates `oldfd` onto `newfd`, closing whatever `newfd` held.
pub fn dup2(job: JobId, oldfd: i32, newfd: i32) -> Result<(), VfsError> {
    let old_slot = slot_of(oldfd).ok_or(VfsError::Destroyed)?;
    let new_slot = slot_of(newfd).ok_or(VfsError::InvalidParam)?;
    let displaced = with_table(job, false, |table| {
        let file =
            table.slots[old_slot].clone().ok_or(VfsError::Destroyed)?;
        if old_slot == new_slot {
            return Ok(None);
        }
        object::file_acquire(&file);
        Ok(table.slots[new_slot].replace(file))
    })
    .unwrap_or(Err(VfsError::Destroyed))?;

    if let Some(old) = displaced {
        object::file_release(&old);
    }
    Ok(())
}

/// Drops a job's whole table, releasing every file it still holds. Fired
/// from the job-destroy listener.
pub fn drop_job_table(job: JobId) {
    let table = {
        let mut tables = TABLES.lock();
        let idx = tables.iter().position(|t| t.job == job);
        idx.map(|i| tables.swap_remove(i))
    };
    let Some(table) = table else {
        return;
    };
    for slot in table.slots.into_iter().flatten() {
        object::file_mark_closed(&slot);
        object::file_release(&slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::object::{file_create, node_create};
    use crate::vfs::FilesystemOps;
    use abi::{NodeType, OpenFlags, PollEvents, VfsDirent, VfsStat};

    struct StubFs;

    impl FilesystemOps for StubFs {
        fn lookup(
            &self,
            _: &str,
        ) -> Result<Arc<crate::vfs::Node>, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn open(
            &self,
            _: &str,
            _: OpenFlags,
        ) -> Result<Arc<crate::vfs::Node>, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn getattr(
            &self,
            _: &crate::vfs::Node,
        ) -> Result<VfsStat, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn read(
            &self,
            _: &File,
            _: u64,
            _: &mut [u8],
        ) -> Result<usize, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn write(
            &self,
            _: &File,
            _: u64,
            _: &[u8],
        ) -> Result<usize, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn readdir(
            &self,
            _: &File,
            _: usize,
            _: &mut [VfsDirent],
        ) -> Result<usize, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn unlink(&self, _: &str) -> Result<(), VfsError> {
            Err(VfsError::NotSupported)
        }
        fn mkdir(&self, _: &str, _: u32) -> Result<(), VfsError> {
            Err(VfsError::NotSupported)
        }
        fn poll(
            &self,
            _: &File,
            e: PollEvents,
        ) -> Result<PollEvents, VfsError> {
            Ok(e)
        }
    }

    fn fresh_file() -> Arc<File> {
        let node = node_create(Arc::new(StubFs), NodeType::File);
        let file = file_create(&node);
        object::node_release(&node);
        file
    }

    #[test]
    fn install_assigns_from_fd_base_upward() {
        let job = JobId(9101);
        let fd1 = install(job, fresh_file()).unwrap();
        let fd2 = install(job, fresh_file()).unwrap();
        assert_eq!(fd1, FD_BASE);
        assert_eq!(fd2, FD_BASE + 1);
        drop_job_table(job);
    }

    #[test]
    fn lookup_acquires_a_reference() {
        let job = JobId(9102);
        let fd = install(job, fresh_file()).unwrap();
        let f = lookup(job, fd).unwrap();
        assert_eq!(f.refcount(), 2);
        object::file_release(&f);
        assert!(lookup(job, fd - 1).is_none());
        assert!(lookup(JobId(4242), fd).is_none());
        drop_job_table(job);
    }

    #[test]
    fn dup_and_dup2_share_the_file() {
        let job = JobId(9103);
        let fd = install(job, fresh_file()).unwrap();
        let d = dup(job, fd).unwrap();
        assert_ne!(d, fd);
        let a = lookup(job, fd).unwrap();
        let b = lookup(job, d).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        object::file_release(&a);
        object::file_release(&b);

        dup2(job, fd, d).unwrap();
        dup2(job, fd, fd).unwrap();
        assert!(dup2(job, 99, fd).is_err());
        drop_job_table(job);
    }

    #[test]
    fn table_overflows_with_too_many_entries() {
        let job = JobId(9104);
        let mut last = Ok(0);
        for _ in 0..=MAX_FDS_PER_JOB {
            last = install(job, fresh_file());
        }
        assert_eq!(last, Err(VfsError::TooManyEntries));
        drop_job_table(job);
    }

    #[test]
    fn drop_job_table_destroys_remaining_files() {
        let job = JobId(9105);
        let fd = install(job, fresh_file()).unwrap();
        let f = lookup(job, fd).unwrap();
        object::file_release(&f);
        drop_job_table(job);
        assert!(f.is_destroyed());
    }
}
