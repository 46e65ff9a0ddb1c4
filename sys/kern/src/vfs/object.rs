// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Refcounted VFS objects.
//!
//! Nodes and files carry an explicit reference count on top of their
//! `Arc` storage: the count expresses the VFS lifetime protocol (who owns
//! a reference, when the driver's destroy hook fires), while the `Arc`
//! guarantees memory safety even if a driver miscounts. A release that
//! would take the count below zero is detected and undone instead of
//! corrupting anything.
//!
//! Every file owns one reference to its node, a wait queue for blocking
//! I/O, and two locks: one for offset/closed state, one for the waiters.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use abi::{IpcResult, NodeType, WaitReason};

use super::FilesystemOps;
use crate::ipc::{WaitQueue, Waiter};
use crate::port::Spinlock;
use crate::time::Deadline;

pub struct Node {
    fs: Arc<dyn FilesystemOps>,
    node_type: NodeType,
    /// Driver-owned state attached to this node.
    pub fs_private: Spinlock<Option<Box<dyn Any + Send>>>,
    refcount: AtomicUsize,
    destroyed: AtomicBool,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("node_type", &self.node_type)
            .field("refcount", &self.refcount())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Node {
    pub fn fs(&self) -> &Arc<dyn FilesystemOps> {
        &self.fs
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }
}

static NODE_LIST: Spinlock<Vec<Weak<Node>>> = Spinlock::new(Vec::new());
static NODE_LIVE: AtomicUsize = AtomicUsize::new(0);

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    SelfRelease,
}

ringbuf::ringbuf!(VFS_TRACE, Trace, 16, Trace::None);

/// Creates a node with one reference, linked into the global list used
/// by lifetime diagnostics.
pub fn node_create(
    fs: Arc<dyn FilesystemOps>,
    node_type: NodeType,
) -> Arc<Node> {
    let node = Arc::new(Node {
        fs,
        node_type,
        fs_private: Spinlock::new(None),
        refcount: AtomicUsize::new(1),
        destroyed: AtomicBool::new(false),
    });
    let mut list = NODE_LIST.lock();
    list.retain(|w| w.strong_count() > 0);
    list.push(Arc::downgrade(&node));
    NODE_LIVE.fetch_add(1, Ordering::Relaxed);
    node
}

pub fn node_acquire(node: &Arc<Node>) {
    node.refcount.fetch_add(1, Ordering::Relaxed);
}

/// Drops one node reference. On the last release the node is marked
/// destroyed, unlinked, and handed to the driver's destroy hook.
pub fn node_release(node: &Arc<Node>) {
    let previous = node.refcount.fetch_sub(1, Ordering::AcqRel);
    if previous == 0 {
        // Releasing a dead node: undo rather than underflow.
        ringbuf::ringbuf_entry!(VFS_TRACE, Trace::SelfRelease);
        node.refcount.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if previous == 1 {
        node.destroyed.store(true, Ordering::Relaxed);
        NODE_LIST
            .lock()
            .retain(|w| !w.ptr_eq(&Arc::downgrade(node)));
        NODE_LIVE.fetch_sub(1, Ordering::Relaxed);
        node.fs.clone().node_destroy(node);
    }
}

/// Number of nodes holding at least one reference.
pub fn node_live_count() -> usize {
    NODE_LIVE.load(Ordering::Relaxed)
}

/// Visits every live node; the callback returns `false` to stop.
pub fn node_iterate(mut cb: impl FnMut(&Arc<Node>) -> bool) {
    let snapshot: Vec<Arc<Node>> = {
        let list = NODE_LIST.lock();
        list.iter().filter_map(|w| w.upgrade()).collect()
    };
    for node in &snapshot {
        if !cb(node) {
            break;
        }
    }
}

struct FileState {
    offset: u64,
    closed: bool,
}

pub struct File {
    node: Arc<Node>,
    state: Spinlock<FileState>,
    refcount: AtomicUsize,
    destroyed: AtomicBool,
    waiters: Spinlock<WaitQueue>,
    /// Driver-owned state attached to this open file.
    pub fs_private: Spinlock<Option<Box<dyn Any + Send>>>,
}

impl File {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Opens a file object over `node`, taking one node reference.
pub fn file_create(node: &Arc<Node>) -> Arc<File> {
    node_acquire(node);
    Arc::new(File {
        node: node.clone(),
        state: Spinlock::new(FileState {
            offset: 0,
            closed: false,
        }),
        refcount: AtomicUsize::new(1),
        destroyed: AtomicBool::new(false),
        waiters: Spinlock::new(WaitQueue::new()),
        fs_private: Spinlock::new(None),
    })
}

pub fn file_acquire(file: &Arc<File>) {
    file.refcount.fetch_add(1, Ordering::Relaxed);
}

/// Drops one file reference. The last release marks the file destroyed,
/// fails any remaining waiters, runs the driver hook, and gives back the
/// node reference the file held.
pub fn file_release(file: &Arc<File>) {
    let previous = file.refcount.fetch_sub(1, Ordering::AcqRel);
    if previous == 0 {
        ringbuf::ringbuf_entry!(VFS_TRACE, Trace::SelfRelease);
        file.refcount.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if previous == 1 {
        file.destroyed.store(true, Ordering::Relaxed);
        file_wake(file, IpcResult::ObjectDestroyed);
        file.node.fs.clone().file_destroy(file);
        node_release(&file.node);
    }
}

pub fn file_mark_closed(file: &Arc<File>) {
    file.state.lock().closed = true;
}

pub fn file_offset(file: &Arc<File>) -> u64 {
    file.state.lock().offset
}

pub fn file_set_offset(file: &Arc<File>, offset: u64) {
    file.state.lock().offset = offset;
}

/// Parks the caller on the file until an event, the deadline, or the
/// file going away.
pub fn file_wait(
    file: &Arc<File>,
    reason: WaitReason,
    deadline: Option<&Deadline>,
) -> IpcResult {
    let waiter = Arc::new(Waiter::new());
    waiter.prepare(reason);

    {
        let mut q = file.waiters.lock();
        if file.is_destroyed() || file.is_closed() {
            return IpcResult::ObjectDestroyed;
        }
        q.enqueue(waiter.clone());
    }

    let result = waiter.block(deadline);

    let mut q = file.waiters.lock();
    q.remove(&waiter);
    result
}

/// Wakes every waiter on the file with `result`.
pub fn file_wake(file: &Arc<File>, result: IpcResult) {
    file.waiters.lock().wake_all(result);
}

/// Signals an I/O event: wakes all waiters successfully.
pub fn file_notify_event(file: &Arc<File>) {
    file_wake(file, IpcResult::Ok);
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{OpenFlags, PollEvents, VfsDirent, VfsError, VfsStat};
    use std::time::Duration;

    struct NullFs {
        node_drops: AtomicUsize,
        file_drops: AtomicUsize,
    }

    impl NullFs {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                node_drops: AtomicUsize::new(0),
                file_drops: AtomicUsize::new(0),
            })
        }
    }

    impl FilesystemOps for NullFs {
        fn lookup(&self, _: &str) -> Result<Arc<Node>, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn open(
            &self,
            _: &str,
            _: OpenFlags,
        ) -> Result<Arc<Node>, VfsError> {
            Err(VfsError::NotSupported)
        }
        fn getattr(&self, _: &Node) -> Result<VfsStat, VfsError> {
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
            events: PollEvents,
        ) -> Result<PollEvents, VfsError> {
            Ok(events)
        }
        fn node_destroy(&self, _: &Node) {
            self.node_drops.fetch_add(1, Ordering::SeqCst);
        }
        fn file_destroy(&self, _: &File) {
            self.file_drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn node_release_destroys_on_zero_and_guards_underflow() {
        let fs = NullFs::new();
        let node = node_create(fs.clone(), NodeType::File);
        node_acquire(&node);
        node_release(&node);
        assert!(!node.is_destroyed());
        node_release(&node);
        assert!(node.is_destroyed());
        assert_eq!(fs.node_drops.load(Ordering::SeqCst), 1);
        // A further release is absorbed by the underflow guard.
        node_release(&node);
        assert_eq!(fs.node_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn file_release_drops_exactly_one_node_ref() {
        let fs = NullFs::new();
        let node = node_create(fs.clone(), NodeType::File);
        let file = file_create(&node);
        assert_eq!(node.refcount(), 2);
        file_release(&file);
        assert!(file.is_destroyed());
        assert_eq!(fs.file_drops.load(Ordering::SeqCst), 1);
        assert_eq!(node.refcount(), 1);
        assert!(!node.is_destroyed());
        node_release(&node);
        assert!(node.is_destroyed());
    }

    #[test]
    fn live_count_and_iterate_track_nodes() {
        let fs = NullFs::new();
        let before = node_live_count();
        let node = node_create(fs, NodeType::Directory);
        assert_eq!(node_live_count(), before + 1);
        let mut seen = false;
        node_iterate(|n| {
            if Arc::ptr_eq(n, &node) {
                seen = true;
                return false;
            }
            true
        });
        assert!(seen);
        node_release(&node);
        assert_eq!(node_live_count(), before);
    }

    #[test]
    fn file_wait_rejects_closed_and_destroyed_files() {
        let fs = NullFs::new();
        let node = node_create(fs, NodeType::File);
        let file = file_create(&node);
        file_mark_closed(&file);
        assert_eq!(
            file_wait(&file, WaitReason::Io, None),
            IpcResult::ObjectDestroyed
        );
        file_release(&file);
        node_release(&node);
    }

    #[test]
    fn notify_event_releases_a_parked_waiter() {
        let fs = NullFs::new();
        let node = node_create(fs, NodeType::Device);
        let file = file_create(&node);

        let f2 = file.clone();
        let t = std::thread::spawn(move || {
            let d = Deadline::from_relative(5_000_000);
            file_wait(&f2, WaitReason::Io, Some(&d))
        });
        std::thread::sleep(Duration::from_millis(20));
        file_notify_event(&file);
        assert_eq!(t.join().unwrap(), IpcResult::Ok);

        file_release(&file);
        node_release(&node);
    }

    #[test]
    fn releasing_last_file_ref_fails_waiters() {
        let fs = NullFs::new();
        let node = node_create(fs, NodeType::Device);
        let file = file_create(&node);

        let f2 = file.clone();
        let t = std::thread::spawn(move || {
            file_wait(&f2, WaitReason::Io, None)
        });
        std::thread::sleep(Duration::from_millis(20));
        file_acquire(&file);
        file_release(&file);
        file_release(&file);
        assert_eq!(t.join().unwrap(), IpcResult::ObjectDestroyed);
        node_release(&node);
    }

    #[test]
    fn offsets_update_under_the_state_lock() {
        let fs = NullFs::new();
        let node = node_create(fs, NodeType::File);
        let file = file_create(&node);
        assert_eq!(file_offset(&file), 0);
        file_set_offset(&file, 4096);
        assert_eq!(file_offset(&file), 4096);
        file_release(&file);
        node_release(&node);
    }
}
