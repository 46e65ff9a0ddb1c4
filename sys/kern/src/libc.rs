// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Libc compatibility shim.
//!
//! Applets see a POSIX-ish surface; the storage behind it is per-job,
//! parked in the job context's TLS slots:
//!
//! - slot 0: the errno cell (allocated from the job heap on first use)
//! - slot 1: the exit-frame stack the ELF loader unwinds to
//! - slot 2: the atexit record stack
//!
//! File descriptors 0-2 are the console; everything else routes through
//! the VFS under the current job id. Failures return `-1` with the job's
//! errno set, per the classic contract.

use std::panic::panic_any;
use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use abi::{
    JobId, NodeType, OpenFlags, PollEvents, SeekWhence, VfsDirent,
    VfsError, EBADF, EFAULT, EINVAL, ENOMEM, ENOTSUP, ENOTTY, ESPIPE,
};

use crate::ctx::{self, JobCtx};
use crate::mem;
use crate::port;
use crate::sched;
use crate::time::{self, Deadline};
use crate::vfs::{self, PollFd};

pub const ERRNO_TLS_SLOT: usize = 0;
pub const EXIT_TLS_SLOT: usize = 1;
pub const ATEXIT_TLS_SLOT: usize = 2;

// --- errno ------------------------------------------------------------------

static FALLBACK_ERRNO: AtomicI32 = AtomicI32::new(0);

/// Address of the calling job's errno cell; a process-wide fallback when
/// no job context is current (boot, kernel tasks).
pub fn errno_location() -> *mut i32 {
    let Some(jctx) = ctx::current() else {
        return FALLBACK_ERRNO.as_ptr();
    };
    let stored = ctx::tls_get(&jctx, ERRNO_TLS_SLOT);
    if !stored.is_null() {
        return stored as *mut i32;
    }
    let cell =
        mem::job_alloc(Some(&jctx), core::mem::size_of::<i32>()) as *mut i32;
    if cell.is_null() {
        return FALLBACK_ERRNO.as_ptr();
    }
    // Safety: freshly allocated, exclusively ours until published.
    unsafe { cell.write(0) };
    let _ = ctx::tls_set(&jctx, ERRNO_TLS_SLOT, cell as *mut u8, None);
    cell as *mut i32
}

pub fn errno() -> i32 {
    // Safety: errno_location always returns a live cell.
    unsafe { *errno_location() }
}

pub fn set_errno(value: i32) {
    // Safety: as above.
    unsafe { *errno_location() = value };
}

fn fail(err: i32) -> i32 {
    set_errno(err);
    -1
}

fn fail_vfs(err: VfsError) -> i32 {
    fail(err.errno())
}

// --- Exit frames ------------------------------------------------------------

/// A saved exit scope. The ELF loader allocates one per applet run,
/// pushes it here, and catches the matching [`ExitSignal`].
#[repr(C)]
pub struct ExitFrame {
    pub code: i32,
    prev: *mut ExitFrame,
}

/// Unwind payload carrying the applet's exit status to the enclosing
/// exit frame.
pub struct ExitSignal {
    pub code: i32,
}

fn current_exit_frame() -> *mut ExitFrame {
    match ctx::current() {
        Some(jctx) => {
            ctx::tls_get(&jctx, EXIT_TLS_SLOT) as *mut ExitFrame
        }
        None => core::ptr::null_mut(),
    }
}

/// Pushes `frame` onto the current job's exit stack.
///
/// # Safety
///
/// `frame` must point to a live, writable `ExitFrame` that stays valid
/// until the matching [`exit_frame_pop`].
pub unsafe fn exit_frame_push(frame: *mut ExitFrame) {
    let Some(jctx) = ctx::current() else {
        return;
    };
    (*frame).code = 0;
    (*frame).prev = ctx::tls_get(&jctx, EXIT_TLS_SLOT) as *mut ExitFrame;
    let _ = ctx::tls_set(&jctx, EXIT_TLS_SLOT, frame as *mut u8, None);
}

/// Pops `frame` if it is the top of the current job's exit stack.
///
/// # Safety
///
/// `frame` must be a pointer previously passed to [`exit_frame_push`].
pub unsafe fn exit_frame_pop(frame: *mut ExitFrame) {
    let Some(jctx) = ctx::current() else {
        return;
    };
    if ctx::tls_get(&jctx, EXIT_TLS_SLOT) == frame as *mut u8 {
        let _ =
            ctx::tls_set(&jctx, EXIT_TLS_SLOT, (*frame).prev as *mut u8, None);
    }
}

fn exit_with_code(code: i32) -> ! {
    let frame = current_exit_frame();
    if frame.is_null() {
        panic!("libc exit without frame");
    }
    // Safety: the frame was pushed by the ELF loader and is still live.
    unsafe { (*frame).code = code };
    panic_any(ExitSignal { code });
}

/// `exit(3)`: runs the atexit stack, then unwinds to the exit frame.
pub fn exit(status: i32) -> ! {
    run_exit_handlers();
    exit_with_code(status)
}

/// `_exit(2)`: unwinds without running atexit handlers.
pub fn _exit(status: i32) -> ! {
    exit_with_code(status)
}

/// `abort(3)`: exits with the traditional SIGABRT-style status.
pub fn abort() -> ! {
    exit_with_code(134);
}

// --- atexit -----------------------------------------------------------------

const ATEXIT_KIND_VOID: u32 = 0;
const ATEXIT_KIND_CXA: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone)]
struct AtexitRec {
    kind: u32,
    dso: usize,
    func: usize,
    arg: usize,
}

#[repr(C)]
struct AtexitState {
    count: usize,
    capacity: usize,
    // `capacity` AtexitRec records follow in the same allocation.
}

const ATEXIT_HDR: usize = core::mem::size_of::<AtexitState>();

unsafe fn atexit_recs(state: *mut AtexitState) -> *mut AtexitRec {
    (state as *mut u8).add(ATEXIT_HDR) as *mut AtexitRec
}

fn atexit_state() -> *mut AtexitState {
    match ctx::current() {
        Some(jctx) => {
            ctx::tls_get(&jctx, ATEXIT_TLS_SLOT) as *mut AtexitState
        }
        None => core::ptr::null_mut(),
    }
}

/// Grows (or creates) the atexit stack to hold at least `min_capacity`
/// records, reallocating in the job heap.
fn atexit_ensure(min_capacity: usize) -> *mut AtexitState {
    let Some(jctx) = ctx::current() else {
        return core::ptr::null_mut();
    };
    let state = atexit_state();
    // Safety: the state pointer, when non-null, is a live allocation we
    // made earlier in this job's heap.
    unsafe {
        if !state.is_null() && (*state).capacity >= min_capacity {
            return state;
        }
        let mut new_cap =
            if state.is_null() { 0 } else { (*state).capacity };
        if new_cap < 8 {
            new_cap = 8;
        }
        while new_cap < min_capacity {
            new_cap *= 2;
        }
        let bytes =
            ATEXIT_HDR + new_cap * core::mem::size_of::<AtexitRec>();
        let next = mem::job_realloc(Some(&jctx), state as *mut u8, bytes)
            as *mut AtexitState;
        if next.is_null() {
            return core::ptr::null_mut();
        }
        if state.is_null() {
            (*next).count = 0;
        }
        (*next).capacity = new_cap;
        let _ =
            ctx::tls_set(&jctx, ATEXIT_TLS_SLOT, next as *mut u8, None);
        next
    }
}

fn atexit_push(rec: AtexitRec) -> i32 {
    let state = atexit_ensure(1);
    if state.is_null() {
        return fail(ENOMEM);
    }
    // Safety: state is live with capacity >= count + 1 after the second
    // ensure below.
    unsafe {
        let state = if (*state).count >= (*state).capacity {
            let grown = atexit_ensure((*state).capacity + 1);
            if grown.is_null() {
                return fail(ENOMEM);
            }
            grown
        } else {
            state
        };
        let slot = atexit_recs(state).add((*state).count);
        slot.write(rec);
        (*state).count += 1;
    }
    0
}

/// Registers a plain atexit handler.
pub fn atexit(f: extern "C" fn()) -> i32 {
    atexit_push(AtexitRec {
        kind: ATEXIT_KIND_VOID,
        dso: 0,
        func: f as usize,
        arg: 0,
    })
}

/// Registers a `__cxa_atexit` handler bound to a DSO cookie.
pub fn cxa_atexit(
    f: extern "C" fn(*mut u8),
    arg: *mut u8,
    dso: *mut u8,
) -> i32 {
    atexit_push(AtexitRec {
        kind: ATEXIT_KIND_CXA,
        dso: dso as usize,
        func: f as usize,
        arg: arg as usize,
    })
}

unsafe fn invoke_atexit(rec: AtexitRec) {
    if rec.func == 0 {
        return;
    }
    if rec.kind == ATEXIT_KIND_VOID {
        let f: extern "C" fn() = core::mem::transmute(rec.func);
        f();
    } else {
        let f: extern "C" fn(*mut u8) = core::mem::transmute(rec.func);
        f(rec.arg as *mut u8);
    }
}

/// Pops and invokes the whole atexit stack, newest first.
pub fn run_exit_handlers() {
    let state = atexit_state();
    if state.is_null() {
        return;
    }
    // Safety: records below count are initialized; count is decremented
    // before each call so handlers that register more handlers behave.
    unsafe {
        while (*state).count > 0 {
            (*state).count -= 1;
            let rec = atexit_recs(state).add((*state).count).read();
            invoke_atexit(rec);
        }
    }
}

/// `__cxa_finalize`: runs handlers registered against `dso` (newest
/// first), or the whole stack when `dso` is null.
pub fn cxa_finalize(dso: *mut u8) {
    if dso.is_null() {
        run_exit_handlers();
        return;
    }
    let state = atexit_state();
    if state.is_null() {
        return;
    }
    // Safety: as in run_exit_handlers; removal shifts the tail down.
    unsafe {
        let mut i = (*state).count;
        while i > 0 {
            i -= 1;
            let recs = atexit_recs(state);
            let rec = recs.add(i).read();
            if rec.kind == ATEXIT_KIND_CXA && rec.dso == dso as usize {
                let tail = (*state).count - i - 1;
                core::ptr::copy(recs.add(i + 1), recs.add(i), tail);
                (*state).count -= 1;
                invoke_atexit(rec);
            }
        }
    }
}

// --- File descriptors -------------------------------------------------------

fn job_id() -> JobId {
    ctx::current_job_id()
}

pub fn open(path: &str, flags: OpenFlags) -> i32 {
    match vfs::open(job_id(), path, flags) {
        Ok(fd) => fd,
        Err(VfsError::Busy)
            if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) =>
        {
            fail(abi::EEXIST)
        }
        Err(e) => fail_vfs(e),
    }
}

pub fn close(fd: i32) -> i32 {
    if (0..=2).contains(&fd) {
        return 0;
    }
    match vfs::close(job_id(), fd) {
        Ok(()) => 0,
        Err(e) => fail_vfs(e),
    }
}

/// Reads from a descriptor. Descriptor 0 is the console: the first byte
/// blocks until available, further bytes are taken only if already
/// pending, and `\r` is folded to `\n`.
pub fn read(fd: i32, buf: &mut [u8]) -> isize {
    if fd == 0 {
        if buf.is_empty() {
            return 0;
        }
        let mut produced = 0;
        let first = loop {
            if let Some(b) = port::console_try_read_byte() {
                break b;
            }
            port::delay_ms(1);
        };
        buf[produced] = if first == b'\r' { b'\n' } else { first };
        produced += 1;
        while produced < buf.len() {
            let Some(b) = port::console_try_read_byte() else {
                break;
            };
            buf[produced] = if b == b'\r' { b'\n' } else { b };
            produced += 1;
        }
        return produced as isize;
    }
    if fd == 1 || fd == 2 {
        return fail(EBADF) as isize;
    }
    match vfs::read(job_id(), fd, buf) {
        Ok(n) => n as isize,
        Err(e) => fail_vfs(e) as isize,
    }
}

/// Writes to a descriptor; 1 and 2 stream to the console byte-wise.
pub fn write(fd: i32, buf: &[u8]) -> isize {
    if fd == 1 || fd == 2 {
        for &b in buf {
            port::console_write_byte(b);
        }
        return buf.len() as isize;
    }
    if fd == 0 {
        return fail(EBADF) as isize;
    }
    match vfs::write(job_id(), fd, buf) {
        Ok(n) => n as isize,
        Err(e) => fail_vfs(e) as isize,
    }
}

pub fn lseek(fd: i32, offset: i64, whence: SeekWhence) -> i64 {
    if (0..=2).contains(&fd) {
        return fail(ESPIPE) as i64;
    }
    if offset < 0 {
        return fail(EINVAL) as i64;
    }
    let job = job_id();
    let Some(file) = vfs::fd::lookup(job, fd) else {
        return fail(EBADF) as i64;
    };
    let base = match whence {
        SeekWhence::Set => 0,
        SeekWhence::Cur => vfs::object::file_offset(&file),
        SeekWhence::End => match vfs::fstat(job, fd) {
            Ok(st) => st.size,
            Err(_) => {
                vfs::object::file_release(&file);
                return fail(ENOTSUP) as i64;
            }
        },
    };
    let target = base + offset as u64;
    vfs::object::file_set_offset(&file, target);
    vfs::object::file_release(&file);
    target as i64
}

pub fn ioctl(fd: i32, request: u64, arg: usize) -> i32 {
    if (0..=2).contains(&fd) {
        return fail(ENOTTY);
    }
    match vfs::ioctl(job_id(), fd, request, arg) {
        Ok(()) => 0,
        Err(e) => fail_vfs(e),
    }
}

pub fn dup(oldfd: i32) -> i32 {
    if (0..=2).contains(&oldfd) {
        return oldfd;
    }
    match vfs::dup(job_id(), oldfd) {
        Ok(fd) => fd,
        Err(e) => fail_vfs(e),
    }
}

pub fn dup2(oldfd: i32, newfd: i32) -> i32 {
    if newfd < 0 {
        return fail(EINVAL);
    }
    if (0..=2).contains(&oldfd) {
        if newfd == oldfd {
            return newfd;
        }
        return fail(ENOTSUP);
    }
    match vfs::dup2(job_id(), oldfd, newfd) {
        Ok(()) => newfd,
        Err(e) => fail_vfs(e),
    }
}

/// `poll(2)`. Console descriptors answer inline: stdout/stderr are
/// always writable, stdin is readable when a byte is pending. VFS
/// descriptors go through the VFS poll entry point.
pub fn poll(fds: &mut [PollFd], timeout_ms: i32) -> i32 {
    if fds.is_empty() {
        if timeout_ms > 0 {
            sched::sleep_ms(timeout_ms as u64);
        }
        return 0;
    }

    let mut console_ready = 0;
    let mut has_vfs = false;
    for pfd in fds.iter_mut() {
        pfd.revents = PollEvents::empty();
        match pfd.fd {
            1 | 2 => {
                if pfd.events.contains(PollEvents::POLLOUT) {
                    pfd.revents = PollEvents::POLLOUT;
                    console_ready += 1;
                }
            }
            0 => {
                if pfd.events.contains(PollEvents::POLLIN)
                    && port::console_peek_byte().is_some()
                {
                    pfd.revents = PollEvents::POLLIN;
                    console_ready += 1;
                }
            }
            _ => has_vfs = true,
        }
    }

    if !has_vfs {
        return console_ready;
    }

    let deadline = if timeout_ms >= 0 {
        Some(Deadline::from_relative(timeout_ms as u64 * 1000))
    } else {
        None
    };
    let mut vfs_fds: Vec<PollFd> =
        fds.iter().filter(|p| p.fd > 2).copied().collect();
    match vfs::poll(job_id(), &mut vfs_fds, deadline.as_ref()) {
        Ok(_) => {
            let mut ready = console_ready;
            for updated in vfs_fds {
                if let Some(pfd) =
                    fds.iter_mut().find(|p| p.fd == updated.fd)
                {
                    pfd.revents = updated.revents;
                    if !pfd.revents.is_empty() {
                        ready += 1;
                    }
                }
            }
            ready
        }
        Err(e) => fail_vfs(e),
    }
}

pub fn isatty(fd: i32) -> i32 {
    if (0..=2).contains(&fd) {
        return 1;
    }
    set_errno(ENOTTY);
    0
}

pub fn access(path: &str, _mode: u32) -> i32 {
    let mut st = Stat::default();
    stat(path, &mut st)
}

// --- stat and directories ---------------------------------------------------

/// The stat shape the shim reports.
#[derive(Copy, Clone, Debug, Default)]
pub struct Stat {
    pub mode: u32,
    pub size: u64,
    pub mtime_sec: i64,
    pub is_dir: bool,
    pub is_chr: bool,
}

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFCHR: u32 = 0o020000;

fn fill_stat(st: &abi::VfsStat, out: &mut Stat) {
    let kind = match st.node_type {
        NodeType::Directory => S_IFDIR,
        NodeType::File => S_IFREG,
        NodeType::Device => S_IFCHR,
    };
    out.mode = st.mode | kind;
    out.size = st.size;
    out.mtime_sec = (st.mtime / 1_000_000) as i64;
    out.is_dir = st.node_type == NodeType::Directory;
    out.is_chr = st.node_type == NodeType::Device;
}

pub fn stat(path: &str, out: &mut Stat) -> i32 {
    match vfs::stat(job_id(), path) {
        Ok(st) => {
            fill_stat(&st, out);
            0
        }
        Err(e) => fail_vfs(e),
    }
}

pub fn fstat(fd: i32, out: &mut Stat) -> i32 {
    if (0..=2).contains(&fd) {
        return fail(ENOTSUP);
    }
    match vfs::fstat(job_id(), fd) {
        Ok(st) => {
            fill_stat(&st, out);
            0
        }
        Err(e) => fail_vfs(e),
    }
}

pub fn unlink(path: &str) -> i32 {
    match vfs::unlink(job_id(), path) {
        Ok(()) => 0,
        Err(e) => fail_vfs(e),
    }
}

pub fn mkdir(path: &str, mode: u32) -> i32 {
    match vfs::mkdir(job_id(), path, mode) {
        Ok(()) => 0,
        Err(e) => fail_vfs(e),
    }
}

pub fn chdir(path: &str) -> i32 {
    match vfs::chdir(job_id(), path) {
        Ok(()) => 0,
        Err(e) => fail_vfs(e),
    }
}

pub fn getcwd(buf: &mut [u8]) -> i32 {
    if buf.is_empty() {
        return fail(EINVAL);
    }
    match vfs::getcwd(job_id()) {
        Ok(cwd) => {
            if cwd.len() + 1 > buf.len() {
                return fail(EINVAL);
            }
            buf[..cwd.len()].copy_from_slice(cwd.as_bytes());
            buf[cwd.len()] = 0;
            0
        }
        Err(e) => fail_vfs(e),
    }
}

/// Directory iteration state, as handed out by [`opendir`].
pub struct Dir {
    fd: i32,
    eof: bool,
}

pub fn opendir(path: &str) -> Option<Dir> {
    match vfs::open(job_id(), path, OpenFlags::empty()) {
        Ok(fd) => Some(Dir { fd, eof: false }),
        Err(e) => {
            set_errno(e.errno());
            None
        }
    }
}

pub fn readdir(dir: &mut Dir) -> Option<VfsDirent> {
    if dir.eof {
        return None;
    }
    let mut out = [VfsDirent {
        name: arrayvec::ArrayString::new(),
        node_type: NodeType::File,
    }];
    match vfs::readdir(job_id(), dir.fd, &mut out) {
        Ok(0) => {
            dir.eof = true;
            None
        }
        Ok(_) => Some(out[0].clone()),
        Err(e) => {
            set_errno(e.errno());
            None
        }
    }
}

pub fn closedir(dir: Dir) -> i32 {
    match vfs::close(job_id(), dir.fd) {
        Ok(()) => 0,
        Err(e) => fail_vfs(e),
    }
}

pub fn rewinddir(dir: &mut Dir) {
    dir.eof = false;
    if let Some(file) = vfs::fd::lookup(job_id(), dir.fd) {
        vfs::object::file_set_offset(&file, 0);
        vfs::object::file_release(&file);
    }
}

// --- Allocation wrappers ----------------------------------------------------

fn current_ctx() -> Option<Arc<JobCtx>> {
    ctx::current()
}

pub fn malloc(size: usize) -> *mut u8 {
    let ptr = if current_ctx().is_some() {
        mem::job_alloc(None, size)
    } else {
        port::platform_alloc(size)
    };
    if ptr.is_null() && size != 0 {
        set_errno(ENOMEM);
    }
    ptr
}

pub fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let ptr = if current_ctx().is_some() {
        mem::job_calloc(None, nmemb, size)
    } else {
        let Some(total) = nmemb.checked_mul(size) else {
            set_errno(ENOMEM);
            return core::ptr::null_mut();
        };
        let p = port::platform_alloc(total);
        if !p.is_null() {
            // Safety: fresh allocation of `total` bytes.
            unsafe { p.write_bytes(0, total) };
        }
        p
    };
    if ptr.is_null() && nmemb != 0 && size != 0 {
        set_errno(ENOMEM);
    }
    ptr
}

/// `realloc`, with the ownership gate: while a job is current, only
/// pointers inside that job's regions (or null) may pass; anything else
/// is cross-job traffic and cancels the offender.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if let Some(jctx) = current_ctx() {
        if ptr.is_null() || mem::ptr_in_job_regions(&jctx, ptr) {
            let out = mem::job_realloc(Some(&jctx), ptr, size);
            if out.is_null() && size != 0 {
                set_errno(ENOMEM);
            }
            return out;
        }
        let _ = crate::job::cancel_by_id(jctx.job_id());
        set_errno(EFAULT);
        return core::ptr::null_mut();
    }
    // Safety: outside any job the pointer must have come from the
    // platform allocator, per the same contract as free().
    unsafe { port::platform_realloc(ptr, size) }
}

/// `free`, with the same ownership gate as [`realloc`].
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    if let Some(jctx) = current_ctx() {
        if mem::ptr_in_job_regions(&jctx, ptr) {
            mem::job_free(Some(&jctx), ptr);
            return;
        }
        let _ = crate::job::cancel_by_id(jctx.job_id());
        return;
    }
    // Safety: as in realloc.
    unsafe { port::platform_free(ptr) };
}

// --- Identity and time ------------------------------------------------------

pub fn getpid() -> i32 {
    job_id().0 as i32
}

pub fn getppid() -> i32 {
    match ctx::current() {
        Some(c) => c.parent_job_id().0 as i32,
        None => 0,
    }
}

fn cred_field(field: abi::CtxField) -> u32 {
    let Some(jctx) = ctx::current() else {
        return 0;
    };
    let mut buf = [0u8; 4];
    match ctx::get_field_kernel(&jctx, field, &mut buf) {
        Ok(_) => u32::from_le_bytes(buf),
        Err(_) => 0,
    }
}

pub fn getuid() -> u32 {
    cred_field(abi::CtxField::Uid)
}

pub fn getgid() -> u32 {
    cred_field(abi::CtxField::Gid)
}

pub fn geteuid() -> u32 {
    cred_field(abi::CtxField::Euid)
}

pub fn getegid() -> u32 {
    cred_field(abi::CtxField::Egid)
}

/// Seconds/nanoseconds pair for the time queries.
#[derive(Copy, Clone, Debug, Default)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

pub const CLOCK_REALTIME: i32 = 0;
pub const CLOCK_MONOTONIC: i32 = 1;

pub fn clock_gettime(clock_id: i32, tp: &mut TimeSpec) -> i32 {
    if clock_id != CLOCK_MONOTONIC && clock_id != CLOCK_REALTIME {
        return fail(EINVAL);
    }
    let us = time::now_us();
    tp.sec = (us / 1_000_000) as i64;
    tp.nsec = ((us % 1_000_000) * 1000) as i64;
    0
}

pub fn gettimeofday(tv: &mut TimeSpec) -> i32 {
    let us = time::now_us();
    tv.sec = (us / 1_000_000) as i64;
    // tv_usec by convention for this entry point.
    tv.nsec = (us % 1_000_000) as i64;
    0
}

pub fn time() -> i64 {
    (time::now_us() / 1_000_000) as i64
}

pub fn sleep(seconds: u32) -> u32 {
    if seconds == 0 {
        return 0;
    }
    sched::sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(useconds: u64) -> i32 {
    sched::sleep_ms(useconds.div_ceil(1000));
    0
}

pub fn nanosleep(req: &TimeSpec) -> i32 {
    if req.sec < 0 || req.nsec < 0 {
        return fail(EINVAL);
    }
    let ms =
        req.sec as u64 * 1000 + (req.nsec as u64).div_ceil(1_000_000);
    sched::sleep_ms(ms);
    0
}

// --- C-ABI exports for the ELF symbol table ----------------------------------

/// The function addresses registered in the ELF symbol table. Pure
/// string/format routines come straight from the platform C library;
/// everything that touches state goes through the shim.
pub mod exports {
    use super::*;
    use core::ffi::{c_char, c_double, c_int, c_long, CStr};

    extern "C" {
        fn memset(s: *mut u8, c: c_int, n: usize) -> *mut u8;
        fn memcpy(d: *mut u8, s: *const u8, n: usize) -> *mut u8;
        fn memmove(d: *mut u8, s: *const u8, n: usize) -> *mut u8;
        fn strlen(s: *const c_char) -> usize;
        fn strcmp(a: *const c_char, b: *const c_char) -> c_int;
        fn strncmp(a: *const c_char, b: *const c_char, n: usize) -> c_int;
        fn strchr(s: *const c_char, c: c_int) -> *mut c_char;
        fn strrchr(s: *const c_char, c: c_int) -> *mut c_char;
        fn strtol(
            s: *const c_char,
            end: *mut *mut c_char,
            base: c_int,
        ) -> c_long;
        fn strtod(s: *const c_char, end: *mut *mut c_char) -> c_double;
        fn snprintf(
            s: *mut c_char,
            n: usize,
            fmt: *const c_char,
            ...
        ) -> c_int;
        fn printf(fmt: *const c_char, ...) -> c_int;
    }

    unsafe fn str_arg<'a>(p: *const c_char) -> Option<&'a str> {
        if p.is_null() {
            return None;
        }
        CStr::from_ptr(p).to_str().ok()
    }

    pub extern "C" fn export_malloc(size: usize) -> *mut u8 {
        super::malloc(size)
    }

    pub extern "C" fn export_calloc(n: usize, size: usize) -> *mut u8 {
        super::calloc(n, size)
    }

    pub extern "C" fn export_realloc(p: *mut u8, size: usize) -> *mut u8 {
        super::realloc(p, size)
    }

    pub extern "C" fn export_free(p: *mut u8) {
        super::free(p)
    }

    /// Two-argument `open`; the optional mode of `O_CREAT` callers is
    /// accepted and ignored by the filesystems this kernel carries.
    pub unsafe extern "C" fn export_open(
        path: *const c_char,
        flags: c_int,
    ) -> c_int {
        let Some(path) = str_arg(path) else {
            super::set_errno(EINVAL);
            return -1;
        };
        super::open(path, OpenFlags::from_bits_truncate(flags as u32))
    }

    pub unsafe extern "C" fn export_read(
        fd: c_int,
        buf: *mut u8,
        n: usize,
    ) -> isize {
        if buf.is_null() && n != 0 {
            super::set_errno(EFAULT);
            return -1;
        }
        let slice = core::slice::from_raw_parts_mut(buf, n);
        super::read(fd, slice)
    }

    pub unsafe extern "C" fn export_write(
        fd: c_int,
        buf: *const u8,
        n: usize,
    ) -> isize {
        if buf.is_null() && n != 0 {
            super::set_errno(EFAULT);
            return -1;
        }
        let slice = core::slice::from_raw_parts(buf, n);
        super::write(fd, slice)
    }

    pub extern "C" fn export_close(fd: c_int) -> c_int {
        super::close(fd)
    }

    pub extern "C" fn export_lseek(
        fd: c_int,
        offset: i64,
        whence: c_int,
    ) -> i64 {
        let whence = match whence {
            0 => SeekWhence::Set,
            1 => SeekWhence::Cur,
            2 => SeekWhence::End,
            _ => {
                super::set_errno(EINVAL);
                return -1;
            }
        };
        super::lseek(fd, offset, whence)
    }

    pub unsafe extern "C" fn export_stat(
        path: *const c_char,
        out: *mut Stat,
    ) -> c_int {
        let Some(path) = str_arg(path) else {
            super::set_errno(EINVAL);
            return -1;
        };
        if out.is_null() {
            super::set_errno(EINVAL);
            return -1;
        }
        super::stat(path, &mut *out)
    }

    pub unsafe extern "C" fn export_unlink(path: *const c_char) -> c_int {
        let Some(path) = str_arg(path) else {
            super::set_errno(EINVAL);
            return -1;
        };
        super::unlink(path)
    }

    pub extern "C" fn export_errno() -> *mut c_int {
        super::errno_location()
    }

    /// The name-to-address table the ELF loader resolves against.
    pub fn table() -> Vec<(&'static str, usize)> {
        type VariadicFmt =
            unsafe extern "C" fn(*const c_char, ...) -> c_int;
        type VariadicSnprintf = unsafe extern "C" fn(
            *mut c_char,
            usize,
            *const c_char,
            ...
        ) -> c_int;
        vec![
            ("memset", memset as usize),
            ("memcpy", memcpy as usize),
            ("memmove", memmove as usize),
            ("strlen", strlen as usize),
            ("strcmp", strcmp as usize),
            ("strncmp", strncmp as usize),
            ("strchr", strchr as usize),
            ("strrchr", strrchr as usize),
            ("strtol", strtol as usize),
            ("strtod", strtod as usize),
            ("snprintf", snprintf as VariadicSnprintf as usize),
            ("printf", printf as VariadicFmt as usize),
            ("malloc", export_malloc as usize),
            ("calloc", export_calloc as usize),
            ("realloc", export_realloc as usize),
            ("free", export_free as usize),
            ("open", export_open as usize),
            ("read", export_read as usize),
            ("write", export_write as usize),
            ("close", export_close as usize),
            ("lseek", export_lseek as usize),
            ("stat", export_stat as usize),
            ("unlink", export_unlink as usize),
            ("__errno", export_errno as usize),
        ]
    }
}
