// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-job region allocator.
//!
//! Each job context owns a heap built from fixed-size regions obtained
//! from the platform allocator. Inside a region, allocations are carved
//! out of a physically-ordered block list with in-band headers; free
//! blocks additionally sit on a singly-anchored free list and are merged
//! with their physical neighbors when freed. The heap is the arena: block
//! links are raw, non-owning pointers that never outlive it, and teardown
//! releases regions wholesale.
//!
//! Misuse -- double free, cross-job pointers, corrupted headers -- is
//! detected at the block header and cancels the owning job. The same
//! misuse against the system context (kernel-owned allocations) is a
//! kernel bug and panics. Running out of memory cancels a job but merely
//! fails on the system context.

use std::sync::{Arc, OnceLock};

use abi::JobId;

use crate::config::{
    ALLOC_ALIGN, MAX_HEAP_PER_JOB, MAX_REGIONS_PER_JOB, REGION_SIZE,
};
use crate::ctx::{self, JobCtx};
use crate::port::{self, Spinlock};

/// Magic value stamped into every live block header.
pub const BLOCK_MAGIC: u32 = 0x4D41_474D;

#[repr(C)]
struct BlockHdr {
    /// Payload bytes that follow the (rounded) header.
    size: usize,
    /// Physical neighbors within the heap, in address order per region.
    prev: *mut BlockHdr,
    next: *mut BlockHdr,
    /// Free-list links; only meaningful while not allocated.
    free_prev: *mut BlockHdr,
    free_next: *mut BlockHdr,
    /// Identity of the owning heap, for cross-job detection.
    owner: *const RegionHeap,
    region: *mut Region,
    magic: u32,
    allocated: bool,
}

struct Region {
    raw: *mut u8,
    base: *mut u8,
    size: usize,
    next: *mut Region,
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

const HEADER_SIZE: usize =
    round_up(core::mem::size_of::<BlockHdr>(), ALLOC_ALIGN);

const MIN_SPLIT: usize = HEADER_SIZE + ALLOC_ALIGN;

/// Largest single allocation a region can satisfy.
pub const MAX_PAYLOAD: usize = REGION_SIZE - HEADER_SIZE;

static_assertions::const_assert!(REGION_SIZE > HEADER_SIZE + ALLOC_ALIGN);

struct HeapState {
    regions: *mut Region,
    block_head: *mut BlockHdr,
    block_tail: *mut BlockHdr,
    free_list: *mut BlockHdr,
    region_count: usize,
    total_capacity: usize,
    used_bytes: usize,
    peak_bytes: usize,
}

// Safety: the raw pointers all reference memory owned by this heap, and
// every access happens under the heap's lock.
unsafe impl Send for HeapState {}

pub struct RegionHeap {
    state: Spinlock<HeapState>,
}

impl RegionHeap {
    fn new() -> Self {
        Self {
            state: Spinlock::new(HeapState {
                regions: core::ptr::null_mut(),
                block_head: core::ptr::null_mut(),
                block_tail: core::ptr::null_mut(),
                free_list: core::ptr::null_mut(),
                region_count: 0,
                total_capacity: 0,
                used_bytes: 0,
                peak_bytes: 0,
            }),
        }
    }
}

/// The heap slot embedded in a job context. Lazily populated on the first
/// allocation; emptied exactly once at context teardown.
pub struct CtxHeap {
    slot: Spinlock<Option<Box<RegionHeap>>>,
}

impl CtxHeap {
    pub(crate) fn new() -> Self {
        Self {
            slot: Spinlock::new(None),
        }
    }
}

/// Per-job heap statistics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct JobHeapStats {
    pub used_bytes: usize,
    pub peak_bytes: usize,
    pub capacity_bytes: usize,
    pub region_count: usize,
}

/// Kernel-wide allocator statistics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GlobalStats {
    pub total_regions: usize,
    pub total_psram_bytes: usize,
    pub total_allocations: usize,
    pub total_frees: usize,
}

static GLOBAL_STATS: Spinlock<GlobalStats> = Spinlock::new(GlobalStats {
    total_regions: 0,
    total_psram_bytes: 0,
    total_allocations: 0,
    total_frees: 0,
});

static SYSTEM_CTX: OnceLock<Arc<JobCtx>> = OnceLock::new();

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Grow(usize),
    Oom(usize),
    Misuse(&'static str),
}

ringbuf::ringbuf!(MEM_TRACE, Trace, 32, Trace::None);

/// Creates the system context. Idempotent; called from boot and lazily
/// from any allocation that happens first.
pub fn init() {
    let _ = SYSTEM_CTX
        .get_or_init(|| ctx::create(JobId::INVALID, JobId::INVALID));
}

/// The context that owns kernel-side allocations.
pub fn system_ctx() -> Arc<JobCtx> {
    init();
    SYSTEM_CTX
        .get()
        .cloned()
        .unwrap_or_else(|| ctx::create(JobId::INVALID, JobId::INVALID))
}

fn effective_ctx(explicit: Option<&Arc<JobCtx>>) -> Arc<JobCtx> {
    if let Some(c) = explicit {
        return c.clone();
    }
    ctx::current().unwrap_or_else(system_ctx)
}

fn is_system(target: &Arc<JobCtx>) -> bool {
    !target.job_id().is_valid()
}

/// Reports allocator misuse: cancels the owning job, or panics if the
/// damaged heap belongs to the kernel itself.
fn report_misuse(target: &Arc<JobCtx>, message: &'static str) {
    ringbuf::ringbuf_entry!(MEM_TRACE, Trace::Misuse(message));
    if target.job_id().is_valid() {
        let _ = crate::job::cancel_by_id(target.job_id());
    } else {
        panic!("system alloc error: {message}");
    }
}

/// Reports allocation failure: cancels the owning job; on the system
/// context the failure is returned to the caller instead.
fn report_oom(target: &Arc<JobCtx>, size: usize) {
    ringbuf::ringbuf_entry!(MEM_TRACE, Trace::Oom(size));
    if target.job_id().is_valid() {
        let _ = crate::job::cancel_by_id(target.job_id());
    }
}

/// Returns the job's heap, creating it on first use.
fn ensure_heap(target: &JobCtx) -> &RegionHeap {
    let mut slot = target.heap.slot.lock();
    if slot.is_none() {
        *slot = Some(Box::new(RegionHeap::new()));
    }
    let heap: &RegionHeap = match slot.as_deref() {
        Some(h) => h,
        // Unreachable: just populated above.
        None => unreachable!(),
    };
    // Safety: the box is only removed at context teardown, which cannot
    // run while the caller still holds a context reference.
    unsafe { &*(heap as *const RegionHeap) }
}

fn existing_heap(target: &JobCtx) -> Option<&RegionHeap> {
    let slot = target.heap.slot.lock();
    let heap = slot.as_deref()?;
    // Safety: as in ensure_heap.
    Some(unsafe { &*(heap as *const RegionHeap) })
}

// --- Block primitives (all called under the heap lock) ----------------------

unsafe fn block_data(block: *mut BlockHdr) -> *mut u8 {
    (block as *mut u8).add(HEADER_SIZE)
}

unsafe fn data_to_block(data: *mut u8) -> *mut BlockHdr {
    data.sub(HEADER_SIZE) as *mut BlockHdr
}

unsafe fn block_total_bytes(block: *mut BlockHdr) -> usize {
    HEADER_SIZE + (*block).size
}

unsafe fn insert_free_block(st: &mut HeapState, block: *mut BlockHdr) {
    (*block).free_next = st.free_list;
    (*block).free_prev = core::ptr::null_mut();
    if !st.free_list.is_null() {
        (*st.free_list).free_prev = block;
    }
    st.free_list = block;
}

unsafe fn detach_free_block(st: &mut HeapState, block: *mut BlockHdr) {
    if !(*block).free_prev.is_null() {
        (*(*block).free_prev).free_next = (*block).free_next;
    }
    if !(*block).free_next.is_null() {
        (*(*block).free_next).free_prev = (*block).free_prev;
    }
    if st.free_list == block {
        st.free_list = (*block).free_next;
    }
    (*block).free_next = core::ptr::null_mut();
    (*block).free_prev = core::ptr::null_mut();
}

unsafe fn find_fit_block(
    st: &mut HeapState,
    required: usize,
) -> *mut BlockHdr {
    let mut cursor = st.free_list;
    while !cursor.is_null() {
        if (*cursor).size >= required {
            return cursor;
        }
        cursor = (*cursor).free_next;
    }
    core::ptr::null_mut()
}

/// Absorbs `right` (and any alignment gap between the blocks) into
/// `left`, which must be its physical predecessor.
unsafe fn merge_blocks(
    st: &mut HeapState,
    left: *mut BlockHdr,
    right: *mut BlockHdr,
) -> *mut BlockHdr {
    let left_end = block_data(left).add((*left).size);
    let gap = (right as *const u8).offset_from(left_end) as usize;
    (*left).size += gap + block_total_bytes(right);
    (*left).next = (*right).next;
    if !(*right).next.is_null() {
        (*(*right).next).prev = left;
    } else {
        st.block_tail = left;
    }
    left
}

unsafe fn coalesce_free_block(st: &mut HeapState, block: *mut BlockHdr) {
    let mut block = block;
    let prev = (*block).prev;
    if !prev.is_null() && !(*prev).allocated && (*prev).region == (*block).region
    {
        detach_free_block(st, prev);
        block = merge_blocks(st, prev, block);
    }
    let next = (*block).next;
    if !next.is_null() && !(*next).allocated && (*next).region == (*block).region
    {
        detach_free_block(st, next);
        merge_blocks(st, block, next);
    }
    insert_free_block(st, block);
}

/// Splits `block` so that it keeps exactly `required` payload bytes,
/// creating a new free block from the remainder when the remainder is
/// worth keeping.
unsafe fn split_block(
    heap: *const RegionHeap,
    st: &mut HeapState,
    block: *mut BlockHdr,
    required: usize,
) {
    let available = (*block).size;
    if available < required + MIN_SPLIT {
        return;
    }

    let data = block_data(block);
    let split_header =
        round_up(data.add(required) as usize, ALLOC_ALIGN) as *mut u8;
    let block_end = data.add(available);
    if split_header.add(HEADER_SIZE) >= block_end {
        return;
    }
    let second_payload =
        block_end.offset_from(split_header.add(HEADER_SIZE)) as usize;
    if second_payload < ALLOC_ALIGN {
        return;
    }

    (*block).size = required;
    let second = split_header as *mut BlockHdr;
    core::ptr::write_bytes(second as *mut u8, 0, HEADER_SIZE);
    (*second).size = second_payload;
    (*second).owner = heap;
    (*second).region = (*block).region;
    (*second).magic = BLOCK_MAGIC;
    (*second).allocated = false;
    (*second).prev = block;
    (*second).next = (*block).next;
    if !(*block).next.is_null() {
        (*(*block).next).prev = second;
    } else {
        st.block_tail = second;
    }
    (*block).next = second;
    insert_free_block(st, second);
}

/// Adds one region to the heap, carving it into a single free block.
unsafe fn grow(heap: *const RegionHeap, st: &mut HeapState) -> bool {
    if st.region_count >= MAX_REGIONS_PER_JOB {
        return false;
    }
    if st.total_capacity + REGION_SIZE > MAX_HEAP_PER_JOB {
        return false;
    }

    let raw = port::platform_alloc(REGION_SIZE);
    if raw.is_null() {
        return false;
    }
    let aligned = round_up(raw as usize, ALLOC_ALIGN);
    let offset = aligned - raw as usize;
    if offset >= REGION_SIZE || REGION_SIZE - offset <= HEADER_SIZE {
        port::platform_free(raw);
        return false;
    }
    let usable = REGION_SIZE - offset;

    let region = Box::into_raw(Box::new(Region {
        raw,
        base: aligned as *mut u8,
        size: usable,
        next: st.regions,
    }));
    st.regions = region;
    st.region_count += 1;
    st.total_capacity += usable;
    {
        let mut g = GLOBAL_STATS.lock();
        g.total_regions += 1;
        g.total_psram_bytes += usable;
    }
    ringbuf::ringbuf_entry!(MEM_TRACE, Trace::Grow(usable));

    let block = (*region).base as *mut BlockHdr;
    core::ptr::write_bytes(block as *mut u8, 0, HEADER_SIZE);
    (*block).size = usable - HEADER_SIZE;
    (*block).owner = heap;
    (*block).region = region;
    (*block).magic = BLOCK_MAGIC;
    (*block).allocated = false;
    (*block).prev = st.block_tail;
    if !st.block_tail.is_null() {
        (*st.block_tail).next = block;
    } else {
        st.block_head = block;
    }
    st.block_tail = block;
    insert_free_block(st, block);
    true
}

fn heap_alloc(heap: &RegionHeap, size: usize) -> *mut u8 {
    if size == 0 || size > MAX_PAYLOAD {
        return core::ptr::null_mut();
    }
    let required = round_up(size, ALLOC_ALIGN);
    if required > MAX_PAYLOAD {
        return core::ptr::null_mut();
    }

    let heap_ptr: *const RegionHeap = heap;
    let mut st = heap.state.lock();
    // Safety: all block pointers below belong to this heap and the lock
    // is held for the duration.
    unsafe {
        let mut block = find_fit_block(&mut st, required);
        if block.is_null() {
            if !grow(heap_ptr, &mut st) {
                return core::ptr::null_mut();
            }
            block = find_fit_block(&mut st, required);
            if block.is_null() {
                return core::ptr::null_mut();
            }
        }

        detach_free_block(&mut st, block);
        split_block(heap_ptr, &mut st, block, required);
        (*block).allocated = true;
        st.used_bytes += (*block).size;
        if st.used_bytes > st.peak_bytes {
            st.peak_bytes = st.used_bytes;
        }
        GLOBAL_STATS.lock().total_allocations += 1;
        block_data(block)
    }
}

unsafe fn heap_free_block(st: &mut HeapState, block: *mut BlockHdr) {
    (*block).allocated = false;
    st.used_bytes -= (*block).size;
    GLOBAL_STATS.lock().total_frees += 1;
    coalesce_free_block(st, block);
}

unsafe fn ptr_in_regions_locked(st: &HeapState, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let mut region = st.regions;
    while !region.is_null() {
        let start = (*region).base as usize + HEADER_SIZE;
        let end = (*region).base as usize + (*region).size;
        if addr >= start && addr < end {
            return true;
        }
        region = (*region).next;
    }
    false
}

/// Reads the block header behind `ptr`, returning null if the magic does
/// not check out.
unsafe fn block_from_ptr(ptr: *mut u8) -> *mut BlockHdr {
    if ptr.is_null() {
        return core::ptr::null_mut();
    }
    let block = data_to_block(ptr);
    if (*block).magic != BLOCK_MAGIC {
        return core::ptr::null_mut();
    }
    block
}

// --- Public allocation surface ----------------------------------------------

/// Allocates `size` bytes from the job heap of `ctx` (or of the current
/// job, or the system context). Failure cancels the owning job and
/// returns null; on the system context it returns null quietly.
pub fn job_alloc(ctx: Option<&Arc<JobCtx>>, size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let target = effective_ctx(ctx);
    let heap = ensure_heap(&target);
    let result = heap_alloc(heap, size);
    if result.is_null() {
        report_oom(&target, size);
    }
    result
}

/// Like [`job_alloc`], but allocation failure is the caller's problem:
/// nothing is cancelled. Used where a fallback allocator exists.
pub fn job_try_alloc(ctx: Option<&Arc<JobCtx>>, size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let target = effective_ctx(ctx);
    heap_alloc(ensure_heap(&target), size)
}

pub fn job_calloc(
    ctx: Option<&Arc<JobCtx>>,
    nmemb: usize,
    size: usize,
) -> *mut u8 {
    if nmemb == 0 || size == 0 {
        return core::ptr::null_mut();
    }
    if nmemb > usize::MAX / size {
        return core::ptr::null_mut();
    }
    let total = nmemb * size;
    let ptr = job_alloc(ctx, total);
    if !ptr.is_null() {
        // Safety: job_alloc returned a live payload of at least `total`.
        unsafe { core::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

pub fn job_realloc(
    ctx: Option<&Arc<JobCtx>>,
    ptr: *mut u8,
    new_size: usize,
) -> *mut u8 {
    if ptr.is_null() {
        return job_alloc(ctx, new_size);
    }
    if new_size == 0 {
        job_free(ctx, ptr);
        return core::ptr::null_mut();
    }

    let target = effective_ctx(ctx);
    let Some(heap) = existing_heap(&target) else {
        report_misuse(&target, "realloc without heap");
        return core::ptr::null_mut();
    };

    // Safety: header reads are validated by magic before use; the rules
    // here match free().
    let old_size = unsafe {
        let block = block_from_ptr(ptr);
        if block.is_null() || (*block).owner != heap as *const RegionHeap {
            report_misuse(&target, "realloc pointer mismatch");
            return core::ptr::null_mut();
        }
        if !(*block).allocated {
            report_misuse(&target, "realloc after free");
            return core::ptr::null_mut();
        }
        (*block).size
    };

    if new_size <= old_size {
        return ptr;
    }

    let new_ptr = heap_alloc(heap, new_size);
    if new_ptr.is_null() {
        return core::ptr::null_mut();
    }
    // Safety: both pointers are live payloads of at least old_size.
    unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size) };
    job_free(Some(&target), ptr);
    new_ptr
}

pub fn job_free(ctx: Option<&Arc<JobCtx>>, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let target = effective_ctx(ctx);
    let system = is_system(&target);

    let Some(heap) = existing_heap(&target) else {
        if system {
            // Pre-heap kernel allocation: hand it back to the platform.
            // Safety: by contract the pointer came from platform_alloc.
            unsafe { port::platform_free(ptr) };
            return;
        }
        report_misuse(&target, "free without heap");
        return;
    };

    // Safety: the header read is validated by magic; corrupt or foreign
    // pointers take the reporting paths below without being dereferenced
    // further.
    unsafe {
        let block = block_from_ptr(ptr);
        if block.is_null() {
            if system {
                // Never hand an interior region pointer back to the
                // platform allocator; a corrupted header would otherwise
                // corrupt the platform heap too.
                let in_regions = {
                    let st = heap.state.lock();
                    ptr_in_regions_locked(&st, ptr)
                };
                if in_regions {
                    report_misuse(&target, "free header corrupted");
                    return;
                }
                port::platform_free(ptr);
                return;
            }
            report_misuse(&target, "free pointer mismatch");
            return;
        }
        if (*block).owner != heap as *const RegionHeap {
            report_misuse(&target, "free pointer mismatch");
            return;
        }

        let mut st = heap.state.lock();
        if !(*block).allocated {
            drop(st);
            report_misuse(&target, "double free");
            return;
        }
        heap_free_block(&mut st, block);
    }
}

/// Releases every region owned by the context. Called from the context's
/// final-release path.
pub fn teardown_ctx_heap(heap: &CtxHeap) {
    let taken = heap.slot.lock().take();
    let Some(heap) = taken else {
        return;
    };
    let st = heap.state.lock();
    let mut region = st.regions;
    // Safety: teardown is the unique owner of the heap now; the region
    // list nodes and their backing stores are freed exactly once.
    unsafe {
        while !region.is_null() {
            let next = (*region).next;
            if !(*region).raw.is_null() {
                port::platform_free((*region).raw);
            }
            drop(Box::from_raw(region));
            region = next;
        }
    }
    drop(st);
}

/// Copies out the heap statistics of `ctx`. A job that never allocated
/// reports zeros.
pub fn job_stats(target: &JobCtx) -> JobHeapStats {
    let Some(heap) = existing_heap(target) else {
        return JobHeapStats::default();
    };
    let st = heap.state.lock();
    JobHeapStats {
        used_bytes: st.used_bytes,
        peak_bytes: st.peak_bytes,
        capacity_bytes: st.total_capacity,
        region_count: st.region_count,
    }
}

pub fn global_stats() -> GlobalStats {
    *GLOBAL_STATS.lock()
}

/// Walks the physical block list, checking every header invariant:
/// magic intact, heap ownership, allocated-vs-free-list consistency.
/// Returns the number of blocks. Diagnostics and tests only.
pub fn check_heap(target: &JobCtx) -> Option<usize> {
    let heap = existing_heap(target)?;
    let heap_ptr: *const RegionHeap = heap;
    let st = heap.state.lock();
    let mut count = 0;
    let mut block = st.block_head;
    // Safety: traversal under the heap lock; every block reachable from
    // block_head belongs to this heap by construction.
    unsafe {
        while !block.is_null() {
            if (*block).magic != BLOCK_MAGIC {
                return None;
            }
            if (*block).owner != heap_ptr {
                return None;
            }
            count += 1;
            block = (*block).next;
        }
    }
    Some(count)
}

/// Whether `ptr` points into one of the job's regions (its usable range,
/// past the leading block header).
pub fn ptr_in_job_regions(target: &JobCtx, ptr: *const u8) -> bool {
    if ptr.is_null() {
        return false;
    }
    let Some(heap) = existing_heap(target) else {
        return false;
    };
    let st = heap.state.lock();
    // Safety: only reads region descriptors under the heap lock.
    unsafe { ptr_in_regions_locked(&st, ptr) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> Arc<JobCtx> {
        // An unregistered job id: misuse cancels are no-ops instead of
        // panics, letting the tests observe the allocator behavior.
        ctx::create(JobId(0xE000 + rand_suffix()), JobId::INVALID)
    }

    fn rand_suffix() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn zero_and_oversize_allocations_fail() {
        let c = test_ctx();
        assert!(job_alloc(Some(&c), 0).is_null());
        assert!(job_try_alloc(Some(&c), MAX_PAYLOAD + 1).is_null());
    }

    #[test]
    fn alloc_is_aligned_and_in_region() {
        let c = test_ctx();
        let p = job_alloc(Some(&c), 100);
        assert!(!p.is_null());
        assert_eq!(p as usize % ALLOC_ALIGN, 0);
        assert!(ptr_in_job_regions(&c, p));
        let stats = job_stats(&c);
        assert_eq!(stats.region_count, 1);
        assert!(stats.used_bytes >= 100);
        job_free(Some(&c), p);
    }

    #[test]
    fn alloc_free_restores_used_bytes() {
        let c = test_ctx();
        let before = job_stats(&c).used_bytes;
        let p = job_alloc(Some(&c), 256);
        assert!(job_stats(&c).used_bytes > before);
        job_free(Some(&c), p);
        assert_eq!(job_stats(&c).used_bytes, before);
    }

    #[test]
    fn free_null_is_a_noop() {
        let c = test_ctx();
        job_free(Some(&c), core::ptr::null_mut());
    }

    #[test]
    fn double_free_is_detected_not_corrupting() {
        let c = test_ctx();
        let p = job_alloc(Some(&c), 64);
        job_free(Some(&c), p);
        let used = job_stats(&c).used_bytes;
        // Second free takes the misuse path; accounting must not move.
        job_free(Some(&c), p);
        assert_eq!(job_stats(&c).used_bytes, used);
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let c = test_ctx();
        let p = job_calloc(Some(&c), 4, 32);
        assert!(!p.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(p, 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        job_free(Some(&c), p);

        assert!(job_calloc(Some(&c), usize::MAX, 2).is_null());
        assert!(job_calloc(Some(&c), 0, 8).is_null());
    }

    #[test]
    fn realloc_grows_and_preserves_prefix() {
        let c = test_ctx();
        let p = job_alloc(Some(&c), 32);
        unsafe {
            for i in 0..32 {
                p.add(i).write(i as u8);
            }
        }
        let q = job_realloc(Some(&c), p, 4000);
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, 32) };
        for (i, &b) in bytes.iter().enumerate() {
            assert_eq!(b, i as u8);
        }
        job_free(Some(&c), q);
        assert_eq!(job_stats(&c).used_bytes, 0);
    }

    #[test]
    fn realloc_within_block_returns_same_pointer() {
        let c = test_ctx();
        let p = job_alloc(Some(&c), 64);
        let q = job_realloc(Some(&c), p, 16);
        assert_eq!(p, q);
        job_free(Some(&c), q);
    }

    #[test]
    fn realloc_to_zero_frees() {
        let c = test_ctx();
        let p = job_alloc(Some(&c), 64);
        assert!(job_realloc(Some(&c), p, 0).is_null());
        assert_eq!(job_stats(&c).used_bytes, 0);
    }

    #[test]
    fn coalescing_makes_freed_space_reusable() {
        let c = test_ctx();
        // Three adjacent allocations; free them all, then the whole
        // region must be allocatable as one block again.
        let a = job_alloc(Some(&c), 2048);
        let b = job_alloc(Some(&c), 2048);
        let d = job_alloc(Some(&c), 2048);
        let regions_before = job_stats(&c).region_count;
        job_free(Some(&c), b);
        job_free(Some(&c), a);
        job_free(Some(&c), d);
        assert_eq!(job_stats(&c).used_bytes, 0);

        let big = job_alloc(Some(&c), MAX_PAYLOAD);
        assert!(!big.is_null(), "coalesced region should fit MAX_PAYLOAD");
        assert_eq!(job_stats(&c).region_count, regions_before);
        job_free(Some(&c), big);
        // Fully coalesced again: one block per region, all headers sane.
        assert_eq!(check_heap(&c), Some(job_stats(&c).region_count));
    }

    #[test]
    fn heap_grows_by_regions_up_to_the_cap() {
        let c = test_ctx();
        let chunk = MAX_PAYLOAD;
        let mut ptrs = Vec::new();
        for _ in 0..MAX_REGIONS_PER_JOB {
            let p = job_try_alloc(Some(&c), chunk);
            if p.is_null() {
                break;
            }
            ptrs.push(p);
        }
        let stats = job_stats(&c);
        assert!(stats.region_count >= 2);
        assert!(stats.region_count <= MAX_REGIONS_PER_JOB);
        assert!(stats.capacity_bytes <= MAX_HEAP_PER_JOB);
        // One more region than the caps allow must fail.
        assert!(job_try_alloc(Some(&c), chunk).is_null());
        for p in ptrs {
            job_free(Some(&c), p);
        }
    }

    #[test]
    fn cross_job_pointer_is_rejected() {
        let a = test_ctx();
        let b = test_ctx();
        let p = job_alloc(Some(&a), 64);
        let used_a = job_stats(&a).used_bytes;
        // Freeing a's pointer through b is misuse against b; a's heap
        // must be untouched.
        job_free(Some(&b), p);
        assert_eq!(job_stats(&a).used_bytes, used_a);
        job_free(Some(&a), p);
        assert_eq!(job_stats(&a).used_bytes, 0);
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let c = test_ctx();
        let p = job_alloc(Some(&c), 1024);
        let peak = job_stats(&c).peak_bytes;
        job_free(Some(&c), p);
        assert_eq!(job_stats(&c).peak_bytes, peak);
        assert!(peak >= 1024);
    }

    #[test]
    fn global_stats_move_with_traffic() {
        let before = global_stats();
        let c = test_ctx();
        let p = job_alloc(Some(&c), 128);
        job_free(Some(&c), p);
        let after = global_stats();
        assert!(after.total_allocations > before.total_allocations);
        assert!(after.total_frees > before.total_frees);
        assert!(after.total_regions > before.total_regions);
    }

    proptest::proptest! {
        #[test]
        fn accounting_survives_random_traffic(
            ops in proptest::collection::vec(
                (proptest::bool::ANY, 1usize..2000), 1..60,
            )
        ) {
            let c = test_ctx();
            let mut live: Vec<(*mut u8, usize)> = Vec::new();
            for (is_alloc, size) in ops {
                if is_alloc || live.is_empty() {
                    let p = job_try_alloc(Some(&c), size);
                    if !p.is_null() {
                        unsafe { p.write_bytes(0x5A, size) };
                        live.push((p, size));
                    }
                } else {
                    let (p, _) = live.swap_remove(live.len() / 2);
                    job_free(Some(&c), p);
                }
            }
            for (p, _) in live {
                job_free(Some(&c), p);
            }
            proptest::prop_assert_eq!(job_stats(&c).used_bytes, 0);
        }
    }
}
