// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Job contexts.
//!
//! A [`JobCtx`] is the per-job bag of identity, credentials, timing, TLS
//! slots, and the owned region heap. Jobs, futures, and waits share it
//! through `Arc`; when the last reference drops, the TLS destructors fire
//! and the heap is torn down, in that order.
//!
//! Field access is table-driven: every field has a descriptor giving its
//! wire kind (raw or string), serialized size, and access policy. The
//! kernel-side accessors here apply the wire rules only; policy is
//! enforced by the public accessors in the job module.

use std::cell::RefCell;
use std::sync::Arc;

use abi::{
    CtxError, CtxField, CtxFieldKind, CtxFieldPolicy, CtxSchedState, JobId,
};
use arrayvec::ArrayString;

use crate::config::{
    ATTR_KEY_MAX_LEN, ATTR_VALUE_MAX_LEN, CWD_MAX_LEN, TLS_SLOT_COUNT,
    USER_ATTR_MAX,
};
use crate::mem;
use crate::port::Spinlock;
use crate::time::{now_us, Deadline};

/// Destructor attached to a TLS slot value. Receives the raw slot value;
/// it must not touch the context itself, which may already be mid-
/// teardown when destructors run.
pub type TlsDestructor = unsafe fn(*mut u8);

#[derive(Copy, Clone, Default)]
struct TlsSlot {
    value: *mut u8,
    dtor: Option<TlsDestructor>,
}

#[derive(Copy, Clone, Default)]
pub struct UserAttribute {
    pub key: ArrayString<ATTR_KEY_MAX_LEN>,
    pub value: ArrayString<ATTR_VALUE_MAX_LEN>,
}

struct CtxState {
    uid: u32,
    gid: u32,
    euid: u32,
    egid: u32,
    cwd: ArrayString<CWD_MAX_LEN>,
    trace_id: u64,
    submitted_at: u64,
    started_at: u64,
    completed_at: u64,
    deadline: Deadline,
    priority_hint: u32,
    attributes: [UserAttribute; USER_ATTR_MAX],
    cancelled: bool,
    sched_state: CtxSchedState,
    tls: [TlsSlot; TLS_SLOT_COUNT],
}

// Safety: the raw pointers in the TLS slots are opaque values owned by the
// job (typically addresses inside its region heap); the kernel never
// dereferences them except through the destructor the owner supplied.
unsafe impl Send for CtxState {}

pub struct JobCtx {
    job_id: JobId,
    parent_job_id: JobId,
    state: Spinlock<CtxState>,
    pub(crate) heap: mem::CtxHeap,
}

impl JobCtx {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn parent_job_id(&self) -> JobId {
        self.parent_job_id
    }
}

/// Creates a context with the standard defaults: root credentials, cwd at
/// `/`, an infinite deadline, and a trace id derived from the job id and
/// the submission clock.
pub fn create(job_id: JobId, parent_job_id: JobId) -> Arc<JobCtx> {
    let now = now_us();
    let mut cwd = ArrayString::new();
    cwd.push('/');
    Arc::new(JobCtx {
        job_id,
        parent_job_id,
        state: Spinlock::new(CtxState {
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
            cwd,
            trace_id: (job_id.0 << 32) ^ now,
            submitted_at: now,
            started_at: 0,
            completed_at: 0,
            deadline: Deadline::FOREVER,
            priority_hint: 0,
            attributes: Default::default(),
            cancelled: false,
            sched_state: CtxSchedState::Pending,
            tls: Default::default(),
        }),
        heap: mem::CtxHeap::new(),
    })
}

impl Drop for JobCtx {
    fn drop(&mut self) {
        // Last reference is gone: fire TLS destructors, then reclaim the
        // heap wholesale. Destructor order is slot order, as registered.
        let slots = {
            let mut st = self.state.lock();
            std::mem::take(&mut st.tls)
        };
        for slot in slots {
            if !slot.value.is_null() {
                if let Some(dtor) = slot.dtor {
                    // Safety: the destructor was registered with this
                    // exact value and is invoked exactly once.
                    unsafe { dtor(slot.value) };
                }
            }
        }
        mem::teardown_ctx_heap(&self.heap);
    }
}

thread_local! {
    static CURRENT_CTX: RefCell<Option<Arc<JobCtx>>> =
        const { RefCell::new(None) };
}

/// Installs `ctx` as the calling task's current job context.
pub fn set_current(ctx: Option<Arc<JobCtx>>) {
    CURRENT_CTX.with(|c| *c.borrow_mut() = ctx);
}

/// Returns the calling task's current job context.
pub fn current() -> Option<Arc<JobCtx>> {
    CURRENT_CTX.with(|c| c.borrow().clone())
}

/// Returns the current job id, or `INVALID` outside any job.
pub fn current_job_id() -> JobId {
    current().map(|c| c.job_id).unwrap_or(JobId::INVALID)
}

// --- Simple mutators used by the job machinery ------------------------------

pub fn mark_cancelled(ctx: &JobCtx) {
    let mut st = ctx.state.lock();
    st.cancelled = true;
    st.sched_state = CtxSchedState::Canceled;
}

pub fn is_cancelled(ctx: &JobCtx) -> bool {
    ctx.state.lock().cancelled
}

pub fn set_sched_state(ctx: &JobCtx, state: CtxSchedState) {
    ctx.state.lock().sched_state = state;
}

pub fn set_started(ctx: &JobCtx, at_us: u64) {
    ctx.state.lock().started_at = at_us;
}

pub fn set_completed(ctx: &JobCtx, at_us: u64) {
    ctx.state.lock().completed_at = at_us;
}

pub fn cwd(ctx: &JobCtx) -> ArrayString<CWD_MAX_LEN> {
    ctx.state.lock().cwd
}

/// Replaces the working directory. Callers (chdir) are responsible for
/// validating that the path is absolute and normalized.
pub fn set_cwd(ctx: &JobCtx, path: &str) -> Result<(), CtxError> {
    let cwd =
        ArrayString::from(path).map_err(|_| CtxError::BufferTooSmall)?;
    ctx.state.lock().cwd = cwd;
    Ok(())
}

// --- TLS slots --------------------------------------------------------------

/// Stores `value` (and an optional destructor) in a TLS slot, firing the
/// destructor of any value it displaces.
pub fn tls_set(
    ctx: &JobCtx,
    slot: usize,
    value: *mut u8,
    dtor: Option<TlsDestructor>,
) -> Result<(), CtxError> {
    if slot >= TLS_SLOT_COUNT {
        return Err(CtxError::InvalidParam);
    }
    let old = {
        let mut st = ctx.state.lock();
        std::mem::replace(&mut st.tls[slot], TlsSlot { value, dtor })
    };
    if !old.value.is_null() {
        if let Some(dtor) = old.dtor {
            // Safety: displaced value, destructor registered with it.
            unsafe { dtor(old.value) };
        }
    }
    Ok(())
}

pub fn tls_get(ctx: &JobCtx, slot: usize) -> *mut u8 {
    if slot >= TLS_SLOT_COUNT {
        return std::ptr::null_mut();
    }
    ctx.state.lock().tls[slot].value
}

// --- Table-driven field access ----------------------------------------------

/// Descriptor row for one context field.
#[derive(Copy, Clone, Debug)]
pub struct FieldDescriptor {
    pub field: CtxField,
    pub kind: CtxFieldKind,
    pub policy: CtxFieldPolicy,
    /// Serialized size: exact for raw fields, storage capacity (including
    /// the NUL) for strings.
    pub size: usize,
}

/// Size of the serialized deadline: 8 bytes of LE target plus the
/// infinite flag.
const DEADLINE_WIRE_SIZE: usize = 9;

/// Returns the descriptor for `field`, or `None` for out-of-range indexed
/// fields.
pub fn descriptor(field: CtxField) -> Option<FieldDescriptor> {
    use CtxFieldKind::{Raw, String};
    use CtxFieldPolicy::{Private, Protected, Public};

    let row = |kind, policy, size| {
        Some(FieldDescriptor {
            field,
            kind,
            policy,
            size,
        })
    };

    match field {
        CtxField::JobId | CtxField::ParentJobId => row(Raw, Protected, 8),
        CtxField::Uid | CtxField::Gid | CtxField::Euid | CtxField::Egid => {
            row(Raw, Protected, 4)
        }
        CtxField::Cwd => row(String, Public, CWD_MAX_LEN),
        CtxField::TraceId => row(Raw, Protected, 8),
        CtxField::SubmittedAt
        | CtxField::StartedAt
        | CtxField::CompletedAt => row(Raw, Protected, 8),
        CtxField::Deadline => row(Raw, Protected, DEADLINE_WIRE_SIZE),
        CtxField::PriorityHint => row(Raw, Public, 4),
        CtxField::UserAttrKey(i) if i < USER_ATTR_MAX => {
            row(String, Public, ATTR_KEY_MAX_LEN)
        }
        CtxField::UserAttrValue(i) if i < USER_ATTR_MAX => {
            row(String, Public, ATTR_VALUE_MAX_LEN)
        }
        CtxField::InternalCancelled => row(Raw, Private, 1),
        CtxField::InternalSchedState => row(Raw, Private, 1),
        CtxField::InternalRefcount => row(Raw, Private, 8),
        CtxField::TlsSlotValue(i) if i < TLS_SLOT_COUNT => {
            row(Raw, Private, 8)
        }
        CtxField::TlsSlotDestructor(i) if i < TLS_SLOT_COUNT => {
            row(Raw, Private, 8)
        }
        _ => None,
    }
}

/// Access policy for `field`; unknown fields are treated as private.
pub fn field_policy(field: CtxField) -> CtxFieldPolicy {
    descriptor(field)
        .map(|d| d.policy)
        .unwrap_or(CtxFieldPolicy::Private)
}

fn copy_string(src: &str, out: &mut [u8]) -> Result<usize, CtxError> {
    if out.is_empty() {
        return Err(CtxError::BufferTooSmall);
    }
    let n = src.len().min(out.len() - 1);
    out[..n].copy_from_slice(&src.as_bytes()[..n]);
    out[n] = 0;
    Ok(n + 1)
}

fn copy_raw(src: &[u8], out: &mut [u8]) -> Result<usize, CtxError> {
    if out.len() < src.len() {
        return Err(CtxError::BufferTooSmall);
    }
    out[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

/// Kernel-side field read. Raw fields are copied exactly and require a
/// buffer of at least the field size; strings copy as much as fits and
/// are always NUL-terminated. Returns the number of bytes written.
pub fn get_field_kernel(
    ctx: &Arc<JobCtx>,
    field: CtxField,
    out: &mut [u8],
) -> Result<usize, CtxError> {
    descriptor(field).ok_or(CtxError::InvalidField)?;
    let st = ctx.state.lock();

    match field {
        CtxField::JobId => copy_raw(&ctx.job_id.0.to_le_bytes(), out),
        CtxField::ParentJobId => {
            copy_raw(&ctx.parent_job_id.0.to_le_bytes(), out)
        }
        CtxField::Uid => copy_raw(&st.uid.to_le_bytes(), out),
        CtxField::Gid => copy_raw(&st.gid.to_le_bytes(), out),
        CtxField::Euid => copy_raw(&st.euid.to_le_bytes(), out),
        CtxField::Egid => copy_raw(&st.egid.to_le_bytes(), out),
        CtxField::Cwd => copy_string(&st.cwd, out),
        CtxField::TraceId => copy_raw(&st.trace_id.to_le_bytes(), out),
        CtxField::SubmittedAt => {
            copy_raw(&st.submitted_at.to_le_bytes(), out)
        }
        CtxField::StartedAt => copy_raw(&st.started_at.to_le_bytes(), out),
        CtxField::CompletedAt => {
            copy_raw(&st.completed_at.to_le_bytes(), out)
        }
        CtxField::Deadline => {
            let mut wire = [0u8; DEADLINE_WIRE_SIZE];
            let target = u64::from(st.deadline.target);
            wire[..8].copy_from_slice(&target.to_le_bytes());
            wire[8] = st.deadline.infinite as u8;
            copy_raw(&wire, out)
        }
        CtxField::PriorityHint => {
            copy_raw(&st.priority_hint.to_le_bytes(), out)
        }
        CtxField::UserAttrKey(i) => copy_string(&st.attributes[i].key, out),
        CtxField::UserAttrValue(i) => {
            copy_string(&st.attributes[i].value, out)
        }
        CtxField::InternalCancelled => {
            copy_raw(&[st.cancelled as u8], out)
        }
        CtxField::InternalSchedState => {
            copy_raw(&[st.sched_state as u8], out)
        }
        CtxField::InternalRefcount => {
            let count = Arc::strong_count(ctx) as u64;
            copy_raw(&count.to_le_bytes(), out)
        }
        CtxField::TlsSlotValue(i) => {
            copy_raw(&(st.tls[i].value as u64).to_le_bytes(), out)
        }
        CtxField::TlsSlotDestructor(i) => {
            let addr = st.tls[i].dtor.map(|f| f as usize).unwrap_or(0);
            copy_raw(&(addr as u64).to_le_bytes(), out)
        }
    }
}

fn parse_u32(value: &[u8]) -> Result<u32, CtxError> {
    let bytes: [u8; 4] =
        value.try_into().map_err(|_| CtxError::BufferTooSmall)?;
    Ok(u32::from_le_bytes(bytes))
}

fn parse_u64(value: &[u8]) -> Result<u64, CtxError> {
    let bytes: [u8; 8] =
        value.try_into().map_err(|_| CtxError::BufferTooSmall)?;
    Ok(u64::from_le_bytes(bytes))
}

fn parse_string<const CAP: usize>(
    value: &[u8],
    cap: usize,
) -> Result<ArrayString<CAP>, CtxError> {
    if value.len() >= cap {
        return Err(CtxError::BufferTooSmall);
    }
    let s =
        std::str::from_utf8(value).map_err(|_| CtxError::InvalidParam)?;
    ArrayString::from(s).map_err(|_| CtxError::BufferTooSmall)
}

/// Kernel-side field write. Raw fields require the exact serialized size;
/// strings accept any length up to the capacity minus the NUL. Identity
/// and refcount fields are immutable here by construction.
pub fn set_field_kernel(
    ctx: &Arc<JobCtx>,
    field: CtxField,
    value: &[u8],
) -> Result<(), CtxError> {
    let desc = descriptor(field).ok_or(CtxError::InvalidField)?;
    if desc.kind == CtxFieldKind::Raw && value.len() != desc.size {
        return Err(CtxError::BufferTooSmall);
    }

    let mut st = ctx.state.lock();
    match field {
        CtxField::Uid => st.uid = parse_u32(value)?,
        CtxField::Gid => st.gid = parse_u32(value)?,
        CtxField::Euid => st.euid = parse_u32(value)?,
        CtxField::Egid => st.egid = parse_u32(value)?,
        CtxField::Cwd => {
            st.cwd = parse_string::<CWD_MAX_LEN>(value, CWD_MAX_LEN)?
        }
        CtxField::TraceId => st.trace_id = parse_u64(value)?,
        CtxField::SubmittedAt => st.submitted_at = parse_u64(value)?,
        CtxField::StartedAt => st.started_at = parse_u64(value)?,
        CtxField::CompletedAt => st.completed_at = parse_u64(value)?,
        CtxField::Deadline => {
            let target = parse_u64(&value[..8])?;
            st.deadline = Deadline {
                target: target.into(),
                infinite: value[8] != 0,
            };
        }
        CtxField::PriorityHint => st.priority_hint = parse_u32(value)?,
        CtxField::UserAttrKey(i) => {
            st.attributes[i].key =
                parse_string::<ATTR_KEY_MAX_LEN>(value, ATTR_KEY_MAX_LEN)?
        }
        CtxField::UserAttrValue(i) => {
            st.attributes[i].value = parse_string::<ATTR_VALUE_MAX_LEN>(
                value,
                ATTR_VALUE_MAX_LEN,
            )?
        }
        CtxField::InternalCancelled => st.cancelled = value[0] != 0,
        CtxField::InternalSchedState => {
            st.sched_state = match value[0] {
                0 => CtxSchedState::Pending,
                1 => CtxSchedState::Running,
                2 => CtxSchedState::Completed,
                3 => CtxSchedState::Canceled,
                _ => return Err(CtxError::InvalidParam),
            }
        }
        CtxField::JobId
        | CtxField::ParentJobId
        | CtxField::InternalRefcount
        | CtxField::TlsSlotValue(_)
        | CtxField::TlsSlotDestructor(_) => {
            return Err(CtxError::InvalidField)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn create_fills_defaults() {
        let ctx = create(JobId(7), JobId(3));
        assert_eq!(ctx.job_id(), JobId(7));
        assert_eq!(ctx.parent_job_id(), JobId(3));
        assert_eq!(cwd(&ctx).as_str(), "/");
        assert!(!is_cancelled(&ctx));

        let mut buf = [0u8; DEADLINE_WIRE_SIZE];
        get_field_kernel(&ctx, CtxField::Deadline, &mut buf).unwrap();
        assert_eq!(buf[8], 1, "default deadline must be infinite");
    }

    #[test]
    fn current_ctx_round_trip() {
        let ctx = create(JobId(9), JobId::INVALID);
        set_current(Some(ctx.clone()));
        assert!(Arc::ptr_eq(&current().unwrap(), &ctx));
        assert_eq!(current_job_id(), JobId(9));
        set_current(None);
        assert!(current().is_none());
        assert_eq!(current_job_id(), JobId::INVALID);
    }

    #[test]
    fn raw_field_round_trip() {
        let ctx = create(JobId(1), JobId::INVALID);
        set_field_kernel(&ctx, CtxField::Uid, &77u32.to_le_bytes())
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            get_field_kernel(&ctx, CtxField::Uid, &mut buf).unwrap(),
            4
        );
        assert_eq!(u32::from_le_bytes(buf), 77);
    }

    #[test]
    fn raw_field_requires_exact_size() {
        let ctx = create(JobId(1), JobId::INVALID);
        assert_eq!(
            set_field_kernel(&ctx, CtxField::Uid, &[1, 2]),
            Err(CtxError::BufferTooSmall)
        );
        let mut small = [0u8; 2];
        assert_eq!(
            get_field_kernel(&ctx, CtxField::Uid, &mut small),
            Err(CtxError::BufferTooSmall)
        );
    }

    #[test]
    fn string_field_truncates_on_read_and_rejects_overflow_on_write() {
        let ctx = create(JobId(1), JobId::INVALID);
        set_field_kernel(&ctx, CtxField::Cwd, b"/tmp/work").unwrap();

        let mut buf = [0u8; 5];
        let n =
            get_field_kernel(&ctx, CtxField::Cwd, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"/tmp\0");

        let long = vec![b'a'; CWD_MAX_LEN];
        assert_eq!(
            set_field_kernel(&ctx, CtxField::Cwd, &long),
            Err(CtxError::BufferTooSmall)
        );
    }

    #[test]
    fn indexed_fields_are_bounds_checked() {
        assert!(descriptor(CtxField::UserAttrKey(USER_ATTR_MAX)).is_none());
        assert!(descriptor(CtxField::TlsSlotValue(TLS_SLOT_COUNT)).is_none());
        assert_eq!(
            field_policy(CtxField::UserAttrKey(USER_ATTR_MAX)),
            CtxFieldPolicy::Private
        );
    }

    #[test]
    fn policies_match_the_table() {
        assert_eq!(field_policy(CtxField::Cwd), CtxFieldPolicy::Public);
        assert_eq!(field_policy(CtxField::Uid), CtxFieldPolicy::Protected);
        assert_eq!(
            field_policy(CtxField::InternalCancelled),
            CtxFieldPolicy::Private
        );
    }

    static DTOR_FIRED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_dtor(_v: *mut u8) {
        DTOR_FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn tls_destructors_fire_on_final_release() {
        DTOR_FIRED.store(0, Ordering::SeqCst);
        let ctx = create(JobId(2), JobId::INVALID);
        tls_set(&ctx, 0, 0x10 as *mut u8, Some(counting_dtor)).unwrap();
        tls_set(&ctx, 1, 0x20 as *mut u8, Some(counting_dtor)).unwrap();
        // Replacing a slot fires the displaced destructor immediately.
        tls_set(&ctx, 0, 0x30 as *mut u8, Some(counting_dtor)).unwrap();
        assert_eq!(DTOR_FIRED.load(Ordering::SeqCst), 1);
        drop(ctx);
        assert_eq!(DTOR_FIRED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn tls_slot_bounds() {
        let ctx = create(JobId(2), JobId::INVALID);
        assert_eq!(
            tls_set(&ctx, TLS_SLOT_COUNT, std::ptr::null_mut(), None),
            Err(CtxError::InvalidParam)
        );
        assert!(tls_get(&ctx, TLS_SLOT_COUNT).is_null());
    }

    #[test]
    fn refcount_field_tracks_live_references() {
        let ctx = create(JobId(4), JobId::INVALID);
        let clone = ctx.clone();
        let mut buf = [0u8; 8];
        get_field_kernel(&ctx, CtxField::InternalRefcount, &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 2);
        drop(clone);
        get_field_kernel(&ctx, CtxField::InternalRefcount, &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 1);
    }
}
