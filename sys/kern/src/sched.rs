// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task registry and the wait-context bridge.
//!
//! Every task the kernel creates is wrapped in a registry record carrying
//! diagnostic metadata (name, tag, state, wait reason) and the control
//! handle of the underlying substrate task. Records live until the task
//! terminates or is destroyed; finalization is idempotent so the two paths
//! can race safely.
//!
//! A [`WaitContext`] is the one blocking primitive everything else is
//! built from: a binary semaphore plus an `armed` flag, with the rule that
//! a wake issued before the corresponding block is absorbed (the result
//! sticks and the semaphore holds one token).

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use abi::{Priority, TaskFlags, TaskId, TaskState, WaitReason, WaitResult};
use arrayvec::ArrayString;

use crate::config::{
    TASK_NAME_MAX_LEN, TASK_TAG_MAX_LEN, WORKER_STACK_SIZE,
};
use crate::port::{self, BinarySemaphore, NativeTask, Spinlock, TaskKill};
use crate::time::{self, Deadline};

/// Errors from registry operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedError {
    InvalidParam,
    NoMemory,
    NotFound,
}

/// Options supplied to [`task_create`]. Zero values select defaults where
/// one exists.
#[derive(Clone, Debug, Default)]
pub struct TaskOptions<'a> {
    pub name: &'a str,
    pub tag: &'a str,
    pub stack_bytes: usize,
    pub priority: u32,
    pub flags: TaskFlags,
    pub cpu_affinity: i32,
    pub user_data: u64,
}

/// Diagnostic copy of a task's registry record.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: ArrayString<TASK_NAME_MAX_LEN>,
    pub tag: ArrayString<TASK_TAG_MAX_LEN>,
    pub state: TaskState,
    pub wait_reason: WaitReason,
    pub flags: TaskFlags,
    pub cpu_affinity: i32,
    pub user_data: u64,
    pub priority: Priority,
}

/// Worker lifecycle hooks, fired by the task wrapper around the entry of
/// any task created with `TaskFlags::WORKER`.
#[derive(Copy, Clone)]
pub struct WorkerHooks {
    pub on_start: fn(&TaskInfo),
    pub on_stop: fn(&TaskInfo),
}

struct TaskMeta {
    state: TaskState,
    wait_reason: WaitReason,
    finalized: bool,
}

pub struct TaskRecord {
    id: TaskId,
    name: ArrayString<TASK_NAME_MAX_LEN>,
    tag: ArrayString<TASK_TAG_MAX_LEN>,
    flags: TaskFlags,
    cpu_affinity: i32,
    user_data: u64,
    priority: Priority,
    native: OnceLock<NativeTask>,
    meta: Spinlock<TaskMeta>,
}

impl TaskRecord {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    fn info(&self) -> TaskInfo {
        let meta = self.meta.lock();
        TaskInfo {
            id: self.id,
            name: self.name,
            tag: self.tag,
            state: meta.state,
            wait_reason: meta.wait_reason,
            flags: self.flags,
            cpu_affinity: self.cpu_affinity,
            user_data: self.user_data,
            priority: self.priority,
        }
    }

    fn set_state(&self, state: TaskState) {
        self.meta.lock().state = state;
    }

    fn set_wait(&self, state: TaskState, reason: WaitReason) {
        let mut meta = self.meta.lock();
        meta.state = state;
        meta.wait_reason = reason;
    }
}

struct Registry {
    tasks: Vec<Arc<TaskRecord>>,
    next_id: u32,
}

static REGISTRY: Spinlock<Registry> = Spinlock::new(Registry {
    tasks: Vec::new(),
    next_id: 1,
});

static HOOKS: Spinlock<Option<WorkerHooks>> = Spinlock::new(None);

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<TaskRecord>>> =
        const { RefCell::new(None) };
}

/// One-shot subsystem bring-up. The registry is self-initializing; this
/// exists so boot can narrate the init order explicitly.
pub fn init() {}

/// Returns the registry record of the calling task, if the scheduler owns
/// the calling thread.
pub fn current_task() -> Option<Arc<TaskRecord>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

fn find_by_id(id: TaskId) -> Option<Arc<TaskRecord>> {
    let reg = REGISTRY.lock();
    reg.tasks.iter().find(|t| t.id == id).cloned()
}

/// Unlinks a record from the registry. Idempotent: both natural
/// termination and `task_destroy` call this and only the first has any
/// effect.
fn finalize(rec: &Arc<TaskRecord>) {
    {
        let mut meta = rec.meta.lock();
        if meta.finalized {
            return;
        }
        meta.finalized = true;
    }
    let mut reg = REGISTRY.lock();
    reg.tasks.retain(|t| !Arc::ptr_eq(t, rec));
}

fn notify_worker(rec: &Arc<TaskRecord>, start: bool) {
    if !rec.flags.contains(TaskFlags::WORKER) {
        return;
    }
    let hooks = *HOOKS.lock();
    if let Some(hooks) = hooks {
        let info = rec.info();
        if start {
            (hooks.on_start)(&info);
        } else {
            (hooks.on_stop)(&info);
        }
    }
}

fn task_wrapper(rec: Arc<TaskRecord>, entry: Box<dyn FnOnce() + Send>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = Some(rec.clone()));
    rec.set_state(TaskState::Running);
    notify_worker(&rec, true);

    let outcome = catch_unwind(AssertUnwindSafe(entry));
    if let Err(payload) = outcome {
        // A kill unwind is a normal exit; anything else is a task panic
        // that already printed its own report. Either way the wrapper
        // tail must run so the record is finalized.
        if !payload.is::<TaskKill>() {
            ringbuf::ringbuf_entry!(SCHED_TRACE, Trace::TaskPanicked(rec.id));
        }
    }

    notify_worker(&rec, false);
    rec.set_state(TaskState::Terminated);
    finalize(&rec);
}

/// Creates and starts a task.
pub fn task_create(
    options: &TaskOptions<'_>,
    entry: impl FnOnce() + Send + 'static,
) -> Result<TaskId, SchedError> {
    if options.name.is_empty() || options.name.len() >= TASK_NAME_MAX_LEN {
        return Err(SchedError::InvalidParam);
    }
    if options.tag.len() >= TASK_TAG_MAX_LEN {
        return Err(SchedError::InvalidParam);
    }

    let stack = if options.stack_bytes != 0 {
        options.stack_bytes
    } else {
        WORKER_STACK_SIZE
    };
    let priority = if options.priority != 0 { options.priority } else { 1 };

    let rec = {
        let mut reg = REGISTRY.lock();
        let id = TaskId(reg.next_id);
        reg.next_id = reg.next_id.wrapping_add(1);
        if reg.next_id == TaskId::INVALID.0 {
            reg.next_id = 1;
        }
        let rec = Arc::new(TaskRecord {
            id,
            name: ArrayString::from(options.name)
                .map_err(|_| SchedError::InvalidParam)?,
            tag: ArrayString::from(options.tag)
                .map_err(|_| SchedError::InvalidParam)?,
            flags: options.flags,
            cpu_affinity: options.cpu_affinity,
            user_data: options.user_data,
            priority: Priority(priority),
            native: OnceLock::new(),
            meta: Spinlock::new(TaskMeta {
                state: TaskState::Ready,
                wait_reason: WaitReason::None,
                finalized: false,
            }),
        });
        reg.tasks.push(rec.clone());
        rec
    };

    let rec2 = rec.clone();
    let entry: Box<dyn FnOnce() + Send> = Box::new(entry);
    match port::spawn_task(options.name, stack, priority, move || {
        task_wrapper(rec2, entry)
    }) {
        Ok(native) => {
            let _ = rec.native.set(native);
            ringbuf::ringbuf_entry!(SCHED_TRACE, Trace::TaskCreated(rec.id));
            Ok(rec.id)
        }
        Err(_) => {
            finalize(&rec);
            Err(SchedError::NoMemory)
        }
    }
}

/// Destroys a task: marks it terminated, requests the substrate kill, and
/// finalizes the record. A task blocked in a wait exits at its next
/// suspension point.
pub fn task_destroy(id: TaskId) -> Result<(), SchedError> {
    if !id.is_valid() {
        return Err(SchedError::InvalidParam);
    }
    let rec = find_by_id(id).ok_or(SchedError::NotFound)?;
    rec.set_wait(TaskState::Terminated, WaitReason::None);
    if let Some(native) = rec.native.get() {
        native.kill();
    }
    finalize(&rec);
    ringbuf::ringbuf_entry!(SCHED_TRACE, Trace::TaskDestroyed(id));
    Ok(())
}

pub fn task_suspend(id: TaskId) -> Result<(), SchedError> {
    if !id.is_valid() {
        return Err(SchedError::InvalidParam);
    }
    let rec = find_by_id(id).ok_or(SchedError::NotFound)?;
    rec.set_wait(TaskState::Suspended, WaitReason::None);
    let native = rec.native.get().ok_or(SchedError::NotFound)?;
    native.suspend();
    Ok(())
}

pub fn task_resume(id: TaskId) -> Result<(), SchedError> {
    if !id.is_valid() {
        return Err(SchedError::InvalidParam);
    }
    let rec = find_by_id(id).ok_or(SchedError::NotFound)?;
    rec.set_wait(TaskState::Ready, WaitReason::None);
    let native = rec.native.get().ok_or(SchedError::NotFound)?;
    native.resume();
    Ok(())
}

/// Yields the processor, leaving the task schedulable.
pub fn task_yield() {
    if let Some(rec) = current_task() {
        rec.set_state(TaskState::Ready);
    }
    port::yield_now();
}

pub fn task_metadata_get(id: TaskId) -> Option<TaskInfo> {
    if !id.is_valid() {
        return None;
    }
    find_by_id(id).map(|r| r.info())
}

pub fn task_id_is_valid(id: TaskId) -> bool {
    id.is_valid() && find_by_id(id).is_some()
}

/// Copies up to `buf.len()` task records into `buf`, returning how many
/// were written.
pub fn task_snapshot(buf: &mut [Option<TaskInfo>]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let reg = REGISTRY.lock();
    let mut count = 0;
    for rec in reg.tasks.iter() {
        if count >= buf.len() {
            break;
        }
        buf[count] = Some(rec.info());
        count += 1;
    }
    count
}

/// Installs (or, with `None`, clears) the worker lifecycle hooks.
pub fn register_worker_hooks(hooks: Option<WorkerHooks>) {
    *HOOKS.lock() = hooks;
}

// --- Wait context -----------------------------------------------------------

struct WaitCtxState {
    armed: bool,
    result: WaitResult,
    reason: WaitReason,
    owner: Option<Arc<TaskRecord>>,
}

/// The blocking primitive: a binary semaphore bound to the preparing task.
pub struct WaitContext {
    sem: BinarySemaphore,
    state: Spinlock<WaitCtxState>,
}

impl Default for WaitContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitContext {
    pub fn new() -> Self {
        Self {
            sem: BinarySemaphore::new(),
            state: Spinlock::new(WaitCtxState {
                armed: false,
                result: WaitResult::Ok,
                reason: WaitReason::None,
                owner: None,
            }),
        }
    }

    pub fn prepare(&self) {
        self.prepare_with_reason(WaitReason::Event);
    }

    /// Arms the context for one block: binds it to the calling task,
    /// clears the result, and records the wait reason for diagnostics.
    pub fn prepare_with_reason(&self, reason: WaitReason) {
        let mut st = self.state.lock();
        st.armed = true;
        st.result = WaitResult::Ok;
        st.reason = reason;
        st.owner = current_task();
    }

    /// Priority of the task that prepared this context. Waiters prepared
    /// outside any scheduler task report the default priority.
    pub fn owner_priority(&self) -> Priority {
        self.state
            .lock()
            .owner
            .as_ref()
            .map(|o| o.priority)
            .unwrap_or(Priority(1))
    }

    /// Blocks until woken or until `deadline`. On timeout the result is
    /// `Timeout` -- except for `Delay` waits, where running out the clock
    /// is the success case.
    pub fn block(&self, deadline: Option<&Deadline>) -> WaitResult {
        let (reason, owner) = {
            let st = self.state.lock();
            (st.reason, st.owner.clone())
        };
        if let Some(o) = &owner {
            o.set_wait(TaskState::Waiting, reason);
        }

        let ticks = time::deadline_to_ticks(deadline);
        let taken = self.sem.take(ticks);
        port::suspension_point();

        let result = {
            let mut st = self.state.lock();
            st.armed = false;
            if taken {
                st.result
            } else {
                st.result = if st.reason == WaitReason::Delay {
                    WaitResult::Ok
                } else {
                    WaitResult::Timeout
                };
                st.result
            }
        };

        if let Some(o) = &owner {
            o.set_wait(TaskState::Ready, WaitReason::None);
        }
        result
    }

    /// Delivers `result` to the context. If it is armed, disarms it and
    /// releases the waiter; otherwise only the result is recorded (and
    /// will be observed by a block that has not happened yet).
    pub fn wake(&self, result: WaitResult) {
        let armed = {
            let mut st = self.state.lock();
            st.result = result;
            if !st.armed {
                return;
            }
            st.armed = false;
            true
        };
        if armed {
            self.sem.give();
        }
    }
}

/// Sleeps for `milliseconds`. Returns `Ok` both on natural expiry and on
/// an explicit wake.
pub fn sleep_ms(milliseconds: u64) -> WaitResult {
    let ctx = WaitContext::new();
    ctx.prepare_with_reason(WaitReason::Delay);
    let deadline = Deadline::from_relative(milliseconds.saturating_mul(1000));
    ctx.block(Some(&deadline))
}

/// Sleeps until an absolute kernel time.
pub fn sleep_until(target: crate::time::Timestamp) -> WaitResult {
    let ctx = WaitContext::new();
    ctx.prepare_with_reason(WaitReason::Delay);
    let deadline = Deadline::at(target);
    ctx.block(Some(&deadline))
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    TaskCreated(TaskId),
    TaskDestroyed(TaskId),
    TaskPanicked(TaskId),
}

ringbuf::ringbuf!(SCHED_TRACE, Trace, 32, Trace::None);
