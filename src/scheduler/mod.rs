//! The priority run-queue / sleep-queue scheduler (§4.7). A TCB is the
//! scheduler's entire view of a schedulable entity; everything else about a
//! process — its address space, file descriptors, signal state, parent/child
//! links — lives in its PCB (`crate::process`), which this module never
//! touches directly. The two layers meet only through `Pid` and the
//! `AddressSpaceSwitch` capability registered at boot (§9: function-pointer
//! interfaces become explicit capability sets, not a hard dependency edge).

pub mod context;
pub mod task;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::process::Pid;
use crate::sync::{IrqSpinLock, OnceInit};
use context::Context;
use task::{ExecState, Tcb, TaskState, PRIORITY_LEVELS, TIME_SLICE_TICKS};

/// PID 0 is the idle task. It is never enqueued (§3) and is returned by
/// `select_next_task` only when every run queue is empty.
pub const IDLE_PID: Pid = 0;

static TASKS: IrqSpinLock<BTreeMap<Pid, Tcb>> = IrqSpinLock::new(BTreeMap::new());
static RUN_QUEUES: [IrqSpinLock<VecDeque<Pid>>; PRIORITY_LEVELS] = [
    IrqSpinLock::new(VecDeque::new()),
    IrqSpinLock::new(VecDeque::new()),
    IrqSpinLock::new(VecDeque::new()),
    IrqSpinLock::new(VecDeque::new()),
];
static SLEEP_QUEUE: IrqSpinLock<VecDeque<Pid>> = IrqSpinLock::new(VecDeque::new());

static CURRENT: AtomicU32 = AtomicU32::new(IDLE_PID);
static TICKS: AtomicU32 = AtomicU32::new(0);
static RESCHEDULE: AtomicBool = AtomicBool::new(false);
static SCHEDULER_READY: AtomicBool = AtomicBool::new(false);

/// Capability the process layer provides so this module can switch address
/// spaces without depending on `crate::process`'s internals (§9).
pub trait AddressSpaceSwitch: Sync {
    fn pd_phys_of(&self, pid: Pid) -> u32;
}

static ADDRESS_SPACE: OnceInit<&'static dyn AddressSpaceSwitch> = OnceInit::new();

pub fn set_address_space_provider(provider: &'static dyn AddressSpaceSwitch) {
    ADDRESS_SPACE.init(provider);
}

fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    let flags = crate::sync::save_irq_and_disable();
    let result = f();
    crate::sync::restore_irq(flags);
    result
}

/// §5: cooperative between syscalls, preemptive within them only once this
/// is true — set by `init` after the idle task is installed.
pub fn scheduler_is_ready() -> bool {
    SCHEDULER_READY.load(Ordering::Acquire)
}

pub fn current_pid() -> Pid {
    CURRENT.load(Ordering::Acquire)
}

pub fn current_tick() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Install the idle task (PID 0) as the running task on top of whatever
/// stack `kernel_main` is already running on.
pub fn init(idle_kernel_stack_top: u32) {
    let tcb = Tcb {
        pid: IDLE_PID,
        state: TaskState::Running,
        base_priority: (PRIORITY_LEVELS - 1) as u8,
        effective_priority: (PRIORITY_LEVELS - 1) as u8,
        ticks_remaining: u32::MAX,
        wakeup_time: 0,
        exit_code: None,
        in_run_queue: false,
        kernel_stack_top: idle_kernel_stack_top,
        exec: ExecState::Suspended(Context::zero()),
        blocking_on: None,
        blocked_by_me: Vec::new(),
    };
    TASKS.lock().insert(IDLE_PID, tcb);
    CURRENT.store(IDLE_PID, Ordering::Release);
    SCHEDULER_READY.store(true, Ordering::Release);
    crate::log_info!("scheduler: idle task running, preemption armed");
}

/// Hand a freshly built TCB to the scheduler and mark it READY.
pub fn register_task(tcb: Tcb) {
    let pid = tcb.pid;
    let priority = tcb.effective_priority;
    TASKS.lock().insert(pid, tcb);
    push_ready(pid, priority);
}

fn push_ready(pid: Pid, priority: u8) {
    {
        let mut tasks = TASKS.lock();
        if let Some(t) = tasks.get_mut(&pid) {
            if t.in_run_queue {
                return;
            }
            t.state = TaskState::Ready;
            t.in_run_queue = true;
        } else {
            return;
        }
    }
    RUN_QUEUES[priority as usize].lock().push_back(pid);
}

fn remove_from_run_queue(pid: Pid, priority: u8) -> bool {
    let mut q = RUN_QUEUES[priority as usize].lock();
    if let Some(pos) = q.iter().position(|&p| p == pid) {
        q.remove(pos);
        true
    } else {
        false
    }
}

fn effective_priority(pid: Pid) -> u8 {
    TASKS.lock().get(&pid).map(|t| t.effective_priority).unwrap_or((PRIORITY_LEVELS - 1) as u8)
}

/// Scan priorities 0..N-1, returning the FIFO head of the first non-empty
/// queue, or the idle task if every queue is empty (§4.7).
fn select_next_task() -> Pid {
    for level in 0..PRIORITY_LEVELS {
        if let Some(pid) = RUN_QUEUES[level].lock().pop_front() {
            return pid;
        }
    }
    IDLE_PID
}

enum Resume {
    First { entry: u32, stack: u32 },
    Saved(u32),
}

/// Hand the CPU to `next`, saving `outgoing`'s context first unless
/// `save_outgoing` is false (the outgoing task is exiting for good).
fn switch_to(outgoing: Pid, next: Pid, save_outgoing: bool) {
    if outgoing == next {
        let mut tasks = TASKS.lock();
        if let Some(t) = tasks.get_mut(&next) {
            t.state = TaskState::Running;
        }
        return;
    }

    CURRENT.store(next, Ordering::Release);

    let next_kstack;
    let next_pd;
    let resume;
    let old_ctx_ptr: *mut u32;

    {
        let mut tasks = TASKS.lock();

        let next_tcb = tasks.get_mut(&next).expect("switch_to: unknown next pid");
        next_tcb.state = TaskState::Running;
        next_tcb.ticks_remaining = TIME_SLICE_TICKS[next_tcb.effective_priority as usize];
        next_kstack = next_tcb.kernel_stack_top;
        resume = match next_tcb.exec {
            ExecState::FirstEntry { user_entry, user_stack_top } => Resume::First { entry: user_entry, stack: user_stack_top },
            ExecState::Suspended(ctx) => Resume::Saved(ctx.0),
        };
        next_pd = ADDRESS_SPACE.get().map(|p| p.pd_phys_of(next));

        old_ctx_ptr = if save_outgoing {
            match tasks.get_mut(&outgoing) {
                Some(t) => match &mut t.exec {
                    ExecState::Suspended(ctx) => &mut ctx.0 as *mut u32,
                    ExecState::FirstEntry { .. } => unreachable!("outgoing task cannot be mid-FirstEntry"),
                },
                None => core::ptr::null_mut(),
            }
        } else {
            core::ptr::null_mut()
        };
    } // TASKS lock released before the handoff — it must not stay locked
      // across a switch that may not resume this call for a long time.

    crate::gdt::set_kernel_stack(next_kstack);
    if let Some(pd) = next_pd {
        crate::memory::paging::switch_directory(pd);
    }

    match resume {
        Resume::First { entry, stack } => unsafe {
            crate::interrupts::usermode::jump_to_usermode(entry, stack);
        },
        Resume::Saved(new_esp) => {
            if old_ctx_ptr.is_null() {
                unsafe { context::do_restore_only(new_esp) };
            } else {
                unsafe { context::do_switch(&mut *(old_ctx_ptr as *mut Context), new_esp) };
            }
        }
    }
}

fn reschedule_from(outgoing: Pid, save_outgoing: bool) {
    let next = select_next_task();
    switch_to(outgoing, next, save_outgoing);
}

/// Cooperatively give up the CPU. Returns once this task is dispatched again.
pub fn yield_now() {
    without_interrupts(|| {
        let current = current_pid();
        if current != IDLE_PID {
            push_ready(current, effective_priority(current));
        }
        reschedule_from(current, true);
    });
}

/// Move the current task to BLOCKED (not in any run queue) and reschedule.
/// Returns once some other code path calls `unblock` on this PID.
pub fn block_current() {
    without_interrupts(|| {
        let current = current_pid();
        {
            let mut tasks = TASKS.lock();
            if let Some(t) = tasks.get_mut(&current) {
                t.state = TaskState::Blocked;
                t.in_run_queue = false;
            }
        }
        reschedule_from(current, true);
    });
}

/// Suspend the current task for `SIGSTOP`'s default action (§4.10): leaves
/// it out of every run queue with no wakeup condition except `unblock`
/// (delivered for `SIGCONT` — see `sys_kill`). Unlike `block_current`, this
/// is a one-way door the caller does not undo itself.
pub fn stop_current() {
    without_interrupts(|| {
        let current = current_pid();
        {
            let mut tasks = TASKS.lock();
            if let Some(t) = tasks.get_mut(&current) {
                t.state = TaskState::Stopped;
                t.in_run_queue = false;
            }
        }
        reschedule_from(current, true);
    });
}

/// Move a BLOCKED, SLEEPING, or STOPPED task back to READY and raise the
/// reschedule flag (§4.7, §4.10). A sleeper woken this way (e.g. by a
/// signal, per §4.10 "if the target is SLEEPING, a wake-up request is
/// raised") is also removed from the sleep queue so `scheduler_tick` won't
/// find it there again.
pub fn unblock(pid: Pid) {
    let prio = {
        let mut tasks = TASKS.lock();
        match tasks.get_mut(&pid) {
            Some(t) if matches!(t.state, TaskState::Blocked | TaskState::Sleeping | TaskState::Stopped) => {
                t.in_run_queue = false;
                Some(t.effective_priority)
            }
            _ => None,
        }
    };
    if let Some(prio) = prio {
        let mut queue = SLEEP_QUEUE.lock();
        if let Some(pos) = queue.iter().position(|&p| p == pid) {
            queue.remove(pos);
        }
        drop(queue);
        push_ready(pid, prio);
        RESCHEDULE.store(true, Ordering::Release);
    }
}

/// `sleep_ms` (§4.7): converts to ticks (1 tick ≈ 1 ms), sets an absolute
/// saturating wakeup tick, inserts into the sleep queue in ascending order.
pub fn sleep_ms(ms: u32) {
    without_interrupts(|| {
        let current = current_pid();
        let wake_at = current_tick().saturating_add(ms);
        {
            let mut tasks = TASKS.lock();
            if let Some(t) = tasks.get_mut(&current) {
                t.state = TaskState::Sleeping;
                t.wakeup_time = wake_at;
                t.in_run_queue = false;
            }
        }
        insert_sleep_sorted(current, wake_at);
        reschedule_from(current, true);
    });
}

fn insert_sleep_sorted(pid: Pid, wake_at: u32) {
    let mut queue = SLEEP_QUEUE.lock();
    let tasks = TASKS.lock();
    let pos = queue.iter().position(|&p| tasks.get(&p).map(|t| t.wakeup_time).unwrap_or(0) > wake_at).unwrap_or(queue.len());
    drop(tasks);
    queue.insert(pos, pid);
}

/// Called once per timer tick (§4.7). Wakes every sleeper whose wakeup time
/// has arrived, decrements the running task's slice, and raises the
/// reschedule flag when either happens. Returns whether a reschedule is due
/// so the caller (the PIT ISR) can `yield_now` on IRQ return.
pub fn scheduler_tick() -> bool {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    loop {
        let mut queue = SLEEP_QUEUE.lock();
        let due = {
            let tasks = TASKS.lock();
            match queue.front() {
                Some(&pid) => tasks.get(&pid).map(|t| t.wakeup_time <= now).unwrap_or(true),
                None => false,
            }
        };
        if !due {
            break;
        }
        let pid = queue.pop_front().unwrap();
        drop(queue);
        let prio = {
            let mut tasks = TASKS.lock();
            if let Some(t) = tasks.get_mut(&pid) {
                t.state = TaskState::Ready;
                Some(t.effective_priority)
            } else {
                None
            }
        };
        if let Some(prio) = prio {
            push_ready(pid, prio);
            RESCHEDULE.store(true, Ordering::Release);
        }
    }

    let current = current_pid();
    if current != IDLE_PID {
        let mut tasks = TASKS.lock();
        if let Some(t) = tasks.get_mut(&current) {
            if t.ticks_remaining > 0 {
                t.ticks_remaining -= 1;
            }
            if t.ticks_remaining == 0 {
                RESCHEDULE.store(true, Ordering::Release);
            }
        }
    }

    RESCHEDULE.swap(false, Ordering::AcqRel)
}

/// Task `waiter` begins waiting on a resource held by `holder`. If holder's
/// effective priority is numerically less urgent than waiter's, temporarily
/// boost it and move it to the matching run queue (§4.7 priority inheritance).
pub fn inherit_priority(holder: Pid, waiter: Pid) {
    let waiter_prio = effective_priority(waiter);
    let mut moved = None;
    {
        let mut tasks = TASKS.lock();
        if let Some(w) = tasks.get_mut(&waiter) {
            w.blocking_on = Some(holder);
        }
        if let Some(h) = tasks.get_mut(&holder) {
            if !h.blocked_by_me.contains(&waiter) {
                h.blocked_by_me.push(waiter);
            }
            if h.effective_priority > waiter_prio {
                let old_prio = h.effective_priority;
                h.effective_priority = waiter_prio;
                if h.in_run_queue {
                    moved = Some((old_prio, waiter_prio));
                }
            }
        }
    }
    if let Some((old_prio, new_prio)) = moved {
        if remove_from_run_queue(holder, old_prio) {
            push_ready(holder, new_prio);
        }
    }
}

/// `holder` releases the resource `waiter` was inheriting priority through:
/// drop the dependency and, if nothing else depends on it, revert to base
/// priority.
pub fn release_priority(holder: Pid, waiter: Pid) {
    let mut moved = None;
    {
        let mut tasks = TASKS.lock();
        if let Some(w) = tasks.get_mut(&waiter) {
            w.blocking_on = None;
        }
        if let Some(h) = tasks.get_mut(&holder) {
            h.blocked_by_me.retain(|&p| p != waiter);
            if h.blocked_by_me.is_empty() && h.effective_priority != h.base_priority {
                let old_prio = h.effective_priority;
                h.effective_priority = h.base_priority;
                if h.in_run_queue {
                    moved = Some((old_prio, h.base_priority));
                }
            }
        }
    }
    if let Some((old_prio, new_prio)) = moved {
        if remove_from_run_queue(holder, old_prio) {
            push_ready(holder, new_prio);
        }
    }
}

/// Mark `pid` ZOMBIE with its exit code. Frees nothing — resource teardown
/// is `process::destroy_process`'s job, invoked later by the idle loop
/// (§4.7 zombie reaping).
pub fn mark_zombie(pid: Pid, exit_code: i32) {
    let mut tasks = TASKS.lock();
    if let Some(t) = tasks.get_mut(&pid) {
        t.state = TaskState::Zombie;
        t.exit_code = Some(exit_code);
        t.in_run_queue = false;
    }
}

pub fn exit_code_of(pid: Pid) -> Option<i32> {
    TASKS.lock().get(&pid).and_then(|t| t.exit_code)
}

pub fn state_of(pid: Pid) -> Option<TaskState> {
    TASKS.lock().get(&pid).map(|t| t.state)
}

/// Remove a zombie's TCB. Called by `process::destroy_process` once the PCB
/// side of its resources is freed.
pub fn remove_task(pid: Pid) {
    TASKS.lock().remove(&pid);
}

/// Snapshot of every PID currently ZOMBIE, for the idle loop's reap scan.
pub fn zombie_pids() -> Vec<Pid> {
    TASKS.lock().iter().filter(|(_, t)| t.state == TaskState::Zombie).map(|(&pid, _)| pid).collect()
}

/// Snapshot of every known PID and its state, for `ps`-style introspection.
pub fn list_tasks() -> Vec<(Pid, TaskState, u8)> {
    TASKS.lock().values().map(|t| (t.pid, t.state, t.base_priority)).collect()
}

/// Give up the CPU permanently. Caller must already have called
/// `mark_zombie` on the current task. Never returns.
pub fn exit_current() -> ! {
    without_interrupts(|| {
        let outgoing = current_pid();
        let next = select_next_task();
        switch_to(outgoing, next, false);
    });
    unreachable!("exit_current: switch_to returned to a dead task")
}

/// Replace the current task's resume point in place for `execve` (§4.8):
/// the TCB entry is mutated, not recreated, so its PID and run-queue/sleep
/// state are untouched.
pub fn reset_current_for_exec(kernel_stack_top: u32, user_entry: u32, user_stack_top: u32) -> ! {
    let current = current_pid();
    {
        let mut tasks = TASKS.lock();
        if let Some(t) = tasks.get_mut(&current) {
            t.reset_for_exec(kernel_stack_top, user_entry, user_stack_top);
        }
    }
    without_interrupts(|| {
        crate::gdt::set_kernel_stack(kernel_stack_top);
        unsafe {
            crate::interrupts::usermode::jump_to_usermode(user_entry, user_stack_top);
        }
    });
    unreachable!("jump_to_usermode returned")
}
