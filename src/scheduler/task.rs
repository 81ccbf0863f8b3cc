//! The TCB (§3): the scheduler's entire view of a schedulable entity. Run
//! queue and sleep queue membership is tracked by a `Pid`-keyed queue
//! abstraction (see `super`), not by intrusive list pointers, per the
//! "raw linked lists of TCBs" redesign note.

use alloc::vec::Vec;

use super::context::Context;
use crate::process::Pid;

pub const PRIORITY_LEVELS: usize = 4;

/// Fixed per-priority time slice in ticks (nominal 1 ms/tick): 200/100/50/25 ms.
pub const TIME_SLICE_TICKS: [u32; PRIORITY_LEVELS] = [200, 100, 50, 25];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Sleeping,
    Blocked,
    /// Suspended by `SIGSTOP`'s default action (§4.10); resumed only by
    /// `SIGCONT`, never by a timer or an ordinary `unblock` source event.
    Stopped,
    Zombie,
}

/// A task's saved execution point: either it has never run and is waiting
/// for its first dispatch straight into user mode (§4.7), or it has a
/// saved kernel stack pointer from a previous switch-out.
pub enum ExecState {
    FirstEntry { user_entry: u32, user_stack_top: u32 },
    Suspended(Context),
}

pub struct Tcb {
    pub pid: Pid,
    pub state: TaskState,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub ticks_remaining: u32,
    pub wakeup_time: u32,
    pub exit_code: Option<i32>,
    pub in_run_queue: bool,
    /// Top of this task's kernel stack; written into `TSS.esp0` on dispatch.
    pub kernel_stack_top: u32,
    pub exec: ExecState,
    /// Priority inheritance (§4.7): the task this one is currently blocked on.
    pub blocking_on: Option<Pid>,
    /// Priority inheritance: tasks currently blocked on this one.
    pub blocked_by_me: Vec<Pid>,
}

impl Tcb {
    pub fn new_kernel(pid: Pid, priority: u8, kernel_stack_top: u32, entry: extern "C" fn() -> !) -> Self {
        Tcb {
            pid,
            state: TaskState::Ready,
            base_priority: priority,
            effective_priority: priority,
            ticks_remaining: TIME_SLICE_TICKS[priority as usize],
            wakeup_time: 0,
            exit_code: None,
            in_run_queue: false,
            kernel_stack_top,
            exec: ExecState::Suspended(super::context::build_kernel_context(kernel_stack_top, entry)),
            blocking_on: None,
            blocked_by_me: Vec::new(),
        }
    }

    pub fn new_user(pid: Pid, priority: u8, kernel_stack_top: u32, user_entry: u32, user_stack_top: u32) -> Self {
        Tcb {
            pid,
            state: TaskState::Ready,
            base_priority: priority,
            effective_priority: priority,
            ticks_remaining: TIME_SLICE_TICKS[priority as usize],
            wakeup_time: 0,
            exit_code: None,
            in_run_queue: false,
            kernel_stack_top,
            exec: ExecState::FirstEntry { user_entry, user_stack_top },
            blocking_on: None,
            blocked_by_me: Vec::new(),
        }
    }

    /// Reset to a freshly-dispatchable FirstEntry, used by `execve` to
    /// replace a running task's resume point in place (§4.8).
    pub fn reset_for_exec(&mut self, kernel_stack_top: u32, user_entry: u32, user_stack_top: u32) {
        self.kernel_stack_top = kernel_stack_top;
        self.exec = ExecState::FirstEntry { user_entry, user_stack_top };
    }
}
