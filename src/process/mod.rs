//! Process control blocks (§3): everything a process owns besides its
//! scheduling state — address space, open files, signal disposition, process
//! hierarchy. Kept deliberately separate from the TCB (`scheduler::task`),
//! which is purely "how do I get this thing back on a CPU". A `Pid` is the
//! only thing the two sides share.

pub mod signal;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::fs::error::{FsError, FsResult};
use crate::fs::fd::FdTable;
use crate::interrupts::idt::TrapFrame;
use crate::loader::elf;
use crate::memory::mm::{self, MmHandle, MmStruct, Vma};
use crate::memory::{frame_allocator, paging, tempmap};
use crate::scheduler::{self, task::Tcb, AddressSpaceSwitch};
use crate::sync::IrqSpinLock;
use signal::SignalState;

pub type Pid = u32;

pub const INIT_PID: Pid = 1;
const KERNEL_STACK_SIZE: usize = 16 * 1024;
const DEFAULT_PRIORITY: u8 = 1;

pub struct Pcb {
    pub pid: Pid,
    pub parent: IrqSpinLock<Pid>,
    pub children: IrqSpinLock<Vec<Pid>>,
    pub pgid: IrqSpinLock<Pid>,
    pub sid: IrqSpinLock<Pid>,
    pub cwd: IrqSpinLock<String>,
    mm: IrqSpinLock<MmHandle>,
    pub fd_table: IrqSpinLock<FdTable>,
    pub signal: IrqSpinLock<SignalState>,
    /// Owns the task's kernel stack; the TCB only remembers its top address.
    #[allow(dead_code)]
    kernel_stack: IrqSpinLock<Box<[u8]>>,
    kernel_stack_top: u32,
}

impl Pcb {
    /// Run `f` with the address space's `MmStruct` locked. Two lock tiers —
    /// "which address space is current" then "its contents" — because
    /// `execve` needs to swap the whole `MmHandle` out from under a process
    /// whose contents are otherwise locked independently.
    pub fn with_mm<R>(&self, f: impl FnOnce(&mut MmStruct) -> R) -> R {
        let handle = self.mm.lock();
        let mut guard = handle.lock();
        f(&mut guard)
    }

    fn replace_mm(&self, new_handle: MmHandle) -> MmHandle {
        core::mem::replace(&mut *self.mm.lock(), new_handle)
    }

    fn pd_phys(&self) -> u32 {
        self.with_mm(|mm| mm.pd_phys)
    }
}

static PROCESSES: IrqSpinLock<BTreeMap<Pid, Arc<Pcb>>> = IrqSpinLock::new(BTreeMap::new());
static NEXT_PID: AtomicU32 = AtomicU32::new(INIT_PID);

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

fn alloc_kernel_stack() -> (Box<[u8]>, u32) {
    let stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let top = (stack.as_ptr() as u32) + KERNEL_STACK_SIZE as u32;
    (stack, top)
}

pub fn lookup(pid: Pid) -> Option<Arc<Pcb>> {
    PROCESSES.lock().get(&pid).cloned()
}

fn insert(pcb: Arc<Pcb>) {
    PROCESSES.lock().insert(pcb.pid, pcb);
}

/// Maps `Pid` to its address space's physical page directory, so the
/// scheduler can switch `cr3` on context switch without knowing what a
/// process is (§9 redesign note: trait-based capability set at this seam).
struct ProcessAddressSpaces;

impl AddressSpaceSwitch for ProcessAddressSpaces {
    fn pd_phys_of(&self, pid: Pid) -> u32 {
        lookup(pid).map(|pcb| pcb.pd_phys()).unwrap_or(paging::current_pd_phys())
    }
}

static ADDRESS_SPACES: ProcessAddressSpaces = ProcessAddressSpaces;

/// Wire the process table into the scheduler. Call once during boot, before
/// `scheduler::init`.
pub fn init() {
    scheduler::set_address_space_provider(&ADDRESS_SPACES);
}

/// Load `path` as a fresh process: used once for the init process (no
/// parent) and never again directly — every other process comes from
/// `fork_process` + `execve_process` (§4.8 Create).
pub fn create_process(path: &str, parent: Pid) -> FsResult<Pid> {
    let pid = alloc_pid();
    let (mm_handle, entry, user_stack_top) = elf::create_user_address_space(path)?;
    let (kernel_stack, kernel_stack_top) = alloc_kernel_stack();

    let pcb = Arc::new(Pcb {
        pid,
        parent: IrqSpinLock::new(parent),
        children: IrqSpinLock::new(Vec::new()),
        pgid: IrqSpinLock::new(pid),
        sid: IrqSpinLock::new(pid),
        cwd: IrqSpinLock::new(String::from("/")),
        mm: IrqSpinLock::new(mm_handle),
        fd_table: IrqSpinLock::new(FdTable::new_with_console()),
        signal: IrqSpinLock::new(SignalState::new()),
        kernel_stack: IrqSpinLock::new(kernel_stack),
        kernel_stack_top,
    });

    if let Some(parent_pcb) = lookup(parent) {
        parent_pcb.children.lock().push(pid);
    }

    insert(pcb);
    scheduler::register_task(Tcb::new_user(pid, DEFAULT_PRIORITY, kernel_stack_top, entry, user_stack_top));
    Ok(pid)
}

/// Eagerly copy every byte of `src_vmas`' backing pages (as mapped in the
/// currently-active directory) into freshly allocated frames mapped at the
/// same addresses in `child_pd`. `fork_mm` only clones VMA metadata; actual
/// page contents are this function's job (mm.rs: "callers copy page
/// contents separately per fork's anonymous-copy semantics").
fn clone_address_space_contents(child_pd: u32, src_vmas: &[Vma]) -> FsResult<()> {
    let parent_pd = paging::current_pd_phys();
    let mut staging = [0u8; frame_allocator::FRAME_SIZE as usize];

    for vma in src_vmas {
        let mut va = vma.start;
        while va < vma.end {
            if paging::translate(parent_pd, va).is_some() {
                unsafe {
                    core::ptr::copy_nonoverlapping(va as *const u8, staging.as_mut_ptr(), staging.len());
                }

                let new_phys = frame_allocator::alloc_frame().ok_or(FsError::NoMem)?;
                let tva = tempmap::temp_map(new_phys).ok_or(FsError::NoMem)?;
                unsafe {
                    core::ptr::copy_nonoverlapping(staging.as_ptr(), tva as *mut u8, staging.len());
                }
                tempmap::temp_unmap(tva);

                paging::map_page(child_pd, va, new_phys, vma.page_prot()).map_err(|_| FsError::NoMem)?;
            }
            va += frame_allocator::FRAME_SIZE;
        }
    }
    Ok(())
}

/// `fork` (§4.8): clone the address space (kernel PDEs shared, every user VMA
/// copied with its contents), the fd table (shared handles, independent
/// slots) and signal dispositions (pending cleared), then duplicate the
/// parent's trap frame so the child's first instruction is the same
/// `int 0x80` return with `eax` forced to zero.
pub fn fork_process(parent_pid: Pid, parent_frame: &TrapFrame) -> FsResult<Pid> {
    let parent_pcb = lookup(parent_pid).ok_or(FsError::NotFound)?;

    let child_mm_handle = parent_pcb.with_mm(|parent_mm| mm::fork_mm(parent_mm).ok_or(FsError::NoMem))?;
    let child_pd = child_mm_handle.lock().pd_phys;
    parent_pcb.with_mm(|parent_mm| clone_address_space_contents(child_pd, parent_mm.vmas()))?;

    let child_pid = alloc_pid();
    let (kernel_stack, kernel_stack_top) = alloc_kernel_stack();

    let child_pcb = Arc::new(Pcb {
        pid: child_pid,
        parent: IrqSpinLock::new(parent_pid),
        children: IrqSpinLock::new(Vec::new()),
        pgid: IrqSpinLock::new(*parent_pcb.pgid.lock()),
        sid: IrqSpinLock::new(*parent_pcb.sid.lock()),
        cwd: IrqSpinLock::new(parent_pcb.cwd.lock().clone()),
        mm: IrqSpinLock::new(child_mm_handle),
        fd_table: IrqSpinLock::new(parent_pcb.fd_table.lock().fork_clone()),
        signal: IrqSpinLock::new(parent_pcb.signal.lock().fork_clone()),
        kernel_stack: IrqSpinLock::new(kernel_stack),
        kernel_stack_top,
    });

    parent_pcb.children.lock().push(child_pid);
    insert(child_pcb);

    let child_context = crate::scheduler::context::build_fork_child_context(kernel_stack_top, parent_frame);
    let tcb = Tcb {
        pid: child_pid,
        state: crate::scheduler::task::TaskState::Ready,
        base_priority: DEFAULT_PRIORITY,
        effective_priority: DEFAULT_PRIORITY,
        ticks_remaining: crate::scheduler::task::TIME_SLICE_TICKS[DEFAULT_PRIORITY as usize],
        wakeup_time: 0,
        exit_code: None,
        in_run_queue: false,
        kernel_stack_top,
        exec: crate::scheduler::task::ExecState::Suspended(child_context),
        blocking_on: None,
        blocked_by_me: Vec::new(),
    };
    scheduler::register_task(tcb);

    Ok(child_pid)
}

/// `execve` (§4.8): build the new address space fully before touching the
/// old one, so a failed load leaves the caller intact. On success the
/// current task is reset to a first-entry dispatch into the new image and
/// never returns through the syscall path it entered on.
pub fn execve_process(pid: Pid, path: &str) -> FsResult<()> {
    let pcb = lookup(pid).ok_or(FsError::NotFound)?;
    let (new_mm_handle, entry, user_stack_top) = elf::create_user_address_space(path)?;

    let old_mm_handle = pcb.replace_mm(new_mm_handle);
    mm::destroy_mm(old_mm_handle);

    pcb.signal.lock().reset_for_exec();

    scheduler::reset_current_for_exec(pcb.kernel_stack_top, entry, user_stack_top);
}

/// Terminate the current process (§4.8 Exit): mark zombie, reparent orphans
/// to init, wake a waiting parent with `SIGCHLD`, then hand off to the
/// scheduler — this never returns.
pub fn exit_current_process(exit_code: i32) -> ! {
    let pid = scheduler::current_pid();
    if let Some(pcb) = lookup(pid) {
        let children: Vec<Pid> = pcb.children.lock().clone();
        for child in children {
            if let Some(child_pcb) = lookup(child) {
                *child_pcb.parent.lock() = INIT_PID;
            }
            if let Some(init_pcb) = lookup(INIT_PID) {
                init_pcb.children.lock().push(child);
            }
        }

        let parent = *pcb.parent.lock();
        if let Some(parent_pcb) = lookup(parent) {
            parent_pcb.signal.lock().raise(signal::SIGCHLD);
            scheduler::unblock(parent);
        }
    }

    scheduler::mark_zombie(pid, exit_code);
    scheduler::exit_current();
}

/// `waitpid` (§4.8): `target == -1` waits for any child; otherwise for that
/// specific PID. Blocks until a matching zombie exists, then reaps it.
pub fn waitpid(parent_pid: Pid, target: i32, status_out: &mut i32) -> FsResult<Pid> {
    loop {
        let parent_pcb = lookup(parent_pid).ok_or(FsError::NotFound)?;
        let children = parent_pcb.children.lock().clone();
        if children.is_empty() {
            return Err(FsError::Child);
        }

        let candidate = children.into_iter().find(|&c| {
            (target == -1 || c as i32 == target)
                && scheduler::state_of(c) == Some(crate::scheduler::task::TaskState::Zombie)
        });

        if let Some(child_pid) = candidate {
            *status_out = scheduler::exit_code_of(child_pid).unwrap_or(0);
            parent_pcb.children.lock().retain(|&c| c != child_pid);
            destroy_process(child_pid);
            return Ok(child_pid);
        }

        if target != -1 && lookup(target as Pid).is_none() {
            return Err(FsError::Child);
        }

        scheduler::block_current();
    }
}

/// Free everything a zombie process still owns and drop it from the table.
/// Called by `waitpid` on a reaped child, and by `reap_abandoned_zombies`
/// for orphans whose reparented-to parent has itself already exited.
pub fn destroy_process(pid: Pid) {
    if let Some(pcb_arc) = PROCESSES.lock().remove(&pid) {
        match Arc::try_unwrap(pcb_arc) {
            Ok(pcb) => mm::destroy_mm(pcb.mm.into_inner()),
            Err(_still_referenced) => {
                crate::log_warn!("destroy_process({}): pcb still referenced elsewhere", pid);
            }
        }
    }
    scheduler::remove_task(pid);
}

/// Idle-loop housekeeping: reap any zombie whose recorded parent no longer
/// exists (it exited without ever calling `waitpid`).
pub fn reap_abandoned_zombies() {
    for pid in scheduler::zombie_pids() {
        let has_parent = lookup(pid).map(|pcb| lookup(*pcb.parent.lock()).is_some()).unwrap_or(false);
        if !has_parent {
            destroy_process(pid);
        }
    }
}

/// Called on every return to user mode for the current task (§2, §4.10):
/// deliver one pending, unmasked signal if any and the task isn't already
/// inside a handler.
pub fn deliver_pending_signals(frame: &mut TrapFrame) {
    let pid = scheduler::current_pid();
    if let Some(pcb) = lookup(pid) {
        let outcome = pcb.with_mm(|mm| pcb.signal.lock().try_deliver(mm, frame));
        if outcome == signal::Delivery::Stopped {
            scheduler::stop_current();
        }
    }
}

pub fn current_pcb() -> Option<Arc<Pcb>> {
    lookup(scheduler::current_pid())
}
