//! Per-process signal state (§4.10): 32 handler slots addressed by signal
//! number, a pending bitmap, a mask bitmap, and a single "currently inside a
//! handler" flag that forbids nested delivery — there is no signal stack of
//! handlers, just the one flag.

use crate::interrupts::idt::TrapFrame;
use crate::memory::mm::MmStruct;
use crate::memory::uaccess;

pub const NSIG: usize = 32;
pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGABRT: u32 = 6;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGSTOP: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGCHLD: u32 = 20;

const UNBLOCKABLE: u32 = (1 << SIGKILL) | (1 << SIGSTOP);

/// One page of kernel-written code mapped read+exec into every process,
/// below the stack's lowest possible growth point so it never collides with
/// `try_grow_stack`. Its sole job is to trap back into the kernel with the
/// sigreturn syscall number after a handler returns.
pub const SIG_TRAMPOLINE_VA: u32 = 0xBEFF_F000;

/// `mov eax, 119 ; int 0x80` — `119` is `sys_sigreturn` (§6 supplements the
/// explicit table with this one entry; see DESIGN.md).
pub const TRAMPOLINE_CODE: [u8; 7] = [0xB8, 0x77, 0x00, 0x00, 0x00, 0xCD, 0x80];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigAction {
    Default,
    Ignore,
    Handler(u32),
}

/// What `try_deliver` did, so the caller can act on the parts that need the
/// scheduler — it must not call back into the scheduler while still holding
/// the signal lock and `mm` lock `try_deliver` runs under (§5 "no blocking
/// call while holding any spinlock").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Nothing,
    EnteredHandler,
    Stopped,
}

/// The register state a handler displaces, restored verbatim by sigreturn.
#[derive(Clone, Copy)]
pub struct SavedUserContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eip: u32,
    pub esp: u32,
    pub eflags: u32,
}

pub struct SignalState {
    actions: [SigAction; NSIG],
    pending: u32,
    mask: u32,
    in_handler: bool,
    saved: Option<SavedUserContext>,
}

impl SignalState {
    pub fn new() -> Self {
        SignalState {
            actions: [SigAction::Default; NSIG],
            pending: 0,
            mask: 0,
            in_handler: false,
            saved: None,
        }
    }

    /// Copy handler dispositions for fork; pending signals do not survive
    /// into the child (§4.8).
    pub fn fork_clone(&self) -> Self {
        SignalState {
            actions: self.actions,
            pending: 0,
            mask: self.mask,
            in_handler: false,
            saved: None,
        }
    }

    /// execve resets every caught handler to default but keeps the mask and
    /// pending set, matching POSIX exec semantics.
    pub fn reset_for_exec(&mut self) {
        self.actions = [SigAction::Default; NSIG];
        self.in_handler = false;
        self.saved = None;
    }

    pub fn set_action(&mut self, signum: u32, action: SigAction) -> Result<(), ()> {
        if signum as usize >= NSIG || (1u32 << signum) & UNBLOCKABLE != 0 {
            return Err(());
        }
        self.actions[signum as usize] = action;
        Ok(())
    }

    pub fn raise(&mut self, signum: u32) {
        if (signum as usize) < NSIG {
            self.pending |= 1 << signum;
        }
    }

    fn deliverable_mask(&self) -> u32 {
        (self.pending & !self.mask) | (self.pending & UNBLOCKABLE)
    }

    /// Default disposition for signals nobody caught: most terminate, a few
    /// are ignored or (SIGCONT) simply clear and continue.
    fn default_is_ignore(signum: u32) -> bool {
        signum == SIGCHLD || signum == SIGCONT
    }

    /// Called on every kernel-to-user return for the current task. Reports
    /// what it did so the caller can follow up with the scheduler once the
    /// locks guarding `self`/`mm` are released.
    pub fn try_deliver(&mut self, mm: &MmStruct, frame: &mut TrapFrame) -> Delivery {
        if self.in_handler {
            return Delivery::Nothing;
        }
        let deliverable = self.deliverable_mask();
        if deliverable == 0 {
            return Delivery::Nothing;
        }
        let signum = deliverable.trailing_zeros();
        self.pending &= !(1 << signum);

        match self.actions[signum as usize] {
            SigAction::Ignore => Delivery::Nothing,
            SigAction::Default if Self::default_is_ignore(signum) => Delivery::Nothing,
            // SIGSTOP can never be caught or ignored (`set_action` rejects
            // it outright), so it only ever reaches this Default arm.
            SigAction::Default if signum == SIGSTOP => Delivery::Stopped,
            SigAction::Default => {
                crate::log_warn!("process terminated by default action of signal {}", signum);
                crate::process::exit_current_process(128 + signum as i32);
            }
            SigAction::Handler(handler_va) => {
                self.saved = Some(SavedUserContext {
                    eax: frame.eax,
                    ebx: frame.ebx,
                    ecx: frame.ecx,
                    edx: frame.edx,
                    esi: frame.esi,
                    edi: frame.edi,
                    ebp: frame.ebp,
                    eip: frame.eip,
                    esp: frame.user_esp,
                    eflags: frame.eflags,
                });

                let mut sp = frame.user_esp;
                sp &= !0xF;
                sp -= 4;
                if uaccess::copy_to_user(mm, sp, &signum.to_le_bytes()) != 0 {
                    return Delivery::Nothing;
                }
                sp -= 4;
                if uaccess::copy_to_user(mm, sp, &SIG_TRAMPOLINE_VA.to_le_bytes()) != 0 {
                    return Delivery::Nothing;
                }

                frame.user_esp = sp;
                frame.eip = handler_va;
                self.in_handler = true;
                Delivery::EnteredHandler
            }
        }
    }

    /// The sigreturn syscall (§4.10): pop the saved context back into `frame`
    /// and clear the no-nesting flag.
    pub fn sigreturn(&mut self, frame: &mut TrapFrame) -> Result<(), ()> {
        let saved = self.saved.take().ok_or(())?;
        frame.eax = saved.eax;
        frame.ebx = saved.ebx;
        frame.ecx = saved.ecx;
        frame.edx = saved.edx;
        frame.esi = saved.esi;
        frame.edi = saved.edi;
        frame.ebp = saved.ebp;
        frame.eip = saved.eip;
        frame.user_esp = saved.esp;
        frame.eflags = saved.eflags;
        self.in_handler = false;
        Ok(())
    }
}
