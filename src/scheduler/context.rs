//! The 32-bit "only-ESP" context switch (§4.7 / §9 design note: "the
//! target-language version confines the unsafe assembly to a single
//! function with a typed `Context` newtype wrapping the saved stack
//! pointer"). A TCB never stores more than this one value for a suspended
//! task; every other register lives on the task's own kernel stack.

use core::arch::global_asm;
use core::mem::size_of;

/// A suspended task's saved kernel stack pointer — the sole representation
/// of an off-CPU thread's register state (§3 TCB).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Context(pub u32);

impl Context {
    pub const fn zero() -> Self {
        Context(0)
    }
}

/// Layout `switch_context`/`restore_only` expect at a saved ESP, built in
/// the reverse of the pop sequence: DS/ES/FS/GS closest to ESP, then
/// PUSHAD's eight GPRs, then EFLAGS, then the return address `ret` consumes.
#[repr(C)]
struct SwitchFrame {
    ds: u32,
    es: u32,
    fs: u32,
    gs: u32,
    edi: u32,
    esi: u32,
    ebp: u32,
    esp_dummy: u32,
    ebx: u32,
    edx: u32,
    ecx: u32,
    eax: u32,
    eflags: u32,
    return_addr: u32,
}

const EFLAGS_RESERVED: u32 = 1 << 1;
const EFLAGS_IF: u32 = 1 << 9;

/// Build the initial saved-ESP frame for a kernel task that has never run:
/// `entry` becomes the address `switch_context`'s `ret` jumps to the first
/// time this task is dispatched.
pub fn build_kernel_context(stack_top: u32, entry: extern "C" fn() -> !) -> Context {
    let frame_addr = (stack_top & !0xF).wrapping_sub(size_of::<SwitchFrame>() as u32);
    let frame = frame_addr as *mut SwitchFrame;
    unsafe {
        core::ptr::write(
            frame,
            SwitchFrame {
                ds: crate::gdt::KERNEL_DATA_SEL as u32,
                es: crate::gdt::KERNEL_DATA_SEL as u32,
                fs: crate::gdt::KERNEL_DATA_SEL as u32,
                gs: crate::gdt::KERNEL_DATA_SEL as u32,
                edi: 0,
                esi: 0,
                ebp: 0,
                esp_dummy: 0,
                ebx: 0,
                edx: 0,
                ecx: 0,
                eax: 0,
                eflags: EFLAGS_IF | EFLAGS_RESERVED,
                return_addr: entry as u32,
            },
        );
    }
    Context(frame_addr)
}

global_asm!(
    r#"
.global switch_context
switch_context:
    mov eax, [esp+4]
    mov edx, [esp+8]
    pushfd
    pushad
    push gs
    push fs
    push es
    push ds
    mov [eax], esp
    mov esp, edx
    pop ds
    pop es
    pop fs
    pop gs
    popad
    popfd
    ret

.global restore_only
restore_only:
    mov esp, [esp+4]
    pop ds
    pop es
    pop fs
    pop gs
    popad
    popfd
    ret
"#
);

extern "C" {
    /// Save the caller's context into `*old_esp`, then switch to `new_esp`.
    /// Returns into the caller only once this task is dispatched again.
    fn switch_context(old_esp: *mut u32, new_esp: u32);
    /// Switch to `new_esp` without saving anything. Used when the outgoing
    /// task is exiting and will never run again; never truly returns.
    fn restore_only(new_esp: u32);
}

/// # Safety
/// `old` must belong to a task that is actually suspending here, and
/// `new_esp` must be a context built by `build_kernel_context` or
/// previously saved by a prior `do_switch`.
pub unsafe fn do_switch(old: &mut Context, new_esp: u32) {
    switch_context(&mut old.0 as *mut u32, new_esp);
}

/// # Safety
/// Same as `do_switch`, but for a caller with no state worth preserving.
/// Does not return.
pub unsafe fn do_restore_only(new_esp: u32) -> ! {
    restore_only(new_esp);
    unreachable!("restore_only returned")
}

use crate::interrupts::idt::TrapFrame;

global_asm!(
    r#"
.global fork_return_trampoline
fork_return_trampoline:
    popad
    pop gs
    pop fs
    pop es
    pop ds
    add esp, 8
    iretd
"#
);

extern "C" {
    fn fork_return_trampoline();
}

/// Build a freshly-forked child's saved context (§4.8): a `SwitchFrame` that
/// `switch_context`'s epilogue unwinds into `fork_return_trampoline`, which in
/// turn unwinds a copy of the parent's trap frame straight back to user mode
/// with `eax` forced to zero — the child's syscall return value.
pub fn build_fork_child_context(child_stack_top: u32, parent_frame: &TrapFrame) -> Context {
    let trap_addr = (child_stack_top & !0xF).wrapping_sub(size_of::<TrapFrame>() as u32);
    let switch_addr = trap_addr.wrapping_sub(size_of::<SwitchFrame>() as u32);

    unsafe {
        let mut child_frame = core::ptr::read(parent_frame);
        child_frame.eax = 0;
        core::ptr::write(trap_addr as *mut TrapFrame, child_frame);

        core::ptr::write(
            switch_addr as *mut SwitchFrame,
            SwitchFrame {
                ds: crate::gdt::KERNEL_DATA_SEL as u32,
                es: crate::gdt::KERNEL_DATA_SEL as u32,
                fs: crate::gdt::KERNEL_DATA_SEL as u32,
                gs: crate::gdt::KERNEL_DATA_SEL as u32,
                edi: 0,
                esi: 0,
                ebp: 0,
                esp_dummy: 0,
                ebx: 0,
                edx: 0,
                ecx: 0,
                eax: 0,
                eflags: EFLAGS_IF | EFLAGS_RESERVED,
                return_addr: fork_return_trampoline as u32,
            },
        );
    }

    Context(switch_addr)
}
