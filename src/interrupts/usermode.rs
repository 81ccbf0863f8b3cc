//! Ring3 transition. The `int 0x80` syscall path itself is just another
//! vector handled by `isr_common_stub` (see `idt.rs`) and registered by
//! `syscalls::init`; this module only has to get a freshly loaded process
//! from ring0 into ring3 for the first time.

use crate::gdt::{USER_CODE_SEL, USER_DATA_SEL};

/// Push the `iretd` frame a ring0→ring3 transition needs and jump.
/// `entry`/`user_stack_top` are linear addresses in the target process's
/// own address space, which must already be the loaded CR3 by the time
/// this is called.
///
/// # Safety
/// `entry` must point at executable, user-readable memory and
/// `user_stack_top` at a mapped, writable user stack; both are checked by
/// the caller (`process::exec`) against the process's VMA list before this
/// is reached.
pub unsafe fn jump_to_usermode(entry: u32, user_stack_top: u32) -> ! {
    const USER_RPL: u16 = 3;
    let user_cs = USER_CODE_SEL | USER_RPL;
    let user_ss = USER_DATA_SEL | USER_RPL;
    const IF_FLAG: u32 = 1 << 9;

    core::arch::asm!(
        "mov ax, {data_sel:x}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",

        "push {ss}",
        "push {esp}",
        "push {eflags}",
        "push {cs}",
        "push {eip}",
        "iretd",
        data_sel = in(reg) user_ss,
        ss = in(reg) user_ss as u32,
        esp = in(reg) user_stack_top,
        eflags = in(reg) IF_FLAG,
        cs = in(reg) user_cs as u32,
        eip = in(reg) entry,
        options(noreturn),
    );
}
