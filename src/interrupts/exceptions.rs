//! CPU exception handlers that do more than log-and-panic (§4.6/§7): page
//! faults try to grow the stack or fix up a faulting `uaccess` copy before
//! falling back to `SIGSEGV`; general protection faults always deliver
//! `SIGSEGV` to a ring-3 faulter and panic otherwise.

use core::arch::asm;

use crate::interrupts::idt::{self, TrapFrame, VECTOR_GENERAL_PROTECTION, VECTOR_PAGE_FAULT};
use crate::memory::uaccess;
use crate::process::{self, signal::SIGSEGV};

fn read_cr2() -> u32 {
    let value: u32;
    unsafe { asm!("mov {0}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

fn deliver_segv(frame: &TrapFrame) -> bool {
    if frame.cs & 3 != 3 {
        return false;
    }
    match process::current_pcb() {
        Some(pcb) => {
            pcb.signal.lock().raise(SIGSEGV);
            true
        }
        None => false,
    }
}

fn page_fault_handler(frame: &mut TrapFrame) {
    let fault_addr = read_cr2();

    if let Some(pcb) = process::current_pcb() {
        if pcb.with_mm(|mm| mm.try_grow_stack(fault_addr)) {
            return;
        }
    }

    if let Some(fixup_eip) = uaccess::fixup_for_fault(frame.eip) {
        frame.eip = fixup_eip;
        return;
    }

    crate::log_warn!(
        "page fault addr={:#x} error_code={:#x} eip={:#x} cs={:#x}",
        fault_addr,
        frame.error_code,
        frame.eip,
        frame.cs
    );

    if !deliver_segv(frame) {
        panic!("unrecoverable page fault at {:#x} (addr {:#x})", frame.eip, fault_addr);
    }
}

fn general_protection_handler(frame: &mut TrapFrame) {
    crate::log_warn!(
        "general protection fault error_code={:#x} eip={:#x} cs={:#x}",
        frame.error_code,
        frame.eip,
        frame.cs
    );

    if !deliver_segv(frame) {
        panic!("unrecoverable general protection fault at {:#x}", frame.eip);
    }
}

pub fn init() {
    idt::register_handler(VECTOR_PAGE_FAULT, page_fault_handler);
    idt::register_handler(VECTOR_GENERAL_PROTECTION, general_protection_handler);
}
