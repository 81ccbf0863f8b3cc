//! The 256-entry IDT and the uniform ISR stub table (§4.9).
//!
//! Every vector — CPU exception, IRQ or `int 0x80` — funnels through the
//! same assembly stub shape into [`isr_common_handler`], which dispatches to
//! a handler registered for that vector or to a default unhandled-vector
//! handler.

use core::arch::{asm, global_asm};
use core::mem::size_of;
use lazy_static::lazy_static;

use crate::gdt::KERNEL_CODE_SEL;
use crate::sync::IrqSpinLock;

pub const VECTOR_DIVIDE_ERROR: u8 = 0;
pub const VECTOR_DEBUG: u8 = 1;
pub const VECTOR_NMI: u8 = 2;
pub const VECTOR_BREAKPOINT: u8 = 3;
pub const VECTOR_INVALID_OPCODE: u8 = 6;
pub const VECTOR_DOUBLE_FAULT: u8 = 8;
pub const VECTOR_GENERAL_PROTECTION: u8 = 13;
pub const VECTOR_PAGE_FAULT: u8 = 14;

pub const PIC1_OFFSET: u8 = 0x20;
pub const PIC2_OFFSET: u8 = 0x28;
pub const VECTOR_TIMER: u8 = PIC1_OFFSET;
pub const VECTOR_KEYBOARD: u8 = PIC1_OFFSET + 1;
pub const VECTOR_ATA_PRIMARY: u8 = PIC2_OFFSET + 6;

pub const VECTOR_SYSCALL: u8 = 0x80;

/// The full register + segment frame every stub builds before calling into
/// Rust. Field order matches the push sequence in `isr_common_stub` exactly:
/// `pushad` lands first (lowest addresses) because it executes last, then
/// the four segment pushes, then the vector/error-code pair, then whatever
/// the CPU itself pushed. Reordering fields here without updating the
/// assembly silently corrupts every handler.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

global_asm!(
    r#"
.altmacro

.macro isr_stub_noerr num
.global isr_stub_\num
isr_stub_\num:
    push 0
    push \num
    jmp isr_common_stub
.endm

.macro isr_stub_err num
.global isr_stub_\num
isr_stub_\num:
    push \num
    jmp isr_common_stub
.endm

.set i, 0
.rept 256
    .if i == 8 || i == 10 || i == 11 || i == 12 || i == 13 || i == 14 || i == 17
        isr_stub_err %i
    .else
        isr_stub_noerr %i
    .endif
.set i, i+1
.endr

.section .rodata
.align 4
.global isr_stub_table
isr_stub_table:
.set i, 0
.rept 256
    .long isr_stub_%i
.set i, i+1
.endr

.text
isr_common_stub:
    push ds
    push es
    push fs
    push gs
    pushad

    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push esp
    call isr_common_handler
    add esp, 4

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
    static isr_stub_table: [u32; 256];
}

fn stub_address(vector: usize) -> u32 {
    unsafe { isr_stub_table[vector] }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 }
    }

    fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

const INTERRUPT_GATE_RING0: u8 = 0x8E; // Present | DPL0 | 32-bit interrupt gate
const INTERRUPT_GATE_RING3: u8 = 0xEE; // Present | DPL3 | 32-bit interrupt gate

struct IdtTable {
    entries: [IdtEntry; 256],
}

lazy_static! {
    static ref IDT: IdtTable = {
        let mut entries = [IdtEntry::missing(); 256];
        for (vector, entry) in entries.iter_mut().enumerate() {
            let gate = if vector == VECTOR_SYSCALL as usize { INTERRUPT_GATE_RING3 } else { INTERRUPT_GATE_RING0 };
            *entry = IdtEntry::new(stub_address(vector), KERNEL_CODE_SEL, gate);
        }
        IdtTable { entries }
    };
}

pub type HandlerFn = fn(&mut TrapFrame);

static HANDLERS: IrqSpinLock<[Option<HandlerFn>; 256]> = IrqSpinLock::new([None; 256]);

/// Register the handler invoked for `vector`. Called once per vector during
/// subsystem init (PIT, keyboard, syscalls); never under contention.
pub fn register_handler(vector: u8, handler: HandlerFn) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

#[no_mangle]
extern "C" fn isr_common_handler(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };
    let vector = frame.vector as usize;
    let handler = HANDLERS.lock()[vector];
    match handler {
        Some(h) => h(frame),
        None => default_isr_handler(frame),
    }

    // This stub's `iretd` is the only place execution returns to ring 3, so
    // pending-signal delivery (§4.10) is checked right here rather than at
    // every individual handler.
    const RING3: u32 = 3;
    if frame.cs & RING3 == RING3 && crate::scheduler::scheduler_is_ready() {
        crate::process::deliver_pending_signals(frame);
    }
}

fn default_isr_handler(frame: &mut TrapFrame) {
    let vector = frame.vector;
    if (PIC1_OFFSET as u32..=PIC2_OFFSET as u32 + 7).contains(&vector) {
        super::pic::send_eoi(vector as u8);
        return;
    }
    crate::log_error!(
        "unhandled interrupt vector {} error_code={:#x} eip={:#x} cs={:#x}",
        vector,
        frame.error_code,
        frame.eip,
        frame.cs
    );
    panic!("unhandled interrupt vector {}", vector);
}

pub fn init() {
    let pointer = IdtPointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: &IDT.entries as *const _ as u32,
    };
    unsafe {
        asm!("lidt [{0}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
    }
}
