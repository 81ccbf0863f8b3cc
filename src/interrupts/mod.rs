//! Exceptions, IRQs and the `int 0x80` syscall gate, all dispatched through
//! one uniform stub (§4.9).

pub mod exceptions;
pub mod idt;
pub mod pic;
pub mod usermode;

pub use idt::{register_handler, HandlerFn, TrapFrame};

/// Only IRQ0 (PIT), IRQ1 (keyboard), IRQ2 (cascade) and IRQ14 (ATA primary)
/// are unmasked at boot; everything else stays masked until a driver claims
/// it. Bit clear = enabled.
const INITIAL_MASTER_MASK: u8 = 0b1111_1000;
const INITIAL_SLAVE_MASK: u8 = 0b1011_1111;

pub fn init() {
    crate::gdt::init();
    idt::init();
    exceptions::init();
    pic::init();
    pic::set_masks(INITIAL_MASTER_MASK, INITIAL_SLAVE_MASK);
}
