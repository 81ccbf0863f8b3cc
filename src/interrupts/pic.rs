//! Dual 8259 PIC remap (master at 0x20, slave at 0x28) so hardware IRQs land
//! outside the CPU exception range. Thin wrapper over the `pic8259` crate,
//! matching the teacher's original choice of crate for this piece.

use pic8259::ChainedPics;

use crate::sync::IrqSpinLock;

use super::idt::{PIC1_OFFSET, PIC2_OFFSET};

static PICS: IrqSpinLock<ChainedPics> =
    IrqSpinLock::new(unsafe { ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET) });

pub fn init() {
    unsafe { PICS.lock().initialize() };
}

/// Send end-of-interrupt for `vector`. Safe to call from any IRQ handler;
/// the `pic8259` crate figures out master-vs-slave itself.
pub fn send_eoi(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}

pub fn set_masks(master_mask: u8, slave_mask: u8) {
    unsafe { PICS.lock().write_masks(master_mask, slave_mask) };
}
