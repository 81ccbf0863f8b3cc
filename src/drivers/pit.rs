//! 8253/8254 PIT driven at ~1 kHz, the kernel's only tick source (§4.7): each
//! IRQ0 advances the scheduler's clock and asks it whether the running task's
//! slice has run out.

use crate::interrupts::idt::{self, TrapFrame, VECTOR_TIMER};
use crate::sync::Port;

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
const TARGET_HZ: u32 = 1000;
const CHANNEL0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;
const MODE3_SQUARE_WAVE: u8 = 0x36;

fn timer_irq_handler(_frame: &mut TrapFrame) {
    let reschedule = crate::scheduler::scheduler_tick();
    super::super::interrupts::pic::send_eoi(VECTOR_TIMER);
    if reschedule {
        crate::scheduler::yield_now();
    }
}

pub fn init() {
    let divisor = (PIT_FREQUENCY_HZ / TARGET_HZ) as u16;

    let command: Port<u8> = Port::new(COMMAND);
    let channel0: Port<u8> = Port::new(CHANNEL0_DATA);
    command.write(MODE3_SQUARE_WAVE);
    channel0.write((divisor & 0xFF) as u8);
    channel0.write((divisor >> 8) as u8);

    idt::register_handler(VECTOR_TIMER, timer_irq_handler);
    crate::log_info!("pit: {} Hz tick armed on IRQ0", TARGET_HZ);
}
