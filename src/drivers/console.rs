//! Byte-oriented console device backing fd 0/1/2 (§6): a line discipline on
//! top of the keyboard's `KeyCode` stream, echoing to both VGA and serial the
//! way the rest of the kernel's logging already does.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::drivers::keyboard::{self, scancodes::KeyCode};
use crate::interrupts::idt::{self, TrapFrame, VECTOR_KEYBOARD};
use crate::process::Pid;
use crate::sync::{IrqSpinLock, Port};
use crate::{print, println};

static PENDING_LINE: IrqSpinLock<Vec<u8>> = IrqSpinLock::new(Vec::new());
static READY_LINES: IrqSpinLock<VecDeque<u8>> = IrqSpinLock::new(VecDeque::new());
static WAITERS: IrqSpinLock<Vec<Pid>> = IrqSpinLock::new(Vec::new());

fn keyboard_irq_handler(_frame: &mut TrapFrame) {
    let scancode_port: Port<u8> = Port::new(0x60);
    let scancode = scancode_port.read();
    keyboard::push_scancode(scancode);

    while let Some(key) = keyboard::try_read_char() {
        handle_key(key);
    }

    super::super::interrupts::pic::send_eoi(VECTOR_KEYBOARD);
}

fn handle_key(key: KeyCode) {
    match key {
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            PENDING_LINE.lock().extend_from_slice(s.as_bytes());
            print!("{}", c);
        }
        KeyCode::Space => {
            PENDING_LINE.lock().push(b' ');
            print!(" ");
        }
        KeyCode::Backspace => {
            if PENDING_LINE.lock().pop().is_some() {
                crate::vga::WRITER.lock().backspace();
            }
        }
        KeyCode::Enter => {
            println!();
            let mut line = PENDING_LINE.lock();
            let mut ready = READY_LINES.lock();
            ready.extend(line.drain(..));
            ready.push_back(b'\n');
            drop(ready);
            drop(line);
            wake_waiters();
        }
        KeyCode::ArrowUp | KeyCode::ArrowDown | KeyCode::ArrowLeft | KeyCode::ArrowRight | KeyCode::F(_) | KeyCode::Unknown => {}
    }
}

fn wake_waiters() {
    let waiters: Vec<Pid> = core::mem::take(&mut *WAITERS.lock());
    for pid in waiters {
        crate::scheduler::unblock(pid);
    }
}

/// Block until at least one completed line (keyboard "Enter") is available,
/// then drain up to `buf.len()` bytes of it into `buf`. Mirrors a tty in
/// canonical mode: `read()` never returns partial keystrokes, only whole
/// lines, per §6's console contract.
pub fn read_line_blocking(buf: &mut [u8]) -> usize {
    loop {
        {
            let mut ready = READY_LINES.lock();
            if !ready.is_empty() {
                let n = buf.len().min(ready.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = ready.pop_front().unwrap();
                }
                return n;
            }
        }
        WAITERS.lock().push(crate::scheduler::current_pid());
        crate::scheduler::block_current();
    }
}

/// Write `buf` to the console: both sinks, matching VGA/serial's existing
/// dual-output logging convention.
pub fn write_bytes(buf: &[u8]) -> usize {
    for &byte in buf {
        crate::vga::WRITER.lock().write_string(core::str::from_utf8(core::slice::from_ref(&byte)).unwrap_or("?"));
        crate::serial::SERIAL1.lock().send(byte);
    }
    buf.len()
}

pub fn init() {
    idt::register_handler(VECTOR_KEYBOARD, keyboard_irq_handler);
    crate::log_info!("console: line discipline armed on IRQ1");
}
