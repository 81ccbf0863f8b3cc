//! Sixteen fixed virtual slots for touching arbitrary physical frames
//! (§4.3) — a critical, non-reentrant resource. The backing page table is
//! installed once during `paging::bootstrap` and is part of the shared
//! kernel PDE range, so every process sees the same slots.

use crate::memory::paging;
use crate::sync::IrqSpinLock;

pub const TEMP_MAP_BASE: u32 = 0xFE00_0000;
pub const NUM_SLOTS: usize = 16;
const FRAME_SIZE: u32 = 4096;

struct SlotBitmap(u16);

static SLOTS: IrqSpinLock<SlotBitmap> = IrqSpinLock::new(SlotBitmap(0));

fn slot_va(slot: usize) -> u32 {
    TEMP_MAP_BASE + (slot as u32) * FRAME_SIZE
}

/// Map `phys` into a free slot and return its virtual address, or `None`
/// if every slot is in use. Callers must `temp_unmap` before asking for
/// another mapping — nested use of this arena is forbidden (§4.3).
pub fn temp_map(phys: u32) -> Option<u32> {
    let mut slots = SLOTS.lock();
    let free = (0..NUM_SLOTS).find(|&i| slots.0 & (1 << i) == 0)?;
    slots.0 |= 1 << free;
    drop(slots);

    let va = slot_va(free);
    paging::write_temp_pte(va, phys | paging::PRESENT | paging::WRITABLE);
    Some(va)
}

pub fn temp_unmap(va: u32) {
    assert!((TEMP_MAP_BASE..TEMP_MAP_BASE + NUM_SLOTS as u32 * FRAME_SIZE).contains(&va), "temp_unmap: not a temp slot");
    let slot = ((va - TEMP_MAP_BASE) / FRAME_SIZE) as usize;
    paging::write_temp_pte(va, 0);
    SLOTS.lock().0 &= !(1 << slot);
}
