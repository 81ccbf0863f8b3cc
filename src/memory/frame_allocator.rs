//! Physical frame allocator (§4.1). Owns every 4 KiB frame; each is in
//! exactly one of `{free, allocated, permanently-reserved}`.
//!
//! The bitmap itself lives in `.bss`, sized to cover the full 32-bit
//! physical address space (2^20 frames / 8 = 128 KiB), so there is no
//! chicken-and-egg problem bringing the allocator up before the heap
//! exists — the source's separate "bounded bump tracker" stage is folded
//! into this one structure, since a statically sized bitmap needs no
//! storage allocation of its own.

use bit_field::BitField;
use multiboot2::{BootInformation, MemoryAreaType};

use crate::sync::IrqSpinLock;

pub const FRAME_SIZE: u32 = 4096;
const MAX_FRAMES: usize = (4u64 * 1024 * 1024 * 1024 / FRAME_SIZE as u64) as usize;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

pub struct BitmapFrameAllocator {
    // 1 = allocated or reserved, 0 = free.
    bitmap: [u64; BITMAP_WORDS],
    total_frames: usize,
    free_frames: usize,
}

impl BitmapFrameAllocator {
    const fn new() -> Self {
        BitmapFrameAllocator { bitmap: [u64::MAX; BITMAP_WORDS], total_frames: 0, free_frames: 0 }
    }

    fn set_bit(&mut self, frame: usize, value: bool) {
        let word = frame / 64;
        let bit = frame % 64;
        self.bitmap[word].set_bit(bit, value);
    }

    fn get_bit(&self, frame: usize) -> bool {
        let word = frame / 64;
        let bit = frame % 64;
        self.bitmap[word].get_bit(bit)
    }

    /// Mark `[start, end)` (physical, page-aligned) as available for
    /// allocation. Called once per Multiboot2 "available" region, then
    /// again (in reverse, marking reserved) for the kernel image, the
    /// multiboot info blob and anything below 1 MiB.
    fn mark_available(&mut self, start: u32, end: u32) {
        let first = start / FRAME_SIZE;
        let last = end / FRAME_SIZE;
        for frame in first..last {
            if (frame as usize) < MAX_FRAMES && self.get_bit(frame as usize) {
                self.set_bit(frame as usize, false);
                self.total_frames += 1;
                self.free_frames += 1;
            }
        }
    }

    fn mark_reserved(&mut self, start: u32, end: u32) {
        let first = start / FRAME_SIZE;
        let last = (end + FRAME_SIZE - 1) / FRAME_SIZE;
        for frame in first..last {
            if (frame as usize) < MAX_FRAMES && !self.get_bit(frame as usize) {
                self.set_bit(frame as usize, true);
                self.free_frames -= 1;
            }
        }
    }

    pub fn alloc_frame(&mut self) -> Option<u32> {
        for word in 0..BITMAP_WORDS {
            if self.bitmap[word] != u64::MAX {
                let bit = self.bitmap[word].trailing_ones() as usize;
                let frame = word * 64 + bit;
                if frame >= MAX_FRAMES {
                    return None;
                }
                self.set_bit(frame, true);
                self.free_frames -= 1;
                return Some(frame as u32 * FRAME_SIZE);
            }
        }
        None
    }

    /// # Panics
    /// If `phys` was not handed out by `alloc_frame` (double-free or
    /// freeing a never-owned frame is a hard logic error per §4.1).
    pub fn free_frame(&mut self, phys: u32) {
        let frame = (phys / FRAME_SIZE) as usize;
        assert!(frame < MAX_FRAMES && self.get_bit(frame), "free_frame: frame {:#x} not allocated", phys);
        self.set_bit(frame, false);
        self.free_frames += 1;
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }
}

pub static FRAME_ALLOCATOR: IrqSpinLock<BitmapFrameAllocator> = IrqSpinLock::new(BitmapFrameAllocator::new());

/// Ranges never handed out regardless of what the memory map says.
pub struct ReservedRanges {
    pub kernel_phys_start: u32,
    pub kernel_phys_end: u32,
    pub multiboot_info_start: u32,
    pub multiboot_info_end: u32,
}

pub fn init(boot_info: &BootInformation, reserved: &ReservedRanges) {
    let mut allocator = FRAME_ALLOCATOR.lock();
    let mmap = boot_info.memory_map_tag().expect("multiboot2: memory map tag required");
    for area in mmap.memory_areas() {
        if area.typ() == MemoryAreaType::Available {
            let start = area.start_address().max(0x10_0000) as u32; // skip anything below 1 MiB
            let end = area.end_address() as u32;
            if end > start {
                allocator.mark_available(start, end);
            }
        }
    }
    allocator.mark_reserved(reserved.kernel_phys_start, reserved.kernel_phys_end);
    allocator.mark_reserved(reserved.multiboot_info_start, reserved.multiboot_info_end);
}

pub fn alloc_frame() -> Option<u32> {
    FRAME_ALLOCATOR.lock().alloc_frame()
}

pub fn free_frame(phys: u32) {
    FRAME_ALLOCATOR.lock().free_frame(phys);
}
