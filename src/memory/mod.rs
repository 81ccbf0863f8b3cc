//! Memory subsystem bring-up, in the order §6's boot contract requires:
//! parse the Multiboot2 tags, switch to a fine-grained kernel page
//! directory, bring up the frame allocator over what's left, then the heap.

pub mod frame_allocator;
pub mod heap;
pub mod mm;
pub mod paging;
pub mod tempmap;
pub mod uaccess;

use multiboot2::BootInformation;

use crate::boot::KERNEL_VMA;

extern "C" {
    static kernel_phys_start: u8;
    static kernel_phys_end: u8;
}

/// `mb_info_phys` is the physical pointer the bootloader left in EBX,
/// still reachable via the boot trampoline's identity mapping at this
/// point in `kernel_main`.
pub fn init(mb_info_phys: u32) {
    let boot_info = unsafe {
        BootInformation::load(mb_info_phys as *const _).expect("multiboot2: failed to parse boot information")
    };

    let phys_start = unsafe { &kernel_phys_start as *const u8 as u32 };
    let phys_end = unsafe { &kernel_phys_end as *const u8 as u32 };

    let bootstrap = paging::bootstrap(phys_start, phys_end);
    paging::detect_and_enable_nx();

    let mb_info_end = mb_info_phys + boot_info.total_size() as u32;
    frame_allocator::init(
        &boot_info,
        &frame_allocator::ReservedRanges {
            kernel_phys_start: phys_start,
            kernel_phys_end: bootstrap.reserved_end,
            multiboot_info_start: mb_info_phys,
            multiboot_info_end: mb_info_end,
        },
    );

    heap::init_heap();

    crate::log_info!(
        "memory: {} frames free of {} total ({} MiB usable), kernel PD at {:#x}",
        frame_allocator::FRAME_ALLOCATOR.lock().free_frames(),
        frame_allocator::FRAME_ALLOCATOR.lock().total_frames(),
        (frame_allocator::FRAME_ALLOCATOR.lock().free_frames() as u64 * frame_allocator::FRAME_SIZE as u64) / (1024 * 1024),
        bootstrap.pd_phys,
    );
    debug_assert!(KERNEL_VMA == 0xC000_0000);
}
