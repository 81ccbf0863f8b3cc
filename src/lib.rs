#![no_std]

extern crate alloc;

pub mod sync;
pub mod vga;
pub mod serial;
pub mod gdt;
pub mod boot;
pub mod interrupts;
pub mod memory;
pub mod scheduler;
pub mod process;
pub mod fs;
pub mod loader;
pub mod syscalls;
pub mod drivers;

use core::panic::PanicInfo;

/// Path the boot sequence hands to `process::create_process` once every
/// subsystem is up (§2 "Boot sequencing"). Producing the binary this path
/// resolves to is out of scope here — the same boundary that keeps the ELF
/// loader body and userland libc as external collaborators.
const INIT_PROCESS_PATH: &str = "/bin/init";

const IDLE_STACK_SIZE: usize = 16 * 1024;

#[repr(align(16))]
struct IdleStack([u8; IDLE_STACK_SIZE]);

static mut IDLE_STACK: IdleStack = IdleStack([0; IDLE_STACK_SIZE]);

/// Entry point called from `boot::rust_multiboot_main` once paging and a
/// temporary flat GDT are live. Brings every subsystem up in the dependency
/// order §2's boot sequencing table implies: logging sinks first, then the
/// interrupt plumbing and real page tables, then the VFS and process layer,
/// and only then the scheduler and drivers that assume all of the above
/// already exist.
#[no_mangle]
pub extern "C" fn kernel_main(mb_info_phys: u32) -> ! {
    vga::init();
    serial::init();
    log_info!("Coal OS kernel started.");

    interrupts::init();
    memory::init(mb_info_phys);
    fs::init();
    process::init();

    let idle_stack_top = unsafe {
        core::ptr::addr_of!(IDLE_STACK.0) as u32 + IDLE_STACK_SIZE as u32
    };
    scheduler::init(idle_stack_top);

    syscalls::init();
    drivers::init();

    match process::create_process(INIT_PROCESS_PATH, 0) {
        Ok(pid) => log_info!("init process launched as pid {}", pid),
        Err(e) => log_warn!("no init process at '{}': {} (idling with no user tasks)", INIT_PROCESS_PATH, e),
    }

    unsafe { core::arch::asm!("sti") };

    loop {
        process::reap_abandoned_zombies();
        unsafe { core::arch::asm!("hlt") };
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log_error!("{}", info);
    loop {
        unsafe { core::arch::asm!("cli", "hlt") };
    }
}
