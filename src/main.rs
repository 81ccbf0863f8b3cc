#![no_std]
#![no_main]

// The real entry point is `multiboot_entry`, the assembly symbol
// `boot.rs` emits and `linker.ld`'s `ENTRY()` points at directly; this
// crate only exists to link the kernel library into a final image.
use coal_os as _;
