//! The five-descriptor GDT and the single TSS used for ring3→ring0 stack
//! switches (§6). Replaces the assembly boot GDT once the kernel heap and
//! statics are available.

use core::arch::asm;
use core::mem::size_of;
use lazy_static::lazy_static;

use crate::sync::IrqSpinLock;

pub const KERNEL_CODE_SEL: u16 = 0x08;
pub const KERNEL_DATA_SEL: u16 = 0x10;
pub const USER_CODE_SEL: u16 = 0x1B; // index 3, RPL 3
pub const USER_DATA_SEL: u16 = 0x23; // index 4, RPL 3
pub const TSS_SEL: u16 = 0x28;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry { limit_low: 0, base_low: 0, base_mid: 0, access: 0, granularity: 0, base_high: 0 }
    }

    const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (((limit >> 16) & 0x0F) as u8) | (flags << 4),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// 32-bit TSS (Intel SDM Vol 3, Figure 8-4). Only `ss0`/`esp0` are ever
/// mutated after boot — every ring3→ring0 transition reads them to find the
/// current task's kernel stack.
#[repr(C, packed)]
pub struct Tss {
    prev_task: u16,
    _res0: u16,
    pub esp0: u32,
    pub ss0: u16,
    _res1: u16,
    esp1: u32,
    ss1: u16,
    _res2: u16,
    esp2: u32,
    ss2: u16,
    _res3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _res4: u16,
    cs: u16,
    _res5: u16,
    ss: u16,
    _res6: u16,
    ds: u16,
    _res7: u16,
    fs: u16,
    _res8: u16,
    gs: u16,
    _res9: u16,
    ldt: u16,
    _res10: u16,
    trap: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Tss {
            prev_task: 0,
            _res0: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SEL,
            _res1: 0,
            esp1: 0,
            ss1: 0,
            _res2: 0,
            esp2: 0,
            ss2: 0,
            _res3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _res4: 0,
            cs: 0,
            _res5: 0,
            ss: 0,
            _res6: 0,
            ds: 0,
            _res7: 0,
            fs: 0,
            _res8: 0,
            gs: 0,
            _res9: 0,
            ldt: 0,
            _res10: 0,
            trap: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }
}

struct GdtTable {
    entries: [GdtEntry; 6],
}

lazy_static! {
    static ref TSS: IrqSpinLock<Tss> = IrqSpinLock::new(Tss::new());
}

lazy_static! {
    static ref GDT: GdtTable = {
        // Access byte layout: Present(1) DPL(2) S(1) Type(4).
        const CODE_RING0: u8 = 0b1001_1010;
        const DATA_RING0: u8 = 0b1001_0010;
        const CODE_RING3: u8 = 0b1111_1010;
        const DATA_RING3: u8 = 0b1111_0010;
        const TSS_ACCESS: u8 = 0b1000_1001;
        const FLAGS_4K_32BIT: u8 = 0b1100;
        const FLAGS_TSS: u8 = 0b0000;

        let tss_addr = &*TSS.lock() as *const Tss as u32;
        let tss_limit = size_of::<Tss>() as u32 - 1;

        GdtTable {
            entries: [
                GdtEntry::null(),
                GdtEntry::new(0, 0xFFFFF, CODE_RING0, FLAGS_4K_32BIT),
                GdtEntry::new(0, 0xFFFFF, DATA_RING0, FLAGS_4K_32BIT),
                GdtEntry::new(0, 0xFFFFF, CODE_RING3, FLAGS_4K_32BIT),
                GdtEntry::new(0, 0xFFFFF, DATA_RING3, FLAGS_4K_32BIT),
                GdtEntry::new(tss_addr, tss_limit, TSS_ACCESS, FLAGS_TSS),
            ],
        }
    };
}

pub fn init() {
    let pointer = GdtPointer {
        limit: (size_of::<[GdtEntry; 6]>() - 1) as u16,
        base: &GDT.entries as *const _ as u32,
    };

    unsafe {
        asm!(
            "lgdt [{0}]",
            in(reg) &pointer,
            options(readonly, nostack, preserves_flags)
        );
        asm!(
            "mov ax, {sel}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push {code_sel}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            sel = const KERNEL_DATA_SEL,
            code_sel = const KERNEL_CODE_SEL as u32,
            out("eax") _,
            options(nostack),
        );
        asm!("ltr {0:x}", in(reg) TSS_SEL, options(nostack, preserves_flags));
    }
}

/// Update TSS.esp0 so the next ring3→ring0 transition lands on `kernel_stack_top`.
pub fn set_kernel_stack(kernel_stack_top: u32) {
    TSS.lock().esp0 = kernel_stack_top;
}
