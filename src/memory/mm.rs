//! Per-process address-space model (§4.5): an ordered, disjoint set of
//! VMAs plus the PD they describe.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::memory::{frame_allocator, paging};
use crate::sync::IrqSpinLock;

bitflags! {
    /// Per-VMA permission/kind bits (§4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const VM_READ = 1 << 0;
        const VM_WRITE = 1 << 1;
        const VM_EXEC = 1 << 2;
        const VM_USER = 1 << 3;
        const VM_GROWS_DOWN = 1 << 4;
        const VM_ANON = 1 << 5;
    }
}

pub const USER_STACK_TOP: u32 = 0xC000_0000;
pub const USER_STACK_BOTTOM: u32 = 0xBF00_0000;
pub const KERNEL_SPACE_START: u32 = 0xC000_0000;

#[derive(Debug, Clone, Copy)]
pub struct Vma {
    pub start: u32,
    pub end: u32,
    pub flags: VmFlags,
}

impl Vma {
    pub fn contains(&self, va: u32) -> bool {
        va >= self.start && va < self.end
    }

    pub fn page_prot(&self) -> u32 {
        let mut prot = paging::PRESENT;
        if self.flags.contains(VmFlags::VM_WRITE) {
            prot |= paging::WRITABLE;
        }
        if self.flags.contains(VmFlags::VM_USER) {
            prot |= paging::USER;
        }
        if !self.flags.contains(VmFlags::VM_EXEC) && paging::nx_supported() {
            prot |= paging::NX;
        }
        prot
    }
}

pub struct MmStruct {
    pub pd_phys: u32,
    vmas: Vec<Vma>,
    pub start_brk: u32,
    pub end_brk: u32,
    pub code_start: u32,
    pub code_end: u32,
}

pub struct MmHandle(IrqSpinLock<MmStruct>);

impl MmHandle {
    pub fn lock(&self) -> crate::sync::IrqSpinLockGuard<'_, MmStruct> {
        self.0.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    Overlap,
    OutOfRange,
    OutOfMemory,
}

impl MmStruct {
    /// Every VMA's range must fall strictly below `KERNEL_SPACE_START` and
    /// must not overlap an existing one; the set stays ordered by `start`.
    pub fn insert_vma(&mut self, start: u32, end: u32, flags: VmFlags) -> Result<(), MmError> {
        if end <= start || end > KERNEL_SPACE_START {
            return Err(MmError::OutOfRange);
        }
        let pos = self.vmas.partition_point(|v| v.start < start);
        if pos > 0 && self.vmas[pos - 1].end > start {
            return Err(MmError::Overlap);
        }
        if pos < self.vmas.len() && self.vmas[pos].start < end {
            return Err(MmError::Overlap);
        }
        self.vmas.insert(pos, Vma { start, end, flags });
        Ok(())
    }

    pub fn find_vma(&self, va: u32) -> Option<&Vma> {
        let pos = self.vmas.partition_point(|v| v.end <= va);
        self.vmas.get(pos).filter(|v| v.contains(va))
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    /// A page fault below the live stack VMA, within `grows_down` slack,
    /// extends the VMA downward and maps one fresh page. Returns `false`
    /// if `va` isn't a legitimate stack-grow address.
    pub fn try_grow_stack(&mut self, va: u32) -> bool {
        let stack_idx = match self.vmas.iter().position(|v| v.flags.contains(VmFlags::VM_GROWS_DOWN)) {
            Some(i) => i,
            None => return false,
        };
        let stack = self.vmas[stack_idx];
        if va >= stack.start || va < USER_STACK_BOTTOM {
            return false;
        }
        let new_start = va & !(frame_allocator::FRAME_SIZE - 1);
        if let Some(prev) = stack_idx.checked_sub(1).and_then(|i| self.vmas.get(i)) {
            if new_start < prev.end {
                return false;
            }
        }
        let phys = match frame_allocator::alloc_frame() {
            Some(p) => p,
            None => return false,
        };
        if paging::map_page(paging::current_pd_phys(), new_start, phys, stack.page_prot()).is_err() {
            frame_allocator::free_frame(phys);
            return false;
        }
        self.vmas[stack_idx].start = new_start;
        true
    }
}

/// Build a fresh address space: new PD (kernel PDEs shared, recursive
/// self-map installed), no VMAs yet.
pub fn create_mm() -> Option<MmHandle> {
    let pd_phys = paging::clone_directory(paging::current_pd_phys())?;
    Some(MmHandle(IrqSpinLock::new(MmStruct {
        pd_phys,
        vmas: Vec::new(),
        start_brk: 0,
        end_brk: 0,
        code_start: 0,
        code_end: 0,
    })))
}

/// Clone every VMA (not their contents — callers copy page contents
/// separately per fork's anonymous-copy semantics) into a new address
/// space sharing the same PD layout conventions.
pub fn fork_mm(src: &MmStruct) -> Option<MmHandle> {
    let pd_phys = paging::clone_directory(paging::current_pd_phys())?;
    Some(MmHandle(IrqSpinLock::new(MmStruct {
        pd_phys,
        vmas: src.vmas.clone(),
        start_brk: src.start_brk,
        end_brk: src.end_brk,
        code_start: src.code_start,
        code_end: src.code_end,
    })))
}

/// Free every user VMA's backing pages, the user half of the PD, and the
/// PD frame itself.
pub fn destroy_mm(mm: MmHandle) {
    let pd_phys = {
        let guard = mm.lock();
        guard.pd_phys
    };
    paging::free_user_space(pd_phys);
    frame_allocator::free_frame(pd_phys);
}
