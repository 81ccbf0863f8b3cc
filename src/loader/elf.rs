//! ELF32 loader (§4.8 Create/Execve): parses a 32-bit x86 executable and
//! maps it into a brand new address space. Builds the whole image before
//! handing anything back, so a malformed binary never disturbs a caller's
//! existing process.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::fs::error::FsError;
use crate::fs::VFS;
use crate::memory::mm::{self, MmHandle, VmFlags};
use crate::memory::{frame_allocator, paging};
use crate::process::signal::{SIG_TRAMPOLINE_VA, TRAMPOLINE_CODE};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;

const PAGE_SIZE: u32 = 4096;
const USER_STACK_INITIAL_PAGES: u32 = 4;

struct Elf32Ehdr {
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf32Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 52 {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS32 || data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_386 {
            return Err(ExecError::UnsupportedArch);
        }

        Ok(Elf32Ehdr {
            e_entry: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            e_phoff: u32::from_le_bytes(data[28..32].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[42], data[43]]),
            e_phnum: u16::from_le_bytes([data[44], data[45]]),
        })
    }
}

struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

impl Elf32Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 32 {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf32Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_offset: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_vaddr: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            p_filesz: u32::from_le_bytes(data[16..20].try_into().unwrap()),
            p_memsz: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[24..28].try_into().unwrap()),
        })
    }
}

#[derive(Debug)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    MemoryError,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "File not found"),
            ExecError::InvalidFormat => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::MemoryError => write!(f, "Memory allocation error"),
            ExecError::ReadError => write!(f, "File read error"),
        }
    }
}

impl From<ExecError> for FsError {
    fn from(e: ExecError) -> FsError {
        match e {
            ExecError::FileNotFound => FsError::NotFound,
            ExecError::ReadError => FsError::Io,
            ExecError::MemoryError => FsError::NoMem,
            ExecError::InvalidFormat | ExecError::UnsupportedArch | ExecError::UnsupportedType => FsError::Invalid,
        }
    }
}

fn read_file_all(path: &str) -> Result<Vec<u8>, ExecError> {
    let vfs = VFS.lock();
    let inode = vfs.lookup(path).map_err(|_| ExecError::FileNotFound)?;
    if inode.size == 0 {
        return Err(ExecError::InvalidFormat);
    }
    let mut buf = vec![0u8; inode.size];
    let bytes_read = vfs.read_file(path, 0, &mut buf).map_err(|_| ExecError::ReadError)?;
    buf.truncate(bytes_read);
    Ok(buf)
}

fn segment_flags(p_flags: u32) -> VmFlags {
    let mut flags = VmFlags::VM_READ | VmFlags::VM_USER;
    if p_flags & PF_W != 0 {
        flags |= VmFlags::VM_WRITE;
    }
    if p_flags & PF_X != 0 {
        flags |= VmFlags::VM_EXEC;
    }
    flags
}

/// Zero-fill `[fill_start, fill_end)` and copy `data` starting at
/// `seg_start`, one fresh frame at a time, mapping each into the directory
/// that must already be the active one.
fn map_and_fill_segment(pd_phys: u32, seg_start: u32, seg_end: u32, flags: VmFlags, file_bytes: &[u8], file_offset_in_seg: u32) -> Result<(), ExecError> {
    let page_start = seg_start & !(PAGE_SIZE - 1);
    let page_end = (seg_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    // Mapped writable regardless of the segment's final VMA flags so the
    // loader itself can populate it; nothing re-tightens it afterward, which
    // is a known looseness (no W^X enforcement on the initial image).
    let prot = page_prot_for(flags | VmFlags::VM_WRITE);

    let mut va = page_start;
    while va < page_end {
        let phys = frame_allocator::alloc_frame().ok_or(ExecError::MemoryError)?;
        paging::map_page(pd_phys, va, phys, prot).map_err(|_| ExecError::MemoryError)?;
        unsafe { core::ptr::write_bytes(va as *mut u8, 0, PAGE_SIZE as usize) };
        va += PAGE_SIZE;
    }

    if !file_bytes.is_empty() {
        let dest = seg_start as *mut u8;
        unsafe { core::ptr::copy_nonoverlapping(file_bytes.as_ptr(), dest, file_bytes.len()) };
    }
    let _ = file_offset_in_seg;
    Ok(())
}

fn page_prot_for(vm_flags: VmFlags) -> u32 {
    let mut prot = paging::PRESENT;
    if vm_flags.contains(VmFlags::VM_WRITE) {
        prot |= paging::WRITABLE;
    }
    if vm_flags.contains(VmFlags::VM_USER) {
        prot |= paging::USER;
    }
    if !vm_flags.contains(VmFlags::VM_EXEC) && paging::nx_supported() {
        prot |= paging::NX;
    }
    prot
}

/// Build a brand new address space for `path`: a fresh PD, every `PT_LOAD`
/// segment mapped and populated, one initial stack page, and the signal
/// return trampoline page every process needs (§4.10). Returns the handle,
/// entry point and initial user stack pointer — none of it touches the
/// caller's own address space or task state.
pub fn create_user_address_space(path: &str) -> Result<(MmHandle, u32, u32), FsError> {
    let file_data = read_file_all(path)?;
    let ehdr = Elf32Ehdr::parse(&file_data)?;

    let mm_handle = mm::create_mm().ok_or(FsError::NoMem)?;
    let pd_phys = mm_handle.lock().pd_phys;
    let prev_pd = paging::current_pd_phys();

    let result = (|| -> Result<(u32, u32), ExecError> {
        paging::switch_directory(pd_phys);

        let mut load_start: u32 = u32::MAX;
        let mut load_end: u32 = 0;

        for i in 0..ehdr.e_phnum as usize {
            let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
            let phdr = Elf32Phdr::parse(&file_data[off..])?;
            if phdr.p_type != PT_LOAD {
                continue;
            }

            let seg_start = phdr.p_vaddr;
            let seg_end = phdr.p_vaddr + phdr.p_memsz;
            let flags = segment_flags(phdr.p_flags);

            let file_slice = if phdr.p_filesz > 0 {
                let start = phdr.p_offset as usize;
                let end = start + phdr.p_filesz as usize;
                file_data.get(start..end).ok_or(ExecError::InvalidFormat)?
            } else {
                &[][..]
            };

            map_and_fill_segment(pd_phys, seg_start, seg_end, flags, file_slice, 0)?;
            mm_handle.lock().insert_vma(seg_start & !(PAGE_SIZE - 1), (seg_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1), flags).map_err(|_| ExecError::MemoryError)?;

            if seg_start < load_start {
                load_start = seg_start;
            }
            if seg_end > load_end {
                load_end = seg_end;
            }
        }

        if load_start == u32::MAX {
            return Err(ExecError::InvalidFormat);
        }

        let brk_start = (load_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        {
            let mut mm = mm_handle.lock();
            mm.code_start = load_start;
            mm.code_end = load_end;
            mm.start_brk = brk_start;
            mm.end_brk = brk_start;
        }

        let stack_flags = VmFlags::VM_READ | VmFlags::VM_WRITE | VmFlags::VM_USER | VmFlags::VM_GROWS_DOWN | VmFlags::VM_ANON;
        let stack_bottom = mm::USER_STACK_TOP - USER_STACK_INITIAL_PAGES * PAGE_SIZE;
        map_and_fill_segment(pd_phys, stack_bottom, mm::USER_STACK_TOP, stack_flags, &[], 0)?;
        mm_handle.lock().insert_vma(stack_bottom, mm::USER_STACK_TOP, stack_flags).map_err(|_| ExecError::MemoryError)?;

        let trampoline_flags = VmFlags::VM_READ | VmFlags::VM_EXEC | VmFlags::VM_USER;
        map_and_fill_segment(pd_phys, SIG_TRAMPOLINE_VA, SIG_TRAMPOLINE_VA + PAGE_SIZE, trampoline_flags, &TRAMPOLINE_CODE, 0)?;
        mm_handle.lock().insert_vma(SIG_TRAMPOLINE_VA, SIG_TRAMPOLINE_VA + PAGE_SIZE, trampoline_flags).map_err(|_| ExecError::MemoryError)?;

        Ok((ehdr.e_entry, mm::USER_STACK_TOP))
    })();

    paging::switch_directory(prev_pd);

    let (entry, user_stack_top) = result?;
    crate::log_info!("loader: mapped '{}' entry={:#x} stack_top={:#x}", path, entry, user_stack_top);
    Ok((mm_handle, entry, user_stack_top))
}

pub fn extract_filename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).into()
}
