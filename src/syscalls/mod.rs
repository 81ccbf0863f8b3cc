//! The `int 0x80` syscall gate (§6): one dispatch table keyed by the
//! Linux-compatible syscall number in `eax`, replacing the Coal-native
//! numbering and the old per-subsystem handlers this module used to carry.
//! Every handler here works in terms of `FsError`/`FsResult`; this is the one
//! place that collapses that sum type down to a signed `-errno` written back
//! into `eax` (§7/§9).

use alloc::sync::Arc;
use alloc::vec;

use crate::fs::error::{FsError, FsResult};
use crate::fs::fd::{new_regular, FileKind, OpenFile};
use crate::fs::VFS;
use crate::interrupts::idt::{self, TrapFrame, VECTOR_SYSCALL};
use crate::memory::mm::VmFlags;
use crate::memory::uaccess;
use crate::process::{self, signal::SigAction, Pid};
use crate::sync::IrqSpinLock;

const SYS_EXIT: u32 = 1;
const SYS_FORK: u32 = 2;
const SYS_READ: u32 = 3;
const SYS_WRITE: u32 = 4;
const SYS_OPEN: u32 = 5;
const SYS_CLOSE: u32 = 6;
const SYS_WAITPID: u32 = 7;
const SYS_UNLINK: u32 = 10;
const SYS_EXECVE: u32 = 11;
const SYS_CHDIR: u32 = 12;
const SYS_LSEEK: u32 = 19;
const SYS_GETPID: u32 = 20;
const SYS_KILL: u32 = 37;
const SYS_MKDIR: u32 = 39;
const SYS_RMDIR: u32 = 40;
const SYS_PIPE: u32 = 42;
const SYS_BRK: u32 = 45;
const SYS_SIGNAL: u32 = 48;
const SYS_SETPGID: u32 = 57;
const SYS_DUP2: u32 = 63;
const SYS_GETPPID: u32 = 64;
const SYS_SETSID: u32 = 66;
const SYS_MMAP: u32 = 90;
const SYS_STAT: u32 = 106;
/// Not part of the explicit table; supplements it the way Linux/i386 does —
/// the signal trampoline (`process::signal::TRAMPOLINE_CODE`) traps here
/// with this exact number after a handler returns. See DESIGN.md.
const SYS_SIGRETURN: u32 = 119;
const SYS_GETDENTS: u32 = 141;
const SYS_GETCWD: u32 = 183;

const O_WRONLY: u32 = 0x1;
const O_RDWR: u32 = 0x2;
const O_CREAT: u32 = 0x100;
const O_TRUNC: u32 = 0x800;
const O_APPEND: u32 = 0x1000;

const SEEK_SET: u32 = 0;
const SEEK_CUR: u32 = 1;
const SEEK_END: u32 = 2;

const MAX_PATH: usize = 256;

pub fn init() {
    idt::register_handler(VECTOR_SYSCALL, syscall_handler);
    crate::log_info!("syscalls: dispatch table installed on vector {:#x}", VECTOR_SYSCALL);
}

fn syscall_handler(frame: &mut TrapFrame) {
    let nr = frame.eax;
    let result = dispatch(nr, frame);
    frame.eax = result as u32;
}

/// Dispatches and returns the raw value to place in `eax`: non-negative on
/// success, `-errno` on failure, matching every syscall's documented return
/// convention (§6/§7).
fn dispatch(nr: u32, frame: &mut TrapFrame) -> i32 {
    match nr {
        SYS_EXIT => sys_exit(frame.ebx as i32),
        SYS_FORK => sys_fork(&*frame),
        SYS_READ => sys_read(frame.ebx, frame.ecx, frame.edx),
        SYS_WRITE => sys_write(frame.ebx, frame.ecx, frame.edx),
        SYS_OPEN => sys_open(frame.ebx, frame.ecx, frame.edx),
        SYS_CLOSE => sys_close(frame.ebx),
        SYS_WAITPID => sys_waitpid(frame.ebx as i32, frame.ecx, frame.edx),
        SYS_UNLINK => sys_unlink(frame.ebx),
        SYS_EXECVE => sys_execve(frame.ebx),
        SYS_CHDIR => sys_chdir(frame.ebx),
        SYS_LSEEK => sys_lseek(frame.ebx, frame.ecx as i32, frame.edx),
        SYS_GETPID => sys_getpid(),
        SYS_KILL => sys_kill(frame.ebx as Pid, frame.ecx),
        SYS_MKDIR => sys_mkdir(frame.ebx),
        SYS_RMDIR => sys_rmdir(frame.ebx),
        SYS_PIPE => sys_pipe(frame.ebx),
        SYS_BRK => sys_brk(frame.ebx),
        SYS_SIGNAL => sys_signal(frame.ebx, frame.ecx),
        SYS_SETPGID => sys_setpgid(frame.ebx as Pid, frame.ecx as Pid),
        SYS_DUP2 => sys_dup2(frame.ebx, frame.ecx),
        SYS_GETPPID => sys_getppid(),
        SYS_SETSID => sys_setsid(),
        SYS_MMAP => sys_mmap(frame.ebx, frame.ecx, frame.edx),
        SYS_STAT => sys_stat(frame.ebx, frame.ecx),
        SYS_SIGRETURN => sys_sigreturn(frame),
        SYS_GETDENTS => sys_getdents(frame.ebx, frame.ecx, frame.edx),
        SYS_GETCWD => sys_getcwd(frame.ebx, frame.ecx),
        _ => FsError::NoSys.errno(),
    }
}

fn errno(e: FsError) -> i32 {
    e.errno()
}

fn read_path(uptr: u32) -> FsResult<alloc::string::String> {
    let pcb = process::current_pcb().ok_or(FsError::NotFound)?;
    let mut buf = [0u8; MAX_PATH];
    let len = pcb
        .with_mm(|mm| uaccess::copy_string_from_user(mm, &mut buf, uptr))
        .map_err(|_| FsError::Fault)?;
    core::str::from_utf8(&buf[..len]).map(alloc::string::String::from).map_err(|_| FsError::Invalid)
}

fn resolve(pcb: &process::Pcb, path: &str) -> alloc::string::String {
    if path.starts_with('/') {
        alloc::string::String::from(path)
    } else {
        let cwd = pcb.cwd.lock().clone();
        if cwd == "/" {
            alloc::format!("/{}", path)
        } else {
            alloc::format!("{}/{}", cwd, path)
        }
    }
}

fn sys_exit(status: i32) -> i32 {
    process::exit_current_process(status);
}

fn sys_fork(frame: &TrapFrame) -> i32 {
    match process::current_pcb() {
        Some(pcb) => match process::fork_process(pcb.pid, frame) {
            Ok(child) => child as i32,
            Err(e) => errno(e),
        },
        None => errno(FsError::NotFound),
    }
}

fn sys_read(fd: u32, ubuf: u32, count: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let handle = match pcb.fd_table.lock().get(fd as usize) {
        Ok(h) => h,
        Err(e) => return errno(e),
    };

    let mut kbuf = vec![0u8; count as usize];
    let n = {
        let mut file = handle.lock();
        if !file.readable {
            return errno(FsError::BadFd);
        }
        let n = match &file.kind {
            FileKind::Console => crate::drivers::console::read_line_blocking(&mut kbuf),
            FileKind::Regular { path } => {
                let vfs = VFS.lock();
                match vfs.read_file(path, file.offset, &mut kbuf) {
                    Ok(n) => n,
                    Err(e) => return errno(e),
                }
            }
            FileKind::Directory { .. } => return errno(FsError::IsADirectory),
            FileKind::PipeRead(inner) => crate::fs::pipe::read_blocking(inner, &mut kbuf),
            FileKind::PipeWrite(_) => return errno(FsError::BadFd),
        };
        file.offset += n;
        n
    };

    match pcb.with_mm(|mm| uaccess::copy_to_user(mm, ubuf, &kbuf[..n])) {
        0 => n as i32,
        _ => errno(FsError::Fault),
    }
}

fn sys_write(fd: u32, ubuf: u32, count: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let handle = match pcb.fd_table.lock().get(fd as usize) {
        Ok(h) => h,
        Err(e) => return errno(e),
    };

    let mut kbuf = vec![0u8; count as usize];
    if pcb.with_mm(|mm| uaccess::copy_from_user(mm, &mut kbuf, ubuf)) != 0 {
        return errno(FsError::Fault);
    }

    let mut file = handle.lock();
    if !file.writable {
        return errno(FsError::BadFd);
    }
    let n = match &file.kind {
        FileKind::Console => crate::drivers::console::write_bytes(&kbuf),
        FileKind::Regular { path } => {
            let mut vfs = VFS.lock();
            match vfs.write_file(path, &kbuf) {
                Ok(n) => n,
                Err(e) => return errno(e),
            }
        }
        FileKind::Directory { .. } => return errno(FsError::IsADirectory),
        FileKind::PipeWrite(inner) => inner.lock().write(&kbuf),
        FileKind::PipeRead(_) => return errno(FsError::BadFd),
    };
    file.offset += n;
    n as i32
}

fn sys_open(upath: u32, flags: u32, _mode: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let path = match read_path(upath) {
        Ok(p) => resolve(&pcb, &p),
        Err(e) => return errno(e),
    };

    let mut vfs = VFS.lock();
    let exists = vfs.exists(&path);
    if !exists {
        if flags & O_CREAT == 0 {
            return errno(FsError::NotFound);
        }
        if vfs.create(&path).is_err() {
            return errno(FsError::Invalid);
        }
    }
    if flags & O_TRUNC != 0 {
        let _ = vfs.write_file(&path, &[]);
    }
    let is_dir = vfs.is_dir(&path);
    drop(vfs);

    let readable = flags & O_WRONLY == 0;
    let writable = flags & (O_WRONLY | O_RDWR) != 0;

    let handle = if is_dir {
        Arc::new(IrqSpinLock::new(OpenFile {
            kind: FileKind::Directory { path: path.clone() },
            offset: 0,
            readable: true,
            writable: false,
        }))
    } else {
        let handle = new_regular(&path, readable, writable);
        if flags & O_APPEND != 0 {
            if let Ok(inode) = VFS.lock().lookup(&path) {
                handle.lock().offset = inode.size;
            }
        }
        handle
    };

    match pcb.fd_table.lock().install(handle) {
        Ok(fd) => fd as i32,
        Err(e) => errno(e),
    }
}

fn sys_close(fd: u32) -> i32 {
    match process::current_pcb() {
        Some(pcb) => match pcb.fd_table.lock().close(fd as usize) {
            Ok(()) => 0,
            Err(e) => errno(e),
        },
        None => errno(FsError::NotFound),
    }
}

fn sys_waitpid(pid: i32, ustatus: u32, _options: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let mut status = 0i32;
    match process::waitpid(pcb.pid, pid, &mut status) {
        Ok(reaped) => {
            if ustatus != 0 && pcb.with_mm(|mm| uaccess::copy_to_user(mm, ustatus, &status.to_le_bytes())) != 0 {
                return errno(FsError::Fault);
            }
            reaped as i32
        }
        Err(e) => errno(e),
    }
}

fn sys_unlink(upath: u32) -> i32 {
    match process::current_pcb() {
        Some(pcb) => match read_path(upath) {
            Ok(p) => match VFS.lock().unlink(&resolve(&pcb, &p)) {
                Ok(()) => 0,
                Err(e) => errno(e),
            },
            Err(e) => errno(e),
        },
        None => errno(FsError::NotFound),
    }
}

fn sys_execve(upath: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let path = match read_path(upath) {
        Ok(p) => resolve(&pcb, &p),
        Err(e) => return errno(e),
    };
    match process::execve_process(pcb.pid, &path) {
        Ok(()) => unreachable!("execve_process only returns on failure"),
        Err(e) => errno(e),
    }
}

fn sys_chdir(upath: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let path = match read_path(upath) {
        Ok(p) => resolve(&pcb, &p),
        Err(e) => return errno(e),
    };
    if !VFS.lock().is_dir(&path) {
        return errno(FsError::NotADirectory);
    }
    *pcb.cwd.lock() = path;
    0
}

fn sys_lseek(fd: u32, offset: i32, whence: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let handle = match pcb.fd_table.lock().get(fd as usize) {
        Ok(h) => h,
        Err(e) => return errno(e),
    };

    let mut file = handle.lock();
    let path = match &file.kind {
        FileKind::Regular { path } => path.clone(),
        _ => return errno(FsError::Invalid),
    };
    let size = match VFS.lock().lookup(&path) {
        Ok(inode) => inode.size as i32,
        Err(e) => return errno(e),
    };

    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => file.offset as i32,
        SEEK_END => size,
        _ => return errno(FsError::Invalid),
    };
    let new_offset = base + offset;
    if new_offset < 0 {
        return errno(FsError::Invalid);
    }
    file.offset = new_offset as usize;
    new_offset
}

fn sys_getpid() -> i32 {
    match process::current_pcb() {
        Some(pcb) => pcb.pid as i32,
        None => errno(FsError::NotFound),
    }
}

fn sys_kill(pid: Pid, signum: u32) -> i32 {
    match process::lookup(pid) {
        Some(pcb) => {
            pcb.signal.lock().raise(signum);
            // §4.10: "If the target is SLEEPING, a wake-up request is
            // raised." `unblock` also covers a target parked in `read`
            // (BLOCKED) or stopped by a prior SIGSTOP (SIGCONT's case).
            crate::scheduler::unblock(pid);
            0
        }
        None => errno(FsError::NotFound),
    }
}

fn sys_mkdir(upath: u32) -> i32 {
    match process::current_pcb() {
        Some(pcb) => match read_path(upath) {
            Ok(p) => match VFS.lock().mkdir(&resolve(&pcb, &p)) {
                Ok(_) => 0,
                Err(e) => errno(e),
            },
            Err(e) => errno(e),
        },
        None => errno(FsError::NotFound),
    }
}

fn sys_rmdir(upath: u32) -> i32 {
    match process::current_pcb() {
        Some(pcb) => match read_path(upath) {
            Ok(p) => {
                let full = resolve(&pcb, &p);
                if !VFS.lock().is_dir(&full) {
                    return errno(FsError::NotADirectory);
                }
                match VFS.lock().unlink(&full) {
                    Ok(()) => 0,
                    Err(e) => errno(e),
                }
            }
            Err(e) => errno(e),
        },
        None => errno(FsError::NotFound),
    }
}

fn sys_pipe(ufds: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let inner = crate::fs::pipe::PipeInner::new();
    inner.lock().add_reader();
    inner.lock().add_writer();

    let read_handle = Arc::new(IrqSpinLock::new(OpenFile {
        kind: FileKind::PipeRead(inner.clone()),
        offset: 0,
        readable: true,
        writable: false,
    }));
    let write_handle = Arc::new(IrqSpinLock::new(OpenFile {
        kind: FileKind::PipeWrite(inner),
        offset: 0,
        readable: false,
        writable: true,
    }));

    let mut table = pcb.fd_table.lock();
    let read_fd = match table.install(read_handle) {
        Ok(fd) => fd,
        Err(e) => return errno(e),
    };
    let write_fd = match table.install(write_handle) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = table.close(read_fd);
            return errno(e);
        }
    };
    drop(table);

    let fds = [read_fd as u32, write_fd as u32];
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&fds[0].to_le_bytes());
    bytes[4..8].copy_from_slice(&fds[1].to_le_bytes());
    match pcb.with_mm(|mm| uaccess::copy_to_user(mm, ufds, &bytes)) {
        0 => 0,
        _ => errno(FsError::Fault),
    }
}

fn sys_brk(addr: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    pcb.with_mm(|mm| {
        if addr == 0 {
            return mm.end_brk as i32;
        }
        if addr < mm.start_brk {
            return errno(FsError::Invalid);
        }
        let old_end = mm.end_brk;
        if addr > old_end {
            let flags = VmFlags::VM_READ | VmFlags::VM_WRITE | VmFlags::VM_USER;
            if mm.insert_vma(old_end, addr, flags).is_err() {
                return errno(FsError::NoMem);
            }
        }
        mm.end_brk = addr;
        addr as i32
    })
}

fn sys_signal(signum: u32, uhandler: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let action = if uhandler == 0 {
        SigAction::Default
    } else if uhandler == 1 {
        SigAction::Ignore
    } else {
        SigAction::Handler(uhandler)
    };
    match pcb.signal.lock().set_action(signum, action) {
        Ok(()) => 0,
        Err(()) => errno(FsError::Invalid),
    }
}

fn sys_setpgid(pid: Pid, pgid: Pid) -> i32 {
    let target = if pid == 0 { process::current_pcb().map(|p| p.pid) } else { Some(pid) };
    match target.and_then(process::lookup) {
        Some(pcb) => {
            *pcb.pgid.lock() = if pgid == 0 { pcb.pid } else { pgid };
            0
        }
        None => errno(FsError::NotFound),
    }
}

fn sys_dup2(old_fd: u32, new_fd: u32) -> i32 {
    match process::current_pcb() {
        Some(pcb) => match pcb.fd_table.lock().dup2(old_fd as usize, new_fd as usize) {
            Ok(fd) => fd as i32,
            Err(e) => errno(e),
        },
        None => errno(FsError::NotFound),
    }
}

fn sys_getppid() -> i32 {
    match process::current_pcb() {
        Some(pcb) => *pcb.parent.lock() as i32,
        None => errno(FsError::NotFound),
    }
}

fn sys_setsid() -> i32 {
    match process::current_pcb() {
        Some(pcb) => {
            *pcb.sid.lock() = pcb.pid;
            *pcb.pgid.lock() = pcb.pid;
            pcb.pid as i32
        }
        None => errno(FsError::NotFound),
    }
}

fn sys_mmap(addr: u32, len: u32, prot: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    pcb.with_mm(|mm| {
        let start = if addr != 0 { addr } else { mm.end_brk.max(0x4000_0000) };
        let mut vm_flags = VmFlags::VM_USER | VmFlags::VM_ANON;
        if prot & 0x1 != 0 {
            vm_flags |= VmFlags::VM_READ;
        }
        if prot & 0x2 != 0 {
            vm_flags |= VmFlags::VM_WRITE;
        }
        if prot & 0x4 != 0 {
            vm_flags |= VmFlags::VM_EXEC;
        }
        match mm.insert_vma(start, start + len, vm_flags) {
            Ok(()) => start as i32,
            Err(_) => errno(FsError::NoMem),
        }
    })
}

fn sys_stat(upath: u32, ustat: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let path = match read_path(upath) {
        Ok(p) => resolve(&pcb, &p),
        Err(e) => return errno(e),
    };
    let inode = match VFS.lock().lookup(&path) {
        Ok(i) => i,
        Err(e) => return errno(e),
    };

    let mode: u32 = if inode.file_type == crate::fs::inode::FileType::Directory { 0o040000 } else { 0o100000 };
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&(inode.id as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&mode.to_le_bytes());
    buf[8..12].copy_from_slice(&(inode.size as u32).to_le_bytes());

    match pcb.with_mm(|mm| uaccess::copy_to_user(mm, ustat, &buf)) {
        0 => 0,
        _ => errno(FsError::Fault),
    }
}

fn sys_sigreturn(frame: &mut TrapFrame) -> i32 {
    match process::current_pcb() {
        Some(pcb) => match pcb.signal.lock().sigreturn(frame) {
            Ok(()) => frame.eax as i32,
            Err(()) => errno(FsError::Invalid),
        },
        None => errno(FsError::NotFound),
    }
}

/// Fixed-size directory-entry records: a `u32` inode number followed by a
/// 60-byte name field (NUL-padded, truncated past 59 bytes). Simpler than
/// Linux's variable-length `linux_dirent`, since there is exactly one
/// consumer of this layout (the userland C library shipped alongside this
/// kernel).
fn sys_getdents(fd: u32, ubuf: u32, len: u32) -> i32 {
    const REC_SIZE: usize = 64;

    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let handle = match pcb.fd_table.lock().get(fd as usize) {
        Ok(h) => h,
        Err(e) => return errno(e),
    };
    let file = handle.lock();
    let path = match &file.kind {
        FileKind::Directory { path } => path.clone(),
        _ => return errno(FsError::NotADirectory),
    };
    drop(file);

    let entries = match VFS.lock().readdir(&path) {
        Ok(e) => e,
        Err(e) => return errno(e),
    };

    let max_entries = (len as usize) / REC_SIZE;
    let mut written = 0usize;
    let mut kbuf = vec![0u8; max_entries * REC_SIZE];

    for (i, entry) in entries.iter().take(max_entries).enumerate() {
        let name_bytes = entry.name.as_bytes();
        let copy_len = name_bytes.len().min(59);
        let rec = &mut kbuf[i * REC_SIZE..(i + 1) * REC_SIZE];
        rec[0..4].copy_from_slice(&(entry.inode.id as u32).to_le_bytes());
        rec[4..4 + copy_len].copy_from_slice(&name_bytes[..copy_len]);
        written += REC_SIZE;
    }

    match pcb.with_mm(|mm| uaccess::copy_to_user(mm, ubuf, &kbuf[..written])) {
        0 => written as i32,
        _ => errno(FsError::Fault),
    }
}

fn sys_getcwd(ubuf: u32, size: u32) -> i32 {
    let pcb = match process::current_pcb() {
        Some(p) => p,
        None => return errno(FsError::NotFound),
    };
    let cwd = pcb.cwd.lock().clone();
    if cwd.len() as u32 + 1 > size {
        return errno(FsError::Range);
    }
    let mut bytes = vec![0u8; cwd.len() + 1];
    bytes[..cwd.len()].copy_from_slice(cwd.as_bytes());

    match pcb.with_mm(|mm| uaccess::copy_to_user(mm, ubuf, &bytes)) {
        0 => cwd.len() as i32,
        _ => errno(FsError::Fault),
    }
}
