//! Per-process file-descriptor table (§3): 16 fixed slots, each either empty
//! or referencing an open-file handle shared across `dup`/`fork` (shared
//! handle, independent slot per §4.8/§5).

use alloc::string::String;
use alloc::sync::Arc;

use crate::fs::error::{FsError, FsResult};
use crate::fs::pipe::PipeInner;
use crate::sync::IrqSpinLock;

pub const NUM_FDS: usize = 16;

pub enum FileKind {
    Console,
    Regular { path: String },
    Directory { path: String },
    PipeRead(Arc<IrqSpinLock<PipeInner>>),
    PipeWrite(Arc<IrqSpinLock<PipeInner>>),
}

/// One open-file description. Shared (by `Arc`) across every fd slot that
/// refers to it — `dup`/`dup2`/fork all clone the `Arc`, never the state.
pub struct OpenFile {
    pub kind: FileKind,
    pub offset: usize,
    pub readable: bool,
    pub writable: bool,
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        match &self.kind {
            FileKind::PipeRead(inner) => inner.lock().drop_reader(),
            FileKind::PipeWrite(inner) => inner.lock().drop_writer(),
            _ => {}
        }
    }
}

pub type FileHandle = Arc<IrqSpinLock<OpenFile>>;

pub fn new_console() -> FileHandle {
    Arc::new(IrqSpinLock::new(OpenFile { kind: FileKind::Console, offset: 0, readable: true, writable: true }))
}

pub fn new_regular(path: &str, readable: bool, writable: bool) -> FileHandle {
    Arc::new(IrqSpinLock::new(OpenFile { kind: FileKind::Regular { path: String::from(path) }, offset: 0, readable, writable }))
}

pub struct FdTable {
    slots: [Option<FileHandle>; NUM_FDS],
}

impl FdTable {
    pub fn empty() -> Self {
        FdTable { slots: [None, None, None, None, None, None, None, None, None, None, None, None, None, None, None, None] }
    }

    /// fd 0/1/2 bound to the console, per §6: "fd 0/1/2 point to this device
    /// at process creation."
    pub fn new_with_console() -> Self {
        let mut table = Self::empty();
        table.slots[0] = Some(new_console());
        table.slots[1] = Some(new_console());
        table.slots[2] = Some(new_console());
        table
    }

    pub fn get(&self, fd: usize) -> FsResult<FileHandle> {
        if fd >= NUM_FDS {
            return Err(FsError::BadFd);
        }
        self.slots[fd].clone().ok_or(FsError::BadFd)
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Install `file` at the lowest free slot, Linux `open`/`pipe` semantics.
    pub fn install(&mut self, file: FileHandle) -> FsResult<usize> {
        let fd = self.first_free().ok_or(FsError::NoMem)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    pub fn install_at(&mut self, fd: usize, file: FileHandle) -> FsResult<()> {
        if fd >= NUM_FDS {
            return Err(FsError::BadFd);
        }
        self.slots[fd] = Some(file);
        Ok(())
    }

    pub fn close(&mut self, fd: usize) -> FsResult<()> {
        if fd >= NUM_FDS {
            return Err(FsError::BadFd);
        }
        self.slots[fd] = None;
        Ok(())
    }

    pub fn dup(&mut self, old_fd: usize) -> FsResult<usize> {
        let handle = self.get(old_fd)?;
        self.install(handle)
    }

    pub fn dup2(&mut self, old_fd: usize, new_fd: usize) -> FsResult<usize> {
        if old_fd >= NUM_FDS || new_fd >= NUM_FDS {
            return Err(FsError::BadFd);
        }
        if old_fd == new_fd {
            return Ok(new_fd);
        }
        let handle = self.get(old_fd)?;
        self.slots[new_fd] = Some(handle);
        Ok(new_fd)
    }

    /// Deep-copy every slot's `Arc` for fork: new slots, same underlying
    /// open-file descriptions (§4.8).
    pub fn fork_clone(&self) -> Self {
        FdTable { slots: self.slots.clone() }
    }
}
